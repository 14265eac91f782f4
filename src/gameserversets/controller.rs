/*
 * Copyright 2026 Google LLC All Rights Reserved.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::{sync::Arc, time::Duration};

use eyre::WrapErr;
use kube::core::{
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
    response::{Status, StatusDetails, StatusSummary},
    Resource,
};

use crate::{
    admin::Health,
    api::{self, GameServer, GameServerSet, GameServerSetStatus, GameServerState, Key,
        SchedulingStrategy},
    client::Clientset,
    informer::{CacheEvent, CacheView, Informer},
    metrics,
    signal::ShutdownRx,
    webhook::WebHook,
    workerqueue::WorkerQueue,
};

use super::{
    filter_on_least_full_nodes, generate_gameservers, list_gameservers_by_owner, parallelize,
};

const MAX_CREATION_PARALLELISM: usize = 8;
const MAX_CREATIONS_PER_BATCH: usize = 16;

const MAX_DELETION_PARALLELISM: usize = 8;
const MAX_DELETIONS_PER_BATCH: usize = 16;

/// The GameServerSet controller: drives the population of owned members
/// toward each set's declared replica count.
pub struct Controller<C: Clientset> {
    clientset: C,
    gameservers: CacheView<GameServer>,
    gameserversets: CacheView<GameServerSet>,
    workerqueue: WorkerQueue<Key>,
    allocation_mutex: Arc<tokio::sync::Mutex<()>>,
    resync: Duration,
    shutdown: ShutdownRx,
}

impl<C: Clientset> Controller<C> {
    /// Builds the controller, registering its event handlers on the two
    /// informers, its liveness check, and its admission handler.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        webhook: &mut WebHook,
        health: &Health,
        allocation_mutex: Arc<tokio::sync::Mutex<()>>,
        clientset: C,
        gameservers: &mut Informer<GameServer>,
        gameserversets: &mut Informer<GameServerSet>,
        resync: Duration,
        shutdown: ShutdownRx,
    ) -> Arc<Self> {
        let controller = Arc::new(Self {
            clientset,
            gameservers: gameservers.view(),
            gameserversets: gameserversets.view(),
            workerqueue: WorkerQueue::new("agon.dev.GameServerSetController"),
            allocation_mutex,
            resync,
            shutdown,
        });

        health.add_liveness_check("gameserverset-workerqueue", {
            let queue = controller.workerqueue.clone();
            move || queue.healthy()
        });

        webhook.add_handler("/validate", update_validation_handler);

        gameserversets.add_event_handler({
            let controller = controller.clone();
            move |event| controller.gameserverset_event(event)
        });

        gameservers.add_event_handler({
            let controller = controller.clone();
            move |event| controller.gameserver_event(event)
        });

        controller
    }

    /// Runs the controller until shutdown: waits for the caches to sync,
    /// starts the periodic resync tick, then blocks in the worker pool.
    pub async fn run(self: Arc<Self>, workers: usize) -> crate::Result<()> {
        let mut shutdown = self.shutdown.clone();

        tracing::info!("waiting for cache sync");
        if !self.gameservers.wait_for_sync(&mut shutdown).await
            || !self.gameserversets.wait_for_sync(&mut shutdown).await
        {
            eyre::bail!("failed to wait for caches to sync");
        }

        tokio::spawn({
            let controller = self.clone();
            let mut shutdown = self.shutdown.clone();
            async move {
                let mut tick = tokio::time::interval(controller.resync);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            for gss in controller.gameserversets.state() {
                                controller.enqueue_gameserverset(&gss, false);
                            }
                        }
                        _ = shutdown.changed() => return,
                    }
                }
            }
        });

        let controller = self.clone();
        self.workerqueue
            .run(workers, self.shutdown.clone(), move |key| {
                let controller = controller.clone();
                async move { controller.sync(key).await }
            })
            .await;

        Ok(())
    }

    fn enqueue_gameserverset(&self, gss: &GameServerSet, immediately: bool) {
        metrics::enqueues_total(gss.fleet_name()).inc();
        let key = Key::from_meta(&gss.metadata);
        if immediately {
            self.workerqueue.enqueue_immediately(key);
        } else {
            self.workerqueue.enqueue(key);
        }
    }

    fn gameserverset_event(&self, event: &CacheEvent<GameServerSet>) {
        match event {
            CacheEvent::Added(gss) | CacheEvent::Deleted(gss) => {
                self.enqueue_gameserverset(gss, false);
            }
            CacheEvent::Updated { old, new } => {
                // a replica change is the one update worth reacting to
                // without waiting out the rate limiter
                let immediately = old.spec.replicas != new.spec.replicas;
                self.enqueue_gameserverset(new, immediately);
            }
        }
    }

    fn gameserver_event(&self, event: &CacheEvent<GameServer>) {
        let gs = match event {
            CacheEvent::Added(gs) | CacheEvent::Deleted(gs) => gs,
            CacheEvent::Updated { new, .. } => {
                // the transition into deletion is not actionable here
                if new.is_being_deleted() {
                    return;
                }
                new
            }
        };

        let Some(owner) = api::controller_of(&gs.metadata) else {
            return;
        };
        if owner.kind != GameServerSet::kind(&()) {
            return;
        }

        let key = Key::new(gs.namespace(), &owner.name);
        let Some(gss) = self.gameserversets.get(&key) else {
            tracing::info!(gameserver = gs.name(), owner = %key,
                "owner gameserverset is no longer available for syncing");
            return;
        };

        self.enqueue_gameserverset(&gss, true);
    }

    /// One reconciliation pass for `key`, timed into the sync histogram.
    pub async fn sync(&self, key: Key) -> crate::Result<()> {
        let start = std::time::Instant::now();
        let result = self.sync_gameserverset(&key).await;

        let outcome = match &result {
            Ok(true) => "ok",
            Ok(false) => "skipped",
            Err(_) => "error",
        };
        metrics::sync_duration_millis(outcome).observe(start.elapsed().as_secs_f64() * 1000.0);

        result.map(|_| ())
    }

    async fn sync_gameserverset(&self, key: &Key) -> crate::Result<bool> {
        tracing::debug!(%key, "syncing gameserverset");

        let Some(gss) = self.gameserversets.get(key) else {
            tracing::debug!(%key, "gameserverset is no longer available for syncing");
            return Ok(false);
        };
        metrics::dequeues_total(gss.fleet_name()).inc();

        let list = list_gameservers_by_owner(&self.gameservers, &gss);

        self.sync_unhealthy_gameservers(&gss, &list).await?;

        let diff = gss.spec.replicas - list.len() as i32;
        tracing::debug!(%key, diff, members = list.len(), "reconciling member count");

        self.sync_more_gameservers(&gss, diff).await?;
        self.remove_excessive_gameservers(&gss, diff).await?;
        self.sync_gameserverset_state(&gss, &list).await?;

        Ok(true)
    }

    /// Deletes unhealthy members that are not already being deleted. Each
    /// delete holds the allocation mutex for the duration of the request.
    async fn sync_unhealthy_gameservers(
        &self,
        gss: &GameServerSet,
        list: &[Arc<GameServer>],
    ) -> crate::Result<()> {
        for gs in list {
            if !gs.is_unhealthy() || gs.is_being_deleted() {
                continue;
            }

            let result = {
                let _allocation = self.allocation_mutex.lock().await;
                self.clientset
                    .delete_gameserver(gs.namespace(), gs.name())
                    .await
            };

            match result {
                Ok(()) => self.clientset.record_event(
                    gss,
                    "UnhealthyDelete",
                    format!("Deleted gameserver: {}", gs.name()),
                ),
                // already gone
                Err(error) if error.is_not_found() => {}
                Err(error) => {
                    return Err(error)
                        .wrap_err_with(|| format!("error deleting gameserver {}", gs.name()));
                }
            }
        }

        Ok(())
    }

    /// Creates `diff` more members, bounded to one batch per pass.
    async fn sync_more_gameservers(&self, gss: &GameServerSet, diff: i32) -> crate::Result<()> {
        if diff <= 0 {
            return Ok(());
        }
        tracing::debug!(gameserverset = gss.name(), diff, "adding more gameservers");

        let mut batch_size = diff as usize;
        let mut have_more_items = false;
        if batch_size > MAX_CREATIONS_PER_BATCH {
            batch_size = MAX_CREATIONS_PER_BATCH;
            have_more_items = true;
        }

        let clientset = self.clientset.clone();
        let gss_ref = Arc::new(gss.clone());
        parallelize(
            generate_gameservers(batch_size, gss),
            MAX_CREATION_PARALLELISM,
            move |gs: GameServer| {
                let clientset = clientset.clone();
                let gss = gss_ref.clone();
                async move {
                    let created = clientset.create_gameserver(gs).await.wrap_err_with(|| {
                        format!("error creating gameserver for gameserverset {}", gss.name())
                    })?;
                    clientset.record_event(
                        &gss,
                        "SuccessfulCreate",
                        format!("Created gameserver: {}", created.name()),
                    );
                    Ok(())
                }
            },
        )
        .await?;

        if have_more_items {
            self.workerqueue
                .enqueue_immediately(Key::from_meta(&gss.metadata));
        }
        Ok(())
    }

    /// Deletes `-diff` surplus members, bounded to one batch per pass. The
    /// allocation mutex is held for the whole phase so the victim set
    /// cannot include a member that is being allocated concurrently.
    async fn remove_excessive_gameservers(
        &self,
        gss: &GameServerSet,
        diff: i32,
    ) -> crate::Result<()> {
        if diff >= 0 {
            return Ok(());
        }
        // easier to manage positive numbers
        let diff = -diff;
        tracing::debug!(gameserverset = gss.name(), diff, "deleting gameservers");

        let _allocation = self.allocation_mutex.lock().await;

        // make sure we are up to date with gameserver state
        let mut shutdown = self.shutdown.clone();
        if !self.gameservers.wait_for_sync(&mut shutdown).await {
            // exit and retry the scale down later rather than blocking
            // allocation any longer
            eyre::bail!("could not sync gameservers cache");
        }

        let mut list = list_gameservers_by_owner(&self.gameservers, gss);

        if gss.spec.scheduling == SchedulingStrategy::Packed {
            list = filter_on_least_full_nodes(&list, diff);
        }

        let batch_size = (diff as usize).min(MAX_DELETIONS_PER_BATCH);
        let mut have_more_items = false;
        let mut victims = Vec::with_capacity(batch_size);
        for gs in &list {
            if gs.is_allocated() || gs.is_being_deleted() {
                continue;
            }
            if victims.len() == batch_size {
                // no more room in this batch; re-enqueue below picks up
                // the remainder
                have_more_items = true;
                break;
            }
            victims.push(gs.clone());
        }

        let (tx, rx) = async_channel::bounded(victims.len().max(1));
        for gs in victims {
            let _ = tx.try_send(gs);
        }
        drop(tx);

        let clientset = self.clientset.clone();
        let gss_ref = Arc::new(gss.clone());
        parallelize(rx, MAX_DELETION_PARALLELISM, move |gs: Arc<GameServer>| {
            let clientset = clientset.clone();
            let gss = gss_ref.clone();
            async move {
                match clientset.delete_gameserver(gs.namespace(), gs.name()).await {
                    Ok(()) => {
                        clientset.record_event(
                            &gss,
                            "SuccessfulDelete",
                            format!("Deleted gameserver: {}", gs.name()),
                        );
                        Ok(())
                    }
                    // already gone
                    Err(error) if error.is_not_found() => Ok(()),
                    Err(error) => Err(error).wrap_err_with(|| {
                        format!("error deleting gameserver for gameserverset {}", gss.name())
                    }),
                }
            }
        })
        .await?;

        if have_more_items {
            self.workerqueue
                .enqueue_immediately(Key::from_meta(&gss.metadata));
        }
        Ok(())
    }

    /// Publishes observed member counts back onto the set's status, writing
    /// only when the triple changed.
    async fn sync_gameserverset_state(
        &self,
        gss: &GameServerSet,
        list: &[Arc<GameServer>],
    ) -> crate::Result<()> {
        let mut ready = 0;
        let mut allocated = 0;
        for gs in list {
            if gs.is_being_deleted() {
                continue;
            }
            match gs.state() {
                GameServerState::Ready => ready += 1,
                GameServerState::Allocated => allocated += 1,
                _ => {}
            }
        }

        let status = GameServerSetStatus {
            replicas: list.len() as i32,
            ready_replicas: ready,
            allocated_replicas: allocated,
        };
        if gss.status == Some(status) {
            return Ok(());
        }

        let mut updated = gss.clone();
        updated.status = Some(status);
        self.clientset
            .update_gameserverset(updated)
            .await
            .wrap_err_with(|| format!("error updating status on gameserverset {}", gss.name()))?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn workerqueue(&self) -> &WorkerQueue<Key> {
        &self.workerqueue
    }
}

/// Validates a proposed GameServerSet update from an admission review.
/// Should only be wired to update operations.
pub(crate) fn update_validation_handler(
    review: serde_json::Value,
) -> crate::Result<serde_json::Value> {
    let review: AdmissionReview<GameServerSet> =
        serde_json::from_value(review).wrap_err("error deserializing admission review")?;
    let request: AdmissionRequest<GameServerSet> = review
        .try_into()
        .map_err(|_| eyre::eyre!("admission review contained no request"))?;

    if !matches!(request.operation, Operation::Update) {
        eyre::bail!("unexpected admission operation {:?}", request.operation);
    }

    let mut response = AdmissionResponse::from(&request);

    let (Some(old), Some(new)) = (&request.old_object, &request.object) else {
        eyre::bail!("admission review is missing the update objects");
    };

    let causes = old.validate_update(new);
    if !causes.is_empty() {
        tracing::info!(gameserverset = %request.name, ?causes, "denying invalid update");
        response.allowed = false;
        response.result = Status {
            status: Some(StatusSummary::Failure),
            message: "GameServerSet update is invalid".into(),
            reason: "Invalid".into(),
            code: 422,
            details: Some(StatusDetails {
                name: request.name.clone(),
                group: api::GROUP.into(),
                kind: GameServerSet::kind(&()).into_owned(),
                causes,
                uid: String::new(),
                retry_after_seconds: 0,
            }),
        };
    }

    serde_json::to_value(response.into_review()).wrap_err("error serializing admission response")
}
