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

//! Reconciliation of [`GameServerSet`]s: keeping the population of owned
//! [`GameServer`]s at the declared replica count.

pub mod controller;

use std::{collections::BTreeMap, future::Future, sync::Arc};

use crate::{
    api::{GameServer, GameServerSet},
    informer::CacheView,
};

pub use controller::Controller;

/// Lists the cached members whose controlling owner reference designates
/// `gss`, sorted by name for deterministic iteration.
pub(crate) fn list_gameservers_by_owner(
    cache: &CacheView<GameServer>,
    gss: &GameServerSet,
) -> Vec<Arc<GameServer>> {
    let mut list: Vec<_> = cache
        .state()
        .into_iter()
        .filter(|gs| gs.namespace() == gss.namespace() && gss.is_controller_of(gs))
        .collect();
    list.sort_by(|a, b| a.name().cmp(b.name()));
    list
}

/// Orders scale-down candidates so that members on the least-full nodes
/// come first, preserving fuller nodes for longer to aid bin packing.
/// Groups of equal size tie-break on node name. Emits up to `count`
/// members.
pub(crate) fn filter_on_least_full_nodes(
    list: &[Arc<GameServer>],
    count: i32,
) -> Vec<Arc<GameServer>> {
    if count <= 0 {
        return Vec::new();
    }

    let mut nodes: BTreeMap<&str, Vec<&Arc<GameServer>>> = BTreeMap::new();
    for gs in list {
        nodes.entry(gs.node_name()).or_default().push(gs);
    }

    // stable sort keeps the BTreeMap's node-name order for equal sizes
    let mut groups: Vec<_> = nodes.into_iter().collect();
    groups.sort_by_key(|(_, members)| members.len());

    groups
        .into_iter()
        .flat_map(|(_, members)| members)
        .take(count as usize)
        .cloned()
        .collect()
}

/// Produces `count` fresh members materialized from the set's template, as
/// a lazy source for [`parallelize`]. The producer closes the channel when
/// done or when every consumer has gone.
pub(crate) fn generate_gameservers(
    count: usize,
    gss: &GameServerSet,
) -> async_channel::Receiver<GameServer> {
    let (tx, rx) = async_channel::bounded(count.max(1));
    let gss = gss.clone();
    tokio::spawn(async move {
        for _ in 0..count {
            if tx.send(gss.gameserver()).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// Drains `source` with `parallelism` concurrent workers, applying `work`
/// per item. A worker stops at its first error; the call returns some
/// error if any occurred, not necessarily the first. Residual items are
/// drained after the workers join so the producer always terminates; the
/// channel is never closed from this side.
pub(crate) async fn parallelize<T, F, Fut>(
    source: async_channel::Receiver<T>,
    parallelism: usize,
    work: F,
) -> crate::Result<()>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = crate::Result<()>> + Send + 'static,
{
    let (errtx, errrx) = async_channel::bounded(parallelism.max(1));

    let mut workers = tokio::task::JoinSet::new();
    for _ in 0..parallelism {
        let source = source.clone();
        let work = work.clone();
        let errtx = errtx.clone();
        workers.spawn(async move {
            while let Ok(item) = source.recv().await {
                if let Err(error) = work(item).await {
                    let _ = errtx.try_send(error);
                    break;
                }
            }
        });
    }
    drop(errtx);
    while workers.join_next().await.is_some() {}

    // drain whatever the workers left behind, in case they bailed early
    while source.recv().await.is_ok() {}

    match errrx.try_recv() {
        Ok(error) => Err(error),
        Err(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::GameServerState,
        test_utils::{gameserver, gameserverset, on_node, synced_cache},
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn list_by_owner_ignores_orphans_and_other_namespaces() {
        let gss = gameserverset("default", "simple-set", 3);
        let other = gameserverset("default", "other-set", 1);
        let mut foreign = gameserver(&gss, "foreign", GameServerState::Ready);
        foreign.metadata.namespace = Some("elsewhere".into());

        let cache = synced_cache(vec![
            gameserver(&gss, "simple-set-b", GameServerState::Ready),
            gameserver(&gss, "simple-set-a", GameServerState::Ready),
            gameserver(&other, "other-set-a", GameServerState::Ready),
            foreign,
        ]);

        let list = list_gameservers_by_owner(&cache, &gss);
        let names: Vec<_> = list.iter().map(|gs| gs.name().to_owned()).collect();
        assert_eq!(names, vec!["simple-set-a", "simple-set-b"]);
    }

    #[test]
    fn least_full_nodes_come_first() {
        let gss = gameserverset("default", "simple-set", 4);
        let list = vec![
            Arc::new(on_node(gameserver(&gss, "a1", GameServerState::Ready), "node-a")),
            Arc::new(on_node(gameserver(&gss, "a2", GameServerState::Ready), "node-a")),
            Arc::new(on_node(gameserver(&gss, "c1", GameServerState::Ready), "node-c")),
            Arc::new(on_node(gameserver(&gss, "b1", GameServerState::Ready), "node-b")),
        ];

        let victims = filter_on_least_full_nodes(&list, 2);
        let names: Vec<_> = victims.iter().map(|gs| gs.name().to_owned()).collect();
        // node-b and node-c hold one member each and tie-break on name
        assert_eq!(names, vec!["b1", "c1"]);

        assert!(filter_on_least_full_nodes(&list, 0).is_empty());
        assert_eq!(filter_on_least_full_nodes(&list, 10).len(), 4);
    }

    #[tokio::test]
    async fn generate_produces_the_requested_count() {
        let gss = gameserverset("default", "simple-set", 3);
        let rx = generate_gameservers(3, &gss);

        let mut produced = Vec::new();
        while let Ok(gs) = rx.recv().await {
            produced.push(gs);
        }

        assert_eq!(produced.len(), 3);
        assert!(produced
            .iter()
            .all(|gs| gs.metadata.generate_name.as_deref() == Some("simple-set-")));
    }

    #[tokio::test]
    async fn parallelize_processes_every_item() {
        let (tx, rx) = async_channel::bounded(8);
        for n in 0..8 {
            tx.try_send(n).unwrap();
        }
        drop(tx);

        let counter = Arc::new(AtomicUsize::new(0));
        let result = parallelize(rx, 3, {
            let counter = counter.clone();
            move |_n: i32| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn parallelize_surfaces_some_error_and_drains_the_source() {
        let (tx, rx) = async_channel::bounded(8);
        for n in 0..8 {
            tx.try_send(n).unwrap();
        }
        drop(tx);

        let drained = rx.clone();
        let result = parallelize(rx, 2, |n: i32| async move {
            if n % 2 == 1 {
                eyre::bail!("odd item {n}")
            }
            Ok(())
        })
        .await;

        assert!(result.is_err());
        assert!(drained.is_empty());
    }

    #[tokio::test]
    async fn parallelize_unblocks_a_slow_producer() {
        let gss = gameserverset("default", "simple-set", 16);
        // a bounded producer that outlives the failing workers
        let rx = generate_gameservers(16, &gss);

        let result = parallelize(rx.clone(), 2, |_gs| async move {
            eyre::bail!("refusing every item")
        })
        .await;

        assert!(result.is_err());
        // the producer was drained to completion rather than left blocked
        assert!(rx.is_closed());
        assert!(rx.is_empty());
    }
}
