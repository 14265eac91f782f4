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

//! Bridges a cluster watch stream into a local read cache plus typed
//! add/update/delete callbacks.
//!
//! The bridge performs the event narrowing once: handlers receive the old
//! and new payloads and never see raw watch events.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use kube::{
    core::Resource,
    runtime::{
        reflector::{self, store::Writer, ObjectRef, Store},
        watcher,
    },
};
use serde::de::DeserializeOwned;
use tokio::sync::watch;

use crate::{api::Key, signal::ShutdownRx};

/// A narrowed cache notification delivered to registered handlers.
pub enum CacheEvent<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
}

type Handler<K> = Box<dyn Fn(&CacheEvent<K>) + Send + Sync>;

/// Owns the write half of a reflector cache and dispatches watch events to
/// handlers. Constructed once, handlers registered, then driven by
/// [`Informer::run`] against a watch stream.
pub struct Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store: Store<K>,
    writer: Writer<K>,
    synced_tx: watch::Sender<bool>,
    synced_rx: watch::Receiver<bool>,
    handlers: Vec<Handler<K>>,
}

impl<K> Informer<K>
where
    K: Resource<DynamicType = ()>
        + Clone
        + DeserializeOwned
        + std::fmt::Debug
        + Send
        + Sync
        + 'static,
{
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let (store, writer) = reflector::store();
        let (synced_tx, synced_rx) = watch::channel(false);
        Self {
            store,
            writer,
            synced_tx,
            synced_rx,
            handlers: Vec::new(),
        }
    }

    /// A read handle onto the cache this informer maintains.
    pub fn view(&self) -> CacheView<K> {
        CacheView {
            store: self.store.clone(),
            synced: self.synced_rx.clone(),
        }
    }

    pub fn add_event_handler(&mut self, handler: impl Fn(&CacheEvent<K>) + Send + Sync + 'static) {
        self.handlers.push(Box::new(handler));
    }

    /// Drives the cache from `stream` until shutdown. Watch errors are
    /// logged and the stream polled again (the watcher re-establishes
    /// itself); stream termination is unexpected and surfaced.
    pub async fn run<S>(mut self, stream: S, mut shutdown: ShutdownRx) -> crate::Result<()>
    where
        S: Stream<Item = Result<watcher::Event<K>, watcher::Error>>,
    {
        tokio::pin!(stream);

        loop {
            let event = tokio::select! {
                event = stream.next() => event,
                _ = shutdown.changed() => return Ok(()),
            };

            match event {
                Some(Ok(event)) => self.apply(event),
                Some(Err(error)) => {
                    tracing::warn!(kind = %K::kind(&()), %error, "watch stream error");
                }
                None => eyre::bail!("watch stream terminated"),
            }
        }
    }

    pub(crate) fn apply(&mut self, event: watcher::Event<K>) {
        match &event {
            watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
                let old = self.store.get(&ObjectRef::from_obj(obj));
                self.writer.apply_watcher_event(&event);

                let new = Arc::new(obj.clone());
                let cache_event = match old {
                    Some(old) => CacheEvent::Updated { old, new },
                    None => CacheEvent::Added(new),
                };
                self.dispatch(&cache_event);
            }
            watcher::Event::Delete(obj) => {
                self.writer.apply_watcher_event(&event);
                self.dispatch(&CacheEvent::Deleted(Arc::new(obj.clone())));
            }
            watcher::Event::Init => {
                self.writer.apply_watcher_event(&event);
            }
            watcher::Event::InitDone => {
                self.writer.apply_watcher_event(&event);
                if !self.synced_tx.send_replace(true) {
                    tracing::debug!(kind = %K::kind(&()), "cache synced");
                }
            }
        }
    }

    fn dispatch(&self, event: &CacheEvent<K>) {
        for handler in &self.handlers {
            handler(event);
        }
    }

    #[cfg(test)]
    pub(crate) fn set_synced(&self, synced: bool) {
        self.synced_tx.send_replace(synced);
    }
}

/// Read handle onto an informer cache: the lister plus its sync state.
pub struct CacheView<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store: Store<K>,
    synced: watch::Receiver<bool>,
}

impl<K> Clone for CacheView<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            synced: self.synced.clone(),
        }
    }
}

impl<K> CacheView<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    pub fn get(&self, key: &Key) -> Option<Arc<K>> {
        self.store
            .get(&ObjectRef::new(&key.name).within(&key.namespace))
    }

    /// Everything currently cached, in no particular order.
    pub fn state(&self) -> Vec<Arc<K>> {
        self.store.state()
    }

    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Waits until the cache has synced, returning false if shutdown fires
    /// first or the informer went away without ever syncing.
    pub async fn wait_for_sync(&self, shutdown: &mut ShutdownRx) -> bool {
        let mut synced = self.synced.clone();
        loop {
            if *synced.borrow_and_update() {
                return true;
            }
            tokio::select! {
                changed = synced.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                _ = shutdown.changed() => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::{GameServer, GameServerSet},
        test_utils::{gameserver, gameserverset, synced_cache},
    };
    use std::sync::Arc as StdArc;

    fn collected() -> (
        StdArc<parking_lot::Mutex<Vec<String>>>,
        impl Fn(&CacheEvent<GameServerSet>) + Send + Sync + 'static,
    ) {
        let seen = StdArc::new(parking_lot::Mutex::new(Vec::new()));
        let handler = {
            let seen = seen.clone();
            move |event: &CacheEvent<GameServerSet>| {
                let tag = match event {
                    CacheEvent::Added(gss) => format!("added:{}", gss.name()),
                    CacheEvent::Updated { old, new } => {
                        format!("updated:{}:{}->{}", new.name(), old.spec.replicas, new.spec.replicas)
                    }
                    CacheEvent::Deleted(gss) => format!("deleted:{}", gss.name()),
                };
                seen.lock().push(tag);
            }
        };
        (seen, handler)
    }

    #[tokio::test]
    async fn dispatches_narrowed_events_and_tracks_sync() {
        let mut informer = Informer::<GameServerSet>::new();
        let (seen, handler) = collected();
        informer.add_event_handler(handler);
        let view = informer.view();

        let gss = gameserverset("default", "simple-set", 3);
        let mut updated = gss.clone();
        updated.spec.replicas = 5;

        assert!(!view.has_synced());

        informer.apply(watcher::Event::Init);
        informer.apply(watcher::Event::InitApply(gss.clone()));
        informer.apply(watcher::Event::InitDone);
        assert!(view.has_synced());

        informer.apply(watcher::Event::Apply(updated.clone()));
        informer.apply(watcher::Event::Delete(updated));

        assert_eq!(
            *seen.lock(),
            vec![
                "added:simple-set",
                "updated:simple-set:3->5",
                "deleted:simple-set",
            ]
        );
        assert!(view
            .get(&crate::api::Key::new("default", "simple-set"))
            .is_none());
    }

    #[tokio::test]
    async fn run_consumes_a_stream_until_it_ends() {
        let informer = Informer::<GameServer>::new();
        let view = informer.view();
        let gss = gameserverset("default", "simple-set", 1);
        let gs = gameserver(&gss, "simple-set-abcd", crate::api::GameServerState::Ready);

        let events = vec![
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitApply(gs)),
            Ok(watcher::Event::InitDone),
        ];
        let (_shutdown_tx, shutdown_rx) = crate::signal::channel();

        // the stream runs dry, which the informer reports as an error
        let result = informer.run(futures::stream::iter(events), shutdown_rx).await;
        assert!(result.is_err());

        assert!(view.has_synced());
        assert_eq!(view.state().len(), 1);
    }

    #[tokio::test]
    async fn wait_for_sync_observes_shutdown() {
        let cache = synced_cache::<GameServerSet>(Vec::new());
        let (shutdown_tx, mut shutdown_rx) = crate::signal::channel();
        assert!(cache.wait_for_sync(&mut shutdown_rx).await);

        let informer = Informer::<GameServerSet>::new();
        let unsynced = informer.view();
        shutdown_tx.send(()).unwrap();
        assert!(!unsynced.wait_for_sync(&mut shutdown_rx).await);
    }
}
