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

//! Builders and fakes shared by the crate's tests.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{core::Resource, runtime::watcher};
use serde::de::DeserializeOwned;

use crate::{
    api::{GameServer, GameServerSet, GameServerState, GameServerStatus, Key},
    client::{Clientset, Error},
    informer::{CacheView, Informer},
};

/// A set with a populated template and a stable uid.
pub fn gameserverset(namespace: &str, name: &str, replicas: i32) -> GameServerSet {
    let mut gss = GameServerSet {
        metadata: Default::default(),
        spec: Default::default(),
        status: None,
    };
    gss.metadata.namespace = Some(namespace.into());
    gss.metadata.name = Some(name.into());
    gss.metadata.uid = Some(format!("uid-{name}"));
    gss.spec.replicas = replicas;
    gss
}

/// A named member owned by `gss`, reporting `state`.
pub fn gameserver(gss: &GameServerSet, name: &str, state: GameServerState) -> GameServer {
    let mut gs = gss.gameserver();
    gs.metadata.generate_name = None;
    gs.metadata.name = Some(name.into());
    gs.status = Some(GameServerStatus {
        state,
        ports: None,
        address: String::new(),
        node_name: String::new(),
    });
    gs
}

pub fn on_node(mut gs: GameServer, node: &str) -> GameServer {
    if let Some(status) = gs.status.as_mut() {
        status.node_name = node.into();
    }
    gs
}

pub fn deleting(mut gs: GameServer) -> GameServer {
    gs.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
    gs
}

/// A cache view already synced and populated with `objects`.
pub fn synced_cache<K>(objects: Vec<K>) -> CacheView<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug + Send + Sync + 'static,
{
    let (view, _informer) = synced_informer(objects);
    view
}

/// Like [`synced_cache`], but keeps the informer around so tests can feed
/// further events through it.
pub fn synced_informer<K>(objects: Vec<K>) -> (CacheView<K>, Informer<K>)
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug + Send + Sync + 'static,
{
    let mut informer = Informer::new();
    informer.apply(watcher::Event::Init);
    for obj in objects {
        informer.apply(watcher::Event::InitApply(obj));
    }
    informer.apply(watcher::Event::InitDone);
    (informer.view(), informer)
}

pub fn api_error(code: u16, reason: &str) -> Error {
    Error::Api(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".into(),
        message: reason.into(),
        reason: reason.into(),
        code,
    }))
}

#[derive(Default)]
pub struct FakeState {
    pub created: Vec<GameServer>,
    pub deleted: Vec<Key>,
    pub updated: Vec<GameServerSet>,
    /// (reason, message) pairs in recording order.
    pub events: Vec<(String, String)>,
    /// Status code returned by every create while set.
    pub create_error: Option<u16>,
    /// Status code returned when deleting the named member.
    pub delete_errors: HashMap<String, u16>,
    /// Status code returned by every set update while set.
    pub update_error: Option<u16>,
    next_suffix: u64,
}

/// In-memory [`Clientset`] recording every write it receives.
#[derive(Clone, Default)]
pub struct FakeClientset {
    pub state: Arc<parking_lot::Mutex<FakeState>>,
}

impl FakeClientset {
    pub fn created(&self) -> Vec<GameServer> {
        self.state.lock().created.clone()
    }

    pub fn deleted(&self) -> Vec<Key> {
        self.state.lock().deleted.clone()
    }

    pub fn updated(&self) -> Vec<GameServerSet> {
        self.state.lock().updated.clone()
    }

    pub fn events(&self) -> Vec<(String, String)> {
        self.state.lock().events.clone()
    }

    pub fn events_with_reason(&self, reason: &str) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|(r, _)| r == reason)
            .count()
    }
}

#[async_trait]
impl Clientset for FakeClientset {
    async fn create_gameserver(&self, mut gs: GameServer) -> Result<GameServer, Error> {
        let mut state = self.state.lock();
        if let Some(code) = state.create_error {
            return Err(api_error(code, "create refused"));
        }

        if gs.metadata.name.is_none() {
            state.next_suffix += 1;
            let prefix = gs.metadata.generate_name.clone().unwrap_or_default();
            gs.metadata.name = Some(format!("{prefix}{:04}", state.next_suffix));
        }
        state.created.push(gs.clone());
        Ok(gs)
    }

    async fn delete_gameserver(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        if let Some(code) = state.delete_errors.get(name) {
            return Err(api_error(*code, "delete refused"));
        }
        state.deleted.push(Key::new(namespace, name));
        Ok(())
    }

    async fn update_gameserverset(&self, gss: GameServerSet) -> Result<GameServerSet, Error> {
        let mut state = self.state.lock();
        if let Some(code) = state.update_error {
            return Err(api_error(code, "update refused"));
        }
        state.updated.push(gss.clone());
        Ok(gss)
    }

    fn record_event(&self, _gss: &GameServerSet, reason: &str, message: String) {
        self.state.lock().events.push((reason.into(), message));
    }
}
