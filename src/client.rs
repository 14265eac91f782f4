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

use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, PostParams},
    runtime::events::{Event, EventType, Recorder, Reporter},
};

use crate::api::{object_reference, GameServer, GameServerSet};

/// Error returned by platform write operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Api(#[from] kube::Error),
}

impl Error {
    /// Whether the platform reported the target object as absent.
    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    /// Whether the write lost an optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        self.status_code() == Some(409)
    }

    fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api(kube::Error::Api(response)) => Some(response.code),
            Self::Api(_) => None,
        }
    }
}

/// The subset of platform write operations the set controller performs.
/// Reads go through the informer caches, never through this trait.
#[async_trait]
pub trait Clientset: Clone + Send + Sync + 'static {
    async fn create_gameserver(&self, gs: GameServer) -> Result<GameServer, Error>;

    async fn delete_gameserver(&self, namespace: &str, name: &str) -> Result<(), Error>;

    async fn update_gameserverset(&self, gss: GameServerSet) -> Result<GameServerSet, Error>;

    /// Emits a normal-severity event on the set. Fire and forget: recording
    /// failures are logged, never surfaced to the caller.
    fn record_event(&self, gss: &GameServerSet, reason: &str, message: String);
}

/// [`Clientset`] backed by the cluster API.
#[derive(Clone)]
pub struct KubeClientset {
    client: kube::Client,
    recorder: Recorder,
}

impl KubeClientset {
    pub fn new(client: kube::Client) -> Self {
        let reporter = Reporter {
            controller: "gameserverset-controller".into(),
            instance: None,
        };

        Self {
            recorder: Recorder::new(client.clone(), reporter),
            client,
        }
    }

    fn gameservers(&self, namespace: &str) -> Api<GameServer> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn gameserversets(&self, namespace: &str) -> Api<GameServerSet> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl Clientset for KubeClientset {
    async fn create_gameserver(&self, gs: GameServer) -> Result<GameServer, Error> {
        let created = self
            .gameservers(gs.namespace())
            .create(&PostParams::default(), &gs)
            .await?;
        Ok(created)
    }

    async fn delete_gameserver(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.gameservers(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn update_gameserverset(&self, gss: GameServerSet) -> Result<GameServerSet, Error> {
        let name = gss.name().to_owned();
        let updated = self
            .gameserversets(gss.namespace())
            .replace(&name, &PostParams::default(), &gss)
            .await?;
        Ok(updated)
    }

    fn record_event(&self, gss: &GameServerSet, reason: &str, message: String) {
        let recorder = self.recorder.clone();
        let reference = object_reference(gss);
        let event = Event {
            type_: EventType::Normal,
            reason: reason.into(),
            note: Some(message),
            action: reason.into(),
            secondary: None,
        };

        tokio::spawn(async move {
            if let Err(error) = recorder.publish(&event, &reference).await {
                tracing::warn!(%error, reason = %event.reason, "failed to record event");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, reason: &str) -> Error {
        Error::Api(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: reason.into(),
            reason: reason.into(),
            code,
        }))
    }

    #[test]
    fn error_taxonomy() {
        assert!(api_error(404, "NotFound").is_not_found());
        assert!(!api_error(404, "NotFound").is_conflict());
        assert!(api_error(409, "Conflict").is_conflict());
        assert!(!api_error(500, "InternalError").is_not_found());
    }
}
