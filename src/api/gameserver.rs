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

use k8s_openapi::{
    api::core::v1::PodTemplateSpec, apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::core::Resource;
use serde::{Deserialize, Serialize};

use super::SchedulingStrategy;

/// A single managed game server workload, owned by at most one
/// [`GameServerSet`](super::GameServerSet).
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameServer {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: GameServerSpec,
    #[serde(default)]
    pub status: Option<GameServerStatus>,
}

impl GameServer {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    /// The state the downstream game-server controller last reported, or
    /// `Creating` when the status has not been populated yet.
    pub fn state(&self) -> GameServerState {
        self.status
            .as_ref()
            .map_or(GameServerState::Creating, |status| status.state)
    }

    pub fn is_allocated(&self) -> bool {
        matches!(self.state(), GameServerState::Allocated)
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self.state(), GameServerState::Unhealthy)
    }

    /// Whether deletion of this member has already begun.
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// The node the member's pod was scheduled onto. Empty until scheduled.
    pub fn node_name(&self) -> &str {
        self.status
            .as_ref()
            .map_or("", |status| status.node_name.as_str())
    }
}

impl Serialize for GameServer {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut obj = ser.serialize_struct("GameServer", 5)?;
        obj.serialize_field("apiVersion", &GameServer::api_version(&()))?;
        obj.serialize_field("kind", &GameServer::kind(&()))?;
        obj.serialize_field("metadata", &self.metadata)?;
        obj.serialize_field("spec", &self.spec)?;
        obj.serialize_field("status", &self.status)?;
        obj.end()
    }
}

impl Resource for GameServer {
    type DynamicType = ();
    type Scope = kube::core::NamespaceResourceScope;

    fn group(_: &()) -> std::borrow::Cow<'_, str> {
        super::GROUP.into()
    }

    fn kind(_: &()) -> std::borrow::Cow<'_, str> {
        "GameServer".into()
    }

    fn version(_: &()) -> std::borrow::Cow<'_, str> {
        super::VERSION.into()
    }

    fn api_version(_: &()) -> std::borrow::Cow<'_, str> {
        super::API_VERSION.into()
    }

    fn plural(_: &()) -> std::borrow::Cow<'_, str> {
        "gameservers".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSpec {
    /// Container specifies which pod container is the game server. Only
    /// required if there is more than one container defined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    /// Ports that can be exposed via the game server.
    #[serde(default, deserialize_with = "super::deserialize_null_default")]
    pub ports: Vec<GameServerPort>,
    /// Configures health checking.
    #[serde(default)]
    pub health: Health,
    /// Scheduling strategy, inherited from the owning set.
    #[serde(default)]
    pub scheduling: SchedulingStrategy,
    /// Describes the pod that will be created for the [`GameServer`].
    #[serde(default)]
    pub template: PodTemplateSpec,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Health {
    /// Whether health checking is disabled or not.
    #[serde(default)]
    pub disabled: bool,
    /// The number of seconds each health ping has to occur in.
    #[serde(rename = "periodSeconds", default = "default_period_seconds")]
    pub period_seconds: i32,
    /// How many failures in a row constitutes unhealthy.
    #[serde(rename = "failureThreshold", default = "default_failure_threshold")]
    pub failure_threshold: i32,
    /// Initial delay before checking health.
    #[serde(
        rename = "initialDelaySeconds",
        default = "default_initial_delay_seconds"
    )]
    pub initial_delay_seconds: i32,
}

fn default_period_seconds() -> i32 {
    5
}
fn default_initial_delay_seconds() -> i32 {
    5
}
fn default_failure_threshold() -> i32 {
    5
}

impl Default for Health {
    fn default() -> Self {
        Self {
            disabled: false,
            period_seconds: default_period_seconds(),
            failure_threshold: default_failure_threshold(),
            initial_delay_seconds: default_initial_delay_seconds(),
        }
    }
}

/// Defines a port exposed via the [`GameServer`].
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameServerPort {
    /// Descriptive name of the port.
    pub name: String,
    /// Defines how [`Self::host_port`] is populated.
    #[serde(default)]
    pub port_policy: PortPolicy,
    /// The container on which to open the port. Defaults to the game server
    /// container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    /// The port being opened on the container's process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_port: Option<u16>,
    /// The port exposed on the host for clients to connect to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    /// The network protocol being used. Defaults to UDP.
    #[serde(default)]
    pub protocol: Protocol,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum PortPolicy {
    /// The user defines the host port in the configuration.
    Static,
    /// The system chooses an open port for the [`GameServer`].
    Dynamic,
}

impl Default for PortPolicy {
    fn default() -> Self {
        Self::Dynamic
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum Protocol {
    #[serde(rename = "UDP")]
    Udp,
    #[serde(rename = "TCP")]
    Tcp,
}

impl Default for Protocol {
    fn default() -> Self {
        Self::Udp
    }
}

/// The status reported for a [`GameServer`] by its downstream controller.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameServerStatus {
    /// The current state of the [`GameServer`].
    pub state: GameServerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<GameServerStatusPort>>,
    #[serde(default)]
    pub address: String,
    /// The node the member's pod was scheduled onto.
    #[serde(default)]
    pub node_name: String,
}

/// The lifecycle states a [`GameServer`] moves through. This controller only
/// acts on `Ready`, `Allocated` and `Unhealthy`; the remainder are owned by
/// the downstream game-server controller.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum GameServerState {
    /// A dynamically allocating [`GameServer`] is being created, an open
    /// port needs to be allocated.
    PortAllocation,
    /// The pod for the [`GameServer`] is being created.
    Creating,
    /// The pod is created, but not yet scheduled.
    Starting,
    /// The pod has been scheduled in the cluster.
    Scheduled,
    /// The [`GameServer`] has declared that it is ready.
    RequestReady,
    /// The [`GameServer`] is ready to take connections from game clients.
    Ready,
    /// The [`GameServer`] has shutdown and everything needs to be deleted
    /// from the cluster.
    Shutdown,
    /// Something has gone wrong that cannot be resolved.
    Error,
    /// The [`GameServer`] has failed its health checks.
    Unhealthy,
    /// The [`GameServer`] has been allocated to a session.
    Allocated,
}

/// The port that was allocated to a [`GameServer`].
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct GameServerStatusPort {
    pub name: String,
    pub port: u16,
}
