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

//! The `agon.dev/v1` API group: the custom resources this controller
//! watches and mutates.

pub mod gameserver;
pub mod gameserverset;

use k8s_openapi::{
    api::core::v1::ObjectReference,
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference},
};
use kube::core::Resource;
use serde::Deserialize;

pub use self::{
    gameserver::{GameServer, GameServerSpec, GameServerState, GameServerStatus},
    gameserverset::{GameServerSet, GameServerSetSpec, GameServerSetStatus},
};

pub const GROUP: &str = "agon.dev";
pub const VERSION: &str = "v1";
pub const API_VERSION: &str = "agon.dev/v1";

/// Label placed on every member naming the set that materialized it.
pub const GAMESERVERSET_LABEL: &str = "agon.dev/gameserverset";
/// Label naming the fleet a set belongs to, stamped by the fleet layer.
pub const FLEET_LABEL: &str = "agon.dev/fleet";

/// Namespace/name pair identifying an object within the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Key {
    pub namespace: String,
    pub name: String,
}

impl Key {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_meta(meta: &ObjectMeta) -> Self {
        Self {
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The strategy that a set will use when scheduling its members' pods
/// across a cluster, and when picking victims on scale down.
#[derive(Clone, Copy, Debug, Deserialize, serde::Serialize, PartialEq, Eq)]
pub enum SchedulingStrategy {
    /// Prefer filling nodes as full as possible, so that scale down drains
    /// the emptiest nodes first. This is most useful for dynamic clusters,
    /// such as on cloud providers.
    Packed,
    /// Spread members across many nodes. This is most useful for statically
    /// sized clusters, such as on physical hardware.
    Distributed,
}

impl Default for SchedulingStrategy {
    fn default() -> Self {
        Self::Packed
    }
}

/// Returns the owner reference marked as the managing controller, if any.
pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|or| or.controller == Some(true))
}

/// Builds the event-target reference for an object of this API group.
pub fn object_reference<K>(obj: &K) -> ObjectReference
where
    K: Resource<DynamicType = ()>,
{
    ObjectReference {
        api_version: Some(K::api_version(&()).into_owned()),
        kind: Some(K::kind(&()).into_owned()),
        name: obj.meta().name.clone(),
        namespace: obj.meta().namespace.clone(),
        uid: obj.meta().uid.clone(),
        ..Default::default()
    }
}

pub(crate) fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    T: Default + Deserialize<'de>,
    D: serde::de::Deserializer<'de>,
{
    let opt = Option::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display() {
        let key = Key::new("default", "simple-set");
        assert_eq!(key.to_string(), "default/simple-set");
    }

    #[test]
    fn controller_of_prefers_controlling_reference() {
        let meta = ObjectMeta {
            owner_references: Some(vec![
                OwnerReference {
                    name: "bystander".into(),
                    ..Default::default()
                },
                OwnerReference {
                    name: "manager".into(),
                    controller: Some(true),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };

        assert_eq!(controller_of(&meta).unwrap().name, "manager");
    }
}
