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

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::core::{response::StatusCause, Resource};
use serde::{Deserialize, Serialize};

use super::{GameServer, GameServerSpec, SchedulingStrategy};

/// A declared replica group of [`GameServer`]s. The set controller drives
/// the population of owned members toward `spec.replicas`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSet {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: GameServerSetSpec,
    #[serde(default)]
    pub status: Option<GameServerSetStatus>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSetSpec {
    /// The desired number of members.
    #[serde(default)]
    pub replicas: i32,
    /// Scheduling strategy, stamped onto every member.
    #[serde(default)]
    pub scheduling: SchedulingStrategy,
    /// Prototype from which new members are materialized.
    #[serde(default)]
    pub template: GameServerTemplateSpec,
}

/// Template for a [`GameServer`] resource.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct GameServerTemplateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,
    #[serde(default)]
    pub spec: GameServerSpec,
}

/// Observed member counts, published back by the controller.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSetStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub allocated_replicas: i32,
}

impl GameServerSet {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    /// The fleet this set belongs to, for metric labels. Sets created
    /// directly rather than through a fleet report their own name.
    pub fn fleet_name(&self) -> &str {
        self.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(super::FLEET_LABEL))
            .map_or_else(|| self.name(), String::as_str)
    }

    /// Materializes a fresh member from the set's template. The returned
    /// object carries a `generateName` prefix; the platform assigns the
    /// final name on creation.
    pub fn gameserver(&self) -> GameServer {
        let mut meta = self.spec.template.metadata.clone().unwrap_or_default();
        meta.name = None;
        meta.generate_name = Some(format!("{}-", self.name()));
        meta.namespace = self.metadata.namespace.clone();
        meta.owner_references = Some(vec![self.controller_owner_ref()]);

        let labels = meta.labels.get_or_insert_with(Default::default);
        labels.insert(super::GAMESERVERSET_LABEL.into(), self.name().into());
        if let Some(fleet) = self
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(super::FLEET_LABEL))
        {
            labels.insert(super::FLEET_LABEL.into(), fleet.clone());
        }

        let mut spec = self.spec.template.spec.clone();
        spec.scheduling = self.spec.scheduling;

        GameServer {
            metadata: meta,
            spec,
            status: None,
        }
    }

    /// The owner reference members carry back to this set.
    pub fn controller_owner_ref(&self) -> OwnerReference {
        OwnerReference {
            api_version: super::API_VERSION.into(),
            kind: Self::kind(&()).into_owned(),
            name: self.name().into(),
            uid: self.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// Whether `gs` designates this set as its managing controller.
    pub fn is_controller_of(&self, gs: &GameServer) -> bool {
        let Some(owner) = super::controller_of(&gs.metadata) else {
            return false;
        };

        if owner.kind != Self::kind(&()) || owner.name != self.name() {
            return false;
        }

        // Compare uids only when both sides carry one, so that cached
        // objects predating a recreate are still attributed correctly.
        match &self.metadata.uid {
            Some(uid) if !owner.uid.is_empty() => *uid == owner.uid,
            _ => true,
        }
    }

    /// Validates a proposed update against this (current) revision,
    /// returning the offending field causes. Empty means acceptable.
    pub fn validate_update(&self, new: &Self) -> Vec<StatusCause> {
        let mut causes = Vec::new();

        if self.spec.template != new.spec.template {
            causes.push(StatusCause {
                reason: "FieldValueInvalid".into(),
                message: "template cannot be updated".into(),
                field: "spec.template".into(),
            });
        }
        if new.spec.replicas < 0 {
            causes.push(StatusCause {
                reason: "FieldValueInvalid".into(),
                message: "replicas must not be negative".into(),
                field: "spec.replicas".into(),
            });
        }

        causes
    }
}

impl Serialize for GameServerSet {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut obj = ser.serialize_struct("GameServerSet", 5)?;
        obj.serialize_field("apiVersion", &GameServerSet::api_version(&()))?;
        obj.serialize_field("kind", &GameServerSet::kind(&()))?;
        obj.serialize_field("metadata", &self.metadata)?;
        obj.serialize_field("spec", &self.spec)?;
        obj.serialize_field("status", &self.status)?;
        obj.end()
    }
}

impl Resource for GameServerSet {
    type DynamicType = ();
    type Scope = kube::core::NamespaceResourceScope;

    fn group(_: &()) -> std::borrow::Cow<'_, str> {
        super::GROUP.into()
    }

    fn kind(_: &()) -> std::borrow::Cow<'_, str> {
        "GameServerSet".into()
    }

    fn version(_: &()) -> std::borrow::Cow<'_, str> {
        super::VERSION.into()
    }

    fn api_version(_: &()) -> std::borrow::Cow<'_, str> {
        super::API_VERSION.into()
    }

    fn plural(_: &()) -> std::borrow::Cow<'_, str> {
        "gameserversets".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::gameserverset;

    #[test]
    fn gameserver_inherits_template_and_ownership() {
        let mut gss = gameserverset("default", "simple-set", 3);
        gss.metadata.uid = Some("uid-1".into());
        gss.spec.scheduling = SchedulingStrategy::Distributed;

        let gs = gss.gameserver();

        assert_eq!(gs.metadata.generate_name.as_deref(), Some("simple-set-"));
        assert_eq!(gs.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(gs.spec.scheduling, SchedulingStrategy::Distributed);
        assert_eq!(
            gs.metadata.labels.as_ref().unwrap()[crate::api::GAMESERVERSET_LABEL],
            "simple-set"
        );

        let owner = crate::api::controller_of(&gs.metadata).unwrap();
        assert_eq!(owner.kind, "GameServerSet");
        assert_eq!(owner.name, "simple-set");
        assert_eq!(owner.uid, "uid-1");
        assert!(gss.is_controller_of(&gs));
    }

    #[test]
    fn is_controller_of_rejects_other_owners() {
        let mut gss = gameserverset("default", "simple-set", 1);
        gss.metadata.uid = Some("uid-1".into());
        let other = gameserverset("default", "other-set", 1);

        let gs = gss.gameserver();
        assert!(!other.is_controller_of(&gs));

        let orphan = other.spec.template.spec.clone();
        let orphan = GameServer {
            metadata: ObjectMeta::default(),
            spec: orphan,
            status: None,
        };
        assert!(!gss.is_controller_of(&orphan));
    }

    #[test]
    fn validate_update_enforces_template_identity() {
        let old = gameserverset("default", "simple-set", 3);
        let mut new = old.clone();
        new.spec.replicas = 5;
        assert!(old.validate_update(&new).is_empty());

        new.spec.template.spec.container = Some("other".into());
        let causes = old.validate_update(&new);
        assert_eq!(causes.len(), 1);
        assert_eq!(causes[0].field, "spec.template");
    }

    #[test]
    fn validate_update_rejects_negative_replicas() {
        let old = gameserverset("default", "simple-set", 3);
        let mut new = old.clone();
        new.spec.replicas = -1;

        let causes = old.validate_update(&new);
        assert_eq!(causes.len(), 1);
        assert_eq!(causes[0].field, "spec.replicas");
    }

    #[test]
    fn fleet_name_falls_back_to_set_name() {
        let mut gss = gameserverset("default", "simple-set", 1);
        assert_eq!(gss.fleet_name(), "simple-set");

        gss.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(crate::api::FLEET_LABEL.into(), "simple-fleet".into());
        assert_eq!(gss.fleet_name(), "simple-fleet");
    }
}
