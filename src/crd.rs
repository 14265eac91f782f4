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

use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::Api;

use crate::signal::ShutdownRx;

/// Blocks until every named CustomResourceDefinition reports an
/// `Established` condition. The definitions are installed by the operator
/// deployment, not by this process.
pub(crate) async fn wait_for_established(
    client: kube::Client,
    names: &[&str],
    shutdown: &mut ShutdownRx,
) -> crate::Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client);

    for name in names {
        loop {
            match api.get_opt(name).await? {
                Some(crd) if is_established(&crd) => {
                    tracing::info!(crd = name, "custom resource definition established");
                    break;
                }
                Some(_) => tracing::debug!(crd = name, "custom resource definition not ready"),
                None => tracing::debug!(crd = name, "custom resource definition not found"),
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = shutdown.changed() => {
                    eyre::bail!("shut down while waiting for {name} to be established")
                }
            }
        }
    }

    Ok(())
}

fn is_established(crd: &CustomResourceDefinition) -> bool {
    crd.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Established" && condition.status == "True")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
        CustomResourceDefinitionCondition, CustomResourceDefinitionStatus,
    };

    fn crd_with_condition(type_: &str, status: &str) -> CustomResourceDefinition {
        CustomResourceDefinition {
            status: Some(CustomResourceDefinitionStatus {
                conditions: Some(vec![CustomResourceDefinitionCondition {
                    type_: type_.into(),
                    status: status.into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn established_condition_is_detected() {
        assert!(is_established(&crd_with_condition("Established", "True")));
        assert!(!is_established(&crd_with_condition("Established", "False")));
        assert!(!is_established(&crd_with_condition("NamesAccepted", "True")));
        assert!(!is_established(&CustomResourceDefinition::default()));
    }
}
