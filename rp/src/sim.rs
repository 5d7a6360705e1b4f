// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated resource type
//!
//! The server operates on real platforms through the [`crate::registry`]
//! traits.  This module provides the one type the standalone server
//! serves: a simulated machine whose request properties declare the
//! output resources to "create".  The handler records every create and
//! delete it performs, which is what integration tests assert against,
//! and supports injected failures and delays via a `simulate` stanza in
//! the request properties:
//!
//! ```json
//! {
//!   "properties": {
//!     "resources": [
//!       {"localId": "disk", "managed": true},
//!       {"localId": "vm", "dependsOn": ["disk"]}
//!     ],
//!     "simulate": {"failCreate": "vm", "createDelayMs": 50}
//!   }
//! }
//! ```

use crate::credentials::Credential;
use crate::credentials::CredentialCache;
use crate::credentials::CredentialProvider;
use crate::db::ResourceRecord;
use crate::registry::Converter;
use crate::registry::Handler;
use crate::registry::Registry;
use crate::registry::RenderOutput;
use crate::registry::Renderer;
use crate::registry::TypeEntry;
use crate::registry::UpdateFilter;
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use chrono::Utc;
use rand::Rng;
use serde_json::json;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use terrane_common::output::OutputResource;
use terrane_common::provisioning::ProvisioningState;
use terrane_common::Error;
use terrane_common::ResourceId;

/// Qualified type tag served by the simulated provider.
pub const SIM_RESOURCE_TYPE: &str = "Terrane.Sim/machines";

pub struct SimConverter;

impl Converter for SimConverter {
    fn decode(
        &self,
        id: &ResourceId,
        api_version: &str,
        body: &Value,
    ) -> Result<ResourceRecord, Error> {
        let Some(body) = body.as_object() else {
            return Err(Error::invalid_request(
                "request body must be a JSON object",
            ));
        };
        let properties = match body.get("properties") {
            None => json!({}),
            Some(Value::Object(properties)) => {
                let mut properties = properties.clone();
                // Read-only keys that `encode` injects.  Bodies built from
                // an encoded resource (merge patches) echo them back.
                properties.remove("provisioningState");
                properties.remove("status");
                Value::Object(properties)
            }
            Some(_) => {
                return Err(Error::invalid_request(
                    "properties must be a JSON object",
                ));
            }
        };
        let scope = |key: &str| -> Result<Option<String>, Error> {
            match properties.get(key) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::String(s)) => Ok(Some(s.clone())),
                Some(_) => Err(Error::InvalidValue {
                    label: format!("properties.{}", key),
                    message: "expected a resource id string".to_string(),
                }),
            }
        };

        let now = Utc::now();
        Ok(ResourceRecord {
            id: id.clone(),
            resource_type: SIM_RESOURCE_TYPE.to_string(),
            api_version: api_version.to_string(),
            environment: scope("environment")?,
            application: scope("application")?,
            provisioning_state: ProvisioningState::Accepted,
            status: Default::default(),
            properties,
            created_at: now,
            modified_at: now,
        })
    }

    fn encode(
        &self,
        record: &ResourceRecord,
        _api_version: &str,
    ) -> Result<Value, Error> {
        let mut properties = record.properties.clone();
        if !properties.is_object() {
            properties = json!({});
        }
        let map = properties.as_object_mut().unwrap();
        map.insert(
            "provisioningState".to_string(),
            json!(record.provisioning_state.to_string()),
        );
        map.insert("status".to_string(), serde_json::to_value(&record.status)?);
        Ok(json!({
            "id": record.id.to_string(),
            "name": record.id.name(),
            "type": record.resource_type,
            "properties": properties,
        }))
    }
}

/// Validates the declared output resources before the request is accepted,
/// so malformed declarations fail with a 400 instead of a failed operation.
pub struct DeclaredResourcesFilter;

#[async_trait]
impl UpdateFilter for DeclaredResourcesFilter {
    async fn filter(
        &self,
        new: &mut ResourceRecord,
        _old: Option<&ResourceRecord>,
    ) -> Result<(), Error> {
        let Some(resources) = new.properties.get("resources") else {
            return Ok(());
        };
        let Some(resources) = resources.as_array() else {
            return Err(Error::invalid_request(
                "properties.resources must be an array",
            ));
        };
        for (index, declared) in resources.iter().enumerate() {
            let valid = declared
                .get("localId")
                .and_then(Value::as_str)
                .is_some_and(|local_id| !local_id.is_empty());
            if !valid {
                return Err(Error::InvalidValue {
                    label: format!("properties.resources[{}]", index),
                    message: "localId must be a non-empty string".to_string(),
                });
            }
            if let Some(depends_on) = declared.get("dependsOn") {
                let all_strings = depends_on.as_array().is_some_and(|deps| {
                    deps.iter().all(|d| d.as_str().is_some())
                });
                if !all_strings {
                    return Err(Error::InvalidValue {
                        label: format!(
                            "properties.resources[{}].dependsOn",
                            index
                        ),
                        message: "expected an array of local ids".to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

pub struct SimRenderer;

#[async_trait]
impl Renderer for SimRenderer {
    async fn render(
        &self,
        record: &ResourceRecord,
    ) -> Result<RenderOutput, Error> {
        if simulate_flag(record, "failRender") {
            return Err(Error::internal_error("injected render failure"));
        }
        let mut output_resources = Vec::new();
        if let Some(declared) =
            record.properties.get("resources").and_then(Value::as_array)
        {
            for resource in declared {
                let local_id = resource
                    .get("localId")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let dependencies = resource
                    .get("dependsOn")
                    .and_then(Value::as_array)
                    .map(|deps| {
                        deps.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                output_resources.push(OutputResource {
                    local_id,
                    id: None,
                    managed: resource
                        .get("managed")
                        .and_then(Value::as_bool)
                        .unwrap_or(true),
                    dependencies,
                });
            }
        }
        Ok(RenderOutput {
            output_resources,
            compute: record.properties.get("compute").cloned(),
        })
    }
}

/// What the simulated platform has been asked to do, in order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SimActivity {
    Created { local_id: String, physical_id: String },
    Deleted { local_id: String, physical_id: Option<String> },
}

pub struct SimHandler {
    credentials: Arc<CredentialCache>,
    activity: Mutex<Vec<SimActivity>>,
}

impl SimHandler {
    pub fn new(credentials: Arc<CredentialCache>) -> SimHandler {
        SimHandler { credentials, activity: Mutex::new(Vec::new()) }
    }

    /// Everything created and deleted so far, in platform-call order.
    pub fn activity(&self) -> Vec<SimActivity> {
        self.activity.lock().unwrap().clone()
    }

    /// Local ids of created outputs, in creation order.
    pub fn created_order(&self) -> Vec<String> {
        self.activity()
            .into_iter()
            .filter_map(|a| match a {
                SimActivity::Created { local_id, .. } => Some(local_id),
                SimActivity::Deleted { .. } => None,
            })
            .collect()
    }

    /// Local ids of deleted outputs, in deletion order.
    pub fn deleted_order(&self) -> Vec<String> {
        self.activity()
            .into_iter()
            .filter_map(|a| match a {
                SimActivity::Deleted { local_id, .. } => Some(local_id),
                SimActivity::Created { .. } => None,
            })
            .collect()
    }
}

#[async_trait]
impl Handler for SimHandler {
    async fn create(
        &self,
        record: &ResourceRecord,
        output: &OutputResource,
        _deployed: &BTreeMap<String, String>,
    ) -> Result<String, Error> {
        // The cache, not this handler, decides whether a fetch happens.
        let _credential = self.credentials.get().await?;

        if let Some(delay_ms) = simulate_number(record, "createDelayMs") {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms))
                .await;
        }
        if simulate_string(record, "failCreate").as_deref()
            == Some(output.local_id.as_str())
        {
            return Err(Error::internal_error(format!(
                "injected create failure for {:?}",
                output.local_id
            )));
        }

        // Creation is an idempotent "ensure": an output already deployed
        // under this local id keeps its physical id, so re-renders of an
        // unchanged declaration do not churn the platform.
        let existing = record
            .status
            .output_resources
            .iter()
            .find(|o| o.local_id == output.local_id)
            .and_then(|o| o.id.clone());
        let physical_id = match existing {
            Some(physical_id) => physical_id,
            None => {
                let suffix: u32 = rand::thread_rng().gen();
                format!(
                    "/planes/sim/local/providers/Terrane.Sim/outputs/{}-{:08x}",
                    output.local_id.to_lowercase(),
                    suffix
                )
            }
        };
        self.activity.lock().unwrap().push(SimActivity::Created {
            local_id: output.local_id.clone(),
            physical_id: physical_id.clone(),
        });
        Ok(physical_id)
    }

    async fn delete(&self, output: &OutputResource) -> Result<(), Error> {
        self.activity.lock().unwrap().push(SimActivity::Deleted {
            local_id: output.local_id.clone(),
            physical_id: output.id.clone(),
        });
        Ok(())
    }
}

fn simulate_value<'a>(record: &'a ResourceRecord, key: &str) -> Option<&'a Value> {
    record.properties.get("simulate")?.get(key)
}

fn simulate_flag(record: &ResourceRecord, key: &str) -> bool {
    simulate_value(record, key).and_then(Value::as_bool).unwrap_or(false)
}

fn simulate_string(record: &ResourceRecord, key: &str) -> Option<String> {
    simulate_value(record, key)?.as_str().map(str::to_string)
}

fn simulate_number(record: &ResourceRecord, key: &str) -> Option<u64> {
    simulate_value(record, key)?.as_u64()
}

/// Credential source for the simulated platform.  Tokens are minted
/// locally and live for an hour.
pub struct SimCredentialProvider;

#[async_trait]
impl CredentialProvider for SimCredentialProvider {
    async fn fetch(&self) -> Result<Credential, Error> {
        let secret: u64 = rand::thread_rng().gen();
        Ok(Credential {
            client_id: "terrane-sim".to_string(),
            secret: format!("{:016x}", secret),
            expires_at: Utc::now() + ChronoDuration::hours(1),
        })
    }
}

/// Builds the registry served by the standalone server: the simulated
/// machine type wired to one shared handler.  The handler is also
/// returned so tests can inspect platform activity.
pub fn sim_registry(
    credentials: Arc<CredentialCache>,
) -> (Registry, Arc<SimHandler>) {
    let handler = Arc::new(SimHandler::new(credentials));
    let mut registry = Registry::new();
    registry.register(TypeEntry {
        resource_type: SIM_RESOURCE_TYPE.to_string(),
        converter: Arc::new(SimConverter),
        update_filters: vec![Arc::new(DeclaredResourcesFilter)],
        renderer: Arc::new(SimRenderer),
        handler: handler.clone(),
    });
    (registry, handler)
}

#[cfg(test)]
mod test {
    use super::DeclaredResourcesFilter;
    use super::SimConverter;
    use super::SimRenderer;
    use crate::registry::Converter;
    use crate::registry::Renderer;
    use crate::registry::UpdateFilter;
    use serde_json::json;
    use terrane_common::Error;
    use terrane_common::ResourceId;

    fn id() -> ResourceId {
        "/planes/terrane/local/resourceGroups/rg1/providers/Terrane.Sim/\
         machines/m1"
            .parse()
            .unwrap()
    }

    #[test]
    fn test_decode_and_encode() {
        let converter = SimConverter;
        let record = converter
            .decode(
                &id(),
                "2025-01-01",
                &json!({
                    "properties": {
                        "environment": "/planes/terrane/local/resourceGroups/\
                            rg1/providers/Terrane.Core/environments/e1",
                        "resources": [{"localId": "disk"}]
                    }
                }),
            )
            .unwrap();
        assert!(record.environment.is_some());
        assert_eq!(record.application, None);

        let encoded = converter.encode(&record, "2025-01-01").unwrap();
        assert_eq!(encoded["name"], "m1");
        assert_eq!(encoded["type"], "Terrane.Sim/machines");
        assert_eq!(encoded["properties"]["provisioningState"], "Accepted");
    }

    #[test]
    fn test_decode_strips_read_only_keys() {
        // An encoded resource fed back through decode (as a merge patch
        // does) must not persist the injected read-only keys.
        let converter = SimConverter;
        let record = converter
            .decode(
                &id(),
                "2025-01-01",
                &json!({
                    "properties": {
                        "marker": "kept",
                        "provisioningState": "Succeeded",
                        "status": {"outputResources": []}
                    }
                }),
            )
            .unwrap();
        assert_eq!(record.properties["marker"], "kept");
        assert!(record.properties.get("provisioningState").is_none());
        assert!(record.properties.get("status").is_none());
    }

    #[test]
    fn test_decode_rejects_malformed_bodies() {
        let converter = SimConverter;
        let err = converter
            .decode(&id(), "2025-01-01", &json!([1, 2]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest { .. }));

        let err = converter
            .decode(&id(), "2025-01-01", &json!({"properties": 7}))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_filter_rejects_bad_declarations() {
        let converter = SimConverter;
        let filter = DeclaredResourcesFilter;

        let mut record = converter
            .decode(
                &id(),
                "2025-01-01",
                &json!({"properties": {"resources": [{"dependsOn": []}]}}),
            )
            .unwrap();
        let err = filter.filter(&mut record, None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidValue { .. }));

        let mut record = converter
            .decode(
                &id(),
                "2025-01-01",
                &json!({"properties": {
                    "resources": [{"localId": "a", "dependsOn": [1]}]
                }}),
            )
            .unwrap();
        let err = filter.filter(&mut record, None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidValue { .. }));
    }

    #[tokio::test]
    async fn test_render_declared_resources() {
        let converter = SimConverter;
        let record = converter
            .decode(
                &id(),
                "2025-01-01",
                &json!({"properties": {
                    "resources": [
                        {"localId": "disk", "managed": false},
                        {"localId": "vm", "dependsOn": ["disk"]}
                    ],
                    "compute": {"kind": "simulated"}
                }}),
            )
            .unwrap();
        let render = SimRenderer.render(&record).await.unwrap();
        assert_eq!(render.output_resources.len(), 2);
        assert!(!render.output_resources[0].managed);
        assert_eq!(render.output_resources[1].dependencies, vec!["disk"]);
        assert_eq!(render.compute, Some(json!({"kind": "simulated"})));
    }
}
