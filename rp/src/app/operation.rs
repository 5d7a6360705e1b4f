// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operation controller: accepts resource mutations and hands them to the
//! background worker
//!
//! The controller does no deployment work itself.  A successful PUT or
//! DELETE writes the resource in a non-terminal state, records an
//! operation status, enqueues work for the worker, and answers with
//! polling headers.  All writes are conditional on the version tag read at
//! the start of the request; a concurrent writer turns into a 409, never
//! a lost update.

use crate::app::status::StatusManager;
use crate::db::Datastore;
use crate::db::ResourceRecord;
use crate::db::WritePrecondition;
use crate::registry::Registry;
use chrono::Utc;
use slog::info;
use slog::warn;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;
use terrane_common::provisioning::OperationKind;
use terrane_common::provisioning::OperationRequest;
use terrane_common::provisioning::ProvisioningState;
use terrane_common::Error;
use terrane_common::ResourceId;
use uuid::Uuid;

/// An accepted asynchronous operation, as surfaced to the HTTP layer.
#[derive(Debug)]
pub struct AcceptedOperation {
    /// True when the request created the resource (201 rather than 202).
    pub created: bool,
    /// Encoded wire body of the accepted resource, when the operation has
    /// one (PUT and PATCH; DELETE answers with an empty body).
    pub body: Option<serde_json::Value>,
    pub operation_id: Uuid,
    /// Path for the `Azure-AsyncOperation` header.
    pub status_path: String,
    /// Path for the `Location` header.
    pub result_path: String,
    pub retry_after_secs: u64,
}

/// Outcome of a DELETE request.
#[derive(Debug)]
pub enum DeleteOutcome {
    /// The resource does not exist; nothing to do and nothing recorded.
    NoOp,
    Accepted(AcceptedOperation),
}

pub struct OperationController {
    datastore: Arc<dyn Datastore>,
    status: Arc<StatusManager>,
    registry: Arc<Registry>,
    operation_timeout: Duration,
    retry_after_secs: u64,
    log: Logger,
}

impl OperationController {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        status: Arc<StatusManager>,
        registry: Arc<Registry>,
        operation_timeout: Duration,
        retry_after_secs: u64,
        log: Logger,
    ) -> OperationController {
        OperationController {
            datastore,
            status,
            registry,
            operation_timeout,
            retry_after_secs,
            log,
        }
    }

    /// Handles a PUT: full-replacement upsert of one resource.
    pub async fn put(
        &self,
        id: &ResourceId,
        api_version: &str,
        body: serde_json::Value,
    ) -> Result<AcceptedOperation, Error> {
        let entry = self.registry.lookup(&qualified_type(id)?)?;
        let mut record = entry.converter.decode(id, api_version, &body)?;
        let old = self.datastore.get(id).await?;

        if let Some((old_record, _)) = &old {
            if !old_record.provisioning_state.is_terminal() {
                return Err(Error::conflict(format!(
                    "resource {} has an operation in progress (state {})",
                    id, old_record.provisioning_state
                )));
            }
        }

        let old_record = old.as_ref().map(|(record, _)| record);
        for filter in &entry.update_filters {
            filter.filter(&mut record, old_record).await?;
        }

        if let Some(old_record) = old_record {
            if !record.scopes_equal(old_record) {
                return Err(Error::invalid_request(
                    "the environment or application of an existing resource \
                     cannot be changed",
                ));
            }
            // The deployment status describes what actually exists on the
            // platform; it survives the request and is only rewritten by
            // the worker once the new desired state has been deployed.
            record.status = old_record.status.clone();
            record.created_at = old_record.created_at;
        }

        let now = Utc::now();
        record.provisioning_state = ProvisioningState::Accepted;
        record.modified_at = now;

        let precondition = match &old {
            Some((_, etag)) => WritePrecondition::EtagMatches(etag.clone()),
            None => WritePrecondition::MustCreate,
        };
        let new_etag = self.datastore.save(&record, precondition).await?;

        let operation_id = Uuid::new_v4();
        let request = OperationRequest {
            operation_id,
            resource_id: id.clone(),
            kind: OperationKind::Put,
            api_version: api_version.to_string(),
            timeout_secs: self.operation_timeout.as_secs(),
        };
        if let Err(error) = self.status.queue_async_operation(&request).await {
            self.rollback_resource_write(id, old.as_ref(), &new_etag).await;
            return Err(error);
        }

        info!(self.log, "accepted put operation";
            "resource_id" => %id,
            "operation_id" => %operation_id,
            "created" => old.is_none());
        Ok(AcceptedOperation {
            created: old.is_none(),
            body: Some(entry.converter.encode(&record, api_version)?),
            operation_id,
            status_path: self.status.status_id(id, &operation_id),
            result_path: self.status.result_id(id, &operation_id),
            retry_after_secs: self.retry_after_secs,
        })
    }

    /// Handles a PATCH: merges the request body over the stored wire form
    /// of an existing resource, then proceeds like a PUT.
    pub async fn patch(
        &self,
        id: &ResourceId,
        api_version: &str,
        body: serde_json::Value,
    ) -> Result<AcceptedOperation, Error> {
        let entry = self.registry.lookup(&qualified_type(id)?)?;
        let Some((old_record, _)) = self.datastore.get(id).await? else {
            return Err(not_found(id));
        };
        let mut merged = entry.converter.encode(&old_record, api_version)?;
        json_merge(&mut merged, body);
        let mut accepted = self.put(id, api_version, merged).await?;
        // The resource existed, so this can only be an update.
        accepted.created = false;
        Ok(accepted)
    }

    /// Handles a GET: a pure read of the stored record.
    pub async fn get(
        &self,
        id: &ResourceId,
        api_version: &str,
    ) -> Result<serde_json::Value, Error> {
        let entry = self.registry.lookup(&qualified_type(id)?)?;
        let Some((record, _)) = self.datastore.get(id).await? else {
            return Err(not_found(id));
        };
        entry.converter.encode(&record, api_version)
    }

    /// Handles a DELETE: marks the resource deleting and queues teardown.
    pub async fn delete(
        &self,
        id: &ResourceId,
        api_version: &str,
    ) -> Result<DeleteOutcome, Error> {
        // The registry lookup runs even though no body needs decoding, so
        // that deletes of unsupported types fail the same way puts do.
        self.registry.lookup(&qualified_type(id)?)?;
        let Some((old_record, old_etag)) = self.datastore.get(id).await?
        else {
            return Ok(DeleteOutcome::NoOp);
        };
        if !old_record.provisioning_state.is_terminal() {
            return Err(Error::conflict(format!(
                "resource {} has an operation in progress (state {})",
                id, old_record.provisioning_state
            )));
        }

        let mut record = old_record.clone();
        record.provisioning_state = ProvisioningState::Deleting;
        record.modified_at = Utc::now();
        let new_etag = self
            .datastore
            .save(&record, WritePrecondition::EtagMatches(old_etag.clone()))
            .await?;

        let operation_id = Uuid::new_v4();
        let request = OperationRequest {
            operation_id,
            resource_id: id.clone(),
            kind: OperationKind::Delete,
            api_version: api_version.to_string(),
            timeout_secs: self.operation_timeout.as_secs(),
        };
        if let Err(error) = self.status.queue_async_operation(&request).await {
            let old = Some((old_record, old_etag));
            self.rollback_resource_write(id, old.as_ref(), &new_etag).await;
            return Err(error);
        }

        info!(self.log, "accepted delete operation";
            "resource_id" => %id,
            "operation_id" => %operation_id);
        Ok(DeleteOutcome::Accepted(AcceptedOperation {
            created: false,
            body: None,
            operation_id,
            status_path: self.status.status_id(id, &operation_id),
            result_path: self.status.result_id(id, &operation_id),
            retry_after_secs: self.retry_after_secs,
        }))
    }

    /// Undoes the resource write made earlier in a request whose enqueue
    /// failed: restores the previous record, or removes the record the
    /// request created.  Best-effort; the conditional write means a
    /// concurrent legitimate writer is never clobbered.
    async fn rollback_resource_write(
        &self,
        id: &ResourceId,
        old: Option<&(ResourceRecord, String)>,
        new_etag: &str,
    ) {
        let precondition = WritePrecondition::EtagMatches(new_etag.to_string());
        let result = match old {
            Some((old_record, _)) => {
                self.datastore.save(old_record, precondition).await.map(|_| ())
            }
            None => self.datastore.delete(id, Some(precondition)).await,
        };
        if let Err(error) = result {
            warn!(self.log, "failed to roll back resource write";
                "resource_id" => %id,
                "error" => %error);
        }
    }
}

fn qualified_type(id: &ResourceId) -> Result<String, Error> {
    id.qualified_type().ok_or_else(|| {
        Error::invalid_request(format!(
            "{} does not name a provider resource",
            id
        ))
    })
}

fn not_found(id: &ResourceId) -> Error {
    let type_name =
        id.qualified_type().unwrap_or_else(|| "resource".to_string());
    Error::not_found(&type_name, id)
}

/// RFC 7396 JSON merge patch: objects merge recursively, `null` removes a
/// member, anything else replaces.
fn json_merge(base: &mut serde_json::Value, patch: serde_json::Value) {
    use serde_json::Value;
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                if value.is_null() {
                    base_map.remove(&key);
                } else {
                    json_merge(
                        base_map.entry(key).or_insert(Value::Null),
                        value,
                    );
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

#[cfg(test)]
mod test {
    use super::json_merge;
    use serde_json::json;

    #[test]
    fn test_json_merge() {
        let mut base = json!({
            "properties": {
                "a": 1,
                "b": {"x": true},
                "c": "keep"
            }
        });
        json_merge(
            &mut base,
            json!({
                "properties": {
                    "a": 2,
                    "b": null,
                    "d": ["new"]
                }
            }),
        );
        assert_eq!(
            base,
            json!({
                "properties": {
                    "a": 2,
                    "c": "keep",
                    "d": ["new"]
                }
            })
        );

        let mut base = json!({"scalar": 1});
        json_merge(&mut base, json!("replacement"));
        assert_eq!(base, json!("replacement"));
    }
}
