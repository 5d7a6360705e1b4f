// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisioning-state model for asynchronously-managed resources
//!
//! Every resource record and every tracked operation carries a
//! [`ProvisioningState`].  The state is set to a non-terminal value when a
//! request is accepted, and only the background worker that owns the
//! operation moves it to a terminal one.

use crate::error::ErrorDetails;
use crate::resource_id::ResourceId;
use chrono::DateTime;
use chrono::Utc;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// How long an asynchronous operation may run before the worker marks it
/// failed, unless the request specifies otherwise.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Polling interval suggested to clients via the `Retry-After` header.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Lifecycle state of a resource or of an asynchronous operation
///
/// `Succeeded`, `Failed`, and `Canceled` are terminal: once recorded, the
/// operation is finished and its state never changes again.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
pub enum ProvisioningState {
    Accepted,
    Updating,
    Deleting,
    Succeeded,
    Failed,
    Canceled,
}

impl ProvisioningState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProvisioningState::Succeeded
                | ProvisioningState::Failed
                | ProvisioningState::Canceled
        )
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProvisioningState::Accepted => "Accepted",
            ProvisioningState::Updating => "Updating",
            ProvisioningState::Deleting => "Deleting",
            ProvisioningState::Succeeded => "Succeeded",
            ProvisioningState::Failed => "Failed",
            ProvisioningState::Canceled => "Canceled",
        };
        f.write_str(s)
    }
}

/// The kind of mutation an asynchronous operation performs.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationKind {
    Put,
    Delete,
}

/// Durable record tracking one asynchronous operation
///
/// The record is created when a request is accepted and becomes the body
/// of the `operationstatuses` polling endpoint.  The `id` field is the
/// identifier under which clients poll it, derived with
/// [`ResourceId::operation_status_id`].
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncOperationStatus {
    pub id: String,
    pub operation_id: Uuid,
    pub resource_id: ResourceId,
    pub status: ProvisioningState,
    pub start_time: DateTime<Utc>,
    pub last_updated_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

impl AsyncOperationStatus {
    pub fn new(
        id: String,
        operation_id: Uuid,
        resource_id: ResourceId,
        now: DateTime<Utc>,
    ) -> AsyncOperationStatus {
        AsyncOperationStatus {
            id,
            operation_id,
            resource_id,
            status: ProvisioningState::Accepted,
            start_time: now,
            last_updated_time: now,
            retry_after_secs: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Message placed on the work queue when an operation is accepted
///
/// Delivery is at-least-once.  The worker tolerates duplicates by treating
/// operations whose status record is already terminal as no-ops.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRequest {
    pub operation_id: Uuid,
    pub resource_id: ResourceId,
    pub kind: OperationKind,
    pub api_version: String,
    /// Deadline for the whole operation, in seconds from dequeue.
    pub timeout_secs: u64,
}

impl OperationRequest {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod test {
    use super::AsyncOperationStatus;
    use super::ProvisioningState;

    #[test]
    fn test_terminal_states() {
        use ProvisioningState::*;
        for (state, terminal) in [
            (Accepted, false),
            (Updating, false),
            (Deleting, false),
            (Succeeded, true),
            (Failed, true),
            (Canceled, true),
        ] {
            assert_eq!(state.is_terminal(), terminal, "{}", state);
        }
    }

    #[test]
    fn test_status_wire_format() {
        let resource_id = "/planes/terrane/local/resourceGroups/rg1/\
             providers/Terrane.Core/containers/frontend"
            .parse()
            .unwrap();
        let operation_id = uuid::Uuid::new_v4();
        let now = chrono::Utc::now();
        let status = AsyncOperationStatus::new(
            String::from("/planes/terrane/local/providers/Terrane.Core/\
                locations/global/operationstatuses/op"),
            operation_id,
            resource_id,
            now,
        );

        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["status"], "Accepted");
        assert!(value.get("startTime").is_some());
        assert!(value.get("lastUpdatedTime").is_some());
        // Absent optional fields are omitted, not serialized as null.
        assert!(value.get("error").is_none());
        assert!(value.get("retryAfterSecs").is_none());
    }
}
