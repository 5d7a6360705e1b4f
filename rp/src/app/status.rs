// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tracking of asynchronous operation statuses
//!
//! Accepting an operation is a two-step write: the status record first,
//! then the queue message.  If the enqueue fails the status record is
//! removed again so that a client never polls an operation no worker will
//! ever pick up.

use crate::db::Datastore;
use crate::queue::Queue;
use chrono::Utc;
use slog::warn;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;
use terrane_common::error::ErrorDetails;
use terrane_common::provisioning::AsyncOperationStatus;
use terrane_common::provisioning::OperationRequest;
use terrane_common::provisioning::ProvisioningState;
use terrane_common::Error;
use terrane_common::ResourceId;
use uuid::Uuid;

/// Result of polling the `operationresults` endpoint.
#[derive(Debug, PartialEq)]
pub enum ResultPoll {
    /// The operation has not reached a terminal state yet; the client
    /// should poll again after `retry_after_secs`.
    InProgress { retry_after_secs: u64 },
    /// The operation finished (successfully or not).
    Complete,
}

pub struct StatusManager {
    datastore: Arc<dyn Datastore>,
    queue: Arc<dyn Queue>,
    location: String,
    retry_after_secs: u64,
    log: Logger,
}

impl StatusManager {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        queue: Arc<dyn Queue>,
        location: String,
        retry_after_secs: u64,
        log: Logger,
    ) -> StatusManager {
        StatusManager { datastore, queue, location, retry_after_secs, log }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// The id under which the status of `operation_id` on `resource_id`
    /// is tracked.
    pub fn status_id(
        &self,
        resource_id: &ResourceId,
        operation_id: &Uuid,
    ) -> String {
        resource_id.operation_status_id(&self.location, operation_id)
    }

    /// The id of the corresponding `operationresults` tracking resource.
    pub fn result_id(
        &self,
        resource_id: &ResourceId,
        operation_id: &Uuid,
    ) -> String {
        resource_id.operation_result_id(&self.location, operation_id)
    }

    /// Records a new operation as accepted and hands it to the worker.
    /// If the hand-off fails, the status record is rolled back and the
    /// error propagated; the caller then rolls back its own writes.
    pub async fn queue_async_operation(
        &self,
        request: &OperationRequest,
    ) -> Result<(), Error> {
        let status_id =
            self.status_id(&request.resource_id, &request.operation_id);
        let mut status = AsyncOperationStatus::new(
            status_id.clone(),
            request.operation_id,
            request.resource_id.clone(),
            Utc::now(),
        );
        status.retry_after_secs = Some(self.retry_after_secs);
        self.datastore.save_status(&status).await?;

        if let Err(error) =
            self.queue.enqueue(request, Duration::ZERO).await
        {
            if let Err(cleanup_error) =
                self.datastore.delete_status(&status_id).await
            {
                warn!(self.log, "failed to roll back operation status";
                    "status_id" => &status_id,
                    "error" => %cleanup_error);
            }
            return Err(error.internal_context("enqueuing operation"));
        }
        Ok(())
    }

    pub async fn get(
        &self,
        status_id: &str,
    ) -> Result<AsyncOperationStatus, Error> {
        self.datastore
            .get_status(status_id)
            .await?
            .ok_or_else(|| Error::not_found("operationStatuses", status_id))
    }

    /// Polls an operation on behalf of the `operationresults` endpoint.
    pub async fn get_result(
        &self,
        status_id: &str,
    ) -> Result<ResultPoll, Error> {
        let status = self.get(status_id).await?;
        if status.is_terminal() {
            Ok(ResultPoll::Complete)
        } else {
            Ok(ResultPoll::InProgress {
                retry_after_secs: status
                    .retry_after_secs
                    .unwrap_or(self.retry_after_secs),
            })
        }
    }

    /// Moves an operation to `state`, stamping the update time.  Only the
    /// worker that owns the operation calls this.
    pub async fn transition(
        &self,
        status_id: &str,
        state: ProvisioningState,
        error: Option<ErrorDetails>,
    ) -> Result<(), Error> {
        let mut status = self.get(status_id).await?;
        status.status = state;
        status.error = error;
        status.last_updated_time = Utc::now();
        self.datastore.save_status(&status).await
    }
}
