// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background worker: executes queued operations
//!
//! A dequeued operation is owned exclusively by this worker until its
//! lease expires, so status updates need no coordination.  Delivery is
//! at-least-once: a message for an operation whose status is already
//! terminal is finished without work, and a message that keeps coming
//! back is written off as failed once it exceeds the retry budget.

use crate::app::deploy::DeploymentProcessor;
use crate::app::status::StatusManager;
use crate::db::Datastore;
use crate::db::WritePrecondition;
use crate::queue::Queue;
use crate::queue::QueueMessage;
use crate::registry::Registry;
use crate::registry::TypeEntry;
use chrono::Utc;
use slog::debug;
use slog::error;
use slog::info;
use slog::warn;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use terrane_common::error::ErrorDetails;
use terrane_common::error::CODE_INTERNAL;
use terrane_common::provisioning::DEFAULT_OPERATION_TIMEOUT;
use terrane_common::provisioning::OperationKind;
use terrane_common::provisioning::OperationRequest;
use terrane_common::provisioning::ProvisioningState;
use terrane_common::Error;
use terrane_common::ResourceId;
use tokio::sync::watch;
use tokio::sync::Semaphore;

/// How many deliveries a message gets before the operation is failed.
pub const DEFAULT_MAX_DEQUEUE_COUNT: u32 = 3;

/// Extra lease time beyond the operation timeout, covering bookkeeping
/// around the deployment itself.
const LEASE_SLACK: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct WorkerOptions {
    /// Maximum operations processed concurrently.
    pub max_concurrent: usize,
    /// Idle sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    pub max_dequeue_count: u32,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        WorkerOptions {
            max_concurrent: 4,
            poll_interval: Duration::from_millis(250),
            max_dequeue_count: DEFAULT_MAX_DEQUEUE_COUNT,
        }
    }
}

pub struct Worker {
    datastore: Arc<dyn Datastore>,
    queue: Arc<dyn Queue>,
    registry: Arc<Registry>,
    status: Arc<StatusManager>,
    processor: DeploymentProcessor,
    options: WorkerOptions,
    log: Logger,
}

impl Worker {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        queue: Arc<dyn Queue>,
        registry: Arc<Registry>,
        status: Arc<StatusManager>,
        options: WorkerOptions,
        log: Logger,
    ) -> Worker {
        let processor = DeploymentProcessor::new(log.clone());
        Worker { datastore, queue, registry, status, processor, options, log }
    }

    /// Runs the dequeue loop until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(self.log, "worker starting";
            "max_concurrent" => self.options.max_concurrent);
        let semaphore =
            Arc::new(Semaphore::new(self.options.max_concurrent));
        loop {
            if *shutdown.borrow() {
                break;
            }
            // Holding a permit while dequeuing bounds in-flight work.
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => {
                    // The semaphore is never closed.
                    permit.unwrap()
                }
                _ = shutdown.changed() => break,
            };

            match self.queue.dequeue(self.lease()).await {
                Ok(Some(message)) => {
                    let worker = Arc::clone(&self);
                    tokio::spawn(async move {
                        worker.process(message).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(self.options.poll_interval) => (),
                        _ = shutdown.changed() => break,
                    }
                }
                Err(dequeue_error) => {
                    drop(permit);
                    error!(self.log, "dequeue failed";
                        "error" => %dequeue_error);
                    tokio::select! {
                        _ = tokio::time::sleep(self.options.poll_interval) => (),
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        info!(self.log, "worker stopped");
    }

    /// Processes at most one queued operation.  Returns whether a message
    /// was available.  This is the deterministic entry point used by
    /// tests; the server runs [`Worker::run`] instead.
    pub async fn poll_once(&self) -> Result<bool, Error> {
        match self.queue.dequeue(self.lease()).await? {
            Some(message) => {
                self.process(message).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn lease(&self) -> Duration {
        // Leases must outlive the operations they cover; the per-message
        // extension below adjusts to the actual operation timeout.
        DEFAULT_OPERATION_TIMEOUT + LEASE_SLACK
    }

    async fn process(&self, message: QueueMessage) {
        let request = &message.request;
        let status_id = self
            .status
            .status_id(&request.resource_id, &request.operation_id);
        let log = self.log.new(slog::o!(
            "operation_id" => request.operation_id.to_string(),
            "resource_id" => request.resource_id.to_string(),
        ));

        let status = match self.datastore.get_status(&status_id).await {
            Ok(Some(status)) => status,
            Ok(None) => {
                // A message with no status record is unprocessable;
                // retrying cannot help.
                warn!(log, "dropping operation with no status record");
                self.finish(&message, &log).await;
                return;
            }
            Err(get_error) => {
                // Leave the message leased; it will be redelivered.
                warn!(log, "failed to load operation status";
                    "error" => %get_error);
                return;
            }
        };

        if status.is_terminal() {
            debug!(log, "duplicate delivery of finished operation");
            self.finish(&message, &log).await;
            return;
        }

        if message.dequeue_count > self.options.max_dequeue_count {
            warn!(log, "operation exceeded its retry budget";
                "dequeue_count" => message.dequeue_count);
            let details = ErrorDetails::new(
                CODE_INTERNAL,
                format!(
                    "operation was retried {} times without completing",
                    message.dequeue_count - 1
                ),
            );
            self.fail(&status_id, request, details, &log).await;
            self.finish(&message, &log).await;
            return;
        }

        if let Err(extend_error) =
            self.queue.extend(&message, request.timeout() + LEASE_SLACK).await
        {
            warn!(log, "failed to extend message lease";
                "error" => %extend_error);
            return;
        }

        let in_flight = match request.kind {
            OperationKind::Put => ProvisioningState::Updating,
            OperationKind::Delete => ProvisioningState::Deleting,
        };
        if let Err(transition_error) = self
            .status
            .transition(&status_id, in_flight, None)
            .await
            .and(self.set_resource_state(request, in_flight).await)
        {
            warn!(log, "failed to mark operation in flight";
                "error" => %transition_error);
            return;
        }

        let deadline = Instant::now() + request.timeout();
        let outcome = match request.kind {
            OperationKind::Put => {
                self.execute_put(request, deadline, &log).await
            }
            OperationKind::Delete => {
                self.execute_delete(request, deadline, &log).await
            }
        };

        match outcome {
            Ok(()) => {
                if let Err(transition_error) = self
                    .status
                    .transition(&status_id, ProvisioningState::Succeeded, None)
                    .await
                {
                    warn!(log, "failed to record operation success";
                        "error" => %transition_error);
                    return;
                }
                info!(log, "operation succeeded");
            }
            Err(details) => {
                info!(log, "operation failed";
                    "code" => &details.code,
                    "message" => &details.message);
                self.fail(&status_id, request, details, &log).await;
            }
        }
        self.finish(&message, &log).await;
    }

    async fn execute_put(
        &self,
        request: &OperationRequest,
        deadline: Instant,
        log: &Logger,
    ) -> Result<(), ErrorDetails> {
        let entry = self
            .lookup_entry(&request.resource_id)
            .map_err(|e| ErrorDetails::from(&e))?;
        let (mut record, etag) = self
            .datastore
            .get(&request.resource_id)
            .await
            .map_err(|e| ErrorDetails::from(&e))?
            .ok_or_else(|| {
                ErrorDetails::new(CODE_INTERNAL, "resource record disappeared")
            })?;

        let result = self
            .processor
            .deploy(&entry, &mut record, deadline, request.timeout())
            .await;

        let (state, outcome) = match result {
            Ok(()) => (ProvisioningState::Succeeded, Ok(())),
            Err(deploy_error) => {
                (ProvisioningState::Failed, Err(deploy_error.details()))
            }
        };
        record.provisioning_state = state;
        record.modified_at = Utc::now();
        if let Err(save_error) = self
            .datastore
            .save(&record, WritePrecondition::EtagMatches(etag))
            .await
        {
            warn!(log, "failed to save deployed record";
                "error" => %save_error);
            return Err(ErrorDetails::from(&save_error));
        }
        outcome
    }

    async fn execute_delete(
        &self,
        request: &OperationRequest,
        deadline: Instant,
        log: &Logger,
    ) -> Result<(), ErrorDetails> {
        let entry = self
            .lookup_entry(&request.resource_id)
            .map_err(|e| ErrorDetails::from(&e))?;
        let Some((record, _)) = self
            .datastore
            .get(&request.resource_id)
            .await
            .map_err(|e| ErrorDetails::from(&e))?
        else {
            // Someone else already removed it; the goal state holds.
            debug!(log, "resource already deleted");
            return Ok(());
        };

        self.processor
            .teardown(&entry, &record, deadline, request.timeout())
            .await
            .map_err(|deploy_error| deploy_error.details())?;

        self.datastore
            .delete(&request.resource_id, None)
            .await
            .map_err(|e| ErrorDetails::from(&e))
    }

    fn lookup_entry(
        &self,
        id: &ResourceId,
    ) -> Result<Arc<TypeEntry>, Error> {
        let resource_type = id.qualified_type().ok_or_else(|| {
            Error::internal_error("queued resource id has no type")
        })?;
        self.registry.lookup(&resource_type)
    }

    /// Records a failed operation on both the status record and, when the
    /// resource still exists, the resource itself.
    async fn fail(
        &self,
        status_id: &str,
        request: &OperationRequest,
        details: ErrorDetails,
        log: &Logger,
    ) {
        if let Err(transition_error) = self
            .status
            .transition(status_id, ProvisioningState::Failed, Some(details))
            .await
        {
            warn!(log, "failed to record operation failure";
                "error" => %transition_error);
        }
        if let Err(state_error) =
            self.set_resource_state(request, ProvisioningState::Failed).await
        {
            warn!(log, "failed to mark resource failed";
                "error" => %state_error);
        }
    }

    /// Sets the provisioning state on the resource record, skipping the
    /// write if the record is gone or already in that state.
    async fn set_resource_state(
        &self,
        request: &OperationRequest,
        state: ProvisioningState,
    ) -> Result<(), Error> {
        let Some((mut record, etag)) =
            self.datastore.get(&request.resource_id).await?
        else {
            return Ok(());
        };
        if record.provisioning_state == state {
            return Ok(());
        }
        record.provisioning_state = state;
        record.modified_at = Utc::now();
        self.datastore
            .save(&record, WritePrecondition::EtagMatches(etag))
            .await?;
        Ok(())
    }

    async fn finish(&self, message: &QueueMessage, log: &Logger) {
        if let Err(finish_error) = self.queue.finish(message).await {
            warn!(log, "failed to finish queue message";
                "error" => %finish_error);
        }
    }
}
