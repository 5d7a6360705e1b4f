// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deployment processor: drives one resource to its desired state
//!
//! A deployment renders the record into output resources, creates them in
//! dependency order, then garbage-collects outputs of the previous render
//! that the new one no longer produces.  Garbage collection completes
//! before the operation is reported terminal.
//!
//! The operation deadline is checked cooperatively before each
//! output-resource step.  On timeout (or any mid-deployment failure) the
//! outputs created so far are recorded on the resource, not deleted: the
//! next render matches them by physical id and reconciles.

use crate::db::ResourceRecord;
use crate::depgraph;
use crate::depgraph::GraphError;
use crate::registry::TypeEntry;
use slog::debug;
use slog::info;
use slog::Logger;
use std::collections::BTreeMap;
use std::time::Duration;
use std::time::Instant;
use terrane_common::error::ErrorDetails;
use terrane_common::error::CODE_DEPENDENCY_CYCLE;
use terrane_common::error::CODE_INTERNAL;
use terrane_common::error::CODE_OPERATION_TIMED_OUT;
use terrane_common::output::OutputResource;
use terrane_common::Error;

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("operation exceeded its {}s deadline", .timeout.as_secs())]
    TimedOut { timeout: Duration },
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Platform(#[from] Error),
}

impl DeployError {
    /// The `{code, message}` detail recorded on the failed operation.
    pub fn details(&self) -> ErrorDetails {
        match self {
            DeployError::TimedOut { .. } => {
                ErrorDetails::new(CODE_OPERATION_TIMED_OUT, self)
            }
            DeployError::Graph(GraphError::Cycle { .. }) => {
                ErrorDetails::new(CODE_DEPENDENCY_CYCLE, self)
            }
            DeployError::Graph(_) => ErrorDetails::new(CODE_INTERNAL, self),
            DeployError::Platform(error) => ErrorDetails::from(error),
        }
    }
}

pub struct DeploymentProcessor {
    log: Logger,
}

impl DeploymentProcessor {
    pub fn new(log: Logger) -> DeploymentProcessor {
        DeploymentProcessor { log }
    }

    /// Renders and deploys `record`, updating its deployment status in
    /// place.  On failure the record keeps whatever progress was made so
    /// that a later render can reconcile it.
    pub async fn deploy(
        &self,
        entry: &TypeEntry,
        record: &mut ResourceRecord,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<(), DeployError> {
        let render = entry.renderer.render(record).await?;
        let ordered = depgraph::order(&render.output_resources)?;
        let previous = record.status.output_resources.clone();

        let mut deployed: BTreeMap<String, String> = BTreeMap::new();
        let mut created: Vec<OutputResource> = Vec::new();
        for output in ordered {
            if Instant::now() >= deadline {
                record.status.output_resources =
                    merge_partial(&previous, created);
                return Err(DeployError::TimedOut { timeout });
            }
            let physical_id = match entry
                .handler
                .create(record, &output, &deployed)
                .await
            {
                Ok(physical_id) => physical_id,
                Err(error) => {
                    record.status.output_resources =
                        merge_partial(&previous, created);
                    return Err(DeployError::Platform(error));
                }
            };
            debug!(self.log, "created output resource";
                "resource_id" => %record.id,
                "local_id" => &output.local_id,
                "physical_id" => &physical_id);
            deployed.insert(output.local_id.clone(), physical_id.clone());
            created.push(OutputResource {
                id: Some(physical_id),
                ..output
            });
        }

        let orphans = depgraph::garbage_collect(&created, &previous);
        if !orphans.is_empty() {
            self.delete_outputs(entry, &previous, &orphans).await?;
            info!(self.log, "garbage-collected orphaned outputs";
                "resource_id" => %record.id,
                "count" => orphans.len());
        }

        record.status.output_resources = created;
        record.status.compute = render.compute;
        Ok(())
    }

    /// Tears down the managed outputs of `record`, newest dependency
    /// first.  Used for delete operations.
    pub async fn teardown(
        &self,
        entry: &TypeEntry,
        record: &ResourceRecord,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<(), DeployError> {
        let outputs = &record.status.output_resources;
        for output in reverse_order(outputs).iter().filter(|o| o.managed) {
            if Instant::now() >= deadline {
                return Err(DeployError::TimedOut { timeout });
            }
            entry.handler.delete(output).await?;
            debug!(self.log, "deleted output resource";
                "resource_id" => %record.id,
                "local_id" => &output.local_id);
        }
        Ok(())
    }

    async fn delete_outputs(
        &self,
        entry: &TypeEntry,
        previous: &[OutputResource],
        orphans: &[OutputResource],
    ) -> Result<(), DeployError> {
        // Delete in reverse dependency order of the render the orphans
        // came from, so dependents go before their dependencies.
        let ordered = reverse_order(previous);
        for output in ordered.iter().filter(|o| {
            o.managed
                && orphans.iter().any(|orphan| {
                    orphan.normalized_physical_id()
                        == o.normalized_physical_id()
                })
        }) {
            entry.handler.delete(output).await.map_err(DeployError::Platform)?;
        }
        Ok(())
    }
}

/// Reversed dependency order of `outputs`.  Stored outputs came from an
/// already-validated render, but if ordering fails anyway (e.g. records
/// written by an older version), fall back to reversed input order rather
/// than refusing to tear down.
fn reverse_order(outputs: &[OutputResource]) -> Vec<OutputResource> {
    let mut ordered = depgraph::order(outputs)
        .unwrap_or_else(|_| outputs.to_vec());
    ordered.reverse();
    ordered
}

fn merge_partial(
    previous: &[OutputResource],
    created: Vec<OutputResource>,
) -> Vec<OutputResource> {
    let mut merged = previous.to_vec();
    for output in created {
        let exists = merged.iter().any(|o| {
            o.normalized_physical_id() == output.normalized_physical_id()
        });
        if !exists {
            merged.push(output);
        }
    }
    merged
}
