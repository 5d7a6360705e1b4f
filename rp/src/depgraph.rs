// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dependency ordering and orphan detection for output resources
//!
//! A render produces a flat list of output resources with declared
//! dependencies between them (by local id).  [`order`] computes a
//! deterministic creation order; teardown uses the same order reversed.
//! [`garbage_collect`] diffs two renders to find outputs that no longer
//! exist and must be deleted.

use std::collections::HashSet;
use terrane_common::output::OutputResource;

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum GraphError {
    #[error("output resource at position {position} has an empty local id")]
    EmptyLocalId { position: usize },
    #[error("duplicate output resource local id {local_id:?}")]
    DuplicateLocalId { local_id: String },
    #[error("output resource {local_id:?} depends on unknown resource {dependency:?}")]
    MissingDependency { local_id: String, dependency: String },
    #[error("dependency cycle among output resources: {remaining:?}")]
    Cycle { remaining: Vec<String> },
}

/// Orders output resources so that every resource appears after all of its
/// dependencies
///
/// The order is deterministic: among resources whose dependencies are all
/// satisfied, the one earliest in the input wins.  A cycle fails the whole
/// computation; no partial order is returned.
pub fn order(
    resources: &[OutputResource],
) -> Result<Vec<OutputResource>, GraphError> {
    let mut known = HashSet::new();
    for (position, resource) in resources.iter().enumerate() {
        if resource.local_id.is_empty() {
            return Err(GraphError::EmptyLocalId { position });
        }
        if !known.insert(resource.local_id.as_str()) {
            return Err(GraphError::DuplicateLocalId {
                local_id: resource.local_id.clone(),
            });
        }
    }
    for resource in resources {
        for dependency in &resource.dependencies {
            if dependency.is_empty() || !known.contains(dependency.as_str()) {
                return Err(GraphError::MissingDependency {
                    local_id: resource.local_id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }

    // Kahn's algorithm.  The candidate scan runs in input order, which is
    // what makes ties deterministic.  Renders are small, so the quadratic
    // scan is not a concern.
    let mut ordered: Vec<OutputResource> = Vec::with_capacity(resources.len());
    let mut emitted: HashSet<&str> = HashSet::new();
    while ordered.len() < resources.len() {
        let next = resources.iter().find(|resource| {
            !emitted.contains(resource.local_id.as_str())
                && resource
                    .dependencies
                    .iter()
                    .all(|dep| emitted.contains(dep.as_str()))
        });
        match next {
            Some(resource) => {
                emitted.insert(resource.local_id.as_str());
                ordered.push(resource.clone());
            }
            None => {
                let remaining = resources
                    .iter()
                    .filter(|r| !emitted.contains(r.local_id.as_str()))
                    .map(|r| r.local_id.clone())
                    .collect();
                return Err(GraphError::Cycle { remaining });
            }
        }
    }
    Ok(ordered)
}

/// Returns the outputs of the previous render (`before`) that are absent
/// from the current one (`after`) and are therefore orphans to delete
///
/// Matching is by normalized physical id only.  Local ids are never used
/// for cross-render identity, since a renderer may reassign them between
/// renders.  Outputs in `before` with no physical id were never created
/// and are skipped.
pub fn garbage_collect(
    after: &[OutputResource],
    before: &[OutputResource],
) -> Vec<OutputResource> {
    before
        .iter()
        .filter(|old| {
            let Some(old_id) = old.normalized_physical_id() else {
                return false;
            };
            !after
                .iter()
                .any(|new| new.normalized_physical_id() == Some(old_id.clone()))
        })
        .cloned()
        .collect()
}
