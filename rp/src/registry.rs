// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-resource-type registration
//!
//! The operation controller and the worker are a single non-generic engine.
//! Everything type-specific — decoding and encoding wire bodies, request
//! validation, rendering output resources, and talking to the platform —
//! hangs off a [`TypeEntry`] looked up here by qualified type tag.  The
//! table is built once at startup and never changes afterwards.

use crate::db::ResourceRecord;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use terrane_common::output::OutputResource;
use terrane_common::Error;
use terrane_common::ResourceId;

/// Translates between wire bodies and stored records for one resource type.
pub trait Converter: Send + Sync {
    /// Decodes a request body into a record.  Validation failures are
    /// client errors; nothing is stored.
    fn decode(
        &self,
        id: &ResourceId,
        api_version: &str,
        body: &serde_json::Value,
    ) -> Result<ResourceRecord, Error>;

    /// Encodes a stored record into the wire body for `api_version`.
    fn encode(
        &self,
        record: &ResourceRecord,
        api_version: &str,
    ) -> Result<serde_json::Value, Error>;
}

/// Inspects and adjusts an incoming record before it is accepted
///
/// Filters run in registration order.  A failure rejects the request
/// before any state changes.
#[async_trait]
pub trait UpdateFilter: Send + Sync {
    async fn filter(
        &self,
        new: &mut ResourceRecord,
        old: Option<&ResourceRecord>,
    ) -> Result<(), Error>;
}

/// One render of a logical resource.
#[derive(Clone, Debug, Default)]
pub struct RenderOutput {
    pub output_resources: Vec<OutputResource>,
    /// Compute binding surfaced on the record after deployment.
    pub compute: Option<serde_json::Value>,
}

/// Computes the output resources a record should map to on the platform.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, record: &ResourceRecord)
        -> Result<RenderOutput, Error>;
}

/// Creates and deletes individual output resources on the platform.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Creates one output resource and returns its physical id.
    /// `deployed` maps the local ids of already-created dependencies to
    /// their physical ids.
    async fn create(
        &self,
        record: &ResourceRecord,
        output: &OutputResource,
        deployed: &BTreeMap<String, String>,
    ) -> Result<String, Error>;

    /// Deletes one previously-created output resource.  Deleting an
    /// output that is already gone must succeed.
    async fn delete(&self, output: &OutputResource) -> Result<(), Error>;
}

/// Everything the engine needs to serve one resource type.
pub struct TypeEntry {
    pub resource_type: String,
    pub converter: Arc<dyn Converter>,
    pub update_filters: Vec<Arc<dyn UpdateFilter>>,
    pub renderer: Arc<dyn Renderer>,
    pub handler: Arc<dyn Handler>,
}

pub struct Registry {
    entries: HashMap<String, Arc<TypeEntry>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry { entries: HashMap::new() }
    }

    /// Registers a type entry.  Panics on duplicate registration since the
    /// table is assembled once at startup from static configuration.
    pub fn register(&mut self, entry: TypeEntry) {
        let key = entry.resource_type.to_lowercase();
        if self.entries.insert(key, Arc::new(entry)).is_some() {
            panic!("resource type registered twice");
        }
    }

    /// Looks up the entry for a qualified type tag, case-insensitively.
    pub fn lookup(&self, resource_type: &str) -> Result<Arc<TypeEntry>, Error> {
        self.entries.get(&resource_type.to_lowercase()).cloned().ok_or_else(
            || {
                Error::invalid_request(format!(
                    "unsupported resource type {:?}",
                    resource_type
                ))
            },
        )
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
