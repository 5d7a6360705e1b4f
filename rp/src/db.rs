// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Durable state for resources and operation statuses
//!
//! The server holds no cross-request locks.  All coordination between the
//! HTTP frontend and the background worker goes through conditional writes:
//! every read returns a version tag and every resource write names the tag
//! it expects, failing with a conflict when another writer got there first.
//!
//! The in-memory implementation here plays the role a durable store plays
//! in a real deployment.  Everything above it talks to the [`Datastore`]
//! trait only.

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use terrane_common::output::ResourceStatus;
use terrane_common::provisioning::AsyncOperationStatus;
use terrane_common::provisioning::ProvisioningState;
use terrane_common::Error;
use terrane_common::ResourceId;
use uuid::Uuid;

/// Opaque version tag assigned on every successful write.
pub type Etag = String;

/// Stored representation of one logical resource.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
    pub id: ResourceId,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub api_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<String>,
    pub provisioning_state: ProvisioningState,
    #[serde(default)]
    pub status: ResourceStatus,
    #[serde(default)]
    pub properties: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl ResourceRecord {
    /// Compares the environment and application scopes of two records.
    /// Scope identifiers are resource ids, so the comparison is
    /// case-insensitive; a scope absent from both sides matches.
    pub fn scopes_equal(&self, other: &ResourceRecord) -> bool {
        fn eq(a: &Option<String>, b: &Option<String>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                (None, None) => true,
                _ => false,
            }
        }
        eq(&self.environment, &other.environment)
            && eq(&self.application, &other.application)
    }
}

/// Condition attached to a resource write.
#[derive(Clone, Debug)]
pub enum WritePrecondition {
    /// The resource must not exist yet.
    MustCreate,
    /// The resource must exist with exactly this version tag.
    EtagMatches(Etag),
}

#[async_trait]
pub trait Datastore: Send + Sync {
    /// Fetches a resource record along with its current version tag.
    async fn get(
        &self,
        id: &ResourceId,
    ) -> Result<Option<(ResourceRecord, Etag)>, Error>;

    /// Writes a resource record, subject to `precondition`.  Returns the
    /// new version tag on success and [`Error::Conflict`] when the
    /// precondition does not hold.
    async fn save(
        &self,
        record: &ResourceRecord,
        precondition: WritePrecondition,
    ) -> Result<Etag, Error>;

    /// Deletes a resource record.  With `EtagMatches`, fails with a
    /// conflict if the record changed; deleting an absent record is an
    /// error only under `EtagMatches`.
    async fn delete(
        &self,
        id: &ResourceId,
        precondition: Option<WritePrecondition>,
    ) -> Result<(), Error>;

    /// Fetches an operation status record by its tracking id.
    async fn get_status(
        &self,
        id: &str,
    ) -> Result<Option<AsyncOperationStatus>, Error>;

    /// Writes an operation status record.  Statuses have a single writer
    /// (the worker that owns the operation), so no precondition applies.
    async fn save_status(
        &self,
        status: &AsyncOperationStatus,
    ) -> Result<(), Error>;

    /// Removes an operation status record, if present.
    async fn delete_status(&self, id: &str) -> Result<(), Error>;
}

/// In-memory [`Datastore`] used by the simulated deployment and by tests.
pub struct InMemoryDatastore {
    resources: Mutex<HashMap<String, (ResourceRecord, Etag)>>,
    statuses: Mutex<HashMap<String, AsyncOperationStatus>>,
}

impl InMemoryDatastore {
    pub fn new() -> InMemoryDatastore {
        InMemoryDatastore {
            resources: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
        }
    }

    fn resource_key(id: &ResourceId) -> String {
        id.to_string().to_lowercase()
    }

    fn status_key(id: &str) -> String {
        id.to_lowercase()
    }

    fn new_etag() -> Etag {
        Uuid::new_v4().simple().to_string()
    }
}

impl Default for InMemoryDatastore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Datastore for InMemoryDatastore {
    async fn get(
        &self,
        id: &ResourceId,
    ) -> Result<Option<(ResourceRecord, Etag)>, Error> {
        let resources = self.resources.lock().unwrap();
        Ok(resources.get(&Self::resource_key(id)).cloned())
    }

    async fn save(
        &self,
        record: &ResourceRecord,
        precondition: WritePrecondition,
    ) -> Result<Etag, Error> {
        let mut resources = self.resources.lock().unwrap();
        let key = Self::resource_key(&record.id);
        match (&precondition, resources.get(&key)) {
            (WritePrecondition::MustCreate, Some(_)) => {
                return Err(Error::conflict(format!(
                    "resource {} already exists",
                    record.id
                )));
            }
            (WritePrecondition::EtagMatches(_), None) => {
                return Err(Error::conflict(format!(
                    "resource {} no longer exists",
                    record.id
                )));
            }
            (WritePrecondition::EtagMatches(expected), Some((_, current)))
                if expected != current =>
            {
                return Err(Error::conflict(format!(
                    "resource {} was modified concurrently",
                    record.id
                )));
            }
            _ => (),
        }
        let etag = Self::new_etag();
        resources.insert(key, (record.clone(), etag.clone()));
        Ok(etag)
    }

    async fn delete(
        &self,
        id: &ResourceId,
        precondition: Option<WritePrecondition>,
    ) -> Result<(), Error> {
        let mut resources = self.resources.lock().unwrap();
        let key = Self::resource_key(id);
        match precondition {
            None => {
                resources.remove(&key);
                Ok(())
            }
            Some(WritePrecondition::MustCreate) => Err(Error::invalid_request(
                "cannot delete with a must-create precondition",
            )),
            Some(WritePrecondition::EtagMatches(expected)) => {
                match resources.get(&key) {
                    Some((_, current)) if *current == expected => {
                        resources.remove(&key);
                        Ok(())
                    }
                    Some(_) => Err(Error::conflict(format!(
                        "resource {} was modified concurrently",
                        id
                    ))),
                    None => Err(Error::conflict(format!(
                        "resource {} no longer exists",
                        id
                    ))),
                }
            }
        }
    }

    async fn get_status(
        &self,
        id: &str,
    ) -> Result<Option<AsyncOperationStatus>, Error> {
        let statuses = self.statuses.lock().unwrap();
        Ok(statuses.get(&Self::status_key(id)).cloned())
    }

    async fn save_status(
        &self,
        status: &AsyncOperationStatus,
    ) -> Result<(), Error> {
        let mut statuses = self.statuses.lock().unwrap();
        statuses.insert(Self::status_key(&status.id), status.clone());
        Ok(())
    }

    async fn delete_status(&self, id: &str) -> Result<(), Error> {
        let mut statuses = self.statuses.lock().unwrap();
        statuses.remove(&Self::status_key(id));
        Ok(())
    }
}
