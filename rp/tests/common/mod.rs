// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared helpers for integration tests

use std::sync::Arc;
use std::time::Duration;
use terrane_common::provisioning::AsyncOperationStatus;
use terrane_rp::app::operation::AcceptedOperation;
use terrane_rp::config::Config;
use terrane_rp::config::RpConfig;
use terrane_rp::context::ServerContext;
use terrane_rp::db::InMemoryDatastore;
use terrane_rp::queue::InMemoryQueue;
use terrane_rp::worker::Worker;
use terrane_rp::worker::WorkerOptions;

pub const API_VERSION: &str = "2025-01-01";

pub fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

pub fn test_rp_config() -> RpConfig {
    RpConfig::default()
}

pub fn test_config() -> Config {
    let raw = r#"
        [dropshot]
        bind_address = "127.0.0.1:0"

        [log]
        mode = "stderr-terminal"
        level = "error"

        [rp]
        worker_poll_interval_ms = 10
    "#;
    toml::from_str(raw).unwrap()
}

/// The application assembled over in-memory storage, with the worker
/// driven explicitly through `poll_once` so tests are deterministic.
pub struct Harness {
    pub datastore: Arc<InMemoryDatastore>,
    pub queue: Arc<InMemoryQueue>,
    pub context: Arc<ServerContext>,
    pub worker: Worker,
}

impl Harness {
    pub fn new(config: RpConfig) -> Harness {
        let log = test_logger();
        let datastore = Arc::new(InMemoryDatastore::new());
        let queue = Arc::new(InMemoryQueue::new());
        let context = ServerContext::new(
            config,
            datastore.clone(),
            queue.clone(),
            log.clone(),
        );
        let worker = Worker::new(
            context.datastore.clone(),
            context.queue.clone(),
            context.registry.clone(),
            context.status.clone(),
            WorkerOptions {
                max_concurrent: 1,
                poll_interval: Duration::from_millis(10),
                max_dequeue_count: 3,
            },
            log,
        );
        Harness { datastore, queue, context, worker }
    }

    /// Processes queued operations until the queue drains.
    pub async fn run_worker_until_idle(&self) {
        while self.worker.poll_once().await.unwrap() {}
    }

    pub async fn operation_status(
        &self,
        accepted: &AcceptedOperation,
    ) -> AsyncOperationStatus {
        self.context.status.get(&accepted.status_path).await.unwrap()
    }
}

pub fn machine_id(name: &str) -> terrane_common::ResourceId {
    format!(
        "/planes/terrane/local/resourceGroups/rg1/providers/Terrane.Sim/\
         machines/{}",
        name
    )
    .parse()
    .unwrap()
}

/// A request body declaring one managed output per entry of `resources`,
/// each entry being `(localId, dependsOn)`.
pub fn machine_body(resources: &[(&str, &[&str])]) -> serde_json::Value {
    let declared: Vec<serde_json::Value> = resources
        .iter()
        .map(|(local_id, depends_on)| {
            serde_json::json!({
                "localId": local_id,
                "dependsOn": depends_on,
                "managed": true,
            })
        })
        .collect();
    serde_json::json!({ "properties": { "resources": declared } })
}
