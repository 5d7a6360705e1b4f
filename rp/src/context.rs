// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared state for API request handlers and the worker

use crate::app::operation::OperationController;
use crate::app::status::StatusManager;
use crate::config::RpConfig;
use crate::credentials::CredentialCache;
use crate::db::Datastore;
use crate::queue::Queue;
use crate::registry::Registry;
use crate::sim;
use crate::sim::SimHandler;
use slog::o;
use slog::Logger;
use std::sync::Arc;

pub struct ServerContext {
    pub config: RpConfig,
    pub datastore: Arc<dyn Datastore>,
    pub queue: Arc<dyn Queue>,
    pub registry: Arc<Registry>,
    pub status: Arc<StatusManager>,
    pub controller: OperationController,
    pub credentials: Arc<CredentialCache>,
    /// Kept for inspection of platform activity; the registry holds the
    /// same handler for actual deployment calls.
    pub sim_handler: Arc<SimHandler>,
    pub log: Logger,
}

impl ServerContext {
    pub fn new(
        config: RpConfig,
        datastore: Arc<dyn Datastore>,
        queue: Arc<dyn Queue>,
        log: Logger,
    ) -> Arc<ServerContext> {
        let credentials = Arc::new(CredentialCache::new(
            Arc::new(sim::SimCredentialProvider),
            config.credential_refresh_interval(),
        ));
        let (registry, sim_handler) = sim::sim_registry(credentials.clone());
        let registry = Arc::new(registry);

        let status = Arc::new(StatusManager::new(
            datastore.clone(),
            queue.clone(),
            config.location.clone(),
            config.retry_after_secs,
            log.new(o!("component" => "status-manager")),
        ));
        let controller = OperationController::new(
            datastore.clone(),
            status.clone(),
            registry.clone(),
            config.operation_timeout(),
            config.retry_after_secs,
            log.new(o!("component" => "operation-controller")),
        );

        Arc::new(ServerContext {
            config,
            datastore,
            queue,
            registry,
            status,
            controller,
            credentials,
            sim_handler,
            log,
        })
    }
}
