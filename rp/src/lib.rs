// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Terrane resource provider
//!
//! A control-plane service that accepts declarative descriptions of
//! platform resources over HTTP and drives them to the desired state
//! asynchronously.  The pieces:
//!
//! 1. A Dropshot frontend ([`http_entrypoints`]) whose mutating endpoints
//!    answer immediately with polling headers.
//! 2. An application layer ([`app`]) that validates requests, writes
//!    resource and operation records, and queues work.
//! 3. A background [`worker`] that dequeues operations, renders them into
//!    output resources ([`depgraph`]), and applies them through per-type
//!    handlers ([`registry`]).
//!
//! The standalone server runs against in-memory storage and the simulated
//! platform in [`sim`]; real deployments supply their own [`db::Datastore`]
//! and [`queue::Queue`] implementations and register concrete types.

pub mod app;
pub mod config;
pub mod context;
pub mod credentials;
pub mod db;
pub mod depgraph;
pub mod http_entrypoints;
pub mod queue;
pub mod registry;
pub mod sim;
pub mod worker;

use anyhow::anyhow;
use config::Config;
use context::ServerContext;
use slog::info;
use slog::o;
use slog::Logger;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

/// A running resource-provider server: the HTTP frontend plus the
/// background worker and credential refresher.
pub struct Server {
    http_server: dropshot::HttpServer<Arc<ServerContext>>,
    context: Arc<ServerContext>,
    worker_shutdown: watch::Sender<bool>,
    worker_task: tokio::task::JoinHandle<()>,
}

impl Server {
    pub async fn start(
        config: &Config,
        log: Logger,
    ) -> Result<Server, anyhow::Error> {
        let datastore = Arc::new(db::InMemoryDatastore::new());
        let queue = Arc::new(queue::InMemoryQueue::new());
        Server::start_with(config, log, datastore, queue).await
    }

    /// Starts the server over caller-provided storage.  Tests use this to
    /// keep a handle on the concrete implementations.
    pub async fn start_with(
        config: &Config,
        log: Logger,
        datastore: Arc<dyn db::Datastore>,
        queue: Arc<dyn queue::Queue>,
    ) -> Result<Server, anyhow::Error> {
        let context = ServerContext::new(
            config.rp.clone(),
            datastore,
            queue,
            log.clone(),
        );

        context.credentials.start(&log).await;

        let worker = Arc::new(worker::Worker::new(
            context.datastore.clone(),
            context.queue.clone(),
            context.registry.clone(),
            context.status.clone(),
            worker::WorkerOptions {
                max_concurrent: config.rp.worker_max_concurrent,
                poll_interval: config.rp.worker_poll_interval(),
                max_dequeue_count: config.rp.worker_max_dequeue_count,
            },
            log.new(o!("component" => "worker")),
        ));
        let (worker_shutdown, shutdown_rx) = watch::channel(false);
        let worker_task = tokio::spawn(worker.run(shutdown_rx));

        let http_server = dropshot::ServerBuilder::new(
            http_entrypoints::api(),
            context.clone(),
            log.new(o!("component" => "http")),
        )
        .config(config.dropshot.clone())
        .start()
        .map_err(|error| anyhow!("setting up HTTP server: {:#}", error))?;

        info!(log, "resource provider started";
            "address" => %http_server.local_addr());
        Ok(Server { http_server, context, worker_shutdown, worker_task })
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.http_server.local_addr()
    }

    /// Runs until the HTTP server stops (e.g. on a signal).
    pub async fn wait_for_shutdown(self) -> Result<(), String> {
        self.http_server.await
    }

    /// Stops the worker, the credential refresher, and the HTTP server.
    pub async fn close(self) -> Result<(), anyhow::Error> {
        let _ = self.worker_shutdown.send(true);
        let _ = self.worker_task.await;
        self.context.credentials.stop().await;
        self.http_server.close().await.map_err(|error| {
            anyhow!("stopping HTTP server: {}", error)
        })
    }
}
