// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cached platform credentials
//!
//! Platform handlers need a credential for every output-resource call, but
//! fetching one is comparatively expensive.  The cache refreshes on an
//! explicit interval in a background task and also refreshes inline when a
//! reader finds the cached value expired.  The inline path re-checks under
//! the write lock so that concurrent readers racing on an expired entry
//! produce a single fetch, not one each.

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;
use terrane_common::Error;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Default interval between background refreshes.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Clone, Debug, PartialEq)]
pub struct Credential {
    pub client_id: String,
    pub secret: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Source of fresh credentials (a token endpoint, an agent, ...).
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn fetch(&self) -> Result<Credential, Error>;
}

pub struct CredentialCache {
    provider: Arc<dyn CredentialProvider>,
    current: RwLock<Option<Credential>>,
    refresh_interval: Duration,
    task: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl CredentialCache {
    pub fn new(
        provider: Arc<dyn CredentialProvider>,
        refresh_interval: Duration,
    ) -> CredentialCache {
        CredentialCache {
            provider,
            current: RwLock::new(None),
            refresh_interval,
            task: Mutex::new(None),
        }
    }

    /// Returns a valid credential, fetching one if the cache is empty or
    /// the cached entry has expired.
    pub async fn get(&self) -> Result<Credential, Error> {
        {
            let current = self.current.read().await;
            if let Some(credential) = current.as_ref() {
                if !credential.is_expired(Utc::now()) {
                    return Ok(credential.clone());
                }
            }
        }

        let mut current = self.current.write().await;
        // Re-check: another writer may have refreshed while we waited for
        // the write lock.
        if let Some(credential) = current.as_ref() {
            if !credential.is_expired(Utc::now()) {
                return Ok(credential.clone());
            }
        }
        let credential = self.provider.fetch().await?;
        *current = Some(credential.clone());
        Ok(credential)
    }

    /// Starts the periodic background refresh.  Idempotent.
    pub async fn start(self: &Arc<Self>, log: &Logger) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let log = log.new(o!("component" => "credential-cache"));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let cache = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cache.refresh_interval);
            // The first tick fires immediately and primes the cache.
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match cache.provider.fetch().await {
                            Ok(credential) => {
                                let mut current =
                                    cache.current.write().await;
                                *current = Some(credential);
                            }
                            Err(error) => {
                                // Keep serving the previous credential
                                // until it actually expires.
                                warn!(log, "credential refresh failed";
                                    "error" => %error);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!(log, "credential refresh stopping");
                        return;
                    }
                }
            }
        });
        *task = Some((shutdown_tx, handle));
    }

    /// Stops the background refresh and waits for it to exit.
    pub async fn stop(&self) {
        let task = self.task.lock().await.take();
        if let Some((shutdown_tx, handle)) = task {
            let _ = shutdown_tx.send(true);
            let _ = handle.await;
        }
    }
}
