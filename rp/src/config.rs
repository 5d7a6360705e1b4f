// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Server configuration, loaded from a TOML file

use anyhow::Context;
use camino::Utf8Path;
use serde::Deserialize;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub dropshot: dropshot::ConfigDropshot,
    pub log: dropshot::ConfigLogging,
    #[serde(default)]
    pub rp: RpConfig,
}

/// Tunables of the resource provider itself.  Everything has a default so
/// that a config file carrying only `[dropshot]` and `[log]` works.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RpConfig {
    /// Location segment used in operation tracking ids.
    #[serde(default = "default_location")]
    pub location: String,
    /// Polling interval handed to clients in `Retry-After` headers.
    #[serde(default = "default_retry_after_secs")]
    pub retry_after_secs: u64,
    /// Deadline for one asynchronous operation.
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    #[serde(default = "default_worker_poll_interval_ms")]
    pub worker_poll_interval_ms: u64,
    #[serde(default = "default_worker_max_concurrent")]
    pub worker_max_concurrent: usize,
    /// Deliveries a queue message gets before its operation is failed.
    #[serde(default = "default_worker_max_dequeue_count")]
    pub worker_max_dequeue_count: u32,
    /// Interval between background credential refreshes.
    #[serde(default = "default_credential_refresh_secs")]
    pub credential_refresh_secs: u64,
}

fn default_location() -> String {
    "global".to_string()
}

fn default_retry_after_secs() -> u64 {
    terrane_common::provisioning::DEFAULT_RETRY_AFTER_SECS
}

fn default_operation_timeout_secs() -> u64 {
    terrane_common::provisioning::DEFAULT_OPERATION_TIMEOUT.as_secs()
}

fn default_worker_poll_interval_ms() -> u64 {
    250
}

fn default_worker_max_concurrent() -> usize {
    4
}

fn default_worker_max_dequeue_count() -> u32 {
    crate::worker::DEFAULT_MAX_DEQUEUE_COUNT
}

fn default_credential_refresh_secs() -> u64 {
    crate::credentials::DEFAULT_REFRESH_INTERVAL.as_secs()
}

impl Default for RpConfig {
    fn default() -> Self {
        RpConfig {
            location: default_location(),
            retry_after_secs: default_retry_after_secs(),
            operation_timeout_secs: default_operation_timeout_secs(),
            worker_poll_interval_ms: default_worker_poll_interval_ms(),
            worker_max_concurrent: default_worker_max_concurrent(),
            worker_max_dequeue_count: default_worker_max_dequeue_count(),
            credential_refresh_secs: default_credential_refresh_secs(),
        }
    }
}

impl RpConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn worker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms)
    }

    pub fn credential_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.credential_refresh_secs)
    }
}

impl Config {
    pub fn from_file(path: &Utf8Path) -> Result<Config, anyhow::Error> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {:?}", path))?;
        toml::from_str(&contents)
            .with_context(|| format!("parse config file {:?}", path))
    }
}

#[cfg(test)]
mod test {
    use super::Config;

    #[test]
    fn test_minimal_config() {
        let config: Config = toml::from_str(
            r#"
            [dropshot]
            bind_address = "127.0.0.1:0"

            [log]
            mode = "stderr-terminal"
            level = "info"
            "#,
        )
        .unwrap();
        assert_eq!(config.rp.location, "global");
        assert_eq!(config.rp.retry_after_secs, 60);
        assert_eq!(config.rp.operation_timeout_secs, 120);
    }

    #[test]
    fn test_overrides_and_unknown_fields() {
        let config: Config = toml::from_str(
            r#"
            [dropshot]
            bind_address = "127.0.0.1:0"

            [log]
            mode = "stderr-terminal"
            level = "info"

            [rp]
            location = "west"
            operation_timeout_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.rp.location, "west");
        assert_eq!(config.rp.operation_timeout_secs, 5);

        let err = toml::from_str::<Config>(
            r#"
            [dropshot]
            bind_address = "127.0.0.1:0"

            [log]
            mode = "stderr-terminal"
            level = "info"

            [rp]
            no_such_knob = true
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("no_such_knob"));
    }
}
