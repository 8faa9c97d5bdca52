//! Server configuration loading.
//!
//! Sources, lowest priority first:
//! 1. Built-in defaults from [`fleetmdm_core::config`]
//! 2. `config.toml` (or the path given on the command line)
//! 3. Environment variables (`FLEETMDM_*`)
//!
//! A missing file is not an error; a file that does not parse is.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use fleetmdm_commands::QueueConfig;
use fleetmdm_core::config::{bus, env_vars, queue, storage};
use fleetmdm_core::{BackpressurePolicy, Error, EventBusConfig, Result};

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

/// Top-level server configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub push: PushConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file, or `:memory:` for a throwaway store.
    #[serde(default = "default_db_path")]
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
    #[serde(default)]
    pub backpressure: BackpressurePolicy,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSection {
    /// Seconds before an unanswered in-flight command is offered again.
    #[serde(default = "default_redeliver_after_secs")]
    pub redeliver_after_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushConfig {
    /// Push topic used for devices that did not report one.
    #[serde(default)]
    pub topic: String,
}

fn default_db_path() -> String {
    storage::DEFAULT_DB_PATH.to_string()
}
fn default_subscriber_capacity() -> usize {
    bus::DEFAULT_SUBSCRIBER_CAPACITY
}
fn default_send_timeout_ms() -> u64 {
    bus::DEFAULT_SEND_TIMEOUT_MS
}
fn default_redeliver_after_secs() -> u64 {
    queue::DEFAULT_REDELIVER_AFTER_SECS
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: default_subscriber_capacity(),
            backpressure: BackpressurePolicy::default(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            redeliver_after_secs: default_redeliver_after_secs(),
        }
    }
}

impl ServerConfig {
    /// Load `path`, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                info!(category = "config", "Loading config from: {}", path.display());
                Self::from_toml(&content)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    category = "config",
                    "No config file at {}, using defaults",
                    path.display()
                );
                Self::default()
            }
            Err(e) => {
                return Err(Error::config(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::config(format!("invalid config: {}", e)))
    }

    /// Apply `FLEETMDM_*` overrides read through `var`.
    ///
    /// Values that do not parse are logged and ignored.
    pub fn apply_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(name: &str, value: Option<String>) -> Option<T> {
            let value = value?;
            match value.trim().parse() {
                Ok(parsed) => Some(parsed),
                Err(_) => {
                    warn!(
                        category = "config",
                        var = name,
                        value = %value,
                        "Ignoring invalid override"
                    );
                    None
                }
            }
        }

        if let Some(path) = var(env_vars::DB_PATH) {
            self.storage.path = path;
        }
        if let Some(capacity) = parse(
            env_vars::BUS_SUBSCRIBER_CAPACITY,
            var(env_vars::BUS_SUBSCRIBER_CAPACITY),
        ) {
            self.bus.subscriber_capacity = capacity;
        }
        if let Some(policy) = parse(env_vars::BUS_BACKPRESSURE, var(env_vars::BUS_BACKPRESSURE)) {
            self.bus.backpressure = policy;
        }
        if let Some(ms) = parse(env_vars::BUS_SEND_TIMEOUT_MS, var(env_vars::BUS_SEND_TIMEOUT_MS)) {
            self.bus.send_timeout_ms = ms;
        }
        if let Some(secs) = parse(
            env_vars::QUEUE_REDELIVER_AFTER_SECS,
            var(env_vars::QUEUE_REDELIVER_AFTER_SECS),
        ) {
            self.queue.redeliver_after_secs = secs;
        }
        if let Some(topic) = var(env_vars::PUSH_TOPIC) {
            self.push.topic = topic;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.path.trim().is_empty() {
            return Err(Error::config("storage.path is empty"));
        }
        if self.bus.subscriber_capacity == 0 {
            return Err(Error::config("bus.subscriber_capacity must be at least 1"));
        }
        Ok(())
    }

    pub fn bus_config(&self) -> EventBusConfig {
        EventBusConfig {
            subscriber_capacity: self.bus.subscriber_capacity,
            policy: self.bus.backpressure,
            send_timeout: Duration::from_millis(self.bus.send_timeout_ms),
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            redeliver_after: Duration::from_secs(self.queue.redeliver_after_secs),
        }
    }

    /// Configuration for tests and one-off tools: in-memory store, defaults
    /// elsewhere.
    pub fn in_memory() -> Self {
        Self {
            storage: StorageConfig {
                path: fleetmdm_storage::MEMORY_PATH.to_string(),
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = ServerConfig::from_toml("").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.storage.path, storage::DEFAULT_DB_PATH);
        assert_eq!(config.bus_config(), EventBusConfig::default());
        assert_eq!(config.queue_config(), QueueConfig::default());
    }

    #[test]
    fn test_partial_sections() {
        let config = ServerConfig::from_toml(
            r#"
            [bus]
            backpressure = "reject"

            [queue]
            redeliver_after_secs = 30

            [push]
            topic = "com.apple.mgmt.example"
            "#,
        )
        .unwrap();

        assert_eq!(config.bus.backpressure, BackpressurePolicy::Reject);
        assert_eq!(config.bus.subscriber_capacity, bus::DEFAULT_SUBSCRIBER_CAPACITY);
        assert_eq!(config.queue_config().redeliver_after, Duration::from_secs(30));
        assert_eq!(config.push.topic, "com.apple.mgmt.example");
        assert_eq!(config.storage.path, storage::DEFAULT_DB_PATH);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        assert!(matches!(
            ServerConfig::from_toml("[bus]\nbackpressure = \"drop\""),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_overrides_win_over_file() {
        let mut config = ServerConfig::from_toml("[storage]\npath = \"from-file.redb\"").unwrap();
        let env: HashMap<&str, &str> = HashMap::from([
            (env_vars::DB_PATH, ":memory:"),
            (env_vars::BUS_SUBSCRIBER_CAPACITY, "16"),
            (env_vars::BUS_BACKPRESSURE, "Reject"),
            (env_vars::BUS_SEND_TIMEOUT_MS, "not-a-number"),
            (env_vars::PUSH_TOPIC, "com.apple.mgmt.env"),
        ]);
        config.apply_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.storage.path, ":memory:");
        assert_eq!(config.bus.subscriber_capacity, 16);
        assert_eq!(config.bus.backpressure, BackpressurePolicy::Reject);
        assert_eq!(config.bus.send_timeout_ms, bus::DEFAULT_SEND_TIMEOUT_MS);
        assert_eq!(config.push.topic, "com.apple.mgmt.env");
    }

    #[test]
    fn test_validate() {
        let mut config = ServerConfig::in_memory();
        assert!(config.validate().is_ok());
        config.bus.subscriber_capacity = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.queue, QueueSection::default());
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[bus]\nsubscriber_capacity = 8\n").unwrap();
        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.bus.subscriber_capacity, 8);
    }
}
