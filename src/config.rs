//! Configuration loading.
//!
//! Timeouts for the router, bridge and client. Values are read from an
//! optional JSON file named by `KVGATE_CONFIG`, then individual fields can
//! be overridden with `KVGATE_*` environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::constants;

/// Environment variable naming a JSON config file.
pub const CONFIG_PATH_ENV: &str = "KVGATE_CONFIG";

/// Timeouts shared by routers, bridges and clients.
///
/// All durations are stored in milliseconds so the file format stays flat.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Deadline for the hello exchange when connecting a router.
    pub handshake_timeout_ms: u64,
    /// Pause between two successful liveness probes.
    pub probe_interval_ms: u64,
    /// Deadline for a single liveness probe.
    pub probe_timeout_ms: u64,
    /// Deadline for a call forwarded by the bridge.
    pub proxy_timeout_ms: u64,
    /// Default deadline for typed client calls.
    pub request_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: duration_ms(constants::HANDSHAKE_TIMEOUT),
            probe_interval_ms: duration_ms(constants::PROBE_INTERVAL),
            probe_timeout_ms: duration_ms(constants::PROBE_TIMEOUT),
            proxy_timeout_ms: duration_ms(constants::PROXY_TIMEOUT),
            request_timeout_ms: duration_ms(constants::REQUEST_TIMEOUT),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Loads configuration from `$KVGATE_CONFIG` (if set), with environment
    /// variable overrides applied on top.
    ///
    /// A missing `KVGATE_CONFIG` is not an error; an unreadable or invalid
    /// file named by it is.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load_from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Reads a JSON config file. Missing fields keep their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Applies `KVGATE_*` overrides using `lookup` to resolve variables.
    ///
    /// Unparseable values are ignored and the previous value is kept.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let fields: [(&str, &mut u64); 5] = [
            ("KVGATE_HANDSHAKE_TIMEOUT_MS", &mut self.handshake_timeout_ms),
            ("KVGATE_PROBE_INTERVAL_MS", &mut self.probe_interval_ms),
            ("KVGATE_PROBE_TIMEOUT_MS", &mut self.probe_timeout_ms),
            ("KVGATE_PROXY_TIMEOUT_MS", &mut self.proxy_timeout_ms),
            ("KVGATE_REQUEST_TIMEOUT_MS", &mut self.request_timeout_ms),
        ];

        for (name, field) in fields {
            let Some(raw) = lookup(name) else {
                continue;
            };
            match raw.trim().parse::<u64>() {
                Ok(value) => *field = value,
                Err(e) => log::warn!("[Config] Ignoring {name}={raw:?}: {e}"),
            }
        }
    }

    /// Handshake deadline.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Pause between liveness probes.
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    /// Deadline for one liveness probe.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Deadline for calls forwarded by the bridge.
    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy_timeout_ms)
    }

    /// Default deadline for client calls.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.handshake_timeout(), Duration::from_secs(1));
        assert_eq!(config.probe_interval(), Duration::from_secs(1));
        assert_eq!(config.probe_timeout(), Duration::from_secs(1));
        assert_eq!(config.proxy_timeout(), Duration::from_secs(60));
        assert_eq!(config.request_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("KVGATE_PROBE_INTERVAL_MS", "250"),
            ("KVGATE_PROBE_TIMEOUT_MS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env_overrides(|name| vars.get(name).map(ToString::to_string));

        assert_eq!(config.probe_interval_ms, 250);
        // Invalid value keeps the default
        assert_eq!(config.probe_timeout_ms, 1000);
        assert_eq!(config.handshake_timeout_ms, 1000);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "handshake_timeout_ms": 5000 }}"#).unwrap();

        let config = Config::load_from_file(file.path()).unwrap();
        assert_eq!(config.handshake_timeout_ms, 5000);
        assert_eq!(config.proxy_timeout_ms, 60_000);
    }

    #[test]
    fn test_load_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let err = Config::load_from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("Invalid config file"));
    }
}
