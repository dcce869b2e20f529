//! Reloader configuration from environment variables.
//!
//! # Environment Variables
//!
//! - `RELOADER_LISTEN`: address to bind on a fresh start. Default: `127.0.0.1:8080`
//! - `RELOADER_DRAIN_TIMEOUT_SECS`: upper bound for [`Reloader::drain`](crate::Reloader::drain).
//!   Unset means wait for every connection, however long it takes.

use std::time::Duration;

use tracing::{info, warn};

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";

const LISTEN_VAR: &str = "RELOADER_LISTEN";
const DRAIN_TIMEOUT_VAR: &str = "RELOADER_DRAIN_TIMEOUT_SECS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloaderConfig {
    /// `host:port` to bind when not resuming an inherited socket.
    pub listen: String,
    /// Bound on connection draining; `None` waits indefinitely.
    pub drain_timeout: Option<Duration>,
}

impl Default for ReloaderConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            drain_timeout: None,
        }
    }
}

impl ReloaderConfig {
    pub fn new(listen: impl Into<String>) -> Self {
        Self {
            listen: listen.into(),
            ..Self::default()
        }
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = Some(timeout);
        self
    }

    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let listen = lookup(LISTEN_VAR)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string());

        let drain_timeout = lookup(DRAIN_TIMEOUT_VAR).and_then(|raw| match raw.trim().parse() {
            Ok(secs) => Some(Duration::from_secs(secs)),
            Err(_) => {
                warn!(value = %raw, "Ignoring invalid {}", DRAIN_TIMEOUT_VAR);
                None
            }
        });

        Self {
            listen,
            drain_timeout,
        }
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        info!("Listen address: {}", self.listen);
        match self.drain_timeout {
            Some(timeout) => info!("Drain timeout: {}s", timeout.as_secs()),
            None => info!("Drain timeout: none (wait for all connections)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ReloaderConfig::from_lookup(lookup(&[]));
        assert_eq!(config, ReloaderConfig::default());
        assert_eq!(config.listen, "127.0.0.1:8080");
        assert_eq!(config.drain_timeout, None);
    }

    #[test]
    fn test_values_from_env() {
        let config = ReloaderConfig::from_lookup(lookup(&[
            ("RELOADER_LISTEN", "0.0.0.0:9001"),
            ("RELOADER_DRAIN_TIMEOUT_SECS", "45"),
        ]));
        assert_eq!(config.listen, "0.0.0.0:9001");
        assert_eq!(config.drain_timeout, Some(Duration::from_secs(45)));
    }

    #[test]
    fn test_invalid_timeout_is_ignored() {
        let config = ReloaderConfig::from_lookup(lookup(&[("RELOADER_DRAIN_TIMEOUT_SECS", "soon")]));
        assert_eq!(config.drain_timeout, None);
    }

    #[test]
    fn test_blank_listen_falls_back() {
        let config = ReloaderConfig::from_lookup(lookup(&[("RELOADER_LISTEN", "  ")]));
        assert_eq!(config.listen, DEFAULT_LISTEN);
    }

    #[test]
    fn test_builder() {
        let config = ReloaderConfig::new("127.0.0.1:0").with_drain_timeout(Duration::from_secs(3));
        assert_eq!(config.listen, "127.0.0.1:0");
        assert_eq!(config.drain_timeout, Some(Duration::from_secs(3)));
    }
}
