//! Configuration types

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::defaults;
use crate::net::{parse_address, Network};

/// Certificate and key for a TLS listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// PEM certificate path
    pub cert: PathBuf,
    /// PEM private key path
    pub key: PathBuf,
}

/// One listener and the upstream targets it relays to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyEntry {
    /// Name used in log lines; defaults to the listen address
    #[serde(default)]
    pub name: String,

    /// Listen address, `"<scheme>://<address>"` or bare (tcp)
    pub listen: String,

    /// Upstream targets, dialed round-robin
    pub targets: Vec<String>,

    /// Datagram session idle timeout in seconds
    #[serde(default = "defaults::idle_timeout")]
    pub idle_timeout: u64,

    /// Upstream connect timeout in seconds
    #[serde(default = "defaults::connect_timeout")]
    pub connect_timeout: u64,

    /// Terminate TLS on this listener
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl ProxyEntry {
    /// Create an entry with default timeouts and no TLS
    pub fn new(listen: impl Into<String>, targets: Vec<String>) -> Self {
        Self {
            name: String::new(),
            listen: listen.into(),
            targets,
            idle_timeout: defaults::idle_timeout(),
            connect_timeout: defaults::connect_timeout(),
            tls: None,
        }
    }

    /// Name for log lines
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.listen
        } else {
            &self.name
        }
    }

    /// Network of the listen address; bare addresses are tcp
    pub fn network(&self) -> Network {
        parse_address(&self.listen).network_or(Network::Tcp)
    }

    /// Whether this entry needs a datagram server
    pub fn is_datagram(&self) -> bool {
        self.network().is_datagram()
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "defaults::log_level")]
    pub log_level: String,

    /// Grace period for `shutdown` in seconds before falling back to `close`
    #[serde(default = "defaults::shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// Listeners to run
    #[serde(default)]
    pub proxies: Vec<ProxyEntry>,
}

impl ProxyConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            log_level: defaults::log_level(),
            shutdown_timeout: defaults::shutdown_timeout(),
            proxies: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_defaults_from_json() {
        let entry: ProxyEntry =
            serde_json::from_str(r#"{"listen": "udp://0.0.0.0:53", "targets": ["10.0.0.1:53"]}"#)
                .unwrap();
        assert_eq!(entry.idle_timeout(), Duration::from_secs(10));
        assert_eq!(entry.connect_timeout(), Duration::from_secs(10));
        assert!(entry.tls.is_none());
        assert!(entry.is_datagram());
        assert_eq!(entry.display_name(), "udp://0.0.0.0:53");
    }

    #[test]
    fn test_bare_listen_is_tcp() {
        let entry = ProxyEntry::new("127.0.0.1:8080", vec!["127.0.0.1:9000".to_string()]);
        assert_eq!(entry.network(), Network::Tcp);
        assert!(!entry.is_datagram());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result: std::result::Result<ProxyConfig, _> =
            serde_json::from_str(r#"{"log_level": "info", "buffer_size": 8192}"#);
        assert!(result.is_err());
    }
}
