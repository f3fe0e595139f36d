//! Configuration loading functionality
//!
//! Configuration comes from a JSON file, then environment variables with
//! the `RELAY_PROXY_` prefix override individual values.

use std::env;
use std::fs;
use std::path::Path;

use log::debug;

use super::defaults::ENV_PREFIX;
use super::types::ProxyConfig;
use crate::common::{ProxyError, Result};

impl ProxyConfig {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let path_display = path.display();

        let content = fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("Failed to read config file {}: {}", path_display, e))
        })?;

        Self::from_json(&content).map_err(|e| {
            ProxyError::Config(format!("Failed to parse JSON config file {}: {}", path_display, e))
        })
    }

    /// Parse configuration from a JSON string
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| ProxyError::Config(e.to_string()))
    }

    /// Override values from `RELAY_PROXY_*` environment variables
    ///
    /// # Returns
    ///
    /// Returns `true` if any value was overridden.
    pub fn apply_env(&mut self) -> Result<bool> {
        let get_env = |name: &str| -> Option<String> {
            env::var(format!("{}{}", ENV_PREFIX, name)).ok()
        };
        let mut has_changes = false;

        if let Some(value) = get_env("LOG_LEVEL") {
            debug!("Log level overridden from environment: {}", value);
            self.log_level = value;
            has_changes = true;
        }

        if let Some(value) = get_env("SHUTDOWN_TIMEOUT") {
            self.shutdown_timeout = value.trim().parse().map_err(|e| {
                ProxyError::Config(format!(
                    "Invalid {}SHUTDOWN_TIMEOUT '{}': {}",
                    ENV_PREFIX, value, e
                ))
            })?;
            has_changes = true;
        }

        Ok(has_changes)
    }
}
