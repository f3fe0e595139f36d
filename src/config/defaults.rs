//! Default configuration values
//!
//! This module is the single source of truth for configuration defaults.

/// Environment variable prefix for all configuration options
pub const ENV_PREFIX: &str = "RELAY_PROXY_";

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Default log level as string
pub const LOG_LEVEL_STR: &str = "info";

/// Default listen address used when only targets are given
pub const LISTEN_STR: &str = "0.0.0.0:8080";

/// Default log level
pub fn log_level() -> String {
    LOG_LEVEL_STR.to_string()
}

/// Default grace period for `shutdown`, in seconds
pub fn shutdown_timeout() -> u64 {
    30
}

/// Default datagram session idle timeout, in seconds
pub fn idle_timeout() -> u64 {
    10
}

/// Default upstream connect timeout, in seconds
pub fn connect_timeout() -> u64 {
    10
}
