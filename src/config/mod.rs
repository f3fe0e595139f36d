//! Configuration module
//!
//! This module loads the binary's configuration from a JSON file and the
//! environment, and validates it before any listener is started.

mod defaults;
mod loader;
mod types;
mod validator;

pub use self::defaults::{DEFAULT_CONFIG_FILE, ENV_PREFIX, LISTEN_STR, LOG_LEVEL_STR};
pub use self::types::{ProxyConfig, ProxyEntry, TlsConfig};
pub use self::validator::validate_config;
