//! Configuration validator
//!
//! This module checks a loaded configuration before any socket is bound.

use std::path::Path;

use log::warn;

use super::types::{ProxyConfig, ProxyEntry};
use crate::common::{ProxyError, Result};
use crate::net::{parse_address, Network};

/// Validate the configuration
pub fn validate_config(config: &ProxyConfig) -> Result<()> {
    validate_general_settings(config)?;

    if config.proxies.is_empty() {
        return Err(ProxyError::Config("No proxies configured".to_string()));
    }
    for entry in &config.proxies {
        validate_entry(entry)?;
    }

    Ok(())
}

fn validate_general_settings(config: &ProxyConfig) -> Result<()> {
    match config.log_level.as_str() {
        "error" | "warn" | "info" | "debug" | "trace" => {}
        level => warn!("Invalid log level: {}. Using default: info", level),
    }

    if config.shutdown_timeout == 0 {
        return Err(ProxyError::Config(
            "Shutdown timeout must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

/// Parse an address, rejecting unknown schemes and raw IP networks
fn parse_network(address: &str, default: Network) -> Result<Network> {
    let parsed = parse_address(address);
    if parsed.address.is_empty() {
        return Err(ProxyError::Config(format!("Empty address: {:?}", address)));
    }
    if parsed.network.is_none() && address.contains("://") {
        return Err(ProxyError::Config(format!("Unknown scheme in {}", address)));
    }

    let network = parsed.network_or(default);
    if matches!(network, Network::Ip | Network::Ip4 | Network::Ip6) {
        return Err(ProxyError::Config(format!(
            "Raw IP sockets are not supported: {}",
            address
        )));
    }
    Ok(network)
}

fn validate_entry(entry: &ProxyEntry) -> Result<()> {
    let name = entry.display_name();
    let listen = parse_network(&entry.listen, Network::Tcp)?;

    if entry.targets.is_empty() {
        return Err(ProxyError::Config(format!("Proxy {} has no targets", name)));
    }
    let default_target = if listen.is_stream() {
        Network::Tcp
    } else {
        Network::Udp
    };
    for target in &entry.targets {
        let network = parse_network(target, default_target)?;
        if network.is_stream() != listen.is_stream() {
            return Err(ProxyError::Config(format!(
                "Proxy {} listens on {} but target {} is {}",
                name, listen, target, network
            )));
        }
    }

    if entry.idle_timeout == 0 {
        return Err(ProxyError::Config(format!(
            "Proxy {}: idle timeout must be greater than 0",
            name
        )));
    }
    if entry.connect_timeout == 0 {
        return Err(ProxyError::Config(format!(
            "Proxy {}: connect timeout must be greater than 0",
            name
        )));
    }

    if let Some(tls) = &entry.tls {
        if listen.is_datagram() {
            return Err(ProxyError::Config(format!(
                "Proxy {}: TLS is only supported on stream listeners",
                name
            )));
        }
        validate_file_exists(&tls.cert)?;
        validate_file_exists(&tls.key)?;
    }

    Ok(())
}

/// Validate that a file exists
fn validate_file_exists(path: &Path) -> Result<()> {
    if !(path.exists() && path.is_file()) {
        return Err(ProxyError::Config(format!(
            "File not found: {}",
            path.display()
        )));
    }
    Ok(())
}
