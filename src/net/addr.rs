//! Address scheme parsing
//!
//! Listen and target addresses are written as `"<scheme>://<address>"` or as
//! a bare address, in which case the caller's default network applies.

use std::fmt;
use std::net::SocketAddr;
use std::os::unix::net as std_unix;
use std::path::Path;
use std::str::FromStr;

use log::debug;
use socket2::SockAddr;

use crate::common::ProxyError;

/// Transport family named by an address scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Ip,
    Ip4,
    Ip6,
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
    Unix,
    Unixgram,
    Unixpacket,
}

impl Network {
    /// Scheme string for this network
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::Ip4 => "ip4",
            Self::Ip6 => "ip6",
            Self::Tcp => "tcp",
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
            Self::Udp => "udp",
            Self::Udp4 => "udp4",
            Self::Udp6 => "udp6",
            Self::Unix => "unix",
            Self::Unixgram => "unixgram",
            Self::Unixpacket => "unixpacket",
        }
    }

    /// Connection-oriented networks served by `StreamServer`
    pub fn is_stream(&self) -> bool {
        matches!(
            self,
            Self::Tcp | Self::Tcp4 | Self::Tcp6 | Self::Unix | Self::Unixpacket
        )
    }

    /// Connectionless networks served by `DatagramServer`
    pub fn is_datagram(&self) -> bool {
        !self.is_stream()
    }

    /// Unix-domain networks
    pub fn is_unix(&self) -> bool {
        matches!(self, Self::Unix | Self::Unixgram | Self::Unixpacket)
    }

    /// `Some(true)` for IPv4-only networks, `Some(false)` for IPv6-only,
    /// `None` when either family is acceptable
    pub(crate) fn ipv4_only(&self) -> Option<bool> {
        match self {
            Self::Ip4 | Self::Tcp4 | Self::Udp4 => Some(true),
            Self::Ip6 | Self::Tcp6 | Self::Udp6 => Some(false),
            _ => None,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = ProxyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ip" => Ok(Self::Ip),
            "ip4" => Ok(Self::Ip4),
            "ip6" => Ok(Self::Ip6),
            "tcp" => Ok(Self::Tcp),
            "tcp4" => Ok(Self::Tcp4),
            "tcp6" => Ok(Self::Tcp6),
            "udp" => Ok(Self::Udp),
            "udp4" => Ok(Self::Udp4),
            "udp6" => Ok(Self::Udp6),
            "unix" => Ok(Self::Unix),
            "unixgram" => Ok(Self::Unixgram),
            "unixpacket" => Ok(Self::Unixpacket),
            _ => Err(ProxyError::Config(format!("Unknown network: {}", s))),
        }
    }
}

/// A parsed `"<scheme>://<address>"` string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// Network named by the scheme; `None` when absent or unrecognized
    pub network: Option<Network>,
    /// The address with any scheme prefix removed
    pub address: String,
}

impl Address {
    /// The parsed network, or `default` when none was given
    pub fn network_or(&self, default: Network) -> Network {
        self.network.unwrap_or(default)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.network {
            Some(network) => write!(f, "{}://{}", network, self.address),
            None => f.write_str(&self.address),
        }
    }
}

/// Split an address string into its network and bare address
///
/// An unrecognized scheme is dropped and the network left unset, so the
/// caller falls back to its default family.
pub fn parse_address(s: &str) -> Address {
    match s.split_once("://") {
        Some((scheme, address)) => {
            let network = scheme.parse::<Network>().ok();
            if network.is_none() {
                debug!("Unrecognized scheme {:?} in {:?}, using default network", scheme, s);
            }
            Address {
                network,
                address: address.to_string(),
            }
        }
        None => Address {
            network: None,
            address: s.to_string(),
        },
    }
}

/// Whether a unix socket address names the abstract namespace
pub fn is_abstract_unix(address: &str) -> bool {
    address.starts_with('@')
}

/// Local or remote address of a connection or socket
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetAddr {
    /// IP socket address
    Inet(SocketAddr),
    /// Unix socket path or `@name`; empty when the socket is unnamed
    Unix(String),
}

impl NetAddr {
    /// IP socket address, if this is one
    pub fn as_inet(&self) -> Option<SocketAddr> {
        match self {
            Self::Inet(addr) => Some(*addr),
            Self::Unix(_) => None,
        }
    }

    /// Filesystem path backing this address, if any
    ///
    /// Abstract and unnamed unix addresses have no path.
    pub fn unix_path(&self) -> Option<&Path> {
        match self {
            Self::Unix(address) if !address.is_empty() && !is_abstract_unix(address) => {
                Some(Path::new(address))
            }
            _ => None,
        }
    }

    /// Name of an abstract unix address, without the leading `@`
    pub fn abstract_name(&self) -> Option<&str> {
        match self {
            Self::Unix(address) => address.strip_prefix('@'),
            Self::Inet(_) => None,
        }
    }

    /// Unix address as reported by the kernel for a socket2 handle
    pub(crate) fn from_sock_addr(addr: &SockAddr) -> Self {
        if let Some(path) = addr.as_pathname() {
            return Self::Unix(path.to_string_lossy().into_owned());
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            if let Some(name) = addr.as_abstract_namespace() {
                return Self::Unix(format!("@{}", String::from_utf8_lossy(name)));
            }
        }
        Self::Unix(String::new())
    }

    /// Unix address of a datagram sender
    pub(crate) fn from_std_unix(addr: &std_unix::SocketAddr) -> Self {
        if let Some(path) = addr.as_pathname() {
            return Self::Unix(path.to_string_lossy().into_owned());
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            #[cfg(target_os = "android")]
            use std::os::android::net::SocketAddrExt;
            #[cfg(target_os = "linux")]
            use std::os::linux::net::SocketAddrExt;

            if let Some(name) = addr.as_abstract_name() {
                return Self::Unix(format!("@{}", String::from_utf8_lossy(name)));
            }
        }
        Self::Unix(String::new())
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet(addr) => write!(f, "{}", addr),
            Self::Unix(address) if address.is_empty() => f.write_str("@unnamed"),
            Self::Unix(address) => f.write_str(address),
        }
    }
}

impl From<SocketAddr> for NetAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::Inet(addr)
    }
}
