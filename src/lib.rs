//! Relay Proxy: stream and datagram proxy framework
//!
//! This library implements transport-layer servers and proxies for both
//! connection-oriented (TCP, unix stream, unix seqpacket) and connectionless
//! (UDP, unix datagram) transports.
//!
//! # Main Features
//!
//! - Graceful `shutdown` bounded by a [`Context`], and a hard `close`
//! - Per-connection tasks with panic recovery
//! - Per-peer virtual connections over shared datagram sockets
//! - Round-robin upstream dialing with scheme-selected transports
//! - Optional TLS termination on stream listeners
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use relay_proxy::{Context, Result, RoundRobinDialer, StreamProxy, StreamServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let dialer = Arc::new(RoundRobinDialer::new(["127.0.0.1:9001", "127.0.0.1:9002"]));
//!     let server = StreamServer::new("tcp://0.0.0.0:8080", StreamProxy::new(dialer));
//!
//!     let serving = {
//!         let server = server.clone();
//!         tokio::spawn(async move { server.listen_and_serve().await })
//!     };
//!
//!     tokio::signal::ctrl_c().await?;
//!     if server.shutdown(&Context::with_timeout(Duration::from_secs(30))).await.is_err() {
//!         server.close()?;
//!     }
//!     let _ = serving.await;
//!     Ok(())
//! }
//! ```

// Public modules
pub mod common;
pub mod config;
pub mod net;
pub mod proxy;
pub mod server;
pub mod tls;

// Re-export commonly used structures and functions for convenience
pub use common::{init_logger, CancelHandle, Context, ProxyError, Result};
pub use net::{parse_address, FilterListener, FilterPacketConn, Listener, NetAddr, Network, PacketConn};
pub use proxy::{DatagramProxy, RoundRobinDialer, StreamProxy};
pub use server::{
    datagram_handler_fn, stream_handler_fn, AbortHandler, Connection, DatagramHandler,
    DatagramServer, ServerOptions, StreamHandler, StreamServer, VirtualConn,
};
pub use tls::create_tls_acceptor;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
