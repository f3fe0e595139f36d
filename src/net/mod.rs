//! Network primitives
//!
//! Address parsing, listener and datagram socket capabilities, upstream
//! dialing and the close/tracking building blocks shared by both servers.

pub mod addr;
pub mod dial;
pub mod listener;
pub mod once_close;
pub mod packet;
mod socket;
pub mod tracked;

pub use addr::{is_abstract_unix, parse_address, Address, NetAddr, Network};
pub use dial::{dial_datagram, dial_stream, DatagramConn};
pub use listener::{
    listen_stream, Accepted, AllowFn, AsyncStream, BoxStream, FilterListener, Incoming, Listener,
    UnixStreamListener,
};
pub use once_close::{closed_error, is_closed_error, Closable, OnceClose};
pub use packet::{listen_datagram, FilterPacketConn, PacketConn, Received, UnixDatagramSocket};
pub use tracked::{next_resource_id, TrackedSet};
