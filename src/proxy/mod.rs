//! Proxy handlers
//!
//! [`StreamProxy`] and [`DatagramProxy`] plug into the servers as handlers
//! and relay each downstream session to an upstream picked by a
//! [`RoundRobinDialer`].

mod datagram;
mod dialer;
mod forwarder;
mod stream;

pub use datagram::{DatagramDialFn, DatagramProxy, DEFAULT_IDLE_TIMEOUT};
pub use dialer::RoundRobinDialer;
pub use forwarder::{copy_buffered, copy_counted};
pub use stream::{ErrorHandler, StreamDialFn, StreamProxy, DEFAULT_DRAIN_TIMEOUT};
