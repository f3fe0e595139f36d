//! Exactly-once close
//!
//! Listeners, sockets and connections can be closed from their owning task
//! and from `close`/`shutdown` at the same time. [`OnceClose`] runs the
//! underlying close once and hands every caller the same outcome.

use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;

use log::debug;
use once_cell::sync::OnceCell;

use super::addr::NetAddr;

/// A resource with a close operation
pub trait Closable: Send + Sync {
    /// Release the resource
    fn close(&self) -> io::Result<()>;
}

/// Idempotent close wrapper
///
/// The first `close` call runs the wrapped close (and removes the unix socket
/// file, when one was registered); that outcome is cached and returned to
/// every later call.
pub struct OnceClose<C> {
    inner: C,
    outcome: OnceCell<Option<(io::ErrorKind, String)>>,
    unix_path: Option<PathBuf>,
}

impl<C: Closable> OnceClose<C> {
    /// Wrap a resource
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            outcome: OnceCell::new(),
            unix_path: None,
        }
    }

    /// Wrap a resource bound at `local`, removing its socket file on close
    /// when `local` is a filesystem unix address
    pub fn for_addr(inner: C, local: &NetAddr) -> Self {
        Self {
            inner,
            outcome: OnceCell::new(),
            unix_path: local.unix_path().map(PathBuf::from),
        }
    }

    /// The wrapped resource
    pub fn get_ref(&self) -> &C {
        &self.inner
    }

    /// Whether `close` has completed
    pub fn is_closed(&self) -> bool {
        self.outcome.get().is_some()
    }

    /// Close the resource, or return the cached outcome of the first close
    pub fn close(&self) -> io::Result<()> {
        let outcome = self.outcome.get_or_init(|| {
            let mut result = self.inner.close();
            if result.is_ok() {
                if let Some(path) = &self.unix_path {
                    debug!("Removing unix socket file {}", path.display());
                    match fs::remove_file(path) {
                        Err(e) if e.kind() != io::ErrorKind::NotFound => result = Err(e),
                        _ => {}
                    }
                }
            }
            result.err().map(|e| (e.kind(), e.to_string()))
        });

        match outcome {
            None => Ok(()),
            Some((kind, message)) => Err(io::Error::new(*kind, message.clone())),
        }
    }
}

#[derive(Debug)]
struct UseOfClosedConnection;

impl fmt::Display for UseOfClosedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("use of closed network connection")
    }
}

impl Error for UseOfClosedConnection {}

/// Error returned by operations on a closed listener, socket or connection
pub fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, UseOfClosedConnection)
}

/// Whether `err` came from [`closed_error`]
pub fn is_closed_error(err: &io::Error) -> bool {
    err.get_ref()
        .map_or(false, |inner| inner.is::<UseOfClosedConnection>())
}
