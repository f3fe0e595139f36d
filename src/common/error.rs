//! Error handling module
//!
//! This module defines the error types and result type aliases used in the application.

use std::fmt;
use std::io;
use thiserror::Error;

/// Relay proxy error type
#[derive(Error, Debug)]
pub enum ProxyError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// OpenSSL error
    #[error("OpenSSL error: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),

    /// TLS handshake error
    #[error("TLS handshake error: {0}")]
    TlsHandshake(String),

    /// The server was stopped through `shutdown` or `close`
    #[error("server closed")]
    ServerClosed,

    /// A context deadline passed before the operation finished
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// A context was cancelled before the operation finished
    #[error("context canceled")]
    Canceled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Several errors collected from one operation
    #[error("{}", JoinedErrors(.0))]
    Multiple(Vec<ProxyError>),
}

impl ProxyError {
    /// Whether this error means the server stopped on purpose
    pub fn is_server_closed(&self) -> bool {
        matches!(self, Self::ServerClosed)
    }

    /// Collapse a list of errors: `Ok` when empty, the error itself when
    /// there is exactly one, `Multiple` otherwise.
    pub fn join(mut errors: Vec<ProxyError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple(errors)),
        }
    }
}

struct JoinedErrors<'a>(&'a [ProxyError]);

impl fmt::Display for JoinedErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

/// Result type alias
///
/// This is a `Result` type alias that uses our custom `ProxyError`.
pub type Result<T> = std::result::Result<T, ProxyError>;
