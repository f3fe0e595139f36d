//! TLS handling module
//!
//! Builds the acceptor used by `StreamServer::listen_and_serve_tls` and
//! performs the handshake inside each connection task.

mod acceptor;

pub use acceptor::{accept_connection, create_tls_acceptor};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_certificate_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("missing.crt");
        let key = dir.path().join("missing.key");
        assert!(create_tls_acceptor(&cert, &key).is_err());
    }
}
