//! TLS acceptor creation and server-side handshake

use std::path::Path;
use std::pin::Pin;

use log::{debug, info};
use openssl::ssl::{Ssl, SslAcceptor, SslFiletype, SslMethod};
use tokio_openssl::SslStream;

use crate::common::{ProxyError, Result};
use crate::server::Connection;

/// Create a TLS acceptor from PEM certificate and key files
///
/// # Example
///
/// ```no_run
/// # use relay_proxy::tls::create_tls_acceptor;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let acceptor = create_tls_acceptor("certs/server.crt", "certs/server.key")?;
/// # Ok(())
/// # }
/// ```
pub fn create_tls_acceptor(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<SslAcceptor> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();

    let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;
    acceptor.set_certificate_file(cert_path, SslFiletype::PEM)?;
    acceptor.set_private_key_file(key_path, SslFiletype::PEM)?;
    acceptor.check_private_key()?;

    info!("Loaded TLS certificate {}", cert_path.display());
    Ok(acceptor.build())
}

/// Run the server side of a TLS handshake over `conn`
///
/// The returned connection shares `conn`'s close state, so closing either
/// closes both.
pub async fn accept_connection(acceptor: &SslAcceptor, conn: Connection) -> Result<Connection> {
    let ssl = Ssl::new(acceptor.context()).map_err(ProxyError::Ssl)?;
    let (state, local_addr, peer_addr) = conn.parts();
    let mut stream = SslStream::new(ssl, conn).map_err(ProxyError::Ssl)?;

    if let Err(e) = Pin::new(&mut stream).accept().await {
        return Err(ProxyError::TlsHandshake(e.to_string()));
    }
    debug!(
        "TLS handshake with {} complete ({})",
        peer_addr,
        stream.ssl().version_str()
    );

    Ok(Connection::new(Box::new(stream), state, local_addr, peer_addr))
}
