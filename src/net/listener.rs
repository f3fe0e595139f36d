//! Stream listeners
//!
//! [`Listener`] is the accept-side capability consumed by
//! [`StreamServer`](crate::StreamServer). TCP and unix listeners implement it
//! directly; [`FilterListener`] layers an allow predicate over any of them.

use std::io;
use std::net::IpAddr;
use std::os::fd::AsFd;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use log::debug;
use socket2::{SockRef, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;

use super::addr::{parse_address, NetAddr, Network};
use super::once_close::{closed_error, Closable, OnceClose};
use super::socket;

/// Byte stream usable as a proxied connection
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Boxed byte stream
pub type BoxStream = Box<dyn AsyncStream>;

/// A freshly accepted stream and its addresses
pub struct Accepted {
    pub stream: BoxStream,
    pub local_addr: NetAddr,
    pub peer_addr: NetAddr,
    /// Duplicate handle used to shut the socket down on close
    pub(crate) socket: Option<Socket>,
}

impl Accepted {
    /// Wrap a stream that has no socket of its own to shut down
    ///
    /// Closing the server's connection then only fails further reads and
    /// writes; the stream itself is released when the handler drops it.
    pub fn new<S: AsyncStream + 'static>(stream: S, local_addr: NetAddr, peer_addr: NetAddr) -> Self {
        Self {
            stream: Box::new(stream),
            local_addr,
            peer_addr,
            socket: None,
        }
    }

    /// Wrap a socket-backed stream; closing the connection shuts the socket
    /// down in both directions even while the handler still holds it
    pub fn with_socket<S>(stream: S, local_addr: NetAddr, peer_addr: NetAddr) -> io::Result<Self>
    where
        S: AsyncStream + AsFd + 'static,
    {
        let socket = SockRef::from(&stream).try_clone()?;
        Ok(Self {
            stream: Box::new(stream),
            local_addr,
            peer_addr,
            socket: Some(socket),
        })
    }
}

/// Outcome of one accept
pub enum Incoming {
    /// Hand the connection to the server's handler
    Accepted(Accepted),
    /// Close the connection without invoking the handler
    Skip(Accepted),
}

/// Accept-side capability of a stream listener
pub trait Listener: Send + Sync {
    /// Wait for the next connection
    fn accept(&self) -> BoxFuture<'_, io::Result<Incoming>>;

    /// Address the listener is bound to
    fn local_addr(&self) -> io::Result<NetAddr>;

    /// Release resources beyond the socket itself
    ///
    /// The server stops accepting on its own when it closes a listener;
    /// this hook only covers extra cleanup.
    fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

impl<L: Listener + ?Sized> Listener for Box<L> {
    fn accept(&self) -> BoxFuture<'_, io::Result<Incoming>> {
        (**self).accept()
    }

    fn local_addr(&self) -> io::Result<NetAddr> {
        (**self).local_addr()
    }

    fn close(&self) -> io::Result<()> {
        (**self).close()
    }
}

impl Listener for TcpListener {
    fn accept(&self) -> BoxFuture<'_, io::Result<Incoming>> {
        Box::pin(async move {
            let (stream, peer) = TcpListener::accept(self).await?;
            let local = stream.local_addr()?;
            Ok(Incoming::Accepted(Accepted::with_socket(
                stream,
                NetAddr::Inet(local),
                NetAddr::Inet(peer),
            )?))
        })
    }

    fn local_addr(&self) -> io::Result<NetAddr> {
        TcpListener::local_addr(self).map(NetAddr::Inet)
    }
}

/// Unix stream or seqpacket listener
pub struct UnixStreamListener {
    inner: UnixListener,
    address: String,
}

impl UnixStreamListener {
    /// Wrap an already bound listener; `address` is its path or `@name`
    pub fn new(inner: UnixListener, address: impl Into<String>) -> Self {
        Self {
            inner,
            address: address.into(),
        }
    }

    /// Bind a `SOCK_STREAM` listener at a path or `@name`
    pub fn bind(address: &str) -> io::Result<Self> {
        Ok(Self::new(socket::bind_unix_listener(address, Type::STREAM)?, address))
    }

    /// Bind a `SOCK_SEQPACKET` listener at a path or `@name`
    pub fn bind_seqpacket(address: &str) -> io::Result<Self> {
        Ok(Self::new(socket::bind_unix_listener(address, Type::SEQPACKET)?, address))
    }
}

impl Listener for UnixStreamListener {
    fn accept(&self) -> BoxFuture<'_, io::Result<Incoming>> {
        Box::pin(async move {
            let (stream, _) = self.inner.accept().await?;
            let peer = NetAddr::from_sock_addr(&SockRef::from(&stream).peer_addr()?);
            Ok(Incoming::Accepted(Accepted::with_socket(
                stream,
                NetAddr::Unix(self.address.clone()),
                peer,
            )?))
        })
    }

    fn local_addr(&self) -> io::Result<NetAddr> {
        Ok(NetAddr::Unix(self.address.clone()))
    }
}

/// Allow predicate over a remote `(host, port)`
pub type AllowFn = Arc<dyn Fn(IpAddr, u16) -> bool + Send + Sync>;

/// Listener that skips connections whose remote address is not allowed
///
/// Non-IP peers (unix sockets) are always let through.
pub struct FilterListener<L> {
    inner: L,
    allow: AllowFn,
}

impl<L: Listener> FilterListener<L> {
    pub fn new<F>(inner: L, allow: F) -> Self
    where
        F: Fn(IpAddr, u16) -> bool + Send + Sync + 'static,
    {
        Self {
            inner,
            allow: Arc::new(allow),
        }
    }
}

impl<L: Listener> Listener for FilterListener<L> {
    fn accept(&self) -> BoxFuture<'_, io::Result<Incoming>> {
        Box::pin(async move {
            match self.inner.accept().await? {
                Incoming::Accepted(conn) => {
                    if let Some(peer) = conn.peer_addr.as_inet() {
                        if !(self.allow)(peer.ip(), peer.port()) {
                            debug!("Rejected connection from {}", peer);
                            return Ok(Incoming::Skip(conn));
                        }
                    }
                    Ok(Incoming::Accepted(conn))
                }
                skipped => Ok(skipped),
            }
        })
    }

    fn local_addr(&self) -> io::Result<NetAddr> {
        self.inner.local_addr()
    }

    fn close(&self) -> io::Result<()> {
        self.inner.close()
    }
}

/// Bind a stream listener for `address`, defaulting to tcp
pub async fn listen_stream(address: &str) -> io::Result<Box<dyn Listener>> {
    let parsed = parse_address(address);
    let network = parsed.network_or(Network::Tcp);
    match network {
        Network::Tcp => Ok(Box::new(TcpListener::bind(parsed.address.as_str()).await?)),
        Network::Tcp4 | Network::Tcp6 => {
            let addr = socket::resolve(&parsed.address, network.ipv4_only()).await?;
            Ok(Box::new(TcpListener::bind(addr).await?))
        }
        Network::Unix => Ok(Box::new(UnixStreamListener::bind(&parsed.address)?)),
        Network::Unixpacket => Ok(Box::new(UnixStreamListener::bind_seqpacket(&parsed.address)?)),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a stream network", other),
        )),
    }
}

/// Close half of a tracked listener: stops pending and future accepts
///
/// Closing drops the tracked handle, so the listening socket is released
/// as soon as an interrupted accept returns.
pub(crate) struct ListenerCloser {
    listener: Mutex<Option<Arc<dyn Listener>>>,
    closed: CancellationToken,
}

impl ListenerCloser {
    pub(crate) fn new(listener: Arc<dyn Listener>) -> Self {
        Self {
            listener: Mutex::new(Some(listener)),
            closed: CancellationToken::new(),
        }
    }

    fn current(&self) -> Option<Arc<dyn Listener>> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Closable for ListenerCloser {
    fn close(&self) -> io::Result<()> {
        self.closed.cancel();
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match listener {
            Some(listener) => listener.close(),
            None => Ok(()),
        }
    }
}

impl OnceClose<ListenerCloser> {
    /// Accept on the wrapped listener until it is closed
    pub(crate) async fn accept(&self) -> io::Result<Incoming> {
        let closer = self.get_ref();
        let listener = match closer.current() {
            Some(listener) if !closer.closed.is_cancelled() => listener,
            _ => return Err(closed_error()),
        };
        tokio::select! {
            biased;
            _ = closer.closed.cancelled() => Err(closed_error()),
            incoming = listener.accept() => incoming,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_filter_listener_skips_denied_peers() {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let listener = FilterListener::new(tcp, |ip: IpAddr, _port| !ip.is_loopback());

        let _client = tokio::net::TcpStream::connect(addr).await.unwrap();
        match listener.accept().await.unwrap() {
            Incoming::Skip(conn) => assert!(conn.peer_addr.as_inet().unwrap().ip().is_loopback()),
            Incoming::Accepted(_) => panic!("loopback peer should be skipped"),
        }
    }

    #[tokio::test]
    async fn test_closed_listener_stops_accepting() {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener = Arc::new(OnceClose::new(ListenerCloser::new(Arc::new(tcp))));

        let accepting = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept().await })
        };
        tokio::task::yield_now().await;
        listener.close().unwrap();

        let result = accepting.await.unwrap();
        match result {
            Err(e) => assert!(super::super::once_close::is_closed_error(&e)),
            Ok(_) => panic!("accept should fail after close"),
        }
        assert!(listener.accept().await.is_err());
    }

    #[tokio::test]
    async fn test_listen_stream_rejects_datagram_network() {
        assert!(listen_stream("udp://127.0.0.1:0").await.is_err());
        let listener = listen_stream("tcp4://127.0.0.1:0").await.unwrap();
        assert!(listener.local_addr().unwrap().as_inet().unwrap().is_ipv4());
    }
}
