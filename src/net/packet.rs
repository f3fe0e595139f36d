//! Datagram sockets
//!
//! [`PacketConn`] is the receive/send capability consumed by
//! [`DatagramServer`](crate::DatagramServer).

use std::io;
use std::net::IpAddr;
use std::os::unix::net as std_unix;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use log::trace;
use tokio::io::unix::AsyncFd;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::addr::{parse_address, NetAddr, Network};
use super::once_close::{closed_error, Closable, OnceClose};
use super::socket;

/// Outcome of one receive
#[derive(Debug)]
pub enum Received {
    /// `n` bytes from the given sender
    Packet(usize, NetAddr),
    /// A datagram was read but must be discarded
    Skip,
}

/// Connectionless socket shared by every peer of a datagram server
pub trait PacketConn: Send + Sync {
    /// Receive one datagram into `buf`
    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<Received>>;

    /// Send one datagram to `target`
    fn send_to<'a>(&'a self, buf: &'a [u8], target: &'a NetAddr) -> BoxFuture<'a, io::Result<usize>>;

    /// Address the socket is bound to
    fn local_addr(&self) -> io::Result<NetAddr>;

    /// Release resources beyond the socket itself
    fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

impl<P: PacketConn + ?Sized> PacketConn for Arc<P> {
    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<Received>> {
        (**self).recv_from(buf)
    }

    fn send_to<'a>(&'a self, buf: &'a [u8], target: &'a NetAddr) -> BoxFuture<'a, io::Result<usize>> {
        (**self).send_to(buf, target)
    }

    fn local_addr(&self) -> io::Result<NetAddr> {
        (**self).local_addr()
    }

    fn close(&self) -> io::Result<()> {
        (**self).close()
    }
}

fn not_inet(target: &NetAddr) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("cannot send to {} on an IP socket", target),
    )
}

impl PacketConn for UdpSocket {
    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<Received>> {
        Box::pin(async move {
            let (n, peer) = UdpSocket::recv_from(self, buf).await?;
            Ok(Received::Packet(n, NetAddr::Inet(peer)))
        })
    }

    fn send_to<'a>(&'a self, buf: &'a [u8], target: &'a NetAddr) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            let addr = target.as_inet().ok_or_else(|| not_inet(target))?;
            UdpSocket::send_to(self, buf, addr).await
        })
    }

    fn local_addr(&self) -> io::Result<NetAddr> {
        UdpSocket::local_addr(self).map(NetAddr::Inet)
    }
}

/// Bound unix datagram socket
///
/// Senders bound in the abstract namespace are reported as `@name` and can
/// be replied to; unnamed senders cannot.
pub struct UnixDatagramSocket {
    inner: AsyncFd<std_unix::UnixDatagram>,
    address: String,
}

impl UnixDatagramSocket {
    /// Bind at a path or `@name`
    pub fn bind(address: &str) -> io::Result<Self> {
        Ok(Self {
            inner: AsyncFd::new(socket::bind_unix_datagram(address)?)?,
            address: address.to_string(),
        })
    }
}

fn no_reply_addr(target: &NetAddr) -> io::Error {
    io::Error::new(
        io::ErrorKind::AddrNotAvailable,
        format!("peer {} has no reply address", target),
    )
}

/// Kernel address to reply to a unix datagram sender
fn reply_addr(target: &NetAddr) -> io::Result<std_unix::SocketAddr> {
    if let Some(path) = target.unix_path() {
        return std_unix::SocketAddr::from_pathname(path);
    }
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        #[cfg(target_os = "android")]
        use std::os::android::net::SocketAddrExt;
        #[cfg(target_os = "linux")]
        use std::os::linux::net::SocketAddrExt;

        if let Some(name) = target.abstract_name() {
            return std_unix::SocketAddr::from_abstract_name(name.as_bytes());
        }
    }
    Err(no_reply_addr(target))
}

impl PacketConn for UnixDatagramSocket {
    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<Received>> {
        Box::pin(async move {
            loop {
                let mut ready = self.inner.readable().await?;
                if let Ok(result) = ready.try_io(|inner| inner.get_ref().recv_from(buf)) {
                    let (n, peer) = result?;
                    return Ok(Received::Packet(n, NetAddr::from_std_unix(&peer)));
                }
            }
        })
    }

    fn send_to<'a>(&'a self, buf: &'a [u8], target: &'a NetAddr) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            let addr = reply_addr(target)?;
            loop {
                let mut ready = self.inner.writable().await?;
                if let Ok(result) = ready.try_io(|inner| inner.get_ref().send_to_addr(buf, &addr)) {
                    return result;
                }
            }
        })
    }

    fn local_addr(&self) -> io::Result<NetAddr> {
        Ok(NetAddr::Unix(self.address.clone()))
    }
}

/// Socket that skips datagrams whose sender is not allowed
///
/// Non-IP senders are always let through.
pub struct FilterPacketConn<P> {
    inner: P,
    allow: super::listener::AllowFn,
}

impl<P: PacketConn> FilterPacketConn<P> {
    pub fn new<F>(inner: P, allow: F) -> Self
    where
        F: Fn(IpAddr, u16) -> bool + Send + Sync + 'static,
    {
        Self {
            inner,
            allow: Arc::new(allow),
        }
    }
}

impl<P: PacketConn> PacketConn for FilterPacketConn<P> {
    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<Received>> {
        Box::pin(async move {
            let received = self.inner.recv_from(buf).await?;
            if let Received::Packet(_, NetAddr::Inet(peer)) = &received {
                if !(self.allow)(peer.ip(), peer.port()) {
                    trace!("Dropped datagram from {}", peer);
                    return Ok(Received::Skip);
                }
            }
            Ok(received)
        })
    }

    fn send_to<'a>(&'a self, buf: &'a [u8], target: &'a NetAddr) -> BoxFuture<'a, io::Result<usize>> {
        self.inner.send_to(buf, target)
    }

    fn local_addr(&self) -> io::Result<NetAddr> {
        self.inner.local_addr()
    }

    fn close(&self) -> io::Result<()> {
        self.inner.close()
    }
}

/// Bind a datagram socket for `address`, defaulting to udp
pub async fn listen_datagram(address: &str) -> io::Result<Arc<dyn PacketConn>> {
    let parsed = parse_address(address);
    let network = parsed.network_or(Network::Udp);
    match network {
        Network::Udp => Ok(Arc::new(UdpSocket::bind(parsed.address.as_str()).await?)),
        Network::Udp4 | Network::Udp6 => {
            let addr = socket::resolve(&parsed.address, network.ipv4_only()).await?;
            Ok(Arc::new(UdpSocket::bind(addr).await?))
        }
        Network::Unixgram => Ok(Arc::new(UnixDatagramSocket::bind(&parsed.address)?)),
        Network::Ip | Network::Ip4 | Network::Ip6 => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("raw {} sockets are not supported", network),
        )),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a datagram network", other),
        )),
    }
}

/// Close half of a tracked socket: stops pending and future receives
///
/// Closing drops the tracked handle so the socket is released once in-flight
/// operations return, even while sessions still reference the closer.
pub(crate) struct PacketCloser {
    conn: Mutex<Option<Arc<dyn PacketConn>>>,
    closed: CancellationToken,
}

impl PacketCloser {
    pub(crate) fn new(conn: Arc<dyn PacketConn>) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
            closed: CancellationToken::new(),
        }
    }

    /// The wrapped socket while it is open
    fn current(&self) -> io::Result<Arc<dyn PacketConn>> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }
        self.conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(closed_error)
    }

    #[cfg(test)]
    pub(crate) fn is_released(&self) -> bool {
        self.conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl Closable for PacketCloser {
    fn close(&self) -> io::Result<()> {
        self.closed.cancel();
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match conn {
            Some(conn) => conn.close(),
            None => Ok(()),
        }
    }
}

impl OnceClose<PacketCloser> {
    /// Receive on the wrapped socket until it is closed
    pub(crate) async fn recv_from(&self, buf: &mut [u8]) -> io::Result<Received> {
        let closer = self.get_ref();
        let conn = closer.current()?;
        tokio::select! {
            biased;
            _ = closer.closed.cancelled() => Err(closed_error()),
            received = conn.recv_from(buf) => received,
        }
    }

    /// Send on the wrapped socket unless it is closed
    pub(crate) async fn send_to(&self, buf: &[u8], target: &NetAddr) -> io::Result<usize> {
        let closer = self.get_ref();
        let conn = closer.current()?;
        tokio::select! {
            biased;
            _ = closer.closed.cancelled() => Err(closed_error()),
            sent = conn.send_to(buf, target) => sent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listen_datagram_networks() {
        let udp = listen_datagram("udp4://127.0.0.1:0").await.unwrap();
        assert!(udp.local_addr().unwrap().as_inet().unwrap().is_ipv4());

        let raw = listen_datagram("ip4://127.0.0.1:0").await;
        assert_eq!(raw.err().unwrap().kind(), io::ErrorKind::Unsupported);
        assert!(listen_datagram("tcp://127.0.0.1:0").await.is_err());
    }

    #[tokio::test]
    async fn test_filter_packet_conn_skips_denied_senders() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let conn = FilterPacketConn::new(socket, |ip: IpAddr, _| !ip.is_loopback());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"x", addr).await.unwrap();

        let mut buf = [0u8; 16];
        assert!(matches!(conn.recv_from(&mut buf).await.unwrap(), Received::Skip));
    }

    #[tokio::test]
    async fn test_closed_socket_stops_receiving() {
        let socket: Arc<dyn PacketConn> = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let wrapped = OnceClose::new(PacketCloser::new(socket));
        wrapped.close().unwrap();

        let mut buf = [0u8; 16];
        assert!(wrapped.recv_from(&mut buf).await.is_err());
        let target = NetAddr::Inet("127.0.0.1:9".parse().unwrap());
        assert!(wrapped.send_to(b"x", &target).await.is_err());
    }

    #[tokio::test]
    async fn test_close_releases_socket() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = UdpSocket::local_addr(&socket).unwrap();
        let conn: Arc<dyn PacketConn> = socket.clone();
        let wrapped = Arc::new(OnceClose::new(PacketCloser::new(conn)));
        let session_ref = Arc::clone(&wrapped);

        wrapped.close().unwrap();
        assert!(session_ref.get_ref().is_released());
        assert_eq!(Arc::strong_count(&socket), 1);
        drop(socket);

        // The port is free again while the closer is still referenced
        UdpSocket::bind(addr).await.unwrap();
        assert!(session_ref.send_to(b"x", &NetAddr::Inet(addr)).await.is_err());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_unix_datagram_replies_to_abstract_sender() {
        use std::os::linux::net::SocketAddrExt;

        let pid = std::process::id();
        let server = UnixDatagramSocket::bind(&format!("@relay-packet-srv-{}", pid)).unwrap();
        let server_addr = std_unix::SocketAddr::from_abstract_name(format!("relay-packet-srv-{}", pid)).unwrap();

        let client_name = format!("relay-packet-cli-{}", pid);
        let client_addr = std_unix::SocketAddr::from_abstract_name(&client_name).unwrap();
        let client = std_unix::UnixDatagram::bind_addr(&client_addr).unwrap();
        client.send_to_addr(b"ping", &server_addr).unwrap();

        let mut buf = [0u8; 16];
        let peer = match server.recv_from(&mut buf).await.unwrap() {
            Received::Packet(n, peer) => {
                assert_eq!(&buf[..n], b"ping");
                peer
            }
            Received::Skip => panic!("datagram was skipped"),
        };
        assert_eq!(peer, NetAddr::Unix(format!("@{}", client_name)));

        server.send_to(b"pong", &peer).await.unwrap();
        client
            .set_read_timeout(Some(std::time::Duration::from_secs(5)))
            .unwrap();
        let n = client.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[tokio::test]
    async fn test_unnamed_sender_cannot_be_replied_to() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.sock");
        let server = UnixDatagramSocket::bind(path.to_str().unwrap()).unwrap();

        let target = NetAddr::Unix(String::new());
        let err = server.send_to(b"x", &target).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrNotAvailable);
    }
}
