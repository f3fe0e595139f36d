//! Socket construction helpers
//!
//! Unix sockets are built with `socket2` so the same code path covers
//! filesystem paths, `@name` abstract addresses and `SOCK_SEQPACKET`.

use std::io;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::os::unix::net as std_unix;

use socket2::{Domain, SockAddr, Socket, Type};
use tokio::net::{self, UnixDatagram, UnixListener, UnixStream};

/// Backlog for unix listeners
const LISTEN_BACKLOG: i32 = 1024;

/// Resolve `address`, keeping only the requested IP family
pub(crate) async fn resolve(address: &str, ipv4_only: Option<bool>) -> io::Result<SocketAddr> {
    let mut addrs = net::lookup_host(address).await?;
    addrs
        .find(|addr| ipv4_only.map_or(true, |v4| addr.is_ipv4() == v4))
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no suitable address found for {}", address),
            )
        })
}

fn unix_sock_addr(address: &str) -> io::Result<SockAddr> {
    match address.strip_prefix('@') {
        // Abstract names are passed with a leading NUL byte
        Some(name) => SockAddr::unix(format!("\0{}", name)),
        None => SockAddr::unix(address),
    }
}

fn unix_socket(ty: Type) -> io::Result<Socket> {
    Socket::new(Domain::UNIX, ty, None)
}

/// Bind a listening unix socket of type `STREAM` or `SEQPACKET`
pub(crate) fn bind_unix_listener(address: &str, ty: Type) -> io::Result<UnixListener> {
    let socket = unix_socket(ty)?;
    socket.bind(&unix_sock_addr(address)?)?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    let fd: OwnedFd = socket.into();
    UnixListener::from_std(std_unix::UnixListener::from(fd))
}

/// Connect a unix socket of type `STREAM` or `SEQPACKET`
pub(crate) fn connect_unix_stream(address: &str, ty: Type) -> io::Result<UnixStream> {
    let socket = unix_socket(ty)?;
    socket.connect(&unix_sock_addr(address)?)?;
    socket.set_nonblocking(true)?;
    let fd: OwnedFd = socket.into();
    UnixStream::from_std(std_unix::UnixStream::from(fd))
}

/// Bind a unix datagram socket
///
/// The socket is returned in non-blocking mode for registration with the
/// reactor.
pub(crate) fn bind_unix_datagram(address: &str) -> io::Result<std_unix::UnixDatagram> {
    let socket = unix_socket(Type::DGRAM)?;
    socket.bind(&unix_sock_addr(address)?)?;
    socket.set_nonblocking(true)?;
    let fd: OwnedFd = socket.into();
    Ok(std_unix::UnixDatagram::from(fd))
}

/// Connect an unbound unix datagram socket to `address`
pub(crate) fn connect_unix_datagram(address: &str) -> io::Result<UnixDatagram> {
    let socket = unix_socket(Type::DGRAM)?;
    socket.connect(&unix_sock_addr(address)?)?;
    socket.set_nonblocking(true)?;
    let fd: OwnedFd = socket.into();
    UnixDatagram::from_std(std_unix::UnixDatagram::from(fd))
}
