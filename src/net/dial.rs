//! Upstream dialing

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use socket2::{SockRef, Type};
use tokio::net::{TcpStream, UdpSocket, UnixDatagram};

use super::addr::{parse_address, NetAddr, Network};
use super::listener::BoxStream;
use super::socket;

/// Connect to a stream target, defaulting to tcp
pub async fn dial_stream(target: &str) -> io::Result<BoxStream> {
    let parsed = parse_address(target);
    let network = parsed.network_or(Network::Tcp);
    match network {
        Network::Tcp => Ok(Box::new(TcpStream::connect(parsed.address.as_str()).await?)),
        Network::Tcp4 | Network::Tcp6 => {
            let addr = socket::resolve(&parsed.address, network.ipv4_only()).await?;
            Ok(Box::new(TcpStream::connect(addr).await?))
        }
        Network::Unix => Ok(Box::new(socket::connect_unix_stream(
            &parsed.address,
            Type::STREAM,
        )?)),
        Network::Unixpacket => Ok(Box::new(socket::connect_unix_stream(
            &parsed.address,
            Type::SEQPACKET,
        )?)),
        // Datagram schemes on a stream dial fall back to tcp
        _ => Ok(Box::new(TcpStream::connect(parsed.address.as_str()).await?)),
    }
}

/// Connected upstream datagram socket
#[derive(Debug)]
pub enum DatagramConn {
    Udp(UdpSocket),
    Unix(UnixDatagram),
}

impl DatagramConn {
    /// Send one datagram to the connected peer
    pub async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Udp(socket) => socket.send(buf).await,
            Self::Unix(socket) => socket.send(buf).await,
        }
    }

    /// Receive one datagram from the connected peer
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Udp(socket) => socket.recv(buf).await,
            Self::Unix(socket) => socket.recv(buf).await,
        }
    }

    pub fn local_addr(&self) -> io::Result<NetAddr> {
        match self {
            Self::Udp(socket) => socket.local_addr().map(NetAddr::Inet),
            Self::Unix(socket) => SockRef::from(socket)
                .local_addr()
                .map(|addr| NetAddr::from_sock_addr(&addr)),
        }
    }

    pub fn peer_addr(&self) -> io::Result<NetAddr> {
        match self {
            Self::Udp(socket) => socket.peer_addr().map(NetAddr::Inet),
            Self::Unix(socket) => SockRef::from(socket)
                .peer_addr()
                .map(|addr| NetAddr::from_sock_addr(&addr)),
        }
    }
}

async fn connect_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let local: SocketAddr = if addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(addr).await?;
    Ok(socket)
}

/// Connect to a datagram target, defaulting to udp
pub async fn dial_datagram(target: &str) -> io::Result<DatagramConn> {
    let parsed = parse_address(target);
    let network = parsed.network_or(Network::Udp);
    match network {
        Network::Unixgram => Ok(DatagramConn::Unix(socket::connect_unix_datagram(
            &parsed.address,
        )?)),
        Network::Ip | Network::Ip4 | Network::Ip6 => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("raw {} sockets are not supported", network),
        )),
        // Stream schemes on a datagram dial fall back to udp
        other => {
            let addr = socket::resolve(&parsed.address, other.ipv4_only()).await?;
            Ok(DatagramConn::Udp(connect_udp(addr).await?))
        }
    }
}
