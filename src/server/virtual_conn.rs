//! Per-peer sessions over a shared datagram socket

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::common::CancelHandle;
use crate::net::packet::PacketCloser;
use crate::net::{closed_error, Closable, NetAddr, OnceClose};

/// Inbound packets buffered per peer before new ones are dropped
pub const INBOUND_QUEUE_CAPACITY: usize = 256;

/// Route for one live peer in a socket's demultiplexing map
pub(crate) struct DemuxEntry {
    pub(crate) id: u64,
    pub(crate) sender: mpsc::Sender<Bytes>,
}

/// Peers of one socket keyed by the string form of their address
#[derive(Default)]
pub(crate) struct DemuxMap {
    entries: Mutex<HashMap<String, DemuxEntry>>,
}

impl DemuxMap {
    pub(crate) fn lock(&self) -> MutexGuard<'_, HashMap<String, DemuxEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Close state shared by a virtual connection and the server tracking it
///
/// Holds the demultiplexing map so a session keeps receiving after its
/// socket loop has stopped.
pub(crate) struct VirtualState {
    id: u64,
    key: String,
    demux: Arc<DemuxMap>,
    closed: CancellationToken,
    cancel: CancelHandle,
}

impl VirtualState {
    pub(crate) fn new(id: u64, key: String, demux: &Arc<DemuxMap>, cancel: CancelHandle) -> Self {
        Self {
            id,
            key,
            demux: Arc::clone(demux),
            closed: CancellationToken::new(),
            cancel,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Closable for VirtualState {
    fn close(&self) -> io::Result<()> {
        self.closed.cancel();
        self.cancel.cancel();
        let mut entries = self.demux.lock();
        // A newer session for the same peer may already own the key
        if entries.get(&self.key).map_or(false, |entry| entry.id == self.id) {
            entries.remove(&self.key);
        }
        Ok(())
    }
}

/// Stream-like session bound to one remote peer of a datagram socket
///
/// Each `read` returns exactly one datagram. Writes go out on the shared
/// socket to the bound peer.
pub struct VirtualConn {
    socket: Arc<OnceClose<PacketCloser>>,
    state: Arc<OnceClose<VirtualState>>,
    inbound: AsyncMutex<mpsc::Receiver<Bytes>>,
    local_addr: NetAddr,
    remote_addr: NetAddr,
}

impl VirtualConn {
    pub(crate) fn new(
        socket: Arc<OnceClose<PacketCloser>>,
        state: Arc<OnceClose<VirtualState>>,
        inbound: mpsc::Receiver<Bytes>,
        local_addr: NetAddr,
        remote_addr: NetAddr,
    ) -> Self {
        Self {
            socket,
            state,
            inbound: AsyncMutex::new(inbound),
            local_addr,
            remote_addr,
        }
    }

    /// Wait for the next datagram from the peer and copy it into `buf`
    ///
    /// A datagram longer than `buf` is truncated.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let closed = &self.state.get_ref().closed;
        if closed.is_cancelled() {
            return Err(closed_error());
        }

        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            biased;
            _ = closed.cancelled() => Err(closed_error()),
            packet = inbound.recv() => match packet {
                Some(packet) => {
                    let n = packet.len().min(buf.len());
                    buf[..n].copy_from_slice(&packet[..n]);
                    Ok(n)
                }
                None => Err(closed_error()),
            },
        }
    }

    /// Send one datagram to the peer
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(closed_error());
        }
        self.socket.send_to(buf, &self.remote_addr).await
    }

    /// Close the session; only the first call has any effect
    pub fn close(&self) -> io::Result<()> {
        self.state.close()
    }

    pub fn is_closed(&self) -> bool {
        self.state.get_ref().is_closed()
    }

    /// Address of the shared socket
    pub fn local_addr(&self) -> &NetAddr {
        &self.local_addr
    }

    /// Address of the bound peer
    pub fn remote_addr(&self) -> &NetAddr {
        &self.remote_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Context;
    use crate::net::PacketConn;
    use tokio::net::UdpSocket;

    async fn session(demux: &Arc<DemuxMap>, id: u64, key: &str) -> (VirtualConn, mpsc::Sender<Bytes>) {
        let socket: Arc<dyn PacketConn> = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let local = socket.local_addr().unwrap();
        let socket = Arc::new(OnceClose::new(PacketCloser::new(socket)));

        let (_ctx, cancel) = Context::background().child();
        let state = Arc::new(OnceClose::new(VirtualState::new(id, key.to_string(), demux, cancel)));
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        demux.lock().insert(
            key.to_string(),
            DemuxEntry {
                id,
                sender: tx.clone(),
            },
        );
        let remote = NetAddr::Inet("127.0.0.1:9".parse().unwrap());
        (VirtualConn::new(socket, state, rx, local, remote), tx)
    }

    #[tokio::test]
    async fn test_read_returns_one_packet_truncated() {
        let demux = Arc::new(DemuxMap::default());
        let (conn, tx) = session(&demux, 1, "peer").await;

        tx.send(Bytes::from_static(b"abcdef")).await.unwrap();
        tx.send(Bytes::from_static(b"xy")).await.unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(conn.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"xy");
    }

    #[tokio::test]
    async fn test_close_removes_own_entry_only() {
        let demux = Arc::new(DemuxMap::default());
        let (old, _old_tx) = session(&demux, 1, "peer").await;
        let (new, _new_tx) = session(&demux, 2, "peer").await;

        // The entry now belongs to session 2
        old.close().unwrap();
        assert_eq!(demux.len(), 1);

        new.close().unwrap();
        new.close().unwrap();
        assert_eq!(demux.len(), 0);
    }

    #[tokio::test]
    async fn test_read_fails_after_close() {
        let demux = Arc::new(DemuxMap::default());
        let conn = Arc::new(session(&demux, 1, "peer").await.0);

        let reading = {
            let conn = conn.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                conn.read(&mut buf).await
            })
        };
        tokio::task::yield_now().await;
        conn.close().unwrap();

        let err = reading.await.unwrap().unwrap_err();
        assert!(crate::net::is_closed_error(&err));
        assert!(conn.write(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_session_outlives_its_socket_loop() {
        let demux = Arc::new(DemuxMap::default());
        let (conn, tx) = session(&demux, 1, "peer").await;

        // The socket loop owned the last other handle to the map
        drop(demux);
        tx.send(Bytes::from_static(b"late")).await.unwrap();
        drop(tx);

        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 4);

        // Still waiting for the peer rather than failing as closed
        let pending = tokio::time::timeout(std::time::Duration::from_millis(20), conn.read(&mut buf)).await;
        assert!(pending.is_err());
        assert!(!conn.is_closed());
    }
}
