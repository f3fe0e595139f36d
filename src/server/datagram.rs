//! Datagram server
//!
//! Receives on one or more shared sockets and splits traffic by sender into
//! [`VirtualConn`] sessions. The first datagram from a new peer starts a
//! session task running the handler.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use log::{debug, info, trace};
use tokio::sync::mpsc::{self, error::TrySendError};

use super::virtual_conn::{DemuxEntry, DemuxMap, VirtualState, INBOUND_QUEUE_CAPACITY};
use super::{
    close_tracked, drain, on_accept_error, run_isolated, Backoff, ServerOptions, ServerState,
    VirtualConn,
};
use crate::common::{Context, ProxyError, Result};
use crate::net::packet::PacketCloser;
use crate::net::{
    listen_datagram, next_resource_id, NetAddr, OnceClose, PacketConn, Received, TrackedSet,
};

/// Largest datagram read from a shared socket
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Serves one peer session
///
/// The server closes the session once the returned future completes.
pub trait DatagramHandler: Send + Sync {
    fn serve_datagram(&self, ctx: Context, conn: VirtualConn) -> BoxFuture<'_, ()>;
}

impl<H: DatagramHandler + ?Sized> DatagramHandler for Arc<H> {
    fn serve_datagram(&self, ctx: Context, conn: VirtualConn) -> BoxFuture<'_, ()> {
        (**self).serve_datagram(ctx, conn)
    }
}

/// [`DatagramHandler`] backed by a closure
pub struct DatagramHandlerFn<F>(F);

/// Adapt an async closure into a [`DatagramHandler`]
pub fn datagram_handler_fn<F, Fut>(f: F) -> DatagramHandlerFn<F>
where
    F: Fn(Context, VirtualConn) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    DatagramHandlerFn(f)
}

impl<F, Fut> DatagramHandler for DatagramHandlerFn<F>
where
    F: Fn(Context, VirtualConn) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn serve_datagram(&self, ctx: Context, conn: VirtualConn) -> BoxFuture<'_, ()> {
        Box::pin((self.0)(ctx, conn))
    }
}

struct SessionGuard {
    shared: Arc<Shared>,
    id: u64,
    state: Arc<OnceClose<VirtualState>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Err(e) = self.state.close() {
            debug!("Error closing session: {}", e);
        }
        self.shared.sessions.remove(self.id);
    }
}

struct Shared {
    addr: String,
    handler: Arc<dyn DatagramHandler>,
    options: ServerOptions,
    state: ServerState,
    sockets: TrackedSet<Arc<OnceClose<PacketCloser>>>,
    sessions: TrackedSet<Arc<OnceClose<VirtualState>>>,
}

/// One bound socket being served
struct SocketLoop<'a> {
    server: &'a DatagramServer,
    socket: Arc<OnceClose<PacketCloser>>,
    local: NetAddr,
    base: Context,
    demux: Arc<DemuxMap>,
}

impl SocketLoop<'_> {
    async fn run(&self) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut backoff = Backoff::new();
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok(Received::Packet(n, peer)) => {
                    backoff.reset();
                    if n > 0 {
                        self.dispatch(peer, &buf[..n]);
                    }
                }
                Ok(Received::Skip) => backoff.reset(),
                Err(e) => {
                    on_accept_error(&self.server.inner.state, &mut backoff, &self.local, e).await?
                }
            }
        }
    }

    /// Route one datagram to its peer's session, starting one if needed
    fn dispatch(&self, peer: NetAddr, data: &[u8]) {
        let key = peer.to_string();
        let mut created = None;

        let sender = {
            let mut entries = self.demux.lock();
            match entries.get(&key) {
                Some(entry) => entry.sender.clone(),
                None => {
                    let (sender, inbound) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
                    let id = next_resource_id();
                    let (ctx, cancel) = self.base.child();
                    let state = Arc::new(OnceClose::new(VirtualState::new(
                        id,
                        key.clone(),
                        &self.demux,
                        cancel,
                    )));
                    entries.insert(
                        key.clone(),
                        DemuxEntry {
                            id,
                            sender: sender.clone(),
                        },
                    );
                    let conn = VirtualConn::new(
                        Arc::clone(&self.socket),
                        Arc::clone(&state),
                        inbound,
                        self.local.clone(),
                        peer,
                    );
                    created = Some((id, state, ctx, conn));
                    sender
                }
            }
        };

        match sender.try_send(Bytes::copy_from_slice(data)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => trace!("Inbound queue for {} full, dropping datagram", key),
            Err(TrySendError::Closed(_)) => trace!("Session for {} closed, dropping datagram", key),
        }

        if let Some((id, state, ctx, conn)) = created {
            self.server.spawn_session(id, state, ctx, conn);
        }
    }
}

/// Connectionless server
///
/// Cheap to clone; clones control the same server.
#[derive(Clone)]
pub struct DatagramServer {
    inner: Arc<Shared>,
}

impl DatagramServer {
    /// Create a server for `addr` (used by `listen_and_serve`)
    pub fn new<H: DatagramHandler + 'static>(addr: impl Into<String>, handler: H) -> Self {
        Self::with_options(addr, handler, ServerOptions::default())
    }

    /// Create a server with a base-context factory and/or panic hook
    pub fn with_options<H: DatagramHandler + 'static>(
        addr: impl Into<String>,
        handler: H,
        options: ServerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Shared {
                addr: addr.into(),
                handler: Arc::new(handler),
                options,
                state: ServerState::new(),
                sockets: TrackedSet::new(),
                sessions: TrackedSet::new(),
            }),
        }
    }

    /// Configured listen address
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// Number of peer sessions currently tracked
    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Number of sockets currently tracked
    pub fn active_sockets(&self) -> usize {
        self.inner.sockets.len()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.state.is_running() {
            Ok(())
        } else {
            Err(ProxyError::ServerClosed)
        }
    }

    /// Bind the configured address and serve it
    ///
    /// Always returns an error; `ServerClosed` after `shutdown` or `close`.
    pub async fn listen_and_serve(&self) -> Result<()> {
        self.ensure_running()?;
        let socket = listen_datagram(&self.inner.addr).await?;
        self.serve(socket).await
    }

    /// Serve datagrams received on `socket` until it fails or the server
    /// stops
    pub async fn serve<P: PacketConn + 'static>(&self, socket: P) -> Result<()> {
        self.ensure_running()?;
        let socket: Arc<dyn PacketConn> = Arc::new(socket);
        let local = socket.local_addr()?;

        let tracked = Arc::new(OnceClose::for_addr(PacketCloser::new(socket), &local));
        let id = next_resource_id();
        self.inner.sockets.insert(id, Arc::clone(&tracked));

        let result = if self.inner.state.is_running() {
            info!("Datagram server listening on {}", local);
            let base = self.inner.options.base_context(&local);
            let socket_loop = SocketLoop {
                server: self,
                socket: Arc::clone(&tracked),
                local: local.clone(),
                base,
                demux: Arc::new(DemuxMap::default()),
            };
            socket_loop.run().await
        } else {
            Err(ProxyError::ServerClosed)
        };

        if let Err(e) = tracked.close() {
            debug!("Error closing socket {}: {}", local, e);
        }
        self.inner.sockets.remove(id);
        result
    }

    fn spawn_session(
        &self,
        id: u64,
        state: Arc<OnceClose<VirtualState>>,
        ctx: Context,
        conn: VirtualConn,
    ) {
        self.inner.sessions.insert(id, Arc::clone(&state));
        if self.inner.state.is_closed() {
            // close() may have taken its snapshot before the insert
            let _ = state.close();
        }

        let shared = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let local = conn.local_addr().clone();
            let peer = conn.remote_addr().clone();
            debug!("New datagram session from {} on {}", peer, local);

            let _guard = SessionGuard {
                shared: Arc::clone(&shared),
                id,
                state,
            };
            let handler = Arc::clone(&shared.handler);
            run_isolated(
                handler.serve_datagram(ctx, conn),
                &shared.options,
                &local,
                &peer,
            )
            .await;
        });
    }

    /// Stop immediately: close all sockets, then all sessions
    pub fn close(&self) -> Result<()> {
        self.inner.state.set_closed();
        info!("Closing datagram server {}", self.inner.addr);

        let mut errors = close_tracked(&self.inner.sockets);
        errors.extend(close_tracked(&self.inner.sessions));
        ProxyError::join(errors)
    }

    /// Close all sockets and wait for sessions to end on their own
    pub async fn shutdown(&self, ctx: &Context) -> Result<()> {
        if !self.inner.state.claim_shutdown() {
            return Err(ProxyError::ServerClosed);
        }
        info!("Shutting down datagram server {}", self.inner.addr);

        let errors = close_tracked(&self.inner.sockets);
        let sessions = &self.inner.sessions;
        drain(ctx, || sessions.is_empty()).await?;
        ProxyError::join(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    fn echo_server() -> DatagramServer {
        DatagramServer::new(
            "127.0.0.1:0",
            datagram_handler_fn(|_ctx, conn: VirtualConn| async move {
                let mut buf = [0u8; 1500];
                while let Ok(n) = conn.read(&mut buf).await {
                    if conn.write(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }),
        )
    }

    #[tokio::test]
    async fn test_echo_per_peer_sessions() {
        let server = echo_server();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(socket).await })
        };

        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = [0u8; 32];
        for (client, msg) in [(&a, b"from a".as_slice()), (&b, b"from b".as_slice()), (&a, b"again".as_slice())] {
            client.send_to(msg, addr).await.unwrap();
            let n = tokio::time::timeout(Duration::from_secs(5), client.recv(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..n], msg);
        }
        assert_eq!(server.active_sessions(), 2);
        assert_eq!(server.active_sockets(), 1);

        server.close().unwrap();
        assert_eq!(server.active_sessions(), 0);
        assert!(serving.await.unwrap().unwrap_err().is_server_closed());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_sessions() {
        let server = echo_server();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        {
            let server = server.clone();
            tokio::spawn(async move { server.serve(socket).await });
        }

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hold", addr).await.unwrap();
        let mut buf = [0u8; 8];
        client.recv(&mut buf).await.unwrap();

        let ctx = Context::with_timeout(Duration::from_millis(50));
        let err = server.shutdown(&ctx).await.unwrap_err();
        assert!(matches!(err, ProxyError::DeadlineExceeded));
        assert_eq!(server.active_sessions(), 1);

        server.close().unwrap();
        assert_eq!(server.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_close_releases_socket_held_by_sessions() {
        let server = DatagramServer::new(
            "127.0.0.1:0",
            datagram_handler_fn(|_ctx, conn: VirtualConn| async move {
                let _held = conn;
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }),
        );
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(socket).await })
        };

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hold", addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.active_sessions() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        server.close().unwrap();
        assert!(serving.await.unwrap().unwrap_err().is_server_closed());

        // The session task still runs, but the port is free
        UdpSocket::bind(addr).await.unwrap();
    }
}
