//! Stream server
//!
//! Accepts connections on one or more listeners and runs the handler for
//! each connection in its own task. `shutdown` stops accepting and waits for
//! handlers to finish; `close` force-closes everything at once.

use std::future::Future;
use std::io;
use std::net::Shutdown;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context as TaskContext, Poll};

use futures::future::BoxFuture;
use futures::task::AtomicWaker;
use log::{debug, info};
use openssl::ssl::SslAcceptor;
use socket2::Socket;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{
    close_tracked, drain, on_accept_error, run_isolated, Backoff, ServerOptions, ServerState,
};
use crate::common::{CancelHandle, Context, ProxyError, Result};
use crate::net::listener::ListenerCloser;
use crate::net::{
    closed_error, listen_stream, next_resource_id, Accepted, BoxStream, Closable, Incoming,
    Listener, NetAddr, OnceClose, TrackedSet,
};
use crate::tls;

/// Serves one accepted connection
///
/// The server closes the connection once the returned future completes, so
/// handlers need not close it themselves.
pub trait StreamHandler: Send + Sync {
    fn serve_stream(&self, ctx: Context, conn: Connection) -> BoxFuture<'_, ()>;
}

impl<H: StreamHandler + ?Sized> StreamHandler for Arc<H> {
    fn serve_stream(&self, ctx: Context, conn: Connection) -> BoxFuture<'_, ()> {
        (**self).serve_stream(ctx, conn)
    }
}

/// [`StreamHandler`] backed by a closure
pub struct StreamHandlerFn<F>(F);

/// Adapt an async closure into a [`StreamHandler`]
pub fn stream_handler_fn<F, Fut>(f: F) -> StreamHandlerFn<F>
where
    F: Fn(Context, Connection) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    StreamHandlerFn(f)
}

impl<F, Fut> StreamHandler for StreamHandlerFn<F>
where
    F: Fn(Context, Connection) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn serve_stream(&self, ctx: Context, conn: Connection) -> BoxFuture<'_, ()> {
        Box::pin((self.0)(ctx, conn))
    }
}

/// Close state shared by a connection and the server tracking it
///
/// Closing shuts the underlying socket down, so the peer sees the
/// connection end even while a handler still owns the stream.
pub(crate) struct ConnState {
    closed: AtomicBool,
    read_waker: AtomicWaker,
    write_waker: AtomicWaker,
    cancel: CancelHandle,
    socket: Mutex<Option<Socket>>,
}

impl ConnState {
    fn new(cancel: CancelHandle, socket: Option<Socket>) -> Self {
        Self {
            closed: AtomicBool::new(false),
            read_waker: AtomicWaker::new(),
            write_waker: AtomicWaker::new(),
            cancel,
            socket: Mutex::new(socket),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Closable for ConnState {
    fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        self.read_waker.wake();
        self.write_waker.wake();
        self.cancel.cancel();

        let socket = self
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match socket.map(|socket| socket.shutdown(Shutdown::Both)) {
            // The peer may have torn the connection down already
            Some(Err(e)) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

/// An accepted connection handed to a [`StreamHandler`]
///
/// Once closed, by the handler or by the server, every read and write fails
/// with [`closed_error`].
pub struct Connection {
    stream: BoxStream,
    state: Arc<OnceClose<ConnState>>,
    local_addr: NetAddr,
    peer_addr: NetAddr,
}

impl Connection {
    pub(crate) fn new(
        stream: BoxStream,
        state: Arc<OnceClose<ConnState>>,
        local_addr: NetAddr,
        peer_addr: NetAddr,
    ) -> Self {
        Self {
            stream,
            state,
            local_addr,
            peer_addr,
        }
    }

    /// Clones of the close state and addresses, for rebuilding the
    /// connection over a wrapped stream
    pub(crate) fn parts(&self) -> (Arc<OnceClose<ConnState>>, NetAddr, NetAddr) {
        (
            Arc::clone(&self.state),
            self.local_addr.clone(),
            self.peer_addr.clone(),
        )
    }

    pub fn local_addr(&self) -> &NetAddr {
        &self.local_addr
    }

    pub fn peer_addr(&self) -> &NetAddr {
        &self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.state.get_ref().is_closed()
    }

    /// Close the connection; later calls return the first outcome
    pub fn close(&self) -> io::Result<()> {
        self.state.close()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let state = this.state.get_ref();
        if state.is_closed() {
            return Poll::Ready(Err(closed_error()));
        }
        state.read_waker.register(cx.waker());
        if state.is_closed() {
            return Poll::Ready(Err(closed_error()));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let state = this.state.get_ref();
        if state.is_closed() {
            return Poll::Ready(Err(closed_error()));
        }
        state.write_waker.register(cx.waker());
        if state.is_closed() {
            return Poll::Ready(Err(closed_error()));
        }
        Pin::new(&mut this.stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.state.get_ref().is_closed() {
            return Poll::Ready(Err(closed_error()));
        }
        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.state.get_ref().is_closed() {
            return Poll::Ready(Err(closed_error()));
        }
        Pin::new(&mut this.stream).poll_shutdown(cx)
    }
}

/// Closes and untracks a connection when its task ends, however it ends
struct ConnGuard {
    shared: Arc<Shared>,
    id: u64,
    state: Arc<OnceClose<ConnState>>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        if let Err(e) = self.state.close() {
            debug!("Error closing connection: {}", e);
        }
        self.shared.connections.remove(self.id);
    }
}

struct Shared {
    addr: String,
    handler: Arc<dyn StreamHandler>,
    options: ServerOptions,
    state: ServerState,
    listeners: TrackedSet<Arc<OnceClose<ListenerCloser>>>,
    connections: TrackedSet<Arc<OnceClose<ConnState>>>,
}

/// Connection-oriented server
///
/// Cheap to clone; clones control the same server.
#[derive(Clone)]
pub struct StreamServer {
    inner: Arc<Shared>,
}

impl StreamServer {
    /// Create a server for `addr` (used by the `listen_and_serve` family)
    pub fn new<H: StreamHandler + 'static>(addr: impl Into<String>, handler: H) -> Self {
        Self::with_options(addr, handler, ServerOptions::default())
    }

    /// Create a server with a base-context factory and/or panic hook
    pub fn with_options<H: StreamHandler + 'static>(
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
                listeners: TrackedSet::new(),
                connections: TrackedSet::new(),
            }),
        }
    }

    /// Configured listen address
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// Number of connections currently tracked
    pub fn active_connections(&self) -> usize {
        self.inner.connections.len()
    }

    /// Number of listeners currently tracked
    pub fn active_listeners(&self) -> usize {
        self.inner.listeners.len()
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
        let listener = listen_stream(&self.inner.addr).await?;
        self.serve(listener).await
    }

    /// Bind the configured address and serve it over TLS
    pub async fn listen_and_serve_tls(&self, cert: &str, key: &str) -> Result<()> {
        self.ensure_running()?;
        let acceptor = tls::create_tls_acceptor(cert, key)?;
        let listener = listen_stream(&self.inner.addr).await?;
        self.serve_listener(Arc::new(listener), Some(Arc::new(acceptor)))
            .await
    }

    /// Serve TLS connections accepted from `listener`
    pub async fn serve_tls<L: Listener + 'static>(
        &self,
        listener: L,
        cert: &str,
        key: &str,
    ) -> Result<()> {
        self.ensure_running()?;
        let acceptor = tls::create_tls_acceptor(cert, key)?;
        self.serve_listener(Arc::new(listener), Some(Arc::new(acceptor)))
            .await
    }

    /// Serve connections accepted from `listener` until it fails or the
    /// server stops
    pub async fn serve<L: Listener + 'static>(&self, listener: L) -> Result<()> {
        self.serve_listener(Arc::new(listener), None).await
    }

    async fn serve_listener(
        &self,
        listener: Arc<dyn Listener>,
        tls: Option<Arc<SslAcceptor>>,
    ) -> Result<()> {
        self.ensure_running()?;
        let local = listener.local_addr()?;

        let tracked = Arc::new(OnceClose::for_addr(ListenerCloser::new(listener), &local));
        let id = next_resource_id();
        self.inner.listeners.insert(id, Arc::clone(&tracked));

        let result = if self.inner.state.is_running() {
            info!("Stream server listening on {}", local);
            let base = self.inner.options.base_context(&local);
            self.accept_loop(&tracked, &local, &base, tls).await
        } else {
            Err(ProxyError::ServerClosed)
        };

        if let Err(e) = tracked.close() {
            debug!("Error closing listener {}: {}", local, e);
        }
        self.inner.listeners.remove(id);
        result
    }

    async fn accept_loop(
        &self,
        listener: &OnceClose<ListenerCloser>,
        local: &NetAddr,
        base: &Context,
        tls: Option<Arc<SslAcceptor>>,
    ) -> Result<()> {
        let mut backoff = Backoff::new();
        loop {
            match listener.accept().await {
                Ok(Incoming::Accepted(conn)) => {
                    backoff.reset();
                    self.spawn_connection(conn, base, tls.clone());
                }
                Ok(Incoming::Skip(conn)) => {
                    backoff.reset();
                    debug!("Skipped connection from {}", conn.peer_addr);
                }
                Err(e) => on_accept_error(&self.inner.state, &mut backoff, local, e).await?,
            }
        }
    }

    fn spawn_connection(&self, accepted: Accepted, base: &Context, tls: Option<Arc<SslAcceptor>>) {
        let (ctx, cancel) = base.child();
        let state = Arc::new(OnceClose::new(ConnState::new(cancel, accepted.socket)));
        let id = next_resource_id();
        self.inner.connections.insert(id, Arc::clone(&state));

        let conn = Connection::new(
            accepted.stream,
            Arc::clone(&state),
            accepted.local_addr,
            accepted.peer_addr,
        );
        if self.inner.state.is_closed() {
            // close() may have taken its snapshot before the insert
            let _ = state.close();
        }

        let shared = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let local = conn.local_addr().clone();
            let peer = conn.peer_addr().clone();
            debug!("Accepted connection from {} on {}", peer, local);

            let _guard = ConnGuard {
                shared: Arc::clone(&shared),
                id,
                state,
            };
            let handler = Arc::clone(&shared.handler);
            let task = async move {
                let conn = match tls {
                    Some(acceptor) => match tls::accept_connection(&acceptor, conn).await {
                        Ok(conn) => conn,
                        Err(e) => {
                            debug!("TLS handshake failed: {}", e);
                            return;
                        }
                    },
                    None => conn,
                };
                handler.serve_stream(ctx, conn).await;
            };
            run_isolated(task, &shared.options, &local, &peer).await;
        });
    }

    /// Stop immediately: close all listeners and connections
    ///
    /// Close errors are joined into one error.
    pub fn close(&self) -> Result<()> {
        self.inner.state.set_closed();
        info!("Closing stream server {}", self.inner.addr);

        let mut errors = close_tracked(&self.inner.listeners);
        errors.extend(close_tracked(&self.inner.connections));
        ProxyError::join(errors)
    }

    /// Stop accepting and wait for connections to finish
    ///
    /// Returns the context's error if it is done first; the remaining
    /// connections stay open until `close`.
    pub async fn shutdown(&self, ctx: &Context) -> Result<()> {
        if !self.inner.state.claim_shutdown() {
            return Err(ProxyError::ServerClosed);
        }
        info!("Shutting down stream server {}", self.inner.addr);

        let errors = close_tracked(&self.inner.listeners);
        let connections = &self.inner.connections;
        drain(ctx, || connections.is_empty()).await?;
        ProxyError::join(errors)
    }
}
