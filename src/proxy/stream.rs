//! Bidirectional stream proxy

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use log::debug;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time;

use super::dialer::RoundRobinDialer;
use super::forwarder::copy_counted;
use crate::common::{copy_buffers, BufferPool, Context};
use crate::net::{is_closed_error, BoxStream, NetAddr};
use crate::server::{Connection, StreamHandler};

/// Opens the upstream for one downstream connection
pub type StreamDialFn =
    Arc<dyn Fn(&Connection) -> BoxFuture<'static, io::Result<BoxStream>> + Send + Sync>;

/// Receives the first error of a session together with the peer address
pub type ErrorHandler = Arc<dyn Fn(&NetAddr, &io::Error) + Send + Sync>;

/// How long the remaining direction may go without moving data once the
/// other side has finished
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
enum Direction {
    Upload,
    Download,
}

/// Relays bytes between each downstream connection and a freshly dialed
/// upstream
///
/// When one side finishes, the other direction keeps running while it
/// still moves data; a drain timeout without progress ends the session.
#[derive(Clone)]
pub struct StreamProxy {
    dial: StreamDialFn,
    error_handler: Option<ErrorHandler>,
    buffers: BufferPool,
    drain_timeout: Duration,
}

impl StreamProxy {
    /// Proxy to the targets of `dialer` in round-robin order
    pub fn new(dialer: Arc<RoundRobinDialer>) -> Self {
        Self::with_dial(move |_conn| {
            let dialer = Arc::clone(&dialer);
            async move { dialer.dial_stream().await }
        })
    }

    /// Proxy to whatever `dial` returns for each connection
    pub fn with_dial<F, Fut>(dial: F) -> Self
    where
        F: Fn(&Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<BoxStream>> + Send + 'static,
    {
        let dial: StreamDialFn = Arc::new(
            move |conn: &Connection| -> BoxFuture<'static, io::Result<BoxStream>> {
                Box::pin(dial(conn))
            },
        );
        Self {
            dial,
            error_handler: None,
            buffers: copy_buffers(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Report dial failures and the first copy error of a session to `f`
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&NetAddr, &io::Error) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(f));
        self
    }

    /// Take copy buffers from `pool` instead of the shared 16 KiB pool
    pub fn with_buffers(mut self, pool: BufferPool) -> Self {
        self.buffers = pool;
        self
    }

    /// Idle time allowed to the remaining direction after the other ends
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    fn report(&self, peer: &NetAddr, err: &io::Error) {
        match &self.error_handler {
            Some(handler) => handler(peer, err),
            None => debug!("Proxy session for {} failed: {}", peer, err),
        }
    }

    /// Relay `conn` to a new upstream until both directions finish
    pub async fn serve(&self, ctx: Context, conn: Connection) {
        let peer = conn.peer_addr().clone();
        let dialing = (self.dial)(&conn);
        let upstream = match dialing.await {
            Ok(upstream) => upstream,
            Err(e) => {
                self.report(&peer, &e);
                return;
            }
        };

        let (mut down_read, mut down_write) = tokio::io::split(conn);
        let (mut up_read, mut up_write) = tokio::io::split(upstream);
        let (results, mut outcomes) = mpsc::channel::<(Direction, io::Result<u64>)>(2);
        let uploaded = Arc::new(AtomicU64::new(0));
        let downloaded = Arc::new(AtomicU64::new(0));

        let upload = {
            let results = results.clone();
            let pool = self.buffers.clone();
            let progress = Arc::clone(&uploaded);
            tokio::spawn(async move {
                let mut result = copy_counted(&mut down_read, &mut up_write, &pool, &progress).await;
                if result.is_ok() {
                    // Downstream EOF: half-close upstream
                    if let Err(e) = up_write.shutdown().await {
                        result = Err(e);
                    }
                }
                let _ = results.send((Direction::Upload, result)).await;
            })
        };
        let download = {
            let pool = self.buffers.clone();
            let progress = Arc::clone(&downloaded);
            tokio::spawn(async move {
                let mut result = copy_counted(&mut up_read, &mut down_write, &pool, &progress).await;
                if result.is_ok() {
                    if let Err(e) = down_write.shutdown().await {
                        result = Err(e);
                    }
                }
                let _ = results.send((Direction::Download, result)).await;
            })
        };

        let mut done = ctx.done();
        let mut pending = 2;
        // Progress counter of the direction still running, and its last value
        let mut draining: Option<(&AtomicU64, u64)> = None;
        while pending > 0 {
            let outcome = tokio::select! {
                outcome = outcomes.recv() => outcome,
                _ = &mut done => {
                    debug!("Context done, ending proxy session for {}", peer);
                    break;
                }
                _ = time::sleep(self.drain_timeout), if draining.is_some() => {
                    if let Some((progress, seen)) = draining.as_mut() {
                        let now = progress.load(Ordering::Relaxed);
                        if now == *seen {
                            debug!("Proxy session for {} idle after one side ended", peer);
                            break;
                        }
                        *seen = now;
                    }
                    continue;
                }
            };
            match outcome {
                Some((direction, Ok(bytes))) => {
                    debug!("{:?} for {} finished after {} bytes", direction, peer, bytes);
                    pending -= 1;
                    let remaining = match direction {
                        Direction::Upload => downloaded.as_ref(),
                        Direction::Download => uploaded.as_ref(),
                    };
                    draining = Some((remaining, remaining.load(Ordering::Relaxed)));
                }
                Some((direction, Err(e))) => {
                    if !is_closed_error(&e) {
                        self.report(&peer, &e);
                    }
                    debug!("{:?} for {} failed: {}", direction, peer, e);
                    break;
                }
                // Both copy tasks are gone
                None => break,
            }
        }

        // Dropping the halves releases both sockets before returning
        upload.abort();
        download.abort();
        let _ = upload.await;
        let _ = download.await;
    }
}

impl StreamHandler for StreamProxy {
    fn serve_stream(&self, ctx: Context, conn: Connection) -> BoxFuture<'_, ()> {
        Box::pin(self.serve(ctx, conn))
    }
}
