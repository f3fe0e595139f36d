//! Datagram proxy with idle timeout

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use log::debug;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use super::dialer::RoundRobinDialer;
use super::stream::ErrorHandler;
use crate::common::Context;
use crate::net::{is_closed_error, DatagramConn, NetAddr};
use crate::server::datagram::MAX_DATAGRAM_SIZE;
use crate::server::{DatagramHandler, VirtualConn};

/// Session length without traffic after which a session is torn down
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens the upstream socket for one peer session
pub type DatagramDialFn =
    Arc<dyn Fn(&VirtualConn) -> BoxFuture<'static, io::Result<DatagramConn>> + Send + Sync>;

/// Time of the last relayed datagram, shared by both directions
struct Activity {
    origin: Instant,
    last_micros: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_micros: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let micros = self.origin.elapsed().as_micros() as u64;
        self.last_micros.fetch_max(micros, Ordering::AcqRel);
    }

    fn last(&self) -> Instant {
        self.origin + Duration::from_micros(self.last_micros.load(Ordering::Acquire))
    }
}

/// Errors that end a session without being reported
fn is_clean_close(err: &io::Error) -> bool {
    is_closed_error(err) || err.kind() == io::ErrorKind::UnexpectedEof
}

async fn relay_to_upstream(
    conn: &VirtualConn,
    upstream: &DatagramConn,
    activity: &Activity,
) -> io::Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let n = conn.read(&mut buf).await?;
        upstream.send(&buf[..n]).await?;
        activity.touch();
    }
}

async fn relay_to_peer(
    conn: &VirtualConn,
    upstream: &DatagramConn,
    activity: &Activity,
) -> io::Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let n = upstream.recv(&mut buf).await?;
        conn.write(&buf[..n]).await?;
        activity.touch();
    }
}

/// Relays datagrams between each peer session and its own upstream socket
#[derive(Clone)]
pub struct DatagramProxy {
    dial: DatagramDialFn,
    idle_timeout: Duration,
    error_handler: Option<ErrorHandler>,
}

impl DatagramProxy {
    /// Proxy to the targets of `dialer` in round-robin order
    pub fn new(dialer: Arc<RoundRobinDialer>) -> Self {
        Self::with_dial(move |_conn| {
            let dialer = Arc::clone(&dialer);
            async move { dialer.dial_datagram().await }
        })
    }

    /// Proxy to whatever `dial` returns for each session
    pub fn with_dial<F, Fut>(dial: F) -> Self
    where
        F: Fn(&VirtualConn) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<DatagramConn>> + Send + 'static,
    {
        let dial: DatagramDialFn = Arc::new(
            move |conn: &VirtualConn| -> BoxFuture<'static, io::Result<DatagramConn>> {
                Box::pin(dial(conn))
            },
        );
        Self {
            dial,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            error_handler: None,
        }
    }

    /// End sessions after `timeout` without traffic in either direction
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Report dial failures and session errors to `f`
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&NetAddr, &io::Error) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(f));
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    fn report(&self, peer: &NetAddr, err: &io::Error) {
        match &self.error_handler {
            Some(handler) => handler(peer, err),
            None => debug!("Datagram session for {} failed: {}", peer, err),
        }
    }

    /// Relay `conn` until it goes idle, fails or is closed
    pub async fn serve(&self, ctx: Context, conn: VirtualConn) {
        let peer = conn.remote_addr().clone();
        let dialing = (self.dial)(&conn);
        let upstream = match dialing.await {
            Ok(upstream) => Arc::new(upstream),
            Err(e) => {
                self.report(&peer, &e);
                return;
            }
        };
        let conn = Arc::new(conn);
        let activity = Arc::new(Activity::new());
        let (results, mut outcomes) = mpsc::channel::<io::Result<()>>(2);

        let upload = {
            let (conn, upstream, activity, results) =
                (conn.clone(), upstream.clone(), activity.clone(), results.clone());
            tokio::spawn(async move {
                let result = relay_to_upstream(&conn, &upstream, &activity).await;
                let _ = results.send(result).await;
            })
        };
        let download = {
            let (conn, upstream, activity) = (conn.clone(), upstream.clone(), activity.clone());
            tokio::spawn(async move {
                let result = relay_to_peer(&conn, &upstream, &activity).await;
                let _ = results.send(result).await;
            })
        };

        let mut done = ctx.done();
        loop {
            let deadline = activity.last() + self.idle_timeout;
            tokio::select! {
                outcome = outcomes.recv() => {
                    if let Some(Err(e)) = outcome {
                        if !is_clean_close(&e) {
                            self.report(&peer, &e);
                        }
                    }
                    break;
                }
                _ = time::sleep_until(deadline) => {
                    if activity.last() + self.idle_timeout <= Instant::now() {
                        debug!("Datagram session for {} idle, closing", peer);
                        break;
                    }
                }
                _ = &mut done => break,
            }
        }

        upload.abort();
        download.abort();
        if let Err(e) = conn.close() {
            debug!("Error closing session for {}: {}", peer, e);
        }
    }
}

impl DatagramHandler for DatagramProxy {
    fn serve_datagram(&self, ctx: Context, conn: VirtualConn) -> BoxFuture<'_, ()> {
        Box::pin(self.serve(ctx, conn))
    }
}
