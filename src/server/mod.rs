//! Server lifecycle
//!
//! [`StreamServer`] and [`DatagramServer`] share the pieces in this module:
//! the running/shutting-down/closed flag, accept-error backoff, panic
//! recovery for per-connection tasks and the shutdown drain loop.

pub mod datagram;
pub mod stream;
pub mod virtual_conn;

use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use log::{error, warn};
use tokio::time::{self, MissedTickBehavior};

use crate::common::{Context, ProxyError, Result};
use crate::net::{is_closed_error, Closable, NetAddr, OnceClose, TrackedSet};

pub use datagram::{datagram_handler_fn, DatagramHandler, DatagramHandlerFn, DatagramServer};
pub use stream::{stream_handler_fn, Connection, StreamHandler, StreamHandlerFn, StreamServer};
pub use virtual_conn::VirtualConn;

/// First sleep after a temporary accept error
const BACKOFF_INITIAL: Duration = Duration::from_millis(1);
/// Upper bound for the accept-error sleep
const BACKOFF_MAX: Duration = Duration::from_millis(512);
/// How often `shutdown` checks whether connections have drained
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Longest stack trace written for a recovered panic
const MAX_PANIC_TRACE: usize = 64 * 1024;

const STATE_RUNNING: u8 = 0;
const STATE_SHUTTING_DOWN: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Monotonic running → shutting-down → closed flag
pub(crate) struct ServerState(AtomicU8);

impl ServerState {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(STATE_RUNNING))
    }

    pub(crate) fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire) == STATE_RUNNING
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.0.load(Ordering::Acquire) == STATE_CLOSED
    }

    /// Move from running to shutting-down; `false` if another call got there first
    pub(crate) fn claim_shutdown(&self) -> bool {
        self.0
            .compare_exchange(
                STATE_RUNNING,
                STATE_SHUTTING_DOWN,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn set_closed(&self) {
        self.0.store(STATE_CLOSED, Ordering::Release);
    }
}

/// Exponential sleep between failed accepts
#[derive(Debug, Default)]
pub(crate) struct Backoff {
    current: Option<Duration>,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The next sleep: 1 ms, doubling up to 512 ms
    pub(crate) fn next(&mut self) -> Duration {
        let next = match self.current {
            None => BACKOFF_INITIAL,
            Some(current) => (current * 2).min(BACKOFF_MAX),
        };
        self.current = Some(next);
        next
    }

    pub(crate) fn reset(&mut self) {
        self.current = None;
    }
}

/// Whether an accept or receive error is worth retrying
pub fn is_temporary(err: &io::Error) -> bool {
    use io::ErrorKind::*;

    if matches!(
        err.kind(),
        TimedOut | WouldBlock | Interrupted | ConnectionAborted | ConnectionReset
    ) {
        return true;
    }
    // EMFILE, ENFILE, ENOBUFS, ENOMEM
    matches!(err.raw_os_error(), Some(24 | 23 | 105 | 12))
}

/// Decide what an accept loop does after `err`
///
/// Returns `Ok` after sleeping when the loop should retry, or the error the
/// loop should return.
pub(crate) async fn on_accept_error(
    state: &ServerState,
    backoff: &mut Backoff,
    local: &NetAddr,
    err: io::Error,
) -> Result<()> {
    if !state.is_running() {
        return Err(ProxyError::ServerClosed);
    }
    if is_closed_error(&err) {
        return Err(ProxyError::Io(err));
    }
    if is_temporary(&err) {
        let delay = backoff.next();
        warn!("Accept error on {}: {}; retrying in {:?}", local, err, delay);
        time::sleep(delay).await;
        return Ok(());
    }
    error!("Accept error on {}: {}", local, err);
    Err(ProxyError::Io(err))
}

/// Builds the base context for one listener from its local address
pub type BaseContextFn = Arc<dyn Fn(&NetAddr) -> Context + Send + Sync>;

/// Receives a recovered panic payload with the local and peer addresses
pub type PanicHook = Arc<dyn Fn(&(dyn Any + Send), &NetAddr, &NetAddr) + Send + Sync>;

/// Panic payload that aborts a handler without a logged stack trace
///
/// Raise it with `std::panic::panic_any(AbortHandler)`.
#[derive(Debug, Clone, Copy)]
pub struct AbortHandler;

/// Hooks shared by both server kinds
#[derive(Clone, Default)]
pub struct ServerOptions {
    base_context: Option<BaseContextFn>,
    panic_hook: Option<PanicHook>,
}

impl ServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive every connection context from `f(local_addr)` instead of a
    /// background context
    pub fn with_base_context<F>(mut self, f: F) -> Self
    where
        F: Fn(&NetAddr) -> Context + Send + Sync + 'static,
    {
        self.base_context = Some(Arc::new(f));
        self
    }

    /// Hand recovered handler panics to `hook` instead of the log
    pub fn with_panic_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&(dyn Any + Send), &NetAddr, &NetAddr) + Send + Sync + 'static,
    {
        self.panic_hook = Some(Arc::new(hook));
        self
    }

    pub(crate) fn base_context(&self, local: &NetAddr) -> Context {
        match &self.base_context {
            Some(f) => f(local),
            None => Context::background(),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "Box<dyn Any>"
    }
}

fn truncate_trace(mut trace: String) -> String {
    if trace.len() > MAX_PANIC_TRACE {
        let mut end = MAX_PANIC_TRACE;
        while !trace.is_char_boundary(end) {
            end -= 1;
        }
        trace.truncate(end);
    }
    trace
}

pub(crate) fn report_panic(
    options: &ServerOptions,
    payload: Box<dyn Any + Send>,
    local: &NetAddr,
    peer: &NetAddr,
) {
    if let Some(hook) = &options.panic_hook {
        hook(payload.as_ref(), local, peer);
        return;
    }
    if payload.is::<AbortHandler>() {
        return;
    }
    let trace = truncate_trace(Backtrace::force_capture().to_string());
    error!(
        "Panic serving {} on {}: {}\n{}",
        peer,
        local,
        panic_message(payload.as_ref()),
        trace
    );
}

/// Run one connection's work, recovering a panic instead of unwinding
/// further
pub(crate) async fn run_isolated<F>(task: F, options: &ServerOptions, local: &NetAddr, peer: &NetAddr)
where
    F: Future<Output = ()>,
{
    if let Err(payload) = AssertUnwindSafe(task).catch_unwind().await {
        report_panic(options, payload, local, peer);
    }
}

/// Close every tracked entry, then untrack it
pub(crate) fn close_tracked<C: Closable>(set: &TrackedSet<Arc<OnceClose<C>>>) -> Vec<ProxyError> {
    let mut errors = Vec::new();
    for (id, entry) in set.snapshot() {
        if let Err(e) = entry.close() {
            errors.push(ProxyError::Io(e));
        }
        set.remove(id);
    }
    errors
}

/// Wait until `is_idle` reports true, polling every 100 ms, or until `ctx`
/// is done
pub(crate) async fn drain<F>(ctx: &Context, is_idle: F) -> Result<()>
where
    F: Fn() -> bool,
{
    let mut ticker = time::interval(SHUTDOWN_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut done = ctx.done();

    loop {
        if is_idle() {
            return Ok(());
        }
        tokio::select! {
            _ = &mut done => return Err(ctx.err().unwrap_or(ProxyError::Canceled)),
            _ = ticker.tick() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Mutex;

    #[test]
    fn test_backoff_sequence() {
        let mut backoff = Backoff::new();
        let millis: Vec<u128> = (0..11).map(|_| backoff.next().as_millis()).collect();
        assert_eq!(millis, vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 512]);

        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_millis(1));
    }

    #[test]
    fn test_state_transitions() {
        let state = ServerState::new();
        assert!(state.is_running());
        assert!(state.claim_shutdown());
        assert!(!state.claim_shutdown());
        assert!(!state.is_running());

        state.set_closed();
        assert!(state.is_closed());
        assert!(!state.claim_shutdown());
    }

    #[test]
    fn test_temporary_errors() {
        assert!(is_temporary(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_temporary(&io::Error::from_raw_os_error(24)));
        assert!(!is_temporary(&io::Error::from(io::ErrorKind::InvalidInput)));
    }

    #[test]
    fn test_trace_truncated_on_char_boundary() {
        let long = "é".repeat(MAX_PANIC_TRACE);
        let trace = truncate_trace(long);
        assert!(trace.len() <= MAX_PANIC_TRACE);
        assert!(trace.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_panic_hook_replaces_logging() {
        let seen = Arc::new(Mutex::new(None));
        let options = {
            let seen = seen.clone();
            ServerOptions::new().with_panic_hook(move |payload, _local, peer| {
                *seen.lock().unwrap() = Some((panic_message(payload).to_string(), peer.clone()));
            })
        };
        let local = NetAddr::Unix("@local".to_string());
        let peer = NetAddr::Unix("@peer".to_string());

        report_panic(&options, Box::new("boom"), &local, &peer);
        let seen = seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen.0, "boom");
        assert_eq!(seen.1, peer);
    }

    #[tokio::test]
    async fn test_run_isolated_recovers_panic() {
        let hooked = Arc::new(AtomicBool::new(false));
        let options = {
            let hooked = hooked.clone();
            ServerOptions::new().with_panic_hook(move |payload, _, _| {
                hooked.store(payload.is::<AbortHandler>(), Ordering::SeqCst);
            })
        };
        let addr = NetAddr::Unix(String::new());

        run_isolated(
            async {
                std::panic::panic_any(AbortHandler);
            },
            &options,
            &addr,
            &addr,
        )
        .await;
        assert!(hooked.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_returns_deadline_error() {
        let ctx = Context::with_timeout(Duration::from_millis(250));
        let polls = AtomicUsize::new(0);

        let result = drain(&ctx, || {
            polls.fetch_add(1, Ordering::SeqCst);
            false
        })
        .await;
        assert!(matches!(result, Err(ProxyError::DeadlineExceeded)));
        // Polled at 0, 100 and 200 ms
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_drain_returns_when_idle() {
        let ctx = Context::background();
        assert!(drain(&ctx, || true).await.is_ok());
    }
}
