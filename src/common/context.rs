//! Cancellation contexts
//!
//! A [`Context`] carries a cancellation signal and an optional deadline down
//! to handlers, and bounds how long [`shutdown`](crate::StreamServer::shutdown)
//! waits for connections to drain. Child contexts are done when their parent
//! is done.

use futures::future::{BoxFuture, FutureExt};
use std::time::Duration;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use super::error::ProxyError;

/// Cancellation signal with an optional deadline
#[derive(Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

/// Cancels the [`Context`] it was created with
#[derive(Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl Context {
    /// A context that is never done
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A context done when the returned handle is cancelled
    pub fn with_cancel() -> (Self, CancelHandle) {
        Self::background().child()
    }

    /// A context done after `timeout` elapses
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// A context done at `deadline`
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// Derive a cancellable child of this context
    ///
    /// The child keeps the parent's deadline.
    pub fn child(&self) -> (Self, CancelHandle) {
        let token = self.token.child_token();
        let handle = CancelHandle {
            token: token.clone(),
        };
        let ctx = Self {
            token,
            deadline: self.deadline,
        };
        (ctx, handle)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Why the context is done, or `None` while it is still live
    pub fn err(&self) -> Option<ProxyError> {
        if self.token.is_cancelled() {
            return Some(ProxyError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ProxyError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Whether the context is done
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves once the context is cancelled or its deadline passes
    pub fn done(&self) -> BoxFuture<'static, ()> {
        let token = self.token.clone();
        let deadline = self.deadline;

        async move {
            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = time::sleep_until(deadline) => {}
                    }
                }
                None => token.cancelled().await,
            }
        }
        .boxed()
    }
}

impl CancelHandle {
    /// Mark the context as cancelled; later calls are no-ops
    pub fn cancel(&self) {
        self.token.cancel();
    }
}
