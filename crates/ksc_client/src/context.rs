//! Per-call cancellation and deadlines.
//!
//! Every public operation takes a [`CallContext`]. Cancelling its token or
//! passing its deadline aborts the in-flight request and any wait between
//! polls; both surface as [`KscError::Cancelled`].

use crate::error::{CancelReason, KscError, KscResult};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest single sleep; longer requests are clamped to it.
const MAX_SLEEP: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// A cancellation signal shared between a caller and the calls it starts.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

impl CancelToken {
    /// Creates a token that has not fired.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the token and wakes every waiter.
    pub fn cancel(&self) {
        let mut cancelled = self.inner.cancelled.lock();
        *cancelled = true;
        self.inner.cond.notify_all();
    }

    /// Returns true once the token has fired.
    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// Blocks for up to `timeout`. Returns true if the token fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut cancelled = self.inner.cancelled.lock();
        if *cancelled {
            return true;
        }
        let _ = self.inner.cond.wait_for(&mut cancelled, timeout);
        *cancelled
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Cancellation token and deadline for one operation.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: Option<CancelToken>,
    deadline: Option<Instant>,
}

impl CallContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context bound to a cancel token.
    pub fn with_cancel(token: CancelToken) -> Self {
        Self {
            cancel: Some(token),
            deadline: None,
        }
    }

    /// A context that expires after `timeout`.
    ///
    /// A timeout too large to represent as an instant means no deadline.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancel: None,
            deadline: Instant::now().checked_add(timeout),
        }
    }

    /// Adds a cancel token.
    #[must_use]
    pub fn cancelled_by(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Adds (or tightens) a deadline.
    #[must_use]
    pub fn deadline_at(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` without a deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Why this context is done, if it is.
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Some(CancelReason::Requested);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelReason::DeadlineExceeded),
            _ => None,
        }
    }

    /// Fails if the context is cancelled or expired.
    pub fn check(&self) -> KscResult<()> {
        match self.cancel_reason() {
            Some(reason) => Err(KscError::cancelled(reason)),
            None => Ok(()),
        }
    }

    /// Sleeps for `duration`, waking early on cancellation or deadline.
    pub fn sleep(&self, duration: Duration) -> KscResult<()> {
        self.check()?;
        let wake_at = Instant::now() + duration.min(MAX_SLEEP);
        let (until, cut_short) = match self.deadline {
            Some(deadline) if deadline < wake_at => (deadline, true),
            _ => (wake_at, false),
        };

        loop {
            let left = until.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            match &self.cancel {
                Some(token) => {
                    if token.wait_timeout(left) {
                        return Err(KscError::cancelled(CancelReason::Requested));
                    }
                }
                None => std::thread::sleep(left),
            }
        }

        if cut_short {
            return Err(KscError::cancelled(CancelReason::DeadlineExceeded));
        }
        Ok(())
    }

    /// The timeout for a single request: the time left, or `default`.
    pub(crate) fn request_timeout(&self, default: Duration) -> Duration {
        self.remaining().unwrap_or(default)
    }

    /// A detached context for cleanup calls made after this one is done.
    pub(crate) fn detached(timeout: Duration) -> Self {
        Self::with_timeout(timeout)
    }
}
