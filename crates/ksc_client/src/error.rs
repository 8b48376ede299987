//! Error types for the client core.

use ksc_codec::{CodecError, PxgError};
use std::fmt;
use thiserror::Error;

/// Result type for client operations.
pub type KscResult<T> = Result<T, KscError>;

/// A server-side handle an error relates to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleRef {
    /// A result-set accessor or iterator id.
    Accessor(String),
    /// An async action GUID.
    Action(String),
    /// A settings-storage handle.
    Storage(String),
}

impl fmt::Display for HandleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleRef::Accessor(id) => write!(f, "accessor {}", id),
            HandleRef::Action(id) => write!(f, "action {}", id),
            HandleRef::Storage(id) => write!(f, "storage {}", id),
        }
    }
}

/// Where a failing call was going.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallSite {
    /// Endpoint path, e.g. `HostGroup.FindHosts`.
    pub endpoint: String,
    /// Redacted session identity, when a session token was in use.
    pub session: Option<String>,
    /// The handle the call operated on.
    pub handle: Option<HandleRef>,
}

impl CallSite {
    /// Creates a call site for an endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            session: None,
            handle: None,
        }
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.endpoint)?;
        if let Some(session) = &self.session {
            write!(f, " [session {}]", session)?;
        }
        if let Some(handle) = &self.handle {
            write!(f, " [{}]", handle)?;
        }
        Ok(())
    }
}

/// Why a call was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller's cancel token fired.
    Requested,
    /// The call's deadline passed.
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Requested => f.write_str("cancelled by caller"),
            CancelReason::DeadlineExceeded => f.write_str("deadline exceeded"),
        }
    }
}

/// Errors surfaced by the client core.
#[derive(Error, Debug)]
pub enum KscError {
    /// DNS, TCP, TLS, HTTP framing or gzip failure.
    #[error("transport error calling {site}: {message}")]
    Transport {
        /// Failing call.
        site: Box<CallSite>,
        /// Error message.
        message: String,
        /// Whether the caller may retry.
        retryable: bool,
    },

    /// The call was cancelled or timed out.
    #[error("{} ({reason})", site.as_ref().map(|s| s.endpoint.as_str()).unwrap_or("operation"))]
    Cancelled {
        /// Call in flight when cancellation was observed, if any.
        site: Option<Box<CallSite>>,
        /// Cancel or deadline.
        reason: CancelReason,
    },

    /// The reply was not a well-formed envelope.
    #[error("malformed reply from {site}: {source}")]
    Envelope {
        /// Failing call.
        site: Box<CallSite>,
        /// Codec diagnostic.
        #[source]
        source: CodecError,
    },

    /// The server answered with an in-band `PxgError`.
    #[error("server error from {site} (HTTP {status}): {error}")]
    Server {
        /// Failing call.
        site: Box<CallSite>,
        /// HTTP status of the reply carrying the error.
        status: u16,
        /// The server's error, verbatim.
        error: PxgError,
    },

    /// A non-success HTTP status without a `PxgError` body.
    #[error("HTTP {status} from {site}")]
    Http {
        /// Failing call.
        site: Box<CallSite>,
        /// HTTP status.
        status: u16,
        /// Raw body, lossily decoded.
        body: String,
    },

    /// An async action finalized unsuccessfully.
    #[error("action {guid} failed: {error}")]
    ActionFailed {
        /// The state-check call that observed the failure.
        site: Box<CallSite>,
        /// Action GUID.
        guid: String,
        /// Error tuple extracted from the action's state data.
        error: PxgError,
    },

    /// Local pre-flight rejection; no request was sent.
    #[error("validation failed: {message}")]
    Validation {
        /// What was wrong.
        message: String,
    },

    /// The accessor was released by this client.
    #[error("accessor {id} has been released")]
    AccessorReleased {
        /// Accessor id.
        id: String,
    },
}

impl KscError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(site: CallSite, message: impl Into<String>) -> Self {
        Self::Transport {
            site: Box::new(site),
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(site: CallSite, message: impl Into<String>) -> Self {
        Self::Transport {
            site: Box::new(site),
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a cancellation error not tied to a call.
    pub fn cancelled(reason: CancelReason) -> Self {
        Self::Cancelled { site: None, reason }
    }

    /// Returns true if this error can be retried at the caller's discretion.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KscError::Transport { retryable: true, .. })
    }

    /// Returns true for caller cancellation and deadlines.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, KscError::Cancelled { .. })
    }

    /// Returns true for an HTTP 403, with or without a `PxgError` body.
    pub fn is_forbidden(&self) -> bool {
        matches!(
            self,
            KscError::Server { status: 403, .. } | KscError::Http { status: 403, .. }
        )
    }

    /// The server's error, for in-band and async failures.
    pub fn server_error(&self) -> Option<&PxgError> {
        match self {
            KscError::Server { error, .. } | KscError::ActionFailed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// The server's error code, for in-band and async failures.
    pub fn server_code(&self) -> Option<i64> {
        self.server_error().map(|e| e.code)
    }

    /// The call site, when the error came from a request.
    pub fn site(&self) -> Option<&CallSite> {
        match self {
            KscError::Transport { site, .. }
            | KscError::Envelope { site, .. }
            | KscError::Server { site, .. }
            | KscError::Http { site, .. }
            | KscError::ActionFailed { site, .. } => Some(site),
            KscError::Cancelled { site, .. } => site.as_deref(),
            KscError::Validation { .. } | KscError::AccessorReleased { .. } => None,
        }
    }

    /// Attaches a handle to the call site, if the error has one.
    pub(crate) fn with_handle(mut self, handle: HandleRef) -> Self {
        match &mut self {
            KscError::Transport { site, .. }
            | KscError::Envelope { site, .. }
            | KscError::Server { site, .. }
            | KscError::Http { site, .. }
            | KscError::ActionFailed { site, .. } => site.handle = Some(handle),
            KscError::Cancelled { site: Some(site), .. } => site.handle = Some(handle),
            _ => {}
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        let site = CallSite::new("Session.Ping");
        assert!(KscError::transport_retryable(site.clone(), "reset").is_retryable());
        assert!(!KscError::transport_fatal(site, "bad certificate").is_retryable());
        assert!(!KscError::cancelled(CancelReason::Requested).is_retryable());
        assert!(!KscError::validation("empty section").is_retryable());
    }

    #[test]
    fn forbidden_detection() {
        let err = KscError::Http {
            site: Box::new(CallSite::new("Session.Ping")),
            status: 403,
            body: String::new(),
        };
        assert!(err.is_forbidden());

        let err = KscError::Server {
            site: Box::new(CallSite::new("Session.Ping")),
            status: 200,
            error: PxgError::new(1, "x"),
        };
        assert!(!err.is_forbidden());
        assert_eq!(err.server_code(), Some(1));
    }

    #[test]
    fn display_carries_context() {
        let mut site = CallSite::new("ChunkAccessor.GetItemsChunk");
        site.session = Some("nst1…".into());
        let err = KscError::Server {
            site: Box::new(site),
            status: 200,
            error: PxgError::new(1183, "not found"),
        }
        .with_handle(HandleRef::Accessor("acc-9".into()));

        let text = err.to_string();
        assert!(text.contains("ChunkAccessor.GetItemsChunk"));
        assert!(text.contains("session nst1…"));
        assert!(text.contains("accessor acc-9"));
        assert!(text.contains("1183"));
    }

    #[test]
    fn cancelled_display() {
        assert_eq!(
            KscError::cancelled(CancelReason::DeadlineExceeded).to_string(),
            "operation (deadline exceeded)"
        );
    }
}
