//! Configuration for the client.

use crate::error::KscError;
use crate::transport::DEFAULT_MAX_REPLY_SIZE;
use std::time::Duration;

/// Default user agent sent with every call.
pub const DEFAULT_USER_AGENT: &str = concat!("ksc-client/", env!("CARGO_PKG_VERSION"));

/// Configuration for a client context.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server base URL (e.g., "https://ksc.example.com:13299").
    pub base_url: String,
    /// User agent sent with every call.
    pub user_agent: String,
    /// Virtual server to log into; `None` means the main server.
    pub vserver: Option<String>,
    /// Whether a Basic login also starts a long-lived session token.
    pub start_session: bool,
    /// Timeout applied to calls whose context carries no deadline.
    pub timeout: Duration,
    /// Async-action polling behaviour.
    pub poll: PollConfig,
    /// Default number of records per accessor fetch.
    pub chunk_size: u32,
    /// Default accessor lifetime requested from the server.
    pub accessor_lifetime: Duration,
    /// Server error codes the client classifies.
    pub codes: ServerCodes,
    /// Largest reply body accepted after gzip inflation.
    pub max_reply_size: usize,
}

impl ClientConfig {
    /// Creates a new client configuration.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            vserver: None,
            start_session: true,
            timeout: Duration::from_secs(30),
            poll: PollConfig::default(),
            chunk_size: 1000,
            accessor_lifetime: Duration::from_secs(600),
            codes: ServerCodes::default(),
            max_reply_size: DEFAULT_MAX_REPLY_SIZE,
        }
    }

    /// Sets the virtual server name.
    #[must_use]
    pub fn with_vserver(mut self, vserver: impl Into<String>) -> Self {
        self.vserver = Some(vserver.into());
        self
    }

    /// Sets the user agent.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Sets whether Basic login starts a long-lived session.
    #[must_use]
    pub fn with_start_session(mut self, start: bool) -> Self {
        self.start_session = start;
        self
    }

    /// Sets the default per-call timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the polling configuration.
    #[must_use]
    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Sets the default accessor chunk size.
    #[must_use]
    pub fn with_chunk_size(mut self, size: u32) -> Self {
        self.chunk_size = size;
        self
    }

    /// Sets the default accessor lifetime.
    #[must_use]
    pub fn with_accessor_lifetime(mut self, lifetime: Duration) -> Self {
        self.accessor_lifetime = lifetime;
        self
    }

    /// Sets the server error code classification.
    #[must_use]
    pub fn with_codes(mut self, codes: ServerCodes) -> Self {
        self.codes = codes;
        self
    }

    /// Sets the largest reply body accepted after gzip inflation.
    #[must_use]
    pub fn with_max_reply_size(mut self, limit: usize) -> Self {
        self.max_reply_size = limit;
        self
    }

    /// Checks the configuration before a client is built from it.
    pub fn validate(&self) -> Result<(), KscError> {
        if !(self.base_url.starts_with("https://") || self.base_url.starts_with("http://")) {
            return Err(KscError::validation(format!(
                "base URL must be http(s), got {:?}",
                self.base_url
            )));
        }
        if self.chunk_size == 0 {
            return Err(KscError::validation("chunk size must be positive"));
        }
        if self.max_reply_size == 0 {
            return Err(KscError::validation("max reply size must be positive"));
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("https://localhost:13299")
    }
}

/// Configuration for async-action polling.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Delay used when the server gives no `lNextCheckDelay`.
    pub default_delay: Duration,
    /// Floor under every delay, whatever the server advises.
    pub min_delay: Duration,
    /// Timeout for the best-effort cancel call made after a context cancel.
    pub cancel_timeout: Duration,
}

impl PollConfig {
    /// Creates a polling configuration.
    pub fn new(default_delay: Duration) -> Self {
        Self {
            default_delay,
            min_delay: Duration::ZERO,
            cancel_timeout: Duration::from_secs(5),
        }
    }

    /// Sets the delay floor.
    #[must_use]
    pub fn with_min_delay(mut self, delay: Duration) -> Self {
        self.min_delay = delay;
        self
    }

    /// Sets the cancel-call timeout.
    #[must_use]
    pub fn with_cancel_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_timeout = timeout;
        self
    }

    /// The delay before the next poll, given the server's advice in ms.
    pub fn delay_for(&self, advised_ms: Option<i64>) -> Duration {
        let advised = advised_ms
            .filter(|ms| *ms > 0)
            .map(|ms| Duration::from_millis(ms.unsigned_abs()))
            .unwrap_or(self.default_delay);
        advised.max(self.min_delay)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// Server error codes the client gives meaning to.
///
/// These are server-defined values; they are configurable so a server-side
/// renumbering does not require a client release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCodes {
    /// Codes meaning "object not found" (expired or released handles).
    pub not_found: Vec<i64>,
    /// Codes meaning "object already exists".
    pub object_exists: Vec<i64>,
    /// Codes meaning "state-check period too small".
    pub period_too_small: Vec<i64>,
    /// Action error codes that only report a honoured cancel. A cancelled
    /// action finalizing with any other error code has failed.
    pub action_cancelled: Vec<i64>,
}

impl ServerCodes {
    /// Returns true if the error is a not-found rejection, or a local
    /// refusal to use a released accessor.
    pub fn is_not_found(&self, err: &KscError) -> bool {
        matches!(err, KscError::AccessorReleased { .. })
            || err
                .server_code()
                .is_some_and(|code| self.not_found.contains(&code))
    }

    /// Returns true if the error is an object-exists rejection.
    pub fn is_object_exists(&self, err: &KscError) -> bool {
        err.server_code()
            .is_some_and(|code| self.object_exists.contains(&code))
    }

    /// Returns true if the error is a poll-too-fast rejection.
    pub fn is_period_too_small(&self, err: &KscError) -> bool {
        err.server_code()
            .is_some_and(|code| self.period_too_small.contains(&code))
    }

    /// Returns true if a cancelled action's error code means it failed
    /// rather than stopped on request.
    pub fn is_failure_after_cancel(&self, action_code: Option<i64>) -> bool {
        action_code.is_some_and(|code| !self.action_cancelled.contains(&code))
    }
}

impl Default for ServerCodes {
    fn default() -> Self {
        Self {
            not_found: vec![1183],
            object_exists: vec![1161],
            period_too_small: vec![1949],
            action_cancelled: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallSite;
    use ksc_codec::PxgError;

    #[test]
    fn client_config_builder() {
        let config = ClientConfig::new("https://ksc.example.com:13299/")
            .with_vserver("tenant-a")
            .with_start_session(false)
            .with_chunk_size(250)
            .with_timeout(Duration::from_secs(5));

        assert_eq!(config.base_url, "https://ksc.example.com:13299");
        assert_eq!(config.vserver.as_deref(), Some("tenant-a"));
        assert!(!config.start_session);
        assert_eq!(config.chunk_size, 250);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_validation() {
        assert!(ClientConfig::new("ftp://x").validate().is_err());
        assert!(ClientConfig::new("https://x")
            .with_chunk_size(0)
            .validate()
            .is_err());
        assert!(ClientConfig::new("https://x")
            .with_max_reply_size(0)
            .validate()
            .is_err());
    }

    #[test]
    fn poll_delay_follows_server_advice() {
        let poll = PollConfig::new(Duration::from_millis(500));
        assert_eq!(poll.delay_for(Some(2000)), Duration::from_millis(2000));
        assert_eq!(poll.delay_for(None), Duration::from_millis(500));
        assert_eq!(poll.delay_for(Some(0)), Duration::from_millis(500));
        assert_eq!(poll.delay_for(Some(-5)), Duration::from_millis(500));
    }

    #[test]
    fn poll_delay_respects_floor() {
        let poll = PollConfig::new(Duration::from_millis(100)).with_min_delay(Duration::from_secs(1));
        assert_eq!(poll.delay_for(Some(10)), Duration::from_secs(1));
        assert_eq!(poll.delay_for(Some(3000)), Duration::from_secs(3));
    }

    #[test]
    fn code_classification() {
        let codes = ServerCodes::default();
        let err = KscError::Server {
            site: Box::new(CallSite::new("ChunkAccessor.Release")),
            status: 200,
            error: PxgError::new(codes.not_found[0], "gone"),
        };
        assert!(codes.is_not_found(&err));
        assert!(!codes.is_object_exists(&err));
        assert!(!codes.is_not_found(&KscError::validation("x")));
        assert!(codes.is_not_found(&KscError::AccessorReleased { id: "a".into() }));
    }

    #[test]
    fn failure_after_cancel_needs_a_foreign_code() {
        let mut codes = ServerCodes::default();
        assert!(!codes.is_failure_after_cancel(None));
        assert!(codes.is_failure_after_cancel(Some(7)));

        codes.action_cancelled.push(7);
        assert!(!codes.is_failure_after_cancel(Some(7)));
        assert!(codes.is_failure_after_cancel(Some(8)));
    }
}
