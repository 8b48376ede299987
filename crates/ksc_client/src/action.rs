//! Async-action tracking.
//!
//! Long-running operations return an action GUID instead of a result. The
//! tracker polls `AsyncActionStateChecker.CheckActionState` at the cadence
//! the server advises until the action finalizes, delivering progress as it
//! arrives.
//!
//! ```text
//! Initial ──poll──▶ InProgress ──poll──▶ ... ──poll──▶ Succeeded
//!                       │                         ╲──▶ Failed
//!                       └──cancel──▶ Cancelling ──poll──▶ Cancelled
//! ```

use crate::context::CallContext;
use crate::endpoint::{ActionField, Endpoint};
use crate::error::{CancelReason, HandleRef, KscError, KscResult};
use crate::session::KscClient;
use ksc_codec::{Params, PxgError, Reply, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Fields of the error tuple in a failed action's state data.
pub mod error_fields {
    /// Error code.
    pub const CODE: &str = "KLBLAG_ERROR_CODE";
    /// Error subcode.
    pub const SUBCODE: &str = "KLBLAG_ERROR_SUBCODE";
    /// Server module.
    pub const MODULE: &str = "KLBLAG_ERROR_MODULE";
    /// Source file.
    pub const FILE: &str = "KLBLAG_ERROR_FNAME";
    /// Source line.
    pub const LINE: &str = "KLBLAG_ERROR_LNUMBER";
    /// Message.
    pub const MESSAGE: &str = "KLBLAG_ERROR_MSG";
}

/// Progress percentage field of in-progress state data.
pub const PROGRESS_FIELD: &str = "Progress";

const STATE_CHECKER: &str = "AsyncActionStateChecker";

/// An async action's GUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionGuid(String);

impl ActionGuid {
    /// Wraps a GUID, trimming whitespace and rejecting empty ones.
    pub fn new(raw: impl Into<String>) -> KscResult<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(KscError::validation("action GUID is empty"));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// The GUID string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A started async action and the endpoints that serve it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionHandle {
    guid: ActionGuid,
    origin: Endpoint,
    field: ActionField,
    cancel: Option<Endpoint>,
}

impl ActionHandle {
    /// Describes an action; usually built by
    /// [`crate::ServiceHandle::start_action`].
    pub fn new(
        guid: ActionGuid,
        origin: Endpoint,
        field: ActionField,
        cancel: Option<Endpoint>,
    ) -> Self {
        Self {
            guid,
            origin,
            field,
            cancel,
        }
    }

    /// The action GUID.
    pub fn guid(&self) -> &ActionGuid {
        &self.guid
    }

    /// The endpoint that started the action.
    pub fn origin(&self) -> &Endpoint {
        &self.origin
    }

    /// The field name the action's service uses for the GUID.
    pub fn field(&self) -> ActionField {
        self.field
    }

    /// The service-specific cancel endpoint, if there is one.
    pub fn cancel_endpoint(&self) -> Option<&Endpoint> {
        self.cancel.as_ref()
    }
}

/// One `CheckActionState` reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionState {
    /// `bFinalized`.
    pub finalized: bool,
    /// `bSuccededFinalized`; meaningful only when finalized.
    pub succeeded: bool,
    /// `lStateCode`.
    pub state_code: i64,
    /// `pStateData`, kept verbatim.
    pub state_data: Params,
    /// `lNextCheckDelay` in milliseconds; meaningful only when not finalized.
    pub next_check_delay: Option<i64>,
}

impl ActionState {
    /// Reads a state reply; missing fields take zero values.
    pub fn from_reply(reply: Reply) -> Self {
        let mut fields = reply.into_params();
        Self {
            finalized: fields.get_bool("bFinalized").unwrap_or(false),
            succeeded: fields.get_bool("bSuccededFinalized").unwrap_or(false),
            state_code: fields.get_i64("lStateCode").unwrap_or(0),
            next_check_delay: fields.get_i64("lNextCheckDelay"),
            state_data: fields
                .remove("pStateData")
                .and_then(Value::into_params)
                .unwrap_or_default(),
        }
    }

    /// The `Progress` percentage, when the server reports one.
    pub fn progress(&self) -> Option<i64> {
        self.state_data.get_i64(PROGRESS_FIELD)
    }

    /// The error tuple of a failed action.
    pub fn failure(&self) -> PxgError {
        failure_from_state(self.state_code, &self.state_data)
    }
}

/// Extracts the error tuple from a failed action's state data.
///
/// Fields other than the tuple are kept in [`PxgError::extra`]. Without a
/// `KLBLAG_ERROR_CODE` the state code stands in.
pub fn failure_from_state(state_code: i64, data: &Params) -> PxgError {
    use error_fields::*;

    let mut extra = Params::new();
    for (key, value) in data.iter() {
        if ![CODE, SUBCODE, MODULE, FILE, LINE, MESSAGE].contains(&key) {
            extra.insert(key, value.clone());
        }
    }
    PxgError {
        code: data.get_i64(CODE).unwrap_or(state_code),
        subcode: data.get_i64(SUBCODE),
        module: data.get_str(MODULE).unwrap_or_default().to_string(),
        file: data.get_str(FILE).unwrap_or_default().to_string(),
        line: data.get_i64(LINE).unwrap_or(0),
        message: data
            .get_str(MESSAGE)
            .map(str::to_string)
            .unwrap_or_else(|| format!("action finalized unsuccessfully (state {})", state_code)),
        extra,
    }
}

/// Where an action is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    /// Not polled yet.
    Initial,
    /// Polled and not finalized.
    InProgress,
    /// Cancel requested, not finalized yet.
    Cancelling,
    /// Finalized successfully.
    Succeeded,
    /// Finalized with an error.
    Failed,
    /// Finalized after a cancel.
    Cancelled,
}

impl ActionStatus {
    /// Returns true for `Succeeded`, `Failed` and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ActionStatus::Succeeded | ActionStatus::Failed | ActionStatus::Cancelled
        )
    }

    /// Returns true if `next` may follow `self`.
    pub fn can_become(self, next: ActionStatus) -> bool {
        use ActionStatus::*;
        match self {
            Initial | InProgress => matches!(next, InProgress | Succeeded | Failed | Cancelling),
            Cancelling => matches!(next, Cancelling | Cancelled | Failed | Succeeded),
            Succeeded | Failed | Cancelled => false,
        }
    }

    /// Moves to `next`, refusing transitions the lifecycle forbids.
    pub fn advance(self, next: ActionStatus) -> KscResult<ActionStatus> {
        if self.can_become(next) {
            Ok(next)
        } else {
            Err(KscError::validation(format!(
                "action cannot go from {:?} to {:?}",
                self, next
            )))
        }
    }
}

/// A progress report from a non-final poll.
#[derive(Debug)]
pub struct ActionProgress<'a> {
    /// The action.
    pub guid: &'a ActionGuid,
    /// `InProgress` or `Cancelling`.
    pub status: ActionStatus,
    /// `Progress` percentage, if reported.
    pub percent: Option<i64>,
    /// `lStateCode`.
    pub state_code: i64,
    /// The raw `pStateData` of this poll.
    pub data: &'a Params,
    /// Delay before the next poll.
    pub next_poll: Duration,
}

impl ActionProgress<'_> {
    /// Log chunks carried by this poll (`EventLogs`, `WuaLogs`, per-product
    /// installation logs).
    pub fn logs(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.data.iter().filter(|(key, _)| key.contains("Log"))
    }
}

/// Waits between polls.
pub trait Pacer: Send + Sync {
    /// Blocks for `delay`, failing early if `ctx` is cancelled.
    fn pause(&self, ctx: &CallContext, delay: Duration) -> KscResult<()>;
}

/// The default pacer: a cancellation-aware sleep.
#[derive(Debug, Default, Clone, Copy)]
pub struct SleepPacer;

impl Pacer for SleepPacer {
    fn pause(&self, ctx: &CallContext, delay: Duration) -> KscResult<()> {
        ctx.sleep(delay)
    }
}

/// Drives async actions to a terminal state.
#[derive(Clone)]
pub struct ActionTracker {
    client: KscClient,
    pacer: Arc<dyn Pacer>,
}

impl ActionTracker {
    /// Creates a tracker with the default pacer.
    pub fn new(client: KscClient) -> Self {
        Self {
            client,
            pacer: Arc::new(SleepPacer),
        }
    }

    /// Replaces the pacer.
    #[must_use]
    pub fn with_pacer(mut self, pacer: Arc<dyn Pacer>) -> Self {
        self.pacer = pacer;
        self
    }

    fn check_endpoint() -> Endpoint {
        Endpoint::known(STATE_CHECKER, "CheckActionState")
    }

    fn poll_once(&self, ctx: &CallContext, guid: &ActionGuid) -> KscResult<ActionState> {
        let params = Params::new().with(ActionField::ActionGuid.wire_name(), guid.as_str());
        self.client
            .call(ctx, &Self::check_endpoint(), params)
            .map(ActionState::from_reply)
            .map_err(|e| e.with_handle(HandleRef::Action(guid.to_string())))
    }

    /// Polls once.
    ///
    /// `None` means the server no longer knows the action, which is what it
    /// reports after a terminal state has been observed.
    pub fn check(&self, ctx: &CallContext, guid: &ActionGuid) -> KscResult<Option<ActionState>> {
        match self.poll_once(ctx, guid) {
            Ok(state) => Ok(Some(state)),
            Err(e) if self.client.config().codes.is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Waits for the action and returns the success `pStateData`.
    pub fn wait(&self, ctx: &CallContext, handle: &ActionHandle) -> KscResult<Params> {
        self.wait_with(ctx, handle, |_: &ActionProgress<'_>| {})
    }

    /// Like [`ActionTracker::wait`], reporting every non-final poll.
    ///
    /// If `ctx` is cancelled the service's cancel endpoint is called on a
    /// detached context, best-effort, and the cancellation is returned.
    pub fn wait_with<F>(&self, ctx: &CallContext, handle: &ActionHandle, mut on_progress: F) -> KscResult<Params>
    where
        F: FnMut(&ActionProgress<'_>),
    {
        match self.drive(ctx, handle, ActionStatus::Initial, &mut on_progress) {
            Ok((ActionStatus::Succeeded, data)) => Ok(data),
            Ok((_, _)) => Err(KscError::Cancelled {
                site: Some(Box::new(self.action_site(handle))),
                reason: CancelReason::Requested,
            }),
            Err(e) if e.is_cancelled() => {
                self.cancel_best_effort(handle);
                Err(e.with_handle(HandleRef::Action(handle.guid.to_string())))
            }
            Err(e) => Err(e),
        }
    }

    /// Calls the action's cancel endpoint without waiting.
    pub fn cancel(&self, ctx: &CallContext, handle: &ActionHandle) -> KscResult<()> {
        let endpoint = handle.cancel.as_ref().ok_or_else(|| {
            KscError::validation(format!("{} has no cancel endpoint", handle.origin))
        })?;
        let params = Params::new().with(handle.field.wire_name(), handle.guid.as_str());
        self.client
            .call_void(ctx, endpoint, params)
            .map_err(|e| e.with_handle(HandleRef::Action(handle.guid.to_string())))?;
        debug!(guid = %handle.guid, endpoint = %endpoint, "action cancel requested");
        Ok(())
    }

    /// Cancels the action and polls until it finalizes.
    ///
    /// Returns the terminal status: `Cancelled`, or `Succeeded` if the
    /// action finished before the cancel took effect. An action that
    /// finalizes with an error payload instead comes back as
    /// [`KscError::ActionFailed`].
    pub fn cancel_and_wait(&self, ctx: &CallContext, handle: &ActionHandle) -> KscResult<ActionStatus> {
        self.cancel(ctx, handle)?;
        let status = ActionStatus::Initial.advance(ActionStatus::Cancelling)?;
        self.drive(ctx, handle, status, &mut |_: &ActionProgress<'_>| {})
            .map(|(status, _)| status)
    }

    fn cancel_best_effort(&self, handle: &ActionHandle) {
        if handle.cancel.is_none() {
            debug!(guid = %handle.guid, "no cancel endpoint; abandoning action");
            return;
        }
        let detached = CallContext::detached(self.client.config().poll.cancel_timeout);
        if let Err(e) = self.cancel(&detached, handle) {
            warn!(guid = %handle.guid, error = %e, "best-effort action cancel failed");
        }
    }

    fn action_site(&self, handle: &ActionHandle) -> crate::error::CallSite {
        let mut site = self.client.site(&Self::check_endpoint());
        site.handle = Some(HandleRef::Action(handle.guid.to_string()));
        site
    }

    fn drive(
        &self,
        ctx: &CallContext,
        handle: &ActionHandle,
        mut status: ActionStatus,
        on_progress: &mut dyn FnMut(&ActionProgress<'_>),
    ) -> KscResult<(ActionStatus, Params)> {
        let config = self.client.config();
        let mut backoff = config.poll.delay_for(None);

        loop {
            let state = match self.poll_once(ctx, &handle.guid) {
                Ok(state) => state,
                Err(e) if config.codes.is_period_too_small(&e) => {
                    debug!(guid = %handle.guid, backoff_ms = backoff.as_millis() as u64, "poll rejected as too frequent; backing off");
                    self.pacer.pause(ctx, backoff)?;
                    continue;
                }
                Err(e) if status == ActionStatus::Cancelling && config.codes.is_not_found(&e) => {
                    return Ok((status.advance(ActionStatus::Cancelled)?, Params::new()));
                }
                Err(e) => return Err(e),
            };

            if !state.finalized {
                let next = if status == ActionStatus::Cancelling {
                    ActionStatus::Cancelling
                } else {
                    ActionStatus::InProgress
                };
                status = status.advance(next)?;
                let delay = config.poll.delay_for(state.next_check_delay);
                backoff = delay;
                debug!(
                    guid = %handle.guid,
                    finalized = false,
                    progress = ?state.progress(),
                    next_delay_ms = delay.as_millis() as u64,
                    "action polled"
                );
                on_progress(&ActionProgress {
                    guid: &handle.guid,
                    status,
                    percent: state.progress(),
                    state_code: state.state_code,
                    data: &state.state_data,
                    next_poll: delay,
                });
                self.pacer.pause(ctx, delay)?;
                continue;
            }

            let terminal = match (state.succeeded, status) {
                (true, _) => ActionStatus::Succeeded,
                (false, ActionStatus::Cancelling)
                    if !config
                        .codes
                        .is_failure_after_cancel(state.state_data.get_i64(error_fields::CODE)) =>
                {
                    ActionStatus::Cancelled
                }
                (false, _) => ActionStatus::Failed,
            };
            status = status.advance(terminal)?;
            debug!(guid = %handle.guid, finalized = true, status = ?status, "action finalized");

            return match status {
                ActionStatus::Failed => Err(KscError::ActionFailed {
                    site: Box::new(self.action_site(handle)),
                    guid: handle.guid.to_string(),
                    error: state.failure(),
                }),
                _ => Ok((status, state.state_data)),
            };
        }
    }
}

impl fmt::Debug for ActionTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionTracker")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}
