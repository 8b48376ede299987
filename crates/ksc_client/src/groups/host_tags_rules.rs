//! Automatic host-tagging rules.

use crate::action::ActionHandle;
use crate::context::CallContext;
use crate::error::KscResult;
use crate::service::{ServiceGroup, ServiceHandle};
use ksc_codec::Params;

/// `HostTagsRulesApi` service.
#[derive(Debug, Clone)]
pub struct HostTagsRulesApi {
    handle: ServiceHandle,
}

impl ServiceGroup for HostTagsRulesApi {
    const SERVICE: &'static str = "HostTagsRulesApi";

    fn bind(handle: ServiceHandle) -> Self {
        Self { handle }
    }
}

impl HostTagsRulesApi {
    /// Starts applying a tagging rule. Track the result with
    /// [`crate::ActionTracker`].
    pub fn execute_rule(&self, ctx: &CallContext, rule_id: i64) -> KscResult<ActionHandle> {
        self.handle
            .start_action(ctx, "ExecuteRule", Params::new().with("nRuleId", rule_id))
    }

    /// `HostTagsRulesApi.CancelAsyncAction`.
    pub fn cancel_async_action(&self, ctx: &CallContext, action: &ActionHandle) -> KscResult<()> {
        self.handle.client().tracker().cancel(ctx, action)
    }
}
