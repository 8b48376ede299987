//! The `Session` service.

use crate::context::CallContext;
use crate::error::KscResult;
use crate::service::{ServiceGroup, ServiceHandle};
use ksc_codec::Params;

/// `Session` service: liveness and token issuance.
///
/// Session start and teardown live on [`crate::KscClient`] because they
/// change the client's own state.
#[derive(Debug, Clone)]
pub struct SessionService {
    handle: ServiceHandle,
}

impl ServiceGroup for SessionService {
    const SERVICE: &'static str = "Session";

    fn bind(handle: ServiceHandle) -> Self {
        Self { handle }
    }
}

impl SessionService {
    /// `Session.Ping`.
    pub fn ping(&self, ctx: &CallContext) -> KscResult<()> {
        self.handle.call_void(ctx, "Ping", Params::new())
    }

    /// `Session.CreateToken`: a single-use logon token.
    pub fn create_token(&self, ctx: &CallContext) -> KscResult<crate::ShortLivedToken> {
        self.handle.client().issue_short_lived_token(ctx)
    }
}
