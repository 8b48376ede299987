//! Administration Server settings.

use crate::context::CallContext;
use crate::error::KscResult;
use crate::service::{ServiceGroup, ServiceHandle};
use ksc_codec::Params;

/// `AdmServerSettings` service.
#[derive(Debug, Clone)]
pub struct AdmServerSettings {
    handle: ServiceHandle,
}

impl ServiceGroup for AdmServerSettings {
    const SERVICE: &'static str = "AdmServerSettings";

    fn bind(handle: ServiceHandle) -> Self {
        Self { handle }
    }
}

impl AdmServerSettings {
    /// The UNC path of the server's shared folder, e.g. `\\HOST\share\`.
    pub fn get_shared_folder(&self, ctx: &CallContext) -> KscResult<String> {
        self.handle.call_single(ctx, "GetSharedFolder", Params::new())
    }
}
