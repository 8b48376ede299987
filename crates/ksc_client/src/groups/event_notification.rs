//! Event notification defaults.

use crate::context::CallContext;
use crate::error::KscResult;
use crate::service::{ServiceGroup, ServiceHandle};
use ksc_codec::{Params, Value};

/// `EventNotificationProperties` service.
#[derive(Debug, Clone)]
pub struct EventNotificationProperties {
    handle: ServiceHandle,
}

impl ServiceGroup for EventNotificationProperties {
    const SERVICE: &'static str = "EventNotificationProperties";

    fn bind(handle: ServiceHandle) -> Self {
        Self { handle }
    }
}

impl EventNotificationProperties {
    /// Default notification settings. The endpoint takes no body.
    pub fn get_default_settings(&self, ctx: &CallContext) -> KscResult<Params> {
        let mut reply = self
            .handle
            .call(ctx, "GetDefaultSettings", Params::new())?;
        Ok(reply
            .take_ret_val()
            .and_then(Value::into_params)
            .unwrap_or_default())
    }
}
