//! The uniform dispatch surface façade service groups plug into.
//!
//! A service group is a thin typed wrapper with one method per server
//! endpoint. Each method builds its parameter object and delegates to a
//! [`ServiceHandle`], which handles body discipline, envelope decoding,
//! action-handle normalization and accessor creation.

use crate::accessor::{Accessor, IteratorKind};
use crate::action::{ActionGuid, ActionHandle};
use crate::context::CallContext;
use crate::endpoint::{ActionField, Endpoint};
use crate::error::{KscError, KscResult};
use crate::session::KscClient;
use ksc_codec::{Params, Reply, RET_VAL};
use serde::de::DeserializeOwned;

/// Reply field carrying the failed-slaves sub-document of federated finds.
pub const FAILED_SLAVES_FIELD: &str = "pFailedSlavesInfo";

/// A façade group bound to one server service.
pub trait ServiceGroup: Sized {
    /// Service name, the part of the endpoint before the dot.
    const SERVICE: &'static str;

    /// Wraps a handle bound to [`Self::SERVICE`].
    fn bind(handle: ServiceHandle) -> Self;
}

/// A client bound to one service.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    client: KscClient,
    service: &'static str,
}

impl ServiceHandle {
    pub(crate) fn new(client: KscClient, service: &'static str) -> Self {
        Self { client, service }
    }

    /// The bound service name.
    pub fn service(&self) -> &'static str {
        self.service
    }

    /// The underlying client.
    pub fn client(&self) -> &KscClient {
        &self.client
    }

    /// The endpoint of a method of this service.
    pub fn endpoint(&self, method: &str) -> KscResult<Endpoint> {
        Endpoint::new(self.service, method)
    }

    /// Calls a method and returns the raw reply.
    pub fn call(&self, ctx: &CallContext, method: &str, params: Params) -> KscResult<Reply> {
        self.client.call(ctx, &self.endpoint(method)?, params)
    }

    /// Calls a void method.
    pub fn call_void(&self, ctx: &CallContext, method: &str, params: Params) -> KscResult<()> {
        self.client.call_void(ctx, &self.endpoint(method)?, params)
    }

    /// Calls a method and decodes its `PxgRetVal`.
    pub fn call_single<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        method: &str,
        params: Params,
    ) -> KscResult<T> {
        self.client.call_single(ctx, &self.endpoint(method)?, params)
    }

    /// Calls a method and decodes its out-parameters into `T`.
    pub fn call_structured<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        method: &str,
        params: Params,
    ) -> KscResult<T> {
        self.client
            .call_structured(ctx, &self.endpoint(method)?, params)
    }

    /// Calls a method that starts an async action.
    ///
    /// The action handle is read from the field the catalog names for the
    /// endpoint, falling back to the other convention and then to
    /// `PxgRetVal`.
    pub fn start_action(
        &self,
        ctx: &CallContext,
        method: &str,
        params: Params,
    ) -> KscResult<ActionHandle> {
        let endpoint = self.endpoint(method)?;
        let spec = self.client.catalog().get(&endpoint);
        let field = spec
            .as_ref()
            .and_then(|s| s.action)
            .unwrap_or(ActionField::ActionGuid);
        let cancel = spec.and_then(|s| s.cancel);

        let reply = self.client.call(ctx, &endpoint, params)?;
        let guid = action_guid_from(&reply, field).ok_or_else(|| KscError::Envelope {
            site: Box::new(self.client.site(&endpoint)),
            source: ksc_codec::CodecError::unexpected_shape(format!(
                "reply carries no {}",
                field.wire_name()
            )),
        })?;
        Ok(ActionHandle::new(guid, endpoint, field, cancel))
    }

    /// Calls a find or reset-iterator method and wraps the minted iterator.
    ///
    /// The iterator kind comes from the catalog; `fallback` is used for
    /// endpoints the catalog does not know.
    pub fn open_accessor(
        &self,
        ctx: &CallContext,
        method: &str,
        params: Params,
        fallback: IteratorKind,
    ) -> KscResult<Accessor> {
        let endpoint = self.endpoint(method)?;
        let kind = self
            .client
            .catalog()
            .get(&endpoint)
            .and_then(|s| s.creates)
            .unwrap_or(fallback);

        let reply = self.client.call(ctx, &endpoint, params)?;
        let id = reply
            .get(kind.id_field())
            .and_then(|v| v.as_str())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| KscError::Envelope {
                site: Box::new(self.client.site(&endpoint)),
                source: ksc_codec::CodecError::unexpected_shape(format!(
                    "reply carries no {}",
                    kind.id_field()
                )),
            })?
            .to_string();
        let count = reply.ret_val().and_then(|v| v.as_i64());
        let failed_slaves = reply.params().get_params(FAILED_SLAVES_FIELD).cloned();

        Ok(Accessor::new(
            self.client.clone(),
            kind,
            id,
            count,
            failed_slaves,
        ))
    }
}

fn action_guid_from(reply: &Reply, preferred: ActionField) -> Option<ActionGuid> {
    let other = match preferred {
        ActionField::ActionGuid => ActionField::RequestId,
        ActionField::RequestId => ActionField::ActionGuid,
    };
    [preferred.wire_name(), other.wire_name(), RET_VAL]
        .into_iter()
        .filter_map(|key| reply.get(key).and_then(|v| v.as_str()))
        .find_map(|raw| ActionGuid::new(raw).ok())
}
