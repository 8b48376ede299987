//! Host search, synchronous and async.
//!
//! Both finds hand back an [`Accessor`]; the async form goes through an
//! action keyed by `strRequestId` first.

use crate::accessor::{Accessor, IteratorKind};
use crate::action::ActionHandle;
use crate::context::CallContext;
use crate::error::KscResult;
use crate::service::{ServiceGroup, ServiceHandle};
use ksc_codec::{Params, Value};
use std::time::Duration;

/// One sort key of a find.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortField {
    /// Attribute name.
    pub name: String,
    /// Ascending if true.
    pub ascending: bool,
}

impl SortField {
    /// Ascending order on `name`.
    pub fn asc(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ascending: true,
        }
    }

    /// Descending order on `name`.
    pub fn desc(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ascending: false,
        }
    }
}

/// Arguments of a host search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindHostsQuery {
    /// Search filter in the server's filter syntax.
    pub filter: String,
    /// Attributes to return per host.
    pub fields: Vec<String>,
    /// Sort order; fixed for the life of the accessor.
    pub sort: Vec<SortField>,
    /// Extra search options (`pParams`).
    pub options: Params,
    /// Accessor lifetime; `None` uses the client default.
    pub lifetime: Option<Duration>,
}

impl FindHostsQuery {
    /// A query with a filter and the attributes to return.
    pub fn new<I, S>(filter: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            filter: filter.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Adds a sort key.
    #[must_use]
    pub fn sorted_by(mut self, field: SortField) -> Self {
        self.sort.push(field);
        self
    }

    /// Sets the accessor lifetime.
    #[must_use]
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    fn to_params(&self, default_lifetime: Duration) -> Params {
        let fields: Vec<Value> = self.fields.iter().map(|f| Value::from(f.as_str())).collect();
        let sort: Vec<Value> = self
            .sort
            .iter()
            .map(|s| {
                Value::tagged_params(
                    Params::new()
                        .with("Name", s.name.as_str())
                        .with("Asc", s.ascending),
                )
            })
            .collect();
        let lifetime = self.lifetime.unwrap_or(default_lifetime).as_secs();
        Params::new()
            .with("wstrFilter", self.filter.as_str())
            .with("vecFieldsToReturn", fields)
            .with("vecFieldsToOrder", sort)
            .with("pParams", self.options.clone())
            .with("lMaxLifeTime", i64::try_from(lifetime).unwrap_or(i64::MAX))
    }
}

/// `HostGroup` service: host searches.
#[derive(Debug, Clone)]
pub struct HostGroup {
    handle: ServiceHandle,
}

impl ServiceGroup for HostGroup {
    const SERVICE: &'static str = "HostGroup";

    fn bind(handle: ServiceHandle) -> Self {
        Self { handle }
    }
}

impl HostGroup {
    fn default_lifetime(&self) -> Duration {
        self.handle.client().config().accessor_lifetime
    }

    /// Searches hosts and returns a chunk accessor over the results.
    pub fn find_hosts(&self, ctx: &CallContext, query: &FindHostsQuery) -> KscResult<Accessor> {
        self.handle.open_accessor(
            ctx,
            "FindHosts",
            query.to_params(self.default_lifetime()),
            IteratorKind::ChunkAccessor,
        )
    }

    /// Starts a host search as an async action (`strRequestId`).
    pub fn find_hosts_async(&self, ctx: &CallContext, query: &FindHostsQuery) -> KscResult<ActionHandle> {
        self.handle
            .start_action(ctx, "FindHostsAsync", query.to_params(self.default_lifetime()))
    }

    /// `HostGroup.FindHostsAsyncCancel`.
    pub fn find_hosts_async_cancel(&self, ctx: &CallContext, action: &ActionHandle) -> KscResult<()> {
        self.handle.client().tracker().cancel(ctx, action)
    }

    /// The accessor of a finished async search, with the failed-slaves
    /// report of a federated search preserved.
    pub fn find_hosts_async_get_accessor(
        &self,
        ctx: &CallContext,
        action: &ActionHandle,
    ) -> KscResult<Accessor> {
        self.handle.open_accessor(
            ctx,
            "FindHostsAsyncGetAccessor",
            Params::new().with(action.field().wire_name(), action.guid().as_str()),
            IteratorKind::ChunkAccessor,
        )
    }
}
