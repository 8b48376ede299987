//! Server-side result-set accessors and iterators.
//!
//! Four iterator families exist on the server, each with its own service,
//! id field and fetch methods. [`IteratorKind`] records which one minted an
//! id so [`Accessor`] can route count, fetch and release calls without the
//! caller knowing.
//!
//! An accessor is never released implicitly. Call [`Accessor::release`];
//! otherwise the server reaps it when its lifetime elapses or the session
//! ends.

use crate::context::CallContext;
use crate::endpoint::Endpoint;
use crate::error::{HandleRef, KscError, KscResult};
use crate::session::KscClient;
use ksc_codec::{Params, Reply, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Array key inside chunk accessor and srvview replies.
pub const ITERATOR_ARRAY: &str = "KLCSP_ITERATOR_ARRAY";
/// Array key inside event-processing replies.
pub const EVENT_RANGE_ARRAY: &str = "KLEVP_EVENT_RANGE_ARRAY";

/// Which server-side iterator family an id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IteratorKind {
    /// `ChunkAccessor`, minted by host-group finds.
    ChunkAccessor,
    /// `SrvView` iterators.
    SrvView,
    /// `EventProcessing` iterators.
    EventProcessing,
    /// `GroupSyncIterator`, a forward-only cursor.
    GroupSync,
}

impl IteratorKind {
    /// The wire name of the id field. Never unified on the wire.
    pub fn id_field(self) -> &'static str {
        match self {
            IteratorKind::ChunkAccessor => "strAccessor",
            IteratorKind::SrvView => "wstrIteratorId",
            IteratorKind::EventProcessing => "strIteratorId",
            IteratorKind::GroupSync => "szwIterator",
        }
    }

    /// The service that serves the iterator.
    pub fn service(self) -> &'static str {
        match self {
            IteratorKind::ChunkAccessor => "ChunkAccessor",
            IteratorKind::SrvView => "SrvView",
            IteratorKind::EventProcessing => "EventProcessing",
            IteratorKind::GroupSync => "GroupSyncIterator",
        }
    }

    fn count_method(self) -> Option<&'static str> {
        match self {
            IteratorKind::ChunkAccessor => Some("GetItemsCount"),
            IteratorKind::SrvView | IteratorKind::EventProcessing => Some("GetRecordCount"),
            IteratorKind::GroupSync => None,
        }
    }

    fn range_method(self) -> Option<&'static str> {
        match self {
            IteratorKind::ChunkAccessor => Some("GetItemsChunk"),
            IteratorKind::SrvView | IteratorKind::EventProcessing => Some("GetRecordRange"),
            IteratorKind::GroupSync => None,
        }
    }

    fn release_method(self) -> &'static str {
        match self {
            IteratorKind::ChunkAccessor => "Release",
            _ => "ReleaseIterator",
        }
    }

    /// Returns true if the iterator supports count and range fetches.
    pub fn is_random_access(self) -> bool {
        self != IteratorKind::GroupSync
    }

    fn endpoint(self, method: &str) -> Endpoint {
        Endpoint::known(self.service(), method)
    }

    fn id_params(self, id: &str) -> Params {
        Params::new().with(self.id_field(), id)
    }

    /// Request parameters for `count` records from `start`.
    fn range_params(self, id: &str, start: u64, count: u32) -> Params {
        let start = i64::try_from(start).unwrap_or(i64::MAX);
        let count = i64::from(count);
        match self {
            IteratorKind::ChunkAccessor => self
                .id_params(id)
                .with("lStart", start)
                .with("lCount", count),
            _ => self
                .id_params(id)
                .with("nStart", start)
                .with("nEnd", start.saturating_add(count)),
        }
    }

    /// The reply field holding the records.
    fn records_field(self) -> &'static str {
        match self {
            IteratorKind::ChunkAccessor => "pChunk",
            IteratorKind::SrvView => "pRecords",
            IteratorKind::EventProcessing => "pParamsEvents",
            IteratorKind::GroupSync => "pData",
        }
    }

    fn records(self, reply: Reply) -> Vec<Value> {
        let mut fields = reply.into_params();
        match fields.remove(self.records_field()) {
            Some(value) => unwrap_records(value),
            None => Vec::new(),
        }
    }
}

/// Pulls the record array out of a records container.
fn unwrap_records(value: Value) -> Vec<Value> {
    if value.as_array().is_some() {
        return value.into_array().unwrap_or_default();
    }
    match value.into_params() {
        Some(mut params) => [ITERATOR_ARRAY, EVENT_RANGE_ARRAY]
            .into_iter()
            .find_map(|key| params.remove(key))
            .and_then(Value::into_array)
            .unwrap_or_default(),
        None => Vec::new(),
    }
}

/// A server-side result set.
#[derive(Debug)]
pub struct Accessor {
    client: KscClient,
    kind: IteratorKind,
    id: String,
    reported_count: Option<i64>,
    failed_slaves: Option<Params>,
    released: AtomicBool,
    exhausted: AtomicBool,
}

impl Accessor {
    pub(crate) fn new(
        client: KscClient,
        kind: IteratorKind,
        id: String,
        reported_count: Option<i64>,
        failed_slaves: Option<Params>,
    ) -> Self {
        Self {
            client,
            kind,
            id,
            reported_count,
            failed_slaves,
            released: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
        }
    }

    /// The opaque accessor id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The iterator family.
    pub fn kind(&self) -> IteratorKind {
        self.kind
    }

    /// The count returned by the creating call, if it returned one.
    pub fn reported_count(&self) -> Option<i64> {
        self.reported_count
    }

    /// Slave servers that failed to contribute to a federated find.
    pub fn failed_slaves(&self) -> Option<&Params> {
        self.failed_slaves.as_ref()
    }

    /// Returns true once [`Accessor::release`] has succeeded.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Returns true once a forward-only iterator reported end of data.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> KscResult<()> {
        if self.is_released() {
            return Err(KscError::AccessorReleased {
                id: self.id.clone(),
            });
        }
        Ok(())
    }

    fn unsupported(&self, operation: &str) -> KscError {
        KscError::validation(format!(
            "{} iterators do not support {}",
            self.kind.service(),
            operation
        ))
    }

    fn call(&self, ctx: &CallContext, method: &str, params: Params) -> KscResult<Reply> {
        self.client
            .call(ctx, &self.kind.endpoint(method), params)
            .map_err(|e| e.with_handle(HandleRef::Accessor(self.id.clone())))
    }

    /// Total number of records. Does not move any cursor.
    pub fn count(&self, ctx: &CallContext) -> KscResult<i64> {
        self.ensure_live()?;
        let method = self
            .kind
            .count_method()
            .ok_or_else(|| self.unsupported("count"))?;
        let reply = self.call(ctx, method, self.kind.id_params(&self.id))?;
        reply.ret_val().and_then(Value::as_i64).ok_or_else(|| {
            let mut site = self.client.site(&self.kind.endpoint(method));
            site.handle = Some(HandleRef::Accessor(self.id.clone()));
            KscError::Envelope {
                site: Box::new(site),
                source: ksc_codec::CodecError::unexpected_shape("count reply has no PxgRetVal"),
            }
        })
    }

    /// Up to `count` records from the 0-based `start`.
    ///
    /// Near the tail the server returns fewer; past the end, none.
    pub fn fetch_range(&self, ctx: &CallContext, start: u64, count: u32) -> KscResult<Vec<Value>> {
        self.ensure_live()?;
        let method = self
            .kind
            .range_method()
            .ok_or_else(|| self.unsupported("range fetches"))?;
        if count == 0 {
            return Ok(Vec::new());
        }
        let reply = self.call(ctx, method, self.kind.range_params(&self.id, start, count))?;
        Ok(self.kind.records(reply))
    }

    /// The next `count` records of a forward-only iterator.
    ///
    /// Callers must not run two of these concurrently on one accessor; the
    /// server keeps a single cursor.
    pub fn next_chunk(&self, ctx: &CallContext, count: u32) -> KscResult<Vec<Value>> {
        self.ensure_live()?;
        if self.kind.is_random_access() {
            return Err(self.unsupported("cursor fetches"));
        }
        if self.is_exhausted() {
            return Ok(Vec::new());
        }
        let params = self
            .kind
            .id_params(&self.id)
            .with("nCount", i64::from(count));
        let reply = self.call(ctx, "GetNextItems", params)?;
        if reply.get("bEOF").and_then(Value::as_bool).unwrap_or(false) {
            self.exhausted.store(true, Ordering::Release);
        }
        Ok(self.kind.records(reply))
    }

    /// Releases the accessor. Releasing twice is not an error, and a server
    /// that already forgot the accessor counts as released.
    pub fn release(&self, ctx: &CallContext) -> KscResult<()> {
        if self.is_released() {
            return Ok(());
        }
        let method = self.kind.release_method();
        match self.call(ctx, method, self.kind.id_params(&self.id)) {
            Ok(_) => {}
            Err(e) if self.client.config().codes.is_not_found(&e) => {
                debug!(accessor = %self.id, "accessor already gone on the server");
            }
            Err(e) => return Err(e),
        }
        self.released.store(true, Ordering::Release);
        debug!(accessor = %self.id, kind = ?self.kind, "accessor released");
        Ok(())
    }

    /// Iterates the whole result set in chunks of `size`.
    ///
    /// Range-fetch kinds walk offsets from 0; forward-only kinds follow the
    /// server cursor. Iteration stops after a short chunk or an error.
    pub fn chunks<'a>(&'a self, ctx: &'a CallContext, size: u32) -> Chunks<'a> {
        Chunks {
            accessor: self,
            ctx,
            size: size.max(1),
            next: 0,
            done: false,
        }
    }
}

impl Drop for Accessor {
    fn drop(&mut self) {
        if !self.is_released() {
            debug!(accessor = %self.id, "accessor dropped without release; server will reap it");
        }
    }
}

/// Iterator over an accessor's records, one chunk per item.
pub struct Chunks<'a> {
    accessor: &'a Accessor,
    ctx: &'a CallContext,
    size: u32,
    next: u64,
    done: bool,
}

impl Iterator for Chunks<'_> {
    type Item = KscResult<Vec<Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let result = if self.accessor.kind.is_random_access() {
            self.accessor.fetch_range(self.ctx, self.next, self.size)
        } else {
            self.accessor.next_chunk(self.ctx, self.size)
        };
        match result {
            Ok(records) => {
                let fetched = records.len() as u64;
                self.next += fetched;
                let short = fetched < u64::from(self.size);
                if short || self.accessor.is_exhausted() {
                    self.done = true;
                }
                if records.is_empty() {
                    return None;
                }
                Some(Ok(records))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_stay_distinct() {
        let fields: Vec<_> = [
            IteratorKind::ChunkAccessor,
            IteratorKind::SrvView,
            IteratorKind::EventProcessing,
            IteratorKind::GroupSync,
        ]
        .into_iter()
        .map(IteratorKind::id_field)
        .collect();
        assert_eq!(
            fields,
            ["strAccessor", "wstrIteratorId", "strIteratorId", "szwIterator"]
        );
    }

    #[test]
    fn range_params_per_kind() {
        let p = IteratorKind::ChunkAccessor.range_params("a", 1000, 500);
        assert_eq!(p.get_str("strAccessor"), Some("a"));
        assert_eq!(p.get_i64("lStart"), Some(1000));
        assert_eq!(p.get_i64("lCount"), Some(500));

        let p = IteratorKind::SrvView.range_params("v", 10, 5);
        assert_eq!(p.get_str("wstrIteratorId"), Some("v"));
        assert_eq!(p.get_i64("nStart"), Some(10));
        assert_eq!(p.get_i64("nEnd"), Some(15));
    }

    #[test]
    fn records_from_each_container_shape() {
        let chunk = Reply::from_params(Params::new().with(
            "pChunk",
            Params::new().with(ITERATOR_ARRAY, vec![Value::from(1i64), Value::from(2i64)]),
        ));
        assert_eq!(IteratorKind::ChunkAccessor.records(chunk).len(), 2);

        let events = Reply::from_params(Params::new().with(
            "pParamsEvents",
            Value::tagged_params(Params::new().with(EVENT_RANGE_ARRAY, vec![Value::from("e")])),
        ));
        assert_eq!(IteratorKind::EventProcessing.records(events).len(), 1);

        let sync = Reply::from_params(Params::new().with("pData", vec![Value::from("h")]));
        assert_eq!(IteratorKind::GroupSync.records(sync).len(), 1);

        let empty = Reply::from_params(Params::new().with("pChunk", Params::new()));
        assert!(IteratorKind::ChunkAccessor.records(empty).is_empty());
    }
}
