//! Settings-storage sessions.
//!
//! Policies, policy profiles and effective-policy snapshots are edited
//! through opaque storage handles. Reads go straight through; writes and
//! section edits are staged on the server and only become visible when
//! [`SettingsStorage::apply`] commits them. A handle must be released
//! whether or not apply succeeded; [`with_storage`] takes care of that.

use crate::context::CallContext;
use crate::endpoint::Endpoint;
use crate::error::{HandleRef, KscError, KscResult};
use crate::session::KscClient;
use ksc_codec::{Params, Reply, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Longest product, version or section name the server accepts.
pub const MAX_NAME_LEN: usize = 31;

/// Characters forbidden in product, version and section names.
pub const FORBIDDEN_CHARS: [char; 8] = ['/', '\\', ':', '*', '?', '"', '<', '>'];

const CONTENTS: &str = "SsContents";
const POLICY: &str = "Policy";

fn validate_name(name: &str, position: &str) -> KscResult<()> {
    if name.is_empty() {
        return Err(KscError::validation(format!("{} name is empty", position)));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(KscError::validation(format!(
            "{} name {:?} is longer than {} characters",
            position, name, MAX_NAME_LEN
        )));
    }
    if let Some(c) = name.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return Err(KscError::validation(format!(
            "{} name {:?} contains forbidden character {:?}",
            position, name, c
        )));
    }
    Ok(())
}

/// A (product, version, section) address inside a storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageAddress {
    product: String,
    version: String,
    section: String,
}

impl StorageAddress {
    /// Validates and builds an address.
    pub fn new(
        product: impl Into<String>,
        version: impl Into<String>,
        section: impl Into<String>,
    ) -> KscResult<Self> {
        let address = Self {
            product: product.into(),
            version: version.into(),
            section: section.into(),
        };
        validate_name(&address.product, "product")?;
        validate_name(&address.version, "version")?;
        validate_name(&address.section, "section")?;
        Ok(address)
    }

    /// Product name.
    pub fn product(&self) -> &str {
        &self.product
    }

    /// Product version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Section name.
    pub fn section(&self) -> &str {
        &self.section
    }

    fn to_params(&self, id: &str) -> Params {
        Params::new()
            .with("wstrID", id)
            .with("wstrProduct", self.product.as_str())
            .with("wstrVersion", self.version.as_str())
            .with("wstrSection", self.section.as_str())
    }
}

/// How a write combines with the stored section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOption {
    /// Update existing values; add missing ones.
    Update,
    /// Add values; fail on existing ones.
    Add,
    /// Replace the section contents.
    Replace,
    /// Delete the named values.
    Delete,
    /// Clear the section, then write.
    Clear,
}

impl WriteOption {
    /// The integer the server uses for this option.
    pub fn wire(self) -> i64 {
        match self {
            WriteOption::Update => 1,
            WriteOption::Add => 2,
            WriteOption::Replace => 3,
            WriteOption::Delete => 4,
            WriteOption::Clear => 7,
        }
    }

    /// Maps a wire integer back, rejecting unknown values.
    pub fn from_wire(code: i64) -> KscResult<Self> {
        match code {
            1 => Ok(WriteOption::Update),
            2 => Ok(WriteOption::Add),
            3 => Ok(WriteOption::Replace),
            4 => Ok(WriteOption::Delete),
            7 => Ok(WriteOption::Clear),
            other => Err(KscError::validation(format!(
                "write option {} is not one of 1, 2, 3, 4, 7",
                other
            ))),
        }
    }

    fn method(self) -> &'static str {
        match self {
            WriteOption::Update => "Ss_Update",
            WriteOption::Add => "Ss_Add",
            WriteOption::Replace => "Ss_Replace",
            WriteOption::Delete => "Ss_Delete",
            WriteOption::Clear => "Ss_Clear",
        }
    }
}

/// How to obtain a storage handle.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageOpener {
    /// Contents of a policy, optionally at a revision (0 = current).
    PolicyContents {
        /// Policy id.
        policy_id: i64,
        /// Revision id; 0 opens the current policy for editing.
        revision: i64,
    },
    /// The effective contents of a policy, read-only.
    EffectivePolicy {
        /// Policy id.
        policy_id: i64,
    },
    /// A new profile of a policy, staged until apply.
    AddProfile {
        /// Policy id.
        policy_id: i64,
        /// Profile name; must be unique within the policy.
        name: String,
        /// Profile attributes.
        attributes: Params,
    },
    /// Any other endpoint returning a storage id.
    Custom {
        /// Endpoint to call.
        endpoint: Endpoint,
        /// Request parameters.
        params: Params,
        /// Reply field holding the id; `None` reads `PxgRetVal`.
        id_field: Option<String>,
    },
}

impl StorageOpener {
    fn request(&self, lifetime_secs: i64) -> (Endpoint, Params, Option<&str>) {
        match self {
            StorageOpener::PolicyContents {
                policy_id,
                revision,
            } => (
                Endpoint::known(POLICY, "GetPolicyContents"),
                Params::new()
                    .with("nPolicy", *policy_id)
                    .with("nRevisionId", *revision)
                    .with("nLifeTime", lifetime_secs),
                None,
            ),
            StorageOpener::EffectivePolicy { policy_id } => (
                Endpoint::known(POLICY, "GetEffectivePolicyContents"),
                Params::new()
                    .with("nPolicy", *policy_id)
                    .with("nLifeTime", lifetime_secs),
                None,
            ),
            StorageOpener::AddProfile {
                policy_id,
                name,
                attributes,
            } => (
                Endpoint::known(POLICY, "AddPolicyProfile"),
                Params::new()
                    .with("nPolicy", *policy_id)
                    .with("szwName", name.as_str())
                    .with("pAttrs", attributes.clone())
                    .with("nLifeTime", lifetime_secs),
                None,
            ),
            StorageOpener::Custom {
                endpoint,
                params,
                id_field,
            } => (endpoint.clone(), params.clone(), id_field.as_deref()),
        }
    }
}

fn storage_id(reply: &Reply, id_field: Option<&str>) -> Option<String> {
    let value = match id_field {
        Some(field) => reply.get(field),
        None => reply.ret_val(),
    };
    value
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// An open settings-storage handle.
#[derive(Debug)]
pub struct SettingsStorage {
    client: KscClient,
    id: String,
    released: AtomicBool,
}

impl SettingsStorage {
    /// Opens a storage handle.
    pub fn open(client: &KscClient, ctx: &CallContext, opener: &StorageOpener) -> KscResult<Self> {
        let lifetime = i64::try_from(client.config().accessor_lifetime.as_secs()).unwrap_or(i64::MAX);
        let (endpoint, params, id_field) = opener.request(lifetime);
        let reply = client.call(ctx, &endpoint, params)?;
        let id = storage_id(&reply, id_field).ok_or_else(|| KscError::Envelope {
            site: Box::new(client.site(&endpoint)),
            source: ksc_codec::CodecError::unexpected_shape("reply carries no storage id"),
        })?;
        debug!(storage = %id, opener = %endpoint, "storage opened");
        Ok(Self::from_id(client.clone(), id))
    }

    /// Wraps a storage id obtained elsewhere.
    pub fn from_id(client: KscClient, id: impl Into<String>) -> Self {
        Self {
            client,
            id: id.into(),
            released: AtomicBool::new(false),
        }
    }

    /// The opaque storage id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns true once released.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn call(&self, ctx: &CallContext, method: &str, params: Params) -> KscResult<Reply> {
        if self.is_released() {
            return Err(KscError::validation(format!(
                "storage {} has been released",
                self.id
            )));
        }
        self.client
            .call(ctx, &Endpoint::known(CONTENTS, method), params)
            .map_err(|e| e.with_handle(HandleRef::Storage(self.id.clone())))
    }

    /// Lists names one level below the given prefix.
    ///
    /// No product lists products; a product without a version lists its
    /// versions; both list the sections.
    pub fn get_names(
        &self,
        ctx: &CallContext,
        product: Option<&str>,
        version: Option<&str>,
    ) -> KscResult<Vec<String>> {
        if product.is_none() && version.is_some() {
            return Err(KscError::validation("a version needs a product"));
        }
        if let Some(product) = product {
            validate_name(product, "product")?;
        }
        if let Some(version) = version {
            validate_name(version, "version")?;
        }
        let params = Params::new()
            .with("wstrID", self.id.as_str())
            .with("wstrProduct", product.unwrap_or_default())
            .with("wstrVersion", version.unwrap_or_default());
        let reply = self.call(ctx, "Ss_GetNames", params)?;
        Ok(reply
            .ret_val()
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Reads a section.
    pub fn read(&self, ctx: &CallContext, address: &StorageAddress) -> KscResult<Params> {
        let reply = self.call(ctx, "Ss_Read", address.to_params(&self.id))?;
        Ok(reply
            .ret_val()
            .and_then(Value::as_params)
            .cloned()
            .unwrap_or_default())
    }

    /// Stages a write to a section.
    pub fn write(
        &self,
        ctx: &CallContext,
        address: &StorageAddress,
        option: WriteOption,
        data: Params,
    ) -> KscResult<()> {
        let params = address.to_params(&self.id).with("pNewData", data);
        self.call(ctx, option.method(), params)?;
        Ok(())
    }

    /// Stages a write given the option's wire integer.
    pub fn write_code(
        &self,
        ctx: &CallContext,
        address: &StorageAddress,
        option: i64,
        data: Params,
    ) -> KscResult<()> {
        self.write(ctx, address, WriteOption::from_wire(option)?, data)
    }

    /// Stages creation of a section.
    pub fn create_section(&self, ctx: &CallContext, address: &StorageAddress) -> KscResult<()> {
        self.call(ctx, "Ss_CreateSection", address.to_params(&self.id))?;
        Ok(())
    }

    /// Stages deletion of a section.
    pub fn delete_section(&self, ctx: &CallContext, address: &StorageAddress) -> KscResult<()> {
        self.call(ctx, "Ss_DeleteSection", address.to_params(&self.id))?;
        Ok(())
    }

    /// Commits every staged edit atomically.
    ///
    /// On failure nothing staged is visible and the handle state is
    /// undefined; release it regardless.
    pub fn apply(&self, ctx: &CallContext) -> KscResult<()> {
        self.call(ctx, "Ss_Apply", Params::new().with("wstrID", self.id.as_str()))?;
        info!(storage = %self.id, "storage changes applied");
        Ok(())
    }

    /// Releases the handle. Idempotent.
    pub fn release(&self, ctx: &CallContext) -> KscResult<()> {
        if self.is_released() {
            return Ok(());
        }
        let result = self.client.call(
            ctx,
            &Endpoint::known(CONTENTS, "Ss_Release"),
            Params::new().with("wstrID", self.id.as_str()),
        );
        match result {
            Ok(_) => {}
            Err(e) if self.client.config().codes.is_not_found(&e) => {}
            Err(e) => return Err(e.with_handle(HandleRef::Storage(self.id.clone()))),
        }
        self.released.store(true, Ordering::Release);
        debug!(storage = %self.id, "storage released");
        Ok(())
    }
}

/// Opens a storage, runs `f` and releases the storage however `f` ended.
///
/// If `ctx` is cancelled by the time of release, the release runs on a
/// detached context. A release failure is returned only when `f`
/// succeeded; otherwise it is logged and `f`'s error wins.
pub fn with_storage<T, F>(
    client: &KscClient,
    ctx: &CallContext,
    opener: &StorageOpener,
    f: F,
) -> KscResult<T>
where
    F: FnOnce(&SettingsStorage) -> KscResult<T>,
{
    let storage = SettingsStorage::open(client, ctx, opener)?;
    let result = f(&storage);

    let release_ctx = if ctx.cancel_reason().is_some() {
        CallContext::detached(client.config().timeout)
    } else {
        ctx.clone()
    };
    let released = storage.release(&release_ctx);

    match (result, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(release_err)) => {
            warn!(storage = %storage.id, error = %release_err, "storage release failed after error");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_validation() {
        assert!(StorageAddress::new("1093", "1.0.0.0", "85").is_ok());
        assert!(StorageAddress::new("", "1.0.0.0", "85").is_err());
        assert!(StorageAddress::new("1093", "", "85").is_err());
        assert!(StorageAddress::new("1093", "1.0.0.0", "").is_err());
        assert!(StorageAddress::new("1093", "1.0.0.0", "x".repeat(32)).is_err());
        assert!(StorageAddress::new("1093", "1.0.0.0", "x".repeat(31)).is_ok());
    }

    #[test]
    fn forbidden_characters_rejected_in_every_position() {
        for c in FORBIDDEN_CHARS {
            let bad = format!("a{}b", c);
            assert!(StorageAddress::new(bad.as_str(), "v", "s").is_err(), "{:?}", c);
            assert!(StorageAddress::new("p", bad.as_str(), "s").is_err(), "{:?}", c);
            assert!(StorageAddress::new("p", "v", bad.as_str()).is_err(), "{:?}", c);
        }
    }

    #[test]
    fn write_option_wire_mapping() {
        for option in [
            WriteOption::Update,
            WriteOption::Add,
            WriteOption::Replace,
            WriteOption::Delete,
            WriteOption::Clear,
        ] {
            assert_eq!(WriteOption::from_wire(option.wire()).unwrap(), option);
        }
        assert_eq!(WriteOption::Clear.wire(), 7);
        for bad in [0, 5, 6, 8, -1] {
            assert!(WriteOption::from_wire(bad).is_err());
        }
    }

    #[test]
    fn opener_requests() {
        let opener = StorageOpener::AddProfile {
            policy_id: 12,
            name: "Laptops".into(),
            attributes: Params::new(),
        };
        let (ep, params, field) = opener.request(600);
        assert_eq!(ep.path(), "Policy.AddPolicyProfile");
        assert_eq!(params.get_str("szwName"), Some("Laptops"));
        assert_eq!(params.get_i64("nLifeTime"), Some(600));
        assert!(field.is_none());
    }

    #[test]
    fn storage_id_extraction() {
        let reply = Reply::from_params(Params::new().with("PxgRetVal", "ss-1"));
        assert_eq!(storage_id(&reply, None).as_deref(), Some("ss-1"));
        let reply = Reply::from_params(Params::new().with("wstrID", "ss-2"));
        assert_eq!(storage_id(&reply, Some("wstrID")).as_deref(), Some("ss-2"));
        assert!(storage_id(&Reply::default(), None).is_none());
    }
}
