//! Endpoint identities and the per-endpoint catalog.
//!
//! The server is inconsistent across services: some endpoints reject `{}`
//! and want no body at all, older async endpoints name their handle
//! `strRequestId` instead of `wstrActionGuid`, and cancel endpoints are
//! named per service. The catalog records these facts per endpoint instead
//! of guessing.

use crate::accessor::IteratorKind;
use crate::error::{KscError, KscResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;

/// A `Service.Method` endpoint identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    service: String,
    method: String,
}

impl Endpoint {
    /// Creates an endpoint, validating both identifiers.
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> KscResult<Self> {
        let service = service.into();
        let method = method.into();
        validate_identifier(&service, "service")?;
        validate_identifier(&method, "method")?;
        Ok(Self { service, method })
    }

    /// Parses `Service.Method`.
    pub fn parse(path: &str) -> KscResult<Self> {
        let (service, method) = path
            .split_once('.')
            .ok_or_else(|| KscError::validation(format!("endpoint {:?} has no '.'", path)))?;
        Self::new(service, method)
    }

    /// An endpoint from identifiers known to be valid.
    pub(crate) fn known(service: &str, method: &str) -> Self {
        debug_assert!(validate_identifier(service, "service").is_ok());
        debug_assert!(validate_identifier(method, "method").is_ok());
        Self {
            service: service.to_string(),
            method: method.to_string(),
        }
    }

    /// The service group name.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The method name.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The URL path segment, `Service.Method`.
    pub fn path(&self) -> String {
        format!("{}.{}", self.service, self.method)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.method)
    }
}

fn validate_identifier(id: &str, what: &str) -> KscResult<()> {
    if id.is_empty() {
        return Err(KscError::validation(format!("{} name is empty", what)));
    }
    if !id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        return Err(KscError::validation(format!(
            "{} name {:?} must be a dot-free ASCII identifier",
            what, id
        )));
    }
    Ok(())
}

/// How an endpoint wants a parameterless request encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// No body at all; the server rejects `{}`.
    Absent,
    /// A JSON object, `{}` when there are no parameters.
    Object,
}

/// The field an async endpoint names its action handle with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionField {
    /// `wstrActionGuid`, the current convention.
    ActionGuid,
    /// `strRequestId`, used by a few older endpoints.
    RequestId,
}

impl ActionField {
    /// The wire field name.
    pub fn wire_name(self) -> &'static str {
        match self {
            ActionField::ActionGuid => "wstrActionGuid",
            ActionField::RequestId => "strRequestId",
        }
    }
}

/// Whether an endpoint can be called on every supported server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    /// Works on every supported server.
    Available,
    /// Documented as not working on some server versions.
    VersionGated {
        /// What the server documentation says.
        note: String,
    },
}

/// What the client knows about one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    /// The endpoint.
    pub endpoint: Endpoint,
    /// Encoding of an empty parameter list.
    pub body: BodyKind,
    /// For async endpoints: the field carrying the action handle.
    pub action: Option<ActionField>,
    /// For async endpoints: the service-specific cancel endpoint.
    pub cancel: Option<Endpoint>,
    /// For find/reset endpoints: the kind of iterator minted.
    pub creates: Option<IteratorKind>,
    /// Version gating.
    pub availability: Availability,
}

impl EndpointSpec {
    /// A plain endpoint taking an object body.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            body: BodyKind::Object,
            action: None,
            cancel: None,
            creates: None,
            availability: Availability::Available,
        }
    }

    /// Marks the endpoint as taking no body.
    #[must_use]
    pub fn absent_body(mut self) -> Self {
        self.body = BodyKind::Absent;
        self
    }

    /// Marks the endpoint as starting an async action.
    #[must_use]
    pub fn async_action(mut self, field: ActionField, cancel: Option<Endpoint>) -> Self {
        self.action = Some(field);
        self.cancel = cancel;
        self
    }

    /// Marks the endpoint as minting an iterator.
    #[must_use]
    pub fn creates(mut self, kind: IteratorKind) -> Self {
        self.creates = Some(kind);
        self
    }

    /// Marks the endpoint as version-gated.
    #[must_use]
    pub fn version_gated(mut self, note: impl Into<String>) -> Self {
        self.availability = Availability::VersionGated { note: note.into() };
        self
    }

    /// Returns true if the endpoint may be called by a liveness probe.
    pub fn is_probe_safe(&self) -> bool {
        self.availability == Availability::Available
    }
}

/// Per-endpoint metadata, shared by every call of a client context.
#[derive(Debug, Default)]
pub struct EndpointCatalog {
    entries: RwLock<HashMap<String, EndpointSpec>>,
}

impl EndpointCatalog {
    /// An empty catalog.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The catalog of endpoints the core itself relies on.
    pub fn builtin() -> Self {
        let catalog = Self::empty();
        let ep = Endpoint::known;

        for method in ["StartSession", "EndSession", "Ping", "CreateToken"] {
            catalog.register(EndpointSpec::new(ep("Session", method)).absent_body());
        }
        catalog.register(
            EndpointSpec::new(ep("EventNotificationProperties", "GetDefaultSettings"))
                .absent_body(),
        );
        catalog.register(EndpointSpec::new(ep("AdmServerSettings", "GetSharedFolder")));

        catalog.register(
            EndpointSpec::new(ep("HostGroup", "FindHosts")).creates(IteratorKind::ChunkAccessor),
        );
        catalog.register(EndpointSpec::new(ep("HostGroup", "FindHostsAsync")).async_action(
            ActionField::RequestId,
            Some(ep("HostGroup", "FindHostsAsyncCancel")),
        ));
        catalog.register(
            EndpointSpec::new(ep("HostGroup", "FindHostsAsyncGetAccessor"))
                .creates(IteratorKind::ChunkAccessor),
        );
        catalog.register(
            EndpointSpec::new(ep("HostTagsRulesApi", "ExecuteRule")).async_action(
                ActionField::ActionGuid,
                Some(ep("HostTagsRulesApi", "CancelAsyncAction")),
            ),
        );
        catalog.register(
            EndpointSpec::new(ep("SrvView", "ResetIterator")).creates(IteratorKind::SrvView),
        );
        catalog.register(
            EndpointSpec::new(ep("EventProcessingFactory", "CreateEventProcessing"))
                .creates(IteratorKind::EventProcessing),
        );
        catalog.register(
            EndpointSpec::new(ep("GroupSync", "GetSyncHostsInfo")).creates(IteratorKind::GroupSync),
        );

        catalog
    }

    /// Adds or replaces an entry.
    pub fn register(&self, spec: EndpointSpec) {
        self.entries.write().insert(spec.endpoint.path(), spec);
    }

    /// Looks up an endpoint.
    pub fn get(&self, endpoint: &Endpoint) -> Option<EndpointSpec> {
        self.entries.read().get(&endpoint.path()).cloned()
    }

    /// Body discipline for an endpoint; unknown endpoints take `{}`.
    pub fn body_kind(&self, endpoint: &Endpoint) -> BodyKind {
        self.entries
            .read()
            .get(&endpoint.path())
            .map(|s| s.body)
            .unwrap_or(BodyKind::Object)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the catalog has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parse_and_path() {
        let ep = Endpoint::parse("HostGroup.FindHosts").unwrap();
        assert_eq!(ep.service(), "HostGroup");
        assert_eq!(ep.method(), "FindHosts");
        assert_eq!(ep.path(), "HostGroup.FindHosts");
        assert_eq!(ep.to_string(), "HostGroup.FindHosts");
    }

    #[test]
    fn endpoint_rejects_bad_identifiers() {
        assert!(Endpoint::parse("NoDot").is_err());
        assert!(Endpoint::parse("A.B.C").is_err());
        assert!(Endpoint::new("", "Ping").is_err());
        assert!(Endpoint::new("Host Group", "Find").is_err());
        assert!(Endpoint::new("HostGroup", "Find/../x").is_err());
    }

    #[test]
    fn builtin_body_discipline() {
        let catalog = EndpointCatalog::builtin();
        for path in [
            "Session.Ping",
            "Session.EndSession",
            "Session.StartSession",
            "EventNotificationProperties.GetDefaultSettings",
        ] {
            let ep = Endpoint::parse(path).unwrap();
            assert_eq!(catalog.body_kind(&ep), BodyKind::Absent, "{}", path);
        }
        let ep = Endpoint::parse("AdmServerSettings.GetSharedFolder").unwrap();
        assert_eq!(catalog.body_kind(&ep), BodyKind::Object);
        let unknown = Endpoint::parse("LicenseKeys.InstallKey").unwrap();
        assert_eq!(catalog.body_kind(&unknown), BodyKind::Object);
    }

    #[test]
    fn async_endpoints_are_catalogued_per_service() {
        let catalog = EndpointCatalog::builtin();

        let find = catalog
            .get(&Endpoint::parse("HostGroup.FindHostsAsync").unwrap())
            .unwrap();
        assert_eq!(find.action, Some(ActionField::RequestId));
        assert_eq!(
            find.cancel.unwrap().path(),
            "HostGroup.FindHostsAsyncCancel"
        );

        let rule = catalog
            .get(&Endpoint::parse("HostTagsRulesApi.ExecuteRule").unwrap())
            .unwrap();
        assert_eq!(rule.action, Some(ActionField::ActionGuid));
        assert_eq!(
            rule.cancel.unwrap().path(),
            "HostTagsRulesApi.CancelAsyncAction"
        );
    }

    #[test]
    fn register_version_gated() {
        let catalog = EndpointCatalog::empty();
        let ep = Endpoint::parse("Legacy.Method").unwrap();
        catalog.register(EndpointSpec::new(ep.clone()).version_gated("not working on KSC 10"));
        let spec = catalog.get(&ep).unwrap();
        assert!(!spec.is_probe_safe());
        assert_eq!(catalog.len(), 1);
    }
}
