//! The fake Administration Server.
//!
//! One [`FakeKscServer`] holds all server-side state: credentials, live
//! sessions, accessors, scripted async actions, policies and their storage
//! handles. Clients reach it through [`FakeConnection`]s; each connection
//! carries its own authentication, the way a pooled HTTPS connection does
//! on the real server.

use crate::fixtures::{self, codes};
use crate::wire::{FakeRequest, FakeResponse};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ksc_codec::{Params, PxgError, Value, RET_VAL};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Endpoints that reject any body, `{}` included.
pub const NO_BODY_ENDPOINTS: &[&str] = &[
    "Session.StartSession",
    "Session.EndSession",
    "Session.Ping",
    "Session.CreateToken",
    "EventNotificationProperties.GetDefaultSettings",
];

/// One scripted reply of `CheckActionState`.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionStep {
    /// Not finalized; advise `delay_ms` before the next poll.
    Pending {
        /// `lNextCheckDelay`.
        delay_ms: i64,
        /// `pStateData`.
        data: Params,
    },
    /// Finalized successfully.
    Succeed {
        /// `pStateData`.
        data: Params,
    },
    /// Finalized with an error.
    Fail {
        /// `pStateData`, normally carrying the `KLBLAG_ERROR_*` tuple.
        data: Params,
    },
    /// Reject the poll as too frequent, whatever the timing.
    TooFrequent,
}

impl ActionStep {
    /// A pending step.
    pub fn pending(delay_ms: i64, data: Params) -> Self {
        ActionStep::Pending { delay_ms, data }
    }

    /// A success step.
    pub fn succeed(data: Params) -> Self {
        ActionStep::Succeed { data }
    }

    /// A failure step.
    pub fn fail(data: Params) -> Self {
        ActionStep::Fail { data }
    }
}

/// A request as recorded by the server.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Connection it arrived on.
    pub connection: u64,
    /// The request.
    pub request: FakeRequest,
    /// Arrival time.
    pub at: Instant,
}

struct Fault {
    status: u16,
    error: PxgError,
}

impl Fault {
    fn new(status: u16, code: i64, message: impl Into<String>) -> Self {
        Self {
            status,
            error: PxgError::new(code, message).with_module("fake-ksc"),
        }
    }

    fn not_found(what: impl Into<String>) -> Self {
        Self::new(200, codes::NOT_FOUND, what)
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self::new(400, codes::INVALID_ARGUMENT, message)
    }

    fn denied(status: u16, message: impl Into<String>) -> Self {
        Self::new(status, codes::ACCESS_DENIED, message)
    }
}

type Handled = Result<FakeResponse, Fault>;

struct FakeAccessor {
    records: Vec<Value>,
    cursor: usize,
}

struct FakeAction {
    steps: VecDeque<ActionStep>,
    last_poll: Option<Instant>,
    required_gap: Option<Duration>,
    cancelled: bool,
}

#[derive(Default)]
struct HostSearch {
    done: bool,
}

/// Product, version and section of a settings section.
pub type SectionKey = (String, String, String);

#[derive(Default)]
struct FakePolicy {
    profiles: Vec<String>,
    sections: BTreeMap<SectionKey, Params>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StorageKind {
    Contents,
    Effective,
    Profile { name: String },
}

struct FakeStorage {
    policy: i64,
    kind: StorageKind,
    view: BTreeMap<SectionKey, Params>,
}

struct State {
    users: HashMap<String, String>,
    vservers: HashSet<String>,
    web_tokens: HashSet<String>,
    tokens: HashSet<String>,
    gzip: bool,
    enforce_poll_interval: bool,
    shared_folder: String,
    default_notification: Params,
    hosts: Vec<Value>,
    failed_slaves: Option<Params>,
    slaves: HashSet<String>,

    connections: HashMap<u64, bool>,
    sessions: HashSet<String>,
    short_lived: HashSet<String>,
    gateway_keys: HashSet<String>,
    accessors: HashMap<String, FakeAccessor>,
    actions: HashMap<String, FakeAction>,
    cancelled_actions: HashSet<String>,
    searches: HashMap<String, HostSearch>,
    rule_scripts: VecDeque<Vec<ActionStep>>,
    search_scripts: VecDeque<Vec<ActionStep>>,
    policies: HashMap<i64, FakePolicy>,
    storages: HashMap<String, FakeStorage>,

    log: Vec<RecordedRequest>,
    resets: usize,
}

impl Default for State {
    fn default() -> Self {
        let mut users = HashMap::new();
        users.insert(
            fixtures::ADMIN_USER.to_string(),
            fixtures::ADMIN_PASSWORD.to_string(),
        );
        Self {
            users,
            vservers: HashSet::new(),
            web_tokens: HashSet::new(),
            tokens: HashSet::new(),
            gzip: false,
            enforce_poll_interval: true,
            shared_folder: fixtures::SHARED_FOLDER.to_string(),
            default_notification: Params::new()
                .with("KLEVP_ND_DAYS_TO_STORE_EVENT", 30i64)
                .with("KLEVP_ND_USE_EMAIL", false),
            hosts: Vec::new(),
            failed_slaves: None,
            slaves: HashSet::new(),
            connections: HashMap::new(),
            sessions: HashSet::new(),
            short_lived: HashSet::new(),
            gateway_keys: HashSet::new(),
            accessors: HashMap::new(),
            actions: HashMap::new(),
            cancelled_actions: HashSet::new(),
            searches: HashMap::new(),
            rule_scripts: VecDeque::new(),
            search_scripts: VecDeque::new(),
            policies: HashMap::new(),
            storages: HashMap::new(),
            log: Vec::new(),
            resets: 0,
        }
    }
}

fn new_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

fn arg_str(params: &Params, key: &str) -> Result<String, Fault> {
    params
        .get_str(key)
        .map(str::to_string)
        .ok_or_else(|| Fault::invalid(format!("missing string argument {}", key)))
}

fn arg_i64(params: &Params, key: &str) -> Result<i64, Fault> {
    params
        .get_i64(key)
        .ok_or_else(|| Fault::invalid(format!("missing integer argument {}", key)))
}

fn arg_usize(params: &Params, key: &str) -> Result<usize, Fault> {
    usize::try_from(arg_i64(params, key)?)
        .map_err(|_| Fault::invalid(format!("argument {} is negative", key)))
}

fn quoted<'a>(text: &'a str, field: &str) -> Option<&'a str> {
    let marker = format!("{}=\"", field);
    let start = text.find(&marker)? + marker.len();
    let end = start + text[start..].find('"')?;
    Some(&text[start..end])
}

fn decode_b64(text: &str) -> Option<String> {
    STANDARD
        .decode(text)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

/// An in-memory KSC Administration Server.
#[derive(Clone, Default)]
pub struct FakeKscServer {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    next_connection: AtomicU64,
}

impl FakeKscServer {
    /// A server accepting `admin`/`secret`, with no hosts or policies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts another user.
    #[must_use]
    pub fn with_user(self, user: &str, password: &str) -> Self {
        self.inner
            .state
            .lock()
            .users
            .insert(user.to_string(), password.to_string());
        self
    }

    /// Hosts a virtual server.
    #[must_use]
    pub fn with_vserver(self, name: &str) -> Self {
        self.inner.state.lock().vservers.insert(name.to_string());
        self
    }

    /// Accepts a `KSCWT` token.
    #[must_use]
    pub fn with_web_token(self, token: &str) -> Self {
        self.inner.state.lock().web_tokens.insert(token.to_string());
        self
    }

    /// Accepts a long-lived `KSCT` token.
    #[must_use]
    pub fn with_token(self, token: &str) -> Self {
        self.inner.state.lock().tokens.insert(token.to_string());
        self
    }

    /// Gzip-compresses every non-empty reply.
    #[must_use]
    pub fn with_gzip(self, on: bool) -> Self {
        self.inner.state.lock().gzip = on;
        self
    }

    /// Whether polls sooner than the advised delay are rejected. On by
    /// default.
    #[must_use]
    pub fn with_poll_enforcement(self, on: bool) -> Self {
        self.inner.state.lock().enforce_poll_interval = on;
        self
    }

    /// Sets the shared folder path.
    #[must_use]
    pub fn with_shared_folder(self, path: &str) -> Self {
        self.inner.state.lock().shared_folder = path.to_string();
        self
    }

    /// Populates `count` managed hosts.
    #[must_use]
    pub fn with_hosts(self, count: usize) -> Self {
        self.inner.state.lock().hosts = fixtures::host_records(count);
        self
    }

    /// Reports slave failures in federated host searches.
    #[must_use]
    pub fn with_failed_slaves(self, report: Params) -> Self {
        self.inner.state.lock().failed_slaves = Some(report);
        self
    }

    /// Adds a reachable slave server for gateway chains.
    #[must_use]
    pub fn with_slave(self, host_id: &str) -> Self {
        self.inner.state.lock().slaves.insert(host_id.to_string());
        self
    }

    /// Adds a policy with existing profiles and settings sections.
    #[must_use]
    pub fn with_policy(self, id: i64, profiles: &[&str], sections: Vec<(SectionKey, Params)>) -> Self {
        self.inner.state.lock().policies.insert(
            id,
            FakePolicy {
                profiles: profiles.iter().map(|p| p.to_string()).collect(),
                sections: sections.into_iter().collect(),
            },
        );
        self
    }

    /// Opens a new connection.
    pub fn connect(&self) -> FakeConnection {
        let id = self.inner.next_connection.fetch_add(1, Ordering::SeqCst);
        self.inner.state.lock().connections.insert(id, false);
        FakeConnection {
            server: self.clone(),
            id,
        }
    }

    /// Registers an action with a script and returns its GUID.
    pub fn script_action(&self, steps: Vec<ActionStep>) -> String {
        let guid = new_id("act");
        self.insert_action(&mut self.inner.state.lock(), guid.clone(), steps);
        guid
    }

    /// Script for the next `HostTagsRulesApi.ExecuteRule`.
    pub fn queue_rule_script(&self, steps: Vec<ActionStep>) {
        self.inner.state.lock().rule_scripts.push_back(steps);
    }

    /// Script for the next `HostGroup.FindHostsAsync`.
    pub fn queue_search_script(&self, steps: Vec<ActionStep>) {
        self.inner.state.lock().search_scripts.push_back(steps);
    }

    fn insert_action(&self, state: &mut State, guid: String, steps: Vec<ActionStep>) {
        state.actions.insert(
            guid,
            FakeAction {
                steps: steps.into(),
                last_poll: None,
                required_gap: None,
                cancelled: false,
            },
        );
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.inner.state.lock().log.clone()
    }

    /// Requests to one path, in order.
    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.inner
            .state
            .lock()
            .log
            .iter()
            .filter(|r| r.request.path == path)
            .cloned()
            .collect()
    }

    /// How many times a connection pool was reset.
    pub fn resets(&self) -> usize {
        self.inner.state.lock().resets
    }

    /// Number of live accessors.
    pub fn live_accessors(&self) -> usize {
        self.inner.state.lock().accessors.len()
    }

    /// Number of live storage handles.
    pub fn live_storages(&self) -> usize {
        self.inner.state.lock().storages.len()
    }

    /// Number of live session tokens.
    pub fn live_sessions(&self) -> usize {
        self.inner.state.lock().sessions.len()
    }

    /// Returns true if a cancel was received for the action.
    pub fn was_cancelled(&self, guid: &str) -> bool {
        self.inner.state.lock().cancelled_actions.contains(guid)
    }

    /// Profile names of a committed policy.
    pub fn policy_profiles(&self, policy: i64) -> Vec<String> {
        self.inner
            .state
            .lock()
            .policies
            .get(&policy)
            .map(|p| p.profiles.clone())
            .unwrap_or_default()
    }

    /// A committed policy section.
    pub fn policy_section(&self, policy: i64, product: &str, version: &str, section: &str) -> Option<Params> {
        let key = (product.to_string(), version.to_string(), section.to_string());
        self.inner
            .state
            .lock()
            .policies
            .get(&policy)
            .and_then(|p| p.sections.get(&key).cloned())
    }

    fn handle(&self, connection: u64, request: &FakeRequest) -> FakeResponse {
        let mut state = self.inner.state.lock();
        state.log.push(RecordedRequest {
            connection,
            request: request.clone(),
            at: Instant::now(),
        });
        trace!(connection, path = %request.path, "fake KSC request");

        let outcome = if request.path == "login" {
            self.login(&mut state, connection, request)
        } else {
            self.authorize(&mut state, connection, request)
                .and_then(|()| self.check_body(request))
                .and_then(|params| self.dispatch(&mut state, connection, request, params))
        };

        let response = match outcome {
            Ok(response) => response,
            Err(fault) => FakeResponse::error(fault.status, &fault.error),
        };
        if state.gzip {
            response.gzipped()
        } else {
            response
        }
    }

    fn authorize(&self, state: &mut State, connection: u64, request: &FakeRequest) -> Result<(), Fault> {
        match request.header("X-KSC-Session") {
            Some(token) if state.sessions.contains(token) => Ok(()),
            Some(_) => Err(Fault::denied(403, "session token is not valid")),
            None if state.connections.get(&connection).copied().unwrap_or(false) => Ok(()),
            // A fresh connection authenticates with the resent login headers.
            None => {
                if !self.accepts(state, request) {
                    return Err(Fault::denied(403, "connection is not authenticated"));
                }
                state.connections.insert(connection, true);
                Ok(())
            }
        }
    }

    fn check_body(&self, request: &FakeRequest) -> Result<Params, Fault> {
        let no_body = NO_BODY_ENDPOINTS.contains(&request.path.as_str());
        match (&request.body, no_body) {
            (Some(_), true) => Err(Fault::invalid(format!("{} takes no body", request.path))),
            (None, false) => Err(Fault::invalid(format!("{} needs a JSON object body", request.path))),
            _ => request.params().map_err(Fault::invalid),
        }
    }

    fn login(&self, state: &mut State, connection: u64, request: &FakeRequest) -> Handled {
        if request.body.is_some() {
            return Err(Fault::invalid("login takes no body"));
        }
        if request.header("Authorization").is_none() {
            return Err(Fault::denied(401, "no Authorization header"));
        }
        if !self.accepts(state, request) {
            return Err(Fault::denied(401, "authentication failed"));
        }
        state.connections.insert(connection, true);
        Ok(FakeResponse::void())
    }

    /// Checks the login headers, consuming single-use keys.
    fn accepts(&self, state: &mut State, request: &FakeRequest) -> bool {
        let Some(auth) = request.header("Authorization") else {
            return false;
        };
        if let Some(rest) = auth.strip_prefix("KSCBasic ") {
            let user = quoted(rest, "user").and_then(decode_b64);
            let pass = quoted(rest, "pass").and_then(decode_b64);
            let vserver_ok = match request.header("X-KSC-VServer") {
                Some("x") => true,
                Some(encoded) => decode_b64(encoded).is_some_and(|v| state.vservers.contains(&v)),
                None => false,
            };
            vserver_ok
                && matches!((user, pass), (Some(u), Some(p)) if state.users.get(&u) == Some(&p))
        } else if let Some(key) = auth.strip_prefix("KSCGW ") {
            state.gateway_keys.remove(key)
        } else if let Some(token) = auth.strip_prefix("KSCWT ") {
            state.gateway_keys.remove(token) || state.web_tokens.contains(token)
        } else if let Some(token) = auth.strip_prefix("KSCT ") {
            state.short_lived.remove(token) || state.tokens.contains(token)
        } else {
            false
        }
    }

    fn dispatch(&self, state: &mut State, connection: u64, request: &FakeRequest, p: Params) -> Handled {
        match request.path.as_str() {
            "Session.StartSession" => {
                let token = new_id("nst");
                state.sessions.insert(token.clone());
                Ok(FakeResponse::ret(token))
            }
            "Session.EndSession" => {
                if let Some(token) = request.header("X-KSC-Session") {
                    state.sessions.remove(token);
                }
                state.connections.insert(connection, false);
                Ok(FakeResponse::void())
            }
            "Session.Ping" => Ok(FakeResponse::void()),
            "Session.CreateToken" => {
                let token = new_id("slt");
                state.short_lived.insert(token.clone());
                Ok(FakeResponse::ret(token))
            }

            "AdmServerSettings.GetSharedFolder" => Ok(FakeResponse::ret(state.shared_folder.clone())),
            "EventNotificationProperties.GetDefaultSettings" => {
                Ok(FakeResponse::ret(state.default_notification.clone()))
            }

            "HostGroup.FindHosts" => {
                let records = state.hosts.clone();
                Ok(self.open_accessor(state, "strAccessor", records, false))
            }
            "HostGroup.FindHostsAsync" => {
                let guid = new_id("req");
                let steps = state.search_scripts.pop_front().unwrap_or_else(|| {
                    vec![
                        ActionStep::pending(200, fixtures::progress(50)),
                        ActionStep::succeed(Params::new()),
                    ]
                });
                self.insert_action(state, guid.clone(), steps);
                state.searches.insert(guid.clone(), HostSearch::default());
                Ok(FakeResponse::fields(Params::new().with("strRequestId", guid)))
            }
            "HostGroup.FindHostsAsyncCancel" => self.cancel_action(state, &arg_str(&p, "strRequestId")?),
            "HostGroup.FindHostsAsyncGetAccessor" => {
                let id = arg_str(&p, "strRequestId")?;
                match state.searches.get(&id).map(|search| search.done) {
                    Some(true) => {
                        let records = state.hosts.clone();
                        Ok(self.open_accessor(state, "strAccessor", records, true))
                    }
                    Some(false) => Err(Fault::invalid("search has not finished")),
                    None => Err(Fault::not_found("no such search")),
                }
            }

            "ChunkAccessor.GetItemsCount" => {
                let accessor = self.accessor(state, &p, "strAccessor")?;
                Ok(FakeResponse::ret(accessor.records.len() as i64))
            }
            "ChunkAccessor.GetItemsChunk" => {
                let start = arg_usize(&p, "lStart")?;
                let count = arg_usize(&p, "lCount")?;
                let accessor = self.accessor(state, &p, "strAccessor")?;
                let chunk: Vec<Value> = accessor
                    .records
                    .iter()
                    .skip(start)
                    .take(count)
                    .cloned()
                    .collect();
                let returned = chunk.len() as i64;
                Ok(FakeResponse::fields(
                    Params::new()
                        .with("pChunk", Params::new().with("KLCSP_ITERATOR_ARRAY", chunk))
                        .with(RET_VAL, returned),
                ))
            }
            "ChunkAccessor.Release" => self.release_accessor(state, &p, "strAccessor"),

            "GroupSync.GetSyncHostsInfo" => {
                let records = state.hosts.clone();
                Ok(self.open_accessor(state, "szwIterator", records, false))
            }
            "GroupSyncIterator.GetNextItems" => {
                let count = arg_usize(&p, "nCount")?;
                let accessor = self.accessor(state, &p, "szwIterator")?;
                let chunk: Vec<Value> = accessor
                    .records
                    .iter()
                    .skip(accessor.cursor)
                    .take(count)
                    .cloned()
                    .collect();
                accessor.cursor += chunk.len();
                let eof = accessor.cursor >= accessor.records.len();
                Ok(FakeResponse::fields(
                    Params::new()
                        .with("pData", Params::new().with("KLCSP_ITERATOR_ARRAY", chunk))
                        .with("bEOF", eof),
                ))
            }
            "GroupSyncIterator.ReleaseIterator" => self.release_accessor(state, &p, "szwIterator"),

            "AsyncActionStateChecker.CheckActionState" => {
                self.check_action(state, &arg_str(&p, "wstrActionGuid")?)
            }
            "HostTagsRulesApi.ExecuteRule" => {
                arg_i64(&p, "nRuleId")?;
                let guid = new_id("act");
                let steps = state.rule_scripts.pop_front().unwrap_or_else(|| {
                    vec![
                        ActionStep::pending(100, fixtures::progress(50)),
                        ActionStep::succeed(Params::new()),
                    ]
                });
                self.insert_action(state, guid.clone(), steps);
                Ok(FakeResponse::fields(Params::new().with("wstrActionGuid", guid)))
            }
            "HostTagsRulesApi.CancelAsyncAction" => {
                self.cancel_action(state, &arg_str(&p, "wstrActionGuid")?)
            }

            "Policy.GetPolicyContents" => self.open_storage(state, &p, StorageKind::Contents),
            "Policy.GetEffectivePolicyContents" => self.open_storage(state, &p, StorageKind::Effective),
            "Policy.AddPolicyProfile" => {
                let name = arg_str(&p, "szwName")?;
                self.open_storage(state, &p, StorageKind::Profile { name })
            }
            path if path.starts_with("SsContents.") => self.storage_call(state, &path["SsContents.".len()..], &p),

            "GatewayConnection.PrepareGatewayConnection" => self.prepare_gateway(state, &p, false),
            "GatewayConnection.PrepareTunnelConnection" => self.prepare_gateway(state, &p, true),

            other => Err(Fault::new(
                404,
                codes::UNKNOWN_METHOD,
                format!("unknown method {}", other),
            )),
        }
    }

    fn open_accessor(&self, state: &mut State, id_field: &str, records: Vec<Value>, federated: bool) -> FakeResponse {
        let id = new_id("acc");
        let count = records.len() as i64;
        state
            .accessors
            .insert(id.clone(), FakeAccessor { records, cursor: 0 });
        let mut reply = Params::new().with(id_field, id).with(RET_VAL, count);
        if federated {
            if let Some(report) = &state.failed_slaves {
                reply.insert("pFailedSlavesInfo", report.clone());
            }
        }
        FakeResponse::fields(reply)
    }

    fn accessor<'a>(&self, state: &'a mut State, p: &Params, id_field: &str) -> Result<&'a mut FakeAccessor, Fault> {
        let id = arg_str(p, id_field)?;
        state
            .accessors
            .get_mut(&id)
            .ok_or_else(|| Fault::not_found(format!("accessor {} not found", id)))
    }

    fn release_accessor(&self, state: &mut State, p: &Params, id_field: &str) -> Handled {
        let id = arg_str(p, id_field)?;
        match state.accessors.remove(&id) {
            Some(_) => Ok(FakeResponse::void()),
            None => Err(Fault::not_found(format!("accessor {} not found", id))),
        }
    }

    fn cancel_action(&self, state: &mut State, guid: &str) -> Handled {
        let action = state
            .actions
            .get_mut(guid)
            .ok_or_else(|| Fault::not_found(format!("action {} not found", guid)))?;
        action.cancelled = true;
        state.cancelled_actions.insert(guid.to_string());
        Ok(FakeResponse::void())
    }

    fn check_action(&self, state: &mut State, guid: &str) -> Handled {
        let enforce = state.enforce_poll_interval;
        let action = state
            .actions
            .get_mut(guid)
            .ok_or_else(|| Fault::not_found(format!("action {} not found", guid)))?;

        let now = Instant::now();
        if let (true, Some(last), Some(gap)) = (enforce, action.last_poll, action.required_gap) {
            if now.duration_since(last) < gap {
                return Err(Fault::new(200, codes::PERIOD_TOO_SMALL, "state check period is too small"));
            }
        }
        action.last_poll = Some(now);

        // A cancel loses the race against a scripted terminal step.
        let finishing = matches!(
            action.steps.front(),
            Some(ActionStep::Fail { .. } | ActionStep::Succeed { .. })
        );
        if action.cancelled && !finishing {
            state.actions.remove(guid);
            return Ok(finalized(false, 1, Params::new()));
        }

        match action.steps.pop_front() {
            Some(ActionStep::TooFrequent) => Err(Fault::new(
                200,
                codes::PERIOD_TOO_SMALL,
                "state check period is too small",
            )),
            Some(ActionStep::Pending { delay_ms, data }) => {
                action.required_gap = Some(Duration::from_millis(delay_ms.max(0).unsigned_abs()));
                Ok(FakeResponse::fields(
                    Params::new()
                        .with("bFinalized", false)
                        .with("bSuccededFinalized", false)
                        .with("lStateCode", 1i64)
                        .with("lNextCheckDelay", delay_ms)
                        .with("pStateData", data),
                ))
            }
            Some(ActionStep::Fail { data }) => {
                state.actions.remove(guid);
                Ok(finalized(false, 1, data))
            }
            Some(ActionStep::Succeed { data }) => {
                state.actions.remove(guid);
                if let Some(search) = state.searches.get_mut(guid) {
                    search.done = true;
                }
                Ok(finalized(true, 0, data))
            }
            None => {
                state.actions.remove(guid);
                if let Some(search) = state.searches.get_mut(guid) {
                    search.done = true;
                }
                Ok(finalized(true, 0, Params::new()))
            }
        }
    }

    fn open_storage(&self, state: &mut State, p: &Params, kind: StorageKind) -> Handled {
        let policy_id = arg_i64(p, "nPolicy")?;
        let policy = state
            .policies
            .get(&policy_id)
            .ok_or_else(|| Fault::not_found(format!("policy {} not found", policy_id)))?;
        let view = match kind {
            StorageKind::Profile { .. } => BTreeMap::new(),
            _ => policy.sections.clone(),
        };
        let id = new_id("ss");
        state.storages.insert(
            id.clone(),
            FakeStorage {
                policy: policy_id,
                kind,
                view,
            },
        );
        Ok(FakeResponse::ret(id))
    }

    fn storage_call(&self, state: &mut State, method: &str, p: &Params) -> Handled {
        let id = arg_str(p, "wstrID")?;

        if method == "Ss_Release" {
            return match state.storages.remove(&id) {
                Some(_) => Ok(FakeResponse::void()),
                None => Err(Fault::not_found(format!("storage {} not found", id))),
            };
        }
        if method == "Ss_Apply" {
            return apply_storage(state, &id);
        }

        let storage = state
            .storages
            .get_mut(&id)
            .ok_or_else(|| Fault::not_found(format!("storage {} not found", id)))?;

        if method == "Ss_GetNames" {
            let product = p.get_str("wstrProduct").unwrap_or_default();
            let version = p.get_str("wstrVersion").unwrap_or_default();
            let mut names: Vec<String> = storage
                .view
                .keys()
                .filter_map(|(prod, ver, sec)| match (product.is_empty(), version.is_empty()) {
                    (true, _) => Some(prod.clone()),
                    (false, true) if prod == product => Some(ver.clone()),
                    (false, false) if prod == product && ver == version => Some(sec.clone()),
                    _ => None,
                })
                .collect();
            names.dedup();
            let names: Vec<Value> = names.into_iter().map(Value::from).collect();
            return Ok(FakeResponse::ret(names));
        }

        let key: SectionKey = (
            arg_str(p, "wstrProduct")?,
            arg_str(p, "wstrVersion")?,
            arg_str(p, "wstrSection")?,
        );
        if storage.kind == StorageKind::Effective && method != "Ss_Read" {
            return Err(Fault::denied(200, "effective policy contents are read-only"));
        }

        match method {
            "Ss_Read" => storage
                .view
                .get(&key)
                .cloned()
                .map(FakeResponse::ret)
                .ok_or_else(|| Fault::not_found("section not found")),
            "Ss_CreateSection" => {
                if storage.view.contains_key(&key) {
                    return Err(Fault::new(200, codes::OBJECT_EXISTS, "section exists"));
                }
                storage.view.insert(key, Params::new());
                Ok(FakeResponse::void())
            }
            "Ss_DeleteSection" => match storage.view.remove(&key) {
                Some(_) => Ok(FakeResponse::void()),
                None => Err(Fault::not_found("section not found")),
            },
            "Ss_Update" | "Ss_Add" | "Ss_Replace" | "Ss_Delete" | "Ss_Clear" => {
                let data = p
                    .get_params("pNewData")
                    .cloned()
                    .ok_or_else(|| Fault::invalid("missing pNewData"))?;
                let section = storage
                    .view
                    .get_mut(&key)
                    .ok_or_else(|| Fault::not_found("section not found"))?;
                write_section(section, method, data)?;
                Ok(FakeResponse::void())
            }
            other => Err(Fault::new(
                404,
                codes::UNKNOWN_METHOD,
                format!("unknown method SsContents.{}", other),
            )),
        }
    }

    fn prepare_gateway(&self, state: &mut State, p: &Params, tunnel: bool) -> Handled {
        let chain = p
            .get_array("pLocations")
            .filter(|chain| !chain.is_empty())
            .ok_or_else(|| Fault::invalid("missing pLocations"))?;
        for hop in chain {
            let host = hop
                .as_params()
                .and_then(|h| h.get_str("location"))
                .ok_or_else(|| Fault::invalid("location descriptor without location"))?;
            if !state.slaves.contains(host) {
                return Err(Fault::new(
                    200,
                    codes::SLAVE_UNREACHABLE,
                    format!("slave {} is unreachable", host),
                ));
            }
        }
        if tunnel {
            arg_str(p, "szwTargetHost")?;
            arg_i64(p, "nTargetPort")?;
        }
        let key = new_id("gw");
        state.gateway_keys.insert(key.clone());
        Ok(FakeResponse::fields(Params::new().with("wstrAuthKey", key)))
    }

    fn reset(&self, connection: u64) {
        let mut state = self.inner.state.lock();
        state.connections.insert(connection, false);
        state.resets += 1;
    }
}

fn finalized(succeeded: bool, state_code: i64, data: Params) -> FakeResponse {
    FakeResponse::fields(
        Params::new()
            .with("bFinalized", true)
            .with("bSuccededFinalized", succeeded)
            .with("lStateCode", state_code)
            .with("pStateData", data),
    )
}

fn write_section(section: &mut Params, method: &str, data: Params) -> Result<(), Fault> {
    match method {
        "Ss_Update" => {
            for (key, value) in data {
                section.insert(key, value);
            }
        }
        "Ss_Add" => {
            if let Some(key) = data.keys().find(|k| section.contains_key(k)) {
                return Err(Fault::new(200, codes::OBJECT_EXISTS, format!("value {} exists", key)));
            }
            for (key, value) in data {
                section.insert(key, value);
            }
        }
        "Ss_Replace" | "Ss_Clear" => *section = data,
        "Ss_Delete" => {
            for key in data.keys() {
                section.remove(key);
            }
        }
        _ => {}
    }
    Ok(())
}

fn apply_storage(state: &mut State, id: &str) -> Handled {
    let storage = state
        .storages
        .get(id)
        .ok_or_else(|| Fault::not_found(format!("storage {} not found", id)))?;
    let policy = state
        .policies
        .get_mut(&storage.policy)
        .ok_or_else(|| Fault::not_found("policy is gone"))?;
    match &storage.kind {
        StorageKind::Effective => Err(Fault::denied(200, "effective policy contents are read-only")),
        StorageKind::Profile { name } => {
            if policy.profiles.contains(name) {
                return Err(Fault::new(
                    200,
                    codes::OBJECT_EXISTS,
                    format!("profile {} already exists", name),
                ));
            }
            policy.profiles.push(name.clone());
            Ok(FakeResponse::void())
        }
        StorageKind::Contents => {
            policy.sections = storage.view.clone();
            Ok(FakeResponse::void())
        }
    }
}

impl std::fmt::Debug for FakeKscServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("FakeKscServer")
            .field("sessions", &state.sessions.len())
            .field("accessors", &state.accessors.len())
            .field("actions", &state.actions.len())
            .field("storages", &state.storages.len())
            .finish()
    }
}

/// One client connection to a [`FakeKscServer`].
#[derive(Debug, Clone)]
pub struct FakeConnection {
    server: FakeKscServer,
    id: u64,
}

impl FakeConnection {
    /// Connection id, as seen in [`RecordedRequest::connection`].
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The server.
    pub fn server(&self) -> &FakeKscServer {
        &self.server
    }

    /// Handles one request.
    pub fn handle(&self, request: &FakeRequest) -> FakeResponse {
        self.server.handle(self.id, request)
    }

    /// Drops the connection's authentication, as a pool reset does.
    pub fn reset(&self) {
        self.server.reset(self.id);
    }
}
