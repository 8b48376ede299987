//! The client context: login, session token and call dispatch.

use crate::accessor::{Accessor, IteratorKind};
use crate::action::ActionTracker;
use crate::auth::{AuthScheme, Credentials, Secret, SessionToken, ShortLivedToken};
use crate::config::ClientConfig;
use crate::context::CallContext;
use crate::endpoint::{BodyKind, Endpoint, EndpointCatalog};
use crate::error::{CallSite, KscError, KscResult};
use crate::service::{ServiceGroup, ServiceHandle};
use crate::transport::{headers, HttpClient, Transport};
use ksc_codec::{Params, Reply, RequestBody};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Path of the login call.
pub const LOGIN_PATH: &str = "login";

const SESSION: &str = "Session";

/// An authenticated client context for one KSC server.
///
/// Cheap to clone; clones share the connection pool and session token, and
/// may be used from many threads at once.
#[derive(Clone)]
pub struct KscClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    transport: Transport,
    catalog: EndpointCatalog,
    scheme: AuthScheme,
    session: RwLock<Option<SessionToken>>,
    /// Login headers, resent on every call while no session token is held.
    login: RwLock<Vec<(String, Secret)>>,
}

impl KscClient {
    /// Logs in and, for Basic credentials with `start_session` set, starts a
    /// long-lived session.
    ///
    /// Without a session token the login headers go out again on every
    /// call, so any pooled connection can authenticate itself.
    pub fn connect(
        config: ClientConfig,
        http: Arc<dyn HttpClient>,
        credentials: Credentials,
        ctx: &CallContext,
    ) -> KscResult<Self> {
        let client = Self::build(config, http, credentials.scheme())?;
        client.login(ctx, &credentials)?;
        if credentials.scheme() == AuthScheme::Basic && client.inner.config.start_session {
            let token = client.start_session(ctx)?;
            *client.inner.session.write() = Some(token);
        }
        info!(
            base_url = %client.inner.config.base_url,
            scheme = ?credentials.scheme(),
            session = ?client.session_identity(),
            "KSC session established"
        );
        Ok(client)
    }

    /// Resumes a persisted session token, validating it with a ping.
    pub fn resume(
        config: ClientConfig,
        http: Arc<dyn HttpClient>,
        token: SessionToken,
        ctx: &CallContext,
    ) -> KscResult<Self> {
        let client = Self::build(config, http, AuthScheme::Basic)?;
        *client.inner.session.write() = Some(token);
        client.ping(ctx)?;
        info!(session = ?client.session_identity(), "KSC session resumed");
        Ok(client)
    }

    fn build(config: ClientConfig, http: Arc<dyn HttpClient>, scheme: AuthScheme) -> KscResult<Self> {
        config.validate()?;
        let transport = Transport::new(
            config.base_url.clone(),
            config.user_agent.clone(),
            config.timeout,
            http,
        )
        .with_max_reply_size(config.max_reply_size);
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                transport,
                catalog: EndpointCatalog::builtin(),
                scheme,
                session: RwLock::new(None),
                login: RwLock::new(Vec::new()),
            }),
        })
    }

    fn login(&self, ctx: &CallContext, credentials: &Credentials) -> KscResult<()> {
        let headers = credentials.login_headers(self.inner.config.vserver.as_deref());
        self.inner.transport.post(
            ctx,
            LOGIN_PATH,
            headers.clone(),
            &RequestBody::Absent,
            CallSite::new(LOGIN_PATH),
        )?;
        *self.inner.login.write() = headers
            .into_iter()
            .map(|(name, value)| (name, Secret::new(value)))
            .collect();
        debug!(scheme = ?credentials.scheme(), "login accepted");
        Ok(())
    }

    fn start_session(&self, ctx: &CallContext) -> KscResult<SessionToken> {
        let endpoint = Endpoint::known(SESSION, "StartSession");
        let token: String = self.call_single(ctx, &endpoint, Params::new())?;
        if token.is_empty() {
            return Err(KscError::Envelope {
                site: Box::new(self.site(&endpoint)),
                source: ksc_codec::CodecError::unexpected_shape("empty session token"),
            });
        }
        Ok(SessionToken::new(token))
    }

    /// The configuration this client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The endpoint catalog. Register entries here for endpoints the
    /// built-in catalog does not know.
    pub fn catalog(&self) -> &EndpointCatalog {
        &self.inner.catalog
    }

    /// The scheme this client logged in with.
    pub fn scheme(&self) -> AuthScheme {
        self.inner.scheme
    }

    /// The current session token, for persisting.
    pub fn session_token(&self) -> Option<SessionToken> {
        self.inner.session.read().clone()
    }

    /// The redacted session token, for logs and error context.
    pub fn session_identity(&self) -> Option<String> {
        self.inner.session.read().as_ref().map(SessionToken::redacted)
    }

    pub(crate) fn site(&self, endpoint: &Endpoint) -> CallSite {
        let mut site = CallSite::new(endpoint.path());
        site.session = self.session_identity();
        site
    }

    fn session_headers(&self) -> Vec<(String, String)> {
        match self.inner.session.read().as_ref() {
            Some(token) => vec![(headers::SESSION.to_string(), token.expose().to_string())],
            None => self
                .inner
                .login
                .read()
                .iter()
                .map(|(name, value)| (name.clone(), value.expose().to_string()))
                .collect(),
        }
    }

    /// Calls an endpoint.
    ///
    /// Empty `params` go out as no body or as `{}`, as the catalog says the
    /// endpoint wants.
    pub fn call(&self, ctx: &CallContext, endpoint: &Endpoint, params: Params) -> KscResult<Reply> {
        let body = if params.is_empty() {
            match self.inner.catalog.body_kind(endpoint) {
                BodyKind::Absent => RequestBody::Absent,
                BodyKind::Object => RequestBody::empty_object(),
            }
        } else {
            RequestBody::Object(params)
        };
        self.inner.transport.post(
            ctx,
            &endpoint.path(),
            self.session_headers(),
            &body,
            self.site(endpoint),
        )
    }

    /// Calls an endpoint with no interesting reply.
    pub fn call_void(&self, ctx: &CallContext, endpoint: &Endpoint, params: Params) -> KscResult<()> {
        self.call(ctx, endpoint, params).map(|_| ())
    }

    /// Calls an endpoint and decodes its `PxgRetVal`.
    pub fn call_single<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        endpoint: &Endpoint,
        params: Params,
    ) -> KscResult<T> {
        self.call(ctx, endpoint, params)?
            .into_single()
            .map_err(|source| KscError::Envelope {
                site: Box::new(self.site(endpoint)),
                source,
            })
    }

    /// Calls an endpoint and decodes all of its out-parameters into `T`.
    pub fn call_structured<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        endpoint: &Endpoint,
        params: Params,
    ) -> KscResult<T> {
        self.call(ctx, endpoint, params)?
            .into_structured()
            .map_err(|source| KscError::Envelope {
                site: Box::new(self.site(endpoint)),
                source,
            })
    }

    /// Liveness check; also validates a resumed token.
    pub fn ping(&self, ctx: &CallContext) -> KscResult<()> {
        self.call_void(ctx, &Endpoint::known(SESSION, "Ping"), Params::new())
    }

    /// Calls an endpoint as a probe, refusing version-gated endpoints.
    pub fn probe(&self, ctx: &CallContext, endpoint: &Endpoint, params: Params) -> KscResult<Reply> {
        if let Some(spec) = self.inner.catalog.get(endpoint) {
            if !spec.is_probe_safe() {
                return Err(KscError::validation(format!(
                    "{} is version-gated and is not used for probes",
                    endpoint
                )));
            }
        }
        self.call(ctx, endpoint, params)
    }

    /// Issues a single-use logon token. The session token is not touched.
    pub fn issue_short_lived_token(&self, ctx: &CallContext) -> KscResult<ShortLivedToken> {
        let token: String =
            self.call_single(ctx, &Endpoint::known(SESSION, "CreateToken"), Params::new())?;
        Ok(ShortLivedToken::new(token))
    }

    /// Ends the session on the server and drops every pooled connection.
    ///
    /// The local token and the stored login headers are cleared even if the
    /// server call fails.
    pub fn end_session(&self, ctx: &CallContext) -> KscResult<()> {
        let result = self.call_void(ctx, &Endpoint::known(SESSION, "EndSession"), Params::new());
        let previous = self.inner.session.write().take();
        self.inner.login.write().clear();
        self.inner.transport.reset_connections();
        match &result {
            Ok(()) => info!(session = ?previous.as_ref().map(SessionToken::redacted), "KSC session ended"),
            Err(e) => warn!(error = %e, "end-session call failed; local session cleared anyway"),
        }
        result
    }

    /// Binds a façade service group to this client.
    pub fn group<G: ServiceGroup>(&self) -> G {
        G::bind(ServiceHandle::new(self.clone(), G::SERVICE))
    }

    /// A tracker for async actions started through this client.
    pub fn tracker(&self) -> ActionTracker {
        ActionTracker::new(self.clone())
    }

    /// Wraps an accessor id obtained outside the façade.
    pub fn accessor(&self, kind: IteratorKind, id: impl Into<String>) -> Accessor {
        Accessor::new(self.clone(), kind, id.into(), None, None)
    }
}

impl std::fmt::Debug for KscClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KscClient")
            .field("base_url", &self.inner.config.base_url)
            .field("scheme", &self.inner.scheme)
            .field("session", &self.session_identity())
            .finish()
    }
}
