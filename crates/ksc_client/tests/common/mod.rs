//! Shared helpers: a loopback link to the fake server and client builders.

#![allow(dead_code)]

use ksc_client::{
    CallContext, ClientConfig, Credentials, HttpClient, HttpRequest, HttpResponse, KscClient,
    KscResult, LoopbackClient, LoopbackServer, Pacer, PollConfig,
};
use ksc_testkit::{FakeConnection, FakeKscServer, FakeRequest, ADMIN_PASSWORD, ADMIN_USER};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Base URL the loopback clients pretend to talk to.
pub const BASE_URL: &str = "https://ksc.test:13299";

/// Routes loopback requests over one fake-server connection.
pub struct FakeLink(pub FakeConnection);

impl LoopbackServer for FakeLink {
    fn handle_post(&self, path: &str, request: &HttpRequest) -> HttpResponse {
        let mut fake = FakeRequest::new(path);
        for (name, value) in &request.headers {
            fake = fake.with_header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            fake = fake.with_body(body.clone());
        }

        let reply = self.0.handle(&fake);
        let mut response = HttpResponse::new(reply.status, reply.body);
        for (name, value) in reply.headers {
            response = response.with_header(name, value);
        }
        response
    }

    fn reset_connections(&self) {
        self.0.reset();
    }
}

/// Spreads loopback requests round-robin over several fake-server
/// connections, the way a connection pool does.
pub struct PooledLink {
    connections: Vec<FakeConnection>,
    next: AtomicUsize,
}

impl PooledLink {
    /// Opens `size` connections to `server`.
    pub fn new(server: &FakeKscServer, size: usize) -> Self {
        Self {
            connections: (0..size).map(|_| server.connect()).collect(),
            next: AtomicUsize::new(0),
        }
    }
}

impl LoopbackServer for PooledLink {
    fn handle_post(&self, path: &str, request: &HttpRequest) -> HttpResponse {
        let i = self.next.fetch_add(1, Ordering::SeqCst) % self.connections.len();
        FakeLink(self.connections[i].clone()).handle_post(path, request)
    }

    fn reset_connections(&self) {
        for connection in &self.connections {
            connection.reset();
        }
    }
}

/// Installs a test subscriber honouring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A config with fast polling for tests.
pub fn config() -> ClientConfig {
    ClientConfig::new(BASE_URL).with_poll(PollConfig::new(Duration::from_millis(20)))
}

/// A fresh HTTP client with its own connection to `server`.
pub fn http(server: &FakeKscServer) -> Arc<dyn HttpClient> {
    Arc::new(LoopbackClient::new(FakeLink(server.connect())))
}

/// An HTTP client whose calls rotate over `size` connections to `server`.
pub fn pooled_http(server: &FakeKscServer, size: usize) -> Arc<dyn HttpClient> {
    Arc::new(LoopbackClient::new(PooledLink::new(server, size)))
}

/// Logs in as the default admin.
pub fn connect(server: &FakeKscServer) -> KscClient {
    connect_with(server, config(), Credentials::basic(ADMIN_USER, ADMIN_PASSWORD))
        .expect("admin login")
}

/// Logs in with any config and credentials.
pub fn connect_with(
    server: &FakeKscServer,
    config: ClientConfig,
    credentials: Credentials,
) -> KscResult<KscClient> {
    init_tracing();
    KscClient::connect(config, http(server), credentials, &CallContext::background())
}

/// Pacer that records every requested pause and optionally sleeps.
#[derive(Default)]
pub struct RecordingPacer {
    pauses: Mutex<Vec<Duration>>,
    sleep: bool,
    skip_first: bool,
}

impl RecordingPacer {
    /// Records without sleeping.
    pub fn instant() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records and sleeps for real.
    pub fn sleeping() -> Arc<Self> {
        Arc::new(Self {
            sleep: true,
            ..Self::default()
        })
    }

    /// Records and sleeps, except the first pause returns at once.
    pub fn waking_early() -> Arc<Self> {
        Arc::new(Self {
            sleep: true,
            skip_first: true,
            ..Self::default()
        })
    }

    /// Pauses requested so far.
    pub fn pauses(&self) -> Vec<Duration> {
        self.pauses.lock().clone()
    }
}

impl Pacer for RecordingPacer {
    fn pause(&self, ctx: &CallContext, delay: Duration) -> KscResult<()> {
        let first = {
            let mut pauses = self.pauses.lock();
            pauses.push(delay);
            pauses.len() == 1
        };
        if self.sleep && !(self.skip_first && first) {
            ctx.sleep(delay)
        } else {
            ctx.check()
        }
    }
}
