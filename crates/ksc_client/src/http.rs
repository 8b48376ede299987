//! HTTP client implementations.
//!
//! [`ReqwestClient`] is the production client. [`LoopbackClient`] routes
//! requests straight to an in-process server, for tests.

use crate::context::CallContext;
use crate::transport::{HttpClient, HttpError, HttpRequest, HttpResponse};
use parking_lot::RwLock;
use reqwest::blocking::{Client, ClientBuilder};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// How often a waiting caller re-checks its context.
const CANCEL_POLL_SLICE: Duration = Duration::from_millis(25);

/// Default cap on request worker threads alive at once.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;

type BuilderFactory = Box<dyn Fn() -> ClientBuilder + Send + Sync>;

/// HTTPS client backed by `reqwest::blocking`.
///
/// TLS trust policy is whatever the injected builder configures. Each
/// request runs on a worker thread so a cancelled caller returns at once.
/// The abandoned exchange keeps its thread until it completes or the
/// request timeout fires, and it keeps counting against the worker cap
/// until then. Once the cap is reached new requests fail with a
/// retryable [`HttpError::Connect`].
pub struct ReqwestClient {
    factory: BuilderFactory,
    client: RwLock<Client>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: usize,
}

impl ReqwestClient {
    /// Creates a client with reqwest's default TLS policy.
    pub fn new() -> Result<Self, HttpError> {
        Self::with_builder(Client::builder)
    }

    /// Creates a client from a builder factory.
    ///
    /// The factory is called again whenever the connection pool is reset,
    /// so it must produce an equivalently configured builder every time.
    pub fn with_builder<F>(factory: F) -> Result<Self, HttpError>
    where
        F: Fn() -> ClientBuilder + Send + Sync + 'static,
    {
        let client = factory()
            .build()
            .map_err(|e| HttpError::Protocol(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            factory: Box::new(factory),
            client: RwLock::new(client),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        })
    }

    /// Caps the worker threads alive at once, abandoned ones included.
    #[must_use]
    pub fn with_max_in_flight(mut self, limit: usize) -> Self {
        self.max_in_flight = limit.max(1);
        self
    }

    /// Worker threads currently alive.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// One counted worker thread; released when dropped.
struct WorkerSlot(Arc<AtomicUsize>);

impl WorkerSlot {
    fn acquire(counter: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1))
            .ok()
            .map(|_| WorkerSlot(Arc::clone(counter)))
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl HttpClient for ReqwestClient {
    fn post(&self, request: HttpRequest, ctx: &CallContext) -> Result<HttpResponse, HttpError> {
        if let Some(reason) = ctx.cancel_reason() {
            return Err(HttpError::Cancelled(reason));
        }

        let slot = WorkerSlot::acquire(&self.in_flight, self.max_in_flight).ok_or_else(|| {
            HttpError::Connect(format!("{} HTTP requests already in flight", self.max_in_flight))
        })?;
        let client = self.client.read().clone();
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("ksc-http".into())
            .spawn(move || {
                let _slot = slot;
                let _ = tx.send(send(&client, request));
            })
            .map_err(|e| HttpError::Connect(format!("failed to start HTTP worker: {}", e)))?;

        loop {
            match rx.recv_timeout(CANCEL_POLL_SLICE) {
                Ok(Err(HttpError::Connect(message))) => {
                    // A reqwest timeout racing our own deadline is still a deadline.
                    return Err(match ctx.cancel_reason() {
                        Some(reason) => HttpError::Cancelled(reason),
                        None => HttpError::Connect(message),
                    });
                }
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(reason) = ctx.cancel_reason() {
                        return Err(HttpError::Cancelled(reason));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(HttpError::Protocol("HTTP worker exited without a reply".into()))
                }
            }
        }
    }

    fn reset_connections(&self) {
        match (self.factory)().build() {
            Ok(client) => *self.client.write() = client,
            Err(e) => warn!(error = %e, "failed to rebuild HTTP client; keeping existing pool"),
        }
    }
}

fn send(client: &Client, request: HttpRequest) -> Result<HttpResponse, HttpError> {
    let mut builder = client.post(&request.url).timeout(request.timeout);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = request.body {
        builder = builder.body(body);
    }

    let response = builder.send().map_err(classify)?;
    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let body = response.bytes().map_err(classify)?.to_vec();

    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}

fn classify(err: reqwest::Error) -> HttpError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        HttpError::Connect(err.to_string())
    } else {
        HttpError::Protocol(err.to_string())
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer: Send + Sync {
    /// Handles a POST to `path` (the part after `/api/v1.0/`).
    fn handle_post(&self, path: &str, request: &HttpRequest) -> HttpResponse;

    /// Forgets any per-connection state.
    fn reset_connections(&self) {}
}

/// A loopback HTTP client that routes requests directly to a server.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }

    /// The server this client talks to.
    pub fn server(&self) -> &S {
        &self.server
    }
}

impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    fn post(&self, request: HttpRequest, ctx: &CallContext) -> Result<HttpResponse, HttpError> {
        if let Some(reason) = ctx.cancel_reason() {
            return Err(HttpError::Cancelled(reason));
        }
        let path = request.api_path().to_string();
        Ok(self.server.handle_post(&path, &request))
    }

    fn reset_connections(&self) {
        self.server.reset_connections();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CancelReason;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoServer {
        resets: AtomicUsize,
    }

    impl LoopbackServer for EchoServer {
        fn handle_post(&self, path: &str, _request: &HttpRequest) -> HttpResponse {
            HttpResponse::new(200, format!(r#"{{"PxgRetVal": "{}"}}"#, path))
        }

        fn reset_connections(&self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn request(url: &str) -> HttpRequest {
        HttpRequest {
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn loopback_routes_api_path() {
        let client = LoopbackClient::new(EchoServer {
            resets: AtomicUsize::new(0),
        });
        let response = client
            .post(
                request("https://ksc:13299/api/v1.0/Session.Ping"),
                &CallContext::background(),
            )
            .unwrap();
        assert_eq!(response.body, br#"{"PxgRetVal": "Session.Ping"}"#.to_vec());
    }

    #[test]
    fn loopback_honours_cancellation() {
        let client = LoopbackClient::new(EchoServer {
            resets: AtomicUsize::new(0),
        });
        let err = client
            .post(
                request("https://ksc:13299/api/v1.0/login"),
                &CallContext::with_timeout(Duration::ZERO),
            )
            .unwrap_err();
        assert_eq!(err, HttpError::Cancelled(CancelReason::DeadlineExceeded));
    }

    #[test]
    fn loopback_forwards_reset() {
        let client = LoopbackClient::new(EchoServer {
            resets: AtomicUsize::new(0),
        });
        client.reset_connections();
        assert_eq!(client.server().resets.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reqwest_client_builds_and_resets() {
        let client = ReqwestClient::with_builder(|| Client::builder().pool_max_idle_per_host(2)).unwrap();
        client.reset_connections();
    }

    #[test]
    fn reqwest_client_fails_fast_when_cancelled() {
        let client = ReqwestClient::new().unwrap();
        let err = client
            .post(
                request("https://127.0.0.1:9/api/v1.0/Session.Ping"),
                &CallContext::with_timeout(Duration::ZERO),
            )
            .unwrap_err();
        assert!(matches!(err, HttpError::Cancelled(_)));
    }

    #[test]
    fn worker_slots_are_capped_and_released() {
        let counter = Arc::new(AtomicUsize::new(0));
        let first = WorkerSlot::acquire(&counter, 2).unwrap();
        let second = WorkerSlot::acquire(&counter, 2).unwrap();
        assert!(WorkerSlot::acquire(&counter, 2).is_none());
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        drop(first);
        let third = WorkerSlot::acquire(&counter, 2).unwrap();
        drop(second);
        drop(third);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reqwest_client_refuses_past_the_worker_cap() {
        let client = ReqwestClient::new().unwrap().with_max_in_flight(1);
        let held = WorkerSlot::acquire(&client.in_flight, 1).unwrap();

        let err = client
            .post(
                request("https://127.0.0.1:9/api/v1.0/Session.Ping"),
                &CallContext::background(),
            )
            .unwrap_err();
        assert!(matches!(&err, HttpError::Connect(m) if m.contains("in flight")), "{err:?}");

        drop(held);
        assert_eq!(client.in_flight(), 0);
    }
}
