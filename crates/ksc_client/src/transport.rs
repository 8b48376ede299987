//! Transport layer: one POST out, one decoded envelope back.
//!
//! The actual HTTP client is abstracted via [`HttpClient`] so the pooling
//! and TLS policy stay with the embedding application. [`Transport`] owns
//! everything protocol-specific: URL layout, the headers every call
//! carries, gzip replies and envelope decoding.

use crate::context::CallContext;
use crate::error::{CallSite, CancelReason, KscError, KscResult};
use flate2::read::GzDecoder;
use ksc_codec::{decode_reply, CodecError, Reply, RequestBody};
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

/// Path prefix of every API call.
pub const API_PREFIX: &str = "/api/v1.0/";

/// Default cap on a decompressed reply body: 64 MiB.
pub const DEFAULT_MAX_REPLY_SIZE: usize = 64 * 1024 * 1024;

/// Header names used by the protocol.
pub mod headers {
    /// Login authentication header.
    pub const AUTHORIZATION: &str = "Authorization";
    /// Virtual server selector, sent on login only.
    pub const VSERVER: &str = "X-KSC-VServer";
    /// Session token header.
    pub const SESSION: &str = "X-KSC-Session";
    /// Request content type.
    pub const CONTENT_TYPE: &str = "Content-Type";
    /// Accepted reply encodings.
    pub const ACCEPT_ENCODING: &str = "Accept-Encoding";
    /// Reply content encoding.
    pub const CONTENT_ENCODING: &str = "Content-Encoding";
    /// Product-identifying user agent.
    pub const USER_AGENT: &str = "User-Agent";
}

/// An outgoing HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Absolute URL.
    pub url: String,
    /// Header name/value pairs, in sending order.
    pub headers: Vec<(String, String)>,
    /// Body bytes; `None` sends no body at all.
    pub body: Option<Vec<u8>>,
    /// Upper bound on the whole exchange.
    pub timeout: Duration,
}

impl HttpRequest {
    /// Looks up a header, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// The part of the URL after the API prefix, e.g. `Session.Ping`.
    pub fn api_path(&self) -> &str {
        match self.url.find(API_PREFIX) {
            Some(i) => &self.url[i + API_PREFIX.len()..],
            None => self.url.rsplit('/').next().unwrap_or(&self.url),
        }
    }
}

/// A received HTTP response.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Raw body bytes (possibly compressed).
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response with a status and body.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Looks up a header, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Failure reported by an [`HttpClient`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    /// The context fired while the request was in flight.
    #[error("request {0}")]
    Cancelled(CancelReason),
    /// Connection-level failure (DNS, TCP, TLS, reset). Retryable.
    #[error("connection failed: {0}")]
    Connect(String),
    /// Any other failure. Not retryable.
    #[error("HTTP protocol error: {0}")]
    Protocol(String),
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport. Implementations
/// must allow concurrent calls and must honour the context: a cancelled or
/// expired context aborts the exchange with [`HttpError::Cancelled`].
pub trait HttpClient: Send + Sync {
    /// Sends a POST request and returns the raw response.
    fn post(&self, request: HttpRequest, ctx: &CallContext) -> Result<HttpResponse, HttpError>;

    /// Drops pooled connections. Called when a session ends so no idle
    /// connection authenticated under a dead token is reused.
    fn reset_connections(&self) {}
}

/// The protocol-aware transport shared by every call of a client context.
#[derive(Clone)]
pub struct Transport {
    base_url: String,
    user_agent: String,
    default_timeout: Duration,
    max_reply_size: usize,
    client: Arc<dyn HttpClient>,
}

impl Transport {
    /// Creates a new transport.
    pub fn new(
        base_url: impl Into<String>,
        user_agent: impl Into<String>,
        default_timeout: Duration,
        client: Arc<dyn HttpClient>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user_agent: user_agent.into(),
            default_timeout,
            max_reply_size: DEFAULT_MAX_REPLY_SIZE,
            client,
        }
    }

    /// Caps the size of a decompressed reply body.
    #[must_use]
    pub fn with_max_reply_size(mut self, limit: usize) -> Self {
        self.max_reply_size = limit;
        self
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The URL of an API path (`login` or `Service.Method`).
    pub fn url_for(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, API_PREFIX, path)
    }

    /// Drops pooled connections.
    pub fn reset_connections(&self) {
        self.client.reset_connections();
    }

    /// Sends one call and decodes its envelope.
    ///
    /// `extra_headers` carries the authentication or session header; the
    /// protocol headers are always added here.
    pub fn post(
        &self,
        ctx: &CallContext,
        path: &str,
        extra_headers: Vec<(String, String)>,
        body: &RequestBody,
        site: CallSite,
    ) -> KscResult<Reply> {
        if let Some(reason) = ctx.cancel_reason() {
            return Err(KscError::Cancelled {
                site: Some(Box::new(site)),
                reason,
            });
        }

        let encoded = body.encode().map_err(|source| KscError::Envelope {
            site: Box::new(site.clone()),
            source,
        })?;

        let mut headers = vec![
            (headers::USER_AGENT.to_string(), self.user_agent.clone()),
            (
                headers::CONTENT_TYPE.to_string(),
                "application/json".to_string(),
            ),
            (headers::ACCEPT_ENCODING.to_string(), "gzip".to_string()),
        ];
        headers.extend(extra_headers);

        let request = HttpRequest {
            url: self.url_for(path),
            headers,
            body: encoded,
            timeout: ctx.request_timeout(self.default_timeout),
        };
        let body_len = request.body.as_ref().map(Vec::len);

        let started = Instant::now();
        let response = self.client.post(request, ctx).map_err(|e| match e {
            HttpError::Cancelled(reason) => KscError::Cancelled {
                site: Some(Box::new(site.clone())),
                reason,
            },
            HttpError::Connect(message) => KscError::transport_retryable(site.clone(), message),
            HttpError::Protocol(message) => KscError::transport_fatal(site.clone(), message),
        })?;

        debug!(
            endpoint = %site.endpoint,
            status = response.status,
            request_bytes = ?body_len,
            reply_bytes = response.body.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "KSC call completed"
        );

        let status = response.status;
        let body = decode_body(&response, self.max_reply_size).map_err(|message| {
            KscError::transport_fatal(site.clone(), format!("gzip decode failed: {}", message))
        })?;
        trace!(endpoint = %site.endpoint, body = %String::from_utf8_lossy(&body), "reply body");

        match decode_reply(&body) {
            Err(CodecError::Server(error)) => Err(KscError::Server {
                site: Box::new(site),
                status,
                error,
            }),
            Err(_) | Ok(_) if !response.is_success() => Err(KscError::Http {
                site: Box::new(site),
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            }),
            Err(source) => Err(KscError::Envelope {
                site: Box::new(site),
                source,
            }),
            Ok(reply) => Ok(reply),
        }
    }
}

/// Returns the body, decompressed if the server gzip-encoded it.
///
/// Inflation stops at `limit` bytes; a larger body is an error.
fn decode_body(response: &HttpResponse, limit: usize) -> Result<Vec<u8>, String> {
    let gzipped = response
        .header(headers::CONTENT_ENCODING)
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("gzip"));
    if !gzipped {
        return Ok(response.body.clone());
    }
    let mut decoded = Vec::with_capacity(response.body.len().saturating_mul(4).min(limit));
    GzDecoder::new(response.body.as_slice())
        .take((limit as u64).saturating_add(1))
        .read_to_end(&mut decoded)
        .map_err(|e| e.to_string())?;
    if decoded.len() > limit {
        return Err(format!("reply inflates past {} bytes", limit));
    }
    Ok(decoded)
}
