//! Request and reply types of the fake server.
//!
//! These mirror an HTTP exchange without depending on any client crate, so
//! a test adapts them to whatever client it drives.

use flate2::write::GzEncoder;
use flate2::Compression;
use ksc_codec::{encode_error, Params, PxgError, Value, RET_VAL};
use std::io::Write;

/// One request as the fake server sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeRequest {
    /// Path after `/api/v1.0/`: `login` or `Service.Method`.
    pub path: String,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Body bytes; `None` when no body was sent.
    pub body: Option<Vec<u8>>,
}

impl FakeRequest {
    /// Creates a request.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Looks up a header, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The body parsed as a parameter object; an absent body is empty.
    pub fn params(&self) -> Result<Params, String> {
        match &self.body {
            None => Ok(Params::new()),
            Some(bytes) => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
        }
    }
}

/// One reply of the fake server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeResponse {
    /// HTTP status.
    pub status: u16,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl FakeResponse {
    /// A 200 reply with an empty body.
    pub fn void() -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// A 200 reply whose top-level fields are `params`.
    pub fn fields(params: Params) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: serde_json::to_vec(&params).unwrap_or_else(|_| b"{}".to_vec()),
        }
    }

    /// A 200 `{"PxgRetVal": value}` reply.
    pub fn ret(value: impl Into<Value>) -> Self {
        Self::fields(Params::new().with(RET_VAL, value))
    }

    /// A `PxgError` reply with the given HTTP status.
    pub fn error(status: u16, error: &PxgError) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: encode_error(error),
        }
    }

    /// Gzip-compresses a non-empty body and marks it.
    pub fn gzipped(mut self) -> Self {
        if self.body.is_empty() {
            return self;
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        if encoder.write_all(&self.body).is_ok() {
            if let Ok(compressed) = encoder.finish() {
                self.body = compressed;
                self.headers
                    .push(("Content-Encoding".to_string(), "gzip".to_string()));
            }
        }
        self
    }

    /// The body as text, for assertions.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
