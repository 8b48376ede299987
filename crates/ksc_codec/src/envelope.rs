//! Request bodies and reply envelopes.
//!
//! Requests are JSON objects keyed by parameter name; the method identity
//! lives in the URL, never in the body. Replies come in four shapes:
//! `{ "PxgRetVal": v }`, a multi-field object of out-parameters, an empty
//! body for void methods, or `{ "PxgError": { ... } }`. The error form wins
//! over every other shape, whatever the HTTP status was.

use crate::error::{CodecError, CodecResult};
use crate::value::{Params, Value};
use serde::de::DeserializeOwned;
use std::fmt;

/// Name of the single-return field.
pub const RET_VAL: &str = "PxgRetVal";
/// Name of the in-band error field.
pub const ERROR_FIELD: &str = "PxgError";

/// Body of an outgoing call.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// No body at all. Some endpoints (session start, ping) reject `{}`.
    Absent,
    /// A JSON object; an empty container is sent as `{}`.
    Object(Params),
}

impl RequestBody {
    /// An empty parameter object, sent as `{}`.
    pub fn empty_object() -> Self {
        RequestBody::Object(Params::new())
    }

    /// Returns true if no body will be sent.
    pub fn is_absent(&self) -> bool {
        matches!(self, RequestBody::Absent)
    }

    /// Encodes the body. `None` means the request carries no body.
    pub fn encode(&self) -> CodecResult<Option<Vec<u8>>> {
        match self {
            RequestBody::Absent => Ok(None),
            RequestBody::Object(params) => serde_json::to_vec(params)
                .map(Some)
                .map_err(|e| CodecError::unexpected_shape(e.to_string())),
        }
    }
}

impl From<Params> for RequestBody {
    fn from(params: Params) -> Self {
        RequestBody::Object(params)
    }
}

/// A structured in-band server error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PxgError {
    /// Server error code.
    pub code: i64,
    /// Server error subcode, when the server supplies one.
    pub subcode: Option<i64>,
    /// Server module that raised the error.
    pub module: String,
    /// Source file on the server.
    pub file: String,
    /// Source line on the server.
    pub line: i64,
    /// Human-readable message.
    pub message: String,
    /// Any further fields (localization data and the like), kept verbatim.
    pub extra: Params,
}

impl PxgError {
    /// Creates an error with a code and message.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            ..Self::default()
        }
    }

    /// Sets the module.
    #[must_use]
    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = module.into();
        self
    }

    /// Sets the source location.
    #[must_use]
    pub fn with_location(mut self, file: impl Into<String>, line: i64) -> Self {
        self.file = file.into();
        self.line = line;
        self
    }

    /// Reads the error from its wire object. Missing fields take zero values.
    pub fn from_params(params: &Params) -> Self {
        let mut extra = Params::new();
        for (key, value) in params.iter() {
            if !matches!(
                key,
                "code" | "subcode" | "module" | "file" | "line" | "message"
            ) {
                extra.insert(key, value.clone());
            }
        }
        Self {
            code: params.get_i64("code").unwrap_or_default(),
            subcode: params.get_i64("subcode"),
            module: params.get_str("module").unwrap_or_default().to_string(),
            file: params.get_str("file").unwrap_or_default().to_string(),
            line: params.get_i64("line").unwrap_or_default(),
            message: params.get_str("message").unwrap_or_default().to_string(),
            extra,
        }
    }

    /// Writes the error in its wire form.
    pub fn to_params(&self) -> Params {
        let mut params = Params::new()
            .with("code", self.code)
            .with("module", self.module.as_str())
            .with("file", self.file.as_str())
            .with("line", self.line)
            .with("message", self.message.as_str());
        if let Some(subcode) = self.subcode {
            params.insert("subcode", subcode);
        }
        for (key, value) in self.extra.iter() {
            params.insert(key, value.clone());
        }
        params
    }
}

impl fmt::Display for PxgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code {}", self.code)?;
        if let Some(subcode) = self.subcode {
            write!(f, "/{}", subcode)?;
        }
        if !self.module.is_empty() {
            write!(f, " in {}", self.module)?;
        }
        write!(f, ": {}", self.message)?;
        if !self.file.is_empty() {
            write!(f, " ({}:{})", self.file, self.line)?;
        }
        Ok(())
    }
}

/// A decoded, error-free reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    fields: Params,
}

impl Reply {
    /// Wraps already-decoded top-level fields.
    pub fn from_params(fields: Params) -> Self {
        Self { fields }
    }

    /// Returns true for a void reply (empty body or `{}`).
    pub fn is_void(&self) -> bool {
        self.fields.is_empty()
    }

    /// The `PxgRetVal` field, if present.
    pub fn ret_val(&self) -> Option<&Value> {
        self.fields.get(RET_VAL)
    }

    /// Looks up a named out-parameter.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// All top-level fields.
    pub fn params(&self) -> &Params {
        &self.fields
    }

    /// Consumes the reply into its top-level fields.
    pub fn into_params(self) -> Params {
        self.fields
    }

    /// Removes and returns the `PxgRetVal` field.
    pub fn take_ret_val(&mut self) -> Option<Value> {
        self.fields.remove(RET_VAL)
    }

    /// Single-return entry point: decodes `PxgRetVal` into `T`.
    pub fn into_single<T: DeserializeOwned>(mut self) -> CodecResult<T> {
        let value = self
            .take_ret_val()
            .ok_or_else(|| CodecError::unexpected_shape("reply has no PxgRetVal"))?;
        serde_json::from_value(value.to_json()).map_err(CodecError::from)
    }

    /// Structured-return entry point: decodes every top-level field into `T`.
    ///
    /// Missing fields follow `T`'s serde defaults; a `#[serde(flatten)]`
    /// [`Params`] field on `T` keeps unknown fields.
    pub fn into_structured<T: DeserializeOwned>(self) -> CodecResult<T> {
        serde_json::from_value(self.fields.to_json()).map_err(CodecError::from)
    }
}

/// Decodes a reply body.
///
/// An empty (or all-whitespace) body is a void reply. A body containing
/// `PxgError` fails with [`CodecError::Server`] even if it also carries a
/// result.
pub fn decode_reply(body: &[u8]) -> CodecResult<Reply> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Reply::default());
    }

    let json: serde_json::Value = serde_json::from_slice(body)?;
    let map = match json {
        serde_json::Value::Object(map) => map,
        other => {
            return Err(CodecError::unexpected_shape(format!(
                "top-level reply must be an object, got {}",
                json_kind(&other)
            )))
        }
    };

    let mut fields = Params::from_json_map(map);
    if let Some(error) = fields.remove(ERROR_FIELD) {
        let error = error
            .as_params()
            .ok_or_else(|| CodecError::unexpected_shape("PxgError is not an object"))?;
        return Err(CodecError::Server(PxgError::from_params(error)));
    }

    Ok(Reply::from_params(fields))
}

/// Encodes a server error reply body. Used by test servers.
pub fn encode_error(error: &PxgError) -> Vec<u8> {
    let body = Params::new().with(ERROR_FIELD, error.to_params());
    serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec())
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn empty_body_is_void() {
        assert!(decode_reply(b"").unwrap().is_void());
        assert!(decode_reply(b"  \r\n").unwrap().is_void());
        assert!(decode_reply(b"{}").unwrap().is_void());
    }

    #[test]
    fn error_takes_precedence_over_result() {
        let body = br#"{"PxgRetVal": 5, "PxgError": {"code": 1183, "module": "KLSTD",
            "file": "conn.cpp", "line": 42, "message": "not found"}}"#;
        let err = decode_reply(body).unwrap_err();
        let server = err.server_error().unwrap();
        assert_eq!(server.code, 1183);
        assert_eq!(server.module, "KLSTD");
        assert_eq!(server.file, "conn.cpp");
        assert_eq!(server.line, 42);
        assert_eq!(server.message, "not found");
    }

    #[test]
    fn error_extra_fields_preserved() {
        let body = br#"{"PxgError": {"code": 1, "message": "m",
            "locdata": {"format": "x"}}}"#;
        let err = decode_reply(body).unwrap_err();
        let server = err.server_error().unwrap();
        assert!(server.extra.contains_key("locdata"));
        assert_eq!(server.subcode, None);
    }

    #[test]
    fn malformed_json() {
        let err = decode_reply(b"{not json").unwrap_err();
        assert!(matches!(err, CodecError::MalformedJson { .. }));
    }

    #[test]
    fn non_object_top_level() {
        let err = decode_reply(b"[1, 2]").unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedShape { .. }));
    }

    #[test]
    fn backslashes_are_not_double_decoded() {
        let body = br#"{"PxgRetVal": "\\\\HOST\\share\\"}"#;
        let shared: String = decode_reply(body).unwrap().into_single().unwrap();
        assert_eq!(shared, r"\\HOST\share\");
    }

    #[test]
    fn single_return_requires_ret_val() {
        let reply = decode_reply(br#"{"other": 1}"#).unwrap();
        assert!(reply.into_single::<i64>().is_err());
    }

    #[test]
    fn structured_return_defaults_and_preserves() {
        #[derive(Deserialize)]
        struct Out {
            #[serde(rename = "strAccessor")]
            accessor: String,
            #[serde(rename = "lCount", default)]
            count: i64,
            #[serde(flatten)]
            rest: Params,
        }

        let reply = decode_reply(br#"{"strAccessor": "acc-1", "newField": true}"#).unwrap();
        let out: Out = reply.into_structured().unwrap();
        assert_eq!(out.accessor, "acc-1");
        assert_eq!(out.count, 0);
        assert_eq!(out.rest.get_bool("newField"), Some(true));
    }

    #[test]
    fn request_body_discipline() {
        assert_eq!(RequestBody::Absent.encode().unwrap(), None);
        assert_eq!(
            RequestBody::empty_object().encode().unwrap(),
            Some(b"{}".to_vec())
        );
    }

    #[test]
    fn pxg_error_wire_roundtrip() {
        let mut error = PxgError::new(7, "not enough disk space")
            .with_module("klbackupservice")
            .with_location("backup.cpp", 120);
        error.subcode = Some(3);
        let decoded = decode_reply(&encode_error(&error)).unwrap_err();
        assert_eq!(decoded.server_error(), Some(&error));
    }

    #[test]
    fn display_includes_all_parts() {
        let error = PxgError::new(7, "boom")
            .with_module("mod")
            .with_location("f.cpp", 3);
        assert_eq!(error.to_string(), "code 7 in mod: boom (f.cpp:3)");
    }
}
