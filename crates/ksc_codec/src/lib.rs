//! # KSC Codec
//!
//! Document model and envelope codec for the Kaspersky Security Center
//! JSON API.
//!
//! This crate provides:
//! - [`Value`] / [`Params`]: an ordered document tree that models the
//!   server's `{ "type": ..., "value": ... }` wrappers explicitly
//! - [`RequestBody`]: the absent-vs-`{}` body discipline
//! - [`decode_reply`]: reply parsing into a [`Reply`] or an in-band
//!   [`PxgError`]
//!
//! ## Usage
//!
//! ```
//! use ksc_codec::{decode_reply, Params, Value};
//!
//! let body = Params::new().with("lNum", Value::long(1 << 40));
//! let json = serde_json::to_string(&body).unwrap();
//! assert_eq!(json, r#"{"lNum":{"type":"long","value":1099511627776}}"#);
//!
//! let reply = decode_reply(br#"{"PxgRetVal": 3}"#).unwrap();
//! let count: i64 = reply.into_single().unwrap();
//! assert_eq!(count, 3);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod envelope;
mod error;
mod value;

pub use envelope::{decode_reply, encode_error, PxgError, Reply, RequestBody, ERROR_FIELD, RET_VAL};
pub use error::{CodecError, CodecResult};
pub use value::{
    Params, Tagged, Value, TAG_ARRAY, TAG_BINARY, TAG_BOOL, TAG_DATETIME, TAG_INT, TAG_LONG,
    TAG_PARAMS, TAG_STRING,
};
