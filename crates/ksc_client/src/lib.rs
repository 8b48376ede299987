//! # KSC Client
//!
//! Transport, session, result-set and async-action core for the Kaspersky
//! Security Center Administration Server JSON API.
//!
//! This crate provides:
//! - Login with any of the four schemes and session token handling
//! - The POST-only call convention with gzip replies and in-band errors
//! - Result-set accessors with count, chunked fetch and release
//! - Async-action tracking at the server's advised poll cadence
//! - Settings-storage read/modify/apply sessions
//! - Gateway and tunnel key issuance
//! - A service façade registry that typed service groups plug into
//!
//! ## Architecture
//!
//! Calls flow down through a [`ServiceHandle`] into [`KscClient`], which
//! adds the session header, then into [`Transport`], which owns the wire
//! protocol, and finally into an [`HttpClient`]. Replies flow back through
//! the envelope codec into [`Accessor`], [`ActionTracker`] or the caller.
//!
//! ## Key Invariants
//!
//! - `PxgError` in a reply fails the call whatever the HTTP status
//! - Credentials are base64-encoded exactly once, at login
//! - Every operation takes a [`CallContext`]; cancellation is never
//!   reported as a transport error
//! - Nothing is released or retried implicitly
//!
//! ## Usage
//!
//! ```no_run
//! use ksc_client::groups::{FindHostsQuery, HostGroup};
//! use ksc_client::{CallContext, ClientConfig, Credentials, KscClient, ReqwestClient};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = CallContext::background();
//! let http = Arc::new(ReqwestClient::new()?);
//! let client = KscClient::connect(
//!     ClientConfig::new("https://ksc.example.com:13299"),
//!     http,
//!     Credentials::basic("admin", "secret"),
//!     &ctx,
//! )?;
//!
//! let hosts = client.group::<HostGroup>();
//! let accessor = hosts.find_hosts(&ctx, &FindHostsQuery::new("", ["KLHST_WKS_HOSTNAME"]))?;
//! for chunk in accessor.chunks(&ctx, 1000) {
//!     for host in chunk? {
//!         println!("{:?}", host);
//!     }
//! }
//! accessor.release(&ctx)?;
//! client.end_session(&ctx)?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod accessor;
mod action;
mod auth;
mod config;
mod context;
mod endpoint;
mod error;
mod gateway;
pub mod groups;
mod http;
mod service;
mod session;
mod storage;
mod transport;

pub use accessor::{Accessor, Chunks, IteratorKind, EVENT_RANGE_ARRAY, ITERATOR_ARRAY};
pub use action::{
    error_fields, failure_from_state, ActionGuid, ActionHandle, ActionProgress, ActionState,
    ActionStatus, ActionTracker, Pacer, SleepPacer, PROGRESS_FIELD,
};
pub use auth::{AuthScheme, Credentials, Secret, SessionToken, ShortLivedToken, NO_VSERVER};
pub use config::{ClientConfig, PollConfig, ServerCodes, DEFAULT_USER_AGENT};
pub use context::{CallContext, CancelToken};
pub use endpoint::{ActionField, Availability, BodyKind, Endpoint, EndpointCatalog, EndpointSpec};
pub use error::{CallSite, CancelReason, HandleRef, KscError, KscResult};
pub use gateway::{prepare_gateway, prepare_tunnel, GatewayKey, LocationDescriptor, AUTH_KEY_FIELD};
pub use http::{LoopbackClient, LoopbackServer, ReqwestClient, DEFAULT_MAX_IN_FLIGHT};
pub use service::{ServiceGroup, ServiceHandle, FAILED_SLAVES_FIELD};
pub use session::{KscClient, LOGIN_PATH};
pub use storage::{
    with_storage, SettingsStorage, StorageAddress, StorageOpener, WriteOption, FORBIDDEN_CHARS,
    MAX_NAME_LEN,
};
pub use transport::{
    headers, HttpClient, HttpError, HttpRequest, HttpResponse, Transport, API_PREFIX,
    DEFAULT_MAX_REPLY_SIZE,
};

pub use ksc_codec::{Params, PxgError, Reply, Tagged, Value};
