//! # KSC Testkit
//!
//! Test utilities for KSC API clients.
//!
//! This crate provides:
//! - [`FakeKscServer`]: an in-memory Administration Server with sessions,
//!   result-set accessors, scripted async actions, policy settings storage
//!   and gateway keys
//! - Fixtures: canned credentials, host records and server error codes
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ksc_testkit::prelude::*;
//!
//! let server = FakeKscServer::new().with_hosts(250);
//! let conn = server.connect();
//! let reply = conn.handle(&FakeRequest::new("login")
//!     .with_header("Authorization", r#"KSCBasic user="YWRtaW4=", pass="c2VjcmV0""#)
//!     .with_header("X-KSC-VServer", "x"));
//! assert_eq!(reply.status, 200);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod server;
pub mod wire;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::server::*;
    pub use crate::wire::*;
}

pub use fixtures::*;
pub use generators::*;
pub use server::*;
pub use wire::*;
