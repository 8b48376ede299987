//! Fixtures: canned credentials, host records and action payloads.

use ksc_codec::{Params, Value};

/// User name the fake server accepts by default.
pub const ADMIN_USER: &str = "admin";
/// Password the fake server accepts by default.
pub const ADMIN_PASSWORD: &str = "secret";
/// Shared folder reported by default; a UNC path with backslashes.
pub const SHARED_FOLDER: &str = r"\\HOST\share\";

/// Server error codes the fake server uses.
///
/// The first three match the client's default classification.
pub mod codes {
    /// Object not found (expired or released handle, finished action).
    pub const NOT_FOUND: i64 = 1183;
    /// Object already exists.
    pub const OBJECT_EXISTS: i64 = 1161;
    /// State-check period too small.
    pub const PERIOD_TOO_SMALL: i64 = 1949;
    /// Authentication or authorization failure.
    pub const ACCESS_DENIED: i64 = 1167;
    /// Malformed or missing argument.
    pub const INVALID_ARGUMENT: i64 = 1206;
    /// Unknown endpoint.
    pub const UNKNOWN_METHOD: i64 = 1170;
    /// A slave server in a gateway chain could not be reached.
    pub const SLAVE_UNREACHABLE: i64 = 1910;
}

/// The record the fake server returns for host `index`.
pub fn host_record(index: usize) -> Value {
    Value::tagged_params(
        Params::new()
            .with("KLHST_WKS_HOSTNAME", format!("{:08x}-host", index))
            .with("KLHST_WKS_DN", format!("WKS-{:05}", index))
            .with("KLHST_WKS_GROUPID", 0i64)
            .with("KLHST_WKS_STATUS", Value::long(1)),
    )
}

/// `count` host records.
pub fn host_records(count: usize) -> Vec<Value> {
    (0..count).map(host_record).collect()
}

/// State data carrying a progress percentage.
pub fn progress(percent: i64) -> Params {
    Params::new().with("Progress", percent)
}

/// State data of a failed action.
pub fn action_error(code: i64, module: &str, message: &str) -> Params {
    Params::new()
        .with("KLBLAG_ERROR_CODE", code)
        .with("KLBLAG_ERROR_MODULE", module)
        .with("KLBLAG_ERROR_MSG", message)
}
