//! Credentials and login handshakes.
//!
//! All four schemes POST to `/api/v1.0/login` with no body and one
//! authentication header. Basic credentials and the virtual-server name are
//! base64-encoded here, exactly once, when the header is built; callers
//! always hand in raw values.

use crate::transport::headers;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Virtual-server header value meaning "the main server".
pub const NO_VSERVER: &str = "x";

/// A secret string, wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    /// Wraps a secret.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The secret value. Do not log it.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// A loggable form: the first four characters and an ellipsis.
    pub fn redacted(&self) -> String {
        redact(&self.0)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", self.redacted())
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Secret {}

pub(crate) fn redact(value: &str) -> String {
    let prefix: String = value.chars().take(4).collect();
    format!("{}…", prefix)
}

/// The four login schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// User name and password.
    Basic,
    /// Gateway bearer token (`KSCGW`).
    Gateway,
    /// Web-console bearer token (`KSCWT`).
    TokenW,
    /// Bearer token (`KSCT`).
    Token,
}

impl AuthScheme {
    /// The scheme word that opens the authorization header.
    pub fn header_prefix(self) -> &'static str {
        match self {
            AuthScheme::Basic => "KSCBasic",
            AuthScheme::Gateway => "KSCGW",
            AuthScheme::TokenW => "KSCWT",
            AuthScheme::Token => "KSCT",
        }
    }
}

/// Login credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// User name and password, sent raw-then-base64 in a `KSCBasic` header.
    Basic {
        /// User name, as typed.
        user: String,
        /// Password, as typed.
        password: Secret,
    },
    /// Gateway auth key, usually from [`crate::GatewayKey`].
    Gateway(Secret),
    /// Web-console token.
    TokenW(Secret),
    /// Token, e.g. a short-lived logon token.
    Token(Secret),
}

impl Credentials {
    /// User name and password credentials.
    pub fn basic(user: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Basic {
            user: user.into(),
            password: Secret::new(password),
        }
    }

    /// `KSCGW` bearer credentials.
    pub fn gateway(token: impl Into<String>) -> Self {
        Credentials::Gateway(Secret::new(token))
    }

    /// `KSCWT` bearer credentials.
    pub fn web_token(token: impl Into<String>) -> Self {
        Credentials::TokenW(Secret::new(token))
    }

    /// `KSCT` bearer credentials.
    pub fn token(token: impl Into<String>) -> Self {
        Credentials::Token(Secret::new(token))
    }

    /// Which scheme these credentials log in with.
    pub fn scheme(&self) -> AuthScheme {
        match self {
            Credentials::Basic { .. } => AuthScheme::Basic,
            Credentials::Gateway(_) => AuthScheme::Gateway,
            Credentials::TokenW(_) => AuthScheme::TokenW,
            Credentials::Token(_) => AuthScheme::Token,
        }
    }

    /// The headers of the login call.
    ///
    /// Only Basic sends the virtual-server header; an absent name goes on
    /// the wire as the literal `x`.
    pub fn login_headers(&self, vserver: Option<&str>) -> Vec<(String, String)> {
        match self {
            Credentials::Basic { user, password } => {
                let authorization = format!(
                    "{} user=\"{}\", pass=\"{}\"",
                    AuthScheme::Basic.header_prefix(),
                    STANDARD.encode(user.as_bytes()),
                    STANDARD.encode(password.expose().as_bytes()),
                );
                let vserver = match vserver {
                    Some(name) => STANDARD.encode(name.as_bytes()),
                    None => NO_VSERVER.to_string(),
                };
                vec![
                    (headers::AUTHORIZATION.to_string(), authorization),
                    (headers::VSERVER.to_string(), vserver),
                ]
            }
            Credentials::Gateway(token) | Credentials::TokenW(token) | Credentials::Token(token) => {
                vec![(
                    headers::AUTHORIZATION.to_string(),
                    format!("{} {}", self.scheme().header_prefix(), token.expose()),
                )]
            }
        }
    }
}

/// A long-lived session token returned by `Session.StartSession`.
///
/// Persist it with [`SessionToken::expose`] and hand it back to
/// [`crate::KscClient::resume`] later.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(Secret);

impl SessionToken {
    /// Wraps a token string.
    pub fn new(token: impl Into<String>) -> Self {
        Self(Secret::new(token))
    }

    /// The token value. Do not log it.
    pub fn expose(&self) -> &str {
        self.0.expose()
    }

    /// The loggable form.
    pub fn redacted(&self) -> String {
        self.0.redacted()
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({})", self.redacted())
    }
}

/// A single-use logon token.
///
/// The server documents a three-minute lifetime; the client does not
/// enforce it. Issuing one leaves the session token untouched.
#[derive(PartialEq, Eq)]
pub struct ShortLivedToken(Secret);

impl ShortLivedToken {
    pub(crate) fn new(token: impl Into<String>) -> Self {
        Self(Secret::new(token))
    }

    /// The token value. Do not log it.
    pub fn expose(&self) -> &str {
        self.0.expose()
    }

    /// Consumes the token into `KSCT` credentials for a fresh client.
    pub fn into_credentials(self) -> Credentials {
        Credentials::Token(self.0)
    }
}

impl fmt::Debug for ShortLivedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShortLivedToken({})", self.0.redacted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
        headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn basic_login_headers() {
        let headers = Credentials::basic("admin", "secret").login_headers(None);
        assert_eq!(
            header(&headers, "Authorization"),
            Some(r#"KSCBasic user="YWRtaW4=", pass="c2VjcmV0""#)
        );
        assert_eq!(header(&headers, "X-KSC-VServer"), Some("x"));
    }

    #[test]
    fn vserver_is_encoded() {
        let headers = Credentials::basic("admin", "secret").login_headers(Some("tenant"));
        assert_eq!(header(&headers, "X-KSC-VServer"), Some("dGVuYW50"));
    }

    #[test]
    fn bearer_schemes() {
        for (creds, expected) in [
            (Credentials::gateway("abc"), "KSCGW abc"),
            (Credentials::web_token("abc"), "KSCWT abc"),
            (Credentials::token("abc"), "KSCT abc"),
        ] {
            let headers = creds.login_headers(Some("ignored"));
            assert_eq!(headers.len(), 1);
            assert_eq!(header(&headers, "Authorization"), Some(expected));
        }
    }

    #[test]
    fn secrets_are_redacted() {
        let creds = Credentials::basic("admin", "hunter2-long");
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("hunter2-long"));
        assert!(debug.contains("hunt…"));

        let token = SessionToken::new("nst1234567890");
        assert_eq!(token.to_string(), "nst1…");
        assert!(!format!("{:?}", token).contains("567890"));
    }

    #[test]
    fn short_lived_token_becomes_ksct() {
        let creds = ShortLivedToken::new("slt-1").into_credentials();
        assert_eq!(creds.scheme(), AuthScheme::Token);
    }

    fn decode_field<'a>(authorization: &'a str, field: &str) -> &'a str {
        let start = authorization.find(&format!("{}=\"", field)).unwrap() + field.len() + 2;
        let end = start + authorization[start..].find('"').unwrap();
        &authorization[start..end]
    }

    proptest! {
        #[test]
        fn basic_fields_are_encoded_exactly_once(
            user in "\\PC{0,24}",
            pass in "\\PC{0,24}",
            vserver in proptest::option::of("[A-Za-z0-9_.=-]{1,16}"),
        ) {
            let creds = Credentials::basic(user.clone(), pass.clone());
            let first = creds.login_headers(vserver.as_deref());
            let second = creds.login_headers(vserver.as_deref());
            prop_assert_eq!(&first, &second);

            let auth = header(&first, "Authorization").unwrap();
            let user_b64 = decode_field(auth, "user");
            let pass_b64 = decode_field(auth, "pass");
            prop_assert_eq!(STANDARD.decode(user_b64).unwrap(), user.as_bytes().to_vec());
            prop_assert_eq!(STANDARD.decode(pass_b64).unwrap(), pass.as_bytes().to_vec());

            let vs = header(&first, "X-KSC-VServer").unwrap();
            match vserver {
                Some(name) => prop_assert_eq!(STANDARD.decode(vs).unwrap(), name.into_bytes()),
                None => prop_assert_eq!(vs, "x"),
            }
        }
    }
}
