//! Login schemes, session tokens and body discipline against the fake server.

mod common;

use common::{config, connect, connect_with, http, pooled_http, FakeLink};
use ksc_client::groups::{EventNotificationProperties, SessionService};
use ksc_client::{AuthScheme, CallContext, Credentials, KscClient, LoopbackClient, SessionToken};
use ksc_testkit::{codes, FakeKscServer};
use proptest::prelude::*;
use std::sync::Arc;

#[test]
fn login_ping_end() {
    let server = FakeKscServer::new();
    let ctx = CallContext::background();
    let client = connect(&server);

    let login = &server.requests_to("login")[0].request;
    assert_eq!(login.header("X-KSC-VServer"), Some("x"));
    assert_eq!(
        login.header("Authorization"),
        Some(r#"KSCBasic user="YWRtaW4=", pass="c2VjcmV0""#)
    );
    assert!(client.session_token().is_some());

    client.ping(&ctx).unwrap();
    client.end_session(&ctx).unwrap();
    assert!(client.session_token().is_none());
    assert_eq!(server.live_sessions(), 0);
    assert_eq!(server.resets(), 1);

    let err = client.ping(&ctx).unwrap_err();
    assert!(err.is_forbidden(), "{err}");
    assert_eq!(err.server_code(), Some(codes::ACCESS_DENIED));
}

#[test]
fn session_header_carries_token() {
    let server = FakeKscServer::new();
    let client = connect(&server);
    client.ping(&CallContext::background()).unwrap();

    let token = client.session_token().unwrap();
    let ping = server.requests_to("Session.Ping").pop().unwrap();
    assert_eq!(ping.request.header("X-KSC-Session"), Some(token.expose()));
    assert!(server.requests_to("login")[0].request.header("X-KSC-Session").is_none());
}

#[test]
fn vserver_header_stops_once_a_session_exists() {
    let server = FakeKscServer::new().with_vserver("Branch");
    let client = connect_with(
        &server,
        config().with_vserver("Branch"),
        Credentials::basic("admin", "secret"),
    )
    .unwrap();
    client.ping(&CallContext::background()).unwrap();

    let login = &server.requests_to("login")[0].request;
    assert_eq!(login.header("X-KSC-VServer"), Some("QnJhbmNo"));
    let ping = &server.requests_to("Session.Ping")[0].request;
    assert!(ping.header("X-KSC-VServer").is_none());
}

#[test]
fn unknown_vserver_is_rejected() {
    let server = FakeKscServer::new();
    let err = connect_with(
        &server,
        config().with_vserver("Nowhere"),
        Credentials::basic("admin", "secret"),
    )
    .unwrap_err();
    assert_eq!(err.server_code(), Some(codes::ACCESS_DENIED));
    assert_eq!(err.site().map(|s| s.endpoint.as_str()), Some("login"));
}

#[test]
fn wrong_password_fails_login() {
    let server = FakeKscServer::new();
    let err = connect_with(&server, config(), Credentials::basic("admin", "guess")).unwrap_err();
    assert!(err.server_error().is_some());
    assert!(!err.is_retryable());
}

#[test]
fn basic_login_without_session_uses_the_connection() {
    let server = FakeKscServer::new();
    let client = connect_with(
        &server,
        config().with_start_session(false),
        Credentials::basic("admin", "secret"),
    )
    .unwrap();
    assert!(client.session_token().is_none());
    client.ping(&CallContext::background()).unwrap();
    assert!(server.requests_to("Session.StartSession").is_empty());
}

#[test]
fn sessionless_basic_login_survives_a_connection_reset() {
    let server = FakeKscServer::new();
    let ctx = CallContext::background();
    let connection = server.connect();
    let client = KscClient::connect(
        config().with_start_session(false),
        Arc::new(LoopbackClient::new(FakeLink(connection.clone()))),
        Credentials::basic("admin", "secret"),
        &ctx,
    )
    .unwrap();

    connection.reset();
    client.ping(&ctx).unwrap();

    let login = server.requests_to("login")[0].request.header("Authorization").map(str::to_string);
    let ping = &server.requests_to("Session.Ping")[0].request;
    assert_eq!(ping.header("Authorization").map(str::to_string), login);
    assert_eq!(ping.header("X-KSC-VServer"), Some("x"));
    assert!(ping.header("X-KSC-Session").is_none());
}

#[test]
fn sessionless_calls_authenticate_every_pooled_connection() {
    let server = FakeKscServer::new().with_web_token("wt-123");
    let ctx = CallContext::background();
    let basic = KscClient::connect(
        config().with_start_session(false),
        pooled_http(&server, 3),
        Credentials::basic("admin", "secret"),
        &ctx,
    )
    .unwrap();
    let web = KscClient::connect(
        config(),
        pooled_http(&server, 3),
        Credentials::web_token("wt-123"),
        &ctx,
    )
    .unwrap();

    for _ in 0..4 {
        basic.ping(&ctx).unwrap();
        web.ping(&ctx).unwrap();
    }

    let pings = server.requests_to("Session.Ping");
    assert_eq!(pings.len(), 8);
    assert!(pings.iter().all(|p| p.request.header("Authorization").is_some()));
    assert!(pings
        .iter()
        .any(|p| p.request.header("Authorization") == Some("KSCWT wt-123")));
}

#[test]
fn ended_session_stops_resending_credentials() {
    let server = FakeKscServer::new();
    let ctx = CallContext::background();
    let client = connect_with(
        &server,
        config().with_start_session(false),
        Credentials::basic("admin", "secret"),
    )
    .unwrap();

    client.end_session(&ctx).unwrap();
    let err = client.ping(&ctx).unwrap_err();
    assert!(err.is_forbidden(), "{err}");
    let ping = &server.requests_to("Session.Ping")[0].request;
    assert!(ping.header("Authorization").is_none());
}

#[test]
fn web_token_login_holds_no_session() {
    let server = FakeKscServer::new().with_web_token("wt-123");
    let client = connect_with(&server, config(), Credentials::web_token("wt-123")).unwrap();
    assert_eq!(client.scheme(), AuthScheme::TokenW);
    assert!(client.session_token().is_none());

    client.ping(&CallContext::background()).unwrap();
    let login = &server.requests_to("login")[0].request;
    assert_eq!(login.header("Authorization"), Some("KSCWT wt-123"));
    assert!(login.header("X-KSC-VServer").is_none());
}

#[test]
fn short_lived_token_logs_in_once() {
    let server = FakeKscServer::new();
    let ctx = CallContext::background();
    let client = connect(&server);
    let before = client.session_token();

    let token = client.group::<SessionService>().create_token(&ctx).unwrap();
    assert_eq!(client.session_token(), before);
    let text = token.expose().to_string();

    let second = connect_with(&server, config(), token.into_credentials()).unwrap();
    assert_eq!(second.scheme(), AuthScheme::Token);
    second.ping(&ctx).unwrap();

    let again = connect_with(&server, config(), Credentials::token(text)).unwrap_err();
    assert_eq!(again.server_code(), Some(codes::ACCESS_DENIED));
}

#[test]
fn resumed_token_survives_a_new_connection() {
    let server = FakeKscServer::new();
    let ctx = CallContext::background();
    let token = connect(&server).session_token().unwrap();

    let resumed = KscClient::resume(config(), http(&server), token.clone(), &ctx).unwrap();
    assert_eq!(resumed.session_token(), Some(token));
    resumed.ping(&ctx).unwrap();
}

#[test]
fn resuming_a_dead_token_fails_with_forbidden() {
    let server = FakeKscServer::new();
    let err = KscClient::resume(
        config(),
        http(&server),
        SessionToken::new("nst-stale"),
        &CallContext::background(),
    )
    .unwrap_err();
    assert!(err.is_forbidden());
    assert!(err.site().and_then(|s| s.session.as_deref()).is_some_and(|s| !s.contains("stale")));
}

#[test]
fn parameterless_endpoints_send_no_body() {
    let server = FakeKscServer::new();
    let ctx = CallContext::background();
    let client = connect(&server);

    client.ping(&ctx).unwrap();
    let settings = client
        .group::<EventNotificationProperties>()
        .get_default_settings(&ctx)
        .unwrap();
    assert_eq!(settings.get_i64("KLEVP_ND_DAYS_TO_STORE_EVENT"), Some(30));
    client.end_session(&ctx).unwrap();

    for path in [
        "Session.StartSession",
        "Session.Ping",
        "EventNotificationProperties.GetDefaultSettings",
        "Session.EndSession",
    ] {
        let recorded = server.requests_to(path);
        assert_eq!(recorded.len(), 1, "{path}");
        assert!(recorded[0].request.body.is_none(), "{path} sent a body");
    }
}

#[test]
fn empty_object_endpoints_send_braces() {
    let server = FakeKscServer::new();
    let client = connect(&server);
    client
        .group::<ksc_client::groups::AdmServerSettings>()
        .get_shared_folder(&CallContext::background())
        .unwrap();

    let recorded = server.requests_to("AdmServerSettings.GetSharedFolder");
    assert_eq!(recorded[0].request.body.as_deref(), Some(&b"{}"[..]));
}

#[test]
fn clones_share_one_session() {
    let server = FakeKscServer::new();
    let client = connect(&server);
    let ctx = CallContext::background();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let client = client.clone();
            let ctx = ctx.clone();
            std::thread::spawn(move || {
                for _ in 0..5 {
                    client.ping(&ctx).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(server.requests_to("Session.Ping").len(), 20);
    assert_eq!(server.requests_to("login").len(), 1);
    assert_eq!(server.live_sessions(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn credentials_are_encoded_once_across_logins(
        user in "[A-Za-z0-9 \"äöü@._-]{1,16}",
        password in ksc_testkit::credential_text(),
    ) {
        let server = FakeKscServer::new().with_user(&user, &password);
        for _ in 0..2 {
            let client = connect_with(&server, config(), Credentials::basic(user.as_str(), password.as_str()));
            prop_assert!(client.is_ok());
        }

        let logins = server.requests_to("login");
        let first = logins[0].request.header("Authorization").map(str::to_string);
        let second = logins[1].request.header("Authorization").map(str::to_string);
        prop_assert_eq!(&first, &second);

        let encode = |s: &str| {
            use base64::Engine as _;
            base64::engine::general_purpose::STANDARD.encode(s)
        };
        let expected = format!(r#"KSCBasic user="{}", pass="{}""#, encode(&user), encode(&password));
        prop_assert_eq!(first, Some(expected));
    }
}
