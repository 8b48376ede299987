//! Settings-storage read/modify/apply cycles against the fake server.

mod common;

use common::connect;
use ksc_client::{
    with_storage, CallContext, CancelToken, KscClient, KscError, Params, SettingsStorage,
    StorageAddress, StorageOpener, WriteOption,
};
use ksc_testkit::{codes, FakeKscServer};
use proptest::prelude::*;

const POLICY: i64 = 7;

fn server() -> FakeKscServer {
    FakeKscServer::new().with_policy(
        POLICY,
        &["Laptops"],
        vec![
            (
                ("KES".into(), "11.0.0.0".into(), "Scan".into()),
                Params::new().with("Level", 2i64).with("Heuristics", true),
            ),
            (
                ("KES".into(), "11.0.0.0".into(), "Firewall".into()),
                Params::new().with("Enabled", true),
            ),
        ],
    )
}

fn contents() -> StorageOpener {
    StorageOpener::PolicyContents {
        policy_id: POLICY,
        revision: 0,
    }
}

fn scan() -> StorageAddress {
    StorageAddress::new("KES", "11.0.0.0", "Scan").unwrap()
}

fn open(client: &KscClient, opener: &StorageOpener) -> SettingsStorage {
    SettingsStorage::open(client, &CallContext::background(), opener).unwrap()
}

#[test]
fn duplicate_profile_fails_on_apply() {
    let server = server();
    let ctx = CallContext::background();
    let client = connect(&server);

    let storage = open(
        &client,
        &StorageOpener::AddProfile {
            policy_id: POLICY,
            name: "Laptops".into(),
            attributes: Params::new().with("KLSSPOL_PRF_ENABLED", true),
        },
    );
    let address = StorageAddress::new("KES", "11.0.0.0", "Scan").unwrap();
    storage.create_section(&ctx, &address).unwrap();
    storage
        .write(&ctx, &address, WriteOption::Update, Params::new().with("Level", 5i64))
        .unwrap();

    let err = storage.apply(&ctx).unwrap_err();
    assert!(client.config().codes.is_object_exists(&err), "{err}");
    assert_eq!(err.server_code(), Some(codes::OBJECT_EXISTS));

    storage.release(&ctx).unwrap();
    assert_eq!(server.live_storages(), 0);
    assert_eq!(server.policy_profiles(POLICY), ["Laptops"]);
}

#[test]
fn new_profile_applies() {
    let server = server();
    let ctx = CallContext::background();
    let client = connect(&server);

    let opener = StorageOpener::AddProfile {
        policy_id: POLICY,
        name: "Servers".into(),
        attributes: Params::new(),
    };
    with_storage(&client, &ctx, &opener, |storage| storage.apply(&ctx)).unwrap();

    assert_eq!(server.policy_profiles(POLICY), ["Laptops", "Servers"]);
    assert_eq!(server.live_storages(), 0);
}

#[test]
fn staged_edits_stay_invisible_until_apply() {
    let server = server();
    let ctx = CallContext::background();
    let client = connect(&server);

    let writer = open(&client, &contents());
    let reader = open(&client, &contents());
    let realtime = StorageAddress::new("KES", "11.0.0.0", "Realtime").unwrap();

    writer
        .write(&ctx, &scan(), WriteOption::Update, Params::new().with("Level", 3i64))
        .unwrap();
    writer
        .write(&ctx, &scan(), WriteOption::Add, Params::new().with("Exclusions", "C:\\tmp"))
        .unwrap();
    writer.create_section(&ctx, &realtime).unwrap();

    let staged = writer.read(&ctx, &scan()).unwrap();
    assert_eq!(staged.get_i64("Level"), Some(3));
    assert_eq!(reader.read(&ctx, &scan()).unwrap().get_i64("Level"), Some(2));
    assert!(reader.read(&ctx, &realtime).is_err());
    assert_eq!(
        server.policy_section(POLICY, "KES", "11.0.0.0", "Scan").unwrap().get_i64("Level"),
        Some(2)
    );

    writer.apply(&ctx).unwrap();
    writer.release(&ctx).unwrap();
    reader.release(&ctx).unwrap();

    let fresh = open(&client, &contents());
    let committed = fresh.read(&ctx, &scan()).unwrap();
    assert_eq!(committed.get_i64("Level"), Some(3));
    assert_eq!(committed.get_str("Exclusions"), Some("C:\\tmp"));
    assert!(fresh.read(&ctx, &realtime).unwrap().is_empty());
    fresh.release(&ctx).unwrap();
}

#[test]
fn failed_apply_leaves_nothing_behind() {
    let server = server();
    let ctx = CallContext::background();
    let client = connect(&server);
    let before = server.policy_section(POLICY, "KES", "11.0.0.0", "Scan");

    let opener = StorageOpener::AddProfile {
        policy_id: POLICY,
        name: "Laptops".into(),
        attributes: Params::new(),
    };
    let err = with_storage(&client, &ctx, &opener, |storage| {
        storage.create_section(&ctx, &scan())?;
        storage.write(&ctx, &scan(), WriteOption::Replace, Params::new().with("Level", 9i64))?;
        storage.apply(&ctx)
    })
    .unwrap_err();

    assert!(client.config().codes.is_object_exists(&err));
    assert_eq!(server.policy_section(POLICY, "KES", "11.0.0.0", "Scan"), before);
    assert_eq!(server.policy_profiles(POLICY), ["Laptops"]);
    assert_eq!(server.live_storages(), 0);
}

#[test]
fn names_list_one_level_down() {
    let server = server();
    let ctx = CallContext::background();
    let client = connect(&server);
    let storage = open(&client, &contents());

    assert_eq!(storage.get_names(&ctx, None, None).unwrap(), ["KES"]);
    assert_eq!(storage.get_names(&ctx, Some("KES"), None).unwrap(), ["11.0.0.0"]);
    let mut sections = storage.get_names(&ctx, Some("KES"), Some("11.0.0.0")).unwrap();
    sections.sort();
    assert_eq!(sections, ["Firewall", "Scan"]);

    assert!(matches!(
        storage.get_names(&ctx, None, Some("11.0.0.0")),
        Err(KscError::Validation { .. })
    ));
    storage.release(&ctx).unwrap();
}

#[test]
fn write_options_follow_their_semantics() {
    let server = server();
    let ctx = CallContext::background();
    let client = connect(&server);
    let storage = open(&client, &contents());

    let err = storage
        .write(&ctx, &scan(), WriteOption::Add, Params::new().with("Level", 1i64))
        .unwrap_err();
    assert!(client.config().codes.is_object_exists(&err));

    storage
        .write_code(&ctx, &scan(), 4, Params::new().with("Heuristics", true))
        .unwrap();
    assert!(storage.read(&ctx, &scan()).unwrap().get("Heuristics").is_none());

    storage
        .write(&ctx, &scan(), WriteOption::Clear, Params::new().with("Mode", "quick"))
        .unwrap();
    let section = storage.read(&ctx, &scan()).unwrap();
    assert_eq!(section.len(), 1);
    assert_eq!(section.get_str("Mode"), Some("quick"));

    assert!(matches!(
        storage.write_code(&ctx, &scan(), 5, Params::new()),
        Err(KscError::Validation { .. })
    ));
    storage.release(&ctx).unwrap();
}

#[test]
fn effective_policy_is_read_only() {
    let server = server();
    let ctx = CallContext::background();
    let client = connect(&server);

    let result = with_storage(
        &client,
        &ctx,
        &StorageOpener::EffectivePolicy { policy_id: POLICY },
        |storage| {
            assert_eq!(storage.read(&ctx, &scan())?.get_i64("Level"), Some(2));
            storage.write(&ctx, &scan(), WriteOption::Update, Params::new().with("Level", 1i64))
        },
    );

    let err = result.unwrap_err();
    assert_eq!(err.server_code(), Some(codes::ACCESS_DENIED));
    assert_eq!(server.live_storages(), 0);
}

#[test]
fn release_is_idempotent_and_blocks_use() {
    let server = server();
    let ctx = CallContext::background();
    let client = connect(&server);
    let storage = open(&client, &contents());

    storage.release(&ctx).unwrap();
    storage.release(&ctx).unwrap();
    assert_eq!(server.requests_to("SsContents.Ss_Release").len(), 1);
    assert!(matches!(
        storage.read(&ctx, &scan()),
        Err(KscError::Validation { .. })
    ));
}

#[test]
fn cancelled_body_still_releases() {
    let server = server();
    let token = CancelToken::new();
    let ctx = CallContext::with_cancel(token.clone());
    let client = connect(&server);

    let err = with_storage(&client, &ctx, &contents(), |storage| {
        token.cancel();
        storage.read(&ctx, &scan())
    })
    .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(server.live_storages(), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn forbidden_names_never_reach_the_wire(
        bad in ksc_testkit::forbidden_name(),
        good in ksc_testkit::storage_name(),
        position in ksc_testkit::address_position(),
    ) {
        let mut parts = [good.clone(), good.clone(), good];
        parts[position] = bad;
        let [product, version, section] = parts;

        let err = StorageAddress::new(product.as_str(), version.as_str(), section.as_str()).unwrap_err();
        let is_validation = matches!(err, KscError::Validation { .. });
        prop_assert!(is_validation);
    }
}

#[test]
fn forbidden_names_send_nothing() {
    let server = server();
    let ctx = CallContext::background();
    let client = connect(&server);
    let storage = open(&client, &contents());
    let sent = server.requests().len();

    for c in ksc_testkit::FORBIDDEN {
        let bad = format!("KES{}", c);
        assert!(StorageAddress::new(bad.as_str(), "1", "S").is_err());
        assert!(StorageAddress::new("KES", bad.as_str(), "S").is_err());
        assert!(StorageAddress::new("KES", "1", bad.as_str()).is_err());
        assert!(storage.get_names(&ctx, Some(bad.as_str()), None).is_err());
    }

    assert_eq!(server.requests().len(), sent);
    storage.release(&ctx).unwrap();
}
