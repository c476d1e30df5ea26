mod common;

use chat_callkit::calls::{GroupProfile, RosterSource};
use chat_callkit::loopback::{LoopbackMediaServer, LoopbackNetwork, LoopbackTokenProvider};
use chat_callkit::types::{CallErrorKind, UserInfo};
use chat_callkit::{CallError, CallKit, CallKitConfig};
use common::Harness;

fn big_group(size: usize) -> GroupProfile {
    GroupProfile {
        group_id: "big".into(),
        owner: Some("boss".into()),
        admins: vec!["adm".into(), "m0".into()],
        members: (0..size).map(|i| format!("m{i}")).collect(),
    }
}

#[tokio::test]
async fn test_fetch_pages_through_large_group() {
    let h = Harness::new();
    h.groups.insert_group(big_group(120));
    h.users.insert(UserInfo::new("m7").with_nickname("Seven"));
    let party = h.party("u1", "phone");

    let result = party.kit.fetch_group_members("big").await.unwrap();
    assert!(!result.is_degraded());
    assert_eq!(h.groups.page_requests(), 3);

    let roster = result.roster();
    assert_eq!(roster.source(), RosterSource::Server);
    // Staff follow the members; admins already listed are not repeated.
    assert_eq!(roster.remaining(), 122);
    let ids: Vec<&str> = roster.user_ids().collect();
    assert_eq!(ids[0], "m0");
    assert_eq!(&ids[120..], &["boss", "adm"]);

    let members: Vec<_> = roster.collect();
    assert_eq!(members[7].display_name, "Seven");
    assert_eq!(members[8].display_name, "m8");
}

#[tokio::test]
async fn test_fetch_respects_member_cap() {
    let config = CallKitConfig {
        roster_page_size: 50,
        roster_max_members: 60,
        ..CallKitConfig::default()
    };
    let h = Harness::with_config(config);
    h.groups.insert_group(big_group(500));
    let party = h.party("u1", "phone");

    let roster = party.kit.fetch_group_members("big").await.unwrap().roster();
    assert_eq!(h.groups.page_requests(), 2);
    let ids: Vec<String> = roster.user_ids().map(str::to_string).collect();
    assert_eq!(ids.len(), 62);
    assert_eq!(ids[59], "m59");
    assert_eq!(&ids[60..], &["boss".to_string(), "adm".to_string()]);
}

#[tokio::test]
async fn test_fetch_falls_back_to_local_cache() {
    let h = Harness::new();
    h.groups.insert_group(big_group(10));
    h.groups.insert_local(GroupProfile {
        group_id: "big".into(),
        owner: Some("boss".into()),
        admins: vec![],
        members: vec!["m1".into(), "m2".into(), "boss".into()],
    });
    h.groups.set_failing(true);
    let party = h.party("u1", "phone");

    let result = party.kit.fetch_group_members("big").await.unwrap();
    assert!(result.is_degraded());
    let err = result.error().unwrap();
    assert_eq!(err.kind(), CallErrorKind::Roster);
    assert_eq!(err.code(), 400);

    let roster = result.roster();
    assert_eq!(roster.source(), RosterSource::LocalCache);
    assert_eq!(roster.user_ids().collect::<Vec<_>>(), vec!["m1", "m2", "boss"]);
}

#[tokio::test]
async fn test_unknown_group_without_cache_is_empty() {
    let h = Harness::new();
    let party = h.party("u1", "phone");

    let result = party.kit.fetch_group_members("nope").await.unwrap();
    assert!(result.is_degraded());
    assert_eq!(result.roster().count(), 0);
}

#[tokio::test]
async fn test_fetch_without_directory_is_config_error() {
    let network = LoopbackNetwork::new();
    let kit = CallKit::builder("u1", "phone")
        .transport(network.transport())
        .token_provider(LoopbackTokenProvider::new())
        .engine_factory(LoopbackMediaServer::new().factory())
        .build()
        .unwrap();

    assert!(matches!(
        kit.fetch_group_members("big").await,
        Err(CallError::Config(_))
    ));
}

#[tokio::test]
async fn test_builder_requires_collaborators() {
    let err = CallKit::builder("u1", "phone").build().unwrap_err();
    assert!(matches!(err, CallError::Config(_)));

    let bad_config = CallKitConfig {
        invite_timeout_secs: 0,
        ..CallKitConfig::default()
    };
    let network = LoopbackNetwork::new();
    let err = CallKit::builder("u1", "phone")
        .config(bad_config)
        .transport(network.transport())
        .token_provider(LoopbackTokenProvider::new())
        .engine_factory(LoopbackMediaServer::new().factory())
        .build()
        .unwrap_err();
    assert!(matches!(err, CallError::Config(_)));
}
