//! End-to-end invite, join and messaging flows over a mock relay.

mod common;

use common::{relay_url, MockRelay, TestPeer};

use nostr::{Kind, Timestamp, UnsignedEvent};
use openmls_rust_crypto::RustCrypto;

use marmot_mls::error::Error;
use marmot_mls::key_package;
use marmot_mls::mls::MlsEngine;
use marmot_mls::prelude::*;
use marmot_mls::{envelope, welcome};

fn chat_rumor(peer: &TestPeer, content: &str) -> UnsignedEvent {
    let mut rumor = UnsignedEvent::new(
        peer.pubkey(),
        Timestamp::now(),
        Kind::Custom(9),
        [],
        content,
    );
    rumor.ensure_id();
    rumor
}

/// Full happy path: key package → group → invite → commit-then-welcome
/// ordering on the relay → join → message exchange in both directions.
#[tokio::test]
async fn invite_join_and_exchange_messages() {
    let relay = MockRelay::new();
    let alice = TestPeer::new(relay.clone());
    let bob = TestPeer::new(relay.clone());

    // Bob advertises a key package.
    let bob_kp_event = bob
        .client
        .publish_key_package(&[relay_url()])
        .await
        .expect("Failed to publish key package");
    assert_eq!(bob_kp_event.kind, Kind::MlsKeyPackage);

    // The credential inside is bound to Bob's identity key.
    key_package::parse_event(&bob_kp_event, &RustCrypto::default())
        .expect("Failed to parse key package event");

    // Alice creates the group and invites Bob.
    let group = alice
        .client
        .create_group(
            "T",
            CreateGroupOptions {
                admins: vec![alice.pubkey()],
                relays: vec![relay_url()],
                ..Default::default()
            },
        )
        .await
        .expect("Failed to create group");

    let outcome = group
        .lock()
        .await
        .invite(vec![bob_kp_event.clone()])
        .await
        .expect("Failed to invite");
    assert_eq!(outcome.epoch, 1);
    assert_eq!(outcome.welcomes.len(), 1);
    assert!(outcome.welcomes[0].delivered);
    assert_eq!(outcome.welcomes[0].invitee, bob.pubkey());

    // Relay ordering: the commit envelope is acknowledged before the gift
    // wrap is published.
    let published = relay.published();
    let commit_pos = published
        .iter()
        .position(|e| e.id == outcome.commit_event.id)
        .expect("commit not on relay");
    let wrap_pos = published
        .iter()
        .position(|e| e.kind == Kind::GiftWrap)
        .expect("gift wrap not on relay");
    assert!(commit_pos < wrap_pos);
    // The commit is signed by a throwaway key, not Alice.
    assert_ne!(published[commit_pos].pubkey, alice.pubkey());

    // Bob unwraps the welcome and joins.
    let wrapper = published[wrap_pos].clone();
    let (welcome_sender, welcome_rumor) = bob
        .client
        .unwrap_gift_wrap(&wrapper)
        .await
        .expect("Failed to unwrap gift");
    assert_eq!(welcome_sender, alice.pubkey());
    assert_eq!(welcome_rumor.kind, Kind::MlsWelcome);

    let preview = bob
        .client
        .preview_welcome(&welcome_rumor)
        .expect("Failed to preview welcome");
    assert_eq!(preview.name, "T");

    let bob_group = bob
        .client
        .join_group_from_welcome(&welcome_rumor, None)
        .await
        .expect("Failed to join from welcome");

    {
        let a = group.lock().await;
        let b = bob_group.lock().await;
        assert_eq!(a.epoch(), b.epoch());
        assert_eq!(a.nostr_group_id(), b.nostr_group_id());
        assert_eq!(b.admins(), &[alice.pubkey()]);
    }

    // Bob says hi; Alice ingests it off the relay. Cross a second boundary
    // first so the new event sorts strictly after Alice's resume cursor.
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    let hi = chat_rumor(&bob, "hi");
    bob_group
        .lock()
        .await
        .send_rumor(hi.clone())
        .await
        .expect("Failed to send rumor");

    let report = group
        .lock()
        .await
        .catch_up()
        .await
        .expect("Failed to catch up");
    assert_eq!(report.rumors.len(), 1);
    assert_eq!(report.rumors[0].rumor.content, "hi");
    assert_eq!(report.rumors[0].rumor.pubkey, bob.pubkey());

    // And back the other way, again past Bob's resume cursor.
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    let yo = chat_rumor(&alice, "yo");
    group
        .lock()
        .await
        .send_rumor(yo)
        .await
        .expect("Failed to send rumor");
    let report = bob_group
        .lock()
        .await
        .catch_up()
        .await
        .expect("Failed to catch up");
    assert_eq!(report.rumors.len(), 1);
    assert_eq!(report.rumors[0].rumor.content, "yo");
    assert_eq!(report.rumors[0].rumor.pubkey, alice.pubkey());
}

/// A non-admin member's commit is classified as rejected and the epoch
/// stays put.
#[tokio::test]
async fn non_admin_commit_is_rejected_on_ingest() {
    let relay = MockRelay::new();
    let alice = TestPeer::new(relay.clone());
    let bob = TestPeer::new(relay.clone());

    let bob_kp_event = bob
        .client
        .publish_key_package(&[relay_url()])
        .await
        .expect("Failed to publish key package");

    let group = alice
        .client
        .create_group(
            "locked",
            CreateGroupOptions {
                admins: vec![alice.pubkey()],
                relays: vec![relay_url()],
                ..Default::default()
            },
        )
        .await
        .expect("Failed to create group");
    group
        .lock()
        .await
        .invite(vec![bob_kp_event])
        .await
        .expect("Failed to invite");

    let published = relay.published();
    let wrapper = published
        .iter()
        .find(|e| e.kind == Kind::GiftWrap)
        .expect("gift wrap")
        .clone();
    let (_, welcome_rumor) = bob
        .client
        .unwrap_gift_wrap(&wrapper)
        .await
        .expect("Failed to unwrap");
    let bob_group = bob
        .client
        .join_group_from_welcome(&welcome_rumor, None)
        .await
        .expect("Failed to join");

    // The runtime refuses outright: Bob is not an admin.
    let denied = bob_group
        .lock()
        .await
        .commit(CommitRequest {
            self_update: true,
            ..Default::default()
        })
        .await;
    assert!(matches!(denied, Err(Error::NotAdmin(k)) if k == bob.pubkey()));

    // Bob forges one anyway, straight from his persisted MLS state.
    let (mls_group_id, nostr_group_id, epoch_before) = {
        let g = bob_group.lock().await;
        (g.mls_group_id().to_vec(), *g.nostr_group_id(), g.epoch())
    };
    let snapshot = bob
        .group_store
        .load(&mls_group_id)
        .expect("Failed to read store")
        .expect("missing snapshot");
    let mut forger =
        MlsEngine::from_snapshot(&snapshot, 5).expect("Failed to restore engine");
    forger.propose_self_update().expect("Failed to propose");
    let (commit_bytes, _welcome) = forger.commit_to_pending().expect("Failed to commit");
    let forged = envelope::seal(
        &nostr_group_id,
        forger.current_exporter_secret().expect("exporter"),
        &commit_bytes,
    )
    .expect("Failed to seal");

    // Alice classifies it as rejected; her epoch does not move.
    let report = group
        .lock()
        .await
        .ingest(vec![forged])
        .await
        .expect("Failed to ingest");
    assert!(report.processed.iter().any(|p| matches!(
        &p.outcome,
        EventOutcome::CommitRejected(CommitRejection::NotAdmin(k)) if *k == bob.pubkey()
    )));
    assert_eq!(group.lock().await.epoch(), epoch_before);
}

/// Without a matching local key package, joining reports WelcomeUnmatched
/// and persists nothing.
#[tokio::test]
async fn welcome_without_matching_key_package_is_unmatched() {
    let relay = MockRelay::new();
    let alice = TestPeer::new(relay.clone());
    let bob = TestPeer::new(relay.clone());
    let carol = TestPeer::new(relay.clone());

    let bob_kp_event = bob
        .client
        .publish_key_package(&[relay_url()])
        .await
        .expect("Failed to publish key package");

    let group = alice
        .client
        .create_group(
            "exclusive",
            CreateGroupOptions {
                admins: vec![alice.pubkey()],
                relays: vec![relay_url()],
                ..Default::default()
            },
        )
        .await
        .expect("Failed to create group");
    group
        .lock()
        .await
        .invite(vec![bob_kp_event])
        .await
        .expect("Failed to invite");

    let wrapper = relay
        .published()
        .into_iter()
        .find(|e| e.kind == Kind::GiftWrap)
        .expect("gift wrap");
    // Carol intercepts the wrap; she cannot even unwrap it, and with a
    // forwarded rumor she has no matching key package.
    assert!(carol.client.unwrap_gift_wrap(&wrapper).await.is_err());

    let (_, welcome_rumor) = bob
        .client
        .unwrap_gift_wrap(&wrapper)
        .await
        .expect("Failed to unwrap");
    let result = carol
        .client
        .join_group_from_welcome(&welcome_rumor, None)
        .await;
    assert!(matches!(result, Err(Error::WelcomeUnmatched { .. })));
    assert!(carol
        .group_store
        .list()
        .expect("Failed to list store")
        .is_empty());
}

/// A commit nobody acknowledges is rolled back: no epoch advance, no
/// welcome on the wire.
#[tokio::test]
async fn commit_without_relay_ack_rolls_back() {
    let relay = MockRelay::new();
    let alice = TestPeer::new(relay.clone());
    let bob = TestPeer::new(relay.clone());

    let bob_kp_event = bob
        .client
        .publish_key_package(&[relay_url()])
        .await
        .expect("Failed to publish key package");

    let group = alice
        .client
        .create_group(
            "flaky",
            CreateGroupOptions {
                admins: vec![alice.pubkey()],
                relays: vec![relay_url()],
                ..Default::default()
            },
        )
        .await
        .expect("Failed to create group");

    relay.refuse_acks();
    let result = group.lock().await.invite(vec![bob_kp_event.clone()]).await;
    assert!(matches!(result, Err(Error::NoRelayAck)));
    assert_eq!(group.lock().await.epoch(), 0);
    assert!(relay
        .published()
        .iter()
        .all(|e| e.kind != Kind::GiftWrap));

    // The relay comes back; the same invite now goes through.
    relay.accept_acks();
    let outcome = group
        .lock()
        .await
        .invite(vec![bob_kp_event])
        .await
        .expect("Failed to invite after recovery");
    assert_eq!(outcome.epoch, 1);
    assert!(outcome.welcomes[0].delivered);
}

/// The welcome rumor references the key-package event and the group relays.
#[tokio::test]
async fn welcome_rumor_references_key_package_event() {
    let relay = MockRelay::new();
    let alice = TestPeer::new(relay.clone());
    let bob = TestPeer::new(relay.clone());

    let bob_kp_event = bob
        .client
        .publish_key_package(&[relay_url()])
        .await
        .expect("Failed to publish key package");

    let group = alice
        .client
        .create_group(
            "tagged",
            CreateGroupOptions {
                admins: vec![alice.pubkey()],
                relays: vec![relay_url()],
                ..Default::default()
            },
        )
        .await
        .expect("Failed to create group");
    group
        .lock()
        .await
        .invite(vec![bob_kp_event.clone()])
        .await
        .expect("Failed to invite");

    let wrapper = relay
        .published()
        .into_iter()
        .find(|e| e.kind == Kind::GiftWrap)
        .expect("gift wrap");
    let (_, welcome_rumor) = bob
        .client
        .unwrap_gift_wrap(&wrapper)
        .await
        .expect("Failed to unwrap");

    let parsed = welcome::parse_rumor(&welcome_rumor).expect("Failed to parse rumor");
    assert_eq!(parsed.key_package_event_id, Some(bob_kp_event.id));
    assert_eq!(parsed.relays, vec![relay_url()]);
}
