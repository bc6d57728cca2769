//! Ordering, commit races, replay idempotency and watermark behavior of
//! the ingest pipeline.

mod common;

use common::{relay_url, welcome_rumor_for, MockRelay, TestPeer};

use nostr::{Event, Kind, Timestamp, UnsignedEvent};

use marmot_mls::cursor::EventCursor;
use marmot_mls::prelude::*;

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

/// Group of Alice (admin) + the given peers, each joined via its own key
/// package, all in one founding commit.
async fn founded_group(
    relay: &std::sync::Arc<MockRelay>,
    alice: &TestPeer,
    admins: Vec<nostr::PublicKey>,
    invitees: &[&TestPeer],
) -> (GroupHandle, Vec<GroupHandle>) {
    let mut kp_events = Vec::new();
    for peer in invitees {
        kp_events.push(
            peer.client
                .publish_key_package(&[relay_url()])
                .await
                .expect("Failed to publish key package"),
        );
    }

    let group = alice
        .client
        .create_group(
            "ordering",
            CreateGroupOptions {
                admins,
                relays: vec![relay_url()],
                ..Default::default()
            },
        )
        .await
        .expect("Failed to create group");
    group
        .lock()
        .await
        .invite(kp_events)
        .await
        .expect("Failed to invite");

    let mut joined = Vec::new();
    for peer in invitees {
        let rumor = welcome_rumor_for(peer, relay).await;
        joined.push(
            peer.client
                .join_group_from_welcome(&rumor, None)
                .await
                .expect("Failed to join"),
        );
    }
    (group, joined)
}

/// Two commits race for the same epoch; every member applies exactly the
/// one that is first in (epoch, created_at, id) order and drops the other.
#[tokio::test]
async fn commit_race_applies_exactly_one() {
    let relay = MockRelay::new();
    let alice = TestPeer::new(relay.clone());
    let bob = TestPeer::new(relay.clone());
    let carol = TestPeer::new(relay.clone());

    let (alice_group, joined) = founded_group(
        &relay,
        &alice,
        vec![alice.pubkey(), bob.pubkey()],
        &[&bob, &carol],
    )
    .await;
    let bob_group = &joined[0];
    let carol_group = &joined[1];
    assert_eq!(carol_group.lock().await.epoch(), 1);

    // Alice and Bob, both admins, commit concurrently at epoch 1 without
    // seeing each other's commit.
    let a_commit = alice_group
        .lock()
        .await
        .commit(CommitRequest {
            self_update: true,
            ..Default::default()
        })
        .await
        .expect("Failed to commit as alice")
        .commit_event;
    let b_commit = bob_group
        .lock()
        .await
        .commit(CommitRequest {
            self_update: true,
            ..Default::default()
        })
        .await
        .expect("Failed to commit as bob")
        .commit_event;

    // Carol receives them in scrambled order.
    let report = carol_group
        .lock()
        .await
        .ingest(vec![b_commit.clone(), a_commit.clone()])
        .await
        .expect("Failed to ingest");

    let applied: Vec<&ProcessedEvent> = report
        .processed
        .iter()
        .filter(|p| matches!(p.outcome, EventOutcome::CommitApplied { .. }))
        .collect();
    let dropped: Vec<&ProcessedEvent> = report
        .processed
        .iter()
        .filter(|p| {
            matches!(
                p.outcome,
                EventOutcome::CommitRejected(CommitRejection::RaceLoser { .. })
            )
        })
        .collect();
    assert_eq!(applied.len(), 1);
    assert_eq!(dropped.len(), 1);

    // The winner is the smaller composite cursor; the epoch moved once.
    let winner = EventCursor::from(&a_commit).min(EventCursor::from(&b_commit));
    assert_eq!(applied[0].cursor, winner);
    assert_eq!(carol_group.lock().await.epoch(), 2);

    // The watermark covers both commits.
    let loser = EventCursor::from(&a_commit).max(EventCursor::from(&b_commit));
    assert_eq!(
        carol_group.lock().await.resume_cursor().expect("resume"),
        Some(winner.max(loser))
    );
}

/// Replaying an event, inside one batch or across batches, changes nothing.
#[tokio::test]
async fn replay_is_idempotent() {
    let relay = MockRelay::new();
    let alice = TestPeer::new(relay.clone());
    let bob = TestPeer::new(relay.clone());

    let (alice_group, joined) =
        founded_group(&relay, &alice, vec![alice.pubkey()], &[&bob]).await;
    let bob_group = &joined[0];

    // Cross a second boundary so the chat message sorts strictly after the
    // founding commit in Alice's watermark.
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    let hi = chat_rumor(&bob, "hi");
    let wrapper = bob_group
        .lock()
        .await
        .send_rumor(hi.clone())
        .await
        .expect("Failed to send");

    // Duplicate within a single batch.
    let report = alice_group
        .lock()
        .await
        .ingest(vec![wrapper.clone(), wrapper.clone()])
        .await
        .expect("Failed to ingest");
    assert_eq!(report.rumors.len(), 1);
    assert!(report
        .processed
        .iter()
        .any(|p| matches!(p.outcome, EventOutcome::Duplicate)));

    // And again across batches.
    let report = alice_group
        .lock()
        .await
        .ingest(vec![wrapper.clone()])
        .await
        .expect("Failed to re-ingest");
    assert!(report.rumors.is_empty());
    assert!(matches!(
        report.processed[0].outcome,
        EventOutcome::Duplicate
    ));

    let alice_group = alice_group.lock().await;
    let stored = alice_group.rumors(None, None).expect("Failed to query");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, hi.id);
    assert_eq!(
        alice_group.resume_cursor().expect("resume"),
        Some(EventCursor::from(&wrapper))
    );
}

/// A commit-only event still advances the watermark, and an application
/// message sealed under the post-commit epoch becomes readable through the
/// in-batch retry.
#[tokio::test]
async fn watermark_advances_past_commit_only_events() {
    let relay = MockRelay::new();
    let alice = TestPeer::new(relay.clone());
    let bob = TestPeer::new(relay.clone());

    let (alice_group, joined) =
        founded_group(&relay, &alice, vec![alice.pubkey()], &[&bob]).await;
    let bob_group = &joined[0];

    // Alice rotates her leaf (epoch 2) and immediately chats under the new
    // epoch.
    let commit_event = alice_group
        .lock()
        .await
        .commit(CommitRequest {
            self_update: true,
            ..Default::default()
        })
        .await
        .expect("Failed to commit")
        .commit_event;
    let msg_event = alice_group
        .lock()
        .await
        .send_rumor(chat_rumor(&alice, "new epoch"))
        .await
        .expect("Failed to send");

    // Bob gets the message before the commit; the retry pass unlocks it.
    let report = bob_group
        .lock()
        .await
        .ingest(vec![msg_event.clone(), commit_event.clone()])
        .await
        .expect("Failed to ingest");

    assert!(report
        .processed
        .iter()
        .any(|p| matches!(p.outcome, EventOutcome::CommitApplied { .. })));
    assert_eq!(report.rumors.len(), 1);
    assert_eq!(report.rumors[0].rumor.content, "new epoch");

    let bob_group = bob_group.lock().await;
    assert_eq!(bob_group.epoch(), 2);
    assert_eq!(bob_group.rumors(None, None).expect("query").len(), 1);

    let expected = EventCursor::from(&commit_event).max(EventCursor::from(&msg_event));
    assert_eq!(bob_group.resume_cursor().expect("resume"), Some(expected));
}

/// Members that see the same batch in different orders converge on the
/// same rumors and the same epoch.
#[tokio::test]
async fn permuted_batches_converge() {
    let relay = MockRelay::new();
    let alice = TestPeer::new(relay.clone());
    let bob = TestPeer::new(relay.clone());
    let carol = TestPeer::new(relay.clone());

    let (alice_group, joined) = founded_group(
        &relay,
        &alice,
        vec![alice.pubkey()],
        &[&bob, &carol],
    )
    .await;
    let bob_group = &joined[0];
    let carol_group = &joined[1];

    let m1 = alice_group
        .lock()
        .await
        .send_rumor(chat_rumor(&alice, "first"))
        .await
        .expect("Failed to send");
    let m2 = alice_group
        .lock()
        .await
        .send_rumor(chat_rumor(&alice, "second"))
        .await
        .expect("Failed to send");

    let forward: Vec<Event> = vec![m1.clone(), m2.clone()];
    let scrambled: Vec<Event> = vec![m2.clone(), m1.clone(), m2.clone()];

    let bob_report = bob_group
        .lock()
        .await
        .ingest(forward)
        .await
        .expect("Failed to ingest");
    let carol_report = carol_group
        .lock()
        .await
        .ingest(scrambled)
        .await
        .expect("Failed to ingest");

    assert_eq!(bob_report.rumors.len(), 2);
    assert_eq!(carol_report.rumors.len(), 2);

    let contents = |group: &GroupHandle| {
        let group = group.try_lock().expect("lock");
        let mut contents: Vec<String> = group
            .rumors(None, None)
            .expect("query")
            .into_iter()
            .map(|r| r.content)
            .collect();
        contents.sort();
        contents
    };
    assert_eq!(contents(bob_group), contents(carol_group));
    assert_eq!(
        bob_group.lock().await.epoch(),
        carol_group.lock().await.epoch()
    );

    // Both watermarks sit at the greatest cursor of the batch.
    let expected = EventCursor::from(&m1).max(EventCursor::from(&m2));
    assert_eq!(
        bob_group.lock().await.resume_cursor().expect("resume"),
        Some(expected)
    );
    assert_eq!(
        carol_group.lock().await.resume_cursor().expect("resume"),
        Some(expected)
    );
}
