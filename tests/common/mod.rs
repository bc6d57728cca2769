//! Shared test fixtures: an in-process relay mock and client builders.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nostr::{Event, Filter, Keys, PublicKey, RelayUrl};
use tokio::sync::broadcast;

use marmot_mls::net::{NostrTransport, PublishSummary, RelayAck, TransportError};
use marmot_mls::prelude::*;
use marmot_mls::storage::{
    MemoryGroupStateStorage, MemoryHistoryFactory, MemoryKeyPackageStorage,
};

/// Records every publish and answers requests from what was published.
pub struct MockRelay {
    published: Mutex<Vec<(Vec<RelayUrl>, Event)>>,
    inbox_relays: Mutex<HashMap<PublicKey, Vec<RelayUrl>>>,
    acks: AtomicBool,
    live: broadcast::Sender<Event>,
}

impl MockRelay {
    pub fn new() -> Arc<Self> {
        let (live, _) = broadcast::channel(64);
        Arc::new(Self {
            published: Mutex::new(Vec::new()),
            inbox_relays: Mutex::new(HashMap::new()),
            acks: AtomicBool::new(true),
            live,
        })
    }

    /// Make every subsequent publish fail (no relay acks).
    pub fn refuse_acks(&self) {
        self.acks.store(false, Ordering::SeqCst);
    }

    pub fn accept_acks(&self) {
        self.acks.store(true, Ordering::SeqCst);
    }

    /// All published events, oldest first.
    pub fn published(&self) -> Vec<Event> {
        self.published
            .lock()
            .expect("published lock")
            .iter()
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn set_inbox_relays(&self, pubkey: PublicKey, relays: Vec<RelayUrl>) {
        self.inbox_relays
            .lock()
            .expect("inbox lock")
            .insert(pubkey, relays);
    }
}

#[async_trait]
impl NostrTransport for MockRelay {
    async fn request(
        &self,
        _relays: &[RelayUrl],
        filter: Filter,
    ) -> std::result::Result<Vec<Event>, TransportError> {
        Ok(self
            .published
            .lock()
            .expect("published lock")
            .iter()
            .map(|(_, e)| e.clone())
            .filter(|e| filter.match_event(e))
            .collect())
    }

    fn subscription(&self, _relays: &[RelayUrl], _filter: Filter) -> broadcast::Receiver<Event> {
        self.live.subscribe()
    }

    async fn publish(
        &self,
        relays: &[RelayUrl],
        event: &Event,
    ) -> std::result::Result<PublishSummary, TransportError> {
        let ok = self.acks.load(Ordering::SeqCst);
        if ok {
            self.published
                .lock()
                .expect("published lock")
                .push((relays.to_vec(), event.clone()));
            let _ = self.live.send(event.clone());
        }
        let acks = relays
            .iter()
            .map(|r| RelayAck {
                from: r.clone(),
                ok,
                message: (!ok).then(|| "refused".to_string()),
            })
            .collect();
        Ok(PublishSummary { acks })
    }

    async fn user_inbox_relays(
        &self,
        pubkey: &PublicKey,
    ) -> std::result::Result<Vec<RelayUrl>, TransportError> {
        Ok(self
            .inbox_relays
            .lock()
            .expect("inbox lock")
            .get(pubkey)
            .cloned()
            .unwrap_or_default())
    }
}

/// One test identity: keys, stores, and a client wired to the shared relay.
pub struct TestPeer {
    pub keys: Keys,
    pub client: MarmotClient,
    pub group_store: Arc<MemoryGroupStateStorage>,
}

impl TestPeer {
    pub fn new(relay: Arc<MockRelay>) -> Self {
        let keys = Keys::generate();
        let group_store = Arc::new(MemoryGroupStateStorage::new());
        let client = MarmotClient::new(
            Arc::new(keys.clone()),
            relay,
            group_store.clone(),
            Arc::new(MemoryKeyPackageStorage::new()),
            Arc::new(MemoryHistoryFactory::new()),
            ClientConfig::default(),
        );
        Self {
            keys,
            client,
            group_store,
        }
    }

    pub fn pubkey(&self) -> PublicKey {
        self.keys.public_key()
    }
}

pub fn relay_url() -> RelayUrl {
    RelayUrl::parse("wss://relay.example.com").expect("Failed to parse relay url")
}

/// Find and unwrap the gift-wrapped welcome addressed to `peer`.
pub async fn welcome_rumor_for(peer: &TestPeer, relay: &MockRelay) -> nostr::UnsignedEvent {
    for event in relay.published() {
        if event.kind != nostr::Kind::GiftWrap {
            continue;
        }
        if let Ok((_sender, rumor)) = peer.client.unwrap_gift_wrap(&event).await {
            return rumor;
        }
    }
    panic!("no gift wrap addressed to this peer");
}
