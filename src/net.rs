//! Transport abstraction over Nostr relay pools.
//!
//! The crate never talks to relays itself; everything goes through
//! [`NostrTransport`]. Implement it over your relay pool of choice. The
//! built-in mock in the test suites is enough to exercise the whole
//! protocol without a network.

use async_trait::async_trait;
use nostr::{Alphabet, Event, Filter, Kind, PublicKey, RelayUrl, SingleLetterTag, Timestamp};
use tokio::sync::broadcast;

/// Errors originating from the transport layer.
///
/// String payloads carry the underlying relay error message. These are
/// human-readable but not structured; callers should treat them as opaque
/// diagnostic text, not match on their content.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Relay request failed: {0}")]
    RequestFailed(String),

    #[error("Relay request timed out")]
    RequestTimeout,

    #[error("An unknown error occurred: {0}")]
    Other(anyhow::Error),
}

/// Outcome of publishing one event to one relay.
#[derive(Debug, Clone)]
pub struct RelayAck {
    pub from: RelayUrl,
    pub ok: bool,
    pub message: Option<String>,
}

/// Per-relay outcomes of a publish.
#[derive(Debug, Clone, Default)]
pub struct PublishSummary {
    pub acks: Vec<RelayAck>,
}

impl PublishSummary {
    /// True when at least one relay accepted the event.
    pub fn acknowledged(&self) -> bool {
        self.acks.iter().any(|a| a.ok)
    }
}

/// Trait for relay-pool integrations.
///
/// # Implementation Requirements
///
/// - `publish` reports per-relay outcomes; an unreachable relay is a failed
///   ack, not an error, so long as any relay could be attempted
/// - `subscription` yields events as they arrive, without ordering or
///   deduplication guarantees (the group runtime handles both)
/// - All calls carry the implementation's own timeout policy; a timeout
///   surfaces as [`TransportError::RequestTimeout`]
#[async_trait]
pub trait NostrTransport: Send + Sync + 'static {
    /// One-shot historical query.
    async fn request(
        &self,
        relays: &[RelayUrl],
        filter: Filter,
    ) -> Result<Vec<Event>, TransportError>;

    /// Live feed for a filter.
    fn subscription(&self, relays: &[RelayUrl], filter: Filter) -> broadcast::Receiver<Event>;

    /// Publish an event, returning per-relay acknowledgements.
    async fn publish(
        &self,
        relays: &[RelayUrl],
        event: &Event,
    ) -> Result<PublishSummary, TransportError>;

    /// Inbox relays advertised by a user, for gift-wrap delivery.
    async fn user_inbox_relays(&self, pubkey: &PublicKey)
        -> Result<Vec<RelayUrl>, TransportError>;
}

/// Filter matching a group's kind-445 events.
///
/// `since` is coarse (second precision); callers must still drop events at
/// or below their resume cursor with the composite comparator.
pub fn group_messages_filter(nostr_group_id: &[u8; 32], since: Option<Timestamp>) -> Filter {
    let mut filter = Filter::new().kind(Kind::MlsGroupMessage).custom_tags(
        SingleLetterTag::lowercase(Alphabet::H),
        [hex::encode(nostr_group_id)],
    );
    if let Some(since) = since {
        filter = filter.since(since);
    }
    filter
}

/// Filter matching gift wraps addressed to `pubkey` (welcomes arrive here).
pub fn gift_wrap_filter(pubkey: &PublicKey) -> Filter {
    Filter::new().kind(Kind::GiftWrap).custom_tags(
        SingleLetterTag::lowercase(Alphabet::P),
        [pubkey.to_hex()],
    )
}
