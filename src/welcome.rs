//! Welcome rumor codec and gift-wrap transport (kind 444 inside kind 1059).
//!
//! A welcome lets a newly added member derive the group's epoch secrets. The
//! welcome rumor is never signed: it travels to the invitee inside a
//! sender-anonymizing gift wrap addressed to their identity key. Tags carry
//! the group's relay hints and the id of the key-package event the welcome
//! consumes, so the joiner knows which local key package to rotate.

use nostr::{
    Event, EventBuilder, EventId, Kind, NostrSigner, PublicKey, RelayUrl, Tag, TagKind, Timestamp,
    UnsignedEvent,
};
use thiserror::Error;

use crate::encoding::{Encoding, EncodingError};

#[derive(Debug, Error)]
pub enum WelcomeError {
    #[error("Wrong rumor kind: {0}")]
    WrongKind(Kind),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error("Gift wrap failed: {0}")]
    GiftWrap(String),

    #[error("Gift unwrap failed: {0}")]
    GiftUnwrap(String),
}

/// Parsed kind-444 rumor.
#[derive(Debug, Clone)]
pub struct ParsedWelcome {
    /// TLS-serialized MLS welcome message.
    pub welcome_bytes: Vec<u8>,
    /// Id of the key-package event this welcome consumes, if referenced.
    pub key_package_event_id: Option<EventId>,
    /// Relay hints for the group the invitee is joining.
    pub relays: Vec<RelayUrl>,
}

/// Build a kind-444 welcome rumor for one invitee.
pub fn build_rumor(
    sender: PublicKey,
    welcome_tls: &[u8],
    key_package_event_id: EventId,
    relays: &[RelayUrl],
) -> UnsignedEvent {
    let tags = vec![
        Tag::event(key_package_event_id),
        Tag::custom(
            TagKind::Relays,
            relays.iter().map(|r| r.to_string()).collect::<Vec<_>>(),
        ),
        Encoding::Base64.tag(),
    ];
    let mut rumor = UnsignedEvent::new(
        sender,
        Timestamp::now(),
        Kind::MlsWelcome,
        tags,
        Encoding::Base64.encode(welcome_tls),
    );
    rumor.ensure_id();
    rumor
}

/// Parse a kind-444 rumor into its welcome bytes and routing hints.
pub fn parse_rumor(rumor: &UnsignedEvent) -> Result<ParsedWelcome, WelcomeError> {
    if rumor.kind != Kind::MlsWelcome {
        return Err(WelcomeError::WrongKind(rumor.kind));
    }

    let encoding = Encoding::from_tags(&rumor.tags)?;
    let welcome_bytes = encoding.decode(&rumor.content)?;

    let key_package_event_id = rumor
        .tags
        .find(TagKind::e())
        .and_then(Tag::content)
        .and_then(|s| EventId::from_hex(s).ok());

    let relays = rumor
        .tags
        .iter()
        .filter(|t| t.kind() == TagKind::Relays)
        .flat_map(|t| t.as_slice().iter().skip(1))
        .filter_map(|s| RelayUrl::parse(s).ok())
        .collect();

    Ok(ParsedWelcome {
        welcome_bytes,
        key_package_event_id,
        relays,
    })
}

/// Wrap a welcome rumor in a kind-1059 gift wrap addressed to the invitee.
pub async fn gift_wrap(
    signer: &impl NostrSigner,
    invitee: &PublicKey,
    rumor: UnsignedEvent,
) -> Result<Event, WelcomeError> {
    EventBuilder::gift_wrap(signer, invitee, rumor, Vec::<Tag>::new())
        .await
        .map_err(|e| WelcomeError::GiftWrap(e.to_string()))
}

/// Unwrap a received gift wrap, returning the sender and the inner rumor.
///
/// The rumor kind is not checked here; callers route on it (welcomes are the
/// only kind this crate consumes out of gift wraps).
pub async fn unwrap_gift_wrap(
    signer: &impl NostrSigner,
    wrapper: &Event,
) -> Result<(PublicKey, UnsignedEvent), WelcomeError> {
    let unwrapped = nostr::nips::nip59::UnwrappedGift::from_gift_wrap(signer, wrapper)
        .await
        .map_err(|e| WelcomeError::GiftUnwrap(e.to_string()))?;
    Ok((unwrapped.sender, unwrapped.rumor))
}
