//! Outer envelope codec for group events (kind 445).
//!
//! The TLS-serialized MLS message is sealed with NIP-44 under a conversation
//! key derived from the current epoch's exporter secret and the group's
//! routing id, then published as an event signed by a throwaway keypair.
//! Nothing on the outside links the event to a member: the signer is fresh
//! per event and the only routing information is the `h` tag.

use nostr::nips::nip44;
use nostr::{Event, EventBuilder, Keys, Kind, SecretKey, Tag, TagKind};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Wrong event kind: {0}")]
    WrongKind(Kind),

    #[error("Missing h routing tag")]
    MissingRoutingTag,

    #[error("Routing tag does not match this group")]
    RoutingMismatch,

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// No exporter secret in the retained window opens this envelope.
    #[error("Envelope cannot be decrypted with any retained epoch secret")]
    DecryptFailed,

    #[error("Exporter secret is not a usable conversation key")]
    InvalidConversationKey,
}

/// Derive the NIP-44 conversation keypair for one epoch of one group.
///
/// The exporter secret is hashed together with the routing id into a
/// secret key, and the payload is encrypted to that key's own public key.
/// Every member derives the identical keypair; the key is bound to both
/// the epoch and the group without requiring the routing id to be a curve
/// point.
fn conversation_keys(
    exporter_secret: &[u8],
    nostr_group_id: &[u8; 32],
) -> Result<Keys, EnvelopeError> {
    let mut hasher = Sha256::new();
    hasher.update(exporter_secret);
    hasher.update(nostr_group_id);
    let secret = SecretKey::from_slice(&hasher.finalize())
        .map_err(|_| EnvelopeError::InvalidConversationKey)?;
    Ok(Keys::new(secret))
}

/// Seal an MLS message into a signed kind-445 event.
///
/// A fresh ephemeral keypair signs every envelope; it is dropped immediately
/// after signing and never reused.
pub fn seal(
    nostr_group_id: &[u8; 32],
    exporter_secret: &[u8],
    message: &[u8],
) -> Result<Event, EnvelopeError> {
    let keys = conversation_keys(exporter_secret, nostr_group_id)?;
    let content = nip44::encrypt(
        keys.secret_key(),
        &keys.public_key(),
        message,
        nip44::Version::V2,
    )
    .map_err(|e| EnvelopeError::MalformedEnvelope(e.to_string()))?;

    let ephemeral = Keys::generate();
    EventBuilder::new(Kind::MlsGroupMessage, content)
        .tags([Tag::custom(TagKind::h(), [hex::encode(nostr_group_id)])])
        .sign_with_keys(&ephemeral)
        .map_err(|e| EnvelopeError::MalformedEnvelope(e.to_string()))
}

/// Open a kind-445 event, trying each `(epoch, exporter_secret)` candidate
/// in the order given (callers pass newest epoch first).
///
/// Returns the epoch whose secret opened the envelope together with the
/// recovered MLS message bytes. [`EnvelopeError::DecryptFailed`] means every
/// candidate failed — an epoch mismatch at time of receipt, not necessarily
/// a permanent failure.
pub fn open<'a, I>(
    event: &Event,
    nostr_group_id: &[u8; 32],
    secrets: I,
) -> Result<(u64, Vec<u8>), EnvelopeError>
where
    I: IntoIterator<Item = (u64, &'a [u8])>,
{
    if event.kind != Kind::MlsGroupMessage {
        return Err(EnvelopeError::WrongKind(event.kind));
    }
    let tag = event
        .tags
        .find(TagKind::h())
        .ok_or(EnvelopeError::MissingRoutingTag)?;
    let routed_to = tag.content().ok_or(EnvelopeError::MissingRoutingTag)?;
    if routed_to != hex::encode(nostr_group_id) {
        return Err(EnvelopeError::RoutingMismatch);
    }

    for (epoch, exporter_secret) in secrets {
        let keys = match conversation_keys(exporter_secret, nostr_group_id) {
            Ok(keys) => keys,
            Err(_) => continue,
        };
        if let Ok(plaintext) =
            nip44::decrypt_to_bytes(keys.secret_key(), &keys.public_key(), &event.content)
        {
            return Ok((epoch, plaintext));
        }
    }
    Err(EnvelopeError::DecryptFailed)
}
