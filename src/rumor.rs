//! Application rumor codec.
//!
//! The MLS application payload is an unsigned Nostr event ("rumor") carried
//! as canonical JSON. Rumors are never signed; membership in the group plus
//! the MLS sender authentication replace the Schnorr signature. The id still
//! binds the payload: serialization requires it and deserialization verifies
//! it against the recomputed hash.

use nostr::{EventId, JsonUtil, UnsignedEvent};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RumorError {
    #[error("Rumor JSON decode failed: {0}")]
    DecodeFailed(String),

    #[error("Rumor carries a signature")]
    SignaturePresent,

    #[error("Rumor id missing; call ensure_id before sending")]
    MissingId,

    #[error("Rumor id does not match its content")]
    IdMismatch,
}

/// Serialize a rumor to its canonical JSON bytes.
///
/// The rumor must already carry its id (`UnsignedEvent::ensure_id`). The
/// type system guarantees no signature is attached.
pub fn serialize(rumor: &UnsignedEvent) -> Result<Vec<u8>, RumorError> {
    if rumor.id.is_none() {
        return Err(RumorError::MissingId);
    }
    Ok(rumor.as_json().into_bytes())
}

/// Parse rumor bytes back into an unsigned event.
///
/// Rejects payloads that smuggle a `sig` member and payloads whose id does
/// not equal the hash of the canonical form.
pub fn deserialize(bytes: &[u8]) -> Result<UnsignedEvent, RumorError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| RumorError::DecodeFailed(e.to_string()))?;
    if value.get("sig").is_some() {
        return Err(RumorError::SignaturePresent);
    }

    let rumor = UnsignedEvent::from_json(bytes)
        .map_err(|e| RumorError::DecodeFailed(e.to_string()))?;
    let id = rumor.id.ok_or(RumorError::MissingId)?;

    let expected = EventId::new(
        &rumor.pubkey,
        &rumor.created_at,
        &rumor.kind,
        &rumor.tags,
        &rumor.content,
    );
    if id != expected {
        return Err(RumorError::IdMismatch);
    }

    Ok(rumor)
}
