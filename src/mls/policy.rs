//! Admin policy: maps MLS credentials to Nostr keys and gates commits.
//!
//! Only commits authored under a credential whose Nostr key is in the
//! group's admin set may advance the group. The check runs between
//! processing a handshake message and merging its staged commit, so a
//! rejection leaves the epoch, ratchet tree and history untouched.

use nostr::PublicKey;
use openmls::prelude::{BasicCredential, Credential};
use thiserror::Error;

use crate::extension::MarmotGroupData;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Only basic credentials are supported")]
    UnsupportedCredentialType,

    #[error("Credential identity is not a valid public key")]
    InvalidPubkey,

    #[error("{0} is not an admin of this group")]
    NotAdmin(PublicKey),
}

/// Extract a Nostr public key from a basic-credential identity.
///
/// Identities are 32 raw key bytes. Early clients stored the 64-character
/// hex rendering as UTF-8 instead; those are still accepted.
pub fn pubkey_from_identity(identity: &[u8]) -> Result<PublicKey, PolicyError> {
    if identity.len() == 32 {
        return PublicKey::from_slice(identity).map_err(|_| PolicyError::InvalidPubkey);
    }
    if identity.len() == 64 {
        if let Ok(hex_str) = std::str::from_utf8(identity) {
            return PublicKey::from_hex(hex_str).map_err(|_| PolicyError::InvalidPubkey);
        }
    }
    Err(PolicyError::InvalidPubkey)
}

/// Extract the Nostr key from any [`Credential`], rejecting non-basic types.
pub fn pubkey_from_credential(credential: &Credential) -> Result<PublicKey, PolicyError> {
    let basic = BasicCredential::try_from(credential.clone())
        .map_err(|_| PolicyError::UnsupportedCredentialType)?;
    pubkey_from_identity(basic.identity())
}

/// Decide whether a commit authored under `credential` may advance a group
/// whose current extension state is `group_data`.
///
/// Returns the author's key on acceptance so callers can log it.
pub fn authorize_commit(
    credential: &Credential,
    group_data: &MarmotGroupData,
) -> Result<PublicKey, PolicyError> {
    let author = pubkey_from_credential(credential)?;
    if group_data.is_admin(&author) {
        Ok(author)
    } else {
        Err(PolicyError::NotAdmin(author))
    }
}
