//! Key-package event codec (kind 443).
//!
//! A key-package event advertises an MLS key package so others can add its
//! owner to groups. The `content` is the TLS-serialized key package, base64
//! on publish, with the encoding declared by the `encoding` tag.

use nostr::{Event, Kind, RelayUrl, Tag, TagKind};
use openmls::prelude::{DeserializeBytes, KeyPackage, KeyPackageIn, ProtocolVersion};
use openmls_rust_crypto::RustCrypto;
use thiserror::Error;

use crate::encoding::{Encoding, EncodingError};
use crate::mls::policy::{self, PolicyError};

#[derive(Debug, Error)]
pub enum KeyPackageError {
    #[error("Wrong event kind: {0}")]
    WrongKind(Kind),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error("Key package decode failed: {0}")]
    DecodeFailed(String),

    #[error("Key package validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Credential(#[from] PolicyError),

    /// The basic-credential identity does not match the event author.
    #[error("Key package credential is not bound to the event author")]
    CredentialBindingMismatch,
}

/// Assemble the content and tags of a kind-443 event from the TLS bytes of
/// a freshly generated key package.
///
/// The tags advertise the relays the owner listens on plus the MLS version,
/// ciphersuite and extension set, so peers can check compatibility before
/// inviting.
pub fn build_event_content(key_package_tls: &[u8], relays: &[RelayUrl]) -> (String, Vec<Tag>) {
    let content = Encoding::Base64.encode(key_package_tls);
    let tags = vec![
        Tag::custom(
            TagKind::Relays,
            relays.iter().map(|r| r.to_string()).collect::<Vec<_>>(),
        ),
        Encoding::Base64.tag(),
        Tag::custom(TagKind::MlsProtocolVersion, ["1.0"]),
        Tag::custom(TagKind::MlsCiphersuite, ["0x0001"]),
        Tag::custom(TagKind::Custom("extensions".into()), ["0x000a", "0xf2ee"]),
    ];
    (content, tags)
}

/// Parse and validate a kind-443 event into a usable [`KeyPackage`].
///
/// Verifies the TLS structure, the key-package signature, and the binding
/// between the basic-credential identity and the event author.
pub fn parse_event(event: &Event, crypto: &RustCrypto) -> Result<KeyPackage, KeyPackageError> {
    if event.kind != Kind::MlsKeyPackage {
        return Err(KeyPackageError::WrongKind(event.kind));
    }
    let encoding = Encoding::from_tags(&event.tags)?;
    let bytes = encoding.decode(&event.content)?;

    let (key_package_in, _) = KeyPackageIn::tls_deserialize_bytes(&bytes)
        .map_err(|e| KeyPackageError::DecodeFailed(e.to_string()))?;
    let key_package = key_package_in
        .validate(crypto, ProtocolVersion::Mls10)
        .map_err(|e| KeyPackageError::Validation(e.to_string()))?;

    let owner = policy::pubkey_from_credential(key_package.leaf_node().credential())?;
    if owner != event.pubkey {
        return Err(KeyPackageError::CredentialBindingMismatch);
    }

    Ok(key_package)
}

/// Relay hints advertised on a key-package event.
pub fn relay_hints(event: &Event) -> Vec<RelayUrl> {
    event
        .tags
        .iter()
        .filter(|t| t.kind() == TagKind::Relays)
        .flat_map(|t| t.as_slice().iter().skip(1))
        .filter_map(|s| RelayUrl::parse(s).ok())
        .collect()
}
