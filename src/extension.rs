//! Marmot group data extension codec.
//!
//! Every Marmot group carries a group-context extension (type `0xF2EE`) with
//! the routing id, human-readable metadata, the admin set and relay hints.
//! The wire form is length-prefixed big-endian binary:
//!
//! ```text
//! u16 version            (= 1)
//! [u8; 32] nostr_group_id
//! u16-prefixed name      (UTF-8)
//! u16-prefixed description
//! u16 admin count, then per admin a u16-prefixed 64-char lowercase hex key
//! u16 relay count, then per relay a u16-prefixed ws:// or wss:// URL
//! u16-prefixed image_hash   (0 = absent, else exactly 32 bytes)
//! u16-prefixed image_key    (0 = absent, else exactly 32 bytes)
//! u16-prefixed image_nonce  (0 = absent, else exactly 12 bytes)
//! ```
//!
//! An absent image is three zero-length fields; a present image must fill all
//! three. A zero-filled image is therefore representable and distinct from an
//! absent one. The decoder works on plain byte slices, so data re-hydrated
//! from the middle of a larger envelope decodes identically.

use nostr::{PublicKey, RelayUrl};
use thiserror::Error;

use crate::constant::MARMOT_GROUP_DATA_VERSION;

/// Errors produced while encoding or decoding the group data extension.
#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("Extension data truncated")]
    Truncated,

    #[error("Trailing bytes after extension data")]
    TrailingBytes,

    #[error("Unsupported extension version: {0}")]
    UnsupportedVersion(u16),

    #[error("Invalid admin public key: {0}")]
    InvalidPubkey(String),

    #[error("Invalid relay URL: {0}")]
    InvalidRelayUrl(String),

    #[error("Invalid UTF-8 in {field}")]
    InvalidUtf8 { field: &'static str },

    #[error("Image field {field} has length {got}, expected {expected}")]
    InvalidImageLength {
        field: &'static str,
        got: usize,
        expected: usize,
    },

    #[error("Image fields must be all present or all absent")]
    PartialImage,

    #[error("Field {field} exceeds the u16 length prefix")]
    FieldTooLong { field: &'static str },
}

/// Encrypted group image reference: content hash plus the AEAD material
/// needed to decrypt the blob fetched out of band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupImage {
    pub hash: [u8; 32],
    pub key: [u8; 32],
    pub nonce: [u8; 12],
}

/// Decoded Marmot group data extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarmotGroupData {
    /// Wire version, currently always 1.
    pub version: u16,
    /// Routing id used in `h` tags. Distinct from the MLS group id and
    /// freshly random at group creation.
    pub nostr_group_id: [u8; 32],
    pub name: String,
    pub description: String,
    /// Nostr keys allowed to author commits.
    pub admins: Vec<PublicKey>,
    /// Relays the group publishes to.
    pub relays: Vec<RelayUrl>,
    pub image: Option<GroupImage>,
}

impl MarmotGroupData {
    pub fn new(
        nostr_group_id: [u8; 32],
        name: impl Into<String>,
        description: impl Into<String>,
        admins: Vec<PublicKey>,
        relays: Vec<RelayUrl>,
    ) -> Self {
        Self {
            version: MARMOT_GROUP_DATA_VERSION,
            nostr_group_id,
            name: name.into(),
            description: description.into(),
            admins,
            relays,
            image: None,
        }
    }

    /// True if `pubkey` may author commits for this group.
    pub fn is_admin(&self, pubkey: &PublicKey) -> bool {
        self.admins.contains(pubkey)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ExtensionError> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.nostr_group_id);
        put_prefixed(&mut out, "name", self.name.as_bytes())?;
        put_prefixed(&mut out, "description", self.description.as_bytes())?;

        put_count(&mut out, "admins", self.admins.len())?;
        for admin in &self.admins {
            put_prefixed(&mut out, "admin", admin.to_hex().as_bytes())?;
        }

        put_count(&mut out, "relays", self.relays.len())?;
        for relay in &self.relays {
            let url = relay.to_string();
            put_prefixed(&mut out, "relay", url.as_bytes())?;
        }

        match &self.image {
            Some(image) => {
                put_prefixed(&mut out, "image_hash", &image.hash)?;
                put_prefixed(&mut out, "image_key", &image.key)?;
                put_prefixed(&mut out, "image_nonce", &image.nonce)?;
            }
            None => {
                for _ in 0..3 {
                    out.extend_from_slice(&0u16.to_be_bytes());
                }
            }
        }

        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ExtensionError> {
        let mut reader = Reader::new(bytes);

        let version = reader.u16()?;
        if version != MARMOT_GROUP_DATA_VERSION {
            return Err(ExtensionError::UnsupportedVersion(version));
        }

        let mut nostr_group_id = [0u8; 32];
        nostr_group_id.copy_from_slice(reader.take(32)?);

        let name = reader.utf8("name")?;
        let description = reader.utf8("description")?;

        let admin_count = reader.u16()? as usize;
        let mut admins = Vec::with_capacity(admin_count);
        for _ in 0..admin_count {
            let raw = reader.utf8("admin")?;
            if raw.len() != 64 || raw.chars().any(|c| c.is_ascii_uppercase()) {
                return Err(ExtensionError::InvalidPubkey(raw));
            }
            let admin =
                PublicKey::from_hex(&raw).map_err(|_| ExtensionError::InvalidPubkey(raw))?;
            admins.push(admin);
        }

        let relay_count = reader.u16()? as usize;
        let mut relays = Vec::with_capacity(relay_count);
        for _ in 0..relay_count {
            let raw = reader.utf8("relay")?;
            if !raw.starts_with("wss://") && !raw.starts_with("ws://") {
                return Err(ExtensionError::InvalidRelayUrl(raw));
            }
            let relay =
                RelayUrl::parse(&raw).map_err(|_| ExtensionError::InvalidRelayUrl(raw))?;
            relays.push(relay);
        }

        let hash = reader.prefixed()?;
        let key = reader.prefixed()?;
        let nonce = reader.prefixed()?;
        let image = decode_image(hash, key, nonce)?;

        if !reader.is_empty() {
            return Err(ExtensionError::TrailingBytes);
        }

        Ok(Self {
            version,
            nostr_group_id,
            name,
            description,
            admins,
            relays,
            image,
        })
    }
}

fn decode_image(
    hash: &[u8],
    key: &[u8],
    nonce: &[u8],
) -> Result<Option<GroupImage>, ExtensionError> {
    if hash.is_empty() && key.is_empty() && nonce.is_empty() {
        return Ok(None);
    }
    if hash.is_empty() || key.is_empty() || nonce.is_empty() {
        return Err(ExtensionError::PartialImage);
    }
    let check = |field: &'static str, got: usize, expected: usize| {
        if got == expected {
            Ok(())
        } else {
            Err(ExtensionError::InvalidImageLength {
                field,
                got,
                expected,
            })
        }
    };
    check("image_hash", hash.len(), 32)?;
    check("image_key", key.len(), 32)?;
    check("image_nonce", nonce.len(), 12)?;

    let mut image = GroupImage {
        hash: [0u8; 32],
        key: [0u8; 32],
        nonce: [0u8; 12],
    };
    image.hash.copy_from_slice(hash);
    image.key.copy_from_slice(key);
    image.nonce.copy_from_slice(nonce);
    Ok(Some(image))
}

fn put_count(out: &mut Vec<u8>, field: &'static str, count: usize) -> Result<(), ExtensionError> {
    let count = u16::try_from(count).map_err(|_| ExtensionError::FieldTooLong { field })?;
    out.extend_from_slice(&count.to_be_bytes());
    Ok(())
}

fn put_prefixed(
    out: &mut Vec<u8>,
    field: &'static str,
    bytes: &[u8],
) -> Result<(), ExtensionError> {
    let len = u16::try_from(bytes.len()).map_err(|_| ExtensionError::FieldTooLong { field })?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

/// Bounds-checked big-endian reader over a byte slice.
struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ExtensionError> {
        if self.bytes.len() < n {
            return Err(ExtensionError::Truncated);
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    fn u16(&mut self) -> Result<u16, ExtensionError> {
        let raw = self.take(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    fn prefixed(&mut self) -> Result<&'a [u8], ExtensionError> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    fn utf8(&mut self, field: &'static str) -> Result<String, ExtensionError> {
        let raw = self.prefixed()?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| ExtensionError::InvalidUtf8 { field })
    }
}
