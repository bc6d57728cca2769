//! Content-encoding dispatch for key-package and welcome payloads.
//!
//! The encoding is declared by an explicit `encoding` tag; decoders never
//! sniff content. Events published before the tag existed are hex, so an
//! absent tag selects hex.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use nostr::{Tag, TagKind, Tags};
use thiserror::Error;

use crate::constant::ENCODING_TAG;

#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("Unknown content encoding: {0}")]
    Unknown(String),

    #[error("Content decode failed: {0}")]
    DecodeFailed(String),
}

/// Content encoding of TLS payloads carried in event content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Base64,
    Hex,
}

impl Encoding {
    /// Read the `encoding` tag; an absent tag means legacy hex.
    pub fn from_tags(tags: &Tags) -> Result<Self, EncodingError> {
        match tags.find(TagKind::Custom(ENCODING_TAG.into())) {
            None => Ok(Encoding::Hex),
            Some(tag) => match tag.content() {
                Some("base64") => Ok(Encoding::Base64),
                Some("hex") => Ok(Encoding::Hex),
                other => Err(EncodingError::Unknown(other.unwrap_or_default().to_string())),
            },
        }
    }

    pub fn encode(&self, bytes: &[u8]) -> String {
        match self {
            Encoding::Base64 => BASE64.encode(bytes),
            Encoding::Hex => hex::encode(bytes),
        }
    }

    pub fn decode(&self, content: &str) -> Result<Vec<u8>, EncodingError> {
        match self {
            Encoding::Base64 => BASE64
                .decode(content)
                .map_err(|e| EncodingError::DecodeFailed(e.to_string())),
            Encoding::Hex => {
                hex::decode(content).map_err(|e| EncodingError::DecodeFailed(e.to_string()))
            }
        }
    }

    pub fn tag(&self) -> Tag {
        let value = match self {
            Encoding::Base64 => "base64",
            Encoding::Hex => "hex",
        };
        Tag::custom(TagKind::Custom(ENCODING_TAG.into()), [value])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_encoding_tag_means_hex() {
        let tags = Tags::from_list(vec![]);
        assert_eq!(
            Encoding::from_tags(&tags).expect("Failed to read encoding"),
            Encoding::Hex
        );
    }

    #[test]
    fn explicit_encoding_tags_are_honored() {
        for (value, expected) in [("base64", Encoding::Base64), ("hex", Encoding::Hex)] {
            let tags = Tags::from_list(vec![Tag::custom(
                TagKind::Custom(ENCODING_TAG.into()),
                [value],
            )]);
            assert_eq!(
                Encoding::from_tags(&tags).expect("Failed to read encoding"),
                expected
            );
        }
    }

    #[test]
    fn unknown_encoding_is_rejected_not_sniffed() {
        let tags = Tags::from_list(vec![Tag::custom(
            TagKind::Custom(ENCODING_TAG.into()),
            ["base32"],
        )]);
        assert!(matches!(
            Encoding::from_tags(&tags),
            Err(EncodingError::Unknown(_))
        ));
    }

    #[test]
    fn encode_decode_round_trip() {
        let bytes = b"\x00\x01binary\xff";
        for encoding in [Encoding::Base64, Encoding::Hex] {
            let text = encoding.encode(bytes);
            assert_eq!(
                encoding.decode(&text).expect("Failed to decode"),
                bytes.to_vec()
            );
        }
    }
}
