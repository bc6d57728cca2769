//! Crate-level error type.

use nostr::PublicKey;
use thiserror::Error;

use crate::encoding::EncodingError;
use crate::envelope::EnvelopeError;
use crate::extension::ExtensionError;
use crate::key_package::KeyPackageError;
use crate::mls::policy::PolicyError;
use crate::mls::MlsEngineError;
use crate::net::TransportError;
use crate::rumor::RumorError;
use crate::storage::StoreError;
use crate::welcome::WelcomeError;

/// Result type alias for crate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by group and client operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Extension(#[from] ExtensionError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Rumor(#[from] RumorError),

    #[error(transparent)]
    KeyPackage(#[from] KeyPackageError),

    #[error(transparent)]
    Welcome(#[from] WelcomeError),

    #[error(transparent)]
    Mls(#[from] MlsEngineError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Signer error: {0}")]
    Signer(String),

    /// The caller's key is not in the group's admin set.
    #[error("{0} is not an admin of this group")]
    NotAdmin(PublicKey),

    /// No relay acknowledged the commit envelope; the pending commit was
    /// rolled back and the group did not advance.
    #[error("No relay acknowledged the event")]
    NoRelayAck,

    /// No local key package opens this welcome.
    #[error("No local key package matches this welcome")]
    WelcomeUnmatched { last_error: Option<String> },

    #[error("No stored key package matches the referenced event")]
    NoMatchingKeyPackageEvent,

    #[error("Group already exists")]
    GroupAlreadyExists,

    #[error("Group not found")]
    GroupNotFound,
}
