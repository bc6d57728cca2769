//! Protocol constants for Marmot groups.

use openmls::prelude::{Ciphersuite, ExtensionType};

/// Marmot group data extension type.
pub const MARMOT_GROUP_DATA_EXTENSION_TYPE: u16 = 0xF2EE;

/// Current wire version of the Marmot group data extension.
pub const MARMOT_GROUP_DATA_VERSION: u16 = 1;

/// Default ciphersuite for Marmot groups.
/// This is also the only required ciphersuite for Marmot groups.
pub const DEFAULT_CIPHERSUITE: Ciphersuite =
    Ciphersuite::MLS_128_DHKEMX25519_AES128GCM_SHA256_Ed25519;

/// Extensions that clients advertise support for in their KeyPackage capabilities.
///
/// Per RFC 9420 Section 7.2 only non-default extensions are listed. LastResort
/// is included because OpenMLS requires KeyPackage-level extensions to be
/// declared in capabilities for validation.
pub const SUPPORTED_EXTENSIONS: [ExtensionType; 2] = [
    ExtensionType::LastResort,
    ExtensionType::Unknown(MARMOT_GROUP_DATA_EXTENSION_TYPE),
];

/// Extensions required in the GroupContext RequiredCapabilities extension.
///
/// All group members must support the Marmot group data extension so they can
/// read routing ids, relay hints and the admin set.
pub const GROUP_CONTEXT_REQUIRED_EXTENSIONS: [ExtensionType; 1] =
    [ExtensionType::Unknown(MARMOT_GROUP_DATA_EXTENSION_TYPE)];

/// Label handed to the MLS exporter when deriving the transport key.
pub const EXPORTER_LABEL: &str = "nostr";

/// Context handed to the MLS exporter when deriving the transport key.
pub const EXPORTER_CONTEXT: &[u8] = b"nostr";

/// Length in bytes of the exported transport secret.
pub const EXPORTER_SECRET_LENGTH: usize = 32;

/// How many past epochs of exporter secrets are retained by default.
///
/// Late-arriving envelopes sealed under an epoch older than this window are
/// permanently unreadable.
pub const DEFAULT_EXPORTER_WINDOW: u64 = 5;

/// How many times an unreadable event is retried during a single ingest
/// batch before it is recorded as permanently unreadable.
pub const DEFAULT_MAX_UNREADABLE_RETRIES: u32 = 3;

/// Tag name declaring the content encoding of key-package and welcome events.
pub const ENCODING_TAG: &str = "encoding";
