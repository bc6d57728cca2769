//! Storage abstraction for persisted group state, key packages and history.
//!
//! Backends are pluggable; the crate owns every byte format and hands the
//! backends opaque blobs. Use the memory backends for development and
//! testing, or implement the traits over a real database for persistence.
//!
//! # Thread Safety
//!
//! Implementations must be `Send + Sync`; internal synchronization is the
//! implementation's responsibility. `save` must be atomic per key.

mod memory;

pub use memory::{
    MemoryGroupStateStorage, MemoryHistoryFactory, MemoryHistoryStorage,
    MemoryKeyPackageStorage,
};

use std::sync::Arc;

use nostr::{EventId, UnsignedEvent};

use crate::cursor::EventCursor;

/// Storage operation errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Storage serialization error: {0}")]
    Serialization(String),

    #[error("Storage lock error: {0}")]
    Lock(String),
}

// ─────────────────────────── Group state ───────────────────────────

/// Persistence for MLS state snapshots, keyed by MLS group id.
///
/// Snapshot bytes are opaque to the backend.
pub trait GroupStateStorage: Send + Sync + 'static {
    fn load(&self, mls_group_id: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Atomically replace the snapshot for one group.
    fn save(&self, mls_group_id: &[u8], snapshot: &[u8]) -> Result<(), StoreError>;

    fn remove(&self, mls_group_id: &[u8]) -> Result<(), StoreError>;

    /// All stored group ids.
    fn list(&self) -> Result<Vec<Vec<u8>>, StoreError>;
}

// ─────────────────────────── Key packages ───────────────────────────

/// One locally generated key package: public half for serving, private half
/// for joining. The private half is opaque to the backend.
#[derive(Debug, Clone)]
pub struct KeyPackageRecord {
    /// 32-byte MLS hash reference; welcomes address packages by this.
    pub hash_ref: Vec<u8>,
    /// TLS serialization of the public key package.
    pub public_tls: Vec<u8>,
    /// Opaque private material needed to join from a welcome.
    pub private_state: Vec<u8>,
    /// Last-resort packages survive consumption and may be reused.
    pub last_resort: bool,
    /// Id of the kind-443 event this package was published as, hex.
    pub event_id: Option<String>,
}

/// Public listing entry: everything except the private half.
#[derive(Debug, Clone)]
pub struct KeyPackageListEntry {
    pub hash_ref: Vec<u8>,
    pub public_tls: Vec<u8>,
    pub last_resort: bool,
    pub event_id: Option<String>,
}

pub trait KeyPackageStorage: Send + Sync + 'static {
    fn save(&self, record: KeyPackageRecord) -> Result<(), StoreError>;

    fn load(&self, hash_ref: &[u8]) -> Result<Option<KeyPackageRecord>, StoreError>;

    fn remove(&self, hash_ref: &[u8]) -> Result<(), StoreError>;

    /// List refs and public halves only.
    fn list(&self) -> Result<Vec<KeyPackageListEntry>, StoreError>;
}

// ─────────────────────────── History ───────────────────────────

/// Per-group history backend: decrypted rumors plus the processed-event
/// watermark used to resume ingest.
///
/// All writes are idempotent; the resume cursor only moves forward.
pub trait HistoryStorage: Send + Sync + 'static {
    /// Append a rumor linked to its outer cursor.
    ///
    /// Returns false when a rumor with the same id is already stored.
    fn add_rumor(&self, rumor: &UnsignedEvent, outer: &EventCursor) -> Result<bool, StoreError>;

    /// Record an outer event as processed, advancing the resume watermark
    /// if `outer` is greater than the current one.
    ///
    /// Returns false when the event was already recorded.
    fn mark_processed(&self, outer: &EventCursor) -> Result<bool, StoreError>;

    fn is_processed(&self, outer_id: &EventId) -> Result<bool, StoreError>;

    /// Greatest processed outer cursor, if any.
    fn resume_cursor(&self) -> Result<Option<EventCursor>, StoreError>;

    /// Rumors newest-first by outer cursor; with `until`, strictly older
    /// than the given cursor.
    fn rumors(
        &self,
        until: Option<&EventCursor>,
        limit: Option<usize>,
    ) -> Result<Vec<UnsignedEvent>, StoreError>;

    /// Drop all history for this group.
    fn clear(&self) -> Result<(), StoreError>;
}

/// Opens per-group history backends on demand.
pub trait HistoryStorageFactory: Send + Sync + 'static {
    fn open(&self, mls_group_id: &[u8]) -> Result<Arc<dyn HistoryStorage>, StoreError>;

    /// Remove all history for a destroyed group.
    fn destroy(&self, mls_group_id: &[u8]) -> Result<(), StoreError>;
}
