//! Opaque snapshot format for persisted MLS state.
//!
//! The group-state store holds one blob per MLS group id. The blob is a
//! versioned JSON record of the raw OpenMLS storage entries plus the few
//! sidecar values the engine needs to resume: which signature key is ours
//! and the retained exporter-secret window. Backends never interpret it.

use std::collections::BTreeMap;

use openmls_rust_crypto::MemoryStorage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot serialization failed: {0}")]
    Serialization(String),

    #[error("Unsupported snapshot version: {0}")]
    UnsupportedVersion(u16),

    #[error("Snapshot contains invalid hex")]
    InvalidHex,

    #[error("Storage lock poisoned: {0}")]
    Lock(String),
}

const SNAPSHOT_VERSION: u16 = 1;

/// One persisted group: OpenMLS storage entries plus engine sidecar state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub version: u16,
    /// MLS group id, hex.
    pub mls_group_id: String,
    /// Our signature public key, hex; used to re-read the signer on load.
    pub signature_public_key: String,
    /// Retained exporter secrets, epoch -> hex secret.
    pub exporter_secrets: BTreeMap<u64, String>,
    /// Raw OpenMLS storage entries, hex key -> hex value, sorted by key.
    pub entries: Vec<(String, String)>,
}

impl GroupSnapshot {
    pub fn capture(
        storage: &MemoryStorage,
        mls_group_id: &[u8],
        signature_public_key: &[u8],
        exporter_secrets: &BTreeMap<u64, Vec<u8>>,
    ) -> Result<Self, SnapshotError> {
        Ok(Self {
            version: SNAPSHOT_VERSION,
            mls_group_id: hex::encode(mls_group_id),
            signature_public_key: hex::encode(signature_public_key),
            exporter_secrets: exporter_secrets
                .iter()
                .map(|(epoch, secret)| (*epoch, hex::encode(secret)))
                .collect(),
            entries: dump_entries(storage)?,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        serde_json::to_vec(self).map_err(|e| SnapshotError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let snapshot: Self = serde_json::from_slice(bytes)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(snapshot.version));
        }
        Ok(snapshot)
    }

    pub fn mls_group_id_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        hex::decode(&self.mls_group_id).map_err(|_| SnapshotError::InvalidHex)
    }

    pub fn signature_public_key_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        hex::decode(&self.signature_public_key).map_err(|_| SnapshotError::InvalidHex)
    }

    pub fn exporter_secrets_bytes(&self) -> Result<BTreeMap<u64, Vec<u8>>, SnapshotError> {
        self.exporter_secrets
            .iter()
            .map(|(epoch, secret)| {
                hex::decode(secret)
                    .map(|bytes| (*epoch, bytes))
                    .map_err(|_| SnapshotError::InvalidHex)
            })
            .collect()
    }

    /// Rebuild an OpenMLS storage from the captured entries.
    pub fn restore_storage(&self) -> Result<MemoryStorage, SnapshotError> {
        let storage = MemoryStorage::default();
        load_entries(&storage, &self.entries)?;
        Ok(storage)
    }
}

/// Dump a storage's raw entries as sorted hex pairs.
pub(crate) fn dump_entries(
    storage: &MemoryStorage,
) -> Result<Vec<(String, String)>, SnapshotError> {
    let values = storage
        .values
        .read()
        .map_err(|e| SnapshotError::Lock(e.to_string()))?;
    let mut entries: Vec<(String, String)> = values
        .iter()
        .map(|(k, v)| (hex::encode(k), hex::encode(v)))
        .collect();
    entries.sort();
    Ok(entries)
}

/// Load hex entry pairs into a storage.
pub(crate) fn load_entries(
    storage: &MemoryStorage,
    entries: &[(String, String)],
) -> Result<(), SnapshotError> {
    let mut values = storage
        .values
        .write()
        .map_err(|e| SnapshotError::Lock(e.to_string()))?;
    for (key, value) in entries {
        let key = hex::decode(key).map_err(|_| SnapshotError::InvalidHex)?;
        let value = hex::decode(value).map_err(|_| SnapshotError::InvalidHex)?;
        values.insert(key, value);
    }
    Ok(())
}

/// Private half of a generated key package, kept in the key-package store
/// until a welcome consumes it. Opaque to storage backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPackageSecrets {
    pub version: u16,
    /// Signature public key of the keypair bundled with this key package.
    pub signature_public_key: String,
    /// Raw OpenMLS storage entries holding the private material.
    pub entries: Vec<(String, String)>,
}

impl KeyPackageSecrets {
    pub fn capture(
        storage: &MemoryStorage,
        signature_public_key: &[u8],
    ) -> Result<Self, SnapshotError> {
        Ok(Self {
            version: SNAPSHOT_VERSION,
            signature_public_key: hex::encode(signature_public_key),
            entries: dump_entries(storage)?,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        serde_json::to_vec(self).map_err(|e| SnapshotError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let secrets: Self = serde_json::from_slice(bytes)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;
        if secrets.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(secrets.version));
        }
        Ok(secrets)
    }

    pub fn signature_public_key_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        hex::decode(&self.signature_public_key).map_err(|_| SnapshotError::InvalidHex)
    }

    pub fn restore_storage(&self) -> Result<MemoryStorage, SnapshotError> {
        let storage = MemoryStorage::default();
        load_entries(&storage, &self.entries)?;
        Ok(storage)
    }
}
