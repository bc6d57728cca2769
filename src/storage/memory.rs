//! In-memory storage backends.
//!
//! All data is lost on restart. Use a persistent implementation of the
//! storage traits for production use cases.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use nostr::{EventId, UnsignedEvent};

use super::{
    GroupStateStorage, HistoryStorage, HistoryStorageFactory, KeyPackageListEntry,
    KeyPackageRecord, KeyPackageStorage, StoreError,
};
use crate::cursor::EventCursor;

fn lock_err<T>(e: std::sync::PoisonError<T>) -> StoreError {
    StoreError::Lock(e.to_string())
}

/// In-memory group-state store.
#[derive(Default)]
pub struct MemoryGroupStateStorage {
    snapshots: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryGroupStateStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GroupStateStorage for MemoryGroupStateStorage {
    fn load(&self, mls_group_id: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .snapshots
            .read()
            .map_err(lock_err)?
            .get(mls_group_id)
            .cloned())
    }

    fn save(&self, mls_group_id: &[u8], snapshot: &[u8]) -> Result<(), StoreError> {
        self.snapshots
            .write()
            .map_err(lock_err)?
            .insert(mls_group_id.to_vec(), snapshot.to_vec());
        Ok(())
    }

    fn remove(&self, mls_group_id: &[u8]) -> Result<(), StoreError> {
        self.snapshots.write().map_err(lock_err)?.remove(mls_group_id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<Vec<u8>>, StoreError> {
        Ok(self
            .snapshots
            .read()
            .map_err(lock_err)?
            .keys()
            .cloned()
            .collect())
    }
}

/// In-memory key-package store.
#[derive(Default)]
pub struct MemoryKeyPackageStorage {
    records: RwLock<HashMap<Vec<u8>, KeyPackageRecord>>,
}

impl MemoryKeyPackageStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyPackageStorage for MemoryKeyPackageStorage {
    fn save(&self, record: KeyPackageRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .map_err(lock_err)?
            .insert(record.hash_ref.clone(), record);
        Ok(())
    }

    fn load(&self, hash_ref: &[u8]) -> Result<Option<KeyPackageRecord>, StoreError> {
        Ok(self.records.read().map_err(lock_err)?.get(hash_ref).cloned())
    }

    fn remove(&self, hash_ref: &[u8]) -> Result<(), StoreError> {
        self.records.write().map_err(lock_err)?.remove(hash_ref);
        Ok(())
    }

    fn list(&self) -> Result<Vec<KeyPackageListEntry>, StoreError> {
        Ok(self
            .records
            .read()
            .map_err(lock_err)?
            .values()
            .map(|r| KeyPackageListEntry {
                hash_ref: r.hash_ref.clone(),
                public_tls: r.public_tls.clone(),
                last_resort: r.last_resort,
                event_id: r.event_id.clone(),
            })
            .collect())
    }
}

#[derive(Default)]
struct HistoryInner {
    /// Rumors keyed by the outer cursor they arrived under.
    rumors: BTreeMap<EventCursor, UnsignedEvent>,
    /// Rumor ids already stored, for idempotency.
    rumor_ids: HashSet<EventId>,
    /// Outer event ids already processed.
    processed: HashSet<EventId>,
    /// Greatest processed outer cursor.
    watermark: Option<EventCursor>,
}

/// In-memory per-group history store.
#[derive(Default)]
pub struct MemoryHistoryStorage {
    inner: RwLock<HistoryInner>,
}

impl MemoryHistoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStorage for MemoryHistoryStorage {
    fn add_rumor(&self, rumor: &UnsignedEvent, outer: &EventCursor) -> Result<bool, StoreError> {
        let rumor_id = rumor
            .id
            .ok_or_else(|| StoreError::Serialization("rumor without id".into()))?;
        let mut inner = self.inner.write().map_err(lock_err)?;
        if !inner.rumor_ids.insert(rumor_id) {
            return Ok(false);
        }
        inner.rumors.insert(*outer, rumor.clone());
        Ok(true)
    }

    fn mark_processed(&self, outer: &EventCursor) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().map_err(lock_err)?;
        if !inner.processed.insert(outer.id) {
            return Ok(false);
        }
        if inner.watermark.is_none_or(|current| *outer > current) {
            inner.watermark = Some(*outer);
        }
        Ok(true)
    }

    fn is_processed(&self, outer_id: &EventId) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .read()
            .map_err(lock_err)?
            .processed
            .contains(outer_id))
    }

    fn resume_cursor(&self) -> Result<Option<EventCursor>, StoreError> {
        Ok(self.inner.read().map_err(lock_err)?.watermark)
    }

    fn rumors(
        &self,
        until: Option<&EventCursor>,
        limit: Option<usize>,
    ) -> Result<Vec<UnsignedEvent>, StoreError> {
        let inner = self.inner.read().map_err(lock_err)?;
        let page = inner
            .rumors
            .iter()
            .rev()
            .filter(|(cursor, _)| until.is_none_or(|u| *cursor < u))
            .map(|(_, rumor)| rumor.clone())
            .take(limit.unwrap_or(usize::MAX));
        Ok(page.collect())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(lock_err)?;
        *inner = HistoryInner::default();
        Ok(())
    }
}

/// Factory handing out one [`MemoryHistoryStorage`] per group.
#[derive(Default)]
pub struct MemoryHistoryFactory {
    stores: RwLock<HashMap<Vec<u8>, Arc<MemoryHistoryStorage>>>,
}

impl MemoryHistoryFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStorageFactory for MemoryHistoryFactory {
    fn open(&self, mls_group_id: &[u8]) -> Result<Arc<dyn HistoryStorage>, StoreError> {
        let mut stores = self.stores.write().map_err(lock_err)?;
        let store = stores
            .entry(mls_group_id.to_vec())
            .or_insert_with(|| Arc::new(MemoryHistoryStorage::new()));
        Ok(store.clone())
    }

    fn destroy(&self, mls_group_id: &[u8]) -> Result<(), StoreError> {
        self.stores.write().map_err(lock_err)?.remove(mls_group_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{Keys, Kind, Timestamp};

    fn cursor(ts: u64, id_byte: u8) -> EventCursor {
        let mut id = [0u8; 32];
        id[0] = id_byte;
        EventCursor::new(
            Timestamp::from(ts),
            EventId::from_slice(&id).expect("event id"),
        )
    }

    fn rumor(content: &str) -> UnsignedEvent {
        let keys = Keys::generate();
        let mut rumor = UnsignedEvent::new(
            keys.public_key(),
            Timestamp::from(100),
            Kind::Custom(9),
            [],
            content,
        );
        rumor.ensure_id();
        rumor
    }

    #[test]
    fn add_rumor_is_idempotent_on_rumor_id() {
        let store = MemoryHistoryStorage::new();
        let r = rumor("once");
        assert!(store.add_rumor(&r, &cursor(1, 1)).expect("add"));
        assert!(!store.add_rumor(&r, &cursor(1, 1)).expect("re-add"));
        assert_eq!(store.rumors(None, None).expect("query").len(), 1);
    }

    #[test]
    fn watermark_is_monotonic() {
        let store = MemoryHistoryStorage::new();
        assert!(store.mark_processed(&cursor(10, 2)).expect("mark"));
        assert!(store.mark_processed(&cursor(5, 1)).expect("mark older"));
        // An older cursor never rewinds the watermark.
        assert_eq!(store.resume_cursor().expect("resume"), Some(cursor(10, 2)));
        assert!(store.mark_processed(&cursor(10, 3)).expect("mark tie"));
        assert_eq!(store.resume_cursor().expect("resume"), Some(cursor(10, 3)));
    }

    #[test]
    fn mark_processed_is_idempotent() {
        let store = MemoryHistoryStorage::new();
        assert!(store.mark_processed(&cursor(7, 7)).expect("mark"));
        assert!(!store.mark_processed(&cursor(7, 7)).expect("re-mark"));
        assert!(store.is_processed(&cursor(7, 7).id).expect("lookup"));
    }

    #[test]
    fn query_pages_newest_first_with_strict_until() {
        let store = MemoryHistoryStorage::new();
        let (a, b, c) = (rumor("a"), rumor("b"), rumor("c"));
        store.add_rumor(&a, &cursor(1, 1)).expect("add");
        store.add_rumor(&b, &cursor(2, 1)).expect("add");
        store.add_rumor(&c, &cursor(3, 1)).expect("add");

        let newest = store.rumors(None, Some(2)).expect("query");
        assert_eq!(newest[0].content, "c");
        assert_eq!(newest[1].content, "b");

        let older = store.rumors(Some(&cursor(2, 1)), None).expect("query");
        assert_eq!(older.len(), 1);
        assert_eq!(older[0].content, "a");
    }

    #[test]
    fn factory_reuses_per_group_stores() {
        let factory = MemoryHistoryFactory::new();
        let first = factory.open(b"group").expect("open");
        first
            .add_rumor(&rumor("kept"), &cursor(1, 1))
            .expect("add");
        let second = factory.open(b"group").expect("reopen");
        assert_eq!(second.rumors(None, None).expect("query").len(), 1);
    }
}
