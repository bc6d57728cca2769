//! Per-group message history with live subscriptions.
//!
//! Wraps a [`HistoryStorage`] backend and adds the live feed: subscribers
//! receive a record only after the backend write has returned, so an emitted
//! rumor is always durably persisted. Nothing is ever emitted for a
//! duplicate.

use std::sync::Arc;

use nostr::UnsignedEvent;
use tokio::sync::broadcast;
use tracing::debug;

use crate::cursor::EventCursor;
use crate::storage::{HistoryStorage, StoreError};

/// A persisted rumor together with the outer cursor it arrived under.
#[derive(Debug, Clone)]
pub struct RumorRecord {
    pub rumor: UnsignedEvent,
    pub outer: EventCursor,
}

const LIVE_CHANNEL_CAPACITY: usize = 256;

/// History of one group: durable rumor log, processed watermark, live feed.
pub struct MessageHistory {
    backend: Arc<dyn HistoryStorage>,
    live: broadcast::Sender<RumorRecord>,
}

impl MessageHistory {
    pub fn new(backend: Arc<dyn HistoryStorage>) -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self { backend, live }
    }

    /// Persist a rumor and, if it is new, emit it to live subscribers.
    ///
    /// Returns false for duplicates (idempotent on rumor id).
    pub fn record_rumor(
        &self,
        rumor: &UnsignedEvent,
        outer: &EventCursor,
    ) -> Result<bool, StoreError> {
        let inserted = self.backend.add_rumor(rumor, outer)?;
        if inserted {
            // Emit strictly after the durable write; a lagging or absent
            // subscriber is not an error.
            let _ = self.live.send(RumorRecord {
                rumor: rumor.clone(),
                outer: *outer,
            });
        } else {
            debug!(outer = %outer, "duplicate rumor ignored");
        }
        Ok(inserted)
    }

    /// Record an outer event as processed; the watermark never rewinds.
    pub fn mark_processed(&self, outer: &EventCursor) -> Result<bool, StoreError> {
        self.backend.mark_processed(outer)
    }

    pub fn is_processed(&self, outer_id: &nostr::EventId) -> Result<bool, StoreError> {
        self.backend.is_processed(outer_id)
    }

    /// Greatest processed outer cursor; the point to resume fetching from.
    pub fn resume_cursor(&self) -> Result<Option<EventCursor>, StoreError> {
        self.backend.resume_cursor()
    }

    /// Page through stored rumors, newest first. With `until`, only rumors
    /// strictly older than the cursor are returned.
    pub fn rumors(
        &self,
        until: Option<&EventCursor>,
        limit: Option<usize>,
    ) -> Result<Vec<UnsignedEvent>, StoreError> {
        self.backend.rumors(until, limit)
    }

    /// Subscribe to rumors as they are persisted.
    pub fn subscribe(&self) -> broadcast::Receiver<RumorRecord> {
        self.live.subscribe()
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.backend.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryHistoryStorage;
    use nostr::{EventId, Keys, Kind, Timestamp};

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
            Timestamp::from(50),
            Kind::Custom(9),
            [],
            content,
        );
        rumor.ensure_id();
        rumor
    }

    #[tokio::test]
    async fn emits_only_after_persist_and_only_once() {
        let history = MessageHistory::new(Arc::new(MemoryHistoryStorage::new()));
        let mut feed = history.subscribe();

        let r = rumor("live");
        let outer = cursor(9, 1);
        assert!(history.record_rumor(&r, &outer).expect("record"));

        let record = feed.try_recv().expect("Failed to receive live record");
        assert_eq!(record.rumor.id, r.id);
        assert_eq!(record.outer, outer);
        // At emission time the rumor was already durable.
        assert_eq!(history.rumors(None, None).expect("query").len(), 1);

        // Replaying the same rumor emits nothing.
        assert!(!history.record_rumor(&r, &outer).expect("re-record"));
        assert!(feed.try_recv().is_err());
    }
}
