//! Composite event cursor and the total order over transport events.
//!
//! Relays deliver events in arbitrary order and timestamps alone collide, so
//! every ordering decision in this crate goes through the composite
//! `(created_at, id)` key. Relay `since` filters are only second-precision;
//! callers fetch coarsely by timestamp and then drop anything at or below a
//! known cursor with [`EventCursor`]'s comparator.

use std::cmp::Ordering;
use std::fmt;

use nostr::{Event, EventId, Timestamp, UnsignedEvent};

/// Total-ordering key for transport events: creation time, tie-broken by the
/// lexicographically smaller event id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventCursor {
    pub created_at: Timestamp,
    pub id: EventId,
}

impl EventCursor {
    pub fn new(created_at: Timestamp, id: EventId) -> Self {
        Self { created_at, id }
    }
}

impl Ord for EventCursor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.as_bytes().cmp(other.id.as_bytes()))
    }
}

impl PartialOrd for EventCursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<&Event> for EventCursor {
    fn from(event: &Event) -> Self {
        Self::new(event.created_at, event.id)
    }
}

impl fmt::Display for EventCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.created_at.as_u64(), self.id.to_hex())
    }
}

/// Cursor of a rumor whose id has already been computed.
///
/// Returns `None` for rumors that never ran `ensure_id`.
pub fn rumor_cursor(rumor: &UnsignedEvent) -> Option<EventCursor> {
    rumor.id.map(|id| EventCursor::new(rumor.created_at, id))
}
