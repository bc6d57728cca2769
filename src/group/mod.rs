//! Group runtime: per-group ingest, send and commit.
//!
//! A [`MarmotGroup`] owns one group's MLS engine, history and stores. All
//! state-advancing operations take `&mut self`; the client wraps each group
//! in `Arc<tokio::sync::Mutex<_>>` so they serialize per group while
//! different groups run in parallel.

mod ingest;
mod outbound;

pub use ingest::{
    CommitRejection, EventOutcome, IngestReport, ProcessedEvent, UnreadableReason,
};
pub use outbound::{CommitOutcome, CommitRequest, ProposalIntent, WelcomeDispatch};

use std::collections::HashSet;
use std::sync::Arc;

use nostr::{Event, EventId, NostrSigner, PublicKey, RelayUrl, UnsignedEvent};
use tokio::sync::broadcast;

use crate::cursor::EventCursor;
use crate::error::Result;
use crate::extension::MarmotGroupData;
use crate::history::{MessageHistory, RumorRecord};
use crate::mls::MlsEngine;
use crate::net::{group_messages_filter, NostrTransport};
use crate::storage::{GroupStateStorage, HistoryStorage};

/// Cheap, immutable view of a group for read-only consumers.
#[derive(Debug, Clone)]
pub struct GroupSummary {
    pub mls_group_id: Vec<u8>,
    pub nostr_group_id: [u8; 32],
    pub name: String,
    pub description: String,
    pub admins: Vec<PublicKey>,
    pub relays: Vec<RelayUrl>,
    pub epoch: u64,
    pub member_count: usize,
}

/// Runtime for a single group.
pub struct MarmotGroup {
    engine: MlsEngine,
    history: MessageHistory,
    state_store: Arc<dyn GroupStateStorage>,
    transport: Arc<dyn NostrTransport>,
    signer: Arc<dyn NostrSigner>,
    /// Outer event ids seen this session; the history store is the
    /// authoritative dedupe, this is the cheap first check.
    seen: HashSet<EventId>,
    max_unreadable_retries: u32,
}

impl MarmotGroup {
    pub(crate) fn new(
        engine: MlsEngine,
        history_backend: Arc<dyn HistoryStorage>,
        state_store: Arc<dyn GroupStateStorage>,
        transport: Arc<dyn NostrTransport>,
        signer: Arc<dyn NostrSigner>,
        max_unreadable_retries: u32,
    ) -> Self {
        Self {
            engine,
            history: MessageHistory::new(history_backend),
            state_store,
            transport,
            signer,
            seen: HashSet::new(),
            max_unreadable_retries,
        }
    }

    // ─────────────────────────── Read-only accessors ───────────────────────────

    pub fn epoch(&self) -> u64 {
        self.engine.epoch()
    }

    pub fn mls_group_id(&self) -> &[u8] {
        self.engine.mls_group_id()
    }

    pub fn nostr_group_id(&self) -> &[u8; 32] {
        self.engine.nostr_group_id()
    }

    pub fn metadata(&self) -> &MarmotGroupData {
        self.engine.group_data()
    }

    pub fn admins(&self) -> &[PublicKey] {
        &self.engine.group_data().admins
    }

    pub fn relays(&self) -> &[RelayUrl] {
        &self.engine.group_data().relays
    }

    pub fn members(&self) -> Vec<PublicKey> {
        self.engine.members()
    }

    pub fn own_pubkey(&self) -> PublicKey {
        self.engine.own_pubkey()
    }

    pub fn summary(&self) -> GroupSummary {
        let data = self.engine.group_data();
        GroupSummary {
            mls_group_id: self.engine.mls_group_id().to_vec(),
            nostr_group_id: data.nostr_group_id,
            name: data.name.clone(),
            description: data.description.clone(),
            admins: data.admins.clone(),
            relays: data.relays.clone(),
            epoch: self.engine.epoch(),
            member_count: self.engine.members().len(),
        }
    }

    // ─────────────────────────── History ───────────────────────────

    /// Greatest processed outer cursor for this group.
    pub fn resume_cursor(&self) -> Result<Option<EventCursor>> {
        Ok(self.history.resume_cursor()?)
    }

    /// Stored rumors newest-first; strictly older than `until` when given.
    pub fn rumors(
        &self,
        until: Option<&EventCursor>,
        limit: Option<usize>,
    ) -> Result<Vec<UnsignedEvent>> {
        Ok(self.history.rumors(until, limit)?)
    }

    /// Live feed of rumors, emitted only after durable persistence.
    pub fn subscribe(&self) -> broadcast::Receiver<RumorRecord> {
        self.history.subscribe()
    }

    // ─────────────────────────── Catch-up ───────────────────────────

    /// Fetch and ingest everything newer than the resume cursor.
    ///
    /// The relay `since` filter is second-coarse, so the fetch overshoots
    /// and the composite comparator drops everything at or below the cursor.
    pub async fn catch_up(&mut self) -> Result<IngestReport> {
        let resume = self.history.resume_cursor()?;
        let filter =
            group_messages_filter(self.engine.nostr_group_id(), resume.map(|c| c.created_at));
        let relays = self.engine.group_data().relays.clone();
        let events = self.transport.request(&relays, filter).await?;

        let fresh: Vec<Event> = events
            .into_iter()
            .filter(|e| resume.is_none_or(|cursor| EventCursor::from(e) > cursor))
            .collect();
        self.ingest(fresh).await
    }

    // ─────────────────────────── Internal ───────────────────────────

    /// Write the MLS snapshot back to the group-state store.
    ///
    /// Failures here propagate and halt the current operation; MLS state
    /// must never silently diverge from the store.
    pub(crate) fn persist_state(&self) -> Result<()> {
        let snapshot = self.engine.snapshot()?;
        self.state_store.save(self.engine.mls_group_id(), &snapshot)?;
        Ok(())
    }
}
