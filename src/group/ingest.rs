//! Batch ingest pipeline.
//!
//! Takes an unordered batch of kind-445 events and drives them through:
//! dedupe, envelope decryption, classification, non-commits in cursor
//! order, commits in (epoch, created_at, id) order with the admin policy,
//! bounded retries of transiently unreadable events, and finally the
//! watermark advance. Per-event failures are classified outcomes, never
//! errors; only MLS state-store failures abort the batch.

use std::collections::VecDeque;

use nostr::{Event, EventId, PublicKey};
use openmls::prelude::{ContentType, ProtocolMessage};
use tracing::{debug, warn};

use super::MarmotGroup;
use crate::cursor::EventCursor;
use crate::envelope::{self, EnvelopeError};
use crate::error::Result;
use crate::history::RumorRecord;
use crate::mls::{policy, EngineMessage};
use crate::rumor;

/// Why an event produced no rumor and no state change.
#[derive(Debug, Clone)]
pub enum UnreadableReason {
    /// No retained exporter secret opens the envelope.
    EpochMismatch,
    /// The envelope or its MLS payload is structurally broken.
    Malformed(String),
    /// OpenMLS refused the message (own message echo, ratchet replay, …).
    MlsProcessing(String),
}

/// Why a commit did not advance the group.
#[derive(Debug, Clone)]
pub enum CommitRejection {
    /// Author's key is not in the admin set.
    NotAdmin(PublicKey),
    /// Lost a commit race: another commit already advanced this epoch.
    RaceLoser { wire_epoch: u64 },
    /// OpenMLS rejected the commit.
    Mls(String),
}

/// Classification of one ingested event.
#[derive(Debug, Clone)]
pub enum EventOutcome {
    /// Decrypted application rumor, persisted to history.
    Rumor { rumor_id: EventId, sender: PublicKey },
    /// Commit accepted; the group is now at `epoch`.
    CommitApplied { epoch: u64, author: PublicKey },
    CommitRejected(CommitRejection),
    /// Proposal cached until a commit references it.
    ProposalStored { sender: PublicKey },
    /// Recorded as processed but produced nothing.
    Unreadable(UnreadableReason),
    /// Already processed earlier (session set or history store).
    Duplicate,
    /// Not addressed to this group; not recorded as processed.
    Ignored(String),
}

#[derive(Debug, Clone)]
pub struct ProcessedEvent {
    pub cursor: EventCursor,
    pub outcome: EventOutcome,
}

/// Result of one ingest batch.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub processed: Vec<ProcessedEvent>,
    /// Rumors newly persisted by this batch, in application order.
    pub rumors: Vec<RumorRecord>,
    /// True when an accepted commit removed us from the group.
    pub removed_from_group: bool,
}

impl IngestReport {
    fn push(&mut self, cursor: EventCursor, outcome: EventOutcome) {
        self.processed.push(ProcessedEvent { cursor, outcome });
    }
}

struct CommitCandidate {
    wire_epoch: u64,
    cursor: EventCursor,
    protocol: ProtocolMessage,
}

struct UnreadableEvent {
    event: Event,
    cursor: EventCursor,
    attempts: u32,
}

impl MarmotGroup {
    /// Ingest a batch of outer events addressed to this group.
    ///
    /// Replay-safe: feeding the same events again (in any order or
    /// multiplicity) leaves the MLS state and history unchanged.
    pub async fn ingest(&mut self, events: Vec<Event>) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        let mut non_commits: Vec<(EventCursor, ProtocolMessage)> = Vec::new();
        let mut commits: Vec<CommitCandidate> = Vec::new();
        let mut unreadable: Vec<UnreadableEvent> = Vec::new();

        // ── 1+2. Dedupe, decrypt, classify ─────────────────────────
        for event in events {
            tokio::task::yield_now().await;
            let cursor = EventCursor::from(&event);

            if self.seen.contains(&event.id)
                || self.history.is_processed(&event.id).unwrap_or(false)
            {
                report.push(cursor, EventOutcome::Duplicate);
                continue;
            }

            let opened = envelope::open(
                &event,
                self.engine.nostr_group_id(),
                self.engine.exporter_secrets_desc(),
            );
            if let Err(
                e @ (EnvelopeError::WrongKind(_)
                | EnvelopeError::MissingRoutingTag
                | EnvelopeError::RoutingMismatch),
            ) = &opened
            {
                // Not addressed to this group; neither the watermark nor
                // the dedupe set records it.
                warn!(id = %event.id, "ignoring foreign event: {e}");
                report.push(cursor, EventOutcome::Ignored(e.to_string()));
                continue;
            }
            self.seen.insert(event.id);

            match opened {
                Ok((_epoch, plaintext)) => {
                    self.classify_plaintext(
                        cursor,
                        &plaintext,
                        &mut non_commits,
                        &mut commits,
                        &mut report,
                    )?;
                }
                Err(EnvelopeError::DecryptFailed) => {
                    unreadable.push(UnreadableEvent {
                        event,
                        cursor,
                        attempts: 1,
                    });
                }
                Err(e) => {
                    self.mark_processed_logged(&cursor);
                    report.push(
                        cursor,
                        EventOutcome::Unreadable(UnreadableReason::Malformed(e.to_string())),
                    );
                }
            }
        }

        // ── 3. Non-commits first, in cursor order ──────────────────
        non_commits.sort_by_key(|(cursor, _)| *cursor);
        for (cursor, protocol) in non_commits {
            tokio::task::yield_now().await;
            self.apply_non_commit(cursor, protocol, &mut report)?;
        }

        // ── 4+5. Commits in (epoch, created_at, id) order ──────────
        commits.sort_by_key(|c| (c.wire_epoch, c.cursor));
        let mut pending: VecDeque<CommitCandidate> = commits.into();
        while let Some(candidate) = pending.pop_front() {
            tokio::task::yield_now().await;
            let advanced = self.apply_commit(candidate, &mut report)?;
            if advanced {
                // ── 6. A new epoch may unlock unreadable envelopes ──
                self.retry_unreadable(&mut unreadable, &mut pending, &mut report)?;
            }
        }

        // ── 7. Whatever stayed unreadable still advances the cursor ─
        for u in unreadable {
            debug!(id = %u.event.id, attempts = u.attempts, "permanently unreadable event");
            self.mark_processed_logged(&u.cursor);
            report.push(
                u.cursor,
                EventOutcome::Unreadable(UnreadableReason::EpochMismatch),
            );
        }

        Ok(report)
    }

    /// TLS-decode decrypted envelope plaintext and route it to the commit
    /// or non-commit queue.
    fn classify_plaintext(
        &mut self,
        cursor: EventCursor,
        plaintext: &[u8],
        non_commits: &mut Vec<(EventCursor, ProtocolMessage)>,
        commits: &mut Vec<CommitCandidate>,
        report: &mut IngestReport,
    ) -> Result<()> {
        match self.engine.parse_protocol_message(plaintext) {
            Ok(protocol) => {
                if protocol.content_type() == ContentType::Commit {
                    commits.push(CommitCandidate {
                        wire_epoch: protocol.epoch().as_u64(),
                        cursor,
                        protocol,
                    });
                } else {
                    non_commits.push((cursor, protocol));
                }
            }
            Err(e) => {
                self.mark_processed_logged(&cursor);
                report.push(
                    cursor,
                    EventOutcome::Unreadable(UnreadableReason::Malformed(e.to_string())),
                );
            }
        }
        Ok(())
    }

    fn apply_non_commit(
        &mut self,
        cursor: EventCursor,
        protocol: ProtocolMessage,
        report: &mut IngestReport,
    ) -> Result<()> {
        match self.engine.process(protocol) {
            Ok(EngineMessage::Application { sender, payload }) => {
                match rumor::deserialize(&payload).map(|r| (r.id, r)) {
                    Ok((Some(rumor_id), rumor)) => {
                        // History failures must not halt the batch; the MLS
                        // ratchet already advanced and is persisted below.
                        match self.history.record_rumor(&rumor, &cursor) {
                            Ok(true) => report.rumors.push(RumorRecord {
                                rumor,
                                outer: cursor,
                            }),
                            Ok(false) => {}
                            Err(e) => warn!(outer = %cursor, "history write failed: {e}"),
                        }
                        report.push(cursor, EventOutcome::Rumor { rumor_id, sender });
                    }
                    Ok((None, _)) => {
                        report.push(
                            cursor,
                            EventOutcome::Unreadable(UnreadableReason::Malformed(
                                "rumor without id".into(),
                            )),
                        );
                    }
                    Err(e) => {
                        report.push(
                            cursor,
                            EventOutcome::Unreadable(UnreadableReason::Malformed(e.to_string())),
                        );
                    }
                }
                self.persist_state()?;
            }
            Ok(EngineMessage::Proposal { sender }) => {
                self.persist_state()?;
                report.push(cursor, EventOutcome::ProposalStored { sender });
            }
            Ok(EngineMessage::ExternalJoin) => {
                report.push(
                    cursor,
                    EventOutcome::Ignored("external join proposal".into()),
                );
            }
            Ok(EngineMessage::StagedCommitReady { .. }) => {
                // Content type said non-commit; refuse to advance on it.
                report.push(
                    cursor,
                    EventOutcome::CommitRejected(CommitRejection::Mls(
                        "commit framed as non-commit".into(),
                    )),
                );
            }
            Err(e) => {
                debug!(outer = %cursor, "message not processable: {e}");
                report.push(
                    cursor,
                    EventOutcome::Unreadable(UnreadableReason::MlsProcessing(e.to_string())),
                );
            }
        }
        self.mark_processed_logged(&cursor);
        Ok(())
    }

    /// Apply one commit. Returns true when the epoch advanced.
    fn apply_commit(
        &mut self,
        candidate: CommitCandidate,
        report: &mut IngestReport,
    ) -> Result<bool> {
        let cursor = candidate.cursor;
        let current_epoch = self.engine.epoch();

        if candidate.wire_epoch < current_epoch {
            debug!(
                outer = %cursor,
                wire_epoch = candidate.wire_epoch,
                current_epoch,
                "dropping commit-race loser"
            );
            self.mark_processed_logged(&cursor);
            report.push(
                cursor,
                EventOutcome::CommitRejected(CommitRejection::RaceLoser {
                    wire_epoch: candidate.wire_epoch,
                }),
            );
            return Ok(false);
        }

        let outcome = match self.engine.process(candidate.protocol) {
            Ok(EngineMessage::StagedCommitReady { staged, sender }) => {
                match policy::authorize_commit(&sender, self.engine.group_data()) {
                    Ok(author) => match self.engine.merge_commit(staged) {
                        Ok(removed) => {
                            // Store failure here must abort the batch: the
                            // in-memory epoch has advanced.
                            self.persist_state()?;
                            report.removed_from_group |= removed;
                            debug!(
                                outer = %cursor,
                                epoch = self.engine.epoch(),
                                author = %author,
                                "commit applied"
                            );
                            self.mark_processed_logged(&cursor);
                            report.push(
                                cursor,
                                EventOutcome::CommitApplied {
                                    epoch: self.engine.epoch(),
                                    author,
                                },
                            );
                            return Ok(true);
                        }
                        Err(e) => EventOutcome::CommitRejected(CommitRejection::Mls(
                            e.to_string(),
                        )),
                    },
                    Err(policy::PolicyError::NotAdmin(author)) => {
                        warn!(outer = %cursor, author = %author, "commit from non-admin rejected");
                        EventOutcome::CommitRejected(CommitRejection::NotAdmin(author))
                    }
                    Err(e) => EventOutcome::CommitRejected(CommitRejection::Mls(e.to_string())),
                }
            }
            Ok(_) => EventOutcome::CommitRejected(CommitRejection::Mls(
                "non-commit framed as commit".into(),
            )),
            Err(e) => EventOutcome::CommitRejected(CommitRejection::Mls(e.to_string())),
        };

        self.mark_processed_logged(&cursor);
        report.push(cursor, outcome);
        Ok(false)
    }

    /// After an epoch advance, retry events that failed to decrypt.
    ///
    /// Newly readable commits join the pending queue (kept in commit
    /// order); non-commits apply immediately. Events exceeding the retry
    /// budget fall out of the rotation and are finalized by the caller.
    fn retry_unreadable(
        &mut self,
        unreadable: &mut Vec<UnreadableEvent>,
        pending: &mut VecDeque<CommitCandidate>,
        report: &mut IngestReport,
    ) -> Result<()> {
        let mut still_unreadable = Vec::new();

        for mut u in unreadable.drain(..) {
            if u.attempts >= self.max_unreadable_retries {
                still_unreadable.push(u);
                continue;
            }
            let opened = envelope::open(
                &u.event,
                self.engine.nostr_group_id(),
                self.engine.exporter_secrets_desc(),
            );
            match opened {
                Ok((_epoch, plaintext)) => {
                    let mut new_commits = Vec::new();
                    let mut new_non_commits = Vec::new();
                    self.classify_plaintext(
                        u.cursor,
                        &plaintext,
                        &mut new_non_commits,
                        &mut new_commits,
                        report,
                    )?;
                    for (cursor, protocol) in new_non_commits {
                        self.apply_non_commit(cursor, protocol, report)?;
                    }
                    for commit in new_commits {
                        pending.push_back(commit);
                    }
                }
                Err(_) => {
                    u.attempts += 1;
                    still_unreadable.push(u);
                }
            }
        }

        // Keep the pending queue in deterministic commit order.
        let mut reordered: Vec<CommitCandidate> = pending.drain(..).collect();
        reordered.sort_by_key(|c| (c.wire_epoch, c.cursor));
        pending.extend(reordered);

        *unreadable = still_unreadable;
        Ok(())
    }

    /// Advance the processed watermark; history failures are logged, not
    /// propagated.
    fn mark_processed_logged(&self, cursor: &EventCursor) {
        if let Err(e) = self.history.mark_processed(cursor) {
            warn!(outer = %cursor, "failed to record processed cursor: {e}");
        }
    }
}
