//! Outbound paths: application rumors, standalone proposals, and commits.
//!
//! Commits follow a strict order: the commit envelope must be acknowledged
//! by at least one relay before the local state merges and before any
//! welcome leaves the machine. A commit nobody stored must not fork the
//! sender away from the group.

use nostr::{Event, EventId, PublicKey, RelayUrl, UnsignedEvent};
use tracing::{debug, warn};

use super::MarmotGroup;
use crate::cursor::EventCursor;
use crate::envelope;
use crate::error::{Error, Result};
use crate::key_package;
use crate::rumor;
use crate::welcome;

/// Membership changes to fold into one commit.
#[derive(Debug, Default)]
pub struct CommitRequest {
    /// Kind-443 events of the members to add.
    pub add_key_package_events: Vec<Event>,
    /// Members to remove.
    pub remove: Vec<PublicKey>,
    /// Rotate our own leaf.
    pub self_update: bool,
}

impl CommitRequest {
    pub fn add(events: Vec<Event>) -> Self {
        Self {
            add_key_package_events: events,
            ..Self::default()
        }
    }
}

/// A single standalone proposal.
#[derive(Debug)]
pub enum ProposalIntent {
    /// Propose adding the owner of a kind-443 event.
    Add(Event),
    Remove(PublicKey),
    SelfUpdate,
}

/// Where one welcome went.
#[derive(Debug, Clone)]
pub struct WelcomeDispatch {
    pub invitee: PublicKey,
    pub gift_wrap_id: Option<EventId>,
    /// False when no relay accepted the gift wrap; the invitee must be
    /// re-invited.
    pub delivered: bool,
}

/// Result of a successful commit.
#[derive(Debug)]
pub struct CommitOutcome {
    pub commit_event: Event,
    pub epoch: u64,
    pub welcomes: Vec<WelcomeDispatch>,
}

struct Invitee {
    pubkey: PublicKey,
    key_package_event_id: EventId,
    relay_hints: Vec<RelayUrl>,
}

impl MarmotGroup {
    /// Encrypt and publish an application rumor.
    ///
    /// The rumor must carry its id and no signature. The rumor is persisted
    /// to our own history immediately (forward secrecy makes the relayed
    /// copy undecryptable for us) and the relayed copy dedupes on ingest.
    pub async fn send_rumor(&mut self, rumor: UnsignedEvent) -> Result<Event> {
        let serialized = rumor::serialize(&rumor)?;
        let message = self.engine.create_application_message(&serialized)?;
        // The sender ratchet advanced; persist before anything can fail.
        self.persist_state()?;

        let event = envelope::seal(
            self.engine.nostr_group_id(),
            self.engine.current_exporter_secret()?,
            &message,
        )?;
        let outer = EventCursor::from(&event);
        self.seen.insert(event.id);
        if let Err(e) = self.history.record_rumor(&rumor, &outer) {
            warn!(outer = %outer, "failed to persist own rumor: {e}");
        }
        if let Err(e) = self.history.mark_processed(&outer) {
            warn!(outer = %outer, "failed to record own event as processed: {e}");
        }

        let relays = self.engine.group_data().relays.clone();
        let summary = self.transport.publish(&relays, &event).await?;
        if !summary.acknowledged() {
            return Err(Error::NoRelayAck);
        }
        debug!(id = %event.id, "application rumor published");
        Ok(event)
    }

    /// Publish a single standalone proposal without committing it.
    ///
    /// The proposal is also cached locally, so a later commit of ours picks
    /// it up.
    pub async fn propose(&mut self, intent: ProposalIntent) -> Result<Event> {
        let message = match intent {
            ProposalIntent::Add(kp_event) => {
                let key_package = key_package::parse_event(&kp_event, self.engine.crypto())?;
                self.engine.propose_add(&key_package)?
            }
            ProposalIntent::Remove(member) => self.engine.propose_remove(&member)?,
            ProposalIntent::SelfUpdate => self.engine.propose_self_update()?,
        };
        self.persist_state()?;

        let event = envelope::seal(
            self.engine.nostr_group_id(),
            self.engine.current_exporter_secret()?,
            &message,
        )?;
        self.seen.insert(event.id);
        if let Err(e) = self.history.mark_processed(&EventCursor::from(&event)) {
            warn!(id = %event.id, "failed to record own proposal as processed: {e}");
        }

        let relays = self.engine.group_data().relays.clone();
        let summary = self.transport.publish(&relays, &event).await?;
        if !summary.acknowledged() {
            return Err(Error::NoRelayAck);
        }
        Ok(event)
    }

    /// Convenience wrapper: add members by their key-package events.
    pub async fn invite(&mut self, key_package_events: Vec<Event>) -> Result<CommitOutcome> {
        self.commit(CommitRequest::add(key_package_events)).await
    }

    /// Build, publish and merge a commit for the requested changes.
    ///
    /// Sequence: proposals → commit envelope → relay ack → merge → persist
    /// → welcomes. Without an ack the pending commit is dropped and the
    /// group stays at the old epoch. A failed welcome publish does not roll
    /// anything back; the invitee simply has to be re-invited.
    pub async fn commit(&mut self, request: CommitRequest) -> Result<CommitOutcome> {
        let own = self.engine.own_pubkey();
        if !self.engine.group_data().is_admin(&own) {
            return Err(Error::NotAdmin(own));
        }

        let invitees = match self.queue_proposals(&request) {
            Ok(invitees) => invitees,
            Err(e) => {
                self.engine.clear_pending_proposals()?;
                return Err(e);
            }
        };

        let (commit_message, welcome_bytes) = match self.engine.commit_to_pending() {
            Ok(out) => out,
            Err(e) => {
                self.engine.clear_pending_proposals()?;
                return Err(e.into());
            }
        };

        // Seal under the epoch the commit leaves behind: receivers are
        // still there.
        let commit_event = envelope::seal(
            self.engine.nostr_group_id(),
            self.engine.current_exporter_secret()?,
            &commit_message,
        )?;

        let relays = self.engine.group_data().relays.clone();
        let acked = match self.transport.publish(&relays, &commit_event).await {
            Ok(summary) => summary.acknowledged(),
            Err(e) => {
                self.engine.clear_pending()?;
                self.engine.clear_pending_proposals()?;
                return Err(e.into());
            }
        };
        if !acked {
            self.engine.clear_pending()?;
            self.engine.clear_pending_proposals()?;
            return Err(Error::NoRelayAck);
        }

        // Ack in hand: advance, persist, and only then dispatch welcomes.
        self.engine.merge_pending()?;
        self.persist_state()?;
        self.seen.insert(commit_event.id);
        if let Err(e) = self.history.mark_processed(&EventCursor::from(&commit_event)) {
            warn!(id = %commit_event.id, "failed to record own commit as processed: {e}");
        }
        let epoch = self.engine.epoch();
        debug!(epoch, id = %commit_event.id, "commit acknowledged and merged");

        let mut welcomes = Vec::with_capacity(invitees.len());
        if let Some(welcome_bytes) = welcome_bytes {
            for invitee in invitees {
                welcomes.push(self.dispatch_welcome(&welcome_bytes, invitee).await);
            }
        }

        Ok(CommitOutcome {
            commit_event,
            epoch,
            welcomes,
        })
    }

    fn queue_proposals(&mut self, request: &CommitRequest) -> Result<Vec<Invitee>> {
        let mut invitees = Vec::with_capacity(request.add_key_package_events.len());
        for kp_event in &request.add_key_package_events {
            let key_package = key_package::parse_event(kp_event, self.engine.crypto())?;
            self.engine.propose_add(&key_package)?;
            invitees.push(Invitee {
                pubkey: kp_event.pubkey,
                key_package_event_id: kp_event.id,
                relay_hints: key_package::relay_hints(kp_event),
            });
        }
        for member in &request.remove {
            self.engine.propose_remove(member)?;
        }
        if request.self_update {
            self.engine.propose_self_update()?;
        }
        Ok(invitees)
    }

    /// Gift-wrap the welcome for one invitee and publish it to their inbox
    /// relays, falling back to the key-package hints and the group relays.
    async fn dispatch_welcome(&self, welcome_bytes: &[u8], invitee: Invitee) -> WelcomeDispatch {
        let group_relays = &self.engine.group_data().relays;
        let rumor = welcome::build_rumor(
            self.engine.own_pubkey(),
            welcome_bytes,
            invitee.key_package_event_id,
            group_relays,
        );

        let wrapped = match welcome::gift_wrap(&self.signer, &invitee.pubkey, rumor).await {
            Ok(event) => event,
            Err(e) => {
                warn!(invitee = %invitee.pubkey, "gift wrap failed: {e}");
                return WelcomeDispatch {
                    invitee: invitee.pubkey,
                    gift_wrap_id: None,
                    delivered: false,
                };
            }
        };

        let mut targets = match self.transport.user_inbox_relays(&invitee.pubkey).await {
            Ok(relays) if !relays.is_empty() => relays,
            _ => Vec::new(),
        };
        for relay in invitee.relay_hints.iter().chain(group_relays.iter()) {
            if !targets.contains(relay) {
                targets.push(relay.clone());
            }
        }

        let delivered = match self.transport.publish(&targets, &wrapped).await {
            Ok(summary) => summary.acknowledged(),
            Err(e) => {
                warn!(invitee = %invitee.pubkey, "welcome publish failed: {e}");
                false
            }
        };
        if !delivered {
            warn!(invitee = %invitee.pubkey, "welcome not acknowledged by any relay");
        }

        WelcomeDispatch {
            invitee: invitee.pubkey,
            gift_wrap_id: Some(wrapped.id),
            delivered,
        }
    }
}
