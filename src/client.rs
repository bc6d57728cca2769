//! Client facade: signer, stores, transport and the per-group cache.
//!
//! A [`MarmotClient`] owns everything shared across groups. Each group is
//! cached behind `Arc<tokio::sync::Mutex<MarmotGroup>>`: state-advancing
//! operations lock one group without blocking the others, matching the
//! per-group serialization the runtime requires.

use std::collections::HashMap;
use std::sync::Arc;

use nostr::{
    Alphabet, Event, EventBuilder, EventId, Kind, NostrSigner, PublicKey, RelayUrl,
    SingleLetterTag, Tag, TagKind, UnsignedEvent,
};
use openmls::prelude::Ciphersuite;
use rand::RngCore;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::constant::{
    DEFAULT_CIPHERSUITE, DEFAULT_EXPORTER_WINDOW, DEFAULT_MAX_UNREADABLE_RETRIES,
};
use crate::error::{Error, Result};
use crate::extension::{GroupImage, MarmotGroupData};
use crate::group::{GroupSummary, MarmotGroup};
use crate::key_package;
use crate::mls::{self, MlsEngine};
use crate::net::NostrTransport;
use crate::storage::{
    GroupStateStorage, HistoryStorageFactory, KeyPackageListEntry, KeyPackageRecord,
    KeyPackageStorage,
};
use crate::welcome;

/// Tunables shared by all groups of one client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub ciphersuite: Ciphersuite,
    /// How many past epochs of exporter secrets each group retains.
    pub exporter_window: u64,
    /// Retry budget for transiently undecryptable events per ingest batch.
    pub max_unreadable_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ciphersuite: DEFAULT_CIPHERSUITE,
            exporter_window: DEFAULT_EXPORTER_WINDOW,
            max_unreadable_retries: DEFAULT_MAX_UNREADABLE_RETRIES,
        }
    }
}

/// Options for [`MarmotClient::create_group`].
#[derive(Debug, Default)]
pub struct CreateGroupOptions {
    pub description: String,
    /// Admin set; the creator is always added.
    pub admins: Vec<PublicKey>,
    pub relays: Vec<RelayUrl>,
    pub image: Option<GroupImage>,
}

/// Shared handle to one group's runtime.
pub type GroupHandle = Arc<Mutex<MarmotGroup>>;

/// Client owning the signer, stores, transport and group cache.
pub struct MarmotClient {
    signer: Arc<dyn NostrSigner>,
    transport: Arc<dyn NostrTransport>,
    group_store: Arc<dyn GroupStateStorage>,
    key_package_store: Arc<dyn KeyPackageStorage>,
    history_factory: Arc<dyn HistoryStorageFactory>,
    groups: RwLock<HashMap<Vec<u8>, GroupHandle>>,
    config: ClientConfig,
}

impl MarmotClient {
    pub fn new(
        signer: Arc<dyn NostrSigner>,
        transport: Arc<dyn NostrTransport>,
        group_store: Arc<dyn GroupStateStorage>,
        key_package_store: Arc<dyn KeyPackageStorage>,
        history_factory: Arc<dyn HistoryStorageFactory>,
        config: ClientConfig,
    ) -> Self {
        Self {
            signer,
            transport,
            group_store,
            key_package_store,
            history_factory,
            groups: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Our identity key, from the signer.
    pub async fn public_key(&self) -> Result<PublicKey> {
        self.signer
            .get_public_key()
            .await
            .map_err(|e| Error::Signer(e.to_string()))
    }

    // ─────────────────────────── Group lifecycle ───────────────────────────

    /// Create a group with ourselves as sole member and initial admin.
    pub async fn create_group(
        &self,
        name: impl Into<String>,
        options: CreateGroupOptions,
    ) -> Result<GroupHandle> {
        let me = self.public_key().await?;

        let mut admins = options.admins;
        if !admins.contains(&me) {
            admins.push(me);
        }

        let mut nostr_group_id = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut nostr_group_id);

        let mut group_data = MarmotGroupData::new(
            nostr_group_id,
            name,
            options.description,
            admins,
            options.relays,
        );
        group_data.image = options.image;

        let engine = MlsEngine::create(
            me,
            group_data,
            self.config.ciphersuite,
            self.config.exporter_window,
        )?;
        if self.group_store.load(engine.mls_group_id())?.is_some() {
            return Err(Error::GroupAlreadyExists);
        }

        info!(
            group = %hex::encode(engine.mls_group_id()),
            "created group"
        );
        self.register(engine).await
    }

    /// Cache-first lookup by MLS group id, falling back to the state store.
    pub async fn get_group(&self, mls_group_id: &[u8]) -> Result<Option<GroupHandle>> {
        if let Some(handle) = self.groups.read().await.get(mls_group_id) {
            return Ok(Some(handle.clone()));
        }
        let Some(snapshot) = self.group_store.load(mls_group_id)? else {
            return Ok(None);
        };
        let engine = MlsEngine::from_snapshot(&snapshot, self.config.exporter_window)?;
        Ok(Some(self.register(engine).await?))
    }

    /// Load every stored group into the cache.
    pub async fn load_all_groups(&self) -> Result<Vec<GroupHandle>> {
        let mut handles = Vec::new();
        for mls_group_id in self.group_store.list()? {
            if let Some(handle) = self.get_group(&mls_group_id).await? {
                handles.push(handle);
            }
        }
        Ok(handles)
    }

    /// Snapshot summaries of all cached groups, without holding any group
    /// lock across the collection.
    pub async fn group_summaries(&self) -> Vec<GroupSummary> {
        let handles: Vec<GroupHandle> =
            self.groups.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            summaries.push(handle.lock().await.summary());
        }
        summaries
    }

    /// Remove a group's MLS state and history.
    pub async fn destroy_group(&self, mls_group_id: &[u8]) -> Result<()> {
        let existed = {
            let mut groups = self.groups.write().await;
            groups.remove(mls_group_id).is_some()
        };
        let stored = self.group_store.load(mls_group_id)?.is_some();
        if !existed && !stored {
            return Err(Error::GroupNotFound);
        }
        self.group_store.remove(mls_group_id)?;
        self.history_factory.destroy(mls_group_id)?;
        info!(group = %hex::encode(mls_group_id), "destroyed group");
        Ok(())
    }

    // ─────────────────────────── Key packages ───────────────────────────

    /// Generate a key package, store both halves, and publish the kind-443
    /// event to the given relays.
    pub async fn publish_key_package(&self, relays: &[RelayUrl]) -> Result<Event> {
        let me = self.public_key().await?;
        let generated = mls::generate_key_package(me, self.config.ciphersuite)?;

        let (content, tags) = key_package::build_event_content(&generated.tls_bytes, relays);
        let unsigned = EventBuilder::new(Kind::MlsKeyPackage, content)
            .tags(tags)
            .build(me);
        let event = self
            .signer
            .sign_event(unsigned)
            .await
            .map_err(|e| Error::Signer(e.to_string()))?;

        self.key_package_store.save(KeyPackageRecord {
            hash_ref: generated.hash_ref,
            public_tls: generated.tls_bytes,
            private_state: generated.private_state,
            last_resort: true,
            event_id: Some(event.id.to_hex()),
        })?;

        let summary = self.transport.publish(relays, &event).await?;
        if !summary.acknowledged() {
            warn!(id = %event.id, "key package not acknowledged by any relay");
        }
        Ok(event)
    }

    /// Publish a kind-5 deletion for a previously published key-package
    /// event.
    pub async fn delete_key_package_event(
        &self,
        key_package_event_id: EventId,
        relays: &[RelayUrl],
    ) -> Result<Event> {
        let me = self.public_key().await?;
        let tags = vec![
            Tag::event(key_package_event_id),
            Tag::custom(
                TagKind::SingleLetter(SingleLetterTag::lowercase(Alphabet::K)),
                ["443"],
            ),
        ];
        let unsigned = EventBuilder::new(Kind::EventDeletion, "")
            .tags(tags)
            .build(me);
        let event = self
            .signer
            .sign_event(unsigned)
            .await
            .map_err(|e| Error::Signer(e.to_string()))?;
        self.transport.publish(relays, &event).await?;
        Ok(event)
    }

    // ─────────────────────────── Welcomes ───────────────────────────

    /// Unwrap a received gift wrap; returns the sender and inner rumor.
    pub async fn unwrap_gift_wrap(&self, wrapper: &Event) -> Result<(PublicKey, UnsignedEvent)> {
        Ok(welcome::unwrap_gift_wrap(&self.signer, wrapper).await?)
    }

    /// Join a group from an unwrapped kind-444 welcome rumor.
    ///
    /// Candidates are tried in priority order: local key packages whose hash
    /// ref appears in the welcome first, then the one matching
    /// `key_package_event_id` (argument or `e` tag), then the rest. An
    /// explicit `key_package_event_id` matching no stored package fails
    /// fast with [`Error::NoMatchingKeyPackageEvent`]. The consumed key
    /// package is removed unless it is last-resort.
    pub async fn join_group_from_welcome(
        &self,
        welcome_rumor: &UnsignedEvent,
        key_package_event_id: Option<EventId>,
    ) -> Result<GroupHandle> {
        let parsed = welcome::parse_rumor(welcome_rumor)?;
        let welcome = mls::parse_welcome(&parsed.welcome_bytes)?;
        let addressed_refs = mls::welcome_new_member_refs(&welcome);

        let entries = self.key_package_store.list()?;
        if let Some(requested) = key_package_event_id {
            let requested = requested.to_hex();
            if !entries
                .iter()
                .any(|e| e.event_id.as_deref() == Some(requested.as_str()))
            {
                return Err(Error::NoMatchingKeyPackageEvent);
            }
        }

        let hint = key_package_event_id
            .or(parsed.key_package_event_id)
            .map(|id| id.to_hex());
        let candidates = order_candidates(entries, &addressed_refs, hint);
        if candidates.is_empty() {
            return Err(Error::WelcomeUnmatched { last_error: None });
        }

        let mut last_error: Option<String> = None;
        for entry in candidates {
            let Some(record) = self.key_package_store.load(&entry.hash_ref)? else {
                continue;
            };
            match MlsEngine::join_from_welcome(
                &parsed.welcome_bytes,
                &record.private_state,
                self.config.exporter_window,
            ) {
                Ok(engine) => {
                    if self.group_store.load(engine.mls_group_id())?.is_some() {
                        return Err(Error::GroupAlreadyExists);
                    }
                    if !record.last_resort {
                        self.key_package_store.remove(&record.hash_ref)?;
                    }
                    info!(
                        group = %hex::encode(engine.mls_group_id()),
                        epoch = engine.epoch(),
                        "joined group from welcome"
                    );
                    return self.register(engine).await;
                }
                Err(e) => {
                    debug!("welcome candidate failed: {e}");
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(Error::WelcomeUnmatched { last_error })
    }

    /// Read the group metadata a welcome would install, without joining.
    pub fn preview_welcome(&self, welcome_rumor: &UnsignedEvent) -> Result<MarmotGroupData> {
        let parsed = welcome::parse_rumor(welcome_rumor)?;
        let welcome = mls::parse_welcome(&parsed.welcome_bytes)?;
        let addressed_refs = mls::welcome_new_member_refs(&welcome);

        let mut last_error: Option<String> = None;
        for entry in order_candidates(self.key_package_store.list()?, &addressed_refs, None) {
            let Some(record) = self.key_package_store.load(&entry.hash_ref)? else {
                continue;
            };
            match mls::preview_welcome(&parsed.welcome_bytes, &record.private_state) {
                Ok(data) => return Ok(data),
                Err(e) => last_error = Some(e.to_string()),
            }
        }
        Err(Error::WelcomeUnmatched { last_error })
    }

    // ─────────────────────────── Internal ───────────────────────────

    /// Persist a fresh engine and wire its runtime into the cache.
    async fn register(&self, engine: MlsEngine) -> Result<GroupHandle> {
        let mls_group_id = engine.mls_group_id().to_vec();
        let history = self.history_factory.open(&mls_group_id)?;
        let group = MarmotGroup::new(
            engine,
            history,
            self.group_store.clone(),
            self.transport.clone(),
            self.signer.clone(),
            self.config.max_unreadable_retries,
        );
        group.persist_state()?;

        let handle = Arc::new(Mutex::new(group));
        self.groups
            .write()
            .await
            .insert(mls_group_id, handle.clone());
        Ok(handle)
    }
}

/// Order join candidates: welcome-addressed refs first, then the event-id
/// hint, then everything else.
fn order_candidates(
    entries: Vec<KeyPackageListEntry>,
    addressed_refs: &[Vec<u8>],
    event_id_hint: Option<String>,
) -> Vec<KeyPackageListEntry> {
    let mut matching = Vec::new();
    let mut hinted = Vec::new();
    let mut rest = Vec::new();
    for entry in entries {
        if addressed_refs.contains(&entry.hash_ref) {
            matching.push(entry);
        } else if event_id_hint.is_some() && entry.event_id == event_id_hint {
            hinted.push(entry);
        } else {
            rest.push(entry);
        }
    }
    matching.extend(hinted);
    matching.extend(rest);
    matching
}
