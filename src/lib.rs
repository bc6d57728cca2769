//! # marmot-mls: encrypted group messaging over Nostr relays
//!
//! A library for building end-to-end encrypted group chat on top of
//! untrusted Nostr relays, using the MLS protocol (RFC 9420) for group key
//! agreement. Groups are forward-secret and post-compromise-secure; relays
//! see only ephemeral-signed ciphertext and a routing tag.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         Your Application                            │
//! └───────────────────────────────┬─────────────────────────────────────┘
//!                                 │
//!         ┌───────────────────────┼───────────────────────┐
//!         ▼                       ▼                       ▼
//! ┌───────────────┐      ┌───────────────┐      ┌───────────────┐
//! │ client/group  │      │      mls      │      │      net      │
//! │  (protocol)   │      │ (encryption)  │      │ (transport)   │
//! └───────────────┘      └───────────────┘      └───────────────┘
//!         │                       │                       │
//!         └───────────────────────┼───────────────────────┘
//!                                 ▼
//!                        ┌───────────────┐
//!                        │    storage    │
//!                        │  (backends)   │
//!                        └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - **[`client`]** - Client facade: signer, stores, per-group cache
//! - **[`group`]** - Group runtime: ingest pipeline, send, propose, commit
//! - **[`mls`]** - OpenMLS wrapper: engine, admin policy, snapshots
//! - **[`envelope`]** / **[`rumor`]** / **[`key_package`]** /
//!   **[`welcome`]** / **[`extension`]** - Wire codecs for the event kinds
//!   and the group-context extension
//! - **[`history`]** - Per-group message history with live subscriptions
//! - **[`storage`]** - Pluggable storage backends (memory reference
//!   implementations included)
//! - **[`net`]** - Relay transport trait
//!
//! ## Event kinds
//!
//! | kind | content | signed by |
//! |------|---------|-----------|
//! | 443  | TLS key package | owner identity key |
//! | 444  | TLS welcome (rumor, gift-wrapped) | never |
//! | 445  | NIP-44 over TLS MLSMessage | fresh ephemeral key |
//!
//! ## Quick Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use marmot_mls::prelude::*;
//!
//! let client = MarmotClient::new(
//!     Arc::new(keys),            // any NostrSigner
//!     Arc::new(transport),       // your relay pool
//!     Arc::new(MemoryGroupStateStorage::new()),
//!     Arc::new(MemoryKeyPackageStorage::new()),
//!     Arc::new(MemoryHistoryFactory::new()),
//!     ClientConfig::default(),
//! );
//!
//! // Create a group and invite Bob by his published key package.
//! let group = client.create_group("climbing", options).await?;
//! group.lock().await.invite(vec![bob_key_package_event]).await?;
//!
//! // Feed relay events through the ingest pipeline.
//! let report = group.lock().await.ingest(relay_events).await?;
//! ```

pub mod client;
pub mod constant;
pub mod cursor;
pub mod encoding;
pub mod envelope;
pub mod error;
pub mod extension;
pub mod group;
pub mod history;
pub mod key_package;
pub mod mls;
pub mod net;
pub mod rumor;
pub mod storage;
pub mod welcome;

pub use client::{ClientConfig, CreateGroupOptions, GroupHandle, MarmotClient};
pub use cursor::EventCursor;
pub use error::{Error, Result};
pub use group::{IngestReport, MarmotGroup};

/// Common imports for applications built on this crate.
pub mod prelude {
    pub use crate::client::{ClientConfig, CreateGroupOptions, GroupHandle, MarmotClient};
    pub use crate::cursor::EventCursor;
    pub use crate::error::{Error, Result};
    pub use crate::extension::{GroupImage, MarmotGroupData};
    pub use crate::group::{
        CommitOutcome, CommitRejection, CommitRequest, EventOutcome, GroupSummary, IngestReport,
        MarmotGroup, ProcessedEvent, ProposalIntent, UnreadableReason, WelcomeDispatch,
    };
    pub use crate::history::RumorRecord;
    pub use crate::net::{
        gift_wrap_filter, group_messages_filter, NostrTransport, PublishSummary, RelayAck,
        TransportError,
    };
    pub use crate::storage::{
        GroupStateStorage, HistoryStorage, HistoryStorageFactory, KeyPackageStorage,
        MemoryGroupStateStorage, MemoryHistoryFactory, MemoryHistoryStorage,
        MemoryKeyPackageStorage, StoreError,
    };
}
