//! Per-group MLS engine.
//!
//! Wraps one OpenMLS group together with its storage, signer, cached group
//! data and exporter-secret window. The engine is the only code that touches
//! OpenMLS directly; the group runtime drives it and persists its snapshot
//! after every state-advancing operation.
//!
//! Commits created locally stay pending until [`MlsEngine::merge_pending`]
//! runs, so callers can gate the merge on a relay acknowledgement and roll
//! back with [`MlsEngine::clear_pending`] when publishing fails.

use std::collections::BTreeMap;

use nostr::PublicKey;
use openmls::group::{GroupId, MlsGroup, MlsGroupCreateConfig, MlsGroupJoinConfig};
use openmls::prelude::{
    BasicCredential, Capabilities, Ciphersuite, Credential, CredentialType, CredentialWithKey,
    DeserializeBytes, Extension, Extensions, KeyPackage, LeafNodeIndex, LeafNodeParameters,
    MlsMessageBodyIn, MlsMessageIn, ProcessedMessageContent, ProtocolMessage,
    RequiredCapabilitiesExtension, StagedCommit, StagedWelcome, UnknownExtension, Welcome,
};
use openmls_basic_credential::SignatureKeyPair;
use openmls_rust_crypto::{MemoryStorage, RustCrypto};
use openmls_traits::OpenMlsProvider;
use rand::RngCore;
use tls_codec::Serialize as TlsSerialize;
use tracing::debug;

use super::error::MlsEngineError;
use super::policy;
use super::snapshot::{GroupSnapshot, KeyPackageSecrets};
use crate::constant::{
    EXPORTER_CONTEXT, EXPORTER_LABEL, EXPORTER_SECRET_LENGTH,
    GROUP_CONTEXT_REQUIRED_EXTENSIONS, MARMOT_GROUP_DATA_EXTENSION_TYPE, SUPPORTED_EXTENSIONS,
};
use crate::extension::MarmotGroupData;

/// OpenMLS provider borrowing the engine's crypto and storage.
struct Provider<'a> {
    crypto: &'a RustCrypto,
    storage: &'a MemoryStorage,
}

impl OpenMlsProvider for Provider<'_> {
    type CryptoProvider = RustCrypto;
    type RandProvider = RustCrypto;
    type StorageProvider = MemoryStorage;

    fn crypto(&self) -> &Self::CryptoProvider {
        self.crypto
    }

    fn rand(&self) -> &Self::RandProvider {
        self.crypto
    }

    fn storage(&self) -> &Self::StorageProvider {
        self.storage
    }
}

/// A decrypted MLS message, ready for the runtime to act on.
#[derive(Debug)]
pub enum EngineMessage {
    /// Application payload with its authenticated sender.
    Application { sender: PublicKey, payload: Vec<u8> },
    /// Proposal stored in the pending queue until a commit references it.
    Proposal { sender: PublicKey },
    /// A commit processed but not merged; run the admin policy first.
    StagedCommitReady {
        staged: Box<StagedCommit>,
        sender: Credential,
    },
    /// External join proposals are not part of the Marmot flow.
    ExternalJoin,
}

/// A freshly generated key package with both halves.
pub struct GeneratedKeyPackage {
    pub key_package: KeyPackage,
    /// TLS serialization of the public half, for the kind-443 event.
    pub tls_bytes: Vec<u8>,
    /// 32-byte hash reference identifying the package in welcomes.
    pub hash_ref: Vec<u8>,
    /// Opaque private half; stored until a welcome consumes it.
    pub private_state: Vec<u8>,
}

/// One MLS group: OpenMLS state, signer, and the engine sidecar.
pub struct MlsEngine {
    crypto: RustCrypto,
    storage: MemoryStorage,
    group: MlsGroup,
    signer: SignatureKeyPair,
    group_data: MarmotGroupData,
    exporter_secrets: BTreeMap<u64, Vec<u8>>,
    exporter_window: u64,
    own_pubkey: PublicKey,
}

impl MlsEngine {
    /// Create a new group with the caller as sole member.
    ///
    /// The MLS group id is freshly random, independent of the routing id
    /// inside `group_data`.
    pub fn create(
        own_pubkey: PublicKey,
        group_data: MarmotGroupData,
        ciphersuite: Ciphersuite,
        exporter_window: u64,
    ) -> Result<Self, MlsEngineError> {
        let crypto = RustCrypto::default();
        let storage = MemoryStorage::default();

        let credential = BasicCredential::new(own_pubkey.to_bytes().to_vec());
        let signer = SignatureKeyPair::new(ciphersuite.signature_algorithm())?;
        signer.store(&storage)?;
        let credential_with_key = CredentialWithKey {
            credential: credential.into(),
            signature_key: signer.to_public_vec().into(),
        };

        let extensions = Extensions::from_vec(vec![
            Extension::Unknown(
                MARMOT_GROUP_DATA_EXTENSION_TYPE,
                UnknownExtension(group_data.encode()?),
            ),
            Extension::RequiredCapabilities(RequiredCapabilitiesExtension::new(
                &GROUP_CONTEXT_REQUIRED_EXTENSIONS,
                &[],
                &[CredentialType::Basic],
            )),
        ])?;

        let config = MlsGroupCreateConfig::builder()
            .ciphersuite(ciphersuite)
            .use_ratchet_tree_extension(true)
            // Keep message secrets for as many past epochs as exporter
            // secrets, so late envelopes stay readable end to end.
            .max_past_epochs(exporter_window as usize)
            .capabilities(capabilities(ciphersuite))
            .with_group_context_extensions(extensions)?
            .build();

        let mut mls_group_id = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut mls_group_id);

        let group = {
            let provider = Provider {
                crypto: &crypto,
                storage: &storage,
            };
            MlsGroup::new_with_group_id(
                &provider,
                &signer,
                &config,
                GroupId::from_slice(&mls_group_id),
                credential_with_key,
            )?
        };

        let mut engine = Self {
            crypto,
            storage,
            group,
            signer,
            group_data,
            exporter_secrets: BTreeMap::new(),
            exporter_window,
            own_pubkey,
        };
        engine.refresh_exporter_secret()?;
        Ok(engine)
    }

    /// Join a group using a welcome and the private half of one of our key
    /// packages.
    pub fn join_from_welcome(
        welcome_bytes: &[u8],
        private_state: &[u8],
        exporter_window: u64,
    ) -> Result<Self, MlsEngineError> {
        let secrets = KeyPackageSecrets::from_bytes(private_state)?;
        let storage = secrets.restore_storage()?;
        let crypto = RustCrypto::default();

        let welcome = parse_welcome(welcome_bytes)?;
        let group = {
            let provider = Provider {
                crypto: &crypto,
                storage: &storage,
            };
            let config = MlsGroupJoinConfig::builder()
                .max_past_epochs(exporter_window as usize)
                .build();
            StagedWelcome::new_from_welcome(&provider, &config, welcome, None)?
                .into_group(&provider)?
        };

        let signature_public_key = secrets.signature_public_key_bytes()?;
        let signer = SignatureKeyPair::read(
            &storage,
            &signature_public_key,
            group.ciphersuite().signature_algorithm(),
        )
        .ok_or(MlsEngineError::SignerNotFound)?;

        let group_data = group_data_from_extensions(group.extensions())?;
        let own_pubkey = own_pubkey_of(&group)?;

        let mut engine = Self {
            crypto,
            storage,
            group,
            signer,
            group_data,
            exporter_secrets: BTreeMap::new(),
            exporter_window,
            own_pubkey,
        };
        engine.refresh_exporter_secret()?;
        debug!(
            group = %hex::encode(engine.group.group_id().as_slice()),
            epoch = engine.epoch(),
            "joined group from welcome"
        );
        Ok(engine)
    }

    /// Restore an engine from a persisted snapshot.
    pub fn from_snapshot(bytes: &[u8], exporter_window: u64) -> Result<Self, MlsEngineError> {
        let snapshot = GroupSnapshot::from_bytes(bytes)?;
        let storage = snapshot.restore_storage()?;
        let crypto = RustCrypto::default();

        let group_id = snapshot.mls_group_id_bytes()?;
        let group = MlsGroup::load(&storage, &GroupId::from_slice(&group_id))?
            .ok_or(MlsEngineError::GroupNotLoaded)?;

        let signature_public_key = snapshot.signature_public_key_bytes()?;
        let signer = SignatureKeyPair::read(
            &storage,
            &signature_public_key,
            group.ciphersuite().signature_algorithm(),
        )
        .ok_or(MlsEngineError::SignerNotFound)?;

        let group_data = group_data_from_extensions(group.extensions())?;
        let own_pubkey = own_pubkey_of(&group)?;

        Ok(Self {
            crypto,
            storage,
            group,
            signer,
            group_data,
            exporter_secrets: snapshot.exporter_secrets_bytes()?,
            exporter_window,
            own_pubkey,
        })
    }

    /// Serialize the full engine state for the group-state store.
    pub fn snapshot(&self) -> Result<Vec<u8>, MlsEngineError> {
        let snapshot = GroupSnapshot::capture(
            &self.storage,
            self.group.group_id().as_slice(),
            &self.signer.to_public_vec(),
            &self.exporter_secrets,
        )?;
        Ok(snapshot.to_bytes()?)
    }

    // ─────────────────────────── Accessors ───────────────────────────

    pub fn epoch(&self) -> u64 {
        self.group.epoch().as_u64()
    }

    pub fn mls_group_id(&self) -> &[u8] {
        self.group.group_id().as_slice()
    }

    pub fn nostr_group_id(&self) -> &[u8; 32] {
        &self.group_data.nostr_group_id
    }

    pub fn group_data(&self) -> &MarmotGroupData {
        &self.group_data
    }

    pub fn own_pubkey(&self) -> PublicKey {
        self.own_pubkey
    }

    /// Nostr keys of all current members.
    pub fn members(&self) -> Vec<PublicKey> {
        self.group
            .members()
            .filter_map(|m| policy::pubkey_from_credential(&m.credential).ok())
            .collect()
    }

    /// Exporter secrets, newest epoch first, for trial decryption.
    pub fn exporter_secrets_desc(&self) -> impl Iterator<Item = (u64, &[u8])> {
        self.exporter_secrets
            .iter()
            .rev()
            .map(|(epoch, secret)| (*epoch, secret.as_slice()))
    }

    /// Exporter secret of the current epoch, for sealing outbound envelopes.
    pub fn current_exporter_secret(&self) -> Result<&[u8], MlsEngineError> {
        self.exporter_secrets
            .get(&self.epoch())
            .map(Vec::as_slice)
            .ok_or(MlsEngineError::MissingExporterSecret)
    }

    // ─────────────────────────── Outbound ───────────────────────────

    /// Encrypt an application payload under the current epoch.
    ///
    /// Advances the local sender ratchet; callers persist the snapshot
    /// afterwards.
    pub fn create_application_message(&mut self, payload: &[u8]) -> Result<Vec<u8>, MlsEngineError> {
        let provider = Provider {
            crypto: &self.crypto,
            storage: &self.storage,
        };
        let message = self
            .group
            .create_message(&provider, &self.signer, payload)?;
        Ok(message.to_bytes()?)
    }

    /// Queue an add proposal and return its serialized handshake message.
    pub fn propose_add(&mut self, key_package: &KeyPackage) -> Result<Vec<u8>, MlsEngineError> {
        let provider = Provider {
            crypto: &self.crypto,
            storage: &self.storage,
        };
        let (message, _ref) = self
            .group
            .propose_add_member(&provider, &self.signer, key_package)?;
        Ok(message.to_bytes()?)
    }

    /// Queue a remove proposal for the member with the given Nostr key.
    pub fn propose_remove(&mut self, member: &PublicKey) -> Result<Vec<u8>, MlsEngineError> {
        let index = self
            .leaf_index_of(member)
            .ok_or(MlsEngineError::MemberNotFound)?;
        let provider = Provider {
            crypto: &self.crypto,
            storage: &self.storage,
        };
        let (message, _ref) = self
            .group
            .propose_remove_member(&provider, &self.signer, index)?;
        Ok(message.to_bytes()?)
    }

    /// Queue a self-update proposal rotating our own leaf.
    pub fn propose_self_update(&mut self) -> Result<Vec<u8>, MlsEngineError> {
        let provider = Provider {
            crypto: &self.crypto,
            storage: &self.storage,
        };
        let (message, _ref) = self.group.propose_self_update(
            &provider,
            &self.signer,
            LeafNodeParameters::default(),
        )?;
        Ok(message.to_bytes()?)
    }

    /// Commit all pending proposals without merging.
    ///
    /// Returns the serialized commit and, when members were added, the
    /// serialized welcome. The commit stays pending until
    /// [`merge_pending`](Self::merge_pending).
    pub fn commit_to_pending(&mut self) -> Result<(Vec<u8>, Option<Vec<u8>>), MlsEngineError> {
        let provider = Provider {
            crypto: &self.crypto,
            storage: &self.storage,
        };
        let (commit, welcome, _group_info) = self
            .group
            .commit_to_pending_proposals(&provider, &self.signer)?;
        let commit_bytes = commit.to_bytes()?;
        let welcome_bytes = welcome.map(|w| w.to_bytes()).transpose()?;
        Ok((commit_bytes, welcome_bytes))
    }

    /// Merge the pending commit: the point where the epoch advances.
    pub fn merge_pending(&mut self) -> Result<(), MlsEngineError> {
        {
            let provider = Provider {
                crypto: &self.crypto,
                storage: &self.storage,
            };
            self.group.merge_pending_commit(&provider)?;
        }
        self.group_data = group_data_from_extensions(self.group.extensions())?;
        self.refresh_exporter_secret()?;
        Ok(())
    }

    /// Drop the pending commit after a failed publish; state is unchanged.
    pub fn clear_pending(&mut self) -> Result<(), MlsEngineError> {
        self.group.clear_pending_commit(&self.storage)?;
        Ok(())
    }

    /// Drop queued proposals that never made it into a commit.
    pub fn clear_pending_proposals(&mut self) -> Result<(), MlsEngineError> {
        self.group.clear_pending_proposals(&self.storage)?;
        Ok(())
    }

    /// Shared crypto provider, for validating foreign key packages.
    pub fn crypto(&self) -> &RustCrypto {
        &self.crypto
    }

    // ─────────────────────────── Inbound ───────────────────────────

    /// TLS-decode envelope plaintext into a protocol message for this group.
    pub fn parse_protocol_message(
        &self,
        bytes: &[u8],
    ) -> Result<ProtocolMessage, MlsEngineError> {
        let (message, _) = MlsMessageIn::tls_deserialize_bytes(bytes)?;
        let protocol: ProtocolMessage = message.try_into_protocol_message()?;
        if protocol.group_id().as_slice() != self.group.group_id().as_slice() {
            return Err(MlsEngineError::WrongGroup);
        }
        Ok(protocol)
    }

    /// Process a protocol message through OpenMLS.
    ///
    /// Commits are returned staged, unmerged; the caller runs the admin
    /// policy and then either merges or drops them.
    pub fn process(&mut self, message: ProtocolMessage) -> Result<EngineMessage, MlsEngineError> {
        let provider = Provider {
            crypto: &self.crypto,
            storage: &self.storage,
        };
        let processed = self.group.process_message(&provider, message)?;
        let credential = processed.credential().clone();

        match processed.into_content() {
            ProcessedMessageContent::ApplicationMessage(application) => {
                let sender = policy::pubkey_from_credential(&credential)?;
                Ok(EngineMessage::Application {
                    sender,
                    payload: application.into_bytes(),
                })
            }
            ProcessedMessageContent::ProposalMessage(proposal) => {
                self.group
                    .store_pending_proposal(provider.storage(), proposal.as_ref().clone())?;
                let sender = policy::pubkey_from_credential(&credential)?;
                Ok(EngineMessage::Proposal { sender })
            }
            ProcessedMessageContent::StagedCommitMessage(staged) => {
                Ok(EngineMessage::StagedCommitReady {
                    staged,
                    sender: credential,
                })
            }
            ProcessedMessageContent::ExternalJoinProposalMessage(_) => {
                Ok(EngineMessage::ExternalJoin)
            }
        }
    }

    /// Merge a staged commit that passed the admin policy.
    ///
    /// Returns true when the commit removed us from the group.
    pub fn merge_commit(&mut self, staged: Box<StagedCommit>) -> Result<bool, MlsEngineError> {
        let removed = staged.self_removed();
        {
            let provider = Provider {
                crypto: &self.crypto,
                storage: &self.storage,
            };
            self.group.merge_staged_commit(&provider, *staged)?;
        }
        self.group_data = group_data_from_extensions(self.group.extensions())?;
        self.refresh_exporter_secret()?;
        Ok(removed)
    }

    // ─────────────────────────── Internal ───────────────────────────

    fn leaf_index_of(&self, member: &PublicKey) -> Option<LeafNodeIndex> {
        self.group.members().find_map(|m| {
            match policy::pubkey_from_credential(&m.credential) {
                Ok(key) if key == *member => Some(m.index),
                _ => None,
            }
        })
    }

    fn refresh_exporter_secret(&mut self) -> Result<(), MlsEngineError> {
        let epoch = self.epoch();
        let provider = Provider {
            crypto: &self.crypto,
            storage: &self.storage,
        };
        let secret = self.group.export_secret(
            &provider,
            EXPORTER_LABEL,
            EXPORTER_CONTEXT,
            EXPORTER_SECRET_LENGTH,
        )?;
        self.exporter_secrets.insert(epoch, secret);
        let horizon = epoch.saturating_sub(self.exporter_window);
        self.exporter_secrets.retain(|e, _| *e >= horizon);
        Ok(())
    }
}

fn capabilities(ciphersuite: Ciphersuite) -> Capabilities {
    Capabilities::new(
        None,
        Some(&[ciphersuite]),
        Some(&SUPPORTED_EXTENSIONS),
        None,
        Some(&[CredentialType::Basic]),
    )
}

fn own_pubkey_of(group: &MlsGroup) -> Result<PublicKey, MlsEngineError> {
    let leaf = group
        .own_leaf_node()
        .ok_or(MlsEngineError::OwnLeafNotFound)?;
    Ok(policy::pubkey_from_credential(leaf.credential())?)
}

fn group_data_from_extensions(
    extensions: &Extensions,
) -> Result<MarmotGroupData, MlsEngineError> {
    let data = extensions
        .iter()
        .find_map(|ext| match ext {
            Extension::Unknown(MARMOT_GROUP_DATA_EXTENSION_TYPE, data) => Some(data),
            _ => None,
        })
        .ok_or(MlsEngineError::GroupDataMissing)?;
    Ok(MarmotGroupData::decode(&data.0)?)
}

/// Generate a key package bound to `owner`, with the last-resort marker so
/// it may be consumed more than once if a relay serves it twice.
pub fn generate_key_package(
    owner: PublicKey,
    ciphersuite: Ciphersuite,
) -> Result<GeneratedKeyPackage, MlsEngineError> {
    let crypto = RustCrypto::default();
    let storage = MemoryStorage::default();

    let credential = BasicCredential::new(owner.to_bytes().to_vec());
    let signer = SignatureKeyPair::new(ciphersuite.signature_algorithm())?;
    signer.store(&storage)?;
    let credential_with_key = CredentialWithKey {
        credential: credential.into(),
        signature_key: signer.to_public_vec().into(),
    };

    let provider = Provider {
        crypto: &crypto,
        storage: &storage,
    };
    let bundle = KeyPackage::builder()
        .leaf_node_capabilities(capabilities(ciphersuite))
        .mark_as_last_resort()
        .build(ciphersuite, &provider, &signer, credential_with_key)?;

    let key_package = bundle.key_package().clone();
    let tls_bytes = key_package.tls_serialize_detached()?;
    let hash_ref = key_package
        .hash_ref(provider.crypto())?
        .as_slice()
        .to_vec();

    let secrets = KeyPackageSecrets::capture(&storage, &signer.to_public_vec())?;
    Ok(GeneratedKeyPackage {
        key_package,
        tls_bytes,
        hash_ref,
        private_state: secrets.to_bytes()?,
    })
}

/// TLS-decode welcome bytes into an MLS [`Welcome`].
pub fn parse_welcome(bytes: &[u8]) -> Result<Welcome, MlsEngineError> {
    let (message, _) = MlsMessageIn::tls_deserialize_bytes(bytes)?;
    match message.extract() {
        MlsMessageBodyIn::Welcome(welcome) => Ok(welcome),
        _ => Err(MlsEngineError::UnexpectedMessageType),
    }
}

/// Key-package hash references a welcome is addressed to.
pub fn welcome_new_member_refs(welcome: &Welcome) -> Vec<Vec<u8>> {
    welcome
        .secrets()
        .iter()
        .map(|s| s.new_member().as_slice().to_vec())
        .collect()
}

/// Read the group data a welcome would install, without joining.
///
/// Requires the private half of a key package the welcome is addressed to;
/// the staged state is dropped after the extension is read.
pub fn preview_welcome(
    welcome_bytes: &[u8],
    private_state: &[u8],
) -> Result<MarmotGroupData, MlsEngineError> {
    let secrets = KeyPackageSecrets::from_bytes(private_state)?;
    let storage = secrets.restore_storage()?;
    let crypto = RustCrypto::default();
    let provider = Provider {
        crypto: &crypto,
        storage: &storage,
    };

    let welcome = parse_welcome(welcome_bytes)?;
    let config = MlsGroupJoinConfig::builder().build();
    let processed = openmls::group::ProcessedWelcome::new_from_welcome(&provider, &config, welcome)?;
    group_data_from_extensions(processed.unverified_group_info().extensions())
}
