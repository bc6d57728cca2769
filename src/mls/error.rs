//! Error types for the MLS engine.

use openmls::error::LibraryError;
use openmls::extensions::errors::InvalidExtensionError;
use openmls::group::{
    NewGroupError, ProposeRemoveMemberError, ProposeSelfUpdateError,
    WelcomeError as MlsWelcomeError,
};
use openmls::prelude::{
    CommitToPendingProposalsError, CreateMessageError, ExportSecretError, KeyPackageNewError,
    MergeCommitError, MergePendingCommitError, ProcessMessageError, ProposeAddMemberError,
};
use openmls_rust_crypto::MemoryStorageError;
use openmls_traits::types::CryptoError;

use super::policy::PolicyError;
use super::snapshot::SnapshotError;
use crate::extension::ExtensionError;

/// Errors from MLS engine operations.
#[derive(Debug, thiserror::Error)]
pub enum MlsEngineError {
    #[error("Failed to create MLS group: {0}")]
    CreateGroup(#[from] NewGroupError<MemoryStorageError>),

    #[error("Failed to join MLS group: {0}")]
    JoinGroup(#[from] MlsWelcomeError<MemoryStorageError>),

    #[error("Failed to create MLS message: {0}")]
    CreateMessage(#[from] CreateMessageError),

    #[error("Failed to process MLS message: {0}")]
    ProcessMessage(#[from] ProcessMessageError),

    #[error("Failed to merge staged commit: {0}")]
    MergeCommit(#[from] MergeCommitError<MemoryStorageError>),

    #[error("Failed to merge pending commit: {0}")]
    MergePendingCommit(#[from] MergePendingCommitError<MemoryStorageError>),

    #[error("Failed to commit to pending proposals: {0}")]
    CommitToPendingProposals(#[from] CommitToPendingProposalsError<MemoryStorageError>),

    #[error("Failed to propose member addition: {0}")]
    ProposeAddMember(#[from] ProposeAddMemberError<MemoryStorageError>),

    #[error("Failed to propose member removal: {0}")]
    ProposeRemoveMember(#[from] ProposeRemoveMemberError<MemoryStorageError>),

    #[error("Failed to propose self update: {0}")]
    ProposeSelfUpdate(#[from] ProposeSelfUpdateError<MemoryStorageError>),

    #[error("Failed to create key package: {0}")]
    KeyPackageNew(#[from] KeyPackageNewError),

    #[error("Failed to derive exporter secret: {0}")]
    ExportSecret(#[from] ExportSecretError),

    #[error("Invalid extension configuration: {0}")]
    InvalidExtension(#[from] InvalidExtensionError),

    #[error("Unable to create signer: {0}")]
    Signer(#[from] CryptoError),

    #[error("MLS storage error: {0}")]
    Storage(#[from] MemoryStorageError),

    #[error("Failed to serialize MLS message: {0}")]
    MlsMessage(#[from] openmls::framing::errors::MlsMessageError),

    #[error("Failed to deserialize MLS payload: {0}")]
    TlsCodec(#[from] tls_codec::Error),

    #[error("Failed to convert to protocol message: {0}")]
    ProtocolMessage(#[from] openmls::framing::errors::ProtocolMessageError),

    #[error(transparent)]
    Library(#[from] LibraryError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Extension(#[from] ExtensionError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("Group data extension missing from group context")]
    GroupDataMissing,

    #[error("No MLS group state found for this group id")]
    GroupNotLoaded,

    #[error("Signature keypair not found in storage")]
    SignerNotFound,

    #[error("Own leaf node missing from ratchet tree")]
    OwnLeafNotFound,

    #[error("Member not found in group")]
    MemberNotFound,

    #[error("Message belongs to a different group")]
    WrongGroup,

    #[error("Unexpected MLS message type")]
    UnexpectedMessageType,

    #[error("No exporter secret for the current epoch")]
    MissingExporterSecret,
}
