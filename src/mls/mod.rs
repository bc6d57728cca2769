//! MLS engine: the only code that talks to OpenMLS directly.
//!
//! - [`MlsEngine`] - per-group state (OpenMLS group, storage, signer,
//!   exporter-secret window) with create/join/process/commit operations
//! - [`policy`] - admin policy gating commits
//! - [`snapshot`] - opaque persistence format for the group-state store

mod engine;
mod error;
pub mod policy;
pub mod snapshot;

pub use engine::{
    generate_key_package, parse_welcome, preview_welcome, welcome_new_member_refs,
    EngineMessage, GeneratedKeyPackage, MlsEngine,
};
pub use error::MlsEngineError;
