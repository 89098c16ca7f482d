//! Core abstractions for the fleet master node.
//!
//! This crate provides the fundamental building blocks:
//! - `ModuleVersion` - Versioned module records and current-version resolution
//! - `OutboundQueue` - Bounded drop-oldest buffer of messages pushed by a slave
//! - `MasterConfig` - Process-wide configuration
//! - Directory, catalog, blob store and slave callback traits

pub mod config;
pub mod module;
pub mod outbound;
pub mod traits;

pub use config::{ConfigError, MasterConfig};
pub use module::{ModuleVersion, ModuleVersionItem, SlaveConfiguration, VersionKey};
pub use outbound::{OUTBOUND_CAPACITY, OutboundMessage, OutboundQueue};
pub use traits::{
    BlobStore, ModuleCatalog, ModuleId, ModuleStream, SessionId, SlaveCallback, SlaveDirectory,
    SlaveId, StorageError, TransportError,
};
