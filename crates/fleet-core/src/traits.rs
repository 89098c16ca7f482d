//! Collaborator traits and identifiers.

use std::{net::IpAddr, pin::Pin};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::AsyncRead;
use uuid::Uuid;

use crate::module::{ModuleVersion, ModuleVersionItem};

/// Ephemeral transport identity of one connection.
pub type SessionId = String;

/// Durable fleet-wide slave identity, stable across reconnects.
pub type SlaveId = Uuid;

/// Module identifier.
pub type ModuleId = u32;

/// Readable module package.
pub type ModuleStream = Pin<Box<dyn AsyncRead + Send>>;

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid storage locator: {0}")]
    InvalidLocator(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Error delivering a call to a connected slave.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Send failed: {0}")]
    Send(String),
}

/// Durable directory of known slaves.
#[async_trait]
pub trait SlaveDirectory: Send + Sync {
    /// Look up the slave registered for `address`, registering a new one if absent.
    async fn resolve_or_register_slave(&self, address: IpAddr) -> Result<SlaveId, StorageError>;

    /// Record that the slave connected at `at`.
    async fn record_connection(&self, slave_id: SlaveId, at: DateTime<Utc>)
    -> Result<(), StorageError>;
}

/// Module versions and slave assignments.
#[async_trait]
pub trait ModuleCatalog: Send + Sync {
    /// All stored versions of a module, in no particular order.
    async fn list_versions(&self, module_id: ModuleId) -> Result<Vec<ModuleVersion>, StorageError>;

    /// Whether `module_id` is assigned to `slave_id`.
    async fn get_assignment(&self, slave_id: SlaveId, module_id: ModuleId)
    -> Result<bool, StorageError>;

    /// Modules assigned to a slave.
    async fn list_assignments(&self, slave_id: SlaveId) -> Result<Vec<ModuleId>, StorageError>;
}

/// Read-only access to stored module packages.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Open the package named by `locator`.
    ///
    /// Concurrent opens of the same locator must be safe.
    async fn open_for_read(&self, locator: &str) -> Result<ModuleStream, StorageError>;
}

/// Handle to the remote end of one slave connection.
///
/// Implemented by the transport layer. All calls are one-shot; none of
/// them retries.
#[async_trait]
pub trait SlaveCallback: Send + Sync {
    /// Whether the underlying transport is still open.
    fn is_open(&self) -> bool;

    /// Tell the slave its connection is being aborted.
    async fn abort_connection(&self) -> Result<(), TransportError>;

    /// Close the transport. Must be idempotent.
    fn close(&self);

    /// Stream a module package to the slave.
    async fn push_module(
        &self,
        module: ModuleVersionItem,
        payload: ModuleStream,
    ) -> Result<(), TransportError>;

    /// Ask the slave to undeploy a module.
    async fn undeploy_module(&self, module_id: ModuleId) -> Result<(), TransportError>;

    /// Forward an opaque script to the slave.
    async fn execute_script(&self, script: &str) -> Result<(), TransportError>;
}
