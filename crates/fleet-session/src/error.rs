//! Master error type.

use fleet_core::{ModuleId, SessionId, SlaveId, StorageError, TransportError};

/// Error surfaced by master operations.
#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("No version recorded for module {0}")]
    ModuleNotFound(ModuleId),
    #[error("Slave not found: {0}")]
    SlaveNotFound(SlaveId),
    #[error("Module {module_id} is not assigned to slave {slave_id}")]
    Unauthorized { slave_id: SlaveId, module_id: ModuleId },
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl MasterError {
    /// Whether this is one of the not-found outcomes.
    ///
    /// Races such as ping-after-disconnect surface as not-found and are
    /// treated as success by teardown callers.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::SessionNotFound(_) | Self::ModuleNotFound(_) | Self::SlaveNotFound(_)
        )
    }
}

/// Result alias for master operations.
pub type Result<T, E = MasterError> = std::result::Result<T, E>;
