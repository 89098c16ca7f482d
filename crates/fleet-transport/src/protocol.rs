//! Wire protocol between slaves and the master.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use fleet_core::{ModuleId, ModuleVersionItem, SlaveConfiguration};
use serde::{Deserialize, Serialize};

/// Size of a raw module chunk before base64 encoding.
pub const MODULE_CHUNK_SIZE: usize = 64 * 1024;

/// Message from slave to master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlaveMessage {
    /// Heartbeat.
    Ping,
    /// Orderly disconnect.
    Disconnect,
    /// Download the current version of an assigned module.
    GetModule { module_id: ModuleId },
    /// Opaque application message (base64 encoded).
    PushMessage { data: String },
}

impl SlaveMessage {
    /// Create a push message from raw bytes.
    #[must_use]
    pub fn push_message(data: &[u8]) -> Self {
        Self::PushMessage {
            data: BASE64.encode(data),
        }
    }

    /// Decode push message data from base64.
    #[must_use]
    pub fn decode_push(&self) -> Option<Vec<u8>> {
        if let Self::PushMessage { data } = self {
            BASE64.decode(data).ok()
        } else {
            None
        }
    }
}

/// Message from master to slave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MasterMessage {
    /// Modules the slave should run, sent once after connect.
    Configuration {
        session_id: String,
        configuration: SlaveConfiguration,
    },
    /// Heartbeat reply.
    Pong,
    /// A module transfer begins.
    ModuleStart { module: ModuleVersionItem },
    /// Module package data (base64 encoded).
    ModuleChunk { module_id: ModuleId, data: String },
    /// The module transfer is complete.
    ModuleEnd { module_id: ModuleId },
    /// Remove a module from the slave.
    UndeployModule { module_id: ModuleId },
    /// Run an opaque script.
    ExecuteScript { script: String },
    /// The master is closing this connection.
    AbortConnection,
    /// Error message.
    Error { message: String },
}

impl MasterMessage {
    /// Create a module chunk from raw bytes.
    #[must_use]
    pub fn module_chunk(module_id: ModuleId, data: &[u8]) -> Self {
        Self::ModuleChunk {
            module_id,
            data: BASE64.encode(data),
        }
    }

    /// Decode module chunk data from base64.
    #[must_use]
    pub fn decode_chunk(&self) -> Option<Vec<u8>> {
        if let Self::ModuleChunk { data, .. } = self {
            BASE64.decode(data).ok()
        } else {
            None
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}
