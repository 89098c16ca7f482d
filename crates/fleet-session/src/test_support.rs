//! Test doubles shared by the unit tests.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use fleet_core::{
    BlobStore, ModuleId, ModuleStream, ModuleVersionItem, SlaveCallback, StorageError,
    TransportError,
};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;

/// Call recorded by [`RecordingCallback`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    AbortConnection,
    PushModule {
        module: ModuleVersionItem,
        payload: Vec<u8>,
    },
    UndeployModule(ModuleId),
    ExecuteScript(String),
}

/// Slave callback that records every delivered call.
pub struct RecordingCallback {
    open: AtomicBool,
    failing: bool,
    sent: Mutex<Vec<Sent>>,
}

impl RecordingCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(true),
            failing: false,
            sent: Mutex::new(Vec::new()),
        })
    }

    /// A callback whose every delivery fails.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(true),
            failing: true,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    fn record(&self, call: Sent) -> Result<(), TransportError> {
        if self.failing {
            return Err(TransportError::Send("connection reset".to_string()));
        }
        self.sent.lock().push(call);
        Ok(())
    }
}

#[async_trait]
impl SlaveCallback for RecordingCallback {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn abort_connection(&self) -> Result<(), TransportError> {
        self.record(Sent::AbortConnection)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    async fn push_module(
        &self,
        module: ModuleVersionItem,
        mut payload: ModuleStream,
    ) -> Result<(), TransportError> {
        let mut bytes = Vec::new();
        payload.read_to_end(&mut bytes).await?;
        self.record(Sent::PushModule {
            module,
            payload: bytes,
        })
    }

    async fn undeploy_module(&self, module_id: ModuleId) -> Result<(), TransportError> {
        self.record(Sent::UndeployModule(module_id))
    }

    async fn execute_script(&self, script: &str) -> Result<(), TransportError> {
        self.record(Sent::ExecuteScript(script.to_string()))
    }
}

/// Blob store serving the locator itself as the package contents.
pub struct EchoBlobStore;

#[async_trait]
impl BlobStore for EchoBlobStore {
    async fn open_for_read(&self, locator: &str) -> Result<ModuleStream, StorageError> {
        Ok(Box::pin(std::io::Cursor::new(locator.as_bytes().to_vec())))
    }
}
