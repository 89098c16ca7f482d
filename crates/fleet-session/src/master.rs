//! Master facade consumed by the transport endpoint and the admin API.

use std::{net::IpAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use fleet_core::{
    BlobStore, MasterConfig, ModuleCatalog, ModuleId, ModuleVersion, OutboundMessage, SessionId,
    SlaveCallback, SlaveConfiguration, SlaveDirectory, SlaveId,
};
use tokio::sync::Notify;

use crate::{
    distribution::{Delivery, DistributionCoordinator, ModulePayload},
    error::{MasterError, Result},
    monitor::LivenessMonitor,
    registry::{SessionRegistry, Teardown},
    session::{SessionSummary, SlaveSession},
};

/// The master node: session registry, liveness and module distribution.
pub struct Master {
    registry: Arc<SessionRegistry>,
    distribution: DistributionCoordinator,
    wake: Arc<Notify>,
}

impl Master {
    /// Create a master over the given collaborators.
    #[must_use]
    pub fn new(
        config: &MasterConfig,
        directory: Arc<dyn SlaveDirectory>,
        catalog: Arc<dyn ModuleCatalog>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(directory, config.inactivity_timeout));
        let distribution = DistributionCoordinator::new(Arc::clone(&registry), catalog, blobs);
        Self {
            registry,
            distribution,
            wake: Arc::new(Notify::new()),
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn distribution(&self) -> &DistributionCoordinator {
        &self.distribution
    }

    /// Liveness monitor bound to this master's registry and wake signal.
    ///
    /// Spawn exactly one per master.
    #[must_use]
    pub fn liveness_monitor(&self) -> LivenessMonitor {
        LivenessMonitor::new(Arc::clone(&self.registry), Arc::clone(&self.wake))
    }

    /// Register a new slave connection and return its configuration.
    ///
    /// The configuration is computed before the session is installed, so
    /// a failed connect neither registers the new session nor kicks the
    /// existing one from the same address.
    ///
    /// # Errors
    /// Returns `Storage` if the directory or catalog cannot be queried.
    pub async fn on_connect(
        &self,
        session_id: SessionId,
        source_address: IpAddr,
        callback: Arc<dyn SlaveCallback>,
    ) -> Result<SlaveConfiguration> {
        let slave_id = self.registry.resolve_slave(source_address).await?;
        let configuration = self.distribution.configuration_for(slave_id).await?;
        self.registry
            .register(session_id, source_address, slave_id, callback)
            .await?;
        Ok(configuration)
    }

    /// Record a heartbeat.
    ///
    /// # Errors
    /// Returns `SessionNotFound` if the session is not registered.
    pub fn on_ping(&self, session_id: &str) -> Result<()> {
        self.session(session_id)?.ping()
    }

    /// Client-initiated disconnect: remove and close without notifying.
    ///
    /// # Errors
    /// Returns `SessionNotFound` if the session is already gone; callers
    /// may treat that as success.
    pub fn on_disconnect(&self, session_id: &str) -> Result<()> {
        match self.registry.disconnect(session_id) {
            Teardown::Performed => Ok(()),
            Teardown::AlreadyGone => Err(MasterError::SessionNotFound(session_id.to_string())),
        }
    }

    /// Queue a message pushed by the slave.
    ///
    /// # Errors
    /// Returns `SessionNotFound` if the session is not registered.
    pub fn on_message(&self, session_id: &str, payload: impl Into<Bytes>) -> Result<()> {
        let session = self.session(session_id)?;
        if session.outbound().push(OutboundMessage::new(payload)) {
            tracing::debug!(session_id, "Outbound queue full, dropped oldest message");
        }
        Ok(())
    }

    /// Take the queued messages of a session, oldest first.
    ///
    /// # Errors
    /// Returns `SessionNotFound` if the session is not registered.
    pub fn drain_messages(&self, session_id: &str) -> Result<Vec<OutboundMessage>> {
        Ok(self.session(session_id)?.outbound().drain())
    }

    /// Push a module version to a slave, if it is connected.
    ///
    /// # Errors
    /// Returns `Storage` or `Transport` if the transfer fails.
    pub async fn push_module(&self, slave_id: SlaveId, version: &ModuleVersion) -> Result<Delivery> {
        self.distribution.push_module(slave_id, version).await
    }

    /// Undeploy a module on a slave, if it is connected.
    ///
    /// # Errors
    /// Returns `Transport` if the command cannot be delivered.
    pub async fn undeploy_module(&self, slave_id: SlaveId, module_id: ModuleId) -> Result<Delivery> {
        self.distribution.undeploy_module(slave_id, module_id).await
    }

    /// Run a script on a slave, if it is connected.
    ///
    /// # Errors
    /// Returns `Transport` if the script cannot be delivered.
    pub async fn execute_script(&self, slave_id: SlaveId, script: &str) -> Result<Delivery> {
        self.distribution.execute_script(slave_id, script).await
    }

    /// The newest version of a module.
    ///
    /// # Errors
    /// Returns `ModuleNotFound` if the module has no versions.
    pub async fn resolve_current_version(&self, module_id: ModuleId) -> Result<ModuleVersion> {
        self.distribution.resolve_current_version(module_id).await
    }

    /// Open the current version of a module for download by a session.
    ///
    /// # Errors
    /// Returns `SessionNotFound` for an unknown session, `Unauthorized` if
    /// the module is not assigned to the session's slave and
    /// `ModuleNotFound` if it has no version.
    pub async fn get_module_stream(
        &self,
        module_id: ModuleId,
        session_id: &str,
    ) -> Result<ModulePayload> {
        let session = self.session(session_id)?;
        self.distribution.module_stream(&session, module_id).await
    }

    /// Recompute the configuration of a connected session.
    ///
    /// # Errors
    /// Returns `SessionNotFound` for an unknown session.
    pub async fn slave_configuration(&self, session_id: &str) -> Result<SlaveConfiguration> {
        let session = self.session(session_id)?;
        self.distribution
            .configuration_for(session.slave_id())
            .await
    }

    /// Last activity of the ready session from `address`, if any.
    #[must_use]
    pub fn query_last_activity(&self, address: IpAddr) -> Option<DateTime<Utc>> {
        self.registry
            .find_by_address(address)
            .filter(|s| s.is_ready())
            .map(|s| s.last_activity())
    }

    #[must_use]
    pub fn inactivity_timeout(&self) -> Duration {
        self.registry.inactivity_timeout()
    }

    /// Change the inactivity timeout of every session and wake the
    /// liveness monitor so the new value applies on the next sweep.
    pub fn set_inactivity_timeout(&self, timeout: Duration) {
        if self.registry.inactivity_timeout() == timeout {
            return;
        }
        self.registry.broadcast_timeout(timeout);
        self.wake.notify_one();

        tracing::info!(timeout_ms = timeout.as_millis(), "Inactivity timeout changed");
    }

    /// Administrative kick of a session.
    pub async fn abort_connection(&self, session_id: &str) -> Teardown {
        self.registry.abort(session_id).await
    }

    /// Summaries of all registered sessions.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionSummary> {
        self.registry
            .snapshot()
            .iter()
            .map(|s| s.summary())
            .collect()
    }

    fn session(&self, session_id: &str) -> Result<Arc<SlaveSession>> {
        self.registry
            .get(session_id)
            .ok_or_else(|| MasterError::SessionNotFound(session_id.to_string()))
    }
}
