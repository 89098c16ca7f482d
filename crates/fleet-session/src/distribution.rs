//! Module version resolution and delivery to connected slaves.

use std::sync::Arc;

use fleet_core::{
    BlobStore, ModuleCatalog, ModuleId, ModuleStream, ModuleVersion, SlaveConfiguration, SlaveId,
};

use crate::{
    error::{MasterError, Result},
    registry::SessionRegistry,
    session::SlaveSession,
};

/// Outcome of a push-style operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The call was delivered to the slave's transport.
    Delivered,
    /// No ready session for the slave; nothing was sent.
    SlaveOffline,
}

/// A module package opened for download.
pub struct ModulePayload {
    pub version: ModuleVersion,
    pub stream: ModuleStream,
}

impl std::fmt::Debug for ModulePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModulePayload")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Resolves module versions and delivers modules and commands to slaves.
///
/// Transfers run on a session handle taken out of the registry; no
/// registry lock is held while a payload is streamed. Delivery failures
/// leave the registry untouched.
pub struct DistributionCoordinator {
    registry: Arc<SessionRegistry>,
    catalog: Arc<dyn ModuleCatalog>,
    blobs: Arc<dyn BlobStore>,
}

impl DistributionCoordinator {
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry>,
        catalog: Arc<dyn ModuleCatalog>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            registry,
            catalog,
            blobs,
        }
    }

    /// Stream a module version to the slave's ready session.
    ///
    /// # Errors
    /// Returns `Storage` if the package cannot be opened and `Transport`
    /// if streaming fails.
    pub async fn push_module(&self, slave_id: SlaveId, version: &ModuleVersion) -> Result<Delivery> {
        let Some(session) = self.registry.find_ready_by_slave(slave_id) else {
            tracing::debug!(slave_id = %slave_id, module_id = version.module_id, "Push skipped, slave offline");
            return Ok(Delivery::SlaveOffline);
        };

        let stream = self.blobs.open_for_read(&version.storage_locator).await?;
        session
            .callback()
            .push_module(version.item(), stream)
            .await
            .inspect_err(|e| {
                tracing::warn!(
                    session_id = %session.session_id(),
                    module_id = version.module_id,
                    "Module push failed: {e}"
                );
            })?;

        tracing::info!(
            session_id = %session.session_id(),
            slave_id = %slave_id,
            module_id = version.module_id,
            version = %version,
            "Module pushed"
        );
        Ok(Delivery::Delivered)
    }

    /// Ask the slave's ready session to undeploy a module.
    ///
    /// # Errors
    /// Returns `Transport` if the command cannot be delivered.
    pub async fn undeploy_module(&self, slave_id: SlaveId, module_id: ModuleId) -> Result<Delivery> {
        let Some(session) = self.registry.find_ready_by_slave(slave_id) else {
            tracing::debug!(slave_id = %slave_id, module_id, "Undeploy skipped, slave offline");
            return Ok(Delivery::SlaveOffline);
        };

        session.callback().undeploy_module(module_id).await?;
        tracing::info!(session_id = %session.session_id(), module_id, "Undeploy sent");
        Ok(Delivery::Delivered)
    }

    /// Forward an opaque script to the slave's ready session.
    ///
    /// # Errors
    /// Returns `Transport` if the script cannot be delivered.
    pub async fn execute_script(&self, slave_id: SlaveId, script: &str) -> Result<Delivery> {
        let Some(session) = self.registry.find_ready_by_slave(slave_id) else {
            tracing::debug!(slave_id = %slave_id, "Script skipped, slave offline");
            return Ok(Delivery::SlaveOffline);
        };

        session.callback().execute_script(script).await?;
        tracing::info!(
            session_id = %session.session_id(),
            script_len = script.len(),
            "Script sent"
        );
        Ok(Delivery::Delivered)
    }

    /// The newest version of a module.
    ///
    /// # Errors
    /// Returns `ModuleNotFound` if the module has no versions.
    pub async fn resolve_current_version(&self, module_id: ModuleId) -> Result<ModuleVersion> {
        let versions = self.catalog.list_versions(module_id).await?;
        ModuleVersion::current(versions).ok_or(MasterError::ModuleNotFound(module_id))
    }

    /// Whether a module is assigned to a slave.
    ///
    /// # Errors
    /// Returns `Storage` if the catalog lookup fails.
    pub async fn has_assignment(&self, slave_id: SlaveId, module_id: ModuleId) -> Result<bool> {
        Ok(self.catalog.get_assignment(slave_id, module_id).await?)
    }

    /// Current versions of every module assigned to a slave.
    ///
    /// Assigned modules without any version are skipped.
    ///
    /// # Errors
    /// Returns `Storage` if the catalog lookup fails.
    pub async fn configuration_for(&self, slave_id: SlaveId) -> Result<SlaveConfiguration> {
        let mut versions = Vec::new();
        for module_id in self.catalog.list_assignments(slave_id).await? {
            match self.resolve_current_version(module_id).await {
                Ok(version) => versions.push(version),
                Err(MasterError::ModuleNotFound(_)) => {
                    tracing::debug!(slave_id = %slave_id, module_id, "Assigned module has no version");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(SlaveConfiguration::from_versions(&versions))
    }

    /// Open the current version of a module for a session's download.
    ///
    /// # Errors
    /// Returns `Unauthorized` if the module is not assigned to the
    /// session's slave, `ModuleNotFound` if it has no version, and
    /// `Storage` if the package cannot be opened.
    pub async fn module_stream(
        &self,
        session: &SlaveSession,
        module_id: ModuleId,
    ) -> Result<ModulePayload> {
        let slave_id = session.slave_id();
        if !self.has_assignment(slave_id, module_id).await? {
            tracing::warn!(
                session_id = %session.session_id(),
                slave_id = %slave_id,
                module_id,
                "Rejected download of unassigned module"
            );
            return Err(MasterError::Unauthorized {
                slave_id,
                module_id,
            });
        }

        let version = self.resolve_current_version(module_id).await?;
        let stream = self.blobs.open_for_read(&version.storage_locator).await?;
        Ok(ModulePayload { version, stream })
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use std::{net::IpAddr, time::Duration};

    use fleet_core::SlaveCallback;
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::{
        storage::{MemoryCatalog, MemoryDirectory},
        test_support::{EchoBlobStore, RecordingCallback, Sent},
    };

    struct Fixture {
        registry: Arc<SessionRegistry>,
        catalog: Arc<MemoryCatalog>,
        coordinator: DistributionCoordinator,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(MemoryDirectory::new()),
            Duration::from_secs(30),
        ));
        let catalog = Arc::new(MemoryCatalog::new());
        let coordinator = DistributionCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&catalog) as Arc<dyn ModuleCatalog>,
            Arc::new(EchoBlobStore),
        );
        Fixture {
            registry,
            catalog,
            coordinator,
        }
    }

    async fn connect(
        registry: &SessionRegistry,
        callback: Arc<RecordingCallback>,
    ) -> Arc<SlaveSession> {
        registry
            .add("s1".to_string(), IpAddr::from([10, 1, 1, 1]), callback as Arc<dyn SlaveCallback>)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_resolve_current_version() {
        let f = fixture();
        for (major, minor, build, revision) in [(1, 2, 0, 0), (1, 2, 0, 5), (2, 0, 0, 0), (1, 9, 9, 9)] {
            f.catalog
                .register_version(ModuleVersion::new(7, major, minor, build, revision))
                .unwrap();
        }

        let current = f.coordinator.resolve_current_version(7).await.unwrap();
        assert_eq!(current.key(), (2, 0, 0, 0));

        let err = f.coordinator.resolve_current_version(8).await.unwrap_err();
        assert!(matches!(err, MasterError::ModuleNotFound(8)));
    }

    #[tokio::test]
    async fn test_push_module_streams_payload() {
        let f = fixture();
        let callback = RecordingCallback::new();
        let session = connect(&f.registry, Arc::clone(&callback)).await;
        let version = ModuleVersion::new(7, 2, 0, 0, 0);

        let delivery = f
            .coordinator
            .push_module(session.slave_id(), &version)
            .await
            .unwrap();

        assert_eq!(delivery, Delivery::Delivered);
        assert_eq!(
            callback.sent(),
            vec![Sent::PushModule {
                module: version.item(),
                payload: b"7/2.0.0.0.zpg".to_vec(),
            }]
        );
    }

    #[tokio::test]
    async fn test_push_to_offline_slave_is_noop() {
        let f = fixture();
        let delivery = f
            .coordinator
            .push_module(SlaveId::new_v4(), &ModuleVersion::new(7, 1, 0, 0, 0))
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::SlaveOffline);

        let delivery = f
            .coordinator
            .undeploy_module(SlaveId::new_v4(), 7)
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::SlaveOffline);
    }

    #[tokio::test]
    async fn test_transport_failure_leaves_session_registered() {
        let f = fixture();
        let session = connect(&f.registry, RecordingCallback::failing()).await;

        let err = f
            .coordinator
            .execute_script(session.slave_id(), "Get-Process")
            .await
            .unwrap_err();

        assert!(matches!(err, MasterError::Transport(_)));
        assert!(f.registry.get("s1").is_some());
        assert!(session.is_ready());
    }

    #[tokio::test]
    async fn test_undeploy_and_script_are_forwarded() {
        let f = fixture();
        let callback = RecordingCallback::new();
        let session = connect(&f.registry, Arc::clone(&callback)).await;

        f.coordinator.undeploy_module(session.slave_id(), 3).await.unwrap();
        f.coordinator
            .execute_script(session.slave_id(), "Restart-Service fleet")
            .await
            .unwrap();

        assert_eq!(
            callback.sent(),
            vec![
                Sent::UndeployModule(3),
                Sent::ExecuteScript("Restart-Service fleet".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_module_stream_requires_assignment_then_version() {
        let f = fixture();
        let session = connect(&f.registry, RecordingCallback::new()).await;

        let err = f.coordinator.module_stream(&session, 7).await.unwrap_err();
        assert!(matches!(err, MasterError::Unauthorized { module_id: 7, .. }));

        f.catalog.assign(session.slave_id(), 7).unwrap();
        let err = f.coordinator.module_stream(&session, 7).await.unwrap_err();
        assert!(matches!(err, MasterError::ModuleNotFound(7)));

        f.catalog.register_version(ModuleVersion::new(7, 1, 0, 0, 0)).unwrap();
        f.catalog.register_version(ModuleVersion::new(7, 1, 1, 0, 0)).unwrap();
        let mut payload = f.coordinator.module_stream(&session, 7).await.unwrap();
        assert_eq!(payload.version.key(), (1, 1, 0, 0));

        let mut contents = String::new();
        payload.stream.read_to_string(&mut contents).await.unwrap();
        assert_eq!(contents, "7/1.1.0.0.zpg");
    }

    #[tokio::test]
    async fn test_configuration_skips_modules_without_versions() {
        let f = fixture();
        let session = connect(&f.registry, RecordingCallback::new()).await;
        f.catalog.assign(session.slave_id(), 1).unwrap();
        f.catalog.assign(session.slave_id(), 2).unwrap();
        f.catalog.register_version(ModuleVersion::new(1, 3, 0, 0, 0)).unwrap();

        let config = f.coordinator.configuration_for(session.slave_id()).await.unwrap();
        assert_eq!(config.modules.len(), 1);
        assert_eq!(config.modules[0].module_id, 1);
        assert_eq!(config.modules[0].major, 3);
    }
}
