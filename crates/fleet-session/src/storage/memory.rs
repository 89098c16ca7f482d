//! In-memory slave directory and module catalog.

use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    sync::RwLock,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::{ModuleCatalog, ModuleId, ModuleVersion, SlaveDirectory, SlaveId, StorageError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Directory entry for a known slave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveRecord {
    pub id: SlaveId,
    pub name: String,
    pub description: Option<String>,
    pub address: IpAddr,
    pub registered_on: DateTime<Utc>,
    pub last_connection_on: Option<DateTime<Utc>>,
}

/// In-memory slave directory.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart.
pub struct MemoryDirectory {
    slaves: RwLock<HashMap<SlaveId, SlaveRecord>>,
}

impl MemoryDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slaves: RwLock::new(HashMap::new()),
        }
    }

    /// Get a slave record by id.
    ///
    /// # Errors
    /// Returns error if the lock is poisoned.
    pub fn get(&self, id: SlaveId) -> Result<Option<SlaveRecord>, StorageError> {
        Ok(self
            .slaves
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(&id)
            .cloned())
    }

    /// All known slaves, oldest registration first.
    ///
    /// # Errors
    /// Returns error if the lock is poisoned.
    pub fn list(&self) -> Result<Vec<SlaveRecord>, StorageError> {
        let mut result: Vec<SlaveRecord> = self
            .slaves
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .values()
            .cloned()
            .collect();
        result.sort_by(|a, b| a.registered_on.cmp(&b.registered_on));
        Ok(result)
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SlaveDirectory for MemoryDirectory {
    async fn resolve_or_register_slave(&self, address: IpAddr) -> Result<SlaveId, StorageError> {
        let mut slaves = self
            .slaves
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        if let Some(existing) = slaves.values().find(|s| s.address == address) {
            return Ok(existing.id);
        }

        let now = Utc::now();
        let record = SlaveRecord {
            id: Uuid::new_v4(),
            name: format!("Unknown slave ({address})"),
            description: None,
            address,
            registered_on: now,
            last_connection_on: None,
        };
        let id = record.id;
        slaves.insert(id, record);

        tracing::info!(slave_id = %id, source = %address, "Registered new slave");
        Ok(id)
    }

    async fn record_connection(
        &self,
        slave_id: SlaveId,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut slaves = self
            .slaves
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let slave = slaves
            .get_mut(&slave_id)
            .ok_or_else(|| StorageError::NotFound(format!("slave {slave_id}")))?;
        slave.last_connection_on = Some(at);

        Ok(())
    }
}

/// In-memory module catalog.
pub struct MemoryCatalog {
    versions: RwLock<Vec<ModuleVersion>>,
    assignments: RwLock<HashSet<(SlaveId, ModuleId)>>,
}

impl MemoryCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self {
            versions: RwLock::new(Vec::new()),
            assignments: RwLock::new(HashSet::new()),
        }
    }

    /// Record a module version.
    ///
    /// # Errors
    /// Returns `Conflict` if the module already has a version with the
    /// same 4-part number.
    pub fn register_version(&self, version: ModuleVersion) -> Result<(), StorageError> {
        let mut versions = self
            .versions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        if versions
            .iter()
            .any(|v| v.module_id == version.module_id && v.key() == version.key())
        {
            return Err(StorageError::Conflict(format!(
                "module {} version {version} already exists",
                version.module_id
            )));
        }

        versions.push(version);
        Ok(())
    }

    /// Assign a module to a slave. Returns `false` if already assigned.
    ///
    /// # Errors
    /// Returns error if the lock is poisoned.
    pub fn assign(&self, slave_id: SlaveId, module_id: ModuleId) -> Result<bool, StorageError> {
        Ok(self
            .assignments
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .insert((slave_id, module_id)))
    }

    /// Remove an assignment. Returns `false` if it did not exist.
    ///
    /// # Errors
    /// Returns error if the lock is poisoned.
    pub fn unassign(&self, slave_id: SlaveId, module_id: ModuleId) -> Result<bool, StorageError> {
        Ok(self
            .assignments
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .remove(&(slave_id, module_id)))
    }
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModuleCatalog for MemoryCatalog {
    async fn list_versions(&self, module_id: ModuleId) -> Result<Vec<ModuleVersion>, StorageError> {
        Ok(self
            .versions
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .iter()
            .filter(|v| v.module_id == module_id)
            .cloned()
            .collect())
    }

    async fn get_assignment(
        &self,
        slave_id: SlaveId,
        module_id: ModuleId,
    ) -> Result<bool, StorageError> {
        Ok(self
            .assignments
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .contains(&(slave_id, module_id)))
    }

    async fn list_assignments(&self, slave_id: SlaveId) -> Result<Vec<ModuleId>, StorageError> {
        let mut modules: Vec<ModuleId> = self
            .assignments
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .iter()
            .filter(|(slave, _)| *slave == slave_id)
            .map(|(_, module)| *module)
            .collect();
        modules.sort_unstable();
        Ok(modules)
    }
}
