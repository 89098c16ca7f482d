//! Read-only filesystem blob store for module packages.

use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
};

use async_trait::async_trait;
use fleet_core::{BlobStore, ModuleStream, StorageError};

/// Blob store rooted at a module directory.
///
/// Locators are paths relative to the root, e.g. `7/1.2.0.5.zpg`.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root directory if it does not exist.
    ///
    /// # Errors
    /// Returns error if the directory cannot be created.
    pub async fn ensure_root(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Map a locator to a path under the root.
    ///
    /// # Errors
    /// Returns `InvalidLocator` for empty or absolute locators and for
    /// locators that would escape the root.
    pub fn resolve(&self, locator: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(locator.trim_start_matches('/'));
        let valid = relative.components().next().is_some()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StorageError::InvalidLocator(locator.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn open_for_read(&self, locator: &str) -> Result<ModuleStream, StorageError> {
        let path = self.resolve(locator)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::pin(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(format!("blob {locator}")))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}
