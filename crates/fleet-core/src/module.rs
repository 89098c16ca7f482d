//! Versioned module records.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::traits::ModuleId;

/// Sort key of a module version: `(major, minor, build, revision)`.
pub type VersionKey = (u32, u32, u32, u32);

/// A stored version of a deployable module.
///
/// Versions of one module are unique by their 4-part number; the
/// collaborator store enforces this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleVersion {
    /// Module this version belongs to.
    pub module_id: ModuleId,
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub revision: u32,
    /// Blob store locator of the package.
    pub storage_locator: String,
}

impl ModuleVersion {
    /// Create a version record with the conventional storage locator.
    #[must_use]
    pub fn new(module_id: ModuleId, major: u32, minor: u32, build: u32, revision: u32) -> Self {
        let mut version = Self {
            module_id,
            major,
            minor,
            build,
            revision,
            storage_locator: String::new(),
        };
        version.storage_locator = version.default_locator();
        version
    }

    /// Replace the storage locator.
    #[must_use]
    pub fn with_locator(mut self, locator: impl Into<String>) -> Self {
        self.storage_locator = locator.into();
        self
    }

    /// Ordering key, compared lexicographically.
    #[must_use]
    pub const fn key(&self) -> VersionKey {
        (self.major, self.minor, self.build, self.revision)
    }

    /// Locator of the form `<module>/<major>.<minor>.<build>.<revision>.zpg`.
    #[must_use]
    pub fn default_locator(&self) -> String {
        format!("{}/{self}.zpg", self.module_id)
    }

    /// Wire description of this version (without the locator).
    #[must_use]
    pub const fn item(&self) -> ModuleVersionItem {
        ModuleVersionItem {
            module_id: self.module_id,
            major: self.major,
            minor: self.minor,
            build: self.build,
            revision: self.revision,
        }
    }

    /// Pick the current version: the maximum under `(major, minor, build, revision)`.
    #[must_use]
    pub fn current<I>(versions: I) -> Option<Self>
    where
        I: IntoIterator<Item = Self>,
    {
        versions.into_iter().max_by_key(Self::key)
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

/// Module version as announced to a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleVersionItem {
    pub module_id: ModuleId,
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub revision: u32,
}

/// Modules a slave should be running, sent back on connect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveConfiguration {
    pub modules: Vec<ModuleVersionItem>,
}

impl SlaveConfiguration {
    /// Build a configuration from resolved versions.
    #[must_use]
    pub fn from_versions<'a, I>(versions: I) -> Self
    where
        I: IntoIterator<Item = &'a ModuleVersion>,
    {
        Self {
            modules: versions.into_iter().map(ModuleVersion::item).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(major: u32, minor: u32, build: u32, revision: u32) -> ModuleVersion {
        ModuleVersion::new(7, major, minor, build, revision)
    }

    #[test]
    fn test_current_is_lexicographic_maximum() {
        let versions = vec![v(1, 2, 0, 0), v(1, 2, 0, 5), v(2, 0, 0, 0), v(1, 9, 9, 9)];
        let current = ModuleVersion::current(versions).unwrap();
        assert_eq!(current.key(), (2, 0, 0, 0));
    }

    #[test]
    fn test_current_compares_later_components_on_tie() {
        let versions = vec![v(3, 1, 4, 1), v(3, 1, 4, 10), v(3, 1, 2, 99)];
        assert_eq!(ModuleVersion::current(versions).unwrap().key(), (3, 1, 4, 10));
    }

    #[test]
    fn test_current_of_empty_set() {
        assert!(ModuleVersion::current(Vec::new()).is_none());
    }

    #[test]
    fn test_default_locator() {
        let version = v(1, 2, 3, 4);
        assert_eq!(version.storage_locator, "7/1.2.3.4.zpg");
        assert_eq!(version.to_string(), "1.2.3.4");
    }

    #[test]
    fn test_configuration_serialization() {
        let config = SlaveConfiguration::from_versions(&[v(1, 0, 0, 0)]);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"module_id\":7"));
        assert!(!json.contains("zpg"));
    }
}
