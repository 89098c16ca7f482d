//! Collaborator implementations.

pub mod fs;

#[cfg(feature = "memory")]
pub mod memory;

pub use fs::FsBlobStore;

#[cfg(feature = "memory")]
pub use memory::{MemoryCatalog, MemoryDirectory, SlaveRecord};
