//! Slave session management for the fleet master.
//!
//! Provides:
//! - `Master` - Facade used by the transport endpoint
//! - `SessionRegistry` - One session per source address
//! - `LivenessMonitor` - Background eviction of inactive sessions
//! - `DistributionCoordinator` - Module resolution and delivery
//! - Storage implementations (memory, filesystem)

pub mod distribution;
pub mod error;
pub mod master;
pub mod monitor;
pub mod registry;
pub mod session;
pub mod storage;

#[cfg(test)]
mod test_support;

pub use distribution::{Delivery, DistributionCoordinator, ModulePayload};
pub use error::{MasterError, Result};
pub use master::Master;
pub use monitor::LivenessMonitor;
pub use registry::{SessionRegistry, Teardown};
pub use session::{ConnectionState, SessionSummary, SlaveSession};
