//! Domain types for the provisioning orchestrator.
//!
//! This module contains the core data structures:
//! - Events: Immutable records of provisioning progress
//! - Record: Cached provisioning state per (plan, target)

pub mod events;
pub mod record;

// Re-export commonly used types
pub use events::{EventType, ProvisionEvent};
pub use record::{ProvisionRecord, ProvisionStatus, RecordKey, ResultHandle};
