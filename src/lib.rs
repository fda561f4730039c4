//! emugate - Idempotent provisioning for cloud-emulator resources
//!
//! Provisions storage buckets, queues, topics, tables, functions and a
//! REST API front end through ordered, idempotent plans.
//!
//! # Architecture
//!
//! The system is built around a single-flight orchestrator:
//! - Each plan runs at most once at a time per target identity
//! - Successful results are cached; concurrent callers share one execution
//! - Step failures are classified as already-satisfied, transient or fatal
//! - Eventually-consistent resources are polled until ready
//!
//! # Modules
//!
//! - `adapters`: Backend contract, in-process emulator, health probe
//! - `core`: Orchestration logic (Plan, Orchestrator, ReadinessPoller)
//! - `domain`: Data structures (ProvisionRecord, ProvisionEvent)
//! - `catalog`: The concrete plans
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Provision the demo queue from five concurrent callers
//! emugate ensure queue-ensure demo-queue --callers 5
//!
//! # Deploy and invoke the demo function
//! emugate invoke minha-funcao
//! ```

pub mod adapters;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use adapters::{EmulatorClient, ResourceClient, ResourceError};
pub use core::{Orchestrator, Plan, ProvisionError, Step};
pub use domain::{ProvisionRecord, ProvisionStatus, ResultHandle};
