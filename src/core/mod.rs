//! Core provisioning logic.
//!
//! This module contains:
//! - Plan: Step and plan definitions, retry policy, readiness specs
//! - Classify: Backend failure classification
//! - Poller: Bounded readiness polling
//! - Orchestrator: Per-target single-flight execution engine

pub mod classify;
pub mod error;
pub mod orchestrator;
pub mod plan;
pub mod poller;

// Re-export commonly used types
pub use classify::{classify, Classification};
pub use error::{ErrorKind, ProvisionError};
pub use orchestrator::Orchestrator;
pub use plan::{
    action_fn, probe_fn, Idempotency, Plan, PlanSummary, ReadinessProbe, ReadinessSpec,
    RetryPolicy, Step, StepAction, StepContext, StepOutput,
};
pub use poller::{PollError, PollReport, ReadinessPoller};
