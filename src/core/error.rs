//! Caller-facing provisioning errors.

use serde::Serialize;
use thiserror::Error;

/// Coarse outcome class of a provisioning error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Hard failure; retrying without changes will not help
    Fatal,

    /// Readiness budget exhausted; the resource may still converge
    Timeout,

    /// The caller stopped waiting; the execution itself carries on
    Abandoned,
}

/// Errors surfaced by the orchestrator.
///
/// `Clone` because a single execution outcome is handed to every caller
/// waiting on the same target.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum ProvisionError {
    #[error("Unknown plan '{plan}'")]
    UnknownPlan { plan: String },

    #[error("Plan '{plan}' is already registered")]
    DuplicatePlan { plan: String },

    #[error("Invalid plan '{plan}': {reason}")]
    InvalidPlan { plan: String, reason: String },

    #[error("Step '{step}' of plan '{plan}' failed for '{target}' after {attempts} attempt(s): {code}: {detail}")]
    StepFailed {
        plan: String,
        target: String,
        step: String,
        code: String,
        detail: String,
        attempts: u32,
    },

    #[error("Step '{step}' of plan '{plan}' not ready for '{target}' after {attempts} poll(s) (last state: {last_state})")]
    NotReady {
        plan: String,
        target: String,
        step: String,
        attempts: u32,
        last_state: String,
    },

    #[error("Gave up waiting {waited_ms}ms for plan '{plan}' on '{target}'; execution continues")]
    WaitElapsed {
        plan: String,
        target: String,
        waited_ms: u64,
    },

    #[error("Execution of plan '{plan}' for '{target}' ended without an outcome")]
    ExecutionAborted { plan: String, target: String },

    #[error("Plan '{plan}' for '{target}' is in progress and cannot be reset")]
    ResetWhileInProgress { plan: String, target: String },
}

impl ProvisionError {
    /// Classify for storage on a ProvisionRecord
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotReady { .. } => ErrorKind::Timeout,
            Self::WaitElapsed { .. } => ErrorKind::Abandoned,
            _ => ErrorKind::Fatal,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    /// Name of the failing step, if the error came from one
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::StepFailed { step, .. } | Self::NotReady { step, .. } => Some(step),
            _ => None,
        }
    }
}
