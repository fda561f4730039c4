//! Provisioning events.
//!
//! Every state change of a ProvisionRecord is recorded as an immutable
//! event in the record's in-memory history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single entry in a record's history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// Execution number this event belongs to (1-based; 0 for resets)
    pub execution: u32,

    /// Step name (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable summary
    pub summary: String,

    /// Time taken in milliseconds (for finished steps)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Error message if failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProvisionEvent {
    /// Create a new event with the current timestamp
    pub fn new(execution: u32, step: Option<&str>, event_type: EventType, summary: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            execution,
            step: step.map(str::to_string),
            event_type,
            summary,
            duration_ms: None,
            error: None,
        }
    }

    /// Create an event with duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Create an event with error information
    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

/// Types of events recorded during provisioning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A plan execution started
    ExecutionStarted,

    /// All steps finished; record is Ready
    ExecutionCompleted,

    /// A step aborted the plan; record is Failed
    ExecutionFailed,

    /// A step action is about to run
    StepStarted,

    /// A step action succeeded
    StepCompleted,

    /// A step failed with AlreadyExists and was treated as done
    StepAlreadySatisfied,

    /// A step failed transiently and will be retried
    StepRetrying,

    /// A step failed permanently
    StepFailed,

    /// Readiness poll saw the target state
    ReadinessReached,

    /// Readiness poll ran out of attempts
    ReadinessTimedOut,

    /// Record was explicitly reset to NotStarted
    RecordReset,
}
