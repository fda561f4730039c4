//! Provision records.
//!
//! One record exists per (plan, target identity). It caches the outcome
//! of provisioning that target and is never removed while the process
//! runs.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::error::ProvisionError;

use super::events::{EventType, ProvisionEvent};

/// Key of a record in the orchestrator's table
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RecordKey {
    pub plan: String,
    pub target: String,
}

impl RecordKey {
    pub fn new(plan: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            plan: plan.into(),
            target: target.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.plan, self.target)
    }
}

/// Lifecycle of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionStatus {
    NotStarted,
    InProgress,
    Ready,
    Failed,
}

impl Default for ProvisionStatus {
    fn default() -> Self {
        Self::NotStarted
    }
}

/// Durable result of a successful plan execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultHandle {
    /// Output of the plan's result step (ARN, URL, payload, ...)
    pub value: String,

    /// Output of every step, by step name
    pub outputs: BTreeMap<String, String>,
}

impl ResultHandle {
    pub fn output(&self, step: &str) -> Option<&str> {
        self.outputs.get(step).map(String::as_str)
    }
}

impl fmt::Display for ResultHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// Cached provisioning state of one target
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionRecord {
    pub key: RecordKey,

    pub status: ProvisionStatus,

    /// Set once the record reaches Ready
    pub result: Option<ResultHandle>,

    /// Error of the last failed execution
    pub last_error: Option<ProvisionError>,

    /// Number of plan executions started for this target
    pub executions: u32,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Events of the current and the previous execution only
    pub history: Vec<ProvisionEvent>,
}

impl ProvisionRecord {
    pub fn new(key: RecordKey) -> Self {
        let now = Utc::now();
        Self {
            key,
            status: ProvisionStatus::NotStarted,
            result: None,
            last_error: None,
            executions: 0,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }

    /// Move to InProgress and open a new execution.
    ///
    /// Returns the execution number, or `None` if the record is not
    /// in a startable state. Events older than the previous execution
    /// are dropped, so a target that keeps failing does not grow its
    /// history without bound.
    pub fn begin(&mut self) -> Option<u32> {
        match self.status {
            ProvisionStatus::NotStarted | ProvisionStatus::Failed => {
                let previous = self.executions;
                self.history.retain(|e| e.execution >= previous);
                self.executions += 1;
                self.status = ProvisionStatus::InProgress;
                self.result = None;
                self.touch();
                Some(self.executions)
            }
            ProvisionStatus::InProgress | ProvisionStatus::Ready => None,
        }
    }

    /// InProgress -> Ready
    pub fn complete(&mut self, handle: ResultHandle) {
        debug_assert_eq!(self.status, ProvisionStatus::InProgress);
        self.status = ProvisionStatus::Ready;
        self.result = Some(handle);
        self.last_error = None;
        self.touch();
    }

    /// InProgress -> Failed
    pub fn fail(&mut self, error: ProvisionError) {
        debug_assert_eq!(self.status, ProvisionStatus::InProgress);
        self.status = ProvisionStatus::Failed;
        self.result = None;
        self.last_error = Some(error);
        self.touch();
    }

    /// Ready/Failed -> NotStarted. Returns false if the record was
    /// InProgress (left untouched) and true otherwise.
    pub fn reset(&mut self) -> bool {
        match self.status {
            ProvisionStatus::InProgress => false,
            ProvisionStatus::NotStarted => true,
            ProvisionStatus::Ready | ProvisionStatus::Failed => {
                self.status = ProvisionStatus::NotStarted;
                self.result = None;
                self.last_error = None;
                self.push(ProvisionEvent::new(
                    self.executions,
                    None,
                    EventType::RecordReset,
                    format!("Record {} reset", self.key),
                ));
                true
            }
        }
    }

    pub fn push(&mut self, event: ProvisionEvent) {
        self.history.push(event);
        self.touch();
    }

    /// Events of one execution, in order
    pub fn events_for(&self, execution: u32) -> impl Iterator<Item = &ProvisionEvent> {
        self.history.iter().filter(move |e| e.execution == execution)
    }

    pub fn is_ready(&self) -> bool {
        self.status == ProvisionStatus::Ready
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(value: &str) -> ResultHandle {
        ResultHandle {
            value: value.to_string(),
            outputs: BTreeMap::from([("create-queue".to_string(), value.to_string())]),
        }
    }

    #[test]
    fn test_record_lifecycle() {
        let mut record = ProvisionRecord::new(RecordKey::new("queue-ensure", "demo-queue"));
        assert_eq!(record.status, ProvisionStatus::NotStarted);

        assert_eq!(record.begin(), Some(1));
        assert_eq!(record.status, ProvisionStatus::InProgress);
        assert_eq!(record.begin(), None);

        record.complete(handle("http://localhost:4566/000000000000/demo-queue"));
        assert!(record.is_ready());
        assert_eq!(record.begin(), None);
        assert_eq!(
            record.result.as_ref().unwrap().output("create-queue"),
            Some("http://localhost:4566/000000000000/demo-queue")
        );
    }

    #[test]
    fn test_failed_record_restarts() {
        let mut record = ProvisionRecord::new(RecordKey::new("bucket-ensure", "demo-bucket"));
        record.begin();
        record.fail(ProvisionError::ExecutionAborted {
            plan: "bucket-ensure".to_string(),
            target: "demo-bucket".to_string(),
        });
        assert_eq!(record.status, ProvisionStatus::Failed);
        assert!(record.last_error.is_some());

        assert_eq!(record.begin(), Some(2));
        assert_eq!(record.executions, 2);
    }

    #[test]
    fn test_reset() {
        let mut record = ProvisionRecord::new(RecordKey::new("topic-ensure", "demo-topic"));
        record.begin();
        assert!(!record.reset());
        assert_eq!(record.status, ProvisionStatus::InProgress);

        record.complete(handle("arn"));
        assert!(record.reset());
        assert_eq!(record.status, ProvisionStatus::NotStarted);
        assert!(record.result.is_none());
        assert_eq!(record.history.last().unwrap().event_type, EventType::RecordReset);
    }

    #[test]
    fn test_history_keeps_two_executions() {
        let mut record = ProvisionRecord::new(RecordKey::new("queue-ensure", "q"));

        for _ in 0..100 {
            let execution = record.begin().unwrap();
            record.push(ProvisionEvent::new(
                execution,
                None,
                EventType::ExecutionStarted,
                "started".to_string(),
            ));
            record.fail(ProvisionError::ExecutionAborted {
                plan: "queue-ensure".to_string(),
                target: "q".to_string(),
            });
        }

        assert_eq!(record.executions, 100);
        let kept: Vec<u32> = record.history.iter().map(|e| e.execution).collect();
        assert_eq!(kept, vec![99, 100]);
    }

    #[test]
    fn test_key_display() {
        assert_eq!(RecordKey::new("table-ensure", "users").to_string(), "table-ensure/users");
    }
}
