//! Backend integrations.
//!
//! Every backend (storage, queue, topic, table, function, API builder) is
//! reached through the [`ResourceClient`] capability set. The orchestrator
//! only depends on this contract, never on a concrete transport.

pub mod emulator;
pub mod localstack;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use emulator::{EmulatorClient, Operation};
pub use localstack::HealthProbe;

/// Kind of remote resource a request targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Bucket,
    Queue,
    Topic,
    Subscription,
    Table,
    Function,
    RestApi,
    ApiResource,
    Deployment,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bucket => "bucket",
            Self::Queue => "queue",
            Self::Topic => "topic",
            Self::Subscription => "subscription",
            Self::Table => "table",
            Self::Function => "function",
            Self::RestApi => "rest_api",
            Self::ApiResource => "api_resource",
            Self::Deployment => "deployment",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to an existing remote resource.
///
/// `scope` carries the owning resource where identities are only unique
/// inside a parent (e.g. a REST API resource id inside its API).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub identity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, identity: impl Into<String>) -> Self {
        Self {
            kind,
            identity: identity.into(),
            scope: None,
        }
    }

    pub fn scoped(kind: ResourceKind, scope: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            kind,
            identity: identity.into(),
            scope: Some(scope.into()),
        }
    }
}

/// Desired resource passed to [`ResourceClient::create_or_get`]
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceSpec {
    Bucket {
        name: String,
        region: String,
    },
    Queue {
        name: String,
    },
    Topic {
        name: String,
    },
    Subscription {
        topic_arn: String,
        protocol: String,
        endpoint: String,
    },
    Table {
        name: String,
        hash_key: String,
        read_capacity: i64,
        write_capacity: i64,
    },
    Function {
        name: String,
        runtime: String,
        handler: String,
        role: String,
        code: Vec<u8>,
    },
    RestApi {
        name: String,
        description: String,
    },
    ApiResource {
        api_id: String,
        parent_id: String,
        path_part: String,
    },
    Deployment {
        api_id: String,
        stage_name: String,
    },
}

impl ResourceSpec {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Bucket { .. } => ResourceKind::Bucket,
            Self::Queue { .. } => ResourceKind::Queue,
            Self::Topic { .. } => ResourceKind::Topic,
            Self::Subscription { .. } => ResourceKind::Subscription,
            Self::Table { .. } => ResourceKind::Table,
            Self::Function { .. } => ResourceKind::Function,
            Self::RestApi { .. } => ResourceKind::RestApi,
            Self::ApiResource { .. } => ResourceKind::ApiResource,
            Self::Deployment { .. } => ResourceKind::Deployment,
        }
    }
}

/// In-place change applied through [`ResourceClient::mutate`]
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    PutMethod {
        http_method: String,
        authorization: String,
    },
    PutIntegration {
        http_method: String,
        integration_type: String,
        integration_http_method: String,
        uri: String,
    },
    PutMethodResponse {
        http_method: String,
        status_code: String,
        response_models: BTreeMap<String, String>,
    },
    PutIntegrationResponse {
        http_method: String,
        status_code: String,
        response_templates: BTreeMap<String, String>,
    },
    Invoke {
        payload: serde_json::Value,
    },
}

impl Change {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PutMethod { .. } => "put_method",
            Self::PutIntegration { .. } => "put_integration",
            Self::PutMethodResponse { .. } => "put_method_response",
            Self::PutIntegrationResponse { .. } => "put_integration_response",
            Self::Invoke { .. } => "invoke",
        }
    }
}

/// Whether `create_or_get` made a new resource or found one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateOutcome {
    Created,
    AlreadyExisted,
}

/// Result of `create_or_get`
#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    /// Durable identifier (ARN, URL, id) of the resource
    pub identity: String,

    pub outcome: CreateOutcome,

    /// Extra backend-reported attributes
    pub attributes: BTreeMap<String, String>,
}

impl Created {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            outcome: CreateOutcome::Created,
            attributes: BTreeMap::new(),
        }
    }

    pub fn existing(identity: impl Into<String>) -> Self {
        Self {
            outcome: CreateOutcome::AlreadyExisted,
            ..Self::new(identity)
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Backend-reported lifecycle state of a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Absent,
    Pending,
    Active,
    Failed,
    Other(String),
}

impl ResourceState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Absent => "absent",
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Failed => "failed",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a resource returned by `describe`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub state: ResourceState,

    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl StateSnapshot {
    pub fn new(state: ResourceState) -> Self {
        Self {
            state,
            attributes: BTreeMap::new(),
        }
    }

    pub fn absent() -> Self {
        Self::new(ResourceState::Absent)
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn is_active(&self) -> bool {
        self.state == ResourceState::Active
    }
}

/// Result of `mutate`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationOutput {
    pub status_code: Option<u16>,
    pub payload: Option<String>,
}

/// Error reported by a backend.
///
/// `code` is the backend's own error code and is what failure
/// classification looks at; `message` is never inspected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ResourceError {
    pub code: String,
    pub message: String,
    pub http_status: Option<u16>,

    /// Identity of the conflicting resource, when the backend reports it
    pub existing_identity: Option<String>,
}

impl ResourceError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            http_status: None,
            existing_identity: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_existing(mut self, identity: impl Into<String>) -> Self {
        self.existing_identity = Some(identity.into());
        self
    }

    /// Missing output of an earlier step
    pub fn missing_dependency(step: &str) -> Self {
        Self::new(
            codes::MISSING_DEPENDENCY,
            format!("no output recorded for required step '{}'", step),
        )
    }
}

/// Error codes produced by this crate itself rather than a backend
pub mod codes {
    pub const MISSING_DEPENDENCY: &str = "MissingDependency";
    pub const CODE_UNAVAILABLE: &str = "CodeUnavailable";
}

/// Capability contract of a backend resource service
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Create the resource, or return the existing one with the same name
    async fn create_or_get(&self, spec: &ResourceSpec) -> Result<Created, ResourceError>;

    /// Report the current state of a resource
    async fn describe(&self, resource: &ResourceRef) -> Result<StateSnapshot, ResourceError>;

    /// Apply a change to an existing resource
    async fn mutate(
        &self,
        resource: &ResourceRef,
        change: &Change,
    ) -> Result<MutationOutput, ResourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_error_display_uses_code() {
        let err = ResourceError::new("BucketAlreadyOwnedByYou", "bucket demo-bucket exists")
            .with_status(409);
        assert_eq!(err.to_string(), "BucketAlreadyOwnedByYou: bucket demo-bucket exists");
        assert_eq!(err.http_status, Some(409));
    }

    #[test]
    fn test_snapshot_attributes() {
        let snapshot = StateSnapshot::new(ResourceState::Active).with_attribute("arn", "arn:x");
        assert!(snapshot.is_active());
        assert_eq!(snapshot.attribute("arn"), Some("arn:x"));
        assert_eq!(snapshot.attribute("missing"), None);
    }

    #[test]
    fn test_spec_kind() {
        let spec = ResourceSpec::Queue {
            name: "demo-queue".to_string(),
        };
        assert_eq!(spec.kind(), ResourceKind::Queue);
        assert_eq!(spec.kind().to_string(), "queue");
    }
}
