//! In-process cloud emulator.
//!
//! Implements [`ResourceClient`] for every resource kind with the
//! semantics the provisioning plans rely on: name-idempotent queues and
//! topics, owner conflicts for buckets, `ResourceInUseException` for
//! tables, tables and functions that converge from Pending to Active,
//! and a REST API resource tree whose calls have prerequisites.
//!
//! Every call is counted per [`Operation`], faults can be queued per
//! operation, and a fixed latency can be added to widen race windows.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::trace;
use uuid::Uuid;

use super::{
    Change, Created, MutationOutput, ResourceClient, ResourceError, ResourceKind, ResourceRef,
    ResourceSpec, ResourceState, StateSnapshot,
};

const ACCOUNT_ID: &str = "000000000000";

/// Backend operations, counted individually
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Operation {
    CreateBucket,
    HeadBucket,
    CreateQueue,
    GetQueueAttributes,
    CreateTopic,
    GetTopicAttributes,
    Subscribe,
    GetSubscriptionAttributes,
    CreateTable,
    DescribeTable,
    CreateFunction,
    GetFunction,
    Invoke,
    CreateRestApi,
    GetResources,
    CreateResource,
    GetResource,
    PutMethod,
    PutIntegration,
    PutMethodResponse,
    PutIntegrationResponse,
    CreateDeployment,
    GetStage,
}

#[derive(Debug)]
struct Converging {
    arn: String,
    /// Describes left that still report Pending
    pending_describes: u32,
}

impl Converging {
    fn observe(&mut self) -> ResourceState {
        if self.pending_describes > 0 {
            self.pending_describes -= 1;
            ResourceState::Pending
        } else {
            ResourceState::Active
        }
    }

    fn is_active(&self) -> bool {
        self.pending_describes == 0
    }
}

#[derive(Debug, Default)]
struct Topic {
    /// (protocol, endpoint) -> subscription ARN
    subscriptions: BTreeMap<(String, String), String>,
}

#[derive(Debug, Default)]
struct Method {
    integration: Option<String>,
    method_responses: BTreeSet<String>,
    integration_responses: BTreeSet<String>,
}

#[derive(Debug)]
struct ApiResource {
    parent_id: Option<String>,
    path_part: String,
    methods: BTreeMap<String, Method>,
}

#[derive(Debug)]
struct RestApi {
    name: String,
    root_id: String,
    resources: BTreeMap<String, ApiResource>,
    /// stage -> deployment id
    stages: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct CloudState {
    calls: HashMap<Operation, usize>,
    faults: HashMap<Operation, VecDeque<ResourceError>>,
    buckets: BTreeMap<String, String>,
    queues: BTreeMap<String, String>,
    topics: BTreeMap<String, Topic>,
    tables: BTreeMap<String, Converging>,
    functions: BTreeMap<String, Converging>,
    apis: BTreeMap<String, RestApi>,
}

impl CloudState {
    /// Count the call and pop a queued fault, if any
    fn enter(&mut self, op: Operation) -> Result<(), ResourceError> {
        *self.calls.entry(op).or_default() += 1;
        trace!(?op, "Emulator call");

        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    fn api(&mut self, api_id: &str) -> Result<&mut RestApi, ResourceError> {
        self.apis.get_mut(api_id).ok_or_else(|| {
            ResourceError::new("NotFoundException", format!("Invalid API identifier specified {}", api_id))
                .with_status(404)
        })
    }
}

/// In-memory backend implementing every resource kind
pub struct EmulatorClient {
    endpoint: String,
    region: String,
    table_activation_polls: u32,
    function_activation_polls: u32,
    latency: Duration,
    state: Mutex<CloudState>,
}

impl Default for EmulatorClient {
    fn default() -> Self {
        Self::new("http://localhost:4566", "sa-east-1")
    }
}

impl EmulatorClient {
    pub fn new(endpoint: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            region: region.into(),
            table_activation_polls: 0,
            function_activation_polls: 0,
            latency: Duration::ZERO,
            state: Mutex::new(CloudState::default()),
        }
    }

    /// New tables report Pending for this many describes
    pub fn with_table_activation_polls(mut self, polls: u32) -> Self {
        self.table_activation_polls = polls;
        self
    }

    /// New functions report Pending for this many describes
    pub fn with_function_activation_polls(mut self, polls: u32) -> Self {
        self.function_activation_polls = polls;
        self
    }

    /// Delay added to every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue a fault returned by the next call of `op`
    pub async fn inject_failure(&self, op: Operation, error: ResourceError) {
        self.state
            .lock()
            .await
            .faults
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Number of calls made to `op`
    pub async fn calls(&self, op: Operation) -> usize {
        self.state.lock().await.calls.get(&op).copied().unwrap_or(0)
    }

    /// Number of calls made to any operation
    pub async fn total_calls(&self) -> usize {
        self.state.lock().await.calls.values().sum()
    }

    /// All call counts, sorted by operation
    pub async fn call_counts(&self) -> BTreeMap<Operation, usize> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .map(|(op, n)| (*op, *n))
            .collect()
    }

    fn arn(&self, service: &str, resource: &str) -> String {
        format!("arn:aws:{}:{}:{}:{}", service, self.region, ACCOUNT_ID, resource)
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn create_op(spec: &ResourceSpec) -> Operation {
        match spec {
            ResourceSpec::Bucket { .. } => Operation::CreateBucket,
            ResourceSpec::Queue { .. } => Operation::CreateQueue,
            ResourceSpec::Topic { .. } => Operation::CreateTopic,
            ResourceSpec::Subscription { .. } => Operation::Subscribe,
            ResourceSpec::Table { .. } => Operation::CreateTable,
            ResourceSpec::Function { .. } => Operation::CreateFunction,
            ResourceSpec::RestApi { .. } => Operation::CreateRestApi,
            ResourceSpec::ApiResource { .. } => Operation::CreateResource,
            ResourceSpec::Deployment { .. } => Operation::CreateDeployment,
        }
    }

    fn describe_op(kind: ResourceKind) -> Operation {
        match kind {
            ResourceKind::Bucket => Operation::HeadBucket,
            ResourceKind::Queue => Operation::GetQueueAttributes,
            ResourceKind::Topic => Operation::GetTopicAttributes,
            ResourceKind::Subscription => Operation::GetSubscriptionAttributes,
            ResourceKind::Table => Operation::DescribeTable,
            ResourceKind::Function => Operation::GetFunction,
            ResourceKind::RestApi => Operation::GetResources,
            ResourceKind::ApiResource => Operation::GetResource,
            ResourceKind::Deployment => Operation::GetStage,
        }
    }

    fn mutate_op(change: &Change) -> Operation {
        match change {
            Change::PutMethod { .. } => Operation::PutMethod,
            Change::PutIntegration { .. } => Operation::PutIntegration,
            Change::PutMethodResponse { .. } => Operation::PutMethodResponse,
            Change::PutIntegrationResponse { .. } => Operation::PutIntegrationResponse,
            Change::Invoke { .. } => Operation::Invoke,
        }
    }

    fn create(&self, state: &mut CloudState, spec: &ResourceSpec) -> Result<Created, ResourceError> {
        match spec {
            ResourceSpec::Bucket { name, region } => {
                if state.buckets.contains_key(name) {
                    return Err(ResourceError::new(
                        "BucketAlreadyOwnedByYou",
                        "Your previous request to create the named bucket succeeded and you already own it.",
                    )
                    .with_status(409)
                    .with_existing(name.clone()));
                }
                state.buckets.insert(name.clone(), region.clone());
                Ok(Created::new(name.clone()).with_attribute("region", region.clone()))
            }

            ResourceSpec::Queue { name } => {
                if let Some(url) = state.queues.get(name) {
                    return Ok(Created::existing(url.clone()));
                }
                let url = format!("{}/{}/{}", self.endpoint, ACCOUNT_ID, name);
                state.queues.insert(name.clone(), url.clone());
                Ok(Created::new(url))
            }

            ResourceSpec::Topic { name } => {
                let arn = self.arn("sns", name);
                if state.topics.contains_key(&arn) {
                    return Ok(Created::existing(arn));
                }
                state.topics.insert(arn.clone(), Topic::default());
                Ok(Created::new(arn))
            }

            ResourceSpec::Subscription {
                topic_arn,
                protocol,
                endpoint,
            } => {
                let topic = state.topics.get_mut(topic_arn).ok_or_else(|| {
                    ResourceError::new("NotFound", format!("Topic does not exist: {}", topic_arn))
                        .with_status(404)
                })?;
                let key = (protocol.clone(), endpoint.clone());
                if let Some(arn) = topic.subscriptions.get(&key) {
                    return Ok(Created::existing(arn.clone()));
                }
                let arn = format!("{}:{}", topic_arn, Uuid::new_v4());
                topic.subscriptions.insert(key, arn.clone());
                Ok(Created::new(arn))
            }

            ResourceSpec::Table {
                name,
                hash_key,
                read_capacity,
                write_capacity,
            } => {
                if hash_key.is_empty() || *read_capacity <= 0 || *write_capacity <= 0 {
                    return Err(ResourceError::new(
                        "ValidationException",
                        "Table needs a hash key and positive provisioned throughput",
                    )
                    .with_status(400));
                }
                if let Some(table) = state.tables.get(name) {
                    return Err(ResourceError::new(
                        "ResourceInUseException",
                        format!("Table already exists: {}", name),
                    )
                    .with_status(400)
                    .with_existing(table.arn.clone()));
                }
                let arn = self.arn("dynamodb", &format!("table/{}", name));
                state.tables.insert(
                    name.clone(),
                    Converging {
                        arn: arn.clone(),
                        pending_describes: self.table_activation_polls,
                    },
                );
                Ok(Created::new(arn).with_attribute("hash_key", hash_key.clone()))
            }

            ResourceSpec::Function { name, role, .. } => {
                if role.is_empty() {
                    return Err(ResourceError::new(
                        "InvalidParameterValueException",
                        "A role is required",
                    )
                    .with_status(400));
                }
                if let Some(function) = state.functions.get(name) {
                    return Err(ResourceError::new(
                        "ResourceConflictException",
                        format!("Function already exist: {}", name),
                    )
                    .with_status(409)
                    .with_existing(function.arn.clone()));
                }
                let arn = self.arn("lambda", &format!("function:{}", name));
                state.functions.insert(
                    name.clone(),
                    Converging {
                        arn: arn.clone(),
                        pending_describes: self.function_activation_polls,
                    },
                );
                Ok(Created::new(arn))
            }

            ResourceSpec::RestApi { name, .. } => {
                if let Some((id, api)) = state.apis.iter().find(|(_, api)| api.name == *name) {
                    return Ok(Created::existing(id.clone())
                        .with_attribute("root_resource_id", api.root_id.clone()));
                }
                let id = short_id();
                let root_id = short_id();
                let mut resources = BTreeMap::new();
                resources.insert(
                    root_id.clone(),
                    ApiResource {
                        parent_id: None,
                        path_part: String::new(),
                        methods: BTreeMap::new(),
                    },
                );
                state.apis.insert(
                    id.clone(),
                    RestApi {
                        name: name.clone(),
                        root_id: root_id.clone(),
                        resources,
                        stages: BTreeMap::new(),
                    },
                );
                Ok(Created::new(id).with_attribute("root_resource_id", root_id))
            }

            ResourceSpec::ApiResource {
                api_id,
                parent_id,
                path_part,
            } => {
                let api = state.api(api_id)?;
                if !api.resources.contains_key(parent_id) {
                    return Err(ResourceError::new(
                        "NotFoundException",
                        format!("Invalid Resource identifier specified {}", parent_id),
                    )
                    .with_status(404));
                }
                let existing = api.resources.iter().find(|(_, r)| {
                    r.parent_id.as_deref() == Some(parent_id.as_str()) && r.path_part == *path_part
                });
                if let Some((id, _)) = existing {
                    return Err(ResourceError::new(
                        "ConflictException",
                        format!("Another resource with the same parent already has this name: {}", path_part),
                    )
                    .with_status(409)
                    .with_existing(id.clone()));
                }
                let id = short_id();
                api.resources.insert(
                    id.clone(),
                    ApiResource {
                        parent_id: Some(parent_id.clone()),
                        path_part: path_part.clone(),
                        methods: BTreeMap::new(),
                    },
                );
                Ok(Created::new(id))
            }

            ResourceSpec::Deployment { api_id, stage_name } => {
                let api = state.api(api_id)?;
                let has_methods = api.resources.values().any(|r| !r.methods.is_empty());
                if !has_methods {
                    return Err(ResourceError::new(
                        "BadRequestException",
                        "The REST API doesn't contain any methods",
                    )
                    .with_status(400));
                }
                let id = short_id();
                api.stages.insert(stage_name.clone(), id.clone());
                Ok(Created::new(id).with_attribute("stage", stage_name.clone()))
            }
        }
    }

    fn snapshot(&self, state: &mut CloudState, resource: &ResourceRef) -> StateSnapshot {
        let id = resource.identity.as_str();
        match resource.kind {
            ResourceKind::Bucket => match state.buckets.get(id) {
                Some(region) => StateSnapshot::new(ResourceState::Active).with_attribute("region", region.clone()),
                None => StateSnapshot::absent(),
            },
            ResourceKind::Queue => match state.queues.get(id) {
                Some(url) => StateSnapshot::new(ResourceState::Active).with_attribute("url", url.clone()),
                None => StateSnapshot::absent(),
            },
            ResourceKind::Topic => {
                let arn = if id.starts_with("arn:") {
                    id.to_string()
                } else {
                    self.arn("sns", id)
                };
                match state.topics.get(&arn) {
                    Some(topic) => StateSnapshot::new(ResourceState::Active)
                        .with_attribute("arn", arn.clone())
                        .with_attribute("subscriptions", topic.subscriptions.len().to_string()),
                    None => StateSnapshot::absent(),
                }
            }
            ResourceKind::Subscription => {
                let found = state
                    .topics
                    .values()
                    .any(|t| t.subscriptions.values().any(|arn| arn == id));
                if found {
                    StateSnapshot::new(ResourceState::Active)
                } else {
                    StateSnapshot::absent()
                }
            }
            ResourceKind::Table => match state.tables.get_mut(id) {
                Some(table) => StateSnapshot::new(table.observe()).with_attribute("arn", table.arn.clone()),
                None => StateSnapshot::absent(),
            },
            ResourceKind::Function => match state.functions.get_mut(id) {
                Some(function) => {
                    StateSnapshot::new(function.observe()).with_attribute("arn", function.arn.clone())
                }
                None => StateSnapshot::absent(),
            },
            ResourceKind::RestApi => match state.apis.get(id) {
                Some(api) => StateSnapshot::new(ResourceState::Active)
                    .with_attribute("name", api.name.clone())
                    .with_attribute("root_resource_id", api.root_id.clone()),
                None => StateSnapshot::absent(),
            },
            ResourceKind::ApiResource => {
                let resource = resource
                    .scope
                    .as_deref()
                    .and_then(|api_id| state.apis.get(api_id))
                    .and_then(|api| api.resources.get(id));
                match resource {
                    Some(r) => r.methods.iter().fold(
                        StateSnapshot::new(ResourceState::Active)
                            .with_attribute("path_part", r.path_part.clone()),
                        |snapshot, (http_method, method)| {
                            snapshot.with_attribute(
                                format!("method.{}", http_method),
                                format!(
                                    "integration={} method_responses={} integration_responses={}",
                                    method.integration.as_deref().unwrap_or("none"),
                                    method.method_responses.len(),
                                    method.integration_responses.len()
                                ),
                            )
                        },
                    ),
                    None => StateSnapshot::absent(),
                }
            }
            ResourceKind::Deployment => {
                let deployment = resource
                    .scope
                    .as_deref()
                    .and_then(|api_id| state.apis.get(api_id))
                    .and_then(|api| api.stages.get(id));
                match deployment {
                    Some(deployment_id) => StateSnapshot::new(ResourceState::Active)
                        .with_attribute("deployment_id", deployment_id.clone()),
                    None => StateSnapshot::absent(),
                }
            }
        }
    }

    fn apply(
        &self,
        state: &mut CloudState,
        resource: &ResourceRef,
        change: &Change,
    ) -> Result<MutationOutput, ResourceError> {
        if let Change::Invoke { payload } = change {
            return invoke(state, resource, payload);
        }

        if resource.kind != ResourceKind::ApiResource {
            return Err(ResourceError::new(
                "BadRequestException",
                format!("{} cannot be applied to a {}", change.name(), resource.kind),
            )
            .with_status(400));
        }

        let api_id = resource.scope.as_deref().unwrap_or_default();
        let api = state.api(api_id)?;
        let target = api.resources.get_mut(&resource.identity).ok_or_else(|| {
            ResourceError::new(
                "NotFoundException",
                format!("Invalid Resource identifier specified {}", resource.identity),
            )
            .with_status(404)
        })?;

        let missing_method = |http_method: &str| {
            ResourceError::new(
                "NotFoundException",
                format!("Invalid Method identifier specified {}", http_method),
            )
            .with_status(404)
        };

        match change {
            Change::PutMethod { http_method, .. } => {
                target.methods.insert(http_method.clone(), Method::default());
            }
            Change::PutIntegration {
                http_method, uri, ..
            } => {
                let method = target
                    .methods
                    .get_mut(http_method)
                    .ok_or_else(|| missing_method(http_method))?;
                method.integration = Some(uri.clone());
            }
            Change::PutMethodResponse {
                http_method,
                status_code,
                ..
            } => {
                let method = target
                    .methods
                    .get_mut(http_method)
                    .ok_or_else(|| missing_method(http_method))?;
                method.method_responses.insert(status_code.clone());
            }
            Change::PutIntegrationResponse {
                http_method,
                status_code,
                ..
            } => {
                let method = target
                    .methods
                    .get_mut(http_method)
                    .ok_or_else(|| missing_method(http_method))?;
                if method.integration.is_none() {
                    return Err(ResourceError::new(
                        "NotFoundException",
                        "No integration defined for method",
                    )
                    .with_status(404));
                }
                method.integration_responses.insert(status_code.clone());
            }
            Change::Invoke { .. } => {}
        }

        Ok(MutationOutput {
            status_code: Some(200),
            payload: None,
        })
    }
}

/// Run the demo function: echo the request message as "Processed: ..."
fn invoke(
    state: &mut CloudState,
    resource: &ResourceRef,
    payload: &serde_json::Value,
) -> Result<MutationOutput, ResourceError> {
    if resource.kind != ResourceKind::Function {
        return Err(ResourceError::new(
            "BadRequestException",
            format!("{} cannot be invoked", resource.kind),
        )
        .with_status(400));
    }

    let function = state.functions.get(&resource.identity).ok_or_else(|| {
        ResourceError::new(
            "ResourceNotFoundException",
            format!("Function not found: {}", resource.identity),
        )
        .with_status(404)
    })?;

    if !function.is_active() {
        return Err(ResourceError::new(
            "ResourceNotReadyException",
            "The function is not in Active state",
        )
        .with_status(409));
    }

    let message = payload
        .get("message")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default();
    let response = serde_json::json!({ "message": format!("Processed: {}", message) });

    Ok(MutationOutput {
        status_code: Some(200),
        payload: Some(response.to_string()),
    })
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..10].to_string()
}

#[async_trait]
impl ResourceClient for EmulatorClient {
    fn name(&self) -> &str {
        "emulator"
    }

    async fn create_or_get(&self, spec: &ResourceSpec) -> Result<Created, ResourceError> {
        self.pause().await;
        let mut state = self.state.lock().await;
        state.enter(Self::create_op(spec))?;
        self.create(&mut state, spec)
    }

    async fn describe(&self, resource: &ResourceRef) -> Result<StateSnapshot, ResourceError> {
        self.pause().await;
        let mut state = self.state.lock().await;
        state.enter(Self::describe_op(resource.kind))?;
        Ok(self.snapshot(&mut state, resource))
    }

    async fn mutate(
        &self,
        resource: &ResourceRef,
        change: &Change,
    ) -> Result<MutationOutput, ResourceError> {
        self.pause().await;
        let mut state = self.state.lock().await;
        state.enter(Self::mutate_op(change))?;
        self.apply(&mut state, resource, change)
    }
}
