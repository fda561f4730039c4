//! Plan and step definitions.
//!
//! A plan is an ordered, immutable list of steps. Each step wraps one
//! side-effecting action against a [`ResourceClient`], declares how it
//! behaves when re-run, and may require a readiness poll before the
//! next step starts.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::adapters::{
    CreateOutcome, Created, ResourceClient, ResourceError, ResourceKind, ResourceRef,
    StateSnapshot,
};

use super::error::ProvisionError;

/// Re-run behavior a step declares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Idempotency {
    /// Creates a resource; an existing one counts as success
    CreateOrNoop,

    /// Safe to repeat any number of times
    AlwaysSafe,

    /// Consumes the output of the immediately preceding step
    RequiresPriorStep,
}

/// Execution context handed to step actions and readiness probes.
///
/// Holds the outputs of every step that already ran in this execution,
/// in plan order.
#[derive(Debug, Clone)]
pub struct StepContext {
    plan: String,
    target: String,
    step: String,
    outputs: Vec<(String, String)>,
}

impl StepContext {
    pub fn new(plan: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            plan: plan.into(),
            target: target.into(),
            step: String::new(),
            outputs: Vec::new(),
        }
    }

    pub fn plan(&self) -> &str {
        &self.plan
    }

    /// Caller-supplied identity of the target resource
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Name of the step currently executing
    pub fn step(&self) -> &str {
        &self.step
    }

    /// Output of an earlier step, by name
    pub fn output(&self, step: &str) -> Result<&str, ResourceError> {
        self.outputs
            .iter()
            .find(|(name, _)| name == step)
            .map(|(_, value)| value.as_str())
            .ok_or_else(|| ResourceError::missing_dependency(step))
    }

    /// Output of the step that ran immediately before this one
    pub fn previous(&self) -> Result<&str, ResourceError> {
        self.outputs
            .last()
            .map(|(_, value)| value.as_str())
            .ok_or_else(|| ResourceError::missing_dependency("<previous>"))
    }

    pub fn outputs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.outputs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub(crate) fn enter(&mut self, step: &str) {
        self.step = step.to_string();
    }

    pub(crate) fn record(&mut self, step: &str, output: String) {
        self.outputs.push((step.to_string(), output));
    }
}

/// What a step action produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    /// Durable identifier handed to later steps and the result handle
    pub value: String,

    /// The backend reported the resource as already present
    pub existed: bool,

    /// Extra backend-reported attributes, logged only
    pub attributes: BTreeMap<String, String>,
}

impl StepOutput {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            existed: false,
            attributes: BTreeMap::new(),
        }
    }
}

impl From<String> for StepOutput {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<Created> for StepOutput {
    fn from(created: Created) -> Self {
        Self {
            value: created.identity,
            existed: created.outcome == CreateOutcome::AlreadyExisted,
            attributes: created.attributes,
        }
    }
}

/// The side-effecting part of a step
#[async_trait]
pub trait StepAction: Send + Sync {
    /// Run the action; the output value is the step's durable output
    async fn run(
        &self,
        client: Arc<dyn ResourceClient>,
        ctx: StepContext,
    ) -> Result<StepOutput, ResourceError>;
}

struct FnAction<F>(F);

#[async_trait]
impl<F, Fut, O> StepAction for FnAction<F>
where
    F: Fn(Arc<dyn ResourceClient>, StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O, ResourceError>> + Send + 'static,
    O: Into<StepOutput>,
{
    async fn run(
        &self,
        client: Arc<dyn ResourceClient>,
        ctx: StepContext,
    ) -> Result<StepOutput, ResourceError> {
        (self.0)(client, ctx).await.map(Into::into)
    }
}

/// Wrap an async closure as a step action.
///
/// The closure may return anything convertible into a [`StepOutput`]: a
/// plain `String`, or the [`Created`] of a `create_or_get` call.
pub fn action_fn<F, Fut, O>(f: F) -> Arc<dyn StepAction>
where
    F: Fn(Arc<dyn ResourceClient>, StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, ResourceError>> + Send + 'static,
    O: Into<StepOutput> + 'static,
{
    Arc::new(FnAction(f))
}

/// Observation half of a readiness check
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn poll(
        &self,
        client: Arc<dyn ResourceClient>,
        ctx: StepContext,
    ) -> Result<StateSnapshot, ResourceError>;
}

struct FnProbe<F>(F);

#[async_trait]
impl<F, Fut> ReadinessProbe for FnProbe<F>
where
    F: Fn(Arc<dyn ResourceClient>, StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StateSnapshot, ResourceError>> + Send + 'static,
{
    async fn poll(
        &self,
        client: Arc<dyn ResourceClient>,
        ctx: StepContext,
    ) -> Result<StateSnapshot, ResourceError> {
        (self.0)(client, ctx).await
    }
}

/// Wrap an async closure as a readiness probe
pub fn probe_fn<F, Fut>(f: F) -> Arc<dyn ReadinessProbe>
where
    F: Fn(Arc<dyn ResourceClient>, StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StateSnapshot, ResourceError>> + Send + 'static,
{
    Arc::new(FnProbe(f))
}

type ReadyPredicate = Arc<dyn Fn(&StateSnapshot) -> bool + Send + Sync>;

/// Post-condition poll attached to a step
#[derive(Clone)]
pub struct ReadinessSpec {
    pub(crate) probe: Arc<dyn ReadinessProbe>,
    pub(crate) is_ready: ReadyPredicate,

    /// Maximum number of probe calls
    pub max_attempts: u32,

    /// Delay between probe calls
    pub interval: Duration,
}

impl ReadinessSpec {
    pub fn new<P>(
        probe: Arc<dyn ReadinessProbe>,
        is_ready: P,
        max_attempts: u32,
        interval: Duration,
    ) -> Self
    where
        P: Fn(&StateSnapshot) -> bool + Send + Sync + 'static,
    {
        Self {
            probe,
            is_ready: Arc::new(is_ready),
            max_attempts,
            interval,
        }
    }

    /// Describe the target resource of `kind` until it reports Active
    pub fn until_active(kind: ResourceKind, max_attempts: u32, interval: Duration) -> Self {
        let probe = probe_fn(move |client, ctx| async move {
            client
                .describe(&ResourceRef::new(kind, ctx.target()))
                .await
        });
        Self::new(probe, StateSnapshot::is_active, max_attempts, interval)
    }

    pub fn is_ready(&self, snapshot: &StateSnapshot) -> bool {
        (self.is_ready)(snapshot)
    }
}

impl fmt::Debug for ReadinessSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessSpec")
            .field("max_attempts", &self.max_attempts)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

/// Bounded retry policy for `Transient` step failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    200
}
fn default_max_delay() -> u64 {
    5000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// One unit of a provisioning sequence
#[derive(Clone)]
pub struct Step {
    /// Step name (unique within plan)
    pub name: String,

    pub idempotency: Idempotency,

    pub(crate) action: Arc<dyn StepAction>,

    /// Poll to run after the action succeeds
    pub readiness: Option<ReadinessSpec>,

    /// Overrides the plan's retry policy for this step
    pub retry_policy: Option<RetryPolicy>,
}

impl Step {
    pub fn new(name: impl Into<String>, idempotency: Idempotency, action: Arc<dyn StepAction>) -> Self {
        Self {
            name: name.into(),
            idempotency,
            action,
            readiness: None,
            retry_policy: None,
        }
    }

    pub fn with_readiness(mut self, readiness: ReadinessSpec) -> Self {
        self.readiness = Some(readiness);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Get the effective retry policy for this step
    pub fn retry_policy<'a>(&'a self, plan_default: &'a RetryPolicy) -> &'a RetryPolicy {
        self.retry_policy.as_ref().unwrap_or(plan_default)
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("idempotency", &self.idempotency)
            .field("readiness", &self.readiness)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

/// An ordered provisioning workflow
#[derive(Debug, Clone)]
pub struct Plan {
    /// Plan name (registry key)
    pub name: String,

    /// Human-readable description
    pub description: String,

    /// Ordered list of steps to execute
    pub steps: Vec<Step>,

    /// Retry policy for steps without their own
    pub retry_policy: RetryPolicy,

    /// Step whose output becomes the primary result handle (default: last)
    pub result_step: Option<String>,
}

impl Plan {
    pub fn builder(name: impl Into<String>) -> PlanBuilder {
        PlanBuilder {
            plan: Plan {
                name: name.into(),
                description: String::new(),
                steps: Vec::new(),
                retry_policy: RetryPolicy::default(),
                result_step: None,
            },
        }
    }

    /// Validate the plan definition
    pub fn validate(&self) -> Result<(), ProvisionError> {
        let invalid = |reason: String| ProvisionError::InvalidPlan {
            plan: self.name.clone(),
            reason,
        };

        if self.name.is_empty() {
            return Err(invalid("plan name cannot be empty".to_string()));
        }

        if self.steps.is_empty() {
            return Err(invalid("plan must have at least one step".to_string()));
        }

        for (i, step) in self.steps.iter().enumerate() {
            if step.name.is_empty() {
                return Err(invalid(format!("step {} has an empty name", i)));
            }

            if self.steps[..i].iter().any(|s| s.name == step.name) {
                return Err(invalid(format!("duplicate step name '{}'", step.name)));
            }

            if i == 0 && step.idempotency == Idempotency::RequiresPriorStep {
                return Err(invalid(format!(
                    "first step '{}' cannot require a prior step",
                    step.name
                )));
            }

            if let Some(ref readiness) = step.readiness {
                if readiness.max_attempts == 0 {
                    return Err(invalid(format!(
                        "step '{}' has a readiness poll with zero attempts",
                        step.name
                    )));
                }
            }
        }

        if let Some(ref result_step) = self.result_step {
            if self.get_step(result_step).is_none() {
                return Err(invalid(format!(
                    "result step '{}' is not part of the plan",
                    result_step
                )));
            }
        }

        Ok(())
    }

    /// Get a step by name
    pub fn get_step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Name of the step whose output is the primary result
    pub fn result_step_name(&self) -> Option<&str> {
        self.result_step
            .as_deref()
            .or_else(|| self.steps.last().map(|s| s.name.as_str()))
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            name: self.name.clone(),
            description: self.description.clone(),
            result_step: self.result_step_name().map(str::to_string),
            steps: self
                .steps
                .iter()
                .map(|s| StepSummary {
                    name: s.name.clone(),
                    idempotency: s.idempotency,
                    readiness: s.readiness.as_ref().map(|r| ReadinessSummary {
                        max_attempts: r.max_attempts,
                        interval_ms: r.interval.as_millis() as u64,
                    }),
                })
                .collect(),
        }
    }
}

/// Builder that validates on `build`
pub struct PlanBuilder {
    plan: Plan,
}

impl PlanBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.plan.description = description.into();
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.plan.steps.push(step);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.plan.retry_policy = policy;
        self
    }

    pub fn result_step(mut self, step: impl Into<String>) -> Self {
        self.plan.result_step = Some(step.into());
        self
    }

    pub fn build(self) -> Result<Plan, ProvisionError> {
        self.plan.validate()?;
        Ok(self.plan)
    }
}

/// Serializable view of a plan (for listing)
#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub name: String,
    pub description: String,
    pub result_step: Option<String>,
    pub steps: Vec<StepSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepSummary {
    pub name: String,
    pub idempotency: Idempotency,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness: Option<ReadinessSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessSummary {
    pub max_attempts: u32,
    pub interval_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn StepAction> {
        action_fn(|_client, ctx| async move { Ok(ctx.target().to_string()) })
    }

    #[test]
    fn test_step_output_from_created() {
        let fresh = StepOutput::from(Created::new("arn:x").with_attribute("stage", "test"));
        assert!(!fresh.existed);
        assert_eq!(fresh.attributes.get("stage").map(String::as_str), Some("test"));

        let existing = StepOutput::from(Created::existing("arn:x"));
        assert!(existing.existed);
        assert_eq!(existing.value, "arn:x");
        assert_eq!(StepOutput::from("plain".to_string()), StepOutput::new("plain"));
    }

    #[test]
    fn test_plan_builds() {
        let plan = Plan::builder("demo")
            .description("two steps")
            .step(Step::new("first", Idempotency::CreateOrNoop, noop()))
            .step(Step::new("second", Idempotency::RequiresPriorStep, noop()))
            .build()
            .unwrap();

        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.get_step("second").unwrap().idempotency, Idempotency::RequiresPriorStep);
        assert_eq!(plan.result_step_name(), Some("second"));
    }

    #[test]
    fn test_duplicate_step_names_rejected() {
        let result = Plan::builder("dup")
            .step(Step::new("same", Idempotency::AlwaysSafe, noop()))
            .step(Step::new("same", Idempotency::AlwaysSafe, noop()))
            .build();

        assert!(matches!(result, Err(ProvisionError::InvalidPlan { .. })));
    }

    #[test]
    fn test_first_step_cannot_require_prior() {
        let result = Plan::builder("orphan")
            .step(Step::new("first", Idempotency::RequiresPriorStep, noop()))
            .build();

        assert!(result.is_err());
    }

    #[test]
    fn test_empty_plan_rejected() {
        assert!(Plan::builder("empty").build().is_err());
        assert!(Plan::builder("")
            .step(Step::new("a", Idempotency::AlwaysSafe, noop()))
            .build()
            .is_err());
    }

    #[test]
    fn test_result_step_must_exist() {
        let result = Plan::builder("bad-result")
            .step(Step::new("a", Idempotency::AlwaysSafe, noop()))
            .result_step("b")
            .build();
        assert!(result.is_err());

        let plan = Plan::builder("good-result")
            .step(Step::new("a", Idempotency::AlwaysSafe, noop()))
            .step(Step::new("b", Idempotency::AlwaysSafe, noop()))
            .result_step("a")
            .build()
            .unwrap();
        assert_eq!(plan.result_step_name(), Some("a"));
    }

    #[test]
    fn test_zero_attempt_readiness_rejected() {
        let result = Plan::builder("never-ready")
            .step(
                Step::new("a", Idempotency::CreateOrNoop, noop()).with_readiness(
                    ReadinessSpec::until_active(ResourceKind::Table, 0, Duration::ZERO),
                ),
            )
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_context_outputs() {
        let mut ctx = StepContext::new("plan", "target");
        assert!(ctx.previous().is_err());

        ctx.record("create", "id-1".to_string());
        ctx.record("attach", "id-2".to_string());

        assert_eq!(ctx.output("create").unwrap(), "id-1");
        assert_eq!(ctx.previous().unwrap(), "id-2");
        assert_eq!(
            ctx.output("missing").unwrap_err().code,
            crate::adapters::codes::MISSING_DEPENDENCY
        );
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10000,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(10000)); // Capped
    }

    #[test]
    fn test_step_retry_override() {
        let plan_default = RetryPolicy::default();
        let step = Step::new("a", Idempotency::AlwaysSafe, noop()).with_retry(RetryPolicy::none());
        assert_eq!(step.retry_policy(&plan_default).max_attempts, 1);

        let plain = Step::new("b", Idempotency::AlwaysSafe, noop());
        assert_eq!(plain.retry_policy(&plan_default).max_attempts, 3);
    }
}
