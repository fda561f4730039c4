//! Function plans.
//!
//! `function-ensure` deploys the function and waits until it is Active.
//! `function-invoke` waits for an existing function to become Active and
//! invokes it exactly once; a function that never activates yields a
//! not-ready timeout and is never invoked.

use std::sync::Arc;

use tracing::debug;

use crate::adapters::{
    codes, Change, Created, ResourceClient, ResourceError, ResourceKind, ResourceRef,
    ResourceSpec, ResourceState, StateSnapshot,
};
use crate::config::{FunctionSettings, ReadinessSettings};
use crate::core::{
    action_fn, probe_fn, Idempotency, Plan, ProvisionError, ReadinessSpec, RetryPolicy, Step,
    StepContext,
};

pub const ENSURE_PLAN: &str = "function-ensure";
pub const INVOKE_PLAN: &str = "function-invoke";

pub const CREATE_FUNCTION: &str = "create-function";
pub const AWAIT_ACTIVE: &str = "await-active";
pub const INVOKE: &str = "invoke";

/// Read the deployment package, or an empty one when none is configured
async fn load_code(settings: &FunctionSettings) -> Result<Vec<u8>, ResourceError> {
    let Some(ref path) = settings.code_path else {
        return Ok(Vec::new());
    };

    let code = tokio::fs::read(path).await.map_err(|e| {
        ResourceError::new(
            codes::CODE_UNAVAILABLE,
            format!("cannot read {}: {}", path.display(), e),
        )
    })?;
    debug!(path = %path.display(), bytes = code.len(), "Loaded function package");
    Ok(code)
}

async fn create_function(
    client: Arc<dyn ResourceClient>,
    ctx: StepContext,
    settings: FunctionSettings,
) -> Result<Created, ResourceError> {
    let code = load_code(&settings).await?;

    client
        .create_or_get(&ResourceSpec::Function {
            name: ctx.target().to_string(),
            runtime: settings.runtime,
            handler: settings.handler,
            role: settings.role,
            code,
        })
        .await
}

/// Describe the function; a missing function is fatal rather than not-ready
async fn function_state(
    client: Arc<dyn ResourceClient>,
    ctx: StepContext,
) -> Result<StateSnapshot, ResourceError> {
    let snapshot = client
        .describe(&ResourceRef::new(ResourceKind::Function, ctx.target()))
        .await?;

    if snapshot.state == ResourceState::Absent {
        return Err(ResourceError::new(
            "ResourceNotFoundException",
            format!("Function not found: {}", ctx.target()),
        )
        .with_status(404));
    }
    Ok(snapshot)
}

fn until_active(readiness: ReadinessSettings) -> ReadinessSpec {
    ReadinessSpec::new(
        probe_fn(function_state),
        StateSnapshot::is_active,
        readiness.max_attempts,
        readiness.interval(),
    )
}

async fn await_active(
    _client: Arc<dyn ResourceClient>,
    ctx: StepContext,
) -> Result<String, ResourceError> {
    // Polling happens in the step's readiness spec
    Ok(ctx.target().to_string())
}

async fn invoke(
    client: Arc<dyn ResourceClient>,
    ctx: StepContext,
    payload: serde_json::Value,
) -> Result<String, ResourceError> {
    let function = ResourceRef::new(ResourceKind::Function, ctx.previous()?);
    let output = client.mutate(&function, &Change::Invoke { payload }).await?;

    debug!(status = ?output.status_code, "Function invoked");
    Ok(output.payload.unwrap_or_default())
}

pub fn ensure_plan(
    settings: &FunctionSettings,
    readiness: ReadinessSettings,
    retry: &RetryPolicy,
) -> Result<Plan, ProvisionError> {
    let settings = settings.clone();

    Plan::builder(ENSURE_PLAN)
        .description("Deploy a function and wait until it is active")
        .retry_policy(retry.clone())
        .step(
            Step::new(
                CREATE_FUNCTION,
                Idempotency::CreateOrNoop,
                action_fn(move |client, ctx| create_function(client, ctx, settings.clone())),
            )
            .with_readiness(until_active(readiness)),
        )
        .build()
}

pub fn invoke_plan(
    settings: &FunctionSettings,
    readiness: ReadinessSettings,
    retry: &RetryPolicy,
) -> Result<Plan, ProvisionError> {
    let payload = settings.payload.clone();

    Plan::builder(INVOKE_PLAN)
        .description("Wait for a function to be active, then invoke it once")
        .retry_policy(retry.clone())
        .step(
            Step::new(AWAIT_ACTIVE, Idempotency::AlwaysSafe, action_fn(await_active))
                .with_readiness(until_active(readiness)),
        )
        .step(
            // An invocation is not repeatable, so transient failures are not retried
            Step::new(
                INVOKE,
                Idempotency::RequiresPriorStep,
                action_fn(move |client, ctx| invoke(client, ctx, payload.clone())),
            )
            .with_retry(RetryPolicy::none()),
        )
        .build()
}
