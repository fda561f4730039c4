//! Table-ensure plan.
//!
//! Describe the table first; only an absent table is created. Either way
//! the plan waits until the table reports Active.

use std::sync::Arc;

use crate::adapters::{
    ResourceClient, ResourceError, ResourceKind, ResourceRef, ResourceSpec, ResourceState,
};
use crate::config::{ReadinessSettings, TableSettings};
use crate::core::{
    action_fn, Idempotency, Plan, ProvisionError, ReadinessSpec, RetryPolicy, Step, StepContext,
    StepOutput,
};

pub const PLAN: &str = "table-ensure";
pub const DESCRIBE_TABLE: &str = "describe-table";
pub const CREATE_TABLE: &str = "create-table";

/// Output of the describe step when the table does not exist
pub const ABSENT: &str = "absent";

async fn describe_table(
    client: Arc<dyn ResourceClient>,
    ctx: StepContext,
) -> Result<String, ResourceError> {
    let snapshot = client
        .describe(&ResourceRef::new(ResourceKind::Table, ctx.target()))
        .await?;

    if snapshot.state == ResourceState::Absent {
        return Ok(ABSENT.to_string());
    }
    Ok(snapshot
        .attribute("arn")
        .unwrap_or(ctx.target())
        .to_string())
}

async fn create_table(
    client: Arc<dyn ResourceClient>,
    ctx: StepContext,
    table: TableSettings,
) -> Result<StepOutput, ResourceError> {
    let described = ctx.previous()?;
    if described != ABSENT {
        return Ok(StepOutput {
            existed: true,
            ..StepOutput::new(described)
        });
    }

    client
        .create_or_get(&ResourceSpec::Table {
            name: ctx.target().to_string(),
            hash_key: table.hash_key,
            read_capacity: table.read_capacity,
            write_capacity: table.write_capacity,
        })
        .await
        .map(StepOutput::from)
}

pub fn plan(
    table: &TableSettings,
    readiness: ReadinessSettings,
    retry: &RetryPolicy,
) -> Result<Plan, ProvisionError> {
    let table = table.clone();

    Plan::builder(PLAN)
        .description("Create a single-hash-key table if absent and wait until it is active")
        .retry_policy(retry.clone())
        .step(Step::new(DESCRIBE_TABLE, Idempotency::AlwaysSafe, action_fn(describe_table)))
        .step(
            Step::new(
                CREATE_TABLE,
                Idempotency::RequiresPriorStep,
                action_fn(move |client, ctx| create_table(client, ctx, table.clone())),
            )
            .with_readiness(ReadinessSpec::until_active(
                ResourceKind::Table,
                readiness.max_attempts,
                readiness.interval(),
            )),
        )
        .build()
}
