//! Queue-ensure plan: create the queue by name and keep its URL.

use std::sync::Arc;

use crate::adapters::{Created, ResourceClient, ResourceError, ResourceSpec};
use crate::core::{action_fn, Idempotency, Plan, ProvisionError, RetryPolicy, Step, StepContext};

pub const PLAN: &str = "queue-ensure";
pub const CREATE_QUEUE: &str = "create-queue";

async fn create_queue(
    client: Arc<dyn ResourceClient>,
    ctx: StepContext,
) -> Result<Created, ResourceError> {
    client
        .create_or_get(&ResourceSpec::Queue {
            name: ctx.target().to_string(),
        })
        .await
}

pub fn plan(retry: &RetryPolicy) -> Result<Plan, ProvisionError> {
    Plan::builder(PLAN)
        .description("Create a queue (idempotent by name) and capture its URL")
        .retry_policy(retry.clone())
        .step(Step::new(CREATE_QUEUE, Idempotency::CreateOrNoop, action_fn(create_queue)))
        .build()
}
