//! Bucket-ensure plan.
//!
//! A bucket the caller already owns is success; a name held by another
//! owner is fatal.

use std::sync::Arc;

use crate::adapters::{Created, ResourceClient, ResourceError, ResourceSpec};
use crate::core::{action_fn, Idempotency, Plan, ProvisionError, RetryPolicy, Step, StepContext};

pub const PLAN: &str = "bucket-ensure";
pub const CREATE_BUCKET: &str = "create-bucket";

async fn create_bucket(
    client: Arc<dyn ResourceClient>,
    ctx: StepContext,
    region: String,
) -> Result<Created, ResourceError> {
    client
        .create_or_get(&ResourceSpec::Bucket {
            name: ctx.target().to_string(),
            region,
        })
        .await
}

pub fn plan(region: &str, retry: &RetryPolicy) -> Result<Plan, ProvisionError> {
    let region = region.to_string();

    Plan::builder(PLAN)
        .description("Create a bucket in the configured region")
        .retry_policy(retry.clone())
        .step(Step::new(
            CREATE_BUCKET,
            Idempotency::CreateOrNoop,
            action_fn(move |client, ctx| create_bucket(client, ctx, region.clone())),
        ))
        .build()
}
