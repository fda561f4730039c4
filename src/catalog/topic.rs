//! Topic-ensure plan: create the topic, then its default subscription.
//!
//! The result handle is the topic ARN; the subscription ARN is kept as
//! a step output.

use std::sync::Arc;

use crate::adapters::{Created, ResourceClient, ResourceError, ResourceSpec};
use crate::config::SubscriptionSettings;
use crate::core::{action_fn, Idempotency, Plan, ProvisionError, RetryPolicy, Step, StepContext};

pub const PLAN: &str = "topic-ensure";
pub const CREATE_TOPIC: &str = "create-topic";
pub const SUBSCRIBE_DEFAULT: &str = "subscribe-default";

async fn create_topic(
    client: Arc<dyn ResourceClient>,
    ctx: StepContext,
) -> Result<Created, ResourceError> {
    client
        .create_or_get(&ResourceSpec::Topic {
            name: ctx.target().to_string(),
        })
        .await
}

async fn subscribe(
    client: Arc<dyn ResourceClient>,
    ctx: StepContext,
    subscription: SubscriptionSettings,
) -> Result<Created, ResourceError> {
    client
        .create_or_get(&ResourceSpec::Subscription {
            topic_arn: ctx.previous()?.to_string(),
            protocol: subscription.protocol,
            endpoint: subscription.endpoint,
        })
        .await
}

pub fn plan(subscription: &SubscriptionSettings, retry: &RetryPolicy) -> Result<Plan, ProvisionError> {
    let subscription = subscription.clone();

    Plan::builder(PLAN)
        .description("Create a topic and its default subscription")
        .retry_policy(retry.clone())
        .step(Step::new(CREATE_TOPIC, Idempotency::CreateOrNoop, action_fn(create_topic)))
        .step(Step::new(
            SUBSCRIBE_DEFAULT,
            Idempotency::RequiresPriorStep,
            action_fn(move |client, ctx| subscribe(client, ctx, subscription.clone())),
        ))
        .result_step(CREATE_TOPIC)
        .build()
}
