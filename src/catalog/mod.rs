//! Concrete provisioning plans.
//!
//! Each plan takes its target identity from the caller: the table, bucket,
//! topic, queue, API or function name.

pub mod bucket;
pub mod function;
pub mod queue;
pub mod rest_api;
pub mod table;
pub mod topic;

use std::sync::Arc;

use crate::adapters::ResourceClient;
use crate::config::ResolvedConfig;
use crate::core::{Orchestrator, Plan, ProvisionError};

/// Build every plan from the configuration
pub fn plans(config: &ResolvedConfig) -> Result<Vec<Plan>, ProvisionError> {
    let resources = &config.resources;
    let provisioning = &config.provisioning;
    let retry = &provisioning.retry;

    Ok(vec![
        table::plan(&resources.table, provisioning.table_readiness, retry)?,
        bucket::plan(&config.region, retry)?,
        topic::plan(&resources.subscription, retry)?,
        queue::plan(retry)?,
        rest_api::plan(&config.endpoint, &config.region, &resources.rest_api, retry)?,
        function::ensure_plan(&resources.function, provisioning.function_readiness, retry)?,
        function::invoke_plan(&resources.function, provisioning.function_readiness, retry)?,
    ])
}

/// An orchestrator with every plan registered against `client`
pub fn standard(
    config: &ResolvedConfig,
    client: Arc<dyn ResourceClient>,
) -> Result<Orchestrator, ProvisionError> {
    let mut orchestrator = Orchestrator::new();
    for plan in plans(config)? {
        orchestrator.register(plan, client.clone())?;
    }
    Ok(orchestrator)
}

/// Configured target of a plan, used when the caller names none
pub fn default_target(config: &ResolvedConfig, plan: &str) -> Option<String> {
    let resources = &config.resources;
    let target = match plan {
        table::PLAN => &resources.table.name,
        bucket::PLAN => &resources.bucket,
        topic::PLAN => &resources.topic,
        queue::PLAN => &resources.queue,
        rest_api::PLAN => &resources.rest_api.name,
        function::ENSURE_PLAN | function::INVOKE_PLAN => &resources.rest_api.function,
        _ => return None,
    };
    Some(target.clone())
}
