//! REST API build plan.
//!
//! Builds a proxy endpoint in front of a function:
//!
//! create API -> fetch root resource -> create child resource ->
//! attach method -> attach integration -> attach method response ->
//! attach integration response -> create deployment
//!
//! Every step after the first consumes the previous step's output. A
//! failure aborts the chain; steps already applied stay in place, and a
//! later execution finds them through create-or-get semantics.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::adapters::{
    Change, Created, ResourceClient, ResourceError, ResourceKind, ResourceRef, ResourceSpec,
};
use crate::config::RestApiSettings;
use crate::core::{action_fn, Idempotency, Plan, ProvisionError, RetryPolicy, Step, StepContext};

pub const PLAN: &str = "rest-api-build";

pub const CREATE_API: &str = "create-api";
pub const FETCH_ROOT: &str = "fetch-root";
pub const CREATE_RESOURCE: &str = "create-resource";
pub const ATTACH_METHOD: &str = "attach-method";
pub const ATTACH_INTEGRATION: &str = "attach-integration";
pub const ATTACH_METHOD_RESPONSE: &str = "attach-method-response";
pub const ATTACH_INTEGRATION_RESPONSE: &str = "attach-integration-response";
pub const CREATE_DEPLOYMENT: &str = "create-deployment";

const ACCOUNT_ID: &str = "000000000000";

/// Everything the build needs besides the API name
#[derive(Debug, Clone)]
struct Blueprint {
    endpoint: String,
    region: String,
    api: RestApiSettings,
}

impl Blueprint {
    /// Lambda invocation URI of the integration target
    fn integration_uri(&self) -> String {
        format!(
            "arn:aws:apigateway:{region}:lambda:path/2015-03-31/functions/arn:aws:lambda:{region}:{account}:function:{function}/invocations",
            region = self.region,
            account = ACCOUNT_ID,
            function = self.api.function,
        )
    }

    /// Invoke URL of the deployed stage
    fn stage_url(&self, api_id: &str) -> String {
        format!(
            "{}/restapis/{}/{}/_user_request_/{}",
            self.endpoint.trim_end_matches('/'),
            api_id,
            self.api.stage,
            self.api.path_part
        )
    }
}

async fn create_api(
    client: Arc<dyn ResourceClient>,
    ctx: StepContext,
    blueprint: Arc<Blueprint>,
) -> Result<Created, ResourceError> {
    client
        .create_or_get(&ResourceSpec::RestApi {
            name: ctx.target().to_string(),
            description: blueprint.api.description.clone(),
        })
        .await
}

async fn fetch_root(
    client: Arc<dyn ResourceClient>,
    ctx: StepContext,
) -> Result<String, ResourceError> {
    let api_id = ctx.previous()?;
    let snapshot = client
        .describe(&ResourceRef::new(ResourceKind::RestApi, api_id))
        .await?;

    snapshot
        .attribute("root_resource_id")
        .map(str::to_string)
        .ok_or_else(|| {
            ResourceError::new(
                "NotFoundException",
                format!("API {} has no root resource", api_id),
            )
            .with_status(404)
        })
}

async fn create_resource(
    client: Arc<dyn ResourceClient>,
    ctx: StepContext,
    blueprint: Arc<Blueprint>,
) -> Result<Created, ResourceError> {
    client
        .create_or_get(&ResourceSpec::ApiResource {
            api_id: ctx.output(CREATE_API)?.to_string(),
            parent_id: ctx.previous()?.to_string(),
            path_part: blueprint.api.path_part.clone(),
        })
        .await
}

/// Apply `change` to the child resource and pass its id on
async fn attach(
    client: Arc<dyn ResourceClient>,
    ctx: StepContext,
    change: Change,
) -> Result<String, ResourceError> {
    let api_id = ctx.output(CREATE_API)?;
    let resource_id = ctx.previous()?;

    client
        .mutate(
            &ResourceRef::scoped(ResourceKind::ApiResource, api_id, resource_id),
            &change,
        )
        .await?;
    Ok(resource_id.to_string())
}

async fn create_deployment(
    client: Arc<dyn ResourceClient>,
    ctx: StepContext,
    blueprint: Arc<Blueprint>,
) -> Result<String, ResourceError> {
    // The attached resource must exist before anything is deployed
    ctx.previous()?;
    let api_id = ctx.output(CREATE_API)?;

    client
        .create_or_get(&ResourceSpec::Deployment {
            api_id: api_id.to_string(),
            stage_name: blueprint.api.stage.clone(),
        })
        .await?;
    Ok(blueprint.stage_url(api_id))
}

fn attach_step(name: &str, change: Change) -> Step {
    Step::new(
        name,
        Idempotency::RequiresPriorStep,
        action_fn(move |client, ctx| attach(client, ctx, change.clone())),
    )
}

pub fn plan(
    endpoint: &str,
    region: &str,
    api: &RestApiSettings,
    retry: &RetryPolicy,
) -> Result<Plan, ProvisionError> {
    let blueprint = Arc::new(Blueprint {
        endpoint: endpoint.to_string(),
        region: region.to_string(),
        api: api.clone(),
    });
    let http_method = api.http_method.clone();

    let create_api_blueprint = blueprint.clone();
    let resource_blueprint = blueprint.clone();
    let deployment_blueprint = blueprint.clone();

    Plan::builder(PLAN)
        .description("Create a REST API proxying to a function and deploy it to a stage")
        .retry_policy(retry.clone())
        .step(Step::new(
            CREATE_API,
            Idempotency::CreateOrNoop,
            action_fn(move |client, ctx| create_api(client, ctx, create_api_blueprint.clone())),
        ))
        .step(Step::new(
            FETCH_ROOT,
            Idempotency::RequiresPriorStep,
            action_fn(fetch_root),
        ))
        .step(Step::new(
            CREATE_RESOURCE,
            Idempotency::RequiresPriorStep,
            action_fn(move |client, ctx| create_resource(client, ctx, resource_blueprint.clone())),
        ))
        .step(attach_step(
            ATTACH_METHOD,
            Change::PutMethod {
                http_method: http_method.clone(),
                authorization: "NONE".to_string(),
            },
        ))
        .step(attach_step(
            ATTACH_INTEGRATION,
            Change::PutIntegration {
                http_method: http_method.clone(),
                integration_type: "AWS_PROXY".to_string(),
                integration_http_method: "POST".to_string(),
                uri: blueprint.integration_uri(),
            },
        ))
        .step(attach_step(
            ATTACH_METHOD_RESPONSE,
            Change::PutMethodResponse {
                http_method: http_method.clone(),
                status_code: "200".to_string(),
                response_models: BTreeMap::from([(
                    "application/json".to_string(),
                    "Empty".to_string(),
                )]),
            },
        ))
        .step(attach_step(
            ATTACH_INTEGRATION_RESPONSE,
            Change::PutIntegrationResponse {
                http_method,
                status_code: "200".to_string(),
                response_templates: BTreeMap::from([(
                    "application/json".to_string(),
                    api.response_template.clone(),
                )]),
            },
        ))
        .step(Step::new(
            CREATE_DEPLOYMENT,
            Idempotency::RequiresPriorStep,
            action_fn(move |client, ctx| create_deployment(client, ctx, deployment_blueprint.clone())),
        ))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blueprint() -> Blueprint {
        Blueprint {
            endpoint: "http://localhost:4566/".to_string(),
            region: "sa-east-1".to_string(),
            api: RestApiSettings::default(),
        }
    }

    #[test]
    fn test_integration_uri() {
        assert_eq!(
            blueprint().integration_uri(),
            "arn:aws:apigateway:sa-east-1:lambda:path/2015-03-31/functions/arn:aws:lambda:sa-east-1:000000000000:function:minha-funcao/invocations"
        );
    }

    #[test]
    fn test_stage_url() {
        assert_eq!(
            blueprint().stage_url("abc123"),
            "http://localhost:4566/restapis/abc123/test/_user_request_/test"
        );
    }

    #[test]
    fn test_plan_order() {
        let plan = plan(
            "http://localhost:4566",
            "sa-east-1",
            &RestApiSettings::default(),
            &RetryPolicy::default(),
        )
        .unwrap();

        let names: Vec<&str> = plan.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                CREATE_API,
                FETCH_ROOT,
                CREATE_RESOURCE,
                ATTACH_METHOD,
                ATTACH_INTEGRATION,
                ATTACH_METHOD_RESPONSE,
                ATTACH_INTEGRATION_RESPONSE,
                CREATE_DEPLOYMENT,
            ]
        );
        assert!(plan.steps[1..]
            .iter()
            .all(|s| s.idempotency == Idempotency::RequiresPriorStep));
    }
}
