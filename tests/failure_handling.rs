//! Failure Handling Integration Tests
//!
//! Already-satisfied steps, transient retries, fatal aborts and restarts
//! from the first step.

use std::sync::Arc;

use emugate::adapters::{
    EmulatorClient, Operation, ResourceClient, ResourceError, ResourceKind, ResourceRef, ResourceSpec,
};
use emugate::catalog::{self, bucket, queue, rest_api, topic};
use emugate::config::ResolvedConfig;
use emugate::core::{ErrorKind, ProvisionError};
use emugate::domain::{EventType, ProvisionStatus};
use tokio_test::assert_err;

fn fast_config() -> ResolvedConfig {
    let mut config = ResolvedConfig::default();
    config.provisioning.retry.initial_delay_ms = 1;
    config.provisioning.retry.max_delay_ms = 5;
    config.provisioning.table_readiness.interval_ms = 5;
    config.provisioning.function_readiness.interval_ms = 5;
    config
}

fn setup() -> (Arc<EmulatorClient>, emugate::Orchestrator) {
    let client = Arc::new(EmulatorClient::default());
    let orchestrator = catalog::standard(&fast_config(), client.clone()).unwrap();
    (client, orchestrator)
}

#[tokio::test]
async fn test_owned_bucket_is_already_satisfied() {
    let (client, orchestrator) = setup();
    client
        .create_or_get(&ResourceSpec::Bucket {
            name: "demo-bucket".to_string(),
            region: "sa-east-1".to_string(),
        })
        .await
        .unwrap();

    let handle = orchestrator
        .ensure_provisioned(bucket::PLAN, "demo-bucket")
        .await
        .unwrap();
    assert_eq!(handle.value, "demo-bucket");

    let record = orchestrator.record(bucket::PLAN, "demo-bucket").await.unwrap();
    assert!(record
        .history
        .iter()
        .any(|e| e.event_type == EventType::StepAlreadySatisfied));
}

#[tokio::test]
async fn test_foreign_bucket_is_fatal() {
    let (client, orchestrator) = setup();
    client
        .inject_failure(
            Operation::CreateBucket,
            ResourceError::new("BucketAlreadyExists", "name taken by another account").with_status(409),
        )
        .await;

    let err = assert_err!(orchestrator.ensure_provisioned(bucket::PLAN, "demo-bucket").await);
    match &err {
        ProvisionError::StepFailed {
            step,
            code,
            attempts,
            ..
        } => {
            assert_eq!(step, bucket::CREATE_BUCKET);
            assert_eq!(code, "BucketAlreadyExists");
            assert_eq!(*attempts, 1);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(err.kind(), ErrorKind::Fatal);

    let record = orchestrator.record(bucket::PLAN, "demo-bucket").await.unwrap();
    assert_eq!(record.status, ProvisionStatus::Failed);
    assert!(record.result.is_none());
    assert_eq!(record.last_error, Some(err));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let (client, orchestrator) = setup();
    for _ in 0..2 {
        client
            .inject_failure(
                Operation::CreateQueue,
                ResourceError::new("ServiceUnavailable", "try again").with_status(503),
            )
            .await;
    }

    let handle = orchestrator
        .ensure_provisioned(queue::PLAN, "demo-queue")
        .await
        .unwrap();
    assert!(handle.value.ends_with("/demo-queue"));
    assert_eq!(client.calls(Operation::CreateQueue).await, 3);

    let record = orchestrator.record(queue::PLAN, "demo-queue").await.unwrap();
    let retries = record
        .history
        .iter()
        .filter(|e| e.event_type == EventType::StepRetrying)
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn test_transient_retries_are_bounded() {
    let (client, orchestrator) = setup();
    for _ in 0..3 {
        client
            .inject_failure(
                Operation::CreateQueue,
                ResourceError::new("Unknown", "gateway error").with_status(502),
            )
            .await;
    }

    let err = assert_err!(orchestrator.ensure_provisioned(queue::PLAN, "demo-queue").await);
    assert!(matches!(err, ProvisionError::StepFailed { attempts: 3, .. }));
    assert_eq!(client.calls(Operation::CreateQueue).await, 3);
}

#[tokio::test]
async fn test_failed_plan_restarts_from_first_step() {
    let (client, orchestrator) = setup();
    client
        .inject_failure(
            Operation::Subscribe,
            ResourceError::new("AccessDenied", "not allowed").with_status(403),
        )
        .await;

    let err = assert_err!(orchestrator.ensure_provisioned(topic::PLAN, "demo-topic").await);
    assert_eq!(err.step(), Some(topic::SUBSCRIBE_DEFAULT));
    assert_eq!(client.calls(Operation::CreateTopic).await, 1);

    let handle = orchestrator
        .ensure_provisioned(topic::PLAN, "demo-topic")
        .await
        .unwrap();
    assert_eq!(handle.value, "arn:aws:sns:sa-east-1:000000000000:demo-topic");
    assert!(handle
        .output(topic::SUBSCRIBE_DEFAULT)
        .unwrap()
        .starts_with("arn:aws:sns:sa-east-1:000000000000:demo-topic:"));

    assert_eq!(client.calls(Operation::CreateTopic).await, 2);
    assert_eq!(client.calls(Operation::Subscribe).await, 2);

    let record = orchestrator.record(topic::PLAN, "demo-topic").await.unwrap();
    assert_eq!(record.executions, 2);
    assert_eq!(record.status, ProvisionStatus::Ready);
    assert!(record.last_error.is_none());
}

#[tokio::test]
async fn test_rest_api_build_aborts_without_rollback() {
    let (client, orchestrator) = setup();
    client
        .inject_failure(
            Operation::PutIntegration,
            ResourceError::new("NotFoundException", "Invalid Method identifier specified").with_status(404),
        )
        .await;

    let err = assert_err!(orchestrator.ensure_provisioned(rest_api::PLAN, "demo-api").await);
    assert_eq!(err.step(), Some(rest_api::ATTACH_INTEGRATION));

    let record = orchestrator.record(rest_api::PLAN, "demo-api").await.unwrap();
    assert_eq!(record.status, ProvisionStatus::Failed);
    assert!(record.result.is_none());

    // Earlier steps ran and were not undone; later steps never ran
    assert_eq!(client.calls(Operation::CreateRestApi).await, 1);
    assert_eq!(client.calls(Operation::CreateResource).await, 1);
    assert_eq!(client.calls(Operation::PutMethod).await, 1);
    assert_eq!(client.calls(Operation::PutMethodResponse).await, 0);
    assert_eq!(client.calls(Operation::CreateDeployment).await, 0);

    // The next call rebuilds on top of what already exists
    let handle = orchestrator
        .ensure_provisioned(rest_api::PLAN, "demo-api")
        .await
        .unwrap();
    let api_id = handle.output(rest_api::CREATE_API).unwrap();
    assert_eq!(
        handle.value,
        format!("http://localhost:4566/restapis/{}/test/_user_request_/test", api_id)
    );

    let resource_id = handle.output(rest_api::CREATE_RESOURCE).unwrap();
    let snapshot = client
        .describe(&ResourceRef::scoped(ResourceKind::ApiResource, api_id, resource_id))
        .await
        .unwrap();
    assert_eq!(
        snapshot.attribute("method.GET"),
        Some("integration=arn:aws:apigateway:sa-east-1:lambda:path/2015-03-31/functions/arn:aws:lambda:sa-east-1:000000000000:function:minha-funcao/invocations method_responses=1 integration_responses=1")
    );

    let record = orchestrator.record(rest_api::PLAN, "demo-api").await.unwrap();
    assert_eq!(record.executions, 2);
    assert!(record
        .events_for(2)
        .any(|e| e.event_type == EventType::StepAlreadySatisfied
            && e.step.as_deref() == Some(rest_api::CREATE_RESOURCE)));
}

#[tokio::test]
async fn test_failed_step_history() {
    let (client, orchestrator) = setup();
    client
        .inject_failure(
            Operation::CreateQueue,
            ResourceError::new("ValidationException", "bad name").with_status(400),
        )
        .await;

    let _ = orchestrator.ensure_provisioned(queue::PLAN, "bad queue").await;

    let record = orchestrator.record(queue::PLAN, "bad queue").await.unwrap();
    let types: Vec<EventType> = record.history.iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec![
            EventType::ExecutionStarted,
            EventType::StepStarted,
            EventType::StepFailed,
            EventType::ExecutionFailed,
        ]
    );
    assert!(record.history[2]
        .error
        .as_deref()
        .unwrap()
        .contains("ValidationException"));
}

#[tokio::test]
async fn test_repeated_failures_keep_history_bounded() {
    let (client, orchestrator) = setup();
    for _ in 0..50 {
        client
            .inject_failure(
                Operation::CreateQueue,
                ResourceError::new("AccessDenied", "not allowed").with_status(403),
            )
            .await;
    }

    for _ in 0..50 {
        assert_err!(orchestrator.ensure_provisioned(queue::PLAN, "q").await);
    }

    let record = orchestrator.record(queue::PLAN, "q").await.unwrap();
    assert_eq!(record.executions, 50);
    assert_eq!(record.status, ProvisionStatus::Failed);
    // Four events per failed execution, two executions retained
    assert_eq!(record.history.len(), 8);
    assert!(record.history.iter().all(|e| e.execution >= 49));
    assert_eq!(record.events_for(50).count(), 4);
}

#[tokio::test]
async fn test_existing_queue_reported_as_already_satisfied() {
    let (client, orchestrator) = setup();
    let existing = client
        .create_or_get(&ResourceSpec::Queue {
            name: "demo-queue".to_string(),
        })
        .await
        .unwrap();

    let handle = orchestrator
        .ensure_provisioned(queue::PLAN, "demo-queue")
        .await
        .unwrap();
    assert_eq!(handle.value, existing.identity);

    let record = orchestrator.record(queue::PLAN, "demo-queue").await.unwrap();
    let types: Vec<EventType> = record.history.iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec![
            EventType::ExecutionStarted,
            EventType::StepStarted,
            EventType::StepAlreadySatisfied,
            EventType::ExecutionCompleted,
        ]
    );
}
