//! Configuration Integration Tests
//!
//! Config files drive the plan catalog.

use std::sync::Arc;

use emugate::adapters::{EmulatorClient, Operation};
use emugate::catalog::{self, function, queue};
use emugate::config;
use tempfile::TempDir;

fn write_config(temp: &TempDir, yaml: &str) -> std::path::PathBuf {
    let dir = temp.path().join(".emugate");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("config.yaml");
    std::fs::write(&path, yaml).unwrap();
    path
}

#[tokio::test]
async fn test_configured_names_become_default_targets() {
    let temp = TempDir::new().unwrap();
    let path = write_config(
        &temp,
        r#"
resources:
  queue: orders
  rest_api:
    function: worker
"#,
    );

    let cfg = config::load_from(&path).unwrap();
    assert_eq!(catalog::default_target(&cfg, queue::PLAN).as_deref(), Some("orders"));
    assert_eq!(
        catalog::default_target(&cfg, function::INVOKE_PLAN).as_deref(),
        Some("worker")
    );

    let client = Arc::new(EmulatorClient::new(&cfg.endpoint, &cfg.region));
    let orchestrator = catalog::standard(&cfg, client.clone()).unwrap();
    let handle = orchestrator.ensure_provisioned(queue::PLAN, "orders").await.unwrap();
    assert!(handle.value.ends_with("/000000000000/orders"));
    assert_eq!(client.calls(Operation::CreateQueue).await, 1);
}

#[tokio::test]
async fn test_unreadable_code_package_is_fatal() {
    let temp = TempDir::new().unwrap();
    let path = write_config(
        &temp,
        r#"
resources:
  function:
    code_path: lambda/missing.zip
provisioning:
  function_readiness:
    max_attempts: 2
    interval_ms: 1
"#,
    );

    let cfg = config::load_from(&path).unwrap();
    assert_eq!(
        cfg.resources.function.code_path,
        Some(temp.path().join("lambda/missing.zip"))
    );

    let client = Arc::new(EmulatorClient::default());
    let orchestrator = catalog::standard(&cfg, client.clone()).unwrap();
    let err = orchestrator
        .ensure_provisioned(function::ENSURE_PLAN, "minha-funcao")
        .await
        .unwrap_err();

    assert!(err.to_string().contains("CodeUnavailable"));
    assert_eq!(client.calls(Operation::CreateFunction).await, 0);
}

#[tokio::test]
async fn test_code_package_is_uploaded() {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir_all(temp.path().join("lambda")).unwrap();
    std::fs::write(temp.path().join("lambda/function.zip"), b"PK\x03\x04").unwrap();
    let path = write_config(
        &temp,
        r#"
resources:
  function:
    code_path: lambda/function.zip
"#,
    );

    let cfg = config::load_from(&path).unwrap();
    let client = Arc::new(EmulatorClient::default());
    let orchestrator = catalog::standard(&cfg, client.clone()).unwrap();

    let handle = orchestrator
        .ensure_provisioned(function::ENSURE_PLAN, "minha-funcao")
        .await
        .unwrap();
    assert!(handle.value.ends_with(":function:minha-funcao"));
}
