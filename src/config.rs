//! Configuration for emugate.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (EMUGATE_ENDPOINT, EMUGATE_REGION)
//! 2. Config file (.emugate/config.yaml)
//! 3. Defaults (a LocalStack on localhost:4566)
//!
//! Config file discovery:
//! - Searches current directory and parents for .emugate/config.yaml
//! - Falls back to <config_dir>/emugate/config.yaml
//! - `function.code_path` is relative to the directory holding .emugate/

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::RetryPolicy;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

pub const ENDPOINT_ENV: &str = "EMUGATE_ENDPOINT";
pub const REGION_ENV: &str = "EMUGATE_REGION";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub emulator: EmulatorSection,
    #[serde(default)]
    pub resources: Option<ResourceSettings>,
    #[serde(default)]
    pub provisioning: Option<ProvisioningFile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmulatorSection {
    pub endpoint: Option<String>,
    pub region: Option<String>,
    /// Services the health check waits for
    pub services: Option<Vec<String>>,
}

/// Names and shapes of the demo resources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSettings {
    pub bucket: String,
    pub queue: String,
    pub topic: String,
    pub table: TableSettings,
    pub subscription: SubscriptionSettings,
    pub rest_api: RestApiSettings,
    pub function: FunctionSettings,
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            bucket: "demo-bucket".to_string(),
            queue: "demo-queue".to_string(),
            topic: "demo-topic".to_string(),
            table: TableSettings::default(),
            subscription: SubscriptionSettings::default(),
            rest_api: RestApiSettings::default(),
            function: FunctionSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableSettings {
    pub name: String,
    pub hash_key: String,
    pub read_capacity: i64,
    pub write_capacity: i64,
}

impl Default for TableSettings {
    fn default() -> Self {
        Self {
            name: "users".to_string(),
            hash_key: "id".to_string(),
            read_capacity: 5,
            write_capacity: 5,
        }
    }
}

/// Default subscription attached to every ensured topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionSettings {
    pub protocol: String,
    pub endpoint: String,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            protocol: "email".to_string(),
            endpoint: "test@example.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestApiSettings {
    /// API name used when no target is given
    pub name: String,
    pub description: String,
    /// Child resource created under the root
    pub path_part: String,
    pub http_method: String,
    pub stage: String,
    /// Function the integration proxies to
    pub function: String,
    /// Body returned by the integration response
    pub response_template: String,
}

impl Default for RestApiSettings {
    fn default() -> Self {
        Self {
            name: "demo-api".to_string(),
            description: "Demo API".to_string(),
            path_part: "test".to_string(),
            http_method: "GET".to_string(),
            stage: "test".to_string(),
            function: "minha-funcao".to_string(),
            response_template: r#"{"message": "Hello from API Gateway!"}"#.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionSettings {
    pub runtime: String,
    pub handler: String,
    pub role: String,
    /// Zipped deployment package; an empty package is uploaded when unset
    pub code_path: Option<PathBuf>,
    /// Payload sent by the invoke plan
    pub payload: serde_json::Value,
}

impl Default for FunctionSettings {
    fn default() -> Self {
        Self {
            runtime: "go1.x".to_string(),
            handler: "main".to_string(),
            role: "arn:aws:iam::000000000000:role/lambda-role".to_string(),
            code_path: None,
            payload: serde_json::json!({ "message": "Hello from API Gateway!" }),
        }
    }
}

/// Readiness poll budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReadinessSettings {
    pub max_attempts: u32,
    pub interval_ms: u64,
}

impl ReadinessSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Partial readiness block; missing fields keep the section's defaults
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct ReadinessOverrides {
    pub max_attempts: Option<u32>,
    pub interval_ms: Option<u64>,
}

impl ReadinessOverrides {
    fn apply(self, base: ReadinessSettings) -> ReadinessSettings {
        ReadinessSettings {
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            interval_ms: self.interval_ms.unwrap_or(base.interval_ms),
        }
    }
}

/// `provisioning:` section as written in the file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProvisioningFile {
    pub retry: RetryPolicy,
    pub table_readiness: ReadinessOverrides,
    pub function_readiness: ReadinessOverrides,
}

impl ProvisioningFile {
    fn resolve(self) -> ProvisioningSettings {
        let defaults = ProvisioningSettings::default();
        ProvisioningSettings {
            retry: self.retry,
            table_readiness: self.table_readiness.apply(defaults.table_readiness),
            function_readiness: self.function_readiness.apply(defaults.function_readiness),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProvisioningSettings {
    /// Retry policy for transient step failures
    pub retry: RetryPolicy,
    pub table_readiness: ReadinessSettings,
    pub function_readiness: ReadinessSettings,
}

impl Default for ProvisioningSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            table_readiness: ReadinessSettings {
                max_attempts: 30,
                interval_ms: 1000,
            },
            function_readiness: ReadinessSettings {
                max_attempts: 5,
                interval_ms: 1000,
            },
        }
    }
}

/// Resolved configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedConfig {
    pub endpoint: String,
    pub region: String,
    pub services: Vec<String>,
    pub resources: ResourceSettings,
    pub provisioning: ProvisioningSettings,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:4566".to_string(),
            region: "sa-east-1".to_string(),
            services: default_services(),
            resources: ResourceSettings::default(),
            provisioning: ProvisioningSettings::default(),
            config_file: None,
        }
    }
}

fn default_services() -> Vec<String> {
    ["s3", "sqs", "sns", "dynamodb", "lambda", "apigateway"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Find config file by searching `start` and its parents, then the
/// user config directory
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".emugate").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    dirs::config_dir()
        .map(|dir| dir.join("emugate").join("config.yaml"))
        .filter(|path| path.exists())
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the project root
fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Merge a parsed file over the defaults
fn resolve(file: ConfigFile, config_path: Option<&Path>) -> ResolvedConfig {
    let defaults = ResolvedConfig::default();

    let mut resources = file.resources.unwrap_or_default();
    if let (Some(code_path), Some(config_path)) = (resources.function.code_path.take(), config_path) {
        // Project root is the parent of .emugate/
        let base_dir = config_path
            .parent()
            .and_then(|p| p.parent())
            .unwrap_or(Path::new("."));
        resources.function.code_path = Some(resolve_path(base_dir, &code_path));
    }

    ResolvedConfig {
        endpoint: file.emulator.endpoint.unwrap_or(defaults.endpoint),
        region: file.emulator.region.unwrap_or(defaults.region),
        services: file.emulator.services.unwrap_or(defaults.services),
        resources,
        provisioning: file
            .provisioning
            .map(ProvisioningFile::resolve)
            .unwrap_or_default(),
        config_file: config_path.map(Path::to_path_buf),
    }
}

/// Apply environment overrides
fn apply_env(mut config: ResolvedConfig, lookup: impl Fn(&str) -> Option<String>) -> ResolvedConfig {
    if let Some(endpoint) = lookup(ENDPOINT_ENV).filter(|v| !v.is_empty()) {
        config.endpoint = endpoint;
    }
    if let Some(region) = lookup(REGION_ENV).filter(|v| !v.is_empty()) {
        config.region = region;
    }
    config
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;

    let config = match find_config_file(&cwd) {
        Some(path) => resolve(load_config_file(&path)?, Some(&path)),
        None => ResolvedConfig::default(),
    };

    Ok(apply_env(config, |key| std::env::var(key).ok()))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Load configuration from an explicit file, still honoring env overrides
pub fn load_from(path: &Path) -> Result<ResolvedConfig> {
    let file = load_config_file(path)?;
    Ok(apply_env(resolve(file, Some(path)), |key| std::env::var(key).ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ResolvedConfig::default();

        assert_eq!(config.endpoint, "http://localhost:4566");
        assert_eq!(config.region, "sa-east-1");
        assert_eq!(config.resources.table.name, "users");
        assert_eq!(config.resources.table.hash_key, "id");
        assert_eq!(config.resources.rest_api.function, "minha-funcao");
        assert_eq!(config.provisioning.retry.max_attempts, 3);
        assert_eq!(config.provisioning.function_readiness.max_attempts, 5);
        assert_eq!(config.provisioning.table_readiness.interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let emugate_dir = temp.path().join(".emugate");
        std::fs::create_dir_all(&emugate_dir).unwrap();

        let config_path = emugate_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
emulator:
  endpoint: http://emulator:4566
  services: [s3, sqs]
resources:
  queue: orders
  table:
    name: accounts
  function:
    code_path: lambda/function.zip
provisioning:
  retry:
    max_attempts: 5
  function_readiness:
    max_attempts: 10
    interval_ms: 250
"#
        )
        .unwrap();

        let config = resolve(load_config_file(&config_path).unwrap(), Some(&config_path));
        assert_eq!(config.endpoint, "http://emulator:4566");
        assert_eq!(config.region, "sa-east-1");
        assert_eq!(config.services, vec!["s3", "sqs"]);
        assert_eq!(config.resources.queue, "orders");
        assert_eq!(config.resources.bucket, "demo-bucket");
        assert_eq!(config.resources.table.name, "accounts");
        assert_eq!(config.resources.table.read_capacity, 5);
        assert_eq!(
            config.resources.function.code_path,
            Some(temp.path().join("lambda/function.zip"))
        );
        assert_eq!(config.provisioning.retry.max_attempts, 5);
        assert_eq!(config.provisioning.retry.initial_delay_ms, 200);
        assert_eq!(config.provisioning.function_readiness.max_attempts, 10);
        assert_eq!(config.provisioning.table_readiness.max_attempts, 30);
        assert_eq!(config.config_file, Some(config_path));
    }

    #[test]
    fn test_partial_readiness_keeps_section_defaults() {
        let file: ConfigFile = serde_yaml::from_str(
            r#"
provisioning:
  table_readiness:
    max_attempts: 10
  function_readiness:
    interval_ms: 250
"#,
        )
        .unwrap();

        let provisioning = resolve(file, None).provisioning;
        assert_eq!(
            provisioning.table_readiness,
            ReadinessSettings {
                max_attempts: 10,
                interval_ms: 1000,
            }
        );
        assert_eq!(
            provisioning.function_readiness,
            ReadinessSettings {
                max_attempts: 5,
                interval_ms: 250,
            }
        );
        assert_eq!(provisioning.retry, RetryPolicy::default());
    }

    #[test]
    fn test_find_config_in_parent() {
        let temp = TempDir::new().unwrap();
        let emugate_dir = temp.path().join(".emugate");
        std::fs::create_dir_all(&emugate_dir).unwrap();
        std::fs::write(emugate_dir.join("config.yaml"), "emulator:\n  region: us-east-1\n").unwrap();

        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(
            find_config_file(&nested),
            Some(emugate_dir.join("config.yaml"))
        );
    }

    #[test]
    fn test_env_overrides() {
        let config = apply_env(ResolvedConfig::default(), |key| match key {
            ENDPOINT_ENV => Some("http://other:4566".to_string()),
            REGION_ENV => Some(String::new()),
            _ => None,
        });

        assert_eq!(config.endpoint, "http://other:4566");
        assert_eq!(config.region, "sa-east-1");
    }

    #[test]
    fn test_invalid_yaml_is_reported() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(&path, "emulator: [not, a, map]\n").unwrap();

        let err = load_config_file(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }
}
