//! LocalStack health endpoint.
//!
//! Reads `GET <endpoint>/_localstack/health` and waits, through the
//! readiness poller, until the services a demo needs report `running`
//! or `available`.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::core::poller::{PollError, PollReport, ReadinessPoller};

use super::{ResourceError, ResourceState, StateSnapshot};

/// Body of the health endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthReport {
    #[serde(default)]
    pub services: BTreeMap<String, String>,

    #[serde(default)]
    pub edition: Option<String>,

    #[serde(default)]
    pub version: Option<String>,
}

impl HealthReport {
    /// Whether a service accepts requests
    pub fn is_up(&self, service: &str) -> bool {
        matches!(
            self.services.get(service).map(String::as_str),
            Some("running") | Some("available")
        )
    }

    /// Required services that are not up yet
    pub fn missing<'a>(&self, required: &'a [String]) -> Vec<&'a str> {
        required
            .iter()
            .map(String::as_str)
            .filter(|s| !self.is_up(s))
            .collect()
    }

    /// Fold the report into a snapshot that is Active once every
    /// required service is up
    pub fn snapshot(&self, required: &[String]) -> StateSnapshot {
        let state = if self.missing(required).is_empty() {
            ResourceState::Active
        } else {
            ResourceState::Pending
        };

        self.services
            .iter()
            .fold(StateSnapshot::new(state), |snapshot, (service, status)| {
                snapshot.with_attribute(service.clone(), status.clone())
            })
    }
}

/// Client for the health endpoint
pub struct HealthProbe {
    endpoint: String,
    client: reqwest::Client,
}

impl HealthProbe {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn health_url(&self) -> String {
        format!("{}/_localstack/health", self.endpoint)
    }

    /// Fetch the health report once
    pub async fn check(&self) -> Result<HealthReport> {
        let url = self.health_url();

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?
            .error_for_status()
            .with_context(|| format!("Health check rejected by {}", url))?;

        response
            .json()
            .await
            .context("Failed to parse health report")
    }

    /// Fetch the report as a backend observation.
    ///
    /// Connection failures and 5xx answers are reported as
    /// `ServiceUnavailable` so the poller keeps trying.
    async fn observe(&self, required: &[String]) -> Result<StateSnapshot, ResourceError> {
        let response = self
            .client
            .get(self.health_url())
            .send()
            .await
            .map_err(|e| ResourceError::new("ServiceUnavailable", e.to_string()).with_status(503))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ResourceError::new("HealthCheckFailed", format!("health endpoint answered {}", status))
                .with_status(status.as_u16()));
        }

        let report: HealthReport = response
            .json()
            .await
            .map_err(|e| ResourceError::new("ValidationException", e.to_string()))?;

        Ok(report.snapshot(required))
    }

    /// Poll until every required service is up
    pub async fn wait_until_ready(
        &self,
        required: &[String],
        max_attempts: u32,
        interval: Duration,
    ) -> Result<PollReport, PollError> {
        debug!(endpoint = %self.endpoint, ?required, "Waiting for emulator services");

        ReadinessPoller::new()
            .poll_until(
                max_attempts,
                interval,
                || self.observe(required),
                StateSnapshot::is_active,
            )
            .await
    }
}
