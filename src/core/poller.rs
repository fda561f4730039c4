//! Bounded readiness polling.
//!
//! Used after a step whose effect is asynchronous on the backend (a
//! table being created, a function being deployed). The poller holds no
//! locks; only the task driving the step waits.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::adapters::{ResourceClient, ResourceError, StateSnapshot};

use super::classify::{classify, Classification};
use super::plan::{ReadinessSpec, StepContext};

/// Successful poll outcome
#[derive(Debug, Clone, PartialEq)]
pub struct PollReport {
    /// Probe calls made, including the one that saw the ready state
    pub attempts: u32,

    pub snapshot: StateSnapshot,
}

/// Poll failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PollError {
    #[error("not ready after {attempts} attempt(s)")]
    Timeout {
        attempts: u32,
        last: Option<StateSnapshot>,
    },

    #[error("probe failed on attempt {attempts}: {error}")]
    Probe { attempts: u32, error: ResourceError },
}

/// Bounded retry loop waiting for a backend to converge
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadinessPoller;

impl ReadinessPoller {
    pub fn new() -> Self {
        Self
    }

    /// Run a step's readiness spec against its client
    pub async fn wait(
        &self,
        spec: &ReadinessSpec,
        client: Arc<dyn ResourceClient>,
        ctx: &StepContext,
    ) -> Result<PollReport, PollError> {
        let probe = spec.probe.clone();
        self.poll_until(
            spec.max_attempts,
            spec.interval,
            || probe.poll(client.clone(), ctx.clone()),
            |snapshot| spec.is_ready(snapshot),
        )
        .await
    }

    /// Call `poll` until `is_ready` holds, at most `max_attempts` times,
    /// sleeping `interval` between calls.
    ///
    /// Transient probe errors use up an attempt; any other probe error
    /// ends polling immediately.
    pub async fn poll_until<F, Fut, R>(
        &self,
        max_attempts: u32,
        interval: Duration,
        mut poll: F,
        is_ready: R,
    ) -> Result<PollReport, PollError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<StateSnapshot, ResourceError>>,
        R: Fn(&StateSnapshot) -> bool,
    {
        let mut last = None;

        for attempt in 1..=max_attempts {
            match poll().await {
                Ok(snapshot) => {
                    if is_ready(&snapshot) {
                        return Ok(PollReport {
                            attempts: attempt,
                            snapshot,
                        });
                    }
                    debug!(attempt, state = %snapshot.state, "Not ready yet");
                    last = Some(snapshot);
                }
                Err(error) => match classify(&error) {
                    Classification::Transient => {
                        debug!(attempt, error = %error, "Transient probe failure");
                    }
                    _ => {
                        return Err(PollError::Probe {
                            attempts: attempt,
                            error,
                        })
                    }
                },
            }

            if attempt < max_attempts {
                tokio::time::sleep(interval).await;
            }
        }

        Err(PollError::Timeout {
            attempts: max_attempts,
            last,
        })
    }
}
