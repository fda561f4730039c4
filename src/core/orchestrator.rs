//! Provisioning orchestrator.
//!
//! Runs each registered plan at most once at a time per target identity,
//! caches successful results, classifies step failures, retries transient
//! ones and waits on readiness polls.
//!
//! Records live in a map guarded by an `RwLock` that is only held for
//! lookup and insertion. Each record has its own lock, held only for
//! short state transitions, never across a backend call. Plan execution
//! runs in a task owned by the orchestrator; callers await its outcome
//! on a watch channel, so a caller that stops waiting does not cancel it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use crate::adapters::{ResourceClient, ResourceError};
use crate::domain::{
    EventType, ProvisionEvent, ProvisionRecord, ProvisionStatus, RecordKey, ResultHandle,
};

use super::classify::{classify, Classification};
use super::error::ProvisionError;
use super::plan::{Idempotency, Plan, PlanSummary, Step, StepContext};
use super::poller::{PollError, ReadinessPoller};

type Outcome = Result<ResultHandle, ProvisionError>;

/// A plan bound to the backend it runs against
struct RegisteredPlan {
    plan: Plan,
    client: Arc<dyn ResourceClient>,
}

struct SlotState {
    record: ProvisionRecord,

    /// Outcome channel of the running execution, while InProgress
    inflight: Option<watch::Receiver<Option<Outcome>>>,
}

/// Per-target record plus its lock
struct RecordSlot {
    state: Mutex<SlotState>,
}

impl RecordSlot {
    fn new(key: RecordKey) -> Self {
        Self {
            state: Mutex::new(SlotState {
                record: ProvisionRecord::new(key),
                inflight: None,
            }),
        }
    }

    async fn log(&self, event: ProvisionEvent) {
        self.state.lock().await.record.push(event);
    }
}

enum Admission {
    Cached(ResultHandle),
    Waiting(watch::Receiver<Option<Outcome>>),
}

/// Main provisioning orchestrator
pub struct Orchestrator {
    plans: HashMap<String, Arc<RegisteredPlan>>,
    records: RwLock<HashMap<RecordKey, Arc<RecordSlot>>>,
    poller: ReadinessPoller,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    /// Create an orchestrator with no plans
    pub fn new() -> Self {
        Self {
            plans: HashMap::new(),
            records: RwLock::new(HashMap::new()),
            poller: ReadinessPoller::new(),
        }
    }

    /// Register a plan and the client its steps run against
    pub fn register(
        &mut self,
        plan: Plan,
        client: Arc<dyn ResourceClient>,
    ) -> Result<(), ProvisionError> {
        plan.validate()?;

        if self.plans.contains_key(&plan.name) {
            return Err(ProvisionError::DuplicatePlan { plan: plan.name });
        }

        debug!(plan = %plan.name, backend = client.name(), "Registered plan");
        self.plans
            .insert(plan.name.clone(), Arc::new(RegisteredPlan { plan, client }));
        Ok(())
    }

    /// Names of all registered plans, sorted
    pub fn plan_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.plans.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Summaries of all registered plans, sorted by name
    pub fn plan_summaries(&self) -> Vec<PlanSummary> {
        self.plan_names()
            .into_iter()
            .filter_map(|name| self.plans.get(name))
            .map(|registered| registered.plan.summary())
            .collect()
    }

    /// Provision `target` with the named plan, or return the cached result.
    ///
    /// Concurrent calls for the same (plan, target) share one execution.
    #[instrument(skip_all, fields(plan = %plan_name, target = %target))]
    pub async fn ensure_provisioned(
        &self,
        plan_name: &str,
        target: &str,
    ) -> Result<ResultHandle, ProvisionError> {
        match self.admit(plan_name, target).await? {
            Admission::Cached(handle) => {
                debug!("Cache hit");
                Ok(handle)
            }
            Admission::Waiting(rx) => await_outcome(rx, plan_name, target).await,
        }
    }

    /// Like [`ensure_provisioned`](Self::ensure_provisioned), but stop
    /// waiting after `wait`. The execution itself keeps running.
    pub async fn ensure_provisioned_within(
        &self,
        plan_name: &str,
        target: &str,
        wait: Duration,
    ) -> Result<ResultHandle, ProvisionError> {
        match tokio::time::timeout(wait, self.ensure_provisioned(plan_name, target)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(plan = %plan_name, %target, waited_ms = wait.as_millis() as u64, "Stopped waiting");
                Err(ProvisionError::WaitElapsed {
                    plan: plan_name.to_string(),
                    target: target.to_string(),
                    waited_ms: wait.as_millis() as u64,
                })
            }
        }
    }

    /// Snapshot of one record
    pub async fn record(&self, plan_name: &str, target: &str) -> Option<ProvisionRecord> {
        let slot = self
            .records
            .read()
            .await
            .get(&RecordKey::new(plan_name, target))
            .cloned()?;
        let state = slot.state.lock().await;
        Some(state.record.clone())
    }

    /// Snapshots of all records, sorted by key
    pub async fn records(&self) -> Vec<ProvisionRecord> {
        let slots: Vec<Arc<RecordSlot>> = self.records.read().await.values().cloned().collect();

        let mut records = Vec::with_capacity(slots.len());
        for slot in slots {
            records.push(slot.state.lock().await.record.clone());
        }
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    /// Explicitly reset a Ready or Failed record to NotStarted
    pub async fn reset(&self, plan_name: &str, target: &str) -> Result<(), ProvisionError> {
        if !self.plans.contains_key(plan_name) {
            return Err(ProvisionError::UnknownPlan {
                plan: plan_name.to_string(),
            });
        }

        let key = RecordKey::new(plan_name, target);
        let Some(slot) = self.records.read().await.get(&key).cloned() else {
            return Ok(());
        };

        let mut state = slot.state.lock().await;
        if !state.record.reset() {
            return Err(ProvisionError::ResetWhileInProgress {
                plan: plan_name.to_string(),
                target: target.to_string(),
            });
        }

        info!(%key, "Record reset");
        Ok(())
    }

    /// Look up or create the slot for a key
    async fn slot(&self, key: &RecordKey) -> Arc<RecordSlot> {
        if let Some(slot) = self.records.read().await.get(key) {
            return slot.clone();
        }

        self.records
            .write()
            .await
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RecordSlot::new(key.clone())))
            .clone()
    }

    /// Decide under the record lock whether to serve the cache, join an
    /// in-flight execution, or start a new one.
    async fn admit(&self, plan_name: &str, target: &str) -> Result<Admission, ProvisionError> {
        let registered = self
            .plans
            .get(plan_name)
            .cloned()
            .ok_or_else(|| ProvisionError::UnknownPlan {
                plan: plan_name.to_string(),
            })?;

        let key = RecordKey::new(plan_name, target);
        let slot = self.slot(&key).await;
        let mut state = slot.state.lock().await;

        match state.record.status {
            ProvisionStatus::Ready => {
                if let Some(ref handle) = state.record.result {
                    return Ok(Admission::Cached(handle.clone()));
                }
            }
            ProvisionStatus::InProgress => {
                if let Some(ref rx) = state.inflight {
                    debug!("Joining in-flight execution");
                    return Ok(Admission::Waiting(rx.clone()));
                }
            }
            ProvisionStatus::NotStarted | ProvisionStatus::Failed => {}
        }

        let Some(execution) = state.record.begin() else {
            return Err(ProvisionError::ExecutionAborted {
                plan: plan_name.to_string(),
                target: target.to_string(),
            });
        };

        let (tx, rx) = watch::channel(None);
        state.inflight = Some(rx.clone());
        state.record.push(ProvisionEvent::new(
            execution,
            None,
            EventType::ExecutionStarted,
            format!("Plan '{}' started for '{}'", plan_name, target),
        ));
        drop(state);

        info!(execution, "Starting plan execution");

        let span = info_span!("provision", plan = %plan_name, target = %target, execution);
        let runner = PlanRunner {
            registered,
            slot,
            target: target.to_string(),
            execution,
            poller: self.poller,
        };
        tokio::spawn(runner.supervise(tx).instrument(span));

        Ok(Admission::Waiting(rx))
    }
}

async fn await_outcome(
    mut rx: watch::Receiver<Option<Outcome>>,
    plan_name: &str,
    target: &str,
) -> Outcome {
    let aborted = || ProvisionError::ExecutionAborted {
        plan: plan_name.to_string(),
        target: target.to_string(),
    };

    match rx.wait_for(Option::is_some).await {
        Ok(outcome) => (*outcome).clone().unwrap_or_else(|| Err(aborted())),
        Err(_) => Err(aborted()),
    }
}

/// One execution of a plan for one target
struct PlanRunner {
    registered: Arc<RegisteredPlan>,
    slot: Arc<RecordSlot>,
    target: String,
    execution: u32,
    poller: ReadinessPoller,
}

impl PlanRunner {
    /// Run the plan in its own task and publish the outcome, even if
    /// that task panics.
    async fn supervise(self, tx: watch::Sender<Option<Outcome>>) {
        let runner = Arc::new(self);

        let task = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run().await }.in_current_span())
        };

        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(join_error) => {
                error!(error = %join_error, "Plan execution aborted");
                Err(ProvisionError::ExecutionAborted {
                    plan: runner.plan().name.clone(),
                    target: runner.target.clone(),
                })
            }
        };

        runner.settle(&outcome).await;
        tx.send_replace(Some(outcome));
    }

    fn plan(&self) -> &Plan {
        &self.registered.plan
    }

    /// Execute every step in order
    async fn run(&self) -> Outcome {
        let plan = self.plan();
        let mut ctx = StepContext::new(&plan.name, &self.target);

        for step in &plan.steps {
            ctx.enter(&step.name);

            if step.idempotency == Idempotency::RequiresPriorStep {
                if let Err(e) = ctx.previous() {
                    return Err(self.step_failed(step, e, 0).await);
                }
            }

            let output = self.execute_step_with_retry(step, &ctx).await?;
            ctx.record(&step.name, output);

            if let Some(ref readiness) = step.readiness {
                let start = Instant::now();
                match self
                    .poller
                    .wait(readiness, self.registered.client.clone(), &ctx)
                    .await
                {
                    Ok(report) => {
                        self.slot
                            .log(
                                ProvisionEvent::new(
                                    self.execution,
                                    Some(step.name.as_str()),
                                    EventType::ReadinessReached,
                                    format!(
                                        "Step '{}' ready after {} poll(s)",
                                        step.name, report.attempts
                                    ),
                                )
                                .with_duration(start.elapsed().as_millis() as u64),
                            )
                            .await;
                    }
                    Err(PollError::Timeout { attempts, last }) => {
                        let last_state = last
                            .map(|s| s.state.to_string())
                            .unwrap_or_else(|| "unknown".to_string());
                        warn!(step = %step.name, attempts, %last_state, "Readiness timed out");

                        let err = ProvisionError::NotReady {
                            plan: plan.name.clone(),
                            target: self.target.clone(),
                            step: step.name.clone(),
                            attempts,
                            last_state,
                        };
                        self.slot
                            .log(
                                ProvisionEvent::new(
                                    self.execution,
                                    Some(step.name.as_str()),
                                    EventType::ReadinessTimedOut,
                                    format!("Step '{}' not ready", step.name),
                                )
                                .with_duration(start.elapsed().as_millis() as u64)
                                .with_error(err.to_string()),
                            )
                            .await;
                        return Err(err);
                    }
                    Err(PollError::Probe { attempts, error }) => {
                        return Err(self.step_failed(step, error, attempts).await);
                    }
                }
            }
        }

        let outputs: BTreeMap<String, String> = ctx
            .outputs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let value = plan
            .result_step_name()
            .and_then(|name| outputs.get(name).cloned())
            .unwrap_or_default();

        Ok(ResultHandle { value, outputs })
    }

    /// Execute a step, retrying transient failures
    async fn execute_step_with_retry(
        &self,
        step: &Step,
        ctx: &StepContext,
    ) -> Result<String, ProvisionError> {
        let policy = step.retry_policy(&self.plan().retry_policy);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let step_start = Instant::now();

            self.slot
                .log(ProvisionEvent::new(
                    self.execution,
                    Some(step.name.as_str()),
                    EventType::StepStarted,
                    format!("Step '{}' attempt {}", step.name, attempt),
                ))
                .await;

            let result = step
                .action
                .run(self.registered.client.clone(), ctx.clone())
                .await;

            let duration_ms = step_start.elapsed().as_millis() as u64;

            let error = match result {
                Ok(output) => {
                    debug!(
                        step = %step.name,
                        output = %output.value,
                        attributes = ?output.attributes,
                        duration_ms,
                        "Step completed"
                    );

                    let event = if output.existed {
                        info!(step = %step.name, output = %output.value, "Already satisfied");
                        ProvisionEvent::new(
                            self.execution,
                            Some(step.name.as_str()),
                            EventType::StepAlreadySatisfied,
                            format!("Step '{}' already satisfied (reported existing)", step.name),
                        )
                    } else {
                        ProvisionEvent::new(
                            self.execution,
                            Some(step.name.as_str()),
                            EventType::StepCompleted,
                            format!("Step '{}' completed in {}ms", step.name, duration_ms),
                        )
                    };
                    self.slot.log(event.with_duration(duration_ms)).await;
                    return Ok(output.value);
                }
                Err(e) => e,
            };

            match classify(&error) {
                Classification::AlreadyExists => {
                    let output = error
                        .existing_identity
                        .clone()
                        .unwrap_or_else(|| ctx.target().to_string());

                    info!(step = %step.name, code = %error.code, %output, "Already satisfied");
                    self.slot
                        .log(
                            ProvisionEvent::new(
                                self.execution,
                                Some(step.name.as_str()),
                                EventType::StepAlreadySatisfied,
                                format!("Step '{}' already satisfied ({})", step.name, error.code),
                            )
                            .with_duration(duration_ms),
                        )
                        .await;
                    return Ok(output);
                }
                Classification::Transient if policy.should_retry(attempt) => {
                    let delay = policy.delay_for_attempt(attempt);

                    warn!(
                        step = %step.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Step failed, retrying"
                    );
                    self.slot
                        .log(
                            ProvisionEvent::new(
                                self.execution,
                                Some(step.name.as_str()),
                                EventType::StepRetrying,
                                format!(
                                    "Step '{}' failed, retrying in {:?}",
                                    step.name, delay
                                ),
                            )
                            .with_duration(duration_ms)
                            .with_error(error.to_string()),
                        )
                        .await;

                    tokio::time::sleep(delay).await;
                }
                Classification::Transient | Classification::Fatal => {
                    return Err(self.step_failed(step, error, attempt).await);
                }
            }
        }
    }

    /// Log a fatal step failure and build the caller-facing error
    async fn step_failed(&self, step: &Step, error: ResourceError, attempts: u32) -> ProvisionError {
        error!(step = %step.name, attempts, error = %error, "Step failed permanently");

        let err = ProvisionError::StepFailed {
            plan: self.plan().name.clone(),
            target: self.target.clone(),
            step: step.name.clone(),
            code: error.code,
            detail: error.message,
            attempts,
        };

        self.slot
            .log(
                ProvisionEvent::new(
                    self.execution,
                    Some(step.name.as_str()),
                    EventType::StepFailed,
                    format!("Step '{}' failed after {} attempt(s)", step.name, attempts),
                )
                .with_error(err.to_string()),
            )
            .await;

        err
    }

    /// Store the outcome on the record and close the execution
    async fn settle(&self, outcome: &Outcome) {
        let mut state = self.slot.state.lock().await;

        match outcome {
            Ok(handle) => {
                info!(result = %handle, "Plan completed");
                state.record.complete(handle.clone());
                state.record.push(ProvisionEvent::new(
                    self.execution,
                    None,
                    EventType::ExecutionCompleted,
                    format!("Plan '{}' completed: {}", self.plan().name, handle),
                ));
            }
            Err(e) => {
                error!(error = %e, "Plan failed");
                state.record.fail(e.clone());
                state.record.push(
                    ProvisionEvent::new(
                        self.execution,
                        e.step(),
                        EventType::ExecutionFailed,
                        format!("Plan '{}' failed", self.plan().name),
                    )
                    .with_error(e.to_string()),
                );
            }
        }

        state.inflight = None;
    }
}
