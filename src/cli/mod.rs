//! Command-line interface for emugate.
//!
//! Runs the provisioning plans against the in-process emulator, and
//! checks a running LocalStack's health.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::task::JoinSet;

use crate::adapters::{EmulatorClient, HealthProbe};
use crate::catalog::{self, function};
use crate::config::{self, ResolvedConfig};
use crate::core::{Orchestrator, ProvisionError};
use crate::domain::{ProvisionRecord, ResultHandle};

/// emugate - Idempotent cloud-emulator provisioning
#[derive(Parser, Debug)]
#[command(name = "emugate")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List plans and their steps
    Plans {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Provision a target with a plan
    Ensure {
        /// Plan name (see `emugate plans`)
        plan: String,

        /// Target identity (defaults to the configured name)
        target: Option<String>,

        /// Number of concurrent callers
        #[arg(short, long, default_value = "1")]
        callers: usize,

        /// Describes a new table or function stays Pending for
        #[arg(long, default_value = "0")]
        converge_after: u32,

        /// Print the record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Deploy a function and invoke it once
    Invoke {
        /// Function name (defaults to the configured integration target)
        function: Option<String>,

        /// Describes the function stays Pending for
        #[arg(long, default_value = "0")]
        converge_after: u32,
    },

    /// Check the LocalStack health endpoint
    Health {
        /// Wait until every configured service is up
        #[arg(short, long)]
        wait: bool,

        /// Maximum number of health checks when waiting
        #[arg(long, default_value = "30")]
        attempts: u32,

        /// Delay between health checks in milliseconds
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = config::config()?;

        match self.command {
            Commands::Plans { json } => list_plans(cfg, json),
            Commands::Ensure {
                plan,
                target,
                callers,
                converge_after,
                json,
            } => ensure(cfg, &plan, target, callers, converge_after, json).await,
            Commands::Invoke {
                function,
                converge_after,
            } => invoke(cfg, function, converge_after).await,
            Commands::Health {
                wait,
                attempts,
                interval_ms,
            } => health(cfg, wait, attempts, Duration::from_millis(interval_ms)).await,
            Commands::Config => show_config(cfg),
        }
    }
}

fn emulator(cfg: &ResolvedConfig, converge_after: u32) -> Arc<EmulatorClient> {
    Arc::new(
        EmulatorClient::new(&cfg.endpoint, &cfg.region)
            .with_table_activation_polls(converge_after)
            .with_function_activation_polls(converge_after),
    )
}

/// Fast readiness polls for the in-process emulator
fn local_config(cfg: &ResolvedConfig) -> ResolvedConfig {
    let mut local = cfg.clone();
    local.provisioning.table_readiness.interval_ms = 50;
    local.provisioning.function_readiness.interval_ms = 50;
    local
}

fn list_plans(cfg: &ResolvedConfig, json: bool) -> Result<()> {
    let orchestrator = catalog::standard(cfg, emulator(cfg, 0))?;
    let summaries = orchestrator.plan_summaries();

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    for plan in summaries {
        println!("{}", plan.name);
        println!("  {}", plan.description);
        for step in &plan.steps {
            let readiness = step
                .readiness
                .as_ref()
                .map(|r| format!(" (poll {}x every {}ms)", r.max_attempts, r.interval_ms))
                .unwrap_or_default();
            let result = if plan.result_step.as_deref() == Some(step.name.as_str()) {
                " [result]"
            } else {
                ""
            };
            println!("    - {:<30} {:?}{}{}", step.name, step.idempotency, readiness, result);
        }
        println!();
    }

    Ok(())
}

async fn ensure(
    cfg: &ResolvedConfig,
    plan: &str,
    target: Option<String>,
    callers: usize,
    converge_after: u32,
    json: bool,
) -> Result<()> {
    let target = match target {
        Some(t) => t,
        None => catalog::default_target(cfg, plan)
            .with_context(|| format!("Unknown plan '{}'", plan))?,
    };

    let client = emulator(cfg, converge_after);
    let orchestrator = Arc::new(catalog::standard(&local_config(cfg), client.clone())?);
    if !orchestrator.plan_names().contains(&plan) {
        anyhow::bail!("Unknown plan '{}'", plan);
    }

    let outcomes = run_callers(&orchestrator, plan, &target, callers.max(1)).await?;
    let record = orchestrator
        .record(plan, &target)
        .await
        .with_context(|| format!("No record for {}/{}", plan, target))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        print_record(&record);
        println!();
        println!("Callers:");
        for (i, outcome) in outcomes.iter().enumerate() {
            match outcome {
                Ok(handle) => println!("  #{:<3} ok     {}", i + 1, handle),
                Err(e) => println!("  #{:<3} error  {}", i + 1, e),
            }
        }
        println!();
        println!("Backend calls:");
        for (op, count) in client.call_counts().await {
            println!("  {:<28} {}", format!("{:?}", op), count);
        }
    }

    match &record.last_error {
        Some(err) => anyhow::bail!("{}", err),
        None => Ok(()),
    }
}

/// Call `ensure_provisioned` from `callers` concurrent tasks
async fn run_callers(
    orchestrator: &Arc<Orchestrator>,
    plan: &str,
    target: &str,
    callers: usize,
) -> Result<Vec<Result<ResultHandle, ProvisionError>>> {
    let mut set = JoinSet::new();

    for i in 0..callers {
        let orchestrator = orchestrator.clone();
        let plan = plan.to_string();
        let target = target.to_string();
        set.spawn(async move { (i, orchestrator.ensure_provisioned(&plan, &target).await) });
    }

    let mut outcomes = Vec::with_capacity(callers);
    while let Some(joined) = set.join_next().await {
        outcomes.push(joined.context("Caller task failed")?);
    }
    outcomes.sort_by_key(|(i, _)| *i);

    Ok(outcomes.into_iter().map(|(_, outcome)| outcome).collect())
}

async fn invoke(cfg: &ResolvedConfig, name: Option<String>, converge_after: u32) -> Result<()> {
    let name = name.unwrap_or_else(|| cfg.resources.rest_api.function.clone());

    let orchestrator = catalog::standard(&local_config(cfg), emulator(cfg, converge_after))?;

    let arn = orchestrator.ensure_provisioned(function::ENSURE_PLAN, &name).await?;
    println!("Function: {}", arn);

    let response = orchestrator.ensure_provisioned(function::INVOKE_PLAN, &name).await?;
    println!("Response: {}", response);

    if let Some(record) = orchestrator.record(function::INVOKE_PLAN, &name).await {
        println!();
        print_record(&record);
    }

    Ok(())
}

async fn health(cfg: &ResolvedConfig, wait: bool, attempts: u32, interval: Duration) -> Result<()> {
    let probe = HealthProbe::new(&cfg.endpoint);

    if wait {
        let report = probe
            .wait_until_ready(&cfg.services, attempts, interval)
            .await
            .with_context(|| format!("Emulator at {} is not ready", cfg.endpoint))?;
        println!("Ready after {} check(s)", report.attempts);
    }

    let report = probe.check().await?;
    println!("Endpoint: {}", cfg.endpoint);
    if let Some(ref version) = report.version {
        println!("Version:  {}", version);
    }
    println!();
    println!("{:<20} {:<15} {}", "SERVICE", "STATUS", "REQUIRED");
    println!("{}", "-".repeat(45));
    for (service, status) in &report.services {
        let required = if cfg.services.contains(service) { "yes" } else { "" };
        println!("{:<20} {:<15} {}", service, status, required);
    }

    let missing = report.missing(&cfg.services);
    if !missing.is_empty() {
        anyhow::bail!("Services not up: {}", missing.join(", "));
    }
    Ok(())
}

fn print_record(record: &ProvisionRecord) {
    println!("Record:     {}", record.key);
    println!("Status:     {:?}", record.status);
    println!("Executions: {}", record.executions);
    if let Some(ref result) = record.result {
        println!("Result:     {}", result);
        for (step, output) in &result.outputs {
            println!("  {:<30} {}", step, output);
        }
    }
    if let Some(ref err) = record.last_error {
        println!("Error:      {}", err);
    }

    println!();
    println!("History:");
    for event in &record.history {
        let step = event.step.as_deref().unwrap_or("-");
        println!(
            "  [{}] #{} {:<28} {:<22} {}",
            event.timestamp.format("%H:%M:%S%.3f"),
            event.execution,
            step,
            format!("{:?}", event.event_type),
            event.summary
        );
    }
}

fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    println!("emugate configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("{}", serde_yaml::to_string(cfg).context("Failed to render configuration")?);

    Ok(())
}
