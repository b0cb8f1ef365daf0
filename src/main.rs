mod args;
mod cli;
mod config;
mod coordinator;
mod error;
mod instance;
mod job;
mod registry;
mod runner;
mod tracker;
mod trigger;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use cli::{Cli, Command};
use config::PipelineConfig;
use error::BatchflowError;
use instance::{InstanceSnapshot, WorkflowState};
use job::RunState;
use runner::SimulatedRunner;
use trigger::{PredicateOperator, TriggerKind};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --verbose.
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    match cli.command {
        Command::Run {
            config,
            batch_id,
            fail,
            time_out,
            step_delay_ms,
            runner_down,
            json,
        } => run(config, batch_id, fail, time_out, step_delay_ms, runner_down, json).await?,
        Command::Validate { config } => validate(config)?,
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<PipelineConfig, BatchflowError> {
    match path {
        Some(path) => PipelineConfig::load(&path),
        None => Ok(PipelineConfig::document_pipeline()),
    }
}

async fn run(
    config: Option<PathBuf>,
    batch_id: Option<String>,
    fail: Vec<String>,
    time_out: Vec<String>,
    step_delay_ms: u64,
    runner_down: bool,
    json: bool,
) -> Result<(), BatchflowError> {
    let config = load_config(config)?;
    let name = config.workflow.name.clone();

    let mut runner = SimulatedRunner::new(Duration::from_millis(step_delay_ms));
    for job in fail {
        runner = runner.with_outcome(job, RunState::Failed);
    }
    for job in time_out {
        runner = runner.with_outcome(job, RunState::TimedOut);
    }
    if runner_down {
        runner = runner.unavailable();
    }

    let workflow = config
        .into_workflow(Arc::new(runner))?
        .with_sweep_interval(Duration::from_secs(1));

    let batch_id =
        batch_id.unwrap_or_else(|| format!("batch-{}", Utc::now().format("%Y%m%d%H%M%S")));
    let overrides = HashMap::from([("batch_id".to_string(), batch_id.clone())]);

    println!("Running workflow '{name}' with batch_id {batch_id}");
    let instance = workflow.start(overrides).await;
    println!("Instance {}", instance.instance_id);

    let state = workflow.drive(&instance).await;
    let snapshot = instance.snapshot().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_summary(&snapshot);
    }

    if state == WorkflowState::Failed {
        std::process::exit(1);
    }
    Ok(())
}

fn print_summary(snapshot: &InstanceSnapshot) {
    for run in &snapshot.runs {
        let duration = run
            .ended_at
            .map(|end| format!("{} ms", (end - run.started_at).num_milliseconds()))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<24} {:<10} attempt {}  {}",
            run.job_name,
            run.state.to_string(),
            run.attempt,
            duration
        );
    }
    println!("Instance {} ended {}", snapshot.instance_id, snapshot.state);
    if let Some(failure) = &snapshot.failure {
        println!("  failure: {failure}");
    }
}

fn validate(config: Option<PathBuf>) -> Result<(), BatchflowError> {
    let config = load_config(config)?;
    let name = config.workflow.name.clone();
    let (registry, triggers) = config.build()?;
    if registry.is_empty() {
        println!("Pipeline '{name}' defines no jobs");
        std::process::exit(1);
    }
    let job_count = registry.len();

    // Workflow construction performs the full graph validation, including
    // cycle detection; the runner is never invoked here.
    let workflow = coordinator::Workflow::new(
        registry,
        triggers,
        Arc::new(SimulatedRunner::new(Duration::ZERO)),
    )?;

    println!("Pipeline '{name}' is valid: {job_count} job(s)");
    for trigger in workflow.triggers().iter() {
        let actions = trigger.actions.join(", ");
        match trigger.kind {
            TriggerKind::OnDemand => {
                println!("  {} (on demand) -> {actions}", trigger.name);
            }
            TriggerKind::Conditional => {
                let joiner = match trigger.predicate.operator {
                    PredicateOperator::And => " AND ",
                    PredicateOperator::Or => " OR ",
                };
                let conditions = trigger
                    .predicate
                    .conditions
                    .iter()
                    .map(|c| format!("{} = {}", c.job_name, c.required_state))
                    .collect::<Vec<_>>()
                    .join(joiner);
                println!("  {} (when {conditions}) -> {actions}", trigger.name);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod smoke {
    use super::*;

    #[test]
    fn builtin_pipeline_passes_validation() {
        let config = load_config(None).unwrap();
        let (registry, triggers) = config.build().unwrap();
        let workflow = coordinator::Workflow::new(
            registry,
            triggers,
            Arc::new(SimulatedRunner::new(Duration::ZERO)),
        );
        assert!(workflow.is_ok());
    }
}
