//! clap-based command line interface.
//!
//! `run` executes a pipeline against the simulated job runner; `validate`
//! bootstraps a pipeline definition and prints the trigger graph without
//! dispatching anything.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// batchflow: batch pipeline orchestrator for document-processing jobs.
#[derive(Debug, Parser)]
#[command(name = "batchflow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose (debug-level) output.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the pipeline to completion against the simulated job runner.
    Run {
        /// Path to a TOML pipeline definition; defaults to the built-in
        /// document pipeline.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Batch identifier injected as the `batch_id` argument of every job.
        #[arg(long)]
        batch_id: Option<String>,

        /// Force the named job to report FAILED (repeatable).
        #[arg(long, value_name = "JOB")]
        fail: Vec<String>,

        /// Force the named job to report TIMED_OUT (repeatable).
        #[arg(long = "timeout", value_name = "JOB")]
        time_out: Vec<String>,

        /// Simulated per-job execution time in milliseconds.
        #[arg(long, default_value_t = 250)]
        step_delay_ms: u64,

        /// Make the simulated runner refuse every submission, to rehearse a
        /// runner outage.
        #[arg(long, default_value_t = false)]
        runner_down: bool,

        /// Print the final instance snapshot as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Validate a pipeline definition and print its trigger graph.
    Validate {
        /// Path to a TOML pipeline definition; defaults to the built-in
        /// document pipeline.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}
