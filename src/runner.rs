//! The Job Runner boundary.
//!
//! The orchestrator hands a [`JobSubmission`] to an opaque executor and
//! learns the outcome asynchronously through the report channel carried in
//! the submission. Dispatch is fire-and-forget; the per-instance consumer
//! loop drains the channel.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::RunnerError;
use crate::job::RunState;

/// Opaque handle to a submitted run, used only for best-effort stop signals.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RunHandle(pub String);

/// Everything the runner needs to execute one job run.
#[derive(Debug, Clone)]
pub struct JobSubmission {
    pub run_id: Uuid,
    pub job_name: String,
    pub executable_ref: String,
    pub arguments: HashMap<String, String>,
    pub resource_limit: Option<String>,
    pub timeout: Duration,
    /// Where the runner reports the terminal state.
    pub report: mpsc::Sender<CompletionReport>,
}

/// Terminal report for one run, delivered on the instance's report channel.
#[derive(Debug, Clone)]
pub struct CompletionReport {
    pub run_id: Uuid,
    pub state: RunState,
    pub finished_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl CompletionReport {
    pub fn succeeded(run_id: Uuid) -> Self {
        Self {
            run_id,
            state: RunState::Succeeded,
            finished_at: Utc::now(),
            error: None,
        }
    }

    pub fn failed(run_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            run_id,
            state: RunState::Failed,
            finished_at: Utc::now(),
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Accept a run for execution. Must return quickly; execution itself is
    /// asynchronous and ends with a [`CompletionReport`] on the submission's
    /// report channel.
    async fn submit(&self, submission: JobSubmission) -> Result<RunHandle, RunnerError>;

    /// Best-effort stop signal for an aborted instance. The tracker ignores
    /// any report that still arrives afterwards.
    async fn stop(&self, handle: &RunHandle);
}

/// In-process runner for demos and local pipeline rehearsal: every submission
/// sleeps for a fixed delay and reports success, unless the job is listed in
/// the forced-outcome map.
pub struct SimulatedRunner {
    delay: Duration,
    outcomes: HashMap<String, RunState>,
    available: bool,
}

impl SimulatedRunner {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            outcomes: HashMap::new(),
            available: true,
        }
    }

    /// Force a terminal state for the named job (e.g. `FAILED` to rehearse
    /// the failure path).
    pub fn with_outcome(mut self, job_name: impl Into<String>, state: RunState) -> Self {
        self.outcomes.insert(job_name.into(), state);
        self
    }

    /// Refuse every submission, for rehearsing a runner outage.
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }
}

#[async_trait]
impl JobRunner for SimulatedRunner {
    async fn submit(&self, submission: JobSubmission) -> Result<RunHandle, RunnerError> {
        if !self.available {
            return Err(RunnerError::Unavailable("simulated runner outage".into()));
        }
        let state = self
            .outcomes
            .get(&submission.job_name)
            .copied()
            .unwrap_or(RunState::Succeeded);
        let delay = self.delay;
        let handle = RunHandle(format!("sim-{}", submission.run_id));

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let report = match state {
                RunState::Succeeded => CompletionReport::succeeded(submission.run_id),
                RunState::Failed => CompletionReport::failed(
                    submission.run_id,
                    format!("simulated failure for {}", submission.job_name),
                ),
                other => CompletionReport {
                    run_id: submission.run_id,
                    state: other,
                    finished_at: Utc::now(),
                    error: Some(format!("simulated {other} for {}", submission.job_name)),
                },
            };
            // The consumer may already have shut down after an abort.
            let _ = submission.report.send(report).await;
        });

        Ok(handle)
    }

    async fn stop(&self, handle: &RunHandle) {
        tracing::debug!(handle = %handle.0, "stop signal ignored by simulated runner");
    }
}
