//! Per-execution workflow state.
//!
//! All mutable state for one execution lives in [`InstanceState`] behind a
//! single `tokio::sync::Mutex`: trigger evaluation, dispatch, and state
//! recomputation for an instance are serialized through that one lock, while
//! independent instances share nothing mutable.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::job::{JobRun, RunState};
use crate::runner::CompletionReport;

/// Workflow lifecycle: `Idle → Running → Completed | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Idle,
    Running,
    Completed,
    Failed,
}

impl WorkflowState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowState::Completed | WorkflowState::Failed)
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowState::Idle => write!(f, "IDLE"),
            WorkflowState::Running => write!(f, "RUNNING"),
            WorkflowState::Completed => write!(f, "COMPLETED"),
            WorkflowState::Failed => write!(f, "FAILED"),
        }
    }
}

/// An action dispatch postponed because the job was at its concurrency
/// limit; retried on the next evaluation tick.
#[derive(Debug, Clone)]
pub struct DeferredDispatch {
    pub trigger_name: String,
    pub job_name: String,
}

/// Mutable state of one workflow execution, guarded by the instance lock.
#[derive(Debug)]
pub struct InstanceState {
    pub instance_id: Uuid,
    pub state: WorkflowState,
    pub started_at: DateTime<Utc>,
    pub runtime_overrides: HashMap<String, String>,
    pub runs: Vec<JobRun>,
    /// Names of triggers that already fired; a trigger never re-arms within
    /// an instance.
    pub fired: HashSet<String>,
    pub deferred: Vec<DeferredDispatch>,
    pub aborted: bool,
    /// Diagnostic for a FAILED instance: originating job and last error.
    pub failure: Option<String>,
    pub report_tx: mpsc::Sender<CompletionReport>,
}

impl InstanceState {
    pub fn new(
        instance_id: Uuid,
        runtime_overrides: HashMap<String, String>,
        report_tx: mpsc::Sender<CompletionReport>,
    ) -> Self {
        Self {
            instance_id,
            state: WorkflowState::Idle,
            started_at: Utc::now(),
            runtime_overrides,
            runs: Vec::new(),
            fired: HashSet::new(),
            deferred: Vec::new(),
            aborted: false,
            failure: None,
            report_tx,
        }
    }

    /// Latest recorded state per job. Runs are appended in dispatch order,
    /// so the last entry for a job wins.
    pub fn latest_states(&self) -> HashMap<String, RunState> {
        let mut states = HashMap::new();
        for run in &self.runs {
            states.insert(run.job_name.clone(), run.state);
        }
        states
    }

    pub fn run_mut(&mut self, run_id: Uuid) -> Option<&mut JobRun> {
        self.runs.iter_mut().find(|r| r.run_id == run_id)
    }

    /// Runs of a job that currently occupy a concurrency slot.
    pub fn active_runs(&self, job_name: &str) -> u32 {
        self.runs
            .iter()
            .filter(|r| r.job_name == job_name && !r.state.is_terminal())
            .count() as u32
    }

    pub fn has_active_runs(&self) -> bool {
        self.runs.iter().any(|r| !r.state.is_terminal())
    }

    /// Record a terminal failure diagnostic and move the instance to FAILED.
    pub fn fail(&mut self, diagnostic: impl Into<String>) {
        self.failure = Some(diagnostic.into());
        self.state = WorkflowState::Failed;
    }
}

/// Handle to one workflow execution: the locked state plus the report
/// channel drained by the single consumer loop.
pub struct WorkflowInstance {
    pub instance_id: Uuid,
    pub(crate) inner: Mutex<InstanceState>,
    pub(crate) reports: Mutex<mpsc::Receiver<CompletionReport>>,
}

impl WorkflowInstance {
    pub(crate) fn new(state: InstanceState, reports: mpsc::Receiver<CompletionReport>) -> Self {
        Self {
            instance_id: state.instance_id,
            inner: Mutex::new(state),
            reports: Mutex::new(reports),
        }
    }

    pub async fn state(&self) -> WorkflowState {
        self.inner.lock().await.state
    }

    /// Point-in-time status for external queries. Every run that never
    /// succeeded stays individually inspectable here after a failure.
    pub async fn snapshot(&self) -> InstanceSnapshot {
        let state = self.inner.lock().await;
        InstanceSnapshot {
            instance_id: state.instance_id,
            state: state.state,
            started_at: state.started_at,
            failure: state.failure.clone(),
            runs: state.runs.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub instance_id: Uuid,
    pub state: WorkflowState,
    pub started_at: DateTime<Utc>,
    pub failure: Option<String>,
    pub runs: Vec<JobRun>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> InstanceState {
        let (tx, _rx) = mpsc::channel(4);
        InstanceState::new(Uuid::new_v4(), HashMap::new(), tx)
    }

    #[test]
    fn starts_idle_and_empty() {
        let st = state();
        assert_eq!(st.state, WorkflowState::Idle);
        assert!(st.runs.is_empty());
        assert!(st.fired.is_empty());
        assert!(!st.aborted);
    }

    #[test]
    fn latest_state_reflects_redispatch() {
        let mut st = state();
        let mut first = JobRun::new("clean_html", HashMap::new(), 1);
        first.state = RunState::Failed;
        st.runs.push(first);
        let mut second = JobRun::new("clean_html", HashMap::new(), 2);
        second.state = RunState::Running;
        st.runs.push(second);

        let states = st.latest_states();
        assert_eq!(states["clean_html"], RunState::Running);
        assert_eq!(st.active_runs("clean_html"), 1);
    }

    #[test]
    fn fail_records_diagnostic() {
        let mut st = state();
        st.fail("job 'clean_html' exhausted retries: boom");
        assert_eq!(st.state, WorkflowState::Failed);
        assert!(st.failure.as_deref().unwrap().contains("clean_html"));
    }

    #[test]
    fn workflow_state_display() {
        assert_eq!(WorkflowState::Running.to_string(), "RUNNING");
        assert_eq!(WorkflowState::Completed.to_string(), "COMPLETED");
        assert!(WorkflowState::Failed.is_terminal());
        assert!(!WorkflowState::Idle.is_terminal());
    }
}
