use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a single job run.
///
/// `Succeeded`, `Failed`, `TimedOut` and `Stopped` are terminal: once a run
/// reaches one of them no further transition occurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Stopped,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::TimedOut | RunState::Stopped
        )
    }

    /// Terminal states other than success.
    pub fn is_failure(self) -> bool {
        matches!(self, RunState::Failed | RunState::TimedOut | RunState::Stopped)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Pending => write!(f, "PENDING"),
            RunState::Running => write!(f, "RUNNING"),
            RunState::Succeeded => write!(f, "SUCCEEDED"),
            RunState::Failed => write!(f, "FAILED"),
            RunState::TimedOut => write!(f, "TIMED_OUT"),
            RunState::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Immutable specification of one schedulable job, created at bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    /// Object-store key of the script or image the runner executes.
    pub executable_ref: String,
    pub default_arguments: HashMap<String, String>,
    /// Keys that must be present after merging runtime overrides.
    pub required_arguments: Vec<String>,
    pub max_concurrent_runs: u32,
    pub max_retries: u32,
    pub timeout: Duration,
    /// Opaque resource-limit reference, passed through to the runner.
    pub resource_limit: Option<String>,
}

impl JobDefinition {
    /// A definition with the pipeline defaults: one concurrent run, no
    /// retries, 30-minute timeout.
    pub fn new(name: impl Into<String>, executable_ref: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            executable_ref: executable_ref.into(),
            default_arguments: HashMap::new(),
            required_arguments: Vec::new(),
            max_concurrent_runs: 1,
            max_retries: 0,
            timeout: Duration::from_secs(30 * 60),
            resource_limit: None,
        }
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_arguments.insert(key.into(), value.into());
        self
    }

    pub fn with_required(mut self, key: impl Into<String>) -> Self {
        self.required_arguments.push(key.into());
        self
    }

    pub fn with_max_concurrent_runs(mut self, max: u32) -> Self {
        self.max_concurrent_runs = max;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_resource_limit(mut self, limit: impl Into<String>) -> Self {
        self.resource_limit = Some(limit.into());
        self
    }
}

/// One dispatch attempt of a job within a workflow instance.
#[derive(Debug, Clone, Serialize)]
pub struct JobRun {
    pub run_id: Uuid,
    pub job_name: String,
    pub state: RunState,
    /// 1-based attempt counter; incremented by automatic redispatch.
    pub attempt: u32,
    pub resolved_arguments: HashMap<String, String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Diagnostic from the last failure report, kept for run history.
    pub last_error: Option<String>,
    /// Runner handle, kept for best-effort stop signals on abort.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<crate::runner::RunHandle>,
}

impl JobRun {
    pub fn new(job_name: impl Into<String>, arguments: HashMap<String, String>, attempt: u32) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            job_name: job_name.into(),
            state: RunState::Pending,
            attempt,
            resolved_arguments: arguments,
            started_at: Utc::now(),
            ended_at: None,
            last_error: None,
            handle: None,
        }
    }
}

/// Emitted by the run tracker when a job reaches a state the trigger engine
/// must react to: success, or failure with the retry budget exhausted.
#[derive(Debug, Clone)]
pub struct JobCompletionEvent {
    pub job_name: String,
    pub run_id: Uuid,
    pub state: RunState,
}

/// Exponential backoff schedule for runner submissions.
///
/// This budget covers `RunnerUnavailable` only and is independent of a job's
/// own `max_retries`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryBackoff {
    /// Total submit attempts before giving up.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryBackoff {
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms * 2u64.pow(attempt.saturating_sub(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_state_terminality() {
        assert!(!RunState::Pending.is_terminal());
        assert!(!RunState::Running.is_terminal());
        assert!(RunState::Succeeded.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(RunState::TimedOut.is_terminal());
        assert!(RunState::Stopped.is_terminal());

        assert!(!RunState::Succeeded.is_failure());
        assert!(RunState::TimedOut.is_failure());
        assert!(RunState::Stopped.is_failure());
    }

    #[test]
    fn run_state_display() {
        assert_eq!(RunState::TimedOut.to_string(), "TIMED_OUT");
        assert_eq!(RunState::Succeeded.to_string(), "SUCCEEDED");
    }

    #[test]
    fn definition_defaults() {
        let def = JobDefinition::new("clean_html", "scripts/clean_html.py");
        assert_eq!(def.max_concurrent_runs, 1);
        assert_eq!(def.max_retries, 0);
        assert_eq!(def.timeout, Duration::from_secs(1800));
        assert!(def.default_arguments.is_empty());
        assert!(def.resource_limit.is_none());
    }

    #[test]
    fn definition_builder_chain() {
        let def = JobDefinition::new("topic_model", "scripts/topic_model.py")
            .with_argument("num_topics", "40")
            .with_required("batch_id")
            .with_max_retries(2)
            .with_timeout(Duration::from_secs(3600));
        assert_eq!(def.default_arguments["num_topics"], "40");
        assert_eq!(def.required_arguments, vec!["batch_id"]);
        assert_eq!(def.max_retries, 2);
        assert_eq!(def.timeout, Duration::from_secs(3600));
    }

    #[test]
    fn job_run_starts_pending() {
        let run = JobRun::new("clean_html", HashMap::new(), 1);
        assert_eq!(run.state, RunState::Pending);
        assert_eq!(run.attempt, 1);
        assert!(run.ended_at.is_none());
        assert!(run.last_error.is_none());
    }

    #[test]
    fn backoff_is_exponential() {
        let backoff = RetryBackoff {
            max_attempts: 4,
            base_delay_ms: 500,
        };
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(2000));
    }

    #[test]
    fn run_state_serde_snake_case() {
        assert_eq!(serde_json::to_string(&RunState::TimedOut).unwrap(), "\"timed_out\"");
        let state: RunState = serde_json::from_str("\"succeeded\"").unwrap();
        assert_eq!(state, RunState::Succeeded);
    }
}
