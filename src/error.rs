use thiserror::Error;

/// Rejected workflow definitions. These are bootstrap-time errors only; a
/// workflow that constructs successfully never raises them at runtime.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("duplicate job name: {0}")]
    DuplicateJobName(String),

    #[error("invalid definition for job '{job}': {reason}")]
    InvalidDefinition { job: String, reason: String },

    #[error("duplicate trigger name: {0}")]
    DuplicateTriggerName(String),

    #[error("trigger '{trigger}' references unknown job '{job}'")]
    UnknownJobReference { trigger: String, job: String },

    #[error("workflow requires exactly one ON_DEMAND trigger, found {0}")]
    OnDemandTriggerCount(usize),

    #[error("ON_DEMAND trigger '{0}' must not carry a predicate")]
    OnDemandWithPredicate(String),

    #[error("conditional trigger '{0}' has an empty predicate")]
    EmptyPredicate(String),

    #[error("trigger '{0}' has no actions")]
    NoActions(String),

    #[error("cyclic dependency in trigger graph involving jobs: {0}")]
    CyclicDependency(String),
}

/// Failures while launching a job run. Concurrency rejections are deferred
/// and retried by the trigger engine; the rest are fatal to the instance.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("job '{job}' already has {limit} active run(s)")]
    ConcurrencyLimitExceeded { job: String, limit: u32 },

    #[error("job '{job}' is missing required argument '{key}'")]
    MissingRequiredArgument { job: String, key: String },

    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("job runner unavailable after {attempts} attempt(s): {reason}")]
    RunnerUnavailable { attempts: u32, reason: String },
}

impl DispatchError {
    /// Dispatch errors that only defer the launch rather than failing the
    /// instance.
    pub fn is_deferrable(&self) -> bool {
        matches!(self, DispatchError::ConcurrencyLimitExceeded { .. })
    }
}

/// Errors reported by a [`JobRunner`](crate::runner::JobRunner) when a
/// submission cannot be accepted.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("runner unavailable: {0}")]
    Unavailable(String),
}

/// Top-level error for the CLI surface.
#[derive(Debug, Error)]
pub enum BatchflowError {
    #[error("definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}
