//! Job run tracking: dispatch, terminal reports, retries, timeout sweep.
//!
//! All methods take the already-locked [`InstanceState`], so every mutation
//! for an instance flows through its single evaluation lock. Runner
//! submissions are fire-and-forget; `RunnerUnavailable` rejections are
//! retried here with exponential backoff, a budget separate from any job's
//! own `max_retries`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::args;
use crate::error::DispatchError;
use crate::instance::InstanceState;
use crate::job::{JobCompletionEvent, JobDefinition, JobRun, RetryBackoff, RunState};
use crate::registry::JobDefinitionRegistry;
use crate::runner::{CompletionReport, JobRunner, JobSubmission};

pub struct RunTracker {
    registry: Arc<JobDefinitionRegistry>,
    runner: Arc<dyn JobRunner>,
    submit_backoff: RetryBackoff,
}

impl RunTracker {
    pub fn new(registry: Arc<JobDefinitionRegistry>, runner: Arc<dyn JobRunner>) -> Self {
        Self {
            registry,
            runner,
            submit_backoff: RetryBackoff::default(),
        }
    }

    pub fn with_submit_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.submit_backoff = backoff;
        self
    }

    pub fn registry(&self) -> &JobDefinitionRegistry {
        &self.registry
    }

    pub fn runner(&self) -> &Arc<dyn JobRunner> {
        &self.runner
    }

    /// Launch the first attempt of a job, rejecting the dispatch if it would
    /// exceed the job's concurrency limit. The caller (trigger engine)
    /// defers rejected dispatches to the next evaluation tick.
    pub async fn dispatch(
        &self,
        state: &mut InstanceState,
        job_name: &str,
    ) -> Result<Uuid, DispatchError> {
        let def = self
            .registry
            .lookup(job_name)
            .ok_or_else(|| DispatchError::UnknownJob(job_name.to_string()))?;
        if state.active_runs(job_name) >= def.max_concurrent_runs {
            return Err(DispatchError::ConcurrencyLimitExceeded {
                job: def.name.clone(),
                limit: def.max_concurrent_runs,
            });
        }
        self.launch(state, def, 1).await
    }

    async fn launch(
        &self,
        state: &mut InstanceState,
        def: &JobDefinition,
        attempt: u32,
    ) -> Result<Uuid, DispatchError> {
        let arguments = args::resolve(def, &state.runtime_overrides)?;
        let mut run = JobRun::new(&def.name, arguments.clone(), attempt);
        let submission = JobSubmission {
            run_id: run.run_id,
            job_name: def.name.clone(),
            executable_ref: def.executable_ref.clone(),
            arguments,
            resource_limit: def.resource_limit.clone(),
            timeout: def.timeout,
            report: state.report_tx.clone(),
        };

        let mut submit_attempt = 1u32;
        let handle = loop {
            match self.runner.submit(submission.clone()).await {
                Ok(handle) => break handle,
                Err(err) if submit_attempt < self.submit_backoff.max_attempts => {
                    let delay = self.submit_backoff.delay_for_attempt(submit_attempt);
                    warn!(
                        instance = %state.instance_id,
                        job = %def.name,
                        submit_attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "runner unavailable, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    submit_attempt += 1;
                }
                Err(err) => {
                    return Err(DispatchError::RunnerUnavailable {
                        attempts: submit_attempt,
                        reason: err.to_string(),
                    });
                }
            }
        };

        run.state = RunState::Running;
        run.started_at = Utc::now();
        run.handle = Some(handle);
        info!(
            instance = %state.instance_id,
            job = %def.name,
            run_id = %run.run_id,
            attempt,
            "job dispatched"
        );
        let run_id = run.run_id;
        state.runs.push(run);
        Ok(run_id)
    }

    /// Apply a terminal report. Idempotent: a second report for an
    /// already-terminal run is a no-op (duplicate runner callbacks happen).
    ///
    /// Returns the completion event the trigger engine must consume, or
    /// `None` when the report was a duplicate or the failure was absorbed by
    /// an automatic redispatch.
    pub async fn report_terminal(
        &self,
        state: &mut InstanceState,
        report: CompletionReport,
    ) -> Option<JobCompletionEvent> {
        if !report.state.is_terminal() {
            warn!(run_id = %report.run_id, state = %report.state, "ignoring non-terminal report");
            return None;
        }
        let Some(run) = state.run_mut(report.run_id) else {
            warn!(run_id = %report.run_id, "report for unknown run");
            return None;
        };
        if run.state.is_terminal() {
            debug!(run_id = %report.run_id, "duplicate terminal report ignored");
            return None;
        }

        run.state = report.state;
        run.ended_at = Some(report.finished_at);
        if report.error.is_some() {
            run.last_error = report.error.clone();
        }
        let job_name = run.job_name.clone();
        let attempt = run.attempt;
        info!(
            instance = %state.instance_id,
            job = %job_name,
            run_id = %report.run_id,
            state = %report.state,
            attempt,
            "job run finished"
        );

        let event = JobCompletionEvent {
            job_name: job_name.clone(),
            run_id: report.run_id,
            state: report.state,
        };

        if !matches!(report.state, RunState::Failed | RunState::TimedOut) {
            return Some(event);
        }

        let Some(def) = self.registry.lookup(&job_name) else {
            warn!(job = %job_name, "no definition for finished run");
            return Some(event);
        };
        if attempt > def.max_retries {
            return Some(event);
        }

        info!(
            instance = %state.instance_id,
            job = %job_name,
            attempt = attempt + 1,
            max_retries = def.max_retries,
            "redispatching failed run"
        );
        match self.launch(state, def, attempt + 1).await {
            // The retry absorbs the failure; no completion event yet.
            Ok(_) => None,
            Err(err) => {
                warn!(job = %job_name, error = %err, "redispatch failed, propagating failure");
                if let Some(run) = state.run_mut(report.run_id) {
                    run.last_error = Some(format!("redispatch failed: {err}"));
                }
                Some(event)
            }
        }
    }

    /// Periodic sweep: any RUNNING run past its definition's timeout is
    /// marked TIMED_OUT and fed through the same completion path a natural
    /// failure would take.
    pub async fn observe_timeouts(
        &self,
        state: &mut InstanceState,
        now: DateTime<Utc>,
    ) -> Vec<JobCompletionEvent> {
        let expired: Vec<Uuid> = state
            .runs
            .iter()
            .filter(|run| run.state == RunState::Running)
            .filter(|run| {
                self.registry.lookup(&run.job_name).is_some_and(|def| {
                    now.signed_duration_since(run.started_at)
                        .to_std()
                        .map(|elapsed| elapsed >= def.timeout)
                        .unwrap_or(false)
                })
            })
            .map(|run| run.run_id)
            .collect();

        let mut events = Vec::new();
        for run_id in expired {
            let report = CompletionReport {
                run_id,
                state: RunState::TimedOut,
                finished_at: now,
                error: Some("run exceeded its timeout".into()),
            };
            if let Some(event) = self.report_terminal(state, report).await {
                events.push(event);
            }
        }
        events
    }
}
