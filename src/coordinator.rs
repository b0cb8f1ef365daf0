//! Workflow coordination: owns the instance lifecycle, aggregates trigger
//! firings, and recomputes instance state after every completion event.
//!
//! One [`Workflow`] is built per deployed pipeline and validated once; each
//! `start()` call creates an independent [`WorkflowInstance`]. Handling of a
//! completion event (terminal report, trigger evaluation, dispatches, state
//! recomputation) happens under the instance's single evaluation lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::DefinitionError;
use crate::instance::{DeferredDispatch, InstanceState, WorkflowInstance, WorkflowState};
use crate::job::JobCompletionEvent;
use crate::registry::JobDefinitionRegistry;
use crate::runner::{CompletionReport, JobRunner};
use crate::tracker::RunTracker;
use crate::trigger::{Trigger, TriggerSet};

pub struct Workflow {
    tracker: RunTracker,
    triggers: TriggerSet,
    sweep_interval: Duration,
    channel_capacity: usize,
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("triggers", &self.triggers)
            .field("sweep_interval", &self.sweep_interval)
            .field("channel_capacity", &self.channel_capacity)
            .finish_non_exhaustive()
    }
}

impl Workflow {
    /// Validate the full definition once at bootstrap: job limits, trigger
    /// references, exactly one ON_DEMAND entry point, and an acyclic trigger
    /// graph. A workflow that constructs successfully never raises a
    /// [`DefinitionError`] at runtime.
    pub fn new(
        registry: JobDefinitionRegistry,
        triggers: Vec<Trigger>,
        runner: Arc<dyn JobRunner>,
    ) -> Result<Self, DefinitionError> {
        let registry = Arc::new(registry);
        let triggers = TriggerSet::new(triggers, &registry)?;
        Ok(Self {
            tracker: RunTracker::new(registry, runner),
            triggers,
            sweep_interval: Duration::from_secs(5),
            channel_capacity: 64,
        })
    }

    pub fn with_submit_backoff(mut self, backoff: crate::job::RetryBackoff) -> Self {
        self.tracker = self.tracker.with_submit_backoff(backoff);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn registry(&self) -> &JobDefinitionRegistry {
        self.tracker.registry()
    }

    pub fn triggers(&self) -> &TriggerSet {
        &self.triggers
    }

    /// Create a new instance and fire the ON_DEMAND trigger. Dispatch
    /// problems at start (missing argument, runner down) mark the instance
    /// FAILED rather than erroring out, so the run history stays
    /// inspectable through `snapshot()` either way.
    pub async fn start(&self, overrides: HashMap<String, String>) -> Arc<WorkflowInstance> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let mut state = InstanceState::new(Uuid::new_v4(), overrides, tx);
        state.state = WorkflowState::Running;

        let on_demand = self.triggers.on_demand();
        state.fired.insert(on_demand.name.clone());
        info!(
            instance = %state.instance_id,
            trigger = %on_demand.name,
            "workflow started"
        );
        self.fire_actions(&mut state, &on_demand.name, &on_demand.actions)
            .await;
        self.recompute(&mut state);

        Arc::new(WorkflowInstance::new(state, rx))
    }

    /// Handle one completion report from the runner. Late reports for an
    /// aborted instance are ignored entirely.
    pub async fn on_report(&self, instance: &WorkflowInstance, report: CompletionReport) {
        let mut state = instance.inner.lock().await;
        if state.aborted {
            debug!(
                instance = %state.instance_id,
                run_id = %report.run_id,
                "report ignored after abort"
            );
            return;
        }

        let event = self.tracker.report_terminal(&mut state, report).await;
        if state.state.is_terminal() {
            // History stays accurate, but a finished instance fires nothing.
            return;
        }
        match event {
            Some(event) => self.evaluate(&mut state, &event).await,
            // Duplicate report or failure absorbed by a retry; deferred
            // dispatches still get their evaluation tick.
            None => self.retry_deferred(&mut state).await,
        }
        self.recompute(&mut state);
    }

    /// Periodic timeout sweep. Takes the same instance lock as report
    /// handling, so it cannot race a late runner callback.
    pub async fn observe_timeouts(&self, instance: &WorkflowInstance, now: DateTime<Utc>) {
        let mut state = instance.inner.lock().await;
        if state.aborted || state.state.is_terminal() {
            return;
        }
        let events = self.tracker.observe_timeouts(&mut state, now).await;
        for event in &events {
            if state.state.is_terminal() {
                break;
            }
            self.evaluate(&mut state, event).await;
        }
        if !events.is_empty() {
            self.recompute(&mut state);
        }
    }

    /// Abort the instance: mark it FAILED, mark live runs STOPPED, send the
    /// runner a best-effort stop for each, and drop any deferred dispatch.
    /// Fired flags stay set, so no trigger can fire afterwards.
    pub async fn abort(&self, instance: &WorkflowInstance) {
        let mut state = instance.inner.lock().await;
        if state.aborted || state.state.is_terminal() {
            return;
        }
        state.aborted = true;
        state.deferred.clear();

        let now = Utc::now();
        let mut handles = Vec::new();
        for run in &mut state.runs {
            if !run.state.is_terminal() {
                run.state = crate::job::RunState::Stopped;
                run.ended_at = Some(now);
                if let Some(handle) = run.handle.clone() {
                    handles.push(handle);
                }
            }
        }
        state.fail("aborted by operator");
        warn!(instance = %state.instance_id, stopped_runs = handles.len(), "workflow aborted");
        drop(state);

        for handle in &handles {
            self.tracker.runner().stop(handle).await;
        }
    }

    /// Drain the instance's report channel until the instance is terminal,
    /// running the timeout sweep in between. One consumer per instance.
    pub async fn drive(&self, instance: &WorkflowInstance) -> WorkflowState {
        let mut reports = instance.reports.lock().await;
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if instance.state().await.is_terminal() {
                break;
            }
            tokio::select! {
                maybe = reports.recv() => match maybe {
                    Some(report) => self.on_report(instance, report).await,
                    None => break,
                },
                _ = sweep.tick() => self.observe_timeouts(instance, Utc::now()).await,
            }
        }
        instance.state().await
    }

    /// Re-evaluate every armed conditional trigger whose predicate
    /// references the completed job, against the latest state of all jobs it
    /// references. The fired flag is set before the actions dispatch, under
    /// the instance lock, so a trigger fires at most once per instance even
    /// when completion events race or replay.
    async fn evaluate(&self, state: &mut InstanceState, event: &JobCompletionEvent) {
        self.retry_deferred(state).await;
        if state.state.is_terminal() {
            return;
        }

        for &idx in self.triggers.referencing(&event.job_name) {
            let trigger = self.triggers.get(idx);
            if state.fired.contains(&trigger.name) {
                continue;
            }
            if !trigger.predicate.evaluate(&state.latest_states()) {
                continue;
            }
            state.fired.insert(trigger.name.clone());
            info!(
                instance = %state.instance_id,
                trigger = %trigger.name,
                completed_job = %event.job_name,
                completed_run = %event.run_id,
                "trigger fired"
            );
            self.fire_actions(state, &trigger.name, &trigger.actions).await;
            if state.state.is_terminal() {
                return;
            }
        }
    }

    async fn fire_actions(&self, state: &mut InstanceState, trigger_name: &str, actions: &[String]) {
        for job in actions {
            if state.state.is_terminal() {
                return;
            }
            match self.tracker.dispatch(state, job).await {
                Ok(_) => {}
                Err(err) if err.is_deferrable() => {
                    warn!(
                        instance = %state.instance_id,
                        trigger = trigger_name,
                        job = %job,
                        error = %err,
                        "dispatch deferred to next evaluation tick"
                    );
                    state.deferred.push(DeferredDispatch {
                        trigger_name: trigger_name.to_string(),
                        job_name: job.clone(),
                    });
                }
                Err(err) => {
                    error!(
                        instance = %state.instance_id,
                        trigger = trigger_name,
                        job = %job,
                        error = %err,
                        "dispatch failed, failing instance"
                    );
                    state.fail(format!("job '{job}' could not be dispatched: {err}"));
                }
            }
        }
    }

    async fn retry_deferred(&self, state: &mut InstanceState) {
        if state.deferred.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut state.deferred);
        for item in pending {
            if state.state.is_terminal() {
                return;
            }
            match self.tracker.dispatch(state, &item.job_name).await {
                Ok(_) => {
                    info!(
                        instance = %state.instance_id,
                        trigger = %item.trigger_name,
                        job = %item.job_name,
                        "deferred dispatch launched"
                    );
                }
                Err(err) if err.is_deferrable() => state.deferred.push(item),
                Err(err) => {
                    state.fail(format!(
                        "job '{}' could not be dispatched: {err}",
                        item.job_name
                    ));
                }
            }
        }
    }

    /// Recompute the instance state: FAILED the moment a job has terminally
    /// failed with no armed trigger left satisfiable; COMPLETED once nothing
    /// runs, nothing is deferred, and no armed trigger could still fire.
    fn recompute(&self, state: &mut InstanceState) {
        if state.state.is_terminal() {
            return;
        }
        let states = state.latest_states();
        let satisfiable = self.triggers.satisfiable_armed(&states, &state.fired);
        let active = state.has_active_runs() || !state.deferred.is_empty();
        let failed = states.values().any(|s| s.is_failure());

        let next = if failed && satisfiable.is_empty() {
            WorkflowState::Failed
        } else if !active && satisfiable.is_empty() {
            WorkflowState::Completed
        } else {
            WorkflowState::Running
        };

        if next != state.state {
            info!(
                instance = %state.instance_id,
                from = %state.state,
                to = %next,
                "workflow state changed"
            );
            if next == WorkflowState::Failed && state.failure.is_none() {
                if let Some(run) = state.runs.iter().rev().find(|r| r.state.is_failure()) {
                    let detail = run
                        .last_error
                        .clone()
                        .unwrap_or_else(|| run.state.to_string());
                    state.failure = Some(format!(
                        "job '{}' ended {} on attempt {}: {}",
                        run.job_name, run.state, run.attempt, detail
                    ));
                }
            }
            state.state = next;
        }
    }
}
