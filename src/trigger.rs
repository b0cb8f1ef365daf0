//! Triggers and predicates over job states.
//!
//! A trigger fires when its predicate over the latest recorded job states is
//! satisfied, dispatching every job in its action list. The full trigger set
//! is validated once at bootstrap: references must resolve, exactly one
//! ON_DEMAND trigger starts the graph, and the condition-job → action-job
//! edge relation must be acyclic.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::DefinitionError;
use crate::job::RunState;
use crate::registry::JobDefinitionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    OnDemand,
    Conditional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateOperator {
    And,
    Or,
}

/// One `(job, required state)` condition within a predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub job_name: String,
    pub required_state: RunState,
}

impl Condition {
    pub fn succeeded(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            required_state: RunState::Succeeded,
        }
    }

    fn is_met(&self, states: &HashMap<String, RunState>) -> bool {
        states.get(&self.job_name) == Some(&self.required_state)
    }
}

/// AND/OR combination of conditions. Empty only for ON_DEMAND triggers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predicate {
    pub operator: PredicateOperator,
    pub conditions: Vec<Condition>,
}

impl Predicate {
    pub fn empty() -> Self {
        Self {
            operator: PredicateOperator::And,
            conditions: Vec::new(),
        }
    }

    pub fn all(conditions: Vec<Condition>) -> Self {
        Self {
            operator: PredicateOperator::And,
            conditions,
        }
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Self {
            operator: PredicateOperator::Or,
            conditions,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Evaluate against the latest recorded state of every referenced job.
    /// AND requires all conditions met, possibly across completion events
    /// that arrived at different times; OR requires any one.
    pub fn evaluate(&self, states: &HashMap<String, RunState>) -> bool {
        match self.operator {
            PredicateOperator::And => self.conditions.iter().all(|c| c.is_met(states)),
            PredicateOperator::Or => self.conditions.iter().any(|c| c.is_met(states)),
        }
    }

    /// Whether the predicate could still become satisfied, given the latest
    /// states and the set of jobs that some still-armed trigger can dispatch.
    fn is_open(&self, states: &HashMap<String, RunState>, dispatchable: &HashSet<&str>) -> bool {
        let condition_open = |c: &Condition| {
            c.is_met(states)
                || dispatchable.contains(c.job_name.as_str())
                || matches!(
                    states.get(&c.job_name),
                    Some(RunState::Pending | RunState::Running)
                )
        };
        match self.operator {
            PredicateOperator::And => self.conditions.iter().all(condition_open),
            PredicateOperator::Or => self.conditions.iter().any(condition_open),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub name: String,
    pub kind: TriggerKind,
    pub predicate: Predicate,
    pub actions: Vec<String>,
}

impl Trigger {
    pub fn on_demand(name: impl Into<String>, actions: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind: TriggerKind::OnDemand,
            predicate: Predicate::empty(),
            actions,
        }
    }

    pub fn conditional(name: impl Into<String>, predicate: Predicate, actions: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind: TriggerKind::Conditional,
            predicate,
            actions,
        }
    }

    /// Convenience for the common linear edge: fire `action` once `upstream`
    /// has succeeded.
    pub fn after_success(
        name: impl Into<String>,
        upstream: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self::conditional(
            name,
            Predicate::all(vec![Condition::succeeded(upstream)]),
            vec![action.into()],
        )
    }
}

/// The validated, immutable trigger graph plus the `job → triggers`
/// subscription index the engine consults on every completion event.
#[derive(Debug)]
pub struct TriggerSet {
    triggers: Vec<Trigger>,
    /// Indices of conditional triggers whose predicate references a job.
    by_job: HashMap<String, Vec<usize>>,
    on_demand: usize,
}

impl TriggerSet {
    pub fn new(
        triggers: Vec<Trigger>,
        registry: &JobDefinitionRegistry,
    ) -> Result<Self, DefinitionError> {
        let mut names = HashSet::new();
        let mut on_demand_indices = Vec::new();

        for (idx, trigger) in triggers.iter().enumerate() {
            if !names.insert(trigger.name.as_str()) {
                return Err(DefinitionError::DuplicateTriggerName(trigger.name.clone()));
            }
            if trigger.actions.is_empty() {
                return Err(DefinitionError::NoActions(trigger.name.clone()));
            }
            for job in &trigger.actions {
                if !registry.contains(job) {
                    return Err(DefinitionError::UnknownJobReference {
                        trigger: trigger.name.clone(),
                        job: job.clone(),
                    });
                }
            }
            match trigger.kind {
                TriggerKind::OnDemand => {
                    if !trigger.predicate.is_empty() {
                        return Err(DefinitionError::OnDemandWithPredicate(trigger.name.clone()));
                    }
                    on_demand_indices.push(idx);
                }
                TriggerKind::Conditional => {
                    if trigger.predicate.is_empty() {
                        return Err(DefinitionError::EmptyPredicate(trigger.name.clone()));
                    }
                    for condition in &trigger.predicate.conditions {
                        if !registry.contains(&condition.job_name) {
                            return Err(DefinitionError::UnknownJobReference {
                                trigger: trigger.name.clone(),
                                job: condition.job_name.clone(),
                            });
                        }
                    }
                }
            }
        }

        if on_demand_indices.len() != 1 {
            return Err(DefinitionError::OnDemandTriggerCount(on_demand_indices.len()));
        }

        detect_cycle(&triggers, registry)?;

        let mut by_job: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, trigger) in triggers.iter().enumerate() {
            if trigger.kind != TriggerKind::Conditional {
                continue;
            }
            for condition in &trigger.predicate.conditions {
                let subscribers = by_job.entry(condition.job_name.clone()).or_default();
                if !subscribers.contains(&idx) {
                    subscribers.push(idx);
                }
            }
        }

        Ok(Self {
            triggers,
            by_job,
            on_demand: on_demand_indices[0],
        })
    }

    pub fn on_demand(&self) -> &Trigger {
        &self.triggers[self.on_demand]
    }

    pub fn get(&self, idx: usize) -> &Trigger {
        &self.triggers[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Trigger> {
        self.triggers.iter()
    }

    /// Conditional triggers whose predicate references `job_name`.
    pub fn referencing(&self, job_name: &str) -> &[usize] {
        self.by_job.get(job_name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Armed triggers that could still fire, computed as a fixpoint: a
    /// condition is open if it is met, its job is still in flight, or its job
    /// is an action of another trigger that itself could still fire.
    pub fn satisfiable_armed(
        &self,
        states: &HashMap<String, RunState>,
        fired: &HashSet<String>,
    ) -> Vec<usize> {
        let mut candidates: Vec<usize> = self
            .triggers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.kind == TriggerKind::Conditional && !fired.contains(&t.name))
            .map(|(idx, _)| idx)
            .collect();

        loop {
            let dispatchable: HashSet<&str> = candidates
                .iter()
                .flat_map(|&idx| self.triggers[idx].actions.iter().map(String::as_str))
                .collect();
            let retained: Vec<usize> = candidates
                .iter()
                .copied()
                .filter(|&idx| self.triggers[idx].predicate.is_open(states, &dispatchable))
                .collect();
            if retained.len() == candidates.len() {
                return retained;
            }
            candidates = retained;
        }
    }
}

/// Kahn's algorithm over the job-level edge relation condition-job →
/// action-job. Jobs left unprocessed sit on a cycle.
fn detect_cycle(
    triggers: &[Trigger],
    registry: &JobDefinitionRegistry,
) -> Result<(), DefinitionError> {
    let mut dependents: HashMap<&str, HashSet<&str>> = HashMap::new();
    let mut indegree: HashMap<&str, usize> = registry.names().map(|n| (n, 0)).collect();

    for trigger in triggers {
        for condition in &trigger.predicate.conditions {
            for action in &trigger.actions {
                let inserted = dependents
                    .entry(condition.job_name.as_str())
                    .or_default()
                    .insert(action.as_str());
                if inserted {
                    *indegree.entry(action.as_str()).or_insert(0) += 1;
                }
            }
        }
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|&(_, &deg)| deg == 0)
        .map(|(&job, _)| job)
        .collect();
    let mut processed = 0usize;

    while let Some(job) = queue.pop_front() {
        processed += 1;
        if let Some(actions) = dependents.get(job) {
            for &action in actions {
                if let Some(deg) = indegree.get_mut(action) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(action);
                    }
                }
            }
        }
    }

    if processed == indegree.len() {
        return Ok(());
    }

    let mut remaining: Vec<&str> = indegree
        .iter()
        .filter(|&(_, &deg)| deg > 0)
        .map(|(&job, _)| job)
        .collect();
    remaining.sort_unstable();
    Err(DefinitionError::CyclicDependency(remaining.join(", ")))
}
