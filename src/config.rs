//! Pipeline definition loaded from a TOML file.
//!
//! The graph topology is fixed at deployment time: an ordered list of job
//! definitions and trigger records, no dynamic mutation at runtime. Values
//! absent from the file use sensible defaults, and `document_pipeline()`
//! provides the built-in five-job document-processing graph.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::coordinator::Workflow;
use crate::error::{BatchflowError, DefinitionError};
use crate::job::{JobDefinition, RetryBackoff, RunState};
use crate::registry::JobDefinitionRegistry;
use crate::runner::JobRunner;
use crate::trigger::{Condition, Predicate, PredicateOperator, Trigger, TriggerKind};

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub workflow: WorkflowSection,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    /// Backoff schedule for runner submissions, not job retries.
    #[serde(default)]
    pub submit_backoff: Option<RetryBackoff>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSection {
    #[serde(default = "default_workflow_name")]
    pub name: String,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            name: default_workflow_name(),
        }
    }
}

fn default_workflow_name() -> String {
    "document-pipeline".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub name: String,
    /// Object-store key of the job script.
    pub script: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub resource_limit: Option<String>,
    #[serde(default)]
    pub arguments: HashMap<String, String>,
    #[serde(default)]
    pub required: Vec<String>,
}

// Default timeout: 30 minutes.
fn default_timeout_secs() -> u64 {
    1800
}

fn default_max_concurrent_runs() -> u32 {
    1
}

impl JobConfig {
    fn into_definition(self) -> JobDefinition {
        let mut def = JobDefinition::new(self.name, self.script)
            .with_max_concurrent_runs(self.max_concurrent_runs)
            .with_max_retries(self.max_retries)
            .with_timeout(Duration::from_secs(self.timeout_secs));
        if let Some(limit) = self.resource_limit {
            def = def.with_resource_limit(limit);
        }
        for (key, value) in self.arguments {
            def = def.with_argument(key, value);
        }
        for key in self.required {
            def = def.with_required(key);
        }
        def
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerConfig {
    pub name: String,
    pub kind: TriggerKind,
    #[serde(default = "default_operator")]
    pub operator: PredicateOperator,
    #[serde(default, rename = "when")]
    pub conditions: Vec<ConditionConfig>,
    pub actions: Vec<String>,
}

fn default_operator() -> PredicateOperator {
    PredicateOperator::And
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConditionConfig {
    pub job: String,
    #[serde(default = "default_required_state")]
    pub state: RunState,
}

fn default_required_state() -> RunState {
    RunState::Succeeded
}

impl TriggerConfig {
    fn into_trigger(self) -> Trigger {
        let conditions: Vec<Condition> = self
            .conditions
            .into_iter()
            .map(|c| Condition {
                job_name: c.job,
                required_state: c.state,
            })
            .collect();
        let predicate = match self.operator {
            PredicateOperator::And => Predicate::all(conditions),
            PredicateOperator::Or => Predicate::any(conditions),
        };
        match self.kind {
            TriggerKind::OnDemand if predicate.is_empty() => {
                Trigger::on_demand(self.name, self.actions)
            }
            // A predicate on an ON_DEMAND record is kept as-is so bootstrap
            // validation rejects it instead of silently dropping it.
            TriggerKind::OnDemand => Trigger {
                name: self.name,
                kind: TriggerKind::OnDemand,
                predicate,
                actions: self.actions,
            },
            TriggerKind::Conditional => Trigger::conditional(self.name, predicate, self.actions),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, BatchflowError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Split into the registry and trigger records; full graph validation
    /// happens in [`Workflow::new`].
    pub fn build(self) -> Result<(JobDefinitionRegistry, Vec<Trigger>), DefinitionError> {
        let registry = JobDefinitionRegistry::from_definitions(
            self.jobs.into_iter().map(JobConfig::into_definition),
        )?;
        let triggers = self
            .triggers
            .into_iter()
            .map(TriggerConfig::into_trigger)
            .collect();
        Ok((registry, triggers))
    }

    pub fn into_workflow(self, runner: Arc<dyn JobRunner>) -> Result<Workflow, DefinitionError> {
        let backoff = self.submit_backoff.clone();
        let (registry, triggers) = self.build()?;
        let mut workflow = Workflow::new(registry, triggers, runner)?;
        if let Some(backoff) = backoff {
            workflow = workflow.with_submit_backoff(backoff);
        }
        Ok(workflow)
    }

    /// The built-in graph: five document-processing jobs chained by four
    /// conditional edges plus the ON_DEMAND start trigger.
    pub fn document_pipeline() -> Self {
        let job = |name: &str, timeout_secs: u64| JobConfig {
            name: name.to_string(),
            script: format!("scripts/{name}.py"),
            timeout_secs,
            max_concurrent_runs: 1,
            // The source pipeline runs without automatic retries.
            max_retries: 0,
            resource_limit: None,
            arguments: HashMap::new(),
            required: vec!["batch_id".to_string()],
        };
        let edge = |name: &str, upstream: &str, action: &str| TriggerConfig {
            name: name.to_string(),
            kind: TriggerKind::Conditional,
            operator: PredicateOperator::And,
            conditions: vec![ConditionConfig {
                job: upstream.to_string(),
                state: RunState::Succeeded,
            }],
            actions: vec![action.to_string()],
        };

        let mut clean_html = job("clean_html", 1800);
        clean_html
            .arguments
            .insert("input_prefix".into(), "raw/html".into());
        clean_html
            .arguments
            .insert("output_prefix".into(), "clean/html".into());
        let mut extract_topics = job("extract_topics", 1800);
        extract_topics
            .arguments
            .insert("input_prefix".into(), "clean/html".into());
        let mut vectorize = job("vectorize_categories", 3600);
        vectorize.resource_limit = Some("highmem".into());
        let ingest = job("ingest_relational", 1800);
        let mut topic_model = job("topic_model", 3600);
        topic_model.arguments.insert("num_topics".into(), "40".into());

        Self {
            workflow: WorkflowSection::default(),
            jobs: vec![clean_html, extract_topics, vectorize, ingest, topic_model],
            triggers: vec![
                TriggerConfig {
                    name: "start_pipeline".into(),
                    kind: TriggerKind::OnDemand,
                    operator: PredicateOperator::And,
                    conditions: Vec::new(),
                    actions: vec!["clean_html".into()],
                },
                edge("after_clean", "clean_html", "extract_topics"),
                edge("after_topics", "extract_topics", "vectorize_categories"),
                edge("after_vectorize", "vectorize_categories", "ingest_relational"),
                edge("after_ingest", "ingest_relational", "topic_model"),
            ],
            submit_backoff: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::SimulatedRunner;
    use std::io::Write;

    #[test]
    fn document_pipeline_builds_a_valid_workflow() {
        let config = PipelineConfig::document_pipeline();
        assert_eq!(config.workflow.name, "document-pipeline");
        assert_eq!(config.jobs.len(), 5);
        assert_eq!(config.triggers.len(), 5);

        let runner = Arc::new(SimulatedRunner::new(Duration::from_millis(1)));
        let workflow = config.into_workflow(runner).unwrap();
        assert_eq!(workflow.registry().len(), 5);
        assert_eq!(workflow.triggers().on_demand().name, "start_pipeline");
    }

    #[test]
    fn parses_full_trigger_record() {
        let toml_str = r#"
            [workflow]
            name = "mandates"

            [[jobs]]
            name = "clean_html"
            script = "scripts/clean_html.py"
            timeout_secs = 900
            max_retries = 2
            required = ["batch_id"]

            [jobs.arguments]
            input_prefix = "raw/html"

            [[jobs]]
            name = "extract_topics"
            script = "scripts/extract_topics.py"

            [[triggers]]
            name = "start"
            kind = "on_demand"
            actions = ["clean_html"]

            [[triggers]]
            name = "after_clean"
            kind = "conditional"
            operator = "or"
            actions = ["extract_topics"]

            [[triggers.when]]
            job = "clean_html"

            [[triggers.when]]
            job = "clean_html"
            state = "timed_out"
        "#;
        let config: PipelineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.workflow.name, "mandates");

        let job = &config.jobs[0];
        assert_eq!(job.timeout_secs, 900);
        assert_eq!(job.max_retries, 2);
        assert_eq!(job.max_concurrent_runs, 1);
        assert_eq!(job.arguments["input_prefix"], "raw/html");

        let trigger = config.triggers[1].clone().into_trigger();
        assert_eq!(trigger.kind, TriggerKind::Conditional);
        assert_eq!(trigger.predicate.operator, PredicateOperator::Or);
        assert_eq!(trigger.predicate.conditions[0].required_state, RunState::Succeeded);
        assert_eq!(trigger.predicate.conditions[1].required_state, RunState::TimedOut);
    }

    #[test]
    fn partial_job_record_uses_defaults() {
        let toml_str = r#"
            [[jobs]]
            name = "clean_html"
            script = "a.py"
        "#;
        let config: PipelineConfig = toml::from_str(toml_str).unwrap();
        let def = config.jobs[0].clone().into_definition();
        assert_eq!(def.timeout, Duration::from_secs(1800));
        assert_eq!(def.max_concurrent_runs, 1);
        assert_eq!(def.max_retries, 0);
        assert!(def.required_arguments.is_empty());
    }

    #[test]
    fn submit_backoff_section_is_optional() {
        let toml_str = r#"
            [submit_backoff]
            max_attempts = 5
            base_delay_ms = 200
        "#;
        let config: PipelineConfig = toml::from_str(toml_str).unwrap();
        let backoff = config.submit_backoff.unwrap();
        assert_eq!(backoff.max_attempts, 5);
        assert_eq!(backoff.base_delay_ms, 200);

        let empty: PipelineConfig = toml::from_str("").unwrap();
        assert!(empty.submit_backoff.is_none());
    }

    #[test]
    fn load_reads_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [workflow]
            name = "from-disk"

            [[jobs]]
            name = "clean_html"
            script = "a.py"
            "#
        )
        .unwrap();

        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.workflow.name, "from-disk");
        assert_eq!(config.jobs.len(), 1);
    }

    #[test]
    fn load_missing_file_is_an_io_error() {
        let err = PipelineConfig::load(Path::new("/nonexistent/pipeline.toml")).unwrap_err();
        assert!(matches!(err, BatchflowError::Io(_)));
    }

    #[test]
    fn unknown_trigger_reference_fails_bootstrap() {
        let toml_str = r#"
            [[jobs]]
            name = "clean_html"
            script = "a.py"

            [[triggers]]
            name = "start"
            kind = "on_demand"
            actions = ["ghost"]
        "#;
        let config: PipelineConfig = toml::from_str(toml_str).unwrap();
        let runner = Arc::new(SimulatedRunner::new(Duration::from_millis(1)));
        let err = config.into_workflow(runner).unwrap_err();
        assert!(matches!(err, DefinitionError::UnknownJobReference { .. }));
    }
}
