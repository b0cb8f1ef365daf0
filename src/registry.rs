//! Static catalog of job definitions.
//!
//! Registration is a one-time bootstrap step; after that the registry is
//! read-only and shared across instances without a lock.

use std::collections::HashMap;

use crate::error::DefinitionError;
use crate::job::JobDefinition;

#[derive(Debug, Default)]
pub struct JobDefinitionRegistry {
    jobs: HashMap<String, JobDefinition>,
}

impl JobDefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from an ordered list of definitions, failing on the
    /// first invalid or duplicate entry.
    pub fn from_definitions(
        defs: impl IntoIterator<Item = JobDefinition>,
    ) -> Result<Self, DefinitionError> {
        let mut registry = Self::new();
        for def in defs {
            registry.register(def)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, def: JobDefinition) -> Result<(), DefinitionError> {
        if def.name.trim().is_empty() {
            return Err(DefinitionError::InvalidDefinition {
                job: def.name,
                reason: "name must not be empty".into(),
            });
        }
        if def.max_concurrent_runs < 1 {
            return Err(DefinitionError::InvalidDefinition {
                job: def.name,
                reason: "max_concurrent_runs must be >= 1".into(),
            });
        }
        if def.timeout.is_zero() {
            return Err(DefinitionError::InvalidDefinition {
                job: def.name,
                reason: "timeout must be > 0".into(),
            });
        }
        if self.jobs.contains_key(&def.name) {
            return Err(DefinitionError::DuplicateJobName(def.name));
        }
        self.jobs.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&JobDefinition> {
        self.jobs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn register_and_lookup() {
        let mut registry = JobDefinitionRegistry::new();
        registry
            .register(JobDefinition::new("clean_html", "scripts/clean_html.py"))
            .unwrap();

        let def = registry.lookup("clean_html").unwrap();
        assert_eq!(def.executable_ref, "scripts/clean_html.py");
        assert!(registry.lookup("missing").is_none());
    }

    #[test]
    fn rejects_duplicate_name() {
        let mut registry = JobDefinitionRegistry::new();
        registry
            .register(JobDefinition::new("clean_html", "a.py"))
            .unwrap();
        let err = registry
            .register(JobDefinition::new("clean_html", "b.py"))
            .unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateJobName(name) if name == "clean_html"));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let mut registry = JobDefinitionRegistry::new();
        let def = JobDefinition::new("clean_html", "a.py").with_max_concurrent_runs(0);
        let err = registry.register(def).unwrap_err();
        assert!(matches!(err, DefinitionError::InvalidDefinition { .. }));
    }

    #[test]
    fn rejects_zero_timeout() {
        let mut registry = JobDefinitionRegistry::new();
        let def = JobDefinition::new("clean_html", "a.py").with_timeout(Duration::ZERO);
        let err = registry.register(def).unwrap_err();
        assert!(matches!(err, DefinitionError::InvalidDefinition { .. }));
    }

    #[test]
    fn rejects_empty_name() {
        let mut registry = JobDefinitionRegistry::new();
        let err = registry.register(JobDefinition::new("  ", "a.py")).unwrap_err();
        assert!(matches!(err, DefinitionError::InvalidDefinition { .. }));
    }

    #[test]
    fn from_definitions_builds_catalog() {
        let registry = JobDefinitionRegistry::from_definitions([
            JobDefinition::new("clean_html", "a.py"),
            JobDefinition::new("extract_topics", "b.py"),
        ])
        .unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("extract_topics"));
    }
}
