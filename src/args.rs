//! Argument templating: merges a job's default arguments with per-instance
//! runtime overrides before dispatch.
//!
//! Overrides win key-by-key. Both maps are shallow string→string; there is no
//! recursive templating.

use std::collections::HashMap;

use crate::error::DispatchError;
use crate::job::JobDefinition;

pub fn resolve(
    def: &JobDefinition,
    overrides: &HashMap<String, String>,
) -> Result<HashMap<String, String>, DispatchError> {
    let mut merged = def.default_arguments.clone();
    merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

    for key in &def.required_arguments {
        if !merged.contains_key(key) {
            return Err(DispatchError::MissingRequiredArgument {
                job: def.name.clone(),
                key: key.clone(),
            });
        }
    }

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn overrides_win_key_by_key() {
        let def = JobDefinition::new("clean_html", "a.py")
            .with_argument("input_prefix", "raw/html")
            .with_argument("strict", "false");

        let resolved = resolve(&def, &overrides(&[("strict", "true"), ("batch_id", "b-7")])).unwrap();
        assert_eq!(resolved["input_prefix"], "raw/html");
        assert_eq!(resolved["strict"], "true");
        assert_eq!(resolved["batch_id"], "b-7");
    }

    #[test]
    fn missing_required_key_is_rejected() {
        let def = JobDefinition::new("clean_html", "a.py").with_required("batch_id");
        let err = resolve(&def, &HashMap::new()).unwrap_err();
        assert!(
            matches!(err, DispatchError::MissingRequiredArgument { job, key }
                if job == "clean_html" && key == "batch_id")
        );
    }

    #[test]
    fn required_key_satisfied_by_default() {
        let def = JobDefinition::new("clean_html", "a.py")
            .with_argument("batch_id", "default-batch")
            .with_required("batch_id");
        let resolved = resolve(&def, &HashMap::new()).unwrap();
        assert_eq!(resolved["batch_id"], "default-batch");
    }

    #[test]
    fn required_key_satisfied_by_override() {
        let def = JobDefinition::new("clean_html", "a.py").with_required("batch_id");
        let resolved = resolve(&def, &overrides(&[("batch_id", "b-9")])).unwrap();
        assert_eq!(resolved["batch_id"], "b-9");
    }
}
