//! Orchestration templates.
//!
//! A template is the authored form of a plan: named steps with dependencies,
//! operations, optional compensating operations and target roles. Templates
//! are YAML-loadable and validated before instantiation so a malformed
//! definition never reaches the scheduler.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::core::errors::{ConvoyError, Result};
use crate::task::{Operation, RunConfig, TaskPolicy};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationTemplate {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Step defaults layer of every instantiated task's variable context.
    #[serde(default)]
    pub defaults: HashMap<String, Value>,
    pub steps: Vec<StepTemplate>,
    #[serde(default)]
    pub config: Option<RunConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTemplate {
    pub id: String,
    /// Ids of steps that must finish before this one starts.
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub operation: Operation,
    /// Compensating operation, wired as the instantiated tasks' undo leaf.
    #[serde(default)]
    pub undo: Option<Operation>,
    /// Role names resolved against the host mapping; one task is created per
    /// (step, resolved host).
    pub targets: Vec<String>,
    #[serde(default)]
    pub policy: TaskPolicy,
    #[serde(default)]
    pub pre_hook: Option<String>,
    #[serde(default)]
    pub post_hook: Option<String>,
}

impl OrchestrationTemplate {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let template: Self = serde_yaml::from_str(yaml)?;
        template.validate()?;
        Ok(template)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    /// Definition-level checks: non-empty, unique step ids, dependencies that
    /// exist, at least one target role per step.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(ConvoyError::validation_field(
                "template has no steps",
                self.name.clone(),
            ));
        }

        let mut ids: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            if !ids.insert(&step.id) {
                return Err(ConvoyError::validation_field(
                    "duplicate step id",
                    step.id.clone(),
                ));
            }
            if step.targets.is_empty() {
                return Err(ConvoyError::validation_field(
                    "step has no target roles",
                    step.id.clone(),
                ));
            }
        }

        for step in &self.steps {
            for dep in &step.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(ConvoyError::validation_field(
                        "dependency refers to an unknown step",
                        format!("{}->{}", step.id, dep),
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = r#"
name: rollout
description: deploy and verify a service
defaults:
  service: billing
config:
  stop_on_error: true
  stop_undo_on_error: false
steps:
  - id: install
    targets: [workers]
    operation:
      name: install_package
      payload:
        package: "{{service}}"
    undo:
      name: remove_package
      payload:
        package: "{{service}}"
  - id: verify
    dependencies: [install]
    targets: [workers]
    operation:
      name: health_check
      payload:
        url: "http://localhost/health"
      expected:
        return_code: 0
"#;

    #[test]
    fn test_yaml_round_trip() {
        let template = OrchestrationTemplate::from_yaml_str(TEMPLATE).unwrap();
        assert_eq!(template.name, "rollout");
        assert_eq!(template.steps.len(), 2);
        assert_eq!(template.steps[1].dependencies, vec!["install"]);
        assert!(template.steps[0].undo.is_some());
        let config = template.config.unwrap();
        assert!(config.stop_on_error);
        assert_eq!(config.stop_undo_on_error, Some(false));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let bad = TEMPLATE.replace("dependencies: [install]", "dependencies: [missing]");
        assert!(OrchestrationTemplate::from_yaml_str(&bad).is_err());
    }

    #[test]
    fn test_duplicate_step_id_rejected() {
        let bad = TEMPLATE.replace("id: verify", "id: install");
        assert!(OrchestrationTemplate::from_yaml_str(&bad).is_err());
    }

    #[test]
    fn test_step_without_targets_rejected() {
        let bad = TEMPLATE.replace("targets: [workers]\n    operation:\n      name: health_check", "targets: []\n    operation:\n      name: health_check");
        assert!(OrchestrationTemplate::from_yaml_str(&bad).is_err());
    }
}
