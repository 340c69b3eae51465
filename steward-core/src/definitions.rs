//! YAML definitions file: workflows and tasks registered at startup.
//!
//! ```yaml
//! workflows:
//!   - name: morning_digest
//!     steps:
//!       - type: command
//!         command: fetch_mail
//! tasks:
//!   - name: digest
//!     schedule: "0 7 * * *"
//!     action:
//!       type: workflow
//!       workflow_id: morning_digest
//! ```

use crate::scheduler::{SchedulerError, TaskAction, TaskConfig};
use crate::workflow::{WorkflowDefinition, WorkflowError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use steward_common::Validate;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DefinitionsError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid definitions YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Duplicate workflow name: {0}")]
    DuplicateWorkflow(String),

    #[error("Task '{task}' refers to unknown workflow '{workflow}'")]
    UnknownWorkflow { task: String, workflow: String },

    #[error("Workflow '{name}' rejected: {source}")]
    Workflow {
        name: String,
        #[source]
        source: WorkflowError,
    },

    #[error("Task '{name}' rejected: {source}")]
    Task {
        name: String,
        #[source]
        source: SchedulerError,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Definitions {
    #[serde(default)]
    pub workflows: Vec<WorkflowDefinition>,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

impl Definitions {
    pub fn from_yaml(source: &str) -> Result<Self, DefinitionsError> {
        Ok(serde_yaml::from_str(source)?)
    }

    pub fn load(path: &Path) -> Result<Self, DefinitionsError> {
        let content = std::fs::read_to_string(path).map_err(|source| DefinitionsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Check every entry so that registration cannot fail partway through.
    pub fn check(&self, known: &HashSet<String>) -> Result<(), DefinitionsError> {
        for workflow in &self.workflows {
            workflow.validate().map_err(|e| DefinitionsError::Workflow {
                name: workflow.name.clone(),
                source: e.into(),
            })?;
        }
        for task in &self.tasks {
            task.check().map_err(|source| DefinitionsError::Task {
                name: task.name.clone(),
                source,
            })?;
        }
        self.check_references(known)
    }

    /// Check workflow names are unique and every workflow task names either
    /// a workflow in this file or one in `known`.
    pub fn check_references(&self, known: &HashSet<String>) -> Result<(), DefinitionsError> {
        let mut names = HashSet::new();
        for workflow in &self.workflows {
            if !names.insert(workflow.name.as_str()) {
                return Err(DefinitionsError::DuplicateWorkflow(workflow.name.clone()));
            }
        }

        for task in &self.tasks {
            if let TaskAction::Workflow { workflow_id, .. } = &task.action {
                if !names.contains(workflow_id.as_str()) && !known.contains(workflow_id) {
                    return Err(DefinitionsError::UnknownWorkflow {
                        task: task.name.clone(),
                        workflow: workflow_id.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Ids assigned while registering a definitions file.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadedDefinitions {
    pub workflows: Vec<String>,
    pub tasks: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::StepKind;

    const SAMPLE: &str = r#"
workflows:
  - name: morning_digest
    auto_recover: true
    steps:
      - type: command
        command: fetch_mail
        output_variable: mail
      - type: condition
        predicate: "$mail.count > 0"
        on_true:
          type: function
          function: summarize
tasks:
  - name: digest
    schedule: "0 7 * * *"
    intelligent: true
    action:
      type: workflow
      workflow_id: morning_digest
  - name: heartbeat
    trigger: now
    action:
      type: command
      command: ping
"#;

    #[test]
    fn test_parse_sample() {
        let defs = Definitions::from_yaml(SAMPLE).unwrap();
        assert_eq!(defs.workflows.len(), 1);
        assert_eq!(defs.tasks.len(), 2);
        assert!(defs.workflows[0].auto_recover);
        assert!(matches!(defs.workflows[0].steps[1].kind, StepKind::Condition { .. }));
        assert!(defs.check_references(&HashSet::new()).is_ok());
    }

    #[test]
    fn test_empty_document() {
        let defs = Definitions::from_yaml("{}").unwrap();
        assert!(defs.workflows.is_empty());
        assert!(defs.tasks.is_empty());
    }

    #[test]
    fn test_unknown_workflow_reference() {
        let yaml = r#"
tasks:
  - name: orphan
    schedule: "0 7 * * *"
    action:
      type: workflow
      workflow_id: missing
"#;
        let defs = Definitions::from_yaml(yaml).unwrap();
        assert!(matches!(
            defs.check_references(&HashSet::new()),
            Err(DefinitionsError::UnknownWorkflow { .. })
        ));

        let known: HashSet<String> = ["missing".to_string()].into_iter().collect();
        assert!(defs.check_references(&known).is_ok());
    }

    #[test]
    fn test_check_rejects_bad_schedule_and_empty_workflow() {
        let yaml = r#"
workflows:
  - name: fine
    steps:
      - type: command
        command: ping
tasks:
  - name: ok
    schedule: "0 7 * * *"
    action:
      type: command
      command: ping
  - name: garbled
    schedule: "every morning"
    action:
      type: command
      command: ping
"#;
        let defs = Definitions::from_yaml(yaml).unwrap();
        assert!(defs.check_references(&HashSet::new()).is_ok());
        assert!(matches!(
            defs.check(&HashSet::new()),
            Err(DefinitionsError::Task { name, .. }) if name == "garbled"
        ));

        let empty = Definitions::from_yaml("workflows:\n  - name: hollow\n    steps: []\n").unwrap();
        assert!(matches!(
            empty.check(&HashSet::new()),
            Err(DefinitionsError::Workflow { name, .. }) if name == "hollow"
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = Definitions::load(Path::new("/nonexistent/steward.yaml")).unwrap_err();
        assert!(matches!(err, DefinitionsError::Io { .. }));
    }
}
