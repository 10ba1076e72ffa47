//! YAML workflow files.
//!
//! ```yaml
//! name: feature-pipeline
//! allow_parallel: true
//! parameters:
//!   target: staging
//! stages:
//!   - name: plan
//!     agent_type: planner
//!   - name: implement
//!     agent_type: shell
//!     depends_on: [plan]
//!     parameters:
//!       commands: ["cargo build", "cargo test"]
//!   - name: deploy
//!     agent_type: shell
//!     depends_on: [implement]
//!     condition:
//!       if: "implement.status == 'completed' and target == 'staging'"
//! ```

use std::path::Path;

use sandflow_core::{Error, Result, WorkflowDefinition};

use crate::dag::ExecutionPlan;

pub struct WorkflowLoader;

impl WorkflowLoader {
    /// Parse and validate a workflow definition.
    pub fn from_yaml(yaml: &str) -> Result<WorkflowDefinition> {
        let workflow: WorkflowDefinition = serde_yaml::from_str(yaml)
            .map_err(|e| Error::invalid_workflow(format!("Failed to parse workflow YAML: {}", e)))?;
        ExecutionPlan::build(&workflow)?;
        Ok(workflow)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<WorkflowDefinition> {
        let path = path.as_ref();
        let yaml = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::config(format!("Failed to read {}: {}", path.display(), e)))?;
        tracing::info!(path = %path.display(), "Loading workflow");
        Self::from_yaml(&yaml)
    }
}
