//! Run history persistence.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::ProjectRun;

/// Store for project run history, keyed by project id.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert or replace a run.
    async fn save(&self, run: &ProjectRun) -> Result<()>;

    /// Load every run of a project, oldest first.
    async fn load(&self, project_id: &str) -> Result<Vec<ProjectRun>>;

    /// Load one run by id.
    async fn load_run(&self, project_id: &str, run_id: &str) -> Result<Option<ProjectRun>> {
        Ok(self
            .load(project_id)
            .await?
            .into_iter()
            .find(|r| r.id == run_id))
    }
}
