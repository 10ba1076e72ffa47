//! Run history persistence for crash recovery and resume.

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

use sandflow_core::{Error, ProjectRun, Result, RunStore};

/// In-memory run store.
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: DashMap<String, Vec<ProjectRun>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of projects with stored runs.
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

fn upsert(runs: &mut Vec<ProjectRun>, run: &ProjectRun) {
    match runs.iter_mut().find(|r| r.id == run.id) {
        Some(existing) => *existing = run.clone(),
        None => runs.push(run.clone()),
    }
    runs.sort_by_key(|r| r.started_at);
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn save(&self, run: &ProjectRun) -> Result<()> {
        upsert(&mut self.runs.entry(run.project_id.clone()).or_default(), run);
        tracing::debug!(run_id = %run.id, status = %run.status, "Run saved");
        Ok(())
    }

    async fn load(&self, project_id: &str) -> Result<Vec<ProjectRun>> {
        Ok(self
            .runs
            .get(project_id)
            .map(|r| r.clone())
            .unwrap_or_default())
    }
}

/// Run store keeping one JSON document per project under a directory.
pub struct FileRunStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRunStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, project_id: &str) -> PathBuf {
        let safe: String = project_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }

    async fn read(&self, project_id: &str) -> Result<Vec<ProjectRun>> {
        let path = self.path_for(project_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Error::storage(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn save(&self, run: &ProjectRun) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::storage(format!("failed to create {}: {}", self.dir.display(), e)))?;

        let mut runs = self.read(&run.project_id).await?;
        upsert(&mut runs, run);

        // Write then rename so a crash never leaves a truncated document.
        let path = self.path_for(&run.project_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&runs)?)
            .await
            .map_err(|e| Error::storage(format!("failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::storage(format!("failed to replace {}: {}", path.display(), e)))?;

        tracing::debug!(run_id = %run.id, path = %path.display(), "Run persisted");
        Ok(())
    }

    async fn load(&self, project_id: &str) -> Result<Vec<ProjectRun>> {
        self.read(project_id).await
    }
}
