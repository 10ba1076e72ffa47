//! Audit trail for permission decisions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

use sandflow_core::{Error, PermissionRequest, PermissionType, Result};

/// Outcome of an audited decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Approved,
    Denied,
    Expired,
    /// A previous approval was withdrawn.
    Revoked,
}

/// A single audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unique entry ID.
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Permission request the entry refers to.
    pub request_id: String,
    /// Sandbox that asked.
    pub sandbox_id: String,
    pub permission_type: PermissionType,
    pub resource: String,
    pub outcome: AuditOutcome,
    pub reason: Option<String>,
    /// Time between the request and its decision.
    pub elapsed_ms: u64,
}

impl AuditEntry {
    pub fn for_request(request: &PermissionRequest, outcome: AuditOutcome, elapsed_ms: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            request_id: request.id.clone(),
            sandbox_id: request.sandbox_id.to_string(),
            permission_type: request.permission_type,
            resource: request.resource.clone(),
            outcome,
            reason: request.response_reason.clone(),
            elapsed_ms,
        }
    }
}

/// Filter for querying audit logs.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub sandbox_id: Option<String>,
    pub permission_type: Option<PermissionType>,
    pub outcome: Option<AuditOutcome>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.sandbox_id.as_ref().map_or(true, |s| &entry.sandbox_id == s)
            && self.permission_type.map_or(true, |t| entry.permission_type == t)
            && self.outcome.as_ref().map_or(true, |o| &entry.outcome == o)
            && self.since.map_or(true, |t| entry.timestamp >= t)
    }
}

/// Trait for audit log persistence.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Log an audit entry.
    async fn log(&self, entry: AuditEntry) -> Result<()>;

    /// Query audit logs with optional filters, oldest first.
    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditEntry>>;
}

/// In-memory audit store.
#[derive(Default)]
pub struct InMemoryAuditStore {
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn log(&self, entry: AuditEntry) -> Result<()> {
        self.entries.lock().push(entry);
        Ok(())
    }

    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditEntry>> {
        let entries = self.entries.lock();
        let mut result: Vec<AuditEntry> = entries
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();

        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }

        Ok(result)
    }
}

/// Append-only JSON Lines audit log.
pub struct FileAuditStore {
    path: PathBuf,
    // Serializes appends so lines never interleave.
    write_lock: tokio::sync::Mutex<()>,
}

impl FileAuditStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl AuditStore for FileAuditStore {
    async fn log(&self, entry: AuditEntry) -> Result<()> {
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::storage(format!("audit dir: {}", e)))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| Error::storage(format!("open audit log: {}", e)))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| Error::storage(format!("write audit log: {}", e)))?;
        Ok(())
    }

    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditEntry>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::storage(format!("read audit log: {}", e))),
        };

        let mut result = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let entry: AuditEntry = serde_json::from_str(line)?;
            if filter.matches(&entry) {
                result.push(entry);
                if filter.limit.is_some_and(|l| result.len() >= l) {
                    break;
                }
            }
        }
        Ok(result)
    }
}
