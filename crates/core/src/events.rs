use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::types::{
    PermissionStatus, PermissionType, ProjectStatus, SandboxStatus, StageStatus,
};

/// Structured Event Envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: String,
    /// Project the event belongs to (if applicable)
    pub project_id: Option<String>,
    /// Run the event belongs to (if applicable)
    pub run_id: Option<String>,
    /// Component that raised the event ("workflow-engine", "sandbox-manager", ...)
    pub actor: String,
    /// Timestamp of the event
    pub timestamp: DateTime<Utc>,
    /// Event type category
    pub event_type: EventType,
    /// Event severity level
    pub severity: EventSeverity,
    /// Structured payload (event-specific data)
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            project_id: None,
            run_id: None,
            actor: "system".to_string(),
            timestamp: Utc::now(),
            event_type,
            severity: EventSeverity::Info,
            payload,
        }
    }

    /// Build an envelope from any serializable payload.
    pub fn from_payload<T: Serialize>(event_type: EventType, payload: &T) -> Self {
        Self::new(
            event_type,
            serde_json::to_value(payload).unwrap_or_default(),
        )
    }

    pub fn with_project(mut self, project_id: &str) -> Self {
        self.project_id = Some(project_id.to_string());
        self
    }

    pub fn with_run(mut self, run_id: &str) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }

    pub fn with_actor(mut self, actor: &str) -> Self {
        self.actor = actor.to_string();
        self
    }

    pub fn with_severity(mut self, severity: EventSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Decode the payload into a typed struct.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Option<T> {
        serde_json::from_value(self.payload.clone()).ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Run-level status transition
    WorkflowStateChanged,
    /// Stage-level status transition
    StageStateChanged,
    /// A budget ceiling was approached or breached
    CostAlertRaised,
    /// A permission request was published to the decision handler
    PermissionRequested,
    /// A permission request reached a terminal state (or was revoked)
    PermissionResolved,
    /// Sandbox lifecycle transition
    SandboxStateChanged,
    /// A command finished inside a sandbox
    SandboxExecFinished,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

// Helper structs for common payloads

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatePayload {
    pub project_id: String,
    pub run_id: String,
    pub workflow: String,
    pub previous: ProjectStatus,
    pub status: ProjectStatus,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageStatePayload {
    pub project_id: String,
    pub run_id: String,
    pub stage_name: String,
    pub previous: StageStatus,
    pub status: StageStatus,
    pub agent_id: Option<String>,
    pub output: HashMap<String, serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionPayload {
    pub request_id: String,
    pub sandbox_id: String,
    pub permission_type: PermissionType,
    pub resource: String,
    pub status: PermissionStatus,
    pub reason: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxStatePayload {
    pub sandbox_id: String,
    pub previous: Option<SandboxStatus>,
    pub status: SandboxStatus,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxExecPayload {
    pub sandbox_id: String,
    pub command: String,
    pub exit_code: i64,
    pub success: bool,
    pub duration_ms: u64,
    pub violations: usize,
}
