use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::sandbox::{opt_duration_ms, SandboxId};

// =============================================================================
// Permission Types
// =============================================================================

/// Category of privileged operation. Matched exhaustively everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionType {
    /// Outbound network connection to a host.
    NetworkAccess,
    /// Listening on a port.
    PortBinding,
    /// Raising a resource ceiling beyond the sandbox's limits.
    ResourceIncrease,
    /// Touching the filesystem outside the sandbox working directory.
    FileSystemAccess,
    /// Manipulating the process table (signals, privilege changes, daemons).
    ProcessExecution,
}

impl PermissionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkAccess => "network_access",
            Self::PortBinding => "port_binding",
            Self::ResourceIncrease => "resource_increase",
            Self::FileSystemAccess => "filesystem_access",
            Self::ProcessExecution => "process_execution",
        }
    }
}

impl std::fmt::Display for PermissionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl PermissionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, PermissionStatus::Pending)
    }

    pub fn is_granted(self) -> bool {
        matches!(self, PermissionStatus::Approved)
    }
}

/// A privileged operation a command intends to perform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrivilegedOperation {
    pub permission_type: PermissionType,
    /// Target resource (host, port, path, process name, resource name).
    pub resource: String,
    /// Human-readable reason shown to the decision handler.
    pub reason: String,
}

impl PrivilegedOperation {
    pub fn new(
        permission_type: PermissionType,
        resource: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            permission_type,
            resource: resource.into(),
            reason: reason.into(),
        }
    }
}

/// Request for a privileged operation originating from a sandbox.
///
/// Retained for audit after resolution; transitions out of `Pending` once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    pub sandbox_id: SandboxId,
    pub permission_type: PermissionType,
    pub resource: String,
    pub reason: String,
    pub status: PermissionStatus,
    pub response_reason: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// How long an approval stays valid for identical operations.
    #[serde(default, with = "opt_duration_ms")]
    pub valid_for: Option<Duration>,
    /// Broker-assigned order of arrival.
    #[serde(default)]
    pub sequence: u64,
}

impl PermissionRequest {
    /// Build a pending request for an operation in a sandbox.
    pub fn new(sandbox_id: SandboxId, operation: &PrivilegedOperation) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sandbox_id,
            permission_type: operation.permission_type,
            resource: operation.resource.clone(),
            reason: operation.reason.clone(),
            status: PermissionStatus::Pending,
            response_reason: None,
            requested_at: Utc::now(),
            resolved_at: None,
            valid_for: None,
            sequence: 0,
        }
    }

    /// Whether this approved request still covers new operations at `now`.
    pub fn grant_active_at(&self, now: DateTime<Utc>) -> bool {
        if self.status != PermissionStatus::Approved {
            return false;
        }
        match (self.valid_for, self.resolved_at) {
            (Some(valid_for), Some(resolved_at)) => chrono::Duration::from_std(valid_for)
                .map(|d| resolved_at + d > now)
                .unwrap_or(false),
            _ => false,
        }
    }
}

/// A decision on a permission request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub status: PermissionStatus,
    pub reason: String,
    /// Optional standing-grant duration for approvals.
    #[serde(default, with = "opt_duration_ms")]
    pub valid_for: Option<Duration>,
}

impl PermissionResponse {
    pub fn approve(reason: impl Into<String>) -> Self {
        Self {
            status: PermissionStatus::Approved,
            reason: reason.into(),
            valid_for: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            status: PermissionStatus::Denied,
            reason: reason.into(),
            valid_for: None,
        }
    }

    pub fn expired(reason: impl Into<String>) -> Self {
        Self {
            status: PermissionStatus::Expired,
            reason: reason.into(),
            valid_for: None,
        }
    }

    /// Turn an approval into a standing grant.
    pub fn valid_for(mut self, duration: Duration) -> Self {
        self.valid_for = Some(duration);
        self
    }

    pub fn is_approved(&self) -> bool {
        self.status == PermissionStatus::Approved
    }
}
