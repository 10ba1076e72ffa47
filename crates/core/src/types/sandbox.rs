use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::permission::PermissionType;
use super::resource::{ResourceKind, ResourceLimits, ResourceUsage};

// =============================================================================
// Sandbox Identity & Kinds
// =============================================================================

/// Unique identifier for a sandbox instance.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SandboxId(pub String);

impl SandboxId {
    /// Generate a fresh sandbox id.
    pub fn generate() -> Self {
        Self(format!("sf-sandbox-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SandboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SandboxId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of isolation backing a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SandboxType {
    /// OCI container.
    #[default]
    Container,
    /// Full virtual machine.
    VirtualMachine,
    /// Restricted host process.
    Process,
    /// Private scratch filesystem with restricted process execution.
    VirtualFilesystem,
}

/// Network isolation profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NetworkIsolationLevel {
    /// No network at all; network operations are denied without asking.
    Isolated,
    /// Network operations require a permission decision.
    #[default]
    Restricted,
    /// Unrestricted network access (dangerous).
    Open,
}

/// Lifecycle state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Creating,
    Ready,
    Running,
    Suspended,
    Destroying,
    Destroyed,
    Error,
}

impl SandboxStatus {
    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// `Creating` is never re-entered and `Destroyed` is final.
    pub fn can_transition_to(self, next: SandboxStatus) -> bool {
        use SandboxStatus::*;
        match (self, next) {
            (_, Creating) => false,
            (Destroyed, _) => false,
            (_, Error) => true,
            (Creating, Ready) => true,
            (Ready, Running) => true,
            (Running, Suspended) | (Suspended, Running) => true,
            (Destroying, Destroyed) => true,
            (Destroying, _) => false,
            (_, Destroying) => true,
            _ => false,
        }
    }

    /// Whether the sandbox has been torn down.
    pub fn is_terminal(self) -> bool {
        matches!(self, SandboxStatus::Destroyed)
    }
}

// =============================================================================
// Sandbox Configuration & Environment
// =============================================================================

/// Configuration for creating a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfiguration {
    /// Backend kind.
    pub sandbox_type: SandboxType,
    /// Image to use for container/VM backends.
    pub image: String,
    /// Resource ceilings.
    pub limits: ResourceLimits,
    /// Network isolation profile.
    pub network: NetworkIsolationLevel,
    /// Maximum lifetime of the sandbox.
    #[serde(with = "duration_secs")]
    pub max_execution_time: Duration,
    /// Idle period after which the cleanup sweep destroys the sandbox.
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,
    /// Working directory inside the sandbox.
    pub workdir: String,
    /// Extra environment variables visible to commands.
    pub env: HashMap<String, String>,
    /// Free-form metadata copied onto the environment.
    pub metadata: HashMap<String, String>,
}

impl Default for SandboxConfiguration {
    fn default() -> Self {
        Self {
            sandbox_type: SandboxType::Container,
            image: "sandflow-sandbox:latest".to_string(),
            limits: ResourceLimits::default(),
            network: NetworkIsolationLevel::Restricted,
            max_execution_time: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(900),
            workdir: "/workspace".to_string(),
            env: HashMap::new(),
            metadata: HashMap::new(),
        }
    }
}

/// A live (or torn-down) isolated environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxEnvironment {
    pub id: SandboxId,
    pub sandbox_type: SandboxType,
    pub status: SandboxStatus,
    pub limits: ResourceLimits,
    pub network: NetworkIsolationLevel,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub destroyed_at: Option<DateTime<Utc>>,
    /// Cause of the last transition to `Error`.
    pub error: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl SandboxEnvironment {
    /// A fresh environment in `Creating` state.
    pub fn new(id: SandboxId, config: &SandboxConfiguration) -> Self {
        let now = Utc::now();
        Self {
            id,
            sandbox_type: config.sandbox_type,
            status: SandboxStatus::Creating,
            limits: config.limits.clone(),
            network: config.network,
            created_at: now,
            started_at: None,
            last_activity_at: now,
            destroyed_at: None,
            error: None,
            metadata: config.metadata.clone(),
        }
    }
}

// =============================================================================
// Execution Types
// =============================================================================

/// Synthetic exit code reported when a permission check blocks a command.
pub const PERMISSION_DENIED_EXIT_CODE: i64 = 126;
/// Synthetic exit code reported when a command is killed for running too long.
pub const TIMEOUT_EXIT_CODE: i64 = 124;
/// Synthetic exit code reported when a command is cancelled.
pub const CANCELLED_EXIT_CODE: i64 = 130;

/// What went wrong during an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViolationKind {
    PermissionDenied { permission_type: PermissionType },
    PermissionExpired { permission_type: PermissionType },
    NetworkIsolated,
    ResourceLimitExceeded { resource: ResourceKind },
    Timeout,
    Cancelled,
}

/// A security-relevant event observed during one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityViolation {
    pub kind: ViolationKind,
    pub message: String,
    pub detected_at: DateTime<Utc>,
}

impl SecurityViolation {
    pub fn new(kind: ViolationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detected_at: Utc::now(),
        }
    }
}

/// Outcome of one command run inside a sandbox. Never mutated after return.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub resource_usage: ResourceUsage,
    pub violations: Vec<SecurityViolation>,
}

impl ExecutionResult {
    /// A result for a command that never reached the backend.
    pub fn blocked(violation: SecurityViolation) -> Self {
        Self {
            success: false,
            exit_code: PERMISSION_DENIED_EXIT_CODE,
            stdout: String::new(),
            stderr: violation.message.clone(),
            duration_ms: 0,
            timed_out: false,
            resource_usage: ResourceUsage::empty(),
            violations: vec![violation],
        }
    }

    /// Short human-readable failure reason, preferring violations over stderr.
    pub fn failure_reason(&self) -> Option<String> {
        if self.success {
            return None;
        }
        if let Some(v) = self.violations.first() {
            return Some(v.message.clone());
        }
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            Some(format!("command exited with code {}", self.exit_code))
        } else {
            Some(format!("command exited with code {}: {}", self.exit_code, stderr))
        }
    }
}

/// Serde helper storing a `Duration` as whole seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Serde helper storing an optional `Duration` as milliseconds.
pub mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
