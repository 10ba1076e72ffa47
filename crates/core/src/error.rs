//! Error types for Sandflow.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{BudgetScope, PermissionType, SandboxStatus};

/// Result type alias using Sandflow's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for Sandflow.
///
/// Only configuration-level and programmer errors travel through this type.
/// A failing command or a failing stage is captured into
/// [`ExecutionResult`](crate::types::ExecutionResult) or
/// [`StageResult`](crate::types::StageResult) instead.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Workflow Errors
    // =========================================================================
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Stage execution failed: {0}")]
    StageExecution(String),

    #[error("No agent registered for type '{0}'")]
    AgentNotFound(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run {run_id} is {status}, cannot {operation}")]
    InvalidRunState {
        run_id: String,
        status: String,
        operation: String,
    },

    // =========================================================================
    // Sandbox Errors
    // =========================================================================
    #[error("Sandbox not found: {0}")]
    SandboxNotFound(String),

    #[error("Sandbox {id} is {status:?}, cannot {operation}")]
    InvalidSandboxState {
        id: String,
        status: SandboxStatus,
        operation: String,
    },

    #[error("Sandbox backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Sandbox backend error: {0}")]
    SandboxBackend(String),

    #[error("Resource limits unsatisfiable: {0}")]
    ResourceLimitsUnsatisfiable(String),

    // =========================================================================
    // Permission Errors
    // =========================================================================
    #[error("Permission denied: {permission_type} on '{resource}': {reason}")]
    PermissionDenied {
        permission_type: PermissionType,
        resource: String,
        reason: String,
    },

    #[error("Permission expired: {permission_type} on '{resource}'")]
    PermissionExpired {
        permission_type: PermissionType,
        resource: String,
    },

    #[error("Permission request not found: {0}")]
    PermissionRequestNotFound(String),

    #[error("A permission decision handler is already registered")]
    HandlerAlreadyRegistered,

    // =========================================================================
    // Cost Errors
    // =========================================================================
    #[error("Budget exceeded ({scope}): current {current}, limit {limit}")]
    BudgetExceeded {
        scope: BudgetScope,
        current: Decimal,
        limit: Decimal,
    },

    #[error("No rate configured for provider '{provider}' model '{model}'")]
    UnknownRate { provider: String, model: String },

    // =========================================================================
    // Generic Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create an invalid workflow error.
    pub fn invalid_workflow(msg: impl Into<String>) -> Self {
        Self::InvalidWorkflow(msg.into())
    }

    /// Create a stage execution error.
    pub fn stage_execution(msg: impl Into<String>) -> Self {
        Self::StageExecution(msg.into())
    }

    /// Create an agent error.
    pub fn agent(msg: impl Into<String>) -> Self {
        Self::Agent(msg.into())
    }

    /// Create a sandbox backend error.
    pub fn sandbox_backend(msg: impl Into<String>) -> Self {
        Self::SandboxBackend(msg.into())
    }

    /// Create a backend unavailable error.
    pub fn backend_unavailable(msg: impl Into<String>) -> Self {
        Self::BackendUnavailable(msg.into())
    }

    /// Create a storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error is a user configuration problem that must not be retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidWorkflow(_)
                | Self::UnknownRate { .. }
                | Self::Config(_)
                | Self::ResourceLimitsUnsatisfiable(_)
        )
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
