//! Governance traits consumed by the sandbox layer.

use async_trait::async_trait;
use std::time::Duration;

use crate::types::{PermissionRequest, PermissionResponse, PrivilegedOperation, SandboxId};

/// Gate that decides whether a privileged operation may proceed.
///
/// Implementations must be fail-closed: any inability to reach a decision
/// resolves to a denial, never to an error propagating into the caller.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    /// Record the request and wait (at most `timeout`) for a decision.
    async fn request_permission(
        &self,
        request: PermissionRequest,
        timeout: Duration,
    ) -> PermissionResponse;

    /// A still-valid standing grant covering `operation`, if any.
    fn active_grant(
        &self,
        sandbox_id: &SandboxId,
        operation: &PrivilegedOperation,
    ) -> Option<PermissionRequest>;
}
