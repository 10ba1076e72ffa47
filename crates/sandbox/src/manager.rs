//! Sandbox lifecycle and guarded command execution.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use sandflow_core::config::{PermissionSettings, SandboxSettings};
use sandflow_core::{
    Error, EventEmitter, EventEnvelope, EventSeverity, EventType, ExecutionResult,
    NetworkIsolationLevel, NoOpEventEmitter, PermissionGate, PermissionRequest, PermissionStatus,
    PermissionType, PrivilegedOperation, ResourceLimits, ResourceUsage, Result,
    SandboxConfiguration, SandboxEnvironment, SandboxExecPayload, SandboxId, SandboxStatePayload,
    SandboxStatus, SandboxType, SecurityViolation, ViolationKind, CANCELLED_EXIT_CODE,
    TIMEOUT_EXIT_CODE,
};

use crate::classifier::OperationClassifier;
use crate::engine::{BackendOutput, ExecRequest, SandboxEngine};

const ACTOR: &str = "sandbox-manager";

// =============================================================================
// Configuration
// =============================================================================

/// Manager-wide settings.
#[derive(Debug, Clone)]
pub struct SandboxManagerConfig {
    /// Largest limits any single sandbox may request.
    pub host_capacity: ResourceLimits,
    /// How long one permission decision may take.
    pub permission_timeout: Duration,
    /// Grace between SIGTERM and forced destruction on cancellation.
    pub termination_grace: Duration,
    /// How long destroyed environments remain visible.
    pub tombstone_retention: Duration,
}

impl Default for SandboxManagerConfig {
    fn default() -> Self {
        Self::from_settings(&SandboxSettings::default(), &PermissionSettings::default())
    }
}

impl SandboxManagerConfig {
    pub fn from_settings(sandbox: &SandboxSettings, permissions: &PermissionSettings) -> Self {
        Self {
            host_capacity: sandbox.host_capacity.clone(),
            permission_timeout: Duration::from_millis(permissions.decision_timeout_ms),
            termination_grace: Duration::from_millis(sandbox.termination_grace_ms),
            tombstone_retention: Duration::from_secs(sandbox.tombstone_retention_secs),
        }
    }
}

/// One command to run, with operations the caller knows it will perform.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub command: String,
    pub timeout: Duration,
    /// Privileged operations declared up front, checked alongside the
    /// ones found in the command text.
    pub declared: Vec<PrivilegedOperation>,
    pub env: HashMap<String, String>,
}

impl ExecSpec {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
            declared: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn with_operation(mut self, operation: PrivilegedOperation) -> Self {
        self.declared.push(operation);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

struct SandboxEntry {
    env: SandboxEnvironment,
    config: SandboxConfiguration,
    backend: Arc<dyn SandboxEngine>,
    /// Commands currently executing; a busy sandbox is never idle.
    in_flight: usize,
}

/// Decrements the entry's in-flight count however `execute_with` returns.
struct InFlight<'a> {
    sandboxes: &'a DashMap<SandboxId, SandboxEntry>,
    id: &'a SandboxId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(mut entry) = self.sandboxes.get_mut(self.id) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
            entry.env.last_activity_at = Utc::now();
        }
    }
}

// =============================================================================
// Sandbox Manager
// =============================================================================

/// Owns every sandbox environment and is the only path to its backend.
///
/// Lifecycle: `Creating → Ready → Running ⇄ Suspended → Destroying →
/// Destroyed`, with `Error` reachable from any live state. Every transition
/// emits `SandboxStateChanged`; every execution emits `SandboxExecFinished`.
pub struct SandboxManager {
    sandboxes: DashMap<SandboxId, SandboxEntry>,
    backends: HashMap<SandboxType, Arc<dyn SandboxEngine>>,
    gate: Arc<dyn PermissionGate>,
    classifier: OperationClassifier,
    events: Arc<dyn EventEmitter>,
    config: SandboxManagerConfig,
}

impl SandboxManager {
    /// Create a manager that consults `gate` for privileged operations.
    pub fn new(gate: Arc<dyn PermissionGate>, config: SandboxManagerConfig) -> Result<Self> {
        Ok(Self {
            sandboxes: DashMap::new(),
            backends: HashMap::new(),
            gate,
            classifier: OperationClassifier::new()?,
            events: Arc::new(NoOpEventEmitter),
            config,
        })
    }

    /// Register the backend serving `sandbox_type`.
    pub fn with_backend(mut self, sandbox_type: SandboxType, backend: Arc<dyn SandboxEngine>) -> Self {
        self.backends.insert(sandbox_type, backend);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventEmitter>) -> Self {
        self.events = events;
        self
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Allocate a new sandbox and bring it to `Ready`.
    pub async fn create(&self, config: SandboxConfiguration) -> Result<SandboxEnvironment> {
        if let Some(resource) = config.limits.exceeds(&self.config.host_capacity) {
            return Err(Error::ResourceLimitsUnsatisfiable(format!(
                "requested {} exceeds host capacity",
                resource
            )));
        }

        let backend = self
            .backends
            .get(&config.sandbox_type)
            .cloned()
            .ok_or_else(|| {
                Error::backend_unavailable(format!(
                    "no backend registered for {:?} sandboxes",
                    config.sandbox_type
                ))
            })?;
        if !backend.is_available().await {
            return Err(Error::backend_unavailable(format!(
                "{} backend is not available",
                backend.name()
            )));
        }

        let id = SandboxId::generate();
        self.sandboxes.insert(
            id.clone(),
            SandboxEntry {
                env: SandboxEnvironment::new(id.clone(), &config),
                config: config.clone(),
                backend: backend.clone(),
                in_flight: 0,
            },
        );
        self.emit_state(&id, None, SandboxStatus::Creating, None).await;

        if let Err(e) = backend.provision(&id, &config).await {
            tracing::error!(sandbox_id = %id, backend = backend.name(), error = %e, "Sandbox provisioning failed");
            self.fail(&id, e.to_string()).await;
            return Err(e);
        }

        self.transition(&id, &[SandboxStatus::Creating], SandboxStatus::Ready, "provision")?;
        self.emit_state(&id, Some(SandboxStatus::Creating), SandboxStatus::Ready, None)
            .await;
        tracing::info!(
            sandbox_id = %id,
            backend = backend.name(),
            sandbox_type = ?config.sandbox_type,
            network = ?config.network,
            "Sandbox created"
        );

        self.get(&id)
            .ok_or_else(|| Error::SandboxNotFound(id.to_string()))
    }

    /// `Ready → Running`.
    pub async fn start(&self, id: &SandboxId) -> Result<()> {
        let backend = self.backend_in(id, &[SandboxStatus::Ready], "start")?;
        if let Err(e) = backend.start(id).await {
            self.fail(id, e.to_string()).await;
            return Err(e);
        }
        let previous = self.transition(id, &[SandboxStatus::Ready], SandboxStatus::Running, "start")?;
        self.emit_state(id, Some(previous), SandboxStatus::Running, None).await;
        Ok(())
    }

    /// `Running → Suspended`.
    pub async fn suspend(&self, id: &SandboxId) -> Result<()> {
        let backend = self.backend_in(id, &[SandboxStatus::Running], "suspend")?;
        backend.suspend(id).await?;
        let previous =
            self.transition(id, &[SandboxStatus::Running], SandboxStatus::Suspended, "suspend")?;
        self.emit_state(id, Some(previous), SandboxStatus::Suspended, None).await;
        Ok(())
    }

    /// `Suspended → Running`.
    pub async fn resume(&self, id: &SandboxId) -> Result<()> {
        let backend = self.backend_in(id, &[SandboxStatus::Suspended], "resume")?;
        backend.resume(id).await?;
        let previous =
            self.transition(id, &[SandboxStatus::Suspended], SandboxStatus::Running, "resume")?;
        self.emit_state(id, Some(previous), SandboxStatus::Running, None).await;
        Ok(())
    }

    /// Tear a sandbox down. Repeated or unknown ids succeed without effect.
    pub async fn destroy(&self, id: &SandboxId) -> Result<()> {
        let (previous, backend) = {
            let Some(mut entry) = self.sandboxes.get_mut(id) else {
                tracing::debug!(sandbox_id = %id, "Destroy requested for unknown sandbox");
                return Ok(());
            };
            let previous = entry.env.status;
            if matches!(previous, SandboxStatus::Destroying | SandboxStatus::Destroyed) {
                return Ok(());
            }
            entry.env.status = SandboxStatus::Destroying;
            (previous, entry.backend.clone())
        };
        self.emit_state(id, Some(previous), SandboxStatus::Destroying, None)
            .await;

        if let Err(e) = backend.destroy(id).await {
            tracing::error!(sandbox_id = %id, error = %e, "Sandbox destruction failed");
            self.fail(id, e.to_string()).await;
            return Err(e);
        }

        if let Some(mut entry) = self.sandboxes.get_mut(id) {
            entry.env.status = SandboxStatus::Destroyed;
            entry.env.destroyed_at = Some(Utc::now());
        }
        self.emit_state(id, Some(SandboxStatus::Destroying), SandboxStatus::Destroyed, None)
            .await;
        tracing::info!(sandbox_id = %id, "Sandbox destroyed");
        Ok(())
    }

    /// Snapshot of one environment.
    pub fn get(&self, id: &SandboxId) -> Option<SandboxEnvironment> {
        self.sandboxes.get(id).map(|entry| entry.env.clone())
    }

    /// Snapshots of every known environment, oldest first.
    pub fn list(&self) -> Vec<SandboxEnvironment> {
        let mut all: Vec<_> = self
            .sandboxes
            .iter()
            .map(|entry| entry.env.clone())
            .collect();
        all.sort_by_key(|env| env.created_at);
        all
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Run `command` in a running sandbox.
    pub async fn execute(
        &self,
        id: &SandboxId,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        self.execute_with(id, ExecSpec::new(command, timeout), CancellationToken::new())
            .await
    }

    /// Run a command with declared operations and a cancellation handle.
    ///
    /// Denied permissions, timeouts, limit breaches, and cancellation come
    /// back as a failed [`ExecutionResult`]; `Err` is reserved for unknown
    /// sandboxes, wrong states, and backend faults.
    pub async fn execute_with(
        &self,
        id: &SandboxId,
        spec: ExecSpec,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        let (config, backend, started_at) = {
            let mut entry = self
                .sandboxes
                .get_mut(id)
                .ok_or_else(|| Error::SandboxNotFound(id.to_string()))?;
            if entry.env.status != SandboxStatus::Running {
                return Err(Error::InvalidSandboxState {
                    id: id.to_string(),
                    status: entry.env.status,
                    operation: "execute".into(),
                });
            }
            entry.env.last_activity_at = Utc::now();
            entry.in_flight += 1;
            (
                entry.config.clone(),
                entry.backend.clone(),
                entry.env.started_at.unwrap_or(entry.env.created_at),
            )
        };
        let _in_flight = InFlight {
            sandboxes: &self.sandboxes,
            id,
        };

        // Permission checks, in order of first appearance.
        let workdir = backend.workdir(id, &config);
        let mut operations = self.classifier.classify(&spec.command, &workdir);
        for op in spec.declared.iter() {
            if !operations
                .iter()
                .any(|o| o.permission_type == op.permission_type && o.resource == op.resource)
            {
                operations.push(op.clone());
            }
        }
        for op in &operations {
            let verdict = tokio::select! {
                biased;
                _ = cancel.cancelled() => Some(SecurityViolation::new(
                    ViolationKind::Cancelled,
                    "execution cancelled while waiting for permission",
                )),
                v = self.check_operation(id, config.network, op) => v,
            };
            if let Some(violation) = verdict {
                let mut result = ExecutionResult::blocked(violation);
                if matches!(result.violations[0].kind, ViolationKind::Cancelled) {
                    result.exit_code = CANCELLED_EXIT_CODE;
                }
                self.finish_exec(id, &spec.command, &result).await;
                return Ok(result);
            }
        }

        // Never run past the sandbox's lifetime.
        let elapsed = (Utc::now() - started_at).to_std().unwrap_or_default();
        let remaining = config.max_execution_time.saturating_sub(elapsed);
        if remaining.is_zero() {
            let result = timeout_result(
                "sandbox reached its maximum execution time",
                ResourceUsage::empty(),
                0,
            );
            self.finish_exec(id, &spec.command, &result).await;
            return Ok(result);
        }
        let timeout = spec.timeout.min(remaining);

        let mut env = config.env.clone();
        env.extend(spec.env.clone());
        let request = ExecRequest {
            command: spec.command.clone(),
            timeout,
            env,
        };

        tracing::debug!(sandbox_id = %id, command = %spec.command, timeout_ms = timeout.as_millis() as u64, "Executing command");
        let started = Instant::now();
        let exec = backend.exec(id, &request);
        tokio::pin!(exec);

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            out = &mut exec => Some(out),
        };

        let result = match output {
            Some(Ok(output)) => self.build_result(&config.limits, output, started.elapsed()),
            Some(Err(e)) => {
                tracing::error!(sandbox_id = %id, error = %e, "Sandbox backend failed during exec");
                self.fail(id, e.to_string()).await;
                return Err(e);
            }
            None => {
                tracing::warn!(sandbox_id = %id, command = %spec.command, "Execution cancelled, terminating");
                if let Err(e) = backend.terminate(id).await {
                    tracing::warn!(sandbox_id = %id, error = %e, "Graceful termination failed");
                }
                let finished =
                    tokio::time::timeout(self.config.termination_grace, &mut exec).await;
                let partial = match finished {
                    Ok(Ok(output)) => Some(output),
                    Ok(Err(_)) => None,
                    Err(_) => {
                        tracing::warn!(sandbox_id = %id, "Command ignored SIGTERM, destroying sandbox");
                        self.destroy(id).await?;
                        None
                    }
                };
                cancelled_result(partial, started.elapsed())
            }
        };

        self.finish_exec(id, &spec.command, &result).await;
        Ok(result)
    }

    /// `None` when `op` may proceed, otherwise the violation that blocks it.
    async fn check_operation(
        &self,
        id: &SandboxId,
        network: NetworkIsolationLevel,
        op: &PrivilegedOperation,
    ) -> Option<SecurityViolation> {
        let is_network = matches!(
            op.permission_type,
            PermissionType::NetworkAccess | PermissionType::PortBinding
        );
        if is_network {
            match network {
                NetworkIsolationLevel::Open => return None,
                NetworkIsolationLevel::Isolated => {
                    tracing::info!(sandbox_id = %id, resource = %op.resource, "Network operation in isolated sandbox");
                    return Some(SecurityViolation::new(
                        ViolationKind::NetworkIsolated,
                        format!(
                            "{} on '{}' blocked: sandbox network is isolated",
                            op.permission_type, op.resource
                        ),
                    ));
                }
                NetworkIsolationLevel::Restricted => {}
            }
        }

        if let Some(grant) = self.gate.active_grant(id, op) {
            tracing::debug!(sandbox_id = %id, request_id = %grant.id, resource = %op.resource, "Reusing standing grant");
            return None;
        }

        let response = self
            .gate
            .request_permission(
                PermissionRequest::new(id.clone(), op),
                self.config.permission_timeout,
            )
            .await;
        match response.status {
            PermissionStatus::Approved => None,
            PermissionStatus::Expired => Some(SecurityViolation::new(
                ViolationKind::PermissionExpired {
                    permission_type: op.permission_type,
                },
                format!(
                    "{} on '{}' expired without a decision",
                    op.permission_type, op.resource
                ),
            )),
            PermissionStatus::Denied | PermissionStatus::Pending => Some(SecurityViolation::new(
                ViolationKind::PermissionDenied {
                    permission_type: op.permission_type,
                },
                format!(
                    "{} on '{}' denied: {}",
                    op.permission_type, op.resource, response.reason
                ),
            )),
        }
    }

    fn build_result(
        &self,
        limits: &ResourceLimits,
        output: BackendOutput,
        elapsed: Duration,
    ) -> ExecutionResult {
        let mut violations = Vec::new();
        if output.timed_out {
            violations.push(SecurityViolation::new(
                ViolationKind::Timeout,
                "command exceeded its timeout",
            ));
        }
        if let Some(resource) = output.limit_exceeded {
            violations.push(SecurityViolation::new(
                ViolationKind::ResourceLimitExceeded { resource },
                format!("command killed for exceeding its {} limit", resource),
            ));
        }
        for breach in limits.check(&output.usage) {
            if output.limit_exceeded == Some(breach.resource) {
                continue;
            }
            violations.push(SecurityViolation::new(
                ViolationKind::ResourceLimitExceeded {
                    resource: breach.resource,
                },
                breach.to_string(),
            ));
        }

        ExecutionResult {
            success: output.exit_code == 0 && !output.timed_out && violations.is_empty(),
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            duration_ms: elapsed.as_millis() as u64,
            timed_out: output.timed_out,
            resource_usage: output.usage,
            violations,
        }
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    /// Destroy environments past their lifetime or idle timeout and purge
    /// old tombstones. Returns the ids destroyed by this sweep.
    pub async fn sweep_expired(&self) -> Vec<SandboxId> {
        let now = Utc::now();
        let retention = chrono::Duration::from_std(self.config.tombstone_retention)
            .unwrap_or_else(|_| chrono::Duration::zero());

        let expired: Vec<SandboxId> = self
            .sandboxes
            .iter()
            .filter(|entry| {
                let env = &entry.env;
                if matches!(
                    env.status,
                    SandboxStatus::Creating | SandboxStatus::Destroying | SandboxStatus::Destroyed
                ) {
                    return false;
                }
                let age = (now - env.started_at.unwrap_or(env.created_at))
                    .to_std()
                    .unwrap_or_default();
                let idle = (now - env.last_activity_at).to_std().unwrap_or_default();
                age >= entry.config.max_execution_time
                    || (entry.in_flight == 0 && idle >= entry.config.idle_timeout)
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut destroyed = Vec::new();
        for id in expired {
            match self.destroy(&id).await {
                Ok(()) => destroyed.push(id),
                Err(e) => tracing::warn!(sandbox_id = %id, error = %e, "Cleanup failed to destroy sandbox"),
            }
        }

        let before = self.sandboxes.len();
        self.sandboxes.retain(|_, entry| match entry.env.destroyed_at {
            Some(at) if entry.env.status == SandboxStatus::Destroyed => at + retention > now,
            _ => true,
        });
        let purged = before - self.sandboxes.len();

        if !destroyed.is_empty() || purged > 0 {
            tracing::info!(destroyed = destroyed.len(), purged, "Sandbox cleanup sweep");
        }
        destroyed
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `interval` until `cancel` fires.
    pub fn spawn_cleanup_task(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep_expired().await;
                    }
                }
            }
            tracing::debug!("Sandbox cleanup task stopped");
        })
    }

    // =========================================================================
    // State helpers
    // =========================================================================

    fn backend_in(
        &self,
        id: &SandboxId,
        expected: &[SandboxStatus],
        operation: &str,
    ) -> Result<Arc<dyn SandboxEngine>> {
        let entry = self
            .sandboxes
            .get(id)
            .ok_or_else(|| Error::SandboxNotFound(id.to_string()))?;
        if !expected.contains(&entry.env.status) {
            return Err(Error::InvalidSandboxState {
                id: id.to_string(),
                status: entry.env.status,
                operation: operation.into(),
            });
        }
        Ok(entry.backend.clone())
    }

    /// Move `id` from one of `expected` to `next`, returning the previous status.
    fn transition(
        &self,
        id: &SandboxId,
        expected: &[SandboxStatus],
        next: SandboxStatus,
        operation: &str,
    ) -> Result<SandboxStatus> {
        let mut entry = self
            .sandboxes
            .get_mut(id)
            .ok_or_else(|| Error::SandboxNotFound(id.to_string()))?;
        let previous = entry.env.status;
        if !expected.contains(&previous) || !previous.can_transition_to(next) {
            return Err(Error::InvalidSandboxState {
                id: id.to_string(),
                status: previous,
                operation: operation.into(),
            });
        }
        entry.env.status = next;
        if next == SandboxStatus::Running && entry.env.started_at.is_none() {
            entry.env.started_at = Some(Utc::now());
        }
        entry.env.last_activity_at = Utc::now();
        Ok(previous)
    }

    /// Record a fault and move to `Error` unless already torn down.
    async fn fail(&self, id: &SandboxId, cause: String) {
        let previous = {
            let Some(mut entry) = self.sandboxes.get_mut(id) else {
                return;
            };
            let previous = entry.env.status;
            if !previous.can_transition_to(SandboxStatus::Error) {
                return;
            }
            entry.env.status = SandboxStatus::Error;
            entry.env.error = Some(cause.clone());
            previous
        };
        self.emit_state(id, Some(previous), SandboxStatus::Error, Some(cause))
            .await;
    }

    async fn emit_state(
        &self,
        id: &SandboxId,
        previous: Option<SandboxStatus>,
        status: SandboxStatus,
        reason: Option<String>,
    ) {
        let severity = if status == SandboxStatus::Error {
            EventSeverity::Error
        } else {
            EventSeverity::Info
        };
        let event = EventEnvelope::from_payload(
            EventType::SandboxStateChanged,
            &SandboxStatePayload {
                sandbox_id: id.to_string(),
                previous,
                status,
                reason,
            },
        )
        .with_actor(ACTOR)
        .with_severity(severity);
        self.events.emit(event).await;
    }

    async fn finish_exec(&self, id: &SandboxId, command: &str, result: &ExecutionResult) {
        tracing::info!(
            sandbox_id = %id,
            exit_code = result.exit_code,
            success = result.success,
            duration_ms = result.duration_ms,
            violations = result.violations.len(),
            "Command finished"
        );
        let severity = if result.violations.is_empty() {
            EventSeverity::Info
        } else {
            EventSeverity::Warning
        };
        let event = EventEnvelope::from_payload(
            EventType::SandboxExecFinished,
            &SandboxExecPayload {
                sandbox_id: id.to_string(),
                command: command.to_string(),
                exit_code: result.exit_code,
                success: result.success,
                duration_ms: result.duration_ms,
                violations: result.violations.len(),
            },
        )
        .with_actor(ACTOR)
        .with_severity(severity);
        self.events.emit(event).await;
    }
}

fn timeout_result(message: &str, usage: ResourceUsage, duration_ms: u64) -> ExecutionResult {
    ExecutionResult {
        success: false,
        exit_code: TIMEOUT_EXIT_CODE,
        stdout: String::new(),
        stderr: message.to_string(),
        duration_ms,
        timed_out: true,
        resource_usage: usage,
        violations: vec![SecurityViolation::new(ViolationKind::Timeout, message)],
    }
}

fn cancelled_result(partial: Option<BackendOutput>, elapsed: Duration) -> ExecutionResult {
    let (stdout, stderr, usage) = match partial {
        Some(out) => (out.stdout, out.stderr, out.usage),
        None => (String::new(), String::new(), ResourceUsage::empty()),
    };
    ExecutionResult {
        success: false,
        exit_code: CANCELLED_EXIT_CODE,
        stdout,
        stderr,
        duration_ms: elapsed.as_millis() as u64,
        timed_out: false,
        resource_usage: usage,
        violations: vec![SecurityViolation::new(
            ViolationKind::Cancelled,
            "execution cancelled",
        )],
    }
}

// =============================================================================
// Tests
// =============================================================================
