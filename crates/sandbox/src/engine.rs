//! Sandbox execution backends.
//!
//! This module provides the `SandboxEngine` trait every backend implements
//! and an in-memory [`MockSandbox`] for tests. The manager owns lifecycle
//! state; a backend only does what it is told for an id it was given.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use sandflow_core::{
    Error, ResourceKind, ResourceUsage, Result, SandboxConfiguration, SandboxId,
    TIMEOUT_EXIT_CODE,
};

// =============================================================================
// Backend Types
// =============================================================================

/// A command for a backend to run.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    pub timeout: Duration,
    pub env: HashMap<String, String>,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
            env: HashMap::new(),
        }
    }
}

/// Raw outcome reported by a backend.
#[derive(Debug, Clone)]
pub struct BackendOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub usage: ResourceUsage,
    /// Resource whose limit killed the command (signal or OOM), if known.
    pub limit_exceeded: Option<ResourceKind>,
}

impl BackendOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self::exit(0, stdout, "")
    }

    pub fn exit(exit_code: i64, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            timed_out: false,
            usage: ResourceUsage::empty(),
            limit_exceeded: None,
        }
    }

    pub fn timed_out(stdout: String, stderr: String, timeout: Duration) -> Self {
        Self {
            exit_code: TIMEOUT_EXIT_CODE,
            stdout,
            stderr: format!("{}\n[Execution timed out after {:?}]", stderr, timeout),
            timed_out: true,
            usage: ResourceUsage::empty(),
            limit_exceeded: None,
        }
    }

    pub fn with_usage(mut self, usage: ResourceUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_limit_exceeded(mut self, resource: ResourceKind) -> Self {
        self.limit_exceeded = Some(resource);
        self
    }
}

// =============================================================================
// Sandbox Engine Trait
// =============================================================================

/// Trait for sandbox execution backends.
///
/// Implementations provide isolated environments for running untrusted code.
/// Every method receives the id the manager allocated; backends keep their
/// own mapping from that id to whatever they created.
#[async_trait]
pub trait SandboxEngine: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Allocate the environment (container, directory, ...).
    async fn provision(&self, id: &SandboxId, config: &SandboxConfiguration) -> Result<()>;

    /// Make the environment ready to execute commands.
    async fn start(&self, id: &SandboxId) -> Result<()>;

    /// Run one command, enforcing `request.timeout`.
    async fn exec(&self, id: &SandboxId, request: &ExecRequest) -> Result<BackendOutput>;

    /// Ask running commands to stop (SIGTERM); does not tear the environment down.
    async fn terminate(&self, id: &SandboxId) -> Result<()>;

    /// Freeze every process in the environment.
    async fn suspend(&self, id: &SandboxId) -> Result<()>;

    /// Thaw a suspended environment.
    async fn resume(&self, id: &SandboxId) -> Result<()>;

    /// Destroy the environment. Destroying an unknown id succeeds.
    async fn destroy(&self, id: &SandboxId) -> Result<()>;

    /// Check if the backend is usable (e.g., Docker daemon running).
    async fn is_available(&self) -> bool;

    /// Working directory as seen by commands in this sandbox.
    fn workdir(&self, _id: &SandboxId, config: &SandboxConfiguration) -> String {
        config.workdir.clone()
    }
}

// =============================================================================
// Mock Sandbox (for testing without Docker)
// =============================================================================

/// Scripted response of the mock backend.
#[derive(Debug, Clone)]
pub enum MockStep {
    /// Return this output immediately.
    Output(BackendOutput),
    /// Sleep, then return the output (or time out if the sleep exceeds the timeout).
    Delayed(Duration, BackendOutput),
    /// Fail the backend call.
    Fail(String),
}

/// In-memory mock sandbox for unit testing.
///
/// Commands are answered from a script in order; once it is empty every
/// command succeeds with `[mock] command executed`.
#[derive(Default)]
pub struct MockSandbox {
    script: Mutex<VecDeque<MockStep>>,
    commands: Mutex<Vec<String>>,
    live: Mutex<HashSet<SandboxId>>,
    terminated: Mutex<Vec<SandboxId>>,
    fail_provision: Mutex<Option<String>>,
    fail_start: Mutex<Option<String>>,
    unavailable: bool,
}

impl MockSandbox {
    /// Create a mock sandbox with predefined exec responses.
    pub fn new(steps: Vec<MockStep>) -> Self {
        Self {
            script: Mutex::new(steps.into()),
            ..Default::default()
        }
    }

    /// A backend whose `is_available` is false.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Default::default()
        }
    }

    pub fn push(&self, step: MockStep) {
        self.script.lock().push_back(step);
    }

    /// Make the next `provision` fail with `message`.
    pub fn fail_next_provision(&self, message: impl Into<String>) {
        *self.fail_provision.lock() = Some(message.into());
    }

    /// Make the next `start` fail with `message`.
    pub fn fail_next_start(&self, message: impl Into<String>) {
        *self.fail_start.lock() = Some(message.into());
    }

    /// Commands that reached the backend, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn is_live(&self, id: &SandboxId) -> bool {
        self.live.lock().contains(id)
    }

    pub fn terminated(&self) -> Vec<SandboxId> {
        self.terminated.lock().clone()
    }
}

#[async_trait]
impl SandboxEngine for MockSandbox {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn provision(&self, id: &SandboxId, _config: &SandboxConfiguration) -> Result<()> {
        if let Some(message) = self.fail_provision.lock().take() {
            return Err(Error::sandbox_backend(message));
        }
        self.live.lock().insert(id.clone());
        Ok(())
    }

    async fn start(&self, _id: &SandboxId) -> Result<()> {
        if let Some(message) = self.fail_start.lock().take() {
            return Err(Error::sandbox_backend(message));
        }
        Ok(())
    }

    async fn exec(&self, id: &SandboxId, request: &ExecRequest) -> Result<BackendOutput> {
        if !self.is_live(id) {
            return Err(Error::sandbox_backend(format!("mock sandbox {} is gone", id)));
        }
        self.commands.lock().push(request.command.clone());

        let step = self.script.lock().pop_front();
        match step {
            None => Ok(BackendOutput::ok("[mock] command executed")),
            Some(MockStep::Output(output)) => Ok(output),
            Some(MockStep::Fail(message)) => Err(Error::sandbox_backend(message)),
            Some(MockStep::Delayed(delay, output)) => {
                if delay > request.timeout {
                    tokio::time::sleep(request.timeout).await;
                    Ok(BackendOutput::timed_out(
                        String::new(),
                        String::new(),
                        request.timeout,
                    ))
                } else {
                    tokio::time::sleep(delay).await;
                    Ok(output)
                }
            }
        }
    }

    async fn terminate(&self, id: &SandboxId) -> Result<()> {
        self.terminated.lock().push(id.clone());
        Ok(())
    }

    async fn suspend(&self, _id: &SandboxId) -> Result<()> {
        Ok(())
    }

    async fn resume(&self, _id: &SandboxId) -> Result<()> {
        Ok(())
    }

    async fn destroy(&self, id: &SandboxId) -> Result<()> {
        self.live.lock().remove(id);
        Ok(())
    }

    async fn is_available(&self) -> bool {
        !self.unavailable
    }
}

// =============================================================================
// Tests
// =============================================================================
