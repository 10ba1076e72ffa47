//! Sandbox layer for Sandflow.
//!
//! Every command an agent runs goes through the [`SandboxManager`], which
//! owns sandbox lifecycles, asks the permission gate about privileged
//! operations, and hands the command to the backend serving the sandbox.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────┐
//! │  Workflow Engine / agents              │
//! │    ↓ execute(id, command)              │
//! ├────────────────────────────────────────┤
//! │  SandboxManager                        │
//! │    classify → PermissionGate → exec    │
//! ├────────────────────────────────────────┤
//! │  SandboxEngine                         │
//! │    DockerSandbox  (Container, bollard) │
//! │    ProcessSandbox (Process, VirtualFS) │
//! │    MockSandbox    (tests)              │
//! └────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use sandflow_sandbox::{DockerSandbox, SandboxManager, SandboxManagerConfig};
//!
//! let manager = SandboxManager::new(broker.clone(), SandboxManagerConfig::default())?
//!     .with_backend(SandboxType::Container, Arc::new(DockerSandbox::new()?));
//! let env = manager.create(SandboxConfiguration::default()).await?;
//! manager.start(&env.id).await?;
//! let result = manager.execute(&env.id, "cargo test", Duration::from_secs(300)).await?;
//! ```

pub mod classifier;
pub mod docker;
pub mod engine;
pub mod manager;
#[cfg(unix)]
pub mod process;

pub use classifier::OperationClassifier;
pub use docker::DockerSandbox;
pub use engine::{BackendOutput, ExecRequest, MockSandbox, MockStep, SandboxEngine};
pub use manager::{ExecSpec, SandboxManager, SandboxManagerConfig};
#[cfg(unix)]
pub use process::ProcessSandbox;
