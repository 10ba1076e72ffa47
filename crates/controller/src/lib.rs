//! Workflow controller for Sandflow.
//!
//! This crate turns a [`WorkflowDefinition`](sandflow_core::WorkflowDefinition)
//! into a run: it validates the stage graph, evaluates stage conditions,
//! dispatches stages to registered agents, routes their commands through the
//! sandbox manager, and keeps the run within budget.
//!
//! ```text
//! WorkflowLoader ──► ExecutionPlan ──► WorkflowEngine ──► Agent
//!                                          │               │ Execute
//!                                          ▼               ▼
//!                                     CostTracker    SandboxManager
//!                                          │
//!                                          ▼
//!                                       RunStore
//! ```

pub mod agents;
pub mod condition;
pub mod dag;
pub mod engine;
pub mod loader;
pub mod persistence;

pub use agents::ShellAgent;
pub use condition::{ComparisonOperator, Expression};
pub use dag::ExecutionPlan;
pub use engine::{AgentRegistry, EngineConfig, WorkflowEngine};
pub use loader::WorkflowLoader;
pub use persistence::{FileRunStore, InMemoryRunStore};
