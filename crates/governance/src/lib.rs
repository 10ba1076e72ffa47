//! Governance layer for Sandflow.
//!
//! This crate provides:
//! - Permission broker gating privileged sandbox operations
//! - Cost tracking, rate tables and budget policy
//! - Audit logging of permission decisions
//! - Tracing and Prometheus metrics setup

pub mod audit;
pub mod budget;
pub mod cost;
pub mod metrics;
pub mod permission;
pub mod pricing;
pub mod tracing_layer;

pub use audit::{AuditEntry, AuditFilter, AuditOutcome, AuditStore, FileAuditStore, InMemoryAuditStore};
pub use budget::BudgetPolicy;
pub use cost::{BudgetVerdict, Clock, CostTracker, ManualClock, SystemClock};
pub use metrics::{setup_metrics_recorder, track_stage, track_tokens};
pub use permission::{
    AutoApproveDecider, PendingDecision, PermissionBroker, PermissionDecider, PermissionDecisions,
    StaticPolicyDecider,
};
pub use pricing::RateTable;
pub use tracing_layer::configure_tracing;
