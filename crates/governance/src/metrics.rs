//! Metrics implementation using Prometheus.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use sandflow_core::{Error, PermissionStatus, PermissionType, Result};
use std::time::Duration;

/// Initialize Prometheus recorder and return the handle.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle> {
    let builder = PrometheusBuilder::new();

    let handle = builder
        .install_recorder()
        .map_err(|e| Error::internal(format!("Failed to install Prometheus recorder: {}", e)))?;

    tracing::info!("Prometheus metrics recorder initialized");
    Ok(handle)
}

/// Count a permission decision and record how long it took.
pub fn track_permission_decision(
    permission_type: PermissionType,
    status: PermissionStatus,
    elapsed: Duration,
) {
    let status = match status {
        PermissionStatus::Pending => "pending",
        PermissionStatus::Approved => "approved",
        PermissionStatus::Denied => "denied",
        PermissionStatus::Expired => "expired",
    };
    metrics::counter!(
        "sandflow_permission_decisions_total",
        "type" => permission_type.as_str(),
        "status" => status
    )
    .increment(1);

    metrics::histogram!(
        "sandflow_permission_decision_seconds",
        "type" => permission_type.as_str()
    )
    .record(elapsed.as_secs_f64());
}

/// Helper to track token usage.
pub fn track_tokens(provider: &str, model: &str, input: u64, output: u64) {
    let model = format!("{}:{}", provider, model);
    metrics::counter!("sandflow_token_usage_total", "model" => model.clone(), "type" => "input").increment(input);
    metrics::counter!("sandflow_token_usage_total", "model" => model, "type" => "output").increment(output);
}

/// Count a stage reaching a terminal status.
pub fn track_stage(agent_type: &str, status: &'static str) {
    metrics::counter!(
        "sandflow_stages_total",
        "agent_type" => agent_type.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Count a budget alert.
pub fn track_budget_alert(scope: &'static str, severity: &'static str) {
    metrics::counter!("sandflow_budget_alerts_total", "scope" => scope, "severity" => severity)
        .increment(1);
}
