//! Sandflow - Sandboxed Workflow Execution Engine
//!
//! Runs a YAML workflow: every stage is handled by an agent, every command an
//! agent issues runs inside a sandbox, privileged operations go through the
//! permission broker, and spend is held to the configured budget.
//!
//! ```text
//! sandflow <workflow.yaml> [project-id]
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use sandflow_controller::{
    AgentRegistry, EngineConfig, FileRunStore, InMemoryRunStore, ShellAgent, WorkflowEngine,
    WorkflowLoader,
};
use sandflow_core::config::AppConfig;
use sandflow_core::{BroadcastEventEmitter, EventEmitter, PermissionGate, RunStore, SandboxType};
use sandflow_governance::{
    AuditStore, AutoApproveDecider, BudgetPolicy, CostTracker, FileAuditStore, InMemoryAuditStore,
    PermissionBroker, RateTable, StaticPolicyDecider,
};
use sandflow_sandbox::{DockerSandbox, SandboxEngine, SandboxManager, SandboxManagerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let workflow_path = args
        .next()
        .context("usage: sandflow <workflow.yaml> [project-id]")?;
    let project_id = args.next().unwrap_or_else(|| "default".to_string());

    let config = AppConfig::load().context("failed to load configuration")?;
    sandflow_governance::configure_tracing(&config.logging)?;
    tracing::info!("Starting Sandflow v{}", env!("CARGO_PKG_VERSION"));

    let metrics_handle = sandflow_governance::setup_metrics_recorder()?;
    let events = Arc::new(BroadcastEventEmitter::new(1024));
    let event_sink: Arc<dyn EventEmitter> = events.clone();
    let shutdown = CancellationToken::new();

    // =========================================================================
    // Permission Broker
    // =========================================================================
    let audit: Arc<dyn AuditStore> = match &config.permissions.audit_log {
        Some(path) => {
            tracing::info!(path = %path, "Writing permission audit log");
            Arc::new(FileAuditStore::new(path))
        }
        None => Arc::new(InMemoryAuditStore::new()),
    };
    let broker = Arc::new(
        PermissionBroker::new()
            .with_audit(audit)
            .with_events(event_sink.clone()),
    );
    if config.permissions.auto_approve {
        broker.serve(Arc::new(AutoApproveDecider))?;
    } else {
        broker.serve(Arc::new(StaticPolicyDecider::from_settings(&config.permissions)?))?;
    }
    let sweeper = broker.clone().spawn_grant_sweeper(
        Duration::from_secs(config.permissions.grant_sweep_interval_secs.max(1)),
        shutdown.clone(),
    );

    // =========================================================================
    // Sandbox Manager
    // =========================================================================
    let gate: Arc<dyn PermissionGate> = broker.clone();
    let mut manager = SandboxManager::new(
        gate,
        SandboxManagerConfig::from_settings(&config.sandbox, &config.permissions),
    )?
    .with_events(event_sink.clone());

    #[cfg(unix)]
    {
        let process = Arc::new(sandflow_sandbox::ProcessSandbox::new());
        manager = manager
            .with_backend(SandboxType::Process, process.clone())
            .with_backend(SandboxType::VirtualFilesystem, process);
    }
    if config.sandbox.docker_enabled {
        match DockerSandbox::new() {
            Ok(docker) if docker.is_available().await => {
                tracing::info!("Docker sandbox backend available");
                manager = manager.with_backend(SandboxType::Container, Arc::new(docker));
            }
            Ok(_) => tracing::warn!("Docker daemon not reachable, container sandboxes disabled"),
            Err(e) => tracing::warn!(error = %e, "Docker not available, container sandboxes disabled"),
        }
    }
    let sandboxes = Arc::new(manager);
    let cleanup = sandboxes.clone().spawn_cleanup_task(
        Duration::from_secs(config.sandbox.cleanup_interval_secs.max(1)),
        shutdown.clone(),
    );

    // =========================================================================
    // Cost Tracker & Workflow Engine
    // =========================================================================
    let costs = Arc::new(
        CostTracker::new(
            RateTable::from_rates(config.cost.rates.clone()),
            config.cost.limits.clone(),
        )
        .with_events(event_sink.clone()),
    );
    let policy = BudgetPolicy::from_rules(&config.cost.policy, config.cost.preflight_action);

    let store: Arc<dyn RunStore> = match &config.workflow.run_store_dir {
        Some(dir) => Arc::new(FileRunStore::new(dir)),
        None => Arc::new(InMemoryRunStore::new()),
    };

    let agents = AgentRegistry::new().with(Arc::new(ShellAgent::new()));
    let engine = Arc::new(
        WorkflowEngine::new(
            agents,
            sandboxes.clone(),
            costs.clone(),
            EngineConfig::from_settings(&config.workflow, &config.sandbox),
        )
        .with_policy(policy)
        .with_store(store)
        .with_events(event_sink),
    );

    // Log every state change at debug level.
    let mut rx = events.subscribe();
    let event_log = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            tracing::debug!(
                event_type = ?event.event_type,
                severity = ?event.severity,
                payload = %event.payload,
                "Event"
            );
        }
    });

    // =========================================================================
    // Run
    // =========================================================================
    let workflow = WorkflowLoader::from_file(&workflow_path).await?;
    let run_task = {
        let engine = engine.clone();
        let project_id = project_id.clone();
        tokio::spawn(async move { engine.execute_workflow(&project_id, workflow).await })
    };
    tokio::pin!(run_task);

    let run = tokio::select! {
        joined = &mut run_task => joined??,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, cancelling run");
            if let Some(run) = engine.get_project_state(&project_id).await? {
                if !run.status.is_terminal() {
                    engine.cancel_workflow(&run.id).await?;
                }
            }
            run_task.await??
        }
    };

    for stage in &run.stages {
        println!(
            "{:<24} {:<10} {}",
            stage.stage_name,
            stage.status,
            stage.error.as_deref().unwrap_or("")
        );
    }
    println!(
        "run {} {} ({}) cost {}",
        run.id,
        run.status,
        run.status_reason.as_deref().unwrap_or("ok"),
        run.cost.total_cost
    );

    let summary = costs.get_cost_summary(&project_id);
    tracing::info!(
        project_id = %project_id,
        today = %summary.today,
        month = %summary.month,
        total = %summary.total,
        "Cost summary"
    );
    tracing::debug!(metrics = %metrics_handle.render(), "Final metrics");

    shutdown.cancel();
    let _ = tokio::join!(sweeper, cleanup);
    event_log.abort();

    if run.status.is_terminal() && run.status != sandflow_core::ProjectStatus::Completed {
        std::process::exit(1);
    }
    Ok(())
}
