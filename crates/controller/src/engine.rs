//! Workflow engine: drives a project's stage graph through agents and the
//! sandbox, under permission and budget control.

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use sandflow_core::config::{SandboxSettings, WorkflowSettings};
use sandflow_core::{
    Agent, AgentRequest, BudgetAction, Error, EventEmitter, EventEnvelope, EventSeverity,
    EventType, NoOpEventEmitter, ProjectRun, ProjectStatus, Result, RunCost, RunStore,
    SandboxConfiguration, SandboxId, SecurityViolation, StageStatePayload, StageStatus,
    ToolInvocation, WorkflowDefinition, WorkflowStage, WorkflowStatePayload,
};
use sandflow_governance::{track_stage, BudgetPolicy, CostTracker};
use sandflow_sandbox::{ExecSpec, SandboxManager};

use crate::condition::Expression;
use crate::dag::ExecutionPlan;
use crate::persistence::InMemoryRunStore;

const ACTOR: &str = "workflow-engine";

// =============================================================================
// Configuration
// =============================================================================

/// Engine-wide defaults; workflows and stages may override some of them.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on stages running at once within a wave.
    pub max_concurrent_agents: usize,
    pub stage_timeout: Duration,
    /// Timeout for an `Execute` call that does not carry its own.
    pub command_timeout: Duration,
    /// Pre-flight estimate for stages without one.
    pub default_stage_estimate: Decimal,
    /// Sandbox created for each run.
    pub sandbox: SandboxConfiguration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_settings(&WorkflowSettings::default(), &SandboxSettings::default())
    }
}

impl EngineConfig {
    pub fn from_settings(workflow: &WorkflowSettings, sandbox: &SandboxSettings) -> Self {
        Self {
            max_concurrent_agents: workflow.max_concurrent_agents.max(1),
            stage_timeout: Duration::from_secs(workflow.stage_timeout_secs),
            command_timeout: Duration::from_secs(workflow.command_timeout_secs),
            default_stage_estimate: workflow.default_stage_estimate,
            sandbox: sandbox.template.clone(),
        }
    }
}

/// Agents keyed by the `agent_type` they serve.
#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent, replacing any previous one for the same type.
    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        self.agents.insert(agent.agent_type().to_string(), agent);
    }

    pub fn with(mut self, agent: Arc<dyn Agent>) -> Self {
        self.register(agent);
        self
    }

    pub fn get(&self, agent_type: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(agent_type).cloned()
    }

    pub fn contains(&self, agent_type: &str) -> bool {
        self.agents.contains_key(agent_type)
    }
}

// =============================================================================
// Run bookkeeping
// =============================================================================

struct RunSlot {
    run: Mutex<ProjectRun>,
    pause_requested: AtomicBool,
    /// Set while a drive loop owns the run.
    driving: AtomicBool,
    cancel: CancellationToken,
}

impl RunSlot {
    fn new(run: ProjectRun) -> Self {
        Self {
            run: Mutex::new(run),
            pause_requested: AtomicBool::new(false),
            driving: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    fn snapshot(&self) -> ProjectRun {
        self.run.lock().clone()
    }
}

/// What one stage produced.
struct StageOutcome {
    status: StageStatus,
    agent_id: Option<String>,
    output: HashMap<String, Value>,
    error: Option<String>,
    violations: Vec<SecurityViolation>,
}

impl StageOutcome {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Failed,
            agent_id: None,
            output: HashMap::new(),
            error: Some(error.into()),
            violations: Vec::new(),
        }
    }
}

// =============================================================================
// Workflow Engine
// =============================================================================

/// Executes workflows stage by stage.
///
/// Each run gets one sandbox for its lifetime. Stages run in a stable
/// topological order, one at a time unless the workflow allows parallel
/// waves. A stage whose non-optional dependency failed is skipped with the
/// dependency's error; budget verdicts map to continue/pause/fail through the
/// [`BudgetPolicy`].
pub struct WorkflowEngine {
    agents: AgentRegistry,
    sandboxes: Arc<SandboxManager>,
    costs: Arc<CostTracker>,
    policy: BudgetPolicy,
    store: Arc<dyn RunStore>,
    events: Arc<dyn EventEmitter>,
    config: EngineConfig,
    runs: DashMap<String, Arc<RunSlot>>,
}

impl WorkflowEngine {
    pub fn new(
        agents: AgentRegistry,
        sandboxes: Arc<SandboxManager>,
        costs: Arc<CostTracker>,
        config: EngineConfig,
    ) -> Self {
        Self {
            agents,
            sandboxes,
            costs,
            policy: BudgetPolicy::default(),
            store: Arc::new(InMemoryRunStore::new()),
            events: Arc::new(NoOpEventEmitter),
            config,
            runs: DashMap::new(),
        }
    }

    pub fn with_policy(mut self, policy: BudgetPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventEmitter>) -> Self {
        self.events = events;
        self
    }

    // =========================================================================
    // Public operations
    // =========================================================================

    /// Validate `workflow`, then run it to completion, pause, or failure.
    ///
    /// Malformed graphs and unknown agent types fail before any sandbox is
    /// created. Stage failures are recorded in the returned run, not as `Err`.
    pub async fn execute_workflow(
        &self,
        project_id: &str,
        workflow: WorkflowDefinition,
    ) -> Result<ProjectRun> {
        let plan = ExecutionPlan::build(&workflow)?;
        for stage in &workflow.stages {
            if !self.agents.contains(&stage.agent_type) {
                return Err(Error::AgentNotFound(stage.agent_type.clone()));
            }
        }

        let run = ProjectRun::new(project_id, workflow);
        let run_id = run.id.clone();
        tracing::info!(
            project_id = %project_id,
            run_id = %run_id,
            workflow = %run.workflow.name,
            stages = plan.len(),
            parallel = run.workflow.allow_parallel,
            "Starting workflow run"
        );
        let slot = Arc::new(RunSlot::new(run));
        self.runs.insert(run_id, slot.clone());
        self.drive_run(&slot, &plan).await
    }

    /// Ask a running workflow to pause at the next stage boundary.
    pub fn pause_workflow(&self, run_id: &str) -> Result<()> {
        let slot = self.slot(run_id)?;
        let status = slot.run.lock().status;
        match status {
            ProjectStatus::Pending | ProjectStatus::Running => {
                slot.pause_requested.store(true, Ordering::SeqCst);
                tracing::info!(run_id = %run_id, "Pause requested");
                Ok(())
            }
            other => Err(invalid_state(run_id, other, "pause")),
        }
    }

    /// Continue a paused run from its first non-terminal stage.
    pub async fn resume_workflow(&self, run_id: &str) -> Result<ProjectRun> {
        let slot = self.slot(run_id)?;
        let (status, workflow) = {
            let mut run = slot.run.lock();
            if run.status == ProjectStatus::Paused {
                // A stage left Running by a crash starts over.
                for stage in run.stages.iter_mut().filter(|s| s.status == StageStatus::Running) {
                    stage.status = StageStatus::Pending;
                    stage.started_at = None;
                }
            }
            (run.status, run.workflow.clone())
        };
        if status != ProjectStatus::Paused {
            return Err(invalid_state(run_id, status, "resume"));
        }
        let plan = ExecutionPlan::build(&workflow)?;
        slot.pause_requested.store(false, Ordering::SeqCst);
        tracing::info!(run_id = %run_id, "Resuming workflow run");
        self.drive_run(&slot, &plan).await
    }

    /// Resume a paused run, loading it from the run store if this engine
    /// does not hold it (e.g. after a restart).
    pub async fn resume_stored(&self, project_id: &str, run_id: &str) -> Result<ProjectRun> {
        if !self.runs.contains_key(run_id) {
            let run = self
                .store
                .load_run(project_id, run_id)
                .await?
                .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
            self.runs
                .entry(run_id.to_string())
                .or_insert_with(|| Arc::new(RunSlot::new(run)));
        }
        self.resume_workflow(run_id).await
    }

    /// Cancel a run. In-flight stages are asked to stop; their sandbox
    /// commands are terminated and, failing that, the sandbox is destroyed.
    pub async fn cancel_workflow(&self, run_id: &str) -> Result<()> {
        let slot = self.slot(run_id)?;
        let status = slot.run.lock().status;
        if status.is_terminal() {
            return Err(invalid_state(run_id, status, "cancel"));
        }
        slot.cancel.cancel();
        tracing::info!(run_id = %run_id, "Cancellation requested");

        if !slot.driving.load(Ordering::SeqCst) {
            self.finish_cancelled(&slot).await;
            self.persist(&slot).await?;
        }
        Ok(())
    }

    /// Snapshot of a run held by this engine.
    pub fn get_run(&self, run_id: &str) -> Option<ProjectRun> {
        self.runs.get(run_id).map(|slot| slot.snapshot())
    }

    /// Latest run of a project.
    pub async fn get_project_state(&self, project_id: &str) -> Result<Option<ProjectRun>> {
        Ok(self.list_runs(project_id).await?.pop())
    }

    /// Every run of a project, oldest first.
    pub async fn list_runs(&self, project_id: &str) -> Result<Vec<ProjectRun>> {
        let mut runs = self.store.load(project_id).await?;
        for slot in self.runs.iter() {
            let live = slot.snapshot();
            if live.project_id != project_id {
                continue;
            }
            match runs.iter_mut().find(|r| r.id == live.id) {
                Some(stored) => *stored = live,
                None => runs.push(live),
            }
        }
        runs.sort_by_key(|r| r.started_at);
        Ok(runs)
    }

    // =========================================================================
    // Drive loop
    // =========================================================================

    async fn drive_run(&self, slot: &Arc<RunSlot>, plan: &ExecutionPlan) -> Result<ProjectRun> {
        if slot
            .driving
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let run = slot.run.lock();
            return Err(invalid_state(&run.id, run.status, "drive"));
        }

        self.set_status(slot, ProjectStatus::Running, None).await;

        let sandbox_id = match self.provision_sandbox().await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(run_id = %slot.run.lock().id, error = %e, "Could not provision run sandbox");
                self.set_status(
                    slot,
                    ProjectStatus::Failed,
                    Some(format!("sandbox unavailable: {}", e)),
                )
                .await;
                slot.driving.store(false, Ordering::SeqCst);
                self.persist(slot).await?;
                return Err(e);
            }
        };
        slot.run.lock().sandbox_id = Some(sandbox_id.clone());

        self.drive(slot, plan, &sandbox_id).await;

        if let Err(e) = self.sandboxes.destroy(&sandbox_id).await {
            tracing::warn!(sandbox_id = %sandbox_id, error = %e, "Failed to destroy run sandbox");
        }

        let (project_id, run_id, status) = {
            let run = slot.run.lock();
            (run.project_id.clone(), run.id.clone(), run.status)
        };
        if status.is_terminal() {
            self.costs.complete_run(&project_id, &run_id);
        }
        slot.driving.store(false, Ordering::SeqCst);
        self.persist(slot).await?;

        let run = slot.snapshot();
        tracing::info!(
            run_id = %run.id,
            status = %run.status,
            reason = run.status_reason.as_deref().unwrap_or(""),
            cost = %run.cost.total_cost,
            "Workflow run finished driving"
        );
        Ok(run)
    }

    async fn provision_sandbox(&self) -> Result<SandboxId> {
        let env = self.sandboxes.create(self.config.sandbox.clone()).await?;
        if let Err(e) = self.sandboxes.start(&env.id).await {
            if let Err(destroy_err) = self.sandboxes.destroy(&env.id).await {
                tracing::warn!(
                    sandbox_id = %env.id,
                    error = %destroy_err,
                    "Failed to destroy sandbox after start failure"
                );
            }
            return Err(e);
        }
        Ok(env.id)
    }

    async fn drive(&self, slot: &Arc<RunSlot>, plan: &ExecutionPlan, sandbox_id: &SandboxId) {
        loop {
            if slot.cancel.is_cancelled() {
                self.finish_cancelled(slot).await;
                return;
            }
            if slot.pause_requested.swap(false, Ordering::SeqCst) {
                self.set_status(slot, ProjectStatus::Paused, Some("paused by operator".into()))
                    .await;
                return;
            }

            let (statuses, workflow, context) = {
                let run = slot.run.lock();
                let statuses: Vec<StageStatus> = run.stages.iter().map(|s| s.status).collect();
                (statuses, run.workflow.clone(), run.context.clone())
            };
            let ready = plan.ready(&statuses);
            let Some(&first) = ready.first() else {
                break;
            };
            let wave = if workflow.allow_parallel { ready } else { vec![first] };

            // Dependency policy and conditions.
            let mut runnable = Vec::new();
            for idx in wave {
                let stage = &workflow.stages[idx];
                if let Some(reason) = self.blocking_dependency(slot, plan, &workflow, idx) {
                    self.finish_stage(slot, idx, StageStatus::Skipped, Some(reason)).await;
                    continue;
                }
                if let Some(condition) = &stage.condition {
                    match Expression::parse(condition.expression())
                        .and_then(|expr| expr.evaluate(&context))
                    {
                        Ok(value) if condition.admits(value) => {}
                        Ok(_) => {
                            self.finish_stage(
                                slot,
                                idx,
                                StageStatus::Skipped,
                                Some(format!("condition not met: {}", condition.expression())),
                            )
                            .await;
                            continue;
                        }
                        Err(e) => {
                            self.finish_stage(slot, idx, StageStatus::Failed, Some(e.to_string()))
                                .await;
                            continue;
                        }
                    }
                }
                runnable.push(idx);
            }
            if runnable.is_empty() {
                continue;
            }

            // Pre-flight budget check; a rejected stage stays Pending.
            let (project_id, run_id) = {
                let run = slot.run.lock();
                (run.project_id.clone(), run.id.clone())
            };
            // Estimates accumulate across the wave; its stages run at once.
            let mut committed = Decimal::ZERO;
            for &idx in &runnable {
                let stage = &workflow.stages[idx];
                let estimate = stage
                    .estimated_cost
                    .unwrap_or(self.config.default_stage_estimate);
                if self
                    .costs
                    .check_budget_for_run(&project_id, &run_id, committed + estimate)
                {
                    committed += estimate;
                    continue;
                }
                let reason = format!(
                    "budget pre-flight rejected stage '{}' (estimate {})",
                    stage.name, estimate
                );
                match self.policy.preflight_action() {
                    BudgetAction::Continue => {
                        tracing::warn!(run_id = %run_id, stage = %stage.name, "{}", reason);
                    }
                    BudgetAction::Pause => {
                        self.set_status(slot, ProjectStatus::Paused, Some(reason)).await;
                        return;
                    }
                    BudgetAction::Fail => {
                        self.set_status(slot, ProjectStatus::Failed, Some(reason)).await;
                        return;
                    }
                }
            }

            let limit = workflow
                .max_concurrent_agents
                .unwrap_or(self.config.max_concurrent_agents)
                .max(1);
            let semaphore = Semaphore::new(limit);
            join_all(runnable.iter().map(|&idx| {
                let semaphore = &semaphore;
                let stage = &workflow.stages[idx];
                async move {
                    let _permit = semaphore.acquire().await.ok();
                    self.run_stage(slot, idx, stage, sandbox_id).await;
                }
            }))
            .await;

            if let Err(e) = self.persist(slot).await {
                tracing::warn!(run_id = %run_id, error = %e, "Failed to persist run progress");
            }

            // Post-stage budget evaluation.
            let limits = self.costs.limits_for(&project_id);
            let verdict = self.costs.evaluate_budget(&project_id, &run_id, &limits).await;
            let reason = verdict.worst().map(|a| a.message.clone());
            match self.policy.decide(&verdict) {
                BudgetAction::Continue => {}
                BudgetAction::Pause => {
                    self.set_status(slot, ProjectStatus::Paused, reason).await;
                    return;
                }
                BudgetAction::Fail => {
                    self.set_status(slot, ProjectStatus::Failed, reason).await;
                    return;
                }
            }
        }

        // Every stage is terminal.
        let failure = {
            let run = slot.run.lock();
            run.stages
                .iter()
                .zip(run.workflow.stages.iter())
                .find(|(result, stage)| result.status == StageStatus::Failed && !stage.optional)
                .map(|(result, _)| {
                    format!(
                        "stage '{}' failed: {}",
                        result.stage_name,
                        result.error.as_deref().unwrap_or("unknown error")
                    )
                })
        };
        match failure {
            Some(reason) => self.set_status(slot, ProjectStatus::Failed, Some(reason)).await,
            None => self.set_status(slot, ProjectStatus::Completed, None).await,
        }
    }

    /// Error of the first failed non-optional dependency of `idx`.
    fn blocking_dependency(
        &self,
        slot: &RunSlot,
        plan: &ExecutionPlan,
        workflow: &WorkflowDefinition,
        idx: usize,
    ) -> Option<String> {
        let run = slot.run.lock();
        plan.dependencies(idx).iter().find_map(|&dep| {
            let result = &run.stages[dep];
            (result.status == StageStatus::Failed && !workflow.stages[dep].optional).then(|| {
                format!(
                    "dependency '{}' failed: {}",
                    result.stage_name,
                    result.error.as_deref().unwrap_or("unknown error")
                )
            })
        })
    }

    // =========================================================================
    // Stage execution
    // =========================================================================

    async fn run_stage(
        &self,
        slot: &RunSlot,
        idx: usize,
        stage: &WorkflowStage,
        sandbox_id: &SandboxId,
    ) {
        let request = {
            let mut run = slot.run.lock();
            let request = AgentRequest {
                project_id: run.project_id.clone(),
                run_id: run.id.clone(),
                stage_name: stage.name.clone(),
                parameters: stage.parameters.clone(),
                context: run.context.clone(),
                sandbox_id: Some(sandbox_id.clone()),
            };
            let result = &mut run.stages[idx];
            result.status = StageStatus::Running;
            result.started_at = Some(Utc::now());
            request
        };
        self.emit_stage(slot, idx, StageStatus::Pending).await;
        tracing::info!(run_id = %request.run_id, stage = %stage.name, agent_type = %stage.agent_type, "Stage started");

        let timeout = stage
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.stage_timeout);
        let stage_cancel = slot.cancel.child_token();
        let timer = {
            let token = stage_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                token.cancel();
            })
        };

        let mut outcome = self
            .invoke_agent(stage, request, sandbox_id, &stage_cancel)
            .await;
        timer.abort();

        if outcome.status == StageStatus::Failed && stage_cancel.is_cancelled() {
            let cause = if slot.cancel.is_cancelled() {
                "stage cancelled".to_string()
            } else {
                format!("stage timed out after {}s", timeout.as_secs())
            };
            outcome.error = Some(match outcome.error.take() {
                Some(e) => format!("{}: {}", cause, e),
                None => cause,
            });
        }

        self.apply_outcome(slot, idx, stage, outcome).await;
    }

    async fn invoke_agent(
        &self,
        stage: &WorkflowStage,
        request: AgentRequest,
        sandbox_id: &SandboxId,
        cancel: &CancellationToken,
    ) -> StageOutcome {
        let Some(agent) = self.agents.get(&stage.agent_type) else {
            return StageOutcome::failed(format!("no agent registered for '{}'", stage.agent_type));
        };
        let project_id = request.project_id.clone();
        let run_id = request.run_id.clone();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return StageOutcome::failed("agent interrupted"),
            response = agent.execute(request) => response,
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(run_id = %run_id, stage = %stage.name, error = %e, "Agent failed");
                return StageOutcome::failed(e.to_string());
            }
        };

        let mut outcome = StageOutcome {
            status: StageStatus::Completed,
            agent_id: Some(response.agent_id.clone()),
            output: response.outputs.clone(),
            error: None,
            violations: Vec::new(),
        };
        outcome
            .output
            .insert("output".into(), Value::String(response.output.clone()));

        // Tokens were spent whatever happens next, so price them first.
        let mut cost = RunCost::new(&run_id);
        for usage in &response.usage {
            match self.costs.calculate_cost(
                &usage.provider,
                &usage.model,
                usage.input_tokens,
                usage.output_tokens,
            ) {
                Ok(priced) => cost.merge(&priced),
                Err(e) => {
                    outcome.status = StageStatus::Failed;
                    outcome.error.get_or_insert_with(|| e.to_string());
                }
            }
        }
        if !cost.is_zero() {
            self.costs.record_cost(&project_id, &run_id, &cost);
            outcome
                .output
                .insert("cost".into(), Value::String(cost.total_cost.to_string()));
        }
        if outcome.status == StageStatus::Failed {
            return outcome;
        }

        let mut commands = Vec::new();
        for invocation in response.tool_invocations {
            match invocation {
                ToolInvocation::Execute {
                    command,
                    timeout_secs,
                    declared,
                } => {
                    let timeout = timeout_secs
                        .map(Duration::from_secs)
                        .unwrap_or(self.config.command_timeout);
                    let mut spec = ExecSpec::new(command.clone(), timeout);
                    spec.declared = declared;

                    let result = match self
                        .sandboxes
                        .execute_with(sandbox_id, spec, cancel.child_token())
                        .await
                    {
                        Ok(result) => result,
                        Err(e) => {
                            outcome.status = StageStatus::Failed;
                            outcome.error = Some(format!("command '{}' could not run: {}", command, e));
                            break;
                        }
                    };
                    commands.push(json!({
                        "command": command,
                        "exit_code": result.exit_code,
                        "success": result.success,
                        "stdout": result.stdout,
                        "stderr": result.stderr,
                        "duration_ms": result.duration_ms,
                    }));
                    outcome.output.insert("stdout".into(), Value::String(result.stdout.clone()));
                    outcome.output.insert("exit_code".into(), json!(result.exit_code));
                    outcome.violations.extend(result.violations.iter().cloned());

                    if let Some(reason) = result.failure_reason() {
                        outcome.status = StageStatus::Failed;
                        outcome.error = Some(format!("command '{}' failed: {}", command, reason));
                        break;
                    }
                }
                ToolInvocation::Other { name, .. } => {
                    tracing::debug!(stage = %stage.name, tool = %name, "Ignoring non-sandbox tool invocation");
                }
            }
        }
        if !commands.is_empty() {
            outcome.output.insert("commands".into(), Value::Array(commands));
        }
        outcome
    }

    async fn apply_outcome(
        &self,
        slot: &RunSlot,
        idx: usize,
        stage: &WorkflowStage,
        outcome: StageOutcome,
    ) {
        {
            let mut run = slot.run.lock();
            let run_id = run.id.clone();
            let cost = self.costs.get_run_cost(&run.project_id, &run_id);
            if let Some(cost) = cost {
                run.cost = cost;
            }

            let result = &mut run.stages[idx];
            if let Some(agent_id) = &outcome.agent_id {
                if let Err(e) = result.assign_agent(agent_id.clone()) {
                    tracing::warn!(run_id = %run_id, error = %e, "Agent id already assigned");
                }
            }
            result.status = outcome.status;
            result.output = outcome.output;
            result.error = outcome.error;
            result.violations = outcome.violations;
            result.completed_at = Some(Utc::now());

            let context_entry = stage_context(result.status, result.error.as_deref(), &result.output);
            run.context.insert(stage.name.clone(), context_entry);
        }
        track_stage(&stage.agent_type, outcome.status.as_str());
        self.emit_stage(slot, idx, StageStatus::Running).await;

        let run = slot.run.lock();
        let result = &run.stages[idx];
        match result.status {
            StageStatus::Completed => {
                tracing::info!(run_id = %run.id, stage = %result.stage_name, "Stage completed")
            }
            _ => tracing::warn!(
                run_id = %run.id,
                stage = %result.stage_name,
                error = result.error.as_deref().unwrap_or(""),
                violations = result.violations.len(),
                "Stage failed"
            ),
        }
    }

    /// Move a stage that never ran straight to a terminal status.
    async fn finish_stage(
        &self,
        slot: &RunSlot,
        idx: usize,
        status: StageStatus,
        error: Option<String>,
    ) {
        {
            let mut run = slot.run.lock();
            let result = &mut run.stages[idx];
            result.status = status;
            result.error = error.clone();
            result.completed_at = Some(Utc::now());
            let name = result.stage_name.clone();
            let entry = stage_context(status, error.as_deref(), &HashMap::new());
            tracing::info!(run_id = %run.id, stage = %name, status = %status, reason = error.as_deref().unwrap_or(""), "Stage not executed");
            run.context.insert(name, entry);
        }
        self.emit_stage(slot, idx, StageStatus::Pending).await;
    }

    async fn finish_cancelled(&self, slot: &RunSlot) {
        let pending: Vec<usize> = {
            let run = slot.run.lock();
            run.stages
                .iter()
                .enumerate()
                .filter(|(_, s)| s.status == StageStatus::Pending)
                .map(|(i, _)| i)
                .collect()
        };
        for idx in pending {
            self.finish_stage(slot, idx, StageStatus::Skipped, Some("run cancelled".into()))
                .await;
        }
        self.set_status(slot, ProjectStatus::Cancelled, Some("cancelled by operator".into()))
            .await;
        let (project_id, run_id) = {
            let run = slot.run.lock();
            (run.project_id.clone(), run.id.clone())
        };
        self.costs.complete_run(&project_id, &run_id);
    }

    // =========================================================================
    // State helpers
    // =========================================================================

    fn slot(&self, run_id: &str) -> Result<Arc<RunSlot>> {
        self.runs
            .get(run_id)
            .map(|slot| slot.clone())
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))
    }

    async fn persist(&self, slot: &RunSlot) -> Result<()> {
        let run = slot.snapshot();
        self.store.save(&run).await
    }

    async fn set_status(&self, slot: &RunSlot, status: ProjectStatus, reason: Option<String>) {
        let payload = {
            let mut run = slot.run.lock();
            let previous = run.status;
            run.status = status;
            run.status_reason = reason.clone();
            if status.is_terminal() {
                run.completed_at = Some(Utc::now());
            }
            WorkflowStatePayload {
                project_id: run.project_id.clone(),
                run_id: run.id.clone(),
                workflow: run.workflow.name.clone(),
                previous,
                status,
                reason,
            }
        };

        let severity = match status {
            ProjectStatus::Failed => EventSeverity::Error,
            ProjectStatus::Paused | ProjectStatus::Cancelled => EventSeverity::Warning,
            _ => EventSeverity::Info,
        };
        tracing::info!(
            run_id = %payload.run_id,
            previous = %payload.previous,
            status = %status,
            reason = payload.reason.as_deref().unwrap_or(""),
            "Run status changed"
        );
        let event = EventEnvelope::from_payload(EventType::WorkflowStateChanged, &payload)
            .with_project(&payload.project_id)
            .with_run(&payload.run_id)
            .with_actor(ACTOR)
            .with_severity(severity);
        self.events.emit(event).await;
    }

    async fn emit_stage(&self, slot: &RunSlot, idx: usize, previous: StageStatus) {
        let payload = {
            let run = slot.run.lock();
            let result = &run.stages[idx];
            StageStatePayload {
                project_id: run.project_id.clone(),
                run_id: run.id.clone(),
                stage_name: result.stage_name.clone(),
                previous,
                status: result.status,
                agent_id: result.agent_id().map(str::to_string),
                output: result.output.clone(),
                error: result.error.clone(),
            }
        };
        let severity = if payload.status == StageStatus::Failed {
            EventSeverity::Error
        } else {
            EventSeverity::Info
        };
        let event = EventEnvelope::from_payload(EventType::StageStateChanged, &payload)
            .with_project(&payload.project_id)
            .with_run(&payload.run_id)
            .with_actor(ACTOR)
            .with_severity(severity);
        self.events.emit(event).await;
    }
}

/// Context entry describing a finished stage to later conditions.
fn stage_context(
    status: StageStatus,
    error: Option<&str>,
    output: &HashMap<String, Value>,
) -> Value {
    let mut entry = serde_json::Map::new();
    for (k, v) in output {
        entry.insert(k.clone(), v.clone());
    }
    entry.insert("status".into(), Value::String(status.as_str().into()));
    if let Some(error) = error {
        entry.insert("error".into(), Value::String(error.into()));
    }
    Value::Object(entry)
}

fn invalid_state(run_id: &str, status: ProjectStatus, operation: &str) -> Error {
    Error::InvalidRunState {
        run_id: run_id.to_string(),
        status: status.to_string(),
        operation: operation.to_string(),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use sandflow_core::{
        AgentResponse, BroadcastEventEmitter, BudgetLimits, ModelRate, SandboxStatus, SandboxType,
        TokenUsageRecord, WorkflowCondition,
    };
    use sandflow_governance::{AutoApproveDecider, PermissionBroker, RateTable};
    use sandflow_sandbox::{MockSandbox, SandboxManagerConfig};

    /// Agent that echoes its stage name and reports fixed usage.
    struct EchoAgent {
        agent_type: String,
        usage: Option<TokenUsageRecord>,
        delay: Duration,
        fail: bool,
        calls: Mutex<Vec<String>>,
    }

    impl EchoAgent {
        fn new(agent_type: &str) -> Self {
            Self {
                agent_type: agent_type.into(),
                usage: None,
                delay: Duration::ZERO,
                fail: false,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Agent for EchoAgent {
        fn agent_type(&self) -> &str {
            &self.agent_type
        }

        async fn execute(&self, request: AgentRequest) -> Result<AgentResponse> {
            self.calls.lock().push(request.stage_name.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(Error::agent("model refused"));
            }
            let mut response = AgentResponse::text(
                format!("{}-1", self.agent_type),
                format!("did {}", request.stage_name),
            )
            .with_output("verdict", json!("ok"));
            if let Some(usage) = &self.usage {
                response = response.with_usage(usage.clone());
            }
            Ok(response)
        }
    }

    struct Harness {
        engine: Arc<WorkflowEngine>,
        sandboxes: Arc<SandboxManager>,
        mock: Arc<MockSandbox>,
        costs: Arc<CostTracker>,
        events: Arc<BroadcastEventEmitter>,
    }

    fn harness(agents: Vec<Arc<dyn Agent>>, limits: BudgetLimits) -> Harness {
        let broker = Arc::new(PermissionBroker::new());
        broker.serve(Arc::new(AutoApproveDecider)).unwrap();
        let mock = Arc::new(MockSandbox::default());
        let sandboxes = Arc::new(
            SandboxManager::new(broker, SandboxManagerConfig::default())
                .unwrap()
                .with_backend(SandboxType::Container, mock.clone()),
        );
        let costs = Arc::new(CostTracker::new(
            RateTable::from_rates([ModelRate::new("openai", "gpt-4o", dec!(2.50), dec!(10))]),
            limits,
        ));
        let events = Arc::new(BroadcastEventEmitter::new(1024));
        let registry = agents
            .into_iter()
            .fold(AgentRegistry::new(), |registry, agent| registry.with(agent));
        let engine = Arc::new(
            WorkflowEngine::new(registry, sandboxes.clone(), costs.clone(), EngineConfig::default())
                .with_events(events.clone()),
        );
        Harness {
            engine,
            sandboxes,
            mock,
            costs,
            events,
        }
    }

    #[tokio::test]
    async fn test_sequential_run_completes_in_order() {
        let agent = Arc::new(EchoAgent::new("worker"));
        let h = harness(vec![agent.clone()], BudgetLimits::unlimited());
        let wf = WorkflowDefinition::new("pipeline")
            .stage(WorkflowStage::new("review", "worker").depends_on("implement"))
            .stage(WorkflowStage::new("implement", "worker").depends_on("plan"))
            .stage(WorkflowStage::new("plan", "worker"));

        let run = h.engine.execute_workflow("proj", wf).await.unwrap();
        assert_eq!(run.status, ProjectStatus::Completed);
        assert_eq!(*agent.calls.lock(), vec!["plan", "implement", "review"]);
        assert!(run.stages.iter().all(|s| s.status == StageStatus::Completed));
        assert_eq!(run.stage("plan").unwrap().agent_id(), Some("worker-1"));
        assert_eq!(run.context["plan"]["verdict"], json!("ok"));

        // The run sandbox is gone once the run finishes.
        let sandbox = run.sandbox_id.clone().unwrap();
        assert!(!h.mock.is_live(&sandbox));
    }

    #[tokio::test]
    async fn test_invalid_workflows_touch_no_sandbox() {
        let h = harness(vec![Arc::new(EchoAgent::new("worker"))], BudgetLimits::unlimited());
        let cyclic = WorkflowDefinition::new("loop")
            .stage(WorkflowStage::new("a", "worker").depends_on("b"))
            .stage(WorkflowStage::new("b", "worker").depends_on("a"));
        assert!(matches!(
            h.engine.execute_workflow("proj", cyclic).await,
            Err(Error::InvalidWorkflow(_))
        ));

        let unknown_agent =
            WorkflowDefinition::new("wf").stage(WorkflowStage::new("a", "nobody"));
        assert!(matches!(
            h.engine.execute_workflow("proj", unknown_agent).await,
            Err(Error::AgentNotFound(_))
        ));
        assert!(h.mock.commands().is_empty());
        assert!(h.engine.list_runs("proj").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_stage_skips_dependents_only() {
        let good = Arc::new(EchoAgent::new("good"));
        let bad = Arc::new(EchoAgent {
            fail: true,
            ..EchoAgent::new("bad")
        });
        let h = harness(vec![good.clone(), bad], BudgetLimits::unlimited());
        let wf = WorkflowDefinition::new("wf")
            .stage(WorkflowStage::new("build", "bad"))
            .stage(WorkflowStage::new("test", "good").depends_on("build"))
            .stage(WorkflowStage::new("docs", "good"));

        let run = h.engine.execute_workflow("proj", wf).await.unwrap();
        assert_eq!(run.status, ProjectStatus::Failed);
        assert!(run.status_reason.as_ref().unwrap().contains("model refused"));
        assert_eq!(run.stage("build").unwrap().status, StageStatus::Failed);
        let test = run.stage("test").unwrap();
        assert_eq!(test.status, StageStatus::Skipped);
        assert!(test.error.as_deref().unwrap().contains("dependency 'build' failed"));
        assert_eq!(run.stage("docs").unwrap().status, StageStatus::Completed);
        assert_eq!(*good.calls.lock(), vec!["docs"]);
    }

    #[tokio::test]
    async fn test_optional_failure_does_not_fail_run() {
        let h = harness(
            vec![
                Arc::new(EchoAgent::new("good")),
                Arc::new(EchoAgent {
                    fail: true,
                    ..EchoAgent::new("bad")
                }),
            ],
            BudgetLimits::unlimited(),
        );
        let wf = WorkflowDefinition::new("wf")
            .stage(WorkflowStage::new("lint", "bad").optional())
            .stage(WorkflowStage::new("ship", "good").depends_on("lint"));

        let run = h.engine.execute_workflow("proj", wf).await.unwrap();
        assert_eq!(run.status, ProjectStatus::Completed);
        assert_eq!(run.stage("ship").unwrap().status, StageStatus::Completed);
    }

    #[tokio::test]
    async fn test_conditions_gate_stages() {
        let agent = Arc::new(EchoAgent::new("worker"));
        let h = harness(vec![agent.clone()], BudgetLimits::unlimited());
        let mut wf = WorkflowDefinition::new("wf")
            .stage(WorkflowStage::new("plan", "worker"))
            .stage(
                WorkflowStage::new("deploy", "worker")
                    .depends_on("plan")
                    .with_condition(WorkflowCondition::If("target == 'prod'".into())),
            )
            .stage(
                WorkflowStage::new("notify", "worker")
                    .depends_on("deploy")
                    .with_condition(WorkflowCondition::When("deploy.status == 'skipped'".into())),
            )
            .stage(
                WorkflowStage::new("verify", "worker")
                    .depends_on("plan")
                    .with_condition(WorkflowCondition::Unless("plan.verdict != 'ok'".into())),
            );
        wf.parameters.insert("target".into(), json!("staging"));

        let run = h.engine.execute_workflow("proj", wf).await.unwrap();
        assert_eq!(run.status, ProjectStatus::Completed);
        assert_eq!(run.stage("deploy").unwrap().status, StageStatus::Skipped);
        assert_eq!(run.stage("notify").unwrap().status, StageStatus::Completed);
        assert_eq!(run.stage("verify").unwrap().status, StageStatus::Completed);
        assert_eq!(*agent.calls.lock(), vec!["plan", "notify", "verify"]);
    }

    #[tokio::test]
    async fn test_preflight_budget_pauses_without_running() {
        let agent = Arc::new(EchoAgent::new("worker"));
        let h = harness(
            vec![agent.clone()],
            BudgetLimits::unlimited().with_run_limit(dec!(10.00)),
        );
        let wf = WorkflowDefinition::new("wf").stage(
            WorkflowStage::new("implement", "worker").with_estimated_cost(dec!(50.00)),
        );

        let run = h.engine.execute_workflow("proj", wf).await.unwrap();
        assert_eq!(run.status, ProjectStatus::Paused);
        assert!(run.status_reason.as_ref().unwrap().contains("pre-flight"));
        assert_eq!(run.stage("implement").unwrap().status, StageStatus::Pending);
        assert!(agent.calls.lock().is_empty());

        // Raising the ceiling lets the operator resume.
        h.costs
            .set_project_limits("proj", BudgetLimits::unlimited().with_run_limit(dec!(100)));
        let run = h.engine.resume_workflow(&run.id).await.unwrap();
        assert_eq!(run.status, ProjectStatus::Completed);
        assert_eq!(*agent.calls.lock(), vec!["implement"]);
    }

    #[tokio::test]
    async fn test_preflight_sums_estimates_across_parallel_wave() {
        // Four independent 4.00 stages against a 10.00 ceiling: each fits alone,
        // the wave does not.
        let agent = Arc::new(EchoAgent::new("worker"));
        let h = harness(
            vec![agent.clone()],
            BudgetLimits::unlimited().with_run_limit(dec!(10.00)),
        );
        let wf = ["a", "b", "c", "d"].into_iter().fold(
            WorkflowDefinition {
                allow_parallel: true,
                ..WorkflowDefinition::new("fanout")
            },
            |wf, name| wf.stage(WorkflowStage::new(name, "worker").with_estimated_cost(dec!(4.00))),
        );

        let run = h.engine.execute_workflow("proj", wf).await.unwrap();
        assert_eq!(run.status, ProjectStatus::Paused);
        assert!(run.status_reason.unwrap().contains("'c'"));
        assert!(run.stages.iter().all(|s| s.status == StageStatus::Pending));
        assert!(agent.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_overspend_after_stage_pauses_run() {
        // 1M input tokens on gpt-4o = 2.50 against a 2.00 ceiling: 125% → Error → Pause.
        let agent = Arc::new(EchoAgent {
            usage: Some(TokenUsageRecord::new("openai", "gpt-4o", 1_000_000, 0)),
            ..EchoAgent::new("worker")
        });
        let h = harness(
            vec![agent.clone()],
            BudgetLimits::unlimited().with_run_limit(dec!(2.00)),
        );
        let wf = WorkflowDefinition::new("wf")
            .stage(WorkflowStage::new("plan", "worker"))
            .stage(WorkflowStage::new("implement", "worker").depends_on("plan"));

        let run = h.engine.execute_workflow("proj", wf).await.unwrap();
        assert_eq!(run.status, ProjectStatus::Paused);
        assert_eq!(run.cost.total_cost, dec!(2.50));
        assert_eq!(run.stage("plan").unwrap().status, StageStatus::Completed);
        assert_eq!(run.stage("implement").unwrap().status, StageStatus::Pending);
        assert_eq!(h.costs.get_cost_summary("proj").total, dec!(2.50));
    }

    #[tokio::test]
    async fn test_cancelling_paused_run_releases_active_spend() {
        let agent = Arc::new(EchoAgent {
            usage: Some(TokenUsageRecord::new("openai", "gpt-4o", 1_000_000, 0)),
            ..EchoAgent::new("worker")
        });
        let h = harness(vec![agent], BudgetLimits::unlimited().with_run_limit(dec!(2.00)));
        let wf = WorkflowDefinition::new("wf")
            .stage(WorkflowStage::new("plan", "worker"))
            .stage(WorkflowStage::new("implement", "worker").depends_on("plan"));

        let run = h.engine.execute_workflow("proj", wf).await.unwrap();
        assert_eq!(run.status, ProjectStatus::Paused);
        let limits = BudgetLimits::unlimited().with_run_limit(dec!(2.00));
        assert!(!h.costs.enforce_budget_limits("proj", &limits).await);

        h.engine.cancel_workflow(&run.id).await.unwrap();
        let run = h.engine.get_run(&run.id).unwrap();
        assert_eq!(run.status, ProjectStatus::Cancelled);
        assert_eq!(run.stage("implement").unwrap().status, StageStatus::Skipped);

        // The cancelled run no longer counts as active spend.
        assert!(h.costs.enforce_budget_limits("proj", &limits).await);
        assert_eq!(h.costs.get_cost_summary("proj").total, dec!(2.50));
    }

    #[tokio::test]
    async fn test_sandbox_start_failure_destroys_sandbox() {
        let agent = Arc::new(EchoAgent::new("worker"));
        let h = harness(vec![agent.clone()], BudgetLimits::unlimited());
        h.mock.fail_next_start("entrypoint crashed");

        let err = h
            .engine
            .execute_workflow("proj", WorkflowDefinition::new("wf").stage(WorkflowStage::new("a", "worker")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("entrypoint crashed"));

        let envs = h.sandboxes.list();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].status, SandboxStatus::Destroyed);
        assert!(!h.mock.is_live(&envs[0].id));
        assert!(agent.calls.lock().is_empty());

        let runs = h.engine.list_runs("proj").await.unwrap();
        assert_eq!(runs[0].status, ProjectStatus::Failed);
        assert!(runs[0].status_reason.as_deref().unwrap().starts_with("sandbox unavailable"));
    }

    #[tokio::test]
    async fn test_unknown_rate_fails_stage() {
        let agent = Arc::new(EchoAgent {
            usage: Some(TokenUsageRecord::new("mystery", "m-1", 10, 10)),
            ..EchoAgent::new("worker")
        });
        let h = harness(vec![agent], BudgetLimits::unlimited());
        let run = h
            .engine
            .execute_workflow("proj", WorkflowDefinition::new("wf").stage(WorkflowStage::new("a", "worker")))
            .await
            .unwrap();
        assert_eq!(run.status, ProjectStatus::Failed);
        assert!(run.stage("a").unwrap().error.as_deref().unwrap().contains("mystery"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_takes_effect_at_stage_boundary() {
        let agent = Arc::new(EchoAgent {
            delay: Duration::from_secs(5),
            ..EchoAgent::new("worker")
        });
        let h = harness(vec![agent.clone()], BudgetLimits::unlimited());
        let wf = WorkflowDefinition::new("wf")
            .stage(WorkflowStage::new("one", "worker"))
            .stage(WorkflowStage::new("two", "worker").depends_on("one"));

        let mut rx = h.events.subscribe();
        let engine = h.engine.clone();
        let task = tokio::spawn(async move { engine.execute_workflow("proj", wf).await });

        // Wait for the run to start, then pause while stage one is running.
        let run_id = loop {
            let event = rx.recv().await.unwrap();
            if let Some(p) = event.decode::<StageStatePayload>() {
                if p.status == StageStatus::Running {
                    break p.run_id;
                }
            }
        };
        h.engine.pause_workflow(&run_id).unwrap();

        let run = task.await.unwrap().unwrap();
        assert_eq!(run.status, ProjectStatus::Paused);
        assert_eq!(run.stage("one").unwrap().status, StageStatus::Completed);
        assert_eq!(run.stage("two").unwrap().status, StageStatus::Pending);

        let run = h.engine.resume_workflow(&run_id).await.unwrap();
        assert_eq!(run.status, ProjectStatus::Completed);
        assert_eq!(*agent.calls.lock(), vec!["one", "two"]);
        assert!(h.engine.resume_workflow(&run_id).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_in_flight_stage() {
        let agent = Arc::new(EchoAgent {
            delay: Duration::from_secs(60),
            ..EchoAgent::new("worker")
        });
        let h = harness(vec![agent], BudgetLimits::unlimited());
        let wf = WorkflowDefinition::new("wf")
            .stage(WorkflowStage::new("slow", "worker"))
            .stage(WorkflowStage::new("after", "worker").depends_on("slow"));

        let mut rx = h.events.subscribe();
        let engine = h.engine.clone();
        let task = tokio::spawn(async move { engine.execute_workflow("proj", wf).await });
        let run_id = loop {
            if let Some(p) = rx.recv().await.unwrap().decode::<StageStatePayload>() {
                break p.run_id;
            }
        };
        h.engine.cancel_workflow(&run_id).await.unwrap();

        let run = task.await.unwrap().unwrap();
        assert_eq!(run.status, ProjectStatus::Cancelled);
        let slow = run.stage("slow").unwrap();
        assert_eq!(slow.status, StageStatus::Failed);
        assert!(slow.error.as_deref().unwrap().starts_with("stage cancelled"));
        assert_eq!(run.stage("after").unwrap().status, StageStatus::Skipped);
        assert!(h.engine.cancel_workflow(&run_id).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_timeout() {
        let agent = Arc::new(EchoAgent {
            delay: Duration::from_secs(120),
            ..EchoAgent::new("worker")
        });
        let h = harness(vec![agent], BudgetLimits::unlimited());
        let mut stage = WorkflowStage::new("slow", "worker");
        stage.timeout_secs = Some(10);

        let run = h
            .engine
            .execute_workflow("proj", WorkflowDefinition::new("wf").stage(stage))
            .await
            .unwrap();
        assert_eq!(run.status, ProjectStatus::Failed);
        assert!(run.stage("slow").unwrap().error.as_deref().unwrap().contains("timed out after 10s"));
    }

    #[tokio::test]
    async fn test_events_cover_every_transition() {
        let h = harness(vec![Arc::new(EchoAgent::new("worker"))], BudgetLimits::unlimited());
        let mut rx = h.events.subscribe();
        h.engine
            .execute_workflow(
                "proj",
                WorkflowDefinition::new("wf").stage(WorkflowStage::new("only", "worker")),
            )
            .await
            .unwrap();

        let mut workflow = Vec::new();
        let mut stage = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event.event_type {
                EventType::WorkflowStateChanged => {
                    workflow.push(event.decode::<WorkflowStatePayload>().unwrap().status)
                }
                EventType::StageStateChanged => {
                    stage.push(event.decode::<StageStatePayload>().unwrap().status)
                }
                _ => {}
            }
        }
        assert_eq!(workflow, vec![ProjectStatus::Running, ProjectStatus::Completed]);
        assert_eq!(stage, vec![StageStatus::Running, StageStatus::Completed]);
    }
}
