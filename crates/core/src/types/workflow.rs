use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::cost::RunCost;
use super::sandbox::{SandboxId, SecurityViolation};
use crate::error::{Error, Result};

// =============================================================================
// Workflow Definition
// =============================================================================

/// Gating condition on a stage, evaluated against the run context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowCondition {
    /// Run only when the expression is true.
    If(String),
    /// Run only when the expression is false.
    Unless(String),
    /// Alias for `If`.
    When(String),
}

impl WorkflowCondition {
    pub fn expression(&self) -> &str {
        match self {
            Self::If(e) | Self::Unless(e) | Self::When(e) => e,
        }
    }

    /// Whether the stage runs given the expression's value.
    pub fn admits(&self, value: bool) -> bool {
        match self {
            Self::If(_) | Self::When(_) => value,
            Self::Unless(_) => !value,
        }
    }
}

/// One unit of workflow execution, driven by one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStage {
    /// Unique stage name.
    pub name: String,
    /// Selector for the agent that executes this stage.
    pub agent_type: String,
    /// Stages that must reach a terminal state first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Free-form parameters handed to the agent.
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    /// Optional gating condition.
    #[serde(default)]
    pub condition: Option<WorkflowCondition>,
    /// An optional stage's failure does not fail the run or halt dependents.
    #[serde(default)]
    pub optional: bool,
    /// Pre-flight cost estimate; falls back to the engine default.
    #[serde(default)]
    pub estimated_cost: Option<Decimal>,
    /// Per-stage timeout override in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl WorkflowStage {
    pub fn new(name: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agent_type: agent_type.into(),
            depends_on: Vec::new(),
            parameters: HashMap::new(),
            condition: None,
            optional: false,
            estimated_cost: None,
            timeout_secs: None,
        }
    }

    pub fn depends_on(mut self, stage: impl Into<String>) -> Self {
        self.depends_on.push(stage.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_condition(mut self, condition: WorkflowCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_estimated_cost(mut self, cost: Decimal) -> Self {
        self.estimated_cost = Some(cost);
        self
    }
}

/// A named set of stages executed for a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Allow independent stages to run concurrently.
    #[serde(default)]
    pub allow_parallel: bool,
    /// Override for the engine's concurrency bound.
    #[serde(default)]
    pub max_concurrent_agents: Option<usize>,
    /// Run-level variables exposed to conditions and agents.
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    pub stages: Vec<WorkflowStage>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            allow_parallel: false,
            max_concurrent_agents: None,
            parameters: HashMap::new(),
            stages: Vec::new(),
        }
    }

    pub fn stage(mut self, stage: WorkflowStage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn parallel(mut self, allow: bool) -> Self {
        self.allow_parallel = allow;
        self
    }

    pub fn get_stage(&self, name: &str) -> Option<&WorkflowStage> {
        self.stages.iter().find(|s| s.name == name)
    }
}

// =============================================================================
// Run State
// =============================================================================

/// Overall status of a project run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ProjectStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one stage within one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_name: String,
    agent_id: Option<String>,
    pub status: StageStatus,
    #[serde(default)]
    pub output: HashMap<String, Value>,
    pub error: Option<String>,
    #[serde(default)]
    pub violations: Vec<SecurityViolation>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageResult {
    pub fn pending(stage_name: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            agent_id: None,
            status: StageStatus::Pending,
            output: HashMap::new(),
            error: None,
            violations: Vec::new(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Agent that executed this stage, if any.
    pub fn agent_id(&self) -> Option<&str> {
        self.agent_id.as_deref()
    }

    /// Record the executing agent. The id is write-once.
    pub fn assign_agent(&mut self, agent_id: impl Into<String>) -> Result<()> {
        let agent_id = agent_id.into();
        match &self.agent_id {
            Some(existing) if *existing != agent_id => Err(Error::internal(format!(
                "stage '{}' already executed by agent '{}'",
                self.stage_name, existing
            ))),
            Some(_) => Ok(()),
            None => {
                self.agent_id = Some(agent_id);
                Ok(())
            }
        }
    }
}

/// One execution of a project's workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRun {
    pub id: String,
    pub project_id: String,
    pub workflow: WorkflowDefinition,
    pub status: ProjectStatus,
    /// Human-readable reason for the current status.
    pub status_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Stage results in workflow declaration order.
    pub stages: Vec<StageResult>,
    pub cost: RunCost,
    /// Variables visible to stage conditions.
    #[serde(default)]
    pub context: HashMap<String, Value>,
    /// Sandbox currently serving this run.
    pub sandbox_id: Option<SandboxId>,
}

impl ProjectRun {
    pub fn new(project_id: impl Into<String>, workflow: WorkflowDefinition) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let stages = workflow
            .stages
            .iter()
            .map(|s| StageResult::pending(&s.name))
            .collect();
        let context = workflow.parameters.clone();
        Self {
            cost: RunCost::new(&id),
            id,
            project_id: project_id.into(),
            workflow,
            status: ProjectStatus::Pending,
            status_reason: None,
            started_at: Utc::now(),
            completed_at: None,
            stages,
            context,
            sandbox_id: None,
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage_name == name)
    }

    pub fn stage_mut(&mut self, name: &str) -> Option<&mut StageResult> {
        self.stages.iter_mut().find(|s| s.stage_name == name)
    }

    /// Status of every stage keyed by name.
    pub fn stage_statuses(&self) -> HashMap<String, StageStatus> {
        self.stages
            .iter()
            .map(|s| (s.stage_name.clone(), s.status))
            .collect()
    }
}
