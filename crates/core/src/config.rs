use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::types::{
    BudgetAction, BudgetLimits, BudgetPolicyRule, ModelRate, PermissionType, ResourceLimits,
    SandboxConfiguration,
};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub sandbox: SandboxSettings,
    pub permissions: PermissionSettings,
    pub cost: CostSettings,
    pub workflow: WorkflowSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SandboxSettings {
    /// Template for the sandbox created for each run.
    pub template: SandboxConfiguration,
    /// Largest limits any sandbox may request.
    pub host_capacity: ResourceLimits,
    pub cleanup_interval_secs: u64,
    /// How long destroyed environments stay visible before being purged.
    pub tombstone_retention_secs: u64,
    /// Grace period for a cancelled command before the sandbox is destroyed.
    pub termination_grace_ms: u64,
    /// Register the Docker backend for container sandboxes.
    pub docker_enabled: bool,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            template: SandboxConfiguration::default(),
            host_capacity: ResourceLimits {
                max_memory_bytes: 8 * 1024 * 1024 * 1024, // 8GB
                max_cpu_percent: 400.0,                   // 4 cores
                max_disk_bytes: 20 * 1024 * 1024 * 1024,  // 20GB
                max_processes: 1024,
                max_file_handles: 65536,
                max_network_bandwidth_bps: 100 * 1024 * 1024,
            },
            cleanup_interval_secs: 60,
            tombstone_retention_secs: 3600,
            termination_grace_ms: 5000,
            docker_enabled: true,
        }
    }
}

/// Allow rule for the static permission policy.
#[derive(Debug, Deserialize, Clone)]
pub struct AllowRule {
    pub permission_type: PermissionType,
    /// Resource patterns; `*` matches any sequence, a bare `*` matches everything.
    pub resources: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PermissionSettings {
    /// Timeout for a single permission decision.
    pub decision_timeout_ms: u64,
    /// Standing grant duration attached to policy approvals (0 = single use).
    pub grant_valid_for_secs: u64,
    pub grant_sweep_interval_secs: u64,
    /// Approve everything (development only).
    pub auto_approve: bool,
    /// Static allow list used when no interactive handler is attached.
    pub allow: Vec<AllowRule>,
    /// JSON-lines audit log; in memory when unset.
    pub audit_log: Option<String>,
}

impl Default for PermissionSettings {
    fn default() -> Self {
        Self {
            decision_timeout_ms: 30_000,
            grant_valid_for_secs: 0,
            grant_sweep_interval_secs: 30,
            auto_approve: false,
            allow: Vec::new(),
            audit_log: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CostSettings {
    pub limits: BudgetLimits,
    pub rates: Vec<ModelRate>,
    /// Overrides for the default budget policy table.
    pub policy: Vec<BudgetPolicyRule>,
    /// Action when the pre-flight budget check rejects a stage.
    pub preflight_action: BudgetAction,
}

impl Default for CostSettings {
    fn default() -> Self {
        Self {
            limits: BudgetLimits::default(),
            rates: Vec::new(),
            policy: Vec::new(),
            preflight_action: BudgetAction::Pause,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkflowSettings {
    pub max_concurrent_agents: usize,
    pub stage_timeout_secs: u64,
    pub command_timeout_secs: u64,
    /// Pre-flight estimate for stages without their own.
    pub default_stage_estimate: Decimal,
    /// Directory for persisted runs; in memory when unset.
    pub run_store_dir: Option<String>,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 4,
            stage_timeout_secs: 1800,
            command_timeout_secs: 300,
            default_stage_estimate: Decimal::ZERO,
            run_store_dir: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info,sandflow=debug".into(),
            json: false,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("SANDFLOW_ENV").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Map SANDFLOW__WORKFLOW__MAX_CONCURRENT_AGENTS=8 to workflow.max_concurrent_agents
            .add_source(Environment::with_prefix("SANDFLOW").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
