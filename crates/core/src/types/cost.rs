use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Cost Records
// =============================================================================

/// Token counts and priced cost for one provider/model pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: Decimal,
}

/// Aggregated cost of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunCost {
    pub run_id: String,
    /// Usage keyed by `provider:model`.
    pub by_provider: BTreeMap<String, ProviderUsage>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost: Decimal,
}

impl RunCost {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ..Default::default()
        }
    }

    /// Key used in `by_provider`.
    pub fn provider_key(provider: &str, model: &str) -> String {
        format!("{}:{}", provider, model)
    }

    /// Add a single priced usage.
    pub fn add_usage(
        &mut self,
        provider: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost: Decimal,
    ) {
        let entry = self
            .by_provider
            .entry(Self::provider_key(provider, model))
            .or_default();
        entry.input_tokens += input_tokens;
        entry.output_tokens += output_tokens;
        entry.cost += cost;
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        self.total_cost += cost;
    }

    /// Fold another cost record into this one.
    pub fn merge(&mut self, other: &RunCost) {
        for (key, usage) in &other.by_provider {
            let entry = self.by_provider.entry(key.clone()).or_default();
            entry.input_tokens += usage.input_tokens;
            entry.output_tokens += usage.output_tokens;
            entry.cost += usage.cost;
        }
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_cost += other.total_cost;
    }

    pub fn is_zero(&self) -> bool {
        self.total_cost.is_zero() && self.input_tokens == 0 && self.output_tokens == 0
    }
}

/// Rolling cost aggregate for a project.
///
/// `today` and `month` refer to the calendar day and month in `window_day`
/// (UTC); they are reset when a new day or month begins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    pub project_id: String,
    pub today: Decimal,
    pub month: Decimal,
    pub total: Decimal,
    pub window_day: NaiveDate,
    pub runs: usize,
    pub updated_at: DateTime<Utc>,
}

impl CostSummary {
    pub fn new(project_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            project_id: project_id.into(),
            today: Decimal::ZERO,
            month: Decimal::ZERO,
            total: Decimal::ZERO,
            window_day: now.date_naive(),
            runs: 0,
            updated_at: now,
        }
    }

    /// Reset the day/month windows if `now` is past them.
    pub fn roll_to(&mut self, now: DateTime<Utc>) {
        let day = now.date_naive();
        if day == self.window_day {
            return;
        }
        if day.year() != self.window_day.year() || day.month() != self.window_day.month() {
            self.month = Decimal::ZERO;
        }
        self.today = Decimal::ZERO;
        self.window_day = day;
    }
}

// =============================================================================
// Budget Types
// =============================================================================

/// Budget ceilings for a project. `None` means no ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetLimits {
    pub max_cost_per_run: Option<Decimal>,
    pub max_cost_per_day: Option<Decimal>,
    pub max_cost_per_month: Option<Decimal>,
    /// Ratio of a ceiling at which an informational alert is raised.
    pub warning_threshold: Decimal,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            max_cost_per_run: None,
            max_cost_per_day: None,
            max_cost_per_month: None,
            warning_threshold: Decimal::new(8, 1), // 0.8
        }
    }
}

impl BudgetLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_run_limit(mut self, limit: Decimal) -> Self {
        self.max_cost_per_run = Some(limit);
        self
    }

    pub fn with_day_limit(mut self, limit: Decimal) -> Self {
        self.max_cost_per_day = Some(limit);
        self
    }

    pub fn with_month_limit(mut self, limit: Decimal) -> Self {
        self.max_cost_per_month = Some(limit);
        self
    }

    pub fn limit_for(&self, scope: BudgetScope) -> Option<Decimal> {
        match scope {
            BudgetScope::Run => self.max_cost_per_run,
            BudgetScope::Day => self.max_cost_per_day,
            BudgetScope::Month => self.max_cost_per_month,
        }
    }
}

/// Which ceiling an alert refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    Run,
    Day,
    Month,
}

impl BudgetScope {
    pub const ALL: [BudgetScope; 3] = [BudgetScope::Run, BudgetScope::Day, BudgetScope::Month];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Day => "day",
            Self::Month => "month",
        }
    }
}

impl std::fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a cost alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    /// Approaching a ceiling.
    Info,
    /// Slightly over a ceiling.
    Warning,
    /// Well over a ceiling.
    Error,
}

impl AlertSeverity {
    /// Ratio above which a breach is reported as `Error` rather than `Warning`.
    pub fn error_ratio() -> Decimal {
        Decimal::new(12, 1) // 1.2
    }

    /// Map `current / limit` to a severity. `None` below the warning threshold.
    pub fn from_ratio(ratio: Decimal, warning_threshold: Decimal) -> Option<Self> {
        if ratio > Self::error_ratio() {
            Some(Self::Error)
        } else if ratio > Decimal::ONE {
            Some(Self::Warning)
        } else if ratio >= warning_threshold {
            Some(Self::Info)
        } else {
            None
        }
    }

    /// Whether this severity means the ceiling is breached.
    pub fn is_breach(self) -> bool {
        self > Self::Info
    }
}

/// A cost alert raised against a ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostAlert {
    pub project_id: String,
    pub run_id: Option<String>,
    pub scope: BudgetScope,
    pub severity: AlertSeverity,
    pub current: Decimal,
    pub limit: Decimal,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// What the workflow engine does in response to an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetAction {
    Continue,
    Pause,
    Fail,
}

/// One row of the budget policy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetPolicyRule {
    pub scope: BudgetScope,
    pub severity: AlertSeverity,
    pub action: BudgetAction,
}

/// Per-token price of one provider/model pair, quoted per million tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRate {
    pub provider: String,
    pub model: String,
    pub input_per_million: Decimal,
    pub output_per_million: Decimal,
}

impl ModelRate {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        input_per_million: Decimal,
        output_per_million: Decimal,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            input_per_million,
            output_per_million,
        }
    }

    /// Price of a token count under this rate.
    pub fn price(&self, input_tokens: u64, output_tokens: u64) -> Decimal {
        let million = Decimal::from(1_000_000u64);
        (Decimal::from(input_tokens) * self.input_per_million
            + Decimal::from(output_tokens) * self.output_per_million)
            / million
    }
}
