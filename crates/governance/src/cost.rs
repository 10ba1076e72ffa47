//! Cost tracking and budget enforcement.
//!
//! Prices token usage through a hot-swappable [`RateTable`], keeps a ledger
//! per project (per-run costs plus calendar day/month windows in UTC), and
//! turns ledger state into [`CostAlert`]s against the configured ceilings.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use sandflow_core::{
    AlertSeverity, BudgetLimits, BudgetScope, CostAlert, CostSummary, Error, EventEmitter,
    EventEnvelope, EventSeverity, EventType, NoOpEventEmitter, Result, RunCost,
};

use crate::metrics::{track_budget_alert, track_tokens};
use crate::pricing::RateTable;

// =============================================================================
// Clock
// =============================================================================

/// Source of "now" for calendar windows.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and replays.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// =============================================================================
// Ledger
// =============================================================================

/// Result of evaluating a project's spend against its ceilings.
#[derive(Debug, Clone, Default)]
pub struct BudgetVerdict {
    pub alerts: Vec<CostAlert>,
}

impl BudgetVerdict {
    /// No ceiling is breached (informational alerts allowed).
    pub fn is_within_budget(&self) -> bool {
        !self.alerts.iter().any(|a| a.severity.is_breach())
    }

    pub fn worst(&self) -> Option<&CostAlert> {
        self.alerts.iter().max_by_key(|a| a.severity)
    }
}

struct ProjectLedger {
    summary: CostSummary,
    runs: HashMap<String, RunCost>,
    active: HashSet<String>,
    limits: Option<BudgetLimits>,
}

impl ProjectLedger {
    fn new(project_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            summary: CostSummary::new(project_id, now),
            runs: HashMap::new(),
            active: HashSet::new(),
            limits: None,
        }
    }

    fn run_total(&self, run_id: &str) -> Decimal {
        self.runs
            .get(run_id)
            .map(|r| r.total_cost)
            .unwrap_or(Decimal::ZERO)
    }
}

/// Cost tracker shared by every run of every project.
pub struct CostTracker {
    rates: RwLock<Arc<RateTable>>,
    ledgers: DashMap<String, ProjectLedger>,
    default_limits: BudgetLimits,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventEmitter>,
}

impl CostTracker {
    pub fn new(rates: RateTable, default_limits: BudgetLimits) -> Self {
        Self {
            rates: RwLock::new(Arc::new(rates)),
            ledgers: DashMap::new(),
            default_limits,
            clock: Arc::new(SystemClock),
            events: Arc::new(NoOpEventEmitter),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventEmitter>) -> Self {
        self.events = events;
        self
    }

    // -------------------------------------------------------------------------
    // Pricing
    // -------------------------------------------------------------------------

    /// Price one provider response. Zero tokens cost nothing and skip the lookup.
    pub fn calculate_cost(
        &self,
        provider: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<RunCost> {
        let mut cost = RunCost::default();
        if input_tokens == 0 && output_tokens == 0 {
            return Ok(cost);
        }

        let rates = self.rates();
        let rate = rates.get(provider, model).ok_or_else(|| Error::UnknownRate {
            provider: provider.to_string(),
            model: model.to_string(),
        })?;

        let amount = rate.price(input_tokens, output_tokens);
        cost.add_usage(provider, model, input_tokens, output_tokens, amount);
        Ok(cost)
    }

    /// Replace the rate table. Calls already holding the old table finish with it.
    pub fn update_rates(&self, table: RateTable) {
        tracing::info!(rates = table.len(), "Rate table updated");
        *self.rates.write() = Arc::new(table);
    }

    pub fn rates(&self) -> Arc<RateTable> {
        self.rates.read().clone()
    }

    // -------------------------------------------------------------------------
    // Limits
    // -------------------------------------------------------------------------

    pub fn set_project_limits(&self, project_id: &str, limits: BudgetLimits) {
        let now = self.clock.now();
        self.ledgers
            .entry(project_id.to_string())
            .or_insert_with(|| ProjectLedger::new(project_id, now))
            .limits = Some(limits);
    }

    /// Project-specific limits, or the tracker defaults.
    pub fn limits_for(&self, project_id: &str) -> BudgetLimits {
        self.ledgers
            .get(project_id)
            .and_then(|l| l.limits.clone())
            .unwrap_or_else(|| self.default_limits.clone())
    }

    // -------------------------------------------------------------------------
    // Pre-flight Checks
    // -------------------------------------------------------------------------

    /// Whether spending `estimate` in a fresh run keeps every ceiling.
    pub fn check_budget(&self, project_id: &str, estimate: Decimal) -> bool {
        self.projected_within(project_id, None, estimate)
    }

    /// Whether spending `estimate` more in `run_id` keeps every ceiling.
    pub fn check_budget_for_run(&self, project_id: &str, run_id: &str, estimate: Decimal) -> bool {
        self.projected_within(project_id, Some(run_id), estimate)
    }

    fn projected_within(&self, project_id: &str, run_id: Option<&str>, estimate: Decimal) -> bool {
        let now = self.clock.now();
        let limits = self.limits_for(project_id);

        let (run_spent, today, month) = match self.ledgers.get_mut(project_id) {
            Some(mut ledger) => {
                ledger.summary.roll_to(now);
                let run_spent = run_id.map(|r| ledger.run_total(r)).unwrap_or(Decimal::ZERO);
                (run_spent, ledger.summary.today, ledger.summary.month)
            }
            None => (Decimal::ZERO, Decimal::ZERO, Decimal::ZERO),
        };

        let projected = [
            (BudgetScope::Run, run_spent + estimate),
            (BudgetScope::Day, today + estimate),
            (BudgetScope::Month, month + estimate),
        ];

        for (scope, value) in projected {
            if let Some(limit) = limits.limit_for(scope) {
                if value > limit {
                    tracing::info!(
                        project_id = %project_id,
                        scope = %scope,
                        projected = %value,
                        limit = %limit,
                        "Budget check failed"
                    );
                    return false;
                }
            }
        }
        true
    }

    // -------------------------------------------------------------------------
    // Recording
    // -------------------------------------------------------------------------

    /// Add a priced usage to a run and to the project's windows.
    pub fn record_cost(&self, project_id: &str, run_id: &str, cost: &RunCost) -> CostSummary {
        let now = self.clock.now();
        let summary = {
            let mut ledger = self
                .ledgers
                .entry(project_id.to_string())
                .or_insert_with(|| ProjectLedger::new(project_id, now));

            ledger.summary.roll_to(now);
            ledger.summary.today += cost.total_cost;
            ledger.summary.month += cost.total_cost;
            ledger.summary.total += cost.total_cost;
            ledger.summary.updated_at = now;

            ledger
                .runs
                .entry(run_id.to_string())
                .or_insert_with(|| RunCost::new(run_id))
                .merge(cost);
            ledger.active.insert(run_id.to_string());
            ledger.summary.runs = ledger.runs.len();
            ledger.summary.clone()
        };

        for (key, usage) in &cost.by_provider {
            let (provider, model) = key.split_once(':').unwrap_or((key.as_str(), ""));
            track_tokens(provider, model, usage.input_tokens, usage.output_tokens);
        }

        tracing::debug!(
            project_id = %project_id,
            run_id = %run_id,
            cost = %cost.total_cost,
            today = %summary.today,
            total = %summary.total,
            "Recorded cost"
        );
        summary
    }

    /// Mark a run finished. Its cost stays in the project totals.
    pub fn complete_run(&self, project_id: &str, run_id: &str) -> Option<RunCost> {
        let mut ledger = self.ledgers.get_mut(project_id)?;
        ledger.active.remove(run_id);
        ledger.runs.get(run_id).cloned()
    }

    pub fn get_cost_summary(&self, project_id: &str) -> CostSummary {
        let now = self.clock.now();
        match self.ledgers.get_mut(project_id) {
            Some(mut ledger) => {
                ledger.summary.roll_to(now);
                ledger.summary.clone()
            }
            None => CostSummary::new(project_id, now),
        }
    }

    pub fn get_run_cost(&self, project_id: &str, run_id: &str) -> Option<RunCost> {
        self.ledgers.get(project_id)?.runs.get(run_id).cloned()
    }

    // -------------------------------------------------------------------------
    // Alerts
    // -------------------------------------------------------------------------

    /// Alerts for `run_id` and the project's day/month windows.
    pub async fn evaluate_budget(
        &self,
        project_id: &str,
        run_id: &str,
        limits: &BudgetLimits,
    ) -> BudgetVerdict {
        let alerts = self.collect_alerts(project_id, Some(run_id), limits);
        self.publish(&alerts).await;
        BudgetVerdict { alerts }
    }

    /// Evaluate every in-flight run plus the project windows. `true` when no
    /// ceiling is breached.
    pub async fn enforce_budget_limits(&self, project_id: &str, limits: &BudgetLimits) -> bool {
        let alerts = self.collect_alerts(project_id, None, limits);
        self.publish(&alerts).await;
        BudgetVerdict { alerts }.is_within_budget()
    }

    fn collect_alerts(
        &self,
        project_id: &str,
        run_id: Option<&str>,
        limits: &BudgetLimits,
    ) -> Vec<CostAlert> {
        let now = self.clock.now();
        let Some(mut ledger) = self.ledgers.get_mut(project_id) else {
            return Vec::new();
        };
        ledger.summary.roll_to(now);

        let mut observed: Vec<(BudgetScope, Option<String>, Decimal)> = Vec::new();
        match run_id {
            Some(run) => observed.push((BudgetScope::Run, Some(run.to_string()), ledger.run_total(run))),
            None => {
                let mut active: Vec<&String> = ledger.active.iter().collect();
                active.sort();
                for run in active {
                    observed.push((BudgetScope::Run, Some(run.clone()), ledger.run_total(run)));
                }
            }
        }
        observed.push((BudgetScope::Day, run_id.map(String::from), ledger.summary.today));
        observed.push((BudgetScope::Month, run_id.map(String::from), ledger.summary.month));

        observed
            .into_iter()
            .filter_map(|(scope, run, current)| {
                let limit = limits.limit_for(scope)?;
                let severity = severity_for(current, limit, limits.warning_threshold)?;
                Some(CostAlert {
                    project_id: project_id.to_string(),
                    run_id: run,
                    scope,
                    severity,
                    current,
                    limit,
                    message: format!(
                        "{} spend {} is {} of the {} ceiling {}",
                        scope,
                        current,
                        describe(severity),
                        scope,
                        limit
                    ),
                    raised_at: now,
                })
            })
            .collect()
    }

    async fn publish(&self, alerts: &[CostAlert]) {
        for alert in alerts {
            let severity = match alert.severity {
                AlertSeverity::Info => EventSeverity::Info,
                AlertSeverity::Warning => EventSeverity::Warning,
                AlertSeverity::Error => EventSeverity::Error,
            };
            tracing::warn!(
                project_id = %alert.project_id,
                scope = %alert.scope,
                severity = ?alert.severity,
                current = %alert.current,
                limit = %alert.limit,
                "Cost alert"
            );
            track_budget_alert(alert.scope.as_str(), severity_label(alert.severity));

            let mut event = EventEnvelope::from_payload(EventType::CostAlertRaised, alert)
                .with_project(&alert.project_id)
                .with_actor("cost-tracker")
                .with_severity(severity);
            if let Some(run_id) = &alert.run_id {
                event = event.with_run(run_id);
            }
            self.events.emit(event).await;
        }
    }
}

fn severity_for(current: Decimal, limit: Decimal, threshold: Decimal) -> Option<AlertSeverity> {
    if limit.is_zero() {
        return (current > Decimal::ZERO).then_some(AlertSeverity::Error);
    }
    let ratio = current.checked_div(limit)?;
    AlertSeverity::from_ratio(ratio, threshold)
}

fn describe(severity: AlertSeverity) -> &'static str {
    match severity {
        AlertSeverity::Info => "approaching",
        AlertSeverity::Warning => "over",
        AlertSeverity::Error => "well over",
    }
}

fn severity_label(severity: AlertSeverity) -> &'static str {
    match severity {
        AlertSeverity::Info => "info",
        AlertSeverity::Warning => "warning",
        AlertSeverity::Error => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use sandflow_core::{BroadcastEventEmitter, ModelRate};

    fn tracker() -> CostTracker {
        CostTracker::new(
            RateTable::from_rates([ModelRate::new("openai", "gpt-4o", dec!(2.50), dec!(10.00))]),
            BudgetLimits::unlimited(),
        )
    }

    fn priced(amount: Decimal) -> RunCost {
        let mut cost = RunCost::default();
        cost.add_usage("openai", "gpt-4o", 0, 0, amount);
        cost
    }

    // =========================================================================
    // Pricing
    // =========================================================================

    #[test]
    fn test_calculate_cost_is_linear() {
        let tracker = tracker();
        let one = tracker.calculate_cost("openai", "gpt-4o", 1000, 500).unwrap();
        let two = tracker.calculate_cost("openai", "gpt-4o", 2000, 1000).unwrap();
        // 1000 * 2.50 / 1M + 500 * 10 / 1M
        assert_eq!(one.total_cost, dec!(0.0075));
        assert_eq!(two.total_cost, one.total_cost * dec!(2));
        assert_eq!(
            tracker.calculate_cost("openai", "gpt-4o", 1000, 500).unwrap(),
            one
        );
    }

    #[test]
    fn test_zero_tokens_skip_lookup() {
        let tracker = tracker();
        let cost = tracker.calculate_cost("nobody", "nothing", 0, 0).unwrap();
        assert!(cost.is_zero());
    }

    #[test]
    fn test_unknown_rate() {
        let tracker = tracker();
        let err = tracker.calculate_cost("openai", "gpt-9", 1, 1).unwrap_err();
        assert!(matches!(err, Error::UnknownRate { .. }));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_update_rates_hot_swap() {
        let tracker = tracker();
        let old = tracker.rates();
        tracker.update_rates(RateTable::from_rates([ModelRate::new(
            "openai",
            "gpt-4o",
            dec!(1),
            dec!(1),
        )]));
        assert_eq!(
            tracker.calculate_cost("openai", "gpt-4o", 1_000_000, 0).unwrap().total_cost,
            dec!(1)
        );
        // Readers holding the previous table still see it.
        assert_eq!(old.get("openai", "gpt-4o").unwrap().input_per_million, dec!(2.50));
    }

    // =========================================================================
    // Budget Checks
    // =========================================================================

    #[test]
    fn test_check_budget_against_run_ceiling() {
        let tracker = tracker();
        tracker.set_project_limits("p", BudgetLimits::unlimited().with_run_limit(dec!(10.00)));

        assert!(!tracker.check_budget("p", dec!(50.00)));
        assert!(tracker.check_budget("p", dec!(10.00)), "equal to the ceiling is allowed");

        tracker.record_cost("p", "r1", &priced(dec!(8)));
        assert!(!tracker.check_budget_for_run("p", "r1", dec!(3)));
        assert!(tracker.check_budget_for_run("p", "r2", dec!(3)));
    }

    #[test]
    fn test_check_budget_day_and_month() {
        let tracker = tracker();
        tracker.set_project_limits(
            "p",
            BudgetLimits::unlimited()
                .with_day_limit(dec!(5))
                .with_month_limit(dec!(100)),
        );
        tracker.record_cost("p", "r1", &priced(dec!(4)));
        assert!(!tracker.check_budget("p", dec!(2)));
        assert!(tracker.check_budget("p", dec!(1)));
    }

    // =========================================================================
    // Ledger
    // =========================================================================

    #[test]
    fn test_summary_total_is_sum_of_runs() {
        let tracker = tracker();
        tracker.record_cost("p", "r1", &priced(dec!(1.25)));
        tracker.record_cost("p", "r2", &priced(dec!(0.75)));
        tracker.record_cost("p", "r1", &priced(dec!(1)));
        tracker.complete_run("p", "r1");

        let summary = tracker.get_cost_summary("p");
        let r1 = tracker.get_run_cost("p", "r1").unwrap();
        let r2 = tracker.get_run_cost("p", "r2").unwrap();
        assert_eq!(summary.total, r1.total_cost + r2.total_cost);
        assert_eq!(summary.total, dec!(3));
        assert_eq!(summary.runs, 2);
    }

    #[test]
    fn test_windows_roll_with_clock() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 31, 22, 0, 0).unwrap(),
        ));
        let tracker = tracker().with_clock(clock.clone());

        tracker.record_cost("p", "r1", &priced(dec!(2)));
        clock.advance(chrono::Duration::hours(3));
        tracker.record_cost("p", "r1", &priced(dec!(1)));

        let summary = tracker.get_cost_summary("p");
        assert_eq!(summary.today, dec!(1));
        assert_eq!(summary.month, dec!(1));
        assert_eq!(summary.total, dec!(3));
        assert_eq!(tracker.get_run_cost("p", "r1").unwrap().total_cost, dec!(3));
    }

    #[tokio::test]
    async fn test_concurrent_record_cost_loses_nothing() {
        let tracker = Arc::new(tracker());
        let mut handles = Vec::new();
        for i in 0..32 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    tracker.record_cost("p", &format!("r{}", i % 4), &priced(dec!(0.01)));
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let summary = tracker.get_cost_summary("p");
        assert_eq!(summary.total, dec!(16.00));
        assert_eq!(summary.today, dec!(16.00));
        assert_eq!(summary.runs, 4);
    }

    // =========================================================================
    // Alerts
    // =========================================================================

    #[tokio::test]
    async fn test_evaluate_budget_severities_and_events() {
        let events = Arc::new(BroadcastEventEmitter::new(16));
        let mut rx = events.subscribe();
        let tracker = tracker().with_events(events.clone());
        let limits = BudgetLimits::unlimited()
            .with_run_limit(dec!(10))
            .with_day_limit(dec!(100));

        tracker.record_cost("p", "r1", &priced(dec!(8.5)));
        let verdict = tracker.evaluate_budget("p", "r1", &limits).await;
        assert_eq!(verdict.alerts.len(), 1);
        assert_eq!(verdict.alerts[0].severity, AlertSeverity::Info);
        assert!(verdict.is_within_budget());

        tracker.record_cost("p", "r1", &priced(dec!(2.5)));
        let verdict = tracker.evaluate_budget("p", "r1", &limits).await;
        assert_eq!(verdict.worst().unwrap().severity, AlertSeverity::Warning);
        assert!(!verdict.is_within_budget());

        tracker.record_cost("p", "r1", &priced(dec!(2)));
        let verdict = tracker.evaluate_budget("p", "r1", &limits).await;
        assert_eq!(verdict.worst().unwrap().severity, AlertSeverity::Error);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::CostAlertRaised);
        let alert: CostAlert = event.decode().unwrap();
        assert_eq!(alert.scope, BudgetScope::Run);
    }

    #[tokio::test]
    async fn test_enforce_budget_limits_covers_active_runs() {
        let tracker = tracker();
        let limits = BudgetLimits::unlimited().with_run_limit(dec!(1));

        tracker.record_cost("p", "r1", &priced(dec!(0.5)));
        tracker.record_cost("p", "r2", &priced(dec!(1.5)));
        assert!(!tracker.enforce_budget_limits("p", &limits).await);

        tracker.complete_run("p", "r2");
        assert!(tracker.enforce_budget_limits("p", &limits).await);
        assert!(tracker.enforce_budget_limits("unknown", &limits).await);
    }

    #[test]
    fn test_zero_ceiling() {
        assert_eq!(severity_for(dec!(0), dec!(0), dec!(0.8)), None);
        assert_eq!(
            severity_for(dec!(0.01), dec!(0), dec!(0.8)),
            Some(AlertSeverity::Error)
        );
    }
}
