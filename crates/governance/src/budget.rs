//! Budget policy: what to do about a cost alert.

use std::collections::HashMap;

use sandflow_core::{AlertSeverity, BudgetAction, BudgetPolicyRule, BudgetScope};

use crate::cost::BudgetVerdict;

/// Table mapping `(scope, severity)` to an action.
///
/// Defaults: `Info` continues everywhere, `Warning` pauses, `Error` pauses
/// for run and day ceilings and fails the run for the month ceiling.
#[derive(Debug, Clone)]
pub struct BudgetPolicy {
    rules: HashMap<(BudgetScope, AlertSeverity), BudgetAction>,
    preflight: BudgetAction,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        let mut rules = HashMap::new();
        for scope in BudgetScope::ALL {
            rules.insert((scope, AlertSeverity::Info), BudgetAction::Continue);
            rules.insert((scope, AlertSeverity::Warning), BudgetAction::Pause);
            rules.insert((scope, AlertSeverity::Error), BudgetAction::Pause);
        }
        rules.insert((BudgetScope::Month, AlertSeverity::Error), BudgetAction::Fail);
        Self {
            rules,
            preflight: BudgetAction::Pause,
        }
    }
}

impl BudgetPolicy {
    /// Default table with `overrides` applied on top.
    pub fn from_rules(overrides: &[BudgetPolicyRule], preflight: BudgetAction) -> Self {
        let mut policy = Self {
            preflight,
            ..Self::default()
        };
        for rule in overrides {
            policy.set(rule.scope, rule.severity, rule.action);
        }
        policy
    }

    pub fn set(&mut self, scope: BudgetScope, severity: AlertSeverity, action: BudgetAction) {
        self.rules.insert((scope, severity), action);
    }

    pub fn action_for(&self, scope: BudgetScope, severity: AlertSeverity) -> BudgetAction {
        self.rules
            .get(&(scope, severity))
            .copied()
            .unwrap_or(BudgetAction::Continue)
    }

    /// Action applied when a stage's pre-flight check fails.
    pub fn preflight_action(&self) -> BudgetAction {
        self.preflight
    }

    /// Strongest action demanded by any alert in the verdict.
    pub fn decide(&self, verdict: &BudgetVerdict) -> BudgetAction {
        verdict
            .alerts
            .iter()
            .map(|a| self.action_for(a.scope, a.severity))
            .max_by_key(|a| rank(*a))
            .unwrap_or(BudgetAction::Continue)
    }
}

fn rank(action: BudgetAction) -> u8 {
    match action {
        BudgetAction::Continue => 0,
        BudgetAction::Pause => 1,
        BudgetAction::Fail => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use sandflow_core::CostAlert;

    fn alert(scope: BudgetScope, severity: AlertSeverity) -> CostAlert {
        CostAlert {
            project_id: "p".into(),
            run_id: None,
            scope,
            severity,
            current: dec!(1),
            limit: dec!(1),
            message: String::new(),
            raised_at: Utc::now(),
        }
    }

    #[test]
    fn test_default_table() {
        let policy = BudgetPolicy::default();
        assert_eq!(
            policy.action_for(BudgetScope::Run, AlertSeverity::Info),
            BudgetAction::Continue
        );
        assert_eq!(
            policy.action_for(BudgetScope::Day, AlertSeverity::Warning),
            BudgetAction::Pause
        );
        assert_eq!(
            policy.action_for(BudgetScope::Month, AlertSeverity::Error),
            BudgetAction::Fail
        );
        assert_eq!(policy.preflight_action(), BudgetAction::Pause);
    }

    #[test]
    fn test_decide_takes_strongest_action() {
        let policy = BudgetPolicy::default();
        let verdict = BudgetVerdict {
            alerts: vec![
                alert(BudgetScope::Run, AlertSeverity::Info),
                alert(BudgetScope::Month, AlertSeverity::Error),
                alert(BudgetScope::Day, AlertSeverity::Warning),
            ],
        };
        assert_eq!(policy.decide(&verdict), BudgetAction::Fail);
        assert_eq!(policy.decide(&BudgetVerdict::default()), BudgetAction::Continue);
    }

    #[test]
    fn test_overrides() {
        let policy = BudgetPolicy::from_rules(
            &[BudgetPolicyRule {
                scope: BudgetScope::Run,
                severity: AlertSeverity::Warning,
                action: BudgetAction::Fail,
            }],
            BudgetAction::Fail,
        );
        assert_eq!(
            policy.action_for(BudgetScope::Run, AlertSeverity::Warning),
            BudgetAction::Fail
        );
        assert_eq!(
            policy.action_for(BudgetScope::Day, AlertSeverity::Warning),
            BudgetAction::Pause
        );
        assert_eq!(policy.preflight_action(), BudgetAction::Fail);
    }
}
