//! Integration tests for the permission broker and cost tracker.

use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

use sandflow_core::config::{AllowRule, PermissionSettings};
use sandflow_core::{
    BudgetAction, BudgetLimits, ModelRate, PermissionGate, PermissionRequest, PermissionStatus,
    PermissionType, PrivilegedOperation, SandboxId,
};
use sandflow_governance::{
    AuditFilter, AuditOutcome, BudgetPolicy, CostTracker, FileAuditStore, PermissionBroker,
    RateTable, StaticPolicyDecider,
};

#[tokio::test]
async fn test_policy_from_settings_through_gate() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(
        PermissionBroker::new().with_audit(Arc::new(FileAuditStore::new(dir.path().join("audit.jsonl")))),
    );

    let settings = PermissionSettings {
        allow: vec![AllowRule {
            permission_type: PermissionType::NetworkAccess,
            resources: vec!["pypi.org".into(), "*.crates.io".into()],
        }],
        grant_valid_for_secs: 300,
        ..Default::default()
    };
    broker
        .serve(Arc::new(StaticPolicyDecider::from_settings(&settings).unwrap()))
        .unwrap();

    let gate: Arc<dyn PermissionGate> = broker.clone();
    let sandbox = SandboxId::from("sb-int");

    let allowed = PrivilegedOperation::new(PermissionType::NetworkAccess, "pypi.org", "pip install");
    let response = gate
        .request_permission(PermissionRequest::new(sandbox.clone(), &allowed), Duration::from_secs(5))
        .await;
    assert!(response.is_approved());
    assert!(gate.active_grant(&sandbox, &allowed).is_some());

    let blocked = PrivilegedOperation::new(PermissionType::NetworkAccess, "evil.example", "curl");
    let response = gate
        .request_permission(PermissionRequest::new(sandbox.clone(), &blocked), Duration::from_secs(5))
        .await;
    assert_eq!(response.status, PermissionStatus::Denied);
    assert!(gate.active_grant(&sandbox, &blocked).is_none());

    let denied = broker
        .audit_trail(AuditFilter {
            outcome: Some(AuditOutcome::Denied),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].resource, "evil.example");
}

#[tokio::test]
async fn test_cost_tracker_with_policy() {
    let tracker = CostTracker::new(
        RateTable::from_rates([ModelRate::new("anthropic", "claude-sonnet", dec!(3), dec!(15))]),
        BudgetLimits::unlimited().with_run_limit(dec!(1.00)),
    );
    let policy = BudgetPolicy::default();
    let limits = tracker.limits_for("proj");

    // 100k in + 50k out = 0.30 + 0.75 = 1.05 → over the run ceiling by 5%.
    let cost = tracker
        .calculate_cost("anthropic", "claude-sonnet", 100_000, 50_000)
        .unwrap();
    assert_eq!(cost.total_cost, dec!(1.05));
    tracker.record_cost("proj", "run-1", &cost);

    let verdict = tracker.evaluate_budget("proj", "run-1", &limits).await;
    assert!(!verdict.is_within_budget());
    assert_eq!(policy.decide(&verdict), BudgetAction::Pause);

    assert!(!tracker.check_budget_for_run("proj", "run-1", dec!(0.01)));
    assert!(tracker.check_budget_for_run("proj", "run-2", dec!(0.50)));
    assert_eq!(tracker.get_cost_summary("proj").total, dec!(1.05));
}
