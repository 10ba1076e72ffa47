//! Sandbox integration tests.
//!
//! Tests the full pipeline: SandboxManager → PermissionBroker → SandboxEngine.
//! MockSandbox gives deterministic behavior; ProcessSandbox runs real commands
//! on the host. None of these tests require Docker.

use std::sync::Arc;
use std::time::Duration;

use sandflow_core::{
    PermissionGate, PermissionType, SandboxConfiguration, SandboxStatus, SandboxType,
    ViolationKind, PERMISSION_DENIED_EXIT_CODE,
};
use sandflow_governance::{AuditFilter, AuditOutcome, PermissionBroker, StaticPolicyDecider};
use sandflow_sandbox::{MockSandbox, ProcessSandbox, SandboxManager, SandboxManagerConfig};

// =============================================================================
// Helpers
// =============================================================================

fn mock_manager(broker: Arc<PermissionBroker>, mock: Arc<MockSandbox>) -> SandboxManager {
    let gate: Arc<dyn PermissionGate> = broker;
    SandboxManager::new(gate, SandboxManagerConfig::default())
        .unwrap()
        .with_backend(SandboxType::Container, mock)
}

fn process_config() -> SandboxConfiguration {
    SandboxConfiguration {
        sandbox_type: SandboxType::Process,
        ..Default::default()
    }
}

// =============================================================================
// 1. No decision handler: fail closed
// =============================================================================

#[tokio::test]
async fn test_network_denied_without_handler() {
    let broker = Arc::new(PermissionBroker::new());
    let mock = Arc::new(MockSandbox::default());
    let manager = mock_manager(broker.clone(), mock.clone());

    let env = manager.create(SandboxConfiguration::default()).await.unwrap();
    manager.start(&env.id).await.unwrap();

    let result = manager
        .execute(&env.id, "curl -s https://example.com/data.json", Duration::from_secs(5))
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.exit_code, PERMISSION_DENIED_EXIT_CODE);
    assert!(mock.commands().is_empty());

    let denied = broker
        .audit_trail(AuditFilter {
            outcome: Some(AuditOutcome::Denied),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].resource, "example.com");
    assert_eq!(denied[0].sandbox_id, env.id.to_string());
}

// =============================================================================
// 2. Interactive handler approves
// =============================================================================

#[tokio::test]
async fn test_handler_approval_lets_command_run() {
    let broker = Arc::new(PermissionBroker::new());
    let mut decisions = broker.register_handler().unwrap();
    let handler = tokio::spawn(async move {
        let pending = decisions.recv().await.unwrap();
        assert_eq!(pending.request.permission_type, PermissionType::NetworkAccess);
        assert_eq!(pending.request.resource, "pypi.org");
        pending.approve("dependency install");
    });

    let mock = Arc::new(MockSandbox::default());
    let manager = mock_manager(broker, mock.clone());
    let env = manager.create(SandboxConfiguration::default()).await.unwrap();
    manager.start(&env.id).await.unwrap();

    let result = manager
        .execute(&env.id, "pip install requests", Duration::from_secs(5))
        .await
        .unwrap();
    handler.await.unwrap();

    assert!(result.success);
    assert_eq!(mock.commands(), vec!["pip install requests"]);
}

// =============================================================================
// 3. Standing grants are reused until revoked
// =============================================================================

#[tokio::test]
async fn test_policy_grant_reused_then_revoked() {
    let broker = Arc::new(PermissionBroker::new());
    broker
        .serve(Arc::new(
            StaticPolicyDecider::new()
                .allow(PermissionType::NetworkAccess, "pypi.org")
                .unwrap()
                .with_grant_duration(Duration::from_secs(600)),
        ))
        .unwrap();

    let manager = mock_manager(broker.clone(), Arc::new(MockSandbox::default()));
    let env = manager.create(SandboxConfiguration::default()).await.unwrap();
    manager.start(&env.id).await.unwrap();

    for _ in 0..3 {
        let result = manager
            .execute(&env.id, "pip install numpy", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.success);
    }
    let approvals = broker
        .audit_trail(AuditFilter {
            outcome: Some(AuditOutcome::Approved),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(approvals.len(), 1, "grant covers later installs");

    broker.revoke(&approvals[0].request_id).await.unwrap();
    // The policy approves again, producing a fresh grant.
    let result = manager
        .execute(&env.id, "pip install scipy", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(result.success);
    let approvals = broker
        .audit_trail(AuditFilter {
            outcome: Some(AuditOutcome::Approved),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(approvals.len(), 2);
}

// =============================================================================
// 4. Real host processes
// =============================================================================

#[tokio::test]
async fn test_process_backend_end_to_end() {
    let broker = Arc::new(PermissionBroker::new());
    let gate: Arc<dyn PermissionGate> = broker.clone();
    let manager = SandboxManager::new(gate, SandboxManagerConfig::default())
        .unwrap()
        .with_backend(SandboxType::Process, Arc::new(ProcessSandbox::new()));

    let env = manager.create(process_config()).await.unwrap();
    manager.start(&env.id).await.unwrap();

    let result = manager
        .execute(
            &env.id,
            "mkdir -p out && echo 42 > out/answer && cat out/answer",
            Duration::from_secs(10),
        )
        .await
        .unwrap();
    assert!(result.success, "stderr: {}", result.stderr);
    assert_eq!(result.stdout.trim(), "42");
    assert!(result.duration_ms < 10_000);

    // Writing outside the private directory needs a decision nobody gives.
    let result = manager
        .execute(&env.id, "echo pwned > /etc/sandflow-test", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(result.exit_code, PERMISSION_DENIED_EXIT_CODE);
    assert!(matches!(
        result.violations[0].kind,
        ViolationKind::PermissionDenied {
            permission_type: PermissionType::FileSystemAccess
        }
    ));

    let result = manager
        .execute(&env.id, "sleep 5", Duration::from_millis(200))
        .await
        .unwrap();
    assert!(result.timed_out);
    assert_eq!(result.violations[0].kind, ViolationKind::Timeout);

    manager.destroy(&env.id).await.unwrap();
    manager.destroy(&env.id).await.unwrap();
    assert_eq!(manager.get(&env.id).unwrap().status, SandboxStatus::Destroyed);
}
