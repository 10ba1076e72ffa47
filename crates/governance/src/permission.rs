//! Permission broker.
//!
//! Sandboxes submit privileged operations here and wait for a decision. The
//! decision itself comes from a single registered handler (a UI, a policy
//! loop, a test) over a channel; the broker only records requests, enforces
//! timeouts, and fails closed whenever no decision can be obtained.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use regex::Regex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use sandflow_core::config::PermissionSettings;
use sandflow_core::{
    Error, EventEmitter, EventEnvelope, EventSeverity, EventType, NoOpEventEmitter,
    PermissionGate, PermissionPayload, PermissionRequest, PermissionResponse, PermissionStatus,
    PermissionType, PrivilegedOperation, Result, SandboxId,
};

use crate::audit::{AuditEntry, AuditFilter, AuditOutcome, AuditStore, InMemoryAuditStore};
use crate::metrics::track_permission_decision;

const REVOKED_REASON: &str = "revoked";

// =============================================================================
// Decision Channel
// =============================================================================

/// A request waiting for the handler's answer.
///
/// Dropping it without responding denies the request.
pub struct PendingDecision {
    pub request: PermissionRequest,
    reply: oneshot::Sender<PermissionResponse>,
}

impl PendingDecision {
    /// Send the decision. Returns `false` if the requester already gave up.
    pub fn respond(self, response: PermissionResponse) -> bool {
        self.reply.send(response).is_ok()
    }

    pub fn approve(self, reason: impl Into<String>) -> bool {
        self.respond(PermissionResponse::approve(reason))
    }

    pub fn deny(self, reason: impl Into<String>) -> bool {
        self.respond(PermissionResponse::deny(reason))
    }
}

/// Receiving end of the decision channel. Dropping it unregisters the handler.
pub struct PermissionDecisions {
    rx: mpsc::UnboundedReceiver<PendingDecision>,
}

impl PermissionDecisions {
    pub async fn recv(&mut self) -> Option<PendingDecision> {
        self.rx.recv().await
    }
}

/// Something that can answer permission requests.
#[async_trait]
pub trait PermissionDecider: Send + Sync {
    async fn decide(&self, request: &PermissionRequest) -> Result<PermissionResponse>;
}

// =============================================================================
// Broker
// =============================================================================

struct RequestEntry {
    request: PermissionRequest,
    cancel: CancellationToken,
    started: Instant,
}

pub struct PermissionBroker {
    requests: DashMap<String, RequestEntry>,
    sequence: AtomicU64,
    handler: RwLock<Option<mpsc::UnboundedSender<PendingDecision>>>,
    audit: Arc<dyn AuditStore>,
    events: Arc<dyn EventEmitter>,
}

impl Default for PermissionBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionBroker {
    pub fn new() -> Self {
        Self {
            requests: DashMap::new(),
            sequence: AtomicU64::new(0),
            handler: RwLock::new(None),
            audit: Arc::new(InMemoryAuditStore::new()),
            events: Arc::new(NoOpEventEmitter),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditStore>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventEmitter>) -> Self {
        self.events = events;
        self
    }

    // -------------------------------------------------------------------------
    // Handler Registration
    // -------------------------------------------------------------------------

    /// Become the decision handler. Only one may be registered at a time.
    pub fn register_handler(&self) -> Result<PermissionDecisions> {
        let mut slot = self.handler.write();
        if slot.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(Error::HandlerAlreadyRegistered);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *slot = Some(tx);
        tracing::info!("Permission decision handler registered");
        Ok(PermissionDecisions { rx })
    }

    pub fn unregister_handler(&self) {
        if self.handler.write().take().is_some() {
            tracing::info!("Permission decision handler unregistered");
        }
    }

    pub fn has_handler(&self) -> bool {
        self.handler
            .read()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Register `decider` as the handler and answer each request in its own task.
    pub fn serve(&self, decider: Arc<dyn PermissionDecider>) -> Result<JoinHandle<()>> {
        let mut decisions = self.register_handler()?;
        Ok(tokio::spawn(async move {
            while let Some(pending) = decisions.recv().await {
                let decider = decider.clone();
                tokio::spawn(async move {
                    let response = match decider.decide(&pending.request).await {
                        Ok(response) => response,
                        Err(e) => {
                            tracing::warn!(
                                request_id = %pending.request.id,
                                error = %e,
                                "Permission decider failed, denying"
                            );
                            PermissionResponse::deny(format!("decider error: {}", e))
                        }
                    };
                    pending.respond(response);
                });
            }
            tracing::debug!("Permission decision loop stopped");
        }))
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    /// Record `request` and wait at most `timeout` for a decision.
    ///
    /// Never fails: a missing handler, a dropped reply, or a handler panic
    /// deny the request, and silence past `timeout` expires it.
    pub async fn request_permission(
        &self,
        mut request: PermissionRequest,
        timeout: Duration,
    ) -> PermissionResponse {
        request.sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        request.status = PermissionStatus::Pending;
        request.response_reason = None;
        request.resolved_at = None;
        request.valid_for = None;
        request.requested_at = Utc::now();

        let cancel = CancellationToken::new();
        let request_id = request.id.clone();
        self.requests.insert(
            request_id.clone(),
            RequestEntry {
                request: request.clone(),
                cancel: cancel.clone(),
                started: Instant::now(),
            },
        );

        tracing::info!(
            request_id = %request_id,
            sandbox_id = %request.sandbox_id,
            permission_type = %request.permission_type,
            resource = %request.resource,
            "Permission requested"
        );
        self.emit(&request, 0, EventType::PermissionRequested).await;

        let sender = self.handler.read().clone();
        let Some(sender) = sender else {
            return self
                .resolve(&request_id, PermissionResponse::deny("no permission handler registered"))
                .await;
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if sender
            .send(PendingDecision {
                request,
                reply: reply_tx,
            })
            .is_err()
        {
            self.clear_closed_handler();
            return self
                .resolve(&request_id, PermissionResponse::deny("permission handler disconnected"))
                .await;
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => PermissionResponse::deny(REVOKED_REASON),
            outcome = tokio::time::timeout(timeout, reply_rx) => match outcome {
                Ok(Ok(response)) if response.status == PermissionStatus::Pending => {
                    PermissionResponse::deny("handler answered without a decision")
                }
                Ok(Ok(response)) => response,
                Ok(Err(_)) => PermissionResponse::deny("decision handler dropped the request"),
                Err(_) => PermissionResponse::expired(format!(
                    "no decision within {}ms",
                    timeout.as_millis()
                )),
            },
        };

        self.resolve(&request_id, response).await
    }

    /// Move a pending request to its terminal state. A request that already
    /// left `Pending` (revoked while waiting) keeps its state.
    async fn resolve(&self, request_id: &str, response: PermissionResponse) -> PermissionResponse {
        let transitioned = {
            let Some(mut entry) = self.requests.get_mut(request_id) else {
                return response;
            };
            let elapsed = entry.started.elapsed();
            if entry.request.status.is_terminal() {
                let current = &entry.request;
                return PermissionResponse {
                    status: current.status,
                    reason: current.response_reason.clone().unwrap_or_default(),
                    valid_for: None,
                };
            }
            entry.request.status = response.status;
            entry.request.response_reason = Some(response.reason.clone());
            entry.request.resolved_at = Some(Utc::now());
            entry.request.valid_for = if response.is_approved() {
                response.valid_for
            } else {
                None
            };
            (entry.request.clone(), elapsed)
        };

        let (request, elapsed) = transitioned;
        self.record_resolution(&request, elapsed).await;
        response
    }

    async fn record_resolution(&self, request: &PermissionRequest, elapsed: Duration) {
        let elapsed_ms = elapsed.as_millis() as u64;
        let outcome = match request.status {
            PermissionStatus::Approved => AuditOutcome::Approved,
            PermissionStatus::Expired => AuditOutcome::Expired,
            PermissionStatus::Denied
                if request.response_reason.as_deref() == Some(REVOKED_REASON) =>
            {
                AuditOutcome::Revoked
            }
            _ => AuditOutcome::Denied,
        };

        tracing::info!(
            request_id = %request.id,
            sandbox_id = %request.sandbox_id,
            permission_type = %request.permission_type,
            resource = %request.resource,
            status = ?request.status,
            reason = request.response_reason.as_deref().unwrap_or(""),
            elapsed_ms,
            "Permission resolved"
        );
        track_permission_decision(request.permission_type, request.status, elapsed);

        if let Err(e) = self
            .audit
            .log(AuditEntry::for_request(request, outcome, elapsed_ms))
            .await
        {
            tracing::error!(request_id = %request.id, error = %e, "Failed to write audit entry");
        }
        self.emit(request, elapsed_ms, EventType::PermissionResolved).await;
    }

    async fn emit(&self, request: &PermissionRequest, elapsed_ms: u64, event_type: EventType) {
        let severity = match request.status {
            PermissionStatus::Denied | PermissionStatus::Expired => EventSeverity::Warning,
            _ => EventSeverity::Info,
        };
        let payload = PermissionPayload {
            request_id: request.id.clone(),
            sandbox_id: request.sandbox_id.to_string(),
            permission_type: request.permission_type,
            resource: request.resource.clone(),
            status: request.status,
            reason: request.response_reason.clone(),
            elapsed_ms,
        };
        self.events
            .emit(
                EventEnvelope::from_payload(event_type, &payload)
                    .with_actor("permission-broker")
                    .with_severity(severity),
            )
            .await;
    }

    fn clear_closed_handler(&self) {
        let mut slot = self.handler.write();
        if slot.as_ref().is_some_and(|tx| tx.is_closed()) {
            *slot = None;
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Pending requests of a sandbox, in request order.
    pub fn get_pending_requests(&self, sandbox_id: &SandboxId) -> Vec<PermissionRequest> {
        let mut pending: Vec<PermissionRequest> = self
            .requests
            .iter()
            .filter(|e| {
                e.request.status == PermissionStatus::Pending && &e.request.sandbox_id == sandbox_id
            })
            .map(|e| e.request.clone())
            .collect();
        pending.sort_by_key(|r| r.sequence);
        pending
    }

    pub fn get_request(&self, request_id: &str) -> Option<PermissionRequest> {
        self.requests.get(request_id).map(|e| e.request.clone())
    }

    /// Most recent still-valid standing grant covering `operation`.
    pub fn active_grant(
        &self,
        sandbox_id: &SandboxId,
        operation: &PrivilegedOperation,
    ) -> Option<PermissionRequest> {
        let now = Utc::now();
        self.requests
            .iter()
            .filter(|e| {
                let r = &e.request;
                &r.sandbox_id == sandbox_id
                    && r.permission_type == operation.permission_type
                    && r.resource == operation.resource
                    && r.grant_active_at(now)
            })
            .map(|e| e.request.clone())
            .max_by_key(|r| r.sequence)
    }

    pub async fn audit_trail(&self, filter: AuditFilter) -> Result<Vec<AuditEntry>> {
        self.audit.query(filter).await
    }

    // -------------------------------------------------------------------------
    // Revocation
    // -------------------------------------------------------------------------

    /// Withdraw a pending or approved request. Denied and expired requests
    /// are returned unchanged.
    pub async fn revoke(&self, request_id: &str) -> Result<PermissionRequest> {
        self.revoke_with_reason(request_id, REVOKED_REASON).await
    }

    async fn revoke_with_reason(&self, request_id: &str, reason: &str) -> Result<PermissionRequest> {
        let revoked = {
            let mut entry = self
                .requests
                .get_mut(request_id)
                .ok_or_else(|| Error::PermissionRequestNotFound(request_id.to_string()))?;
            match entry.request.status {
                PermissionStatus::Pending | PermissionStatus::Approved => {
                    entry.request.status = PermissionStatus::Denied;
                    entry.request.response_reason = Some(reason.to_string());
                    entry.request.resolved_at = Some(Utc::now());
                    entry.request.valid_for = None;
                    entry.cancel.cancel();
                    (entry.request.clone(), entry.started.elapsed())
                }
                PermissionStatus::Denied | PermissionStatus::Expired => {
                    return Ok(entry.request.clone());
                }
            }
        };

        let (request, elapsed) = revoked;
        self.record_resolution(&request, elapsed).await;
        Ok(request)
    }

    /// Revoke standing grants whose `valid_for` has elapsed.
    pub async fn sweep_expired_grants(&self) -> usize {
        let now = Utc::now();
        let elapsed: Vec<String> = self
            .requests
            .iter()
            .filter(|e| {
                let r = &e.request;
                r.status == PermissionStatus::Approved
                    && r.valid_for.is_some()
                    && !r.grant_active_at(now)
            })
            .map(|e| e.key().clone())
            .collect();

        let mut swept = 0;
        for id in elapsed {
            if self.revoke_with_reason(&id, "grant elapsed").await.is_ok() {
                swept += 1;
            }
        }
        if swept > 0 {
            tracing::debug!(swept, "Swept elapsed permission grants");
        }
        swept
    }

    /// Periodically sweep elapsed grants until `cancel` fires.
    pub fn spawn_grant_sweeper(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep_expired_grants().await;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl PermissionGate for PermissionBroker {
    async fn request_permission(
        &self,
        request: PermissionRequest,
        timeout: Duration,
    ) -> PermissionResponse {
        PermissionBroker::request_permission(self, request, timeout).await
    }

    fn active_grant(
        &self,
        sandbox_id: &SandboxId,
        operation: &PrivilegedOperation,
    ) -> Option<PermissionRequest> {
        PermissionBroker::active_grant(self, sandbox_id, operation)
    }
}

// =============================================================================
// Deciders
// =============================================================================

/// Decider that approves everything.
///
/// Use only in development/testing environments.
pub struct AutoApproveDecider;

#[async_trait]
impl PermissionDecider for AutoApproveDecider {
    async fn decide(&self, request: &PermissionRequest) -> Result<PermissionResponse> {
        tracing::warn!(
            permission_type = %request.permission_type,
            resource = %request.resource,
            "AUTO-APPROVED (development mode, do NOT use in production)"
        );
        Ok(PermissionResponse::approve("auto-approved in development mode"))
    }
}

/// Allow-list decider. Anything not matched is denied.
pub struct StaticPolicyDecider {
    rules: Vec<(PermissionType, Vec<Regex>)>,
    grant_valid_for: Option<Duration>,
}

impl StaticPolicyDecider {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            grant_valid_for: None,
        }
    }

    /// Allow `resource_pattern` for `permission_type`. `*` matches any run
    /// of characters.
    pub fn allow(mut self, permission_type: PermissionType, resource_pattern: &str) -> Result<Self> {
        let regex = glob_to_regex(resource_pattern)?;
        match self.rules.iter_mut().find(|(t, _)| *t == permission_type) {
            Some((_, patterns)) => patterns.push(regex),
            None => self.rules.push((permission_type, vec![regex])),
        }
        Ok(self)
    }

    /// Attach a standing-grant duration to approvals.
    pub fn with_grant_duration(mut self, valid_for: Duration) -> Self {
        self.grant_valid_for = Some(valid_for);
        self
    }

    pub fn from_settings(settings: &PermissionSettings) -> Result<Self> {
        let mut decider = Self::new();
        for rule in &settings.allow {
            for pattern in &rule.resources {
                decider = decider.allow(rule.permission_type, pattern)?;
            }
        }
        if settings.grant_valid_for_secs > 0 {
            decider = decider.with_grant_duration(Duration::from_secs(settings.grant_valid_for_secs));
        }
        Ok(decider)
    }

    fn allows(&self, permission_type: PermissionType, resource: &str) -> bool {
        self.rules
            .iter()
            .filter(|(t, _)| *t == permission_type)
            .any(|(_, patterns)| patterns.iter().any(|p| p.is_match(resource)))
    }
}

impl Default for StaticPolicyDecider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PermissionDecider for StaticPolicyDecider {
    async fn decide(&self, request: &PermissionRequest) -> Result<PermissionResponse> {
        if self.allows(request.permission_type, &request.resource) {
            let response = PermissionResponse::approve("allowed by policy");
            Ok(match self.grant_valid_for {
                Some(d) => response.valid_for(d),
                None => response,
            })
        } else {
            Ok(PermissionResponse::deny(format!(
                "{} on '{}' is not in the allow list",
                request.permission_type, request.resource
            )))
        }
    }
}

fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("^{}$", escaped))
        .map_err(|e| Error::config(format!("invalid resource pattern '{}': {}", pattern, e)))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use sandflow_core::BroadcastEventEmitter;

    fn request(sandbox: &str, permission_type: PermissionType, resource: &str) -> PermissionRequest {
        let op = PrivilegedOperation::new(permission_type, resource, "test");
        PermissionRequest::new(SandboxId::from(sandbox), &op)
    }

    struct PanickingDecider;

    #[async_trait]
    impl PermissionDecider for PanickingDecider {
        async fn decide(&self, _request: &PermissionRequest) -> Result<PermissionResponse> {
            panic!("decider bug");
        }
    }

    struct FailingDecider;

    #[async_trait]
    impl PermissionDecider for FailingDecider {
        async fn decide(&self, _request: &PermissionRequest) -> Result<PermissionResponse> {
            Err(Error::internal("policy backend offline"))
        }
    }

    // =========================================================================
    // Fail-closed Behavior
    // =========================================================================

    #[tokio::test]
    async fn test_no_handler_denies_immediately() {
        let broker = PermissionBroker::new();
        let req = request("sb-1", PermissionType::NetworkAccess, "pypi.org");
        let id = req.id.clone();

        let response = broker
            .request_permission(req, Duration::from_secs(3600))
            .await;
        assert_eq!(response.status, PermissionStatus::Denied);
        assert_eq!(broker.get_request(&id).unwrap().status, PermissionStatus::Denied);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_expires_at_timeout() {
        let broker = PermissionBroker::new();
        let _decisions = broker.register_handler().unwrap();

        let start = tokio::time::Instant::now();
        let response = broker
            .request_permission(
                request("sb-1", PermissionType::PortBinding, "8080"),
                Duration::from_secs(30),
            )
            .await;

        assert_eq!(response.status, PermissionStatus::Expired);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_dropped_reply_denies() {
        let broker = Arc::new(PermissionBroker::new());
        let mut decisions = broker.register_handler().unwrap();

        tokio::spawn(async move {
            let pending = decisions.recv().await.unwrap();
            drop(pending);
        });

        let response = broker
            .request_permission(
                request("sb-1", PermissionType::NetworkAccess, "example.com"),
                Duration::from_secs(5),
            )
            .await;
        assert_eq!(response.status, PermissionStatus::Denied);
    }

    #[tokio::test]
    async fn test_panicking_decider_denies() {
        let broker = PermissionBroker::new();
        broker.serve(Arc::new(PanickingDecider)).unwrap();

        let response = broker
            .request_permission(
                request("sb-1", PermissionType::ProcessExecution, "kill"),
                Duration::from_secs(5),
            )
            .await;
        assert_eq!(response.status, PermissionStatus::Denied);
    }

    #[tokio::test]
    async fn test_failing_decider_denies_with_reason() {
        let broker = PermissionBroker::new();
        broker.serve(Arc::new(FailingDecider)).unwrap();

        let response = broker
            .request_permission(
                request("sb-1", PermissionType::NetworkAccess, "example.com"),
                Duration::from_secs(5),
            )
            .await;
        assert_eq!(response.status, PermissionStatus::Denied);
        assert!(response.reason.contains("policy backend offline"));
    }

    // =========================================================================
    // Handler Registration
    // =========================================================================

    #[tokio::test]
    async fn test_single_handler() {
        let broker = PermissionBroker::new();
        let decisions = broker.register_handler().unwrap();
        assert!(matches!(
            broker.register_handler(),
            Err(Error::HandlerAlreadyRegistered)
        ));

        drop(decisions);
        assert!(!broker.has_handler());
        assert!(broker.register_handler().is_ok());
    }

    #[tokio::test]
    async fn test_handler_approves() {
        let events = Arc::new(BroadcastEventEmitter::new(16));
        let mut rx = events.subscribe();
        let broker = Arc::new(PermissionBroker::new().with_events(events.clone()));
        let mut decisions = broker.register_handler().unwrap();

        tokio::spawn(async move {
            while let Some(pending) = decisions.recv().await {
                pending.approve("looks fine");
            }
        });

        let response = broker
            .request_permission(
                request("sb-1", PermissionType::NetworkAccess, "pypi.org"),
                Duration::from_secs(5),
            )
            .await;
        assert!(response.is_approved());

        assert_eq!(rx.recv().await.unwrap().event_type, EventType::PermissionRequested);
        let resolved = rx.recv().await.unwrap();
        assert_eq!(resolved.event_type, EventType::PermissionResolved);
        let payload: PermissionPayload = resolved.decode().unwrap();
        assert_eq!(payload.status, PermissionStatus::Approved);

        let trail = broker.audit_trail(AuditFilter::default()).await.unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].outcome, AuditOutcome::Approved);
    }

    // =========================================================================
    // Pending Queries and Revocation
    // =========================================================================

    #[tokio::test]
    async fn test_pending_requests_in_order_and_revoke_wakes_waiter() {
        let broker = Arc::new(PermissionBroker::new());
        let mut decisions = broker.register_handler().unwrap();

        let mut waiters = Vec::new();
        let mut held = Vec::new();
        for host in ["a.example", "b.example", "c.example"] {
            let broker = broker.clone();
            let req = request("sb-1", PermissionType::NetworkAccess, host);
            waiters.push(tokio::spawn(async move {
                broker.request_permission(req, Duration::from_secs(3600)).await
            }));
            // Wait for the request to reach the handler so arrival order is fixed.
            held.push(decisions.recv().await.unwrap());
        }

        let pending = broker.get_pending_requests(&SandboxId::from("sb-1"));
        let resources: Vec<_> = pending.iter().map(|r| r.resource.as_str()).collect();
        assert_eq!(resources, vec!["a.example", "b.example", "c.example"]);
        assert!(broker.get_pending_requests(&SandboxId::from("sb-2")).is_empty());

        let revoked = broker.revoke(&pending[1].id).await.unwrap();
        assert_eq!(revoked.status, PermissionStatus::Denied);

        let response = waiters.remove(1).await.unwrap();
        assert_eq!(response.status, PermissionStatus::Denied);
        assert_eq!(response.reason, "revoked");
        assert_eq!(broker.get_pending_requests(&SandboxId::from("sb-1")).len(), 2);
    }

    #[tokio::test]
    async fn test_revoke_unknown_request() {
        let broker = PermissionBroker::new();
        assert!(matches!(
            broker.revoke("missing").await,
            Err(Error::PermissionRequestNotFound(_))
        ));
    }

    // =========================================================================
    // Standing Grants
    // =========================================================================

    #[tokio::test]
    async fn test_standing_grant_reuse_and_revoke() {
        let broker = PermissionBroker::new();
        broker
            .serve(Arc::new(
                StaticPolicyDecider::new()
                    .allow(PermissionType::NetworkAccess, "*.crates.io")
                    .unwrap()
                    .with_grant_duration(Duration::from_secs(600)),
            ))
            .unwrap();

        let sandbox = SandboxId::from("sb-1");
        let op = PrivilegedOperation::new(PermissionType::NetworkAccess, "index.crates.io", "cargo");
        let response = broker
            .request_permission(PermissionRequest::new(sandbox.clone(), &op), Duration::from_secs(5))
            .await;
        assert!(response.is_approved());
        assert_eq!(response.valid_for, Some(Duration::from_secs(600)));

        let grant = broker.active_grant(&sandbox, &op).unwrap();
        assert!(broker.active_grant(&SandboxId::from("sb-2"), &op).is_none());

        broker.revoke(&grant.id).await.unwrap();
        assert!(broker.active_grant(&sandbox, &op).is_none());
        assert_eq!(broker.sweep_expired_grants().await, 0);
    }

    #[tokio::test]
    async fn test_static_policy_denies_unlisted() {
        let decider = StaticPolicyDecider::new()
            .allow(PermissionType::NetworkAccess, "pypi.org")
            .unwrap();

        let allowed = decider
            .decide(&request("sb", PermissionType::NetworkAccess, "pypi.org"))
            .await
            .unwrap();
        assert!(allowed.is_approved());
        assert!(allowed.valid_for.is_none());

        let denied = decider
            .decide(&request("sb", PermissionType::NetworkAccess, "evil.pypi.org.attacker"))
            .await
            .unwrap();
        assert_eq!(denied.status, PermissionStatus::Denied);

        let other_type = decider
            .decide(&request("sb", PermissionType::PortBinding, "pypi.org"))
            .await
            .unwrap();
        assert_eq!(other_type.status, PermissionStatus::Denied);
    }
}
