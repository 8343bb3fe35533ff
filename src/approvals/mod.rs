//! Human-approval gate for guarded operations.
//!
//! Requests move through a small absorbing state machine:
//! `pending -> approved | rejected | expired | bypassed | cancelled`.
//! Approval needs a quorum of distinct approvers with zero rejections; any
//! single rejection vetoes immediately. Every transition appends one audit
//! entry. Timeouts, reminders, and escalation run as per-request scheduled
//! tasks that are cancelled on resolution.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{BusEvent, EventBus};
use crate::constants::APPROVAL_EVICTION_HOURS;
use crate::notify::{Channel, Notification, NotificationDispatcher};
use crate::roles::RoleOracle;
use crate::storage::AuditStore;
use crate::{KernelError, Result};

mod audit;
mod policy;

pub use audit::{AuditAction, AuditEntry, AuditSeverity};
pub use policy::{ApprovalLevel, ApprovalPolicy, ApprovalType, PolicyEngine, RiskLevel};

/// The operation a request guards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationDescriptor {
    pub action: String,
    pub resource: String,
    pub parameters: HashMap<String, String>,
    pub risk: RiskLevel,
    pub reversible: bool,
}

/// Caller context carried on a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    pub user_id: String,
    pub session_id: Option<String>,
    pub task_chain_id: Option<String>,
    pub correlation_id: Option<String>,
}

/// Lifecycle state of a request; terminal states are absorbing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
    Expired,
    Bypassed,
    Cancelled,
}

impl ApprovalState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalState::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalState::Pending => "pending",
            ApprovalState::Approved => "approved",
            ApprovalState::Rejected => "rejected",
            ApprovalState::Expired => "expired",
            ApprovalState::Bypassed => "bypassed",
            ApprovalState::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DecisionChoice {
    Approve,
    Reject,
}

/// One approver's recorded decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub request_id: String,
    pub decider_id: String,
    pub choice: DecisionChoice,
    pub reason: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// One escalation step after expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationEntry {
    pub level: u32,
    pub escalated_at: DateTime<Utc>,
    pub notified: Vec<String>,
}

/// Record of an emergency bypass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BypassInfo {
    pub actor_id: String,
    pub reason: String,
    pub bypassed_at: DateTime<Utc>,
}

/// A guarded-operation approval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub request_type: ApprovalType,
    pub level: ApprovalLevel,
    pub state: ApprovalState,
    pub title: String,
    pub description: String,
    pub requester_id: String,
    pub requested_at: DateTime<Utc>,
    pub operation: OperationDescriptor,
    pub approvers: Vec<String>,
    pub required_count: usize,
    pub decisions: Vec<ApprovalDecision>,
    pub expires_at: DateTime<Utc>,
    pub timeout_ms: u64,
    pub context: RequestContext,
    pub escalation_level: u32,
    pub escalation_history: Vec<EscalationEntry>,
    pub bypass: Option<BypassInfo>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Snapshot of the policy that matched at submission.
    pub policy: ApprovalPolicy,
}

impl ApprovalRequest {
    pub fn approve_count(&self) -> usize {
        self.decisions
            .iter()
            .filter(|d| d.choice == DecisionChoice::Approve)
            .count()
    }

    pub fn reject_count(&self) -> usize {
        self.decisions
            .iter()
            .filter(|d| d.choice == DecisionChoice::Reject)
            .count()
    }
}

/// Caller-supplied tweaks on top of the matched policy.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub title: Option<String>,
    pub description: Option<String>,
    pub timeout_ms: Option<u64>,
    pub approvers: Option<Vec<String>>,
    pub required_count: Option<usize>,
}

/// Record of one notification the gate sent (or handed to the dispatcher).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub recipient_id: String,
    pub channel: Channel,
    pub subject: String,
    pub sent_at: DateTime<Utc>,
}

/// Everything known about one request.
#[derive(Debug, Clone)]
pub struct ApprovalHistory {
    pub request: ApprovalRequest,
    pub decisions: Vec<ApprovalDecision>,
    pub audit: Vec<AuditEntry>,
    pub notifications: Vec<NotificationRecord>,
}

/// Aggregate counters over the gate's working memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalStatistics {
    pub total: u64,
    pub pending: u64,
    pub by_state: HashMap<String, u64>,
    pub by_type: HashMap<String, u64>,
    pub by_level: HashMap<String, u64>,
    pub average_resolution_ms: Option<f64>,
    pub bypass_count: u64,
    pub escalation_count: u64,
}

/// The approval gate.
pub struct ApprovalGate {
    policies: PolicyEngine,
    requests: Mutex<HashMap<String, ApprovalRequest>>,
    timers: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
    notifications: Mutex<HashMap<String, Vec<NotificationRecord>>>,
    audit: Arc<dyn AuditStore>,
    roles: Arc<dyn RoleOracle>,
    notifier: Arc<dyn NotificationDispatcher>,
    bus: EventBus,
    queue_cap: usize,
}

impl ApprovalGate {
    pub fn new(
        policies: PolicyEngine,
        audit: Arc<dyn AuditStore>,
        roles: Arc<dyn RoleOracle>,
        notifier: Arc<dyn NotificationDispatcher>,
        bus: EventBus,
        queue_cap: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            policies,
            requests: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            notifications: Mutex::new(HashMap::new()),
            audit,
            roles,
            notifier,
            bus,
            queue_cap,
        })
    }

    /// Submit a guarded operation for approval.
    pub async fn submit(
        self: &Arc<Self>,
        request_type: ApprovalType,
        operation: OperationDescriptor,
        context: RequestContext,
        options: SubmitOptions,
    ) -> Result<ApprovalRequest> {
        {
            let requests = self.requests.lock().await;
            let pending = requests
                .values()
                .filter(|r| r.state == ApprovalState::Pending)
                .count();
            if pending >= self.queue_cap {
                return Err(KernelError::QueueFull);
            }
        }

        let requester_roles = self.roles.roles_of(&context.user_id).await;
        let policy = self
            .policies
            .resolve(
                request_type,
                operation.risk,
                &operation.resource,
                &requester_roles,
            )
            .await
            .ok_or_else(|| KernelError::NoPolicy(request_type.as_str().to_string()))?;

        let approvers = match options.approvers {
            Some(approvers) if !approvers.is_empty() => approvers,
            _ => {
                let mut resolved = Vec::new();
                for role in &policy.approver_roles {
                    for user in self.roles.users_in_role(role).await {
                        if !resolved.contains(&user) {
                            resolved.push(user);
                        }
                    }
                }
                resolved
            }
        };
        if approvers.is_empty() {
            return Err(KernelError::Validation(format!(
                "policy {} resolves no approvers",
                policy.name
            )));
        }

        let required_count = options.required_count.unwrap_or(policy.required_count);
        if required_count == 0 || required_count > approvers.len() {
            return Err(KernelError::Validation(format!(
                "required approval count {} is unsatisfiable with {} approvers",
                required_count,
                approvers.len()
            )));
        }

        let timeout_ms = options.timeout_ms.unwrap_or(policy.timeout_ms);
        let now = Utc::now();
        let request = ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            request_type,
            level: policy.level,
            state: ApprovalState::Pending,
            title: options
                .title
                .unwrap_or_else(|| format!("{} on {}", operation.action, operation.resource)),
            description: options.description.unwrap_or_default(),
            requester_id: context.user_id.clone(),
            requested_at: now,
            operation,
            approvers,
            required_count,
            decisions: Vec::new(),
            expires_at: now + Duration::milliseconds(timeout_ms as i64),
            timeout_ms,
            context,
            escalation_level: 0,
            escalation_history: Vec::new(),
            bypass: None,
            resolved_at: None,
            policy,
        };

        self.requests
            .lock()
            .await
            .insert(request.id.clone(), request.clone());

        self.audit
            .append(&AuditEntry::new(
                &request.id,
                AuditAction::RequestSubmitted,
                &request.requester_id,
                serde_json::json!({
                    "type": request.request_type.as_str(),
                    "risk": request.operation.risk.as_str(),
                    "resource": request.operation.resource,
                    "approvers": request.approvers,
                    "required_count": request.required_count,
                }),
            ))
            .await?;

        info!(
            request_id = %request.id,
            request_type = request.request_type.as_str(),
            level = request.level.as_str(),
            "approval request submitted"
        );
        self.bus.publish(BusEvent::ApprovalRequired {
            request_id: request.id.clone(),
            level: request.level.as_str().to_string(),
        });

        self.notify_users(
            &request.id,
            &request.approvers,
            &request.policy.channels,
            format!("Approval required: {}", request.title),
            format!(
                "{} requested {} on {} (risk: {})",
                request.requester_id,
                request.operation.action,
                request.operation.resource,
                request.operation.risk.as_str()
            ),
            serde_json::json!({ "request_id": request.id }),
        )
        .await;

        self.schedule_timers(&request).await;

        Ok(request)
    }

    /// Record one approver's decision and apply the state machine.
    pub async fn decide(
        self: &Arc<Self>,
        request_id: &str,
        actor_id: &str,
        choice: DecisionChoice,
        reason: Option<String>,
    ) -> Result<ApprovalDecision> {
        let (decision, new_state) = {
            let mut requests = self.requests.lock().await;
            let request = requests
                .get_mut(request_id)
                .ok_or_else(|| KernelError::NotFound(format!("approval request {request_id}")))?;

            if request.state != ApprovalState::Pending {
                return Err(KernelError::Validation(format!(
                    "request {} is not pending (state: {})",
                    request_id,
                    request.state.as_str()
                )));
            }
            if !request.approvers.iter().any(|a| a == actor_id) {
                return Err(KernelError::Validation(format!(
                    "{actor_id} is not an approver for this request"
                )));
            }
            if request.decisions.iter().any(|d| d.decider_id == actor_id) {
                return Err(KernelError::Validation(format!(
                    "{actor_id} has already decided on this request"
                )));
            }
            if !request.policy.allow_self_approval && actor_id == request.requester_id {
                return Err(KernelError::Validation(
                    "requester may not approve their own request".to_string(),
                ));
            }

            let decision = ApprovalDecision {
                request_id: request_id.to_string(),
                decider_id: actor_id.to_string(),
                choice,
                reason,
                decided_at: Utc::now(),
            };
            request.decisions.push(decision.clone());

            // Veto: any rejection is immediately terminal. Otherwise the
            // request resolves once the quorum is met.
            let new_state = if request.reject_count() > 0 {
                Some(ApprovalState::Rejected)
            } else if request.approve_count() >= request.required_count {
                Some(ApprovalState::Approved)
            } else {
                None
            };
            if let Some(state) = new_state {
                request.state = state;
                request.resolved_at = Some(Utc::now());
            }
            (decision, new_state)
        };

        let audit_action = match choice {
            DecisionChoice::Approve => AuditAction::DecisionApprove,
            DecisionChoice::Reject => AuditAction::DecisionReject,
        };
        self.audit
            .append(&AuditEntry::new(
                request_id,
                audit_action,
                actor_id,
                serde_json::json!({
                    "reason": decision.reason,
                    "resulting_state": new_state.map(|s| s.as_str()),
                }),
            ))
            .await?;

        self.bus.publish(BusEvent::ApprovalDecided {
            request_id: request_id.to_string(),
            decider_id: actor_id.to_string(),
            approved: choice == DecisionChoice::Approve,
        });

        match new_state {
            Some(ApprovalState::Approved) => {
                info!(request_id, "approval request approved");
                self.cancel_timers(request_id).await;
                self.bus.publish(BusEvent::ApprovalGranted {
                    request_id: request_id.to_string(),
                });
            }
            Some(ApprovalState::Rejected) => {
                info!(request_id, actor_id, "approval request rejected");
                self.cancel_timers(request_id).await;
                self.bus.publish(BusEvent::ApprovalRejected {
                    request_id: request_id.to_string(),
                });
            }
            _ => {}
        }

        Ok(decision)
    }

    /// Emergency bypass of a pending request.
    ///
    /// Requires the matched policy to allow bypass and the actor to hold one
    /// of its bypass roles; always audited at critical severity.
    pub async fn bypass(
        self: &Arc<Self>,
        request_id: &str,
        actor_id: &str,
        reason: &str,
        emergency_context: HashMap<String, String>,
    ) -> Result<ApprovalRequest> {
        if reason.trim().is_empty() {
            return Err(KernelError::Validation(
                "bypass requires a non-empty reason".to_string(),
            ));
        }

        let actor_roles = self.roles.roles_of(actor_id).await;

        let request = {
            let mut requests = self.requests.lock().await;
            let request = requests
                .get_mut(request_id)
                .ok_or_else(|| KernelError::NotFound(format!("approval request {request_id}")))?;

            if request.state != ApprovalState::Pending {
                return Err(KernelError::Validation(format!(
                    "request {} is not pending (state: {})",
                    request_id,
                    request.state.as_str()
                )));
            }
            if !request.policy.allow_bypass {
                return Err(KernelError::Validation(
                    "matched policy does not allow emergency bypass".to_string(),
                ));
            }
            if !request
                .policy
                .bypass_roles
                .iter()
                .any(|role| actor_roles.contains(role))
            {
                return Err(KernelError::Validation(format!(
                    "{actor_id} does not hold a bypass role for this policy"
                )));
            }

            request.state = ApprovalState::Bypassed;
            request.resolved_at = Some(Utc::now());
            request.bypass = Some(BypassInfo {
                actor_id: actor_id.to_string(),
                reason: reason.to_string(),
                bypassed_at: Utc::now(),
            });
            request.clone()
        };

        self.audit
            .append(&AuditEntry::new(
                request_id,
                AuditAction::EmergencyBypass,
                actor_id,
                serde_json::json!({
                    "reason": reason,
                    "emergency_context": emergency_context,
                }),
            ))
            .await?;

        warn!(request_id, actor_id, reason, "approval request bypassed");
        self.cancel_timers(request_id).await;
        self.bus.publish(BusEvent::ApprovalBypassed {
            request_id: request_id.to_string(),
            actor_id: actor_id.to_string(),
        });

        // Security always hears about bypasses.
        let security = self.roles.users_in_role("security").await;
        if !security.is_empty() {
            self.notify_users(
                request_id,
                &security,
                &[Channel::Email, Channel::Websocket],
                format!("Emergency bypass of {}", request.title),
                format!("{actor_id} bypassed approval: {reason}"),
                serde_json::json!({ "request_id": request_id }),
            )
            .await;
        }

        Ok(request)
    }

    /// Cancel a pending request from outside the approval flow.
    pub async fn cancel(self: &Arc<Self>, request_id: &str, actor_id: &str) -> Result<()> {
        {
            let mut requests = self.requests.lock().await;
            let request = requests
                .get_mut(request_id)
                .ok_or_else(|| KernelError::NotFound(format!("approval request {request_id}")))?;
            if request.state != ApprovalState::Pending {
                return Err(KernelError::Validation(format!(
                    "request {} is not pending (state: {})",
                    request_id,
                    request.state.as_str()
                )));
            }
            request.state = ApprovalState::Cancelled;
            request.resolved_at = Some(Utc::now());
        }

        self.audit
            .append(&AuditEntry::new(
                request_id,
                AuditAction::Cancelled,
                actor_id,
                serde_json::json!({}),
            ))
            .await?;
        self.cancel_timers(request_id).await;
        debug!(request_id, "approval request cancelled");
        Ok(())
    }

    /// Pending requests where the user is an approver or the requester,
    /// oldest first.
    pub async fn pending_for(&self, user_id: &str) -> Vec<ApprovalRequest> {
        let requests = self.requests.lock().await;
        let mut pending: Vec<ApprovalRequest> = requests
            .values()
            .filter(|r| {
                r.state == ApprovalState::Pending
                    && (r.requester_id == user_id || r.approvers.iter().any(|a| a == user_id))
            })
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        pending
    }

    /// Current snapshot of one request; `None` for unknown or evicted ids.
    pub async fn status(&self, request_id: &str) -> Option<ApprovalRequest> {
        self.requests.lock().await.get(request_id).cloned()
    }

    /// Request, decisions, audit log, and notification records.
    pub async fn history(&self, request_id: &str) -> Result<ApprovalHistory> {
        let request = self
            .status(request_id)
            .await
            .ok_or_else(|| KernelError::NotFound(format!("approval request {request_id}")))?;
        let audit = self.audit.entries_for_request(request_id).await?;
        let notifications = self
            .notifications
            .lock()
            .await
            .get(request_id)
            .cloned()
            .unwrap_or_default();
        Ok(ApprovalHistory {
            decisions: request.decisions.clone(),
            request,
            audit,
            notifications,
        })
    }

    /// Counters over working memory, optionally restricted to requests
    /// submitted within the last `window_hours`. Working memory retains
    /// terminal requests for 24 h, which bounds the usable window; the
    /// durable audit trail covers anything older.
    pub async fn statistics(&self, window_hours: Option<i64>) -> Result<ApprovalStatistics> {
        let cutoff = window_hours.map(|hours| Utc::now() - Duration::hours(hours));
        let requests = self.requests.lock().await;
        let mut stats = ApprovalStatistics::default();

        let mut resolution_total_ms = 0f64;
        let mut resolved = 0u64;

        for request in requests.values() {
            if let Some(cutoff) = cutoff {
                if request.requested_at < cutoff {
                    continue;
                }
            }
            stats.total += 1;
            *stats
                .by_state
                .entry(request.state.as_str().to_string())
                .or_insert(0) += 1;
            *stats
                .by_type
                .entry(request.request_type.as_str().to_string())
                .or_insert(0) += 1;
            *stats
                .by_level
                .entry(request.level.as_str().to_string())
                .or_insert(0) += 1;

            if request.state == ApprovalState::Pending {
                stats.pending += 1;
            }
            if request.state == ApprovalState::Bypassed {
                stats.bypass_count += 1;
            }
            stats.escalation_count += request.escalation_level as u64;

            if let Some(resolved_at) = request.resolved_at {
                resolution_total_ms +=
                    (resolved_at - request.requested_at).num_milliseconds() as f64;
                resolved += 1;
            }
        }

        if resolved > 0 {
            stats.average_resolution_ms = Some(resolution_total_ms / resolved as f64);
        }
        Ok(stats)
    }

    /// Evict terminal requests older than the retention horizon.
    pub async fn evict_resolved(&self) -> usize {
        let cutoff = Utc::now() - Duration::hours(APPROVAL_EVICTION_HOURS);
        let mut requests = self.requests.lock().await;
        let evicted_ids: Vec<String> = requests
            .iter()
            .filter(|(_, r)| {
                r.state.is_terminal() && r.resolved_at.map(|t| t < cutoff).unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &evicted_ids {
            requests.remove(id);
        }
        drop(requests);

        if !evicted_ids.is_empty() {
            let mut notifications = self.notifications.lock().await;
            for id in &evicted_ids {
                notifications.remove(id);
            }
        }
        evicted_ids.len()
    }

    /// Periodic working-memory eviction.
    pub fn spawn_maintenance_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(600));
            interval.tick().await;
            loop {
                interval.tick().await;
                let evicted = self.evict_resolved().await;
                if evicted > 0 {
                    debug!(evicted, "evicted resolved approval requests");
                }
            }
        })
    }

    // ---- internals -----------------------------------------------------

    async fn schedule_timers(self: &Arc<Self>, request: &ApprovalRequest) {
        let mut handles = Vec::new();

        // Expiry task: one per request, cancelled on resolution.
        {
            let gate = Arc::clone(self);
            let request_id = request.id.clone();
            let timeout = std::time::Duration::from_millis(request.timeout_ms);
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Err(e) = gate.expire_request(&request_id).await {
                    warn!(request_id = %request_id, error = %e, "expiry handling failed");
                }
            }));
        }

        // Reminders, suppressed once the request is terminal.
        for minutes in &request.policy.reminder_intervals_minutes {
            let delay_ms = minutes * 60_000;
            if delay_ms >= request.timeout_ms {
                continue;
            }
            let gate = Arc::clone(self);
            let request_id = request.id.clone();
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                gate.send_reminder(&request_id).await;
            }));
        }

        self.timers.lock().await.insert(request.id.clone(), handles);
    }

    async fn cancel_timers(&self, request_id: &str) {
        if let Some(handles) = self.timers.lock().await.remove(request_id) {
            for handle in handles {
                handle.abort();
            }
        }
    }

    async fn expire_request(self: &Arc<Self>, request_id: &str) -> Result<()> {
        let expired = {
            let mut requests = self.requests.lock().await;
            match requests.get_mut(request_id) {
                Some(request) if request.state == ApprovalState::Pending => {
                    request.state = ApprovalState::Expired;
                    request.resolved_at = Some(Utc::now());
                    Some(request.clone())
                }
                _ => None,
            }
        };
        let Some(request) = expired else {
            return Ok(());
        };

        self.audit
            .append(&AuditEntry::new(
                request_id,
                AuditAction::RequestExpired,
                "system",
                serde_json::json!({ "timeout_ms": request.timeout_ms }),
            ))
            .await?;
        info!(request_id, "approval request expired");
        self.bus.publish(BusEvent::ApprovalExpired {
            request_id: request_id.to_string(),
        });

        self.notify_users(
            request_id,
            &request.approvers,
            &request.policy.channels,
            format!("Approval expired: {}", request.title),
            "The approval window elapsed with no resolution".to_string(),
            serde_json::json!({ "request_id": request_id }),
        )
        .await;

        // Escalation is a signalling mechanism only; the timeout is spent.
        if request.policy.escalation_notify {
            self.escalate(request_id).await?;
        }
        Ok(())
    }

    async fn escalate(self: &Arc<Self>, request_id: &str) -> Result<()> {
        let recipients = {
            let recipients = {
                let requests = self.requests.lock().await;
                requests
                    .get(request_id)
                    .map(|r| r.policy.escalation_recipients.clone())
                    .unwrap_or_default()
            };
            if recipients.is_empty() {
                self.roles.users_in_role("admin").await
            } else {
                recipients
            }
        };

        let (level, title, channels) = {
            let mut requests = self.requests.lock().await;
            let Some(request) = requests.get_mut(request_id) else {
                return Ok(());
            };
            request.escalation_level += 1;
            request.escalation_history.push(EscalationEntry {
                level: request.escalation_level,
                escalated_at: Utc::now(),
                notified: recipients.clone(),
            });
            (
                request.escalation_level,
                request.title.clone(),
                request.policy.channels.clone(),
            )
        };

        self.audit
            .append(&AuditEntry::new(
                request_id,
                AuditAction::Escalated,
                "system",
                serde_json::json!({ "level": level, "notified": recipients }),
            ))
            .await?;
        warn!(request_id, level, "approval request escalated");

        self.notify_users(
            request_id,
            &recipients,
            &channels,
            format!("Escalation (level {level}): {title}"),
            "An approval request expired without resolution".to_string(),
            serde_json::json!({ "request_id": request_id, "escalation_level": level }),
        )
        .await;
        Ok(())
    }

    async fn send_reminder(self: &Arc<Self>, request_id: &str) {
        let reminder = {
            let requests = self.requests.lock().await;
            requests
                .get(request_id)
                .filter(|r| r.state == ApprovalState::Pending)
                .map(|r| (r.approvers.clone(), r.policy.channels.clone(), r.title.clone()))
        };
        let Some((approvers, channels, title)) = reminder else {
            return;
        };

        if let Err(e) = self
            .audit
            .append(&AuditEntry::new(
                request_id,
                AuditAction::ReminderSent,
                "system",
                serde_json::json!({}),
            ))
            .await
        {
            warn!(request_id, error = %e, "failed to audit reminder");
        }

        self.notify_users(
            request_id,
            &approvers,
            &channels,
            format!("Reminder: approval pending for {title}"),
            "An approval request is still waiting on your decision".to_string(),
            serde_json::json!({ "request_id": request_id }),
        )
        .await;
    }

    /// Fan a notification out to users across the policy's channels.
    ///
    /// Dispatch is fire-and-forget: each send runs in its own task so retry
    /// backoff never blocks gate operations.
    async fn notify_users(
        &self,
        request_id: &str,
        recipients: &[String],
        channels: &[Channel],
        subject: String,
        body: String,
        data: serde_json::Value,
    ) {
        let mut log = self.notifications.lock().await;
        let entries = log.entry(request_id.to_string()).or_default();

        for recipient in recipients {
            for channel in channels {
                entries.push(NotificationRecord {
                    recipient_id: recipient.clone(),
                    channel: *channel,
                    subject: subject.clone(),
                    sent_at: Utc::now(),
                });

                let notifier = Arc::clone(&self.notifier);
                let notification = Notification {
                    recipient_id: recipient.clone(),
                    channel: *channel,
                    subject: subject.clone(),
                    body: body.clone(),
                    data: data.clone(),
                };
                tokio::spawn(async move {
                    if let Err(e) = notifier.dispatch(notification).await {
                        warn!(error = %e, "notification dispatch gave up");
                    }
                });
            }
        }
    }
}
