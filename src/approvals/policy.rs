//! Approval policies: which requests are guarded, by whom, and for how long.
//!
//! Resolution picks the highest-priority active policy whose type, risk,
//! resource pattern, and requester-role filters all match; ties break by
//! priority, then by age (older first).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::notify::Channel;

/// Closed set of guarded operation categories.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalType {
    CodeDeployment,
    DatabaseChanges,
    SystemConfiguration,
    CostExceeding,
    SecurityChanges,
    UserDataAccess,
    ExternalApiCalls,
    FileSystemChanges,
    ProductionOperations,
    EmergencyOverride,
}

impl ApprovalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalType::CodeDeployment => "code-deployment",
            ApprovalType::DatabaseChanges => "database-changes",
            ApprovalType::SystemConfiguration => "system-configuration",
            ApprovalType::CostExceeding => "cost-exceeding",
            ApprovalType::SecurityChanges => "security-changes",
            ApprovalType::UserDataAccess => "user-data-access",
            ApprovalType::ExternalApiCalls => "external-api-calls",
            ApprovalType::FileSystemChanges => "file-system-changes",
            ApprovalType::ProductionOperations => "production-operations",
            ApprovalType::EmergencyOverride => "emergency-override",
        }
    }

    pub fn all() -> [ApprovalType; 10] {
        [
            ApprovalType::CodeDeployment,
            ApprovalType::DatabaseChanges,
            ApprovalType::SystemConfiguration,
            ApprovalType::CostExceeding,
            ApprovalType::SecurityChanges,
            ApprovalType::UserDataAccess,
            ApprovalType::ExternalApiCalls,
            ApprovalType::FileSystemChanges,
            ApprovalType::ProductionOperations,
            ApprovalType::EmergencyOverride,
        ]
    }
}

impl FromStr for ApprovalType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ApprovalType::all()
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown approval type: {s}"))
    }
}

/// Who must sign off.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalLevel {
    User,
    Admin,
    Security,
    Emergency,
    System,
}

impl ApprovalLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalLevel::User => "user",
            ApprovalLevel::Admin => "admin",
            ApprovalLevel::Security => "security",
            ApprovalLevel::Emergency => "emergency",
            ApprovalLevel::System => "system",
        }
    }
}

/// Operation risk classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            _ => Err(format!("Unknown risk level: {s}")),
        }
    }
}

/// One approval policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    pub id: String,
    pub name: String,
    pub active: bool,
    /// Resolution priority, higher first.
    pub priority: i32,
    pub created_at: DateTime<Utc>,

    // Matching filters
    pub types: Vec<ApprovalType>,
    pub risk_levels: Vec<RiskLevel>,
    /// Glob patterns over the operation's resource path.
    pub resource_patterns: Vec<String>,
    /// Requester roles this policy applies to; `*` matches any.
    pub user_roles: Vec<String>,

    // Outcome
    pub level: ApprovalLevel,
    pub required_count: usize,
    pub timeout_ms: u64,
    /// Roles whose members form the approver list.
    pub approver_roles: Vec<String>,
    pub channels: Vec<Channel>,
    /// Minutes after submission at which reminders go out.
    pub reminder_intervals_minutes: Vec<u64>,
    pub escalation_notify: bool,
    pub escalation_recipients: Vec<String>,
    pub allow_bypass: bool,
    pub bypass_roles: Vec<String>,
    pub allow_self_approval: bool,
}

impl ApprovalPolicy {
    /// Whether this policy governs the given request.
    pub fn matches(
        &self,
        request_type: ApprovalType,
        risk: RiskLevel,
        resource: &str,
        requester_roles: &HashSet<String>,
    ) -> bool {
        if !self.active || !self.types.contains(&request_type) || !self.risk_levels.contains(&risk)
        {
            return false;
        }

        let resource_ok = self.resource_patterns.iter().any(|pattern| {
            glob::Pattern::new(pattern)
                .map(|p| p.matches(resource))
                .unwrap_or(false)
        });
        if !resource_ok {
            return false;
        }

        self.user_roles.iter().any(|role| role == "*")
            || self.user_roles.iter().any(|role| requester_roles.contains(role))
    }
}

/// Policy registry with resolution.
pub struct PolicyEngine {
    policies: RwLock<Vec<ApprovalPolicy>>,
}

impl PolicyEngine {
    pub fn new(policies: Vec<ApprovalPolicy>) -> Self {
        Self {
            policies: RwLock::new(policies),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub async fn add(&self, policy: ApprovalPolicy) {
        self.policies.write().await.push(policy);
    }

    pub async fn remove(&self, policy_id: &str) -> bool {
        let mut policies = self.policies.write().await;
        let before = policies.len();
        policies.retain(|p| p.id != policy_id);
        policies.len() != before
    }

    pub async fn list(&self) -> Vec<ApprovalPolicy> {
        self.policies.read().await.clone()
    }

    /// Highest-priority active match; ties by priority then creation time.
    pub async fn resolve(
        &self,
        request_type: ApprovalType,
        risk: RiskLevel,
        resource: &str,
        requester_roles: &HashSet<String>,
    ) -> Option<ApprovalPolicy> {
        let policies = self.policies.read().await;
        let mut matching: Vec<&ApprovalPolicy> = policies
            .iter()
            .filter(|p| p.matches(request_type, risk, resource, requester_roles))
            .collect();
        matching.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        matching.first().map(|p| (*p).clone())
    }

    /// The stock policy set wired at startup.
    pub fn default_policies() -> Vec<ApprovalPolicy> {
        let now = Utc::now();
        let all_risks = vec![
            RiskLevel::Low,
            RiskLevel::Medium,
            RiskLevel::High,
            RiskLevel::Critical,
        ];

        vec![
            ApprovalPolicy {
                id: Uuid::new_v4().to_string(),
                name: "security-critical".to_string(),
                active: true,
                priority: 100,
                created_at: now,
                types: vec![
                    ApprovalType::SecurityChanges,
                    ApprovalType::EmergencyOverride,
                    ApprovalType::UserDataAccess,
                ],
                risk_levels: all_risks.clone(),
                resource_patterns: vec!["*".to_string()],
                user_roles: vec!["*".to_string()],
                level: ApprovalLevel::Security,
                required_count: 2,
                timeout_ms: 30 * 60 * 1000,
                approver_roles: vec!["security".to_string()],
                channels: vec![Channel::Email, Channel::Websocket],
                reminder_intervals_minutes: vec![10, 20],
                escalation_notify: true,
                escalation_recipients: Vec::new(),
                allow_bypass: true,
                bypass_roles: vec!["security".to_string()],
                allow_self_approval: false,
            },
            ApprovalPolicy {
                id: Uuid::new_v4().to_string(),
                name: "production-deployments".to_string(),
                active: true,
                priority: 50,
                created_at: now,
                types: vec![
                    ApprovalType::CodeDeployment,
                    ApprovalType::ProductionOperations,
                    ApprovalType::DatabaseChanges,
                ],
                risk_levels: all_risks.clone(),
                resource_patterns: vec!["*".to_string()],
                user_roles: vec!["*".to_string()],
                level: ApprovalLevel::Admin,
                required_count: 1,
                timeout_ms: 60 * 60 * 1000,
                approver_roles: vec!["admin".to_string()],
                channels: vec![Channel::Email, Channel::Websocket],
                reminder_intervals_minutes: vec![15, 30],
                escalation_notify: true,
                escalation_recipients: Vec::new(),
                allow_bypass: true,
                bypass_roles: vec!["admin".to_string(), "security".to_string()],
                allow_self_approval: false,
            },
            ApprovalPolicy {
                id: Uuid::new_v4().to_string(),
                name: "routine-changes".to_string(),
                active: true,
                priority: 0,
                created_at: now,
                types: vec![
                    ApprovalType::SystemConfiguration,
                    ApprovalType::CostExceeding,
                    ApprovalType::ExternalApiCalls,
                    ApprovalType::FileSystemChanges,
                ],
                risk_levels: all_risks,
                resource_patterns: vec!["*".to_string()],
                user_roles: vec!["*".to_string()],
                level: ApprovalLevel::User,
                required_count: 1,
                timeout_ms: 60 * 60 * 1000,
                approver_roles: vec!["admin".to_string(), "operator".to_string()],
                channels: vec![Channel::Websocket],
                reminder_intervals_minutes: vec![30],
                escalation_notify: false,
                escalation_recipients: Vec::new(),
                allow_bypass: false,
                bypass_roles: Vec::new(),
                allow_self_approval: true,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn policy(name: &str, priority: i32) -> ApprovalPolicy {
        ApprovalPolicy {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            active: true,
            priority,
            created_at: Utc::now(),
            types: vec![ApprovalType::CodeDeployment],
            risk_levels: vec![RiskLevel::High],
            resource_patterns: vec!["*".to_string()],
            user_roles: vec!["*".to_string()],
            level: ApprovalLevel::Admin,
            required_count: 1,
            timeout_ms: 60_000,
            approver_roles: vec!["admin".to_string()],
            channels: vec![Channel::Websocket],
            reminder_intervals_minutes: vec![],
            escalation_notify: false,
            escalation_recipients: vec![],
            allow_bypass: false,
            bypass_roles: vec![],
            allow_self_approval: false,
        }
    }

    #[tokio::test]
    async fn resolution_prefers_higher_priority() {
        let engine = PolicyEngine::new(vec![policy("low", 1), policy("high", 9)]);
        let resolved = engine
            .resolve(
                ApprovalType::CodeDeployment,
                RiskLevel::High,
                "/srv/app",
                &roles(&["developer"]),
            )
            .await
            .unwrap();
        assert_eq!(resolved.name, "high");
    }

    #[tokio::test]
    async fn ties_break_by_age() {
        let mut older = policy("older", 5);
        older.created_at = Utc::now() - chrono::Duration::hours(1);
        let newer = policy("newer", 5);
        let engine = PolicyEngine::new(vec![newer, older]);

        let resolved = engine
            .resolve(
                ApprovalType::CodeDeployment,
                RiskLevel::High,
                "/srv/app",
                &roles(&[]),
            )
            .await
            .unwrap();
        assert_eq!(resolved.name, "older");
    }

    #[tokio::test]
    async fn resource_patterns_are_globs() {
        let mut scoped = policy("scoped", 1);
        scoped.resource_patterns = vec!["/srv/production/*".to_string()];
        let engine = PolicyEngine::new(vec![scoped]);

        assert!(engine
            .resolve(
                ApprovalType::CodeDeployment,
                RiskLevel::High,
                "/srv/production/api",
                &roles(&[]),
            )
            .await
            .is_some());
        assert!(engine
            .resolve(
                ApprovalType::CodeDeployment,
                RiskLevel::High,
                "/srv/staging/api",
                &roles(&[]),
            )
            .await
            .is_none());
    }

    #[tokio::test]
    async fn role_filter_requires_membership_unless_wildcard() {
        let mut gated = policy("gated", 1);
        gated.user_roles = vec!["deployer".to_string()];
        let engine = PolicyEngine::new(vec![gated]);

        assert!(engine
            .resolve(
                ApprovalType::CodeDeployment,
                RiskLevel::High,
                "/srv/app",
                &roles(&["deployer"]),
            )
            .await
            .is_some());
        assert!(engine
            .resolve(
                ApprovalType::CodeDeployment,
                RiskLevel::High,
                "/srv/app",
                &roles(&["viewer"]),
            )
            .await
            .is_none());
    }

    #[tokio::test]
    async fn inactive_and_mismatched_policies_never_resolve() {
        let mut inactive = policy("inactive", 9);
        inactive.active = false;
        let engine = PolicyEngine::new(vec![inactive]);

        assert!(engine
            .resolve(
                ApprovalType::CodeDeployment,
                RiskLevel::High,
                "/srv/app",
                &roles(&[]),
            )
            .await
            .is_none());
        // Risk outside the policy's set
        let engine = PolicyEngine::new(vec![policy("p", 1)]);
        assert!(engine
            .resolve(
                ApprovalType::CodeDeployment,
                RiskLevel::Low,
                "/srv/app",
                &roles(&[]),
            )
            .await
            .is_none());
    }

    #[test]
    fn default_policies_cover_every_approval_type() {
        let policies = PolicyEngine::default_policies();
        for approval_type in ApprovalType::all() {
            assert!(
                policies.iter().any(|p| p.types.contains(&approval_type)),
                "no default policy covers {}",
                approval_type.as_str()
            );
        }
    }
}
