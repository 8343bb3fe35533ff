//! Append-only audit trail for the approval gate.
//!
//! Every state transition of a request appends exactly one entry; entries
//! are never mutated or deleted within the retention period.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Verb recorded for one audited action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    RequestSubmitted,
    DecisionApprove,
    DecisionReject,
    EmergencyBypass,
    RequestExpired,
    Escalated,
    ReminderSent,
    Cancelled,
}

impl AuditAction {
    pub fn verb(&self) -> &'static str {
        match self {
            AuditAction::RequestSubmitted => "request_submitted",
            AuditAction::DecisionApprove => "decision_approve",
            AuditAction::DecisionReject => "decision_reject",
            AuditAction::EmergencyBypass => "emergency_bypass",
            AuditAction::RequestExpired => "request_expired",
            AuditAction::Escalated => "escalated",
            AuditAction::ReminderSent => "reminder_sent",
            AuditAction::Cancelled => "cancelled",
        }
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "request_submitted" => Ok(AuditAction::RequestSubmitted),
            "decision_approve" => Ok(AuditAction::DecisionApprove),
            "decision_reject" => Ok(AuditAction::DecisionReject),
            "emergency_bypass" => Ok(AuditAction::EmergencyBypass),
            "request_expired" => Ok(AuditAction::RequestExpired),
            "escalated" => Ok(AuditAction::Escalated),
            "reminder_sent" => Ok(AuditAction::ReminderSent),
            "cancelled" => Ok(AuditAction::Cancelled),
            _ => Err(format!("Unknown audit action: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Info,
    Critical,
}

impl AuditSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditSeverity::Info => "info",
            AuditSeverity::Critical => "critical",
        }
    }
}

impl FromStr for AuditSeverity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "info" => Ok(AuditSeverity::Info),
            "critical" => Ok(AuditSeverity::Critical),
            _ => Err(format!("Unknown audit severity: {s}")),
        }
    }
}

/// One immutable audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub request_id: String,
    pub action: AuditAction,
    pub actor: String,
    pub severity: AuditSeverity,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        request_id: impl Into<String>,
        action: AuditAction,
        actor: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        let severity = match action {
            AuditAction::EmergencyBypass => AuditSeverity::Critical,
            _ => AuditSeverity::Info,
        };
        Self {
            id: Uuid::new_v4().to_string(),
            request_id: request_id.into(),
            action,
            actor: actor.into(),
            severity,
            details,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bypass_entries_are_critical() {
        let entry = AuditEntry::new(
            "req-1",
            AuditAction::EmergencyBypass,
            "admin-1",
            serde_json::json!({"reason": "incident"}),
        );
        assert_eq!(entry.severity, AuditSeverity::Critical);
        assert_eq!(entry.action.verb(), "emergency_bypass");
    }

    #[test]
    fn verbs_round_trip() {
        for action in [
            AuditAction::RequestSubmitted,
            AuditAction::DecisionApprove,
            AuditAction::DecisionReject,
            AuditAction::EmergencyBypass,
            AuditAction::RequestExpired,
            AuditAction::Escalated,
            AuditAction::ReminderSent,
            AuditAction::Cancelled,
        ] {
            assert_eq!(action.verb().parse::<AuditAction>().unwrap(), action);
        }
    }
}
