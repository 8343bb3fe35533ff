//! Durable storage seams for the kernel.
//!
//! Two narrow traits cover everything the kernel persists: usage records
//! and alerts (`UsageStore`) and the approval audit trail (`AuditStore`).
//! The sqlite driver is the production backend; the in-memory store backs
//! tests and scratch deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tokio::sync::Mutex;

use crate::approvals::{AuditEntry, AuditSeverity};
use crate::usage::{AlertFilter, AlertRecord, UsageRecord};
use crate::Result;

mod sqlite;
pub use sqlite::SqliteStore;

/// Persistence for usage records and alert records.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Insert one record. Returns `false` when the record id already exists;
    /// the duplicate is not written and aggregates must not be touched.
    async fn insert_record(&self, record: &UsageRecord) -> Result<bool>;

    /// Most recent records for one agent, newest first.
    async fn records_for_agent(&self, agent_id: &str, limit: usize) -> Result<Vec<UsageRecord>>;

    /// All records attributed to a user within `[start, end)`.
    async fn records_for_user_between(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>>;

    /// Delete records created before the cutoff; returns the count removed.
    async fn prune_records_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn insert_alert(&self, alert: &AlertRecord) -> Result<()>;

    async fn alerts(&self, filter: &AlertFilter) -> Result<Vec<AlertRecord>>;

    /// Alerts raised for a user within `[start, end)`.
    async fn alerts_for_user_between(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AlertRecord>>;

    /// Mark an alert acknowledged. Idempotent; returns `false` only when the
    /// alert id is unknown.
    async fn acknowledge_alert(&self, alert_id: &str, actor_id: &str) -> Result<bool>;
}

/// Append-only persistence for approval audit entries.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, entry: &AuditEntry) -> Result<()>;

    /// All entries for one request, oldest first.
    async fn entries_for_request(&self, request_id: &str) -> Result<Vec<AuditEntry>>;

    /// Count of bypass entries within `[start, end)`, used by statistics.
    async fn critical_entries_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64>;
}

/// In-memory implementation of both stores.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<UsageRecord>>,
    record_ids: Mutex<HashSet<String>>,
    alerts: Mutex<Vec<AlertRecord>>,
    audit: Mutex<Vec<AuditEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn insert_record(&self, record: &UsageRecord) -> Result<bool> {
        let mut ids = self.record_ids.lock().await;
        if !ids.insert(record.id.clone()) {
            return Ok(false);
        }
        self.records.lock().await.push(record.clone());
        Ok(true)
    }

    async fn records_for_agent(&self, agent_id: &str, limit: usize) -> Result<Vec<UsageRecord>> {
        let records = self.records.lock().await;
        let mut matching: Vec<UsageRecord> = records
            .iter()
            .filter(|r| r.agent_id == agent_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn records_for_user_between(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .filter(|r| r.user_id == user_id && r.created_at >= start && r.created_at < end)
            .cloned()
            .collect())
    }

    async fn prune_records_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|r| r.created_at >= cutoff);
        Ok((before - records.len()) as u64)
    }

    async fn insert_alert(&self, alert: &AlertRecord) -> Result<()> {
        self.alerts.lock().await.push(alert.clone());
        Ok(())
    }

    async fn alerts(&self, filter: &AlertFilter) -> Result<Vec<AlertRecord>> {
        let alerts = self.alerts.lock().await;
        let mut matching: Vec<AlertRecord> = alerts
            .iter()
            .filter(|a| {
                filter
                    .user_id
                    .as_ref()
                    .map(|u| &a.user_id == u)
                    .unwrap_or(true)
                    && filter
                        .acknowledged
                        .map(|ack| a.acknowledged == ack)
                        .unwrap_or(true)
                    && filter.level.map(|lvl| a.level == lvl).unwrap_or(true)
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(filter.limit);
        Ok(matching)
    }

    async fn alerts_for_user_between(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AlertRecord>> {
        let alerts = self.alerts.lock().await;
        Ok(alerts
            .iter()
            .filter(|a| a.user_id == user_id && a.created_at >= start && a.created_at < end)
            .cloned()
            .collect())
    }

    async fn acknowledge_alert(&self, alert_id: &str, actor_id: &str) -> Result<bool> {
        let mut alerts = self.alerts.lock().await;
        match alerts.iter_mut().find(|a| a.id == alert_id) {
            Some(alert) => {
                if !alert.acknowledged {
                    alert.acknowledged = true;
                    alert.acknowledged_by = Some(actor_id.to_string());
                    alert.acknowledged_at = Some(Utc::now());
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        self.audit.lock().await.push(entry.clone());
        Ok(())
    }

    async fn entries_for_request(&self, request_id: &str) -> Result<Vec<AuditEntry>> {
        let audit = self.audit.lock().await;
        let mut entries: Vec<AuditEntry> = audit
            .iter()
            .filter(|e| e.request_id == request_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(entries)
    }

    async fn critical_entries_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64> {
        let audit = self.audit.lock().await;
        Ok(audit
            .iter()
            .filter(|e| {
                e.severity == AuditSeverity::Critical
                    && e.created_at >= start
                    && e.created_at < end
            })
            .count() as u64)
    }
}
