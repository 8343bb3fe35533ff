//! SQLite driver for the kernel's durable stores.
//!
//! One pool serves the usage metrics, alert, and approval audit tables.
//! Migrations are idempotent `CREATE TABLE IF NOT EXISTS` statements run at
//! open time, mirroring the relational schema of the external contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::Path;
use std::str::FromStr;

use super::{AuditStore, UsageStore};
use crate::approvals::{AuditAction, AuditEntry, AuditSeverity};
use crate::usage::{AlertFilter, AlertRecord, UsageRecord};
use crate::{KernelError, Result};

/// Durable store backed by a single SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// An in-memory database, for tests.
    ///
    /// Pinned to one connection: each sqlite `:memory:` connection is its
    /// own database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ai_usage_metrics (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                agent_type TEXT NOT NULL,
                model TEXT NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                cost TEXT NOT NULL,
                user_id TEXT NOT NULL,
                session_id TEXT,
                task_id TEXT,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ai_usage_alerts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                type TEXT NOT NULL,
                level TEXT NOT NULL,
                threshold INTEGER NOT NULL,
                current_usage REAL NOT NULL,
                limit_value REAL NOT NULL,
                message TEXT NOT NULL,
                acknowledged INTEGER NOT NULL DEFAULT 0,
                acknowledged_at TEXT,
                acknowledged_by TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS approval_audit (
                id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL,
                action TEXT NOT NULL,
                actor TEXT NOT NULL,
                severity TEXT NOT NULL,
                details TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_metrics_agent ON ai_usage_metrics(agent_id, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_metrics_user ON ai_usage_metrics(user_id, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_alerts_user ON ai_usage_alerts(user_id, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_audit_request ON approval_audit(request_id, created_at)",
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }
}

fn row_to_record(row: &SqliteRow) -> Result<UsageRecord> {
    let agent_type_raw: String = row.try_get("agent_type")?;
    let model_raw: String = row.try_get("model")?;
    let cost_raw: String = row.try_get("cost")?;
    let metadata_raw: String = row.try_get("metadata")?;
    let created_raw: String = row.try_get("created_at")?;

    Ok(UsageRecord {
        id: row.try_get("id")?,
        agent_id: row.try_get("agent_id")?,
        agent_type: agent_type_raw
            .parse()
            .map_err(KernelError::Validation)?,
        model: model_raw.parse().map_err(KernelError::Validation)?,
        input_tokens: row.try_get::<i64, _>("input_tokens")? as u64,
        output_tokens: row.try_get::<i64, _>("output_tokens")? as u64,
        duration_ms: row.try_get::<i64, _>("duration_ms")? as u64,
        cost: Decimal::from_str(&cost_raw)
            .map_err(|e| KernelError::Validation(format!("bad cost column: {e}")))?,
        user_id: row.try_get("user_id")?,
        session_id: row.try_get("session_id")?,
        task_id: row.try_get("task_id")?,
        metadata: serde_json::from_str(&metadata_raw)?,
        created_at: parse_timestamp(&created_raw)?,
    })
}

fn row_to_alert(row: &SqliteRow) -> Result<AlertRecord> {
    let kind_raw: String = row.try_get("type")?;
    let level_raw: String = row.try_get("level")?;
    let created_raw: String = row.try_get("created_at")?;
    let acknowledged_at_raw: Option<String> = row.try_get("acknowledged_at")?;

    Ok(AlertRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        kind: kind_raw.parse().map_err(KernelError::Validation)?,
        level: level_raw.parse().map_err(KernelError::Validation)?,
        threshold_pct: row.try_get::<i64, _>("threshold")? as u8,
        current_usage: row.try_get("current_usage")?,
        limit_value: row.try_get("limit_value")?,
        message: row.try_get("message")?,
        acknowledged: row.try_get::<i64, _>("acknowledged")? != 0,
        acknowledged_at: acknowledged_at_raw
            .map(|raw| parse_timestamp(&raw))
            .transpose()?,
        acknowledged_by: row.try_get("acknowledged_by")?,
        created_at: parse_timestamp(&created_raw)?,
    })
}

fn row_to_audit(row: &SqliteRow) -> Result<AuditEntry> {
    let action_raw: String = row.try_get("action")?;
    let severity_raw: String = row.try_get("severity")?;
    let details_raw: String = row.try_get("details")?;
    let created_raw: String = row.try_get("created_at")?;

    Ok(AuditEntry {
        id: row.try_get("id")?,
        request_id: row.try_get("request_id")?,
        action: AuditAction::from_str(&action_raw).map_err(KernelError::Validation)?,
        actor: row.try_get("actor")?,
        severity: AuditSeverity::from_str(&severity_raw).map_err(KernelError::Validation)?,
        details: serde_json::from_str(&details_raw)?,
        created_at: parse_timestamp(&created_raw)?,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| KernelError::Validation(format!("bad timestamp column: {e}")))
}

#[async_trait]
impl UsageStore for SqliteStore {
    async fn insert_record(&self, record: &UsageRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO ai_usage_metrics
                (id, agent_id, agent_type, model, input_tokens, output_tokens,
                 duration_ms, cost, user_id, session_id, task_id, metadata, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(&record.id)
        .bind(&record.agent_id)
        .bind(record.agent_type.as_str())
        .bind(record.model.as_str())
        .bind(record.input_tokens as i64)
        .bind(record.output_tokens as i64)
        .bind(record.duration_ms as i64)
        .bind(record.cost.to_string())
        .bind(&record.user_id)
        .bind(&record.session_id)
        .bind(&record.task_id)
        .bind(serde_json::to_string(&record.metadata)?)
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn records_for_agent(&self, agent_id: &str, limit: usize) -> Result<Vec<UsageRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM ai_usage_metrics WHERE agent_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )
        .bind(agent_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn records_for_user_between(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM ai_usage_metrics
            WHERE user_id = ?1 AND created_at >= ?2 AND created_at < ?3
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_id)
        .bind(start.to_rfc3339())
        .bind(end.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn prune_records_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM ai_usage_metrics WHERE created_at < ?1")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_alert(&self, alert: &AlertRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ai_usage_alerts
                (id, user_id, type, level, threshold, current_usage, limit_value,
                 message, acknowledged, acknowledged_at, acknowledged_by, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&alert.id)
        .bind(&alert.user_id)
        .bind(alert.kind.as_str())
        .bind(alert.level.as_str())
        .bind(alert.threshold_pct as i64)
        .bind(alert.current_usage)
        .bind(alert.limit_value)
        .bind(&alert.message)
        .bind(alert.acknowledged as i64)
        .bind(alert.acknowledged_at.map(|t| t.to_rfc3339()))
        .bind(&alert.acknowledged_by)
        .bind(alert.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn alerts(&self, filter: &AlertFilter) -> Result<Vec<AlertRecord>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM ai_usage_alerts WHERE 1 = 1");

        if let Some(user_id) = &filter.user_id {
            builder.push(" AND user_id = ").push_bind(user_id);
        }
        if let Some(acknowledged) = filter.acknowledged {
            builder
                .push(" AND acknowledged = ")
                .push_bind(acknowledged as i64);
        }
        if let Some(level) = filter.level {
            builder.push(" AND level = ").push_bind(level.as_str());
        }
        builder
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(filter.limit as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_alert).collect()
    }

    async fn alerts_for_user_between(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AlertRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM ai_usage_alerts
            WHERE user_id = ?1 AND created_at >= ?2 AND created_at < ?3
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_id)
        .bind(start.to_rfc3339())
        .bind(end.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_alert).collect()
    }

    async fn acknowledge_alert(&self, alert_id: &str, actor_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ai_usage_alerts
            SET acknowledged = 1, acknowledged_by = ?1, acknowledged_at = ?2
            WHERE id = ?3 AND acknowledged = 0
            "#,
        )
        .bind(actor_id)
        .bind(Utc::now().to_rfc3339())
        .bind(alert_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        // Already acknowledged counts as success; only unknown ids fail.
        let exists = sqlx::query("SELECT 1 FROM ai_usage_alerts WHERE id = ?1")
            .bind(alert_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(exists.is_some())
    }
}

#[async_trait]
impl AuditStore for SqliteStore {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO approval_audit
                (id, request_id, action, actor, severity, details, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.request_id)
        .bind(entry.action.verb())
        .bind(&entry.actor)
        .bind(entry.severity.as_str())
        .bind(serde_json::to_string(&entry.details)?)
        .bind(entry.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn entries_for_request(&self, request_id: &str) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM approval_audit WHERE request_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_audit).collect()
    }

    async fn critical_entries_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM approval_audit
            WHERE severity = 'critical' AND created_at >= ?1 AND created_at < ?2
            "#,
        )
        .bind(start.to_rfc3339())
        .bind(end.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get::<i64, _>("n")? as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentType, ModelClass};
    use crate::usage::compute_cost;
    use std::collections::HashMap;

    fn sample_record(id: &str, agent_id: &str, user_id: &str) -> UsageRecord {
        UsageRecord {
            id: id.to_string(),
            agent_id: agent_id.to_string(),
            agent_type: AgentType::TestRunner,
            model: ModelClass::Haiku,
            input_tokens: 100,
            output_tokens: 250,
            duration_ms: 1500,
            cost: compute_cost(ModelClass::Haiku, 100, 250),
            user_id: user_id.to_string(),
            session_id: None,
            task_id: Some("t1".to_string()),
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_is_idempotent_per_record_id() {
        let store = SqliteStore::in_memory().await.unwrap();
        let record = sample_record("r1", "a1", "u1");

        assert!(store.insert_record(&record).await.unwrap());
        assert!(!store.insert_record(&record).await.unwrap());

        let records = store.records_for_agent("a1", 100).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].input_tokens, 100);
        assert_eq!(records[0].cost, record.cost);
    }

    #[tokio::test]
    async fn records_round_trip_all_fields() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut record = sample_record("r1", "a1", "u1");
        record
            .metadata
            .insert("estimated".to_string(), "true".to_string());
        store.insert_record(&record).await.unwrap();

        let fetched = store.records_for_agent("a1", 1).await.unwrap();
        assert_eq!(fetched[0].agent_type, AgentType::TestRunner);
        assert_eq!(fetched[0].model, ModelClass::Haiku);
        assert_eq!(fetched[0].metadata.get("estimated").unwrap(), "true");
        assert_eq!(fetched[0].task_id.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn prune_removes_old_records_only() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut old = sample_record("old", "a1", "u1");
        old.created_at = Utc::now() - chrono::Duration::days(100);
        let fresh = sample_record("fresh", "a1", "u1");
        store.insert_record(&old).await.unwrap();
        store.insert_record(&fresh).await.unwrap();

        let removed = store
            .prune_records_before(Utc::now() - chrono::Duration::days(90))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let remaining = store.records_for_agent("a1", 100).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "fresh");
    }

    #[tokio::test]
    async fn acknowledge_is_idempotent_and_unknown_ids_fail() {
        let store = SqliteStore::in_memory().await.unwrap();
        let alert = AlertRecord::threshold("u1", "weekly-opus-hours", 70, 24.6, 35.0);
        store.insert_alert(&alert).await.unwrap();

        assert!(store.acknowledge_alert(&alert.id, "admin").await.unwrap());
        assert!(store.acknowledge_alert(&alert.id, "admin").await.unwrap());
        assert!(!store.acknowledge_alert("missing", "admin").await.unwrap());

        let filter = AlertFilter {
            user_id: Some("u1".to_string()),
            acknowledged: Some(true),
            ..Default::default()
        };
        let alerts = store.alerts(&filter).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].acknowledged_by.as_deref(), Some("admin"));
    }

    #[tokio::test]
    async fn audit_entries_come_back_in_order() {
        let store = SqliteStore::in_memory().await.unwrap();
        let first = AuditEntry::new(
            "req-1",
            AuditAction::RequestSubmitted,
            "alice",
            serde_json::json!({}),
        );
        let second = AuditEntry::new(
            "req-1",
            AuditAction::EmergencyBypass,
            "root",
            serde_json::json!({"reason": "incident"}),
        );
        store.append(&first).await.unwrap();
        store.append(&second).await.unwrap();

        let entries = store.entries_for_request("req-1").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, AuditAction::RequestSubmitted);
        assert_eq!(entries[1].severity, AuditSeverity::Critical);
    }
}
