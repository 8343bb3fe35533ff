//! Fast usage aggregates.
//!
//! Counters are kept eagerly per (user, window) in hash form: either redis
//! hashes with the contract TTLs, or an in-process map when no KV store is
//! configured. The durable record table remains the source of truth; these
//! counters serve threshold evaluation and the real-time rollup.

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::UsageRecord;
use crate::constants::{DAILY_AGGREGATE_TTL_SECS, WEEKLY_AGGREGATE_TTL_SECS};
use crate::models::ModelClass;
use crate::Result;

pub fn daily_key(user_id: &str, date: chrono::NaiveDate) -> String {
    format!("usage:daily:{}:{}", user_id, date.format("%Y-%m-%d"))
}

pub fn weekly_key(user_id: &str, week: &str) -> String {
    format!("usage:weekly:{}:{}", user_id, week)
}

/// Counter store for the eager aggregates.
#[derive(Clone)]
pub enum FastAggregates {
    Memory(Arc<Mutex<HashMap<String, HashMap<String, f64>>>>),
    Redis(MultiplexedConnection),
}

impl FastAggregates {
    pub fn memory() -> Self {
        FastAggregates::Memory(Arc::new(Mutex::new(HashMap::new())))
    }

    pub fn redis(conn: MultiplexedConnection) -> Self {
        FastAggregates::Redis(conn)
    }

    /// Fold one record into its daily and weekly hashes.
    pub async fn apply(&self, record: &UsageRecord) -> Result<()> {
        let date = record.created_at.date_naive();
        let week = record.created_at.format("%G-W%V").to_string();
        let daily = daily_key(&record.user_id, date);
        let weekly = weekly_key(&record.user_id, &week);

        let model = record.model.as_str();
        let tokens = (record.input_tokens + record.output_tokens) as f64;
        let cost = record.cost.to_f64().unwrap_or(0.0);
        let duration_ms = record.duration_ms as f64;

        let increments = [
            ("calls".to_string(), 1.0),
            ("total_tokens".to_string(), tokens),
            ("total_cost".to_string(), cost),
            (format!("{model}_tokens"), tokens),
            (format!("{model}_cost"), cost),
            (format!("{model}_ms"), duration_ms),
        ];

        match self {
            FastAggregates::Memory(map) => {
                let mut map = map.lock().await;
                for key in [&daily, &weekly] {
                    let hash = map.entry(key.clone()).or_default();
                    for (field, delta) in &increments {
                        *hash.entry(field.clone()).or_insert(0.0) += delta;
                    }
                }
            }
            FastAggregates::Redis(conn) => {
                let mut conn = conn.clone();
                for (key, ttl) in [
                    (&daily, DAILY_AGGREGATE_TTL_SECS),
                    (&weekly, WEEKLY_AGGREGATE_TTL_SECS),
                ] {
                    for (field, delta) in &increments {
                        let _: f64 = redis::cmd("HINCRBYFLOAT")
                            .arg(key)
                            .arg(field)
                            .arg(*delta)
                            .query_async(&mut conn)
                            .await?;
                    }
                    let _: bool = conn.expire(key, ttl).await?;
                }
            }
        }

        Ok(())
    }

    /// All counters for one aggregate key; empty when the key is unknown.
    pub async fn snapshot(&self, key: &str) -> Result<HashMap<String, f64>> {
        match self {
            FastAggregates::Memory(map) => {
                let map = map.lock().await;
                Ok(map.get(key).cloned().unwrap_or_default())
            }
            FastAggregates::Redis(conn) => {
                let mut conn = conn.clone();
                let raw: HashMap<String, String> = conn.hgetall(key).await?;
                Ok(raw
                    .into_iter()
                    .filter_map(|(field, value)| value.parse::<f64>().ok().map(|v| (field, v)))
                    .collect())
            }
        }
    }

    /// Hours of one model class consumed in a given user-week.
    pub async fn weekly_model_hours(
        &self,
        user_id: &str,
        week: &str,
        model: ModelClass,
    ) -> Result<f64> {
        let snapshot = self.snapshot(&weekly_key(user_id, week)).await?;
        let ms = snapshot
            .get(&format!("{}_ms", model.as_str()))
            .copied()
            .unwrap_or(0.0);
        Ok(ms / 3_600_000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentType;
    use crate::usage::compute_cost;
    use chrono::Utc;

    fn record_with_duration(user_id: &str, model: ModelClass, duration_ms: u64) -> UsageRecord {
        UsageRecord {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: "a1".to_string(),
            agent_type: AgentType::GeneralPurpose,
            model,
            input_tokens: 10,
            output_tokens: 20,
            duration_ms,
            cost: compute_cost(model, 10, 20),
            user_id: user_id.to_string(),
            session_id: None,
            task_id: None,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn apply_accumulates_daily_and_weekly_counters() {
        let fast = FastAggregates::memory();
        let record = record_with_duration("u1", ModelClass::Opus, 3_600_000);
        fast.apply(&record).await.unwrap();
        fast.apply(&record).await.unwrap();

        let week = record.created_at.format("%G-W%V").to_string();
        let hours = fast
            .weekly_model_hours("u1", &week, ModelClass::Opus)
            .await
            .unwrap();
        assert!((hours - 2.0).abs() < 1e-9);

        let daily = fast
            .snapshot(&daily_key("u1", record.created_at.date_naive()))
            .await
            .unwrap();
        assert_eq!(daily.get("calls").copied().unwrap_or(0.0), 2.0);
        assert_eq!(daily.get("total_tokens").copied().unwrap_or(0.0), 60.0);
    }

    #[tokio::test]
    async fn unknown_keys_read_as_empty() {
        let fast = FastAggregates::memory();
        let hours = fast
            .weekly_model_hours("nobody", "2026-W01", ModelClass::Sonnet)
            .await
            .unwrap();
        assert_eq!(hours, 0.0);
    }
}
