//! Usage metering: per-invocation records, eager window aggregates, and the
//! threshold-alert state machine.
//!
//! Every completed agent invocation produces exactly one `UsageRecord`. The
//! meter persists it durably, folds it into the fast aggregates, and
//! evaluates the weekly plan thresholds, debouncing alerts to one per
//! (user, series, threshold, week).

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{BusEvent, EventBus};
use crate::constants::{ALERT_BAND_WIDTH, ALERT_THRESHOLDS, USAGE_PRUNE_INTERVAL_SECS};
use crate::models::{AgentType, ModelClass};
use crate::storage::UsageStore;
use crate::{KernelError, Result};

mod aggregates;
mod extract;

pub use aggregates::FastAggregates;
pub use extract::{TokenCounts, TokenExtractor};

/// Rollup period for usage queries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    Day,
    Week,
    Month,
}

impl Window {
    /// Half-open `[start, end)` bounds of the window containing `at`.
    pub fn bounds(&self, at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let date = at.date_naive();
        let (start_date, end_date) = match self {
            Window::Day => (date, date + Duration::days(1)),
            Window::Week => {
                let monday = date - Duration::days(date.weekday().num_days_from_monday() as i64);
                (monday, monday + Duration::days(7))
            }
            Window::Month => {
                let first = date.with_day(1).unwrap_or(date);
                let next = if first.month() == 12 {
                    NaiveDate::from_ymd_opt(first.year() + 1, 1, 1).unwrap_or(first)
                } else {
                    NaiveDate::from_ymd_opt(first.year(), first.month() + 1, 1).unwrap_or(first)
                };
                (first, next)
            }
        };
        (
            Utc.from_utc_datetime(&start_date.and_hms_opt(0, 0, 0).unwrap_or_default()),
            Utc.from_utc_datetime(&end_date.and_hms_opt(0, 0, 0).unwrap_or_default()),
        )
    }
}

/// One row of metering data, one per completed agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: String,
    pub agent_id: String,
    pub agent_type: AgentType,
    pub model: ModelClass,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
    /// Derived; recomputed by the meter on track.
    pub cost: Decimal,
    pub user_id: String,
    pub session_id: Option<String>,
    pub task_id: Option<String>,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl UsageRecord {
    pub fn hours(&self) -> f64 {
        self.duration_ms as f64 / 3_600_000.0
    }
}

/// Cost of one invocation from the published per-million-token rates,
/// rounded half-up to four decimal places.
pub fn compute_cost(model: ModelClass, input_tokens: u64, output_tokens: u64) -> Decimal {
    let million = Decimal::from(1_000_000u64);
    let raw = Decimal::from(input_tokens) * model.input_rate() / million
        + Decimal::from(output_tokens) * model.output_rate() / million;
    raw.round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Threshold,
    Limit,
    Error,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Threshold => "threshold",
            AlertKind::Limit => "limit",
            AlertKind::Error => "error",
        }
    }
}

impl FromStr for AlertKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "threshold" => Ok(AlertKind::Threshold),
            "limit" => Ok(AlertKind::Limit),
            "error" => Ok(AlertKind::Error),
            _ => Err(format!("Unknown alert kind: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        }
    }

    /// Severity of a threshold alert by trigger level.
    pub fn for_threshold(threshold_pct: u8) -> AlertLevel {
        if threshold_pct >= 90 {
            AlertLevel::Critical
        } else if threshold_pct >= 70 {
            AlertLevel::Warning
        } else {
            AlertLevel::Info
        }
    }
}

impl FromStr for AlertLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "info" => Ok(AlertLevel::Info),
            "warning" => Ok(AlertLevel::Warning),
            "critical" => Ok(AlertLevel::Critical),
            _ => Err(format!("Unknown alert level: {s}")),
        }
    }
}

/// A raised usage alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: String,
    pub user_id: String,
    pub kind: AlertKind,
    pub level: AlertLevel,
    pub threshold_pct: u8,
    pub current_usage: f64,
    pub limit_value: f64,
    pub message: String,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AlertRecord {
    pub fn threshold(
        user_id: &str,
        series: &str,
        threshold_pct: u8,
        current_usage: f64,
        limit_value: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            kind: AlertKind::Threshold,
            level: AlertLevel::for_threshold(threshold_pct),
            threshold_pct,
            current_usage,
            limit_value,
            message: format!(
                "{series} reached {threshold_pct}% of the weekly limit \
                 ({current_usage:.1}h of {limit_value:.0}h)"
            ),
            acknowledged: false,
            acknowledged_at: None,
            acknowledged_by: None,
            created_at: Utc::now(),
        }
    }
}

/// Filter for alert queries.
#[derive(Debug, Clone)]
pub struct AlertFilter {
    pub user_id: Option<String>,
    pub acknowledged: Option<bool>,
    pub level: Option<AlertLevel>,
    pub limit: usize,
}

impl Default for AlertFilter {
    fn default() -> Self {
        Self {
            user_id: None,
            acknowledged: None,
            level: None,
            limit: 50,
        }
    }
}

/// Per-model breakdown inside a summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelUsage {
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: Decimal,
    pub hours: f64,
    /// Percent of the weekly plan limit; only present for weekly summaries
    /// of metered models.
    pub percent_of_limit: Option<f64>,
}

/// Per-agent-type breakdown inside a summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentTypeUsage {
    pub calls: u64,
    pub total_tokens: u64,
    pub cost: Decimal,
    pub avg_duration_ms: f64,
}

/// Aggregated view of one user's usage over one window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSummary {
    pub user_id: String,
    pub window: Window,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total_calls: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost: Decimal,
    pub models: HashMap<String, ModelUsage>,
    pub agent_types: HashMap<String, AgentTypeUsage>,
    pub alerts: Vec<AlertRecord>,
}

/// Plan-limit row surfaced by the real-time view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanLimit {
    pub model: String,
    pub weekly_hour_limit: Option<f64>,
}

/// Fast rollup of one aggregate key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowRollup {
    pub key: String,
    pub calls: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub model_hours: HashMap<String, f64>,
}

/// Current-day and current-week rollups plus the plan-limit table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealTimeUsage {
    pub user_id: String,
    pub today: WindowRollup,
    pub this_week: WindowRollup,
    pub plan_limits: Vec<PlanLimit>,
}

/// One day inside a usage report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayUsage {
    pub date: NaiveDate,
    pub calls: u64,
    pub total_tokens: u64,
    pub cost: Decimal,
    pub hours: f64,
}

/// Per-day breakdown plus straight-line cost projections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageReport {
    pub user_id: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub days: Vec<DayUsage>,
    pub total_cost: Decimal,
    pub daily_average_cost: Decimal,
    pub projected_cost_7d: Decimal,
    pub projected_cost_30d: Decimal,
}

/// Seam through which the spawner records usage.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn track(&self, record: UsageRecord) -> Result<()>;
}

/// The usage meter.
pub struct UsageMeter {
    store: Arc<dyn UsageStore>,
    fast: FastAggregates,
    bus: EventBus,
    /// (user, series, threshold, iso-week) tuples already alerted.
    raised: Mutex<HashSet<(String, String, u8, String)>>,
}

impl UsageMeter {
    pub fn new(store: Arc<dyn UsageStore>, fast: FastAggregates, bus: EventBus) -> Self {
        Self {
            store,
            fast,
            bus,
            raised: Mutex::new(HashSet::new()),
        }
    }

    /// Record one invocation: recompute cost, persist, fold into the fast
    /// aggregates, and evaluate thresholds.
    ///
    /// Duplicate record ids are rejected without touching aggregates.
    pub async fn track(&self, mut record: UsageRecord) -> Result<()> {
        record.cost = compute_cost(record.model, record.input_tokens, record.output_tokens);

        if !self.store.insert_record(&record).await? {
            return Err(KernelError::Validation(format!(
                "duplicate usage record id: {}",
                record.id
            )));
        }

        self.fast.apply(&record).await?;

        debug!(
            agent_id = %record.agent_id,
            user_id = %record.user_id,
            model = record.model.as_str(),
            cost = %record.cost,
            "usage tracked"
        );

        self.bus.publish(BusEvent::UsageTracked {
            record_id: record.id.clone(),
            user_id: record.user_id.clone(),
            cost: record.cost.to_string(),
        });

        self.evaluate_thresholds(&record.user_id, record.created_at)
            .await?;

        Ok(())
    }

    /// Weekly threshold pass for one user.
    ///
    /// An alert fires when usage sits within `[T, T + band)` for a trigger
    /// level `T`, at most once per (user, series, T, week).
    async fn evaluate_thresholds(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        let week = at.format("%G-W%V").to_string();

        for model in ModelClass::all() {
            let Some(limit) = model.weekly_hour_limit() else {
                continue;
            };
            let used = self
                .fast
                .weekly_model_hours(user_id, &week, model)
                .await?;
            let pct = used / limit * 100.0;
            let series = format!("weekly-{}-hours", model.as_str());

            for threshold in ALERT_THRESHOLDS {
                let t = threshold as f64;
                if pct < t || pct >= t + ALERT_BAND_WIDTH {
                    continue;
                }

                let key = (
                    user_id.to_string(),
                    series.clone(),
                    threshold,
                    week.clone(),
                );
                {
                    let mut raised = self.raised.lock().await;
                    if !raised.insert(key) {
                        continue;
                    }
                }

                let alert = AlertRecord::threshold(user_id, &series, threshold, used, limit);
                self.store.insert_alert(&alert).await?;
                warn!(
                    user_id,
                    series = %series,
                    threshold,
                    used,
                    "usage threshold alert"
                );
                self.bus.publish(BusEvent::UsageAlert { alert });
            }
        }

        Ok(())
    }

    /// Aggregate view over one window, recomputed from durable records.
    pub async fn summary(&self, window: Window, user_id: &str) -> Result<UsageSummary> {
        let (start, end) = window.bounds(Utc::now());
        let records = self
            .store
            .records_for_user_between(user_id, start, end)
            .await?;

        let mut summary = UsageSummary {
            user_id: user_id.to_string(),
            window,
            start,
            end,
            total_calls: 0,
            total_input_tokens: 0,
            total_output_tokens: 0,
            total_cost: Decimal::ZERO,
            models: HashMap::new(),
            agent_types: HashMap::new(),
            alerts: Vec::new(),
        };

        let mut type_durations: HashMap<String, u64> = HashMap::new();

        for record in &records {
            summary.total_calls += 1;
            summary.total_input_tokens += record.input_tokens;
            summary.total_output_tokens += record.output_tokens;
            summary.total_cost += record.cost;

            let model = summary
                .models
                .entry(record.model.as_str().to_string())
                .or_default();
            model.calls += 1;
            model.input_tokens += record.input_tokens;
            model.output_tokens += record.output_tokens;
            model.cost += record.cost;
            model.hours += record.hours();

            let by_type = summary
                .agent_types
                .entry(record.agent_type.as_str().to_string())
                .or_default();
            by_type.calls += 1;
            by_type.total_tokens += record.input_tokens + record.output_tokens;
            by_type.cost += record.cost;
            *type_durations
                .entry(record.agent_type.as_str().to_string())
                .or_insert(0) += record.duration_ms;
        }

        for (name, usage) in summary.agent_types.iter_mut() {
            if usage.calls > 0 {
                usage.avg_duration_ms =
                    type_durations.get(name).copied().unwrap_or(0) as f64 / usage.calls as f64;
            }
        }

        // Percent-of-limit is a weekly-only concept.
        if window == Window::Week {
            for model in ModelClass::all() {
                if let (Some(limit), Some(usage)) = (
                    model.weekly_hour_limit(),
                    summary.models.get_mut(model.as_str()),
                ) {
                    usage.percent_of_limit = Some(usage.hours / limit * 100.0);
                }
            }
        }

        summary.alerts = self
            .store
            .alerts_for_user_between(user_id, start, end)
            .await?;

        Ok(summary)
    }

    /// Current-day and current-week fast rollups plus the plan table.
    pub async fn real_time(&self, user_id: &str) -> Result<RealTimeUsage> {
        let now = Utc::now();
        let daily = aggregates::daily_key(user_id, now.date_naive());
        let weekly = aggregates::weekly_key(user_id, &now.format("%G-W%V").to_string());

        Ok(RealTimeUsage {
            user_id: user_id.to_string(),
            today: self.rollup(&daily).await?,
            this_week: self.rollup(&weekly).await?,
            plan_limits: ModelClass::all()
                .iter()
                .map(|m| PlanLimit {
                    model: m.as_str().to_string(),
                    weekly_hour_limit: m.weekly_hour_limit(),
                })
                .collect(),
        })
    }

    async fn rollup(&self, key: &str) -> Result<WindowRollup> {
        let snapshot = self.fast.snapshot(key).await?;
        let mut rollup = WindowRollup {
            key: key.to_string(),
            calls: snapshot.get("calls").copied().unwrap_or(0.0) as u64,
            total_tokens: snapshot.get("total_tokens").copied().unwrap_or(0.0) as u64,
            total_cost: snapshot.get("total_cost").copied().unwrap_or(0.0),
            model_hours: HashMap::new(),
        };
        for model in ModelClass::all() {
            let ms = snapshot
                .get(&format!("{}_ms", model.as_str()))
                .copied()
                .unwrap_or(0.0);
            if ms > 0.0 {
                rollup
                    .model_hours
                    .insert(model.as_str().to_string(), ms / 3_600_000.0);
            }
        }
        Ok(rollup)
    }

    /// Last 100 records for one agent, newest first.
    pub async fn agent_metrics(&self, agent_id: &str) -> Result<Vec<UsageRecord>> {
        self.store.records_for_agent(agent_id, 100).await
    }

    pub async fn alerts(&self, filter: AlertFilter) -> Result<Vec<AlertRecord>> {
        self.store.alerts(&filter).await
    }

    /// Acknowledge an alert. Idempotent; `false` only for unknown ids.
    pub async fn acknowledge(&self, alert_id: &str, actor_id: &str) -> Result<bool> {
        self.store.acknowledge_alert(alert_id, actor_id).await
    }

    /// Per-day breakdown over `[start, end]` plus straight-line projections
    /// from the current daily average.
    pub async fn report(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<UsageReport> {
        if end < start {
            return Err(KernelError::Validation(
                "report end date precedes start date".to_string(),
            ));
        }

        let range_start = Utc.from_utc_datetime(&start.and_hms_opt(0, 0, 0).unwrap_or_default());
        let range_end = Utc.from_utc_datetime(
            &(end + Duration::days(1))
                .and_hms_opt(0, 0, 0)
                .unwrap_or_default(),
        );
        let records = self
            .store
            .records_for_user_between(user_id, range_start, range_end)
            .await?;

        let mut by_day: HashMap<NaiveDate, DayUsage> = HashMap::new();
        let mut total_cost = Decimal::ZERO;

        for record in &records {
            let date = record.created_at.date_naive();
            let day = by_day.entry(date).or_insert_with(|| DayUsage {
                date,
                calls: 0,
                total_tokens: 0,
                cost: Decimal::ZERO,
                hours: 0.0,
            });
            day.calls += 1;
            day.total_tokens += record.input_tokens + record.output_tokens;
            day.cost += record.cost;
            day.hours += record.hours();
            total_cost += record.cost;
        }

        let mut days = Vec::new();
        let mut cursor = start;
        while cursor <= end {
            days.push(by_day.remove(&cursor).unwrap_or(DayUsage {
                date: cursor,
                calls: 0,
                total_tokens: 0,
                cost: Decimal::ZERO,
                hours: 0.0,
            }));
            cursor += Duration::days(1);
        }

        let day_count = Decimal::from(days.len().max(1) as u64);
        let daily_average_cost = (total_cost / day_count)
            .round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero);

        Ok(UsageReport {
            user_id: user_id.to_string(),
            start,
            end,
            days,
            total_cost,
            daily_average_cost,
            projected_cost_7d: daily_average_cost * Decimal::from(7u64),
            projected_cost_30d: daily_average_cost * Decimal::from(30u64),
        })
    }

    /// Background retention prune; records older than the retention window
    /// are deleted hourly.
    pub fn spawn_retention_loop(self: Arc<Self>, retention_days: i64) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(USAGE_PRUNE_INTERVAL_SECS));
            interval.tick().await;
            loop {
                interval.tick().await;
                let cutoff = Utc::now() - Duration::days(retention_days);
                match self.store.prune_records_before(cutoff).await {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "pruned usage records past retention"),
                    Err(e) => warn!(error = %e, "usage retention prune failed"),
                }
            }
        })
    }
}

#[async_trait]
impl UsageSink for UsageMeter {
    async fn track(&self, record: UsageRecord) -> Result<()> {
        UsageMeter::track(self, record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use rust_decimal_macros::dec;

    fn meter() -> (UsageMeter, EventBus) {
        let bus = EventBus::new(64);
        let store = Arc::new(MemoryStore::new());
        (
            UsageMeter::new(store, FastAggregates::memory(), bus.clone()),
            bus,
        )
    }

    fn record(user: &str, model: ModelClass, input: u64, output: u64, ms: u64) -> UsageRecord {
        UsageRecord {
            id: Uuid::new_v4().to_string(),
            agent_id: "agent-1".to_string(),
            agent_type: AgentType::TestRunner,
            model,
            input_tokens: input,
            output_tokens: output,
            duration_ms: ms,
            cost: Decimal::ZERO,
            user_id: user.to_string(),
            session_id: None,
            task_id: Some("t1".to_string()),
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn cost_matches_published_rates() {
        // 100 input + 250 output haiku tokens
        assert_eq!(compute_cost(ModelClass::Haiku, 100, 250), dec!(0.0003));
        // opus: 1M in + 1M out
        assert_eq!(
            compute_cost(ModelClass::Opus, 1_000_000, 1_000_000),
            dec!(90.00)
        );
        assert_eq!(compute_cost(ModelClass::Sonnet, 0, 0), dec!(0));
    }

    #[test]
    fn cost_rounds_half_up_at_four_places() {
        // 50 sonnet input tokens: 0.00015 exactly, midpoint rounds away from zero
        assert_eq!(compute_cost(ModelClass::Sonnet, 50, 0), dec!(0.0002));
    }

    #[tokio::test]
    async fn duplicate_record_ids_are_rejected_without_aggregate_drift() {
        let (meter, _bus) = meter();
        let r = record("u1", ModelClass::Haiku, 10, 20, 1000);
        meter.track(r.clone()).await.unwrap();
        let err = meter.track(r.clone()).await.unwrap_err();
        assert!(matches!(err, KernelError::Validation(_)));

        let rt = meter.real_time("u1").await.unwrap();
        assert_eq!(rt.today.calls, 1);
    }

    #[tokio::test]
    async fn threshold_alert_fires_once_per_band() {
        let (meter, bus) = meter();
        let mut rx = bus.subscribe();

        // 24.4h of opus: 69.7% of 35h, below the 70 trigger.
        meter
            .track(record("u1", ModelClass::Opus, 10, 10, 87_840_000))
            .await
            .unwrap();
        // +0.1h: 24.5h = 70.0%, inside [70, 75).
        meter
            .track(record("u1", ModelClass::Opus, 10, 10, 360_000))
            .await
            .unwrap();
        // +0.1h more: still inside the band, must not re-raise.
        meter
            .track(record("u1", ModelClass::Opus, 10, 10, 360_000))
            .await
            .unwrap();

        let mut alerts = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let BusEvent::UsageAlert { alert } = event {
                alerts.push(alert);
            }
        }
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.level, AlertLevel::Warning);
        assert_eq!(alert.threshold_pct, 70);
        assert!(alert.current_usage >= 24.5 && alert.current_usage <= 25.0);

        let stored = meter
            .alerts(AlertFilter {
                user_id: Some("u1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn haiku_is_never_metered_against_a_limit() {
        let (meter, bus) = meter();
        let mut rx = bus.subscribe();

        // An absurd amount of haiku time raises nothing.
        meter
            .track(record("u1", ModelClass::Haiku, 10, 10, 3_600_000_000))
            .await
            .unwrap();

        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, BusEvent::UsageAlert { .. }));
        }
    }

    #[tokio::test]
    async fn weekly_summary_matches_tracked_records() {
        let (meter, _bus) = meter();
        meter
            .track(record("u1", ModelClass::Opus, 100, 200, 7_200_000))
            .await
            .unwrap();
        meter
            .track(record("u1", ModelClass::Sonnet, 50, 50, 3_600_000))
            .await
            .unwrap();
        meter
            .track(record("someone-else", ModelClass::Opus, 9, 9, 9))
            .await
            .unwrap();

        let summary = meter.summary(Window::Week, "u1").await.unwrap();
        assert_eq!(summary.total_calls, 2);
        assert_eq!(summary.total_input_tokens, 150);
        assert_eq!(summary.total_output_tokens, 250);

        let opus = summary.models.get("opus").unwrap();
        assert!((opus.hours - 2.0).abs() < 1e-9);
        let pct = opus.percent_of_limit.unwrap();
        assert!((pct - 2.0 / 35.0 * 100.0).abs() < 1e-9);

        let by_type = summary.agent_types.get("test-runner").unwrap();
        assert_eq!(by_type.calls, 2);
        assert!((by_type.avg_duration_ms - 5_400_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn day_summary_has_no_percent_of_limit() {
        let (meter, _bus) = meter();
        meter
            .track(record("u1", ModelClass::Opus, 100, 200, 3_600_000))
            .await
            .unwrap();

        let summary = meter.summary(Window::Day, "u1").await.unwrap();
        let opus = summary.models.get("opus").unwrap();
        assert!(opus.percent_of_limit.is_none());
    }

    #[tokio::test]
    async fn report_projects_from_daily_average() {
        let (meter, _bus) = meter();
        // One call costing 0.0003 today.
        meter
            .track(record("u1", ModelClass::Haiku, 100, 250, 1000))
            .await
            .unwrap();

        let today = Utc::now().date_naive();
        let report = meter.report("u1", today, today).await.unwrap();
        assert_eq!(report.days.len(), 1);
        assert_eq!(report.total_cost, dec!(0.0003));
        assert_eq!(report.daily_average_cost, dec!(0.0003));
        assert_eq!(report.projected_cost_7d, dec!(0.0021));
        assert_eq!(report.projected_cost_30d, dec!(0.0090));
    }

    #[tokio::test]
    async fn report_includes_empty_days() {
        let (meter, _bus) = meter();
        let today = Utc::now().date_naive();
        let report = meter
            .report("u1", today - Duration::days(2), today)
            .await
            .unwrap();
        assert_eq!(report.days.len(), 3);
        assert!(report.days.iter().all(|d| d.calls == 0));
        assert_eq!(report.daily_average_cost, Decimal::ZERO);
    }

    #[tokio::test]
    async fn acknowledge_is_idempotent() {
        let (meter, _bus) = meter();
        meter
            .track(record("u1", ModelClass::Opus, 10, 10, 88_200_000))
            .await
            .unwrap();

        let alerts = meter
            .alerts(AlertFilter {
                user_id: Some("u1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(alerts.len(), 1);

        assert!(meter.acknowledge(&alerts[0].id, "admin").await.unwrap());
        assert!(meter.acknowledge(&alerts[0].id, "admin").await.unwrap());
        assert!(!meter.acknowledge("nope", "admin").await.unwrap());
    }
}
