//! System-wide constants: model identifiers, plan limits, and the fixed
//! intervals and caps used by the kernel's background machinery.

// Model CLI identifiers (fixed strings, part of the CLI contract)
pub const MODEL_ID_OPUS: &str = "claude-3-opus-20240229";
pub const MODEL_ID_SONNET: &str = "claude-3-5-sonnet-20241022";
pub const MODEL_ID_HAIKU: &str = "claude-3-haiku-20240307";

// Spawner
/// Global cap on simultaneously live agents (initializing + working).
pub const DEFAULT_MAX_CONCURRENT_AGENTS: usize = 5;
/// Terminal agent records are kept this long to serve status queries.
pub const AGENT_RETENTION_SECS: u64 = 3600;
/// Cadence of the spawner's record/manifest retention sweep.
pub const AGENT_SWEEP_INTERVAL_SECS: u64 = 300;
/// Directory under the work dir where task manifests are written.
pub const MANIFEST_DIR: &str = ".ai-tasks";

// Lock manager
pub const DEFAULT_LOCK_TTL_SECONDS: u64 = 300;
/// In-process expiry sweep cadence.
pub const LOCK_SWEEP_INTERVAL_SECS: u64 = 60;

// Approval gate
pub const DEFAULT_APPROVAL_QUEUE_CAP: usize = 1000;
/// Terminal requests are evicted from working memory after this many hours.
pub const APPROVAL_EVICTION_HOURS: i64 = 24;
/// Audit entries must survive at least this long.
pub const AUDIT_RETENTION_DAYS: i64 = 180;

// Usage meter
pub const DEFAULT_USAGE_RETENTION_DAYS: i64 = 90;
/// Retention prune cadence.
pub const USAGE_PRUNE_INTERVAL_SECS: u64 = 3600;
/// Weekly opus hours included in the plan.
pub const WEEKLY_OPUS_HOUR_LIMIT: f64 = 35.0;
/// Weekly sonnet hours included in the plan.
pub const WEEKLY_SONNET_HOUR_LIMIT: f64 = 280.0;
/// Alert trigger levels, percent of the weekly limit, ascending.
pub const ALERT_THRESHOLDS: [u8; 3] = [70, 90, 100];
/// An alert fires only while usage sits within [T, T + band); crossing into
/// the next band re-arms.
pub const ALERT_BAND_WIDTH: f64 = 5.0;
/// TTL on `usage:daily:*` KV hashes (7 days).
pub const DAILY_AGGREGATE_TTL_SECS: i64 = 604_800;
/// TTL on `usage:weekly:*` KV hashes (30 days).
pub const WEEKLY_AGGREGATE_TTL_SECS: i64 = 2_592_000;

// Event bus
/// Per-subscriber buffer; a subscriber lagging past this sees drops.
pub const BUS_CAPACITY: usize = 1024;

// Notifications
pub const NOTIFY_MAX_ATTEMPTS: u32 = 3;
pub const NOTIFY_BACKOFF_BASE_SECS: u64 = 30;

// Hosting process
pub const DEFAULT_PORT: u16 = 4190;
pub const DEFAULT_CLI_PATH: &str = "claude";
