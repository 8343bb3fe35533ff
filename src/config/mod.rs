use crate::{constants, KernelError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

#[cfg(test)]
mod tests;

/// Startup configuration for the hosting process
///
/// Values come from the environment (a `.env` file is honoured); the binary
/// may override individual knobs through flags. Invalid values are
/// configuration errors and abort startup with exit code 2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Port reserved for the (out-of-process) API surface; logged only.
    pub port: u16,
    /// Directory under which `.ai-tasks` manifests are created.
    pub work_dir: PathBuf,
    /// Path to the agent CLI binary.
    pub cli_path: String,
    pub max_concurrent_agents: usize,
    /// When set, enables the distributed lock backend and fast aggregates.
    pub kv_url: Option<String>,
    pub default_lock_ttl_seconds: u64,
    pub approval_queue_cap: usize,
    pub usage_retention_days: i64,
    /// SQLite file holding usage records, alerts, and the audit trail.
    pub database_path: PathBuf,
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!("Loaded .env file from: {:?}", path),
            Err(_) => tracing::debug!("No .env file found, using process environment"),
        }

        let port = parse_var("PORT", constants::DEFAULT_PORT)?;

        let work_dir = env::var("WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let cli_path = env::var("CLI_PATH")
            .unwrap_or_else(|_| constants::DEFAULT_CLI_PATH.to_string());
        if cli_path.trim().is_empty() {
            return Err(KernelError::Configuration(
                "CLI_PATH cannot be empty".to_string(),
            ));
        }

        let max_concurrent_agents =
            parse_var("MAX_CONCURRENT_AGENTS", constants::DEFAULT_MAX_CONCURRENT_AGENTS)?;
        if max_concurrent_agents == 0 {
            return Err(KernelError::Configuration(
                "MAX_CONCURRENT_AGENTS must be at least 1".to_string(),
            ));
        }

        let kv_url = env::var("KV_URL").ok().filter(|url| !url.trim().is_empty());

        let default_lock_ttl_seconds =
            parse_var("DEFAULT_LOCK_TTL_SECONDS", constants::DEFAULT_LOCK_TTL_SECONDS)?;

        let approval_queue_cap =
            parse_var("APPROVAL_QUEUE_CAP", constants::DEFAULT_APPROVAL_QUEUE_CAP)?;
        if approval_queue_cap == 0 {
            return Err(KernelError::Configuration(
                "APPROVAL_QUEUE_CAP must be at least 1".to_string(),
            ));
        }

        let usage_retention_days =
            parse_var("USAGE_RETENTION_DAYS", constants::DEFAULT_USAGE_RETENTION_DAYS)?;
        if usage_retention_days <= 0 {
            return Err(KernelError::Configuration(
                "USAGE_RETENTION_DAYS must be positive".to_string(),
            ));
        }

        let database_path = env::var("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| work_dir.join("fleet-core.db"));

        Ok(Config {
            port,
            work_dir,
            cli_path,
            max_concurrent_agents,
            kv_url,
            default_lock_ttl_seconds,
            approval_queue_cap,
            usage_retention_days,
            database_path,
        })
    }

    /// A configuration suitable for tests: everything local, tiny caps.
    #[cfg(test)]
    pub fn for_tests(work_dir: PathBuf) -> Self {
        Config {
            port: 0,
            database_path: work_dir.join("fleet-core-test.db"),
            work_dir,
            cli_path: "claude".to_string(),
            max_concurrent_agents: 2,
            kv_url: None,
            default_lock_ttl_seconds: 60,
            approval_queue_cap: 10,
            usage_retention_days: 7,
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
{
    match env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|_| {
            KernelError::Configuration(format!("{name} has an invalid value: {raw:?}"))
        }),
        Err(_) => Ok(default),
    }
}
