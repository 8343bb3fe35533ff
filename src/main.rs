use clap::Parser;
use fleet_core::{config::Config, Kernel, KernelError};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Orchestration kernel for CLI-driven AI agent fleets.
#[derive(Debug, Parser)]
#[command(name = "fleet-core", version)]
struct Args {
    /// Directory under which `.ai-tasks` manifests are created.
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Path to the agent CLI binary.
    #[arg(long)]
    cli_path: Option<String>,

    /// Global cap on simultaneously live agents.
    #[arg(long)]
    max_concurrent_agents: Option<usize>,

    /// KV store URL; enables distributed locks and fast aggregates.
    #[arg(long)]
    kv_url: Option<String>,

    /// SQLite file for usage records, alerts, and the audit trail.
    #[arg(long)]
    database_path: Option<PathBuf>,

    /// Port reserved for the API surface.
    #[arg(long)]
    port: Option<u16>,

    /// Default lock TTL in seconds.
    #[arg(long)]
    default_lock_ttl_seconds: Option<u64>,

    /// Cap on pending approval requests.
    #[arg(long)]
    approval_queue_cap: Option<usize>,

    /// Days to retain usage records.
    #[arg(long)]
    usage_retention_days: Option<i64>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match Config::from_env() {
        Ok(config) => apply_overrides(config, args),
        Err(e) => {
            error!("configuration error: {e}");
            std::process::exit(2);
        }
    };

    info!("starting fleet-core on port {}", config.port);

    let kernel = match Kernel::new(config).await {
        Ok(kernel) => kernel,
        Err(e) => {
            let code = match e {
                KernelError::Configuration(_) => 2,
                _ => 1,
            };
            error!("startup failed: {e}");
            std::process::exit(code);
        }
    };
    kernel.start().await;

    wait_for_shutdown_signal().await;

    kernel.shutdown().await;
    info!("fleet-core stopped");
}

fn apply_overrides(mut config: Config, args: Args) -> Config {
    if let Some(work_dir) = args.work_dir {
        config.database_path = work_dir.join("fleet-core.db");
        config.work_dir = work_dir;
    }
    if let Some(cli_path) = args.cli_path {
        config.cli_path = cli_path;
    }
    if let Some(max) = args.max_concurrent_agents {
        config.max_concurrent_agents = max;
    }
    if let Some(kv_url) = args.kv_url {
        config.kv_url = Some(kv_url);
    }
    if let Some(database_path) = args.database_path {
        config.database_path = database_path;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(ttl) = args.default_lock_ttl_seconds {
        config.default_lock_ttl_seconds = ttl;
    }
    if let Some(cap) = args.approval_queue_cap {
        config.approval_queue_cap = cap;
    }
    if let Some(days) = args.usage_retention_days {
        config.usage_retention_days = days;
    }
    config
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received interrupt"),
            _ = sigterm.recv() => info!("received terminate"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received interrupt");
    }
}
