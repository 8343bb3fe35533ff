//! Process-level wiring of the kernel singletons.
//!
//! Components are constructed once at startup and passed by reference; the
//! spawner-meter-bus cycle is broken by the `UsageSink` seam. `start` spawns
//! the background machinery (dispatch loop, sweeps, retention); `shutdown`
//! drains live agents and stops the loops.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::approvals::{ApprovalGate, ApprovalStatistics, PolicyEngine};
use crate::bus::EventBus;
use crate::config::Config;
use crate::dispatcher::TaskDispatcher;
use crate::kv;
use crate::locks::{LockManager, LockMetrics};
use crate::notify::{LogDispatcher, NotificationDispatcher, RetryingDispatcher};
use crate::roles::{RoleOracle, StaticRoleOracle};
use crate::spawner::{AgentSpawner, SpawnerMetrics};
use crate::storage::{AuditStore, SqliteStore, UsageStore};
use crate::usage::{FastAggregates, UsageMeter, UsageSink};
use crate::Result;

/// Aggregated snapshot for status surfaces.
#[derive(Debug, Clone)]
pub struct KernelStatus {
    pub uptime_secs: f64,
    pub queue_length: usize,
    pub spawner: SpawnerMetrics,
    pub locks: LockMetrics,
    pub approvals: ApprovalStatistics,
}

/// The assembled orchestration kernel.
pub struct Kernel {
    pub config: Config,
    pub bus: EventBus,
    pub locks: Arc<LockManager>,
    pub meter: Arc<UsageMeter>,
    pub gate: Arc<ApprovalGate>,
    pub spawner: Arc<AgentSpawner>,
    pub dispatcher: Arc<TaskDispatcher>,
    started_at: Instant,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Kernel {
    /// Assemble the kernel with default collaborators: a static role oracle
    /// and log-only notification dispatch.
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        Self::with_collaborators(
            config,
            Arc::new(StaticRoleOracle::new()),
            Arc::new(LogDispatcher),
        )
        .await
    }

    /// Assemble the kernel against caller-provided external collaborators.
    pub async fn with_collaborators(
        config: Config,
        roles: Arc<dyn RoleOracle>,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> Result<Arc<Self>> {
        let bus = EventBus::default();

        // Distributed mode is explicit: a configured-but-unreachable KV
        // store aborts startup rather than downgrading silently.
        let kv_conn = match &config.kv_url {
            Some(url) => Some(kv::connect(url).await?),
            None => None,
        };

        let locks = Arc::new(match kv_conn.clone() {
            Some(conn) => {
                info!("lock manager running in distributed mode");
                LockManager::distributed(conn, config.default_lock_ttl_seconds, bus.clone())
            }
            None => {
                info!("lock manager running in in-process mode");
                LockManager::in_process(config.default_lock_ttl_seconds, bus.clone())
            }
        });

        let store = Arc::new(SqliteStore::open(&config.database_path).await?);
        let usage_store: Arc<dyn UsageStore> = store.clone();
        let audit_store: Arc<dyn AuditStore> = store.clone();

        let fast = match kv_conn {
            Some(conn) => FastAggregates::redis(conn),
            None => FastAggregates::memory(),
        };
        let meter = Arc::new(UsageMeter::new(usage_store, fast, bus.clone()));

        let gate = ApprovalGate::new(
            PolicyEngine::new(PolicyEngine::default_policies()),
            audit_store,
            roles,
            Arc::new(RetryingDispatcher::new(notifier)),
            bus.clone(),
            config.approval_queue_cap,
        );

        let usage_sink: Arc<dyn UsageSink> = meter.clone();
        let spawner = AgentSpawner::new(
            config.cli_path.clone(),
            config.work_dir.clone(),
            config.max_concurrent_agents,
            usage_sink,
            bus.clone(),
        )?;

        let dispatcher = TaskDispatcher::new(
            spawner.clone(),
            locks.clone(),
            gate.clone(),
            bus.clone(),
        )?;

        info!(
            work_dir = %config.work_dir.display(),
            cli_path = %config.cli_path,
            max_concurrent = config.max_concurrent_agents,
            "kernel assembled"
        );

        Ok(Arc::new(Self {
            config,
            bus,
            locks,
            meter,
            gate,
            spawner,
            dispatcher,
            started_at: Instant::now(),
            background: Mutex::new(Vec::new()),
        }))
    }

    /// Start the dispatch loop and the periodic background machinery.
    pub async fn start(self: &Arc<Self>) {
        let mut background = self.background.lock().await;
        background.push(tokio::spawn(self.dispatcher.clone().run()));
        background.push(self.locks.clone().spawn_sweep_loop());
        background.push(
            self.meter
                .clone()
                .spawn_retention_loop(self.config.usage_retention_days),
        );
        background.push(self.gate.clone().spawn_maintenance_loop());
        background.push(self.spawner.clone().spawn_retention_loop());
        info!("kernel started");
    }

    pub async fn status(&self) -> Result<KernelStatus> {
        Ok(KernelStatus {
            uptime_secs: self.started_at.elapsed().as_secs_f64(),
            queue_length: self.dispatcher.queue_len().await,
            spawner: self.spawner.metrics().await,
            locks: self.locks.metrics().await?,
            approvals: self.gate.statistics(None).await?,
        })
    }

    /// Drain live agents and stop background loops.
    pub async fn shutdown(&self) {
        info!("kernel shutting down");
        self.spawner.terminate_all().await;
        self.spawner.drain(std::time::Duration::from_secs(10)).await;

        let mut background = self.background.lock().await;
        for handle in background.drain(..) {
            handle.abort();
        }
        info!("kernel shutdown complete");
    }
}
