//! Agent spawner: launches, supervises, and reaps the external CLI
//! subprocesses.
//!
//! Each live agent has one supervisor task consuming a merged channel of
//! stdout lines, stderr lines, and the exit notification. The agent record
//! is only ever mutated under a short write lock; stream reads happen
//! outside it. A global concurrency cap bounds live agents; excess spawns
//! queue in an in-memory backlog served as slots free up.

use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{BusEvent, EventBus};
use crate::constants::{AGENT_RETENTION_SECS, AGENT_SWEEP_INTERVAL_SECS};
use crate::models::{AgentRecord, AgentState, AgentType, SpawnOverrides, Task};
use crate::usage::{TokenExtractor, UsageRecord, UsageSink};
use crate::Result;

mod manifest;

pub use manifest::render as render_manifest;

/// Result of a spawn attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnOutcome {
    /// Supervision started; the agent id can be polled for status.
    Started(String),
    /// The concurrency cap is reached; the task joined the backlog.
    Queued,
}

/// Observability snapshot of the spawner.
#[derive(Debug, Clone, Default)]
pub struct SpawnerMetrics {
    pub by_state: HashMap<String, usize>,
    pub by_type: HashMap<String, usize>,
    pub queued: usize,
    /// Mean execution time of completed agents, seconds.
    pub average_execution_secs: Option<f64>,
}

struct QueuedSpawn {
    agent_type: AgentType,
    task: Task,
    overrides: Option<SpawnOverrides>,
}

enum Supervision {
    Stdout(String),
    Stderr(String),
    StdinFailed(String),
    Exited {
        status: Option<std::process::ExitStatus>,
        terminated: bool,
        timed_out: bool,
    },
}

/// The agent spawner.
pub struct AgentSpawner {
    cli_path: String,
    work_dir: PathBuf,
    max_concurrent: usize,
    agents: RwLock<HashMap<String, AgentRecord>>,
    terminators: Mutex<HashMap<String, mpsc::Sender<()>>>,
    backlog: Mutex<Vec<QueuedSpawn>>,
    usage: Arc<dyn UsageSink>,
    extractor: TokenExtractor,
    bus: EventBus,
}

impl AgentSpawner {
    pub fn new(
        cli_path: String,
        work_dir: PathBuf,
        max_concurrent: usize,
        usage: Arc<dyn UsageSink>,
        bus: EventBus,
    ) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            cli_path,
            work_dir,
            max_concurrent,
            agents: RwLock::new(HashMap::new()),
            terminators: Mutex::new(HashMap::new()),
            backlog: Mutex::new(Vec::new()),
            usage,
            extractor: TokenExtractor::new()?,
            bus,
        }))
    }

    /// Spawn an agent for a task, or queue the request at the cap.
    ///
    /// A spawn that fails to launch still allocates the agent record: the
    /// record lands directly in `failed` and the id is returned, so callers
    /// observe the terminal state instead of catching an error.
    pub fn spawn<'a>(
        self: &'a Arc<Self>,
        agent_type: AgentType,
        task: &'a Task,
        overrides: Option<SpawnOverrides>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<SpawnOutcome>> + Send + 'a>>
    {
        Box::pin(self.spawn_inner(agent_type, task, overrides))
    }

    async fn spawn_inner(
        self: &Arc<Self>,
        agent_type: AgentType,
        task: &Task,
        overrides: Option<SpawnOverrides>,
    ) -> Result<SpawnOutcome> {
        let config = agent_type
            .default_config()
            .merged(&overrides.clone().unwrap_or_default());

        let record = {
            let mut agents = self.agents.write().await;
            let live = agents.values().filter(|a| a.state.is_live()).count();
            if live >= self.max_concurrent {
                drop(agents);
                self.backlog.lock().await.push(QueuedSpawn {
                    agent_type,
                    task: task.clone(),
                    overrides,
                });
                debug!(task_id = %task.id, "spawner at capacity, task queued");
                return Ok(SpawnOutcome::Queued);
            }

            let record =
                AgentRecord::new(agent_type, task.id.clone(), config, self.work_dir.clone());
            agents.insert(record.id.clone(), record.clone());
            record
        };

        let agent_id = record.id.clone();
        let (term_tx, term_rx) = mpsc::channel(1);
        self.terminators
            .lock()
            .await
            .insert(agent_id.clone(), term_tx);

        let spawner = Arc::clone(self);
        let task = task.clone();
        tokio::spawn(async move {
            spawner.supervise(record, task, term_rx).await;
        });

        Ok(SpawnOutcome::Started(agent_id))
    }

    /// Snapshot of one agent record; `None` once evicted or never known.
    pub async fn status(&self, agent_id: &str) -> Option<AgentRecord> {
        self.agents.read().await.get(agent_id).cloned()
    }

    /// Ask a live agent to terminate. The terminate signal always wins over
    /// the natural exit status.
    pub async fn terminate(&self, agent_id: &str) -> bool {
        let sender = self.terminators.lock().await.get(agent_id).cloned();
        match sender {
            Some(tx) => tx.send(()).await.is_ok(),
            None => false,
        }
    }

    /// Terminate every live agent; used at shutdown.
    pub async fn terminate_all(&self) {
        let senders: Vec<mpsc::Sender<()>> = {
            let terminators = self.terminators.lock().await;
            terminators.values().cloned().collect()
        };
        info!(count = senders.len(), "terminating all live agents");
        for tx in senders {
            let _ = tx.send(()).await;
        }
    }

    /// Wait (bounded) for live agents to drain after `terminate_all`.
    pub async fn drain(&self, max_wait: std::time::Duration) {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let live = {
                let agents = self.agents.read().await;
                agents.values().filter(|a| a.state.is_live()).count()
            };
            if live == 0 || tokio::time::Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    pub async fn metrics(&self) -> SpawnerMetrics {
        let agents = self.agents.read().await;
        let mut metrics = SpawnerMetrics {
            queued: self.backlog.lock().await.len(),
            ..Default::default()
        };

        let mut completed_total_secs = 0f64;
        let mut completed = 0usize;
        for record in agents.values() {
            *metrics
                .by_state
                .entry(record.state.as_str().to_string())
                .or_insert(0) += 1;
            *metrics
                .by_type
                .entry(record.agent_type.as_str().to_string())
                .or_insert(0) += 1;
            if record.state == AgentState::Completed {
                if let Some(secs) = record.execution_secs() {
                    completed_total_secs += secs;
                    completed += 1;
                }
            }
        }
        if completed > 0 {
            metrics.average_execution_secs = Some(completed_total_secs / completed as f64);
        }
        metrics
    }

    /// Periodic retention sweep: evict terminal records past the retention
    /// window and remove orphaned manifests.
    pub fn spawn_retention_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                AGENT_SWEEP_INTERVAL_SECS,
            ));
            interval.tick().await;
            loop {
                interval.tick().await;

                let cutoff = Utc::now() - chrono::Duration::seconds(AGENT_RETENTION_SECS as i64);
                {
                    let mut agents = self.agents.write().await;
                    let before = agents.len();
                    agents.retain(|_, a| {
                        !a.state.is_terminal() || a.ended_at.map(|t| t > cutoff).unwrap_or(true)
                    });
                    let evicted = before - agents.len();
                    if evicted > 0 {
                        debug!(evicted, "evicted retired agent records");
                    }
                }

                if let Err(e) =
                    manifest::sweep_stale(&self.work_dir, AGENT_RETENTION_SECS).await
                {
                    warn!(error = %e, "manifest sweep failed");
                }
            }
        })
    }

    // ---- supervision ---------------------------------------------------

    async fn supervise(
        self: Arc<Self>,
        record: AgentRecord,
        task: Task,
        mut term_rx: mpsc::Receiver<()>,
    ) {
        let agent_id = record.id.clone();
        let config = record.config.clone();

        // The manifest is the agent's entire input.
        let manifest_body = match manifest::render(record.agent_type, &task) {
            Ok(body) => body,
            Err(e) => {
                self.fail_agent(&agent_id, &format!("manifest rendering failed: {e}"))
                    .await;
                self.finish_supervision(&agent_id).await;
                return;
            }
        };
        let manifest_file = match manifest::write(&self.work_dir, &agent_id, &manifest_body).await {
            Ok(path) => path,
            Err(e) => {
                self.fail_agent(&agent_id, &format!("manifest write failed: {e}"))
                    .await;
                self.finish_supervision(&agent_id).await;
                return;
            }
        };

        let mut command = Command::new(&self.cli_path);
        command
            .arg("--model")
            .arg(config.model.model_id())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&self.work_dir)
            .kill_on_drop(true);
        if let Some(timeout) = config.timeout_seconds {
            command.arg("--timeout").arg(timeout.to_string());
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.fail_agent(&agent_id, &format!("failed to spawn {}: {e}", self.cli_path))
                    .await;
                manifest::remove(&manifest_file).await;
                self.finish_supervision(&agent_id).await;
                return;
            }
        };

        self.set_state(&agent_id, AgentState::Working).await;
        self.bus.publish(BusEvent::AgentSpawned {
            agent_id: agent_id.clone(),
            agent_type: record.agent_type,
            task_id: task.id.clone(),
        });
        info!(
            agent_id = %agent_id,
            agent_type = record.agent_type.as_str(),
            model = config.model.as_str(),
            task_id = %task.id,
            "agent started"
        );

        let (tx, mut rx) = mpsc::channel::<Supervision>(256);

        // Stdin writer: the manifest goes down the pipe, then the pipe
        // closes. Runs concurrently with the readers so a full pipe in
        // either direction cannot deadlock the exchange.
        if let Some(mut stdin) = child.stdin.take() {
            let body = manifest_body;
            let stdin_tx = tx.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(body.as_bytes()).await {
                    let _ = stdin_tx.send(Supervision::StdinFailed(e.to_string())).await;
                }
                // Dropping stdin closes the pipe and signals end of input.
            });
        }

        if let Some(stdout) = child.stdout.take() {
            let out_tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if out_tx.send(Supervision::Stdout(line)).await.is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let err_tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if err_tx.send(Supervision::Stderr(line)).await.is_err() {
                        break;
                    }
                }
            });
        }

        // Exit watcher: owns the child, applies terminate signals and the
        // local timeout backstop (the CLI gets --timeout; this guards a CLI
        // that ignores it).
        {
            let exit_tx = tx.clone();
            let local_timeout = config
                .timeout_seconds
                .map(|s| std::time::Duration::from_secs(s + 30));
            tokio::spawn(async move {
                let mut terminated = false;
                let mut timed_out = false;
                loop {
                    tokio::select! {
                        status = child.wait() => {
                            let _ = exit_tx
                                .send(Supervision::Exited {
                                    status: status.ok(),
                                    terminated,
                                    timed_out,
                                })
                                .await;
                            break;
                        }
                        Some(()) = term_rx.recv(), if !terminated => {
                            terminated = true;
                            let _ = child.start_kill();
                        }
                        _ = async {
                            match local_timeout {
                                Some(d) => tokio::time::sleep(d).await,
                                None => std::future::pending().await,
                            }
                        }, if !terminated && !timed_out => {
                            timed_out = true;
                            let _ = child.start_kill();
                        }
                    }
                }
            });
        }
        drop(tx);

        // Single consumer loop: all record mutation happens here, under
        // short write locks, in stream order.
        let mut exit: Option<(Option<std::process::ExitStatus>, bool, bool)> = None;
        let mut stdin_error: Option<String> = None;
        while let Some(event) = rx.recv().await {
            match event {
                Supervision::Stdout(line) => {
                    {
                        let mut agents = self.agents.write().await;
                        if let Some(agent) = agents.get_mut(&agent_id) {
                            agent.stdout.push(line.clone());
                        }
                    }
                    self.bus.publish(BusEvent::AgentOutput {
                        agent_id: agent_id.clone(),
                        task_id: task.id.clone(),
                        line,
                    });
                }
                Supervision::Stderr(line) => {
                    {
                        let mut agents = self.agents.write().await;
                        if let Some(agent) = agents.get_mut(&agent_id) {
                            agent.stderr.push(line.clone());
                        }
                    }
                    self.bus.publish(BusEvent::AgentErrorOutput {
                        agent_id: agent_id.clone(),
                        task_id: task.id.clone(),
                        line,
                    });
                }
                Supervision::StdinFailed(message) => {
                    warn!(agent_id = %agent_id, error = %message, "stdin write failed");
                    stdin_error = Some(message);
                }
                Supervision::Exited {
                    status,
                    terminated,
                    timed_out,
                } => {
                    exit = Some((status, terminated, timed_out));
                    // Keep draining: trailing output lines may still arrive
                    // from the reader tasks.
                }
            }
        }

        let (status, terminated, timed_out) = exit.unwrap_or((None, false, false));
        let exit_code = status.and_then(|s| s.code());

        // Terminate always wins; then the local timeout; then stdin
        // failures; then the exit code.
        let final_state = if terminated {
            AgentState::Terminated
        } else if timed_out || stdin_error.is_some() || exit_code != Some(0) {
            AgentState::Failed
        } else {
            AgentState::Completed
        };

        let finished = {
            let mut agents = self.agents.write().await;
            if let Some(agent) = agents.get_mut(&agent_id) {
                agent.state = final_state;
                agent.ended_at = Some(Utc::now());
                agent.exit_code = exit_code;
                if timed_out {
                    agent.stderr.push("invocation timeout exceeded".to_string());
                }
                if let Some(message) = &stdin_error {
                    agent.stderr.push(format!("stdin write failed: {message}"));
                }
                Some(agent.clone())
            } else {
                None
            }
        };

        match final_state {
            AgentState::Terminated => {
                info!(agent_id = %agent_id, "agent terminated");
                self.bus.publish(BusEvent::AgentTerminated {
                    agent_id: agent_id.clone(),
                    task_id: task.id.clone(),
                });
            }
            AgentState::Completed => {
                info!(agent_id = %agent_id, "agent completed");
                self.bus.publish(BusEvent::AgentCompleted {
                    agent_id: agent_id.clone(),
                    task_id: task.id.clone(),
                    exit_code: exit_code.unwrap_or(0),
                });
            }
            _ => {
                warn!(agent_id = %agent_id, exit_code, "agent failed");
                self.bus.publish(BusEvent::AgentCompleted {
                    agent_id: agent_id.clone(),
                    task_id: task.id.clone(),
                    exit_code: exit_code.unwrap_or(-1),
                });
            }
        }
        self.bus.publish(BusEvent::AgentStatus {
            agent_id: agent_id.clone(),
            state: final_state,
        });

        // Usage is recorded whatever the outcome, terminated included.
        if let Some(agent) = finished {
            self.record_usage(&agent, &task, terminated).await;
        }

        manifest::remove(&manifest_file).await;
        self.finish_supervision(&agent_id).await;
    }

    async fn record_usage(&self, agent: &AgentRecord, task: &Task, terminated: bool) {
        let stdout = agent.stdout.join("\n");
        let counts = self.extractor.extract(&stdout);

        let mut metadata = HashMap::new();
        if counts.estimated {
            metadata.insert("estimated".to_string(), "true".to_string());
        }
        if terminated {
            metadata.insert("terminated".to_string(), "true".to_string());
        }

        let duration_ms = agent
            .ended_at
            .map(|end| (end - agent.started_at).num_milliseconds().max(0) as u64)
            .unwrap_or(0);

        let record = UsageRecord {
            id: Uuid::new_v4().to_string(),
            agent_id: agent.id.clone(),
            agent_type: agent.agent_type,
            model: agent.config.model,
            input_tokens: counts.input_tokens,
            output_tokens: counts.output_tokens,
            duration_ms,
            cost: rust_decimal::Decimal::ZERO,
            user_id: task.user_id(),
            session_id: task.context.get("session_id").cloned(),
            task_id: Some(task.id.clone()),
            metadata,
            created_at: Utc::now(),
        };

        if let Err(e) = self.usage.track(record).await {
            error!(agent_id = %agent.id, error = %e, "failed to record usage");
        }
    }

    async fn set_state(&self, agent_id: &str, state: AgentState) {
        let mut agents = self.agents.write().await;
        if let Some(agent) = agents.get_mut(agent_id) {
            agent.state = state;
        }
        drop(agents);
        self.bus.publish(BusEvent::AgentStatus {
            agent_id: agent_id.to_string(),
            state,
        });
    }

    /// Mark an agent failed before it ever ran.
    async fn fail_agent(&self, agent_id: &str, message: &str) {
        error!(agent_id, message, "agent failed to start");
        {
            let mut agents = self.agents.write().await;
            if let Some(agent) = agents.get_mut(agent_id) {
                agent.state = AgentState::Failed;
                agent.ended_at = Some(Utc::now());
                agent.stderr.push(message.to_string());
            }
        }
        self.bus.publish(BusEvent::AgentStatus {
            agent_id: agent_id.to_string(),
            state: AgentState::Failed,
        });
    }

    /// Tear down supervision bookkeeping and serve the backlog.
    async fn finish_supervision(self: &Arc<Self>, agent_id: &str) {
        self.terminators.lock().await.remove(agent_id);
        self.pop_backlog().await;
    }

    /// Start backlog entries while capacity allows, highest priority first,
    /// FIFO within equal priority.
    async fn pop_backlog(self: &Arc<Self>) {
        loop {
            let has_capacity = {
                let agents = self.agents.read().await;
                agents.values().filter(|a| a.state.is_live()).count() < self.max_concurrent
            };
            if !has_capacity {
                return;
            }

            let next = {
                let mut backlog = self.backlog.lock().await;
                if backlog.is_empty() {
                    return;
                }
                let mut best = 0;
                for i in 1..backlog.len() {
                    if backlog[i].task.priority > backlog[best].task.priority {
                        best = i;
                    }
                }
                backlog.remove(best)
            };

            debug!(task_id = %next.task.id, "starting backlogged spawn");
            match self
                .spawn(next.agent_type, &next.task, next.overrides)
                .await
            {
                Ok(SpawnOutcome::Started(_)) => continue,
                Ok(SpawnOutcome::Queued) => return,
                Err(e) => {
                    error!(error = %e, "backlogged spawn failed");
                    return;
                }
            }
        }
    }
}
