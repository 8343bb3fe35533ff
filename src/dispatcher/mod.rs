//! Task dispatcher: the priority-ordered queue feeding the spawner.
//!
//! The dispatch loop reacts to queue changes and to bus events (agent
//! terminal states, lock grants, approval resolutions). For each pending
//! task in priority order it gates on dependencies, routes guarded work
//! through the approval gate, acquires declared resource locks, and hands
//! off to the spawner. A dispatched task never re-enters the queue;
//! cancellation is the only early exit.

use regex::Regex;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::approvals::{
    ApprovalGate, ApprovalType, OperationDescriptor, RequestContext, RiskLevel, SubmitOptions,
};
use crate::bus::{BusEvent, EventBus};
use crate::locks::{AcquireOutcome, LockManager, LockRequest, ResourceType};
use crate::models::{AgentState, AgentType, Task, TaskStatus};
use crate::spawner::{AgentSpawner, SpawnOutcome};
use crate::{KernelError, Result};

/// Status view returned by `status`; never throws, unknown ids are `None`.
#[derive(Debug, Clone)]
pub struct TaskView {
    pub task_id: String,
    pub status: TaskStatus,
    pub agent_id: Option<String>,
    pub progress: Option<u8>,
}

#[derive(Debug, Clone)]
struct LockRequirement {
    resource_type: ResourceType,
    resource_id: String,
    /// A wait-queue entry exists for this requirement.
    waiting: bool,
}

struct TaskEntry {
    task: Task,
    agent_id: Option<String>,
    approval_request_id: Option<String>,
    approval_cleared: bool,
    pending_locks: Vec<LockRequirement>,
    held_locks: Vec<String>,
    progress: Option<u8>,
}

#[derive(Debug, Clone)]
struct QueueSlot {
    task_id: String,
    priority: i32,
    seq: u64,
}

/// The task dispatcher.
pub struct TaskDispatcher {
    tasks: Mutex<HashMap<String, TaskEntry>>,
    queue: Mutex<Vec<QueueSlot>>,
    seq: AtomicU64,
    spawner: Arc<AgentSpawner>,
    locks: Arc<LockManager>,
    gate: Arc<ApprovalGate>,
    bus: EventBus,
    wake: Notify,
    progress_pattern: Regex,
}

impl TaskDispatcher {
    pub fn new(
        spawner: Arc<AgentSpawner>,
        locks: Arc<LockManager>,
        gate: Arc<ApprovalGate>,
        bus: EventBus,
    ) -> Result<Arc<Self>> {
        let progress_pattern = Regex::new(r"(?i)\bprogress[:=]?\s*(\d{1,3})\s*%")
            .map_err(|e| KernelError::Validation(format!("bad progress pattern: {e}")))?;
        Ok(Arc::new(Self {
            tasks: Mutex::new(HashMap::new()),
            queue: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
            spawner,
            locks,
            gate,
            bus,
            wake: Notify::new(),
            progress_pattern,
        }))
    }

    /// Submit a task; returns its id.
    pub async fn submit(&self, mut task: Task) -> Result<String> {
        if task.description.trim().is_empty() && task.prompt.trim().is_empty() {
            return Err(KernelError::Validation(
                "task needs a description or a prompt".to_string(),
            ));
        }
        let pending_locks = parse_lock_requirements(&task)?;
        // Risk misdeclarations should fail at submission, not mid-dispatch.
        if let Some(risk) = task.context.get("risk") {
            RiskLevel::from_str(risk).map_err(KernelError::Validation)?;
        }
        if let Some(approval_type) = task.context.get("approval_type") {
            ApprovalType::from_str(approval_type).map_err(KernelError::Validation)?;
        }

        task.status = TaskStatus::Queued;
        task.updated_at = chrono::Utc::now();
        let task_id = task.id.clone();
        let priority = task.priority;

        {
            let mut tasks = self.tasks.lock().await;
            tasks.insert(
                task_id.clone(),
                TaskEntry {
                    task,
                    agent_id: None,
                    approval_request_id: None,
                    approval_cleared: false,
                    pending_locks,
                    held_locks: Vec::new(),
                    progress: None,
                },
            );
        }
        self.enqueue(task_id.clone(), priority).await;

        info!(task_id = %task_id, priority, "task submitted");
        self.bus.publish(BusEvent::TaskQueued {
            task_id: task_id.clone(),
        });
        self.wake.notify_one();
        Ok(task_id)
    }

    /// Cancel a task. Synchronous before dispatch; cooperative after (the
    /// spawner terminates the agent and the terminal event lands later).
    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        let (status, agent_id, approval_request_id) = {
            let tasks = self.tasks.lock().await;
            let entry = tasks
                .get(task_id)
                .ok_or_else(|| KernelError::NotFound(format!("task {task_id}")))?;
            (
                entry.task.status,
                entry.agent_id.clone(),
                entry.approval_request_id.clone(),
            )
        };

        match status {
            TaskStatus::Queued | TaskStatus::AwaitingApproval => {
                if let Some(request_id) = approval_request_id {
                    // The gate may have resolved it already; that's fine.
                    let _ = self.gate.cancel(&request_id, "dispatcher").await;
                }
                self.finish_task(task_id, TaskStatus::Cancelled, None).await;
                Ok(())
            }
            TaskStatus::Dispatched => {
                if let Some(agent_id) = agent_id {
                    self.spawner.terminate(&agent_id).await;
                }
                Ok(())
            }
            // Already terminal; nothing to do.
            _ => Ok(()),
        }
    }

    /// Change a pending task's priority and resort the queue.
    pub async fn reprioritize(&self, task_id: &str, priority: i32) -> Result<()> {
        {
            let mut tasks = self.tasks.lock().await;
            let entry = tasks
                .get_mut(task_id)
                .ok_or_else(|| KernelError::NotFound(format!("task {task_id}")))?;
            entry.task.priority = priority;
            entry.task.updated_at = chrono::Utc::now();
        }
        {
            let mut queue = self.queue.lock().await;
            if let Some(slot) = queue.iter_mut().find(|s| s.task_id == task_id) {
                slot.priority = priority;
            }
            queue.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        }
        debug!(task_id, priority, "task reprioritized");
        self.wake.notify_one();
        Ok(())
    }

    /// Status view; missing ids return `None` rather than an error.
    pub async fn status(&self, task_id: &str) -> Option<TaskView> {
        let tasks = self.tasks.lock().await;
        tasks.get(task_id).map(|entry| TaskView {
            task_id: task_id.to_string(),
            status: entry.task.status,
            agent_id: entry.agent_id.clone(),
            progress: entry.progress,
        })
    }

    /// Ordered snapshot of the not-yet-dispatched queue.
    pub async fn queue(&self) -> Vec<Task> {
        let queue = self.queue.lock().await;
        let tasks = self.tasks.lock().await;
        queue
            .iter()
            .filter_map(|slot| tasks.get(&slot.task_id).map(|e| e.task.clone()))
            .collect()
    }

    /// Count of tasks waiting in the queue.
    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// The dispatch loop: reacts to wakes and bus events until the bus
    /// closes.
    pub async fn run(self: Arc<Self>) {
        info!("task dispatcher started");
        let mut events = self.bus.subscribe();
        loop {
            tokio::select! {
                _ = self.wake.notified() => {
                    self.tick().await;
                }
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "dispatcher lagged on the bus; forcing a tick");
                        self.tick().await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        info!("task dispatcher stopped");
    }

    /// One pass over the queue in priority order.
    pub async fn tick(&self) {
        let slots: Vec<QueueSlot> = self.queue.lock().await.clone();
        for slot in slots {
            match self.process_task(&slot.task_id).await {
                Ok(true) => continue,
                // Spawner at capacity: later tasks cannot do better.
                Ok(false) => break,
                Err(e) => {
                    warn!(task_id = %slot.task_id, error = %e, "dispatch failed");
                    self.finish_task(&slot.task_id, TaskStatus::Failed, Some(e.to_string()))
                        .await;
                }
            }
        }
    }

    // ---- internals -----------------------------------------------------

    async fn enqueue(&self, task_id: String, priority: i32) {
        let slot = QueueSlot {
            task_id,
            priority,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        let mut queue = self.queue.lock().await;
        let position = queue
            .iter()
            .position(|s| s.priority < slot.priority)
            .unwrap_or(queue.len());
        queue.insert(position, slot);
    }

    /// Attempt to move one task forward. Returns `false` only when the
    /// spawner is at capacity (so the tick can stop early).
    async fn process_task(&self, task_id: &str) -> Result<bool> {
        // Phase 1: read state and decide the next step under the lock.
        enum Step {
            Skip,
            NeedsApproval(Task, AgentType),
            AcquireLocks(Task, Vec<LockRequirement>),
            Spawn(Task, AgentType),
        }

        let step = {
            let tasks = self.tasks.lock().await;
            let Some(entry) = tasks.get(task_id) else {
                return Ok(true);
            };
            if entry.task.status != TaskStatus::Queued {
                Step::Skip
            } else if !self.dependencies_ready(&entry.task, &tasks) {
                Step::Skip
            } else {
                let agent_type = entry.task.resolved_agent_type();
                let guarded = agent_type.default_config().requires_approval
                    || entry.task.context.contains_key("approval_type");
                if guarded && !entry.approval_cleared {
                    Step::NeedsApproval(entry.task.clone(), agent_type)
                } else if !entry.pending_locks.is_empty() {
                    Step::AcquireLocks(entry.task.clone(), entry.pending_locks.clone())
                } else {
                    Step::Spawn(entry.task.clone(), agent_type)
                }
            }
        };

        match step {
            Step::Skip => Ok(true),
            Step::NeedsApproval(task, agent_type) => {
                self.request_approval(&task, agent_type).await?;
                Ok(true)
            }
            Step::AcquireLocks(task, pending) => {
                let all_held = self.acquire_locks(&task, pending).await?;
                if all_held {
                    // Re-enter with the lock set satisfied.
                    let agent_type = task.resolved_agent_type();
                    self.dispatch(&task, agent_type).await
                } else {
                    Ok(true)
                }
            }
            Step::Spawn(task, agent_type) => self.dispatch(&task, agent_type).await,
        }
    }

    fn dependencies_ready(&self, task: &Task, tasks: &HashMap<String, TaskEntry>) -> bool {
        for dep_id in &task.dependencies {
            match tasks.get(dep_id) {
                Some(dep) => {
                    if !dep.task.status.is_terminal() {
                        return false;
                    }
                }
                None => {
                    // A typo'd id would wedge the queue forever; ignore it.
                    warn!(task_id = %task.id, dep_id = %dep_id, "unknown dependency ignored");
                }
            }
        }
        true
    }

    async fn request_approval(&self, task: &Task, agent_type: AgentType) -> Result<()> {
        let approval_type = task
            .context
            .get("approval_type")
            .and_then(|raw| ApprovalType::from_str(raw).ok())
            .unwrap_or(ApprovalType::ProductionOperations);
        let risk = task
            .context
            .get("risk")
            .and_then(|raw| RiskLevel::from_str(raw).ok())
            .unwrap_or(RiskLevel::Low);
        let resource = task
            .context
            .get("resource")
            .cloned()
            .unwrap_or_else(|| format!("task:{}", task.id));
        let reversible = task
            .context
            .get("reversible")
            .map(|v| v != "false")
            .unwrap_or(true);

        let operation = OperationDescriptor {
            action: format!("run-{}", agent_type.as_str()),
            resource,
            parameters: task.context.clone(),
            risk,
            reversible,
        };
        let context = RequestContext {
            user_id: task.user_id(),
            session_id: task.context.get("session_id").cloned(),
            task_chain_id: None,
            correlation_id: Some(task.id.clone()),
        };
        let options = SubmitOptions {
            title: Some(format!("Dispatch task: {}", task.description)),
            ..Default::default()
        };

        match self
            .gate
            .submit(approval_type, operation, context, options)
            .await
        {
            Ok(request) => {
                let mut tasks = self.tasks.lock().await;
                if let Some(entry) = tasks.get_mut(&task.id) {
                    entry.approval_request_id = Some(request.id.clone());
                    entry.task.status = TaskStatus::AwaitingApproval;
                    entry.task.updated_at = chrono::Utc::now();
                }
                info!(task_id = %task.id, request_id = %request.id, "task awaiting approval");
                Ok(())
            }
            Err(e) => {
                // NoPolicy / QueueFull: the gate refused, the task cannot run.
                self.finish_task(&task.id, TaskStatus::Failed, Some(e.to_string()))
                    .await;
                Ok(())
            }
        }
    }

    /// Acquire outstanding lock requirements. Returns true when the full
    /// set is held; a queued acquisition leaves the task at head-of-line
    /// until the grant event arrives.
    async fn acquire_locks(&self, task: &Task, pending: Vec<LockRequirement>) -> Result<bool> {
        for requirement in pending {
            if requirement.waiting {
                // Already queued on this key; the grant will wake us.
                return Ok(false);
            }

            let request = LockRequest::new(
                requirement.resource_type,
                requirement.resource_id.clone(),
                task.id.clone(),
            )
            .with_priority(task.priority);

            match self.locks.acquire(request).await? {
                AcquireOutcome::Acquired(lock) => {
                    let mut tasks = self.tasks.lock().await;
                    if let Some(entry) = tasks.get_mut(&task.id) {
                        entry.held_locks.push(lock.id.clone());
                        entry.pending_locks.retain(|r| {
                            !(r.resource_type == requirement.resource_type
                                && r.resource_id == requirement.resource_id)
                        });
                    }
                }
                AcquireOutcome::Queued { .. } => {
                    debug!(
                        task_id = %task.id,
                        resource = %requirement.resource_id,
                        "lock held elsewhere; task waits at head-of-line"
                    );
                    let mut tasks = self.tasks.lock().await;
                    if let Some(entry) = tasks.get_mut(&task.id) {
                        for r in entry.pending_locks.iter_mut() {
                            if r.resource_type == requirement.resource_type
                                && r.resource_id == requirement.resource_id
                            {
                                r.waiting = true;
                            }
                        }
                    }
                    return Ok(false);
                }
            }
        }

        let tasks = self.tasks.lock().await;
        Ok(tasks
            .get(&task.id)
            .map(|e| e.pending_locks.is_empty())
            .unwrap_or(false))
    }

    /// Hand the task to the spawner. Returns `false` when the spawner is at
    /// capacity (the task stays queued).
    async fn dispatch(&self, task: &Task, agent_type: AgentType) -> Result<bool> {
        match self.spawner.spawn(agent_type, task, None).await? {
            SpawnOutcome::Queued => Ok(false),
            SpawnOutcome::Started(agent_id) => {
                {
                    let mut tasks = self.tasks.lock().await;
                    if let Some(entry) = tasks.get_mut(&task.id) {
                        entry.agent_id = Some(agent_id.clone());
                        entry.task.status = TaskStatus::Dispatched;
                        entry.task.updated_at = chrono::Utc::now();
                    }
                }
                {
                    let mut queue = self.queue.lock().await;
                    queue.retain(|s| s.task_id != task.id);
                }
                info!(task_id = %task.id, agent_id = %agent_id, "task dispatched");
                self.bus.publish(BusEvent::TaskDispatched {
                    task_id: task.id.clone(),
                    agent_id,
                });
                Ok(true)
            }
        }
    }

    async fn handle_event(&self, event: BusEvent) {
        match event {
            BusEvent::AgentStatus { agent_id, state } if state.is_terminal() => {
                let task_id = {
                    let tasks = self.tasks.lock().await;
                    tasks
                        .iter()
                        .find(|(_, e)| e.agent_id.as_deref() == Some(agent_id.as_str()))
                        .map(|(id, _)| id.clone())
                };
                if let Some(task_id) = task_id {
                    let status = match state {
                        AgentState::Completed => TaskStatus::Completed,
                        AgentState::Terminated => TaskStatus::Cancelled,
                        _ => TaskStatus::Failed,
                    };
                    let reason = match status {
                        TaskStatus::Failed => Some("agent failed".to_string()),
                        _ => None,
                    };
                    self.finish_task(&task_id, status, reason).await;
                    // A slot freed up.
                    self.wake.notify_one();
                }
            }
            BusEvent::LockGrantedFromQueue {
                owner_id, lock_id, key,
            } => {
                let mut woke = false;
                {
                    let mut tasks = self.tasks.lock().await;
                    if let Some(entry) = tasks.get_mut(&owner_id) {
                        entry.held_locks.push(lock_id);
                        entry
                            .pending_locks
                            .retain(|r| crate::locks::lock_key(r.resource_type, &r.resource_id) != key);
                        woke = true;
                    }
                }
                if woke {
                    self.wake.notify_one();
                }
            }
            BusEvent::ApprovalGranted { request_id } | BusEvent::ApprovalBypassed { request_id, .. } => {
                let task_id = self.task_for_approval(&request_id).await;
                if let Some(task_id) = task_id {
                    {
                        let mut tasks = self.tasks.lock().await;
                        if let Some(entry) = tasks.get_mut(&task_id) {
                            entry.approval_cleared = true;
                            entry.task.status = TaskStatus::Queued;
                            entry.task.updated_at = chrono::Utc::now();
                        }
                    }
                    info!(task_id = %task_id, "approval cleared; task re-queued");
                    self.wake.notify_one();
                }
            }
            BusEvent::ApprovalRejected { request_id } => {
                if let Some(task_id) = self.task_for_approval(&request_id).await {
                    self.finish_task(
                        &task_id,
                        TaskStatus::Failed,
                        Some("approval rejected".to_string()),
                    )
                    .await;
                }
            }
            BusEvent::ApprovalExpired { request_id } => {
                if let Some(task_id) = self.task_for_approval(&request_id).await {
                    self.finish_task(
                        &task_id,
                        TaskStatus::Failed,
                        Some("approval expired".to_string()),
                    )
                    .await;
                }
            }
            BusEvent::AgentOutput { task_id, line, .. } => {
                if let Some(caps) = self.progress_pattern.captures(&line) {
                    if let Some(percent) = caps
                        .get(1)
                        .and_then(|m| m.as_str().parse::<u8>().ok())
                        .map(|p| p.min(100))
                    {
                        let updated = {
                            let mut tasks = self.tasks.lock().await;
                            match tasks.get_mut(&task_id) {
                                Some(entry) => {
                                    entry.progress = Some(percent);
                                    true
                                }
                                None => false,
                            }
                        };
                        if updated {
                            self.bus
                                .publish(BusEvent::TaskProgress { task_id, percent });
                        }
                    }
                }
            }
            _ => {}
        }
    }

    async fn task_for_approval(&self, request_id: &str) -> Option<String> {
        let tasks = self.tasks.lock().await;
        tasks
            .iter()
            .find(|(_, e)| e.approval_request_id.as_deref() == Some(request_id))
            .map(|(id, _)| id.clone())
    }

    /// Move a task to a terminal state: drop it from the queue, release its
    /// locks, publish the terminal event.
    async fn finish_task(&self, task_id: &str, status: TaskStatus, reason: Option<String>) {
        {
            let mut tasks = self.tasks.lock().await;
            let Some(entry) = tasks.get_mut(task_id) else {
                return;
            };
            if entry.task.status.is_terminal() {
                return;
            }
            entry.task.status = status;
            entry.task.updated_at = chrono::Utc::now();
        }
        {
            let mut queue = self.queue.lock().await;
            queue.retain(|s| s.task_id != task_id);
        }
        if let Err(e) = self.locks.release_all_by_owner(task_id).await {
            warn!(task_id, error = %e, "failed to release task locks");
        }

        info!(task_id, status = ?status, "task finished");
        let task_id = task_id.to_string();
        match status {
            TaskStatus::Completed => self.bus.publish(BusEvent::TaskCompleted { task_id }),
            TaskStatus::Cancelled => self.bus.publish(BusEvent::TaskCancelled { task_id }),
            _ => self.bus.publish(BusEvent::TaskFailed {
                task_id,
                reason: reason.unwrap_or_else(|| "unspecified".to_string()),
            }),
        }
    }
}

/// Parse the `locks` context key: a comma-separated list of `<type>:<id>`.
fn parse_lock_requirements(task: &Task) -> Result<Vec<LockRequirement>> {
    let Some(raw) = task.context.get("locks") else {
        return Ok(Vec::new());
    };

    let mut requirements = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (type_raw, id) = item.split_once(':').ok_or_else(|| {
            KernelError::Validation(format!("lock requirement {item:?} is not <type>:<id>"))
        })?;
        let resource_type = ResourceType::from_str(type_raw).map_err(KernelError::Validation)?;
        if id.is_empty() {
            return Err(KernelError::Validation(format!(
                "lock requirement {item:?} has an empty id"
            )));
        }
        requirements.push(LockRequirement {
            resource_type,
            resource_id: id.to_string(),
            waiting: false,
        });
    }
    Ok(requirements)
}
