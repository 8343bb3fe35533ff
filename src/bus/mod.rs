//! In-process event bus binding the kernel components to external fan-out.
//!
//! Delivery is best-effort fire-and-forget over a bounded broadcast channel:
//! publishers never block, and a subscriber that lags past the buffer
//! capacity observes dropped events. The bus persists nothing.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::constants::BUS_CAPACITY;
use crate::models::{AgentState, AgentType};
use crate::usage::AlertRecord;

/// Typed kernel event, one variant per fixed topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "kebab-case")]
pub enum BusEvent {
    AgentSpawned {
        agent_id: String,
        agent_type: AgentType,
        task_id: String,
    },
    AgentStatus {
        agent_id: String,
        state: AgentState,
    },
    AgentOutput {
        agent_id: String,
        task_id: String,
        line: String,
    },
    AgentErrorOutput {
        agent_id: String,
        task_id: String,
        line: String,
    },
    AgentCompleted {
        agent_id: String,
        task_id: String,
        exit_code: i32,
    },
    AgentTerminated {
        agent_id: String,
        task_id: String,
    },
    TaskQueued {
        task_id: String,
    },
    TaskDispatched {
        task_id: String,
        agent_id: String,
    },
    TaskProgress {
        task_id: String,
        percent: u8,
    },
    TaskCompleted {
        task_id: String,
    },
    TaskFailed {
        task_id: String,
        reason: String,
    },
    TaskCancelled {
        task_id: String,
    },
    ApprovalRequired {
        request_id: String,
        level: String,
    },
    ApprovalDecided {
        request_id: String,
        decider_id: String,
        approved: bool,
    },
    ApprovalGranted {
        request_id: String,
    },
    ApprovalRejected {
        request_id: String,
    },
    ApprovalExpired {
        request_id: String,
    },
    ApprovalBypassed {
        request_id: String,
        actor_id: String,
    },
    LockAcquired {
        key: String,
        lock_id: String,
        owner_id: String,
    },
    LockReleased {
        key: String,
        lock_id: String,
    },
    LockGrantedFromQueue {
        key: String,
        lock_id: String,
        owner_id: String,
    },
    UsageTracked {
        record_id: String,
        user_id: String,
        cost: String,
    },
    UsageAlert {
        alert: AlertRecord,
    },
}

impl BusEvent {
    /// Topic string this event publishes under.
    pub fn topic(&self) -> &'static str {
        match self {
            BusEvent::AgentSpawned { .. } => "agent:spawned",
            BusEvent::AgentStatus { .. } => "agent:status",
            BusEvent::AgentOutput { .. } => "agent:output",
            BusEvent::AgentErrorOutput { .. } => "agent:error",
            BusEvent::AgentCompleted { .. } => "agent:completed",
            BusEvent::AgentTerminated { .. } => "agent:terminated",
            BusEvent::TaskQueued { .. } => "task:queued",
            BusEvent::TaskDispatched { .. } => "task:dispatched",
            BusEvent::TaskProgress { .. } => "task:progress",
            BusEvent::TaskCompleted { .. } => "task:completed",
            BusEvent::TaskFailed { .. } => "task:failed",
            BusEvent::TaskCancelled { .. } => "task:cancelled",
            BusEvent::ApprovalRequired { .. } => "approval:required",
            BusEvent::ApprovalDecided { .. } => "approval:decided",
            BusEvent::ApprovalGranted { .. } => "approval:granted",
            BusEvent::ApprovalRejected { .. } => "approval:rejected",
            BusEvent::ApprovalExpired { .. } => "approval:expired",
            BusEvent::ApprovalBypassed { .. } => "approval:bypassed",
            BusEvent::LockAcquired { .. } => "lock:acquired",
            BusEvent::LockReleased { .. } => "lock:released",
            BusEvent::LockGrantedFromQueue { .. } => "lock:granted-from-queue",
            BusEvent::UsageTracked { .. } => "usage:tracked",
            BusEvent::UsageAlert { .. } => "usage:alert",
        }
    }
}

/// Broadcast-backed in-process bus shared by all kernel components.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: Arc<broadcast::Sender<BusEvent>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BUS_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx: Arc::new(tx) }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Never blocks and never fails: with no subscribers the event is simply
    /// dropped, and lagging subscribers miss events rather than stalling the
    /// publisher.
    pub fn publish(&self, event: BusEvent) {
        debug!(topic = event.topic(), "bus publish");
        let _ = self.tx.send(event);
    }

    /// Subscribe to the live event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
