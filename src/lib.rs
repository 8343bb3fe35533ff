//! # Fleet Core
//!
//! Fleet Core is the orchestration kernel for a fleet of AI agents driven
//! through an external CLI. It launches bounded concurrent subprocesses with
//! per-type configuration, prevents conflicting concurrent work through a
//! resource lock manager, meters usage against hourly plan quotas with
//! threshold alerting, and gates critical operations behind a human-approval
//! state machine with timeouts, escalation, and audited emergency bypass.
//!
//! ## Architecture
//!
//! Six cooperating components, wired once at process start:
//! - **Lock Manager**: TTL-bounded exclusive locks over typed resources with
//!   priority wait queues, in-process or KV-backed
//! - **Usage Meter**: per-invocation token/time/cost records, eager window
//!   aggregates, threshold alerts
//! - **Approval Gate**: quorum/veto state machine with reminders,
//!   escalation, emergency bypass, and an append-only audit trail
//! - **Agent Spawner**: supervised CLI subprocesses behind a global
//!   concurrency cap
//! - **Task Dispatcher**: priority queue flowing through approvals and
//!   locks into the spawner
//! - **Event Bus**: bounded fire-and-forget pub/sub binding the kernel to
//!   external fan-out
//!
//! HTTP surfaces, conversation storage, and concrete notification channels
//! are external collaborators behind narrow traits.

/// Human-approval gate for guarded operations
pub mod approvals;
/// In-process event bus
pub mod bus;
/// Startup configuration
pub mod config;
/// System-wide constants
pub mod constants;
/// Task queue and dispatch loop
pub mod dispatcher;
/// Error types and handling
pub mod error;
/// Process-level wiring of the singletons
pub mod kernel;
/// KV store connection bootstrap
pub mod kv;
/// Resource lock manager
pub mod locks;
/// Core data models
pub mod models;
/// Notification dispatch contract
pub mod notify;
/// Role oracle contract
pub mod roles;
/// Agent subprocess supervision
pub mod spawner;
/// Durable storage seams
pub mod storage;
/// Usage metering and alerting
pub mod usage;

#[cfg(test)]
mod tests;

pub use error::{KernelError, Result};
pub use kernel::Kernel;
