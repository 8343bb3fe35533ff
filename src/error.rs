use thiserror::Error;

/// Convenience type alias for Results with KernelError
pub type Result<T> = std::result::Result<T, KernelError>;

/// Main error type for the orchestration kernel
///
/// Covers the failure taxonomy of the kernel: caller input problems,
/// transient backend failures, and fatal conditions. Contention outcomes
/// (queued locks, pending approvals, spawner at capacity) are expressed as
/// ordinary return values, never through this enum.
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Lock backend error: {message}")]
    LockBackend { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("KV store error: {0}")]
    Kv(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Agent error: {message}")]
    Agent { message: String },

    #[error("Task error: {task_id} - {message}")]
    Task { task_id: String, message: String },

    #[error("Approval queue is full")]
    QueueFull,

    #[error("No approval policy matches request type: {0}")]
    NoPolicy(String),

    #[error("Notification dispatch failed: {0}")]
    Notification(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timeout: {message}")]
    Timeout { message: String },

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
