//! Notification dispatch contract.
//!
//! Concrete channels (email, websocket, slack, webhook, sms) are external
//! collaborators. The kernel only knows the dispatch shape and the retry
//! budget: up to 3 attempts with exponential backoff starting at 30 s, then
//! give up with a warning.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::constants::{NOTIFY_BACKOFF_BASE_SECS, NOTIFY_MAX_ATTEMPTS};
use crate::Result;

/// Delivery channel for a notification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Websocket,
    Slack,
    Webhook,
    Sms,
}

/// One outbound notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub recipient_id: String,
    pub channel: Channel,
    pub subject: String,
    pub body: String,
    pub data: serde_json::Value,
}

/// Fire-and-forget dispatch seam implemented by the hosting process.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, notification: Notification) -> Result<()>;
}

/// Dispatcher that records notifications in the log stream only.
///
/// The default wiring when no external dispatcher is provided; keeps the
/// kernel honest about what it would have sent.
#[derive(Debug, Default)]
pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn dispatch(&self, notification: Notification) -> Result<()> {
        info!(
            recipient = %notification.recipient_id,
            channel = ?notification.channel,
            subject = %notification.subject,
            "notification"
        );
        Ok(())
    }
}

/// Wraps any dispatcher with the kernel's retry budget.
pub struct RetryingDispatcher {
    inner: Arc<dyn NotificationDispatcher>,
    max_attempts: u32,
    base_backoff: Duration,
}

impl RetryingDispatcher {
    pub fn new(inner: Arc<dyn NotificationDispatcher>) -> Self {
        Self::with_budget(
            inner,
            NOTIFY_MAX_ATTEMPTS,
            Duration::from_secs(NOTIFY_BACKOFF_BASE_SECS),
        )
    }

    pub fn with_budget(
        inner: Arc<dyn NotificationDispatcher>,
        max_attempts: u32,
        base_backoff: Duration,
    ) -> Self {
        Self {
            inner,
            max_attempts,
            base_backoff,
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        // Exponential with a little jitter so coordinated failures don't
        // retry in lockstep.
        let base = self.base_backoff.as_millis() as u64 * (1u64 << attempt.min(8));
        let jitter = (base as f64 * 0.1 * rand::random::<f64>()) as u64;
        Duration::from_millis(base + jitter)
    }
}

#[async_trait]
impl NotificationDispatcher for RetryingDispatcher {
    async fn dispatch(&self, notification: Notification) -> Result<()> {
        let mut last_error = None;

        for attempt in 0..self.max_attempts {
            match self.inner.dispatch(notification.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        recipient = %notification.recipient_id,
                        attempt = attempt + 1,
                        error = %e,
                        "notification dispatch failed"
                    );
                    last_error = Some(e);
                    if attempt + 1 < self.max_attempts {
                        tokio::time::sleep(self.backoff_for(attempt)).await;
                    }
                }
            }
        }

        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempts made".to_string());
        warn!(
            recipient = %notification.recipient_id,
            "giving up on notification after {} attempts: {message}",
            self.max_attempts
        );
        Err(crate::KernelError::Notification(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyDispatcher {
        calls: AtomicU32,
        succeed_on: u32,
    }

    #[async_trait]
    impl NotificationDispatcher for FlakyDispatcher {
        async fn dispatch(&self, _notification: Notification) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_on {
                Ok(())
            } else {
                Err(crate::KernelError::Notification("boom".to_string()))
            }
        }
    }

    fn sample_notification() -> Notification {
        Notification {
            recipient_id: "user-1".to_string(),
            channel: Channel::Email,
            subject: "subject".to_string(),
            body: "body".to_string(),
            data: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn retries_until_success_within_budget() {
        let flaky = Arc::new(FlakyDispatcher {
            calls: AtomicU32::new(0),
            succeed_on: 2,
        });
        let dispatcher =
            RetryingDispatcher::with_budget(flaky.clone(), 3, Duration::from_millis(1));

        dispatcher.dispatch(sample_notification()).await.unwrap();
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let flaky = Arc::new(FlakyDispatcher {
            calls: AtomicU32::new(0),
            succeed_on: 10,
        });
        let dispatcher =
            RetryingDispatcher::with_budget(flaky.clone(), 3, Duration::from_millis(1));

        let result = dispatcher.dispatch(sample_notification()).await;
        assert!(result.is_err());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }
}
