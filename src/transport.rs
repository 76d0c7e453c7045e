//! Message transport
//!
//! Peer messages arrive in named message boxes. The gateway only needs
//! three operations from the transport (`send`, `list`, `acknowledge`);
//! [`MemoryTransport`] provides them in-process for tests and local runs.

use crate::errors::{AgidError, AgidResult, SafeLock};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportMessage {
    pub message_id: String,
    pub sender: String,
    pub message_box: String,
    pub body: String,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `body` to `recipient`'s `message_box`. Returns the message id.
    async fn send(&self, recipient: &str, message_box: &str, body: String) -> AgidResult<String>;

    /// Unacknowledged messages in one of our boxes.
    async fn list(&self, message_box: &str) -> AgidResult<Vec<TransportMessage>>;

    async fn acknowledge(&self, message_ids: &[String]) -> AgidResult<()>;
}

/// Capped exponential backoff with a maximum attempt count.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds or attempts run out. Exhaustion is a
    /// terminal transport error carrying the last failure.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> AgidResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AgidResult<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt < attempts {
                        let delay = self.delay_for(attempt);
                        warn!(
                            operation = %operation,
                            attempt,
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(e);
                }
            }
        }
        Err(AgidError::transport(
            operation,
            format!(
                "gave up after {attempts} attempts: {}",
                last_error.map(|e| e.to_string()).unwrap_or_default()
            ),
        ))
    }
}

type Boxes = HashMap<(String, String), Vec<TransportMessage>>;

/// In-process transport. Endpoints created from the same hub see each
/// other's messages.
#[derive(Clone)]
pub struct MemoryTransport {
    owner: String,
    boxes: Arc<Mutex<Boxes>>,
    failing_lists: Arc<AtomicUsize>,
    failing_sends: Arc<Mutex<HashMap<String, usize>>>,
}

impl MemoryTransport {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            boxes: Arc::new(Mutex::new(HashMap::new())),
            failing_lists: Arc::new(AtomicUsize::new(0)),
            failing_sends: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Another endpoint on the same hub.
    pub fn endpoint(&self, owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            boxes: Arc::clone(&self.boxes),
            failing_lists: Arc::new(AtomicUsize::new(0)),
            failing_sends: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Make the next `n` calls to `list` fail.
    pub fn fail_next_lists(&self, n: usize) {
        self.failing_lists.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` sends from this endpoint into `message_box` fail.
    pub fn fail_next_sends(&self, message_box: &str, n: usize) {
        if let Ok(mut failing) = self.failing_sends.safe_lock() {
            failing.insert(message_box.to_string(), n);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, recipient: &str, message_box: &str, body: String) -> AgidResult<String> {
        if let Some(remaining) = self.failing_sends.safe_lock()?.get_mut(message_box) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(AgidError::transport("send", "simulated transport failure"));
            }
        }
        let message_id = Uuid::new_v4().to_string();
        self.boxes
            .safe_lock()?
            .entry((recipient.to_string(), message_box.to_string()))
            .or_default()
            .push(TransportMessage {
                message_id: message_id.clone(),
                sender: self.owner.clone(),
                message_box: message_box.to_string(),
                body,
            });
        Ok(message_id)
    }

    async fn list(&self, message_box: &str) -> AgidResult<Vec<TransportMessage>> {
        let remaining = self.failing_lists.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_lists.store(remaining - 1, Ordering::SeqCst);
            return Err(AgidError::transport("list", "simulated transport failure"));
        }
        Ok(self
            .boxes
            .safe_lock()?
            .get(&(self.owner.clone(), message_box.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn acknowledge(&self, message_ids: &[String]) -> AgidResult<()> {
        let mut boxes = self.boxes.safe_lock()?;
        for ((recipient, _), messages) in boxes.iter_mut() {
            if recipient == &self.owner {
                messages.retain(|m| !message_ids.contains(&m.message_id));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            max_attempts: 10,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_retry_exhaustion_is_terminal_transport_error() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            max_attempts: 3,
        };
        let calls = AtomicU32::new(0);
        let result: AgidResult<()> = policy
            .run("connect", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AgidError::transport("connect", "refused"))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let err = result.unwrap_err();
        assert!(matches!(err, AgidError::Transport { .. }));
        assert!(err.to_string().contains("gave up after 3 attempts"));
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        let calls = AtomicU32::new(0);
        let value = policy
            .run("list", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AgidError::transport("list", "flaky"))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_memory_transport_send_list_ack() {
        let agent = MemoryTransport::new("agent");
        let alice = agent.endpoint("alice");

        let id = alice.send("agent", "inbox", "hello".to_string()).await.unwrap();
        let listed = agent.list("inbox").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].sender, "alice");

        // alice's own box is separate
        assert!(alice.list("inbox").await.unwrap().is_empty());

        agent.acknowledge(&[id]).await.unwrap();
        assert!(agent.list("inbox").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_send_failures_are_per_box() {
        let agent = MemoryTransport::new("agent");
        let alice = agent.endpoint("alice");
        agent.fail_next_sends("replies", 1);

        assert!(agent.send("alice", "replies", "a".to_string()).await.is_err());
        agent.send("alice", "progress", "b".to_string()).await.unwrap();
        agent.send("alice", "replies", "c".to_string()).await.unwrap();

        let replies = alice.list("replies").await.unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].body, "c");
    }
}
