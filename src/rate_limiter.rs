//! Per-sender sliding-window rate limiting for inbound messages.

use crate::errors::{AgidError, AgidResult};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

pub struct RateLimiter {
    requests: RwLock<HashMap<String, Vec<Instant>>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            requests: RwLock::new(HashMap::new()),
            max_requests,
            window,
        }
    }

    /// Record a request from `sender` if it fits in the window.
    pub async fn check(&self, sender: &str) -> bool {
        let mut requests = self.requests.write().await;
        let now = Instant::now();

        let sender_requests = requests.entry(sender.to_string()).or_default();
        sender_requests.retain(|&t| now.duration_since(t) < self.window);

        if sender_requests.len() >= self.max_requests {
            debug!(sender = %sender, "rate limit reached");
            return false;
        }
        sender_requests.push(now);
        true
    }

    /// Like [`check`](Self::check), as an error for `?` callers.
    pub async fn enforce(&self, sender: &str) -> AgidResult<()> {
        if self.check(sender).await {
            Ok(())
        } else {
            Err(AgidError::rate_limited(format!(
                "more than {} requests in {}s",
                self.max_requests,
                self.window.as_secs()
            )))
        }
    }

    pub async fn request_count(&self, sender: &str) -> usize {
        let requests = self.requests.read().await;
        let now = Instant::now();
        requests
            .get(sender)
            .map(|times| times.iter().filter(|&&t| now.duration_since(t) < self.window).count())
            .unwrap_or(0)
    }

    /// Drop senders with no requests left in the window.
    pub async fn cleanup_expired(&self) {
        let mut requests = self.requests.write().await;
        let now = Instant::now();
        for times in requests.values_mut() {
            times.retain(|&t| now.duration_since(t) < self.window);
        }
        requests.retain(|_, times| !times.is_empty());
    }

    pub async fn tracked_senders(&self) -> usize {
        self.requests.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_limit_per_sender() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));

        assert!(limiter.check("alice").await);
        assert!(limiter.check("alice").await);
        assert!(!limiter.check("alice").await);

        // other senders are unaffected
        assert!(limiter.check("bob").await);
        assert_eq!(limiter.request_count("alice").await, 2);
        assert!(matches!(
            limiter.enforce("alice").await,
            Err(AgidError::RateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn test_window_expiry_and_cleanup() {
        let limiter = RateLimiter::new(1, Duration::from_millis(100));
        assert!(limiter.check("alice").await);
        assert!(!limiter.check("alice").await);

        sleep(Duration::from_millis(150)).await;
        limiter.cleanup_expired().await;
        assert_eq!(limiter.tracked_senders().await, 0);
        assert!(limiter.check("alice").await);
    }
}
