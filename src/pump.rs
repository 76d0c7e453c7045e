//! Inbox polling and dispatch
//!
//! Each poll lists the inbox (retrying with backoff) and starts a task for
//! every message not already being handled. Tasks run on a long-lived set,
//! so a slow agent loop never holds up the next poll. Every message is
//! answered and acknowledged on its own. A reply that could not be
//! delivered is kept by message id and resent on the next poll instead of
//! running the message through the gateway again.
//! Progress events are forwarded best-effort to the sender's progress box.

use crate::errors::{AgidError, AgidResult, SafeLock};
use crate::gateway::Gateway;
use crate::messages::{InboundEnvelope, ProgressEvent};
use crate::transport::{RetryPolicy, Transport, TransportMessage};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

const PROGRESS_BUFFER: usize = 32;

#[derive(Debug, Clone)]
pub struct PumpSettings {
    pub inbox: String,
    pub reply_box: String,
    pub progress_box: String,
    pub poll_interval: Duration,
    /// Bound on each individual transport call.
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            inbox: "agidentity_inbox".to_string(),
            reply_box: "agidentity_responses".to_string(),
            progress_box: "agidentity_progress".to_string(),
            poll_interval: Duration::from_secs(2),
            call_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// An answered message that is still in the inbox.
#[derive(Debug, Clone, PartialEq)]
enum Delivery {
    /// Serialized reply not yet delivered.
    Unsent(String),
    /// Nothing left to send, only the acknowledgement.
    Sent,
}

/// Per-message bookkeeping, behind one lock so a poll never sees a
/// message between acknowledgement and release.
#[derive(Default)]
struct PumpState {
    in_flight: HashSet<String>,
    /// Acknowledged ids a stale listing may still show.
    acknowledged: HashSet<String>,
    answered: HashMap<String, Delivery>,
}

impl PumpState {
    fn claim(&mut self, message_id: &str) -> bool {
        if self.acknowledged.contains(message_id) {
            return false;
        }
        self.in_flight.insert(message_id.to_string())
    }

    /// Forget everything about messages the inbox no longer lists.
    fn retain_listed(&mut self, listed: &[TransportMessage]) {
        let listed: HashSet<&str> = listed.iter().map(|m| m.message_id.as_str()).collect();
        let in_flight = &self.in_flight;
        self.answered
            .retain(|id, _| in_flight.contains(id) || listed.contains(id.as_str()));
        self.acknowledged.retain(|id| listed.contains(id.as_str()));
    }
}

struct Shared {
    transport: Arc<dyn Transport>,
    gateway: Arc<Gateway>,
    settings: PumpSettings,
    state: Mutex<PumpState>,
}

pub struct MessagePump {
    shared: Arc<Shared>,
    tasks: Mutex<JoinSet<()>>,
}

impl MessagePump {
    pub fn new(
        transport: Arc<dyn Transport>,
        gateway: Arc<Gateway>,
        settings: PumpSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                gateway,
                settings,
                state: Mutex::new(PumpState::default()),
            }),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// One poll cycle. Returns how many messages were handed to new tasks.
    pub async fn poll_once(&self) -> AgidResult<usize> {
        self.reap()?;
        let shared = &self.shared;
        let settings = &shared.settings;
        let messages = settings
            .retry
            .run("transport.list", || {
                bounded(
                    "transport.list",
                    settings.call_timeout,
                    shared.transport.list(&settings.inbox),
                )
            })
            .await?;
        shared.state.safe_lock()?.retain_listed(&messages);
        if messages.is_empty() {
            return Ok(0);
        }

        let mut started = 0;
        for message in messages {
            if !shared.state.safe_lock()?.claim(&message.message_id) {
                debug!(message_id = %message.message_id, "message already handled or in flight");
                continue;
            }
            let task_shared = Arc::clone(shared);
            self.tasks.safe_lock()?.spawn(task_shared.process(message));
            started += 1;
        }
        debug!(started, "inbox messages dispatched");
        Ok(started)
    }

    /// Ids of messages currently being handled.
    pub fn in_flight(&self) -> Vec<String> {
        self.shared
            .state
            .safe_lock()
            .map(|state| state.in_flight.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Wait for every task started so far.
    pub async fn drain(&self) -> AgidResult<()> {
        let mut tasks = std::mem::replace(&mut *self.tasks.safe_lock()?, JoinSet::new());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "message task panicked");
            }
        }
        Ok(())
    }

    fn reap(&self) -> AgidResult<()> {
        let mut tasks = self.tasks.safe_lock()?;
        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "message task panicked");
            }
        }
        Ok(())
    }

    /// Poll forever on the configured interval.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(inbox = %self.shared.settings.inbox, "message pump started");
            let mut ticker = tokio::time::interval(self.shared.settings.poll_interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.poll_once().await {
                    error!(error = %e, "inbox poll failed");
                }
            }
        })
    }
}

/// Clears a message's in-flight mark when its task ends, panics included.
struct InFlightGuard {
    shared: Arc<Shared>,
    message_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.safe_lock() {
            state.in_flight.remove(&self.message_id);
        }
    }
}

impl Shared {
    fn remember(&self, message_id: &str, delivery: Delivery) {
        if let Ok(mut state) = self.state.safe_lock() {
            state.answered.insert(message_id.to_string(), delivery);
        }
    }

    fn mark_acknowledged(&self, message_id: &str) {
        if let Ok(mut state) = self.state.safe_lock() {
            state.acknowledged.insert(message_id.to_string());
        }
    }

    async fn process(self: Arc<Self>, message: TransportMessage) {
        let _guard = InFlightGuard {
            shared: Arc::clone(&self),
            message_id: message.message_id.clone(),
        };
        let id = message.message_id.as_str();

        let kept = self.state.safe_lock().ok().and_then(|mut s| s.answered.remove(id));
        let delivery = match kept {
            Some(delivery) => {
                debug!(message_id = %id, "resuming delivery of an answered message");
                delivery
            }
            None => match self.answer(&message).await {
                Some(delivery) => delivery,
                // Left unacknowledged so the next poll retries it.
                None => return,
            },
        };

        if let Delivery::Unsent(body) = &delivery {
            if let Err(e) = self.send_reply(&message.sender, body).await {
                error!(
                    message_id = %id,
                    error = %e,
                    "reply delivery failed; kept for the next poll"
                );
                self.remember(id, delivery);
                return;
            }
        }

        match self.acknowledge(id).await {
            Ok(()) => {
                self.mark_acknowledged(id);
                debug!(message_id = %id, "message acknowledged");
            }
            Err(e) => {
                warn!(
                    message_id = %id,
                    error = %e,
                    "acknowledgement failed; kept for the next poll"
                );
                self.remember(id, Delivery::Sent);
            }
        }
    }

    /// Run the message through the gateway. `None` leaves it for a retry.
    async fn answer(&self, message: &TransportMessage) -> Option<Delivery> {
        let envelope: InboundEnvelope = match serde_json::from_str(&message.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Unparseable messages are dropped, not retried.
                warn!(
                    message_id = %message.message_id,
                    sender = %message.sender,
                    error = %e,
                    "discarding malformed message"
                );
                return Some(Delivery::Sent);
            }
        };

        let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_BUFFER);
        let forwarder = tokio::spawn(forward_progress(
            Arc::clone(&self.transport),
            message.sender.clone(),
            self.settings.progress_box.clone(),
            progress_rx,
        ));

        let outcome = self
            .gateway
            .handle_message(&message.sender, envelope, Some(&progress_tx))
            .await;
        drop(progress_tx);
        let _ = forwarder.await;

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    message_id = %message.message_id,
                    sender = %message.sender,
                    error = %e,
                    "message could not be handled"
                );
                return Some(Delivery::Sent);
            }
        };

        match serde_json::to_string(&response) {
            Ok(body) => Some(Delivery::Unsent(body)),
            Err(e) => {
                error!(error = %e, "response serialization failed");
                None
            }
        }
    }

    async fn send_reply(&self, recipient: &str, body: &str) -> AgidResult<String> {
        let settings = &self.settings;
        settings
            .retry
            .run("transport.send", || {
                bounded(
                    "transport.send",
                    settings.call_timeout,
                    self.transport
                        .send(recipient, &settings.reply_box, body.to_string()),
                )
            })
            .await
    }

    async fn acknowledge(&self, message_id: &str) -> AgidResult<()> {
        let settings = &self.settings;
        let ids = [message_id.to_string()];
        settings
            .retry
            .run("transport.acknowledge", || {
                bounded(
                    "transport.acknowledge",
                    settings.call_timeout,
                    self.transport.acknowledge(&ids),
                )
            })
            .await
    }
}

async fn bounded<T>(
    operation: &str,
    limit: Duration,
    call: impl Future<Output = AgidResult<T>>,
) -> AgidResult<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(AgidError::timeout(operation, limit.as_secs())),
    }
}

async fn forward_progress(
    transport: Arc<dyn Transport>,
    recipient: String,
    progress_box: String,
    mut events: mpsc::Receiver<ProgressEvent>,
) {
    while let Some(event) = events.recv().await {
        let body = match serde_json::to_string(&event) {
            Ok(body) => body,
            Err(_) => continue,
        };
        if let Err(e) = transport.send(&recipient, &progress_box, body).await {
            debug!(error = %e, "progress event not delivered");
        }
    }
}
