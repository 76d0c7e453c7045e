//! Conversation state
//!
//! The manager is the only owner of the conversation map. Lookup and insert
//! happen under one lock, so two concurrent first messages from the same
//! participant with the same explicit id always end up in one conversation.
//! Only short previews are kept here; full message bodies go to the audit
//! trail.

use crate::canonicalize::sha256_hex;
use crate::errors::{AgidResult, SafeLock};
use crate::history::SessionHistory;
use crate::session_encryption::SessionEncryption;
use crate::signer::SigningCapability;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CONVERSATION_ID_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePreview {
    pub role: PreviewRole,
    pub preview: String,
    pub timestamp: DateTime<Utc>,
}

pub struct Conversation {
    pub conversation_id: String,
    pub participant_key: String,
    pub messages: Vec<MessagePreview>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub encryption: SessionEncryption,
}

pub type ConversationHandle = Arc<tokio::sync::Mutex<Conversation>>;

#[derive(Debug, Clone)]
pub struct ConversationSettings {
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub preview_len: usize,
    pub max_previews: usize,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            preview_len: 100,
            max_previews: 50,
        }
    }
}

struct Slot {
    handle: ConversationHandle,
    last_activity: Instant,
}

pub struct ConversationManager {
    conversations: Mutex<HashMap<String, Slot>>,
    signer: SigningCapability,
    history: Arc<SessionHistory>,
    settings: ConversationSettings,
}

/// Map key for a conversation; also the key of its turn history.
pub fn composite_key(participant: &str, conversation_id: &str) -> String {
    format!("{participant}:{conversation_id}")
}

/// Id derived from participant, time and randomness.
pub fn new_conversation_id(participant: &str) -> String {
    let mut nonce = [0u8; 16];
    rand::rng().fill_bytes(&mut nonce);
    let mut input = participant.as_bytes().to_vec();
    input.extend_from_slice(&Utc::now().timestamp_millis().to_be_bytes());
    input.extend_from_slice(&nonce);
    sha256_hex(&input)[..CONVERSATION_ID_LEN].to_string()
}

pub fn truncate_preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max_chars).collect();
        out.push_str("...");
        out
    }
}

impl ConversationManager {
    pub fn new(
        signer: SigningCapability,
        history: Arc<SessionHistory>,
        settings: ConversationSettings,
    ) -> Self {
        Self {
            conversations: Mutex::new(HashMap::new()),
            signer,
            history,
            settings,
        }
    }

    pub fn settings(&self) -> &ConversationSettings {
        &self.settings
    }

    /// Find the conversation or start one. Returns the handle, its id and
    /// whether it was created by this call.
    pub fn get_or_create_conversation(
        &self,
        participant: &str,
        conversation_id: Option<&str>,
    ) -> AgidResult<(ConversationHandle, String, bool)> {
        let conversation_id = match conversation_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => new_conversation_id(participant),
        };
        let key = composite_key(participant, &conversation_id);

        let mut map = self.conversations.safe_lock()?;
        if let Some(slot) = map.get_mut(&key) {
            slot.last_activity = Instant::now();
            return Ok((slot.handle.clone(), conversation_id, false));
        }

        let now = Utc::now();
        let handle = Arc::new(tokio::sync::Mutex::new(Conversation {
            conversation_id: conversation_id.clone(),
            participant_key: participant.to_string(),
            messages: Vec::new(),
            created_at: now,
            last_activity_at: now,
            encryption: SessionEncryption::new(
                conversation_id.clone(),
                participant,
                self.signer.clone(),
            ),
        }));
        map.insert(
            key,
            Slot {
                handle: handle.clone(),
                last_activity: Instant::now(),
            },
        );
        debug!(
            participant = %participant,
            conversation_id = %conversation_id,
            "conversation created"
        );
        Ok((handle, conversation_id, true))
    }

    /// Attach an inbound message from a verified sender to its conversation.
    pub async fn process_incoming_message(
        &self,
        sender: &str,
        conversation_id: Option<&str>,
        content: &str,
    ) -> AgidResult<(ConversationHandle, String)> {
        let (handle, id, _) = self.get_or_create_conversation(sender, conversation_id)?;
        self.append_preview(&handle, PreviewRole::User, content).await;
        Ok((handle, id))
    }

    pub async fn append_preview(&self, handle: &ConversationHandle, role: PreviewRole, text: &str) {
        let mut conversation = handle.lock().await;
        let now = Utc::now();
        conversation.messages.push(MessagePreview {
            role,
            preview: truncate_preview(text, self.settings.preview_len),
            timestamp: now,
        });
        let excess = conversation
            .messages
            .len()
            .saturating_sub(self.settings.max_previews);
        if excess > 0 {
            conversation.messages.drain(..excess);
        }
        conversation.last_activity_at = now;
    }

    pub fn end_conversation(&self, participant: &str, conversation_id: &str) -> AgidResult<bool> {
        let key = composite_key(participant, conversation_id);
        let removed = self.conversations.safe_lock()?.remove(&key).is_some();
        if removed {
            self.history.clear(&key)?;
            info!(
                participant = %participant,
                conversation_id = %conversation_id,
                "conversation ended"
            );
        }
        Ok(removed)
    }

    /// Evict conversations idle longer than the timeout. Returns their ids.
    pub fn cleanup_stale_conversations(&self) -> AgidResult<Vec<String>> {
        let idle_timeout = self.settings.idle_timeout;
        let mut evicted_keys = Vec::new();
        let mut evicted = Vec::new();
        {
            let mut map = self.conversations.safe_lock()?;
            map.retain(|key, slot| {
                let keep = slot.last_activity.elapsed() < idle_timeout;
                if !keep {
                    evicted_keys.push(key.clone());
                    if let Some((_, id)) = key.rsplit_once(':') {
                        evicted.push(id.to_string());
                    }
                }
                keep
            });
        }
        for key in &evicted_keys {
            self.history.clear(key)?;
        }
        if !evicted.is_empty() {
            info!(count = evicted.len(), "evicted idle conversations");
        }
        Ok(evicted)
    }

    pub fn active_count(&self) -> AgidResult<usize> {
        Ok(self.conversations.safe_lock()?.len())
    }

    /// Run the idle sweep on a fixed interval until the task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = manager.settings.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = manager.cleanup_stale_conversations() {
                    warn!(error = %e, "conversation sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::{LocalSigner, Network};

    fn manager(settings: ConversationSettings) -> ConversationManager {
        let signer = SigningCapability::new(
            Arc::new(LocalSigner::generate(Network::Local)),
            Duration::from_secs(5),
        );
        ConversationManager::new(signer, Arc::new(SessionHistory::new(20)), settings)
    }

    #[test]
    fn test_generated_ids_are_distinct_and_fixed_length() {
        let a = new_conversation_id("alice");
        let b = new_conversation_id("alice");
        assert_ne!(a, b);
        assert_eq!(a.len(), CONVERSATION_ID_LEN);
    }

    #[tokio::test]
    async fn test_explicit_id_continues_conversation() {
        let mgr = manager(ConversationSettings::default());
        let (_, id, created) = mgr.get_or_create_conversation("alice", None).unwrap();
        assert!(created);

        let (_, same, created) = mgr.get_or_create_conversation("alice", Some(&id)).unwrap();
        assert_eq!(same, id);
        assert!(!created);

        // Same id under another participant is a different conversation.
        let (_, _, created) = mgr.get_or_create_conversation("bob", Some(&id)).unwrap();
        assert!(created);
        assert_eq!(mgr.active_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_previews_truncated_and_bounded() {
        let mgr = manager(ConversationSettings {
            max_previews: 3,
            preview_len: 10,
            ..ConversationSettings::default()
        });
        let long = "x".repeat(500);
        let mut handle = None;
        for _ in 0..5 {
            let (h, _) = mgr
                .process_incoming_message("alice", Some("c1"), &long)
                .await
                .unwrap();
            handle = Some(h);
        }
        let handle = handle.unwrap();
        let conversation = handle.lock().await;
        assert_eq!(conversation.messages.len(), 3);
        assert_eq!(conversation.messages[0].preview, format!("{}...", "x".repeat(10)));
    }

    #[tokio::test]
    async fn test_idle_conversations_evicted() {
        let mgr = manager(ConversationSettings {
            idle_timeout: Duration::from_millis(20),
            ..ConversationSettings::default()
        });
        mgr.get_or_create_conversation("alice", Some("old")).unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        mgr.get_or_create_conversation("bob", Some("fresh")).unwrap();

        let evicted = mgr.cleanup_stale_conversations().unwrap();
        assert_eq!(evicted, vec!["old".to_string()]);
        assert_eq!(mgr.active_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_end_conversation() {
        let mgr = manager(ConversationSettings::default());
        mgr.get_or_create_conversation("alice", Some("c1")).unwrap();
        assert!(mgr.end_conversation("alice", "c1").unwrap());
        assert!(!mgr.end_conversation("alice", "c1").unwrap());
    }
}
