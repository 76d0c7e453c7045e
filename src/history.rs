//! Bounded per-session turn history for the agent loop.

use crate::errors::{AgidResult, SafeLock};
use crate::model::{ChatMessage, ContentBlock, Role};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

pub struct SessionHistory {
    sessions: Mutex<HashMap<String, VecDeque<ChatMessage>>>,
    max_messages: usize,
}

impl SessionHistory {
    pub fn new(max_messages: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_messages: max_messages.max(1),
        }
    }

    pub fn load(&self, session_id: &str) -> AgidResult<Vec<ChatMessage>> {
        Ok(self
            .sessions
            .safe_lock()?
            .get(session_id)
            .map(|turns| turns.iter().cloned().collect())
            .unwrap_or_default())
    }

    pub fn append(&self, session_id: &str, messages: &[ChatMessage]) -> AgidResult<()> {
        let mut sessions = self.sessions.safe_lock()?;
        let turns = sessions.entry(session_id.to_string()).or_default();
        turns.extend(messages.iter().cloned());
        while turns.len() > self.max_messages {
            turns.pop_front();
        }
        // Never start on a dangling tool result or an assistant turn.
        while turns.front().is_some_and(|m| !starts_user_turn(m)) {
            turns.pop_front();
        }
        Ok(())
    }

    pub fn clear(&self, session_id: &str) -> AgidResult<()> {
        self.sessions.safe_lock()?.remove(session_id);
        Ok(())
    }

    pub fn session_count(&self) -> AgidResult<usize> {
        Ok(self.sessions.safe_lock()?.len())
    }
}

fn starts_user_turn(message: &ChatMessage) -> bool {
    message.role == Role::User
        && message
            .content
            .iter()
            .all(|b| matches!(b, ContentBlock::Text { .. }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolResult;

    #[test]
    fn test_history_is_bounded_and_starts_on_user_text() {
        let history = SessionHistory::new(3);
        history
            .append(
                "s",
                &[
                    ChatMessage::user_text("one"),
                    ChatMessage::assistant(vec![]),
                    ChatMessage::tool_results(&[ToolResult {
                        tool_use_id: "t".into(),
                        tool_name: "x".into(),
                        content: "r".into(),
                        is_error: false,
                        error_kind: None,
                    }]),
                    ChatMessage::assistant(vec![]),
                    ChatMessage::user_text("two"),
                ],
            )
            .unwrap();

        let turns = history.load("s").unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].text(), "two");

        history.clear("s").unwrap();
        assert!(history.load("s").unwrap().is_empty());
    }
}
