//! Language model collaborator
//!
//! The agent loop talks to the model through [`ModelClient`]. Messages use a
//! small provider-neutral shape: text, tool-use requests and tool results.

use crate::errors::{AgidError, AgidResult};
use crate::tools::{ToolDefinition, ToolResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    /// Tool results go back to the model as a user turn.
    pub fn tool_results(results: &[ToolResult]) -> Self {
        Self {
            role: Role::User,
            content: results
                .iter()
                .map(|r| ContentBlock::ToolResult {
                    tool_use_id: r.tool_use_id.clone(),
                    content: r.content.clone(),
                    is_error: r.is_error,
                })
                .collect(),
        }
    }

    /// Concatenated text blocks.
    pub fn text(&self) -> String {
        text_of(&self.content)
    }
}

fn text_of(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
}

/// One tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
}

impl ModelResponse {
    pub fn text(&self) -> String {
        text_of(&self.content)
    }

    /// Tool requests in the order the model listed them.
    pub fn tool_uses(&self) -> Vec<ToolUse> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => Some(ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: &ModelRequest) -> AgidResult<ModelResponse>;
}

/// Posts the neutral request shape as JSON to a configured endpoint.
pub struct HttpModelClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpModelClient {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> AgidResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgidError::config(format!("model http client: {e}")))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
        })
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn complete(&self, request: &ModelRequest) -> AgidResult<ModelResponse> {
        let body = serde_json::json!({
            "model": self.model,
            "system": request.system,
            "messages": request.messages,
            "tools": request.tools,
        });

        let mut call = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            call = call.bearer_auth(key);
        }
        let response = call.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AgidError::fatal(format!("model endpoint returned {status}")));
        }
        let parsed: ModelResponse = response.json().await?;
        debug!(stop_reason = ?parsed.stop_reason, blocks = parsed.content.len(), "model response");
        Ok(parsed)
    }
}

/// Stand-in used when no model endpoint is configured: every call fails,
/// so the loop answers with its degraded-service message.
pub struct UnconfiguredModelClient;

#[async_trait]
impl ModelClient for UnconfiguredModelClient {
    async fn complete(&self, _request: &ModelRequest) -> AgidResult<ModelResponse> {
        Err(AgidError::fatal("no model endpoint configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_wire_shape() {
        let raw = json!({
            "content": [
                {"type": "text", "text": "checking"},
                {"type": "tool_use", "id": "t1", "name": "current_time", "input": {}}
            ],
            "stop_reason": "tool_use"
        });
        let response: ModelResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(response.text(), "checking");
        assert_eq!(response.tool_uses()[0].name, "current_time");
    }

    #[test]
    fn test_tool_results_become_user_turn() {
        let msg = ChatMessage::tool_results(&[ToolResult {
            tool_use_id: "t1".to_string(),
            tool_name: "x".to_string(),
            content: "boom".to_string(),
            is_error: true,
            error_kind: Some("tool_execution".to_string()),
        }]);
        assert_eq!(msg.role, Role::User);
        assert!(matches!(
            &msg.content[0],
            ContentBlock::ToolResult { is_error: true, .. }
        ));
    }
}
