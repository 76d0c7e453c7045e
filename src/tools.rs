//! Tool registry
//!
//! Tools are registered once at startup in a name-keyed table and all share
//! one execution contract. A tool that touches the signing capability says
//! so through [`Tool::requires_wallet`]; the registry then holds the global
//! signer lock for the tool's entire execution and hands it the guard.
//! Tools without that flag get no signer access at all.

use crate::errors::{AgidError, AgidResult};
use crate::signer::{
    Counterparty, Identity, KeyRef, Protocol, SecurityLevel, SignerGuard, SigningCapability,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the model sees about a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Outcome of one tool call, fed back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub tool_use_id: String,
    pub tool_name: String,
    pub content: String,
    pub is_error: bool,
    /// Error class when `is_error` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

/// Per-call execution context. Passed in rather than held by tools.
pub struct ToolContext {
    pub session_id: String,
    pub agent: Identity,
    pub sender: Option<String>,
    wallet: Option<SignerGuard>,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>, agent: Identity, sender: Option<String>) -> Self {
        Self {
            session_id: session_id.into(),
            agent,
            sender,
            wallet: None,
        }
    }

    fn with_wallet(mut self, guard: SignerGuard) -> Self {
        self.wallet = Some(guard);
        self
    }

    /// The signer, available only to tools that declared `requires_wallet`.
    pub fn wallet(&self, tool: &str) -> AgidResult<&SignerGuard> {
        self.wallet
            .as_ref()
            .ok_or_else(|| AgidError::tool(tool, "tool has no signing capability access"))
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    fn requires_wallet(&self) -> bool {
        false
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> AgidResult<String>;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in tools.
    pub fn with_builtin_tools() -> Self {
        let mut registry = Self::new();
        let builtins: [Arc<dyn Tool>; 4] = [
            Arc::new(IdentityInfoTool),
            Arc::new(CurrentTimeTool),
            Arc::new(SignMessageTool),
            Arc::new(EncryptMemoryTool),
        ];
        for tool in builtins {
            let name = tool.definition().name;
            registry.tools.insert(name, tool);
        }
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> AgidResult<()> {
        let definition = tool.definition();
        if definition.name.is_empty() {
            return Err(AgidError::validation("tool.name", "empty tool name"));
        }
        if self.tools.contains_key(&definition.name) {
            return Err(AgidError::validation(
                "tool.name",
                format!("tool '{}' already registered", definition.name),
            ));
        }
        info!(tool = %definition.name, requires_wallet = tool.requires_wallet(), "registered tool");
        self.tools.insert(definition.name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions sorted by name so the model sees a stable list.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Run one tool call. Never fails: errors become `is_error` results.
    pub async fn execute(
        &self,
        tool_use_id: &str,
        name: &str,
        params: Value,
        ctx: ToolContext,
        signer: &SigningCapability,
    ) -> ToolResult {
        let outcome = self.execute_inner(name, params, ctx, signer).await;
        let (content, error_kind) = match outcome {
            Ok(content) => (content, None),
            Err(e) => {
                warn!(tool = %name, error = %e, "tool call failed");
                (format!("Error: {e}"), Some(e.kind().to_string()))
            }
        };
        ToolResult {
            tool_use_id: tool_use_id.to_string(),
            tool_name: name.to_string(),
            content,
            is_error: error_kind.is_some(),
            error_kind,
        }
    }

    async fn execute_inner(
        &self,
        name: &str,
        params: Value,
        ctx: ToolContext,
        signer: &SigningCapability,
    ) -> AgidResult<String> {
        let tool = self
            .get(name)
            .ok_or_else(|| AgidError::tool(name, "unknown tool"))?;

        if tool.requires_wallet() {
            // Held until the tool returns.
            let guard = signer.acquire_bounded().await?;
            debug!(tool = %name, "signer lock acquired for tool");
            let ctx = ctx.with_wallet(guard);
            tool.execute(params, &ctx).await
        } else {
            tool.execute(params, &ctx).await
        }
    }
}

fn required_str<'a>(tool: &str, params: &'a Value, field: &str) -> AgidResult<&'a str> {
    params
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| AgidError::tool(tool, format!("missing string parameter '{field}'")))
}

pub struct IdentityInfoTool;

#[async_trait]
impl Tool for IdentityInfoTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "identity_info".to_string(),
            description: "Return the agent's public identity and the current session id."
                .to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> AgidResult<String> {
        Ok(json!({
            "publicKey": ctx.agent.public_key,
            "network": ctx.agent.network,
            "sessionId": ctx.session_id,
            "sender": ctx.sender,
        })
        .to_string())
    }
}

pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "current_time".to_string(),
            description: "Return the current UTC time in RFC 3339 format.".to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    async fn execute(&self, _params: Value, _ctx: &ToolContext) -> AgidResult<String> {
        Ok(chrono::Utc::now().to_rfc3339())
    }
}

pub struct SignMessageTool;

#[async_trait]
impl Tool for SignMessageTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "sign_message".to_string(),
            description: "Sign a message with the agent's identity key.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "message": {"type": "string"},
                    "protocol": {"type": "string"}
                },
                "required": ["message"]
            }),
        }
    }

    fn requires_wallet(&self) -> bool {
        true
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> AgidResult<String> {
        let message = required_str("sign_message", &params, "message")?;
        let protocol = params
            .get("protocol")
            .and_then(Value::as_str)
            .unwrap_or("agent message signing");
        let key = KeyRef::new(
            Protocol::new(SecurityLevel::App, protocol),
            ctx.session_id.clone(),
            Counterparty::Myself,
        );
        let wallet = ctx.wallet("sign_message")?;
        let signature = wallet.sign(message.as_bytes(), &key).await?;
        Ok(json!({
            "signature": hex::encode(signature),
            "publicKey": wallet.identity().public_key,
            "protocol": protocol,
            "keyId": ctx.session_id,
        })
        .to_string())
    }
}

pub struct EncryptMemoryTool;

#[async_trait]
impl Tool for EncryptMemoryTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "encrypt_memory".to_string(),
            description: "Encrypt data so only this agent can read it later.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "data": {"type": "string"},
                    "keyId": {"type": "string"}
                },
                "required": ["data"]
            }),
        }
    }

    fn requires_wallet(&self) -> bool {
        true
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> AgidResult<String> {
        let data = required_str("encrypt_memory", &params, "data")?;
        let key_id = params
            .get("keyId")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();
        let key = KeyRef::new(
            Protocol::new(SecurityLevel::Counterparty, "agent memory"),
            key_id.clone(),
            Counterparty::Myself,
        );
        let ciphertext = ctx.wallet("encrypt_memory")?.encrypt(data.as_bytes(), &key).await?;
        Ok(json!({"ciphertext": B64.encode(ciphertext), "keyId": key_id}).to_string())
    }
}
