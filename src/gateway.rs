//! Per-message orchestration
//!
//! ```text
//! inbound -> rate limit -> IdentityGate -> conversation -> session_start anchor
//!         -> AgentLoop (tool_call anchors) -> session_end anchor
//!         -> persist + commit chain -> sign response -> audit entry -> reply
//! ```
//!
//! Every signer operation goes through the shared [`SigningCapability`], so
//! messages handled concurrently still reach the signer one at a time.

use crate::agent_loop::{AgentLoop, AgentRunOutcome, LoopInput, LoopState, DEGRADED_RESPONSE};
use crate::anchor_chain::{summarize_input, tool_call_data, AnchorChain, AnchorType};
use crate::anchor_store::{AnchorStore, CommitmentReceipt};
use crate::audit_trail::{
    AuditRecord, SignedAuditTrail, ACTION_ACCESS_DENIED, ACTION_MESSAGE, ACTION_TOOL_REQUEST,
};
use crate::conversation::{composite_key, ConversationHandle, ConversationManager, PreviewRole};
use crate::errors::{AgidError, AgidResult};
use crate::identity_gate::{IdentityGate, IdentityVerificationResult};
use crate::messages::{response_key, InboundEnvelope, OutboundEnvelope, ProgressEvent, ResponseKind};
use crate::rate_limiter::RateLimiter;
use crate::session_encryption::{EncryptedMessage, SignedEnvelope};
use crate::signer::{Identity, SigningCapability};
use crate::tools::{ToolContext, ToolResult};
use crate::workspace::{hash_workspace, WorkspaceMonitor};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const ACCESS_DENIED_RESPONSE: &str =
    "Access denied: your identity could not be verified. \
     Present a valid certificate from a trusted certifier.";
pub const RATE_LIMITED_RESPONSE: &str =
    "Too many requests. Please slow down and try again shortly.";

/// What a finished session produced, for logs and the audit entry.
#[derive(Debug, Clone, Default)]
struct SessionSummary {
    session_id: String,
    anchor_count: usize,
    merkle_root: Option<String>,
    receipt_id: Option<String>,
}

pub struct Gateway {
    signer: SigningCapability,
    gate: Arc<IdentityGate>,
    conversations: Arc<ConversationManager>,
    agent: AgentLoop,
    audit: Arc<SignedAuditTrail>,
    store: Arc<dyn AnchorStore>,
    workspace: Option<WorkspaceMonitor>,
    rate_limiter: Option<RateLimiter>,
}

impl Gateway {
    pub fn new(
        signer: SigningCapability,
        gate: Arc<IdentityGate>,
        conversations: Arc<ConversationManager>,
        agent: AgentLoop,
        audit: Arc<SignedAuditTrail>,
        store: Arc<dyn AnchorStore>,
    ) -> Self {
        Self {
            signer,
            gate,
            conversations,
            agent,
            audit,
            store,
            workspace: None,
            rate_limiter: None,
        }
    }

    pub fn with_workspace(mut self, monitor: WorkspaceMonitor) -> Self {
        self.workspace = Some(monitor);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn identity(&self) -> &Identity {
        self.signer.identity()
    }

    pub fn signer(&self) -> &SigningCapability {
        &self.signer
    }

    pub fn gate(&self) -> &Arc<IdentityGate> {
        &self.gate
    }

    pub fn conversations(&self) -> &Arc<ConversationManager> {
        &self.conversations
    }

    pub fn audit(&self) -> &Arc<SignedAuditTrail> {
        &self.audit
    }

    pub fn store(&self) -> &Arc<dyn AnchorStore> {
        &self.store
    }

    /// Handle one inbound envelope from `sender`.
    ///
    /// Denials (identity, rate limit) come back as unsigned responses.
    /// Errors are reserved for requests that cannot be answered at all,
    /// such as undecryptable content.
    pub async fn handle_message(
        &self,
        sender: &str,
        envelope: InboundEnvelope,
        progress: Option<&mpsc::Sender<ProgressEvent>>,
    ) -> AgidResult<OutboundEnvelope> {
        let kind = response_kind(&envelope);

        if let Some(limiter) = &self.rate_limiter {
            if !limiter.check(sender).await {
                warn!(sender = %sender, request_id = %envelope.id(), "rate limited");
                return Ok(self.unsigned_response(kind, envelope.id(), RATE_LIMITED_RESPONSE));
            }
        }

        let verification = self.gate.verify_identity(sender, envelope.certificate()).await;
        if !verification.verified {
            return Ok(self.deny(sender, &envelope, kind, &verification).await);
        }

        match envelope {
            InboundEnvelope::ChatRequest {
                id,
                content,
                encrypted,
                signed_envelope,
                conversation_id,
                ..
            } => {
                self.handle_chat(
                    sender,
                    &id,
                    ChatBody {
                        content,
                        encrypted,
                        signed_envelope,
                    },
                    conversation_id.as_deref(),
                    &verification,
                    progress,
                )
                .await
            }
            InboundEnvelope::ToolRequest {
                id,
                tool_name,
                parameters,
                conversation_id,
                ..
            } => {
                self.handle_tool_request(
                    sender,
                    &id,
                    &tool_name,
                    parameters,
                    conversation_id.as_deref(),
                )
                .await
            }
        }
    }

    async fn deny(
        &self,
        sender: &str,
        envelope: &InboundEnvelope,
        kind: ResponseKind,
        verification: &IdentityVerificationResult,
    ) -> OutboundEnvelope {
        let reason = verification
            .reason
            .as_ref()
            .map(|r| r.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        warn!(sender = %sender, request_id = %envelope.id(), reason = %reason, "access denied");

        let record = AuditRecord {
            action: ACTION_ACCESS_DENIED.to_string(),
            user_public_key: sender.to_string(),
            input: None,
            output: Some(ACCESS_DENIED_RESPONSE.to_string()),
            metadata: json!({ "requestId": envelope.id(), "reason": reason }),
        };
        if let Err(e) = self.audit.create_entry(record).await {
            warn!(error = %e, "failed to record access denial");
        }
        self.unsigned_response(kind, envelope.id(), ACCESS_DENIED_RESPONSE)
    }

    async fn handle_chat(
        &self,
        sender: &str,
        request_id: &str,
        body: ChatBody,
        conversation_id: Option<&str>,
        verification: &IdentityVerificationResult,
        progress: Option<&mpsc::Sender<ProgressEvent>>,
    ) -> AgidResult<OutboundEnvelope> {
        let reply_encrypted = body.is_encrypted();
        let (handle, conversation_id, user_message) = match body {
            ChatBody {
                content: Some(content),
                encrypted: None,
                signed_envelope: None,
            } => {
                let (handle, id) = self
                    .conversations
                    .process_incoming_message(sender, conversation_id, &content)
                    .await?;
                (handle, id, content)
            }
            body => {
                let (handle, id, _) = self
                    .conversations
                    .get_or_create_conversation(sender, conversation_id)?;
                let plaintext = decrypt_body(&handle, body).await?;
                self.conversations
                    .append_preview(&handle, PreviewRole::User, &plaintext)
                    .await;
                (handle, id, plaintext)
            }
        };

        let mut chain =
            AnchorChain::new(Uuid::new_v4().to_string(), self.identity().public_key.clone());
        chain.add_anchor(
            AnchorType::SessionStart,
            session_start_data(sender, &conversation_id, request_id, verification),
            format!("session started for {sender}"),
            Value::Null,
        )?;

        let context_warning = self.check_workspace(&mut chain)?;

        let input = LoopInput {
            user_message: user_message.clone(),
            history_key: composite_key(sender, &conversation_id),
            session_id: conversation_id.clone(),
            sender: Some(sender.to_string()),
            request_id: request_id.to_string(),
            context_warning,
        };
        let outcome = match self.agent.run(input, Some(&mut chain), progress).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(session_id = %chain.session_id(), error = %e, "agent loop failed");
                AgentRunOutcome {
                    response: DEGRADED_RESPONSE.to_string(),
                    iterations: 0,
                    tool_results: Vec::new(),
                    terminal_state: LoopState::Idle,
                    degraded: true,
                }
            }
        };

        chain.add_anchor(
            AnchorType::SessionEnd,
            json!({
                "iterations": outcome.iterations,
                "toolCalls": outcome.tool_results.len(),
                "terminalState": format!("{:?}", outcome.terminal_state),
                "degraded": outcome.degraded,
            }),
            "session ended",
            Value::Null,
        )?;
        let summary = self.finish_session(chain).await?;

        let (content, encrypted) = if reply_encrypted {
            let message = handle
                .lock()
                .await
                .encryption
                .encrypt_outbound(outcome.response.as_bytes())
                .await?;
            (None, Some(message))
        } else {
            (Some(outcome.response.clone()), None)
        };

        let response = self
            .signed_response(OutboundEnvelope {
                kind: ResponseKind::ChatResponse,
                id: Uuid::new_v4().to_string(),
                request_id: request_id.to_string(),
                content,
                result: None,
                encrypted,
                conversation_id: Some(conversation_id.clone()),
                session_id: Some(summary.session_id.clone()),
                agent: self.identity().public_key.clone(),
                signature: None,
                signer_public_key: self.identity().public_key.clone(),
                signed: false,
                timestamp: Utc::now().to_rfc3339(),
            })
            .await;

        self.record_audit(AuditRecord {
            action: ACTION_MESSAGE.to_string(),
            user_public_key: sender.to_string(),
            input: Some(user_message),
            output: Some(outcome.response.clone()),
            metadata: json!({
                "requestId": request_id,
                "conversationId": conversation_id,
                "sessionId": summary.session_id,
                "anchorCount": summary.anchor_count,
                "merkleRoot": summary.merkle_root,
                "receiptId": summary.receipt_id,
                "toolCalls": outcome.tool_results.len(),
                "signed": response.signed,
            }),
        })
        .await;

        self.conversations
            .append_preview(&handle, PreviewRole::Assistant, &outcome.response)
            .await;
        Ok(response)
    }

    async fn handle_tool_request(
        &self,
        sender: &str,
        request_id: &str,
        tool_name: &str,
        parameters: Value,
        conversation_id: Option<&str>,
    ) -> AgidResult<OutboundEnvelope> {
        let (_, conversation_id, _) = self
            .conversations
            .get_or_create_conversation(sender, conversation_id)?;

        let mut chain =
            AnchorChain::new(Uuid::new_v4().to_string(), self.identity().public_key.clone());
        chain.add_anchor(
            AnchorType::SessionStart,
            json!({
                "sender": sender,
                "conversationId": conversation_id,
                "requestId": request_id,
                "direct": true,
            }),
            format!("direct tool request from {sender}"),
            Value::Null,
        )?;

        let ctx = ToolContext::new(
            conversation_id.clone(),
            self.identity().clone(),
            Some(sender.to_string()),
        );
        let result: ToolResult = self
            .agent
            .tools()
            .execute(request_id, tool_name, parameters.clone(), ctx, &self.signer)
            .await;

        chain.add_anchor(
            AnchorType::ToolCall,
            tool_call_data(tool_name, &parameters, &result.content, result.is_error),
            format!("{tool_name}({})", summarize_input(&parameters)),
            Value::Null,
        )?;
        chain.add_anchor(
            AnchorType::SessionEnd,
            json!({ "toolCalls": 1, "isError": result.is_error }),
            "session ended",
            Value::Null,
        )?;
        let summary = self.finish_session(chain).await?;

        let response = self
            .signed_response(OutboundEnvelope {
                kind: ResponseKind::ToolResponse,
                id: Uuid::new_v4().to_string(),
                request_id: request_id.to_string(),
                content: None,
                result: Some(serde_json::to_value(&result)?),
                encrypted: None,
                conversation_id: Some(conversation_id.clone()),
                session_id: Some(summary.session_id.clone()),
                agent: self.identity().public_key.clone(),
                signature: None,
                signer_public_key: self.identity().public_key.clone(),
                signed: false,
                timestamp: Utc::now().to_rfc3339(),
            })
            .await;

        self.record_audit(AuditRecord {
            action: ACTION_TOOL_REQUEST.to_string(),
            user_public_key: sender.to_string(),
            input: Some(format!("{tool_name} {}", summarize_input(&parameters))),
            output: Some(result.content.clone()),
            metadata: json!({
                "requestId": request_id,
                "conversationId": conversation_id,
                "sessionId": summary.session_id,
                "isError": result.is_error,
                "receiptId": summary.receipt_id,
                "signed": response.signed,
            }),
        })
        .await;
        Ok(response)
    }

    /// Compare the workspace with the last commitment. A mismatch is
    /// anchored and returned as a warning line for the model.
    fn check_workspace(&self, chain: &mut AnchorChain) -> AgidResult<Option<String>> {
        let Some(monitor) = &self.workspace else {
            return Ok(None);
        };
        let check = match monitor.check(self.store.as_ref()) {
            Ok(check) => check,
            Err(e) => {
                warn!(error = %e, "workspace check failed");
                return Ok(None);
            }
        };
        let Some(warning) = check.warning() else {
            return Ok(None);
        };
        chain.add_anchor(
            AnchorType::IntegrityWarning,
            json!({
                "previousHash": check.previous_hash,
                "currentHash": check.current_hash,
            }),
            "workspace changed outside a committed session",
            Value::Null,
        )?;
        Ok(Some(warning))
    }

    /// Verify, seal, persist and commit a finished chain. Commit failures
    /// are logged; the chain stays persisted either way.
    async fn finish_session(&self, mut chain: AnchorChain) -> AgidResult<SessionSummary> {
        let verification = chain.verify();
        if !verification.valid {
            error!(
                session_id = %chain.session_id(),
                first_divergent_index = ?verification.first_divergent_index,
                "anchor chain failed verification before commit"
            );
        }
        let merkle_root = chain.seal()?;
        self.store.save_chain(&chain.to_record())?;

        let workspace_hash = match &self.workspace {
            Some(monitor) => match hash_workspace(monitor.root()) {
                Ok(hash) => Some(hash),
                Err(e) => {
                    warn!(error = %e, "could not hash workspace for commitment");
                    None
                }
            },
            None => None,
        };

        let record = chain.commitment_record(workspace_hash.clone())?;
        let receipt_id = match self.signer.commit(&record).await {
            Ok(receipt_id) => {
                self.store.save_receipt(&CommitmentReceipt {
                    receipt_id: receipt_id.clone(),
                    record,
                    committed_at: Utc::now(),
                })?;
                if let Some(hash) = &workspace_hash {
                    self.store.set_workspace_hash(hash)?;
                }
                info!(
                    session_id = %chain.session_id(),
                    receipt_id = %receipt_id,
                    anchors = chain.len(),
                    "anchor chain committed"
                );
                Some(receipt_id)
            }
            Err(e) => {
                warn!(
                    session_id = %chain.session_id(),
                    error = %e,
                    "anchor chain commitment failed"
                );
                None
            }
        };

        Ok(SessionSummary {
            session_id: chain.session_id().to_string(),
            anchor_count: chain.len(),
            merkle_root: Some(merkle_root),
            receipt_id,
        })
    }

    /// Sign the response; on signer failure send it unsigned.
    async fn signed_response(&self, mut response: OutboundEnvelope) -> OutboundEnvelope {
        let signed = match response.signed_bytes() {
            Ok(bytes) => self.signer.sign(&bytes, &response_key(&response.request_id)).await,
            Err(e) => Err(e),
        };
        match signed {
            Ok(signature) => {
                response.signature = Some(hex::encode(signature));
                response.signed = true;
            }
            Err(e) => {
                warn!(
                    request_id = %response.request_id,
                    error = %e,
                    "response signing failed, sending unsigned"
                );
            }
        }
        response
    }

    fn unsigned_response(
        &self,
        kind: ResponseKind,
        request_id: &str,
        content: &str,
    ) -> OutboundEnvelope {
        let (content, result) = match kind {
            ResponseKind::ChatResponse => (Some(content.to_string()), None),
            ResponseKind::ToolResponse => (
                None,
                Some(json!({ "content": content, "isError": true })),
            ),
        };
        OutboundEnvelope {
            kind,
            id: Uuid::new_v4().to_string(),
            request_id: request_id.to_string(),
            content,
            result,
            encrypted: None,
            conversation_id: None,
            session_id: None,
            agent: self.identity().public_key.clone(),
            signature: None,
            signer_public_key: self.identity().public_key.clone(),
            signed: false,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    async fn record_audit(&self, record: AuditRecord) {
        if let Err(e) = self.audit.create_entry(record).await {
            warn!(error = %e, "failed to write audit entry");
        }
    }
}

struct ChatBody {
    content: Option<String>,
    encrypted: Option<EncryptedMessage>,
    signed_envelope: Option<SignedEnvelope>,
}

impl ChatBody {
    fn is_encrypted(&self) -> bool {
        self.encrypted.is_some() || self.signed_envelope.is_some()
    }
}

async fn decrypt_body(handle: &ConversationHandle, body: ChatBody) -> AgidResult<String> {
    let mut conversation = handle.lock().await;
    let plaintext = match (body.signed_envelope, body.encrypted) {
        (Some(envelope), _) => conversation.encryption.decrypt_signed_inbound(&envelope).await?,
        (None, Some(message)) => conversation.encryption.decrypt_inbound(&message).await?,
        (None, None) => return Err(AgidError::validation("content", "chat request has no content")),
    };
    String::from_utf8(plaintext).map_err(|e| AgidError::validation("content", e.to_string()))
}

fn response_kind(envelope: &InboundEnvelope) -> ResponseKind {
    match envelope {
        InboundEnvelope::ChatRequest { .. } => ResponseKind::ChatResponse,
        InboundEnvelope::ToolRequest { .. } => ResponseKind::ToolResponse,
    }
}

fn session_start_data(
    sender: &str,
    conversation_id: &str,
    request_id: &str,
    verification: &IdentityVerificationResult,
) -> Value {
    let mut data = json!({
        "sender": sender,
        "conversationId": conversation_id,
        "requestId": request_id,
    });
    if let Some(cert) = &verification.certificate {
        data["certificateType"] = json!(cert.cert_type);
        data["certificateSerial"] = json!(cert.serial_number);
        data["certifier"] = json!(cert.certifier);
    }
    data
}
