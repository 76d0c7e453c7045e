//! Wire envelopes exchanged with peers.

use crate::canonicalize::canonical_bytes;
use crate::certificate::Certificate;
use crate::errors::AgidResult;
use crate::session_encryption::{EncryptedMessage, SignedEnvelope};
use crate::signer::{verify_detached, Counterparty, KeyRef, Protocol, SecurityLevel, Signer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const RESPONSE_PROTOCOL: &str = "agidentity response";
const REQUEST_PROTOCOL: &str = "agidentity request";

/// Inbound request from a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum InboundEnvelope {
    ChatRequest {
        id: String,
        #[serde(default)]
        content: Option<String>,
        /// Content encrypted for the agent under the conversation's session keys.
        #[serde(default)]
        encrypted: Option<EncryptedMessage>,
        #[serde(default)]
        signed_envelope: Option<SignedEnvelope>,
        #[serde(default)]
        conversation_id: Option<String>,
        #[serde(default)]
        certificate: Option<Certificate>,
    },
    ToolRequest {
        id: String,
        tool_name: String,
        #[serde(default)]
        parameters: Value,
        #[serde(default)]
        conversation_id: Option<String>,
        #[serde(default)]
        certificate: Option<Certificate>,
    },
}

impl InboundEnvelope {
    pub fn id(&self) -> &str {
        match self {
            InboundEnvelope::ChatRequest { id, .. } | InboundEnvelope::ToolRequest { id, .. } => id,
        }
    }

    pub fn certificate(&self) -> Option<&Certificate> {
        match self {
            InboundEnvelope::ChatRequest { certificate, .. }
            | InboundEnvelope::ToolRequest { certificate, .. } => certificate.as_ref(),
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            InboundEnvelope::ChatRequest { conversation_id, .. }
            | InboundEnvelope::ToolRequest { conversation_id, .. } => conversation_id.as_deref(),
        }
    }

    /// Key under which a sender signs the request with this id.
    pub fn sender_key(request_id: &str) -> KeyRef {
        KeyRef::new(
            Protocol::new(SecurityLevel::App, REQUEST_PROTOCOL),
            request_id,
            Counterparty::Myself,
        )
    }

    /// Sender side: hex signature over the canonical envelope.
    pub async fn sign_as_sender(&self, sender: &dyn Signer) -> AgidResult<String> {
        let signature = sender
            .sign(&canonical_bytes(self)?, &Self::sender_key(self.id()))
            .await?;
        Ok(hex::encode(signature))
    }

    /// Proves the envelope was produced by the holder of `sender`.
    pub fn verify_sender(&self, sender: &str, signature_hex: &str) -> AgidResult<bool> {
        let Ok(signature) = hex::decode(signature_hex) else {
            return Ok(false);
        };
        verify_detached(
            sender,
            &Self::sender_key(self.id()),
            &canonical_bytes(self)?,
            &signature,
        )
    }

    /// Plain chat request, for tests and the HTTP surface.
    pub fn chat(id: impl Into<String>, content: impl Into<String>) -> Self {
        InboundEnvelope::ChatRequest {
            id: id.into(),
            content: Some(content.into()),
            encrypted: None,
            signed_envelope: None,
            conversation_id: None,
            certificate: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    ChatResponse,
    ToolResponse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEnvelope {
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    pub id: String,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<EncryptedMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub agent: String,
    pub signature: Option<String>,
    pub signer_public_key: String,
    pub signed: bool,
    pub timestamp: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignedResponse<'a> {
    #[serde(rename = "type")]
    kind: ResponseKind,
    id: &'a str,
    request_id: &'a str,
    content: &'a Option<String>,
    result: &'a Option<Value>,
    encrypted: &'a Option<EncryptedMessage>,
    conversation_id: &'a Option<String>,
    session_id: &'a Option<String>,
    agent: &'a str,
    timestamp: &'a str,
}

impl OutboundEnvelope {
    /// Canonical bytes covered by the response signature.
    pub fn signed_bytes(&self) -> AgidResult<Vec<u8>> {
        canonical_bytes(&SignedResponse {
            kind: self.kind,
            id: &self.id,
            request_id: &self.request_id,
            content: &self.content,
            result: &self.result,
            encrypted: &self.encrypted,
            conversation_id: &self.conversation_id,
            session_id: &self.session_id,
            agent: &self.agent,
            timestamp: &self.timestamp,
        })
    }

    pub fn signature_key(&self) -> KeyRef {
        response_key(&self.request_id)
    }

    /// Check the detached signature. Unsigned responses never verify.
    pub fn verify_signature(&self) -> AgidResult<bool> {
        let signature = match (&self.signature, self.signed) {
            (Some(sig), true) => match hex::decode(sig) {
                Ok(bytes) => bytes,
                Err(_) => return Ok(false),
            },
            _ => return Ok(false),
        };
        verify_detached(
            &self.signer_public_key,
            &self.signature_key(),
            &self.signed_bytes()?,
            &signature,
        )
    }
}

pub fn response_key(request_id: &str) -> KeyRef {
    KeyRef::new(
        Protocol::new(SecurityLevel::App, RESPONSE_PROTOCOL),
        request_id,
        Counterparty::Myself,
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    ToolStart,
    ToolResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Running,
    Success,
    Error,
}

/// Best-effort, out-of-band notification about tool execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: ProgressKind,
    pub request_id: String,
    pub tool_name: String,
    pub status: ProgressStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inbound_wire_shape() {
        let chat: InboundEnvelope = serde_json::from_value(json!({
            "type": "chat_request",
            "id": "m1",
            "content": "ping",
            "conversationId": "c1"
        }))
        .unwrap();
        assert_eq!(chat.id(), "m1");
        assert_eq!(chat.conversation_id(), Some("c1"));

        let tool: InboundEnvelope = serde_json::from_value(json!({
            "type": "tool_request",
            "id": "m2",
            "toolName": "current_time",
            "parameters": {}
        }))
        .unwrap();
        assert!(matches!(
            tool,
            InboundEnvelope::ToolRequest { ref tool_name, .. } if tool_name == "current_time"
        ));
    }

    #[test]
    fn test_progress_event_shape() {
        let event = ProgressEvent {
            kind: ProgressKind::ToolResult,
            request_id: "m1".into(),
            tool_name: "sign_message".into(),
            status: ProgressStatus::Error,
            error_type: Some("signing".into()),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "tool_result");
        assert_eq!(value["errorType"], "signing");
    }

    #[tokio::test]
    async fn test_sender_signature_binds_envelope_and_key() {
        use crate::signer::{LocalSigner, Network};

        let alice = LocalSigner::generate(Network::Local);
        let mallory = LocalSigner::generate(Network::Local);
        let envelope = InboundEnvelope::chat("m1", "ping");
        let signature = envelope.sign_as_sender(&alice).await.unwrap();

        assert!(envelope.verify_sender(&alice.public_key_hex(), &signature).unwrap());
        assert!(!envelope.verify_sender(&mallory.public_key_hex(), &signature).unwrap());
        assert!(!InboundEnvelope::chat("m1", "pong")
            .verify_sender(&alice.public_key_hex(), &signature)
            .unwrap());
        assert!(!envelope.verify_sender(&alice.public_key_hex(), "zz").unwrap());

        // Survives the trip through JSON.
        let wire: InboundEnvelope =
            serde_json::from_str(&serde_json::to_string(&envelope).unwrap()).unwrap();
        assert!(wire.verify_sender(&alice.public_key_hex(), &signature).unwrap());
    }
}
