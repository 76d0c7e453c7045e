//! HTTP surface over the gateway and its signing capability.

use crate::anchor_chain::{verify_record, ChainRecord, ChainVerification};
use crate::anchor_store::CommitmentReceipt;
use crate::errors::{AgidError, AgidResult};
use crate::gateway::Gateway;
use crate::messages::{InboundEnvelope, OutboundEnvelope};
use crate::signer::{Counterparty, KeyRef, Protocol, SecurityLevel};
use axum::{
    extract::{Extension, Path},
    response::Json,
    routing::{get, post},
    Router,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::warn;

const API_PROTOCOL: &str = "agidentity api";
const DEFAULT_KEY_ID: &str = "1";

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }
}

/// A full protocol, or just its name with the security level implied by
/// the counterparty.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ProtocolSpec {
    Full(Protocol),
    Named(String),
}

/// Key selection shared by the sign/encrypt/decrypt routes.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySelector {
    #[serde(default)]
    pub protocol: Option<ProtocolSpec>,
    #[serde(default)]
    pub key_id: Option<String>,
    /// `"self"` or a hex public key.
    #[serde(default)]
    pub counterparty: Option<String>,
}

impl KeySelector {
    fn key_ref(&self) -> AgidResult<KeyRef> {
        let counterparty = Counterparty::parse(self.counterparty.as_deref().unwrap_or("self"))?;
        let level = match counterparty {
            Counterparty::Myself => SecurityLevel::App,
            Counterparty::Key(_) => SecurityLevel::Counterparty,
        };
        let protocol = match &self.protocol {
            Some(ProtocolSpec::Full(protocol)) => protocol.clone(),
            Some(ProtocolSpec::Named(name)) => Protocol::new(level, name.as_str()),
            None => Protocol::new(level, API_PROTOCOL),
        };
        Ok(KeyRef::new(
            protocol,
            self.key_id.clone().unwrap_or_else(|| DEFAULT_KEY_ID.to_string()),
            counterparty,
        ))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignRequest {
    #[serde(alias = "message")]
    pub data: String,
    #[serde(flatten)]
    pub key: KeySelector,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignResponse {
    pub signature: String,
    pub public_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptRequest {
    #[serde(alias = "data")]
    pub plaintext: String,
    #[serde(flatten)]
    pub key: KeySelector,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptRequest {
    /// Base64 ciphertext.
    pub ciphertext: String,
    #[serde(flatten)]
    pub key: KeySelector,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRequest {
    pub sender: String,
    pub envelope: InboundEnvelope,
    /// Hex signature by `sender` over the canonical envelope.
    pub signature: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainResponse {
    pub chain: ChainRecord,
    pub verification: ChainVerification,
    pub receipt: Option<CommitmentReceipt>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/identity", get(identity))
        .route("/api/sign", post(sign))
        .route("/api/encrypt", post(encrypt))
        .route("/api/decrypt", post(decrypt))
        .route("/api/message", post(message))
        .route("/api/chains/{session_id}", get(chain))
        .route("/healthz", get(healthz))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
}

async fn identity(Extension(state): Extension<AppState>) -> AgidResult<Json<Value>> {
    let identity = state.gateway.identity();
    Ok(Json(json!({
        "publicKey": identity.public_key,
        "network": identity.network,
        "activeConversations": state.gateway.conversations().active_count()?,
    })))
}

async fn sign(
    Extension(state): Extension<AppState>,
    Json(req): Json<SignRequest>,
) -> AgidResult<Json<SignResponse>> {
    let signature = state
        .gateway
        .signer()
        .sign(req.data.as_bytes(), &req.key.key_ref()?)
        .await?;
    Ok(Json(SignResponse {
        signature: hex::encode(signature),
        public_key: state.gateway.identity().public_key.clone(),
    }))
}

async fn encrypt(
    Extension(state): Extension<AppState>,
    Json(req): Json<EncryptRequest>,
) -> AgidResult<Json<Value>> {
    let ciphertext = state
        .gateway
        .signer()
        .encrypt(req.plaintext.as_bytes(), &req.key.key_ref()?)
        .await?;
    Ok(Json(json!({ "ciphertext": B64.encode(ciphertext) })))
}

async fn decrypt(
    Extension(state): Extension<AppState>,
    Json(req): Json<DecryptRequest>,
) -> AgidResult<Json<Value>> {
    let ciphertext = B64
        .decode(&req.ciphertext)
        .map_err(|e| AgidError::validation("ciphertext", e.to_string()))?;
    let plaintext = state
        .gateway
        .signer()
        .decrypt(&ciphertext, &req.key.key_ref()?)
        .await?;
    let plaintext =
        String::from_utf8(plaintext)
            .map_err(|e| AgidError::validation("plaintext", e.to_string()))?;
    Ok(Json(json!({ "plaintext": plaintext })))
}

async fn message(
    Extension(state): Extension<AppState>,
    Json(req): Json<MessageRequest>,
) -> AgidResult<Json<OutboundEnvelope>> {
    if !req.envelope.verify_sender(&req.sender, &req.signature)? {
        warn!(
            sender = %req.sender,
            request_id = %req.envelope.id(),
            "message signature does not match sender"
        );
        return Err(AgidError::auth("message is not signed by the claimed sender"));
    }
    let response = state
        .gateway
        .handle_message(&req.sender, req.envelope, None)
        .await?;
    Ok(Json(response))
}

async fn chain(
    Extension(state): Extension<AppState>,
    Path(session_id): Path<String>,
) -> AgidResult<Json<ChainResponse>> {
    let store = state.gateway.store();
    let chain = store
        .load_chain(&session_id)?
        .ok_or_else(|| AgidError::not_found("anchor chain", &session_id))?;
    let verification = verify_record(&chain)?;
    let receipt = store.load_receipt(&session_id)?;
    Ok(Json(ChainResponse {
        chain,
        verification,
        receipt,
    }))
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
