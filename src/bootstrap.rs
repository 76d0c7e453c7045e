//! Wiring of a gateway from configuration.

use crate::agent_loop::AgentLoop;
use crate::anchor_store::SledAnchorStore;
use crate::audit_trail::{JsonlAuditSink, SignedAuditTrail};
use crate::certificate::LocalCertificateVerifier;
use crate::config::GatewayConfig;
use crate::conversation::ConversationManager;
use crate::errors::{AgidError, AgidResult};
use crate::gateway::Gateway;
use crate::history::SessionHistory;
use crate::identity_gate::{IdentityGate, TrustedCertifiers};
use crate::keys::{encryption_key_from_env, AgentKey};
use crate::model::{HttpModelClient, ModelClient, UnconfiguredModelClient};
use crate::rate_limiter::RateLimiter;
use crate::remote_signer::{dial_tcp, RemoteSigner};
use crate::revocation::{MemoryRevocationRegistry, RevocationPolicy};
use crate::signer::{LocalSigner, Signer, SigningCapability};
use crate::tools::ToolRegistry;
use crate::workspace::WorkspaceMonitor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// The identity key as a local signer.
pub fn load_signer(config: &GatewayConfig) -> AgidResult<LocalSigner> {
    let encryption_key = encryption_key_from_env()?;
    let key = AgentKey::load_or_create(&config.identity.key_path, encryption_key.as_ref())?;
    let mut signer = LocalSigner::new(key.into_signing_key(), config.identity.network);
    if let Some(journal) = &config.signer.journal_path {
        signer = signer.with_journal(journal);
    }
    Ok(signer)
}

/// The signer the gateway runs on: the remote endpoint when one is
/// configured, otherwise the local key file.
pub async fn open_signer(config: &GatewayConfig) -> AgidResult<Arc<dyn Signer>> {
    match &config.signer.endpoint {
        Some(endpoint) => {
            info!(endpoint = %endpoint, "connecting to remote signer");
            let remote = RemoteSigner::connect_with_retry(
                &config.retry_policy(),
                config.signer_timeout(),
                || dial_tcp(endpoint),
            )
            .await?;
            Ok(Arc::new(remote))
        }
        None => Ok(Arc::new(load_signer(config)?)),
    }
}

fn open_revocations(config: &GatewayConfig) -> AgidResult<MemoryRevocationRegistry> {
    match &config.verification.revoked_outpoints_file {
        Some(path) => MemoryRevocationRegistry::from_file(path),
        None => Ok(MemoryRevocationRegistry::new()),
    }
}

pub struct Runtime {
    pub gateway: Arc<Gateway>,
    pub conversations: Arc<ConversationManager>,
    pub revocations: Arc<MemoryRevocationRegistry>,
}

/// Runtime over the local key file.
pub fn build_runtime(config: &GatewayConfig) -> AgidResult<Runtime> {
    build_runtime_with_signer(config, Arc::new(load_signer(config)?))
}

pub fn build_runtime_with_signer(
    config: &GatewayConfig,
    signer: Arc<dyn Signer>,
) -> AgidResult<Runtime> {
    std::fs::create_dir_all(&config.storage.data_dir)
        .map_err(|e| AgidError::io("create data dir", e))?;

    let signer = SigningCapability::new(signer, config.signer_timeout());
    info!(
        public_key = %signer.identity().public_key,
        network = %signer.identity().network,
        "agent identity loaded"
    );

    let certifiers = Arc::new(TrustedCertifiers::from_keys(&config.gateway.trusted_certifiers)?);
    if config.gateway.require_certificate && config.gateway.trusted_certifiers.is_empty() {
        warn!(
            "certificates are required but no trusted certifiers are configured; \
             every sender will be denied"
        );
    }
    if config.verification.revocation_failure_policy == RevocationPolicy::FailOpen {
        warn!(
            "revocation policy is fail-open: senders are admitted when revocation status is unknown"
        );
    }

    let revocations = Arc::new(open_revocations(config)?);
    let verifier = Arc::new(LocalCertificateVerifier::new(signer.clone()));
    let gate = Arc::new(IdentityGate::new(
        certifiers,
        verifier,
        revocations.clone(),
        config.gate_settings(),
    ));

    let history = Arc::new(SessionHistory::new(config.gateway.history_messages));
    let conversations = Arc::new(ConversationManager::new(
        signer.clone(),
        history.clone(),
        config.conversation_settings(),
    ));

    let model: Arc<dyn ModelClient> = match &config.model.endpoint {
        Some(endpoint) => Arc::new(HttpModelClient::new(
            endpoint.clone(),
            config.model.model.clone(),
            config.model.api_key.clone(),
            Duration::from_secs(config.model.timeout_secs),
        )?),
        None => {
            warn!("no model endpoint configured; chat requests will receive the degraded response");
            Arc::new(UnconfiguredModelClient)
        }
    };

    let agent = AgentLoop::new(
        model,
        Arc::new(ToolRegistry::with_builtin_tools()),
        signer.clone(),
        history,
        config.gateway.system_prompt.clone(),
        config.gateway.max_iterations,
    );

    let audit = Arc::new(SignedAuditTrail::new(
        signer.clone(),
        Arc::new(JsonlAuditSink::new(&config.storage.audit_log_path)?),
    ));
    let store = Arc::new(SledAnchorStore::open(config.anchor_db_path())?);

    let mut gateway = Gateway::new(signer, gate, conversations.clone(), agent, audit, store)
        .with_rate_limiter(RateLimiter::new(
            config.gateway.rate_limit_requests,
            Duration::from_secs(config.gateway.rate_limit_window_secs),
        ));
    if let Some(dir) = &config.workspace_dir {
        gateway = gateway.with_workspace(WorkspaceMonitor::new(dir));
    }

    Ok(Runtime {
        gateway: Arc::new(gateway),
        conversations,
        revocations,
    })
}
