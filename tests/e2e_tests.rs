//! End-to-end tests over the HTTP surface
//!
//! A gateway is wired from configuration exactly as the binary does it,
//! with every file under a temporary directory, and driven through the
//! axum router.

use agidentity::agent_loop::DEGRADED_RESPONSE;
use agidentity::bootstrap::{build_runtime, build_runtime_with_signer, open_signer, Runtime};
use agidentity::certificate::{reveal_for_verifier, Certificate, CertificateIssuer};
use agidentity::config::GatewayConfig;
use agidentity::gateway::ACCESS_DENIED_RESPONSE;
use agidentity::messages::{InboundEnvelope, OutboundEnvelope};
use agidentity::remote_signer::serve_signer_tcp;
use agidentity::signer::{
    verify_detached, Counterparty, KeyRef, LocalSigner, Network, Protocol, SecurityLevel, Signer,
};
use agidentity::web::{build_router, AppState, ChainResponse, SignResponse};
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

struct TestApp {
    app: Router,
    runtime: Runtime,
    certifier: Arc<LocalSigner>,
    _dir: TempDir,
}

fn test_config(dir: &TempDir, certifier: &LocalSigner) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.identity.key_path = dir.path().join("identity.json");
    config.storage.data_dir = dir.path().join("data");
    config.storage.audit_log_path = dir.path().join("audit.jsonl");
    config.gateway.trusted_certifiers = vec![certifier.public_key_hex()];
    config
}

fn test_app_with(configure: impl FnOnce(&mut GatewayConfig, &TempDir)) -> TestApp {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let certifier = Arc::new(LocalSigner::generate(Network::Local));

    let mut config = test_config(&dir, &certifier);
    configure(&mut config, &dir);
    config.validate().expect("config should validate");

    let runtime = build_runtime(&config).expect("Failed to build runtime");
    let app = build_router(AppState::new(runtime.gateway.clone()));
    TestApp {
        app,
        runtime,
        certifier,
        _dir: dir,
    }
}

fn test_app() -> TestApp {
    test_app_with(|_, _| {})
}

impl TestApp {
    fn agent_key(&self) -> String {
        self.runtime.gateway.identity().public_key.clone()
    }

    async fn credential(&self, subject: &LocalSigner) -> Certificate {
        let fields = BTreeMap::from([("name".to_string(), "Alice".to_string())]);
        let issued = CertificateIssuer::new(self.certifier.clone())
            .issue("agent-user", &subject.public_key_hex(), &fields, "e2e.0")
            .await
            .unwrap();
        reveal_for_verifier(subject, &issued, &self.agent_key(), &["name"])
            .await
            .unwrap()
    }

    async fn call(&self, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    async fn get(&self, uri: &str) -> (StatusCode, Vec<u8>) {
        self.call(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    /// Post `envelope` to /api/message as `sender`, signed by `signer`.
    async fn send_message(
        &self,
        sender: &str,
        signer: &LocalSigner,
        envelope: &InboundEnvelope,
    ) -> (StatusCode, Vec<u8>) {
        let signature = envelope.sign_as_sender(signer).await.unwrap();
        self.post(
            "/api/message",
            json!({ "sender": sender, "envelope": envelope, "signature": signature }),
        )
        .await
    }

    async fn post(&self, uri: &str, body: Value) -> (StatusCode, Vec<u8>) {
        self.call(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }
}

#[tokio::test]
async fn test_health_and_identity() {
    let t = test_app();

    let (status, body) = t.get("/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_slice::<Value>(&body).unwrap()["status"], "ok");

    let (status, body) = t.get("/api/identity").await;
    assert_eq!(status, StatusCode::OK);
    let identity: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(identity["publicKey"], t.agent_key().as_str());
    assert_eq!(identity["network"], "local");
    assert_eq!(identity["activeConversations"], 0);
}

#[tokio::test]
async fn test_sign_endpoint_produces_verifiable_signature() {
    let t = test_app();
    let (status, body) = t.post("/api/sign", json!({ "data": "hello agent" })).await;
    assert_eq!(status, StatusCode::OK);

    let signed: SignResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(signed.public_key, t.agent_key());
    let key = KeyRef::new(
        Protocol::new(SecurityLevel::App, "agidentity api"),
        "1",
        Counterparty::Myself,
    );
    let signature = hex::decode(&signed.signature).unwrap();
    assert!(verify_detached(&signed.public_key, &key, b"hello agent", &signature).unwrap());
}

#[tokio::test]
async fn test_python_client_request_shapes() {
    let t = test_app();

    let (status, body) = t
        .post(
            "/api/sign",
            json!({ "message": "I am a Python agent", "protocol": "agent message" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let signed: SignResponse = serde_json::from_slice(&body).unwrap();
    let key = KeyRef::new(
        Protocol::new(SecurityLevel::App, "agent message"),
        "1",
        Counterparty::Myself,
    );
    let signature = hex::decode(&signed.signature).unwrap();
    assert!(verify_detached(&signed.public_key, &key, b"I am a Python agent", &signature).unwrap());

    let selector =
        json!({ "protocol": "agent memory", "keyId": "default", "counterparty": "self" });
    let mut encrypt = selector.clone();
    encrypt["data"] = json!("My secret memory");
    let (status, body) = t.post("/api/encrypt", encrypt).await;
    assert_eq!(status, StatusCode::OK);
    let ciphertext = serde_json::from_slice::<Value>(&body).unwrap()["ciphertext"].clone();

    let mut decrypt = selector;
    decrypt["ciphertext"] = ciphertext;
    let (status, body) = t.post("/api/decrypt", decrypt).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_slice::<Value>(&body).unwrap()["plaintext"], "My secret memory");
}

#[tokio::test]
async fn test_encrypt_then_decrypt() {
    let t = test_app();
    let (status, body) = t
        .post("/api/encrypt", json!({ "plaintext": "remember this", "keyId": "notes" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    let ciphertext = serde_json::from_slice::<Value>(&body).unwrap()["ciphertext"]
        .as_str()
        .unwrap()
        .to_string();

    let (status, body) = t
        .post("/api/decrypt", json!({ "ciphertext": ciphertext, "keyId": "notes" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_slice::<Value>(&body).unwrap()["plaintext"], "remember this");

    // Another key id cannot open it.
    let (status, _) = t
        .post("/api/decrypt", json!({ "ciphertext": ciphertext, "keyId": "other" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = t.post("/api/decrypt", json!({ "ciphertext": "%%%" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_message_without_certificate_is_denied() {
    let t = test_app();
    let stranger = LocalSigner::generate(Network::Local);
    let (status, body) = t
        .send_message(
            &stranger.public_key_hex(),
            &stranger,
            &InboundEnvelope::chat("m1", "hi"),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let response: OutboundEnvelope = serde_json::from_slice(&body).unwrap();
    assert_eq!(response.content.as_deref(), Some(ACCESS_DENIED_RESPONSE));
    assert!(!response.signed);
}

#[tokio::test]
async fn test_replayed_certificate_with_forged_sender_rejected() {
    let t = test_app();
    let alice = LocalSigner::generate(Network::Local);
    let mallory = LocalSigner::generate(Network::Local);
    let envelope = InboundEnvelope::ChatRequest {
        id: "m1".to_string(),
        content: Some("transfer everything".to_string()),
        encrypted: None,
        signed_envelope: None,
        conversation_id: None,
        certificate: Some(t.credential(&alice).await),
    };

    // Alice's certificate is valid, but the request is signed by Mallory.
    let (status, _) = t
        .send_message(&alice.public_key_hex(), &mallory, &envelope)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = t
        .post(
            "/api/message",
            json!({ "sender": alice.public_key_hex(), "envelope": envelope, "signature": "00" }),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    assert!(t.runtime.gateway.audit().entries().unwrap().is_empty());
    assert_eq!(t.runtime.gateway.conversations().active_count().unwrap(), 0);
}

#[tokio::test]
async fn test_message_then_chain_lookup() {
    let t = test_app();
    let alice = LocalSigner::generate(Network::Local);
    let envelope = InboundEnvelope::ChatRequest {
        id: "m1".to_string(),
        content: Some("ping".to_string()),
        encrypted: None,
        signed_envelope: None,
        conversation_id: None,
        certificate: Some(t.credential(&alice).await),
    };

    let (status, body) = t
        .send_message(&alice.public_key_hex(), &alice, &envelope)
        .await;
    assert_eq!(status, StatusCode::OK);
    let response: OutboundEnvelope = serde_json::from_slice(&body).unwrap();

    // No model endpoint is configured, so the reply is the degraded one,
    // still signed and still anchored.
    assert_eq!(response.content.as_deref(), Some(DEGRADED_RESPONSE));
    assert!(response.verify_signature().unwrap());

    let session_id = response.session_id.unwrap();
    let (status, body) = t.get(&format!("/api/chains/{session_id}")).await;
    assert_eq!(status, StatusCode::OK);
    let chain: ChainResponse = serde_json::from_slice(&body).unwrap();
    assert!(chain.verification.valid);
    assert_eq!(chain.chain.anchors.len(), 2);
    let receipt = chain.receipt.expect("chain should be committed");
    assert_eq!(Some(receipt.record.merkle_root), chain.chain.merkle_root);

    let (status, _) = t.get("/api/chains/no-such-session").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_audit_log_written_and_signed() {
    let t = test_app();
    let alice = LocalSigner::generate(Network::Local);
    let envelope = InboundEnvelope::ChatRequest {
        id: "m1".to_string(),
        content: Some("ping".to_string()),
        encrypted: None,
        signed_envelope: None,
        conversation_id: None,
        certificate: Some(t.credential(&alice).await),
    };
    let (status, _) = t
        .send_message(&alice.public_key_hex(), &alice, &envelope)
        .await;
    assert_eq!(status, StatusCode::OK);

    let audit = t.runtime.gateway.audit();
    let entries = audit.entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert!(audit.invalid_entries().unwrap().is_empty());
}

#[tokio::test]
async fn test_configured_revocation_list_denies_sender() {
    let t = test_app_with(|config, dir| {
        let path = dir.path().join("revoked.txt");
        std::fs::write(&path, "# spent\ne2e.0\n").unwrap();
        config.verification.revoked_outpoints_file = Some(path);
    });
    let alice = LocalSigner::generate(Network::Local);
    let envelope = InboundEnvelope::ChatRequest {
        id: "m1".to_string(),
        content: Some("ping".to_string()),
        encrypted: None,
        signed_envelope: None,
        conversation_id: None,
        certificate: Some(t.credential(&alice).await),
    };

    let (status, body) = t
        .send_message(&alice.public_key_hex(), &alice, &envelope)
        .await;
    assert_eq!(status, StatusCode::OK);
    let response: OutboundEnvelope = serde_json::from_slice(&body).unwrap();
    assert_eq!(response.content.as_deref(), Some(ACCESS_DENIED_RESPONSE));
    assert!(t.runtime.revocations.lookups() >= 1);
}

#[tokio::test]
async fn test_gateway_signs_through_configured_endpoint() {
    let remote_key = Arc::new(LocalSigner::generate(Network::Local));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = tokio::spawn(serve_signer_tcp(remote_key.clone(), listener));

    let dir = TempDir::new().unwrap();
    let certifier = LocalSigner::generate(Network::Local);
    let mut config = test_config(&dir, &certifier);
    config.signer.endpoint = Some(addr);
    config.validate().unwrap();

    let signer = open_signer(&config).await.unwrap();
    assert_eq!(signer.identity(), remote_key.identity());
    // no key file is created for a remote identity
    assert!(!config.identity.key_path.exists());

    let runtime = build_runtime_with_signer(&config, signer).unwrap();
    let app = build_router(AppState::new(runtime.gateway.clone()));
    let request = Request::builder()
        .method("POST")
        .uri("/api/sign")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "data": "remote hello" }).to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let signed: SignResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(signed.public_key, remote_key.public_key_hex());

    let key = KeyRef::new(
        Protocol::new(SecurityLevel::App, "agidentity api"),
        "1",
        Counterparty::Myself,
    );
    let signature = hex::decode(&signed.signature).unwrap();
    assert!(verify_detached(&signed.public_key, &key, b"remote hello", &signature).unwrap());
    server.abort();
}
