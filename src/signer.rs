//! Signing capability
//!
//! The signer is an external collaborator: it owns the identity key and
//! produces signatures, ciphertext and external-ledger commitments. The
//! gateway only talks to it through [`SigningCapability`], which wraps the
//! signer in a single asynchronous mutex so that at most one signing
//! operation is ever in flight for the identity, no matter how many inbound
//! messages are being handled concurrently.
//!
//! [`LocalSigner`] is the single-key reference implementation used by the
//! binary and the tests. Multi-party signers plug in behind the same trait.

use crate::anchor_chain::CommitmentRecord;
use crate::canonicalize::{canonical_bytes, sha256_hex};
use crate::errors::{AgidError, AgidResult, SafeLock};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

const NONCE_LEN: usize = 12;
const SIGNATURE_DOMAIN: &[u8] = b"agidentity-signature-v1";
const KDF_SALT: &[u8] = b"agidentity-kdf-v1";

/// Network tag carried alongside the identity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    #[default]
    Local,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Testnet => write!(f, "testnet"),
            Network::Local => write!(f, "local"),
        }
    }
}

/// A public identity: hex-encoded Ed25519 key plus network tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub public_key: String,
    pub network: Network,
}

/// How widely a derived key may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    /// Same key for every counterparty and application.
    Silent,
    /// Scoped to one application protocol.
    App,
    /// Scoped to one protocol and one counterparty.
    Counterparty,
}

impl SecurityLevel {
    fn tag(self) -> u8 {
        match self {
            SecurityLevel::Silent => 0,
            SecurityLevel::App => 1,
            SecurityLevel::Counterparty => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Protocol {
    pub security_level: SecurityLevel,
    pub name: String,
}

impl Protocol {
    pub fn new(security_level: SecurityLevel, name: impl Into<String>) -> Self {
        Self {
            security_level,
            name: name.into(),
        }
    }
}

/// The other party a key is derived for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "publicKey")]
pub enum Counterparty {
    #[serde(rename = "self")]
    Myself,
    Key(String),
}

impl Counterparty {
    /// Parse the wire form: `"self"` or a hex public key.
    pub fn parse(raw: &str) -> AgidResult<Self> {
        if raw.is_empty() || raw == "self" {
            return Ok(Counterparty::Myself);
        }
        parse_public_key(raw)?;
        Ok(Counterparty::Key(raw.to_string()))
    }
}

/// Everything needed to select one derived key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRef {
    pub protocol: Protocol,
    pub key_id: String,
    pub counterparty: Counterparty,
}

impl KeyRef {
    pub fn new(protocol: Protocol, key_id: impl Into<String>, counterparty: Counterparty) -> Self {
        Self {
            protocol,
            key_id: key_id.into(),
            counterparty,
        }
    }
}

/// Contract of the external signing/encryption capability.
#[async_trait]
pub trait Signer: Send + Sync {
    fn identity(&self) -> Identity;

    async fn sign(&self, data: &[u8], key: &KeyRef) -> AgidResult<Vec<u8>>;

    /// Verify a signature produced by the key's counterparty (or by this
    /// identity when the counterparty is `self`).
    async fn verify(&self, data: &[u8], signature: &[u8], key: &KeyRef) -> AgidResult<bool>;

    async fn encrypt(&self, plaintext: &[u8], key: &KeyRef) -> AgidResult<Vec<u8>>;

    async fn decrypt(&self, ciphertext: &[u8], key: &KeyRef) -> AgidResult<Vec<u8>>;

    /// Embed a record in the external ledger and return its receipt id.
    async fn commit(&self, record: &CommitmentRecord) -> AgidResult<String>;
}

pub fn parse_public_key(hex_key: &str) -> AgidResult<VerifyingKey> {
    let bytes = hex::decode(hex_key)
        .map_err(|e| AgidError::validation("public_key", format!("invalid hex: {e}")))?;
    let array: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| {
            AgidError::validation("public_key", format!("expected 32 bytes, got {}", bytes.len()))
        })?;
    VerifyingKey::from_bytes(&array)
        .map_err(|e| AgidError::validation("public_key", format!("not a curve point: {e}")))
}

/// Bytes actually covered by a signature: domain tag, protocol, key id, data.
pub fn signing_preimage(key: &KeyRef, data: &[u8]) -> Vec<u8> {
    let capacity =
        SIGNATURE_DOMAIN.len() + key.protocol.name.len() + key.key_id.len() + data.len() + 10;
    let mut out = Vec::with_capacity(capacity);
    out.extend_from_slice(SIGNATURE_DOMAIN);
    out.push(key.protocol.security_level.tag());
    out.extend_from_slice(&(key.protocol.name.len() as u32).to_be_bytes());
    out.extend_from_slice(key.protocol.name.as_bytes());
    out.extend_from_slice(&(key.key_id.len() as u32).to_be_bytes());
    out.extend_from_slice(key.key_id.as_bytes());
    out.extend_from_slice(data);
    out
}

/// Check a signature produced by [`LocalSigner`] without holding a signer.
pub fn verify_detached(
    public_key_hex: &str,
    key: &KeyRef,
    data: &[u8],
    signature: &[u8],
) -> AgidResult<bool> {
    let verifying_key = parse_public_key(public_key_hex)?;
    let signature = match Signature::from_slice(signature) {
        Ok(sig) => sig,
        Err(_) => return Ok(false),
    };
    Ok(verifying_key
        .verify(&signing_preimage(key, data), &signature)
        .is_ok())
}

/// One record accepted by the local ledger journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub receipt_id: String,
    pub record: CommitmentRecord,
    pub signature: String,
    pub committed_at: DateTime<Utc>,
}

/// Single-key signer backed by an in-process Ed25519 key.
pub struct LocalSigner {
    signing_key: SigningKey,
    network: Network,
    journal: Mutex<Vec<JournalEntry>>,
    journal_path: Option<PathBuf>,
}

impl LocalSigner {
    pub fn new(signing_key: SigningKey, network: Network) -> Self {
        Self {
            signing_key,
            network,
            journal: Mutex::new(Vec::new()),
            journal_path: None,
        }
    }

    /// Fresh random identity, mostly for tests and ephemeral agents.
    pub fn generate(network: Network) -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        Self::new(SigningKey::from_bytes(&seed), network)
    }

    /// Also append committed records to a JSONL journal on disk.
    pub fn with_journal(mut self, path: impl Into<PathBuf>) -> Self {
        self.journal_path = Some(path.into());
        self
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    pub fn journal(&self) -> AgidResult<Vec<JournalEntry>> {
        Ok(self.journal.safe_lock()?.clone())
    }

    fn counterparty_key(&self, counterparty: &Counterparty) -> AgidResult<VerifyingKey> {
        match counterparty {
            Counterparty::Myself => Ok(self.signing_key.verifying_key()),
            Counterparty::Key(hex_key) => parse_public_key(hex_key),
        }
    }

    fn symmetric_key(&self, key: &KeyRef) -> AgidResult<[u8; 32]> {
        let counterparty = self.counterparty_key(&key.counterparty)?;
        let secret = x25519_dalek::StaticSecret::from(self.signing_key.to_scalar_bytes());
        let public = x25519_dalek::PublicKey::from(counterparty.to_montgomery().to_bytes());
        let shared = secret.diffie_hellman(&public);

        let mut info = Vec::with_capacity(key.protocol.name.len() + key.key_id.len() + 2);
        info.push(key.protocol.security_level.tag());
        info.extend_from_slice(key.protocol.name.as_bytes());
        info.push(0);
        info.extend_from_slice(key.key_id.as_bytes());

        let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), shared.as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(&info, &mut okm)
            .map_err(|e| AgidError::crypto(format!("hkdf expand failed: {e:?}")))?;
        Ok(okm)
    }

    fn append_journal(&self, entry: &JournalEntry) -> AgidResult<()> {
        if let Some(path) = &self.journal_path {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| AgidError::io("open ledger journal", e))?;
            let line = serde_json::to_string(entry)?;
            writeln!(file, "{line}").map_err(|e| AgidError::io("append ledger journal", e))?;
        }
        self.journal.safe_lock()?.push(entry.clone());
        Ok(())
    }
}

#[async_trait]
impl Signer for LocalSigner {
    fn identity(&self) -> Identity {
        Identity {
            public_key: self.public_key_hex(),
            network: self.network,
        }
    }

    async fn sign(&self, data: &[u8], key: &KeyRef) -> AgidResult<Vec<u8>> {
        let signature = self.signing_key.sign(&signing_preimage(key, data));
        Ok(signature.to_bytes().to_vec())
    }

    async fn verify(&self, data: &[u8], signature: &[u8], key: &KeyRef) -> AgidResult<bool> {
        let signer_key = match &key.counterparty {
            Counterparty::Myself => self.public_key_hex(),
            Counterparty::Key(hex_key) => hex_key.clone(),
        };
        verify_detached(&signer_key, key, data, signature)
    }

    async fn encrypt(&self, plaintext: &[u8], key: &KeyRef) -> AgidResult<Vec<u8>> {
        let sym = self.symmetric_key(key)?;
        let cipher = Aes256Gcm::new_from_slice(&sym)
            .map_err(|e| AgidError::crypto(format!("cipher init: {e}")))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| AgidError::crypto("encryption failed"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    async fn decrypt(&self, ciphertext: &[u8], key: &KeyRef) -> AgidResult<Vec<u8>> {
        if ciphertext.len() <= NONCE_LEN {
            return Err(AgidError::crypto("ciphertext too short"));
        }
        let sym = self.symmetric_key(key)?;
        let cipher = Aes256Gcm::new_from_slice(&sym)
            .map_err(|e| AgidError::crypto(format!("cipher init: {e}")))?;
        let (nonce, body) = ciphertext.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| AgidError::crypto("decryption failed: wrong key or tampered ciphertext"))
    }

    async fn commit(&self, record: &CommitmentRecord) -> AgidResult<String> {
        let canonical = canonical_bytes(record)?;
        let key = KeyRef::new(
            Protocol::new(SecurityLevel::App, "anchor commitment"),
            record.session_id.clone(),
            Counterparty::Myself,
        );
        let signature = self.signing_key.sign(&signing_preimage(&key, &canonical));

        let mut receipt_input = canonical;
        receipt_input.extend_from_slice(&signature.to_bytes());
        let receipt_id = sha256_hex(&receipt_input);

        self.append_journal(&JournalEntry {
            receipt_id: receipt_id.clone(),
            record: record.clone(),
            signature: hex::encode(signature.to_bytes()),
            committed_at: Utc::now(),
        })?;
        Ok(receipt_id)
    }
}

async fn bounded<T>(
    operation: &'static str,
    timeout: Duration,
    fut: impl std::future::Future<Output = AgidResult<T>>,
) -> AgidResult<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(AgidError::timeout(format!("signer.{operation}"), timeout.as_secs())),
    }
}

/// Exclusive access to the signer for the lifetime of the guard.
///
/// Wallet-touching tools receive one of these for their whole execution, so
/// multi-step signer interactions cannot interleave with any other caller.
pub struct SignerGuard {
    guard: OwnedMutexGuard<Arc<dyn Signer>>,
    timeout: Duration,
}

impl SignerGuard {
    pub fn identity(&self) -> Identity {
        self.guard.identity()
    }

    pub async fn sign(&self, data: &[u8], key: &KeyRef) -> AgidResult<Vec<u8>> {
        bounded("sign", self.timeout, self.guard.sign(data, key)).await
    }

    pub async fn verify(&self, data: &[u8], signature: &[u8], key: &KeyRef) -> AgidResult<bool> {
        bounded("verify", self.timeout, self.guard.verify(data, signature, key)).await
    }

    pub async fn encrypt(&self, plaintext: &[u8], key: &KeyRef) -> AgidResult<Vec<u8>> {
        bounded("encrypt", self.timeout, self.guard.encrypt(plaintext, key)).await
    }

    pub async fn decrypt(&self, ciphertext: &[u8], key: &KeyRef) -> AgidResult<Vec<u8>> {
        bounded("decrypt", self.timeout, self.guard.decrypt(ciphertext, key)).await
    }

    pub async fn commit(&self, record: &CommitmentRecord) -> AgidResult<String> {
        bounded("commit", self.timeout, self.guard.commit(record)).await
    }
}

/// The process-wide, serialized handle on the signer.
#[derive(Clone)]
pub struct SigningCapability {
    signer: Arc<tokio::sync::Mutex<Arc<dyn Signer>>>,
    identity: Identity,
    timeout: Duration,
}

impl SigningCapability {
    pub fn new(signer: Arc<dyn Signer>, timeout: Duration) -> Self {
        let identity = signer.identity();
        Self {
            signer: Arc::new(tokio::sync::Mutex::new(signer)),
            identity,
            timeout,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Wait for exclusive access. Waiters are served in FIFO order.
    pub async fn acquire(&self) -> SignerGuard {
        SignerGuard {
            guard: self.signer.clone().lock_owned().await,
            timeout: self.timeout,
        }
    }

    /// Like [`acquire`](Self::acquire), but give up after the call timeout.
    pub async fn acquire_bounded(&self) -> AgidResult<SignerGuard> {
        match tokio::time::timeout(self.timeout, self.acquire()).await {
            Ok(guard) => Ok(guard),
            Err(_) => Err(AgidError::timeout("signer.acquire", self.timeout.as_secs())),
        }
    }

    pub async fn sign(&self, data: &[u8], key: &KeyRef) -> AgidResult<Vec<u8>> {
        self.acquire().await.sign(data, key).await
    }

    pub async fn verify(&self, data: &[u8], signature: &[u8], key: &KeyRef) -> AgidResult<bool> {
        self.acquire().await.verify(data, signature, key).await
    }

    pub async fn encrypt(&self, plaintext: &[u8], key: &KeyRef) -> AgidResult<Vec<u8>> {
        self.acquire().await.encrypt(plaintext, key).await
    }

    pub async fn decrypt(&self, ciphertext: &[u8], key: &KeyRef) -> AgidResult<Vec<u8>> {
        self.acquire().await.decrypt(ciphertext, key).await
    }

    pub async fn commit(&self, record: &CommitmentRecord) -> AgidResult<String> {
        self.acquire().await.commit(record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_key(key_id: &str, counterparty: Counterparty) -> KeyRef {
        KeyRef::new(
            Protocol::new(SecurityLevel::Counterparty, "agent memory"),
            key_id,
            counterparty,
        )
    }

    #[tokio::test]
    async fn test_sign_and_verify_roundtrip() {
        let signer = LocalSigner::generate(Network::Local);
        let key = memory_key("default", Counterparty::Myself);
        let sig = signer.sign(b"I am an agent", &key).await.unwrap();

        assert!(signer.verify(b"I am an agent", &sig, &key).await.unwrap());
        assert!(!signer.verify(b"I am someone else", &sig, &key).await.unwrap());
        assert!(verify_detached(&signer.public_key_hex(), &key, b"I am an agent", &sig).unwrap());
    }

    #[tokio::test]
    async fn test_counterparty_keys_are_symmetric() {
        let alice = LocalSigner::generate(Network::Local);
        let bob = LocalSigner::generate(Network::Local);

        let to_bob = memory_key("msg-1", Counterparty::Key(bob.public_key_hex()));
        let from_alice = memory_key("msg-1", Counterparty::Key(alice.public_key_hex()));

        let ciphertext = alice.encrypt(b"secret", &to_bob).await.unwrap();
        let plaintext = bob.decrypt(&ciphertext, &from_alice).await.unwrap();
        assert_eq!(plaintext, b"secret");
    }

    #[tokio::test]
    async fn test_wrong_key_id_fails_to_decrypt() {
        let signer = LocalSigner::generate(Network::Local);
        let ciphertext = signer
            .encrypt(b"data", &memory_key("a", Counterparty::Myself))
            .await
            .unwrap();
        assert!(signer
            .decrypt(&ciphertext, &memory_key("b", Counterparty::Myself))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_third_party_cannot_decrypt() {
        let alice = LocalSigner::generate(Network::Local);
        let bob = LocalSigner::generate(Network::Local);
        let eve = LocalSigner::generate(Network::Local);

        let ciphertext = alice
            .encrypt(b"for bob", &memory_key("k", Counterparty::Key(bob.public_key_hex())))
            .await
            .unwrap();
        let attempt = eve
            .decrypt(&ciphertext, &memory_key("k", Counterparty::Key(alice.public_key_hex())))
            .await;
        assert!(attempt.is_err());
    }

    #[test]
    fn test_counterparty_parse() {
        assert_eq!(Counterparty::parse("self").unwrap(), Counterparty::Myself);
        assert!(Counterparty::parse("not-hex").is_err());
        let signer = LocalSigner::generate(Network::Local);
        assert_eq!(
            Counterparty::parse(&signer.public_key_hex()).unwrap(),
            Counterparty::Key(signer.public_key_hex())
        );
    }
}
