//! Trust certificates
//!
//! A certificate binds attribute fields to a subject key and is signed by a
//! certifier. Every field value is encrypted under its own random field key;
//! the subject holds the master keyring and can reveal individual fields to
//! a verifier by re-encrypting those field keys to the verifier's identity.
//! Fields that are never revealed stay readable by the subject only.

use crate::canonicalize::canonical_bytes;
use crate::errors::{AgidError, AgidResult};
use crate::revocation::{RevocationChecker, RevocationStatus};
use crate::signer::{
    verify_detached, Counterparty, KeyRef, Protocol, SecurityLevel, Signer, SigningCapability,
};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

const FIELD_NONCE_LEN: usize = 12;
const SIGNATURE_PROTOCOL: &str = "certificate signature";
const FIELD_PROTOCOL: &str = "certificate field encryption";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    #[serde(rename = "type")]
    pub cert_type: String,
    pub serial_number: String,
    pub subject: String,
    pub certifier: String,
    pub revocation_outpoint: String,
    /// Field name to base64 ciphertext.
    pub fields: BTreeMap<String, String>,
    /// Hex Ed25519 signature by the certifier.
    pub signature: String,
    /// Field name to base64 field key encrypted for one verifier.
    #[serde(default)]
    pub keyring: BTreeMap<String, String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignedPortion<'a> {
    #[serde(rename = "type")]
    cert_type: &'a str,
    serial_number: &'a str,
    subject: &'a str,
    certifier: &'a str,
    revocation_outpoint: &'a str,
    fields: &'a BTreeMap<String, String>,
}

impl Certificate {
    /// Canonical bytes covered by the certifier signature.
    pub fn signed_bytes(&self) -> AgidResult<Vec<u8>> {
        canonical_bytes(&SignedPortion {
            cert_type: &self.cert_type,
            serial_number: &self.serial_number,
            subject: &self.subject,
            certifier: &self.certifier,
            revocation_outpoint: &self.revocation_outpoint,
            fields: &self.fields,
        })
    }

    fn signature_key(&self) -> KeyRef {
        KeyRef::new(
            Protocol::new(SecurityLevel::Counterparty, SIGNATURE_PROTOCOL),
            format!("{} {}", self.cert_type, self.serial_number),
            Counterparty::Myself,
        )
    }

    /// Check the certifier signature over the signed portion.
    pub fn verify_signature(&self) -> AgidResult<bool> {
        let signature = match hex::decode(&self.signature) {
            Ok(bytes) => bytes,
            Err(_) => return Ok(false),
        };
        verify_detached(
            &self.certifier,
            &self.signature_key(),
            &self.signed_bytes()?,
            &signature,
        )
    }
}

fn field_key_ref(serial_number: &str, field: &str, counterparty: &str) -> KeyRef {
    KeyRef::new(
        Protocol::new(SecurityLevel::Counterparty, FIELD_PROTOCOL),
        format!("{serial_number} {field}"),
        Counterparty::Key(counterparty.to_string()),
    )
}

fn seal_field(field_key: &[u8; 32], plaintext: &[u8]) -> AgidResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(field_key)
        .map_err(|e| AgidError::crypto(format!("field cipher init: {e}")))?;
    let mut nonce = [0u8; FIELD_NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);
    let body = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| AgidError::crypto("field encryption failed"))?;
    let mut out = nonce.to_vec();
    out.extend_from_slice(&body);
    Ok(out)
}

fn open_field(field_key: &[u8], sealed: &[u8]) -> AgidResult<Vec<u8>> {
    if sealed.len() <= FIELD_NONCE_LEN {
        return Err(AgidError::crypto("field ciphertext too short"));
    }
    let cipher = Aes256Gcm::new_from_slice(field_key)
        .map_err(|e| AgidError::crypto(format!("field cipher init: {e}")))?;
    let (nonce, body) = sealed.split_at(FIELD_NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), body)
        .map_err(|_| AgidError::crypto("field decryption failed"))
}

fn decode_b64(field: &str, value: &str) -> AgidResult<Vec<u8>> {
    B64.decode(value)
        .map_err(|e| AgidError::validation(field, format!("invalid base64: {e}")))
}

/// A freshly issued certificate plus the subject's master keyring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCertificate {
    pub certificate: Certificate,
    /// Field keys encrypted between certifier and subject.
    pub master_keyring: BTreeMap<String, String>,
}

/// Issues certificates on behalf of a certifier identity.
pub struct CertificateIssuer {
    signer: Arc<dyn Signer>,
}

impl CertificateIssuer {
    pub fn new(signer: Arc<dyn Signer>) -> Self {
        Self { signer }
    }

    pub async fn issue(
        &self,
        cert_type: &str,
        subject: &str,
        plain_fields: &BTreeMap<String, String>,
        revocation_outpoint: &str,
    ) -> AgidResult<IssuedCertificate> {
        if plain_fields.is_empty() {
            return Err(AgidError::validation("fields", "certificate needs at least one field"));
        }
        crate::signer::parse_public_key(subject)?;

        let mut serial = [0u8; 32];
        rand::rng().fill_bytes(&mut serial);
        let serial_number = B64.encode(serial);

        let mut fields = BTreeMap::new();
        let mut master_keyring = BTreeMap::new();
        for (name, value) in plain_fields {
            let mut field_key = [0u8; 32];
            rand::rng().fill_bytes(&mut field_key);

            fields.insert(name.clone(), B64.encode(seal_field(&field_key, value.as_bytes())?));
            let wrapped = self
                .signer
                .encrypt(&field_key, &field_key_ref(&serial_number, name, subject))
                .await?;
            master_keyring.insert(name.clone(), B64.encode(wrapped));
        }

        let mut certificate = Certificate {
            cert_type: cert_type.to_string(),
            serial_number,
            subject: subject.to_string(),
            certifier: self.signer.identity().public_key,
            revocation_outpoint: revocation_outpoint.to_string(),
            fields,
            signature: String::new(),
            keyring: BTreeMap::new(),
        };
        let signature = self
            .signer
            .sign(&certificate.signed_bytes()?, &certificate.signature_key())
            .await?;
        certificate.signature = hex::encode(signature);

        debug!(serial = %certificate.serial_number, subject = %subject, "issued certificate");
        Ok(IssuedCertificate {
            certificate,
            master_keyring,
        })
    }
}

/// Subject side: produce a copy of the certificate whose keyring opens
/// `fields` for `verifier` only.
pub async fn reveal_for_verifier(
    subject: &dyn Signer,
    issued: &IssuedCertificate,
    verifier: &str,
    fields: &[&str],
) -> AgidResult<Certificate> {
    let cert = &issued.certificate;
    let mut keyring = BTreeMap::new();
    for field in fields {
        let wrapped = issued
            .master_keyring
            .get(*field)
            .ok_or_else(|| AgidError::not_found("certificate field", *field))?;
        let field_key = subject
            .decrypt(
                &decode_b64("master_keyring", wrapped)?,
                &field_key_ref(&cert.serial_number, field, &cert.certifier),
            )
            .await?;
        let rewrapped = subject
            .encrypt(&field_key, &field_key_ref(&cert.serial_number, field, verifier))
            .await?;
        keyring.insert(field.to_string(), B64.encode(rewrapped));
    }

    let mut revealed = cert.clone();
    revealed.keyring = keyring;
    Ok(revealed)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyOptions {
    pub check_revocation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationFailure {
    InvalidSignature,
    FieldDecryption,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateVerification {
    pub verified: bool,
    /// Decrypted values of the fields revealed to this verifier.
    pub fields: BTreeMap<String, String>,
    pub revocation_status: Option<RevocationStatus>,
    pub failure: Option<VerificationFailure>,
}

impl CertificateVerification {
    fn failed(failure: VerificationFailure) -> Self {
        Self {
            verified: false,
            fields: BTreeMap::new(),
            revocation_status: None,
            failure: Some(failure),
        }
    }
}

#[async_trait]
pub trait CertificateVerifier: Send + Sync {
    async fn verify(
        &self,
        certificate: &Certificate,
        options: VerifyOptions,
    ) -> AgidResult<CertificateVerification>;
}

/// Verifies certificates for the agent identity held by `signer`.
pub struct LocalCertificateVerifier {
    signer: SigningCapability,
    revocation: Option<Arc<dyn RevocationChecker>>,
}

impl LocalCertificateVerifier {
    pub fn new(signer: SigningCapability) -> Self {
        Self {
            signer,
            revocation: None,
        }
    }

    pub fn with_revocation(mut self, checker: Arc<dyn RevocationChecker>) -> Self {
        self.revocation = Some(checker);
        self
    }
}

#[async_trait]
impl CertificateVerifier for LocalCertificateVerifier {
    async fn verify(
        &self,
        certificate: &Certificate,
        options: VerifyOptions,
    ) -> AgidResult<CertificateVerification> {
        if !certificate.verify_signature()? {
            return Ok(CertificateVerification::failed(VerificationFailure::InvalidSignature));
        }

        let mut fields = BTreeMap::new();
        if !certificate.keyring.is_empty() {
            // One lock acquisition for all keyring entries.
            let guard = self.signer.acquire().await;
            for (name, wrapped) in &certificate.keyring {
                let sealed = match certificate.fields.get(name) {
                    Some(sealed) => sealed,
                    None => {
                        return Ok(CertificateVerification::failed(
                            VerificationFailure::FieldDecryption,
                        ))
                    }
                };
                let key_ref =
                    field_key_ref(&certificate.serial_number, name, &certificate.subject);
                let opened = match B64.decode(wrapped) {
                    Ok(wrapped) => match guard.decrypt(&wrapped, &key_ref).await {
                        Ok(field_key) => B64
                            .decode(sealed)
                            .ok()
                            .and_then(|sealed| open_field(&field_key, &sealed).ok()),
                        Err(e) if e.is_signing_failure() => return Err(e),
                        Err(_) => None,
                    },
                    Err(_) => None,
                };
                match opened.and_then(|bytes| String::from_utf8(bytes).ok()) {
                    Some(value) => {
                        fields.insert(name.clone(), value);
                    }
                    None => {
                        return Ok(CertificateVerification::failed(
                            VerificationFailure::FieldDecryption,
                        ))
                    }
                }
            }
        }

        let revocation_status = match (&self.revocation, options.check_revocation) {
            (Some(checker), true) => Some(checker.check(&certificate.revocation_outpoint).await?),
            (None, true) => {
                return Err(AgidError::config(
                    "revocation check requested but no checker configured",
                ))
            }
            _ => None,
        };
        let verified = revocation_status != Some(RevocationStatus::Revoked);

        Ok(CertificateVerification {
            verified,
            fields,
            revocation_status,
            failure: None,
        })
    }
}
