//! Identity gate
//!
//! Decides per inbound message whether the sender may talk to the agent.
//! Checks run in a fixed order and the first failure short-circuits:
//! structure, trusted certifier, signature and field decryption, live
//! revocation, expiry.
//!
//! Caching policy: positive signature/decryption results are cached for
//! `cache_ttl`. Revocation answers are cached only when the outpoint was
//! unspent, and only for `revocation_cache_ttl`. Revoked and unreachable
//! answers are never cached.

use crate::canonicalize::canonical_hash;
use crate::certificate::{
    Certificate, CertificateVerifier, VerificationFailure, VerifyOptions,
};
use crate::errors::{AgidError, AgidResult, SafeReadLock, SafeWriteLock};
use crate::revocation::{RevocationChecker, RevocationPolicy, RevocationStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Field holding an RFC 3339 expiry timestamp, when present.
pub const EXPIRY_FIELD: &str = "expiresAt";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedCertifier {
    pub public_key: String,
    pub name: String,
    pub added_at: DateTime<Utc>,
    pub is_active: bool,
}

/// Allowlist of certifier keys.
#[derive(Debug, Default)]
pub struct TrustedCertifiers {
    cache: RwLock<HashMap<String, TrustedCertifier>>,
}

impl TrustedCertifiers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_keys<I, S>(keys: I) -> AgidResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let registry = Self::new();
        for key in keys {
            registry.add(key.as_ref(), "configured")?;
        }
        Ok(registry)
    }

    pub fn add(&self, public_key: &str, name: &str) -> AgidResult<()> {
        crate::signer::parse_public_key(public_key)?;
        let certifier = TrustedCertifier {
            public_key: public_key.to_string(),
            name: name.to_string(),
            added_at: Utc::now(),
            is_active: true,
        };
        self.cache.safe_write()?.insert(public_key.to_string(), certifier);
        info!(certifier = %public_key, name = %name, "trusted certifier added");
        Ok(())
    }

    /// Mark inactive; the entry is kept for audit.
    pub fn remove(&self, public_key: &str) -> AgidResult<()> {
        let mut cache = self.cache.safe_write()?;
        let certifier = cache
            .get_mut(public_key)
            .ok_or_else(|| AgidError::not_found("certifier", public_key))?;
        certifier.is_active = false;
        info!(certifier = %public_key, "trusted certifier deactivated");
        Ok(())
    }

    pub fn is_trusted(&self, public_key: &str) -> AgidResult<bool> {
        Ok(self
            .cache
            .safe_read()?
            .get(public_key)
            .map(|c| c.is_active)
            .unwrap_or(false))
    }

    pub fn list(&self) -> AgidResult<Vec<TrustedCertifier>> {
        let mut all: Vec<_> = self.cache.safe_read()?.values().cloned().collect();
        all.sort_by(|a, b| a.public_key.cmp(&b.public_key));
        Ok(all)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    NoCertificate,
    MissingField,
    SubjectMismatch,
    UntrustedCertifier,
    InvalidSignature,
    FieldDecryption,
    Revoked,
    RevocationUnavailable,
    Expired,
    MalformedExpiry,
    ExpiryNotRevealed,
    VerifierUnavailable,
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DenialReason::NoCertificate => "no certificate presented",
            DenialReason::MissingField => "certificate is missing a required field",
            DenialReason::SubjectMismatch => "certificate subject does not match sender",
            DenialReason::UntrustedCertifier => "certifier is not trusted",
            DenialReason::InvalidSignature => "certificate signature is invalid",
            DenialReason::FieldDecryption => "certificate fields could not be decrypted",
            DenialReason::Revoked => "certificate has been revoked",
            DenialReason::RevocationUnavailable => "revocation status unavailable",
            DenialReason::Expired => "certificate has expired",
            DenialReason::MalformedExpiry => "certificate expiry is malformed",
            DenialReason::ExpiryNotRevealed => "certificate expiry was not revealed",
            DenialReason::VerifierUnavailable => "certificate verifier unavailable",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityVerificationResult {
    pub verified: bool,
    pub certificate: Option<Certificate>,
    /// Decrypted fields revealed to the agent.
    pub fields: BTreeMap<String, String>,
    pub reason: Option<DenialReason>,
}

impl IdentityVerificationResult {
    fn deny(reason: DenialReason, certificate: Option<&Certificate>) -> Self {
        Self {
            verified: false,
            certificate: certificate.cloned(),
            fields: BTreeMap::new(),
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GateSettings {
    pub require_certificate: bool,
    pub cache_ttl: Duration,
    pub revocation_cache_ttl: Duration,
    pub revocation_policy: RevocationPolicy,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            require_certificate: true,
            cache_ttl: Duration::from_secs(300),
            revocation_cache_ttl: Duration::from_secs(30),
            revocation_policy: RevocationPolicy::FailClosed,
        }
    }
}

struct CachedVerification {
    fields: BTreeMap<String, String>,
    at: Instant,
}

pub struct IdentityGate {
    certifiers: Arc<TrustedCertifiers>,
    verifier: Arc<dyn CertificateVerifier>,
    revocation: Arc<dyn RevocationChecker>,
    settings: GateSettings,
    verification_cache: RwLock<HashMap<String, CachedVerification>>,
    revocation_cache: RwLock<HashMap<String, Instant>>,
}

impl IdentityGate {
    pub fn new(
        certifiers: Arc<TrustedCertifiers>,
        verifier: Arc<dyn CertificateVerifier>,
        revocation: Arc<dyn RevocationChecker>,
        settings: GateSettings,
    ) -> Self {
        if settings.revocation_policy == RevocationPolicy::FailOpen {
            warn!(
                "identity gate configured fail-open: \
                 senders are admitted when revocation status is unavailable"
            );
        }
        Self {
            certifiers,
            verifier,
            revocation,
            settings,
            verification_cache: RwLock::new(HashMap::new()),
            revocation_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn certifiers(&self) -> &Arc<TrustedCertifiers> {
        &self.certifiers
    }

    /// Decide whether `sender` may proceed. Never returns an error: every
    /// failure becomes a denial with a reason.
    pub async fn verify_identity(
        &self,
        sender: &str,
        certificate: Option<&Certificate>,
    ) -> IdentityVerificationResult {
        let result = self.evaluate(sender, certificate).await;
        match &result.reason {
            Some(reason) => info!(sender = %sender, reason = %reason, "identity denied"),
            None => debug!(sender = %sender, "identity verified"),
        }
        result
    }

    async fn evaluate(
        &self,
        sender: &str,
        certificate: Option<&Certificate>,
    ) -> IdentityVerificationResult {
        let cert = match certificate {
            Some(cert) => cert,
            None if self.settings.require_certificate => {
                return IdentityVerificationResult::deny(DenialReason::NoCertificate, None)
            }
            None => {
                return IdentityVerificationResult {
                    verified: true,
                    certificate: None,
                    fields: BTreeMap::new(),
                    reason: None,
                }
            }
        };

        if let Some(reason) = self.structural_check(sender, cert) {
            return IdentityVerificationResult::deny(reason, Some(cert));
        }

        let fields = match self.cryptographic_check(cert).await {
            Ok(fields) => fields,
            Err(reason) => return IdentityVerificationResult::deny(reason, Some(cert)),
        };

        if let Some(reason) = self.revocation_check(cert).await {
            return IdentityVerificationResult::deny(reason, Some(cert));
        }

        if let Some(reason) = expiry_check(cert, &fields) {
            return IdentityVerificationResult::deny(reason, Some(cert));
        }

        IdentityVerificationResult {
            verified: true,
            certificate: Some(cert.clone()),
            fields,
            reason: None,
        }
    }

    fn structural_check(&self, sender: &str, cert: &Certificate) -> Option<DenialReason> {
        let required = [
            &cert.cert_type,
            &cert.serial_number,
            &cert.subject,
            &cert.certifier,
            &cert.revocation_outpoint,
            &cert.signature,
        ];
        if required.iter().any(|v| v.is_empty()) || cert.fields.is_empty() {
            return Some(DenialReason::MissingField);
        }
        if cert.subject != sender {
            return Some(DenialReason::SubjectMismatch);
        }
        match self.certifiers.is_trusted(&cert.certifier) {
            Ok(true) => None,
            _ => Some(DenialReason::UntrustedCertifier),
        }
    }

    async fn cryptographic_check(
        &self,
        cert: &Certificate,
    ) -> Result<BTreeMap<String, String>, DenialReason> {
        let digest = canonical_hash(cert).map_err(|_| DenialReason::MissingField)?;

        if let Ok(cache) = self.verification_cache.safe_read() {
            if let Some(hit) = cache.get(&digest) {
                if hit.at.elapsed() < self.settings.cache_ttl {
                    return Ok(hit.fields.clone());
                }
            }
        }

        let outcome = self
            .verifier
            .verify(cert, VerifyOptions { check_revocation: false })
            .await
            .map_err(|e| {
                warn!(error = %e, "certificate verifier failed");
                DenialReason::VerifierUnavailable
            })?;

        if !outcome.verified {
            return Err(match outcome.failure {
                Some(VerificationFailure::FieldDecryption) => DenialReason::FieldDecryption,
                _ => DenialReason::InvalidSignature,
            });
        }

        if let Ok(mut cache) = self.verification_cache.safe_write() {
            let ttl = self.settings.cache_ttl;
            cache.retain(|_, entry| entry.at.elapsed() < ttl);
            cache.insert(
                digest,
                CachedVerification {
                    fields: outcome.fields.clone(),
                    at: Instant::now(),
                },
            );
        }
        Ok(outcome.fields)
    }

    async fn revocation_check(&self, cert: &Certificate) -> Option<DenialReason> {
        let outpoint = &cert.revocation_outpoint;
        if let Ok(cache) = self.revocation_cache.safe_read() {
            if let Some(at) = cache.get(outpoint) {
                if at.elapsed() < self.settings.revocation_cache_ttl {
                    return None;
                }
            }
        }

        match self.revocation.check(outpoint).await {
            Ok(RevocationStatus::NotRevoked) => {
                if let Ok(mut cache) = self.revocation_cache.safe_write() {
                    let ttl = self.settings.revocation_cache_ttl;
                    cache.retain(|_, at| at.elapsed() < ttl);
                    cache.insert(outpoint.clone(), Instant::now());
                }
                None
            }
            Ok(RevocationStatus::Revoked) => {
                if let Ok(mut cache) = self.revocation_cache.safe_write() {
                    cache.remove(outpoint);
                }
                Some(DenialReason::Revoked)
            }
            Err(e) => match self.settings.revocation_policy {
                RevocationPolicy::FailClosed => {
                    warn!(outpoint = %outpoint, error = %e, "revocation check failed, denying");
                    Some(DenialReason::RevocationUnavailable)
                }
                RevocationPolicy::FailOpen => {
                    warn!(
                        outpoint = %outpoint,
                        error = %e,
                        "revocation check failed, admitting under fail-open policy"
                    );
                    None
                }
            },
        }
    }

    /// Drop every cached answer.
    pub fn clear_caches(&self) -> AgidResult<()> {
        self.verification_cache.safe_write()?.clear();
        self.revocation_cache.safe_write()?.clear();
        Ok(())
    }
}

/// A certificate that carries an expiry must reveal it to the agent.
fn expiry_check(cert: &Certificate, fields: &BTreeMap<String, String>) -> Option<DenialReason> {
    let Some(expires_at) = fields.get(EXPIRY_FIELD) else {
        return cert
            .fields
            .contains_key(EXPIRY_FIELD)
            .then_some(DenialReason::ExpiryNotRevealed);
    };
    match DateTime::parse_from_rfc3339(expires_at) {
        Ok(at) if at.with_timezone(&Utc) <= Utc::now() => Some(DenialReason::Expired),
        Ok(_) => None,
        Err(_) => Some(DenialReason::MalformedExpiry),
    }
}
