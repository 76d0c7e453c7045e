//! Persistent Ed25519 identity key for the agent
//!
//! The identity key is stored as a small JSON file. When an encryption key
//! is available (`AGID_KEY_ENCRYPTION_KEY`, base64 of 32 bytes) the private
//! key is sealed with AES-256-GCM; otherwise it is stored in plain base64 and
//! a warning is logged.

use crate::errors::AgidError;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

pub const ENCRYPTION_KEY_ENV: &str = "AGID_KEY_ENCRYPTION_KEY";

/// Errors that can occur during key operations
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Invalid encryption key")]
    InvalidEncryptionKey,

    #[error("Key file is encrypted but no encryption key was provided")]
    EncryptionKeyRequired,

    #[error("Stored public key does not match the private key")]
    PublicKeyMismatch,
}

impl From<KeyError> for AgidError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::Io(source) => AgidError::io("identity key file", source),
            KeyError::Json(source) => AgidError::serialization("identity key file", source),
            other => AgidError::crypto(other.to_string()),
        }
    }
}

/// On-disk key file. Exactly one of `private_key_b64` or
/// `encrypted_private_key_b64` + `nonce_b64` is set.
#[derive(Serialize, Deserialize)]
struct KeyFile {
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    private_key_b64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    encrypted_private_key_b64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nonce_b64: Option<String>,
    public_key_hex: String,
    created_at: String,
    purpose: String,
}

/// The agent's identity key pair.
#[derive(Debug, Clone)]
pub struct AgentKey {
    signing_key: SigningKey,
}

impl AgentKey {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| KeyError::InvalidKeyLength(bytes.len()))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&array),
        })
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn into_signing_key(self) -> SigningKey {
        self.signing_key
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key().to_bytes())
    }

    /// Write the key file, sealing the private key when `encryption_key` is set.
    pub fn save<P: AsRef<Path>>(
        &self,
        path: P,
        encryption_key: Option<&[u8; 32]>,
    ) -> Result<(), KeyError> {
        let mut file = KeyFile {
            version: 1,
            private_key_b64: None,
            encrypted_private_key_b64: None,
            nonce_b64: None,
            public_key_hex: self.public_key_hex(),
            created_at: chrono::Utc::now().to_rfc3339(),
            purpose: "agent identity".to_string(),
        };

        match encryption_key {
            Some(key) => {
                let mut nonce_bytes = [0u8; 12];
                rand::rng().fill_bytes(&mut nonce_bytes);
                let cipher = Aes256Gcm::new_from_slice(key)
                    .map_err(|e| KeyError::Encryption(e.to_string()))?;
                let sealed = cipher
                    .encrypt(Nonce::from_slice(&nonce_bytes), self.signing_key.to_bytes().as_ref())
                    .map_err(|e| KeyError::Encryption(e.to_string()))?;
                file.encrypted_private_key_b64 = Some(B64.encode(sealed));
                file.nonce_b64 = Some(B64.encode(nonce_bytes));
            }
            None => {
                file.private_key_b64 = Some(B64.encode(self.signing_key.to_bytes()));
            }
        }

        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(
        path: P,
        encryption_key: Option<&[u8; 32]>,
    ) -> Result<Self, KeyError> {
        let file: KeyFile = serde_json::from_str(&fs::read_to_string(path)?)?;

        let key = match (&file.private_key_b64, &file.encrypted_private_key_b64) {
            (Some(plain), _) => Self::from_bytes(&B64.decode(plain)?)?,
            (None, Some(sealed)) => {
                let encryption_key = encryption_key.ok_or(KeyError::EncryptionKeyRequired)?;
                let nonce_b64 = file
                    .nonce_b64
                    .as_ref()
                    .ok_or_else(|| KeyError::Encryption("missing nonce".to_string()))?;
                let nonce_bytes = B64.decode(nonce_b64)?;
                if nonce_bytes.len() != 12 {
                    return Err(KeyError::Encryption("bad nonce length".to_string()));
                }
                let cipher = Aes256Gcm::new_from_slice(encryption_key)
                    .map_err(|e| KeyError::Encryption(e.to_string()))?;
                let private_key = cipher
                    .decrypt(Nonce::from_slice(&nonce_bytes), B64.decode(sealed)?.as_ref())
                    .map_err(|e| KeyError::Encryption(e.to_string()))?;
                Self::from_bytes(&private_key)?
            }
            (None, None) => {
                return Err(KeyError::Encryption("key file has no private key".to_string()))
            }
        };

        if key.public_key_hex() != file.public_key_hex {
            return Err(KeyError::PublicKeyMismatch);
        }
        Ok(key)
    }

    /// Load the key at `path`, generating and saving a new one if absent.
    pub fn load_or_create<P: AsRef<Path>>(
        path: P,
        encryption_key: Option<&[u8; 32]>,
    ) -> Result<Self, KeyError> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path, encryption_key);
        }

        let key = Self::generate();
        if encryption_key.is_none() {
            warn!(
                path = %path.display(),
                "{ENCRYPTION_KEY_ENV} not set, storing identity key unencrypted"
            );
        }
        key.save(path, encryption_key)?;
        info!(
            path = %path.display(),
            public_key = %key.public_key_hex(),
            "generated new agent identity key"
        );
        Ok(key)
    }
}

/// Read the key-file encryption key from the environment, if set.
pub fn encryption_key_from_env() -> Result<Option<[u8; 32]>, KeyError> {
    match std::env::var(ENCRYPTION_KEY_ENV) {
        Ok(encoded) => {
            let bytes = B64
                .decode(encoded.trim())
                .map_err(|_| KeyError::InvalidEncryptionKey)?;
            let key: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| KeyError::InvalidEncryptionKey)?;
            Ok(Some(key))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_plain_key_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identity.json");

        let created = AgentKey::load_or_create(&path, None).unwrap();
        let loaded = AgentKey::load_or_create(&path, None).unwrap();
        assert_eq!(created.public_key_hex(), loaded.public_key_hex());
    }

    #[test]
    fn test_encrypted_key_requires_encryption_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("identity.json");
        let secret = [7u8; 32];

        let created = AgentKey::load_or_create(&path, Some(&secret)).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("\"private_key_b64\""));

        assert!(matches!(
            AgentKey::load(&path, None),
            Err(KeyError::EncryptionKeyRequired)
        ));
        assert!(AgentKey::load(&path, Some(&[8u8; 32])).is_err());

        let loaded = AgentKey::load(&path, Some(&secret)).unwrap();
        assert_eq!(created.public_key_hex(), loaded.public_key_hex());
    }

    #[test]
    fn test_tampered_public_key_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identity.json");
        AgentKey::generate().save(&path, None).unwrap();

        let mut value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        value["public_key_hex"] = serde_json::Value::String(AgentKey::generate().public_key_hex());
        fs::write(&path, value.to_string()).unwrap();

        assert!(matches!(
            AgentKey::load(&path, None),
            Err(KeyError::PublicKeyMismatch)
        ));
    }
}
