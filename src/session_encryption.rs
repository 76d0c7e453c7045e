//! Per-conversation message encryption
//!
//! Every message gets its own derived key, selected by a key id built from
//! `(session id, message index, direction, timestamp, sender key)` and bound
//! to the counterparty's public key. Naming the sender keeps the two peers'
//! index sequences apart even though their shared secret is symmetric. The
//! outbound index only moves forward, and inbound indices must strictly
//! increase, so no key id is ever used twice.

use crate::canonicalize::{canonical_bytes, sha256_hex};
use crate::errors::{AgidError, AgidResult};
use crate::signer::{
    verify_detached, Counterparty, KeyRef, Protocol, SecurityLevel, SigningCapability,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const SESSION_PROTOCOL: &str = "agidentity session";
const ENVELOPE_PROTOCOL: &str = "agidentity session envelope";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => f.write_str("outbound"),
            Direction::Inbound => f.write_str("inbound"),
        }
    }
}

impl FromStr for Direction {
    type Err = AgidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "outbound" => Ok(Direction::Outbound),
            "inbound" => Ok(Direction::Inbound),
            other => Err(AgidError::validation(
                "direction",
                format!("unknown direction '{other}'"),
            )),
        }
    }
}

/// Components of a message key id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyId {
    pub session_id: String,
    pub message_index: u64,
    pub direction: Direction,
    pub timestamp: i64,
    /// Hex public key of the party that encrypted the message.
    pub sender: String,
}

impl KeyId {
    pub fn format(&self) -> String {
        format!(
            "{}-{}-{}-{}-{}",
            self.session_id, self.message_index, self.direction, self.timestamp, self.sender
        )
    }

    /// Parse from the right so session ids may themselves contain '-'.
    pub fn parse(raw: &str) -> AgidResult<Self> {
        let mut parts = raw.rsplitn(5, '-');
        let sender = parts.next().filter(|s| !s.is_empty());
        let timestamp = parts.next();
        let direction = parts.next();
        let index = parts.next();
        let session_id = parts.next();
        match (session_id, index, direction, timestamp, sender) {
            (Some(session_id), Some(index), Some(direction), Some(timestamp), Some(sender))
                if !session_id.is_empty() =>
            {
                Ok(Self {
                    session_id: session_id.to_string(),
                    message_index: index
                        .parse()
                        .map_err(|_| AgidError::validation("key_id", "bad message index"))?,
                    direction: direction.parse()?,
                    timestamp: timestamp
                        .parse()
                        .map_err(|_| AgidError::validation("key_id", "bad timestamp"))?,
                    sender: sender.to_string(),
                })
            }
            _ => Err(AgidError::validation("key_id", format!("malformed key id '{raw}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedMessage {
    pub key_id: String,
    pub message_index: u64,
    pub direction: Direction,
    pub timestamp: i64,
    /// Base64 ciphertext.
    pub ciphertext: String,
}

/// Encrypted message with detached metadata signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedEnvelope {
    pub message: EncryptedMessage,
    pub ciphertext_hash: String,
    pub signer_public_key: String,
    /// Hex signature over the canonical metadata.
    pub signature: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeMetadata<'a> {
    key_id: &'a str,
    message_index: u64,
    direction: Direction,
    timestamp: i64,
    ciphertext_hash: &'a str,
}

fn envelope_key(key_id: &str) -> KeyRef {
    KeyRef::new(
        Protocol::new(SecurityLevel::Counterparty, ENVELOPE_PROTOCOL),
        key_id,
        Counterparty::Myself,
    )
}

pub struct SessionEncryption {
    session_id: String,
    counterparty: String,
    signer: SigningCapability,
    outbound_index: u64,
    last_inbound_index: Option<u64>,
}

impl SessionEncryption {
    pub fn new(
        session_id: impl Into<String>,
        counterparty: impl Into<String>,
        signer: SigningCapability,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            counterparty: counterparty.into(),
            signer,
            outbound_index: 0,
            last_inbound_index: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn counterparty(&self) -> &str {
        &self.counterparty
    }

    /// Index the next outbound message will use.
    pub fn next_outbound_index(&self) -> u64 {
        self.outbound_index
    }

    fn key_ref(&self, key_id: &str) -> KeyRef {
        KeyRef::new(
            Protocol::new(SecurityLevel::Counterparty, SESSION_PROTOCOL),
            key_id,
            Counterparty::Key(self.counterparty.clone()),
        )
    }

    pub async fn encrypt_outbound(&mut self, plaintext: &[u8]) -> AgidResult<EncryptedMessage> {
        let key_id = KeyId {
            session_id: self.session_id.clone(),
            message_index: self.outbound_index,
            direction: Direction::Outbound,
            timestamp: Utc::now().timestamp_millis(),
            sender: self.signer.identity().public_key.clone(),
        };
        // Consume the index before the signer call so a failed attempt never
        // leaves it available for reuse.
        self.outbound_index += 1;

        let raw_key_id = key_id.format();
        let ciphertext = self.signer.encrypt(plaintext, &self.key_ref(&raw_key_id)).await?;
        Ok(EncryptedMessage {
            key_id: raw_key_id,
            message_index: key_id.message_index,
            direction: key_id.direction,
            timestamp: key_id.timestamp,
            ciphertext: B64.encode(ciphertext),
        })
    }

    /// Decrypt a message the counterparty encrypted for us.
    pub async fn decrypt_inbound(&mut self, message: &EncryptedMessage) -> AgidResult<Vec<u8>> {
        let key_id = KeyId::parse(&message.key_id)?;
        if key_id.session_id != self.session_id {
            return Err(AgidError::crypto("message belongs to a different session"));
        }
        if key_id.sender != self.counterparty {
            return Err(AgidError::auth("message was not encrypted by the session counterparty"));
        }
        if key_id.message_index != message.message_index
            || key_id.direction != message.direction
            || key_id.timestamp != message.timestamp
        {
            return Err(AgidError::crypto("message metadata does not match its key id"));
        }
        if let Some(last) = self.last_inbound_index {
            if message.message_index <= last {
                return Err(AgidError::crypto(format!(
                    "message index {} already used (last {last})",
                    message.message_index
                )));
            }
        }

        let ciphertext = B64
            .decode(&message.ciphertext)
            .map_err(|e| AgidError::validation("ciphertext", e.to_string()))?;
        let plaintext = self
            .signer
            .decrypt(&ciphertext, &self.key_ref(&message.key_id))
            .await?;
        self.last_inbound_index = Some(message.message_index);
        Ok(plaintext)
    }

    pub async fn encrypt_outbound_signed(
        &mut self,
        plaintext: &[u8],
    ) -> AgidResult<SignedEnvelope> {
        let message = self.encrypt_outbound(plaintext).await?;
        let ciphertext_hash = sha256_hex(message.ciphertext.as_bytes());
        let metadata = canonical_bytes(&EnvelopeMetadata {
            key_id: &message.key_id,
            message_index: message.message_index,
            direction: message.direction,
            timestamp: message.timestamp,
            ciphertext_hash: &ciphertext_hash,
        })?;
        let signature = self.signer.sign(&metadata, &envelope_key(&message.key_id)).await?;
        Ok(SignedEnvelope {
            message,
            ciphertext_hash,
            signer_public_key: self.signer.identity().public_key.clone(),
            signature: hex::encode(signature),
        })
    }

    /// Authenticate the envelope without decrypting it.
    pub fn verify_envelope(&self, envelope: &SignedEnvelope) -> AgidResult<()> {
        if envelope.signer_public_key != self.counterparty {
            return Err(AgidError::auth("envelope not signed by the session counterparty"));
        }
        if sha256_hex(envelope.message.ciphertext.as_bytes()) != envelope.ciphertext_hash {
            return Err(AgidError::integrity("envelope ciphertext hash mismatch"));
        }
        let metadata = canonical_bytes(&EnvelopeMetadata {
            key_id: &envelope.message.key_id,
            message_index: envelope.message.message_index,
            direction: envelope.message.direction,
            timestamp: envelope.message.timestamp,
            ciphertext_hash: &envelope.ciphertext_hash,
        })?;
        let signature = hex::decode(&envelope.signature)
            .map_err(|e| AgidError::validation("signature", e.to_string()))?;
        if !verify_detached(
            &envelope.signer_public_key,
            &envelope_key(&envelope.message.key_id),
            &metadata,
            &signature,
        )? {
            return Err(AgidError::auth("envelope signature invalid"));
        }
        Ok(())
    }

    pub async fn decrypt_signed_inbound(
        &mut self,
        envelope: &SignedEnvelope,
    ) -> AgidResult<Vec<u8>> {
        self.verify_envelope(envelope)?;
        self.decrypt_inbound(&envelope.message).await
    }
}
