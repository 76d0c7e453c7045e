//! Signed audit trail
//!
//! Each entry is signed on its own over its canonical form, so any single
//! record can be checked without the rest of the log. Ordering evidence is
//! the anchor chain's job, not this one's.

use crate::canonicalize::canonical_bytes;
use crate::errors::{AgidError, AgidResult, SafeLock};
use crate::signer::{
    verify_detached, Counterparty, KeyRef, Protocol, SecurityLevel, SigningCapability,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

pub const ACTION_MESSAGE: &str = "message_processed";
pub const ACTION_ACCESS_DENIED: &str = "access_denied";
pub const ACTION_TOOL_REQUEST: &str = "tool_request";

const AUDIT_PROTOCOL: &str = "agidentity audit";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: String,
    pub action: String,
    pub user_public_key: String,
    pub agent_public_key: String,
    pub input: Option<String>,
    pub output: Option<String>,
    pub metadata: Value,
    pub timestamp: String,
    /// Hex signature over every other field.
    pub signature: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UnsignedEntry<'a> {
    id: &'a str,
    action: &'a str,
    user_public_key: &'a str,
    agent_public_key: &'a str,
    input: &'a Option<String>,
    output: &'a Option<String>,
    metadata: &'a Value,
    timestamp: &'a str,
}

impl AuditEntry {
    fn signed_bytes(&self) -> AgidResult<Vec<u8>> {
        canonical_bytes(&UnsignedEntry {
            id: &self.id,
            action: &self.action,
            user_public_key: &self.user_public_key,
            agent_public_key: &self.agent_public_key,
            input: &self.input,
            output: &self.output,
            metadata: &self.metadata,
            timestamp: &self.timestamp,
        })
    }

    fn key_ref(&self) -> KeyRef {
        KeyRef::new(
            Protocol::new(SecurityLevel::App, AUDIT_PROTOCOL),
            self.id.clone(),
            Counterparty::Myself,
        )
    }

    /// Check this entry's signature against its agent key.
    pub fn verify(&self) -> AgidResult<bool> {
        let signature = match hex::decode(&self.signature) {
            Ok(sig) => sig,
            Err(_) => return Ok(false),
        };
        verify_detached(&self.agent_public_key, &self.key_ref(), &self.signed_bytes()?, &signature)
    }
}

/// Fields supplied by the caller for a new entry.
#[derive(Debug, Clone, Default)]
pub struct AuditRecord {
    pub action: String,
    pub user_public_key: String,
    pub input: Option<String>,
    pub output: Option<String>,
    pub metadata: Value,
}

pub trait AuditSink: Send + Sync {
    fn append(&self, entry: &AuditEntry) -> AgidResult<()>;
    fn entries(&self) -> AgidResult<Vec<AuditEntry>>;
}

/// Append-only JSON-lines file.
pub struct JsonlAuditSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlAuditSink {
    pub fn new<P: AsRef<Path>>(path: P) -> AgidResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AgidError::io("create audit log directory", e))?;
            }
        }
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }
}

impl AuditSink for JsonlAuditSink {
    fn append(&self, entry: &AuditEntry) -> AgidResult<()> {
        let _guard = self.write_lock.safe_lock()?;
        let json = serde_json::to_string(entry)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| AgidError::io("open audit log", e))?;
        writeln!(file, "{json}").map_err(|e| AgidError::io("append audit log", e))?;
        Ok(())
    }

    fn entries(&self) -> AgidResult<Vec<AuditEntry>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AgidError::io("open audit log", e)),
        };
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| AgidError::io("read audit log", e))?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }
}

#[derive(Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, entry: &AuditEntry) -> AgidResult<()> {
        self.entries.safe_lock()?.push(entry.clone());
        Ok(())
    }

    fn entries(&self) -> AgidResult<Vec<AuditEntry>> {
        Ok(self.entries.safe_lock()?.clone())
    }
}

pub struct SignedAuditTrail {
    signer: SigningCapability,
    sink: Arc<dyn AuditSink>,
}

impl SignedAuditTrail {
    pub fn new(signer: SigningCapability, sink: Arc<dyn AuditSink>) -> Self {
        Self { signer, sink }
    }

    pub async fn create_entry(&self, record: AuditRecord) -> AgidResult<AuditEntry> {
        let mut entry = AuditEntry {
            id: Uuid::new_v4().to_string(),
            action: record.action,
            user_public_key: record.user_public_key,
            agent_public_key: self.signer.identity().public_key.clone(),
            input: record.input,
            output: record.output,
            metadata: record.metadata,
            timestamp: Utc::now().to_rfc3339(),
            signature: String::new(),
        };
        let signature = self
            .signer
            .sign(&entry.signed_bytes()?, &entry.key_ref())
            .await?;
        entry.signature = hex::encode(signature);

        self.sink.append(&entry)?;
        debug!(entry_id = %entry.id, action = %entry.action, "audit entry recorded");
        Ok(entry)
    }

    pub fn entries(&self) -> AgidResult<Vec<AuditEntry>> {
        self.sink.entries()
    }

    /// Entries whose signature does not check out.
    pub fn invalid_entries(&self) -> AgidResult<Vec<String>> {
        let mut invalid = Vec::new();
        for entry in self.entries()? {
            if !entry.verify()? {
                invalid.push(entry.id);
            }
        }
        Ok(invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::{LocalSigner, Network};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn trail(sink: Arc<dyn AuditSink>) -> SignedAuditTrail {
        let signer = Arc::new(LocalSigner::generate(Network::Local));
        SignedAuditTrail::new(SigningCapability::new(signer, Duration::from_secs(5)), sink)
    }

    fn record(input: &str) -> AuditRecord {
        AuditRecord {
            action: ACTION_MESSAGE.to_string(),
            user_public_key: "user".to_string(),
            input: Some(input.to_string()),
            output: Some("pong".to_string()),
            metadata: json!({"sessionId": "s1"}),
        }
    }

    #[tokio::test]
    async fn test_entries_verify_individually() {
        let trail = trail(Arc::new(MemoryAuditSink::new()));
        let first = trail.create_entry(record("ping")).await.unwrap();
        let _second = trail.create_entry(record("ping again")).await.unwrap();

        assert!(first.verify().unwrap());
        assert!(trail.invalid_entries().unwrap().is_empty());

        let mut forged = first.clone();
        forged.output = Some("something else".to_string());
        assert!(!forged.verify().unwrap());
    }

    #[tokio::test]
    async fn test_jsonl_sink_persists_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("audit.jsonl");
        let sink = Arc::new(JsonlAuditSink::new(&path).unwrap());
        assert!(sink.entries().unwrap().is_empty());

        let trail = trail(sink.clone());
        trail.create_entry(record("one")).await.unwrap();
        trail.create_entry(record("two")).await.unwrap();

        let reread = JsonlAuditSink::new(&path).unwrap().entries().unwrap();
        assert_eq!(reread.len(), 2);
        assert_eq!(reread[1].input.as_deref(), Some("two"));
        assert!(reread.iter().all(|e| e.verify().unwrap()));
    }
}
