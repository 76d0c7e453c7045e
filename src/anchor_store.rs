//! Persistence for anchor chains and their ledger receipts.

use crate::anchor_chain::{ChainRecord, CommitmentRecord};
use crate::errors::{AgidError, AgidResult, SafeLock};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

const CHAINS_TREE: &str = "anchor_chains";
const RECEIPTS_TREE: &str = "ledger_receipts";
const META_TREE: &str = "meta";
const WORKSPACE_HASH_KEY: &str = "workspace_hash";

/// External-ledger receipt for one committed chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitmentReceipt {
    pub receipt_id: String,
    pub record: CommitmentRecord,
    pub committed_at: DateTime<Utc>,
}

pub trait AnchorStore: Send + Sync {
    fn save_chain(&self, record: &ChainRecord) -> AgidResult<()>;
    fn load_chain(&self, session_id: &str) -> AgidResult<Option<ChainRecord>>;
    fn list_sessions(&self) -> AgidResult<Vec<String>>;
    fn save_receipt(&self, receipt: &CommitmentReceipt) -> AgidResult<()>;
    fn load_receipt(&self, session_id: &str) -> AgidResult<Option<CommitmentReceipt>>;
    /// Workspace hash recorded by the last committed session.
    fn last_workspace_hash(&self) -> AgidResult<Option<String>>;
    fn set_workspace_hash(&self, hash: &str) -> AgidResult<()>;
}

/// sled-backed store: one tree per record kind, keyed by session id.
pub struct SledAnchorStore {
    db: sled::Db,
}

impl SledAnchorStore {
    pub fn open<P: AsRef<Path>>(path: P) -> AgidResult<Self> {
        let db = sled::open(path.as_ref())
            .map_err(|e| AgidError::database(format!("open {}", path.as_ref().display()), e))?;
        Ok(Self { db })
    }

    fn tree(&self, name: &str) -> AgidResult<sled::Tree> {
        self.db
            .open_tree(name)
            .map_err(|e| AgidError::database(format!("open tree {name}"), e))
    }

    fn put<T: Serialize>(&self, tree: &str, key: &str, value: &T) -> AgidResult<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| AgidError::serialization(format!("{tree}/{key}"), e))?;
        let tree = self.tree(tree)?;
        tree.insert(key.as_bytes(), bytes)?;
        tree.flush()?;
        Ok(())
    }

    fn get<T: for<'de> Deserialize<'de>>(&self, tree: &str, key: &str) -> AgidResult<Option<T>> {
        match self.tree(tree)?.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes)
                    .map_err(|e| AgidError::serialization(format!("{tree}/{key}"), e))?,
            )),
            None => Ok(None),
        }
    }
}

impl AnchorStore for SledAnchorStore {
    fn save_chain(&self, record: &ChainRecord) -> AgidResult<()> {
        self.put(CHAINS_TREE, &record.session_id, record)?;
        debug!(
            session_id = %record.session_id,
            anchors = record.anchors.len(),
            "anchor chain persisted"
        );
        Ok(())
    }

    fn load_chain(&self, session_id: &str) -> AgidResult<Option<ChainRecord>> {
        self.get(CHAINS_TREE, session_id)
    }

    fn list_sessions(&self) -> AgidResult<Vec<String>> {
        let mut sessions = Vec::new();
        for item in self.tree(CHAINS_TREE)?.iter() {
            let (key, _) = item?;
            sessions.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(sessions)
    }

    fn save_receipt(&self, receipt: &CommitmentReceipt) -> AgidResult<()> {
        self.put(RECEIPTS_TREE, &receipt.record.session_id, receipt)
    }

    fn load_receipt(&self, session_id: &str) -> AgidResult<Option<CommitmentReceipt>> {
        self.get(RECEIPTS_TREE, session_id)
    }

    fn last_workspace_hash(&self) -> AgidResult<Option<String>> {
        self.get(META_TREE, WORKSPACE_HASH_KEY)
    }

    fn set_workspace_hash(&self, hash: &str) -> AgidResult<()> {
        self.put(META_TREE, WORKSPACE_HASH_KEY, &hash)
    }
}

#[derive(Default)]
pub struct MemoryAnchorStore {
    chains: Mutex<BTreeMap<String, ChainRecord>>,
    receipts: Mutex<HashMap<String, CommitmentReceipt>>,
    workspace_hash: Mutex<Option<String>>,
}

impl MemoryAnchorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AnchorStore for MemoryAnchorStore {
    fn save_chain(&self, record: &ChainRecord) -> AgidResult<()> {
        self.chains
            .safe_lock()?
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    fn load_chain(&self, session_id: &str) -> AgidResult<Option<ChainRecord>> {
        Ok(self.chains.safe_lock()?.get(session_id).cloned())
    }

    fn list_sessions(&self) -> AgidResult<Vec<String>> {
        Ok(self.chains.safe_lock()?.keys().cloned().collect())
    }

    fn save_receipt(&self, receipt: &CommitmentReceipt) -> AgidResult<()> {
        self.receipts
            .safe_lock()?
            .insert(receipt.record.session_id.clone(), receipt.clone());
        Ok(())
    }

    fn load_receipt(&self, session_id: &str) -> AgidResult<Option<CommitmentReceipt>> {
        Ok(self.receipts.safe_lock()?.get(session_id).cloned())
    }

    fn last_workspace_hash(&self) -> AgidResult<Option<String>> {
        Ok(self.workspace_hash.safe_lock()?.clone())
    }

    fn set_workspace_hash(&self, hash: &str) -> AgidResult<()> {
        *self.workspace_hash.safe_lock()? = Some(hash.to_string());
        Ok(())
    }
}
