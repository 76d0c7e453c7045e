//! Certificate revocation status
//!
//! A certificate is revoked by spending its revocation outpoint on the
//! external ledger. The checker answers "has this outpoint been spent?".
//!
//! Operators feed the in-process registry through a revocation list file:
//! one outpoint per line, `#` starts a comment. The file is read at startup
//! and re-read while serving, so `agidentity revoke` takes effect without a
//! restart.

use crate::errors::{AgidError, AgidResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationStatus {
    NotRevoked,
    Revoked,
}

/// What to do when the revocation service cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RevocationPolicy {
    /// Deny the sender.
    #[default]
    FailClosed,
    /// Admit the sender and log a warning. Explicit opt-in only.
    FailOpen,
}

#[async_trait]
pub trait RevocationChecker: Send + Sync {
    /// Look up the outpoint. `Err` means the service could not answer.
    async fn check(&self, outpoint: &str) -> AgidResult<RevocationStatus>;
}

/// In-process registry of spent outpoints.
#[derive(Debug, Default)]
pub struct MemoryRevocationRegistry {
    spent: RwLock<HashSet<String>>,
    unreachable: AtomicBool,
    lookups: AtomicUsize,
}

impl MemoryRevocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded from a revocation list file. A missing file is an
    /// empty list.
    pub fn from_file(path: &Path) -> AgidResult<Self> {
        let spent = match std::fs::read_to_string(path) {
            Ok(raw) => parse_outpoints(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "revocation list not found; starting empty");
                HashSet::new()
            }
            Err(e) => return Err(AgidError::io("read revocation list", e)),
        };
        info!(path = %path.display(), count = spent.len(), "revocation list loaded");
        Ok(Self {
            spent: RwLock::new(spent),
            ..Self::default()
        })
    }

    /// Merge the outpoints currently listed in `path`. Returns how many
    /// were new. Spent outpoints are never un-spent, so entries removed
    /// from the file stay revoked.
    pub async fn reload_file(&self, path: &Path) -> AgidResult<usize> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(AgidError::io("read revocation list", e)),
        };
        let listed = parse_outpoints(&raw);
        let mut spent = self.spent.write().await;
        let before = spent.len();
        spent.extend(listed);
        let added = spent.len() - before;
        if added > 0 {
            info!(path = %path.display(), added, "revocation list reloaded");
        }
        Ok(added)
    }

    /// Re-read `path` every `interval` until the handle is aborted.
    pub fn spawn_file_watch(self: &Arc<Self>, path: PathBuf, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = registry.reload_file(&path).await {
                    warn!(error = %e, path = %path.display(), "revocation list reload failed");
                }
            }
        })
    }

    pub async fn revoke(&self, outpoint: &str) {
        self.spent.write().await.insert(outpoint.to_string());
        info!(outpoint = %outpoint, "revocation outpoint spent");
    }

    /// Simulate the service being down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of lookups answered or attempted so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

fn parse_outpoints(raw: &str) -> HashSet<String> {
    raw.lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Append `outpoint` to the revocation list at `path`, creating it if needed.
pub fn append_revocation(path: &Path, outpoint: &str) -> AgidResult<()> {
    let outpoint = outpoint.trim();
    if outpoint.is_empty() || outpoint.contains(char::is_whitespace) || outpoint.contains('#') {
        return Err(AgidError::validation(
            "revocation_outpoint",
            "expected a single outpoint without whitespace or '#'",
        ));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| AgidError::io("create revocation list dir", e))?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| AgidError::io("open revocation list", e))?;
    writeln!(file, "{outpoint}").map_err(|e| AgidError::io("append revocation list", e))?;
    debug!(outpoint = %outpoint, path = %path.display(), "outpoint appended to revocation list");
    Ok(())
}

#[async_trait]
impl RevocationChecker for MemoryRevocationRegistry {
    async fn check(&self, outpoint: &str) -> AgidResult<RevocationStatus> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(AgidError::transport(
                "revocation.check",
                "revocation service unreachable",
            ));
        }
        if outpoint.is_empty() {
            return Err(AgidError::validation("revocation_outpoint", "empty outpoint"));
        }
        if self.spent.read().await.contains(outpoint) {
            Ok(RevocationStatus::Revoked)
        } else {
            Ok(RevocationStatus::NotRevoked)
        }
    }
}
