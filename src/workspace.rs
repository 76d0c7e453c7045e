//! Deterministic workspace hashing
//!
//! The hash covers every regular file under the root, visited in sorted
//! relative-path order. Each file contributes its `/`-separated relative
//! path, a zero byte, its length as big-endian u64 and its contents, so
//! renames and content moves between files both change the result.

use crate::anchor_store::AnchorStore;
use crate::errors::{AgidError, AgidResult};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub fn hash_workspace(root: &Path) -> AgidResult<String> {
    let mut files = Vec::new();
    collect_files(root, root, &mut files)?;
    files.sort();

    let mut hasher = Sha256::new();
    for relative in &files {
        let contents =
            fs::read(root.join(relative)).map_err(|e| AgidError::io("workspace.read", e))?;
        hasher.update(relative.as_bytes());
        hasher.update([0u8]);
        hasher.update((contents.len() as u64).to_be_bytes());
        hasher.update(&contents);
    }
    debug!(root = %root.display(), files = files.len(), "hashed workspace");
    Ok(hex::encode(hasher.finalize()))
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> AgidResult<()> {
    for entry in fs::read_dir(dir).map_err(|e| AgidError::io("workspace.read_dir", e))? {
        let entry = entry.map_err(|e| AgidError::io("workspace.read_dir", e))?;
        let file_type = entry.file_type().map_err(|e| AgidError::io("workspace.file_type", e))?;
        let path = entry.path();
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            out.push(relative_path(root, &path)?);
        }
    }
    Ok(())
}

fn relative_path(root: &Path, path: &Path) -> AgidResult<String> {
    let relative: PathBuf = path
        .strip_prefix(root)
        .map_err(|e| AgidError::internal(format!("workspace path outside root: {e}")))?
        .to_path_buf();
    Ok(relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/"))
}

/// Result of comparing the workspace with the last committed hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceCheck {
    pub current_hash: String,
    pub previous_hash: Option<String>,
}

impl WorkspaceCheck {
    pub fn is_mismatch(&self) -> bool {
        matches!(&self.previous_hash, Some(prev) if *prev != self.current_hash)
    }

    /// Line added to the reasoning context when the workspace changed
    /// outside a committed session.
    pub fn warning(&self) -> Option<String> {
        match &self.previous_hash {
            Some(prev) if *prev != self.current_hash => Some(format!(
                "WARNING: workspace integrity check failed. \
                 Last committed hash {prev}, current hash {}. \
                 Files may have been modified outside an agent session.",
                self.current_hash
            )),
            _ => None,
        }
    }
}

/// Watches one workspace directory against the store's last committed hash.
pub struct WorkspaceMonitor {
    root: PathBuf,
}

impl WorkspaceMonitor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn check(&self, store: &dyn AnchorStore) -> AgidResult<WorkspaceCheck> {
        let current_hash = hash_workspace(&self.root)?;
        let previous_hash = store.last_workspace_hash()?;
        let check = WorkspaceCheck {
            current_hash,
            previous_hash,
        };
        if check.is_mismatch() {
            warn!(root = %self.root.display(), "workspace hash differs from last commitment");
        }
        Ok(check)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor_store::MemoryAnchorStore;
    use tempfile::TempDir;

    #[test]
    fn test_hash_is_order_independent_and_content_sensitive() {
        let a = TempDir::new().unwrap();
        fs::create_dir_all(a.path().join("notes")).unwrap();
        fs::write(a.path().join("notes/b.txt"), "beta").unwrap();
        fs::write(a.path().join("a.txt"), "alpha").unwrap();

        let b = TempDir::new().unwrap();
        fs::write(b.path().join("a.txt"), "alpha").unwrap();
        fs::create_dir_all(b.path().join("notes")).unwrap();
        fs::write(b.path().join("notes/b.txt"), "beta").unwrap();

        let hash_a = hash_workspace(a.path()).unwrap();
        assert_eq!(hash_a, hash_workspace(b.path()).unwrap());

        fs::write(b.path().join("notes/b.txt"), "gamma").unwrap();
        assert_ne!(hash_a, hash_workspace(b.path()).unwrap());
    }

    #[test]
    fn test_monitor_reports_mismatch_against_store() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("memory.md"), "v1").unwrap();
        let store = MemoryAnchorStore::new();
        let monitor = WorkspaceMonitor::new(dir.path());

        let first = monitor.check(&store).unwrap();
        assert!(!first.is_mismatch());
        assert!(first.warning().is_none());
        store.set_workspace_hash(&first.current_hash).unwrap();

        assert!(!monitor.check(&store).unwrap().is_mismatch());

        fs::write(dir.path().join("memory.md"), "v2").unwrap();
        let changed = monitor.check(&store).unwrap();
        assert!(changed.is_mismatch());
        assert!(changed.warning().unwrap().contains("integrity"));
    }
}
