//! Directory differ: compare a local tree against a remote shadow tree.
//!
//! Only paths present in *both* trees are compared. A file that exists on
//! one side only is not a conflict here: the question being answered is
//! "did remote content I already have locally change", not full set
//! difference.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::errors::DiffError;
use crate::walker::{DirectoryWalker, FileMap};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One file present in both trees whose content differs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryDiffEntry {
    /// Forward-slash path relative to both roots.
    pub relative_path: String,
    /// Absolute path of the local copy.
    pub local_path: PathBuf,
    /// Absolute path of the remote (staged) copy.
    pub remote_path: PathBuf,
}

/// Result of diffing two directory trees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryDiffResults {
    /// Shared paths with differing content, sorted by relative path.
    pub different: Vec<DirectoryDiffEntry>,
    pub local_root: PathBuf,
    pub remote_root: PathBuf,
    /// Number of files visited under the local root.
    pub scanned_local: usize,
    /// Number of files visited under the remote root.
    pub scanned_remote: usize,
}

impl DirectoryDiffResults {
    /// `true` when no shared file differs.
    pub fn is_clean(&self) -> bool {
        self.different.is_empty()
    }

    /// Relative paths of all differing files, in order.
    pub fn relative_paths(&self) -> Vec<&str> {
        self.different
            .iter()
            .map(|e| e.relative_path.as_str())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Differ trait
// ---------------------------------------------------------------------------

/// Strategy for comparing two directory roots.
#[async_trait]
pub trait DirectoryDiffer: Send + Sync {
    async fn diff(
        &self,
        local_root: &Path,
        remote_root: &Path,
    ) -> Result<DirectoryDiffResults, DiffError>;
}

// ---------------------------------------------------------------------------
// Content-hash differ
// ---------------------------------------------------------------------------

/// Compares files by SHA-256 fingerprint of their full content.
#[derive(Debug, Clone, Default)]
pub struct ContentHashDiffer {
    walker: DirectoryWalker,
    /// Sub-directories to compare instead of the whole roots. Empty = whole roots.
    scopes: Vec<String>,
}

impl ContentHashDiffer {
    pub fn new(walker: DirectoryWalker) -> Self {
        Self {
            walker,
            scopes: Vec::new(),
        }
    }

    /// Restrict the comparison to these sub-directories of each root.
    ///
    /// A scope missing on one side counts as zero files on that side.
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    async fn collect(&self, root: &Path) -> Result<FileMap, DiffError> {
        if self.scopes.is_empty() {
            return self.walker.walk(root).await;
        }

        // The root itself is still required; only scopes are optional.
        let metadata = tokio::fs::metadata(root)
            .await
            .map_err(|e| DiffError::io(root, e))?;
        if !metadata.is_dir() {
            return Err(DiffError::NotADirectory(root.display().to_string()));
        }

        let mut merged = FileMap::new();
        for scope in &self.scopes {
            merged.extend(self.walker.walk_scope(root, scope).await?);
        }
        Ok(merged)
    }
}

#[async_trait]
impl DirectoryDiffer for ContentHashDiffer {
    #[instrument(skip(self), fields(local = %local_root.display(), remote = %remote_root.display()))]
    async fn diff(
        &self,
        local_root: &Path,
        remote_root: &Path,
    ) -> Result<DirectoryDiffResults, DiffError> {
        let (local, remote) = tokio::try_join!(self.collect(local_root), self.collect(remote_root))?;

        let different = compare_maps(&local, &remote)
            .into_iter()
            .map(|relative_path| DirectoryDiffEntry {
                local_path: local_root.join(&relative_path),
                remote_path: remote_root.join(&relative_path),
                relative_path,
            })
            .collect::<Vec<_>>();

        for entry in &different {
            debug!(path = %entry.relative_path, "content differs");
        }
        info!(
            scanned_local = local.len(),
            scanned_remote = remote.len(),
            different = different.len(),
            "directory diff complete"
        );

        Ok(DirectoryDiffResults {
            different,
            local_root: local_root.to_path_buf(),
            remote_root: remote_root.to_path_buf(),
            scanned_local: local.len(),
            scanned_remote: remote.len(),
        })
    }
}

/// Relative paths present in both maps with unequal fingerprints, sorted.
fn compare_maps<V: PartialEq>(local: &BTreeMap<String, V>, remote: &BTreeMap<String, V>) -> Vec<String> {
    local
        .iter()
        .filter_map(|(path, local_fp)| match remote.get(path) {
            Some(remote_fp) if remote_fp != local_fp => Some(path.clone()),
            _ => None,
        })
        .collect()
}
