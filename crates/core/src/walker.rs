//! Recursive directory enumeration into a `relative path -> fingerprint` map.
//!
//! Enumeration runs on the blocking pool via `walkdir`; hashing is fanned out
//! across a bounded set of blocking tasks. Results are keyed by path, so the
//! order in which hashes complete does not matter.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::errors::DiffError;
use crate::hash::{fingerprint, Fingerprint};

/// Default upper bound on files hashed at the same time.
pub const DEFAULT_MAX_CONCURRENT_HASHES: usize = 8;

/// Forward-slash relative path -> content fingerprint.
pub type FileMap = BTreeMap<String, Fingerprint>;

/// Walks a directory tree and fingerprints every regular file in it.
///
/// Symlinks are never followed and never reported. Hidden files are included.
#[derive(Debug, Clone)]
pub struct DirectoryWalker {
    max_concurrent_hashes: usize,
    /// Glob patterns matched against the forward-slash relative path.
    ignore_patterns: Vec<String>,
}

impl Default for DirectoryWalker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT_HASHES)
    }
}

impl DirectoryWalker {
    /// Create a walker hashing at most `max_concurrent_hashes` files at once
    /// (clamped to at least 1).
    pub fn new(max_concurrent_hashes: usize) -> Self {
        Self {
            max_concurrent_hashes: max_concurrent_hashes.max(1),
            ignore_patterns: Vec::new(),
        }
    }

    /// Skip files whose relative path matches any of `patterns`.
    pub fn with_ignore_patterns(mut self, patterns: Vec<String>) -> Self {
        self.ignore_patterns = patterns;
        self
    }

    pub fn max_concurrent_hashes(&self) -> usize {
        self.max_concurrent_hashes
    }

    /// Walk `root` and fingerprint every regular file beneath it.
    ///
    /// Fails with [`DiffError::Io`] (kind `NotFound`) if `root` does not
    /// exist and with [`DiffError::NotADirectory`] if it is not a directory.
    /// An existing empty directory yields an empty map.
    #[instrument(skip(self), fields(root = %root.display()))]
    pub async fn walk(&self, root: &Path) -> Result<FileMap, DiffError> {
        self.walk_prefixed(root, "").await
    }

    /// Walk the sub-directory `scope` of `root`, keyed relative to `root`.
    ///
    /// Keys and ignore patterns both use the `root`-relative form
    /// (`<scope>/<path>`), so a pattern matches the same files whether or
    /// not the tree is walked by scope. A missing scope counts as zero
    /// files (e.g. a metadata type folder that only exists remotely).
    #[instrument(skip(self), fields(root = %root.display()))]
    pub async fn walk_scope(&self, root: &Path, scope: &str) -> Result<FileMap, DiffError> {
        let scope = scope.trim_matches('/');
        let dir = root.join(scope);
        match tokio::fs::metadata(&dir).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(scope, "scope absent, treating as empty");
                Ok(FileMap::new())
            }
            _ => self.walk_prefixed(&dir, scope).await,
        }
    }

    async fn walk_prefixed(&self, dir: &Path, prefix: &str) -> Result<FileMap, DiffError> {
        let metadata = tokio::fs::metadata(dir)
            .await
            .map_err(|e| DiffError::io(dir, e))?;
        if !metadata.is_dir() {
            return Err(DiffError::NotADirectory(dir.display().to_string()));
        }

        let owned_dir = dir.to_path_buf();
        let prefix = prefix.to_string();
        let patterns = self.ignore_patterns.clone();
        let files = tokio::task::spawn_blocking(move || list_files(&owned_dir, &prefix, &patterns))
            .await
            .map_err(|e| DiffError::TaskFailed(e.to_string()))??;

        debug!(files = files.len(), "enumerated files");
        self.hash_all(files).await
    }

    async fn hash_all(&self, files: Vec<(String, PathBuf)>) -> Result<FileMap, DiffError> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_hashes));
        let mut tasks = JoinSet::new();

        for (relative, absolute) in files {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| DiffError::TaskFailed(e.to_string()))?;
            tasks.spawn_blocking(move || {
                let _permit = permit;
                fingerprint(&absolute).map(|fp| (relative, fp))
            });
        }

        let mut map = FileMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (relative, fp) = joined.map_err(|e| DiffError::TaskFailed(e.to_string()))??;
            map.insert(relative, fp);
        }
        Ok(map)
    }
}

/// Enumerate regular files under `root` as `(key, absolute)` pairs, where
/// the key is the relative path behind `prefix`.
fn list_files(
    root: &Path,
    prefix: &str,
    ignore_patterns: &[String],
) -> Result<Vec<(String, PathBuf)>, DiffError> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(walk_error)?;
        // Directories and symlinks are not entries.
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| DiffError::Walk(e.to_string()))?;
        let relative = match (prefix, normalize_relative(relative)) {
            ("", relative) => relative,
            (prefix, relative) => format!("{}/{}", prefix, relative),
        };

        if let Some(pattern) = ignore_patterns
            .iter()
            .find(|p| glob_match::glob_match(p, &relative))
        {
            debug!(path = %relative, pattern = %pattern, "ignored by pattern");
            continue;
        }

        files.push((relative, entry.into_path()));
    }

    Ok(files)
}

/// Join path components with `/` regardless of the platform separator.
pub fn normalize_relative(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn walk_error(err: walkdir::Error) -> DiffError {
    let path = err
        .path()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    match err.into_io_error() {
        Some(source) => DiffError::Io { path, source },
        None => DiffError::Walk(format!("filesystem loop at '{}'", path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn test_walk_nested_tree() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main/default/classes/Foo.cls", "class Foo");
        write(dir.path(), "main/default/classes/Foo.cls-meta.xml", "<meta/>");
        write(dir.path(), "README.md", "readme");

        let map = DirectoryWalker::default().walk(dir.path()).await.unwrap();

        let keys: Vec<&str> = map.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "README.md",
                "main/default/classes/Foo.cls",
                "main/default/classes/Foo.cls-meta.xml",
            ]
        );
        assert_eq!(
            map["README.md"],
            Fingerprint::from_bytes(b"readme")
        );
    }

    #[tokio::test]
    async fn test_hidden_files_included() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), ".forceignore", "**/jsconfig.json");
        write(dir.path(), "lwc/.eslintrc.json", "{}");

        let map = DirectoryWalker::default().walk(dir.path()).await.unwrap();
        assert!(map.contains_key(".forceignore"));
        assert!(map.contains_key("lwc/.eslintrc.json"));
    }

    #[tokio::test]
    async fn test_directories_are_not_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("empty/nested")).unwrap();

        let map = DirectoryWalker::default().walk(dir.path()).await.unwrap();
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_nonexistent_root_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = DirectoryWalker::default()
            .walk(&dir.path().join("missing"))
            .await
            .unwrap_err();
        assert_eq!(err.io_kind(), Some(std::io::ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn test_empty_root_yields_empty_map() {
        let dir = tempfile::tempdir().unwrap();
        let map = DirectoryWalker::default().walk(dir.path()).await.unwrap();
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_file_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "file.txt", "x");
        let err = DirectoryWalker::default()
            .walk(&dir.path().join("file.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, DiffError::NotADirectory(_)));
    }

    #[tokio::test]
    async fn test_walk_scope_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let map = DirectoryWalker::default()
            .walk_scope(dir.path(), "objects")
            .await
            .unwrap();
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_walk_scope_keys_are_root_relative() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main/objects/Account.object", "<o/>");
        let map = DirectoryWalker::default()
            .walk_scope(dir.path(), "main/objects/")
            .await
            .unwrap();
        let keys: Vec<&str> = map.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["main/objects/Account.object"]);
    }

    #[tokio::test]
    async fn test_walk_scope_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "objects", "not a dir");
        let err = DirectoryWalker::default()
            .walk_scope(dir.path(), "objects")
            .await
            .unwrap_err();
        assert!(matches!(err, DiffError::NotADirectory(_)));
    }

    #[tokio::test]
    async fn test_ignore_patterns_match_root_relative_path_in_scope() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main/default/lwc/x.js", "x");
        write(dir.path(), "main/default/classes/A.cls", "a");

        let walker =
            DirectoryWalker::default().with_ignore_patterns(vec!["main/default/lwc/**".into()]);
        let whole = walker.walk(dir.path()).await.unwrap();
        let scoped = walker.walk_scope(dir.path(), "main/default").await.unwrap();

        assert_eq!(whole.keys().collect::<Vec<_>>(), scoped.keys().collect::<Vec<_>>());
        assert!(!scoped.contains_key("main/default/lwc/x.js"));
        assert!(scoped.contains_key("main/default/classes/A.cls"));
    }

    #[tokio::test]
    async fn test_ignore_patterns() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "classes/Foo.cls", "a");
        write(dir.path(), "lwc/jsconfig.json", "{}");

        let walker = DirectoryWalker::new(2).with_ignore_patterns(vec!["**/jsconfig.json".into()]);
        let map = walker.walk(dir.path()).await.unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("classes/Foo.cls"));
    }

    #[tokio::test]
    async fn test_single_worker_hashes_everything() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..25 {
            write(dir.path(), &format!("f{i}.txt"), &format!("content {i}"));
        }
        let walker = DirectoryWalker::new(0);
        assert_eq!(walker.max_concurrent_hashes(), 1);
        let map = walker.walk(dir.path()).await.unwrap();
        assert_eq!(map.len(), 25);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "real/a.txt", "a");
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("loop")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("real/a.txt"), dir.path().join("link.txt"))
            .unwrap();

        let map = DirectoryWalker::default().walk(dir.path()).await.unwrap();
        let keys: Vec<&str> = map.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["real/a.txt"]);
    }

    #[test]
    fn test_normalize_relative_uses_forward_slashes() {
        let rel = Path::new("main").join("default").join("Foo.cls");
        assert_eq!(normalize_relative(&rel), "main/default/Foo.cls");
    }
}
