//! Staging area layout and archive extraction.
//!
//! The layout is fixed so the retrieval/convert toolchain finds what it
//! expects:
//!
//! ```text
//! <project>/<tool_dir>/tools/conflicts/            staging root
//! <project>/<tool_dir>/tools/conflicts/package.xml manifest copy
//! <project>/<tool_dir>/tools/conflicts/unpackaged.zip
//! <project>/<tool_dir>/tools/conflicts/unpackaged/ extracted retrieval
//! <project>/<tool_dir>/tools/conflicts/converted/  source-format tree
//! ```

use std::path::{Component, Path, PathBuf};

use tracing::debug;

/// Default tool directory at the project root.
pub const DEFAULT_TOOL_DIR: &str = ".sfdx";

/// Paths of one staging area, derived from the project root on every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingPaths {
    pub root: PathBuf,
    pub manifest: PathBuf,
    /// Archive written by the retrieval step.
    pub archive: PathBuf,
    pub unpackaged: PathBuf,
    pub converted: PathBuf,
}

impl StagingPaths {
    /// Staging layout under `project_root`.
    pub fn new(project_root: &Path, tool_dir: &str) -> Self {
        let root = project_root.join(tool_dir).join("tools").join("conflicts");
        Self {
            manifest: root.join("package.xml"),
            archive: root.join("unpackaged.zip"),
            unpackaged: root.join("unpackaged"),
            converted: root.join("converted"),
            root,
        }
    }

    /// The same layout relative to the project root, as passed on the
    /// toolchain command line (which runs with the project root as cwd).
    pub fn relative(tool_dir: &str) -> Self {
        Self::new(Path::new(""), tool_dir)
    }

    /// `true` when the project-relative `package_dir` contains the staging
    /// root or lies inside it. Either way the local walk would see staging
    /// files, and cleanup would delete local sources.
    pub fn overlaps(package_dir: &Path, tool_dir: &str) -> bool {
        let package_dir: PathBuf = package_dir
            .components()
            .filter(|c| !matches!(c, Component::CurDir))
            .collect();
        let staging_root = Self::relative(tool_dir).root;
        staging_root.starts_with(&package_dir) || package_dir.starts_with(&staging_root)
    }
}

// ---------------------------------------------------------------------------
// Archive extraction
// ---------------------------------------------------------------------------

/// Unpacks the retrieval archive into the staging root.
pub trait ArchiveExtractor: Send + Sync {
    fn extract(&self, archive: &Path, destination: &Path) -> Result<(), String>;
}

/// Default extractor for the zip archives produced by metadata retrieval.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipExtractor;

impl ArchiveExtractor for ZipExtractor {
    fn extract(&self, archive: &Path, destination: &Path) -> Result<(), String> {
        let file = std::fs::File::open(archive)
            .map_err(|e| format!("cannot open {}: {}", archive.display(), e))?;
        let mut zip = zip::ZipArchive::new(file).map_err(|e| e.to_string())?;
        let entries = zip.len();
        zip.extract(destination).map_err(|e| e.to_string())?;
        debug!(
            archive = %archive.display(),
            destination = %destination.display(),
            entries,
            "archive extracted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_overlaps_detects_nesting_both_ways() {
        assert!(StagingPaths::overlaps(Path::new("."), ".sfdx"));
        assert!(StagingPaths::overlaps(Path::new("./"), ".sfdx"));
        assert!(StagingPaths::overlaps(Path::new(".sfdx"), ".sfdx"));
        assert!(StagingPaths::overlaps(Path::new(".sfdx/tools"), ".sfdx"));
        assert!(StagingPaths::overlaps(Path::new(".sfdx/tools/conflicts/converted"), ".sfdx"));

        assert!(!StagingPaths::overlaps(Path::new("force-app"), ".sfdx"));
        assert!(!StagingPaths::overlaps(Path::new("./force-app"), ".sfdx"));
        assert!(!StagingPaths::overlaps(Path::new(".sfdx/other"), ".sfdx"));
        assert!(!StagingPaths::overlaps(Path::new(".sfdx-app"), ".sfdx"));
    }

    #[test]
    fn test_layout_is_bit_exact() {
        let paths = StagingPaths::new(Path::new("/work/proj"), ".sfdx");
        assert_eq!(paths.root, PathBuf::from("/work/proj/.sfdx/tools/conflicts"));
        assert_eq!(
            paths.manifest,
            PathBuf::from("/work/proj/.sfdx/tools/conflicts/package.xml")
        );
        assert_eq!(
            paths.archive,
            PathBuf::from("/work/proj/.sfdx/tools/conflicts/unpackaged.zip")
        );
        assert_eq!(
            paths.unpackaged,
            PathBuf::from("/work/proj/.sfdx/tools/conflicts/unpackaged")
        );
        assert_eq!(
            paths.converted,
            PathBuf::from("/work/proj/.sfdx/tools/conflicts/converted")
        );
    }

    #[test]
    fn test_relative_layout() {
        let paths = StagingPaths::relative(".sfdx");
        assert_eq!(paths.root, Path::new(".sfdx").join("tools").join("conflicts"));
        assert!(paths.manifest.is_relative());
    }

    #[test]
    fn test_zip_extractor_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("unpackaged.zip");
        {
            let file = std::fs::File::create(&archive).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("unpackaged/package.xml", options).unwrap();
            writer.write_all(b"<Package/>").unwrap();
            writer.start_file("unpackaged/classes/Foo.cls", options).unwrap();
            writer.write_all(b"class Foo").unwrap();
            writer.finish().unwrap();
        }

        ZipExtractor.extract(&archive, dir.path()).unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("unpackaged/classes/Foo.cls")).unwrap(),
            "class Foo"
        );
    }

    #[test]
    fn test_zip_extractor_missing_archive() {
        let dir = tempfile::tempdir().unwrap();
        let err = ZipExtractor
            .extract(&dir.path().join("unpackaged.zip"), dir.path())
            .unwrap_err();
        assert!(err.contains("cannot open"));
    }

    #[test]
    fn test_zip_extractor_corrupt_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("unpackaged.zip");
        std::fs::write(&archive, b"definitely not a zip").unwrap();
        assert!(ZipExtractor.extract(&archive, dir.path()).is_err());
    }
}
