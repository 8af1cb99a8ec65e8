//! Conflict detector: the pipeline that stages a shadow copy of remote
//! metadata and diffs it against the local package directory.
//!
//! Each run walks a fixed state machine:
//!
//! 1. Create the staging area and copy the manifest into it.
//! 2. Retrieve remote metadata (external step, cancellable).
//! 3. Extract the retrieved archive.
//! 4. Convert it to source format (external step, cancellable).
//! 5. Diff the local package directory against the converted tree.
//! 6. Remove the staging area (best effort, also after failures).
//!
//! Runs for the same project root share a staging directory, so the
//! detector admits at most one in-flight run per project root.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{AppConfig, ConflictDetectionConfig};
use crate::differ::{ContentHashDiffer, DirectoryDiffResults, DirectoryDiffer};
use crate::errors::ConflictDetectionError;
use crate::staging::{ArchiveExtractor, StagingPaths, ZipExtractor, DEFAULT_TOOL_DIR};
use crate::toolchain::{CliToolchain, StepCompletion, ToolchainAdapter, ToolchainStep};
use crate::walker::DirectoryWalker;

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// States of a conflict detection run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DetectionState {
    Idle,
    StagingCreated,
    Retrieved,
    Unpacked,
    Converted,
    Diffed,
    CleanedUp,
    Failed,
    Cancelled,
}

impl std::fmt::Display for DetectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::StagingCreated => write!(f, "staging_created"),
            Self::Retrieved => write!(f, "retrieved"),
            Self::Unpacked => write!(f, "unpacked"),
            Self::Converted => write!(f, "converted"),
            Self::Diffed => write!(f, "diffed"),
            Self::CleanedUp => write!(f, "cleaned_up"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Ordered record of the states one run passed through.
#[derive(Debug, Clone, Default)]
struct StateTrail(Vec<DetectionState>);

impl StateTrail {
    fn new() -> Self {
        Self(vec![DetectionState::Idle])
    }

    fn current(&self) -> DetectionState {
        self.0.last().copied().unwrap_or(DetectionState::Idle)
    }

    fn advance(&mut self, next: DetectionState) {
        debug!(from = %self.current(), to = %next, "detection state transition");
        self.0.push(next);
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Successful outcome of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictReport {
    pub run_id: Uuid,
    pub diff: DirectoryDiffResults,
    /// Completion records of the external steps, in execution order.
    pub steps: Vec<StepCompletion>,
    /// Set when removing the staging area failed. Never a run failure.
    pub cleanup_error: Option<String>,
    /// States visited, from `idle` to `cleaned_up`.
    pub transitions: Vec<DetectionState>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl ConflictReport {
    /// `true` when at least one shared file differs.
    pub fn has_conflicts(&self) -> bool {
        !self.diff.is_clean()
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Orchestrates retrieval, conversion, and diffing for a project.
///
/// Cheap to share behind an `Arc`; concurrent runs for different project
/// roots proceed independently.
pub struct ConflictDetector {
    toolchain: Arc<dyn ToolchainAdapter>,
    differ: Arc<dyn DirectoryDiffer>,
    extractor: Arc<dyn ArchiveExtractor>,
    tool_dir: String,
    /// Project roots with a run in flight.
    active: Arc<Mutex<HashSet<PathBuf>>>,
}

impl ConflictDetector {
    /// Create a detector with the default zip extractor and tool directory.
    pub fn new(toolchain: Arc<dyn ToolchainAdapter>, differ: Arc<dyn DirectoryDiffer>) -> Self {
        Self {
            toolchain,
            differ,
            extractor: Arc::new(ZipExtractor),
            tool_dir: DEFAULT_TOOL_DIR.to_string(),
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Production wiring: CLI toolchain plus a content-hash differ tuned
    /// from the `[toolchain]` and `[diff]` sections.
    pub fn from_config(config: &AppConfig) -> Self {
        let walker = DirectoryWalker::new(config.diff.max_concurrent_hashes)
            .with_ignore_patterns(config.diff.ignore_patterns.clone());
        let differ = ContentHashDiffer::new(walker).with_scopes(config.diff.scopes.clone());
        Self::new(
            Arc::new(CliToolchain::new(config.toolchain.binary.clone())),
            Arc::new(differ),
        )
        .with_tool_dir(config.toolchain.tool_dir.clone())
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn ArchiveExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_tool_dir(mut self, tool_dir: impl Into<String>) -> Self {
        self.tool_dir = tool_dir.into();
        self
    }

    /// Staging layout this detector uses for `project_root`.
    pub fn staging_paths(&self, project_root: &Path) -> StagingPaths {
        StagingPaths::new(project_root, &self.tool_dir)
    }

    /// Run the full pipeline for `project_root`.
    ///
    /// `cancel` is observed while an external step is outstanding; the diff
    /// itself always runs to completion once started. The staging area is
    /// removed before returning, whatever the outcome.
    pub async fn check_for_conflicts(
        &self,
        project_root: &Path,
        config: &ConflictDetectionConfig,
        cancel: CancellationToken,
    ) -> Result<ConflictReport, ConflictDetectionError> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "check_for_conflicts",
            %run_id,
            project = %project_root.display(),
            username = config.target_username()
        );
        self.check_for_conflicts_inner(run_id, project_root, config, &cancel)
            .instrument(span)
            .await
    }

    async fn check_for_conflicts_inner(
        &self,
        run_id: Uuid,
        project_root: &Path,
        config: &ConflictDetectionConfig,
        cancel: &CancellationToken,
    ) -> Result<ConflictReport, ConflictDetectionError> {
        let _guard = self.admit(project_root)?;

        let started_at = Utc::now();
        let staging = self.staging_paths(project_root);
        // Checked before anything is created or removed under the staging root.
        if StagingPaths::overlaps(config.package_dir(), &self.tool_dir) {
            let err = ConflictDetectionError::StagingFailed {
                detail: format!(
                    "package dir '{}' overlaps the staging area '{}'",
                    config.package_dir().display(),
                    staging.root.display()
                ),
            };
            error!(stage = err.stage(), error = %err, "conflict detection failed");
            return Err(err);
        }
        let mut trail = StateTrail::new();
        let mut steps = Vec::new();

        info!("starting conflict detection");
        let outcome = self
            .run_pipeline(project_root, config, &staging, cancel, &mut trail, &mut steps)
            .await;

        let cleanup_error = remove_staging(&staging).await;

        match outcome {
            Ok(diff) => {
                trail.advance(DetectionState::CleanedUp);
                info!(
                    conflicts = diff.different.len(),
                    scanned_local = diff.scanned_local,
                    scanned_remote = diff.scanned_remote,
                    "conflict detection finished"
                );
                Ok(ConflictReport {
                    run_id,
                    diff,
                    steps,
                    cleanup_error,
                    transitions: trail.0,
                    started_at,
                    completed_at: Utc::now(),
                })
            }
            Err(err) => {
                if err.is_cancelled() {
                    trail.advance(DetectionState::Cancelled);
                    info!(stage = err.stage(), "conflict detection cancelled");
                } else {
                    trail.advance(DetectionState::Failed);
                    error!(stage = err.stage(), error = %err, "conflict detection failed");
                }
                Err(err)
            }
        }
    }

    async fn run_pipeline(
        &self,
        project_root: &Path,
        config: &ConflictDetectionConfig,
        staging: &StagingPaths,
        cancel: &CancellationToken,
        trail: &mut StateTrail,
        steps: &mut Vec<StepCompletion>,
    ) -> Result<DirectoryDiffResults, ConflictDetectionError> {
        // 1: create the shadow directory and stage the manifest.
        let manifest = project_root.join(config.manifest());
        prepare_staging(&manifest, staging).await?;
        trail.advance(DetectionState::StagingCreated);

        // Command lines use project-relative paths; the toolchain runs in the project root.
        let relative = StagingPaths::relative(&self.tool_dir);

        // 2: retrieve remote metadata into the shadow directory.
        let retrieve = ToolchainStep::Retrieve {
            target_dir: relative.root.clone(),
            manifest: relative.manifest.clone(),
            target_username: config.target_username().to_string(),
        };
        steps.push(self.run_step(&retrieve, project_root, cancel, "retrieve").await?);
        trail.advance(DetectionState::Retrieved);

        // 3: unpack the retrieved archive.
        self.unpack(staging).await?;
        trail.advance(DetectionState::Unpacked);

        // 4: convert to source format.
        let convert = ToolchainStep::Convert {
            root_dir: relative.unpackaged.clone(),
            output_dir: relative.converted.clone(),
        };
        steps.push(self.run_step(&convert, project_root, cancel, "convert").await?);
        trail.advance(DetectionState::Converted);

        // 5: diff local package dir against the converted remote tree.
        let local_root = project_root.join(config.package_dir());
        let diff = self.differ.diff(&local_root, &staging.converted).await?;
        trail.advance(DetectionState::Diffed);

        Ok(diff)
    }

    async fn run_step(
        &self,
        step: &ToolchainStep,
        project_root: &Path,
        cancel: &CancellationToken,
        stage: &str,
    ) -> Result<StepCompletion, ConflictDetectionError> {
        debug!(step = step.log_name(), "{}", step.description());
        let completion = self
            .toolchain
            .run(step, project_root, cancel)
            .await
            .map_err(|e| ConflictDetectionError::from_toolchain(e, step.log_name(), stage))?;
        info!(
            step = %completion.log_name,
            elapsed_ms = completion.elapsed.as_millis() as u64,
            exit_code = completion.exit_code,
            "external step finished"
        );
        Ok(completion)
    }

    async fn unpack(&self, staging: &StagingPaths) -> Result<(), ConflictDetectionError> {
        let archive = staging.archive.clone();
        let archive_display = archive.display().to_string();

        if !tokio::fs::try_exists(&archive).await.unwrap_or(false) {
            return Err(ConflictDetectionError::UnpackFailed {
                archive: archive_display,
                detail: "retrieval produced no archive".into(),
            });
        }

        let extractor = self.extractor.clone();
        let destination = staging.root.clone();
        tokio::task::spawn_blocking(move || extractor.extract(&archive, &destination))
            .await
            .map_err(|e| ConflictDetectionError::UnpackFailed {
                archive: archive_display.clone(),
                detail: e.to_string(),
            })?
            .map_err(|detail| ConflictDetectionError::UnpackFailed {
                archive: archive_display,
                detail,
            })
    }

    /// Reserve `project_root` for this run, or fail if one is in flight.
    fn admit(&self, project_root: &Path) -> Result<ActiveRunGuard, ConflictDetectionError> {
        let key = std::fs::canonicalize(project_root).unwrap_or_else(|_| project_root.to_path_buf());
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        if !active.insert(key.clone()) {
            warn!(project = %key.display(), "rejecting concurrent run for the same project");
            return Err(ConflictDetectionError::AlreadyRunning {
                project_root: key.display().to_string(),
            });
        }
        Ok(ActiveRunGuard {
            active: self.active.clone(),
            key,
        })
    }
}

/// Create (or recreate) the staging root and copy the manifest into it.
async fn prepare_staging(
    manifest: &Path,
    staging: &StagingPaths,
) -> Result<(), ConflictDetectionError> {
    let staging_failed = |detail: String| ConflictDetectionError::StagingFailed { detail };

    // Leftovers from an interrupted run would leak into the converted tree.
    match tokio::fs::remove_dir_all(&staging.root).await {
        Ok(()) => debug!(path = %staging.root.display(), "removed stale staging area"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(staging_failed(format!(
                "cannot clear '{}': {}",
                staging.root.display(),
                e
            )))
        }
    }

    tokio::fs::create_dir_all(&staging.root).await.map_err(|e| {
        staging_failed(format!("cannot create '{}': {}", staging.root.display(), e))
    })?;
    tokio::fs::copy(manifest, &staging.manifest).await.map_err(|e| {
        staging_failed(format!(
            "cannot copy manifest '{}' to '{}': {}",
            manifest.display(),
            staging.manifest.display(),
            e
        ))
    })?;

    debug!(manifest = %staging.manifest.display(), "staging area ready");
    Ok(())
}

/// Best-effort removal of the staging root. Returns the failure, if any.
async fn remove_staging(staging: &StagingPaths) -> Option<String> {
    match tokio::fs::remove_dir_all(&staging.root).await {
        Ok(()) => {
            debug!(path = %staging.root.display(), "staging area removed");
            None
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            let detail = format!("cannot remove '{}': {}", staging.root.display(), e);
            warn!(stage = "cleanup", %detail, "failed to clean up staging area");
            Some(detail)
        }
    }
}

/// Releases the project-root reservation on drop, including on panic.
struct ActiveRunGuard {
    active: Arc<Mutex<HashSet<PathBuf>>>,
    key: PathBuf,
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        active.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_state_display() {
        assert_eq!(DetectionState::Idle.to_string(), "idle");
        assert_eq!(DetectionState::StagingCreated.to_string(), "staging_created");
        assert_eq!(DetectionState::Retrieved.to_string(), "retrieved");
        assert_eq!(DetectionState::Unpacked.to_string(), "unpacked");
        assert_eq!(DetectionState::Converted.to_string(), "converted");
        assert_eq!(DetectionState::Diffed.to_string(), "diffed");
        assert_eq!(DetectionState::CleanedUp.to_string(), "cleaned_up");
        assert_eq!(DetectionState::Failed.to_string(), "failed");
        assert_eq!(DetectionState::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_state_trail_starts_idle() {
        let mut trail = StateTrail::new();
        assert_eq!(trail.current(), DetectionState::Idle);
        trail.advance(DetectionState::StagingCreated);
        assert_eq!(trail.current(), DetectionState::StagingCreated);
    }

    #[test]
    fn test_admission_is_per_project_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let detector = ConflictDetector::from_config(&AppConfig::default());

        let guard = detector.admit(dir.path()).unwrap();
        assert!(matches!(
            detector.admit(dir.path()),
            Err(ConflictDetectionError::AlreadyRunning { .. })
        ));
        let _other_guard = detector.admit(other.path()).unwrap();

        drop(guard);
        assert!(detector.admit(dir.path()).is_ok());
    }

    #[tokio::test]
    async fn test_missing_manifest_fails_staging() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingPaths::new(dir.path(), ".sfdx");
        let err = prepare_staging(&dir.path().join("nope.xml"), &staging)
            .await
            .unwrap_err();
        assert!(matches!(err, ConflictDetectionError::StagingFailed { .. }));
    }

    #[tokio::test]
    async fn test_prepare_staging_clears_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("package.xml");
        std::fs::write(&manifest, "<Package/>").unwrap();
        let staging = StagingPaths::new(dir.path(), ".sfdx");
        std::fs::create_dir_all(staging.converted.join("main")).unwrap();
        std::fs::write(staging.converted.join("main/stale.cls"), "old").unwrap();

        prepare_staging(&manifest, &staging).await.unwrap();

        assert!(!staging.converted.exists());
        assert_eq!(std::fs::read_to_string(&staging.manifest).unwrap(), "<Package/>");
    }

    #[tokio::test]
    async fn test_remove_staging_tolerates_absent_root() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingPaths::new(dir.path(), ".sfdx");
        assert!(remove_staging(&staging).await.is_none());
    }
}
