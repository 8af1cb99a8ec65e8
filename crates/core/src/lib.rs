//! shadowdiff core library.
//!
//! Detects whether remote metadata has diverged from the local project
//! before a push: it retrieves the remote copy into a disposable staging
//! area through an external toolchain, converts it to source format, and
//! diffs it file by file against the local package directory.

pub mod config;
pub mod detector;
pub mod differ;
pub mod errors;
pub mod hash;
pub mod staging;
pub mod toolchain;
pub mod walker;

// Re-exports for convenience.
pub use config::{AppConfig, ConflictDetectionConfig};
pub use detector::{ConflictDetector, ConflictReport, DetectionState};
pub use differ::{ContentHashDiffer, DirectoryDiffEntry, DirectoryDiffResults, DirectoryDiffer};
pub use errors::{ConflictDetectionError, CoreError, DiffError, ToolchainError};
pub use toolchain::{CliToolchain, StepCompletion, ToolchainAdapter, ToolchainStep};
pub use tokio_util::sync::CancellationToken;
