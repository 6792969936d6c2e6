//! SpaceMirror Sync - Live mirror engine
//!
//! Provides:
//! - A local filesystem implementation of the path differ
//! - Native change notification with per-path coalescing
//! - The engine that drives initial load, watching and reconciliation
//!
//! ## Modules
//!
//! - [`engine`] - Loader, watcher drain and reconciler worker tasks
//! - [`filesystem`] - `LocalPathDiffer`, the ground-truth oracle over `std::fs`
//! - [`watcher`] - `notify` subscription and the drainable change buffer
//! - [`coalescer`] - Per-path folding of change signals
//! - [`queue`] - Deduplicating work queue with a retry lane
//! - [`logging`] - Tracing subscriber setup

pub mod coalescer;
pub mod engine;
pub mod filesystem;
pub mod logging;
pub mod queue;
pub mod watcher;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use spacemirror_core::config::Config;
use spacemirror_core::domain::errors::DomainError;
use spacemirror_core::domain::RootPath;
use spacemirror_core::tree::Tree;
use thiserror::Error;
use tracing::debug;

pub use coalescer::{ChangeCoalescer, ChangeSignal};
pub use engine::{EngineState, EngineStats, SyncEngine};
pub use filesystem::LocalPathDiffer;
pub use watcher::{ChangeDrain, DrainBatch, FileWatcher};

/// Errors surfaced while building or starting an engine
#[derive(Debug, Error)]
pub enum SyncError {
    /// The root does not exist, is not a directory, or cannot be resolved
    #[error("Invalid root {}: {reason}", path.display())]
    InvalidRoot {
        /// Root as given by the caller
        path: PathBuf,
        /// Why it was rejected
        reason: String,
    },

    /// The configuration failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// `start` was called outside a Tokio runtime
    #[error("No Tokio runtime available: {0}")]
    NoRuntime(String),

    /// A domain-level error propagated from spacemirror-core
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),
}

/// Builds an engine mirroring `root` with the local filesystem
///
/// The root is canonicalized, so the tree's paths are the resolved ones.
/// The engine is returned in the `Created` state.
///
/// # Errors
/// - [`SyncError::InvalidConfig`] if `config` fails validation
/// - [`SyncError::InvalidRoot`] if `root` is missing or not a directory
pub fn build(root: impl AsRef<Path>, config: Config) -> Result<SyncEngine, SyncError> {
    let root = root.as_ref();

    let errors = config.validate();
    if !errors.is_empty() {
        let joined = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        return Err(SyncError::InvalidConfig(joined));
    }

    let resolved = std::fs::canonicalize(root).map_err(|e| SyncError::InvalidRoot {
        path: root.to_path_buf(),
        reason: e.to_string(),
    })?;
    if !resolved.is_dir() {
        return Err(SyncError::InvalidRoot {
            path: root.to_path_buf(),
            reason: "not a directory".to_string(),
        });
    }

    let root_path = RootPath::new(resolved)?;
    debug!(root = %root_path, "Building sync engine");
    let tree = Tree::new(root_path, Arc::new(LocalPathDiffer::new()));
    Ok(SyncEngine::new(tree, config))
}

#[cfg(test)]
mod tests {
    use spacemirror_core::config::ConfigBuilder;

    use super::*;

    #[test]
    fn test_build_rejects_missing_root() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope");
        let err = build(&missing, Config::default()).err().unwrap();
        assert!(matches!(err, SyncError::InvalidRoot { ref path, .. } if *path == missing));
    }

    #[test]
    fn test_build_rejects_file_root() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        let err = build(&file, Config::default()).err().unwrap();
        assert_eq!(
            err.to_string(),
            format!("Invalid root {}: not a directory", file.display())
        );
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ConfigBuilder::new().engine_worker_count(0).build();
        let err = build(tmp.path(), config).err().unwrap();
        assert!(matches!(err, SyncError::InvalidConfig(ref msg) if msg.contains("engine.worker_count")));
    }

    #[test]
    fn test_build_starts_in_created_state() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = build(tmp.path(), Config::default()).unwrap();
        assert_eq!(engine.state(), EngineState::Created);
        assert!(!engine.is_loaded());
        assert_eq!(
            engine.tree().root_path().as_path(),
            std::fs::canonicalize(tmp.path()).unwrap()
        );
    }
}
