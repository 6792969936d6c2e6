//! Path-indexed tree of entries
//!
//! - [`EntryTable`] - arena of entries with the path → id index
//! - [`NodeRef`] - read handle handed out to consumers
//! - [`Tree`] - owns the arena and implements [`Tree::reconcile`], the sole
//!   mutation entry point

pub mod entry_table;
pub mod node_ref;
pub mod reconcile;

use std::path::PathBuf;

use thiserror::Error;

use crate::ports::ProbeError;

pub use entry_table::EntryTable;
pub use node_ref::NodeRef;
pub use reconcile::Tree;

/// Errors that can occur while reconciling a single path
///
/// Every variant is transient: the engine retries the path a bounded number
/// of times and then drops it, leaving the node in its last-known state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// The path could not be stat'd because of permissions
    #[error("Transient access denied: {0}")]
    TransientAccessDenied(PathBuf),

    /// The path could not be stat'd for another I/O reason
    #[error("Transient I/O failure on {path}: {message}")]
    TransientIo {
        /// Path that failed
        path: PathBuf,
        /// Underlying error text
        message: String,
    },
}

impl ReconcileError {
    /// Whether a retry may succeed
    pub fn is_transient(&self) -> bool {
        true
    }

    /// Path the failure refers to
    pub fn path(&self) -> &std::path::Path {
        match self {
            ReconcileError::TransientAccessDenied(path) => path,
            ReconcileError::TransientIo { path, .. } => path,
        }
    }
}

impl From<ProbeError> for ReconcileError {
    fn from(err: ProbeError) -> Self {
        match err {
            ProbeError::AccessDenied(path) => ReconcileError::TransientAccessDenied(path),
            ProbeError::Io { path, message } => ReconcileError::TransientIo { path, message },
        }
    }
}
