//! Path differ port (driven/secondary port)
//!
//! Defines the interface the tree uses to learn what a path currently is on
//! disk. Reconciliation never trusts a change notification's payload; it
//! always asks an [`IPathDiffer`] instead.
//!
//! ## Design Notes
//!
//! - Probing is synchronous. Callers running inside an async runtime wrap
//!   reconciliation in `spawn_blocking`.
//! - Permission problems on the *contents* of an entry are part of the
//!   returned [`PathState`] (`accessible = false`), not errors.
//! - [`ProbeError`] is reserved for failures to stat the path itself for a
//!   reason other than non-existence. Those are transient from the engine's
//!   point of view and are retried.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use thiserror::Error;

// ============================================================================
// PathState
// ============================================================================

/// Observation of one immediate file inside a probed directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileProbe {
    /// Leaf name of the file, exactly as stored on disk
    pub name: OsString,
    /// Literal length in bytes (0 when inaccessible)
    pub size: u64,
    /// Whether the file's metadata could be read
    pub accessible: bool,
}

impl FileProbe {
    /// Convenience constructor for an accessible file
    pub fn new(name: impl Into<OsString>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            accessible: true,
        }
    }
}

/// What a path currently denotes on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathState {
    /// Nothing exists at the path
    Missing,
    /// A regular file, or an opaque leaf such as a symlink
    File {
        /// Literal length in bytes (0 when inaccessible)
        size: u64,
        /// Whether the file's metadata could be read
        accessible: bool,
    },
    /// A directory
    Directory {
        /// False when the directory could not be enumerated
        accessible: bool,
        /// Immediate files visible in the directory (empty when inaccessible)
        files: Vec<FileProbe>,
    },
}

impl PathState {
    /// Returns true unless the path is missing
    pub fn exists(&self) -> bool {
        !matches!(self, PathState::Missing)
    }

    /// Returns true for directories
    pub fn is_directory(&self) -> bool {
        matches!(self, PathState::Directory { .. })
    }

    /// Returns true for files
    pub fn is_file(&self) -> bool {
        matches!(self, PathState::File { .. })
    }
}

// ============================================================================
// ProbeError
// ============================================================================

/// Failure to stat a path for a reason other than non-existence
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    /// The path itself could not be stat'd due to permissions
    #[error("Access denied: {0}")]
    AccessDenied(PathBuf),

    /// Any other I/O failure (busy, locked, interrupted, ...)
    #[error("I/O error on {path}: {message}")]
    Io {
        /// Path that failed
        path: PathBuf,
        /// Underlying error text
        message: String,
    },
}

impl ProbeError {
    /// Builds a probe error from an I/O error, classifying permission denials
    pub fn from_io(path: &Path, err: &std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::AccessDenied(path.to_path_buf())
        } else {
            ProbeError::Io {
                path: path.to_path_buf(),
                message: err.to_string(),
            }
        }
    }

    /// Whether the failure may go away on a later attempt
    pub fn is_transient(&self) -> bool {
        // Every probe failure is a snapshot of a moving filesystem.
        true
    }
}

// ============================================================================
// IPathDiffer trait
// ============================================================================

/// Ground-truth oracle for the state of a path
///
/// Implementations must be read-only and thread-safe: several reconciler
/// workers probe concurrently.
pub trait IPathDiffer: Send + Sync {
    /// Inspects `path` and reports what it currently is
    ///
    /// # Errors
    /// Returns [`ProbeError`] when the path cannot be stat'd for a reason
    /// other than not existing
    fn stat(&self, path: &Path) -> Result<PathState, ProbeError>;

    /// Cheap existence check, without enumerating directories
    fn exists(&self, path: &Path) -> bool;
}
