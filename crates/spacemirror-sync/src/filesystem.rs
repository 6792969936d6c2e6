//! Local filesystem adapter (secondary/driven adapter)
//!
//! Implements [`IPathDiffer`] on top of `std::fs`.
//!
//! ## Design Decisions
//!
//! - **No symlink following**: every probe uses `symlink_metadata`, and a
//!   symlink is reported as an opaque, inaccessible, zero-sized file.
//! - **Blocking I/O**: probes are synchronous. The engine runs them on the
//!   blocking pool via `spawn_blocking`.
//! - **Contents vs. path**: failing to enumerate a directory or to read a
//!   child's metadata is reported through the `accessible` flags. Only a
//!   failure to stat the probed path itself becomes a [`ProbeError`].

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use spacemirror_core::ports::{FileProbe, IPathDiffer, PathState, ProbeError};
use tracing::{debug, instrument, trace};

// ============================================================================
// LocalPathDiffer struct
// ============================================================================

/// Adapter that bridges the [`IPathDiffer`] port to the real filesystem.
///
/// This is a zero-sized struct because every probe derives its context from
/// the path argument.
#[derive(Debug, Clone, Default)]
pub struct LocalPathDiffer;

impl LocalPathDiffer {
    /// Create a new `LocalPathDiffer`.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

/// Lists the immediate files of `dir`, or `None` if it cannot be enumerated
fn list_files(dir: &Path) -> Option<Vec<FileProbe>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(path = %dir.display(), error = %e, "Directory not enumerable");
            return None;
        }
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                trace!(path = %dir.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        let name = entry.file_name();

        // DirEntry::file_type does not follow symlinks
        let probe = match entry.file_type() {
            Ok(ft) if ft.is_dir() => continue,
            Ok(ft) if ft.is_symlink() => FileProbe {
                name,
                size: 0,
                accessible: false,
            },
            Ok(_) => match entry.metadata() {
                Ok(metadata) => FileProbe::new(name, metadata.len()),
                Err(_) => FileProbe {
                    name,
                    size: 0,
                    accessible: false,
                },
            },
            Err(_) => FileProbe {
                name,
                size: 0,
                accessible: false,
            },
        };
        files.push(probe);
    }
    Some(files)
}

impl IPathDiffer for LocalPathDiffer {
    #[instrument(skip(self), level = "trace", fields(path = %path.display()))]
    fn stat(&self, path: &Path) -> Result<PathState, ProbeError> {
        let metadata = match fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                trace!("path not found");
                return Ok(PathState::Missing);
            }
            Err(e) => return Err(ProbeError::from_io(path, &e)),
        };

        let file_type = metadata.file_type();
        let state = if file_type.is_symlink() {
            PathState::File {
                size: 0,
                accessible: false,
            }
        } else if file_type.is_dir() {
            match list_files(path) {
                Some(files) => PathState::Directory {
                    accessible: true,
                    files,
                },
                None => PathState::Directory {
                    accessible: false,
                    files: Vec::new(),
                },
            }
        } else {
            PathState::File {
                size: metadata.len(),
                accessible: true,
            }
        };

        trace!(state = ?state, "state retrieved");
        Ok(state)
    }

    fn exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).is_ok()
    }
}
