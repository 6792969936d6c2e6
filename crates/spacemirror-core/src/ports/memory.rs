//! In-memory [`IPathDiffer`] for tests and simulations
//!
//! Holds a flat map of paths to entries that tests mutate directly. Parent
//! directories are not created implicitly.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::path_differ::{FileProbe, IPathDiffer, PathState, ProbeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemoryEntry {
    File { size: u64, accessible: bool },
    Directory { accessible: bool },
}

/// Simulated filesystem
#[derive(Debug, Default)]
pub struct MemoryDiffer {
    entries: Mutex<BTreeMap<PathBuf, MemoryEntry>>,
    failures: Mutex<HashMap<PathBuf, u32>>,
}

impl MemoryDiffer {
    /// Creates an empty filesystem
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) an accessible directory
    pub fn add_dir(&self, path: &Path) {
        self.entries()
            .insert(path.to_path_buf(), MemoryEntry::Directory { accessible: true });
    }

    /// Adds (or replaces) an accessible file
    pub fn add_file(&self, path: &Path, size: u64) {
        self.entries().insert(
            path.to_path_buf(),
            MemoryEntry::File {
                size,
                accessible: true,
            },
        );
    }

    /// Removes `path` and everything beneath it
    pub fn remove(&self, path: &Path) {
        self.entries().retain(|p, _| !p.starts_with(path));
    }

    /// Moves `from` and everything beneath it to `to`
    pub fn rename(&self, from: &Path, to: &Path) {
        let mut entries = self.entries();
        let moved: Vec<_> = entries
            .iter()
            .filter(|(p, _)| p.starts_with(from))
            .map(|(p, e)| (p.clone(), *e))
            .collect();
        for (path, entry) in moved {
            entries.remove(&path);
            let suffix = path.strip_prefix(from).unwrap_or(Path::new(""));
            let target = if suffix.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(suffix)
            };
            entries.insert(target, entry);
        }
    }

    /// Changes the length of an existing file
    pub fn set_size(&self, path: &Path, new_size: u64) {
        if let Some(MemoryEntry::File { size, .. }) = self.entries().get_mut(path) {
            *size = new_size;
        }
    }

    /// Marks a directory as (un)enumerable
    pub fn set_dir_accessible(&self, path: &Path, value: bool) {
        if let Some(MemoryEntry::Directory { accessible }) = self.entries().get_mut(path) {
            *accessible = value;
        }
    }

    /// Makes the next `times` probes of `path` fail with an I/O error
    pub fn fail_next(&self, path: &Path, times: u32) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf(), times);
    }

    /// Every path currently present, sorted
    pub fn paths(&self) -> Vec<PathBuf> {
        self.entries().keys().cloned().collect()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<PathBuf, MemoryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_failure(&self, path: &Path) -> bool {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        match failures.get_mut(path) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

impl IPathDiffer for MemoryDiffer {
    fn stat(&self, path: &Path) -> Result<PathState, ProbeError> {
        if self.take_failure(path) {
            return Err(ProbeError::Io {
                path: path.to_path_buf(),
                message: "simulated failure".to_string(),
            });
        }

        let entries = self.entries();
        let state = match entries.get(path) {
            None => PathState::Missing,
            Some(MemoryEntry::File { size, accessible }) => PathState::File {
                size: *size,
                accessible: *accessible,
            },
            Some(MemoryEntry::Directory { accessible: false }) => PathState::Directory {
                accessible: false,
                files: Vec::new(),
            },
            Some(MemoryEntry::Directory { accessible: true }) => {
                let files = entries
                    .iter()
                    .filter(|(p, _)| p.parent() == Some(path))
                    .filter_map(|(p, e)| match e {
                        MemoryEntry::File { size, accessible } => Some(FileProbe {
                            name: p.file_name()?.to_os_string(),
                            size: *size,
                            accessible: *accessible,
                        }),
                        MemoryEntry::Directory { .. } => None,
                    })
                    .collect();
                PathState::Directory {
                    accessible: true,
                    files,
                }
            }
        };
        Ok(state)
    }

    fn exists(&self, path: &Path) -> bool {
        self.entries().contains_key(path)
    }
}
