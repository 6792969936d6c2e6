//! Domain newtypes with validation
//!
//! This module provides strongly-typed wrappers for arena identifiers and
//! the mirrored root path. Each newtype ensures data validity at
//! construction time.

use std::fmt::{self, Display, Formatter};
use std::path::{Component, Path, PathBuf};

use super::errors::DomainError;

// ============================================================================
// EntryId
// ============================================================================

/// Stable identifier of a node in the entry arena.
///
/// Ids are allocated monotonically and never reused, so a stale id held by
/// a consumer can only miss, never alias a different node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl EntryId {
    /// Create a new entry id
    pub fn new(val: u64) -> Self {
        EntryId(val)
    }

    /// Get the raw u64 value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for EntryId {
    fn from(val: u64) -> Self {
        EntryId(val)
    }
}

impl From<EntryId> for u64 {
    fn from(id: EntryId) -> Self {
        id.0
    }
}

impl Display for EntryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// RootPath
// ============================================================================

/// The absolute, normalized path of the mirrored directory
///
/// Guarantees:
/// - Absolute
/// - Normalized (no `.` or `..` components)
///
/// Whether the path exists is checked by the engine builder, not here,
/// because the root may legitimately disappear while mirrored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RootPath(PathBuf);

impl RootPath {
    /// Create a new RootPath, validating it is absolute
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPath` if the path is not absolute or
    /// escapes the filesystem root via `..`
    pub fn new(path: PathBuf) -> Result<Self, DomainError> {
        if !path.is_absolute() {
            return Err(DomainError::InvalidPath(format!(
                "Path must be absolute: {}",
                path.display()
            )));
        }

        let normalized = normalize_path(&path)?;
        Ok(Self(normalized))
    }

    /// Get the inner path
    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Returns true if `path` is the root itself or lies beneath it
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.0)
    }

    /// Display name of the root (last path segment, or the full path for `/`)
    pub fn name(&self) -> String {
        self.0
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.0.display().to_string())
    }
}

/// Normalize a path by resolving `.` and `..` components lexically
fn normalize_path(path: &Path) -> Result<PathBuf, DomainError> {
    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Prefix(p) => normalized.push(p.as_os_str()),
            Component::RootDir => normalized.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(DomainError::InvalidPath(
                        "Path escapes root via ..".to_string(),
                    ));
                }
            }
            Component::Normal(c) => normalized.push(c),
        }
    }

    Ok(normalized)
}

impl Display for RootPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl TryFrom<PathBuf> for RootPath {
    type Error = DomainError;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        Self::new(path)
    }
}

impl AsRef<Path> for RootPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}
