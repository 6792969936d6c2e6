//! Tree entry representation.
//!
//! An [`Entry`] is one node of the mirrored tree: a file or a directory.
//! Entries live in the [`EntryTable`](crate::tree::EntryTable) arena and
//! refer to each other only through [`EntryId`]s: a directory owns its
//! children by id, a child points back at its parent by id.
//!
//! ## Atomic Operations
//!
//! `size` is an `AtomicU64` so that concurrent reconciliations of sibling
//! paths can propagate deltas into a shared ancestor without a
//! read-modify-write race. Signed deltas are applied with wrapping
//! two's-complement addition, which is exact as long as the true size
//! never goes negative.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::newtypes::EntryId;

/// Ids of a directory's direct children, keyed by name.
///
/// Files and subdirectories are kept in separate maps; a name appears in at
/// most one of them. Names are raw OS strings, so two entries whose names
/// are not valid UTF-8 never collide.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildIds {
    /// Child files by name
    pub files: BTreeMap<OsString, EntryId>,
    /// Child directories by name
    pub directories: BTreeMap<OsString, EntryId>,
}

impl ChildIds {
    /// Total number of direct children
    pub fn len(&self) -> usize {
        self.files.len() + self.directories.len()
    }

    /// Returns true if the directory has no children
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.directories.is_empty()
    }

    /// Looks a child up by name in either map
    pub fn get(&self, name: impl AsRef<OsStr>) -> Option<EntryId> {
        let name = name.as_ref();
        self.files
            .get(name)
            .or_else(|| self.directories.get(name))
            .copied()
    }

    /// Iterates over all child ids, files first
    pub fn ids(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.files.values().chain(self.directories.values()).copied()
    }
}

/// Kind of a tree entry
#[derive(Debug)]
pub enum EntryKind {
    /// A regular file (or an opaque leaf such as a symlink)
    File,
    /// A directory owning its children by id
    Directory(Mutex<ChildIds>),
}

/// In-memory representation of one mirrored filesystem entry.
///
/// `full_path` is the identity of the entry and never changes. A move on
/// disk is mirrored as the removal of one entry and the creation of
/// another, so `parent` is fixed at construction as well.
#[derive(Debug)]
pub struct Entry {
    id: EntryId,
    full_path: PathBuf,
    name: OsString,
    parent: Option<EntryId>,
    kind: EntryKind,
    size: AtomicU64,
    accessible: AtomicBool,
}

impl Entry {
    /// Creates a file entry with its literal length
    pub fn new_file(
        id: EntryId,
        full_path: PathBuf,
        parent: Option<EntryId>,
        size: u64,
        accessible: bool,
    ) -> Self {
        Self::new(id, full_path, parent, EntryKind::File, size, accessible)
    }

    /// Creates an empty directory entry
    pub fn new_directory(
        id: EntryId,
        full_path: PathBuf,
        parent: Option<EntryId>,
        accessible: bool,
    ) -> Self {
        Self::new(
            id,
            full_path,
            parent,
            EntryKind::Directory(Mutex::new(ChildIds::default())),
            0,
            accessible,
        )
    }

    fn new(
        id: EntryId,
        full_path: PathBuf,
        parent: Option<EntryId>,
        kind: EntryKind,
        size: u64,
        accessible: bool,
    ) -> Self {
        let name = full_path
            .file_name()
            .unwrap_or(full_path.as_os_str())
            .to_os_string();
        Self {
            id,
            full_path,
            name,
            parent,
            kind,
            size: AtomicU64::new(size),
            accessible: AtomicBool::new(accessible),
        }
    }

    /// Arena id of this entry
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Absolute path of this entry
    pub fn full_path(&self) -> &Path {
        &self.full_path
    }

    /// Leaf segment of the path
    pub fn name(&self) -> &OsStr {
        &self.name
    }

    /// Id of the owning directory, `None` for the root
    pub fn parent(&self) -> Option<EntryId> {
        self.parent
    }

    /// Kind of this entry
    pub fn kind(&self) -> &EntryKind {
        &self.kind
    }

    /// Returns true for directory entries
    pub fn is_directory(&self) -> bool {
        matches!(self.kind, EntryKind::Directory(_))
    }

    /// Current size in bytes (aggregate for directories)
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Atomically adds a signed delta to the size
    pub fn add_size(&self, delta: i64) {
        self.size.fetch_add(delta as u64, Ordering::AcqRel);
    }

    /// Atomically stores a new literal size, returning the previous one
    ///
    /// Only meaningful for files; directory sizes are always derived.
    pub fn replace_size(&self, size: u64) -> u64 {
        self.size.swap(size, Ordering::AcqRel)
    }

    /// Whether the entry could be stat'd / enumerated
    pub fn is_accessible(&self) -> bool {
        self.accessible.load(Ordering::Acquire)
    }

    /// Updates the accessibility flag, returning the previous value
    pub fn set_accessible(&self, accessible: bool) -> bool {
        self.accessible.swap(accessible, Ordering::AcqRel)
    }

    /// Locks the child map of a directory entry
    ///
    /// Returns `None` for files.
    pub fn children(&self) -> Option<MutexGuard<'_, ChildIds>> {
        match &self.kind {
            EntryKind::File => None,
            EntryKind::Directory(children) => {
                Some(children.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
            }
        }
    }

    /// Returns a copy of the child map, empty for files
    pub fn child_ids(&self) -> ChildIds {
        self.children().map(|c| c.clone()).unwrap_or_default()
    }
}
