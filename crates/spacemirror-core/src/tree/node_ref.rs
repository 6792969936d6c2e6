//! Read handle over a tree node.

use std::borrow::Cow;
use std::ffi::OsStr;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

use crate::domain::{Entry, EntryId};

use super::entry_table::EntryTable;

/// Cheap, clonable handle to one node of the tree.
///
/// Handles compare and hash by [`EntryId`], so a set of handles is a set of
/// nodes. A handle stays readable after its node has been removed from the
/// tree; [`is_live`](NodeRef::is_live) tells the two situations apart.
#[derive(Clone)]
pub struct NodeRef {
    entry: Arc<Entry>,
    table: Arc<EntryTable>,
}

impl NodeRef {
    pub(crate) fn new(entry: Arc<Entry>, table: Arc<EntryTable>) -> Self {
        Self { entry, table }
    }

    /// Arena id of the node
    pub fn id(&self) -> EntryId {
        self.entry.id()
    }

    /// Leaf name for display; invalid UTF-8 is replaced
    pub fn name(&self) -> Cow<'_, str> {
        self.entry.name().to_string_lossy()
    }

    /// Leaf name exactly as stored on disk
    pub fn file_name(&self) -> &OsStr {
        self.entry.name()
    }

    /// Absolute path
    pub fn full_path(&self) -> &Path {
        self.entry.full_path()
    }

    /// Size in bytes; aggregate of all descendants for directories
    pub fn size(&self) -> u64 {
        self.entry.size()
    }

    /// Whether the node could be stat'd / enumerated
    pub fn is_accessible(&self) -> bool {
        self.entry.is_accessible()
    }

    /// Returns true for directories
    pub fn is_directory(&self) -> bool {
        self.entry.is_directory()
    }

    /// Whether the node is still part of the tree
    pub fn is_live(&self) -> bool {
        self.table.get(self.id()).is_some()
    }

    /// Owning directory, `None` for the root or a detached node
    pub fn parent(&self) -> Option<NodeRef> {
        let parent = self.table.get(self.entry.parent()?)?;
        Some(NodeRef::new(parent, Arc::clone(&self.table)))
    }

    /// Direct children as `(files, subdirectories)`, each sorted by name
    pub fn children(&self) -> (Vec<NodeRef>, Vec<NodeRef>) {
        let ids = self.entry.child_ids();
        let resolve = |id: &EntryId| {
            self.table
                .get(*id)
                .map(|entry| NodeRef::new(entry, Arc::clone(&self.table)))
        };
        let files = ids.files.values().filter_map(resolve).collect();
        let directories = ids.directories.values().filter_map(resolve).collect();
        (files, directories)
    }

    /// Underlying entry
    pub fn entry(&self) -> &Entry {
        &self.entry
    }
}

impl PartialEq for NodeRef {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for NodeRef {}

impl Hash for NodeRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRef")
            .field("id", &self.id())
            .field("path", &self.full_path())
            .field("size", &self.size())
            .finish()
    }
}
