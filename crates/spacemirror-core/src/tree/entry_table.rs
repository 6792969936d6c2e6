//! Entry arena with a path index.
//!
//! Provides lock-free concurrent lookups for reconciler workers and
//! consumers reading the tree.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::domain::{Entry, EntryId};

/// Arena of tree entries with a bidirectional id ↔ path mapping.
///
/// Uses DashMap for lock-free concurrent access from multiple workers.
/// The table itself does not keep parent and child links consistent; the
/// [`Tree`](super::Tree) does, under its structural lock.
#[derive(Debug)]
pub struct EntryTable {
    /// id -> entry mapping
    by_id: DashMap<EntryId, Arc<Entry>>,
    /// path -> id mapping (the reconciliation index)
    by_path: DashMap<PathBuf, EntryId>,
    /// Next id to hand out; ids are never reused
    next_id: AtomicU64,
}

impl EntryTable {
    /// Create a new empty table.
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
            by_path: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Reserve a fresh entry id.
    pub fn allocate_id(&self) -> EntryId {
        EntryId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Insert an entry, indexing it by id and by path.
    pub fn insert(&self, entry: Entry) -> Arc<Entry> {
        let id = entry.id();
        let path = entry.full_path().to_path_buf();
        let entry = Arc::new(entry);
        self.by_id.insert(id, Arc::clone(&entry));
        self.by_path.insert(path, id);
        entry
    }

    /// Retrieve an entry by id.
    pub fn get(&self, id: EntryId) -> Option<Arc<Entry>> {
        self.by_id.get(&id).map(|r| Arc::clone(&r))
    }

    /// Retrieve an entry by its full path.
    pub fn get_by_path(&self, path: &Path) -> Option<Arc<Entry>> {
        let id = self.id_for_path(path)?;
        self.get(id)
    }

    /// Retrieve the id indexed under `path`.
    pub fn id_for_path(&self, path: &Path) -> Option<EntryId> {
        self.by_path.get(path).map(|r| *r)
    }

    /// Returns true if `path` is indexed.
    pub fn contains_path(&self, path: &Path) -> bool {
        self.by_path.contains_key(path)
    }

    /// Remove an entry by id.
    ///
    /// Removes both the id->entry and path->id mappings. The path mapping is
    /// only dropped if it still points at this id.
    pub fn remove(&self, id: EntryId) -> Option<Arc<Entry>> {
        let (_, entry) = self.by_id.remove(&id)?;
        self.by_path
            .remove_if(entry.full_path(), |_, indexed| *indexed == id);
        Some(entry)
    }

    /// Snapshot of every indexed path.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.by_path.iter().map(|r| r.key().clone()).collect()
    }

    /// Snapshot of every entry.
    pub fn entries(&self) -> Vec<Arc<Entry>> {
        self.by_id.iter().map(|r| Arc::clone(r.value())).collect()
    }

    /// Get the total number of entries in the table.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.by_id.clear();
        self.by_path.clear();
    }
}

impl Default for EntryTable {
    fn default() -> Self {
        Self::new()
    }
}
