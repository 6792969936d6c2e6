//! The mirrored tree and its reconciliation state machine.
//!
//! [`Tree::reconcile`] re-derives the state of one path from the
//! [`IPathDiffer`] and applies the difference to the arena:
//!
//! | indexed | on disk | action |
//! |---|---|---|
//! | no | missing | nothing |
//! | no | file / directory | create, materializing missing ancestors |
//! | yes | missing | delete node and its subtree |
//! | yes | file, same kind | update size |
//! | yes | directory, same kind | update accessibility flag only |
//! | yes | other kind | delete, then create |
//!
//! ## Locking
//!
//! Structural changes (create, delete, kind change) hold the write side of
//! the structural lock for their whole compound mutation. Size updates hold
//! the read side, so they run in parallel with each other and add their
//! delta to every ancestor with an atomic `fetch_add`. Directory sizes are
//! never written except through these deltas.
//!
//! A create that finds its path already indexed once it holds the write
//! lock applies its fresh state as an update instead. A directory's file
//! listing is taken again under the write lock before its files are
//! attached, so a file removed or resized by a concurrent reconciliation is
//! never attached from a stale listing. Files are attached from the state
//! read before the lock; callers must not reconcile the same path from two
//! threads at once, which the engine's work queue guarantees.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, trace};

use crate::domain::{Entry, EntryId, RootPath};
use crate::ports::{IPathDiffer, PathState};

use super::entry_table::EntryTable;
use super::node_ref::NodeRef;
use super::ReconcileError;

/// Ordered, de-duplicated accumulator of nodes touched by one reconciliation
struct Touched {
    seen: HashSet<EntryId>,
    nodes: Vec<Arc<Entry>>,
}

impl Touched {
    fn new() -> Self {
        Self {
            seen: HashSet::new(),
            nodes: Vec::new(),
        }
    }

    fn push(&mut self, entry: &Arc<Entry>) {
        if self.seen.insert(entry.id()) {
            self.nodes.push(Arc::clone(entry));
        }
    }
}

/// Live mirror of a directory subtree.
///
/// The tree owns the root transitively through the [`EntryTable`] arena.
/// It starts out holding only a bare root directory; everything else is
/// discovered by reconciling paths.
pub struct Tree {
    root: RootPath,
    table: Arc<EntryTable>,
    differ: Arc<dyn IPathDiffer>,
    structure: RwLock<()>,
}

impl Tree {
    /// Creates a tree holding only an empty root directory node
    pub fn new(root: RootPath, differ: Arc<dyn IPathDiffer>) -> Self {
        let table = Arc::new(EntryTable::new());
        table.insert(Entry::new_directory(
            table.allocate_id(),
            root.as_path().to_path_buf(),
            None,
            true,
        ));
        Self {
            root,
            table,
            differ,
            structure: RwLock::new(()),
        }
    }

    /// Path of the mirrored root
    pub fn root_path(&self) -> &RootPath {
        &self.root
    }

    /// Root node, `None` once the root directory itself has been deleted
    pub fn root(&self) -> Option<NodeRef> {
        self.get(self.root.as_path())
    }

    /// Node indexed under `path`
    pub fn get(&self, path: &Path) -> Option<NodeRef> {
        self.table.get_by_path(path).map(|entry| self.node_ref(entry))
    }

    /// Node with the given id, if still live
    pub fn node(&self, id: EntryId) -> Option<NodeRef> {
        self.table.get(id).map(|entry| self.node_ref(entry))
    }

    /// Returns true if `path` is indexed
    pub fn contains(&self, path: &Path) -> bool {
        self.table.contains_path(path)
    }

    /// Number of live nodes
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns true if the tree holds no node at all (root deleted)
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Snapshot of every indexed path
    pub fn indexed_paths(&self) -> Vec<PathBuf> {
        self.table.paths()
    }

    /// Files at or beneath `under`, largest first, at most `limit` of them.
    ///
    /// Ties are broken by path so the order is stable. A file path returns
    /// just that file; an unindexed path returns nothing.
    pub fn largest_files(&self, under: &Path, limit: usize) -> Vec<NodeRef> {
        let _guard = self.read_structure();
        let Some(start) = self.table.get_by_path(under) else {
            return Vec::new();
        };

        let mut files = Vec::new();
        let mut stack = vec![start];
        while let Some(entry) = stack.pop() {
            if entry.is_directory() {
                stack.extend(entry.child_ids().ids().filter_map(|id| self.table.get(id)));
            } else {
                files.push(entry);
            }
        }

        files.sort_by(|a, b| {
            b.size()
                .cmp(&a.size())
                .then_with(|| a.full_path().cmp(b.full_path()))
        });
        files.truncate(limit);
        files.into_iter().map(|entry| self.node_ref(entry)).collect()
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Brings the node for `path` in line with the filesystem.
    ///
    /// Returns the nodes whose displayed size or children changed. Paths
    /// outside the root are ignored. The call never recurses into
    /// descendants; they are reconciled through their own paths.
    ///
    /// # Errors
    /// Returns [`ReconcileError`] when the path cannot be probed right now.
    /// The tree is left untouched in that case.
    pub fn reconcile(&self, path: &Path) -> Result<Vec<NodeRef>, ReconcileError> {
        if !self.root.contains(path) {
            debug!(path = %path.display(), "Ignoring path outside mirror root");
            return Ok(Vec::new());
        }

        let state = self.differ.stat(path)?;
        let existing = {
            let _guard = self.read_structure();
            self.table.get_by_path(path)
        };

        let touched = match (existing, state) {
            (None, PathState::Missing) => Touched::new(),
            (None, state) => self.create(path, state)?,
            (Some(entry), state) => self.apply_existing(&entry, path, state)?,
        };

        Ok(touched
            .nodes
            .into_iter()
            .map(|entry| self.node_ref(entry))
            .collect())
    }

    /// Applies `state` to a node that is already indexed
    fn apply_existing(
        &self,
        entry: &Entry,
        path: &Path,
        state: PathState,
    ) -> Result<Touched, ReconcileError> {
        Ok(match state {
            PathState::Missing => self.delete(path),
            PathState::File { size, accessible } if !entry.is_directory() => {
                self.update_file(path, size, accessible)
            }
            PathState::Directory { accessible, .. } if entry.is_directory() => {
                self.update_directory(path, accessible)
            }
            state => self.replace(path, state)?,
        })
    }

    fn create(&self, path: &Path, state: PathState) -> Result<Touched, ReconcileError> {
        let guard = self.write_structure();
        let mut touched = Touched::new();

        if let Some(entry) = self.table.get_by_path(path) {
            drop(guard);
            trace!(path = %path.display(), "Materialized concurrently, applying as update");
            return self.apply_existing(&entry, path, state);
        }

        let state = self.restat_directory(path, state)?;
        if !state.exists() {
            debug!(path = %path.display(), "Path vanished before creation");
            return Ok(touched);
        }

        self.attach(&guard, path, state, &mut touched);
        Ok(touched)
    }

    fn delete(&self, path: &Path) -> Touched {
        let guard = self.write_structure();
        let mut touched = Touched::new();
        self.detach(&guard, path, &mut touched);
        touched
    }

    fn replace(&self, path: &Path, state: PathState) -> Result<Touched, ReconcileError> {
        let guard = self.write_structure();
        let mut touched = Touched::new();

        let state = self.restat_directory(path, state)?;
        debug!(path = %path.display(), "Entry changed kind, replacing");
        self.detach(&guard, path, &mut touched);
        if state.exists() {
            self.attach(&guard, path, state, &mut touched);
        }
        Ok(touched)
    }

    /// Takes a directory's listing again; caller holds the write lock
    fn restat_directory(
        &self,
        path: &Path,
        state: PathState,
    ) -> Result<PathState, ReconcileError> {
        if state.is_directory() {
            Ok(self.differ.stat(path)?)
        } else {
            Ok(state)
        }
    }

    fn update_file(&self, path: &Path, size: u64, accessible: bool) -> Touched {
        let _guard = self.read_structure();
        let mut touched = Touched::new();

        let Some(entry) = self.table.get_by_path(path) else {
            return touched;
        };
        if entry.is_directory() {
            return touched;
        }

        let was_accessible = entry.set_accessible(accessible);
        let old = entry.replace_size(size);
        if old != size {
            let diff = size as i64 - old as i64;
            trace!(path = %path.display(), old, new = size, "File size changed");
            touched.push(&entry);
            for ancestor in self.ancestors(&entry) {
                ancestor.add_size(diff);
                touched.push(&ancestor);
            }
        } else if was_accessible != accessible {
            touched.push(&entry);
        }
        touched
    }

    fn update_directory(&self, path: &Path, accessible: bool) -> Touched {
        let _guard = self.read_structure();
        let mut touched = Touched::new();

        if let Some(entry) = self.table.get_by_path(path) {
            if entry.set_accessible(accessible) != accessible {
                debug!(path = %path.display(), accessible, "Directory accessibility changed");
                touched.push(&entry);
            }
        }
        touched
    }

    // ========================================================================
    // Structural helpers (caller holds the write lock)
    // ========================================================================

    /// Attaches a new node for `path`, materializing missing ancestors
    fn attach(
        &self,
        guard: &RwLockWriteGuard<'_, ()>,
        path: &Path,
        state: PathState,
        touched: &mut Touched,
    ) {
        // Walk upward to the first indexed directory. A stale file node in
        // the way is replaced by a directory.
        let mut missing = Vec::new();
        let mut anchor = None;
        if path != self.root.as_path() {
            let mut cursor = path.parent();
            while let Some(dir) = cursor {
                if !self.root.contains(dir) {
                    break;
                }
                match self.table.get_by_path(dir) {
                    Some(entry) if entry.is_directory() => {
                        anchor = Some(entry);
                        break;
                    }
                    Some(_) => self.detach(guard, dir, touched),
                    None => {}
                }
                missing.push(dir.to_path_buf());
                cursor = dir.parent();
            }
        }

        let mut parent = anchor.clone();
        for dir in missing.into_iter().rev() {
            let entry = self.table.insert(Entry::new_directory(
                self.table.allocate_id(),
                dir,
                parent.as_ref().map(|p| p.id()),
                true,
            ));
            if let Some(p) = &parent {
                link(p, &entry);
            }
            debug!(path = %entry.full_path().display(), "Materialized missing ancestor");
            touched.push(&entry);
            parent = Some(entry);
        }

        let parent_id = parent.as_ref().map(|p| p.id());
        let leaf = match state {
            PathState::Missing => return,
            PathState::File { size, accessible } => self.table.insert(Entry::new_file(
                self.table.allocate_id(),
                path.to_path_buf(),
                parent_id,
                size,
                accessible,
            )),
            PathState::Directory { accessible, files } => {
                let dir = self.table.insert(Entry::new_directory(
                    self.table.allocate_id(),
                    path.to_path_buf(),
                    parent_id,
                    accessible,
                ));
                let mut total = 0u64;
                for probe in files {
                    let file = self.table.insert(Entry::new_file(
                        self.table.allocate_id(),
                        path.join(&probe.name),
                        Some(dir.id()),
                        probe.size,
                        probe.accessible,
                    ));
                    link(&dir, &file);
                    total += probe.size;
                    touched.push(&file);
                }
                dir.add_size(total as i64);
                dir
            }
        };

        if let Some(p) = &parent {
            link(p, &leaf);
        }
        touched.push(&leaf);
        if let Some(anchor) = &anchor {
            touched.push(anchor);
        }

        let delta = leaf.size();
        if delta != 0 {
            for ancestor in self.ancestors(&leaf) {
                ancestor.add_size(delta as i64);
                touched.push(&ancestor);
            }
        }
        debug!(path = %path.display(), size = delta, "Created entry");
    }

    /// Detaches the node for `path` and purges its subtree
    fn detach(&self, _guard: &RwLockWriteGuard<'_, ()>, path: &Path, touched: &mut Touched) {
        let Some(entry) = self.table.get_by_path(path) else {
            return;
        };
        let size = entry.size();

        match entry.parent().and_then(|id| self.table.get(id)) {
            Some(parent) => {
                if let Some(mut children) = parent.children() {
                    if entry.is_directory() {
                        children.directories.remove(entry.name());
                    } else {
                        children.files.remove(entry.name());
                    }
                }
                touched.push(&parent);
                if size != 0 {
                    for ancestor in self.ancestors(&entry) {
                        ancestor.add_size(-(size as i64));
                        touched.push(&ancestor);
                    }
                }
            }
            None => debug!(path = %path.display(), "Root deleted, clearing tree"),
        }

        let removed = self.purge(&entry);
        if entry.parent().is_none() {
            self.table.clear();
        }
        debug!(path = %path.display(), size, removed, "Removed entry");
    }

    /// Removes `entry` and all its descendants from the arena and index
    fn purge(&self, entry: &Arc<Entry>) -> usize {
        let mut stack = vec![entry.id()];
        let mut removed = 0;
        while let Some(id) = stack.pop() {
            if let Some(gone) = self.table.remove(id) {
                stack.extend(gone.child_ids().ids());
                removed += 1;
            }
        }
        removed
    }

    // ========================================================================
    // Misc helpers
    // ========================================================================

    /// Every ancestor of `entry`, nearest first
    fn ancestors(&self, entry: &Entry) -> Vec<Arc<Entry>> {
        let mut result = Vec::new();
        let mut cursor = entry.parent();
        while let Some(id) = cursor {
            let Some(ancestor) = self.table.get(id) else {
                break;
            };
            cursor = ancestor.parent();
            result.push(ancestor);
        }
        result
    }

    fn node_ref(&self, entry: Arc<Entry>) -> NodeRef {
        NodeRef::new(entry, Arc::clone(&self.table))
    }

    fn write_structure(&self) -> RwLockWriteGuard<'_, ()> {
        self.structure.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_structure(&self) -> RwLockReadGuard<'_, ()> {
        self.structure.read().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Invariant checking
    // ========================================================================

    /// Describes every violated tree invariant; empty when consistent.
    ///
    /// Checks that each directory's size equals the sum of its children,
    /// that every indexed node is reachable from the root, and that every
    /// child link points at a live node with a matching name.
    pub fn check_invariants(&self) -> Vec<String> {
        let _guard = self.write_structure();
        let mut violations = Vec::new();

        let mut reachable = HashSet::new();
        if let Some(root) = self.table.get_by_path(self.root.as_path()) {
            let mut stack = vec![root];
            while let Some(entry) = stack.pop() {
                reachable.insert(entry.id());
                let ids = entry.child_ids();
                let mut sum = 0u64;
                for (name, id) in ids.files.iter().chain(ids.directories.iter()) {
                    match self.table.get(*id) {
                        Some(child) => {
                            if child.name() != name.as_os_str() {
                                violations.push(format!(
                                    "{}: child {} indexed under name {}",
                                    entry.full_path().display(),
                                    child.name().to_string_lossy(),
                                    name.to_string_lossy()
                                ));
                            }
                            sum += child.size();
                            stack.push(child);
                        }
                        None => violations.push(format!(
                            "{}: dangling child {}",
                            entry.full_path().display(),
                            name.to_string_lossy()
                        )),
                    }
                }
                if entry.is_directory() && sum != entry.size() {
                    violations.push(format!(
                        "{}: size {} != sum of children {}",
                        entry.full_path().display(),
                        entry.size(),
                        sum
                    ));
                }
            }
        }

        for entry in self.table.entries() {
            if !reachable.contains(&entry.id()) {
                violations.push(format!(
                    "{}: indexed but unreachable from root",
                    entry.full_path().display()
                ));
            }
        }
        violations
    }
}

/// Records `child` in `parent`'s child map under the child's name
fn link(parent: &Entry, child: &Entry) {
    if let Some(mut children) = parent.children() {
        let name = child.name().to_os_string();
        if child.is_directory() {
            children.directories.insert(name, child.id());
        } else {
            children.files.insert(name, child.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::ports::memory::MemoryDiffer;

    const ROOT: &str = "/mirror";

    fn p(rel: &str) -> PathBuf {
        if rel.is_empty() {
            PathBuf::from(ROOT)
        } else {
            PathBuf::from(ROOT).join(rel)
        }
    }

    fn setup() -> (Arc<MemoryDiffer>, Tree) {
        let differ = Arc::new(MemoryDiffer::new());
        differ.add_dir(&p(""));
        let tree = Tree::new(RootPath::new(p("")).unwrap(), differ.clone());
        (differ, tree)
    }

    fn size_of(tree: &Tree, rel: &str) -> u64 {
        tree.get(&p(rel)).expect("node should exist").size()
    }

    fn touched_paths(nodes: &[NodeRef]) -> Vec<PathBuf> {
        let mut paths: Vec<_> = nodes.iter().map(|n| n.full_path().to_path_buf()).collect();
        paths.sort();
        paths
    }

    #[test]
    fn test_new_tree_has_bare_root() {
        let (_differ, tree) = setup();
        let root = tree.root().unwrap();
        assert_eq!(root.size(), 0);
        assert_eq!(root.name(), "mirror");
        let (files, dirs) = root.children();
        assert!(files.is_empty());
        assert!(dirs.is_empty());
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_absent_and_missing_is_noop() {
        let (_differ, tree) = setup();
        assert!(tree.reconcile(&p("nothing")).unwrap().is_empty());
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_path_outside_root_is_ignored() {
        let (differ, tree) = setup();
        differ.add_file(Path::new("/elsewhere/file"), 10);
        assert!(tree.reconcile(Path::new("/elsewhere/file")).unwrap().is_empty());
        assert!(!tree.contains(Path::new("/elsewhere/file")));
    }

    #[test]
    fn test_create_file_propagates_size() {
        let (differ, tree) = setup();
        differ.add_file(&p("a"), 500);

        let touched = tree.reconcile(&p("a")).unwrap();

        assert_eq!(touched_paths(&touched), vec![p(""), p("a")]);
        assert_eq!(size_of(&tree, ""), 500);
        assert!(tree.check_invariants().is_empty());
    }

    #[test]
    fn test_create_directory_with_immediate_files() {
        let (differ, tree) = setup();
        differ.add_dir(&p("d"));
        differ.add_file(&p("d/x"), 100);
        differ.add_file(&p("d/y"), 200);

        let touched = tree.reconcile(&p("d")).unwrap();

        assert_eq!(
            touched_paths(&touched),
            vec![p(""), p("d"), p("d/x"), p("d/y")]
        );
        assert_eq!(size_of(&tree, "d"), 300);
        assert_eq!(size_of(&tree, ""), 300);

        // The files are already known: reconciling them is a no-op
        assert!(tree.reconcile(&p("d/x")).unwrap().is_empty());
        assert!(tree.check_invariants().is_empty());
    }

    #[test]
    fn test_empty_directory_touches_only_parent() {
        let (differ, tree) = setup();
        differ.add_dir(&p("a"));
        tree.reconcile(&p("a")).unwrap();
        differ.add_dir(&p("a/b"));

        let touched = tree.reconcile(&p("a/b")).unwrap();

        assert_eq!(touched_paths(&touched), vec![p("a"), p("a/b")]);
    }

    #[test]
    fn test_out_of_order_child_materializes_ancestors() {
        let (differ, tree) = setup();
        differ.add_dir(&p("a"));
        differ.add_dir(&p("a/b"));
        differ.add_file(&p("a/b/f"), 40);

        let touched = tree.reconcile(&p("a/b/f")).unwrap();

        assert_eq!(
            touched_paths(&touched),
            vec![p(""), p("a"), p("a/b"), p("a/b/f")]
        );
        assert_eq!(size_of(&tree, "a/b"), 40);
        assert_eq!(size_of(&tree, "a"), 40);
        assert_eq!(size_of(&tree, ""), 40);

        // The parents arriving later change nothing
        assert!(tree.reconcile(&p("a/b")).unwrap().is_empty());
        assert!(tree.reconcile(&p("a")).unwrap().is_empty());
        assert!(tree.check_invariants().is_empty());
    }

    #[test]
    fn test_update_file_size() {
        let (differ, tree) = setup();
        differ.add_dir(&p("d"));
        differ.add_file(&p("d/f"), 100);
        tree.reconcile(&p("d/f")).unwrap();

        differ.set_size(&p("d/f"), 250);
        let touched = tree.reconcile(&p("d/f")).unwrap();

        assert_eq!(touched_paths(&touched), vec![p(""), p("d"), p("d/f")]);
        assert_eq!(size_of(&tree, "d/f"), 250);
        assert_eq!(size_of(&tree, ""), 250);

        differ.set_size(&p("d/f"), 50);
        tree.reconcile(&p("d/f")).unwrap();
        assert_eq!(size_of(&tree, "d"), 50);
        assert_eq!(size_of(&tree, ""), 50);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let (differ, tree) = setup();
        differ.add_file(&p("f"), 10);

        assert!(!tree.reconcile(&p("f")).unwrap().is_empty());
        assert!(tree.reconcile(&p("f")).unwrap().is_empty());
        assert!(tree.reconcile(&p("")).unwrap().is_empty());
    }

    #[test]
    fn test_delete_file_updates_every_ancestor() {
        let (differ, tree) = setup();
        differ.add_dir(&p("a"));
        differ.add_dir(&p("a/b"));
        differ.add_file(&p("a/b/f"), 200);
        differ.add_file(&p("a/g"), 5);
        tree.reconcile(&p("a/b/f")).unwrap();
        tree.reconcile(&p("a/g")).unwrap();

        differ.remove(&p("a/b/f"));
        let touched = tree.reconcile(&p("a/b/f")).unwrap();

        assert_eq!(touched_paths(&touched), vec![p(""), p("a"), p("a/b")]);
        assert_eq!(size_of(&tree, "a/b"), 0);
        assert_eq!(size_of(&tree, "a"), 5);
        assert_eq!(size_of(&tree, ""), 5);
        assert!(!tree.contains(&p("a/b/f")));
        assert!(tree.check_invariants().is_empty());
    }

    #[test]
    fn test_delete_empty_file_touches_only_parent() {
        let (differ, tree) = setup();
        differ.add_dir(&p("a"));
        differ.add_file(&p("a/empty"), 0);
        tree.reconcile(&p("a/empty")).unwrap();

        differ.remove(&p("a/empty"));
        let touched = tree.reconcile(&p("a/empty")).unwrap();

        assert_eq!(touched_paths(&touched), vec![p("a")]);
    }

    #[test]
    fn test_delete_directory_purges_whole_subtree() {
        let (differ, tree) = setup();
        differ.add_dir(&p("d"));
        differ.add_dir(&p("d/e"));
        differ.add_file(&p("d/f1"), 1);
        differ.add_file(&p("d/e/f2"), 2);
        differ.add_file(&p("d/e/f3"), 3);
        for rel in ["d", "d/e", "d/f1", "d/e/f2", "d/e/f3"] {
            tree.reconcile(&p(rel)).unwrap();
        }
        assert_eq!(tree.len(), 6);

        differ.remove(&p("d"));
        let touched = tree.reconcile(&p("d")).unwrap();

        assert_eq!(touched_paths(&touched), vec![p("")]);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.indexed_paths(), vec![p("")]);
        assert_eq!(size_of(&tree, ""), 0);

        // Late events for the purged descendants are harmless
        assert!(tree.reconcile(&p("d/e/f2")).unwrap().is_empty());
        assert!(tree.check_invariants().is_empty());
    }

    #[test]
    fn test_delete_root_clears_tree() {
        let (differ, tree) = setup();
        differ.add_file(&p("a"), 10);
        tree.reconcile(&p("a")).unwrap();

        differ.remove(&p(""));
        let touched = tree.reconcile(&p("")).unwrap();

        assert!(touched.is_empty());
        assert!(tree.is_empty());
        assert!(tree.root().is_none());
    }

    #[test]
    fn test_root_recreated_after_deletion() {
        let (differ, tree) = setup();
        differ.remove(&p(""));
        tree.reconcile(&p("")).unwrap();
        assert!(tree.root().is_none());

        differ.add_dir(&p(""));
        differ.add_file(&p("x"), 7);
        tree.reconcile(&p("x")).unwrap();

        assert_eq!(tree.root().unwrap().size(), 7);
        assert!(tree.check_invariants().is_empty());
    }

    #[test]
    fn test_file_replaced_by_directory() {
        let (differ, tree) = setup();
        differ.add_file(&p("x"), 10);
        tree.reconcile(&p("x")).unwrap();

        differ.remove(&p("x"));
        differ.add_dir(&p("x"));
        differ.add_file(&p("x/inner"), 3);
        tree.reconcile(&p("x")).unwrap();

        let node = tree.get(&p("x")).unwrap();
        assert!(node.is_directory());
        assert_eq!(node.size(), 3);
        assert_eq!(size_of(&tree, ""), 3);
        assert!(tree.check_invariants().is_empty());
    }

    #[test]
    fn test_stale_file_ancestor_replaced_on_child_create() {
        let (differ, tree) = setup();
        differ.add_file(&p("x"), 10);
        tree.reconcile(&p("x")).unwrap();

        differ.remove(&p("x"));
        differ.add_dir(&p("x"));
        differ.add_file(&p("x/inner"), 4);
        tree.reconcile(&p("x/inner")).unwrap();

        assert!(tree.get(&p("x")).unwrap().is_directory());
        assert_eq!(size_of(&tree, ""), 4);
        assert!(tree.check_invariants().is_empty());
    }

    #[test]
    fn test_inaccessible_directory_keeps_known_size() {
        let (differ, tree) = setup();
        differ.add_dir(&p("locked"));
        differ.add_file(&p("locked/f"), 60);
        tree.reconcile(&p("locked/f")).unwrap();

        differ.set_dir_accessible(&p("locked"), false);
        let touched = tree.reconcile(&p("locked")).unwrap();

        let node = tree.get(&p("locked")).unwrap();
        assert_eq!(touched_paths(&touched), vec![p("locked")]);
        assert!(!node.is_accessible());
        assert_eq!(node.size(), 60);
    }

    #[test]
    fn test_stat_failure_leaves_tree_untouched() {
        let (differ, tree) = setup();
        differ.add_file(&p("busy"), 10);
        differ.fail_next(&p("busy"), 1);

        let err = tree.reconcile(&p("busy")).unwrap_err();
        assert!(err.is_transient());
        assert!(!tree.contains(&p("busy")));

        assert!(!tree.reconcile(&p("busy")).unwrap().is_empty());
        assert_eq!(size_of(&tree, ""), 10);
    }

    #[test]
    fn test_moved_directory_keeps_total() {
        let (differ, tree) = setup();
        differ.add_dir(&p("src"));
        differ.add_dir(&p("dst"));
        differ.add_dir(&p("src/sub"));
        differ.add_file(&p("src/sub/a"), 11);
        differ.add_file(&p("src/sub/b"), 22);
        for rel in ["src", "dst", "src/sub", "src/sub/a", "src/sub/b"] {
            tree.reconcile(&p(rel)).unwrap();
        }
        assert_eq!(size_of(&tree, ""), 33);

        differ.rename(&p("src/sub"), &p("dst/sub"));
        for rel in ["src/sub", "dst/sub", "dst/sub/a", "dst/sub/b"] {
            tree.reconcile(&p(rel)).unwrap();
        }

        assert_eq!(size_of(&tree, ""), 33);
        assert_eq!(size_of(&tree, "dst/sub"), 33);
        assert_eq!(size_of(&tree, "src"), 0);
        assert!(!tree.contains(&p("src/sub")));
        assert!(!tree.contains(&p("src/sub/a")));
        assert!(tree.check_invariants().is_empty());
    }

    #[test]
    fn test_create_of_indexed_path_applies_fresh_size() {
        let (differ, tree) = setup();
        differ.add_dir(&p("d"));
        differ.add_file(&p("d/x"), 500);
        tree.reconcile(&p("d")).unwrap();

        // The file was stat'd before the directory attached its listing
        differ.set_size(&p("d/x"), 1000);
        let fresh = differ.stat(&p("d/x")).unwrap();
        let touched = tree.create(&p("d/x"), fresh).unwrap();

        let mut paths: Vec<_> = touched
            .nodes
            .iter()
            .map(|e| e.full_path().to_path_buf())
            .collect();
        paths.sort();
        assert_eq!(paths, vec![p(""), p("d"), p("d/x")]);
        assert_eq!(size_of(&tree, ""), 1000);
        assert!(tree.check_invariants().is_empty());
    }

    #[test]
    fn test_directory_create_uses_listing_taken_under_lock() {
        let (differ, tree) = setup();
        differ.add_dir(&p("d"));
        differ.add_file(&p("d/x"), 500);
        let listed = differ.stat(&p("d")).unwrap();

        differ.remove(&p("d/x"));
        tree.create(&p("d"), listed).unwrap();

        assert!(tree.contains(&p("d")));
        assert!(!tree.contains(&p("d/x")));
        assert_eq!(size_of(&tree, ""), 0);
    }

    #[test]
    fn test_directory_create_skipped_when_gone_under_lock() {
        let (differ, tree) = setup();
        differ.add_dir(&p("d"));
        let listed = differ.stat(&p("d")).unwrap();

        differ.remove(&p("d"));
        assert!(tree.create(&p("d"), listed).unwrap().nodes.is_empty());
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_largest_files_orders_by_size() {
        let (differ, tree) = setup();
        differ.add_dir(&p("a"));
        differ.add_dir(&p("a/b"));
        differ.add_file(&p("a/b/big"), 900);
        differ.add_file(&p("a/mid"), 300);
        differ.add_file(&p("a/tie"), 300);
        differ.add_file(&p("small"), 1);
        for rel in ["a/b/big", "a/mid", "a/tie", "small"] {
            tree.reconcile(&p(rel)).unwrap();
        }

        let all: Vec<_> = tree
            .largest_files(&p(""), 10)
            .iter()
            .map(|n| n.full_path().to_path_buf())
            .collect();
        assert_eq!(all, vec![p("a/b/big"), p("a/mid"), p("a/tie"), p("small")]);

        let top: Vec<_> = tree.largest_files(&p("a"), 2).iter().map(|n| n.size()).collect();
        assert_eq!(top, vec![900, 300]);

        assert_eq!(tree.largest_files(&p("small"), 5).len(), 1);
        assert!(tree.largest_files(&p("nowhere"), 5).is_empty());
        assert!(tree.largest_files(&p(""), 0).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_siblings_stay_distinct() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let (differ, tree) = setup();
        let first = p("").join(OsStr::from_bytes(b"a\xff"));
        let second = p("").join(OsStr::from_bytes(b"a\xfe"));
        differ.add_file(&first, 100);
        differ.add_file(&second, 200);
        tree.reconcile(&first).unwrap();
        tree.reconcile(&second).unwrap();

        let (files, _) = tree.root().unwrap().children();
        assert_eq!(files.len(), 2);
        assert_eq!(size_of(&tree, ""), 300);
        assert!(tree.check_invariants().is_empty());

        differ.remove(&first);
        tree.reconcile(&first).unwrap();
        assert_eq!(size_of(&tree, ""), 200);
        assert!(tree.get(&second).is_some());
        assert!(tree.check_invariants().is_empty());
    }

    #[test]
    fn test_node_ref_children_and_parent() {
        let (differ, tree) = setup();
        differ.add_dir(&p("d"));
        differ.add_file(&p("d/f"), 1);
        differ.add_file(&p("g"), 2);
        tree.reconcile(&p("d")).unwrap();
        tree.reconcile(&p("g")).unwrap();

        let root = tree.root().unwrap();
        let (files, dirs) = root.children();
        assert_eq!(files.iter().map(|n| n.name()).collect::<Vec<_>>(), vec!["g"]);
        assert_eq!(dirs.iter().map(|n| n.name()).collect::<Vec<_>>(), vec!["d"]);

        let (inner, _) = dirs[0].children();
        assert_eq!(inner[0].parent().unwrap(), dirs[0]);
        assert!(root.parent().is_none());
    }
}
