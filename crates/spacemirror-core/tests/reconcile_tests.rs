//! Integration tests for Tree::reconcile
//!
//! These tests drive the tree through an in-memory filesystem and compare
//! the resulting sizes against the ground truth computed from that
//! filesystem, for many delivery orders and with concurrent reconcilers.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use spacemirror_core::domain::RootPath;
use spacemirror_core::ports::memory::MemoryDiffer;
use spacemirror_core::ports::{IPathDiffer, PathState, ProbeError};
use spacemirror_core::tree::Tree;

// ============================================================================
// Test helpers
// ============================================================================

const ROOT: &str = "/mirror";

fn p(rel: &str) -> PathBuf {
    if rel.is_empty() {
        PathBuf::from(ROOT)
    } else {
        PathBuf::from(ROOT).join(rel)
    }
}

/// A small but branchy fixture: 5 directories, 8 files
fn populate(fs: &MemoryDiffer) {
    fs.add_dir(&p(""));
    for dir in ["docs", "docs/old", "media", "media/raw", "empty"] {
        fs.add_dir(&p(dir));
    }
    let files = [
        ("readme", 10),
        ("docs/a.txt", 100),
        ("docs/b.txt", 200),
        ("docs/old/c.txt", 300),
        ("media/clip", 4_000),
        ("media/raw/x", 50_000),
        ("media/raw/y", 0),
        ("media/raw/z", 7),
    ];
    for (rel, size) in files {
        fs.add_file(&p(rel), size);
    }
}

fn setup() -> (Arc<MemoryDiffer>, Tree) {
    let fs = Arc::new(MemoryDiffer::new());
    populate(&fs);
    let tree = Tree::new(RootPath::new(p("")).unwrap(), fs.clone());
    (fs, tree)
}

/// Sum of all file sizes at or beneath `path` in the simulated filesystem
fn expected_size(fs: &MemoryDiffer, path: &Path) -> u64 {
    fs.paths()
        .into_iter()
        .filter(|candidate| candidate.starts_with(path))
        .map(|candidate| match fs.stat(&candidate) {
            Ok(PathState::File { size, .. }) => size,
            _ => 0,
        })
        .sum()
}

fn assert_matches_filesystem(fs: &MemoryDiffer, tree: &Tree) {
    let violations = tree.check_invariants();
    assert!(violations.is_empty(), "invariant violations: {violations:?}");

    let mut indexed = tree.indexed_paths();
    indexed.sort();
    assert_eq!(indexed, fs.paths());

    for path in fs.paths() {
        let node = tree.get(&path).expect("every existing path is indexed");
        assert_eq!(
            node.size(),
            expected_size(fs, &path),
            "size mismatch at {}",
            path.display()
        );
    }
}

/// Deterministic Fisher-Yates shuffle driven by a linear congruential generator
fn shuffled(mut items: Vec<PathBuf>, seed: u64) -> Vec<PathBuf> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
    for i in (1..items.len()).rev() {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let j = (state >> 33) as usize % (i + 1);
        items.swap(i, j);
    }
    items
}

// ============================================================================
// Order independence
// ============================================================================

#[test]
fn test_any_delivery_order_converges() {
    for seed in 0..50 {
        let (fs, tree) = setup();
        for path in shuffled(fs.paths(), seed) {
            tree.reconcile(&path).unwrap();
        }
        assert_matches_filesystem(&fs, &tree);
    }
}

#[test]
fn test_reverse_order_converges() {
    let (fs, tree) = setup();
    let mut paths = fs.paths();
    paths.reverse();
    for path in paths {
        tree.reconcile(&path).unwrap();
    }
    assert_matches_filesystem(&fs, &tree);
}

#[test]
fn test_concurrent_reconcilers_converge() {
    for seed in 0..20 {
        let (fs, tree) = setup();
        let tree = Arc::new(tree);
        let paths = shuffled(fs.paths(), seed);

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let tree = Arc::clone(&tree);
                let mine: Vec<_> = paths.iter().skip(worker).step_by(4).cloned().collect();
                thread::spawn(move || {
                    for path in mine {
                        tree.reconcile(&path).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("Thread should complete");
        }

        assert_matches_filesystem(&fs, &tree);
    }
}

// ============================================================================
// Idempotence
// ============================================================================

#[test]
fn test_second_pass_reports_nothing() {
    let (fs, tree) = setup();
    for path in fs.paths() {
        tree.reconcile(&path).unwrap();
    }
    for path in fs.paths() {
        assert!(
            tree.reconcile(&path).unwrap().is_empty(),
            "{} changed on second pass",
            path.display()
        );
    }
}

// ============================================================================
// Mutations after load
// ============================================================================

#[test]
fn test_deletion_leaves_no_descendant_indexed() {
    let (fs, tree) = setup();
    for path in fs.paths() {
        tree.reconcile(&path).unwrap();
    }

    fs.remove(&p("media"));
    tree.reconcile(&p("media")).unwrap();

    assert!(tree
        .indexed_paths()
        .iter()
        .all(|path| !path.starts_with(p("media"))));
    assert_matches_filesystem(&fs, &tree);
}

#[test]
fn test_move_between_directories_preserves_total() {
    let (fs, tree) = setup();
    for path in fs.paths() {
        tree.reconcile(&path).unwrap();
    }
    let total = tree.root().unwrap().size();

    fs.rename(&p("docs/old"), &p("media/old"));
    // Delivered as delete + create, late descendant events included
    for rel in ["docs/old", "docs/old/c.txt", "media/old", "media/old/c.txt"] {
        tree.reconcile(&p(rel)).unwrap();
    }

    assert_eq!(tree.root().unwrap().size(), total);
    assert_matches_filesystem(&fs, &tree);
}

#[test]
fn test_interleaved_updates_and_deletes_converge() {
    for seed in 0..20 {
        let (fs, tree) = setup();
        for path in fs.paths() {
            tree.reconcile(&path).unwrap();
        }

        fs.set_size(&p("docs/a.txt"), 1);
        fs.set_size(&p("media/raw/y"), 999);
        fs.remove(&p("docs/old"));
        fs.add_dir(&p("empty/new"));
        fs.add_file(&p("empty/new/n"), 42);

        let touched = [
            "docs/a.txt",
            "media/raw/y",
            "docs/old",
            "docs/old/c.txt",
            "empty/new",
            "empty/new/n",
        ];
        let paths: Vec<_> = touched.iter().map(|rel| p(rel)).collect();
        for path in shuffled(paths, seed) {
            tree.reconcile(&path).unwrap();
        }

        assert_matches_filesystem(&fs, &tree);
    }
}

// ============================================================================
// Racing a directory listing
// ============================================================================

/// Differ that holds the `park_on`-th stat of one path until released.
///
/// The parked stat has already computed its result. Every other completed
/// stat is reported on `done` so the test can sequence the racing thread.
struct GatedDiffer {
    inner: Arc<MemoryDiffer>,
    gated: PathBuf,
    park_on: usize,
    calls: AtomicUsize,
    parked: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
    done: Mutex<Sender<PathBuf>>,
}

struct Gate {
    parked: Receiver<()>,
    release: Sender<()>,
    done: Receiver<PathBuf>,
}

impl GatedDiffer {
    fn new(inner: Arc<MemoryDiffer>, gated: PathBuf, park_on: usize) -> (Self, Gate) {
        let (parked_tx, parked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let differ = Self {
            inner,
            gated,
            park_on,
            calls: AtomicUsize::new(0),
            parked: Mutex::new(parked_tx),
            release: Mutex::new(release_rx),
            done: Mutex::new(done_tx),
        };
        let gate = Gate {
            parked: parked_rx,
            release: release_tx,
            done: done_rx,
        };
        (differ, gate)
    }
}

impl IPathDiffer for GatedDiffer {
    fn stat(&self, path: &Path) -> Result<PathState, ProbeError> {
        let result = self.inner.stat(path);
        if path == self.gated && self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.park_on {
            self.parked.lock().unwrap().send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
        } else {
            let _ = self.done.lock().unwrap().send(path.to_path_buf());
        }
        result
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }
}

/// Reconciles `d` while its listing is parked under the write lock, changes
/// `d/x` with `mutate`, then reconciles `d/x` from a second thread.
fn race_listing_against_file(mutate: impl FnOnce(&MemoryDiffer)) -> (Arc<MemoryDiffer>, Tree) {
    let fs = Arc::new(MemoryDiffer::new());
    fs.add_dir(&p(""));
    fs.add_dir(&p("d"));
    fs.add_file(&p("d/x"), 500);

    // The second stat of d is the one taken under the write lock
    let (differ, gate) = GatedDiffer::new(Arc::clone(&fs), p("d"), 2);
    let tree = Arc::new(Tree::new(RootPath::new(p("")).unwrap(), Arc::new(differ)));

    let lister = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || tree.reconcile(&p("d")).unwrap())
    };
    gate.parked.recv().expect("listing should park");

    mutate(&fs);
    let racer = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || tree.reconcile(&p("d/x")).unwrap())
    };
    while gate.done.recv().expect("racer should stat") != p("d/x") {}
    // Let the racer reach the index lookup before the listing attaches
    thread::sleep(Duration::from_millis(50));

    gate.release.send(()).unwrap();
    lister.join().expect("Thread should complete");
    racer.join().expect("Thread should complete");

    let tree = Arc::try_unwrap(tree).ok().expect("threads are joined");
    (fs, tree)
}

#[test]
fn test_file_grown_during_listing_converges() {
    let (fs, tree) = race_listing_against_file(|fs| fs.set_size(&p("d/x"), 1000));

    assert_eq!(tree.get(&p("d/x")).unwrap().size(), 1000);
    assert_eq!(tree.root().unwrap().size(), 1000);
    assert_matches_filesystem(&fs, &tree);
}

#[test]
fn test_file_removed_during_listing_converges() {
    let (fs, tree) = race_listing_against_file(|fs| fs.remove(&p("d/x")));

    assert!(!tree.contains(&p("d/x")));
    assert_eq!(tree.root().unwrap().size(), 0);
    assert_matches_filesystem(&fs, &tree);
}
