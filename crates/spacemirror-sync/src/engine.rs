//! Live mirror synchronization engine
//!
//! The [`SyncEngine`] keeps a [`Tree`] consistent with the directory it
//! mirrors while that directory is changing.
//!
//! ## Tasks
//!
//! 1. **Loader**: walks the root breadth-first and enqueues every path it
//!    discovers. Sets the `loaded` flag once the walk completes.
//! 2. **Watcher drain**: every `drain_interval`, drains the
//!    [`FileWatcher`] and enqueues the paths of the coalesced signals.
//! 3. **Reconciler workers**: dequeue a path, run [`Tree::reconcile`] on the
//!    blocking pool and merge the touched nodes into the dirty set.
//!
//! The engine never trusts what the loader or the watcher say about a path;
//! both only nominate paths, and reconciliation re-derives their state.
//!
//! When the watcher reports lost events, or on [`SyncEngine::rescan`], a
//! rescan task nominates every indexed path and walks the root again, so
//! both vanished and unseen entries are reconciled.
//!
//! ## Retry Logic
//!
//! A path whose probe fails transiently is put on the queue's retry lane
//! with a fixed `retry_delay`, at most `max_retries` times, and then
//! dropped. The node keeps its last-known state.

use std::collections::{HashSet, VecDeque};
use std::io::ErrorKind;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use spacemirror_core::config::Config;
use spacemirror_core::tree::{NodeRef, Tree};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::queue::{RetryOutcome, WorkQueue};
use crate::watcher::{ChangeDrain, FileWatcher};
use crate::SyncError;

// ============================================================================
// EngineState / EngineStats
// ============================================================================

/// Lifecycle of a [`SyncEngine`]; an engine is never restarted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built, tasks not launched yet
    Created,
    /// Tasks running
    Active,
    /// Stop requested; tasks exit after their current unit of work
    Stopped,
}

/// Diagnostic snapshot of engine activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Reconciliations that completed without error
    pub paths_reconciled: u64,
    /// Failed reconciliations put on the retry lane
    pub retries_scheduled: u64,
    /// Paths given up on (retries exhausted or panicked)
    pub paths_dropped: u64,
    /// Paths waiting in the queue, retries included
    pub queue_depth: usize,
    /// Live nodes in the tree
    pub nodes: usize,
}

#[derive(Debug, Default)]
struct Counters {
    reconciled: AtomicU64,
    retries: AtomicU64,
    dropped: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Shared state
// ============================================================================

/// State shared by the engine handle and its tasks
struct Shared {
    tree: Arc<Tree>,
    queue: WorkQueue,
    dirty: Mutex<HashSet<NodeRef>>,
    loaded: AtomicBool,
    rescanning: AtomicBool,
    cancel: CancellationToken,
    config: Config,
    counters: Counters,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    async fn reconcile_one(&self, path: PathBuf) {
        let tree = Arc::clone(&self.tree);
        let target = path.clone();
        let result = tokio::task::spawn_blocking(move || tree.reconcile(&target)).await;

        match result {
            Ok(Ok(touched)) => {
                self.queue.complete(&path);
                self.counters.reconciled.fetch_add(1, Ordering::Relaxed);
                if !touched.is_empty() {
                    lock(&self.dirty).extend(touched);
                }
            }
            Ok(Err(err)) => {
                let engine = &self.config.engine;
                match self
                    .queue
                    .fail(&path, engine.max_retries, engine.retry_delay())
                {
                    RetryOutcome::Scheduled(attempt) => {
                        self.counters.retries.fetch_add(1, Ordering::Relaxed);
                        debug!(path = %path.display(), attempt, error = %err, "Transient failure, retrying");
                    }
                    RetryOutcome::Dropped => {
                        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(path = %path.display(), error = %err, "Retries exhausted, dropping path");
                    }
                }
            }
            Err(join_err) => {
                self.queue.complete(&path);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                error!(path = %path.display(), error = %join_err, "Reconciliation task failed");
            }
        }
    }

    /// Breadth-first walk enqueuing every path under the root
    ///
    /// Returns false if cancelled before completion.
    async fn walk(&self) -> bool {
        let root = self.tree.root_path().as_path().to_path_buf();
        self.queue.push(root.clone());
        let mut discovered = 1u64;
        let mut frontier = VecDeque::from([root]);

        while let Some(dir) = frontier.pop_front() {
            if self.cancel.is_cancelled() {
                return false;
            }
            let Some(children) = self.read_dir_with_retry(&dir).await else {
                continue;
            };
            for (path, is_dir) in children {
                self.queue.push(path.clone());
                discovered += 1;
                if is_dir {
                    frontier.push_back(path);
                }
            }
        }

        debug!(discovered, "Walk finished");
        true
    }

    async fn read_dir_with_retry(&self, dir: &Path) -> Option<Vec<(PathBuf, bool)>> {
        let engine = &self.config.engine;
        let mut attempt = 0;
        loop {
            match list_children(dir).await {
                Ok(children) => return Some(children),
                Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::PermissionDenied) => {
                    debug!(path = %dir.display(), error = %e, "Skipping directory");
                    return None;
                }
                Err(e) if attempt < engine.max_retries => {
                    attempt += 1;
                    debug!(path = %dir.display(), attempt, error = %e, "Transient read_dir failure, retrying");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return None,
                        _ = tokio::time::sleep(engine.retry_delay()) => {}
                    }
                }
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "Giving up on directory");
                    return None;
                }
            }
        }
    }
}

/// Lists `dir` as `(path, is_directory)` pairs without following symlinks
async fn list_children(dir: &Path) -> std::io::Result<Vec<(PathBuf, bool)>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut children = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let is_dir = entry
            .file_type()
            .await
            .map(|ft| ft.is_dir())
            .unwrap_or(false);
        children.push((entry.path(), is_dir));
    }
    Ok(children)
}

// ============================================================================
// Tasks
// ============================================================================

async fn run_loader(shared: Arc<Shared>) {
    let started = Instant::now();
    info!(root = %shared.tree.root_path(), "Initial load started");

    if shared.walk().await {
        shared.loaded.store(true, Ordering::Release);
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Initial load complete"
        );
    } else {
        debug!("Initial load cancelled");
    }
}

/// Spawns a rescan unless one is already running; the handle is kept so
/// shutdown can join it
fn spawn_rescan(shared: &Arc<Shared>, runtime: &Handle) {
    if shared.rescanning.swap(true, Ordering::AcqRel) {
        debug!("Rescan already running");
        return;
    }
    let handle = runtime.spawn(run_rescan(Arc::clone(shared)));
    let mut tasks = lock(&shared.tasks);
    tasks.retain(|task| !task.is_finished());
    tasks.push(handle);
}

async fn run_rescan(shared: Arc<Shared>) {
    let started = Instant::now();
    let indexed = shared.tree.indexed_paths();
    info!(indexed = indexed.len(), "Rescanning");

    // Nodes whose paths vanished unseen are only found through the index
    for path in indexed {
        shared.queue.push(path);
    }
    if shared.walk().await {
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Rescan complete"
        );
    }
    shared.rescanning.store(false, Ordering::Release);
}

async fn run_worker(shared: Arc<Shared>, worker: usize) {
    debug!(worker, "Reconciler worker started");
    let idle_poll = shared.config.engine.idle_poll();
    while let Some(path) = shared.queue.pop(&shared.cancel, idle_poll).await {
        shared.reconcile_one(path).await;
    }
    debug!(worker, "Reconciler worker stopped");
}

async fn run_drain(shared: Arc<Shared>, drain: Arc<ChangeDrain>) {
    let mut ticker = tokio::time::interval(shared.config.engine.drain_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let batch = {
            let drain = Arc::clone(&drain);
            match tokio::task::spawn_blocking(move || drain.drain()).await {
                Ok(batch) => batch,
                Err(e) => {
                    error!(error = %e, "Watcher drain failed");
                    continue;
                }
            }
        };

        for (path, _signal) in batch.changes {
            shared.queue.push(path);
        }
        if batch.rescan {
            warn!("Change events were lost");
            spawn_rescan(&shared, &Handle::current());
        }
    }
    debug!("Watcher drain stopped");
}

// ============================================================================
// SyncEngine
// ============================================================================

/// Keeps a [`Tree`] in sync with the filesystem
///
/// Obtain one through [`build`](crate::build). Dropping the engine stops it.
pub struct SyncEngine {
    shared: Arc<Shared>,
    state: Mutex<EngineState>,
    /// Native subscription; dropping it cancels the subscription
    watcher: Mutex<Option<FileWatcher>>,
}

impl SyncEngine {
    /// Creates an engine over `tree`; no task runs until [`start`](Self::start)
    pub fn new(tree: Tree, config: Config) -> Self {
        Self {
            shared: Arc::new(Shared {
                tree: Arc::new(tree),
                queue: WorkQueue::new(),
                dirty: Mutex::new(HashSet::new()),
                loaded: AtomicBool::new(false),
                rescanning: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                config,
                counters: Counters::default(),
                tasks: Mutex::new(Vec::new()),
            }),
            state: Mutex::new(EngineState::Created),
            watcher: Mutex::new(None),
        }
    }

    /// Launches the watcher subscription, the loader, the workers and the
    /// watcher drain
    ///
    /// Idempotent: calling it on an active or stopped engine does nothing.
    /// A watcher subscription failure is logged and the engine still
    /// produces a one-shot snapshot.
    ///
    /// # Errors
    /// Returns [`SyncError::NoRuntime`] when called outside a Tokio runtime
    pub fn start(&self) -> Result<(), SyncError> {
        let runtime = Handle::try_current().map_err(|e| SyncError::NoRuntime(e.to_string()))?;

        let mut state = lock(&self.state);
        match *state {
            EngineState::Active => return Ok(()),
            EngineState::Stopped => {
                debug!("start() on a stopped engine ignored");
                return Ok(());
            }
            EngineState::Created => {}
        }
        *state = EngineState::Active;

        let config = &self.shared.config;
        let root = self.shared.tree.root_path().as_path().to_path_buf();
        info!(
            root = %root.display(),
            workers = config.engine.worker_count,
            watcher = config.watcher.enabled,
            "Starting sync engine"
        );

        let mut tasks = Vec::new();

        // Subscribe before walking so nothing changed during the walk is missed
        if config.watcher.enabled {
            match FileWatcher::new(&root, &config.watcher) {
                Ok((watcher, drain)) => {
                    *lock(&self.watcher) = Some(watcher);
                    tasks.push(runtime.spawn(run_drain(Arc::clone(&self.shared), Arc::new(drain))));
                }
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "Watcher subscription failed, mirroring a one-shot snapshot");
                }
            }
        }

        tasks.push(runtime.spawn(run_loader(Arc::clone(&self.shared))));
        for worker in 0..config.engine.worker_count {
            tasks.push(runtime.spawn(run_worker(Arc::clone(&self.shared), worker)));
        }

        lock(&self.shared.tasks).extend(tasks);
        Ok(())
    }

    /// Cancels the watcher subscription and signals every task to exit
    ///
    /// Idempotent and safe before [`start`](Self::start). Pending queue
    /// entries are abandoned; in-flight reconciliations complete.
    pub fn stop(&self) {
        let previous = mem::replace(&mut *lock(&self.state), EngineState::Stopped);
        if previous == EngineState::Stopped {
            return;
        }
        self.shared.cancel.cancel();
        lock(&self.watcher).take();
        if previous == EngineState::Active {
            info!("Sync engine stopped");
        }
    }

    /// Stops the engine and waits for all of its tasks to exit, rescans
    /// included
    pub async fn shutdown(&self) {
        self.stop();
        loop {
            // The drain task may spawn a rescan right before it exits
            let tasks = mem::take(&mut *lock(&self.shared.tasks));
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                if let Err(e) = task.await {
                    error!(error = %e, "Engine task failed");
                }
            }
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> EngineState {
        *lock(&self.state)
    }

    /// Whether the initial walk has enqueued every path
    pub fn is_loaded(&self) -> bool {
        self.shared.loaded.load(Ordering::Acquire)
    }

    /// Whether the initial walk is done, no rescan is running and no work is
    /// pending or running
    pub fn is_idle(&self) -> bool {
        self.is_loaded()
            && !self.shared.rescanning.load(Ordering::Acquire)
            && self.shared.queue.is_idle()
    }

    /// Atomically drains the set of nodes touched since the last call
    ///
    /// Nodes removed from the tree in the meantime are left out.
    pub fn changed_nodes(&self) -> HashSet<NodeRef> {
        let drained = mem::take(&mut *lock(&self.shared.dirty));
        drained.into_iter().filter(NodeRef::is_live).collect()
    }

    /// Root node, `None` once the root directory was deleted
    pub fn root(&self) -> Option<NodeRef> {
        self.shared.tree.root()
    }

    /// Underlying tree
    pub fn tree(&self) -> &Tree {
        &self.shared.tree
    }

    /// Nominates `path` for reconciliation
    pub fn refresh(&self, path: &Path) {
        self.shared.queue.push(path.to_path_buf());
    }

    /// Re-nominates every indexed path and walks the root again
    ///
    /// Ignored unless the engine is active. At most one rescan runs at a
    /// time.
    pub fn rescan(&self) {
        if self.state() != EngineState::Active {
            debug!("rescan() on an inactive engine ignored");
            return;
        }
        match Handle::try_current() {
            Ok(runtime) => spawn_rescan(&self.shared, &runtime),
            Err(e) => warn!(error = %e, "rescan() outside a Tokio runtime ignored"),
        }
    }

    /// Files at or beneath `under`, largest first, at most `limit` of them
    pub fn largest_files(&self, under: &Path, limit: usize) -> Vec<NodeRef> {
        self.shared.tree.largest_files(under, limit)
    }

    /// Diagnostic counters
    pub fn stats(&self) -> EngineStats {
        let counters = &self.shared.counters;
        EngineStats {
            paths_reconciled: counters.reconciled.load(Ordering::Relaxed),
            retries_scheduled: counters.retries.load(Ordering::Relaxed),
            paths_dropped: counters.dropped.load(Ordering::Relaxed),
            queue_depth: self.shared.queue.len(),
            nodes: self.shared.tree.len(),
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
