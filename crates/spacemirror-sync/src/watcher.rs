//! File watching and change draining
//!
//! Provides a [`FileWatcher`] that wraps the `notify` crate to monitor the
//! mirrored root recursively, and a [`ChangeDrain`] that turns the buffered
//! raw OS events into coalesced, path-level [`ChangeSignal`]s.
//!
//! ## Architecture
//!
//! ```text
//! inotify / FSEvents / kqueue
//!       │
//!       ▼
//!  FileWatcher  ──→  mpsc::channel  ──→  ChangeDrain  ──→  WorkQueue
//!                                        (normalize, expand, coalesce)
//! ```
//!
//! The notify callback never blocks. When the channel is full the event is
//! dropped and the next drain reports `rescan`, which makes the engine walk
//! the tree again.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use spacemirror_core::config::WatcherConfig;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::coalescer::{ChangeCoalescer, ChangeSignal};

// ============================================================================
// FileWatcher
// ============================================================================

/// Watches the mirrored root for changes using the OS-native mechanism
///
/// On Linux this typically uses inotify. Dropping the watcher cancels the
/// subscription; the paired [`ChangeDrain`] then only yields what was
/// already buffered.
///
/// ## Usage
///
/// ```ignore
/// let (watcher, drain) = FileWatcher::new(root, &config.watcher)?;
/// let batch = drain.drain();
/// drop(watcher); // stops watching
/// ```
pub struct FileWatcher {
    /// The underlying notify watcher instance
    _watcher: RecommendedWatcher,
    root: PathBuf,
}

impl FileWatcher {
    /// Subscribes to recursive change notifications under `root`
    ///
    /// Returns the watcher and the drain consuming its events.
    ///
    /// # Errors
    /// Returns an error if the underlying OS watcher cannot be created or
    /// the root cannot be watched (missing, permissions, watch limit)
    pub fn new(root: &Path, config: &WatcherConfig) -> Result<(Self, ChangeDrain)> {
        let (event_tx, event_rx) = mpsc::channel::<notify::Event>(config.channel_capacity);
        let overflowed = Arc::new(AtomicBool::new(false));
        let overflow_flag = Arc::clone(&overflowed);

        info!(
            root = %root.display(),
            capacity = config.channel_capacity,
            "Initializing file watcher"
        );

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => match event_tx.try_send(event) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        if !overflow_flag.swap(true, Ordering::AcqRel) {
                            warn!("Change buffer full, events dropped until next drain");
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                },
                Err(err) => {
                    warn!(error = %err, paths = ?err.paths, "File watcher error");
                }
            },
            notify::Config::default(),
        )
        .context("Failed to create file watcher")?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch path: {}", root.display()))?;

        let drain = ChangeDrain::new(
            root.to_path_buf(),
            event_rx,
            overflowed,
            config.expand_created_directories,
        );
        Ok((
            Self {
                _watcher: watcher,
                root: root.to_path_buf(),
            },
            drain,
        ))
    }

    /// Returns the watched root
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        debug!(root = %self.root.display(), "Stopping file watcher");
    }
}

// ============================================================================
// ChangeDrain
// ============================================================================

/// Result of one drain
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainBatch {
    /// Coalesced signals, grouped by path in first-seen order
    pub changes: Vec<(PathBuf, ChangeSignal)>,
    /// Events were lost; the whole tree must be walked again
    pub rescan: bool,
}

/// Consumer side of a [`FileWatcher`]
///
/// Draining does blocking filesystem work (existence checks, listing
/// created directories) and should run on the blocking pool.
pub struct ChangeDrain {
    root: PathBuf,
    events: Mutex<mpsc::Receiver<notify::Event>>,
    overflowed: Arc<AtomicBool>,
    expand_created_directories: bool,
}

impl ChangeDrain {
    fn new(
        root: PathBuf,
        events: mpsc::Receiver<notify::Event>,
        overflowed: Arc<AtomicBool>,
        expand_created_directories: bool,
    ) -> Self {
        Self {
            root,
            events: Mutex::new(events),
            overflowed,
            expand_created_directories,
        }
    }

    /// Takes every buffered event and returns the coalesced signals
    pub fn drain(&self) -> DrainBatch {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let mut coalescer = ChangeCoalescer::new();
        let mut rescan = self.overflowed.swap(false, Ordering::AcqRel);
        let mut raw = 0usize;
        let mut expanded = ExpandedDirs::default();
        let exists = |p: &Path| p.symlink_metadata().is_ok();

        while let Ok(event) = events.try_recv() {
            raw += 1;
            if event.need_rescan() {
                rescan = true;
            }
            for (path, signal) in map_notify_event(&event, &exists) {
                if !path.starts_with(&self.root) {
                    continue;
                }
                coalescer.push(&path, signal);
                if signal == ChangeSignal::Create
                    && self.expand_created_directories
                    && expanded.claim(&path)
                {
                    for descendant in list_descendants(&path) {
                        coalescer.push(&descendant, ChangeSignal::Create);
                    }
                }
            }
        }

        let changes = coalescer.drain();
        if raw > 0 {
            debug!(raw, coalesced = changes.len(), rescan, "Drained change events");
        }
        DrainBatch { changes, rescan }
    }
}

// ============================================================================
// Event mapping - notify::Event → ChangeSignal
// ============================================================================

/// Converts a `notify::Event` into path-level signals
///
/// Maps the notify event kinds as follows:
/// - `Create(*)` -> `Create`
/// - `Remove(*)` -> `Delete`
/// - `Modify(Name(Both))` with 2 paths -> `Delete` old + `Create` new
/// - `Modify(Name(From))` -> `Delete`, `Modify(Name(To))` -> `Create`
/// - Other `Modify(Name(*))` -> `Create` if the path exists now, else `Delete`
/// - Other `Modify(*)`, `Any`, `Other` -> `Update`
/// - `Access(*)` -> ignored
fn map_notify_event(
    event: &notify::Event,
    exists: &dyn Fn(&Path) -> bool,
) -> Vec<(PathBuf, ChangeSignal)> {
    let paths = &event.paths;
    let each = |signal: ChangeSignal| -> Vec<(PathBuf, ChangeSignal)> {
        paths.iter().map(|p| (p.clone(), signal)).collect()
    };

    match &event.kind {
        EventKind::Create(_) => each(ChangeSignal::Create),
        EventKind::Remove(_) => each(ChangeSignal::Delete),

        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => {
            trace!(
                old = %paths[0].display(),
                new = %paths[1].display(),
                "Mapped rename event"
            );
            vec![
                (paths[0].clone(), ChangeSignal::Delete),
                (paths[1].clone(), ChangeSignal::Create),
            ]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => each(ChangeSignal::Delete),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => each(ChangeSignal::Create),
        EventKind::Modify(ModifyKind::Name(_)) => paths
            .iter()
            .map(|p| {
                let signal = if exists(p) {
                    ChangeSignal::Create
                } else {
                    ChangeSignal::Delete
                };
                (p.clone(), signal)
            })
            .collect(),

        EventKind::Modify(_) | EventKind::Any | EventKind::Other => each(ChangeSignal::Update),

        EventKind::Access(_) => Vec::new(),
    }
}

/// Created paths already listed during one drain.
///
/// A subdirectory created together with its parent gets its own Create
/// event, but the parent's listing already covered it.
#[derive(Debug, Default)]
struct ExpandedDirs(Vec<PathBuf>);

impl ExpandedDirs {
    /// Returns false if `path` is at or beneath a path claimed earlier
    fn claim(&mut self, path: &Path) -> bool {
        if self.0.iter().any(|done| path.starts_with(done)) {
            trace!(path = %path.display(), "Already expanded in this drain");
            return false;
        }
        self.0.push(path.to_path_buf());
        true
    }
}

/// Every path beneath `dir`, parents before children
///
/// Symlinks are listed but not followed. Unreadable directories are skipped.
fn list_descendants(dir: &Path) -> Vec<PathBuf> {
    let is_dir = dir
        .symlink_metadata()
        .map(|m| m.file_type().is_dir())
        .unwrap_or(false);
    if !is_dir {
        return Vec::new();
    }

    let mut found = Vec::new();
    let mut frontier = VecDeque::from([dir.to_path_buf()]);
    while let Some(current) = frontier.pop_front() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
                frontier.push_back(path.clone());
            }
            found.push(path);
        }
    }
    found
}
