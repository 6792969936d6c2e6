//! Per-path coalescing of change signals
//!
//! Between two drains the watcher may see many events for one path (an
//! editor's save is typically create + several writes). The
//! [`ChangeCoalescer`] folds each new signal into the last one kept for its
//! path:
//!
//! | older | newer | kept |
//! |---|---|---|
//! | any | same kind | newer |
//! | Create | Delete | nothing |
//! | any other | Delete | Delete |
//! | Create | Update | Create |
//! | otherwise | | both, in order |
//!
//! Reconciliation re-derives state from disk, so coalescing only saves work.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Path-level change signal produced by the watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeSignal {
    /// Something appeared at the path
    Create,
    /// The entity at the path changed in place
    Update,
    /// The entity at the path disappeared
    Delete,
}

/// Outcome of folding a newer signal into an older one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Merged {
    One(ChangeSignal),
    Cancelled,
    Both,
}

fn merge(older: ChangeSignal, newer: ChangeSignal) -> Merged {
    use ChangeSignal::*;

    match (older, newer) {
        (a, b) if a == b => Merged::One(b),
        (Create, Delete) => Merged::Cancelled,
        (_, Delete) => Merged::One(Delete),
        (Create, Update) => Merged::One(Create),
        _ => Merged::Both,
    }
}

/// Accumulates signals per path until drained
#[derive(Debug, Default)]
pub struct ChangeCoalescer {
    /// Paths in first-seen order
    order: Vec<PathBuf>,
    pending: HashMap<PathBuf, Vec<ChangeSignal>>,
}

impl ChangeCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds `signal` into the signals already pending for `path`
    pub fn push(&mut self, path: &Path, signal: ChangeSignal) {
        let signals = match self.pending.get_mut(path) {
            Some(signals) => signals,
            None => {
                self.order.push(path.to_path_buf());
                self.pending.entry(path.to_path_buf()).or_default()
            }
        };

        match signals.last().copied() {
            None => signals.push(signal),
            Some(last) => match merge(last, signal) {
                Merged::One(kept) => {
                    signals.pop();
                    signals.push(kept);
                }
                Merged::Cancelled => {
                    signals.pop();
                }
                Merged::Both => signals.push(signal),
            },
        }
    }

    /// Takes every pending signal, grouped by path in first-seen order
    pub fn drain(&mut self) -> Vec<(PathBuf, ChangeSignal)> {
        let mut pending = std::mem::take(&mut self.pending);
        std::mem::take(&mut self.order)
            .into_iter()
            .flat_map(|path| {
                let signals = pending.remove(&path).unwrap_or_default();
                signals.into_iter().map(move |s| (path.clone(), s))
            })
            .collect()
    }

    /// Number of paths with at least one pending signal
    pub fn len(&self) -> usize {
        self.pending.values().filter(|s| !s.is_empty()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::ChangeSignal::*;
    use super::*;

    fn coalesce(signals: &[ChangeSignal]) -> Vec<ChangeSignal> {
        let mut coalescer = ChangeCoalescer::new();
        for signal in signals {
            coalescer.push(Path::new("/r/a"), *signal);
        }
        coalescer.drain().into_iter().map(|(_, s)| s).collect()
    }

    #[test]
    fn test_same_kind_keeps_newer() {
        assert_eq!(coalesce(&[Update, Update, Update]), vec![Update]);
        assert_eq!(coalesce(&[Create, Create]), vec![Create]);
        assert_eq!(coalesce(&[Delete, Delete]), vec![Delete]);
    }

    #[test]
    fn test_create_then_delete_cancels() {
        assert!(coalesce(&[Create, Delete]).is_empty());
        assert!(coalesce(&[Create, Update, Delete]).is_empty());
    }

    #[test]
    fn test_update_then_delete_is_delete() {
        assert_eq!(coalesce(&[Update, Delete]), vec![Delete]);
    }

    #[test]
    fn test_create_then_update_is_create() {
        assert_eq!(coalesce(&[Create, Update]), vec![Create]);
    }

    #[test]
    fn test_other_pairs_keep_both() {
        assert_eq!(coalesce(&[Delete, Create]), vec![Delete, Create]);
        assert_eq!(coalesce(&[Update, Create]), vec![Update, Create]);
        assert_eq!(coalesce(&[Delete, Update]), vec![Delete, Update]);
    }

    #[test]
    fn test_delete_create_delete_leaves_delete() {
        assert_eq!(coalesce(&[Delete, Create, Delete]), vec![Delete]);
    }

    #[test]
    fn test_cancelled_path_accepts_new_signals() {
        assert_eq!(coalesce(&[Create, Delete, Update]), vec![Update]);
    }

    #[test]
    fn test_drain_preserves_first_seen_order_and_clears() {
        let mut coalescer = ChangeCoalescer::new();
        coalescer.push(Path::new("/r/b"), Update);
        coalescer.push(Path::new("/r/a"), Create);
        coalescer.push(Path::new("/r/b"), Delete);
        assert_eq!(coalescer.len(), 2);

        let drained = coalescer.drain();
        assert_eq!(
            drained,
            vec![
                (PathBuf::from("/r/b"), Delete),
                (PathBuf::from("/r/a"), Create),
            ]
        );
        assert!(coalescer.is_empty());
        assert!(coalescer.drain().is_empty());
    }

    #[test]
    fn test_fully_cancelled_path_is_not_counted() {
        let mut coalescer = ChangeCoalescer::new();
        coalescer.push(Path::new("/r/tmp"), Create);
        coalescer.push(Path::new("/r/tmp"), Delete);
        assert!(coalescer.is_empty());
        assert!(coalescer.drain().is_empty());
    }
}
