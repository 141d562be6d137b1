//! Aggregate progress tracking across unpack entries
//!
//! The [`ProgressModel`] keeps a `(total, copied)` pair per image, keyed by
//! the image path, and folds them into a single completion fraction that is
//! pushed to a [`ProgressSink`] on every change.
//!
//! Copy engines may run on a blocking thread and report from there, so the
//! map sits behind a mutex. The sink is called while the lock is held, so
//! published values arrive in the order the updates were applied; a sink
//! must not call back into the model.

use crate::types::{Event, ProgressStatus, UnpackEntry};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::trace;

/// Receiver of overall job completion values in [0, 1]
///
/// Calls are best-effort and must not block. They are made while the
/// [`ProgressModel`] lock is held.
pub trait ProgressSink: Send + Sync {
    /// Publish the current overall completion
    fn set_progress(&self, fraction: f64);
}

/// Sink that forwards progress as [`Event::Progress`] on a broadcast channel
pub struct BroadcastSink {
    event_tx: broadcast::Sender<Event>,
}

impl BroadcastSink {
    /// Wrap an event channel
    pub fn new(event_tx: broadcast::Sender<Event>) -> Self {
        Self { event_tx }
    }
}

impl ProgressSink for BroadcastSink {
    fn set_progress(&self, fraction: f64) {
        // No subscribers is fine
        self.event_tx.send(Event::Progress { fraction }).ok();
    }
}

/// Sink that discards all progress
pub struct NoOpSink;

impl ProgressSink for NoOpSink {
    fn set_progress(&self, _fraction: f64) {}
}

/// Per-entry progress counters and the aggregate completion fraction
///
/// The set of tracked images is fixed at construction; unknown paths passed to
/// the update methods are ignored.
pub struct ProgressModel {
    statuses: Mutex<HashMap<PathBuf, ProgressStatus>>,
    sink: Arc<dyn ProgressSink>,
}

impl ProgressModel {
    /// Track every entry with `total = 0, copied = 0`
    pub fn new(entries: &[UnpackEntry], sink: Arc<dyn ProgressSink>) -> Self {
        let statuses = entries
            .iter()
            .map(|e| (e.source().to_path_buf(), ProgressStatus::default()))
            .collect();

        Self {
            statuses: Mutex::new(statuses),
            sink,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, ProgressStatus>> {
        // Counters stay meaningful even if a holder panicked
        self.statuses.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the file count of an image and publish the new aggregate
    ///
    /// Returns `false` if `source` is not tracked.
    pub fn record_total(&self, source: &Path, total: u64) -> bool {
        let mut statuses = self.lock();
        match statuses.get_mut(source) {
            Some(status) => status.total = total,
            None => return false,
        }
        self.sink.set_progress(aggregate(&statuses));
        true
    }

    /// Set the copied count of an image and publish the new aggregate
    ///
    /// Unknown sources are a no-op: a stray callback is not a fault.
    pub fn record_copied(&self, source: &Path, count: u64) {
        let mut statuses = self.lock();
        match statuses.get_mut(source) {
            Some(status) => status.copied = count,
            None => {
                trace!(?source, "ignoring progress for untracked image");
                return;
            }
        }
        self.sink.set_progress(aggregate(&statuses));
    }

    /// Overall completion in [0, 1]
    ///
    /// Mean of the per-entry contributions (see
    /// [`ProgressStatus::contribution`]); an empty model is at 0.
    pub fn aggregate_progress(&self) -> f64 {
        aggregate(&self.lock())
    }

    /// Publish the current aggregate without changing any counter
    pub fn publish(&self) {
        let statuses = self.lock();
        self.sink.set_progress(aggregate(&statuses));
    }

    /// Snapshot of one entry's counters
    pub fn status(&self, source: &Path) -> Option<ProgressStatus> {
        self.lock().get(source).copied()
    }

    /// Number of tracked entries
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no entries are tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn aggregate(statuses: &HashMap<PathBuf, ProgressStatus>) -> f64 {
    if statuses.is_empty() {
        return 0.0;
    }
    let sum: f64 = statuses.values().map(ProgressStatus::contribution).sum();
    sum / statuses.len() as f64
}
