//! Advisory stream revision tracking.
//!
//! The command pipeline asks a tracker for the revision a command should
//! expect before it falls back to asking the log. Trackers never decide
//! whether a write succeeds: the log checks every expectation at commit time.

use crate::types::{StreamId, StreamRevision};
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use tracing::trace;

/// Supplies and records expected revisions for commands.
pub trait ConcurrencyTracker: Send + Sync {
    /// The revision `command` should expect on `stream_id`.
    ///
    /// `None` means the tracker has no opinion and the log is asked.
    fn expected_revision(&self, stream_id: &StreamId, command: &dyn Any) -> Option<StreamRevision>;

    /// Called after `command` committed events to `stream_id`.
    fn on_updated(
        &self,
        stream_id: &StreamId,
        command: &dyn Any,
        previous: Option<StreamRevision>,
        new: StreamRevision,
    );
}

/// A tracker that never knows anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoConcurrencyTracker;

impl ConcurrencyTracker for NoConcurrencyTracker {
    fn expected_revision(&self, _stream_id: &StreamId, _command: &dyn Any) -> Option<StreamRevision> {
        None
    }

    fn on_updated(
        &self,
        _stream_id: &StreamId,
        _command: &dyn Any,
        _previous: Option<StreamRevision>,
        _new: StreamRevision,
    ) {
    }
}

/// Remembers the last revision this process committed to each stream.
///
/// Useful when one process is the only writer of a stream: the pipeline can
/// skip the `current_revision` round trip. A stale entry costs one
/// `RevisionConflict`; call [`forget`](Self::forget) before retrying.
#[derive(Debug, Default)]
pub struct CachingConcurrencyTracker {
    revisions: RwLock<HashMap<StreamId, StreamRevision>>,
}

impl CachingConcurrencyTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the cached revision of `stream_id`.
    pub fn forget(&self, stream_id: &StreamId) -> Option<StreamRevision> {
        self.revisions.write().remove(stream_id)
    }

    /// Number of streams with a cached revision.
    pub fn len(&self) -> usize {
        self.revisions.read().len()
    }

    /// Whether no revision is cached.
    pub fn is_empty(&self) -> bool {
        self.revisions.read().is_empty()
    }
}

impl ConcurrencyTracker for CachingConcurrencyTracker {
    fn expected_revision(&self, stream_id: &StreamId, _command: &dyn Any) -> Option<StreamRevision> {
        self.revisions.read().get(stream_id).copied()
    }

    fn on_updated(
        &self,
        stream_id: &StreamId,
        _command: &dyn Any,
        previous: Option<StreamRevision>,
        new: StreamRevision,
    ) {
        let mut revisions = self.revisions.write();
        let entry = revisions.entry(stream_id.clone()).or_insert(new);
        // Commits may be reported out of order; keep the newest.
        if *entry < new {
            *entry = new;
        }
        trace!(stream_id = %stream_id, ?previous, revision = %*entry, "cached stream revision");
    }
}
