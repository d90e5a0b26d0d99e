//! Checkpoint-log seam consumed by DCP producers.

use std::collections::VecDeque;
use std::sync::Mutex;

use hashbrown::HashMap;
use reef_common::error::{EngineError, EngineResult};
use reef_common::ids::{Seqno, VBucketId};

use crate::item::{QueuedItem, VBucketState};

/// Default number of checkpoint records kept per vbucket backlog.
pub const DEFAULT_BACKLOG_LEN: usize = 8192;

/// One batch of records drained on behalf of a checkpoint cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorBatch {
    /// Records in seqno order.
    pub items: Vec<QueuedItem>,
    /// First seqno covered by this batch's snapshot.
    pub snapshot_start: Seqno,
    /// Last seqno covered by this batch's snapshot.
    pub snapshot_end: Seqno,
    /// Seqno the cursor points at after the drain.
    pub cursor_seqno: Seqno,
}

/// Per-vbucket in-memory write log with named drain cursors.
///
/// Producers register one cursor per stream, drain queued items in snapshot-sized batches, and
/// consult `backlog_contains` to decide whether a disk backfill is needed at all.
pub trait CheckpointLog: Send + Sync {
    /// Returns the membership state of one vbucket, or `None` when this node does not host it.
    fn vbucket_state(&self, vbucket: VBucketId) -> Option<VBucketState>;

    /// Registers (or refreshes) one named cursor at `start_seqno`.
    ///
    /// Returns the seqno the cursor actually starts at; a cursor requesting history that has
    /// already left the backlog is rolled forward to the backlog's first served position.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotMyVbucket` when the vbucket is not hosted here.
    fn register_cursor(
        &self,
        vbucket: VBucketId,
        name: &str,
        start_seqno: Seqno,
    ) -> EngineResult<Seqno>;

    /// Drains up to `max_items` records past one cursor's position.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotMyVbucket` for an unknown vbucket and
    /// `EngineError::InvalidState` for an unregistered cursor.
    fn drain_cursor(
        &self,
        vbucket: VBucketId,
        name: &str,
        max_items: usize,
    ) -> EngineResult<CursorBatch>;

    /// Drops one named cursor. Unknown cursors are ignored.
    fn remove_cursor(&self, vbucket: VBucketId, name: &str);

    /// Returns the highest seqno assigned in one vbucket (zero when empty or unknown).
    fn high_seqno(&self, vbucket: VBucketId) -> Seqno;

    /// Returns whether one seqno can still be served from the in-memory backlog.
    fn backlog_contains(&self, vbucket: VBucketId, seqno: Seqno) -> bool;
}

#[derive(Debug)]
struct LogRecord {
    seqno: Seqno,
    item: QueuedItem,
}

#[derive(Debug)]
struct VBucketLog {
    state: VBucketState,
    records: VecDeque<LogRecord>,
    next_seqno: Seqno,
    cursors: HashMap<String, Seqno>,
}

impl VBucketLog {
    fn new(state: VBucketState) -> Self {
        Self {
            state,
            records: VecDeque::new(),
            next_seqno: 1,
            cursors: HashMap::new(),
        }
    }

    fn high_seqno(&self) -> Seqno {
        self.next_seqno.saturating_sub(1)
    }

    fn front_seqno(&self) -> Option<Seqno> {
        self.records.front().map(|record| record.seqno)
    }

    fn contains(&self, seqno: Seqno) -> bool {
        let (Some(front), Some(back)) = (self.records.front(), self.records.back()) else {
            return false;
        };
        front.seqno <= seqno && seqno <= back.seqno
    }
}

/// In-memory checkpoint log with bounded per-vbucket backlog and monotonic seqno assignment.
#[derive(Debug)]
pub struct InMemoryCheckpointLog {
    vbuckets: Mutex<HashMap<VBucketId, VBucketLog>>,
    backlog_len: usize,
}

impl Default for InMemoryCheckpointLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCheckpointLog {
    /// Creates an empty log with default backlog size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_backlog(DEFAULT_BACKLOG_LEN)
    }

    /// Creates an empty log with custom backlog size.
    ///
    /// Backlog size of zero is coerced to one record.
    #[must_use]
    pub fn with_backlog(backlog_len: usize) -> Self {
        Self {
            vbuckets: Mutex::new(HashMap::new()),
            backlog_len: backlog_len.max(1),
        }
    }

    /// Creates one vbucket log in the given membership state.
    ///
    /// Re-creating an existing vbucket resets its records and cursors.
    pub fn create_vbucket(&self, vbucket: VBucketId, state: VBucketState) {
        let mut vbuckets = self
            .vbuckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let _ = vbuckets.insert(vbucket, VBucketLog::new(state));
    }

    /// Updates the membership state of one hosted vbucket.
    pub fn set_vbucket_state(&self, vbucket: VBucketId, state: VBucketState) {
        let mut vbuckets = self
            .vbuckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(log) = vbuckets.get_mut(&vbucket) {
            log.state = state;
        }
    }

    /// Appends one record to a vbucket's log tail and returns its assigned seqno.
    ///
    /// Mutations and deletions have their `by_seqno` stamped with the assigned value.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotMyVbucket` when the vbucket is not hosted here.
    pub fn append(&self, vbucket: VBucketId, item: QueuedItem) -> EngineResult<Seqno> {
        let mut vbuckets = self
            .vbuckets
            .lock()
            .map_err(|_| EngineError::InvalidState("checkpoint log mutex is poisoned"))?;
        let log = vbuckets
            .get_mut(&vbucket)
            .ok_or(EngineError::NotMyVbucket)?;

        let seqno = log.next_seqno;
        log.next_seqno = log.next_seqno.saturating_add(1);

        let item = match item {
            QueuedItem::Mutation(mut inner) => {
                inner.by_seqno = seqno;
                QueuedItem::Mutation(inner)
            }
            QueuedItem::Deletion(mut inner) => {
                inner.by_seqno = seqno;
                QueuedItem::Deletion(inner)
            }
            other => other,
        };

        if log.records.len() == self.backlog_len {
            let _ = log.records.pop_front();
        }
        log.records.push_back(LogRecord { seqno, item });
        Ok(seqno)
    }
}

impl CheckpointLog for InMemoryCheckpointLog {
    fn vbucket_state(&self, vbucket: VBucketId) -> Option<VBucketState> {
        let vbuckets = self
            .vbuckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        vbuckets.get(&vbucket).map(|log| log.state)
    }

    fn register_cursor(
        &self,
        vbucket: VBucketId,
        name: &str,
        start_seqno: Seqno,
    ) -> EngineResult<Seqno> {
        let mut vbuckets = self
            .vbuckets
            .lock()
            .map_err(|_| EngineError::InvalidState("checkpoint log mutex is poisoned"))?;
        let log = vbuckets
            .get_mut(&vbucket)
            .ok_or(EngineError::NotMyVbucket)?;

        let high = log.high_seqno();
        let actual = match log.front_seqno() {
            // An empty backlog can only serve new records, so the cursor joins at the head.
            None => high,
            Some(front) => {
                if start_seqno.saturating_add(1) < front {
                    tracing::debug!(
                        vbucket,
                        name,
                        start_seqno,
                        rolled_to = front.saturating_sub(1),
                        "cursor start left the backlog, rolling forward"
                    );
                    front.saturating_sub(1)
                } else {
                    start_seqno.min(high)
                }
            }
        };
        let _ = log.cursors.insert(name.to_owned(), actual);
        Ok(actual)
    }

    fn drain_cursor(
        &self,
        vbucket: VBucketId,
        name: &str,
        max_items: usize,
    ) -> EngineResult<CursorBatch> {
        let mut vbuckets = self
            .vbuckets
            .lock()
            .map_err(|_| EngineError::InvalidState("checkpoint log mutex is poisoned"))?;
        let log = vbuckets
            .get_mut(&vbucket)
            .ok_or(EngineError::NotMyVbucket)?;

        let position = *log
            .cursors
            .get(name)
            .ok_or(EngineError::InvalidState("checkpoint cursor is not registered"))?;

        let mut items = Vec::new();
        let mut first_seqno = position;
        let mut last_seqno = position;
        for record in &log.records {
            if record.seqno <= position {
                continue;
            }
            if items.len() == max_items {
                break;
            }
            if items.is_empty() {
                first_seqno = record.seqno;
            }
            last_seqno = record.seqno;
            items.push(record.item.clone());
        }

        let _ = log.cursors.insert(name.to_owned(), last_seqno);
        Ok(CursorBatch {
            items,
            snapshot_start: first_seqno,
            snapshot_end: last_seqno,
            cursor_seqno: last_seqno,
        })
    }

    fn remove_cursor(&self, vbucket: VBucketId, name: &str) {
        let mut vbuckets = self
            .vbuckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(log) = vbuckets.get_mut(&vbucket) {
            let _ = log.cursors.remove(name);
        }
    }

    fn high_seqno(&self, vbucket: VBucketId) -> Seqno {
        let vbuckets = self
            .vbuckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        vbuckets.get(&vbucket).map_or(0, VBucketLog::high_seqno)
    }

    fn backlog_contains(&self, vbucket: VBucketId, seqno: Seqno) -> bool {
        let vbuckets = self
            .vbuckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        vbuckets.get(&vbucket).is_some_and(|log| log.contains(seqno))
    }
}
