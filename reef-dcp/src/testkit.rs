//! Shared fakes standing in for the DCP core's collaborator seams in tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use hashbrown::{HashMap, HashSet};
use reef_common::error::{EngineError, EngineResult};
use reef_common::ids::{Cookie, Seqno, VBucketId};
use reef_engine::backfill_store::{BackfillSource, BackfillStore, BackfillVisitor};
use reef_engine::item::{Item, VBucketState};
use reef_engine::replica::ReplicaStore;
use reef_engine::server::ServerGateway;

/// One scripted backfill scan event.
#[derive(Debug, Clone)]
pub(crate) enum ScanEvent {
    /// Announce a disk snapshot range.
    DiskSnapshot(Seqno, Seqno),
    /// Deliver one item from the given source.
    Item(Item, BackfillSource),
}

/// Scripted stand-in for the on-disk store's scan surface.
#[derive(Debug, Default)]
pub(crate) struct InMemoryBackfillStore {
    events: Mutex<HashMap<VBucketId, Vec<ScanEvent>>>,
}

impl InMemoryBackfillStore {
    pub(crate) fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    /// Scripts the events one vbucket's scan replays.
    pub(crate) fn script(&self, vbucket: VBucketId, events: Vec<ScanEvent>) {
        let mut table = self
            .events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let _ = table.insert(vbucket, events);
    }
}

impl BackfillStore for InMemoryBackfillStore {
    fn scan(
        &self,
        vbucket: VBucketId,
        start_seqno: Seqno,
        end_seqno: Seqno,
        visitor: &mut dyn BackfillVisitor,
    ) -> EngineResult<()> {
        let events = {
            let table = self
                .events
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            table.get(&vbucket).cloned().unwrap_or_default()
        };
        for event in events {
            match event {
                ScanEvent::DiskSnapshot(start, end) => visitor.mark_disk_snapshot(start, end),
                ScanEvent::Item(item, source) => {
                    if item.by_seqno < start_seqno || item.by_seqno > end_seqno {
                        continue;
                    }
                    if !visitor.item(item, source) {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn estimate_items(&self, vbucket: VBucketId, start_seqno: Seqno, end_seqno: Seqno) -> u64 {
        let table = self
            .events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        table.get(&vbucket).map_or(0, |events| {
            events
                .iter()
                .filter(|event| match event {
                    ScanEvent::Item(item, _) => {
                        item.by_seqno >= start_seqno && item.by_seqno <= end_seqno
                    }
                    ScanEvent::DiskSnapshot(..) => false,
                })
                .count() as u64
        })
    }
}

/// One change a fake replica store accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AppliedChange {
    Mutation {
        vbucket: VBucketId,
        key: Vec<u8>,
        seqno: Seqno,
    },
    Deletion {
        vbucket: VBucketId,
        key: Vec<u8>,
        seqno: Seqno,
    },
}

/// Recording stand-in for the replica-vbucket apply surface.
#[derive(Debug, Default)]
pub(crate) struct RecordingReplicaStore {
    applied: Mutex<Vec<AppliedChange>>,
    boundaries: Mutex<Vec<(VBucketId, Seqno)>>,
    states: Mutex<Vec<(VBucketId, VBucketState)>>,
    hosted: Mutex<Option<HashSet<VBucketId>>>,
    fail_next: AtomicUsize,
}

impl RecordingReplicaStore {
    pub(crate) fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    /// Makes the next `count` apply calls fail with `TempFail`.
    pub(crate) fn fail_next_applies(&self, count: usize) {
        self.fail_next.store(count, Ordering::Release);
    }

    /// Restricts hosted vbuckets; unrestricted stores host everything.
    #[allow(dead_code)]
    pub(crate) fn host_only(&self, vbuckets: &[VBucketId]) {
        let mut hosted = self
            .hosted
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *hosted = Some(vbuckets.iter().copied().collect());
    }

    pub(crate) fn applied_log(&self) -> Vec<AppliedChange> {
        self.applied
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn boundaries(&self) -> Vec<(VBucketId, Seqno)> {
        self.boundaries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    #[allow(dead_code)]
    pub(crate) fn states(&self) -> Vec<(VBucketId, VBucketState)> {
        self.states
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn take_fail(&self) -> EngineResult<()> {
        let remaining = self.fail_next.load(Ordering::Acquire);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::Release);
            return Err(EngineError::TempFail);
        }
        Ok(())
    }
}

impl ReplicaStore for RecordingReplicaStore {
    fn hosts_vbucket(&self, vbucket: VBucketId) -> bool {
        let hosted = self
            .hosted
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        hosted.as_ref().is_none_or(|set| set.contains(&vbucket))
    }

    fn apply_mutation(&self, vbucket: VBucketId, item: &Item) -> EngineResult<()> {
        self.take_fail()?;
        self.applied
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(AppliedChange::Mutation {
                vbucket,
                key: item.key.clone(),
                seqno: item.by_seqno,
            });
        Ok(())
    }

    fn apply_deletion(&self, vbucket: VBucketId, item: &Item) -> EngineResult<()> {
        self.take_fail()?;
        self.applied
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(AppliedChange::Deletion {
                vbucket,
                key: item.key.clone(),
                seqno: item.by_seqno,
            });
        Ok(())
    }

    fn set_vbucket_state(&self, vbucket: VBucketId, state: VBucketState) -> EngineResult<()> {
        self.states
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((vbucket, state));
        Ok(())
    }

    fn persist_snapshot_boundary(&self, vbucket: VBucketId, end_seqno: Seqno) -> EngineResult<()> {
        self.boundaries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((vbucket, end_seqno));
        Ok(())
    }

    fn high_seqno(&self, vbucket: VBucketId) -> Seqno {
        self.applied
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .filter_map(|change| match change {
                AppliedChange::Mutation { vbucket: vb, seqno, .. }
                | AppliedChange::Deletion { vbucket: vb, seqno, .. } => {
                    (*vb == vbucket).then_some(*seqno)
                }
            })
            .max()
            .unwrap_or(0)
    }
}

/// Recording stand-in for the server/network layer.
#[derive(Debug, Default)]
pub(crate) struct RecordingServerGateway {
    notifications: Mutex<Vec<(Cookie, bool)>>,
    released: Mutex<Vec<Cookie>>,
}

impl RecordingServerGateway {
    pub(crate) fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    pub(crate) fn notified_cookies(&self) -> Vec<(Cookie, bool)> {
        self.notifications
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn released_cookies(&self) -> Vec<Cookie> {
        self.released
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl ServerGateway for RecordingServerGateway {
    fn notify_io_complete(&self, cookie: Cookie, status: EngineResult<()>) {
        self.notifications
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((cookie, status.is_ok()));
    }

    fn release_reference(&self, cookie: Cookie) {
        self.released
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(cookie);
    }
}
