//! Storage-engine scan seam consumed by backfill tasks.

use reef_common::error::EngineResult;
use reef_common::ids::{Seqno, VBucketId};

use crate::item::Item;

/// Origin of one backfill item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillSource {
    /// The item was still resident in memory when the scan ran.
    Memory,
    /// The item was read from the on-disk store.
    Disk,
}

/// Receiver of one backfill scan's output, in seqno order.
///
/// Implementations must tolerate `item` returning `false` (receiver buffer full); a store may
/// stop the scan early in that case and the producer re-wakes its backfill tasks once the
/// buffer drains.
pub trait BackfillVisitor {
    /// Announces the disk snapshot range whose items follow.
    ///
    /// Must be called before the first item of every disk snapshot.
    fn mark_disk_snapshot(&mut self, start_seqno: Seqno, end_seqno: Seqno);

    /// Delivers one scanned item. Returns `false` when the receiver cannot buffer more.
    fn item(&mut self, item: Item, source: BackfillSource) -> bool;
}

/// Historical scan surface of the on-disk store.
pub trait BackfillStore: Send + Sync {
    /// Replays one vbucket's history in `[start_seqno, end_seqno]` into `visitor`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotMyVbucket` when the vbucket has no on-disk presence here, or a
    /// storage-level error when the scan itself fails.
    fn scan(
        &self,
        vbucket: VBucketId,
        start_seqno: Seqno,
        end_seqno: Seqno,
        visitor: &mut dyn BackfillVisitor,
    ) -> EngineResult<()>;

    /// Estimates how many items a scan of `[start_seqno, end_seqno]` would deliver.
    fn estimate_items(&self, vbucket: VBucketId, start_seqno: Seqno, end_seqno: Seqno) -> u64;
}
