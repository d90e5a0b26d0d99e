//! Replica-vbucket apply seam consumed by passive streams.

use reef_common::error::EngineResult;
use reef_common::ids::{Seqno, VBucketId};

use crate::item::{Item, VBucketState};

/// Apply surface of one node's replica vbuckets.
///
/// `EngineError::TempFail` from any apply method signals engine back-pressure; the caller
/// re-queues the message and retries on its next processor cycle.
pub trait ReplicaStore: Send + Sync {
    /// Returns whether this node hosts the vbucket as a replica target.
    fn hosts_vbucket(&self, vbucket: VBucketId) -> bool;

    /// Applies one replicated mutation.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::TempFail` under back-pressure and `EngineError::NotMyVbucket`
    /// when the vbucket is not hosted as a replica here.
    fn apply_mutation(&self, vbucket: VBucketId, item: &Item) -> EngineResult<()>;

    /// Applies one replicated deletion.
    ///
    /// # Errors
    ///
    /// Same contract as [`ReplicaStore::apply_mutation`].
    fn apply_deletion(&self, vbucket: VBucketId, item: &Item) -> EngineResult<()>;

    /// Applies one vbucket membership state transition.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotMyVbucket` when the vbucket is not hosted here.
    fn set_vbucket_state(&self, vbucket: VBucketId, state: VBucketState) -> EngineResult<()>;

    /// Records the end of one applied disk snapshot as a durable checkpoint boundary.
    ///
    /// # Errors
    ///
    /// Returns a storage-level error when the boundary cannot be persisted.
    fn persist_snapshot_boundary(&self, vbucket: VBucketId, end_seqno: Seqno) -> EngineResult<()>;

    /// Returns the highest seqno applied to one replica vbucket.
    fn high_seqno(&self, vbucket: VBucketId) -> Seqno;
}
