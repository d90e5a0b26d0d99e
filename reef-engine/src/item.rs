//! Item and queued-item model shared by producer and consumer pathways.

use reef_common::ids::Seqno;

/// One versioned key-value document as it travels through replication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Document key bytes.
    pub key: Vec<u8>,
    /// Document value bytes; empty for deletions and key-only streams.
    pub value: Vec<u8>,
    /// Compare-and-swap token assigned by the owning node.
    pub cas: u64,
    /// Per-document revision counter used for conflict resolution.
    pub rev_seqno: u64,
    /// Client-visible item flags.
    pub flags: u32,
    /// Expiration time in unix seconds; zero means no expiry.
    pub expiration: u32,
    /// Remaining lock time in seconds; zero means unlocked.
    pub lock_time: u32,
    /// Position of this change in the vbucket's sequence history.
    pub by_seqno: Seqno,
    /// Value datatype bits (raw/JSON/compressed).
    pub datatype: u8,
    /// Whether this change is a deletion.
    pub deleted: bool,
}

impl Item {
    /// Creates a plain mutation item with the given key, value, and seqno.
    #[must_use]
    pub fn mutation(key: &[u8], value: &[u8], by_seqno: Seqno) -> Self {
        Self {
            key: key.to_vec(),
            value: value.to_vec(),
            cas: 0,
            rev_seqno: 1,
            flags: 0,
            expiration: 0,
            lock_time: 0,
            by_seqno,
            datatype: 0,
            deleted: false,
        }
    }

    /// Creates a deletion item for the given key and seqno.
    #[must_use]
    pub fn deletion(key: &[u8], by_seqno: Seqno) -> Self {
        Self {
            key: key.to_vec(),
            value: Vec::new(),
            cas: 0,
            rev_seqno: 1,
            flags: 0,
            expiration: 0,
            lock_time: 0,
            by_seqno,
            datatype: 0,
            deleted: true,
        }
    }
}

/// Requested vbucket membership state, as carried by takeover handoffs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VBucketState {
    /// This node owns the vbucket and serves its traffic.
    Active,
    /// This node holds a replica copy.
    Replica,
    /// Ownership transfer to this node is in flight.
    Pending,
    /// The vbucket is decommissioned on this node.
    Dead,
}

impl VBucketState {
    /// Returns the textual state label used by stats and log output.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Replica => "replica",
            Self::Pending => "pending",
            Self::Dead => "dead",
        }
    }
}

/// One record drained from a vbucket's checkpoint log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedItem {
    /// A document write.
    Mutation(Item),
    /// A document removal.
    Deletion(Item),
    /// Start-of-checkpoint meta record.
    CheckpointStart(Seqno),
    /// End-of-checkpoint meta record.
    CheckpointEnd(Seqno),
    /// Queued vbucket state transition.
    SetVBucketState(VBucketState),
}

impl QueuedItem {
    /// Returns the seqno this record occupies, when it occupies one.
    #[must_use]
    pub fn by_seqno(&self) -> Option<Seqno> {
        match self {
            Self::Mutation(item) | Self::Deletion(item) => Some(item.by_seqno),
            Self::CheckpointStart(seqno) | Self::CheckpointEnd(seqno) => Some(*seqno),
            Self::SetVBucketState(_) => None,
        }
    }

    /// Returns whether this record is checkpoint metadata rather than a document change.
    #[must_use]
    pub fn is_meta(&self) -> bool {
        matches!(
            self,
            Self::CheckpointStart(_) | Self::CheckpointEnd(_) | Self::SetVBucketState(_)
        )
    }
}
