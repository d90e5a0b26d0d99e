//! Canonical identifier types used across the DCP core, storage, and engine seams.

/// Numeric vbucket (partition) identifier inside a single bucket.
pub type VBucketId = u16;

/// Monotonic per-vbucket sequence number.
pub type Seqno = u64;

/// Client-chosen request correlation value echoed back on stream responses.
pub type Opaque = u32;

/// Opaque handle for a client connection, minted by the server layer.
pub type Cookie = u64;

/// Failover-epoch identifier of one vbucket.
pub type VBucketUuid = u64;

/// Stream open request flag word.
pub type StreamFlags = u32;

/// Sentinel end seqno meaning "stream forever".
pub const DCP_MAX_SEQNO: Seqno = u64::MAX;

/// Stream request flag: the caller wants a takeover handoff once caught up.
pub const STREAM_FLAG_TAKEOVER: StreamFlags = 0x01;
/// Stream request flag: stream only what is already on disk, then end.
pub const STREAM_FLAG_DISKONLY: StreamFlags = 0x02;
/// Stream request flag: end at the vbucket's current high seqno.
pub const STREAM_FLAG_LATEST: StreamFlags = 0x04;

/// Snapshot marker flag: the snapshot was produced from the in-memory checkpoint log.
pub const MARKER_FLAG_MEMORY: u32 = 0x01;
/// Snapshot marker flag: the snapshot was produced by a disk backfill.
pub const MARKER_FLAG_DISK: u32 = 0x02;
/// Snapshot marker flag: the snapshot maps to one checkpoint boundary.
pub const MARKER_FLAG_CHK: u32 = 0x04;
/// Snapshot marker flag: the receiver must acknowledge the snapshot once applied.
pub const MARKER_FLAG_ACK: u32 = 0x08;

/// Strongly typed vbucket-count wrapper to avoid passing raw integers around registry APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VBucketCount(u16);

impl VBucketCount {
    /// Creates a validated vbucket-count value.
    ///
    /// Returns `None` for zero because a bucket always partitions its keyspace into at least
    /// one vbucket.
    #[must_use]
    pub fn new(value: u16) -> Option<Self> {
        if value == 0 { None } else { Some(Self(value)) }
    }

    /// Returns the inner count.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::VBucketCount;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn vbucket_count_rejects_zero() {
        assert_that!(VBucketCount::new(0), eq(None));
    }

    #[rstest]
    #[case(1)]
    #[case(1024)]
    #[case(u16::MAX)]
    fn vbucket_count_accepts_positive_values(#[case] input: u16) {
        let count = VBucketCount::new(input).expect("positive count must be valid");
        assert_that!(count.get(), eq(input));
    }
}
