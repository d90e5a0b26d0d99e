//! Stream state machines shared between producer and consumer connections.

pub mod active;
pub mod notifier;
pub mod passive;

pub use active::ActiveStream;
pub use notifier::NotifierStream;
pub use passive::PassiveStream;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};

use reef_common::ids::{Opaque, Seqno, StreamFlags, VBucketId, VBucketUuid};

use crate::message::{DcpMessage, EndStreamStatus};

/// Stream lifecycle state.
///
/// Transitions are monotonic per stream type; `Dead` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    /// Created but not yet started.
    Pending = 0,
    /// Historical items are being read from the on-disk store.
    Backfilling = 1,
    /// Real-time items are being drained from the checkpoint log.
    InMemory = 2,
    /// Takeover handoff: draining remaining items and requesting the state switch.
    TakeoverSend = 3,
    /// Takeover handoff: awaiting the receiver's final acknowledgement.
    TakeoverWait = 4,
    /// Consumer-side stream actively receiving.
    Reading = 5,
    /// Terminal state; no further transitions.
    Dead = 6,
}

impl StreamState {
    /// Returns the textual state label used by stats and log output.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Backfilling => "backfilling",
            Self::InMemory => "in-memory",
            Self::TakeoverSend => "takeover-send",
            Self::TakeoverWait => "takeover-wait",
            Self::Reading => "reading",
            Self::Dead => "dead",
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Pending,
            1 => Self::Backfilling,
            2 => Self::InMemory,
            3 => Self::TakeoverSend,
            4 => Self::TakeoverWait,
            5 => Self::Reading,
            _ => Self::Dead,
        }
    }
}

/// Stream role on its owning connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    /// Producer-side stream emitting mutations.
    Active,
    /// Producer-side stream signalling seqno availability only.
    Notifier,
    /// Consumer-side stream receiving mutations.
    Passive,
}

impl StreamType {
    /// Returns the textual type label used by stats output.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Notifier => "notifier",
            Self::Passive => "passive",
        }
    }
}

/// Kind of the snapshot a passive stream is currently applying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SnapshotType {
    /// No snapshot is open.
    None = 0,
    /// The open snapshot came from a disk backfill.
    Disk = 1,
    /// The open snapshot came from the in-memory checkpoint log.
    Memory = 2,
}

impl SnapshotType {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Disk,
            2 => Self::Memory,
            _ => Self::None,
        }
    }
}

/// Outcome of one passive-stream buffer drain cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessItemsResult {
    /// The buffer was fully drained.
    AllProcessed,
    /// The batch budget ran out with messages still buffered.
    MoreToProcess,
    /// The engine pushed back; the failing message was re-queued at the buffer head.
    CannotProcess,
}

/// Parameters of one stream open request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRequest {
    /// Stream behavior flag word.
    pub flags: StreamFlags,
    /// Request correlation value echoed on responses.
    pub opaque: Opaque,
    /// Addressed vbucket.
    pub vbucket: VBucketId,
    /// First seqno the caller already holds (exclusive lower bound of delivery).
    pub start_seqno: Seqno,
    /// Last seqno requested (`DCP_MAX_SEQNO` streams forever).
    pub end_seqno: Seqno,
    /// Failover epoch the caller resumes from.
    pub vb_uuid: VBucketUuid,
    /// Start of the snapshot the caller's start seqno lies in.
    pub snap_start_seqno: Seqno,
    /// End of the snapshot the caller's start seqno lies in.
    pub snap_end_seqno: Seqno,
}

/// Identity and shared bookkeeping common to all stream types.
#[derive(Debug)]
pub struct StreamCore {
    name: String,
    flags: StreamFlags,
    opaque: AtomicU32,
    vbucket: VBucketId,
    start_seqno: Seqno,
    end_seqno: Seqno,
    vb_uuid: VBucketUuid,
    snap_start_seqno: Seqno,
    snap_end_seqno: Seqno,
    state: AtomicU8,
    items_ready: AtomicBool,
    ready_bytes: Arc<AtomicU64>,
}

impl StreamCore {
    pub(crate) fn new(
        name: String,
        request: &StreamRequest,
        initial_state: StreamState,
        ready_bytes: Arc<AtomicU64>,
    ) -> Self {
        Self {
            name,
            flags: request.flags,
            opaque: AtomicU32::new(request.opaque),
            vbucket: request.vbucket,
            start_seqno: request.start_seqno,
            end_seqno: request.end_seqno,
            vb_uuid: request.vb_uuid,
            snap_start_seqno: request.snap_start_seqno,
            snap_end_seqno: request.snap_end_seqno,
            state: AtomicU8::new(initial_state as u8),
            items_ready: AtomicBool::new(false),
            ready_bytes,
        }
    }

    /// Stream name; equals the owning connection's canonical name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stream open request flag word.
    #[must_use]
    pub fn flags(&self) -> StreamFlags {
        self.flags
    }

    /// Current request correlation value.
    #[must_use]
    pub fn opaque(&self) -> Opaque {
        self.opaque.load(Ordering::Acquire)
    }

    pub(crate) fn set_opaque(&self, opaque: Opaque) {
        self.opaque.store(opaque, Ordering::Release);
    }

    /// Addressed vbucket.
    #[must_use]
    pub fn vbucket(&self) -> VBucketId {
        self.vbucket
    }

    /// Requested start seqno.
    #[must_use]
    pub fn start_seqno(&self) -> Seqno {
        self.start_seqno
    }

    /// Requested end seqno.
    #[must_use]
    pub fn end_seqno(&self) -> Seqno {
        self.end_seqno
    }

    /// Failover epoch the stream was opened against.
    #[must_use]
    pub fn vb_uuid(&self) -> VBucketUuid {
        self.vb_uuid
    }

    /// Start of the caller's resume snapshot.
    #[must_use]
    pub fn snap_start_seqno(&self) -> Seqno {
        self.snap_start_seqno
    }

    /// End of the caller's resume snapshot.
    #[must_use]
    pub fn snap_end_seqno(&self) -> Seqno {
        self.snap_end_seqno
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the stream has not reached its terminal state.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() != StreamState::Dead
    }

    /// Lock-free ready-queue byte count.
    #[must_use]
    pub fn ready_queue_bytes(&self) -> u64 {
        self.ready_bytes.load(Ordering::Acquire)
    }

    /// To be called only under the owning stream's mutex.
    pub(crate) fn set_state(&self, new_state: StreamState) {
        let old_state = self.state();
        tracing::debug!(
            vbucket = self.vbucket,
            from = old_state.as_label(),
            to = new_state.as_label(),
            "stream transition"
        );
        self.state.store(new_state as u8, Ordering::Release);
    }

    pub(crate) fn set_items_ready(&self, ready: bool) {
        self.items_ready.store(ready, Ordering::Release);
    }

    pub(crate) fn items_ready(&self) -> bool {
        self.items_ready.load(Ordering::Acquire)
    }
}

/// Tagged handle dispatching over the three stream variants.
///
/// Only the owning connection holds this strong handle; indices and work queues keep weak
/// back-references.
#[derive(Debug, Clone)]
pub enum DcpStream {
    /// Producer-side mutation stream.
    Active(Arc<ActiveStream>),
    /// Producer-side seqno-availability stream.
    Notifier(Arc<NotifierStream>),
    /// Consumer-side receive stream.
    Passive(Arc<PassiveStream>),
}

impl DcpStream {
    /// Shared identity/bookkeeping record.
    #[must_use]
    pub fn core(&self) -> &StreamCore {
        match self {
            Self::Active(stream) => stream.core(),
            Self::Notifier(stream) => stream.core(),
            Self::Passive(stream) => stream.core(),
        }
    }

    /// Stream role tag.
    #[must_use]
    pub fn stream_type(&self) -> StreamType {
        match self {
            Self::Active(_) => StreamType::Active,
            Self::Notifier(_) => StreamType::Notifier,
            Self::Passive(_) => StreamType::Passive,
        }
    }

    /// Pulls the next pending protocol message, if one is available.
    #[must_use]
    pub fn next(&self) -> Option<DcpMessage> {
        match self {
            Self::Active(stream) => stream.next(),
            Self::Notifier(stream) => stream.next(),
            Self::Passive(stream) => stream.next(),
        }
    }

    /// Terminates the stream with the given reason; idempotent.
    pub fn set_dead(&self, status: EndStreamStatus) -> Opaque {
        match self {
            Self::Active(stream) => stream.set_dead(status),
            Self::Notifier(stream) => stream.set_dead(status),
            Self::Passive(stream) => stream.set_dead(status),
        }
    }

    /// Signals that one seqno became available in the stream's vbucket.
    pub fn notify_seqno_available(&self, seqno: Seqno) {
        match self {
            Self::Active(stream) => stream.notify_seqno_available(seqno),
            Self::Notifier(stream) => stream.notify_seqno_available(seqno),
            Self::Passive(_) => {}
        }
    }

    /// Drops and frees all pending ready-queue messages.
    pub fn clear(&self) {
        match self {
            Self::Active(stream) => stream.clear(),
            Self::Notifier(stream) => stream.clear(),
            Self::Passive(stream) => stream.clear(),
        }
    }

    /// Appends per-stream stats rows.
    pub fn append_stats(&self, out: &mut Vec<(String, String)>) {
        match self {
            Self::Active(stream) => stream.append_stats(out),
            Self::Notifier(stream) => stream.append_stats(out),
            Self::Passive(stream) => stream.append_stats(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SnapshotType, StreamState, StreamType};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(StreamState::Pending, "pending")]
    #[case(StreamState::Backfilling, "backfilling")]
    #[case(StreamState::InMemory, "in-memory")]
    #[case(StreamState::TakeoverSend, "takeover-send")]
    #[case(StreamState::TakeoverWait, "takeover-wait")]
    #[case(StreamState::Reading, "reading")]
    #[case(StreamState::Dead, "dead")]
    fn stream_state_labels(#[case] state: StreamState, #[case] label: &str) {
        assert_that!(state.as_label(), eq(label));
    }

    #[rstest]
    fn stream_state_round_trips_through_atomic_encoding() {
        for state in [
            StreamState::Pending,
            StreamState::Backfilling,
            StreamState::InMemory,
            StreamState::TakeoverSend,
            StreamState::TakeoverWait,
            StreamState::Reading,
            StreamState::Dead,
        ] {
            assert_that!(StreamState::from_u8(state as u8), eq(state));
        }
    }

    #[rstest]
    fn snapshot_type_round_trips_through_atomic_encoding() {
        for kind in [SnapshotType::None, SnapshotType::Disk, SnapshotType::Memory] {
            assert_that!(SnapshotType::from_u8(kind as u8), eq(kind));
        }
    }

    #[rstest]
    fn stream_type_labels() {
        assert_that!(StreamType::Active.as_label(), eq("active"));
        assert_that!(StreamType::Notifier.as_label(), eq("notifier"));
        assert_that!(StreamType::Passive.as_label(), eq("passive"));
    }
}
