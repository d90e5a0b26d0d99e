//! Wire-equivalent DCP message model with per-message byte accounting.

use reef_common::error::EngineError;
use reef_common::ids::{Opaque, Seqno, VBucketId};
use reef_engine::item::{Item, VBucketState};

/// Binary protocol frame header size in bytes.
const HEADER_BYTES: u64 = 24;
/// Extras section sizes per message kind, matching the legacy binary protocol layout.
const MUTATION_EXTRAS_BYTES: u64 = 31;
const DELETION_EXTRAS_BYTES: u64 = 18;
const MARKER_EXTRAS_BYTES: u64 = 20;
const STREAM_END_EXTRAS_BYTES: u64 = 4;
const SET_STATE_EXTRAS_BYTES: u64 = 1;
const ADD_STREAM_EXTRAS_BYTES: u64 = 4;

/// Reason carried by one stream-end message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndStreamStatus {
    /// The stream ended after all requested items were streamed.
    Ok,
    /// The stream closed early due to a close-stream request.
    Closed,
    /// The stream closed early because the vbucket state changed.
    StateChanged,
    /// The stream closed early because the connection was disconnected.
    Disconnected,
    /// The stream was closed early because the consumer was too slow.
    Slow,
}

impl EndStreamStatus {
    /// Returns the wire status label.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Closed => "Closed",
            Self::StateChanged => "State",
            Self::Disconnected => "Disconnected",
            Self::Slow => "Slow",
        }
    }
}

/// Whether producer mutations carry values or keys only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPayloadKind {
    /// Mutations carry both key and value.
    KeyAndValue,
    /// Mutations carry the key only.
    KeyOnly,
}

/// One protocol message queued on a stream's ready queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DcpMessage {
    /// Terminates one stream, carrying the reason.
    StreamEnd {
        opaque: Opaque,
        vbucket: VBucketId,
        status: EndStreamStatus,
    },
    /// Announces the snapshot range whose mutations follow.
    SnapshotMarker {
        opaque: Opaque,
        vbucket: VBucketId,
        start_seqno: Seqno,
        end_seqno: Seqno,
        flags: u32,
    },
    /// One replicated document write.
    Mutation {
        opaque: Opaque,
        vbucket: VBucketId,
        item: Item,
        payload: MutationPayloadKind,
    },
    /// One replicated document removal.
    Deletion {
        opaque: Opaque,
        vbucket: VBucketId,
        item: Item,
    },
    /// One expiry-driven removal; semantically equivalent to a deletion.
    Expiration {
        opaque: Opaque,
        vbucket: VBucketId,
        item: Item,
    },
    /// Requests a vbucket membership state change on the receiver (takeover handoff).
    SetVBucketState {
        opaque: Opaque,
        vbucket: VBucketId,
        state: VBucketState,
    },
    /// Legacy flush request; carried for wire parity, never acted on.
    Flush { opaque: Opaque, vbucket: VBucketId },
    /// Consumer response accepting or rejecting an add-stream request.
    AddStreamResponse {
        opaque: Opaque,
        stream_opaque: Opaque,
        status: Result<(), EngineError>,
    },
    /// Consumer acknowledgement of one applied snapshot.
    SnapshotMarkerAck { opaque: Opaque, vbucket: VBucketId },
    /// Consumer acknowledgement of one applied vbucket state change.
    SetVBucketStateAck { opaque: Opaque, vbucket: VBucketId },
}

impl DcpMessage {
    /// Returns the wire size this message accounts for in ready-queue byte tracking.
    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            Self::StreamEnd { .. } => HEADER_BYTES + STREAM_END_EXTRAS_BYTES,
            Self::SnapshotMarker { .. } => HEADER_BYTES + MARKER_EXTRAS_BYTES,
            Self::Mutation { item, payload, .. } => {
                let value_bytes = match payload {
                    MutationPayloadKind::KeyAndValue => item.value.len() as u64,
                    MutationPayloadKind::KeyOnly => 0,
                };
                HEADER_BYTES + MUTATION_EXTRAS_BYTES + item.key.len() as u64 + value_bytes
            }
            Self::Deletion { item, .. } | Self::Expiration { item, .. } => {
                HEADER_BYTES + DELETION_EXTRAS_BYTES + item.key.len() as u64
            }
            Self::SetVBucketState { .. } => HEADER_BYTES + SET_STATE_EXTRAS_BYTES,
            Self::AddStreamResponse { .. } => HEADER_BYTES + ADD_STREAM_EXTRAS_BYTES,
            Self::Flush { .. }
            | Self::SnapshotMarkerAck { .. }
            | Self::SetVBucketStateAck { .. } => HEADER_BYTES,
        }
    }

    /// Returns the seqno this message occupies in the vbucket history, when it occupies one.
    #[must_use]
    pub fn by_seqno(&self) -> Option<Seqno> {
        match self {
            Self::Mutation { item, .. }
            | Self::Deletion { item, .. }
            | Self::Expiration { item, .. } => Some(item.by_seqno),
            _ => None,
        }
    }

    /// Returns whether this message is stream metadata rather than a document change.
    #[must_use]
    pub fn is_meta(&self) -> bool {
        !matches!(
            self,
            Self::Mutation { .. } | Self::Deletion { .. } | Self::Expiration { .. }
        )
    }

    /// Returns the vbucket this message addresses, when it addresses one.
    #[must_use]
    pub fn vbucket(&self) -> Option<VBucketId> {
        match self {
            Self::StreamEnd { vbucket, .. }
            | Self::SnapshotMarker { vbucket, .. }
            | Self::Mutation { vbucket, .. }
            | Self::Deletion { vbucket, .. }
            | Self::Expiration { vbucket, .. }
            | Self::SetVBucketState { vbucket, .. }
            | Self::Flush { vbucket, .. }
            | Self::SnapshotMarkerAck { vbucket, .. }
            | Self::SetVBucketStateAck { vbucket, .. } => Some(*vbucket),
            Self::AddStreamResponse { .. } => None,
        }
    }
}
