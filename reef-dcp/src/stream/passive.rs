//! Consumer-side stream: buffered snapshot receive and apply paths.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use reef_common::error::{EngineError, EngineResult};
use reef_common::ids::{MARKER_FLAG_ACK, MARKER_FLAG_DISK, Opaque, Seqno};
use reef_engine::replica::ReplicaStore;

use crate::connection::DcpConsumer;
use crate::message::{DcpMessage, EndStreamStatus};
use crate::ready_queue::ReadyQueue;
use crate::stream::{ProcessItemsResult, SnapshotType, StreamCore, StreamRequest, StreamState};

#[derive(Debug)]
struct PassiveInner {
    ready: ReadyQueue,
    cur_snapshot_ack_pending: bool,
}

/// Receive buffer holding one passive stream's not-yet-applied messages.
///
/// Lock ordering: acquire the buffer mutex before the stream mutex, never the reverse.
#[derive(Debug)]
struct ReceiveBuffer {
    messages: Mutex<VecDeque<DcpMessage>>,
    bytes: AtomicU64,
    items: AtomicU64,
}

impl ReceiveBuffer {
    fn new() -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            bytes: AtomicU64::new(0),
            items: AtomicU64::new(0),
        }
    }

    fn lock_messages(&self) -> std::sync::MutexGuard<'_, VecDeque<DcpMessage>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_back(&self, message: DcpMessage) {
        let size = message.size();
        let mut messages = self.lock_messages();
        messages.push_back(message);
        let _ = self.bytes.fetch_add(size, Ordering::AcqRel);
        let _ = self.items.fetch_add(1, Ordering::AcqRel);
    }

    fn clear(&self) -> u64 {
        let mut messages = self.lock_messages();
        messages.clear();
        self.items.store(0, Ordering::Release);
        self.bytes.swap(0, Ordering::AcqRel)
    }
}

/// Consumer-side stream receiving one vbucket's replicated changes.
pub struct PassiveStream {
    core: StreamCore,
    consumer: Weak<DcpConsumer>,
    replica: Arc<dyn ReplicaStore>,
    buffer_bytes_limit: u64,

    last_seqno: AtomicU64,
    cur_snapshot_start: AtomicU64,
    cur_snapshot_end: AtomicU64,
    cur_snapshot_type: AtomicU8,
    cannot_process_streak: AtomicUsize,

    inner: Mutex<PassiveInner>,
    buffer: ReceiveBuffer,
}

impl std::fmt::Debug for PassiveStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassiveStream")
            .field("vbucket", &self.core.vbucket())
            .field("state", &self.core.state().as_label())
            .field("last_seqno", &self.last_seqno.load(Ordering::Acquire))
            .field("buffered_items", &self.buffer.items.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl PassiveStream {
    /// Creates one pending passive stream bound to a consumer connection.
    #[must_use]
    pub fn new(
        name: String,
        request: &StreamRequest,
        consumer: Weak<DcpConsumer>,
        replica: Arc<dyn ReplicaStore>,
        buffer_bytes_limit: u64,
    ) -> Arc<Self> {
        let ready = ReadyQueue::new();
        let core = StreamCore::new(name, request, StreamState::Pending, ready.bytes_handle());
        Arc::new(Self {
            core,
            consumer,
            replica,
            buffer_bytes_limit,
            last_seqno: AtomicU64::new(request.start_seqno),
            cur_snapshot_start: AtomicU64::new(0),
            cur_snapshot_end: AtomicU64::new(0),
            cur_snapshot_type: AtomicU8::new(SnapshotType::None as u8),
            cannot_process_streak: AtomicUsize::new(0),
            inner: Mutex::new(PassiveInner {
                ready,
                cur_snapshot_ack_pending: false,
            }),
            buffer: ReceiveBuffer::new(),
        })
    }

    /// Shared identity/bookkeeping record.
    #[must_use]
    pub fn core(&self) -> &StreamCore {
        &self.core
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, PassiveInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot_type(&self) -> SnapshotType {
        SnapshotType::from_u8(self.cur_snapshot_type.load(Ordering::Acquire))
    }

    /// Responds to the add-stream request that created this stream.
    ///
    /// A success status moves the stream into `Reading`; any error buries it.
    pub fn accept_stream(&self, status: EngineResult<()>, add_opaque: Opaque) {
        {
            let mut inner = self.lock_inner();
            let accepted = status.is_ok();
            inner.ready.push(DcpMessage::AddStreamResponse {
                opaque: add_opaque,
                stream_opaque: self.core.opaque(),
                status,
            });
            if self.core.state() == StreamState::Pending {
                self.core
                    .set_state(if accepted { StreamState::Reading } else { StreamState::Dead });
            }
            self.core.set_items_ready(true);
        }
        self.notify_consumer();
    }

    fn notify_consumer(&self) {
        if let Some(consumer) = self.consumer.upgrade() {
            consumer.notify_stream_ready(self.core.vbucket());
        }
    }

    fn wake_processor(&self) {
        if let Some(consumer) = self.consumer.upgrade() {
            consumer.wake_buffer_processor();
        }
    }

    /// Receive path: routes one incoming protocol message.
    ///
    /// Markers update the open-snapshot window immediately. Document changes are buffered when
    /// the buffer has capacity (and always when it is non-empty, to preserve FIFO order);
    /// otherwise they are applied directly.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::OutOfRange` for a non-monotonic seqno, `EngineError::TempFail`
    /// when neither buffering nor direct apply can accept the message, and any direct-apply
    /// engine error.
    pub fn message_received(&self, message: DcpMessage) -> EngineResult<()> {
        if !self.core.is_active() {
            return Err(EngineError::InvalidState("stream is no longer active"));
        }

        match &message {
            DcpMessage::SnapshotMarker {
                start_seqno,
                end_seqno,
                flags,
                ..
            } => {
                self.process_marker(*start_seqno, *end_seqno, *flags);
                return Ok(());
            }
            DcpMessage::StreamEnd { status, .. } => {
                let status = *status;
                let _ = self.set_dead(status);
                return Ok(());
            }
            DcpMessage::Mutation { item, .. }
            | DcpMessage::Deletion { item, .. }
            | DcpMessage::Expiration { item, .. } => {
                if item.by_seqno <= self.last_seqno.load(Ordering::Acquire) {
                    tracing::warn!(
                        vbucket = self.core.vbucket(),
                        seqno = item.by_seqno,
                        last_seqno = self.last_seqno.load(Ordering::Acquire),
                        "dropping out-of-order passive stream message"
                    );
                    return Err(EngineError::OutOfRange(
                        "message seqno must advance past the last applied seqno",
                    ));
                }
            }
            _ => {}
        }

        let buffered_items = self.buffer.items.load(Ordering::Acquire);
        let has_capacity = self.buffer.bytes.load(Ordering::Acquire) < self.buffer_bytes_limit;
        let in_snapshot = self.snapshot_type() != SnapshotType::None;

        if buffered_items > 0 {
            // FIFO order would break if later messages bypassed the buffer.
            if !has_capacity {
                return Err(EngineError::TempFail);
            }
            self.buffer.push_back(message);
            self.wake_processor();
            return Ok(());
        }
        if in_snapshot && has_capacity {
            self.buffer.push_back(message);
            self.wake_processor();
            return Ok(());
        }
        self.apply_message(&message)
    }

    fn apply_message(&self, message: &DcpMessage) -> EngineResult<()> {
        match message {
            DcpMessage::Mutation { item, .. } => {
                self.check_snapshot_window(item.by_seqno)?;
                self.replica.apply_mutation(self.core.vbucket(), item)?;
                self.last_seqno.store(item.by_seqno, Ordering::Release);
                self.handle_snapshot_end(item.by_seqno);
                Ok(())
            }
            DcpMessage::Deletion { item, .. } | DcpMessage::Expiration { item, .. } => {
                self.check_snapshot_window(item.by_seqno)?;
                self.replica.apply_deletion(self.core.vbucket(), item)?;
                self.last_seqno.store(item.by_seqno, Ordering::Release);
                self.handle_snapshot_end(item.by_seqno);
                Ok(())
            }
            DcpMessage::SnapshotMarker {
                start_seqno,
                end_seqno,
                flags,
                ..
            } => {
                self.process_marker(*start_seqno, *end_seqno, *flags);
                Ok(())
            }
            DcpMessage::SetVBucketState { state, .. } => {
                self.replica.set_vbucket_state(self.core.vbucket(), *state)?;
                {
                    let mut inner = self.lock_inner();
                    inner.ready.push(DcpMessage::SetVBucketStateAck {
                        opaque: self.core.opaque(),
                        vbucket: self.core.vbucket(),
                    });
                    self.core.set_items_ready(true);
                }
                self.notify_consumer();
                Ok(())
            }
            DcpMessage::StreamEnd { status, .. } => {
                let _ = self.set_dead(*status);
                Ok(())
            }
            _ => Err(EngineError::NotSupported(
                "message kind is not valid on a passive stream",
            )),
        }
    }

    fn check_snapshot_window(&self, seqno: Seqno) -> EngineResult<()> {
        if self.snapshot_type() != SnapshotType::None
            && seqno > self.cur_snapshot_end.load(Ordering::Acquire)
        {
            return Err(EngineError::OutOfRange(
                "mutation seqno lies past the open snapshot's end",
            ));
        }
        Ok(())
    }

    fn process_marker(&self, start_seqno: Seqno, end_seqno: Seqno, flags: u32) {
        let mut inner = self.lock_inner();
        self.cur_snapshot_start.store(start_seqno, Ordering::Release);
        self.cur_snapshot_end.store(end_seqno, Ordering::Release);
        let kind = if flags & MARKER_FLAG_DISK != 0 {
            SnapshotType::Disk
        } else {
            SnapshotType::Memory
        };
        self.cur_snapshot_type.store(kind as u8, Ordering::Release);
        inner.cur_snapshot_ack_pending = flags & MARKER_FLAG_ACK != 0;
    }

    fn handle_snapshot_end(&self, seqno: Seqno) {
        if seqno != self.cur_snapshot_end.load(Ordering::Acquire) {
            return;
        }
        let kind = self.snapshot_type();
        if kind == SnapshotType::None {
            return;
        }
        if kind == SnapshotType::Disk
            && let Err(error) = self
                .replica
                .persist_snapshot_boundary(self.core.vbucket(), seqno)
        {
            tracing::warn!(
                vbucket = self.core.vbucket(),
                %error,
                "failed to persist disk snapshot boundary"
            );
        }
        let ack = {
            let mut inner = self.lock_inner();
            if inner.cur_snapshot_ack_pending {
                inner.cur_snapshot_ack_pending = false;
                inner.ready.push(DcpMessage::SnapshotMarkerAck {
                    opaque: self.core.opaque(),
                    vbucket: self.core.vbucket(),
                });
                self.core.set_items_ready(true);
                true
            } else {
                false
            }
        };
        self.cur_snapshot_type
            .store(SnapshotType::None as u8, Ordering::Release);
        if ack {
            self.notify_consumer();
        }
    }

    /// Apply path: drains up to `batch_size` buffered messages.
    ///
    /// Returns the drain outcome plus the bytes applied this cycle. On engine back-pressure
    /// the failing message returns to the buffer head and the cycle reports `CannotProcess`.
    pub fn process_buffered_messages(&self, batch_size: usize) -> (ProcessItemsResult, u64) {
        let mut batch = {
            let mut messages = self.buffer.lock_messages();
            let take = batch_size.min(messages.len());
            let mut batch = VecDeque::with_capacity(take);
            for _ in 0..take {
                let Some(message) = messages.pop_front() else {
                    break;
                };
                let _ = self.buffer.bytes.fetch_sub(message.size(), Ordering::AcqRel);
                let _ = self.buffer.items.fetch_sub(1, Ordering::AcqRel);
                batch.push_back(message);
            }
            batch
        };

        let mut processed_bytes = 0_u64;
        while let Some(message) = batch.pop_front() {
            match self.apply_message(&message) {
                Ok(()) => {
                    processed_bytes += message.size();
                    self.cannot_process_streak.store(0, Ordering::Release);
                }
                Err(EngineError::TempFail) => {
                    // Back-pressure: the whole unprocessed tail returns to the buffer head.
                    let mut messages = self.buffer.lock_messages();
                    batch.push_front(message);
                    while let Some(unprocessed) = batch.pop_back() {
                        let _ = self
                            .buffer
                            .bytes
                            .fetch_add(unprocessed.size(), Ordering::AcqRel);
                        let _ = self.buffer.items.fetch_add(1, Ordering::AcqRel);
                        messages.push_front(unprocessed);
                    }
                    let _ = self.cannot_process_streak.fetch_add(1, Ordering::AcqRel);
                    return (ProcessItemsResult::CannotProcess, processed_bytes);
                }
                Err(error) => {
                    tracing::warn!(
                        vbucket = self.core.vbucket(),
                        %error,
                        "dropping unprocessable buffered message"
                    );
                }
            }
        }

        if self.buffer.items.load(Ordering::Acquire) > 0 {
            (ProcessItemsResult::MoreToProcess, processed_bytes)
        } else {
            (ProcessItemsResult::AllProcessed, processed_bytes)
        }
    }

    /// Consecutive `CannotProcess` cycles since the last successful apply.
    #[must_use]
    pub fn cannot_process_streak(&self) -> usize {
        self.cannot_process_streak.load(Ordering::Acquire)
    }

    /// Resumes the stream on a reconnected consumer: new opaque, rewound seqno, empty buffer.
    pub fn reconnect_stream(&self, new_opaque: Opaque, start_seqno: Seqno) {
        let dropped = self.buffer.clear();
        self.core.set_opaque(new_opaque);
        self.last_seqno.store(start_seqno, Ordering::Release);
        self.cur_snapshot_type
            .store(SnapshotType::None as u8, Ordering::Release);
        tracing::debug!(
            vbucket = self.core.vbucket(),
            start_seqno,
            dropped_bytes = dropped,
            "passive stream reconnected"
        );
    }

    /// Pulls the next pending consumer response (acks, add-stream replies, end notices).
    #[must_use]
    pub fn next(&self) -> Option<DcpMessage> {
        let mut inner = self.lock_inner();
        let message = inner.ready.pop();
        if message.is_none() {
            self.core.set_items_ready(false);
        }
        message
    }

    /// Terminates the stream, freeing buffered work and queueing a local end notification.
    ///
    /// Idempotent; concurrent calls collapse into one transition and one message.
    pub fn set_dead(&self, status: EndStreamStatus) -> Opaque {
        // Buffer mutex strictly before the stream mutex.
        let dropped = self.buffer.clear();
        let notify = {
            let mut inner = self.lock_inner();
            if self.core.state() == StreamState::Dead {
                false
            } else {
                self.core.set_state(StreamState::Dead);
                inner.ready.clear();
                inner.ready.push(DcpMessage::StreamEnd {
                    opaque: self.core.opaque(),
                    vbucket: self.core.vbucket(),
                    status,
                });
                self.core.set_items_ready(true);
                tracing::info!(
                    vbucket = self.core.vbucket(),
                    status = status.as_label(),
                    dropped_bytes = dropped,
                    last_seqno = self.last_seqno.load(Ordering::Acquire),
                    "passive stream ended"
                );
                true
            }
        };
        if notify {
            self.notify_consumer();
        }
        self.core.opaque()
    }

    /// Drops and frees all pending ready-queue messages.
    pub fn clear(&self) {
        let mut inner = self.lock_inner();
        inner.ready.clear();
    }

    /// Bytes currently held in the receive buffer.
    #[must_use]
    pub fn buffered_bytes(&self) -> u64 {
        self.buffer.bytes.load(Ordering::Acquire)
    }

    /// Messages currently held in the receive buffer.
    #[must_use]
    pub fn buffered_items(&self) -> u64 {
        self.buffer.items.load(Ordering::Acquire)
    }

    /// Highest seqno applied through this stream.
    #[must_use]
    pub fn last_seqno(&self) -> Seqno {
        self.last_seqno.load(Ordering::Acquire)
    }

    /// Appends per-stream stats rows.
    pub fn append_stats(&self, out: &mut Vec<(String, String)>) {
        let prefix = format!("{}:stream_{}", self.core.name(), self.core.vbucket());
        out.push((
            format!("{prefix}:state"),
            self.core.state().as_label().to_owned(),
        ));
        out.push((format!("{prefix}:last_seqno"), self.last_seqno().to_string()));
        out.push((
            format!("{prefix}:buffer_bytes"),
            self.buffered_bytes().to_string(),
        ));
        out.push((
            format!("{prefix}:buffer_items"),
            self.buffered_items().to_string(),
        ));
        out.push((
            format!("{prefix}:cur_snapshot_start"),
            self.cur_snapshot_start.load(Ordering::Acquire).to_string(),
        ));
        out.push((
            format!("{prefix}:cur_snapshot_end"),
            self.cur_snapshot_end.load(Ordering::Acquire).to_string(),
        ));
    }
}
