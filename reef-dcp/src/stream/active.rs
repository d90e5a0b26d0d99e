//! Producer-side stream state machine: backfill, in-memory tailing, takeover handoff.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use atomic_float::AtomicF32;
use reef_common::error::EngineResult;
use reef_common::ids::{
    DCP_MAX_SEQNO, MARKER_FLAG_ACK, MARKER_FLAG_CHK, MARKER_FLAG_DISK, MARKER_FLAG_MEMORY,
    Opaque, Seqno, STREAM_FLAG_DISKONLY, STREAM_FLAG_TAKEOVER,
};
use reef_engine::backfill_store::BackfillSource;
use reef_engine::checkpoint::{CheckpointLog, CursorBatch};
use reef_engine::item::{Item, QueuedItem, VBucketState};

use crate::backfill::BUFFERED_BACKFILL_BYTES_LIMIT;
use crate::connection::{DcpProducer, unix_secs_now};
use crate::message::{DcpMessage, EndStreamStatus, MutationPayloadKind};
use crate::processor::CheckpointProcessorTask;
use crate::ready_queue::ReadyQueue;
use crate::stream::{StreamCore, StreamRequest, StreamState};

/// Checkpoint records pulled per extraction pass.
const CHECKPOINT_DRAIN_BATCH: usize = 256;

#[derive(Debug)]
struct ActiveInner {
    ready: ReadyQueue,
    first_marker_sent: bool,
    backfill_completed: bool,
    takeover_state: VBucketState,
    takeover_state_sent: bool,
}

/// Producer-side stream emitting one vbucket's mutations in snapshot order.
pub struct ActiveStream {
    core: StreamCore,
    self_ref: Weak<ActiveStream>,
    producer: Weak<DcpProducer>,
    checkpoint: Arc<dyn CheckpointLog>,
    processor: Arc<CheckpointProcessorTask>,
    min_compression_ratio: Arc<AtomicF32>,
    payload: MutationPayloadKind,

    last_read_seqno: AtomicU64,
    last_sent_seqno: AtomicU64,
    cur_chk_seqno: AtomicU64,
    last_sent_snap_end_seqno: AtomicU64,
    backfill_remaining: AtomicU64,
    backfill_items_memory: AtomicU64,
    backfill_items_disk: AtomicU64,
    backfill_items_sent: AtomicU64,
    items_from_memory_phase: AtomicU64,
    is_backfill_task_running: AtomicBool,
    buffered_backfill_bytes: AtomicU64,
    buffered_backfill_items: AtomicU64,
    chk_extraction_in_progress: AtomicBool,
    wait_for_snapshot: AtomicU64,
    takeover_start_secs: AtomicU64,
    last_send_time_secs: AtomicU64,

    inner: Mutex<ActiveInner>,
}

impl std::fmt::Debug for ActiveStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveStream")
            .field("vbucket", &self.core.vbucket())
            .field("state", &self.core.state().as_label())
            .field("last_read_seqno", &self.last_read_seqno.load(Ordering::Acquire))
            .field("last_sent_seqno", &self.last_sent_seqno.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl ActiveStream {
    /// Creates one pending active stream bound to a producer connection.
    #[must_use]
    pub fn new(
        name: String,
        request: &StreamRequest,
        producer: Weak<DcpProducer>,
        checkpoint: Arc<dyn CheckpointLog>,
        processor: Arc<CheckpointProcessorTask>,
        min_compression_ratio: Arc<AtomicF32>,
        payload: MutationPayloadKind,
    ) -> Arc<Self> {
        let ready = ReadyQueue::new();
        let core = StreamCore::new(name, request, StreamState::Pending, ready.bytes_handle());
        Arc::new_cyclic(|self_ref| Self {
            core,
            self_ref: self_ref.clone(),
            producer,
            checkpoint,
            processor,
            min_compression_ratio,
            payload,
            last_read_seqno: AtomicU64::new(request.start_seqno),
            last_sent_seqno: AtomicU64::new(request.start_seqno),
            cur_chk_seqno: AtomicU64::new(request.start_seqno),
            last_sent_snap_end_seqno: AtomicU64::new(0),
            backfill_remaining: AtomicU64::new(0),
            backfill_items_memory: AtomicU64::new(0),
            backfill_items_disk: AtomicU64::new(0),
            backfill_items_sent: AtomicU64::new(0),
            items_from_memory_phase: AtomicU64::new(0),
            is_backfill_task_running: AtomicBool::new(false),
            buffered_backfill_bytes: AtomicU64::new(0),
            buffered_backfill_items: AtomicU64::new(0),
            chk_extraction_in_progress: AtomicBool::new(false),
            wait_for_snapshot: AtomicU64::new(0),
            takeover_start_secs: AtomicU64::new(0),
            last_send_time_secs: AtomicU64::new(unix_secs_now()),
            inner: Mutex::new(ActiveInner {
                ready,
                first_marker_sent: false,
                backfill_completed: false,
                takeover_state: VBucketState::Pending,
                takeover_state_sent: false,
            }),
        })
    }

    /// Shared identity/bookkeeping record.
    #[must_use]
    pub fn core(&self) -> &StreamCore {
        &self.core
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, ActiveInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the stream: Pending moves to Backfilling and a backfill is scheduled.
    ///
    /// When the requested range can be served entirely from the checkpoint log the backfill
    /// completes immediately and the next pull moves the stream onward.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotMyVbucket` when the vbucket has no checkpoint log here.
    pub fn set_active(&self) -> EngineResult<()> {
        {
            let _inner = self.lock_inner();
            if self.core.state() != StreamState::Pending {
                return Ok(());
            }
            self.core.set_state(StreamState::Backfilling);
        }
        self.schedule_backfill()
    }

    fn schedule_backfill(&self) -> EngineResult<()> {
        let vbucket = self.core.vbucket();
        let start_seqno = self.core.start_seqno();
        let cursor_seqno =
            self.checkpoint
                .register_cursor(vbucket, self.core.name(), start_seqno)?;
        self.cur_chk_seqno.store(cursor_seqno, Ordering::Release);

        let high_seqno = self.checkpoint.high_seqno(vbucket);
        let backlog_serves = start_seqno >= high_seqno
            || self
                .checkpoint
                .backlog_contains(vbucket, start_seqno.saturating_add(1));
        if backlog_serves {
            // Nothing to read from disk; the backfill is complete before it starts.
            self.complete_backfill();
            return Ok(());
        }

        let backfill_end = cursor_seqno.min(self.core.end_seqno());
        self.is_backfill_task_running.store(true, Ordering::Release);
        if let (Some(producer), Some(me)) = (self.producer.upgrade(), self.self_ref.upgrade()) {
            producer
                .backfills()
                .schedule(&me, start_seqno.saturating_add(1), backfill_end);
        }
        Ok(())
    }

    /// Pulls the next pending message, dispatching by phase.
    ///
    /// Returns `None` when nothing is available; the caller marks the connection paused.
    #[must_use]
    pub fn next(&self) -> Option<DcpMessage> {
        let mut inner = self.lock_inner();
        let message = match self.core.state() {
            StreamState::Pending | StreamState::Reading => None,
            StreamState::Backfilling => self.backfill_phase(&mut inner),
            StreamState::InMemory => self.in_memory_phase(&mut inner),
            StreamState::TakeoverSend => self.takeover_send_phase(&mut inner),
            StreamState::TakeoverWait | StreamState::Dead => self.queued_phase(&mut inner),
        };
        match &message {
            Some(_) => {
                self.last_send_time_secs
                    .store(unix_secs_now(), Ordering::Release);
            }
            None => self.core.set_items_ready(false),
        }
        message
    }

    fn pop_ready(&self, inner: &mut ActiveInner) -> Option<DcpMessage> {
        let message = inner.ready.pop()?;
        if let Some(seqno) = message.by_seqno() {
            self.last_sent_seqno.store(seqno, Ordering::Release);
        }
        Some(message)
    }

    fn backfill_phase(&self, inner: &mut ActiveInner) -> Option<DcpMessage> {
        if let Some(message) = self.pop_ready(inner) {
            if !message.is_meta() {
                let size = message.size();
                let _ = self
                    .buffered_backfill_bytes
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bytes| {
                        Some(bytes.saturating_sub(size))
                    });
                let _ = self
                    .buffered_backfill_items
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |items| {
                        Some(items.saturating_sub(1))
                    });
                let _ = self.backfill_items_sent.fetch_add(1, Ordering::AcqRel);
            }
            return Some(message);
        }

        if self.is_backfill_task_running.load(Ordering::Acquire) || !inner.backfill_completed {
            return None;
        }

        let diskonly = self.core.flags() & STREAM_FLAG_DISKONLY != 0;
        let caught_up = self.last_read_seqno.load(Ordering::Acquire) >= self.core.end_seqno();
        if diskonly || caught_up {
            self.end_stream_locked(inner, EndStreamStatus::Ok);
            return self.pop_ready(inner);
        }

        let takeover = self.core.flags() & STREAM_FLAG_TAKEOVER != 0;
        if takeover && self.core.end_seqno() == DCP_MAX_SEQNO {
            self.core.set_state(StreamState::TakeoverSend);
            self.takeover_start_secs
                .store(unix_secs_now(), Ordering::Release);
        } else {
            self.core.set_state(StreamState::InMemory);
        }
        self.schedule_on_processor();
        None
    }

    fn in_memory_phase(&self, inner: &mut ActiveInner) -> Option<DcpMessage> {
        if let Some(message) = self.pop_ready(inner) {
            if !message.is_meta() {
                let _ = self.items_from_memory_phase.fetch_add(1, Ordering::AcqRel);
            }
            return Some(message);
        }

        if self.last_sent_seqno.load(Ordering::Acquire) >= self.core.end_seqno() {
            self.end_stream_locked(inner, EndStreamStatus::Ok);
            return self.pop_ready(inner);
        }

        self.schedule_on_processor();
        None
    }

    fn takeover_send_phase(&self, inner: &mut ActiveInner) -> Option<DcpMessage> {
        if let Some(message) = self.pop_ready(inner) {
            if !message.is_meta() {
                let _ = self.items_from_memory_phase.fetch_add(1, Ordering::AcqRel);
            }
            return Some(message);
        }

        let cursor_caught_up =
            self.cur_chk_seqno.load(Ordering::Acquire) >= self.checkpoint.high_seqno(self.core.vbucket());
        if !cursor_caught_up {
            self.schedule_on_processor();
            return None;
        }

        if !inner.takeover_state_sent {
            inner.takeover_state_sent = true;
            let message = DcpMessage::SetVBucketState {
                opaque: self.core.opaque(),
                vbucket: self.core.vbucket(),
                state: inner.takeover_state,
            };
            inner.ready.push(message);
            return self.pop_ready(inner);
        }
        None
    }

    fn queued_phase(&self, inner: &mut ActiveInner) -> Option<DcpMessage> {
        self.pop_ready(inner)
    }

    fn end_stream_locked(&self, inner: &mut ActiveInner, status: EndStreamStatus) {
        if self.core.state() == StreamState::Dead {
            return;
        }
        self.core.set_state(StreamState::Dead);
        self.checkpoint
            .remove_cursor(self.core.vbucket(), self.core.name());
        // Outstanding backfill budget dies with the stream.
        self.buffered_backfill_bytes.store(0, Ordering::Release);
        self.buffered_backfill_items.store(0, Ordering::Release);
        inner.ready.push(DcpMessage::StreamEnd {
            opaque: self.core.opaque(),
            vbucket: self.core.vbucket(),
            status,
        });
        self.core.set_items_ready(true);
        tracing::info!(
            vbucket = self.core.vbucket(),
            status = status.as_label(),
            backfill_sent = self.backfill_items_sent.load(Ordering::Acquire),
            memory_sent = self.items_from_memory_phase.load(Ordering::Acquire),
            "active stream ended"
        );
    }

    /// Terminates the stream, queueing a stream-end message carrying the reason.
    ///
    /// Idempotent; concurrent calls collapse into one transition and one message.
    pub fn set_dead(&self, status: EndStreamStatus) -> Opaque {
        let notify = {
            let mut inner = self.lock_inner();
            if self.core.state() == StreamState::Dead {
                false
            } else {
                self.end_stream_locked(&mut inner, status);
                true
            }
        };
        if notify {
            self.notify_producer();
        }
        self.core.opaque()
    }

    /// Drops and frees all pending ready-queue messages.
    pub fn clear(&self) {
        let mut inner = self.lock_inner();
        inner.ready.clear();
    }

    fn notify_producer(&self) {
        if let Some(producer) = self.producer.upgrade() {
            producer.notify_stream_ready(self.core.vbucket());
        }
    }

    fn schedule_on_processor(&self) {
        if let Some(me) = self.self_ref.upgrade() {
            self.processor.schedule(&me);
        }
    }

    /// Backfill callback: announces the disk snapshot range whose items follow.
    pub fn mark_disk_snapshot(&self, start_seqno: Seqno, end_seqno: Seqno) {
        {
            let mut inner = self.lock_inner();
            if self.core.state() == StreamState::Dead {
                return;
            }
            let mut flags = MARKER_FLAG_DISK;
            if self.core.flags() & STREAM_FLAG_TAKEOVER != 0 {
                flags |= MARKER_FLAG_ACK;
                let _ = self.wait_for_snapshot.fetch_add(1, Ordering::AcqRel);
            }
            inner.first_marker_sent = true;
            inner.ready.push(DcpMessage::SnapshotMarker {
                opaque: self.core.opaque(),
                vbucket: self.core.vbucket(),
                start_seqno,
                end_seqno,
                flags,
            });
            self.last_sent_snap_end_seqno
                .store(end_seqno, Ordering::Release);
            self.core.set_items_ready(true);
        }
        self.notify_producer();
    }

    /// Backfill callback: delivers one scanned item.
    ///
    /// Returns `false` when the stream cannot buffer more (dead, or buffered-backfill cap hit);
    /// the backfill task pauses and is re-woken once the buffer drains.
    pub fn backfill_received(&self, item: Item, source: BackfillSource) -> bool {
        let accepted = {
            let mut inner = self.lock_inner();
            if self.core.state() == StreamState::Dead {
                return false;
            }
            if self.buffered_backfill_bytes.load(Ordering::Acquire) >= BUFFERED_BACKFILL_BYTES_LIMIT
            {
                return false;
            }
            let seqno = item.by_seqno;
            if seqno < self.core.start_seqno() || seqno > self.core.end_seqno() {
                // Outside the requested window; consume without emitting.
                return true;
            }

            let message = if item.deleted {
                DcpMessage::Deletion {
                    opaque: self.core.opaque(),
                    vbucket: self.core.vbucket(),
                    item,
                }
            } else {
                DcpMessage::Mutation {
                    opaque: self.core.opaque(),
                    vbucket: self.core.vbucket(),
                    item,
                    payload: self.payload,
                }
            };
            let _ = self
                .buffered_backfill_bytes
                .fetch_add(message.size(), Ordering::AcqRel);
            let _ = self.buffered_backfill_items.fetch_add(1, Ordering::AcqRel);
            match source {
                BackfillSource::Memory => {
                    let _ = self.backfill_items_memory.fetch_add(1, Ordering::AcqRel);
                }
                BackfillSource::Disk => {
                    let _ = self.backfill_items_disk.fetch_add(1, Ordering::AcqRel);
                    let _ = self
                        .backfill_remaining
                        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remaining| {
                            Some(remaining.saturating_sub(1))
                        });
                }
            }
            self.last_read_seqno.store(seqno, Ordering::Release);
            inner.ready.push(message);
            self.core.set_items_ready(true);
            true
        };
        if accepted {
            self.notify_producer();
        }
        accepted
    }

    /// Backfill callback: the scan finished (or was abandoned for a dead stream).
    pub fn complete_backfill(&self) {
        {
            let mut inner = self.lock_inner();
            self.is_backfill_task_running.store(false, Ordering::Release);
            inner.backfill_completed = true;
            self.core.set_items_ready(true);
            tracing::debug!(
                vbucket = self.core.vbucket(),
                disk_items = self.backfill_items_disk.load(Ordering::Acquire),
                memory_items = self.backfill_items_memory.load(Ordering::Acquire),
                "backfill complete"
            );
        }
        self.notify_producer();
    }

    /// Seeds the remaining-items stat before a disk scan starts.
    pub fn incr_backfill_remaining(&self, by: u64) {
        let _ = self.backfill_remaining.fetch_add(by, Ordering::AcqRel);
    }

    /// Checkpoint processor callback: drains the stream's cursor into the ready queue.
    ///
    /// The extraction flag stays set from cursor read to enqueue so a concurrent
    /// `notify_seqno_available` does not reschedule the stream mid-extraction.
    pub fn next_checkpoint_item_task(&self) {
        if !self.core.is_active() {
            return;
        }
        self.chk_extraction_in_progress
            .store(true, Ordering::Release);
        let batch = self.checkpoint.drain_cursor(
            self.core.vbucket(),
            self.core.name(),
            CHECKPOINT_DRAIN_BATCH,
        );
        let pushed = match batch {
            Ok(batch) => self.process_items(&batch),
            Err(_) => 0,
        };
        self.chk_extraction_in_progress
            .store(false, Ordering::Release);
        if pushed > 0 {
            self.notify_producer();
        }
    }

    fn process_items(&self, batch: &CursorBatch) -> usize {
        let mut inner = self.lock_inner();
        if self.core.state() == StreamState::Dead {
            return 0;
        }

        let mut pushed = 0_usize;
        let mut marker_emitted = false;
        for queued in &batch.items {
            match queued {
                QueuedItem::CheckpointStart(_) | QueuedItem::CheckpointEnd(_) => {}
                QueuedItem::SetVBucketState(state) => {
                    inner.ready.push(DcpMessage::SetVBucketState {
                        opaque: self.core.opaque(),
                        vbucket: self.core.vbucket(),
                        state: *state,
                    });
                    pushed += 1;
                }
                QueuedItem::Mutation(item) | QueuedItem::Deletion(item) => {
                    let seqno = item.by_seqno;
                    if seqno > self.core.end_seqno() {
                        continue;
                    }
                    if !marker_emitted {
                        let mut flags = MARKER_FLAG_MEMORY | MARKER_FLAG_CHK;
                        if self.core.state() == StreamState::TakeoverSend {
                            flags |= MARKER_FLAG_ACK;
                            let _ = self.wait_for_snapshot.fetch_add(1, Ordering::AcqRel);
                        }
                        inner.ready.push(DcpMessage::SnapshotMarker {
                            opaque: self.core.opaque(),
                            vbucket: self.core.vbucket(),
                            start_seqno: batch.snapshot_start,
                            end_seqno: batch.snapshot_end,
                            flags,
                        });
                        inner.first_marker_sent = true;
                        self.last_sent_snap_end_seqno
                            .store(batch.snapshot_end, Ordering::Release);
                        marker_emitted = true;
                        pushed += 1;
                    }
                    let message = if matches!(queued, QueuedItem::Deletion(_)) {
                        DcpMessage::Deletion {
                            opaque: self.core.opaque(),
                            vbucket: self.core.vbucket(),
                            item: item.clone(),
                        }
                    } else {
                        DcpMessage::Mutation {
                            opaque: self.core.opaque(),
                            vbucket: self.core.vbucket(),
                            item: item.clone(),
                            payload: self.payload,
                        }
                    };
                    self.last_read_seqno.store(seqno, Ordering::Release);
                    inner.ready.push(message);
                    pushed += 1;
                }
            }
        }
        self.cur_chk_seqno.store(batch.cursor_seqno, Ordering::Release);
        if pushed > 0 {
            self.core.set_items_ready(true);
        }
        pushed
    }

    /// Signals that one seqno became available in the stream's vbucket.
    pub fn notify_seqno_available(&self, seqno: Seqno) {
        if !self.core.is_active() {
            return;
        }
        if seqno < self.core.start_seqno() {
            return;
        }
        if self.chk_extraction_in_progress.load(Ordering::Acquire) {
            // The processor re-evaluates the cursor right after the extraction in flight.
            return;
        }
        match self.core.state() {
            StreamState::InMemory | StreamState::TakeoverSend => self.schedule_on_processor(),
            _ => {}
        }
    }

    /// Consumer acknowledged one snapshot marker sent with the ack flag.
    pub fn snapshot_marker_ack_received(&self) {
        let _ = self
            .wait_for_snapshot
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                Some(pending.saturating_sub(1))
            });
    }

    /// Consumer acknowledged one takeover vbucket state change.
    pub fn set_vbucket_state_ack_received(&self) {
        let notify = {
            let mut inner = self.lock_inner();
            match self.core.state() {
                StreamState::TakeoverSend => {
                    self.core.set_state(StreamState::TakeoverWait);
                    inner.takeover_state = VBucketState::Active;
                    inner.ready.push(DcpMessage::SetVBucketState {
                        opaque: self.core.opaque(),
                        vbucket: self.core.vbucket(),
                        state: VBucketState::Active,
                    });
                    self.core.set_items_ready(true);
                    true
                }
                StreamState::TakeoverWait => {
                    self.end_stream_locked(&mut inner, EndStreamStatus::Ok);
                    true
                }
                _ => false,
            }
        };
        if notify {
            self.notify_producer();
        }
    }

    /// Whether producer payload compression is in effect at all.
    #[must_use]
    pub fn is_compression_enabled(&self) -> bool {
        self.min_compression_ratio.load(Ordering::Acquire) > 0.0
    }

    /// Whether one compressed payload achieved the configured minimum ratio.
    ///
    /// Payloads below the threshold are sent uncompressed.
    #[must_use]
    pub fn payload_meets_compression_ratio(&self, raw_bytes: u64, compressed_bytes: u64) -> bool {
        if compressed_bytes == 0 {
            return false;
        }
        let ratio = raw_bytes as f32 / compressed_bytes as f32;
        ratio >= self.min_compression_ratio.load(Ordering::Acquire)
    }

    /// Items still to be streamed: unread cursor backlog plus queued document changes.
    #[must_use]
    pub fn items_remaining(&self) -> u64 {
        let cursor_backlog = self
            .checkpoint
            .high_seqno(self.core.vbucket())
            .saturating_sub(self.cur_chk_seqno.load(Ordering::Acquire));
        let inner = self.lock_inner();
        cursor_backlog + inner.ready.non_meta_len() as u64
    }

    /// Last seqno read from disk or the checkpoint log.
    #[must_use]
    pub fn last_read_seqno(&self) -> Seqno {
        self.last_read_seqno.load(Ordering::Acquire)
    }

    /// Last seqno handed to the network layer.
    #[must_use]
    pub fn last_sent_seqno(&self) -> Seqno {
        self.last_sent_seqno.load(Ordering::Acquire)
    }

    /// Remaining disk-item estimate for the running backfill.
    #[must_use]
    pub fn backfill_remaining(&self) -> u64 {
        self.backfill_remaining.load(Ordering::Acquire)
    }

    /// Whether this stream qualifies for slow-consumer eviction.
    #[must_use]
    pub fn is_slow_candidate(&self, byte_threshold: u64, idle_secs: u64) -> bool {
        if !self.core.is_active() {
            return false;
        }
        let bytes = self.core.ready_queue_bytes();
        let idle = unix_secs_now().saturating_sub(self.last_send_time_secs.load(Ordering::Acquire));
        bytes > byte_threshold && idle >= idle_secs
    }

    /// Appends per-stream stats rows.
    pub fn append_stats(&self, out: &mut Vec<(String, String)>) {
        let prefix = format!("{}:stream_{}", self.core.name(), self.core.vbucket());
        let queued = {
            let inner = self.lock_inner();
            inner.ready.len()
        };
        out.push((format!("{prefix}:state"), self.core.state().as_label().to_owned()));
        out.push((
            format!("{prefix}:ready_queue_bytes"),
            self.core.ready_queue_bytes().to_string(),
        ));
        out.push((format!("{prefix}:ready_queue_items"), queued.to_string()));
        out.push((
            format!("{prefix}:last_read_seqno"),
            self.last_read_seqno().to_string(),
        ));
        out.push((
            format!("{prefix}:last_sent_seqno"),
            self.last_sent_seqno().to_string(),
        ));
        out.push((
            format!("{prefix}:cur_chk_seqno"),
            self.cur_chk_seqno.load(Ordering::Acquire).to_string(),
        ));
        out.push((
            format!("{prefix}:backfill_remaining"),
            self.backfill_remaining().to_string(),
        ));
        out.push((
            format!("{prefix}:backfill_items_memory"),
            self.backfill_items_memory.load(Ordering::Acquire).to_string(),
        ));
        out.push((
            format!("{prefix}:backfill_items_disk"),
            self.backfill_items_disk.load(Ordering::Acquire).to_string(),
        ));
        out.push((
            format!("{prefix}:backfill_items_sent"),
            self.backfill_items_sent.load(Ordering::Acquire).to_string(),
        ));
        out.push((
            format!("{prefix}:items_from_memory_phase"),
            self.items_from_memory_phase.load(Ordering::Acquire).to_string(),
        ));
    }
}
