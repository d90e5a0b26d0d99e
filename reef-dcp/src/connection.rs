//! Producer and consumer connection handlers owned by the registry.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use atomic_float::AtomicF32;
use hashbrown::HashMap;
use reef_common::config::DcpConfig;
use reef_common::error::{EngineError, EngineResult};
use reef_common::ids::{Cookie, Opaque, Seqno, StreamFlags, VBucketId};
use reef_engine::checkpoint::CheckpointLog;
use reef_engine::item::VBucketState;
use reef_engine::replica::ReplicaStore;
use reef_engine::server::ServerGateway;
use reef_engine::tasks::{BackgroundTask, TaskAction, WorkerHandle};

use crate::backfill::BackfillManager;
use crate::message::{DcpMessage, EndStreamStatus, MutationPayloadKind};
use crate::processor::CheckpointProcessorTask;
use crate::stream::{
    ActiveStream, DcpStream, NotifierStream, PassiveStream, ProcessItemsResult, StreamRequest,
};

pub(crate) fn unix_secs_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}

/// Identity and notification bookkeeping shared by producer and consumer connections.
#[derive(Debug)]
pub struct ConnectionCore {
    cookie: Cookie,
    name: String,
    reserved: AtomicBool,
    disconnect: AtomicBool,
    paused: AtomicBool,
    notify_sent: AtomicBool,
    last_walk_time_secs: AtomicU64,
}

impl ConnectionCore {
    fn new(cookie: Cookie, name: String) -> Self {
        Self {
            cookie,
            name,
            reserved: AtomicBool::new(true),
            disconnect: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            notify_sent: AtomicBool::new(false),
            last_walk_time_secs: AtomicU64::new(unix_secs_now()),
        }
    }

    /// Server-layer cookie identifying this connection.
    #[must_use]
    pub fn cookie(&self) -> Cookie {
        self.cookie
    }

    /// Canonical connection name (`eq_dcpq:` prefixed).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the server layer still holds its reference.
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.reserved.load(Ordering::Acquire)
    }

    pub(crate) fn set_reserved(&self, reserved: bool) {
        self.reserved.store(reserved, Ordering::Release);
    }

    /// Whether the connection was told to disconnect.
    #[must_use]
    pub fn do_disconnect(&self) -> bool {
        self.disconnect.load(Ordering::Acquire)
    }

    pub(crate) fn set_disconnect(&self) {
        self.disconnect.store(true, Ordering::Release);
    }

    /// Whether the connection ran out of ready work on its last pull.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    /// Whether an I/O-resume notification is already out for the current pause.
    #[must_use]
    pub fn notify_sent(&self) -> bool {
        self.notify_sent.load(Ordering::Acquire)
    }

    pub(crate) fn set_notify_sent(&self, sent: bool) {
        self.notify_sent.store(sent, Ordering::Release);
    }

    /// Unix seconds of the last manage-tick walk or network pull.
    #[must_use]
    pub fn last_walk_time_secs(&self) -> u64 {
        self.last_walk_time_secs.load(Ordering::Acquire)
    }

    pub(crate) fn touch_last_walk_time(&self) {
        self.last_walk_time_secs
            .store(unix_secs_now(), Ordering::Release);
    }
}

/// Producer-side connection: owns active and notifier streams for its vbuckets.
pub struct DcpProducer {
    core: ConnectionCore,
    self_ref: Weak<DcpProducer>,
    notify_only: bool,
    config: DcpConfig,
    checkpoint: Arc<dyn CheckpointLog>,
    processor: Arc<CheckpointProcessorTask>,
    backfills: Arc<BackfillManager>,
    min_compression_ratio: Arc<AtomicF32>,
    gateway: Arc<dyn ServerGateway>,
    payload: MutationPayloadKind,
    streams: Mutex<HashMap<VBucketId, DcpStream>>,
    ready: Mutex<VecDeque<VBucketId>>,
}

impl std::fmt::Debug for DcpProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DcpProducer")
            .field("name", &self.core.name())
            .field("cookie", &self.core.cookie())
            .field("notify_only", &self.notify_only)
            .finish_non_exhaustive()
    }
}

impl DcpProducer {
    /// Creates one producer connection.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cookie: Cookie,
        name: String,
        notify_only: bool,
        config: DcpConfig,
        checkpoint: Arc<dyn CheckpointLog>,
        processor: Arc<CheckpointProcessorTask>,
        backfills: Arc<BackfillManager>,
        min_compression_ratio: Arc<AtomicF32>,
        gateway: Arc<dyn ServerGateway>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            core: ConnectionCore::new(cookie, name),
            self_ref: self_ref.clone(),
            notify_only,
            config,
            checkpoint,
            processor,
            backfills,
            min_compression_ratio,
            gateway,
            payload: MutationPayloadKind::KeyAndValue,
            streams: Mutex::new(HashMap::new()),
            ready: Mutex::new(VecDeque::new()),
        })
    }

    /// Shared identity/bookkeeping record.
    #[must_use]
    pub fn core(&self) -> &ConnectionCore {
        &self.core
    }

    /// Whether this producer only serves notifier streams.
    #[must_use]
    pub fn is_notify_only(&self) -> bool {
        self.notify_only
    }

    /// Per-producer backfill queue.
    #[must_use]
    pub fn backfills(&self) -> &Arc<BackfillManager> {
        &self.backfills
    }

    fn lock_streams(&self) -> std::sync::MutexGuard<'_, HashMap<VBucketId, DcpStream>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_ready(&self) -> std::sync::MutexGuard<'_, VecDeque<VBucketId>> {
        self.ready.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens one stream on this connection.
    ///
    /// At most one live stream per vbucket exists on a producer; a dead entry is replaced.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::OutOfRange` for an inverted seqno window,
    /// `EngineError::NotMyVbucket` when the vbucket is not active here, and
    /// `EngineError::KeyExists` when a live stream already covers the vbucket.
    pub fn stream_request(&self, request: StreamRequest) -> EngineResult<()> {
        if request.start_seqno > request.end_seqno {
            return Err(EngineError::OutOfRange(
                "stream start seqno lies past its end seqno",
            ));
        }
        match self.checkpoint.vbucket_state(request.vbucket) {
            Some(VBucketState::Active) => {}
            _ => return Err(EngineError::NotMyVbucket),
        }

        let stream = {
            let mut streams = self.lock_streams();
            if let Some(existing) = streams.get(&request.vbucket)
                && existing.core().is_active()
            {
                return Err(EngineError::KeyExists);
            }
            let stream = if self.notify_only {
                DcpStream::Notifier(NotifierStream::new(
                    self.core.name().to_owned(),
                    &request,
                    self.self_ref.clone(),
                ))
            } else {
                DcpStream::Active(ActiveStream::new(
                    self.core.name().to_owned(),
                    &request,
                    self.self_ref.clone(),
                    Arc::clone(&self.checkpoint),
                    Arc::clone(&self.processor),
                    Arc::clone(&self.min_compression_ratio),
                    self.payload,
                ))
            };
            let _ = streams.insert(request.vbucket, stream.clone());
            stream
        };

        match &stream {
            DcpStream::Active(active) => {
                if let Err(error) = active.set_active() {
                    let mut streams = self.lock_streams();
                    let _ = streams.remove(&request.vbucket);
                    return Err(error);
                }
            }
            DcpStream::Notifier(notifier) => {
                // A notifier whose watched seqno is already reachable ends immediately.
                notifier.notify_seqno_available(self.checkpoint.high_seqno(request.vbucket));
            }
            DcpStream::Passive(_) => unreachable!("producers never own passive streams"),
        }
        tracing::info!(
            connection = self.core.name(),
            vbucket = request.vbucket,
            start_seqno = request.start_seqno,
            end_seqno = request.end_seqno,
            "stream created"
        );
        Ok(())
    }

    /// Returns the stream for one vbucket, if any.
    #[must_use]
    pub fn find_stream(&self, vbucket: VBucketId) -> Option<DcpStream> {
        self.lock_streams().get(&vbucket).cloned()
    }

    /// Fans one seqno-available notification into the vbucket's stream.
    pub fn notify_seqno_available(&self, vbucket: VBucketId, seqno: Seqno) {
        if let Some(stream) = self.find_stream(vbucket) {
            stream.notify_seqno_available(seqno);
        }
    }

    /// Marks one vbucket's stream ready and resumes a paused connection.
    pub fn notify_stream_ready(&self, vbucket: VBucketId) {
        {
            let mut ready = self.lock_ready();
            if !ready.contains(&vbucket) {
                ready.push_back(vbucket);
            }
        }
        if self.core.paused.swap(false, Ordering::AcqRel) {
            self.gateway.notify_io_complete(self.core.cookie(), Ok(()));
            self.core.set_notify_sent(true);
        }
    }

    /// Network pull: next pending message across this producer's streams, round-robin.
    #[must_use]
    pub fn next_message(&self) -> Option<DcpMessage> {
        self.core.touch_last_walk_time();
        loop {
            let vbucket = {
                let mut ready = self.lock_ready();
                ready.pop_front()
            };
            let Some(vbucket) = vbucket else {
                self.core.set_paused(true);
                self.core.set_notify_sent(false);
                return None;
            };
            let Some(stream) = self.find_stream(vbucket) else {
                continue;
            };
            match stream.next() {
                Some(message) => {
                    let mut ready = self.lock_ready();
                    ready.push_back(vbucket);
                    return Some(message);
                }
                None => continue,
            }
        }
    }

    /// Closes one stream at the peer's request.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidArgument` when no stream covers the vbucket.
    pub fn close_stream(&self, vbucket: VBucketId) -> EngineResult<()> {
        let stream = self
            .find_stream(vbucket)
            .ok_or(EngineError::InvalidArgument("no stream for vbucket"))?;
        let _ = stream.set_dead(EndStreamStatus::Closed);
        Ok(())
    }

    /// Evicts one named stream when it qualifies as a slow consumer.
    #[must_use]
    pub fn close_slow_stream(&self, vbucket: VBucketId, name: &str) -> bool {
        let Some(DcpStream::Active(stream)) = self.find_stream(vbucket) else {
            return false;
        };
        if stream.core().name() != name {
            return false;
        }
        if !stream.is_slow_candidate(
            self.config.slow_stream_byte_threshold,
            self.config.slow_stream_idle_secs,
        ) {
            return false;
        }
        tracing::warn!(
            connection = self.core.name(),
            vbucket,
            ready_bytes = stream.core().ready_queue_bytes(),
            "closing slow stream"
        );
        let _ = stream.set_dead(EndStreamStatus::Slow);
        true
    }

    /// Closes every stream and returns the vbuckets they covered.
    ///
    /// Entries stay in the stream table so the vbucket index can still be swept after the
    /// teardown; they are freed with the connection itself.
    pub fn close_all_streams(&self) -> Vec<VBucketId> {
        let streams = {
            let streams = self.lock_streams();
            streams.iter().map(|(vb, stream)| (*vb, stream.clone())).collect::<Vec<_>>()
        };
        let mut vbuckets = Vec::with_capacity(streams.len());
        for (vbucket, stream) in streams {
            let _ = stream.set_dead(EndStreamStatus::Disconnected);
            vbuckets.push(vbucket);
        }
        vbuckets
    }

    /// Drops this producer's queued checkpoint extraction work.
    pub fn clear_checkpoint_processor_queues(&self) {
        let vbuckets = {
            let streams = self.lock_streams();
            streams.keys().copied().collect::<Vec<_>>()
        };
        self.processor.remove_vbuckets(&vbuckets);
    }

    /// Reacts to one vbucket leaving the active state on this node.
    pub fn vbucket_state_changed(&self, vbucket: VBucketId, state: VBucketState) {
        if state == VBucketState::Active {
            return;
        }
        if let Some(stream) = self.find_stream(vbucket) {
            let _ = stream.set_dead(EndStreamStatus::StateChanged);
        }
    }

    /// Routes one consumer snapshot acknowledgement into the vbucket's stream.
    pub fn snapshot_marker_ack_received(&self, vbucket: VBucketId) {
        if let Some(DcpStream::Active(stream)) = self.find_stream(vbucket) {
            stream.snapshot_marker_ack_received();
        }
    }

    /// Routes one consumer takeover state acknowledgement into the vbucket's stream.
    pub fn set_vbucket_state_ack_received(&self, vbucket: VBucketId) {
        if let Some(DcpStream::Active(stream)) = self.find_stream(vbucket) {
            stream.set_vbucket_state_ack_received();
        }
    }

    /// Vbuckets this producer currently holds streams on.
    #[must_use]
    pub fn vb_vector(&self) -> Vec<VBucketId> {
        self.lock_streams().keys().copied().collect()
    }

    /// Appends connection and per-stream stats rows.
    pub fn append_stats(&self, out: &mut Vec<(String, String)>) {
        out.push((
            format!("{}:type", self.core.name()),
            if self.notify_only { "notifier" } else { "producer" }.to_owned(),
        ));
        out.push((
            format!("{}:paused", self.core.name()),
            self.core.is_paused().to_string(),
        ));
        let streams = {
            let streams = self.lock_streams();
            streams.values().cloned().collect::<Vec<_>>()
        };
        for stream in streams {
            stream.append_stats(out);
        }
    }
}

/// Drains buffered passive-stream messages for one consumer connection.
#[derive(Debug)]
struct ConsumerBufferTask {
    consumer: Weak<DcpConsumer>,
}

impl BackgroundTask for ConsumerBufferTask {
    fn run_once(&self) -> TaskAction {
        let Some(consumer) = self.consumer.upgrade() else {
            return TaskAction::Complete;
        };
        consumer.process_buffered_streams()
    }

    fn description(&self) -> &'static str {
        "Process buffered DCP consumer messages"
    }
}

/// Consumer-side connection: owns passive streams for its replica vbuckets.
pub struct DcpConsumer {
    core: ConnectionCore,
    self_ref: Weak<DcpConsumer>,
    config: DcpConfig,
    replica: Arc<dyn ReplicaStore>,
    gateway: Arc<dyn ServerGateway>,
    streams: Mutex<HashMap<VBucketId, Arc<PassiveStream>>>,
    ready: Mutex<VecDeque<VBucketId>>,
    buffer_worker: Mutex<Option<WorkerHandle>>,
    opaque_counter: AtomicU32,
}

impl std::fmt::Debug for DcpConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DcpConsumer")
            .field("name", &self.core.name())
            .field("cookie", &self.core.cookie())
            .finish_non_exhaustive()
    }
}

impl DcpConsumer {
    /// Creates one consumer connection.
    #[must_use]
    pub fn new(
        cookie: Cookie,
        name: String,
        config: DcpConfig,
        replica: Arc<dyn ReplicaStore>,
        gateway: Arc<dyn ServerGateway>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            core: ConnectionCore::new(cookie, name),
            self_ref: self_ref.clone(),
            config,
            replica,
            gateway,
            streams: Mutex::new(HashMap::new()),
            ready: Mutex::new(VecDeque::new()),
            buffer_worker: Mutex::new(None),
            opaque_counter: AtomicU32::new(1),
        })
    }

    /// Shared identity/bookkeeping record.
    #[must_use]
    pub fn core(&self) -> &ConnectionCore {
        &self.core
    }

    fn lock_streams(&self) -> std::sync::MutexGuard<'_, HashMap<VBucketId, Arc<PassiveStream>>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_ready(&self) -> std::sync::MutexGuard<'_, VecDeque<VBucketId>> {
        self.ready.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens one passive stream for a replica vbucket.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotMyVbucket` when the vbucket is not hosted as a replica here
    /// and `EngineError::KeyExists` when this connection already holds a live stream for it.
    pub fn add_stream(
        &self,
        add_opaque: Opaque,
        vbucket: VBucketId,
        flags: StreamFlags,
    ) -> EngineResult<()> {
        if !self.replica.hosts_vbucket(vbucket) {
            return Err(EngineError::NotMyVbucket);
        }

        let stream = {
            let mut streams = self.lock_streams();
            if let Some(existing) = streams.get(&vbucket)
                && existing.core().is_active()
            {
                return Err(EngineError::KeyExists);
            }
            let start_seqno = self.replica.high_seqno(vbucket);
            let stream_opaque = self.opaque_counter.fetch_add(1, Ordering::AcqRel);
            let stream = PassiveStream::new(
                self.core.name().to_owned(),
                &StreamRequest {
                    flags,
                    opaque: stream_opaque,
                    vbucket,
                    start_seqno,
                    end_seqno: reef_common::ids::DCP_MAX_SEQNO,
                    vb_uuid: 0,
                    snap_start_seqno: start_seqno,
                    snap_end_seqno: start_seqno,
                },
                self.self_ref.clone(),
                Arc::clone(&self.replica),
                self.config.consumer_buffer_bytes,
            );
            let _ = streams.insert(vbucket, Arc::clone(&stream));
            stream
        };

        self.start_buffer_processor();
        stream.accept_stream(Ok(()), add_opaque);
        tracing::info!(
            connection = self.core.name(),
            vbucket,
            "passive stream created"
        );
        Ok(())
    }

    fn start_buffer_processor(&self) {
        let mut worker = self
            .buffer_worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if worker.is_none() {
            let task: Arc<dyn BackgroundTask> = Arc::new(ConsumerBufferTask {
                consumer: self.self_ref.clone(),
            });
            *worker = Some(WorkerHandle::spawn("reef-dcp-consumer-buffer", task, None));
        }
    }

    /// Wakes the buffer-drain worker after new messages were buffered.
    pub fn wake_buffer_processor(&self) {
        let worker = self
            .buffer_worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(worker) = worker.as_ref() {
            worker.wake();
        }
    }

    /// Stops the buffer-drain worker (disconnect and shutdown paths).
    pub fn cancel_task(&self) {
        let taken = {
            let mut worker = self
                .buffer_worker
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            worker.take()
        };
        if let Some(mut worker) = taken {
            worker.shutdown();
        }
    }

    /// One drain cycle over every owned stream's receive buffer.
    ///
    /// Streams exceeding the repeated-back-pressure budget are ended as slow.
    pub fn process_buffered_streams(&self) -> TaskAction {
        let streams = {
            let streams = self.lock_streams();
            streams.values().cloned().collect::<Vec<_>>()
        };
        let mut more_to_process = false;
        for stream in streams {
            if !stream.core().is_active() {
                continue;
            }
            let (result, _) =
                stream.process_buffered_messages(self.config.consumer_process_batch_size);
            match result {
                ProcessItemsResult::AllProcessed => {}
                ProcessItemsResult::MoreToProcess => more_to_process = true,
                ProcessItemsResult::CannotProcess => {
                    if stream.cannot_process_streak() >= self.config.consumer_cannot_process_budget
                    {
                        tracing::warn!(
                            connection = self.core.name(),
                            vbucket = stream.core().vbucket(),
                            "ending passive stream after repeated apply back-pressure"
                        );
                        let _ = stream.set_dead(EndStreamStatus::Slow);
                    }
                }
            }
        }
        if more_to_process {
            TaskAction::RunAgain
        } else {
            TaskAction::Sleep
        }
    }

    /// Whether a live passive stream covers one vbucket.
    #[must_use]
    pub fn is_stream_present(&self, vbucket: VBucketId) -> bool {
        self.lock_streams()
            .get(&vbucket)
            .is_some_and(|stream| stream.core().is_active())
    }

    /// Returns the passive stream for one vbucket, if any.
    #[must_use]
    pub fn find_stream(&self, vbucket: VBucketId) -> Option<Arc<PassiveStream>> {
        self.lock_streams().get(&vbucket).cloned()
    }

    /// Receive path: routes one incoming producer message to its stream.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidArgument` when the message addresses no known stream, plus
    /// any per-stream receive error.
    pub fn message_received(&self, message: DcpMessage) -> EngineResult<()> {
        let vbucket = message
            .vbucket()
            .ok_or(EngineError::InvalidArgument("message addresses no vbucket"))?;
        let stream = self
            .find_stream(vbucket)
            .ok_or(EngineError::InvalidArgument("no passive stream for vbucket"))?;
        stream.message_received(message)
    }

    /// Resumes one stream after a connection re-establishment.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidArgument` when no stream covers the vbucket.
    pub fn reconnect_stream(
        &self,
        vbucket: VBucketId,
        new_opaque: Opaque,
        start_seqno: Seqno,
    ) -> EngineResult<()> {
        let stream = self
            .find_stream(vbucket)
            .ok_or(EngineError::InvalidArgument("no passive stream for vbucket"))?;
        stream.reconnect_stream(new_opaque, start_seqno);
        Ok(())
    }

    /// Closes one stream at the peer's request.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidArgument` when no stream covers the vbucket.
    pub fn close_stream(&self, vbucket: VBucketId) -> EngineResult<()> {
        let stream = self
            .find_stream(vbucket)
            .ok_or(EngineError::InvalidArgument("no passive stream for vbucket"))?;
        let _ = stream.set_dead(EndStreamStatus::Closed);
        Ok(())
    }

    /// Closes every stream and returns the vbuckets they covered.
    ///
    /// Entries stay in the stream table so the vbucket index can still be swept after the
    /// teardown; they are freed with the connection itself.
    pub fn close_all_streams(&self) -> Vec<VBucketId> {
        let streams = {
            let streams = self.lock_streams();
            streams.iter().map(|(vb, stream)| (*vb, Arc::clone(stream))).collect::<Vec<_>>()
        };
        let mut vbuckets = Vec::with_capacity(streams.len());
        for (vbucket, stream) in streams {
            let _ = stream.set_dead(EndStreamStatus::Disconnected);
            vbuckets.push(vbucket);
        }
        vbuckets
    }

    /// Tears down one vbucket's inbound stream after a membership change.
    pub fn vbucket_state_changed(&self, vbucket: VBucketId, _state: VBucketState) {
        if let Some(stream) = self.find_stream(vbucket) {
            let _ = stream.set_dead(EndStreamStatus::StateChanged);
        }
    }

    /// Marks one vbucket's stream ready and resumes a paused connection.
    pub fn notify_stream_ready(&self, vbucket: VBucketId) {
        {
            let mut ready = self.lock_ready();
            if !ready.contains(&vbucket) {
                ready.push_back(vbucket);
            }
        }
        if self.core.paused.swap(false, Ordering::AcqRel) {
            self.gateway.notify_io_complete(self.core.cookie(), Ok(()));
            self.core.set_notify_sent(true);
        }
    }

    /// Network pull: next pending consumer response across this connection's streams.
    #[must_use]
    pub fn next_message(&self) -> Option<DcpMessage> {
        self.core.touch_last_walk_time();
        loop {
            let vbucket = {
                let mut ready = self.lock_ready();
                ready.pop_front()
            };
            let Some(vbucket) = vbucket else {
                self.core.set_paused(true);
                self.core.set_notify_sent(false);
                return None;
            };
            let Some(stream) = self.find_stream(vbucket) else {
                continue;
            };
            match stream.next() {
                Some(message) => {
                    let mut ready = self.lock_ready();
                    ready.push_back(vbucket);
                    return Some(message);
                }
                None => continue,
            }
        }
    }

    /// Vbuckets this consumer currently holds streams on.
    #[must_use]
    pub fn vb_vector(&self) -> Vec<VBucketId> {
        self.lock_streams().keys().copied().collect()
    }

    /// Appends connection and per-stream stats rows.
    pub fn append_stats(&self, out: &mut Vec<(String, String)>) {
        out.push((format!("{}:type", self.core.name()), "consumer".to_owned()));
        let streams = {
            let streams = self.lock_streams();
            streams.values().cloned().collect::<Vec<_>>()
        };
        for stream in streams {
            stream.append_stats(out);
        }
    }
}

/// Owning handle over either connection role.
#[derive(Debug, Clone)]
pub enum ConnHandle {
    /// Producer-side connection.
    Producer(Arc<DcpProducer>),
    /// Consumer-side connection.
    Consumer(Arc<DcpConsumer>),
}

impl ConnHandle {
    /// Shared identity/bookkeeping record.
    #[must_use]
    pub fn core(&self) -> &ConnectionCore {
        match self {
            Self::Producer(producer) => producer.core(),
            Self::Consumer(consumer) => consumer.core(),
        }
    }

    /// Producer view, when this is a producer connection.
    #[must_use]
    pub fn as_producer(&self) -> Option<&Arc<DcpProducer>> {
        match self {
            Self::Producer(producer) => Some(producer),
            Self::Consumer(_) => None,
        }
    }

    /// Consumer view, when this is a consumer connection.
    #[must_use]
    pub fn as_consumer(&self) -> Option<&Arc<DcpConsumer>> {
        match self {
            Self::Producer(_) => None,
            Self::Consumer(consumer) => Some(consumer),
        }
    }

    /// Closes every stream and returns the vbuckets they covered.
    pub fn close_all_streams(&self) -> Vec<VBucketId> {
        match self {
            Self::Producer(producer) => producer.close_all_streams(),
            Self::Consumer(consumer) => consumer.close_all_streams(),
        }
    }

    /// Downgrades to a weak back-reference for the per-vbucket index.
    #[must_use]
    pub fn downgrade(&self) -> WeakConnHandle {
        match self {
            Self::Producer(producer) => WeakConnHandle::Producer(Arc::downgrade(producer)),
            Self::Consumer(consumer) => WeakConnHandle::Consumer(Arc::downgrade(consumer)),
        }
    }

    /// Appends connection and per-stream stats rows.
    pub fn append_stats(&self, out: &mut Vec<(String, String)>) {
        match self {
            Self::Producer(producer) => producer.append_stats(out),
            Self::Consumer(consumer) => consumer.append_stats(out),
        }
    }
}

/// Non-owning connection back-reference used by the per-vbucket index.
#[derive(Debug, Clone)]
pub enum WeakConnHandle {
    /// Weak handle to a producer connection.
    Producer(Weak<DcpProducer>),
    /// Weak handle to a consumer connection.
    Consumer(Weak<DcpConsumer>),
}

impl WeakConnHandle {
    /// Re-acquires the owning handle while the connection is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<ConnHandle> {
        match self {
            Self::Producer(producer) => producer.upgrade().map(ConnHandle::Producer),
            Self::Consumer(consumer) => consumer.upgrade().map(ConnHandle::Consumer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DcpConsumer, DcpProducer};
    use crate::backfill::{BackfillAdmission, BackfillManager};
    use crate::message::{DcpMessage, EndStreamStatus, MutationPayloadKind};
    use crate::processor::CheckpointProcessorTask;
    use crate::stream::{DcpStream, StreamRequest};
    use crate::testkit::{InMemoryBackfillStore, RecordingReplicaStore, RecordingServerGateway};
    use atomic_float::AtomicF32;
    use googletest::prelude::*;
    use reef_common::config::DcpConfig;
    use reef_common::error::EngineError;
    use reef_common::ids::{MARKER_FLAG_ACK, MARKER_FLAG_MEMORY, Seqno, VBucketId};
    use reef_engine::backfill_store::BackfillStore;
    use reef_engine::checkpoint::{CheckpointLog, InMemoryCheckpointLog};
    use reef_engine::item::{Item, QueuedItem, VBucketState};
    use rstest::rstest;
    use std::sync::Arc;

    fn test_producer(
        notify_only: bool,
        checkpoint: &Arc<InMemoryCheckpointLog>,
    ) -> Arc<DcpProducer> {
        let admission = Arc::new(BackfillAdmission::new(1024 * 1024));
        let backfills = Arc::new(BackfillManager::new(
            InMemoryBackfillStore::new() as Arc<dyn BackfillStore>,
            admission,
        ));
        DcpProducer::new(
            11,
            "eq_dcpq:prod".to_owned(),
            notify_only,
            DcpConfig::default(),
            Arc::clone(checkpoint) as Arc<dyn CheckpointLog>,
            Arc::new(CheckpointProcessorTask::new(10)),
            backfills,
            Arc::new(AtomicF32::new(0.85)),
            RecordingServerGateway::new(),
        )
    }

    fn test_consumer(
        budget: usize,
        replica: &Arc<RecordingReplicaStore>,
    ) -> Arc<DcpConsumer> {
        let config = DcpConfig {
            consumer_cannot_process_budget: budget,
            ..DcpConfig::default()
        };
        DcpConsumer::new(
            21,
            "eq_dcpq:cons".to_owned(),
            config,
            Arc::clone(replica) as _,
            RecordingServerGateway::new(),
        )
    }

    fn open_request(vbucket: VBucketId, end_seqno: Seqno) -> StreamRequest {
        StreamRequest {
            flags: 0,
            opaque: 1,
            vbucket,
            start_seqno: 0,
            end_seqno,
            vb_uuid: 0,
            snap_start_seqno: 0,
            snap_end_seqno: 0,
        }
    }

    #[rstest]
    fn notify_only_producer_serves_notifier_streams() {
        let checkpoint = Arc::new(InMemoryCheckpointLog::new());
        checkpoint.create_vbucket(2, VBucketState::Active);
        for _ in 0..5 {
            let _ = checkpoint
                .append(2, QueuedItem::Mutation(Item::mutation(b"k", b"v", 0)))
                .expect("append must succeed");
        }
        let producer = test_producer(true, &checkpoint);

        producer
            .stream_request(open_request(2, 5))
            .expect("notifier stream request must succeed");
        let stream = producer.find_stream(2).expect("stream entry must exist");
        assert_that!(matches!(stream, DcpStream::Notifier(_)), eq(true));

        // The watched seqno was already reachable at creation time.
        let Some(DcpMessage::StreamEnd { status, .. }) = producer.next_message() else {
            panic!("a reachable notifier window must end immediately");
        };
        assert_that!(status, eq(EndStreamStatus::Ok));
    }

    #[rstest]
    fn producer_rejects_second_live_stream_per_vbucket() {
        let checkpoint = Arc::new(InMemoryCheckpointLog::new());
        checkpoint.create_vbucket(0, VBucketState::Active);
        let producer = test_producer(false, &checkpoint);

        assert_that!(producer.stream_request(open_request(0, u64::MAX)), eq(Ok(())));
        assert_that!(
            producer.stream_request(open_request(0, u64::MAX)),
            eq(Err(EngineError::KeyExists))
        );

        // A dead entry is replaced rather than rejected.
        producer
            .close_stream(0)
            .expect("close of an existing stream must succeed");
        assert_that!(producer.stream_request(open_request(0, u64::MAX)), eq(Ok(())));
    }

    #[rstest]
    fn consumer_rejects_duplicate_and_unhosted_vbuckets() {
        let replica = RecordingReplicaStore::new();
        replica.host_only(&[1]);
        let consumer = test_consumer(10, &replica);

        assert_that!(consumer.add_stream(1, 1, 0), eq(Ok(())));
        consumer.cancel_task();
        assert_that!(consumer.add_stream(2, 1, 0), eq(Err(EngineError::KeyExists)));
        assert_that!(
            consumer.add_stream(3, 2, 0),
            eq(Err(EngineError::NotMyVbucket))
        );
    }

    #[rstest]
    fn consumer_routes_messages_and_surfaces_acks() {
        let replica = RecordingReplicaStore::new();
        let consumer = test_consumer(10, &replica);
        consumer.add_stream(7, 4, 0).expect("add stream must succeed");
        consumer.cancel_task();

        let Some(DcpMessage::AddStreamResponse { opaque, status, .. }) = consumer.next_message()
        else {
            panic!("the add-stream response must surface first");
        };
        assert_that!(opaque, eq(7_u32));
        assert_that!(status, eq(Ok(())));

        consumer
            .message_received(DcpMessage::SnapshotMarker {
                opaque: 1,
                vbucket: 4,
                start_seqno: 1,
                end_seqno: 2,
                flags: MARKER_FLAG_MEMORY | MARKER_FLAG_ACK,
            })
            .expect("marker must be accepted");
        for seqno in 1..=2_u64 {
            consumer
                .message_received(DcpMessage::Mutation {
                    opaque: 1,
                    vbucket: 4,
                    item: Item::mutation(b"k", b"v", seqno),
                    payload: MutationPayloadKind::KeyAndValue,
                })
                .expect("mutation must be accepted");
        }
        let _ = consumer.process_buffered_streams();

        assert_that!(replica.applied_log().len(), eq(2_usize));
        let Some(DcpMessage::SnapshotMarkerAck { vbucket, .. }) = consumer.next_message() else {
            panic!("the applied ack-flagged snapshot must surface a marker ack");
        };
        assert_that!(vbucket, eq(4_u16));

        let unknown = consumer.message_received(DcpMessage::SnapshotMarker {
            opaque: 1,
            vbucket: 9,
            start_seqno: 1,
            end_seqno: 2,
            flags: MARKER_FLAG_MEMORY,
        });
        assert_that!(unknown.is_err(), eq(true));
    }

    #[rstest]
    fn repeated_back_pressure_ends_the_stream_as_slow() {
        let replica = RecordingReplicaStore::new();
        let consumer = test_consumer(1, &replica);
        consumer.add_stream(1, 6, 0).expect("add stream must succeed");
        consumer.cancel_task();

        consumer
            .message_received(DcpMessage::SnapshotMarker {
                opaque: 1,
                vbucket: 6,
                start_seqno: 1,
                end_seqno: 1,
                flags: MARKER_FLAG_MEMORY,
            })
            .expect("marker must be accepted");
        consumer
            .message_received(DcpMessage::Mutation {
                opaque: 1,
                vbucket: 6,
                item: Item::mutation(b"k", b"v", 1),
                payload: MutationPayloadKind::KeyAndValue,
            })
            .expect("mutation must be accepted");

        replica.fail_next_applies(usize::MAX);
        let _ = consumer.process_buffered_streams();

        assert_that!(consumer.is_stream_present(6), eq(false));
        let stream = consumer.find_stream(6).expect("stream entry must remain");
        assert_that!(stream.core().is_active(), eq(false));
    }
}
