//! Deduplicating work queue draining ready checkpoint cursors into active streams.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use hashbrown::HashSet;
use reef_common::ids::VBucketId;
use reef_engine::tasks::{BackgroundTask, TaskAction, WorkerWaker};

use crate::stream::ActiveStream;

#[derive(Debug)]
struct ProcessorQueue {
    queue: VecDeque<(VBucketId, Weak<ActiveStream>)>,
    queued_vbuckets: HashSet<VBucketId>,
}

/// Singleton extraction task per producer engine.
///
/// Each vbucket appears at most once in the queue, so a fast vbucket firing frequent
/// seqno-available notifications cannot livelock the producer. The per-run iteration budget
/// shares the worker fairly across producers.
#[derive(Debug)]
pub struct CheckpointProcessorTask {
    inner: Mutex<ProcessorQueue>,
    notified: AtomicBool,
    iterations_before_yield: usize,
    waker: Mutex<Option<WorkerWaker>>,
}

impl CheckpointProcessorTask {
    /// Creates the task with the configured per-run stream budget.
    #[must_use]
    pub fn new(iterations_before_yield: usize) -> Self {
        Self {
            inner: Mutex::new(ProcessorQueue {
                queue: VecDeque::new(),
                queued_vbuckets: HashSet::new(),
            }),
            notified: AtomicBool::new(false),
            iterations_before_yield: iterations_before_yield.max(1),
            waker: Mutex::new(None),
        }
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, ProcessorQueue> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches the worker wake handle once the pumping worker is spawned.
    pub fn attach_waker(&self, waker: WorkerWaker) {
        let mut slot = self.waker.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(waker);
    }

    /// Queues one stream for extraction unless its vbucket is already queued.
    pub fn schedule(&self, stream: &Arc<ActiveStream>) {
        let vbucket = stream.core().vbucket();
        {
            let mut queue = self.lock_queue();
            if !queue.queued_vbuckets.insert(vbucket) {
                return;
            }
            queue.queue.push_back((vbucket, Arc::downgrade(stream)));
        }
        self.wakeup();
    }

    /// Wakes the pumping worker unless a wake is already pending.
    pub fn wakeup(&self) {
        if self.notified.swap(true, Ordering::AcqRel) {
            return;
        }
        let slot = self.waker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(waker) = slot.as_ref() {
            waker.wake();
        }
    }

    fn queue_pop(&self) -> Option<Weak<ActiveStream>> {
        let mut queue = self.lock_queue();
        let (vbucket, stream) = queue.queue.pop_front()?;
        let _ = queue.queued_vbuckets.remove(&vbucket);
        Some(stream)
    }

    /// Number of currently queued streams.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.lock_queue().queue.len()
    }

    /// Drops queued entries for the given vbuckets (disconnecting producer teardown).
    pub fn remove_vbuckets(&self, vbuckets: &[VBucketId]) {
        let mut queue = self.lock_queue();
        for vbucket in vbuckets {
            let _ = queue.queued_vbuckets.remove(vbucket);
        }
        queue
            .queue
            .retain(|(vbucket, _)| !vbuckets.contains(vbucket));
    }

    /// Drops all queued work (engine shutdown).
    pub fn clear(&self) {
        let mut queue = self.lock_queue();
        queue.queue.clear();
        queue.queued_vbuckets.clear();
    }
}

impl BackgroundTask for CheckpointProcessorTask {
    fn run_once(&self) -> TaskAction {
        self.notified.store(false, Ordering::Release);
        for _ in 0..self.iterations_before_yield {
            let Some(weak) = self.queue_pop() else {
                break;
            };
            if let Some(stream) = weak.upgrade()
                && stream.core().is_active()
            {
                stream.next_checkpoint_item_task();
            }
        }
        if self.queue_len() > 0 {
            TaskAction::RunAgain
        } else {
            TaskAction::Sleep
        }
    }

    fn description(&self) -> &'static str {
        "Process checkpoint(s) for DCP producer"
    }
}

#[cfg(test)]
mod tests {
    use super::CheckpointProcessorTask;
    use crate::message::MutationPayloadKind;
    use crate::stream::{ActiveStream, StreamRequest};
    use atomic_float::AtomicF32;
    use googletest::prelude::*;
    use reef_engine::checkpoint::{CheckpointLog, InMemoryCheckpointLog};
    use reef_engine::tasks::{BackgroundTask, TaskAction};
    use rstest::rstest;
    use std::sync::{Arc, Weak};

    fn stream_for_vbucket(
        vbucket: u16,
        processor: &Arc<CheckpointProcessorTask>,
    ) -> Arc<ActiveStream> {
        ActiveStream::new(
            "eq_dcpq:processor-test".to_owned(),
            &StreamRequest {
                flags: 0,
                opaque: 1,
                vbucket,
                start_seqno: 0,
                end_seqno: u64::MAX,
                vb_uuid: 0,
                snap_start_seqno: 0,
                snap_end_seqno: 0,
            },
            Weak::new(),
            Arc::new(InMemoryCheckpointLog::new()) as Arc<dyn CheckpointLog>,
            Arc::clone(processor),
            Arc::new(AtomicF32::new(0.0)),
            MutationPayloadKind::KeyAndValue,
        )
    }

    #[rstest]
    fn schedule_deduplicates_by_vbucket() {
        let processor = Arc::new(CheckpointProcessorTask::new(10));
        let stream = stream_for_vbucket(4, &processor);

        processor.schedule(&stream);
        processor.schedule(&stream);
        assert_that!(processor.queue_len(), eq(1_usize));

        // Popping frees the vbucket slot for the next notification.
        let _ = processor.run_once();
        processor.schedule(&stream);
        assert_that!(processor.queue_len(), eq(1_usize));
    }

    #[rstest]
    fn run_budget_yields_with_work_left() {
        let processor = Arc::new(CheckpointProcessorTask::new(2));
        let streams = [
            stream_for_vbucket(0, &processor),
            stream_for_vbucket(1, &processor),
            stream_for_vbucket(2, &processor),
        ];
        for stream in &streams {
            processor.schedule(stream);
        }

        assert_that!(processor.run_once(), eq(TaskAction::RunAgain));
        assert_that!(processor.queue_len(), eq(1_usize));
        assert_that!(processor.run_once(), eq(TaskAction::Sleep));
        assert_that!(processor.queue_len(), eq(0_usize));
    }

    #[rstest]
    fn remove_vbuckets_drops_queued_work_for_disconnecting_producer() {
        let processor = Arc::new(CheckpointProcessorTask::new(10));
        let keep = stream_for_vbucket(0, &processor);
        let drop_a = stream_for_vbucket(1, &processor);
        let drop_b = stream_for_vbucket(2, &processor);
        processor.schedule(&keep);
        processor.schedule(&drop_a);
        processor.schedule(&drop_b);

        processor.remove_vbuckets(&[1, 2]);
        assert_that!(processor.queue_len(), eq(1_usize));

        // The freed vbuckets can queue again.
        processor.schedule(&drop_a);
        assert_that!(processor.queue_len(), eq(2_usize));
    }
}
