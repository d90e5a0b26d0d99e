//! Backfill admission control and per-producer backfill execution.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use reef_common::ids::{Seqno, VBucketId};
use reef_engine::backfill_store::{BackfillSource, BackfillStore, BackfillVisitor};
use reef_engine::item::Item;
use reef_engine::tasks::{BackgroundTask, TaskAction, WorkerWaker};

use crate::stream::ActiveStream;

/// Cap on bytes one active stream may hold in not-yet-pulled backfill messages.
pub const BUFFERED_BACKFILL_BYTES_LIMIT: u64 = 20 * 1024 * 1024;

/// Assumed per-backfill file memory footprint driving the admission cap.
const DB_FILE_MEM_BYTES: u64 = 10 * 1024;
/// Share of the bucket quota budgeted for concurrent backfills, in percent.
const BACKFILL_MEM_THRESHOLD_PERCENT: u64 = 1;
/// Hard ceiling on concurrently admitted backfills.
const MAX_ADMITTED_BACKFILLS: u64 = 4096;

#[derive(Debug)]
struct AdmissionCounters {
    active: u64,
    max: u64,
}

/// Process-wide cap on concurrently active or snoozing backfills.
#[derive(Debug)]
pub struct BackfillAdmission {
    counters: Mutex<AdmissionCounters>,
}

fn admission_cap(max_data_size: u64) -> u64 {
    let budget = max_data_size * BACKFILL_MEM_THRESHOLD_PERCENT / 100 / DB_FILE_MEM_BYTES;
    budget.clamp(1, MAX_ADMITTED_BACKFILLS)
}

impl BackfillAdmission {
    /// Creates the admission counter with a cap derived from the bucket quota.
    #[must_use]
    pub fn new(max_data_size: u64) -> Self {
        Self {
            counters: Mutex::new(AdmissionCounters {
                active: 0,
                max: admission_cap(max_data_size),
            }),
        }
    }

    fn lock_counters(&self) -> std::sync::MutexGuard<'_, AdmissionCounters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically claims one backfill slot if the cap allows it.
    #[must_use]
    pub fn can_add_backfill_to_active_q(&self) -> bool {
        let mut counters = self.lock_counters();
        if counters.active < counters.max {
            counters.active += 1;
            true
        } else {
            false
        }
    }

    /// Releases one backfill slot; an underflow indicates a leaked slot and is clamped.
    pub fn decr_num_active_snoozing_backfills(&self) {
        let mut counters = self.lock_counters();
        if counters.active > 0 {
            counters.active -= 1;
        } else {
            tracing::warn!("active/snoozing backfill counter is already zero");
        }
    }

    /// Recomputes the cap after a bucket quota change.
    pub fn update_max_active_snoozing_backfills(&self, max_data_size: u64) {
        let mut counters = self.lock_counters();
        counters.max = admission_cap(max_data_size);
        tracing::debug!(max = counters.max, "max active snoozing backfills updated");
    }

    /// Currently claimed backfill slots.
    #[must_use]
    pub fn num_active_snoozing_backfills(&self) -> u64 {
        self.lock_counters().active
    }

    /// Current slot cap.
    #[must_use]
    pub fn max_active_snoozing_backfills(&self) -> u64 {
        self.lock_counters().max
    }
}

struct StreamBackfillVisitor<'a> {
    stream: &'a Arc<ActiveStream>,
}

impl BackfillVisitor for StreamBackfillVisitor<'_> {
    fn mark_disk_snapshot(&mut self, start_seqno: Seqno, end_seqno: Seqno) {
        self.stream.mark_disk_snapshot(start_seqno, end_seqno);
    }

    fn item(&mut self, item: Item, source: BackfillSource) -> bool {
        self.stream.backfill_received(item, source)
    }
}

#[derive(Debug)]
struct QueuedBackfill {
    stream: Weak<ActiveStream>,
    start_seqno: Seqno,
    end_seqno: Seqno,
}

/// Per-producer queue of pending disk backfills, pumped by one worker.
///
/// A backfill denied admission snoozes at the queue head and is retried when the manager is
/// next woken (budget release or registry-wide wake).
pub struct BackfillManager {
    store: Arc<dyn BackfillStore>,
    admission: Arc<BackfillAdmission>,
    queue: Mutex<VecDeque<QueuedBackfill>>,
    waker: Mutex<Option<WorkerWaker>>,
}

impl std::fmt::Debug for BackfillManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackfillManager")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl BackfillManager {
    /// Creates the manager over the storage scan surface and the shared admission counter.
    #[must_use]
    pub fn new(store: Arc<dyn BackfillStore>, admission: Arc<BackfillAdmission>) -> Self {
        Self {
            store,
            admission,
            queue: Mutex::new(VecDeque::new()),
            waker: Mutex::new(None),
        }
    }

    /// Attaches the worker wake handle once the pumping worker is spawned.
    pub fn attach_waker(&self, waker: WorkerWaker) {
        let mut slot = self.waker.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(waker);
    }

    /// Queues one stream's disk scan.
    pub fn schedule(&self, stream: &Arc<ActiveStream>, start_seqno: Seqno, end_seqno: Seqno) {
        {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.push_back(QueuedBackfill {
                stream: Arc::downgrade(stream),
                start_seqno,
                end_seqno,
            });
        }
        self.wake();
    }

    /// Wakes the pumping worker so snoozing backfills retry promptly.
    pub fn wake(&self) {
        let slot = self.waker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(waker) = slot.as_ref() {
            waker.wake();
        }
    }

    /// Pending (queued or snoozing) backfill count.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn run_backfill(&self, stream: &Arc<ActiveStream>, start_seqno: Seqno, end_seqno: Seqno) {
        let vbucket: VBucketId = stream.core().vbucket();
        let estimate = self.store.estimate_items(vbucket, start_seqno, end_seqno);
        stream.incr_backfill_remaining(estimate);
        if let Err(error) = self
            .store
            .scan(vbucket, start_seqno, end_seqno, &mut StreamBackfillVisitor { stream })
        {
            tracing::warn!(vbucket, %error, "backfill scan failed");
        }
        stream.complete_backfill();
    }
}

impl BackgroundTask for BackfillManager {
    fn run_once(&self) -> TaskAction {
        let next = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.pop_front()
        };
        let Some(backfill) = next else {
            return TaskAction::Sleep;
        };

        let Some(stream) = backfill.stream.upgrade() else {
            return if self.pending() > 0 {
                TaskAction::RunAgain
            } else {
                TaskAction::Sleep
            };
        };
        if !stream.core().is_active() {
            // The stream died while queued; there is no budget to release.
            stream.complete_backfill();
            return if self.pending() > 0 {
                TaskAction::RunAgain
            } else {
                TaskAction::Sleep
            };
        }

        if !self.admission.can_add_backfill_to_active_q() {
            // Snooze at the head so ordering is preserved when budget frees up.
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.push_front(backfill);
            return TaskAction::Sleep;
        }

        self.run_backfill(&stream, backfill.start_seqno, backfill.end_seqno);
        self.admission.decr_num_active_snoozing_backfills();

        if self.pending() > 0 {
            TaskAction::RunAgain
        } else {
            TaskAction::Sleep
        }
    }

    fn description(&self) -> &'static str {
        "Run DCP backfills"
    }
}
