//! Background worker plumbing shared by DCP task loops.
//!
//! Each DCP task (checkpoint processor, consumer buffer processor, backfill runner, connection
//! manager) is a [`BackgroundTask`] pumped by one dedicated named worker thread. The task stays
//! synchronously drivable through `run_once`, so tests exercise task logic without threads.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Outcome of one task iteration, deciding what the worker loop does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    /// More work is queued; run again without sleeping.
    RunAgain,
    /// Nothing to do; sleep until woken (or until the idle period elapses).
    Sleep,
    /// The task is finished; the worker thread exits.
    Complete,
}

/// One cooperatively scheduled unit of background work.
pub trait BackgroundTask: Send + Sync + 'static {
    /// Performs one bounded slice of work.
    fn run_once(&self) -> TaskAction;

    /// Human-readable task label used for thread naming and stats.
    fn description(&self) -> &'static str;
}

#[derive(Debug, Default)]
struct WakeState {
    wake_pending: bool,
    shutdown: bool,
}

type SharedWakeState = Arc<(Mutex<WakeState>, Condvar)>;

/// Clonable wake handle a task can hand to its producers.
#[derive(Clone)]
pub struct WorkerWaker {
    state: SharedWakeState,
}

impl WorkerWaker {
    /// Wakes the owning worker; a wake delivered while the task runs is not lost.
    pub fn wake(&self) {
        let (lock, condvar) = &*self.state;
        let mut guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        guard.wake_pending = true;
        condvar.notify_one();
    }
}

impl std::fmt::Debug for WorkerWaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerWaker").finish_non_exhaustive()
    }
}

/// Owning handle of one background worker thread.
pub struct WorkerHandle {
    state: SharedWakeState,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("has_worker", &self.worker.is_some())
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    /// Spawns one named worker thread pumping `task`.
    ///
    /// With `idle_period` set, a sleeping worker re-runs the task at least that often even
    /// without an explicit wake (periodic tasks).
    #[must_use]
    pub fn spawn(
        name: &str,
        task: Arc<dyn BackgroundTask>,
        idle_period: Option<Duration>,
    ) -> Self {
        let state: SharedWakeState = Arc::new((Mutex::new(WakeState::default()), Condvar::new()));
        let state_for_worker = Arc::clone(&state);
        let worker = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || worker_main(&state_for_worker, task.as_ref(), idle_period))
            .ok();
        Self { state, worker }
    }

    /// Returns a wake handle usable from other threads.
    #[must_use]
    pub fn waker(&self) -> WorkerWaker {
        WorkerWaker {
            state: Arc::clone(&self.state),
        }
    }

    /// Wakes the worker if it is sleeping.
    pub fn wake(&self) {
        self.waker().wake();
    }

    /// Stops the worker loop and joins the thread.
    pub fn shutdown(&mut self) {
        {
            let (lock, condvar) = &*self.state;
            let mut guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            guard.shutdown = true;
            condvar.notify_one();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_main(state: &SharedWakeState, task: &dyn BackgroundTask, idle_period: Option<Duration>) {
    let (lock, condvar) = &**state;
    loop {
        {
            let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            if guard.shutdown {
                break;
            }
        }

        match task.run_once() {
            TaskAction::RunAgain => {}
            TaskAction::Complete => break,
            TaskAction::Sleep => {
                let mut guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
                while !guard.wake_pending && !guard.shutdown {
                    match idle_period {
                        Some(period) => {
                            let (next_guard, timeout) = condvar
                                .wait_timeout(guard, period)
                                .unwrap_or_else(PoisonError::into_inner);
                            guard = next_guard;
                            if timeout.timed_out() {
                                break;
                            }
                        }
                        None => {
                            guard = condvar.wait(guard).unwrap_or_else(PoisonError::into_inner);
                        }
                    }
                }
                guard.wake_pending = false;
                if guard.shutdown {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BackgroundTask, TaskAction, WorkerHandle};
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    struct CountdownTask {
        runs: AtomicUsize,
        complete_after: usize,
    }

    impl BackgroundTask for CountdownTask {
        fn run_once(&self) -> TaskAction {
            let run = self.runs.fetch_add(1, Ordering::AcqRel) + 1;
            if run >= self.complete_after {
                TaskAction::Complete
            } else {
                TaskAction::RunAgain
            }
        }

        fn description(&self) -> &'static str {
            "countdown"
        }
    }

    struct SleepyTask {
        runs: AtomicUsize,
    }

    impl BackgroundTask for SleepyTask {
        fn run_once(&self) -> TaskAction {
            let _ = self.runs.fetch_add(1, Ordering::AcqRel);
            TaskAction::Sleep
        }

        fn description(&self) -> &'static str {
            "sleepy"
        }
    }

    fn wait_for(predicate: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if predicate() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[rstest]
    fn worker_pumps_until_task_completes() {
        let task = Arc::new(CountdownTask {
            runs: AtomicUsize::new(0),
            complete_after: 3,
        });
        let worker_task: Arc<dyn BackgroundTask> = Arc::clone(&task) as Arc<dyn BackgroundTask>;
        let mut handle = WorkerHandle::spawn("reef-test-countdown", worker_task, None);

        assert_that!(
            wait_for(|| task.runs.load(Ordering::Acquire) == 3),
            eq(true)
        );
        handle.shutdown();
    }

    #[rstest]
    fn sleeping_worker_reruns_on_wake() {
        let task = Arc::new(SleepyTask {
            runs: AtomicUsize::new(0),
        });
        let worker_task: Arc<dyn BackgroundTask> = Arc::clone(&task) as Arc<dyn BackgroundTask>;
        let mut handle = WorkerHandle::spawn("reef-test-sleepy", worker_task, None);

        assert_that!(
            wait_for(|| task.runs.load(Ordering::Acquire) >= 1),
            eq(true)
        );
        handle.wake();
        assert_that!(
            wait_for(|| task.runs.load(Ordering::Acquire) >= 2),
            eq(true)
        );
        handle.shutdown();
    }

    #[rstest]
    fn idle_period_reruns_periodic_tasks_without_wakes() {
        let task = Arc::new(SleepyTask {
            runs: AtomicUsize::new(0),
        });
        let worker_task: Arc<dyn BackgroundTask> = Arc::clone(&task) as Arc<dyn BackgroundTask>;
        let mut handle = WorkerHandle::spawn(
            "reef-test-periodic",
            worker_task,
            Some(Duration::from_millis(10)),
        );

        assert_that!(
            wait_for(|| task.runs.load(Ordering::Acquire) >= 3),
            eq(true)
        );
        handle.shutdown();
    }
}
