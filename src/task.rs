// ============================================================================
// ASYNC TASK — single-use background computation with poll / get / cancel
// ============================================================================
//
// The body runs on the rayon pool (or a dedicated thread, or lazily on the
// caller for serial mode).  When it finishes, the worker parks its result in
// a shared slot and flips `finished`; the owning thread either polls
// `ready()` every frame or blocks in `get()`.  Panics in the body are caught
// on the worker and delivered to `get()` as `TaskError::Panicked`.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::EditError;
use crate::progress::{AtomicProgress, ProgressState};

/// Where a task body runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    /// `rayon::spawn` on the global pool.
    #[default]
    Pool,
    /// A freshly spawned, named OS thread.
    Dedicated,
    /// Deferred: the body runs on whichever thread first calls `get()`.
    Serial,
}

/// Executor-level failure of a task body.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("task worker exited without a result")]
    WorkerLost,
}

impl From<TaskError> for EditError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Panicked(msg) => EditError::Panicked(msg),
            TaskError::WorkerLost => EditError::Failed("background worker vanished".to_string()),
        }
    }
}

type Job<T> = Box<dyn FnOnce(&AtomicProgress) -> T + Send + 'static>;

/// Slot the worker writes its outcome into.
struct Completion<T> {
    finished: AtomicBool,
    slot: Mutex<Option<Result<T, TaskError>>>,
    signal: Condvar,
}

impl<T> Completion<T> {
    fn new() -> Self {
        Self {
            finished: AtomicBool::new(false),
            slot: Mutex::new(None),
            signal: Condvar::new(),
        }
    }

    fn publish(&self, outcome: Result<T, TaskError>) {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(outcome);
        self.finished.store(true, Ordering::Release);
        self.signal.notify_all();
    }

    fn wait(&self) -> Result<T, TaskError> {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if let Some(outcome) = slot.take() {
                return outcome;
            }
            if self.finished.load(Ordering::Acquire) {
                return Err(TaskError::WorkerLost);
            }
            slot = self.signal.wait(slot).unwrap_or_else(|p| p.into_inner());
        }
    }
}

/// Publishes `WorkerLost` if the job is dropped without ever running
/// (e.g. the pool is torn down), so `get()` cannot hang.
struct PublishGuard<T> {
    completion: Option<Arc<Completion<T>>>,
}

impl<T> PublishGuard<T> {
    fn finish(mut self, outcome: Result<T, TaskError>) {
        if let Some(c) = self.completion.take() {
            c.publish(outcome);
        }
    }
}

impl<T> Drop for PublishGuard<T> {
    fn drop(&mut self) {
        if let Some(c) = self.completion.take() {
            c.publish(Err(TaskError::WorkerLost));
        }
    }
}

/// Pull a printable message out of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn run_job<T>(job: Job<T>, progress: &AtomicProgress) -> Result<T, TaskError> {
    catch_unwind(AssertUnwindSafe(|| job(progress)))
        .map_err(|payload| TaskError::Panicked(panic_message(payload.as_ref())))
}

enum Stage<T> {
    /// Built, `compute()` not called yet.
    Pending(Job<T>),
    /// Body handed to a worker.
    Running(Arc<Completion<T>>),
    /// Serial schedule: body waits for `get()`.
    Deferred(Job<T>),
    /// Result retrieved and cached.
    Ready(Result<T, TaskError>),
    Taken,
}

/// A one-shot background computation producing a `T`.
///
/// Lifecycle: `new` → `compute()` → poll `ready()` / `progress()` →
/// `get()`.  `cancel()` only *asks*; the caller still calls `get()` to join.
pub struct AsyncTask<T> {
    stage: Stage<T>,
    progress: AtomicProgress,
    schedule: Schedule,
    name: String,
}

impl<T: Send + 'static> AsyncTask<T> {
    /// Task whose body reports progress and polls for cancellation.
    /// The token is marked done when the body returns normally.
    pub fn new(f: impl FnOnce(&AtomicProgress) -> T + Send + 'static) -> Self {
        let job: Job<T> = Box::new(move |progress: &AtomicProgress| {
            let value = f(progress);
            progress.set_done();
            value
        });
        Self {
            stage: Stage::Pending(job),
            progress: AtomicProgress::new(),
            schedule: Schedule::default(),
            name: "task".to_string(),
        }
    }

    /// Task without progress reporting; reads as `Indeterminate` while it runs.
    pub fn without_progress(f: impl FnOnce() -> T + Send + 'static) -> Self {
        let job: Job<T> = Box::new(move |_: &AtomicProgress| f());
        Self {
            stage: Stage::Pending(job),
            progress: AtomicProgress::busy(),
            schedule: Schedule::default(),
            name: "task".to_string(),
        }
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Label used for the worker thread name and log lines.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start the body.  Returns immediately.
    ///
    /// # Panics
    /// If called more than once on the same task.
    pub fn compute(&mut self) {
        let job = match std::mem::replace(&mut self.stage, Stage::Taken) {
            Stage::Pending(job) => job,
            other => {
                self.stage = other;
                panic!("AsyncTask::compute called twice on '{}'", self.name);
            }
        };

        if self.schedule == Schedule::Serial {
            self.stage = Stage::Deferred(job);
            return;
        }

        let completion = Arc::new(Completion::new());
        let guard = PublishGuard {
            completion: Some(Arc::clone(&completion)),
        };
        let progress = self.progress.clone();
        let body = move || {
            let outcome = run_job(job, &progress);
            guard.finish(outcome);
        };

        match self.schedule {
            Schedule::Pool => rayon::spawn(body),
            Schedule::Dedicated => {
                let spawned = std::thread::Builder::new()
                    .name(format!("lumaedit-{}", self.name))
                    .spawn(body);
                if let Err(e) = spawned {
                    // The closure (and its guard) was dropped, which already
                    // published WorkerLost.
                    crate::log_err!("Could not spawn worker for '{}': {}", self.name, e);
                }
            }
            Schedule::Serial => unreachable!(),
        }
        self.stage = Stage::Running(completion);
    }

    /// True once the body has returned (normally, early on cancel, or by
    /// panicking).  Never blocks.
    pub fn ready(&self) -> bool {
        match &self.stage {
            Stage::Pending(_) => false,
            Stage::Running(c) => c.finished.load(Ordering::Acquire),
            // Serial bodies are computed on demand in get(), so they are
            // always "ready" to be retrieved.
            Stage::Deferred(_) | Stage::Ready(_) | Stage::Taken => true,
        }
    }

    /// True once `compute()` has been called.
    pub fn started(&self) -> bool {
        !matches!(self.stage, Stage::Pending(_))
    }

    /// Block until the body is done and return its cached result.
    ///
    /// Repeated calls return the same value.  A never-started task runs its
    /// body on the calling thread.
    pub fn get(&mut self) -> Result<&T, TaskError> {
        self.join();
        match &self.stage {
            Stage::Ready(Ok(value)) => Ok(value),
            Stage::Ready(Err(e)) => Err(e.clone()),
            _ => Err(TaskError::WorkerLost),
        }
    }

    /// Join and move the result out, consuming the task.
    pub fn into_result(mut self) -> Result<T, TaskError> {
        self.join();
        match std::mem::replace(&mut self.stage, Stage::Taken) {
            Stage::Ready(outcome) => outcome,
            _ => Err(TaskError::WorkerLost),
        }
    }

    fn join(&mut self) {
        let outcome = match std::mem::replace(&mut self.stage, Stage::Taken) {
            Stage::Pending(job) | Stage::Deferred(job) => run_job(job, &self.progress),
            Stage::Running(completion) => completion.wait(),
            ready @ Stage::Ready(_) => {
                self.stage = ready;
                return;
            }
            Stage::Taken => Err(TaskError::WorkerLost),
        };
        self.stage = Stage::Ready(outcome);
    }

    /// Ask the body to stop early.  Does not block.
    pub fn cancel(&self) {
        self.progress.request_cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.progress.is_cancelled()
    }

    pub fn progress(&self) -> ProgressState {
        self.progress.progress()
    }

    /// Overwrite the reported progress (e.g. busy while committing).
    pub fn set_progress(&self, state: ProgressState) {
        match state {
            ProgressState::Fraction(f) => self.progress.reset_progress(f),
            ProgressState::Indeterminate | ProgressState::Idle => self.progress.set_busy(),
        }
    }

    /// Shared handle to the task's token (for external cancel buttons).
    pub fn progress_token(&self) -> AtomicProgress {
        self.progress.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn get_returns_cached_value() {
        let mut task = AsyncTask::new(|_| 21 * 2);
        task.compute();
        assert_eq!(*task.get().unwrap(), 42);
        assert_eq!(*task.get().unwrap(), 42);
        assert!(task.ready());
        assert_eq!(task.progress(), ProgressState::Fraction(1.0));
    }

    #[test]
    fn without_progress_reports_indeterminate() {
        let (tx, rx) = mpsc::channel::<()>();
        let mut task = AsyncTask::without_progress(move || {
            let _ = rx.recv();
            7
        })
        .with_schedule(Schedule::Dedicated);
        task.compute();
        assert_eq!(task.progress(), ProgressState::Indeterminate);
        tx.send(()).unwrap();
        assert_eq!(task.into_result().unwrap(), 7);
    }

    #[test]
    fn ready_flips_only_after_body_returns() {
        let (tx, rx) = mpsc::channel::<()>();
        let mut task = AsyncTask::new(move |_| {
            let _ = rx.recv();
            "done"
        })
        .with_schedule(Schedule::Dedicated);
        assert!(!task.ready());
        task.compute();
        assert!(!task.ready());
        tx.send(()).unwrap();
        assert_eq!(*task.get().unwrap(), "done");
        assert!(task.ready());
    }

    #[test]
    #[should_panic(expected = "compute called twice")]
    fn compute_twice_is_fatal() {
        let mut task = AsyncTask::new(|_| 1).with_schedule(Schedule::Serial);
        task.compute();
        task.compute();
    }

    #[test]
    fn panics_surface_as_typed_failure() {
        let mut task: AsyncTask<u32> = AsyncTask::new(|_| panic!("bad pixel"));
        task.compute();
        assert_eq!(
            task.get().unwrap_err(),
            TaskError::Panicked("bad pixel".to_string())
        );
        // cached failure, still no hang
        assert!(task.get().is_err());
    }

    #[test]
    fn cancel_then_get_joins_promptly() {
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let mut task = AsyncTask::new(move |p: &AtomicProgress| {
            let _ = started_tx.send(());
            let mut spins = 0u64;
            while !p.is_cancelled() {
                std::thread::sleep(Duration::from_millis(1));
                spins += 1;
            }
            spins
        })
        .with_schedule(Schedule::Dedicated);
        task.compute();
        started_rx.recv().unwrap();
        task.cancel();
        assert!(task.is_cancelled());
        assert!(task.get().is_ok());
    }

    #[test]
    fn serial_schedule_runs_on_get() {
        let caller = std::thread::current().id();
        let mut task = AsyncTask::new(move |_| std::thread::current().id() == caller)
            .with_schedule(Schedule::Serial);
        task.compute();
        assert!(task.ready());
        assert!(*task.get().unwrap());
    }

    #[test]
    fn uncomputed_task_runs_inline_on_get() {
        let mut task = AsyncTask::new(|_| 5u8);
        assert!(!task.started());
        assert_eq!(*task.get().unwrap(), 5);
    }
}
