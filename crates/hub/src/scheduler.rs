//! Repeating poll tasks with at-most-one invocation in flight.
//!
//! Each task runs in its own tokio task driven by an `interval` whose missed
//! ticks are skipped. Ticks are measured from the start of the previous
//! invocation; a tick that comes due while an invocation is still running is
//! dropped rather than queued:
//!
//! ```text
//! interval 1000ms, task 1500ms
//! t=0     ├── run ──────────┤
//! t=1000        (skipped)
//! t=2000                      ├── run ──────────┤
//! ```
//!
//! Tasks live in an arena keyed by task id. Scheduling an id that already
//! exists cancels the previous task first.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FAILURE_CHANNEL_CAPACITY: usize = 64;

/// One failed invocation. Published once; the schedule keeps running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickFailure {
    pub task_id: String,
    pub error: String,
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Handle to one scheduled task. Cheap to clone; cancelling any clone
/// cancels the task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    task_id: Arc<str>,
    serial: u64,
    token: CancellationToken,
    /// Held while deciding whether to invoke, and while cancelling. Once
    /// `cancel` returns no new invocation can start.
    cancelled: Arc<Mutex<bool>>,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn is_cancelled(&self) -> bool {
        *lock(&self.cancelled)
    }

    fn cancel(&self) {
        *lock(&self.cancelled) = true;
        self.token.cancel();
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct PollingScheduler {
    tasks: Mutex<HashMap<String, TaskHandle>>,
    failures: broadcast::Sender<TickFailure>,
    next_serial: AtomicU64,
}

impl Default for PollingScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PollingScheduler {
    pub fn new() -> Self {
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Self {
            tasks: Mutex::new(HashMap::new()),
            failures,
            next_serial: AtomicU64::new(0),
        }
    }

    /// Run `f` now and then every `every`. Must be called from within a
    /// tokio runtime.
    pub fn schedule<F, Fut, T, E>(&self, task_id: &str, every: Duration, f: F) -> TaskHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        let handle = TaskHandle {
            task_id: Arc::from(task_id),
            serial: self.next_serial.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
            cancelled: Arc::new(Mutex::new(false)),
        };

        if let Some(previous) = lock(&self.tasks).insert(task_id.to_string(), handle.clone()) {
            debug!(task = %task_id, "replacing scheduled task");
            previous.cancel();
        }

        let every = every.max(Duration::from_millis(1));
        tokio::spawn(run_task(handle.clone(), every, f, self.failures.clone()));

        debug!(task = %task_id, interval_ms = every.as_millis() as u64, "task scheduled");
        handle
    }

    /// Idempotent. No new invocation starts after this returns; one already
    /// running completes and its result is dropped.
    pub fn cancel(&self, handle: &TaskHandle) {
        handle.cancel();
        let mut tasks = lock(&self.tasks);
        if tasks
            .get(handle.task_id())
            .is_some_and(|h| h.serial == handle.serial)
        {
            tasks.remove(handle.task_id());
        }
    }

    pub fn cancel_all(&self) {
        let drained: Vec<TaskHandle> = lock(&self.tasks).drain().map(|(_, h)| h).collect();
        for handle in &drained {
            handle.cancel();
        }
        if !drained.is_empty() {
            info!(tasks = drained.len(), "all scheduled tasks cancelled");
        }
    }

    pub fn failures(&self) -> broadcast::Receiver<TickFailure> {
        self.failures.subscribe()
    }

    pub fn task_count(&self) -> usize {
        lock(&self.tasks).len()
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

// ---------------------------------------------------------------------------
// Task loop
// ---------------------------------------------------------------------------

async fn run_task<F, Fut, T, E>(
    handle: TaskHandle,
    every: Duration,
    f: F,
    failures: broadcast::Sender<TickFailure>,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = handle.token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let invocation = {
            let cancelled = lock(&handle.cancelled);
            if *cancelled {
                break;
            }
            f()
        };

        let result = invocation.await;

        if handle.is_cancelled() {
            break;
        }
        if let Err(e) = result {
            warn!(task = %handle.task_id, error = %e, "scheduled task failed");
            // No receivers is fine.
            let _ = failures.send(TickFailure {
                task_id: handle.task_id.to_string(),
                error: e.to_string(),
            });
        }
    }

    debug!(task = %handle.task_id, "task stopped");
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ===========================================================================
// Tests
// ===========================================================================
