//! Polling watcher runtime.
//!
//! A process-wide scheduler with a small daemon thread pool drives
//! per-backend poll functions and fans events out to registered callbacks.
//! Adapters without native change notification build their `watch` support
//! on a [`WatcherState`] plus a poll function; the runtime treats the
//! polled state as opaque.

use std::any::Any;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::capability::{WatchCallback, WatchId};
use crate::error::Result;
use crate::hlc::wall_clock_ms;
use crate::model::{SystemId, WatchEvent};

/// Number of daemon worker threads in the shared pool.
const POLL_WORKERS: usize = 2;

/// Result of one poll cycle: the next opaque state plus observed events.
pub struct PollOutcome {
    /// Opaque backend state carried into the next cycle.
    pub state: Box<dyn Any + Send>,
    /// Events observed since the previous state.
    pub events: Vec<WatchEvent>,
}

/// Poll function: compares the last-known state against the backend and
/// reports what changed. The first cycle receives `None`.
pub type PollFn = Arc<dyn Fn(Option<&(dyn Any + Send)>) -> Result<PollOutcome> + Send + Sync>;

/// Scheduled action; returning `false` drops the task from the schedule.
pub type TaskFn = Arc<dyn Fn() -> bool + Send + Sync>;

struct Scheduled {
    due_at_ms: u64,
    id: u64,
    every_ms: u64,
    run: TaskFn,
    cancelled: Arc<AtomicBool>,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due_at_ms == other.due_at_ms && self.id == other.id
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline wins.
        other
            .due_at_ms
            .cmp(&self.due_at_ms)
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct SchedulerCore {
    tasks: Mutex<BinaryHeap<Scheduled>>,
    wakeup: Condvar,
    next_id: AtomicU64,
}

/// Handle to one scheduled repeating task.
pub struct TaskHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    /// Cancels the task; an in-flight cycle finishes but is not rescheduled.
    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::SeqCst);
    }

    /// Task identifier, for logs.
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Shared scheduled executor driving poll functions.
///
/// Worker threads are daemons: spawned lazily on first use and never joined.
pub struct PollScheduler {
    core: Arc<SchedulerCore>,
}

impl PollScheduler {
    fn start() -> Self {
        let core = Arc::new(SchedulerCore {
            tasks: Mutex::new(BinaryHeap::new()),
            wakeup: Condvar::new(),
            next_id: AtomicU64::new(1),
        });
        for worker in 0..POLL_WORKERS {
            let core = Arc::clone(&core);
            thread::Builder::new()
                .name(format!("ygg-poll-{worker}"))
                .spawn(move || worker_loop(core))
                .expect("spawn poll worker");
        }
        Self { core }
    }

    /// The process-wide scheduler, initialized on first use.
    pub fn global() -> &'static PollScheduler {
        static SCHEDULER: OnceLock<PollScheduler> = OnceLock::new();
        SCHEDULER.get_or_init(PollScheduler::start)
    }

    /// Schedules `run` every `every_ms` milliseconds until cancelled or until
    /// it returns `false`.
    pub fn schedule_repeating(&self, every_ms: u64, run: TaskFn) -> TaskHandle {
        let id = self.core.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        let task = Scheduled {
            due_at_ms: wall_clock_ms() + every_ms,
            id,
            every_ms,
            run,
            cancelled: Arc::clone(&cancelled),
        };
        self.core.tasks.lock().push(task);
        self.core.wakeup.notify_one();
        TaskHandle { id, cancelled }
    }
}

fn worker_loop(core: Arc<SchedulerCore>) {
    loop {
        let task = {
            let mut tasks = core.tasks.lock();
            loop {
                let now = wall_clock_ms();
                match tasks.peek() {
                    None => {
                        core.wakeup.wait(&mut tasks);
                    }
                    Some(next) if next.due_at_ms <= now => break tasks.pop().expect("peeked"),
                    Some(next) => {
                        let wait = next.due_at_ms - now;
                        core.wakeup
                            .wait_for(&mut tasks, Duration::from_millis(wait));
                    }
                }
            }
        };
        if task.cancelled.load(AtomicOrdering::SeqCst) {
            continue;
        }
        let keep = (task.run)();
        if keep && !task.cancelled.load(AtomicOrdering::SeqCst) {
            let next = Scheduled {
                due_at_ms: wall_clock_ms() + task.every_ms,
                ..task
            };
            core.tasks.lock().push(next);
            core.wakeup.notify_one();
        }
    }
}

struct WatcherInner {
    system_id: SystemId,
    callbacks: Mutex<FxHashMap<WatchId, WatchCallback>>,
    last_state: Mutex<Option<Box<dyn Any + Send>>>,
    task: Mutex<Option<TaskHandle>>,
}

/// Per-backend watcher state: registered callbacks, the last-known backend
/// state, and the scheduled task handle.
#[derive(Clone)]
pub struct WatcherState {
    inner: Arc<WatcherInner>,
}

impl WatcherState {
    /// Creates idle watcher state for one backend.
    pub fn new(system_id: SystemId) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                system_id,
                callbacks: Mutex::new(FxHashMap::default()),
                last_state: Mutex::new(None),
                task: Mutex::new(None),
            }),
        }
    }

    /// Registers a callback under `watch_id`.
    pub fn add_callback(&self, watch_id: WatchId, callback: WatchCallback) {
        self.inner.callbacks.lock().insert(watch_id, callback);
    }

    /// Removes a callback; the last removal stops polling.
    pub fn remove_callback(&self, watch_id: WatchId) {
        let empty = {
            let mut callbacks = self.inner.callbacks.lock();
            callbacks.remove(&watch_id);
            callbacks.is_empty()
        };
        if empty {
            self.stop_polling();
        }
    }

    /// Number of registered callbacks.
    pub fn callback_count(&self) -> usize {
        self.inner.callbacks.lock().len()
    }

    /// True while a poll task is scheduled.
    pub fn is_polling(&self) -> bool {
        self.inner.task.lock().is_some()
    }

    /// Schedules `poll_fn` on the shared executor; a second call while
    /// scheduled is a no-op.
    pub fn start_polling(&self, poll_fn: PollFn, interval_ms: u64) {
        let mut task = self.inner.task.lock();
        if task.is_some() {
            return;
        }
        debug!(system = %self.inner.system_id, interval_ms, "watch.start_polling");
        let weak = Arc::downgrade(&self.inner);
        let handle = PollScheduler::global().schedule_repeating(
            interval_ms,
            Arc::new(move || poll_cycle(&weak, &poll_fn)),
        );
        *task = Some(handle);
    }

    /// Cancels the scheduled poll task, if any.
    pub fn stop_polling(&self) {
        if let Some(handle) = self.inner.task.lock().take() {
            debug!(system = %self.inner.system_id, task = handle.id(), "watch.stop_polling");
            handle.cancel();
        }
    }
}

/// One poll cycle. Returns `false` when the watcher state is gone so the
/// scheduler drops the task.
fn poll_cycle(weak: &Weak<WatcherInner>, poll_fn: &PollFn) -> bool {
    let Some(inner) = weak.upgrade() else {
        return false;
    };
    let outcome = {
        let last = inner.last_state.lock();
        poll_fn(last.as_deref())
    };
    match outcome {
        Ok(PollOutcome { state, events }) => {
            *inner.last_state.lock() = Some(state);
            if events.is_empty() {
                return true;
            }
            let callbacks: Vec<WatchCallback> =
                inner.callbacks.lock().values().cloned().collect();
            for event in &events {
                for callback in &callbacks {
                    // A panicking consumer must not poison the cycle.
                    if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                        warn!(system = %inner.system_id, "watch.callback_panicked");
                    }
                }
            }
            true
        }
        Err(err) => {
            warn!(system = %inner.system_id, %err, "watch.poll_failed");
            true
        }
    }
}
