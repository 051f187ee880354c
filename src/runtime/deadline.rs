//! Deadline monitoring for in-flight tasks.
//!
//! One monitor runs per work queue. The monitor thread sleeps until the
//! earliest tracked deadline (min-heap plus condvar timeout, not a busy
//! poll) and fires the registered timeout callback exactly once for every
//! overdue task. The normal completion path and the timeout path race on the
//! task's single-fire flag, so at most one of them reports a terminal
//! outcome.

use crate::request::{Request, Task};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::warn;

/// Callback invoked (off the worker thread) when a tracked task passes its
/// deadline without completing.
pub type TimeoutFn = Box<dyn Fn(Arc<Request>) + Send + Sync>;

struct Tracked {
    due: Instant,
    request: Arc<Request>,
    fired: Arc<AtomicBool>,
}

struct MonitorState {
    /// Earliest-deadline-first heap of (due, task seq). Entries whose task
    /// was untracked in the meantime are stale and skipped on pop.
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    tracked: HashMap<u64, Tracked>,
    stopping: bool,
    ready: bool,
    timeouts_fired: u64,
}

struct MonitorInner {
    state: Mutex<MonitorState>,
    cv: Condvar,
}

/// Cheap handle for tracking and untracking tasks from a worker thread.
#[derive(Clone)]
pub struct DeadlineHandle {
    inner: Arc<MonitorInner>,
}

impl DeadlineHandle {
    /// Start deadline tracking for a task. Called just before the task's
    /// execute function runs.
    pub fn track(&self, task: &Task) {
        let due = Instant::now() + task.deadline();
        let mut state = self.inner.state.lock().unwrap();
        state.tracked.insert(
            task.seq(),
            Tracked {
                due,
                request: Arc::clone(task.request()),
                fired: task.fired_flag(),
            },
        );
        state.heap.push(Reverse((due, task.seq())));
        // The new deadline may be earlier than what the monitor is sleeping
        // toward.
        self.inner.cv.notify_all();
    }

    /// End deadline tracking for a task (normal completion path).
    pub fn untrack(&self, seq: u64) {
        let mut state = self.inner.state.lock().unwrap();
        state.tracked.remove(&seq);
    }
}

/// Per-queue deadline monitor with a dedicated thread.
pub struct DeadlineMonitor {
    inner: Arc<MonitorInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
    name: String,
}

impl DeadlineMonitor {
    /// Start a monitor thread and block until it signals readiness.
    ///
    /// The readiness barrier guarantees the owning work queue never runs a
    /// task without an operational monitor.
    pub fn start(name: impl Into<String>, on_timeout: TimeoutFn) -> Self {
        let name = name.into();
        let inner = Arc::new(MonitorInner {
            state: Mutex::new(MonitorState {
                heap: BinaryHeap::new(),
                tracked: HashMap::new(),
                stopping: false,
                ready: false,
                timeouts_fired: 0,
            }),
            cv: Condvar::new(),
        });

        let thread_inner = Arc::clone(&inner);
        let thread_name = format!("deadline-{name}");
        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || Self::run(thread_inner, on_timeout))
            .expect("failed to spawn deadline monitor thread");

        // Startup barrier: wait for the monitor thread to come up.
        {
            let mut state = inner.state.lock().unwrap();
            while !state.ready {
                state = inner.cv.wait(state).unwrap();
            }
        }

        Self {
            inner,
            thread: Mutex::new(Some(handle)),
            name,
        }
    }

    fn run(inner: Arc<MonitorInner>, on_timeout: TimeoutFn) {
        let mut state = inner.state.lock().unwrap();
        state.ready = true;
        inner.cv.notify_all();

        loop {
            if state.stopping {
                break;
            }

            let now = Instant::now();
            let mut overdue = Vec::new();
            while let Some(&Reverse((due, seq))) = state.heap.peek() {
                if due > now {
                    break;
                }
                state.heap.pop();
                // Stale entries (untracked tasks) fall through silently.
                if let Some(tracked) = state.tracked.remove(&seq) {
                    let won = tracked
                        .fired
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok();
                    if won {
                        state.timeouts_fired += 1;
                        overdue.push(tracked.request);
                    }
                }
            }

            if !overdue.is_empty() {
                drop(state);
                for request in overdue {
                    warn!(request = request.id(), "task deadline exceeded");
                    on_timeout(request);
                }
                state = inner.state.lock().unwrap();
                continue;
            }

            state = match state.heap.peek() {
                Some(&Reverse((due, _))) => {
                    let wait = due.saturating_duration_since(Instant::now());
                    inner.cv.wait_timeout(state, wait).unwrap().0
                }
                None => inner.cv.wait(state).unwrap(),
            };
        }
    }

    /// Get a tracking handle for the worker thread.
    pub fn handle(&self) -> DeadlineHandle {
        DeadlineHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Total number of timeout callbacks fired.
    pub fn timeouts_fired(&self) -> u64 {
        self.inner.state.lock().unwrap().timeouts_fired
    }

    /// Number of tasks currently tracked.
    pub fn tracked_count(&self) -> usize {
        self.inner.state.lock().unwrap().tracked.len()
    }

    /// Stop the monitor thread and join it.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.stopping = true;
            self.inner.cv.notify_all();
        }
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// The monitor's name (matches the owning queue).
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for DeadlineMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
