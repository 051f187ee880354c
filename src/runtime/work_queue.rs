//! Per-stage task queue with one dedicated worker thread.
//!
//! Tasks execute strictly FIFO. Idleness is tracked with separate
//! enqueued/executed/completed counters rather than queue emptiness, because
//! a task is popped before its completion callback runs.

use crate::request::Task;
use crate::runtime::deadline::DeadlineMonitor;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Executes a task on the worker thread. For a stage queue this is the
/// stage's `process` function.
pub type ExecuteFn = Box<dyn FnMut(&Task) -> crate::Result<()> + Send>;

/// Invoked on the worker thread after each task's execution, with the
/// execution result. For a stage queue this classifies the outcome and posts
/// it to the pipeline's event dispatcher.
pub type CompletionFn = Box<dyn FnMut(Task, crate::Result<()>) + Send>;

struct QueueState {
    tasks: VecDeque<Task>,
    stopping: bool,
    enqueued: u64,
    executed: u64,
    completed: u64,
    discarded: u64,
}

struct QueueInner {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    idle: Condvar,
}

/// Bounded-concurrency FIFO task runner: one worker thread, one deadline
/// monitor.
///
/// The worker loop waits for a task, starts deadline tracking, invokes the
/// execute function, ends deadline tracking, and invokes the completion
/// function, in that order.
pub struct WorkQueue {
    inner: Arc<QueueInner>,
    monitor: DeadlineMonitor,
    worker: Mutex<Option<JoinHandle<()>>>,
    name: String,
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, Copy)]
pub struct WorkQueueStats {
    /// Tasks accepted by `enqueue`.
    pub enqueued: u64,
    /// Tasks whose execute function has run.
    pub executed: u64,
    /// Tasks whose completion function has run.
    pub completed: u64,
    /// Tasks discarded without execution by `stop`.
    pub discarded: u64,
    /// Tasks currently waiting in the queue.
    pub pending: usize,
}

impl WorkQueue {
    /// Start a queue with its worker thread.
    ///
    /// The monitor must already be running (its constructor blocks on a
    /// readiness barrier), so a queue is never operational without deadline
    /// coverage.
    pub fn start(
        name: impl Into<String>,
        monitor: DeadlineMonitor,
        mut execute: ExecuteFn,
        mut completion: CompletionFn,
    ) -> Self {
        let name = name.into();
        let inner = Arc::new(QueueInner {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                stopping: false,
                enqueued: 0,
                executed: 0,
                completed: 0,
                discarded: 0,
            }),
            not_empty: Condvar::new(),
            idle: Condvar::new(),
        });

        let worker_inner = Arc::clone(&inner);
        let deadline = monitor.handle();
        let thread_name = format!("worker-{name}");
        let worker = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                loop {
                    let task = {
                        let mut state = worker_inner.state.lock().unwrap();
                        loop {
                            if state.stopping {
                                return;
                            }
                            if let Some(task) = state.tasks.pop_front() {
                                break task;
                            }
                            state = worker_inner.not_empty.wait(state).unwrap();
                        }
                    };

                    deadline.track(&task);
                    let result = execute(&task);
                    deadline.untrack(task.seq());
                    worker_inner.state.lock().unwrap().executed += 1;

                    completion(task, result);
                    {
                        let mut state = worker_inner.state.lock().unwrap();
                        state.completed += 1;
                        worker_inner.idle.notify_all();
                    }
                }
            })
            .expect("failed to spawn work queue worker thread");

        Self {
            inner,
            monitor,
            worker: Mutex::new(Some(worker)),
            name,
        }
    }

    /// Append a task and wake the worker.
    ///
    /// Tasks enqueued on a stopped queue are discarded with a warning.
    pub fn enqueue(&self, task: Task) {
        let mut state = self.inner.state.lock().unwrap();
        if state.stopping {
            warn!(queue = %self.name, seq = task.seq(), "enqueue on stopped queue, task dropped");
            state.discarded += 1;
            state.enqueued += 1;
            self.inner.idle.notify_all();
            return;
        }
        state.enqueued += 1;
        state.tasks.push_back(task);
        self.inner.not_empty.notify_one();
    }

    /// Block until every enqueued task has both executed and completed (or
    /// been discarded by `stop`).
    pub fn wait_idle(&self) {
        let mut state = self.inner.state.lock().unwrap();
        while state.completed + state.discarded < state.enqueued {
            state = self
                .inner
                .idle
                .wait_timeout(state, Duration::from_millis(100))
                .unwrap()
                .0;
        }
    }

    /// Stop the worker after its current task, discarding any still-queued
    /// tasks without executing them, and join the thread.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.stopping {
                return;
            }
            state.stopping = true;
            let dropped = state.tasks.len() as u64;
            if dropped > 0 {
                warn!(queue = %self.name, dropped, "discarding queued tasks on stop");
            }
            state.discarded += dropped;
            state.tasks.clear();
            self.inner.not_empty.notify_all();
            self.inner.idle.notify_all();
        }
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.monitor.stop();
        debug!(queue = %self.name, "work queue stopped");
    }

    /// Snapshot the queue counters.
    pub fn stats(&self) -> WorkQueueStats {
        let state = self.inner.state.lock().unwrap();
        WorkQueueStats {
            enqueued: state.enqueued,
            executed: state.executed,
            completed: state.completed,
            discarded: state.discarded,
            pending: state.tasks.len(),
        }
    }

    /// Total timeouts fired by this queue's deadline monitor.
    pub fn timeouts_fired(&self) -> u64 {
        self.monitor.timeouts_fired()
    }

    /// The queue name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.stop();
    }
}
