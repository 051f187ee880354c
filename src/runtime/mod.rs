//! Concurrency primitives: work queues, deadline monitoring, event dispatch.
//!
//! Every pipeline of N stages runs on 2N+1 background threads: one work
//! queue worker and one deadline monitor per stage, plus one event
//! dispatcher for the pipeline. All cross-thread handoff is through
//! mutex+condvar guarded queues and maps.

mod deadline;
mod dispatcher;
mod work_queue;

pub use deadline::{DeadlineHandle, DeadlineMonitor, TimeoutFn};
pub use dispatcher::{EventDispatcher, EventSink};
pub use work_queue::{CompletionFn, ExecuteFn, WorkQueue, WorkQueueStats};
