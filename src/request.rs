//! Requests and the tasks that carry them through stage queues.

use crate::buffer::ImageBuffer;
use crate::metadata::Metadata;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// One unit of work flowing through a pipeline.
///
/// A request is shared (`Arc`) across the submitting thread, the worker
/// thread of whichever stage is currently processing it, and the pipeline's
/// in-flight map. The image list and the metadata bag each carry their own
/// lock; the stages-completed counter is atomic. No holder may assume
/// exclusive access.
#[derive(Debug)]
pub struct Request {
    id: u64,
    images: Mutex<Vec<ImageBuffer>>,
    stages_completed: AtomicU32,
    metadata: Metadata,
}

impl Request {
    /// Create a request with a caller-assigned id.
    ///
    /// The id must be unique among requests concurrently in flight within one
    /// pipeline; a duplicate is logged at submission and not tracked.
    pub fn new(id: u64, images: Vec<ImageBuffer>, metadata: Metadata) -> Arc<Self> {
        Arc::new(Self {
            id,
            images: Mutex::new(images),
            stages_completed: AtomicU32::new(0),
            metadata,
        })
    }

    /// The caller-assigned request id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Lock and access the image list.
    ///
    /// Stages hold this guard only for the duration of a single read or
    /// replacement; a stage that cannot handle the input leaves the list
    /// unchanged.
    pub fn images(&self) -> MutexGuard<'_, Vec<ImageBuffer>> {
        self.images.lock().unwrap()
    }

    /// The request's metadata bag.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Number of stages that have completed processing this request.
    pub fn stages_completed(&self) -> u32 {
        self.stages_completed.load(Ordering::Acquire)
    }

    /// Record one more completed stage. Called by the stage host's completion
    /// path, once per stage.
    pub(crate) fn mark_stage_completed(&self) {
        self.stages_completed.fetch_add(1, Ordering::AcqRel);
    }
}

/// Monotonic task sequence numbers, unique across all queues in the process.
static TASK_SEQ: AtomicU64 = AtomicU64::new(1);

/// A request wrapped with a per-stage deadline, as enqueued on a stage's
/// work queue.
///
/// Each task carries a single-fire resolution flag: the deadline monitor's
/// timeout path and the worker's completion path race to
/// [`try_resolve`](Task::try_resolve), and only the winner reports a terminal
/// outcome. This guarantees exactly one terminal event per task.
pub struct Task {
    request: Arc<Request>,
    deadline: Duration,
    user_data: Option<Box<dyn Any + Send>>,
    seq: u64,
    fired: Arc<AtomicBool>,
}

impl Task {
    /// Wrap a request with a deadline.
    pub fn new(request: Arc<Request>, deadline: Duration) -> Self {
        Self {
            request,
            deadline,
            user_data: None,
            seq: TASK_SEQ.fetch_add(1, Ordering::Relaxed),
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attach opaque caller-supplied data.
    pub fn with_user_data(mut self, data: Box<dyn Any + Send>) -> Self {
        self.user_data = Some(data);
        self
    }

    /// Re-stamp for the next stage: fresh sequence number, fresh resolution
    /// flag, new deadline. The request and any user data carry over.
    pub fn restamped(self, deadline: Duration) -> Self {
        Self {
            deadline,
            seq: TASK_SEQ.fetch_add(1, Ordering::Relaxed),
            fired: Arc::new(AtomicBool::new(false)),
            ..self
        }
    }

    /// The carried request.
    pub fn request(&self) -> &Arc<Request> {
        &self.request
    }

    /// The per-stage deadline.
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// The opaque caller-supplied data, if any.
    pub fn user_data(&self) -> Option<&(dyn Any + Send)> {
        self.user_data.as_deref()
    }

    /// Process-unique sequence number, used as the deadline-tracking key.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Clone of the single-fire resolution flag, for deadline tracking.
    pub(crate) fn fired_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.fired)
    }

    /// Try to claim the terminal outcome for this task.
    ///
    /// Returns `true` for exactly one caller; every later caller gets
    /// `false` and must not report an outcome.
    pub fn try_resolve(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("request", &self.request.id())
            .field("seq", &self.seq)
            .field("deadline", &self.deadline)
            .field("resolved", &self.fired.load(Ordering::Relaxed))
            .finish()
    }
}
