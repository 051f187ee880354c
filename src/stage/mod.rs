//! Stage contract, identity table, and the per-pipeline stage host.
//!
//! A stage is one pluggable processing unit. The set of known stages is
//! closed and fixed at build time ([`StageKind`]); a bitmask over that id
//! space ([`StageFlags`]) is the currency used by the decision policy and
//! pipeline lookup to represent "this set of stages, in canonical order".
//!
//! The [`StageHost`] wraps a stage implementation for one pipeline position:
//! it owns the stage's work queue and deadline monitor, holds the arena
//! index of the next stage, and reports classified outcomes through the
//! pipeline's event dispatcher.

use crate::request::{Request, Task};
use crate::runtime::{DeadlineMonitor, EventSink, WorkQueue, WorkQueueStats};
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Default per-task timeout budget when a stage does not override it.
pub const DEFAULT_TIMEOUT_BUDGET: Duration = Duration::from_millis(100);

/// An ordered list of stage kinds. The closed stage set fits inline.
pub type StageList = SmallVec<[StageKind; 8]>;

// ============================================================================
// Stage identity
// ============================================================================

/// The closed set of known stages, in canonical (ascending-id) order.
///
/// Canonical order **is** pipeline order: a pipeline built from any subset of
/// these stages chains them by ascending id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum StageKind {
    /// HDR exposure merge.
    Hdr = 0,
    /// Synthetic depth-of-field (bokeh).
    Bokeh = 1,
    /// Watermark overlay.
    Watermark = 2,
    /// Mandelbrot renderer.
    Mandelbrot = 3,
    /// Sobel edge filter.
    Sobel = 4,
    /// JPEG encode.
    JpegEncode = 5,
    /// Lens-distortion correction.
    LensCorrection = 6,
}

impl StageKind {
    /// All known stages in canonical order.
    pub const ALL: [StageKind; 7] = [
        StageKind::Hdr,
        StageKind::Bokeh,
        StageKind::Watermark,
        StageKind::Mandelbrot,
        StageKind::Sobel,
        StageKind::JpegEncode,
        StageKind::LensCorrection,
    ];

    /// The stable numeric id.
    pub fn id(&self) -> u32 {
        *self as u32
    }

    /// The human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Hdr => "hdr",
            StageKind::Bokeh => "bokeh",
            StageKind::Watermark => "watermark",
            StageKind::Mandelbrot => "mandelbrot",
            StageKind::Sobel => "sobel",
            StageKind::JpegEncode => "jpeg-encode",
            StageKind::LensCorrection => "lens-correction",
        }
    }

    /// Look up a stage by id.
    pub fn from_id(id: u32) -> Option<StageKind> {
        StageKind::ALL.into_iter().find(|k| k.id() == id)
    }

    /// Look up a stage by name.
    pub fn from_name(name: &str) -> Option<StageKind> {
        StageKind::ALL.into_iter().find(|k| k.name() == name)
    }

    /// The metadata key holding this stage's enable flag.
    pub fn enable_key(&self) -> crate::metadata::MetaKey {
        use crate::metadata::MetaKey;
        match self {
            StageKind::Hdr => MetaKey::EnableHdr,
            StageKind::Bokeh => MetaKey::EnableBokeh,
            StageKind::Watermark => MetaKey::EnableWatermark,
            StageKind::Mandelbrot => MetaKey::EnableMandelbrot,
            StageKind::Sobel => MetaKey::EnableSobel,
            StageKind::JpegEncode => MetaKey::EnableJpegEncode,
            StageKind::LensCorrection => MetaKey::EnableLensCorrection,
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Stable numeric id plus display name, as reported by a loaded plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageIdentity {
    /// Numeric stage id (must match a [`StageKind`] id).
    pub id: u32,
    /// Display name.
    pub name: String,
}

impl StageIdentity {
    /// Identity of a built-in stage kind.
    pub fn of(kind: StageKind) -> Self {
        Self {
            id: kind.id(),
            name: kind.name().to_string(),
        }
    }
}

// ============================================================================
// Stage flags (enabled-stage bitmask)
// ============================================================================

/// Bitmask over the stage id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StageFlags(u32);

impl StageFlags {
    /// Empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build a mask from an iterator of stages.
    pub fn from_stages(stages: impl IntoIterator<Item = StageKind>) -> Self {
        let mut mask = 0;
        for stage in stages {
            mask |= 1 << stage.id();
        }
        Self(mask)
    }

    /// Add a stage to the set.
    pub fn insert(&mut self, stage: StageKind) {
        self.0 |= 1 << stage.id();
    }

    /// Check membership.
    pub fn contains(&self, stage: StageKind) -> bool {
        self.0 & (1 << stage.id()) != 0
    }

    /// Check if no stages are set.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// The member stages in canonical ascending-id order.
    pub fn stages(&self) -> StageList {
        StageKind::ALL
            .into_iter()
            .filter(|k| self.contains(*k))
            .collect()
    }

    /// The raw bitmask value.
    pub fn bits(&self) -> u32 {
        self.0
    }
}

// ============================================================================
// Stage contract
// ============================================================================

/// Contract implemented by every processing stage.
///
/// A stage is free to ignore input it cannot handle by leaving the request's
/// image list unchanged and returning `Ok(())`; an error return is reserved
/// for actual failure conditions.
pub trait ImageStage: Send {
    /// Prepare the stage for processing. Called once, before the first task.
    fn open(&mut self) -> crate::Result<()>;

    /// Process one request in place. Runs on the stage's worker thread.
    fn process(&mut self, request: &Request) -> crate::Result<()>;

    /// Release stage resources. Called once, when the host shuts down.
    fn close(&mut self);

    /// Per-task deadline for this stage.
    fn timeout_budget(&self) -> Duration {
        DEFAULT_TIMEOUT_BUDGET
    }
}

/// Factory closure minting fresh stage instances.
pub type StageFactory = Box<dyn Fn() -> Box<dyn ImageStage> + Send + Sync>;

// ============================================================================
// Stage events
// ============================================================================

/// Classified stage outcome, posted to the pipeline's event dispatcher.
#[derive(Debug)]
pub enum StageEvent {
    /// A non-terminal stage finished successfully; the request should
    /// advance. The task is carried so the router can re-stamp it with the
    /// next stage's budget.
    Completed {
        /// Arena index of the emitting stage.
        from: usize,
        /// The resolved task.
        task: Task,
    },
    /// The stage marked "last" finished successfully; the request is done.
    Done {
        /// The finished request.
        request: Arc<Request>,
    },
    /// A stage reported a processing error.
    Failed {
        /// Arena index of the emitting stage.
        from: usize,
        /// The affected request.
        request: Arc<Request>,
        /// Stage-reported error description.
        error: String,
    },
    /// A stage's task exceeded its deadline.
    TimedOut {
        /// Arena index of the emitting stage.
        from: usize,
        /// The affected request.
        request: Arc<Request>,
    },
}

// ============================================================================
// Stage host
// ============================================================================

/// Forward links of a stage within its pipeline, writable after host
/// construction and readable from the worker thread.
struct StageLinks {
    /// Arena index of the next stage; `usize::MAX` means none.
    next: AtomicUsize,
    last: AtomicBool,
}

const NO_NEXT: usize = usize::MAX;

/// One pipeline position: a stage implementation bound to its own work queue
/// and deadline monitor.
///
/// The pipeline owns the host arena and is the only strong owner of each
/// stage; hosts reference each other by arena index only.
pub struct StageHost {
    identity: StageIdentity,
    queue: WorkQueue,
    links: Arc<StageLinks>,
    budget: Duration,
}

/// Wrapper that guarantees `close` runs when the worker thread releases the
/// stage.
struct StageCell {
    stage: Box<dyn ImageStage>,
}

impl Drop for StageCell {
    fn drop(&mut self) {
        self.stage.close();
    }
}

impl StageHost {
    /// Bind an (already opened) stage instance to a new queue and monitor.
    ///
    /// `index` is this host's position in the pipeline's arena; `sink` is the
    /// pipeline dispatcher's producer handle.
    pub fn new(
        index: usize,
        identity: StageIdentity,
        stage: Box<dyn ImageStage>,
        sink: EventSink<StageEvent>,
    ) -> Self {
        let budget = stage.timeout_budget();
        let links = Arc::new(StageLinks {
            next: AtomicUsize::new(NO_NEXT),
            last: AtomicBool::new(false),
        });

        let timeout_sink = sink.clone();
        let monitor = DeadlineMonitor::start(
            identity.name.clone(),
            Box::new(move |request| {
                crate::observability::record_timeout_fired();
                timeout_sink.post(StageEvent::TimedOut {
                    from: index,
                    request,
                });
            }),
        );

        let mut cell = StageCell { stage };
        let completion_links = Arc::clone(&links);
        let queue = WorkQueue::start(
            identity.name.clone(),
            monitor,
            Box::new(move |task: &Task| cell.stage.process(task.request())),
            Box::new(move |task: Task, result: crate::Result<()>| {
                task.request().mark_stage_completed();
                if !task.try_resolve() {
                    // The deadline monitor already reported a timeout for
                    // this task.
                    return;
                }
                let event = match result {
                    Ok(()) => {
                        if completion_links.last.load(Ordering::Acquire) {
                            StageEvent::Done {
                                request: Arc::clone(task.request()),
                            }
                        } else {
                            StageEvent::Completed { from: index, task }
                        }
                    }
                    Err(e) => StageEvent::Failed {
                        from: index,
                        request: Arc::clone(task.request()),
                        error: e.to_string(),
                    },
                };
                sink.post(event);
            }),
        );

        Self {
            identity,
            queue,
            links,
            budget,
        }
    }

    /// Forward a task to this stage's work queue.
    pub fn enqueue(&self, task: Task) {
        self.queue.enqueue(task);
    }

    /// Set the arena index of the next stage in the chain.
    pub fn set_next(&self, index: usize) {
        self.links.next.store(index, Ordering::Release);
    }

    /// The arena index of the next stage, if any.
    pub fn next(&self) -> Option<usize> {
        match self.links.next.load(Ordering::Acquire) {
            NO_NEXT => None,
            index => Some(index),
        }
    }

    /// Mark this host as the terminal stage of its pipeline.
    pub fn set_last(&self) {
        self.links.last.store(true, Ordering::Release);
    }

    /// Check the terminal marking.
    pub fn is_last(&self) -> bool {
        self.links.last.load(Ordering::Acquire)
    }

    /// This stage's per-task deadline.
    pub fn timeout_budget(&self) -> Duration {
        self.budget
    }

    /// The stage's identity.
    pub fn identity(&self) -> &StageIdentity {
        &self.identity
    }

    /// Snapshot the underlying queue counters.
    pub fn queue_stats(&self) -> WorkQueueStats {
        self.queue.stats()
    }

    /// Total timeouts fired for this stage.
    pub fn timeouts_fired(&self) -> u64 {
        self.queue.timeouts_fired()
    }

    /// Block until all enqueued tasks have run and completed.
    pub fn wait_idle(&self) {
        self.queue.wait_idle();
    }

    /// Stop the queue worker and monitor.
    pub fn stop(&self) {
        self.queue.stop();
    }
}

impl std::fmt::Debug for StageHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageHost")
            .field("identity", &self.identity)
            .field("next", &self.next())
            .field("last", &self.is_last())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;
    use crate::runtime::EventDispatcher;
    use crate::stages::testing::{FailStage, PassThroughStage, SleepStage};
    use std::sync::Mutex;

    fn collecting_dispatcher() -> (EventDispatcher<StageEvent>, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let dispatcher = EventDispatcher::new("test");
        dispatcher.run(move |event: StageEvent| {
            let tag = match event {
                StageEvent::Completed { .. } => "completed",
                StageEvent::Done { .. } => "done",
                StageEvent::Failed { .. } => "failed",
                StageEvent::TimedOut { .. } => "timed-out",
            };
            seen_clone.lock().unwrap().push(tag.to_string());
        });
        (dispatcher, seen)
    }

    fn submit(host: &StageHost, id: u64) {
        let request = Request::new(id, vec![], Metadata::new());
        host.enqueue(Task::new(request, host.timeout_budget()));
    }

    #[test]
    fn test_stage_table_roundtrip() {
        for kind in StageKind::ALL {
            assert_eq!(StageKind::from_id(kind.id()), Some(kind));
            assert_eq!(StageKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(StageKind::from_id(999), None);
        assert_eq!(StageKind::from_name("nope"), None);
    }

    #[test]
    fn test_stage_flags_canonical_order() {
        let flags = StageFlags::from_stages([StageKind::Sobel, StageKind::Hdr, StageKind::Bokeh]);
        let stages: Vec<StageKind> = flags.stages().into_iter().collect();
        assert_eq!(stages, vec![StageKind::Hdr, StageKind::Bokeh, StageKind::Sobel]);
    }

    #[test]
    fn test_last_stage_emits_done() {
        let (dispatcher, seen) = collecting_dispatcher();
        let host = StageHost::new(
            0,
            StageIdentity::of(StageKind::Sobel),
            Box::new(PassThroughStage::new()),
            dispatcher.sink(),
        );
        host.set_last();

        submit(&host, 1);
        host.wait_idle();
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(*seen.lock().unwrap(), vec!["done"]);
        host.stop();
    }

    #[test]
    fn test_middle_stage_emits_completed() {
        let (dispatcher, seen) = collecting_dispatcher();
        let host = StageHost::new(
            0,
            StageIdentity::of(StageKind::Hdr),
            Box::new(PassThroughStage::new()),
            dispatcher.sink(),
        );
        host.set_next(1);

        submit(&host, 1);
        host.wait_idle();
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(*seen.lock().unwrap(), vec!["completed"]);
        assert_eq!(host.next(), Some(1));
        host.stop();
    }

    #[test]
    fn test_failing_stage_emits_failed() {
        let (dispatcher, seen) = collecting_dispatcher();
        let host = StageHost::new(
            0,
            StageIdentity::of(StageKind::Bokeh),
            Box::new(FailStage::new("broken")),
            dispatcher.sink(),
        );
        host.set_last();

        submit(&host, 1);
        host.wait_idle();
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(*seen.lock().unwrap(), vec!["failed"]);
        host.stop();
    }

    #[test]
    fn test_slow_stage_emits_single_timeout() {
        let (dispatcher, seen) = collecting_dispatcher();
        let host = StageHost::new(
            0,
            StageIdentity::of(StageKind::Mandelbrot),
            Box::new(SleepStage::new(
                Duration::from_millis(20),
                Duration::from_millis(5),
            )),
            dispatcher.sink(),
        );
        host.set_last();

        submit(&host, 1);
        host.wait_idle();
        std::thread::sleep(Duration::from_millis(20));

        // Single-fire: the timeout wins, the completion path posts nothing.
        assert_eq!(*seen.lock().unwrap(), vec!["timed-out"]);
        assert_eq!(host.timeouts_fired(), 1);
        host.stop();
    }

    #[test]
    fn test_completion_increments_request_counter() {
        let (dispatcher, _seen) = collecting_dispatcher();
        let host = StageHost::new(
            0,
            StageIdentity::of(StageKind::JpegEncode),
            Box::new(PassThroughStage::new()),
            dispatcher.sink(),
        );
        host.set_last();

        let request = Request::new(9, vec![], Metadata::new());
        host.enqueue(Task::new(Arc::clone(&request), host.timeout_budget()));
        host.wait_idle();

        assert_eq!(request.stages_completed(), 1);
        host.stop();
    }
}
