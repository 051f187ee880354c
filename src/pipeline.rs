//! Pipeline: an ordered chain of stages for one stage-id sequence.
//!
//! A pipeline owns its stages in an arena; stages reference each other by
//! arena index only. All stage completion, failure, and timeout signals are
//! serialized onto the pipeline's single event dispatcher thread, which is
//! what makes chain advancement and finalization race-free.

use crate::error::{Error, Result};
use crate::plugin::StageRegistry;
use crate::request::{Request, Task};
use crate::runtime::EventDispatcher;
use crate::stage::{StageEvent, StageFlags, StageHost, StageIdentity, StageKind, StageList};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Pipeline lifecycle state. Transitions are forward-only; a terminal
/// failure state is sticky until the pipeline is recreated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Created, no stage chain yet.
    NotConfigured,
    /// Stage chain built and wired; no request processed yet.
    Configured,
    /// At least one request admitted since configuration.
    Active,
    /// Configuration failed (empty list or unknown stage). Sticky.
    FailedToConfigure,
    /// A stage reported failure or timeout. Sticky.
    FailedToProcess,
}

/// Callback invoked with each successfully finished request.
pub type CompletionCallback = Arc<dyn Fn(Arc<Request>) + Send + Sync>;

struct PipelineShared {
    state: Mutex<PipelineState>,
    /// In-flight requests keyed by request id. Guarded by one coarse lock;
    /// `idle` pairs with it for drain waiters.
    inflight: Mutex<HashMap<u64, Arc<Request>>>,
    idle: Condvar,
    completion: Mutex<Option<CompletionCallback>>,
    processed_frames: AtomicU64,
}

impl PipelineShared {
    fn finish(&self, id: u64) {
        self.inflight.lock().unwrap().remove(&id);
        self.idle.notify_all();
    }

    fn fail(&self, id: u64) {
        *self.state.lock().unwrap() = PipelineState::FailedToProcess;
        // The request is removed from tracking even on the failure path so
        // drain() cannot get stuck on a request that will never finish.
        self.finish(id);
    }
}

struct ConfiguredChain {
    stages: Arc<Vec<StageHost>>,
    dispatcher: EventDispatcher<StageEvent>,
}

/// Snapshot of pipeline counters.
#[derive(Debug, Clone, Copy)]
pub struct PipelineStats {
    /// Current lifecycle state.
    pub state: PipelineState,
    /// Requests that reached terminal success.
    pub processed_frames: u64,
    /// Requests currently in flight.
    pub in_flight: usize,
}

/// An ordered chain of stages configured for one specific stage sequence.
pub struct Pipeline {
    shared: Arc<PipelineShared>,
    chain: Option<ConfiguredChain>,
    stage_ids: StageList,
    signature: StageFlags,
    stopped: AtomicBool,
}

impl Pipeline {
    /// Create an unconfigured pipeline.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(PipelineShared {
                state: Mutex::new(PipelineState::NotConfigured),
                inflight: Mutex::new(HashMap::new()),
                idle: Condvar::new(),
                completion: Mutex::new(None),
                processed_frames: AtomicU64::new(0),
            }),
            chain: None,
            stage_ids: StageList::new(),
            signature: StageFlags::empty(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Build and wire the stage chain for an ordered stage list.
    ///
    /// Rejects an empty list; any registry miss aborts configuration. Both
    /// leave the pipeline in `FailedToConfigure`.
    pub fn configure(&mut self, registry: &StageRegistry, stages: &[StageKind]) -> Result<()> {
        if self.chain.is_some() {
            return Err(Error::PipelineFailed("pipeline already configured".into()));
        }
        if stages.is_empty() {
            *self.shared.state.lock().unwrap() = PipelineState::FailedToConfigure;
            return Err(Error::EmptyStageList);
        }

        let mut instances = Vec::with_capacity(stages.len());
        for kind in stages {
            match registry.create_stage(kind.id()) {
                Some(stage) => instances.push((*kind, stage)),
                None => {
                    error!(stage = %kind, "configure: stage unavailable");
                    *self.shared.state.lock().unwrap() = PipelineState::FailedToConfigure;
                    return Err(Error::UnknownStage(kind.name().to_string()));
                }
            }
        }

        let signature = StageFlags::from_stages(stages.iter().copied());
        let dispatcher = EventDispatcher::new(format!("pipeline-{:#x}", signature.bits()));
        let sink = dispatcher.sink();

        let hosts: Vec<StageHost> = instances
            .into_iter()
            .enumerate()
            .map(|(index, (kind, stage))| {
                StageHost::new(index, StageIdentity::of(kind), stage, sink.clone())
            })
            .collect();
        for index in 0..hosts.len() - 1 {
            hosts[index].set_next(index + 1);
        }
        hosts[hosts.len() - 1].set_last();

        let stages_arc = Arc::new(hosts);
        let handler_stages = Arc::clone(&stages_arc);
        let handler_shared = Arc::clone(&self.shared);
        dispatcher.run(move |event| route_event(&handler_stages, &handler_shared, event));

        self.chain = Some(ConfiguredChain {
            stages: stages_arc,
            dispatcher,
        });
        self.stage_ids = stages.iter().copied().collect();
        self.signature = signature;
        *self.shared.state.lock().unwrap() = PipelineState::Configured;
        debug!(signature = signature.bits(), stages = stages.len(), "pipeline configured");
        Ok(())
    }

    /// Configure from stage display names.
    pub fn configure_by_names(&mut self, registry: &StageRegistry, names: &[&str]) -> Result<()> {
        let mut stages = StageList::new();
        for name in names {
            let kind = StageKind::from_name(name)
                .or_else(|| registry.id_for_name(name).and_then(StageKind::from_id))
                .ok_or_else(|| {
                    *self.shared.state.lock().unwrap() = PipelineState::FailedToConfigure;
                    Error::UnknownStage((*name).to_string())
                })?;
            stages.push(kind);
        }
        self.configure(registry, &stages)
    }

    /// Register the callback invoked with each finished request.
    pub fn set_completion_callback(&self, callback: CompletionCallback) {
        *self.shared.completion.lock().unwrap() = Some(callback);
    }

    /// Admit a request: record it in the in-flight map and enqueue it on the
    /// first stage with that stage's timeout budget.
    ///
    /// A duplicate id among in-flight requests is a logged error, not a
    /// crash: the new submission is processed but not tracked.
    pub fn process(&self, request: Arc<Request>) -> Result<()> {
        let chain = self.chain.as_ref().ok_or(Error::NotConfigured)?;
        {
            let mut state = self.shared.state.lock().unwrap();
            match *state {
                PipelineState::Configured | PipelineState::Active => {}
                PipelineState::NotConfigured => return Err(Error::NotConfigured),
                PipelineState::FailedToConfigure => {
                    return Err(Error::PipelineFailed("pipeline failed to configure".into()));
                }
                PipelineState::FailedToProcess => {
                    return Err(Error::PipelineFailed("pipeline failed to process".into()));
                }
            }
            *state = PipelineState::Active;
        }

        {
            let mut inflight = self.shared.inflight.lock().unwrap();
            if inflight.contains_key(&request.id()) {
                error!(
                    request = request.id(),
                    "duplicate request id already in flight; submission untracked"
                );
            } else {
                inflight.insert(request.id(), Arc::clone(&request));
            }
        }

        let first = &chain.stages[0];
        first.enqueue(Task::new(request, first.timeout_budget()));
        Ok(())
    }

    /// Block until the in-flight map is empty, logging stuck requests
    /// periodically.
    pub fn drain(&self) {
        let mut inflight = self.shared.inflight.lock().unwrap();
        let mut last_report = Instant::now();
        while !inflight.is_empty() {
            let (guard, timeout) = self
                .shared
                .idle
                .wait_timeout(inflight, Duration::from_millis(250))
                .unwrap();
            inflight = guard;
            if timeout.timed_out() && last_report.elapsed() >= Duration::from_secs(2) {
                let stuck: Vec<u64> = inflight.keys().copied().take(8).collect();
                warn!(pending = inflight.len(), ?stuck, "drain waiting on in-flight requests");
                last_report = Instant::now();
            }
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PipelineState {
        *self.shared.state.lock().unwrap()
    }

    /// Requests that reached terminal success.
    pub fn processed_frames(&self) -> u64 {
        self.shared.processed_frames.load(Ordering::Acquire)
    }

    /// Requests currently in flight.
    pub fn in_flight(&self) -> usize {
        self.shared.inflight.lock().unwrap().len()
    }

    /// The ordered stage list this pipeline was configured with.
    pub fn stage_ids(&self) -> &[StageKind] {
        &self.stage_ids
    }

    /// The enabled-stage bitmask signature.
    pub fn signature(&self) -> StageFlags {
        self.signature
    }

    /// Snapshot the pipeline counters.
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            state: self.state(),
            processed_frames: self.processed_frames(),
            in_flight: self.in_flight(),
        }
    }

    /// Stop all stage workers, then the event dispatcher.
    ///
    /// Producers (the stage queues) are quiesced before the dispatcher so no
    /// event is posted into a stopped mailbox during routine shutdown.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(chain) = &self.chain {
            for host in chain.stages.iter() {
                host.stop();
            }
            chain.dispatcher.stop();
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("state", &self.state())
            .field("stages", &self.stage_ids)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// The dispatcher's single handler: runs on the pipeline's event thread,
/// one event at a time.
fn route_event(stages: &[StageHost], shared: &PipelineShared, event: StageEvent) {
    match event {
        StageEvent::Completed { from, task } => match stages[from].next() {
            Some(next) => {
                let host = &stages[next];
                host.enqueue(task.restamped(host.timeout_budget()));
            }
            None => {
                // A non-last stage without a next link is a wiring
                // inconsistency; the request cannot advance.
                error!(
                    stage = %stages[from].identity().name,
                    request = task.request().id(),
                    "completed stage has no next link, dropping request"
                );
                shared.finish(task.request().id());
            }
        },
        StageEvent::Done { request } => {
            // Settle the counter and callback before waking drain waiters,
            // so counts are deterministic once drain() returns.
            shared.processed_frames.fetch_add(1, Ordering::AcqRel);
            crate::observability::record_frame_processed();
            let callback = shared.completion.lock().unwrap().clone();
            let id = request.id();
            if let Some(callback) = callback {
                callback(request);
            }
            shared.finish(id);
        }
        StageEvent::Failed {
            from,
            request,
            error,
        } => {
            error!(
                stage = %stages[from].identity().name,
                request = request.id(),
                error = %error,
                "stage processing failed"
            );
            crate::observability::record_frame_failed();
            shared.fail(request.id());
        }
        StageEvent::TimedOut { from, request } => {
            error!(
                stage = %stages[from].identity().name,
                request = request.id(),
                "stage processing timed out"
            );
            crate::observability::record_frame_failed();
            shared.fail(request.id());
        }
    }
}
