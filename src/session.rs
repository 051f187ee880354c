//! Session: a pool of configured pipelines, one per distinct stage sequence.
//!
//! Each distinct ordered stage list gets its own pipeline, built lazily on
//! first use and reused for every later request with the same sequence. All
//! pipelines forward finished requests through one shared result callback
//! slot, so the callback can be registered or replaced at any time without
//! touching the pipelines themselves.

use crate::error::{Error, Result};
use crate::pipeline::{CompletionCallback, Pipeline, PipelineStats};
use crate::plugin::StageRegistry;
use crate::request::Request;
use crate::stage::StageKind;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

struct SessionInner {
    pipelines: Vec<Arc<Pipeline>>,
    by_id: HashMap<u64, Arc<Pipeline>>,
    next_id: u64,
}

/// Owns the pipeline pool and the registry the pipelines draw stages from.
pub struct Session {
    registry: Arc<StageRegistry>,
    inner: Mutex<SessionInner>,
    /// Shared slot read by every pipeline's completion forwarder.
    callback: Arc<Mutex<Option<CompletionCallback>>>,
}

impl Session {
    /// Create a session over a stage registry.
    pub fn new(registry: Arc<StageRegistry>) -> Self {
        Self {
            registry,
            inner: Mutex::new(SessionInner {
                pipelines: Vec::new(),
                by_id: HashMap::new(),
                next_id: 0,
            }),
            callback: Arc::new(Mutex::new(None)),
        }
    }

    /// Register the callback invoked with each successfully finished request.
    ///
    /// Replaces any previous callback. Applies to pipelines already in the
    /// pool as well as pipelines built later.
    pub fn register_result_callback(&self, callback: CompletionCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    /// Route a request to the pipeline matching the ordered stage list,
    /// building and pooling one if no match exists.
    pub fn process(&self, request: Arc<Request>, stages: &[StageKind]) -> Result<()> {
        if stages.is_empty() {
            return Err(Error::EmptyStageList);
        }

        let pipeline = self.pipeline_for(stages)?;
        pipeline.process(request)
    }

    fn pipeline_for(&self, stages: &[StageKind]) -> Result<Arc<Pipeline>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner
            .pipelines
            .iter()
            .find(|p| p.stage_ids() == stages)
        {
            return Ok(Arc::clone(existing));
        }

        let mut pipeline = Pipeline::new();
        pipeline.configure(&self.registry, stages)?;

        let slot = Arc::clone(&self.callback);
        pipeline.set_completion_callback(Arc::new(move |request| {
            let callback = slot.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback(request);
            }
        }));

        let id = inner.next_id;
        inner.next_id += 1;
        let pipeline = Arc::new(pipeline);
        inner.pipelines.push(Arc::clone(&pipeline));
        inner.by_id.insert(id, Arc::clone(&pipeline));
        debug!(id, ?stages, "session built pipeline");
        Ok(pipeline)
    }

    /// Look up a pooled pipeline by its session-local id.
    pub fn pipeline(&self, id: u64) -> Option<Arc<Pipeline>> {
        self.inner.lock().unwrap().by_id.get(&id).cloned()
    }

    /// Number of pipelines currently pooled.
    pub fn pipeline_count(&self) -> usize {
        self.inner.lock().unwrap().pipelines.len()
    }

    /// Block until every pooled pipeline has no request in flight.
    pub fn drain(&self) {
        let pipelines: Vec<Arc<Pipeline>> = self.inner.lock().unwrap().pipelines.clone();
        for pipeline in pipelines {
            pipeline.drain();
        }
    }

    /// Counter snapshots for every pooled pipeline.
    pub fn stats(&self) -> Vec<PipelineStats> {
        let inner = self.inner.lock().unwrap();
        inner.pipelines.iter().map(|p| p.stats()).collect()
    }

    /// Drain every pipeline, stop it, and empty the pool.
    pub fn stop(&self) {
        let drained: Vec<Arc<Pipeline>> = {
            let mut inner = self.inner.lock().unwrap();
            inner.by_id.clear();
            inner.pipelines.drain(..).collect()
        };
        for pipeline in &drained {
            pipeline.drain();
            pipeline.stop();
        }
        if !drained.is_empty() {
            info!(pipelines = drained.len(), "session stopped");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}
