//! Top-level façade: the only surface external callers consume.
//!
//! Wraps a [`Session`] with admission control. Before a request is admitted,
//! the process resident-set size is checked against a fixed ceiling with
//! bounded retries, and a soft threshold on submitted-but-unresolved depth
//! is logged. Results are delivered asynchronously through the registered
//! callback, never as a return value of `process`.

use crate::observability;
use crate::pipeline::CompletionCallback;
use crate::plugin::StageRegistry;
use crate::request::Request;
use crate::session::Session;
use crate::stage::StageKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, error, info, warn};

/// Status returned across the process boundary.
///
/// Zero is success, negative values are failures. `InvalidHandle` is
/// reserved for a C shim that can receive a null handle; the Rust surface
/// cannot produce it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StatusCode {
    /// Request admitted; the result arrives via the callback.
    Ok = 0,
    /// Null or stale handle at the C boundary.
    InvalidHandle = -1,
    /// The stage list was empty.
    EmptyStageList = -2,
    /// Configuration or processing machinery failed.
    InternalFailure = -3,
    /// Memory ceiling still exceeded after bounded retries.
    ResourceExhausted = -4,
}

impl StatusCode {
    /// The raw status value.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Whether this status is success.
    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }
}

/// Admission-control knobs.
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    /// Resident-set ceiling above which admission is refused.
    pub memory_ceiling_bytes: u64,
    /// How many times to re-check memory before dropping the request.
    pub memory_retries: u32,
    /// Sleep between memory re-checks.
    pub memory_retry_delay: Duration,
    /// Submitted-minus-resolved depth above which a warning is logged.
    pub depth_warn_threshold: u64,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            memory_ceiling_bytes: 2 * 1024 * 1024 * 1024,
            memory_retries: 5,
            memory_retry_delay: Duration::from_millis(20),
            depth_warn_threshold: 64,
        }
    }
}

/// Handle returned by [`Interface::init`]; owns the session.
pub struct Interface {
    session: Session,
    config: InterfaceConfig,
    user_callback: Arc<Mutex<Option<CompletionCallback>>>,
    submitted: AtomicU64,
    resolved: Arc<AtomicU64>,
    /// sysinfo wants `&mut System` to refresh, hence the lock.
    sys: Mutex<System>,
    pid: Option<Pid>,
}

impl Interface {
    /// Initialize the façade over a stage registry.
    pub fn init(registry: Arc<StageRegistry>) -> Self {
        Self::with_config(registry, InterfaceConfig::default())
    }

    /// Initialize with explicit admission knobs.
    pub fn with_config(registry: Arc<StageRegistry>, config: InterfaceConfig) -> Self {
        observability::init_metrics();

        let session = Session::new(registry);
        let user_callback: Arc<Mutex<Option<CompletionCallback>>> = Arc::new(Mutex::new(None));
        let resolved = Arc::new(AtomicU64::new(0));

        let forward_callback = Arc::clone(&user_callback);
        let forward_resolved = Arc::clone(&resolved);
        session.register_result_callback(Arc::new(move |request| {
            forward_resolved.fetch_add(1, Ordering::AcqRel);
            let callback = forward_callback.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback(request);
            }
        }));

        let pid = sysinfo::get_current_pid()
            .map_err(|err| debug!(err, "current pid unavailable, memory admission disabled"))
            .ok();

        info!(
            ceiling = config.memory_ceiling_bytes,
            retries = config.memory_retries,
            "interface initialized"
        );
        Self {
            session,
            config,
            user_callback,
            submitted: AtomicU64::new(0),
            resolved,
            sys: Mutex::new(System::new()),
            pid,
        }
    }

    /// Register the external result callback. Replaces any previous one.
    pub fn register_result_callback(&self, callback: CompletionCallback) {
        *self.user_callback.lock().unwrap() = Some(callback);
    }

    /// Admit a request for the given ordered stage list.
    ///
    /// Refuses admission while the process RSS stays over the ceiling after
    /// bounded retries. A deep backlog is logged but never blocks.
    pub fn process(&self, request: Arc<Request>, stages: &[StageKind]) -> StatusCode {
        if stages.is_empty() {
            warn!(request = request.id(), "rejecting empty stage list");
            return StatusCode::EmptyStageList;
        }

        if !self.admit_memory() {
            observability::record_request_dropped();
            error!(request = request.id(), "memory ceiling held, dropping request");
            return StatusCode::ResourceExhausted;
        }

        let depth = self.pending();
        if depth > self.config.depth_warn_threshold {
            warn!(depth, "in-flight depth over soft threshold");
        }

        match self.session.process(request, stages) {
            Ok(()) => {
                let submitted = self.submitted.fetch_add(1, Ordering::AcqRel) + 1;
                observability::record_in_flight_depth(
                    submitted.saturating_sub(self.resolved.load(Ordering::Acquire)),
                );
                StatusCode::Ok
            }
            Err(err) => {
                error!(error = %err, "session rejected request");
                StatusCode::InternalFailure
            }
        }
    }

    /// Requests submitted but not yet resolved through the callback.
    ///
    /// Failed requests never resolve, so this is an upper bound on true
    /// in-flight depth.
    pub fn pending(&self) -> u64 {
        self.submitted
            .load(Ordering::Acquire)
            .saturating_sub(self.resolved.load(Ordering::Acquire))
    }

    /// Total requests admitted.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }

    /// Total requests resolved through the callback.
    pub fn resolved(&self) -> u64 {
        self.resolved.load(Ordering::Acquire)
    }

    /// The underlying session, for stats and drain access.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Drain and stop everything. Consumes the handle.
    pub fn deinit(self) {
        self.session.stop();
        info!(
            submitted = self.submitted.load(Ordering::Acquire),
            resolved = self.resolved.load(Ordering::Acquire),
            "interface deinitialized"
        );
    }

    /// Check the process resident-set size against the ceiling, retrying a
    /// bounded number of times.
    fn admit_memory(&self) -> bool {
        let Some(pid) = self.pid else {
            return true;
        };
        for attempt in 0..=self.config.memory_retries {
            let rss = {
                let mut sys = self.sys.lock().unwrap();
                sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                sys.process(pid).map(|p| p.memory())
            };
            match rss {
                Some(rss) if rss < self.config.memory_ceiling_bytes => return true,
                Some(rss) => {
                    warn!(
                        rss,
                        ceiling = self.config.memory_ceiling_bytes,
                        attempt,
                        "resident memory over ceiling"
                    );
                    std::thread::sleep(self.config.memory_retry_delay);
                }
                // Process not visible to sysinfo; do not block admission.
                None => return true,
            }
        }
        false
    }
}
