//! Testing stages.
//!
//! Minimal [`ImageStage`](crate::stage::ImageStage) implementations with
//! predictable behavior, for exercising pipelines without real image math.

use crate::request::Request;
use crate::stage::{DEFAULT_TIMEOUT_BUDGET, ImageStage};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A stage that accepts every request unchanged.
#[derive(Default)]
pub struct PassThroughStage;

impl PassThroughStage {
    /// Create a pass-through stage.
    pub fn new() -> Self {
        Self
    }
}

impl ImageStage for PassThroughStage {
    fn open(&mut self) -> crate::Result<()> {
        Ok(())
    }

    fn process(&mut self, _request: &Request) -> crate::Result<()> {
        Ok(())
    }

    fn close(&mut self) {}
}

/// A stage that counts the requests it sees on a shared counter.
pub struct CountingStage {
    counter: Arc<AtomicU64>,
}

impl CountingStage {
    /// Create a counting stage incrementing `counter` per processed request.
    pub fn new(counter: Arc<AtomicU64>) -> Self {
        Self { counter }
    }
}

impl ImageStage for CountingStage {
    fn open(&mut self) -> crate::Result<()> {
        Ok(())
    }

    fn process(&mut self, _request: &Request) -> crate::Result<()> {
        self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) {}
}

/// A stage with a fixed processing latency and timeout budget.
pub struct SleepStage {
    latency: Duration,
    budget: Duration,
}

impl SleepStage {
    /// Create a stage that sleeps `latency` per request and declares
    /// `budget` as its timeout budget.
    pub fn new(latency: Duration, budget: Duration) -> Self {
        Self { latency, budget }
    }

    /// A sleep stage whose latency fits comfortably inside the default
    /// budget.
    pub fn fast(latency: Duration) -> Self {
        Self {
            latency,
            budget: DEFAULT_TIMEOUT_BUDGET,
        }
    }
}

impl ImageStage for SleepStage {
    fn open(&mut self) -> crate::Result<()> {
        Ok(())
    }

    fn process(&mut self, _request: &Request) -> crate::Result<()> {
        std::thread::sleep(self.latency);
        Ok(())
    }

    fn close(&mut self) {}

    fn timeout_budget(&self) -> Duration {
        self.budget
    }
}

/// A stage that fails every request.
pub struct FailStage {
    reason: String,
}

impl FailStage {
    /// Create a stage whose `process` always returns the given error.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl ImageStage for FailStage {
    fn open(&mut self) -> crate::Result<()> {
        Ok(())
    }

    fn process(&mut self, _request: &Request) -> crate::Result<()> {
        Err(crate::Error::Stage(self.reason.clone()))
    }

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;

    #[test]
    fn test_passthrough_accepts() {
        let mut stage = PassThroughStage::new();
        stage.open().unwrap();
        let request = Request::new(1, vec![], Metadata::new());
        assert!(stage.process(&request).is_ok());
        stage.close();
    }

    #[test]
    fn test_counting_counts() {
        let counter = Arc::new(AtomicU64::new(0));
        let mut stage = CountingStage::new(Arc::clone(&counter));
        let request = Request::new(1, vec![], Metadata::new());
        stage.process(&request).unwrap();
        stage.process(&request).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_fail_fails() {
        let mut stage = FailStage::new("nope");
        let request = Request::new(1, vec![], Metadata::new());
        assert!(stage.process(&request).is_err());
    }
}
