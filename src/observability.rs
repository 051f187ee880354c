//! Metrics collection using metrics-rs.

use metrics::{Unit, counter, gauge};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const FRAMES_PROCESSED: &str = "prism_frames_processed";
const FRAMES_FAILED: &str = "prism_frames_failed";
const TIMEOUTS_FIRED: &str = "prism_timeouts_fired";
const REQUESTS_DROPPED: &str = "prism_requests_dropped";
const REQUESTS_IN_FLIGHT: &str = "prism_requests_in_flight";

/// Initialize metrics descriptions.
///
/// Call this once at application startup before using any metrics.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return; // Already initialized
    }

    metrics::describe_counter!(
        FRAMES_PROCESSED,
        Unit::Count,
        "Total requests that finished all their stages"
    );
    metrics::describe_counter!(
        FRAMES_FAILED,
        Unit::Count,
        "Total requests terminated by a stage failure or timeout"
    );
    metrics::describe_counter!(
        TIMEOUTS_FIRED,
        Unit::Count,
        "Total per-stage deadline expirations that won their race"
    );
    metrics::describe_counter!(
        REQUESTS_DROPPED,
        Unit::Count,
        "Total requests rejected at admission"
    );
    metrics::describe_gauge!(
        REQUESTS_IN_FLIGHT,
        Unit::Count,
        "Requests submitted but not yet resolved"
    );
}

/// Record a request finishing its full stage chain.
#[inline]
pub fn record_frame_processed() {
    counter!(FRAMES_PROCESSED).increment(1);
}

/// Record a request terminated by failure or timeout.
#[inline]
pub fn record_frame_failed() {
    counter!(FRAMES_FAILED).increment(1);
}

/// Record a deadline expiration that resolved its task.
#[inline]
pub fn record_timeout_fired() {
    counter!(TIMEOUTS_FIRED).increment(1);
}

/// Record a request rejected at admission.
#[inline]
pub fn record_request_dropped() {
    counter!(REQUESTS_DROPPED).increment(1);
}

/// Record the current submitted-minus-resolved depth.
#[inline]
pub fn record_in_flight_depth(depth: u64) {
    gauge!(REQUESTS_IN_FLIGHT).set(depth as f64);
}
