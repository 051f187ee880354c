//! Integration tests for the Prism pipeline runtime.

use prism::metadata::Metadata;
use prism::pipeline::{Pipeline, PipelineState};
use prism::plugin::StageRegistry;
use prism::request::Request;
use prism::stage::StageKind;
use prism::stages::testing::{CountingStage, FailStage, PassThroughStage, SleepStage};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

fn request(id: u64) -> Arc<Request> {
    Request::new(id, vec![], Metadata::new())
}

/// Submitting 10,000 requests into a 2-stage pipeline and draining yields
/// 10,000 processed frames and exactly 10,000 callback invocations.
#[test]
fn test_ten_thousand_requests_two_stage_pipeline() {
    let counted = Arc::new(AtomicU64::new(0));
    let counted_clone = Arc::clone(&counted);

    let mut registry = StageRegistry::new();
    registry.register_factory(
        StageKind::Hdr,
        Box::new(move || Box::new(CountingStage::new(Arc::clone(&counted_clone)))),
    );
    registry.register_factory(
        StageKind::Sobel,
        Box::new(|| Box::new(PassThroughStage::new())),
    );

    let mut pipeline = Pipeline::new();
    pipeline
        .configure(&registry, &[StageKind::Hdr, StageKind::Sobel])
        .unwrap();

    let callbacks = Arc::new(AtomicU64::new(0));
    let callbacks_clone = Arc::clone(&callbacks);
    pipeline.set_completion_callback(Arc::new(move |finished| {
        // Every finished request passed through both stages.
        assert_eq!(finished.stages_completed(), 2);
        callbacks_clone.fetch_add(1, Ordering::SeqCst);
    }));

    for id in 0..10_000 {
        pipeline.process(request(id)).unwrap();
    }
    pipeline.drain();

    assert_eq!(pipeline.processed_frames(), 10_000);
    assert_eq!(callbacks.load(Ordering::SeqCst), 10_000);
    assert_eq!(counted.load(Ordering::SeqCst), 10_000);
    assert_eq!(pipeline.in_flight(), 0);
    pipeline.stop();
}

/// A stage that always fails terminates the request without a callback and
/// leaves the pipeline in the failed state.
#[test]
fn test_always_failing_stage() {
    let mut registry = StageRegistry::new();
    registry.register_factory(
        StageKind::Watermark,
        Box::new(|| Box::new(FailStage::new("synthetic failure"))),
    );

    let mut pipeline = Pipeline::new();
    pipeline.configure(&registry, &[StageKind::Watermark]).unwrap();

    let callbacks = Arc::new(AtomicU64::new(0));
    let callbacks_clone = Arc::clone(&callbacks);
    pipeline.set_completion_callback(Arc::new(move |_| {
        callbacks_clone.fetch_add(1, Ordering::SeqCst);
    }));

    pipeline.process(request(1)).unwrap();
    pipeline.drain();

    assert_eq!(pipeline.state(), PipelineState::FailedToProcess);
    assert_eq!(callbacks.load(Ordering::SeqCst), 0);
    assert_eq!(pipeline.processed_frames(), 0);
    assert_eq!(pipeline.in_flight(), 0);
}

/// A 5ms budget against a 20ms body times out every single submission,
/// never zero, across 100 repetitions.
#[test]
fn test_timeout_fires_once_per_request() {
    let mut registry = StageRegistry::new();
    registry.register_factory(
        StageKind::Mandelbrot,
        Box::new(|| {
            Box::new(SleepStage::new(
                Duration::from_millis(20),
                Duration::from_millis(5),
            ))
        }),
    );

    for iteration in 0..100 {
        let mut pipeline = Pipeline::new();
        pipeline
            .configure(&registry, &[StageKind::Mandelbrot])
            .unwrap();
        pipeline.process(request(iteration)).unwrap();
        pipeline.drain();

        // Had the timeout not fired, the request would have completed and
        // the pipeline would still be Active.
        assert_eq!(
            pipeline.state(),
            PipelineState::FailedToProcess,
            "iteration {iteration}"
        );
        assert_eq!(pipeline.in_flight(), 0, "iteration {iteration}");
        pipeline.stop();
    }
}

/// drain() does not return while requests are in flight.
#[test]
fn test_drain_waits_for_inflight() {
    let mut registry = StageRegistry::new();
    registry.register_factory(
        StageKind::Bokeh,
        Box::new(|| Box::new(SleepStage::fast(Duration::from_millis(10)))),
    );

    let mut pipeline = Pipeline::new();
    pipeline.configure(&registry, &[StageKind::Bokeh]).unwrap();

    for id in 0..8 {
        pipeline.process(request(id)).unwrap();
    }
    pipeline.drain();
    assert_eq!(pipeline.in_flight(), 0);
    assert_eq!(pipeline.processed_frames(), 8);
}

/// Stages execute in configured order and each marks its completion.
#[test]
fn test_stage_order_and_completion_count() {
    let mut registry = StageRegistry::new();
    for kind in [StageKind::Hdr, StageKind::Watermark, StageKind::JpegEncode] {
        registry.register_factory(kind, Box::new(|| Box::new(PassThroughStage::new())));
    }

    let mut pipeline = Pipeline::new();
    pipeline
        .configure(
            &registry,
            &[StageKind::Hdr, StageKind::Watermark, StageKind::JpegEncode],
        )
        .unwrap();

    let seen = Arc::new(AtomicU64::new(0));
    let seen_clone = Arc::clone(&seen);
    pipeline.set_completion_callback(Arc::new(move |finished| {
        assert_eq!(finished.stages_completed(), 3);
        seen_clone.fetch_add(1, Ordering::SeqCst);
    }));

    pipeline.process(request(42)).unwrap();
    pipeline.drain();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}
