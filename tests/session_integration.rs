//! Integration tests for the session pool and the top-level façade.

use prism::interface::{Interface, StatusCode};
use prism::metadata::{MetaKey, MetaValue, Metadata};
use prism::plugin::StageRegistry;
use prism::policy;
use prism::request::Request;
use prism::session::Session;
use prism::stage::StageKind;
use prism::stages::testing::PassThroughStage;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

fn registry() -> Arc<StageRegistry> {
    let mut registry = StageRegistry::new();
    for kind in StageKind::ALL {
        registry.register_factory(kind, Box::new(|| Box::new(PassThroughStage::new())));
    }
    Arc::new(registry)
}

/// Requests with metadata-derived stage lists flow end to end, and
/// identical sequences share one pipeline.
#[test]
fn test_policy_driven_end_to_end() {
    let session = Session::new(registry());
    let finished = Arc::new(AtomicU64::new(0));
    let finished_clone = Arc::clone(&finished);
    session.register_result_callback(Arc::new(move |_| {
        finished_clone.fetch_add(1, Ordering::SeqCst);
    }));

    let metadata = || {
        Metadata::new()
            .with(MetaKey::EnableHdr, MetaValue::Bool(true))
            .with(MetaKey::EnableJpegEncode, MetaValue::Bool(true))
    };

    for id in 0..20 {
        let meta = metadata();
        let stages = policy::stages_for(&meta);
        assert_eq!(stages.as_slice(), &[StageKind::Hdr, StageKind::JpegEncode]);
        session
            .process(Request::new(id, vec![], meta), &stages)
            .unwrap();
    }
    session.drain();

    assert_eq!(finished.load(Ordering::SeqCst), 20);
    assert_eq!(session.pipeline_count(), 1);
    session.stop();
}

/// The façade's counters balance out once every admitted request resolves.
#[test]
fn test_interface_counters_balance() {
    let interface = Interface::init(registry());
    let finished = Arc::new(AtomicU64::new(0));
    let finished_clone = Arc::clone(&finished);
    interface.register_result_callback(Arc::new(move |_| {
        finished_clone.fetch_add(1, Ordering::SeqCst);
    }));

    for id in 0..50 {
        let status = interface.process(
            Request::new(id, vec![], Metadata::new()),
            &[StageKind::Sobel, StageKind::Watermark],
        );
        assert_eq!(status, StatusCode::Ok);
    }
    interface.session().drain();

    assert_eq!(interface.submitted(), 50);
    assert_eq!(interface.resolved(), 50);
    assert_eq!(interface.pending(), 0);
    assert_eq!(finished.load(Ordering::SeqCst), 50);
    interface.deinit();
}

/// Distinct stage sequences land on distinct pooled pipelines.
#[test]
fn test_distinct_sequences_get_distinct_pipelines() {
    let session = Session::new(registry());
    session
        .process(Request::new(1, vec![], Metadata::new()), &[StageKind::Hdr])
        .unwrap();
    session
        .process(
            Request::new(2, vec![], Metadata::new()),
            &[StageKind::Hdr, StageKind::Bokeh],
        )
        .unwrap();
    session
        .process(
            Request::new(3, vec![], Metadata::new()),
            &[StageKind::Bokeh, StageKind::Hdr],
        )
        .unwrap();

    // Order matters: [Hdr, Bokeh] and [Bokeh, Hdr] are different pipelines.
    assert_eq!(session.pipeline_count(), 3);
    session.drain();
    session.stop();
}
