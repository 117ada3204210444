//! Clock provider selection and stream-sync barrier tests.

mod common;

use common::{
    events_until, init_tracing, next_matching, ClockProbeSink, ClockSource, CollectSink,
    TestSource,
};
use conduit_runtime_core::element::ElementRegistry;
use conduit_runtime_core::pipeline::{Pipeline, PipelineEvent, PipelineHandle};
use conduit_runtime_core::playback::PlaybackState;
use conduit_runtime_core::spec::{EndpointSpec, GraphSpec, StreamSync};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test]
async fn test_unique_provider_is_auto_selected() {
    init_tracing();
    let clock_seen = Arc::new(AtomicBool::new(false));

    let mut registry = ElementRegistry::new();
    registry.register_element("clock_source", |_| Ok(Box::new(ClockSource)));
    {
        let clock_seen = clock_seen.clone();
        registry.register_element("clock_probe", move |_| {
            Ok(Box::new(ClockProbeSink::new(clock_seen.clone())))
        });
    }

    let spec = GraphSpec::new()
        .child("ticker", "clock_source", Value::Null)
        .child("probe", "clock_probe", Value::Null);

    let mut pipeline = Pipeline::spawn_spec(spec, registry).unwrap();
    pipeline.play().unwrap();
    next_matching(&mut pipeline, |e| {
        matches!(e, PipelineEvent::PlaybackChanged(PlaybackState::Playing))
    })
    .await;

    assert!(
        clock_seen.load(Ordering::SeqCst),
        "probe should observe the proxied provider clock once playing"
    );

    pipeline.stop_and_terminate().unwrap();
    pipeline.await_terminated().await.unwrap();
}

#[tokio::test]
async fn test_competing_providers_without_choice_are_fatal() {
    init_tracing();
    let mut registry = ElementRegistry::new();
    registry.register_element("clock_source", |_| Ok(Box::new(ClockSource)));

    let spec = GraphSpec::new()
        .child("a", "clock_source", Value::Null)
        .child("b", "clock_source", Value::Null);

    let mut pipeline = Pipeline::spawn_spec(spec, registry).unwrap();
    let event = next_matching(&mut pipeline, |e| {
        matches!(e, PipelineEvent::Fatal { .. })
    })
    .await;
    let PipelineEvent::Fatal { error, .. } = event else {
        unreachable!()
    };
    assert!(error.contains("Clock provider conflict"), "got: {error}");
    pipeline.await_terminated().await.unwrap();
}

#[tokio::test]
async fn test_explicit_provider_resolves_the_conflict() {
    init_tracing();
    let mut registry = ElementRegistry::new();
    registry.register_element("clock_source", |_| Ok(Box::new(ClockSource)));

    let spec = GraphSpec::new()
        .child("a", "clock_source", Value::Null)
        .child("b", "clock_source", Value::Null)
        .clock_provider("a");

    let mut pipeline = Pipeline::spawn_spec(spec, registry).unwrap();
    pipeline.play().unwrap();
    let events = events_until(&mut pipeline, |e| {
        matches!(e, PipelineEvent::PlaybackChanged(PlaybackState::Playing))
    })
    .await;
    assert!(
        !events.iter().any(|e| matches!(e, PipelineEvent::Fatal { .. })),
        "explicit choice must suppress the conflict: {events:?}"
    );

    pipeline.stop_and_terminate().unwrap();
    pipeline.await_terminated().await.unwrap();
}

/// Two independent source/sink chains, sources sharing one sync group
fn synced_spec() -> GraphSpec {
    GraphSpec::new()
        .child("src_a", "test_source", Value::Null)
        .child("src_b", "test_source", Value::Null)
        .child("sink_a", "collect_sink", Value::Null)
        .child("sink_b", "collect_sink", Value::Null)
        .link(
            EndpointSpec::child("src_a", "out"),
            EndpointSpec::child("sink_a", "in"),
        )
        .link(
            EndpointSpec::child("src_b", "out"),
            EndpointSpec::child("sink_b", "in"),
        )
        .stream_sync(StreamSync::Groups(vec![vec![
            "src_a".to_string(),
            "src_b".to_string(),
        ]]))
}

fn flow_registry(data: &Arc<Mutex<Vec<String>>>) -> ElementRegistry {
    let mut registry = ElementRegistry::new();
    registry.register_element("test_source", |_| Ok(Box::new(TestSource::new(1))));
    let data = data.clone();
    registry.register_element("collect_sink", move |_| {
        Ok(Box::new(CollectSink::new(
            data.clone(),
            Arc::new(AtomicBool::new(false)),
        )))
    });
    registry
}

async fn collect_until_both_streams_end(pipeline: &mut PipelineHandle) -> Vec<PipelineEvent> {
    tokio::time::timeout(Duration::from_secs(5), async {
        let mut events = Vec::new();
        let (mut a_done, mut b_done) = (false, false);
        while !(a_done && b_done) {
            match pipeline.next_event().await {
                Some(event) => {
                    if let PipelineEvent::EndOfStream { child, .. } = &event {
                        match child.as_str() {
                            "sink_a" => a_done = true,
                            "sink_b" => b_done = true,
                            _ => {}
                        }
                    }
                    events.push(event);
                }
                None => panic!("pipeline event stream ended unexpectedly"),
            }
        }
        events
    })
    .await
    .expect("timed out waiting for both streams to end")
}

#[tokio::test]
async fn test_synced_sources_hold_data_until_playing() {
    init_tracing();
    let data = Arc::new(Mutex::new(Vec::new()));
    let registry = flow_registry(&data);

    let mut pipeline = Pipeline::spawn_spec(synced_spec(), registry).unwrap();
    pipeline.play().unwrap();
    let events = collect_until_both_streams_end(&mut pipeline).await;

    let playing_at = events
        .iter()
        .position(|e| matches!(e, PipelineEvent::PlaybackChanged(PlaybackState::Playing)))
        .expect("playing event missing");
    for sink in ["sink_a", "sink_b"] {
        let sos_at = events
            .iter()
            .position(
                |e| matches!(e, PipelineEvent::StartOfStream { child, .. } if child == sink),
            )
            .expect("start-of-stream event missing");
        assert!(
            sos_at > playing_at,
            "{sink} saw data before the group opened: {events:?}"
        );
    }
    assert_eq!(data.lock().unwrap().len(), 2);

    pipeline.stop_and_terminate().unwrap();
    pipeline.await_terminated().await.unwrap();
}

#[tokio::test]
async fn test_sinks_shorthand_defers_demand_until_playing() {
    init_tracing();
    let data = Arc::new(Mutex::new(Vec::new()));
    let registry = flow_registry(&data);

    let spec = GraphSpec::new()
        .child("src_a", "test_source", Value::Null)
        .child("src_b", "test_source", Value::Null)
        .child("sink_a", "collect_sink", Value::Null)
        .child("sink_b", "collect_sink", Value::Null)
        .link(
            EndpointSpec::child("src_a", "out"),
            EndpointSpec::child("sink_a", "in"),
        )
        .link(
            EndpointSpec::child("src_b", "out"),
            EndpointSpec::child("sink_b", "in"),
        )
        .stream_sync(StreamSync::Sinks);

    let mut pipeline = Pipeline::spawn_spec(spec, registry).unwrap();
    pipeline.play().unwrap();
    let events = collect_until_both_streams_end(&mut pipeline).await;

    let playing_at = events
        .iter()
        .position(|e| matches!(e, PipelineEvent::PlaybackChanged(PlaybackState::Playing)))
        .expect("playing event missing");
    for sink in ["sink_a", "sink_b"] {
        let sos_at = events
            .iter()
            .position(
                |e| matches!(e, PipelineEvent::StartOfStream { child, .. } if child == sink),
            )
            .expect("start-of-stream event missing");
        assert!(
            sos_at > playing_at,
            "{sink} pulled data before the group opened: {events:?}"
        );
    }

    pipeline.stop_and_terminate().unwrap();
    pipeline.await_terminated().await.unwrap();
}
