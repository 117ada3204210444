//! End-to-end flow tests: pull-mode demand accounting, push delivery,
//! end-of-stream ordering and data crossing bin boundaries.

mod common;

use async_trait::async_trait;
use common::{
    events_until, init_tracing, next_matching, CollectSink, PassthroughFilter, PushSource,
    TestSource,
};
use conduit_runtime_core::element::{CallbackContext, ElementRegistry};
use conduit_runtime_core::pad::PadSpec;
use conduit_runtime_core::parent::{Parent, ParentAction};
use conduit_runtime_core::pipeline::{Pipeline, PipelineEvent};
use conduit_runtime_core::playback::PlaybackState;
use conduit_runtime_core::spec::{EndpointSpec, GraphSpec, LinkOptions};
use conduit_runtime_core::Result;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn payloads(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("payload-{i}")).collect()
}

#[tokio::test]
async fn test_pull_flow_delivers_in_order_then_eos() {
    init_tracing();
    let data = Arc::new(Mutex::new(Vec::new()));
    let eos = Arc::new(AtomicBool::new(false));

    let mut registry = ElementRegistry::new();
    registry.register_element("test_source", |_| Ok(Box::new(TestSource::new(3))));
    registry.register_element("passthrough", |_| Ok(Box::new(PassthroughFilter)));
    {
        let (data, eos) = (data.clone(), eos.clone());
        registry.register_element("collect_sink", move |_| {
            Ok(Box::new(CollectSink::new(data.clone(), eos.clone())))
        });
    }

    let spec = GraphSpec::new()
        .child("src", "test_source", Value::Null)
        .child("filter", "passthrough", Value::Null)
        .child("sink", "collect_sink", Value::Null)
        .link(
            EndpointSpec::child("src", "out"),
            EndpointSpec::child("filter", "in"),
        )
        .link(
            EndpointSpec::child("filter", "out"),
            EndpointSpec::child("sink", "in"),
        );

    let mut pipeline = Pipeline::spawn_spec(spec, registry).unwrap();
    pipeline.play().unwrap();

    next_matching(&mut pipeline, |e| {
        matches!(e, PipelineEvent::EndOfStream { child, .. } if child == "sink")
    })
    .await;

    assert_eq!(*data.lock().unwrap(), payloads(3));
    assert!(eos.load(Ordering::SeqCst));

    pipeline.stop_and_terminate().unwrap();
    pipeline.await_terminated().await.unwrap();
}

#[tokio::test]
async fn test_demand_callback_fires_once_per_positive_edge() {
    init_tracing();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let data = Arc::new(Mutex::new(Vec::new()));
    let eos = Arc::new(AtomicBool::new(false));

    let mut registry = ElementRegistry::new();
    {
        let calls = calls.clone();
        registry.register_element("test_source", move |_| {
            Ok(Box::new(TestSource::recording(3, calls.clone())))
        });
    }
    {
        let (data, eos) = (data.clone(), eos.clone());
        registry.register_element("collect_sink", move |_| {
            Ok(Box::new(CollectSink::new(data.clone(), eos.clone())))
        });
    }

    let spec = GraphSpec::new()
        .child("src", "test_source", Value::Null)
        .child("sink", "collect_sink", Value::Null)
        .link(
            EndpointSpec::child("src", "out"),
            EndpointSpec::child("sink", "in"),
        );

    let mut pipeline = Pipeline::spawn_spec(spec, registry).unwrap();
    pipeline.play().unwrap();

    next_matching(&mut pipeline, |e| {
        matches!(e, PipelineEvent::EndOfStream { child, .. } if child == "sink")
    })
    .await;

    // the window (10) exceeds the stream (3): demand stays positive after
    // the first edge, so the callback runs exactly once
    let calls = calls.lock().unwrap();
    assert_eq!(calls.as_slice(), &[10]);
    assert_eq!(data.lock().unwrap().len(), 3);

    pipeline.stop_and_terminate().unwrap();
    pipeline.await_terminated().await.unwrap();
}

#[tokio::test]
async fn test_small_window_still_delivers_everything() {
    init_tracing();
    let data = Arc::new(Mutex::new(Vec::new()));
    let eos = Arc::new(AtomicBool::new(false));

    let mut registry = ElementRegistry::new();
    registry.register_element("test_source", |_| Ok(Box::new(TestSource::new(5))));
    {
        let (data, eos) = (data.clone(), eos.clone());
        registry.register_element("collect_sink", move |_| {
            Ok(Box::new(CollectSink::new(data.clone(), eos.clone())))
        });
    }

    let spec = GraphSpec::new()
        .child("src", "test_source", Value::Null)
        .child("sink", "collect_sink", Value::Null)
        .link_with(
            EndpointSpec::child("src", "out"),
            EndpointSpec::child("sink", "in"),
            LinkOptions { preferred_size: 2 },
        );

    let mut pipeline = Pipeline::spawn_spec(spec, registry).unwrap();
    pipeline.play().unwrap();

    next_matching(&mut pipeline, |e| {
        matches!(e, PipelineEvent::EndOfStream { child, .. } if child == "sink")
    })
    .await;

    assert_eq!(*data.lock().unwrap(), payloads(5));
    assert!(eos.load(Ordering::SeqCst));

    pipeline.stop_and_terminate().unwrap();
    pipeline.await_terminated().await.unwrap();
}

#[tokio::test]
async fn test_push_mode_flows_without_demand() {
    init_tracing();
    let data = Arc::new(Mutex::new(Vec::new()));
    let eos = Arc::new(AtomicBool::new(false));

    let mut registry = ElementRegistry::new();
    registry.register_element("push_source", |_| Ok(Box::new(PushSource::new(3))));
    {
        let (data, eos) = (data.clone(), eos.clone());
        registry.register_element("push_sink", move |_| {
            Ok(Box::new(CollectSink::push_mode(data.clone(), eos.clone())))
        });
    }

    let spec = GraphSpec::new()
        .child("src", "push_source", Value::Null)
        .child("sink", "push_sink", Value::Null)
        .link(
            EndpointSpec::child("src", "out"),
            EndpointSpec::child("sink", "in"),
        );

    let mut pipeline = Pipeline::spawn_spec(spec, registry).unwrap();
    pipeline.play().unwrap();

    next_matching(&mut pipeline, |e| {
        matches!(e, PipelineEvent::EndOfStream { child, .. } if child == "sink")
    })
    .await;

    assert_eq!(*data.lock().unwrap(), payloads(3));
    assert!(eos.load(Ordering::SeqCst));

    pipeline.stop_and_terminate().unwrap();
    pipeline.await_terminated().await.unwrap();
}

#[tokio::test]
async fn test_no_flow_before_playing() {
    init_tracing();
    let data = Arc::new(Mutex::new(Vec::new()));
    let eos = Arc::new(AtomicBool::new(false));

    let mut registry = ElementRegistry::new();
    registry.register_element("test_source", |_| Ok(Box::new(TestSource::new(3))));
    {
        let (data, eos) = (data.clone(), eos.clone());
        registry.register_element("collect_sink", move |_| {
            Ok(Box::new(CollectSink::new(data.clone(), eos.clone())))
        });
    }

    let spec = GraphSpec::new()
        .child("src", "test_source", Value::Null)
        .child("sink", "collect_sink", Value::Null)
        .link(
            EndpointSpec::child("src", "out"),
            EndpointSpec::child("sink", "in"),
        );

    let mut pipeline = Pipeline::spawn_spec(spec, registry).unwrap();

    // a fully linked pipeline that was never asked to play holds still
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        data.lock().unwrap().is_empty(),
        "data moved while the pipeline was stopped"
    );
    assert!(!eos.load(Ordering::SeqCst));

    pipeline.play().unwrap();
    next_matching(&mut pipeline, |e| {
        matches!(e, PipelineEvent::EndOfStream { child, .. } if child == "sink")
    })
    .await;
    assert_eq!(*data.lock().unwrap(), payloads(3));

    pipeline.stop_and_terminate().unwrap();
    pipeline.await_terminated().await.unwrap();
}

/// Bin wrapping a single passthrough behind boundary pads
struct RelayBin;

#[async_trait]
impl Parent for RelayBin {
    fn boundary_pads(&self) -> Vec<PadSpec> {
        vec![PadSpec::input("in"), PadSpec::output("out")]
    }

    async fn handle_init(&mut self, _ctx: &CallbackContext) -> Result<GraphSpec> {
        Ok(GraphSpec::new()
            .child("f", "passthrough", Value::Null)
            .link(EndpointSpec::parent("in"), EndpointSpec::child("f", "in"))
            .link(EndpointSpec::child("f", "out"), EndpointSpec::parent("out")))
    }
}

#[tokio::test]
async fn test_flow_crosses_bin_boundaries() {
    init_tracing();
    let data = Arc::new(Mutex::new(Vec::new()));
    let eos = Arc::new(AtomicBool::new(false));

    let mut registry = ElementRegistry::new();
    registry.register_element("test_source", |_| Ok(Box::new(TestSource::new(3))));
    registry.register_element("passthrough", |_| Ok(Box::new(PassthroughFilter)));
    registry.register_bin("relay_bin", |_| Ok(Box::new(RelayBin)));
    {
        let (data, eos) = (data.clone(), eos.clone());
        registry.register_element("collect_sink", move |_| {
            Ok(Box::new(CollectSink::new(data.clone(), eos.clone())))
        });
    }

    let spec = GraphSpec::new()
        .child("src", "test_source", Value::Null)
        .child("bin", "relay_bin", Value::Null)
        .child("sink", "collect_sink", Value::Null)
        .link(
            EndpointSpec::child("src", "out"),
            EndpointSpec::child("bin", "in"),
        )
        .link(
            EndpointSpec::child("bin", "out"),
            EndpointSpec::child("sink", "in"),
        );

    let mut pipeline = Pipeline::spawn_spec(spec, registry).unwrap();
    pipeline.play().unwrap();

    next_matching(&mut pipeline, |e| {
        matches!(e, PipelineEvent::EndOfStream { child, .. } if child == "sink")
    })
    .await;

    assert_eq!(*data.lock().unwrap(), payloads(3));
    assert!(eos.load(Ordering::SeqCst));

    pipeline.stop_and_terminate().unwrap();
    let rest = events_until(&mut pipeline, |e| matches!(e, PipelineEvent::Terminated)).await;
    assert!(
        !rest.iter().any(|e| matches!(e, PipelineEvent::Fatal { .. })),
        "teardown must stay clean: {rest:?}"
    );
}

/// Bin that starts its inner filter right away but only connects it to
/// the boundary pads when told to
struct LateWiringBin {
    wired: bool,
}

#[async_trait]
impl Parent for LateWiringBin {
    fn boundary_pads(&self) -> Vec<PadSpec> {
        vec![PadSpec::input("in"), PadSpec::output("out")]
    }

    async fn handle_init(&mut self, _ctx: &CallbackContext) -> Result<GraphSpec> {
        Ok(GraphSpec::new().child("f", "passthrough", Value::Null))
    }

    async fn handle_other(
        &mut self,
        _message: Value,
        _ctx: &CallbackContext,
    ) -> Result<Vec<ParentAction>> {
        if self.wired {
            return Ok(Vec::new());
        }
        self.wired = true;
        Ok(vec![ParentAction::Spec(
            GraphSpec::new()
                .link(EndpointSpec::parent("in"), EndpointSpec::child("f", "in"))
                .link(EndpointSpec::child("f", "out"), EndpointSpec::parent("out")),
        )])
    }
}

/// Tells the bin to wire itself only once the whole graph is playing,
/// after the sink's demand already reached the boundary
struct WireWhilePlaying {
    told: bool,
}

#[async_trait]
impl Parent for WireWhilePlaying {
    async fn handle_init(&mut self, _ctx: &CallbackContext) -> Result<GraphSpec> {
        Ok(GraphSpec::new()
            .child("src", "test_source", Value::Null)
            .child("bin", "late_bin", Value::Null)
            .child("sink", "collect_sink", Value::Null)
            .link(
                EndpointSpec::child("src", "out"),
                EndpointSpec::child("bin", "in"),
            )
            .link(
                EndpointSpec::child("bin", "out"),
                EndpointSpec::child("sink", "in"),
            ))
    }

    async fn handle_playback_changed(
        &mut self,
        _old: PlaybackState,
        new: PlaybackState,
        _ctx: &CallbackContext,
    ) -> Result<Vec<ParentAction>> {
        if new != PlaybackState::Playing || self.told {
            return Ok(Vec::new());
        }
        self.told = true;
        Ok(vec![ParentAction::Forward {
            child: "bin".to_string(),
            message: serde_json::json!("wire"),
        }])
    }
}

#[tokio::test]
async fn test_boundary_wired_after_demand_still_flows() {
    init_tracing();
    let data = Arc::new(Mutex::new(Vec::new()));
    let eos = Arc::new(AtomicBool::new(false));

    let mut registry = ElementRegistry::new();
    registry.register_element("test_source", |_| Ok(Box::new(TestSource::new(3))));
    registry.register_element("passthrough", |_| Ok(Box::new(PassthroughFilter)));
    registry.register_bin("late_bin", |_| Ok(Box::new(LateWiringBin { wired: false })));
    {
        let (data, eos) = (data.clone(), eos.clone());
        registry.register_element("collect_sink", move |_| {
            Ok(Box::new(CollectSink::new(data.clone(), eos.clone())))
        });
    }

    let mut pipeline =
        Pipeline::spawn(Box::new(WireWhilePlaying { told: false }), registry).unwrap();
    pipeline.play().unwrap();

    // demand accumulated on the unwired boundary pad must be replayed
    // inward once the inner link lands, or the stream never finishes
    next_matching(&mut pipeline, |e| {
        matches!(e, PipelineEvent::EndOfStream { child, .. } if child == "sink")
    })
    .await;
    assert_eq!(*data.lock().unwrap(), payloads(3));
    assert!(eos.load(Ordering::SeqCst));

    pipeline.stop_and_terminate().unwrap();
    pipeline.await_terminated().await.unwrap();
}
