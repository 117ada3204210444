//! Spec application tests: static graphs, incremental re-specification,
//! validation failures and controlled child removal.

mod common;

use async_trait::async_trait;
use common::{drain_for, events_until, init_tracing, next_matching, CollectSink, TestSource};
use conduit_runtime_core::element::{CallbackContext, ElementRegistry};
use conduit_runtime_core::pad::PadRef;
use conduit_runtime_core::parent::{Parent, ParentAction};
use conduit_runtime_core::pipeline::{Pipeline, PipelineEvent};
use conduit_runtime_core::spec::{EndpointSpec, GraphSpec};
use conduit_runtime_core::Result;
use serde_json::Value;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn sink_registry(data: &Arc<Mutex<Vec<String>>>, eos: &Arc<AtomicBool>) -> ElementRegistry {
    let mut registry = ElementRegistry::new();
    registry.register_element("test_source", |params| {
        let count = params.get("count").and_then(Value::as_u64).unwrap_or(3);
        Ok(Box::new(TestSource::new(count as usize)))
    });
    let (data, eos) = (data.clone(), eos.clone());
    registry.register_element("collect_sink", move |_| {
        Ok(Box::new(CollectSink::new(data.clone(), eos.clone())))
    });
    registry
}

#[tokio::test]
async fn test_static_spec_runs_and_terminates_cleanly() -> anyhow::Result<()> {
    init_tracing();
    let data = Arc::new(Mutex::new(Vec::new()));
    let eos = Arc::new(AtomicBool::new(false));
    let registry = sink_registry(&data, &eos);

    let spec = GraphSpec::new()
        .child("src", "test_source", serde_json::json!({"count": 2}))
        .child("sink", "collect_sink", Value::Null)
        .link(
            EndpointSpec::child("src", "out"),
            EndpointSpec::child("sink", "in"),
        );

    let mut pipeline = Pipeline::spawn_spec(spec, registry)?;
    pipeline.play()?;
    next_matching(&mut pipeline, |e| {
        matches!(e, PipelineEvent::EndOfStream { child, .. } if child == "sink")
    })
    .await;

    pipeline.stop_and_terminate()?;
    let rest = events_until(&mut pipeline, |e| matches!(e, PipelineEvent::Terminated)).await;
    assert!(
        !rest.iter().any(|e| matches!(e, PipelineEvent::Fatal { .. })),
        "unexpected failure during teardown: {rest:?}"
    );
    assert_eq!(data.lock().unwrap().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_unregistered_element_type_is_fatal() {
    init_tracing();
    let registry = ElementRegistry::new();
    let spec = GraphSpec::new().child("ghost", "no_such_type", Value::Null);

    let mut pipeline = Pipeline::spawn_spec(spec, registry).unwrap();
    let event = next_matching(&mut pipeline, |e| {
        matches!(e, PipelineEvent::Fatal { .. })
    })
    .await;
    let PipelineEvent::Fatal { error, .. } = event else {
        unreachable!()
    };
    assert!(error.contains("no_such_type"), "got: {error}");
    pipeline.await_terminated().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_child_name_across_specs_is_fatal() {
    init_tracing();
    let data = Arc::new(Mutex::new(Vec::new()));
    let eos = Arc::new(AtomicBool::new(false));
    let registry = sink_registry(&data, &eos);

    let spec = GraphSpec::new().child("src", "test_source", Value::Null);
    let mut pipeline = Pipeline::spawn_spec(spec, registry).unwrap();

    pipeline
        .apply_spec(GraphSpec::new().child("src", "test_source", Value::Null))
        .unwrap();

    let event = next_matching(&mut pipeline, |e| {
        matches!(e, PipelineEvent::Fatal { .. })
    })
    .await;
    let PipelineEvent::Fatal { error, .. } = event else {
        unreachable!()
    };
    assert!(error.contains("Duplicate child name"), "got: {error}");
    pipeline.await_terminated().await.unwrap();
}

#[tokio::test]
async fn test_link_to_unknown_child_is_fatal() {
    init_tracing();
    let data = Arc::new(Mutex::new(Vec::new()));
    let eos = Arc::new(AtomicBool::new(false));
    let registry = sink_registry(&data, &eos);

    let spec = GraphSpec::new()
        .child("src", "test_source", Value::Null)
        .link(
            EndpointSpec::child("src", "out"),
            EndpointSpec::child("ghost", "in"),
        );

    let mut pipeline = Pipeline::spawn_spec(spec, registry).unwrap();
    next_matching(&mut pipeline, |e| matches!(e, PipelineEvent::Fatal { .. })).await;
    pipeline.await_terminated().await.unwrap();
}

/// Starts with only a source, then links a sink to it in a second spec
struct GrowingParent {
    grown: bool,
}

#[async_trait]
impl Parent for GrowingParent {
    async fn handle_init(&mut self, _ctx: &CallbackContext) -> Result<GraphSpec> {
        Ok(GraphSpec::new().child("src", "test_source", serde_json::json!({"count": 2})))
    }

    async fn handle_spec_started(
        &mut self,
        _children: &[String],
        _ctx: &CallbackContext,
    ) -> Result<Vec<ParentAction>> {
        if self.grown {
            return Ok(Vec::new());
        }
        self.grown = true;
        Ok(vec![ParentAction::Spec(
            GraphSpec::new()
                .child("sink", "collect_sink", Value::Null)
                .link(
                    EndpointSpec::child("src", "out"),
                    EndpointSpec::child("sink", "in"),
                ),
        )])
    }
}

#[tokio::test]
async fn test_incremental_spec_links_to_existing_child() {
    init_tracing();
    let data = Arc::new(Mutex::new(Vec::new()));
    let eos = Arc::new(AtomicBool::new(false));
    let registry = sink_registry(&data, &eos);

    let mut pipeline =
        Pipeline::spawn(Box::new(GrowingParent { grown: false }), registry).unwrap();
    pipeline.play().unwrap();

    next_matching(&mut pipeline, |e| {
        matches!(e, PipelineEvent::EndOfStream { child, .. } if child == "sink")
    })
    .await;
    assert_eq!(data.lock().unwrap().len(), 2);

    pipeline.stop_and_terminate().unwrap();
    pipeline.await_terminated().await.unwrap();
}

/// Removes the drained source once the sink reports end-of-stream, then
/// reuses its name for a fresh child after the removal completed
struct RecyclingParent {
    recycled: bool,
}

#[async_trait]
impl Parent for RecyclingParent {
    async fn handle_init(&mut self, _ctx: &CallbackContext) -> Result<GraphSpec> {
        Ok(GraphSpec::new()
            .child("src", "test_source", serde_json::json!({"count": 1}))
            .child("sink", "collect_sink", Value::Null)
            .link(
                EndpointSpec::child("src", "out"),
                EndpointSpec::child("sink", "in"),
            ))
    }

    async fn handle_element_end_of_stream(
        &mut self,
        child: &str,
        _pad: &PadRef,
        _ctx: &CallbackContext,
    ) -> Result<Vec<ParentAction>> {
        if child != "sink" || self.recycled {
            return Ok(Vec::new());
        }
        self.recycled = true;
        Ok(vec![ParentAction::RemoveChild(vec!["src".to_string()])])
    }

    async fn handle_child_removed(
        &mut self,
        child: &str,
        _ctx: &CallbackContext,
    ) -> Result<Vec<ParentAction>> {
        if child != "src" {
            return Ok(Vec::new());
        }
        Ok(vec![
            ParentAction::Spec(
                GraphSpec::new().child("src", "test_source", serde_json::json!({"count": 1})),
            ),
            ParentAction::Notify(serde_json::json!("recycled")),
        ])
    }
}

#[tokio::test]
async fn test_removed_child_frees_its_name() -> anyhow::Result<()> {
    init_tracing();
    let data = Arc::new(Mutex::new(Vec::new()));
    let eos = Arc::new(AtomicBool::new(false));
    let registry = sink_registry(&data, &eos);

    let mut pipeline = Pipeline::spawn(Box::new(RecyclingParent { recycled: false }), registry)?;
    pipeline.play()?;

    next_matching(&mut pipeline, |e| {
        matches!(e, PipelineEvent::EndOfStream { child, .. } if child == "sink")
    })
    .await;
    next_matching(&mut pipeline, |e| {
        matches!(e, PipelineEvent::Notification { payload, .. } if payload == "recycled")
    })
    .await;

    // the removed child's task ends after the name was reused; that
    // report must not be taken for a crash
    let quiet = drain_for(&mut pipeline, Duration::from_millis(300)).await;
    assert!(
        !quiet.iter().any(|e| matches!(e, PipelineEvent::Fatal { .. })),
        "controlled removal escalated: {quiet:?}"
    );

    pipeline.stop_and_terminate()?;
    let rest = events_until(&mut pipeline, |e| matches!(e, PipelineEvent::Terminated)).await;
    assert!(
        !rest.iter().any(|e| matches!(e, PipelineEvent::Fatal { .. })),
        "name reuse after removal must not fail: {rest:?}"
    );
    Ok(())
}

/// Reuses the removed child's name in the same action batch, before the
/// shutdown-ready report could have freed it
struct EagerRecycler {
    recycled: bool,
}

#[async_trait]
impl Parent for EagerRecycler {
    async fn handle_init(&mut self, _ctx: &CallbackContext) -> Result<GraphSpec> {
        Ok(GraphSpec::new()
            .child("src", "test_source", serde_json::json!({"count": 1}))
            .child("sink", "collect_sink", Value::Null)
            .link(
                EndpointSpec::child("src", "out"),
                EndpointSpec::child("sink", "in"),
            ))
    }

    async fn handle_element_end_of_stream(
        &mut self,
        child: &str,
        _pad: &PadRef,
        _ctx: &CallbackContext,
    ) -> Result<Vec<ParentAction>> {
        if child != "sink" || self.recycled {
            return Ok(Vec::new());
        }
        self.recycled = true;
        Ok(vec![
            ParentAction::RemoveChild(vec!["src".to_string()]),
            ParentAction::Spec(
                GraphSpec::new().child("src", "test_source", serde_json::json!({"count": 1})),
            ),
        ])
    }
}

#[tokio::test]
async fn test_child_name_stays_taken_until_shutdown_ready() {
    init_tracing();
    let data = Arc::new(Mutex::new(Vec::new()));
    let eos = Arc::new(AtomicBool::new(false));
    let registry = sink_registry(&data, &eos);

    let mut pipeline =
        Pipeline::spawn(Box::new(EagerRecycler { recycled: false }), registry).unwrap();
    pipeline.play().unwrap();

    let event = next_matching(&mut pipeline, |e| {
        matches!(e, PipelineEvent::Fatal { .. })
    })
    .await;
    let PipelineEvent::Fatal { error, .. } = event else {
        unreachable!()
    };
    assert!(error.contains("Duplicate child name"), "got: {error}");
    pipeline.await_terminated().await.unwrap();
}
