//! Pipeline entry points
//!
//! A [`Pipeline`] is the top-level parent: it owns the whole child tree,
//! selects the clock provider and reports what happens inside through a
//! [`PipelineEvent`] stream. The embedding application drives it through
//! a [`PipelineHandle`].

use crate::actor::{spawn_parent, MailboxSender, Message};
use crate::element::{CallbackContext, ElementRegistry};
use crate::error::{Error, Result};
use crate::pad::PadRef;
use crate::parent::Parent;
use crate::playback::PlaybackState;
use crate::spec::GraphSpec;
use crate::sync::SyncHandle;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Events a running pipeline reports to the embedding application
#[derive(Debug)]
pub enum PipelineEvent {
    /// A child (possibly nested) sent a notification
    Notification {
        /// Originating child name
        child: String,
        /// Opaque payload
        payload: Value,
    },
    /// A direct child observed the start of a stream on an input pad
    StartOfStream {
        /// Reporting child name
        child: String,
        /// The pad that saw first data
        pad: PadRef,
    },
    /// A direct child observed end-of-stream on an input pad
    EndOfStream {
        /// Reporting child name
        child: String,
        /// The terminated pad
        pad: PadRef,
    },
    /// The pipeline and all of its children reached a stable state
    PlaybackChanged(PlaybackState),
    /// An actor failed; the pipeline is tearing itself down
    Fatal {
        /// Failing actor name
        child: String,
        /// Human-readable reason
        error: String,
    },
    /// Teardown finished; no further events follow
    Terminated,
}

/// Builder-style namespace for starting pipelines
pub struct Pipeline;

impl Pipeline {
    /// Spawn a pipeline driven by a custom [`Parent`] behavior
    pub fn spawn(behavior: Box<dyn Parent>, registry: ElementRegistry) -> Result<PipelineHandle> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let spawned = spawn_parent(
            "pipeline".to_string(),
            behavior,
            Arc::new(registry),
            None,
            SyncHandle::noop(),
            Some(events_tx),
        )?;
        Ok(PipelineHandle {
            tx: spawned.tx,
            events: events_rx,
            join: spawned.join,
        })
    }

    /// Spawn a pipeline from a static spec, with no custom callbacks
    pub fn spawn_spec(spec: GraphSpec, registry: ElementRegistry) -> Result<PipelineHandle> {
        Self::spawn(Box::new(StaticParent { spec: Some(spec) }), registry)
    }
}

/// Parent behavior that applies one fixed spec and otherwise stays quiet
struct StaticParent {
    spec: Option<GraphSpec>,
}

#[async_trait]
impl Parent for StaticParent {
    async fn handle_init(&mut self, _ctx: &CallbackContext) -> Result<GraphSpec> {
        Ok(self.spec.take().unwrap_or_default())
    }
}

/// Application-side handle onto a running pipeline
pub struct PipelineHandle {
    tx: MailboxSender,
    events: mpsc::UnboundedReceiver<PipelineEvent>,
    join: JoinHandle<()>,
}

impl PipelineHandle {
    /// Request the `Prepared` state
    pub fn prepare(&self) -> Result<()> {
        self.send(Message::ChangePlaybackState(PlaybackState::Prepared))
    }

    /// Request the `Playing` state
    pub fn play(&self) -> Result<()> {
        self.send(Message::ChangePlaybackState(PlaybackState::Playing))
    }

    /// Request the `Stopped` state without terminating
    pub fn stop(&self) -> Result<()> {
        self.send(Message::ChangePlaybackState(PlaybackState::Stopped))
    }

    /// Apply an additional graph spec to the running pipeline
    pub fn apply_spec(&self, spec: GraphSpec) -> Result<()> {
        self.send(Message::ApplySpec(spec))
    }

    /// Stop everything and tear the pipeline down
    pub fn stop_and_terminate(&self) -> Result<()> {
        self.send(Message::StopAndTerminate)
    }

    /// Next pipeline event; `None` once the pipeline task is gone
    pub async fn next_event(&mut self) -> Option<PipelineEvent> {
        self.events.recv().await
    }

    /// Drain events until the pipeline reports `Terminated`, then wait
    /// for its task to finish
    pub async fn await_terminated(mut self) -> Result<()> {
        while let Some(event) = self.events.recv().await {
            if matches!(event, PipelineEvent::Terminated) {
                break;
            }
        }
        self.join
            .await
            .map_err(|err| Error::Execution(format!("pipeline task failed: {err}")))
    }

    fn send(&self, msg: Message) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| Error::LinkDown("pipeline task is gone".to_string()))
    }
}
