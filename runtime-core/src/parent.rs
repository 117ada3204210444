//! Parent (bin and pipeline) behavior contract
//!
//! Bins and pipelines are written against the [`Parent`] trait. Their
//! callbacks return [`ParentAction`]s that the parent's dispatcher
//! evaluates in order against its own children state.

use crate::element::CallbackContext;
use crate::error::Result;
use crate::pad::{PadRef, PadSpec};
use crate::playback::PlaybackState;
use crate::spec::GraphSpec;
use async_trait::async_trait;
use serde_json::Value;

/// Actions a parent callback may return
#[derive(Debug)]
pub enum ParentAction {
    /// Send an opaque message directly to a child
    Forward {
        /// Target child name
        child: String,
        /// Opaque payload, delivered to the child's `handle_other`
        message: Value,
    },
    /// Apply a new graph spec
    Spec(GraphSpec),
    /// Gracefully remove children by name
    RemoveChild(Vec<String>),
    /// Send an opaque notification to this parent's own watcher
    Notify(Value),
}

/// Parent behavior lifecycle
///
/// `handle_init` returns the initial spec; everything else defaults to a
/// no-op so implementations only override what they react to.
#[async_trait]
pub trait Parent: Send {
    /// Boundary pads, for bins; pipelines have none
    fn boundary_pads(&self) -> Vec<PadSpec> {
        Vec::new()
    }

    /// Called once at startup; returns the initial graph spec
    async fn handle_init(&mut self, _ctx: &CallbackContext) -> Result<GraphSpec> {
        Ok(GraphSpec::new())
    }

    /// A child sent a notification
    async fn handle_notification(
        &mut self,
        _child: &str,
        _notification: Value,
        _ctx: &CallbackContext,
    ) -> Result<Vec<ParentAction>> {
        Ok(Vec::new())
    }

    /// A spec finished applying; `children` are the newly started names
    async fn handle_spec_started(
        &mut self,
        _children: &[String],
        _ctx: &CallbackContext,
    ) -> Result<Vec<ParentAction>> {
        Ok(Vec::new())
    }

    /// A child removed via [`ParentAction::RemoveChild`] finished
    /// shutting down; its name is free for reuse from here on
    async fn handle_child_removed(
        &mut self,
        _child: &str,
        _ctx: &CallbackContext,
    ) -> Result<Vec<ParentAction>> {
        Ok(Vec::new())
    }

    /// A child observed the start of a stream on one of its input pads
    async fn handle_element_start_of_stream(
        &mut self,
        _child: &str,
        _pad: &PadRef,
        _ctx: &CallbackContext,
    ) -> Result<Vec<ParentAction>> {
        Ok(Vec::new())
    }

    /// A child observed end-of-stream on one of its input pads
    async fn handle_element_end_of_stream(
        &mut self,
        _child: &str,
        _pad: &PadRef,
        _ctx: &CallbackContext,
    ) -> Result<Vec<ParentAction>> {
        Ok(Vec::new())
    }

    /// Pre-transition hook, invoked before `new` becomes stable
    async fn handle_playback(
        &mut self,
        _old: PlaybackState,
        _new: PlaybackState,
        _ctx: &CallbackContext,
    ) -> Result<Vec<ParentAction>> {
        Ok(Vec::new())
    }

    /// Post-transition hook, invoked once `new` is stable for this actor
    /// and all of its children
    async fn handle_playback_changed(
        &mut self,
        _old: PlaybackState,
        _new: PlaybackState,
        _ctx: &CallbackContext,
    ) -> Result<Vec<ParentAction>> {
        Ok(Vec::new())
    }

    /// An opaque message was forwarded to this parent
    async fn handle_other(
        &mut self,
        _message: Value,
        _ctx: &CallbackContext,
    ) -> Result<Vec<ParentAction>> {
        Ok(Vec::new())
    }

    /// Last callback before the actor's task ends
    async fn handle_shutdown(&mut self, _reason: &str) -> Result<()> {
        Ok(())
    }
}
