//! Element behavior contract and registry
//!
//! Concrete element behaviors live outside this crate; the engine drives
//! them through the [`Element`] trait and constructs them through an
//! [`ElementRegistry`] keyed by type tag. Callbacks return a list of
//! [`ElementAction`]s that the engine executes against the owning
//! actor's pads.

use crate::clock::{Clock, ProxyClock};
use crate::data::Buffer;
use crate::error::{Error, Result};
use crate::pad::{PadRef, PadSpec};
use crate::parent::Parent;
use crate::playback::PlaybackState;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Runtime context handed to every callback
#[derive(Debug, Clone)]
pub struct CallbackContext {
    /// Name of the actor within its parent
    pub name: String,
    /// Current playback state of the actor
    pub playback: PlaybackState,
    /// The parent's proxied clock
    pub clock: ProxyClock,
}

/// Actions an element callback may return
#[derive(Debug)]
pub enum ElementAction {
    /// Emit a buffer on an output pad
    Buffer {
        /// Output pad to emit on
        pad: PadRef,
        /// The buffer
        buffer: Buffer,
    },
    /// Issue pull-mode demand on an input pad
    Demand {
        /// Input pad to demand on
        pad: PadRef,
        /// Number of buffers requested
        size: usize,
    },
    /// Terminate an output pad; no buffers may follow
    EndOfStream {
        /// Output pad to terminate
        pad: PadRef,
    },
    /// Send an opaque notification to the parent
    Notify(Value),
}

/// Element behavior lifecycle
///
/// All callbacks default to no-ops so implementations only override what
/// they need. Sources typically implement `handle_demand`, filters
/// `handle_buffer`, sinks `handle_buffer` plus `handle_end_of_stream`.
#[async_trait]
pub trait Element: Send {
    /// Static pad descriptors of this element
    fn static_pads(&self) -> Vec<PadSpec>;

    /// Clock exposed by this element, making it a provider candidate
    fn provides_clock(&self) -> Option<Clock> {
        None
    }

    /// Called once before any other callback
    async fn handle_init(&mut self, _ctx: &CallbackContext) -> Result<Vec<ElementAction>> {
        Ok(Vec::new())
    }

    /// Pre-transition hook, invoked before `new` becomes stable
    async fn handle_playback(
        &mut self,
        _old: PlaybackState,
        _new: PlaybackState,
        _ctx: &CallbackContext,
    ) -> Result<Vec<ElementAction>> {
        Ok(Vec::new())
    }

    /// Post-transition hook, invoked once `new` is stable
    async fn handle_playback_changed(
        &mut self,
        _old: PlaybackState,
        _new: PlaybackState,
        _ctx: &CallbackContext,
    ) -> Result<Vec<ElementAction>> {
        Ok(Vec::new())
    }

    /// Pull mode: downstream demand became positive on an output pad
    async fn handle_demand(
        &mut self,
        _pad: &PadRef,
        _size: usize,
        _ctx: &CallbackContext,
    ) -> Result<Vec<ElementAction>> {
        Ok(Vec::new())
    }

    /// A buffer arrived on an input pad
    async fn handle_buffer(
        &mut self,
        _pad: &PadRef,
        _buffer: Buffer,
        _ctx: &CallbackContext,
    ) -> Result<Vec<ElementAction>> {
        Ok(Vec::new())
    }

    /// First data was observed on an input pad
    async fn handle_start_of_stream(
        &mut self,
        _pad: &PadRef,
        _ctx: &CallbackContext,
    ) -> Result<Vec<ElementAction>> {
        Ok(Vec::new())
    }

    /// An input pad was terminated by its peer
    async fn handle_end_of_stream(
        &mut self,
        _pad: &PadRef,
        _ctx: &CallbackContext,
    ) -> Result<Vec<ElementAction>> {
        Ok(Vec::new())
    }

    /// A dynamic pad instance was created on this element
    async fn handle_pad_added(
        &mut self,
        _pad: &PadRef,
        _ctx: &CallbackContext,
    ) -> Result<Vec<ElementAction>> {
        Ok(Vec::new())
    }

    /// A dynamic pad instance was unlinked and removed
    async fn handle_pad_removed(
        &mut self,
        _pad: &PadRef,
        _ctx: &CallbackContext,
    ) -> Result<Vec<ElementAction>> {
        Ok(Vec::new())
    }

    /// An opaque message was forwarded to this element by its parent
    async fn handle_other(
        &mut self,
        _message: Value,
        _ctx: &CallbackContext,
    ) -> Result<Vec<ElementAction>> {
        Ok(Vec::new())
    }

    /// Last callback before the actor's task ends
    async fn handle_shutdown(&mut self, _reason: &str) -> Result<()> {
        Ok(())
    }
}

/// What a registry entry produces: a leaf element or a nested bin
pub enum ChildBehavior {
    /// A leaf element
    Element(Box<dyn Element>),
    /// A bin with its own children and boundary pads
    Bin(Box<dyn Parent>),
}

/// Factory for one child type tag
pub trait ChildFactory: Send + Sync {
    /// The type tag this factory answers to
    fn type_name(&self) -> &str;

    /// Build a behavior from user options
    fn create(&self, params: Value) -> Result<ChildBehavior>;
}

struct FnFactory<F> {
    type_name: String,
    build: F,
}

impl<F> ChildFactory for FnFactory<F>
where
    F: Fn(Value) -> Result<ChildBehavior> + Send + Sync,
{
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn create(&self, params: Value) -> Result<ChildBehavior> {
        (self.build)(params)
    }
}

/// Registry of child factories keyed by type tag
#[derive(Default)]
pub struct ElementRegistry {
    factories: HashMap<String, Arc<dyn ChildFactory>>,
}

impl ElementRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory
    pub fn register(&mut self, factory: Arc<dyn ChildFactory>) {
        self.factories
            .insert(factory.type_name().to_string(), factory);
    }

    /// Register an element type from a constructor closure
    pub fn register_element<F>(&mut self, type_name: impl Into<String>, build: F)
    where
        F: Fn(Value) -> Result<Box<dyn Element>> + Send + Sync + 'static,
    {
        let type_name = type_name.into();
        self.register(Arc::new(FnFactory {
            type_name,
            build: move |params| build(params).map(ChildBehavior::Element),
        }));
    }

    /// Register a bin type from a constructor closure
    pub fn register_bin<F>(&mut self, type_name: impl Into<String>, build: F)
    where
        F: Fn(Value) -> Result<Box<dyn Parent>> + Send + Sync + 'static,
    {
        let type_name = type_name.into();
        self.register(Arc::new(FnFactory {
            type_name,
            build: move |params| build(params).map(ChildBehavior::Bin),
        }));
    }

    /// Build a behavior for a declared child
    pub fn create(&self, type_name: &str, params: Value) -> Result<ChildBehavior> {
        let factory = self.factories.get(type_name).ok_or_else(|| {
            Error::InvalidChildSpec(format!("no factory registered for type {type_name}"))
        })?;
        factory.create(params)
    }
}
