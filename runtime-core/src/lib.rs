//! Conduit Runtime Core - Actor-based stream processing engine
//!
//! This crate provides the execution engine for conduit pipelines:
//! graphs of elements exchanging buffers over linked pads, grouped into
//! bins and driven by a top-level pipeline.
//!
//! # Architecture
//!
//! Runtime-core is a pure library that:
//! - Defines the behavior contracts (`Element`, `Parent` traits)
//! - Runs every element, bin and pipeline as its own tokio task
//! - Applies declarative [`spec::GraphSpec`] graphs, with dynamic
//!   re-specification at runtime
//! - Enforces demand-driven flow control on pull-mode links
//! - Coordinates playback transitions, clock selection and stream-sync
//!   barriers across the child tree
//!
//! # Example
//!
//! ```ignore
//! use conduit_runtime_core::element::ElementRegistry;
//! use conduit_runtime_core::pipeline::{Pipeline, PipelineEvent};
//! use conduit_runtime_core::spec::{EndpointSpec, GraphSpec};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut registry = ElementRegistry::new();
//!     // register element factories...
//!
//!     let spec = GraphSpec::new()
//!         .child("src", "file_source", json!({"path": "in.raw"}))
//!         .child("sink", "file_sink", json!({"path": "out.raw"}))
//!         .link(
//!             EndpointSpec::child("src", "out"),
//!             EndpointSpec::child("sink", "in"),
//!         );
//!
//!     let mut pipeline = Pipeline::spawn_spec(spec, registry)?;
//!     pipeline.play()?;
//!     while let Some(event) = pipeline.next_event().await {
//!         println!("event: {:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod actor;
pub mod clock;
pub mod data;
pub mod element;
pub mod pad;
pub mod parent;
pub mod pipeline;
pub mod playback;
pub mod spec;
pub mod sync;

// Error types
mod error;
pub use error::{Error, Result};

/// Initialize the conduit runtime core
///
/// This should be called once at startup to initialize logging.
pub fn init() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Conduit Runtime Core initialized");
    Ok(())
}
