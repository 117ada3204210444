//! Core data types flowing through pads
//!
//! Payloads are opaque to the engine: a [`Buffer`] wraps raw bytes plus an
//! optional presentation timestamp, and [`Caps`] constrain what a pad
//! accepts without the engine interpreting the format itself.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Capability constraint describing what data shape a pad accepts
///
/// Caps are compared at link time and must be compatible on both ends.
/// `Any` matches everything; two named formats match iff they are equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Caps {
    /// Accepts any format
    #[default]
    Any,
    /// Accepts exactly the named format
    Format(String),
}

impl Caps {
    /// Create a named format constraint
    pub fn format(name: impl Into<String>) -> Self {
        Caps::Format(name.into())
    }

    /// Check whether two caps constraints can be linked
    pub fn compatible(&self, other: &Caps) -> bool {
        match (self, other) {
            (Caps::Any, _) | (_, Caps::Any) => true,
            (Caps::Format(a), Caps::Format(b)) => a == b,
        }
    }
}

/// A discrete unit of data delivered across a link
#[derive(Debug, Clone)]
pub struct Buffer {
    /// Opaque payload bytes
    pub payload: Bytes,

    /// Optional presentation timestamp, relative to the pipeline clock
    pub pts: Option<Duration>,
}

impl Buffer {
    /// Create a buffer from an opaque payload
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            pts: None,
        }
    }

    /// Attach a presentation timestamp
    pub fn with_pts(mut self, pts: Duration) -> Self {
        self.pts = Some(pts);
        self
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
