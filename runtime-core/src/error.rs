//! Error types for runtime-core

use thiserror::Error;

/// Result type alias for runtime-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for runtime-core
#[derive(Debug, Error)]
pub enum Error {
    /// A spec declared a child name that is already taken
    #[error("Duplicate child name: {0}")]
    DuplicateChildName(String),

    /// A child name could not be resolved against the children mapping
    #[error("Unknown child: {0}")]
    UnknownChild(String),

    /// A pad name (or instance) could not be resolved on its actor
    #[error("Unknown pad: {0}")]
    UnknownPad(String),

    /// Caps of two linked pads are not compatible
    #[error("Incompatible caps linking pad {pad} to peer pad {peer}")]
    CapsIncompatible {
        /// Local pad reference
        pad: String,
        /// Peer pad reference
        peer: String,
    },

    /// A sync group referenced a duplicate, unknown or unsyncable member
    #[error("Sync group conflict: {0}")]
    SyncGroupConflict(String),

    /// Malformed declarative child or link entry
    #[error("Invalid child spec: {0}")]
    InvalidChildSpec(String),

    /// A returned action referenced a pad it cannot legally target
    #[error("Invalid action: {0}")]
    InvalidAction(String),

    /// A user callback returned a value outside its contract
    #[error("Callback returned a value outside its contract: {0}")]
    CallbackBadReturn(String),

    /// Multiple auto clock candidates, or manual re-selection attempted
    #[error("Clock provider conflict: {0}")]
    ClockProviderConflict(String),

    /// The peer end of a link is no longer reachable
    #[error("Link down: {0}")]
    LinkDown(String),

    /// A child actor terminated without a controlled shutdown
    #[error("Child crashed: {0}")]
    ChildCrashed(String),

    /// General execution error reported by a callback
    #[error("Execution error: {0}")]
    Execution(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
