//! Process-boundary messages between actors
//!
//! Every cross-actor interaction is one of these messages landing in the
//! target's mailbox. Setup calls (`GetPadRef`, `HandleLink`,
//! `SetWatcher`) carry a oneshot reply channel; everything else is
//! fire-and-forget.

use crate::data::Buffer;
use crate::error::Result;
use crate::pad::{PadInfo, PadRef, Peer};
use crate::playback::PlaybackState;
use crate::spec::{GraphSpec, LinkOptions};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Unique id of a running actor
pub type ActorId = Uuid;

/// Sending half of an actor's mailbox
pub type MailboxSender = mpsc::UnboundedSender<Message>;

/// Receiving half of an actor's mailbox
pub type MailboxReceiver = mpsc::UnboundedReceiver<Message>;

/// Non-owning notification target: the parent watching this actor
#[derive(Debug, Clone)]
pub struct Watcher {
    /// The watching parent's actor id
    pub id: ActorId,
    /// The watching parent's mailbox
    pub tx: MailboxSender,
}

/// Messages exchanged across actor boundaries
#[derive(Debug)]
pub enum Message {
    /// Request a playback transition towards the given target
    ChangePlaybackState(PlaybackState),

    /// A child reports having reached a stable state
    PlaybackStateChanged {
        /// Reporting child
        child: ActorId,
        /// The state the child reached
        state: PlaybackState,
    },

    /// A child forwards an opaque notification to its watcher
    Notification {
        /// Reporting child name
        child_name: String,
        /// Opaque payload
        payload: Value,
    },

    /// A child observed start-of-stream on an input pad
    ElementStartOfStream {
        /// Reporting child name
        child_name: String,
        /// The pad that saw first data
        pad: PadRef,
    },

    /// A child observed end-of-stream on an input pad
    ElementEndOfStream {
        /// Reporting child name
        child_name: String,
        /// The terminated pad
        pad: PadRef,
    },

    /// A child finished its controlled shutdown
    ShutdownReady {
        /// Reporting child
        child: ActorId,
    },

    /// Drive this actor to `Stopped` and tear it down
    StopAndTerminate,

    /// Apply a graph spec to this parent
    ApplySpec(GraphSpec),

    /// Resolve a symbolic pad request into a live reference (call)
    GetPadRef {
        /// Pad or template name
        name: String,
        /// Dynamic instance to reuse, if any
        instance: Option<Uuid>,
        /// Reply channel
        reply: oneshot::Sender<Result<(PadRef, PadInfo)>>,
    },

    /// Record a peer on a local pad (call)
    HandleLink {
        /// Local pad to link
        pad: PadRef,
        /// The peer endpoint
        peer: Peer,
        /// The peer's descriptor info
        peer_info: PadInfo,
        /// Link options
        options: LinkOptions,
        /// Reply channel carrying the local descriptor info
        reply: oneshot::Sender<Result<PadInfo>>,
    },

    /// The peer of a pad is shutting down; drop the reference
    HandleUnlink {
        /// Local pad whose peer went away
        pad: PadRef,
    },

    /// All links of one spec batch are established
    LinkingFinished,

    /// Register the watching parent (call)
    SetWatcher {
        /// The watcher
        watcher: Watcher,
        /// Reply channel
        reply: oneshot::Sender<()>,
    },

    /// A buffer crossing a link
    Buffer {
        /// Destination pad
        pad: PadRef,
        /// The buffer
        buffer: Buffer,
    },

    /// Pull-mode demand crossing a link upstream
    Demand {
        /// Destination (output) pad
        pad: PadRef,
        /// Buffers requested
        size: usize,
    },

    /// Start-of-stream crossing a link
    StartOfStream {
        /// Destination pad
        pad: PadRef,
    },

    /// End-of-stream crossing a link; terminal for the pad
    EndOfStream {
        /// Destination pad
        pad: PadRef,
    },

    /// This actor's sync barrier opened
    SyncOpen,

    /// A monitored child task ended
    ChildDown {
        /// The child that went down
        child: ActorId,
        /// Its name at spawn time
        name: String,
    },

    /// A child hit a fatal error and is crashing
    Fatal {
        /// Reporting child name
        child_name: String,
        /// Human-readable reason
        error: String,
    },

    /// Opaque message forwarded by the parent
    Other(Value),
}
