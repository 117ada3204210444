//! Actor runtime
//!
//! Every element, bin and pipeline runs as one tokio task owning an
//! unbounded mailbox. Cross-actor interaction is message passing only;
//! the few call-shaped setup interactions (pad resolution, linking,
//! watcher registration) carry a oneshot reply channel inside the
//! message.

mod children;
mod element_task;
mod message;
mod parent_task;

pub use message::{ActorId, MailboxReceiver, MailboxSender, Message, Watcher};

pub(crate) use parent_task::spawn_parent;
