//! Playback state machine
//!
//! Every actor (element, bin, pipeline) owns a [`Playback`] and moves
//! between `Stopped`, `Prepared` and `Playing` strictly one step at a
//! time. Parents additionally track a fan-in set of children that must
//! acknowledge each step before the parent considers it complete.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;

/// Global playback state of an actor
///
/// The order is total: `Stopped < Prepared < Playing`. Transitions never
/// skip an intermediate state in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    /// No resources allocated, no data flowing
    Stopped,
    /// Resources allocated, ready to run
    Prepared,
    /// Data flowing
    Playing,
}

impl PlaybackState {
    /// The next state on the path towards `target`, or `None` if already there
    pub fn step_towards(self, target: PlaybackState) -> Option<PlaybackState> {
        use PlaybackState::*;
        match (self, target) {
            (a, b) if a == b => None,
            (Stopped, _) => Some(Prepared),
            (Playing, _) => Some(Prepared),
            (Prepared, t) => Some(t),
        }
    }

    /// Full chain of states visited when moving to `target`, target included
    pub fn path_to(self, target: PlaybackState) -> Vec<PlaybackState> {
        let mut path = Vec::new();
        let mut current = self;
        while let Some(next) = current.step_towards(target) {
            path.push(next);
            current = next;
        }
        path
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlaybackState::Stopped => "stopped",
            PlaybackState::Prepared => "prepared",
            PlaybackState::Playing => "playing",
        };
        f.write_str(s)
    }
}

/// Per-actor playback bookkeeping
#[derive(Debug)]
pub struct Playback {
    /// Current stable state
    pub state: PlaybackState,

    /// In-flight transition target, `None` when stable
    pub pending: Option<PlaybackState>,

    /// Set once shutdown has been requested; reaching `Stopped` with this
    /// flag set triggers actor teardown
    pub terminating: bool,
}

impl Playback {
    /// New playback record, stable at `Stopped`
    pub fn new() -> Self {
        Self {
            state: PlaybackState::Stopped,
            pending: None,
            terminating: false,
        }
    }

    /// A transition is stable iff no pending target is recorded
    pub fn is_stable(&self) -> bool {
        self.pending.is_none()
    }
}

impl Default for Playback {
    fn default() -> Self {
        Self::new()
    }
}

/// Fan-in barrier over children acknowledging one transition step
///
/// Created when a parent fans a target state out to its children; the
/// step completes only once every tracked child reported reaching that
/// exact state. Reports for a different state are ignored as stale.
#[derive(Debug)]
pub struct PendingChildren<Id> {
    target: PlaybackState,
    awaiting: HashSet<Id>,
}

impl<Id: Eq + Hash + Copy + fmt::Debug> PendingChildren<Id> {
    /// Track `children` until each reports `target`
    pub fn new(target: PlaybackState, children: impl IntoIterator<Item = Id>) -> Self {
        Self {
            target,
            awaiting: children.into_iter().collect(),
        }
    }

    /// The state every child must reach
    pub fn target(&self) -> PlaybackState {
        self.target
    }

    /// Record a child report; returns `true` if it matched the target
    pub fn report(&mut self, child: Id, state: PlaybackState) -> bool {
        if state != self.target {
            tracing::debug!(?child, %state, target = %self.target, "ignoring stale playback report");
            return false;
        }
        self.awaiting.remove(&child)
    }

    /// Stop waiting for a child that died or was removed
    pub fn forget(&mut self, child: Id) {
        self.awaiting.remove(&child);
    }

    /// All children have acknowledged the target state
    pub fn is_done(&self) -> bool {
        self.awaiting.is_empty()
    }
}
