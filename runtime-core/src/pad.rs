//! Pad model and link bookkeeping
//!
//! Each actor owns a [`PadRegistry`]: static pad descriptors declared at
//! startup plus the live pads instantiated from them (dynamic pads are
//! minted on request with a generated instance id). The registry is the
//! local half of the link resolver: it hands out pad references, records
//! peers at link time, checks caps compatibility and keeps the per-pad
//! flow-control counters.

use crate::actor::{ActorId, MailboxSender};
use crate::data::{Buffer, Caps};
use crate::error::{Error, Result};
use crate::spec::LinkOptions;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use uuid::Uuid;

/// Direction of data flow through a pad
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadDirection {
    /// Receives buffers from a peer output pad
    Input,
    /// Produces buffers towards a peer input pad
    Output,
}

impl PadDirection {
    /// The direction a peer pad must have
    pub fn opposite(self) -> PadDirection {
        match self {
            PadDirection::Input => PadDirection::Output,
            PadDirection::Output => PadDirection::Input,
        }
    }
}

/// Flow-control mode of a link, chosen at pad-definition time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadMode {
    /// Demand-driven: buffers flow only against outstanding demand
    Pull,
    /// Fire-and-forget delivery with no backpressure signal
    Push,
}

/// Whether a pad exists for the actor's lifetime or is minted on request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadAvailability {
    /// Instantiated at startup, lives as long as the actor
    Always,
    /// A fresh instance is created per `get_pad_ref` request
    OnRequest,
}

/// Static pad descriptor declared by an element or bin
///
/// Built with the constructor helpers rather than a declarative macro:
/// `PadSpec::input("in").with_caps(...)`.
#[derive(Debug, Clone)]
pub struct PadSpec {
    /// Pad (or template) name, unique within the actor
    pub name: String,
    /// Data flow direction
    pub direction: PadDirection,
    /// Flow-control mode
    pub mode: PadMode,
    /// Accepted data shape
    pub caps: Caps,
    /// Static or dynamic availability
    pub availability: PadAvailability,
}

impl PadSpec {
    /// New always-available pull-mode input pad
    pub fn input(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: PadDirection::Input,
            mode: PadMode::Pull,
            caps: Caps::Any,
            availability: PadAvailability::Always,
        }
    }

    /// New always-available pull-mode output pad
    pub fn output(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: PadDirection::Output,
            mode: PadMode::Pull,
            caps: Caps::Any,
            availability: PadAvailability::Always,
        }
    }

    /// Switch the pad to push mode
    pub fn push(mut self) -> Self {
        self.mode = PadMode::Push;
        self
    }

    /// Make the pad a dynamic template instantiated per request
    pub fn on_request(mut self) -> Self {
        self.availability = PadAvailability::OnRequest;
        self
    }

    /// Constrain the accepted data shape
    pub fn with_caps(mut self, caps: Caps) -> Self {
        self.caps = caps;
        self
    }
}

/// Reference to a live pad on some actor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PadRef {
    /// Name of the pad (template name for dynamic pads)
    pub name: String,
    /// Instance id, present only for dynamic pads
    pub instance: Option<Uuid>,
}

impl PadRef {
    /// Reference to a static pad
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance: None,
        }
    }

    /// Reference to a dynamic pad instance
    pub fn instance(name: impl Into<String>, id: Uuid) -> Self {
        Self {
            name: name.into(),
            instance: Some(id),
        }
    }
}

impl fmt::Display for PadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.instance {
            Some(id) => write!(f, "{}:{}", self.name, id),
            None => f.write_str(&self.name),
        }
    }
}

/// Pad descriptor info exchanged between two linking peers
#[derive(Debug, Clone)]
pub struct PadInfo {
    /// Direction the pad presents to its peer
    pub direction: PadDirection,
    /// Flow-control mode
    pub mode: PadMode,
    /// Accepted data shape
    pub caps: Caps,
}

/// Live endpoint of the peer across a link
#[derive(Debug, Clone)]
pub struct Peer {
    /// Actor that owns the peer pad
    pub actor: ActorId,
    /// The peer's pad reference
    pub pad: PadRef,
    /// Mailbox of the peer's actor
    pub tx: MailboxSender,
}

/// Runtime state of one live pad
#[derive(Debug)]
pub struct PadState {
    /// Data flow direction
    pub direction: PadDirection,
    /// Flow-control mode
    pub mode: PadMode,
    /// Accepted data shape
    pub caps: Caps,
    /// Whether this pad was minted from an `OnRequest` template
    pub dynamic: bool,
    /// Peer endpoint, set once linked
    pub peer: Option<Peer>,
    /// Pull input: demand window maintained against the upstream peer
    pub preferred_size: usize,
    /// Pull input: buffers requested upstream but not yet received
    pub outstanding: usize,
    /// Pull output: demand received from downstream, not yet satisfied
    pub demand: i64,
    /// Output: buffers produced but not yet deliverable (no demand, or
    /// sync barrier still closed)
    pub queued: VecDeque<Buffer>,
    /// Output: start-of-stream already sent to the peer
    pub sos_sent: bool,
    /// Input: start-of-stream already observed
    pub sos_seen: bool,
    /// Terminal end-of-stream flag
    pub eos: bool,
    /// Output: end-of-stream requested but not yet delivered (queued
    /// buffers must drain first)
    pub pending_eos: bool,
}

impl PadState {
    fn new(spec: &PadSpec, dynamic: bool) -> Self {
        Self {
            direction: spec.direction,
            mode: spec.mode,
            caps: spec.caps.clone(),
            dynamic,
            peer: None,
            preferred_size: LinkOptions::default().preferred_size,
            outstanding: 0,
            demand: 0,
            queued: VecDeque::new(),
            sos_sent: false,
            sos_seen: false,
            eos: false,
            pending_eos: false,
        }
    }

    /// Descriptor info presented to a linking peer
    pub fn info(&self) -> PadInfo {
        PadInfo {
            direction: self.direction,
            mode: self.mode,
            caps: self.caps.clone(),
        }
    }
}

/// Per-actor registry of pad templates and live pads
#[derive(Debug)]
pub struct PadRegistry {
    templates: HashMap<String, PadSpec>,
    pads: HashMap<PadRef, PadState>,
}

impl PadRegistry {
    /// Build a registry from static descriptors
    ///
    /// `Always` pads are instantiated immediately; `OnRequest` templates
    /// wait for `get_pad_ref`. Duplicate or empty names are rejected.
    pub fn new(specs: Vec<PadSpec>) -> Result<Self> {
        let mut templates = HashMap::new();
        let mut pads = HashMap::new();
        for spec in specs {
            if spec.name.is_empty() {
                return Err(Error::InvalidChildSpec("pad name must not be empty".into()));
            }
            if templates.contains_key(&spec.name) {
                return Err(Error::InvalidChildSpec(format!(
                    "duplicate pad name {}",
                    spec.name
                )));
            }
            if spec.availability == PadAvailability::Always {
                pads.insert(PadRef::new(&spec.name), PadState::new(&spec, false));
            }
            templates.insert(spec.name.clone(), spec);
        }
        Ok(Self { templates, pads })
    }

    /// Resolve a symbolic pad request into a live pad reference
    ///
    /// Dynamic templates mint a fresh instance when no id is given; the
    /// returned flag reports whether a pad was created by this call.
    pub fn get_pad_ref(
        &mut self,
        name: &str,
        instance: Option<Uuid>,
    ) -> Result<(PadRef, PadInfo, bool)> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| Error::UnknownPad(name.to_string()))?;

        match (template.availability, instance) {
            (PadAvailability::Always, None) => {
                let pad_ref = PadRef::new(name);
                let info = self.pads[&pad_ref].info();
                Ok((pad_ref, info, false))
            }
            (PadAvailability::Always, Some(_)) => Err(Error::UnknownPad(format!(
                "{name} is static and has no instances"
            ))),
            (PadAvailability::OnRequest, Some(id)) => {
                let pad_ref = PadRef::instance(name, id);
                let state = self
                    .pads
                    .get(&pad_ref)
                    .ok_or_else(|| Error::UnknownPad(pad_ref.to_string()))?;
                Ok((pad_ref, state.info(), false))
            }
            (PadAvailability::OnRequest, None) => {
                let pad_ref = PadRef::instance(name, Uuid::new_v4());
                let state = PadState::new(template, true);
                let info = state.info();
                self.pads.insert(pad_ref.clone(), state);
                Ok((pad_ref, info, true))
            }
        }
    }

    /// Look up a live pad
    pub fn get(&self, pad: &PadRef) -> Result<&PadState> {
        self.pads
            .get(pad)
            .ok_or_else(|| Error::UnknownPad(pad.to_string()))
    }

    /// Look up a live pad mutably
    pub fn get_mut(&mut self, pad: &PadRef) -> Result<&mut PadState> {
        self.pads
            .get_mut(pad)
            .ok_or_else(|| Error::UnknownPad(pad.to_string()))
    }

    /// Record the peer of a pad at link time
    ///
    /// Validates direction opposition, mode symmetry and caps
    /// compatibility, applies the link options and returns the local
    /// descriptor info for the peer's own bookkeeping.
    pub fn handle_link(
        &mut self,
        pad: &PadRef,
        peer: Peer,
        peer_info: &PadInfo,
        options: &LinkOptions,
    ) -> Result<PadInfo> {
        let state = self.get_mut(pad)?;
        if state.peer.is_some() {
            return Err(Error::InvalidChildSpec(format!("pad {pad} is already linked")));
        }
        if peer_info.direction != state.direction.opposite() {
            return Err(Error::InvalidChildSpec(format!(
                "pad {pad} and its peer have the same direction"
            )));
        }
        if peer_info.mode != state.mode {
            return Err(Error::InvalidChildSpec(format!(
                "pad {pad} and its peer use different flow-control modes"
            )));
        }
        if !state.caps.compatible(&peer_info.caps) {
            return Err(Error::CapsIncompatible {
                pad: pad.to_string(),
                peer: peer.pad.to_string(),
            });
        }
        state.preferred_size = options.preferred_size;
        let info = state.info();
        state.peer = Some(peer);
        Ok(info)
    }

    /// Drop the peer of a pad so no further sends are attempted
    ///
    /// Returns `true` if the pad was dynamic and has been removed from
    /// the registry (the owner should fire its pad-removed callback).
    pub fn handle_unlink(&mut self, pad: &PadRef) -> bool {
        if let Some(state) = self.pads.get_mut(pad) {
            state.peer = None;
            if state.dynamic {
                self.pads.remove(pad);
                return true;
            }
        }
        false
    }

    /// Arm initial demand on every linked pull-mode input pad
    ///
    /// Invoked on `linking_finished`, once per spec batch rather than per
    /// link, so no pad starts demanding against a half-wired graph.
    /// Returns the demand messages to send upstream.
    pub fn arm_initial_demands(&mut self) -> Vec<(Peer, usize)> {
        let mut arm = Vec::new();
        for state in self.pads.values_mut() {
            if state.direction == PadDirection::Input
                && state.mode == PadMode::Pull
                && state.outstanding == 0
                && !state.eos
            {
                if let Some(peer) = &state.peer {
                    state.outstanding = state.preferred_size;
                    arm.push((peer.clone(), state.preferred_size));
                }
            }
        }
        arm
    }

    /// All currently linked pads with their peers
    pub fn linked(&self) -> Vec<(PadRef, Peer)> {
        self.pads
            .iter()
            .filter_map(|(r, s)| s.peer.clone().map(|p| (r.clone(), p)))
            .collect()
    }

    /// References of all live output pads
    pub fn output_refs(&self) -> Vec<PadRef> {
        self.pads
            .iter()
            .filter(|(_, s)| s.direction == PadDirection::Output)
            .map(|(r, _)| r.clone())
            .collect()
    }
}
