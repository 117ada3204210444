//! Parent actor loop, shared by bins and pipelines
//!
//! A parent supervises a set of child actors: it applies graph specs,
//! fans playback transitions out to the children and completes each step
//! only once every child has acknowledged it, selects the clock
//! provider, owns the stream-sync barriers and relays data across its
//! boundary pads (bins only). The top-level pipeline is the same task
//! with an event channel to the embedding application instead of a
//! watcher.

use crate::actor::element_task::SpawnedChild;
use crate::actor::message::{ActorId, MailboxReceiver, MailboxSender, Message, Watcher};
use crate::clock::{ClockProxy, ClockSelection, ProxyClock};
use crate::element::{CallbackContext, ElementRegistry};
use crate::error::{Error, Result};
use crate::pad::{PadDirection, PadRef, PadRegistry, Peer};
use crate::parent::{Parent, ParentAction};
use crate::pipeline::PipelineEvent;
use crate::playback::{PendingChildren, Playback, PlaybackState};
use crate::spec::GraphSpec;
use crate::sync::{SyncGroup, SyncHandle};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Live entry for one supervised child
pub(super) struct ChildEntry {
    pub(super) id: ActorId,
    pub(super) tx: MailboxSender,
}

/// Spawn a parent actor (a bin, or the pipeline when `events` is given)
///
/// With no outer `clock` handle the parent's callbacks read its own
/// proxied clock, which is the pipeline case.
pub(crate) fn spawn_parent(
    name: String,
    behavior: Box<dyn Parent>,
    registry: Arc<ElementRegistry>,
    clock: Option<ProxyClock>,
    sync: SyncHandle,
    events: Option<mpsc::UnboundedSender<PipelineEvent>>,
) -> Result<SpawnedChild> {
    let pads = PadRegistry::new(behavior.boundary_pads())?;
    let clock_proxy = ClockProxy::new();
    let ctx_clock = clock.unwrap_or_else(|| clock_proxy.handle());
    let id = Uuid::new_v4();
    let (tx, rx) = mpsc::unbounded_channel();
    let task = ParentTask {
        id,
        name: name.clone(),
        behavior,
        registry,
        pads,
        boundary_inner: HashMap::new(),
        children: HashMap::new(),
        child_ids: HashMap::new(),
        playback: Playback::new(),
        goal: None,
        pending: None,
        queued_targets: VecDeque::new(),
        ctx: CallbackContext {
            name,
            playback: PlaybackState::Stopped,
            clock: ctx_clock,
        },
        clock_proxy,
        clock_selection: ClockSelection::new(),
        inert_groups: Vec::new(),
        active_groups: Vec::new(),
        sync,
        watcher: None,
        stash: Vec::new(),
        events,
        shutting_down: HashSet::new(),
        removal_pending: HashMap::new(),
        teardown_started: false,
        self_tx: tx.clone(),
        rx,
        running: true,
    };
    let join = tokio::spawn(task.run());
    Ok(SpawnedChild { id, tx, join })
}

pub(super) struct ParentTask {
    pub(super) id: ActorId,
    pub(super) name: String,
    pub(super) behavior: Box<dyn Parent>,
    pub(super) registry: Arc<ElementRegistry>,
    /// Boundary pads, outer side (bins only; empty for pipelines)
    pub(super) pads: PadRegistry,
    /// Inner peer of each boundary pad, set when a spec links to the parent
    pub(super) boundary_inner: HashMap<PadRef, Peer>,
    pub(super) children: HashMap<String, ChildEntry>,
    pub(super) child_ids: HashMap<ActorId, String>,
    pub(super) playback: Playback,
    /// Final state the current transition is heading towards
    goal: Option<PlaybackState>,
    /// Fan-in barrier for the step in flight
    pending: Option<PendingChildren<ActorId>>,
    /// Targets requested while a transition was already in flight
    queued_targets: VecDeque<PlaybackState>,
    pub(super) ctx: CallbackContext,
    pub(super) clock_proxy: ClockProxy,
    pub(super) clock_selection: ClockSelection,
    /// Sync groups waiting for this parent to reach `Playing`
    pub(super) inert_groups: Vec<SyncGroup>,
    pub(super) active_groups: Vec<SyncGroup>,
    /// This parent's own membership in an enclosing sync group
    sync: SyncHandle,
    watcher: Option<Watcher>,
    stash: Vec<Message>,
    events: Option<mpsc::UnboundedSender<PipelineEvent>>,
    /// Children whose controlled shutdown is still in flight
    shutting_down: HashSet<ActorId>,
    /// Children being removed individually, by `RemoveChild`
    removal_pending: HashMap<ActorId, String>,
    teardown_started: bool,
    pub(super) self_tx: MailboxSender,
    rx: MailboxReceiver,
    running: bool,
}

impl ParentTask {
    async fn run(mut self) {
        tracing::debug!(name = %self.name, id = %self.id, "parent actor started");
        match self.behavior.handle_init(&self.ctx).await {
            Ok(spec) => {
                if let Err(err) = self.start_spec(spec).await {
                    self.crash(err).await;
                }
            }
            Err(err) => self.crash(err).await,
        }
        while self.running {
            let Some(msg) = self.rx.recv().await else { break };
            if let Err(err) = self.handle_message(msg).await {
                self.crash(err).await;
            }
        }
        tracing::debug!(name = %self.name, id = %self.id, "parent actor ended");
    }

    async fn start_spec(&mut self, spec: GraphSpec) -> Result<()> {
        let actions = self.apply_spec(spec).await?;
        self.dispatch(actions).await
    }

    async fn handle_message(&mut self, msg: Message) -> Result<()> {
        match msg {
            Message::ChangePlaybackState(target) => self.request_transition(target).await,
            Message::StopAndTerminate => {
                self.playback.terminating = true;
                self.request_transition(PlaybackState::Stopped).await
            }
            Message::ApplySpec(spec) => {
                if self.playback.terminating {
                    tracing::warn!(name = %self.name, "spec ignored while terminating");
                    return Ok(());
                }
                self.start_spec(spec).await
            }
            Message::PlaybackStateChanged { child, state } => {
                if let Some(pending) = &mut self.pending {
                    pending.report(child, state);
                }
                self.recheck_pending().await
            }
            Message::Notification { child_name, payload } => {
                let actions = self
                    .behavior
                    .handle_notification(&child_name, payload.clone(), &self.ctx)
                    .await?;
                self.dispatch(actions).await?;
                // notifications bubble all the way to the pipeline watcher
                if self.events.is_some() {
                    self.send_event(PipelineEvent::Notification {
                        child: child_name,
                        payload,
                    });
                } else {
                    self.send_watcher(Message::Notification { child_name, payload });
                }
                Ok(())
            }
            Message::ElementStartOfStream { child_name, pad } => {
                let actions = self
                    .behavior
                    .handle_element_start_of_stream(&child_name, &pad, &self.ctx)
                    .await?;
                self.dispatch(actions).await?;
                self.send_event(PipelineEvent::StartOfStream {
                    child: child_name,
                    pad,
                });
                Ok(())
            }
            Message::ElementEndOfStream { child_name, pad } => {
                let actions = self
                    .behavior
                    .handle_element_end_of_stream(&child_name, &pad, &self.ctx)
                    .await?;
                self.dispatch(actions).await?;
                self.send_event(PipelineEvent::EndOfStream {
                    child: child_name,
                    pad,
                });
                Ok(())
            }
            Message::ShutdownReady { child } => {
                self.shutting_down.remove(&child);
                // the id stays in removal_pending until the monitor task's
                // ChildDown retires it, so a controlled removal is never
                // mistaken for a crash
                if let Some(name) = self.removal_pending.get(&child).cloned() {
                    self.retire_removed(child, &name).await?;
                }
                self.maybe_finish_teardown().await;
                Ok(())
            }
            Message::ChildDown { child, name } => self.on_child_down(child, name).await,
            Message::Fatal { child_name, error } => {
                tracing::error!(name = %self.name, child = %child_name, %error, "child failed");
                self.emit_fatal(child_name, error);
                self.playback.terminating = true;
                if !self.teardown_started {
                    self.begin_teardown().await;
                }
                Ok(())
            }
            Message::GetPadRef {
                name,
                instance,
                reply,
            } => {
                let res = self
                    .pads
                    .get_pad_ref(&name, instance)
                    .map(|(pad, info, _created)| (pad, info));
                let _ = reply.send(res);
                Ok(())
            }
            Message::HandleLink {
                pad,
                peer,
                peer_info,
                options,
                reply,
            } => {
                let res = self.pads.handle_link(&pad, peer, &peer_info, &options);
                let ok = res.is_ok();
                let _ = reply.send(res);
                if ok {
                    self.flush_boundary(&pad);
                }
                Ok(())
            }
            Message::HandleUnlink { pad } => {
                if self.pads.handle_unlink(&pad) {
                    self.boundary_inner.remove(&pad);
                }
                Ok(())
            }
            // boundary relays; children arm their own demand
            Message::LinkingFinished => Ok(()),
            Message::Buffer { pad, buffer } => {
                match self.relay_target(&pad, false) {
                    Some(peer) => {
                        self.send_peer(&peer, Message::Buffer {
                            pad: peer.pad.clone(),
                            buffer,
                        });
                    }
                    None => {
                        if let Ok(state) = self.pads.get_mut(&pad) {
                            state.queued.push_back(buffer);
                        }
                    }
                }
                Ok(())
            }
            Message::StartOfStream { pad } => {
                match self.relay_target(&pad, false) {
                    Some(peer) => {
                        self.send_peer(&peer, Message::StartOfStream {
                            pad: peer.pad.clone(),
                        });
                        if let Ok(state) = self.pads.get_mut(&pad) {
                            state.sos_sent = true;
                        }
                    }
                    None => {
                        if let Ok(state) = self.pads.get_mut(&pad) {
                            state.sos_seen = true;
                        }
                    }
                }
                Ok(())
            }
            Message::EndOfStream { pad } => {
                match self.relay_target(&pad, false) {
                    Some(peer) => {
                        self.send_peer(&peer, Message::EndOfStream {
                            pad: peer.pad.clone(),
                        });
                    }
                    None => {
                        if let Ok(state) = self.pads.get_mut(&pad) {
                            state.pending_eos = true;
                        }
                    }
                }
                Ok(())
            }
            Message::Demand { pad, size } => {
                match self.relay_target(&pad, true) {
                    Some(peer) => {
                        self.send_peer(&peer, Message::Demand {
                            pad: peer.pad.clone(),
                            size,
                        });
                    }
                    None => {
                        // hold demand until the missing side gets linked
                        if let Ok(state) = self.pads.get_mut(&pad) {
                            state.demand = state.demand.saturating_add(size as i64);
                        }
                    }
                }
                Ok(())
            }
            Message::SetWatcher { watcher, reply } => {
                self.watcher = Some(watcher);
                for msg in std::mem::take(&mut self.stash) {
                    self.send_watcher(msg);
                }
                let _ = reply.send(());
                Ok(())
            }
            Message::Other(payload) => {
                let actions = self.behavior.handle_other(payload, &self.ctx).await?;
                self.dispatch(actions).await
            }
            Message::SyncOpen => Ok(()),
        }
    }

    /// Evaluate parent actions, iteratively so nested specs do not recurse
    pub(super) async fn dispatch(&mut self, actions: Vec<ParentAction>) -> Result<()> {
        let mut queue: VecDeque<ParentAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                ParentAction::Forward { child, message } => {
                    let Some(entry) = self.children.get(&child) else {
                        tracing::warn!(parent = %self.name, %child, "forward to unknown child dropped");
                        continue;
                    };
                    if entry.tx.send(Message::Other(message)).is_err() {
                        tracing::warn!(parent = %self.name, %child, "forward to closed child mailbox dropped");
                    }
                }
                ParentAction::Spec(spec) => {
                    let more = self.apply_spec(spec).await?;
                    queue.extend(more);
                }
                ParentAction::RemoveChild(names) => {
                    for name in names {
                        self.remove_child(&name)?;
                    }
                    // a removed child may have been the last one a
                    // transition step was still waiting on
                    Box::pin(self.recheck_pending()).await?;
                }
                ParentAction::Notify(payload) => {
                    let name = self.name.clone();
                    if self.events.is_some() {
                        self.send_event(PipelineEvent::Notification {
                            child: name,
                            payload,
                        });
                    } else {
                        self.send_watcher(Message::Notification {
                            child_name: name,
                            payload,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Start a controlled removal; the name stays occupied until the
    /// child reports shutdown-ready
    fn remove_child(&mut self, name: &str) -> Result<()> {
        let entry = self
            .children
            .get(name)
            .ok_or_else(|| Error::UnknownChild(name.to_string()))?;
        let id = entry.id;
        if self.removal_pending.contains_key(&id) {
            tracing::debug!(name = %self.name, child = name, "removal already in flight");
            return Ok(());
        }
        let _ = entry.tx.send(Message::StopAndTerminate);
        self.removal_pending.insert(id, name.to_string());
        if let Some(pending) = &mut self.pending {
            pending.forget(id);
        }
        tracing::debug!(name = %self.name, child = name, "removing child");
        Ok(())
    }

    /// Free a removed child's name and tell the behavior about it
    ///
    /// Id-checked so a successor that already reused the name is never
    /// touched; runs once, from whichever of `ShutdownReady` and
    /// `ChildDown` gets processed first.
    async fn retire_removed(&mut self, child: ActorId, name: &str) -> Result<()> {
        if self.children.get(name).map_or(true, |e| e.id != child) {
            return Ok(());
        }
        self.children.remove(name);
        self.child_ids.remove(&child);
        tracing::debug!(name = %self.name, child = name, "removed child shut down");
        if self.playback.terminating || self.teardown_started {
            return Ok(());
        }
        let actions = self.behavior.handle_child_removed(name, &self.ctx).await?;
        self.dispatch(actions).await
    }

    /// Complete the step in flight once every remaining child, after
    /// reports and removals, has acknowledged it
    async fn recheck_pending(&mut self) -> Result<()> {
        let done = match &self.pending {
            Some(pending) if pending.is_done() => Some(pending.target()),
            _ => None,
        };
        if let Some(step) = done {
            self.pending = None;
            self.playback.pending = None;
            self.complete_step(step).await?;
            self.advance().await?;
        }
        Ok(())
    }

    async fn request_transition(&mut self, target: PlaybackState) -> Result<()> {
        if self.pending.is_some() || self.goal.is_some() {
            self.queued_targets.push_back(target);
            return Ok(());
        }
        self.goal = Some(target);
        self.advance().await
    }

    /// Drive the transition towards the current goal, one step at a time
    ///
    /// Stops early when a step fans out to children; the matching fan-in
    /// (`PlaybackStateChanged` reports) resumes it.
    async fn advance(&mut self) -> Result<()> {
        loop {
            let Some(goal) = self.goal else { break };
            match self.playback.state.step_towards(goal) {
                None => {
                    self.goal = self.queued_targets.pop_front();
                    if self.goal.is_none() {
                        break;
                    }
                }
                Some(next) => {
                    let old = self.playback.state;
                    let actions = self.behavior.handle_playback(old, next, &self.ctx).await?;
                    self.dispatch(actions).await?;
                    // children mid-removal are already on their way out
                    // and take no further part in transitions
                    let ids: Vec<ActorId> = self
                        .children
                        .values()
                        .map(|c| c.id)
                        .filter(|id| !self.removal_pending.contains_key(id))
                        .collect();
                    if ids.is_empty() {
                        self.complete_step(next).await?;
                        continue;
                    }
                    for entry in self.children.values() {
                        if self.removal_pending.contains_key(&entry.id) {
                            continue;
                        }
                        let _ = entry.tx.send(Message::ChangePlaybackState(next));
                    }
                    self.playback.pending = Some(next);
                    self.pending = Some(PendingChildren::new(next, ids));
                    break;
                }
            }
        }
        if self.goal.is_none()
            && self.pending.is_none()
            && self.playback.state == PlaybackState::Stopped
            && self.playback.terminating
            && !self.teardown_started
        {
            self.begin_teardown().await;
        }
        Ok(())
    }

    /// One step became stable for this parent and all of its children
    async fn complete_step(&mut self, next: PlaybackState) -> Result<()> {
        let old = self.playback.state;
        self.playback.state = next;
        self.ctx.playback = next;
        let actions = self
            .behavior
            .handle_playback_changed(old, next, &self.ctx)
            .await?;
        self.dispatch(actions).await?;
        tracing::info!(name = %self.name, %old, %next, "playback state changed");
        if self.events.is_some() {
            self.send_event(PipelineEvent::PlaybackChanged(next));
        } else {
            let id = self.id;
            self.send_watcher(Message::PlaybackStateChanged { child: id, state: next });
        }
        if next == PlaybackState::Playing {
            for group in self.inert_groups.drain(..) {
                group.activate();
                self.active_groups.push(group);
            }
            self.sync.ready();
        }
        Ok(())
    }

    async fn on_child_down(&mut self, child: ActorId, name: String) -> Result<()> {
        self.shutting_down.remove(&child);
        if self.removal_pending.remove(&child).is_some() {
            tracing::debug!(name = %self.name, child = %name, "removed child task ended");
            // shutdown-ready normally freed the name already; a child
            // that died without reporting is retired here instead
            self.retire_removed(child, &name).await?;
            self.recheck_pending().await?;
            self.maybe_finish_teardown().await;
            return Ok(());
        }
        if self.teardown_started || self.playback.terminating {
            if self.children.get(&name).map_or(false, |e| e.id == child) {
                self.children.remove(&name);
            }
            self.child_ids.remove(&child);
            self.maybe_finish_teardown().await;
            return Ok(());
        }
        // an unsupervised exit is fatal for the whole parent
        if self.children.get(&name).map_or(false, |e| e.id == child) {
            self.children.remove(&name);
        }
        self.child_ids.remove(&child);
        if let Some(pending) = &mut self.pending {
            pending.forget(child);
        }
        Err(Error::ChildCrashed(name))
    }

    async fn begin_teardown(&mut self) {
        self.teardown_started = true;
        self.shutting_down = self.children.values().map(|c| c.id).collect();
        for entry in self.children.values() {
            let _ = entry.tx.send(Message::StopAndTerminate);
        }
        tracing::debug!(name = %self.name, children = self.shutting_down.len(), "tearing down");
        self.maybe_finish_teardown().await;
    }

    async fn maybe_finish_teardown(&mut self) {
        if !self.teardown_started || !self.shutting_down.is_empty() {
            return;
        }
        if let Err(err) = self.behavior.handle_shutdown("terminated").await {
            tracing::warn!(name = %self.name, %err, "shutdown callback failed");
        }
        for (_, peer) in self.pads.linked() {
            let _ = peer.tx.send(Message::HandleUnlink {
                pad: peer.pad.clone(),
            });
        }
        self.children.clear();
        self.child_ids.clear();
        self.sync.leave();
        if self.events.is_some() {
            self.send_event(PipelineEvent::Terminated);
        } else {
            let id = self.id;
            self.send_watcher(Message::ShutdownReady { child: id });
        }
        self.running = false;
    }

    async fn crash(&mut self, err: Error) {
        tracing::error!(name = %self.name, %err, "parent failed, tearing down children");
        let name = self.name.clone();
        self.emit_fatal(name, err.to_string());
        self.playback.terminating = true;
        if !self.teardown_started {
            self.begin_teardown().await;
        }
    }

    /// Where a boundary message must be forwarded
    ///
    /// Data (buffers, stream markers) entering an input boundary pad goes
    /// inward and leaving an output boundary pad goes outward; demand
    /// travels the opposite way on both.
    fn relay_target(&self, pad: &PadRef, demand: bool) -> Option<Peer> {
        let Ok(state) = self.pads.get(pad) else {
            tracing::warn!(name = %self.name, %pad, "message for unknown boundary pad");
            return None;
        };
        let inward = matches!(
            (state.direction, demand),
            (PadDirection::Input, false) | (PadDirection::Output, true)
        );
        if inward {
            self.boundary_inner.get(pad).cloned()
        } else {
            state.peer.clone()
        }
    }

    /// Deliver whatever accumulated on a boundary pad before its outer
    /// side was linked
    fn flush_boundary(&mut self, pad: &PadRef) {
        let Ok(state) = self.pads.get_mut(pad) else { return };
        let Some(peer) = state.peer.clone() else { return };
        match state.direction {
            PadDirection::Input => {
                if state.demand > 0 {
                    let size = state.demand as usize;
                    state.demand = 0;
                    let _ = peer.tx.send(Message::Demand {
                        pad: peer.pad.clone(),
                        size,
                    });
                }
            }
            PadDirection::Output => {
                if state.sos_seen && !state.sos_sent {
                    state.sos_sent = true;
                    let _ = peer.tx.send(Message::StartOfStream {
                        pad: peer.pad.clone(),
                    });
                }
                while let Some(buffer) = state.queued.pop_front() {
                    let _ = peer.tx.send(Message::Buffer {
                        pad: peer.pad.clone(),
                        buffer,
                    });
                }
                if state.pending_eos {
                    state.pending_eos = false;
                    let _ = peer.tx.send(Message::EndOfStream {
                        pad: peer.pad.clone(),
                    });
                }
            }
        }
    }

    /// Deliver whatever accumulated on a boundary pad before its inner
    /// side was linked
    ///
    /// The mirror image of [`flush_boundary`](Self::flush_boundary):
    /// data held on an input pad and demand held on an output pad both
    /// travel inward, to the peer just recorded in `boundary_inner`.
    pub(super) fn flush_boundary_inner(&mut self, pad: &PadRef) {
        let Some(inner) = self.boundary_inner.get(pad).cloned() else { return };
        let Ok(state) = self.pads.get_mut(pad) else { return };
        match state.direction {
            PadDirection::Input => {
                if state.sos_seen && !state.sos_sent {
                    state.sos_sent = true;
                    let _ = inner.tx.send(Message::StartOfStream {
                        pad: inner.pad.clone(),
                    });
                }
                while let Some(buffer) = state.queued.pop_front() {
                    let _ = inner.tx.send(Message::Buffer {
                        pad: inner.pad.clone(),
                        buffer,
                    });
                }
                if state.pending_eos {
                    state.pending_eos = false;
                    let _ = inner.tx.send(Message::EndOfStream {
                        pad: inner.pad.clone(),
                    });
                }
            }
            PadDirection::Output => {
                if state.demand > 0 {
                    let size = state.demand as usize;
                    state.demand = 0;
                    let _ = inner.tx.send(Message::Demand {
                        pad: inner.pad.clone(),
                        size,
                    });
                }
            }
        }
    }

    fn send_peer(&self, peer: &Peer, msg: Message) {
        if peer.tx.send(msg).is_err() {
            tracing::warn!(name = %self.name, peer = %peer.pad, "peer mailbox closed");
        }
    }

    fn send_event(&self, event: PipelineEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn send_watcher(&mut self, msg: Message) {
        match &self.watcher {
            Some(watcher) => {
                if watcher.tx.send(msg).is_err() {
                    tracing::warn!(name = %self.name, "watcher mailbox closed");
                }
            }
            None => self.stash.push(msg),
        }
    }

    fn emit_fatal(&mut self, child: String, error: String) {
        if self.events.is_some() {
            self.send_event(PipelineEvent::Fatal { child, error });
        } else {
            self.send_watcher(Message::Fatal {
                child_name: child,
                error,
            });
        }
    }
}
