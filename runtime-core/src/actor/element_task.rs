//! Element actor loop
//!
//! Each element runs as its own tokio task: a mailbox, the boxed
//! behavior, a pad registry and the playback record. The loop executes
//! behavior-returned actions against the pads, enforcing demand
//! accounting, start/end-of-stream sequencing and sync gating on the
//! way out.

use crate::actor::message::{ActorId, MailboxReceiver, MailboxSender, Message, Watcher};
use crate::clock::ProxyClock;
use crate::data::Buffer;
use crate::element::{CallbackContext, Element, ElementAction};
use crate::error::{Error, Result};
use crate::pad::{PadDirection, PadMode, PadRef, PadRegistry, Peer};
use crate::playback::{Playback, PlaybackState};
use crate::sync::SyncHandle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Handle to a freshly spawned child actor
pub(crate) struct SpawnedChild {
    pub id: ActorId,
    pub tx: MailboxSender,
    pub join: JoinHandle<()>,
}

/// Spawn an element actor; fails fast on malformed pad descriptors
pub(crate) fn spawn_element(
    name: String,
    element: Box<dyn Element>,
    clock: ProxyClock,
    sync: SyncHandle,
) -> Result<SpawnedChild> {
    let pads = PadRegistry::new(element.static_pads())?;
    let id = Uuid::new_v4();
    let (tx, rx) = mpsc::unbounded_channel();
    let task = ElementTask {
        id,
        name: name.clone(),
        element,
        pads,
        playback: Playback::new(),
        ctx: CallbackContext {
            name,
            playback: PlaybackState::Stopped,
            clock,
        },
        watcher: None,
        stash: Vec::new(),
        sync,
        sync_waiter: false,
        pending_arm: false,
        self_tx: tx.clone(),
        rx,
        running: true,
    };
    let join = tokio::spawn(task.run());
    Ok(SpawnedChild { id, tx, join })
}

struct ElementTask {
    id: ActorId,
    name: String,
    element: Box<dyn Element>,
    pads: PadRegistry,
    playback: Playback,
    ctx: CallbackContext,
    watcher: Option<Watcher>,
    /// Watcher-bound messages produced before the watcher was set
    stash: Vec<Message>,
    sync: SyncHandle,
    sync_waiter: bool,
    /// Initial demand deferred until the element plays and its sync
    /// barrier opens
    pending_arm: bool,
    self_tx: MailboxSender,
    rx: MailboxReceiver,
    running: bool,
}

impl ElementTask {
    async fn run(mut self) {
        tracing::debug!(name = %self.name, id = %self.id, "element actor started");
        match self.element.handle_init(&self.ctx).await {
            Ok(actions) => {
                if let Err(err) = self.run_actions(actions) {
                    self.fatal(err);
                }
            }
            Err(err) => self.fatal(err),
        }
        while self.running {
            let Some(msg) = self.rx.recv().await else { break };
            if let Err(err) = self.handle_message(msg).await {
                self.fatal(err);
            }
        }
        tracing::debug!(name = %self.name, id = %self.id, "element actor ended");
    }

    async fn handle_message(&mut self, msg: Message) -> Result<()> {
        match msg {
            Message::ChangePlaybackState(target) => self.change_state(target).await,
            Message::StopAndTerminate => {
                self.playback.terminating = true;
                self.change_state(PlaybackState::Stopped).await
            }
            Message::GetPadRef {
                name,
                instance,
                reply,
            } => {
                match self.pads.get_pad_ref(&name, instance) {
                    Ok((pad_ref, info, created)) => {
                        let _ = reply.send(Ok((pad_ref.clone(), info)));
                        if created {
                            let actions = self.element.handle_pad_added(&pad_ref, &self.ctx).await?;
                            self.run_actions(actions)?;
                        }
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                }
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
                let _ = reply.send(res);
                Ok(())
            }
            Message::HandleUnlink { pad } => {
                if self.pads.handle_unlink(&pad) {
                    let actions = self.element.handle_pad_removed(&pad, &self.ctx).await?;
                    self.run_actions(actions)?;
                }
                Ok(())
            }
            Message::LinkingFinished => {
                // no demand before Playing; data must not move while the
                // element is stopped or merely prepared
                self.pending_arm = true;
                self.maybe_arm();
                Ok(())
            }
            Message::Demand { pad, size } => self.on_demand(pad, size).await,
            Message::Buffer { pad, buffer } => self.on_buffer(pad, buffer).await,
            Message::StartOfStream { pad } => self.on_start_of_stream(pad).await,
            Message::EndOfStream { pad } => self.on_end_of_stream(pad).await,
            Message::SyncOpen => {
                self.maybe_arm();
                self.flush_all_outputs()
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
                let actions = self.element.handle_other(payload, &self.ctx).await?;
                self.run_actions(actions)
            }
            other => {
                tracing::debug!(name = %self.name, ?other, "element ignoring parent-only message");
                Ok(())
            }
        }
    }

    async fn change_state(&mut self, target: PlaybackState) -> Result<()> {
        while let Some(next) = self.playback.state.step_towards(target) {
            let old = self.playback.state;
            let actions = self.element.handle_playback(old, next, &self.ctx).await?;
            self.run_actions(actions)?;
            self.playback.state = next;
            self.ctx.playback = next;
            let actions = self
                .element
                .handle_playback_changed(old, next, &self.ctx)
                .await?;
            self.run_actions(actions)?;
            tracing::debug!(name = %self.name, %old, %next, "element playback state changed");
            if next == PlaybackState::Playing {
                self.sync.ready();
                self.maybe_arm();
                self.flush_all_outputs()?;
            }
            // the step is acknowledged only once flow is fully started,
            // so anything sent to peers above precedes the report
            let id = self.id;
            self.send_watcher(Message::PlaybackStateChanged { child: id, state: next });
        }
        if self.playback.state == PlaybackState::Stopped && self.playback.terminating {
            self.shutdown().await?;
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.element.handle_shutdown("terminated").await?;
        // proactively unlink so peers drop their dangling references
        for (_, peer) in self.pads.linked() {
            let _ = peer.tx.send(Message::HandleUnlink {
                pad: peer.pad.clone(),
            });
        }
        self.sync.leave();
        let id = self.id;
        self.send_watcher(Message::ShutdownReady { child: id });
        self.running = false;
        Ok(())
    }

    async fn on_demand(&mut self, pad: PadRef, size: usize) -> Result<()> {
        let edge = {
            let Ok(state) = self.pads.get_mut(&pad) else {
                tracing::warn!(name = %self.name, %pad, "demand for unknown pad");
                return Ok(());
            };
            if state.direction != PadDirection::Output {
                tracing::warn!(name = %self.name, %pad, "demand on a non-output pad");
                return Ok(());
            }
            if state.eos {
                tracing::debug!(name = %self.name, %pad, "demand after end-of-stream ignored");
                return Ok(());
            }
            let old = state.demand;
            state.demand = old.saturating_add(size as i64);
            (old <= 0 && state.demand > 0).then_some(state.demand.max(0) as usize)
        };
        if let Some(total) = edge {
            let actions = self.element.handle_demand(&pad, total, &self.ctx).await?;
            self.run_actions(actions)?;
        }
        self.try_flush(&pad)
    }

    async fn on_buffer(&mut self, pad: PadRef, buffer: Buffer) -> Result<()> {
        let first = {
            let Ok(state) = self.pads.get_mut(&pad) else {
                tracing::warn!(name = %self.name, %pad, "buffer for unknown pad, dropping");
                return Ok(());
            };
            if state.direction != PadDirection::Input {
                tracing::warn!(name = %self.name, %pad, "buffer on a non-input pad, dropping");
                return Ok(());
            }
            if state.eos {
                tracing::warn!(name = %self.name, %pad, "buffer after end-of-stream, dropping");
                return Ok(());
            }
            state.outstanding = state.outstanding.saturating_sub(1);
            let first = !state.sos_seen;
            state.sos_seen = true;
            first
        };
        if first {
            self.notify_start_of_stream(&pad).await?;
        }
        let actions = self.element.handle_buffer(&pad, buffer, &self.ctx).await?;
        self.run_actions(actions)?;

        // top the demand window back up
        let top_up = {
            let Ok(state) = self.pads.get_mut(&pad) else { return Ok(()) };
            if state.mode == PadMode::Pull && !state.eos {
                let deficit = state.preferred_size.saturating_sub(state.outstanding);
                let peer = state.peer.clone();
                match (peer, deficit) {
                    (Some(peer), d) if d > 0 => {
                        state.outstanding += d;
                        Some((peer, d))
                    }
                    _ => None,
                }
            } else {
                None
            }
        };
        if let Some((peer, size)) = top_up {
            self.send_peer(
                &peer,
                Message::Demand {
                    pad: peer.pad.clone(),
                    size,
                },
            );
        }
        Ok(())
    }

    async fn on_start_of_stream(&mut self, pad: PadRef) -> Result<()> {
        let first = {
            let Ok(state) = self.pads.get_mut(&pad) else { return Ok(()) };
            if state.direction != PadDirection::Input || state.sos_seen {
                return Ok(());
            }
            state.sos_seen = true;
            true
        };
        if first {
            self.notify_start_of_stream(&pad).await?;
        }
        Ok(())
    }

    async fn on_end_of_stream(&mut self, pad: PadRef) -> Result<()> {
        {
            let Ok(state) = self.pads.get_mut(&pad) else { return Ok(()) };
            if state.direction != PadDirection::Input {
                tracing::warn!(name = %self.name, %pad, "end-of-stream on a non-input pad");
                return Ok(());
            }
            if state.eos {
                tracing::warn!(name = %self.name, %pad, "duplicate end-of-stream ignored");
                return Ok(());
            }
            state.eos = true;
            // flush still-pending demand as a no-op
            state.outstanding = 0;
        }
        let actions = self.element.handle_end_of_stream(&pad, &self.ctx).await?;
        self.run_actions(actions)?;
        let name = self.name.clone();
        self.send_watcher(Message::ElementEndOfStream {
            child_name: name,
            pad,
        });
        Ok(())
    }

    async fn notify_start_of_stream(&mut self, pad: &PadRef) -> Result<()> {
        let actions = self.element.handle_start_of_stream(pad, &self.ctx).await?;
        self.run_actions(actions)?;
        let name = self.name.clone();
        self.send_watcher(Message::ElementStartOfStream {
            child_name: name,
            pad: pad.clone(),
        });
        Ok(())
    }

    fn run_actions(&mut self, actions: Vec<ElementAction>) -> Result<()> {
        for action in actions {
            match action {
                ElementAction::Buffer { pad, buffer } => {
                    {
                        let state = self.pads.get_mut(&pad)?;
                        if state.direction != PadDirection::Output {
                            return Err(Error::InvalidAction(format!(
                                "buffer action targets non-output pad {pad}"
                            )));
                        }
                        if state.eos {
                            return Err(Error::CallbackBadReturn(format!(
                                "buffer produced after end-of-stream on {pad}"
                            )));
                        }
                        state.queued.push_back(buffer);
                    }
                    self.try_flush(&pad)?;
                }
                ElementAction::Demand { pad, size } => {
                    let send = {
                        let state = self.pads.get_mut(&pad)?;
                        if state.direction != PadDirection::Input
                            || state.mode != PadMode::Pull
                        {
                            return Err(Error::InvalidAction(format!(
                                "demand action targets non-pull-input pad {pad}"
                            )));
                        }
                        state.peer.clone().map(|peer| {
                            state.outstanding += size;
                            peer
                        })
                    };
                    if let Some(peer) = send {
                        self.send_peer(
                            &peer,
                            Message::Demand {
                                pad: peer.pad.clone(),
                                size,
                            },
                        );
                    }
                }
                ElementAction::EndOfStream { pad } => {
                    {
                        let state = self.pads.get_mut(&pad)?;
                        if state.direction != PadDirection::Output {
                            return Err(Error::InvalidAction(format!(
                                "end_of_stream action targets non-output pad {pad}"
                            )));
                        }
                        if state.eos {
                            return Err(Error::CallbackBadReturn(format!(
                                "end_of_stream returned twice for {pad}"
                            )));
                        }
                        state.eos = true;
                        state.pending_eos = true;
                    }
                    self.try_flush(&pad)?;
                }
                ElementAction::Notify(payload) => {
                    let name = self.name.clone();
                    self.send_watcher(Message::Notification {
                        child_name: name,
                        payload,
                    });
                }
            }
        }
        Ok(())
    }

    /// Deliver queued buffers on an output pad as far as demand, the
    /// playback state and the sync barrier allow, then a pending
    /// end-of-stream if fully drained
    ///
    /// Below `Playing` everything stays queued; re-entering `Playing`
    /// flushes all outputs again.
    fn try_flush(&mut self, pad: &PadRef) -> Result<()> {
        if self.playback.state != PlaybackState::Playing {
            return Ok(());
        }
        if !self.sync.is_open() {
            self.ensure_sync_waiter();
            return Ok(());
        }
        let Ok(state) = self.pads.get_mut(pad) else { return Ok(()) };
        if state.direction != PadDirection::Output {
            return Ok(());
        }
        let Some(peer) = state.peer.clone() else { return Ok(()) };

        let mut link_down = false;
        while !state.queued.is_empty() {
            if state.mode == PadMode::Pull && state.demand <= 0 {
                break;
            }
            if !state.sos_sent {
                state.sos_sent = true;
                if peer
                    .tx
                    .send(Message::StartOfStream {
                        pad: peer.pad.clone(),
                    })
                    .is_err()
                {
                    link_down = true;
                    break;
                }
            }
            let Some(buffer) = state.queued.pop_front() else { break };
            if state.mode == PadMode::Pull {
                state.demand -= 1;
            }
            if peer
                .tx
                .send(Message::Buffer {
                    pad: peer.pad.clone(),
                    buffer,
                })
                .is_err()
            {
                link_down = true;
                break;
            }
        }

        if !link_down && state.queued.is_empty() && state.pending_eos {
            state.pending_eos = false;
            if peer
                .tx
                .send(Message::EndOfStream {
                    pad: peer.pad.clone(),
                })
                .is_err()
            {
                link_down = true;
            }
        }
        if link_down {
            tracing::warn!(name = %self.name, %pad, "peer mailbox closed, dropping link");
            state.peer = None;
        }
        Ok(())
    }

    /// Arm initial demand once the element is playing and its barrier,
    /// if any, is open
    fn maybe_arm(&mut self) {
        if !self.pending_arm || self.playback.state != PlaybackState::Playing {
            return;
        }
        if !self.sync.is_open() {
            self.ensure_sync_waiter();
            return;
        }
        self.pending_arm = false;
        for (peer, size) in self.pads.arm_initial_demands() {
            self.send_peer(
                &peer,
                Message::Demand {
                    pad: peer.pad.clone(),
                    size,
                },
            );
        }
    }

    fn flush_all_outputs(&mut self) -> Result<()> {
        for pad in self.pads.output_refs() {
            self.try_flush(&pad)?;
        }
        Ok(())
    }

    fn ensure_sync_waiter(&mut self) {
        if self.sync_waiter {
            return;
        }
        self.sync_waiter = true;
        let mut sync = self.sync.clone();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            sync.wait_open().await;
            let _ = tx.send(Message::SyncOpen);
        });
    }

    fn send_peer(&self, peer: &Peer, msg: Message) {
        if peer.tx.send(msg).is_err() {
            tracing::warn!(name = %self.name, peer = %peer.pad, "peer mailbox closed");
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

    fn fatal(&mut self, err: Error) {
        tracing::error!(name = %self.name, %err, "element failed");
        let name = self.name.clone();
        self.send_watcher(Message::Fatal {
            child_name: name,
            error: err.to_string(),
        });
        self.running = false;
    }
}
