//! Spec application: child startup, linking and group wiring
//!
//! A [`GraphSpec`] is consumed in phases: validate, build behaviors,
//! create sync groups, spawn, register watchers, select the clock
//! provider, establish links, signal `linking_finished`, then catch new
//! children up to the parent's playback state. Application is not
//! atomic; a failing phase leaves earlier phases in effect and crashes
//! the owning parent.

use crate::actor::element_task::spawn_element;
use crate::actor::message::{Message, Watcher};
use crate::actor::parent_task::{spawn_parent, ChildEntry, ParentTask};
use crate::actor::{ActorId, MailboxSender};
use crate::clock::Clock;
use crate::element::ChildBehavior;
use crate::error::{Error, Result};
use crate::pad::{PadDirection, PadInfo, PadRef, PadSpec, Peer};
use crate::parent::ParentAction;
use crate::playback::PlaybackState;
use crate::spec::{EndpointSpec, GraphSpec, LinkOptions, LinkSpec, StreamSync};
use crate::sync::{SyncGroup, SyncHandle};
use std::collections::{HashMap, HashSet};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct NewChild {
    name: String,
    behavior: ChildBehavior,
    pads: Vec<PadSpec>,
}

/// One resolved link endpoint: a child's pad or a boundary pad of the
/// applying parent itself
enum Resolved {
    Child {
        id: ActorId,
        tx: MailboxSender,
        pad: PadRef,
        info: PadInfo,
        name: String,
    },
    Boundary {
        pad: PadRef,
        info: PadInfo,
    },
}

impl ParentTask {
    /// Apply one graph spec; returns the actions the behavior's
    /// spec-started callback produced
    pub(super) async fn apply_spec(&mut self, spec: GraphSpec) -> Result<Vec<ParentAction>> {
        let existing: HashSet<String> = self.children.keys().cloned().collect();
        spec.validate(&existing)?;

        // build behaviors up front so descriptors can be sampled before
        // they move into their tasks
        let mut new_children = Vec::new();
        let mut clock_candidates: Vec<(String, Clock)> = Vec::new();
        for child in &spec.children {
            let behavior = self.registry.create(&child.element_type, child.params.clone())?;
            let pads = match &behavior {
                ChildBehavior::Element(element) => {
                    if let Some(clock) = element.provides_clock() {
                        clock_candidates.push((child.name.clone(), clock));
                    }
                    element.static_pads()
                }
                ChildBehavior::Bin(bin) => bin.boundary_pads(),
            };
            new_children.push(NewChild {
                name: child.name.clone(),
                behavior,
                pads,
            });
        }

        let (groups, mut handles) = build_sync_groups(&spec.stream_sync, &new_children)?;

        let mut started = Vec::new();
        for child in new_children {
            let sync = handles.remove(&child.name).unwrap_or_else(SyncHandle::noop);
            let clock = self.clock_proxy.handle();
            let spawned = match child.behavior {
                ChildBehavior::Element(element) => {
                    spawn_element(child.name.clone(), element, clock, sync)?
                }
                ChildBehavior::Bin(bin) => spawn_parent(
                    child.name.clone(),
                    bin,
                    self.registry.clone(),
                    Some(clock),
                    sync,
                    None,
                )?,
            };
            self.monitor_child(spawned.id, child.name.clone(), spawned.join);
            self.child_ids.insert(spawned.id, child.name.clone());
            self.children.insert(
                child.name.clone(),
                ChildEntry {
                    id: spawned.id,
                    tx: spawned.tx,
                },
            );
            tracing::debug!(name = %self.name, child = %child.name, "child started");
            started.push(child.name);
        }

        for name in &started {
            let Some(entry) = self.children.get(name) else { continue };
            let (reply_tx, reply_rx) = oneshot::channel();
            entry
                .tx
                .send(Message::SetWatcher {
                    watcher: Watcher {
                        id: self.id,
                        tx: self.self_tx.clone(),
                    },
                    reply: reply_tx,
                })
                .map_err(|_| Error::ChildCrashed(name.clone()))?;
            reply_rx
                .await
                .map_err(|_| Error::ChildCrashed(name.clone()))?;
        }

        self.clock_selection.select(
            spec.clock_provider.as_deref(),
            &clock_candidates,
            &self.clock_proxy,
        )?;

        let mut touched: HashSet<String> = started.iter().cloned().collect();
        for link in &spec.links {
            self.establish_link(link, &mut touched).await?;
        }
        for name in &touched {
            if let Some(entry) = self.children.get(name) {
                let _ = entry.tx.send(Message::LinkingFinished);
            }
        }

        for group in groups {
            if self.playback.state == PlaybackState::Playing {
                group.activate();
                self.active_groups.push(group);
            } else {
                self.inert_groups.push(group);
            }
        }

        // the spec-started callback runs before new children are pushed
        // to the parent's state
        let actions = self.behavior.handle_spec_started(&started, &self.ctx).await?;

        // children added to a running parent catch up on their own; the
        // parent does not block on their transitions
        if self.playback.state != PlaybackState::Stopped {
            for name in &started {
                if let Some(entry) = self.children.get(name) {
                    let _ = entry
                        .tx
                        .send(Message::ChangePlaybackState(self.playback.state));
                }
            }
        }

        Ok(actions)
    }

    async fn establish_link(&mut self, link: &LinkSpec, touched: &mut HashSet<String>) -> Result<()> {
        let from = self.resolve_endpoint(&link.from).await?;
        let to = self.resolve_endpoint(&link.to).await?;
        match (from, to) {
            (
                Resolved::Child {
                    id: from_id,
                    tx: from_tx,
                    pad: from_pad,
                    info: from_info,
                    name: from_name,
                },
                Resolved::Child {
                    id: to_id,
                    tx: to_tx,
                    pad: to_pad,
                    info: to_info,
                    name: to_name,
                },
            ) => {
                if from_info.direction != PadDirection::Output {
                    return Err(Error::InvalidChildSpec(format!(
                        "link source {from_name}.{from_pad} is not an output pad"
                    )));
                }
                let to_info = call_handle_link(
                    &to_tx,
                    to_pad.clone(),
                    Peer {
                        actor: from_id,
                        pad: from_pad.clone(),
                        tx: from_tx.clone(),
                    },
                    from_info,
                    link.options.clone(),
                )
                .await?;
                call_handle_link(
                    &from_tx,
                    from_pad,
                    Peer {
                        actor: to_id,
                        pad: to_pad,
                        tx: to_tx,
                    },
                    to_info,
                    link.options.clone(),
                )
                .await?;
                touched.insert(from_name);
                touched.insert(to_name);
            }
            (
                Resolved::Boundary {
                    pad: boundary_pad,
                    info: boundary_info,
                },
                Resolved::Child {
                    id,
                    tx,
                    pad: child_pad,
                    info: _,
                    name,
                },
            ) => {
                // data enters the bin here: the input boundary pad acts
                // as the child's upstream output pad
                if boundary_info.direction != PadDirection::Input {
                    return Err(Error::InvalidChildSpec(format!(
                        "boundary pad {boundary_pad} cannot feed data inward"
                    )));
                }
                let presented = PadInfo {
                    direction: PadDirection::Output,
                    mode: boundary_info.mode,
                    caps: boundary_info.caps,
                };
                call_handle_link(
                    &tx,
                    child_pad.clone(),
                    Peer {
                        actor: self.id,
                        pad: boundary_pad.clone(),
                        tx: self.self_tx.clone(),
                    },
                    presented,
                    link.options.clone(),
                )
                .await?;
                self.boundary_inner.insert(
                    boundary_pad.clone(),
                    Peer {
                        actor: id,
                        pad: child_pad,
                        tx,
                    },
                );
                // data that arrived from outside before this inner link
                // existed is waiting on the pad
                self.flush_boundary_inner(&boundary_pad);
                touched.insert(name);
            }
            (
                Resolved::Child {
                    id,
                    tx,
                    pad: child_pad,
                    info: child_info,
                    name,
                },
                Resolved::Boundary {
                    pad: boundary_pad,
                    info: boundary_info,
                },
            ) => {
                if child_info.direction != PadDirection::Output {
                    return Err(Error::InvalidChildSpec(format!(
                        "link source {name}.{child_pad} is not an output pad"
                    )));
                }
                if boundary_info.direction != PadDirection::Output {
                    return Err(Error::InvalidChildSpec(format!(
                        "boundary pad {boundary_pad} cannot carry data outward"
                    )));
                }
                // the output boundary pad acts as the child's downstream
                // input pad
                let presented = PadInfo {
                    direction: PadDirection::Input,
                    mode: boundary_info.mode,
                    caps: boundary_info.caps,
                };
                call_handle_link(
                    &tx,
                    child_pad.clone(),
                    Peer {
                        actor: self.id,
                        pad: boundary_pad.clone(),
                        tx: self.self_tx.clone(),
                    },
                    presented,
                    link.options.clone(),
                )
                .await?;
                self.boundary_inner.insert(
                    boundary_pad.clone(),
                    Peer {
                        actor: id,
                        pad: child_pad,
                        tx,
                    },
                );
                // downstream demand may have been held here while the
                // inner side was still unwired
                self.flush_boundary_inner(&boundary_pad);
                touched.insert(name);
            }
            (Resolved::Boundary { pad, .. }, Resolved::Boundary { .. }) => {
                return Err(Error::InvalidChildSpec(format!(
                    "link connects two boundary pads of the same parent (from {pad})"
                )));
            }
        }
        Ok(())
    }

    async fn resolve_endpoint(&mut self, endpoint: &EndpointSpec) -> Result<Resolved> {
        match &endpoint.child {
            Some(name) => {
                let (id, tx) = {
                    let entry = self
                        .children
                        .get(name)
                        .ok_or_else(|| Error::UnknownChild(name.clone()))?;
                    (entry.id, entry.tx.clone())
                };
                let (reply_tx, reply_rx) = oneshot::channel();
                tx.send(Message::GetPadRef {
                    name: endpoint.pad.clone(),
                    instance: endpoint.instance,
                    reply: reply_tx,
                })
                .map_err(|_| Error::ChildCrashed(name.clone()))?;
                let (pad, info) = reply_rx
                    .await
                    .map_err(|_| Error::ChildCrashed(name.clone()))??;
                Ok(Resolved::Child {
                    id,
                    tx,
                    pad,
                    info,
                    name: name.clone(),
                })
            }
            None => {
                let (pad, info, _created) = self.pads.get_pad_ref(&endpoint.pad, endpoint.instance)?;
                Ok(Resolved::Boundary { pad, info })
            }
        }
    }

    fn monitor_child(&self, id: ActorId, name: String, join: JoinHandle<()>) {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            if let Err(err) = join.await {
                tracing::error!(child = %name, %err, "child task panicked");
            }
            let _ = tx.send(Message::ChildDown { child: id, name });
        });
    }
}

async fn call_handle_link(
    tx: &MailboxSender,
    pad: PadRef,
    peer: Peer,
    peer_info: PadInfo,
    options: LinkOptions,
) -> Result<PadInfo> {
    let target = pad.to_string();
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(Message::HandleLink {
        pad,
        peer,
        peer_info,
        options,
        reply: reply_tx,
    })
    .map_err(|_| Error::LinkDown(format!("actor owning pad {target} is gone")))?;
    reply_rx
        .await
        .map_err(|_| Error::LinkDown(format!("actor owning pad {target} is gone")))?
}

/// Create this spec's sync groups and a handle per grouped child
fn build_sync_groups(
    stream_sync: &StreamSync,
    new_children: &[NewChild],
) -> Result<(Vec<SyncGroup>, HashMap<String, SyncHandle>)> {
    let mut groups = Vec::new();
    let mut handles = HashMap::new();
    match stream_sync {
        StreamSync::None => {}
        StreamSync::Sinks => {
            let sinks: Vec<&NewChild> = new_children
                .iter()
                .filter(|child| {
                    if matches!(child.behavior, ChildBehavior::Bin(_)) {
                        return false;
                    }
                    let has_input = child
                        .pads
                        .iter()
                        .any(|p| p.direction == PadDirection::Input);
                    let has_output = child
                        .pads
                        .iter()
                        .any(|p| p.direction == PadDirection::Output);
                    has_input && !has_output
                })
                .collect();
            if !sinks.is_empty() {
                let group = SyncGroup::new(true);
                for sink in sinks {
                    handles.insert(sink.name.clone(), group.handle());
                }
                groups.push(group);
            }
        }
        StreamSync::Groups(lists) => {
            for members in lists {
                if members.is_empty() {
                    continue;
                }
                let group = SyncGroup::new(true);
                for member in members {
                    let Some(child) = new_children.iter().find(|c| &c.name == member) else {
                        return Err(Error::SyncGroupConflict(format!(
                            "sync group member {member} is not a child of this spec"
                        )));
                    };
                    if matches!(child.behavior, ChildBehavior::Bin(_)) {
                        return Err(Error::SyncGroupConflict(format!(
                            "sync group member {member} is a bin; only elements synchronize"
                        )));
                    }
                    handles.insert(member.clone(), group.handle());
                }
                groups.push(group);
            }
        }
    }
    Ok((groups, handles))
}
