//! Stream synchronization barriers
//!
//! A [`SyncGroup`] gates a set of children so that none of them emits its
//! first buffer before every member has reported readiness *and* the
//! parent has activated the group (which it does once it is playing).
//! Members interact with the group through a [`SyncHandle`]; children
//! outside any group get a no-op handle that is always open.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

#[derive(Debug)]
struct SyncState {
    members: usize,
    ready: usize,
    active: bool,
    empty_exit: bool,
}

#[derive(Debug)]
struct SyncInner {
    state: Mutex<SyncState>,
    open_tx: watch::Sender<bool>,
}

impl SyncInner {
    fn recheck(&self, state: &SyncState) {
        let open = state.active
            && state.ready >= state.members
            && (state.members > 0 || state.empty_exit);
        if open {
            self.open_tx.send_replace(true);
        }
    }
}

/// Barrier over a set of children that must start emitting together
#[derive(Debug)]
pub struct SyncGroup {
    inner: Arc<SyncInner>,
}

impl SyncGroup {
    /// Create an inert group
    ///
    /// With `empty_exit` set, a group whose members have all been removed
    /// (or that never had any) opens on activation instead of blocking
    /// forever.
    pub fn new(empty_exit: bool) -> Self {
        let (open_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(SyncInner {
                state: Mutex::new(SyncState {
                    members: 0,
                    ready: 0,
                    active: false,
                    empty_exit,
                }),
                open_tx,
            }),
        }
    }

    /// Register a new member and return its handle
    pub fn handle(&self) -> SyncHandle {
        let mut state = self.inner.state.lock().expect("sync state poisoned");
        state.members += 1;
        SyncHandle {
            inner: Some(self.inner.clone()),
            open_rx: self.inner.open_tx.subscribe(),
            reported: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Unblock members once all of them are ready
    ///
    /// Called by the owning parent when it reaches `Playing`; a group
    /// created while the parent was already playing is activated at spec
    /// application time.
    pub fn activate(&self) {
        let mut state = self.inner.state.lock().expect("sync state poisoned");
        state.active = true;
        self.inner.recheck(&state);
    }

    /// Whether the barrier has opened
    pub fn is_open(&self) -> bool {
        *self.inner.open_tx.borrow()
    }
}

/// Per-member handle onto a sync group
#[derive(Debug, Clone)]
pub struct SyncHandle {
    inner: Option<Arc<SyncInner>>,
    open_rx: watch::Receiver<bool>,
    reported: Arc<AtomicBool>,
}

impl SyncHandle {
    /// Handle for children outside any sync group; always open
    pub fn noop() -> Self {
        let (tx, rx) = watch::channel(true);
        drop(tx);
        Self {
            inner: None,
            open_rx: rx,
            reported: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Report this member ready; idempotent
    pub fn ready(&self) {
        if self.reported.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = &self.inner {
            let mut state = inner.state.lock().expect("sync state poisoned");
            state.ready += 1;
            inner.recheck(&state);
        }
    }

    /// Drop this member from the group without blocking the others
    pub fn leave(&self) {
        if let Some(inner) = &self.inner {
            let mut state = inner.state.lock().expect("sync state poisoned");
            state.members = state.members.saturating_sub(1);
            if self.reported.swap(false, Ordering::AcqRel) {
                state.ready = state.ready.saturating_sub(1);
            }
            inner.recheck(&state);
        }
    }

    /// Whether the member may emit data
    pub fn is_open(&self) -> bool {
        *self.open_rx.borrow()
    }

    /// Wait until the barrier opens
    pub async fn wait_open(&mut self) {
        loop {
            if *self.open_rx.borrow_and_update() {
                return;
            }
            // a dropped group cannot gate anyone
            if self.open_rx.changed().await.is_err() {
                return;
            }
        }
    }
}
