//! Clock sources, proxying and provider selection
//!
//! A [`Clock`] is an opaque monotonic time source. Parents never hand a
//! provider clock to children directly: children read time through a
//! [`ProxyClock`], a cheap handle onto the parent's [`ClockProxy`]
//! indirection, so that re-pointing the proxy at a new provider is
//! transparent to already-running children.

use crate::error::{Error, Result};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Opaque monotonic time source exposed by a clock-providing element
#[derive(Debug, Clone)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    /// New clock with its origin at the current instant
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Time elapsed since the clock's origin
    pub fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Parent-owned indirection re-pointable at the current provider clock
#[derive(Debug)]
pub struct ClockProxy {
    tx: watch::Sender<Option<Clock>>,
}

impl ClockProxy {
    /// New proxy with no provider selected
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Point the proxy at a new clock (or none)
    pub fn repoint(&self, clock: Option<Clock>) {
        self.tx.send_replace(clock);
    }

    /// Handle for children to read the proxied clock
    pub fn handle(&self) -> ProxyClock {
        ProxyClock {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ClockProxy {
    fn default() -> Self {
        Self::new()
    }
}

/// Child-side read handle onto a parent's clock proxy
#[derive(Debug, Clone)]
pub struct ProxyClock {
    rx: watch::Receiver<Option<Clock>>,
}

impl ProxyClock {
    /// A proxy clock that is never backed by a provider, for tests and
    /// detached actors
    pub fn detached() -> Self {
        let (_tx, rx) = watch::channel(None);
        Self { rx }
    }

    /// Snapshot of the currently proxied clock, if any
    pub fn get(&self) -> Option<Clock> {
        self.rx.borrow().clone()
    }

    /// Current proxied time, if a provider is selected
    pub fn now(&self) -> Option<Duration> {
        self.rx.borrow().as_ref().map(Clock::now)
    }
}

/// How the current clock provider was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockChoice {
    /// Selected automatically from the unique providing child
    Auto,
    /// Explicitly named in a spec; sticky once made
    Manual,
}

/// Parent-side clock provider selection state
#[derive(Debug)]
pub struct ClockSelection {
    /// Currently selected clock, if any
    pub clock: Option<Clock>,
    /// Name of the providing child, if any
    pub provider: Option<String>,
    /// How the selection was made
    pub choice: ClockChoice,
}

impl ClockSelection {
    /// Empty selection (no clock, auto choice)
    pub fn new() -> Self {
        Self {
            clock: None,
            provider: None,
            choice: ClockChoice::Auto,
        }
    }

    /// Resolve the clock provider for one applied spec
    ///
    /// `explicit` is the spec's `clock_provider` entry; `candidates` are
    /// the newly started children that expose a clock. On success the
    /// `proxy` is re-pointed at the selected clock. Selection rules:
    ///
    /// - an explicit provider wins, but re-selecting while a manual
    ///   choice is already in force is a [`Error::ClockProviderConflict`];
    /// - otherwise a unique candidate is auto-selected;
    /// - two or more candidates without an explicit choice conflict;
    /// - no candidates leaves the existing selection untouched.
    pub fn select(
        &mut self,
        explicit: Option<&str>,
        candidates: &[(String, Clock)],
        proxy: &ClockProxy,
    ) -> Result<()> {
        if let Some(name) = explicit {
            if self.choice == ClockChoice::Manual && self.clock.is_some() {
                return Err(Error::ClockProviderConflict(format!(
                    "clock provider already manually set to {}, cannot re-select {}",
                    self.provider.as_deref().unwrap_or("<unknown>"),
                    name
                )));
            }
            let (_, clock) = candidates
                .iter()
                .find(|(n, _)| n == name)
                .ok_or_else(|| {
                    Error::ClockProviderConflict(format!(
                        "clock provider {name} does not expose a clock"
                    ))
                })?;
            tracing::info!(provider = name, "clock provider selected manually");
            self.clock = Some(clock.clone());
            self.provider = Some(name.to_string());
            self.choice = ClockChoice::Manual;
            proxy.repoint(self.clock.clone());
            return Ok(());
        }

        // manual choice is sticky: automatic re-selection is rejected
        if self.choice == ClockChoice::Manual && self.clock.is_some() {
            tracing::debug!("keeping manually selected clock provider");
            return Ok(());
        }

        match candidates {
            [] => Ok(()),
            [(name, clock)] => {
                if self.clock.is_some() {
                    return Err(Error::ClockProviderConflict(format!(
                        "clock already provided by {}, {} also exposes one",
                        self.provider.as_deref().unwrap_or("<unknown>"),
                        name
                    )));
                }
                tracing::info!(provider = %name, "clock provider auto-selected");
                self.clock = Some(clock.clone());
                self.provider = Some(name.clone());
                self.choice = ClockChoice::Auto;
                proxy.repoint(self.clock.clone());
                Ok(())
            }
            many => Err(Error::ClockProviderConflict(format!(
                "multiple children expose a clock ({}) and no provider was chosen",
                many.iter()
                    .map(|(n, _)| n.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }
}

impl Default for ClockSelection {
    fn default() -> Self {
        Self::new()
    }
}
