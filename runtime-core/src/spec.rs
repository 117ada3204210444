//! Declarative graph specs
//!
//! A [`GraphSpec`] describes children to instantiate and links to
//! establish, plus optional stream-sync grouping and an explicit clock
//! provider. Specs are consumed once by the children controller and
//! discarded; they are not retained state. Spec application is not
//! atomic: children started before a later step fails keep running while
//! the error crashes the owning actor.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use uuid::Uuid;

/// Default pull-mode demand window, in buffers
pub const DEFAULT_PREFERRED_SIZE: usize = 10;

/// Per-link flow-control options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkOptions {
    /// Pull mode: how many buffers the downstream pad keeps on demand
    #[serde(default = "default_preferred_size")]
    pub preferred_size: usize,
}

fn default_preferred_size() -> usize {
    DEFAULT_PREFERRED_SIZE
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            preferred_size: DEFAULT_PREFERRED_SIZE,
        }
    }
}

/// One end of a declared link, still symbolic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointSpec {
    /// Owning child name; `None` addresses the parent's own boundary pad
    /// (bins only)
    pub child: Option<String>,

    /// Pad (or template) name on the owning actor
    pub pad: String,

    /// Existing dynamic pad instance to reuse, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<Uuid>,
}

impl EndpointSpec {
    /// Endpoint on a child's pad
    pub fn child(name: impl Into<String>, pad: impl Into<String>) -> Self {
        Self {
            child: Some(name.into()),
            pad: pad.into(),
            instance: None,
        }
    }

    /// Endpoint on the parent bin's own boundary pad
    pub fn parent(pad: impl Into<String>) -> Self {
        Self {
            child: None,
            pad: pad.into(),
            instance: None,
        }
    }

    /// Address a specific dynamic pad instance
    pub fn with_instance(mut self, id: Uuid) -> Self {
        self.instance = Some(id);
        self
    }
}

/// A declared link between two endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSpec {
    /// Upstream endpoint (output pad, or a bin input boundary pad)
    pub from: EndpointSpec,
    /// Downstream endpoint (input pad, or a bin output boundary pad)
    pub to: EndpointSpec,
    /// Flow-control options for this link
    #[serde(default)]
    pub options: LinkOptions,
}

/// A declared child: name, element type tag and user options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildSpec {
    /// Child name, unique within the parent
    pub name: String,
    /// Type tag resolved through the element registry
    pub element_type: String,
    /// Opaque user options passed to the child's `handle_init`
    #[serde(default)]
    pub params: Value,
}

/// Stream-sync grouping of a spec's children
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamSync {
    /// No synchronization
    #[default]
    None,
    /// Shorthand: all sink-type children of this spec share one group
    Sinks,
    /// Explicit list of groups, each a list of child names
    Groups(Vec<Vec<String>>),
}

/// A declarative graph fragment consumed by the children controller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSpec {
    /// Children to instantiate
    #[serde(default)]
    pub children: Vec<ChildSpec>,

    /// Links to establish once all children are started
    #[serde(default)]
    pub links: Vec<LinkSpec>,

    /// Synchronization barriers over this spec's children
    #[serde(default)]
    pub stream_sync: StreamSync,

    /// Explicitly designated clock-providing child
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock_provider: Option<String>,
}

impl GraphSpec {
    /// Empty spec
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a child
    pub fn child(
        mut self,
        name: impl Into<String>,
        element_type: impl Into<String>,
        params: Value,
    ) -> Self {
        self.children.push(ChildSpec {
            name: name.into(),
            element_type: element_type.into(),
            params,
        });
        self
    }

    /// Declare a link with default options
    pub fn link(self, from: EndpointSpec, to: EndpointSpec) -> Self {
        self.link_with(from, to, LinkOptions::default())
    }

    /// Declare a link with explicit options
    pub fn link_with(mut self, from: EndpointSpec, to: EndpointSpec, options: LinkOptions) -> Self {
        self.links.push(LinkSpec { from, to, options });
        self
    }

    /// Set the stream-sync grouping
    pub fn stream_sync(mut self, sync: StreamSync) -> Self {
        self.stream_sync = sync;
        self
    }

    /// Designate the clock-providing child
    pub fn clock_provider(mut self, name: impl Into<String>) -> Self {
        self.clock_provider = Some(name.into());
        self
    }

    /// Parse a spec from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Structural validation against the parent's registered children
    ///
    /// Checks name uniqueness (within the spec and against `existing`),
    /// endpoint shape, sync-group membership and the clock provider
    /// reference. Resolution of names to live pads happens later, in the
    /// children controller.
    pub fn validate(&self, existing: &HashSet<String>) -> Result<()> {
        let mut declared: HashSet<&str> = HashSet::new();
        for child in &self.children {
            if child.name.is_empty() {
                return Err(Error::InvalidChildSpec("child name must not be empty".into()));
            }
            if child.element_type.is_empty() {
                return Err(Error::InvalidChildSpec(format!(
                    "child {} has an empty element type",
                    child.name
                )));
            }
            if existing.contains(&child.name) || !declared.insert(child.name.as_str()) {
                return Err(Error::DuplicateChildName(child.name.clone()));
            }
        }

        for link in &self.links {
            for endpoint in [&link.from, &link.to] {
                if endpoint.pad.is_empty() {
                    return Err(Error::InvalidChildSpec("link pad name must not be empty".into()));
                }
                if let Some(child) = &endpoint.child {
                    if !declared.contains(child.as_str()) && !existing.contains(child) {
                        return Err(Error::UnknownChild(child.clone()));
                    }
                }
            }
        }

        if let StreamSync::Groups(groups) = &self.stream_sync {
            let mut seen: HashSet<&str> = HashSet::new();
            for group in groups {
                for member in group {
                    if !declared.contains(member.as_str()) {
                        return Err(Error::SyncGroupConflict(format!(
                            "sync group member {member} is not a child of this spec"
                        )));
                    }
                    if !seen.insert(member.as_str()) {
                        return Err(Error::SyncGroupConflict(format!(
                            "{member} appears in more than one sync group"
                        )));
                    }
                }
            }
        }

        if let Some(provider) = &self.clock_provider {
            if !declared.contains(provider.as_str()) && !existing.contains(provider) {
                return Err(Error::UnknownChild(provider.clone()));
            }
        }

        Ok(())
    }
}
