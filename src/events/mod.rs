//! Inbound push events and their dispatch.
//!
//! Events form a closed set of kinds, each with its own typed payload, so every
//! handler is an exhaustive `match`. Events flow:
//! transport -> `EventQueue` (FIFO) -> `EventHandler` -> cache store / invalidator.

pub mod handler;
pub mod queue;

pub use handler::{CacheEventHandler, PatchPolicy, ResourceSpec};
pub use queue::EventQueue;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::cache::{Item, ItemId};

/// Server-owned collections that push events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Resource {
    Notification,
    Friendship,
    Comment,
}

impl Resource {
    /// Event-name prefix on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Resource::Notification => "notification",
            Resource::Friendship => "friendship",
            Resource::Comment => "comment",
        }
    }

    /// Parse an event-name prefix; plural forms are accepted
    pub fn from_name(name: &str) -> Option<Self> {
        match name.strip_suffix('s').unwrap_or(name) {
            "notification" => Some(Resource::Notification),
            "friendship" => Some(Resource::Friendship),
            "comment" => Some(Resource::Comment),
            _ => None,
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of change carried by an event, with its payload
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// `resource:new`: a new item to prepend (or attach under its parent)
    New { item: Item },
    /// `resource:patch`: new field values for an existing item
    Patch { id: ItemId, fields: Map<String, Value> },
    /// `resource:delete`: item removed server-side
    Delete { id: ItemId },
    /// `resource:counter`: authoritative counter value
    Counter { value: i64 },
    /// `resource:bulk-cleared`: every item resolved, counter zeroed
    BulkCleared,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::New { .. } => "new",
            EventKind::Patch { .. } => "patch",
            EventKind::Delete { .. } => "delete",
            EventKind::Counter { .. } => "counter",
            EventKind::BulkCleared => "bulk-cleared",
        }
    }
}

/// An event received from the push connection
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub resource: Resource,
    pub kind: EventKind,
    /// Scalar payload fields that narrow the target collection (e.g. `movieId`)
    pub scope: BTreeMap<String, String>,
    /// Position in arrival order
    pub arrival_sequence: u64,
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    pub fn new(resource: Resource, kind: EventKind, arrival_sequence: u64) -> Self {
        Self {
            resource,
            kind,
            scope: BTreeMap::new(),
            arrival_sequence,
            received_at: Utc::now(),
        }
    }

    pub fn with_scope(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.scope.insert(name.into(), value.into());
        self
    }

    /// Wire name, e.g. `notification:patch`
    pub fn name(&self) -> String {
        format!("{}:{}", self.resource, self.kind.name())
    }
}

/// Errors raised by event handlers. They are logged at the queue boundary and
/// never reach application code.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("No handler registered for resource {0}")]
    Unregistered(Resource),

    #[error("Event {event} is missing scope parameter {param}")]
    MissingScope { event: String, param: String },

    #[error("Invalid event payload: {0}")]
    InvalidPayload(String),
}

/// Consumer of inbound events
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &InboundEvent) -> Result<(), HandlerError>;
}

impl<F> EventHandler for F
where
    F: Fn(&InboundEvent) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, event: &InboundEvent) -> Result<(), HandlerError> {
        self(event)
    }
}
