//! Tagged messages delivered to subscribers.

use std::fmt;

use crate::{DerivedSnapshot, EventBatch};

/// Kind of a broadcast message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum MessageKind {
    Metrics,
    Events,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Metrics => "metrics",
            MessageKind::Events => "events",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message body; the variant determines the [`MessageKind`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", content = "data", rename_all = "lowercase"))]
pub enum Payload {
    Metrics(DerivedSnapshot),
    Events(EventBatch),
}

/// A message published for one core.
///
/// Serialized with the `serde` feature as
/// `{"name": <core>, "type": "metrics" | "events", "data": <payload>}`.
///
/// # Example
///
/// ```rust
/// use poolwatch_types::{EventBatch, Message, MessageKind};
///
/// let message = Message::events("core-a", EventBatch::new(vec!["started".into()]));
/// assert_eq!(message.kind(), MessageKind::Events);
/// assert_eq!(message.name, "core-a");
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Message {
    /// Name of the core the payload came from.
    pub name: String,

    #[cfg_attr(feature = "serde", serde(flatten))]
    pub payload: Payload,
}

impl Message {
    pub fn metrics(name: impl Into<String>, snapshot: DerivedSnapshot) -> Self {
        Self {
            name: name.into(),
            payload: Payload::Metrics(snapshot),
        }
    }

    pub fn events(name: impl Into<String>, batch: EventBatch) -> Self {
        Self {
            name: name.into(),
            payload: Payload::Events(batch),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self.payload {
            Payload::Metrics(_) => MessageKind::Metrics,
            Payload::Events(_) => MessageKind::Events,
        }
    }

    /// The derived snapshot, for metrics messages.
    pub fn as_metrics(&self) -> Option<&DerivedSnapshot> {
        match &self.payload {
            Payload::Metrics(snapshot) => Some(snapshot),
            Payload::Events(_) => None,
        }
    }

    /// The event batch, for events messages.
    pub fn as_events(&self) -> Option<&EventBatch> {
        match &self.payload {
            Payload::Events(batch) => Some(batch),
            Payload::Metrics(_) => None,
        }
    }
}
