//! `NodeId` and the envelope shape every component's wire traffic travels
//! in. Split out of `bus.rs` because every component (`dgp`, `crb`, `gmfd`,
//! `skv`) needs `NodeId` but only the substrate needs the envelope.

use std::{fmt, sync::Arc};

/// Opaque, stable node identifier (spec.md §3). Cheap to clone — every
/// message, stage set, and membership table entry stores one of these by
/// value, so it's backed by `Arc<str>` rather than `String`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(Arc<str>);

impl NodeId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A point-to-point wire delivery as it arrives at the destination's inbox:
/// opaque bytes (spec.md §3: "Messages are opaque bytes to the transport")
/// tagged with the sender, so `on_message(msg, sender_id, ctx)` can be
/// implemented.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: NodeId,
    pub bytes: bytes::Bytes,
}
