//! The network-facing half of a node's `Context` (spec.md §3: `send(msg,
//! dest_id)`). Every component's wire `Message` is a closed, typed enum (per
//! the "replacing dynamic dispatch" design note) rather than the reference's
//! duck-typed dict, so `SendTo` is generic over that enum instead of carrying
//! a single concrete message type.

use serde::Serialize;

use crate::{bus::Bus, node::NodeId};

pub trait SendTo<M> {
    fn send_to(&mut self, to: NodeId, message: M) -> anyhow::Result<()>;
}

/// Adapts the untyped [`Bus`] to a component's typed `Message` enum via
/// `bincode`, matching the wire-encoding idiom used for all outbound traffic
/// in the upstream net stack (`bincode::options().serialize`).
#[derive(Clone)]
pub struct BusNet<M> {
    bus: Bus,
    from: NodeId,
    _message: std::marker::PhantomData<fn(M)>,
}

impl<M> BusNet<M> {
    pub fn new(bus: Bus, from: NodeId) -> Self {
        Self {
            bus,
            from,
            _message: std::marker::PhantomData,
        }
    }
}

impl<M: Serialize> SendTo<M> for BusNet<M> {
    fn send_to(&mut self, to: NodeId, message: M) -> anyhow::Result<()> {
        let bytes = bincode::serialize(&message)?;
        self.bus.send(self.from.clone(), to, bytes.into());
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// In-memory `SendTo` that just records what was sent, for unit tests
    /// that want to assert on outgoing messages without a real `Bus`.
    #[derive(Clone, Default)]
    pub struct RecordingNet<M>(pub Rc<RefCell<Vec<(NodeId, M)>>>);

    impl<M: Clone> SendTo<M> for RecordingNet<M> {
        fn send_to(&mut self, to: NodeId, message: M) -> anyhow::Result<()> {
            self.0.borrow_mut().push((to, message));
            Ok(())
        }
    }
}
