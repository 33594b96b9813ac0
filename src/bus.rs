//! The "host runtime" of spec.md §1/§3: a point-to-point message substrate
//! that may lose, delay (up to `max_delay` time units), duplicate, or
//! reorder any send, plus registration of per-node inboxes.
//!
//! Grounded on `net/session.rs`'s `Udp::send`, which already spawns one
//! fire-and-forget delayed task per outgoing datagram ("a broken error
//! propagation here... by definition `SendMessage` is one-way"); `Bus::send`
//! does the same and additionally rolls the loss/duplicate dice real UDP
//! already provides for free over an actual wire.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::trace;

use crate::{
    node::{Envelope, NodeId},
    time::Clock,
};

#[derive(Debug, Clone, Copy)]
pub struct BusConfig {
    /// Upper bound on delivery delay, in time units (spec.md: `MAX_DELAY`).
    pub max_delay_time_units: f64,
    /// Probability in `[0, 1]` that a given send is dropped entirely.
    pub loss_rate: f64,
    /// Probability in `[0, 1]` that a given send is additionally delivered
    /// a second time, independently delayed.
    pub duplicate_rate: f64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_delay_time_units: 3.0,
            loss_rate: 0.0,
            duplicate_rate: 0.0,
        }
    }
}

struct Shared {
    inboxes: Mutex<HashMap<NodeId, UnboundedSender<Envelope>>>,
    rng: Mutex<StdRng>,
    config: BusConfig,
    clock: Clock,
}

/// Cheaply clonable handle to the shared substrate. Every node holds one.
#[derive(Clone)]
pub struct Bus(Arc<Shared>);

impl Bus {
    pub fn new(config: BusConfig, clock: Clock, seed: u64) -> Self {
        Self(Arc::new(Shared {
            inboxes: Mutex::new(HashMap::new()),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            config,
            clock,
        }))
    }

    /// Registers `id`'s inbox, returning the receiving end the node's
    /// `Session` polls. Re-registering the same id replaces the previous
    /// inbox (the old receiver is simply abandoned), matching how a
    /// restarted node rejoins under the same identity.
    pub fn register(&self, id: NodeId) -> UnboundedReceiver<Envelope> {
        let (sender, receiver) = unbounded_channel();
        self.0.inboxes.lock().unwrap().insert(id, sender);
        receiver
    }

    pub fn deregister(&self, id: &NodeId) {
        self.0.inboxes.lock().unwrap().remove(id);
    }

    /// Point-to-point send per spec.md §3: "may be lost, delayed up to
    /// `MAX_DELAY`, reordered, or duplicated". A destination with no
    /// registered inbox (never joined, or departed) behaves exactly like an
    /// always-lost send — no error is raised, since from the sender's
    /// perspective an unreachable peer and an unlucky coin flip are
    /// indistinguishable.
    pub fn send(&self, from: NodeId, to: NodeId, bytes: bytes::Bytes) {
        let copies = if self.roll(self.0.config.duplicate_rate) {
            2
        } else {
            1
        };
        for _ in 0..copies {
            if self.roll(self.0.config.loss_rate) {
                trace!(%from, %to, "bus: dropped by simulated loss");
                continue;
            }
            let delay = self.0.clock.duration(
                self.0.rng.lock().unwrap().gen_range(0.0..=self.0.config.max_delay_time_units),
            );
            let shared = self.0.clone();
            let envelope = Envelope {
                from: from.clone(),
                bytes: bytes.clone(),
            };
            let to = to.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(sender) = shared.inboxes.lock().unwrap().get(&to) {
                    // a closed receiver means the node has shut down; dropping the
                    // envelope is the correct behavior, same as a lost packet.
                    let _ = sender.send(envelope);
                }
            });
        }
    }

    fn roll(&self, probability: f64) -> bool {
        if probability <= 0.0 {
            return false;
        }
        self.0.rng.lock().unwrap().gen_bool(probability.min(1.0))
    }

    pub fn clock(&self) -> Clock {
        self.0.clock
    }
}
