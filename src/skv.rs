//! Sharded KV router (spec.md §4.4): consistent-hash ring with virtual
//! nodes, `GET`/`PUT`/`DELETE` routing, and online rebalancing on
//! `NODE_ADDED`/`NODE_REMOVED`.
//!
//! Grounded on `StorageNode` in `original_source/7-kv-sharding/solution.py`
//! for the ring construction, routing, and transfer-on-rebalance sequence.
//! Two redesigns relative to the reference, both resolving Open Questions
//! spec.md §9 leaves explicit:
//! - **Topology sharing.** The reference keeps the permutation and
//!   vnode-ownership tables as mutable class statics shared by every
//!   `StorageNode` instance in the process. Per the teacher crate's own
//!   Design Notes ("Re-architect as an explicit immutable `RingTopology`
//!   value ... passed by shared-read reference to every node"), this is an
//!   explicit `RingTopology` built once and handed to every node as
//!   `Arc<RingTopology>`.
//! - **Key hashing.** The reference hashes keys with Python's
//!   process-salted `hash()`, which is not reproducible across processes.
//!   This uses SHA-256 of the UTF-8 key bytes (low 8 bytes, little-endian,
//!   mod `R`), reusing the crate's existing `sha2` dependency.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use rand::{seq::SliceRandom, SeedableRng};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    event::{OnEvent, SendEvent, Timer},
    node::NodeId,
    transport::SendTo,
};

pub const N: usize = 100;
pub const K: usize = 1000;
pub const RING_SIZE: usize = N * K;

/// Ring position, `[0, RING_SIZE)`.
pub type Pos = u64;

/// Immutable, once-built ring: a permutation of `[0, RING_SIZE)` assigning
/// `K` contiguous permuted positions to each of `N` logical slots. Shared
/// via `Arc` by every node in a test or deployment, replacing the
/// reference's process-wide mutable statics.
pub struct RingTopology {
    /// `owner_of_vnode[pos] = logical slot index owning that ring position`,
    /// indexed by position directly (a `Vec`, not a sparse map, since every
    /// position in `[0, RING_SIZE)` is assigned exactly once up front).
    owner_of_vnode: Vec<usize>,
    /// `slot_positions[i]` = the `K` ring positions assigned to logical slot
    /// `i`, unsorted; used to look up a newly-joining node's vnodes.
    slot_positions: Vec<Vec<Pos>>,
}

impl RingTopology {
    /// Builds the permutation deterministically from `seed`, matching the
    /// reference's `random.shuffle(permutation)` step but with an injected
    /// RNG per the crate's "random choice determinism" convention instead
    /// of unseeded process randomness.
    pub fn new(seed: u64) -> Self {
        let mut permutation: Vec<Pos> = (0..RING_SIZE as Pos).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        permutation.shuffle(&mut rng);

        let mut owner_of_vnode = vec![0usize; RING_SIZE];
        let mut slot_positions = vec![Vec::with_capacity(K); N];
        for slot in 0..N {
            for j in 0..K {
                let pos = permutation[slot * K + j];
                owner_of_vnode[pos as usize] = slot;
                slot_positions[slot].push(pos);
            }
        }
        Self {
            owner_of_vnode,
            slot_positions,
        }
    }

    /// The logical slot index owning a given key's hash position. `slot`
    /// here is an index into `[0, N)`; callers map it to a `NodeId` via
    /// whatever convention assigns logical slots to nodes (the reference
    /// uses the decimal string of the slot index as the node id).
    fn slot_of_key(&self, key: &str) -> usize {
        let pos = hash_key(key);
        self.owner_of_vnode[pos as usize]
    }

    fn vnodes_of_slot(&self, slot: usize) -> &[Pos] {
        &self.slot_positions[slot]
    }
}

/// SHA-256 of the UTF-8 key bytes, low 8 bytes as little-endian `u64`, mod
/// `RING_SIZE`.
fn hash_key(key: &str) -> Pos {
    let digest = Sha256::digest(key.as_bytes());
    let mut low8 = [0u8; 8];
    low8.copy_from_slice(&digest[24..32]);
    u64::from_le_bytes(low8) % RING_SIZE as u64
}

/// The *active* subset of ring positions: those whose owning slot currently
/// has a live node. Routing walks this, not the full permutation, so a key
/// always lands on a node that's actually present (spec.md §4.4: "a
/// position maps to the owner whose virtual node is the smallest position
/// `>= pos` in the active subset, wrapping").
#[derive(Default)]
struct ActiveRing {
    /// Sorted positions currently owned by a live node.
    positions: Vec<Pos>,
}

impl ActiveRing {
    fn insert_slot(&mut self, topology: &RingTopology, slot: usize) {
        for &pos in topology.vnodes_of_slot(slot) {
            if let Err(index) = self.positions.binary_search(&pos) {
                self.positions.insert(index, pos);
            }
        }
    }

    fn remove_slot(&mut self, topology: &RingTopology, slot: usize) {
        for &pos in topology.vnodes_of_slot(slot) {
            if let Ok(index) = self.positions.binary_search(&pos) {
                self.positions.remove(index);
            }
        }
    }

    /// Returns the ring position (not the slot) a key routes to. Caller
    /// looks up `owner_of_vnode[pos]` for the owning slot.
    fn route(&self, pos: Pos) -> Option<Pos> {
        if self.positions.is_empty() {
            return None;
        }
        if pos < self.positions[0] {
            return Some(self.positions[0]);
        }
        // binary search for the largest position <= pos.
        match self.positions.binary_search(&pos) {
            Ok(index) => Some(self.positions[index]),
            Err(index) => Some(self.positions[index - 1]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    GetFrom { requester: NodeId, key: String },
    GetResp { key: String, value: Option<String> },
    PutFrom { requester: NodeId, key: String, value: String },
    PutResp { key: String, value: String },
    DeleteFrom { requester: NodeId, key: String },
    DeleteResp { key: String, value: Option<String> },
    TransferKeys { entries: HashMap<String, String> },
}

#[derive(Debug)]
pub enum Event {
    Get(String),
    Put(String, String),
    Delete(String),
    NodeAdded(NodeId),
    NodeRemoved(NodeId),
    CountRecords,
    DumpKeys,
    Recv(Message),
}

/// Local upcalls delivered to the user (spec.md §4.4 response table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Get { key: String, value: Option<String> },
    Put { key: String, value: String },
    Delete { key: String, value: Option<String> },
    CountRecords { count: usize },
    DumpKeys { keys: Vec<String> },
}

/// A request whose target key currently has no owner (spec.md §7: refused
/// with a `NO_OWNER` upcall rather than silently dropped or panicking).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoOwner;

impl std::fmt::Display for NoOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "requested key has no owner: active membership is empty")
    }
}

impl std::error::Error for NoOwner {}

/// Maps a logical ring slot index to the `NodeId` currently assigned to it.
/// The reference uses the decimal string of the slot index directly as the
/// node id; this crate keeps the ring slot-indexed but lets node ids be
/// arbitrary strings, so this table is the explicit link between the two.
pub type SlotAssignment = HashMap<NodeId, usize>;

pub struct Node<N, U> {
    id: NodeId,
    topology: Arc<RingTopology>,
    slot_of: SlotAssignment,
    own_slot: usize,
    active: ActiveRing,
    members: std::collections::HashSet<NodeId>,
    data: BTreeMap<String, String>,
    net: N,
    upcall: U,
}

impl<N, U> Node<N, U> {
    /// `slot_of` assigns every initially-known member (including `self`) a
    /// logical ring slot; `own_slot` is this node's own assignment.
    pub fn new(
        id: NodeId,
        own_slot: usize,
        topology: Arc<RingTopology>,
        slot_of: SlotAssignment,
        initial_members: impl IntoIterator<Item = NodeId>,
        net: N,
        upcall: U,
    ) -> Self {
        let mut active = ActiveRing::default();
        let members: std::collections::HashSet<NodeId> = initial_members.into_iter().collect();
        for member in &members {
            if let Some(&slot) = slot_of.get(member) {
                active.insert_slot(&topology, slot);
            }
        }
        Self {
            id,
            topology,
            slot_of,
            own_slot,
            active,
            members,
            data: BTreeMap::new(),
            net,
            upcall,
        }
    }

    pub fn record_count(&self) -> usize {
        self.data.len()
    }

    fn owner_of_key(&self, key: &str) -> Option<NodeId> {
        let topology = &self.topology;
        let pos = hash_key(key);
        let owning_pos = self.active.route(pos)?;
        let slot = topology.owner_of_vnode[owning_pos as usize];
        self.slot_of
            .iter()
            .find(|(_, &s)| s == slot)
            .map(|(node, _)| node.clone())
    }
}

impl<N: SendTo<Message>, U: SendEvent<Reply>> Node<N, U> {
    fn route_or_serve(
        &mut self,
        key: String,
        local: impl FnOnce(&mut Self, String) -> anyhow::Result<()>,
        forward: impl FnOnce(&mut Self, NodeId, String) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let Some(owner) = self.owner_of_key(&key) else {
            anyhow::bail!(NoOwner);
        };
        if owner == self.id {
            local(self, key)
        } else {
            forward(self, owner, key)
        }
    }
}

impl<N: SendTo<Message>, U: SendEvent<Reply>> OnEvent<Event> for Node<N, U> {
    fn on_event(&mut self, event: Event, _timer: &mut dyn Timer<Event>) -> anyhow::Result<()> {
        match event {
            Event::Get(key) => self.route_or_serve(
                key,
                |this, key| {
                    let value = this.data.get(&key).cloned();
                    this.upcall.send(Reply::Get { key, value })
                },
                |this, owner, key| {
                    this.net.send_to(
                        owner,
                        Message::GetFrom {
                            requester: this.id.clone(),
                            key,
                        },
                    )
                },
            )?,
            Event::Put(key, value) => {
                let Some(owner) = self.owner_of_key(&key) else {
                    anyhow::bail!(NoOwner);
                };
                if owner == self.id {
                    self.data.insert(key.clone(), value.clone());
                    self.upcall.send(Reply::Put { key, value })?;
                } else {
                    self.net.send_to(
                        owner,
                        Message::PutFrom {
                            requester: self.id.clone(),
                            key,
                            value,
                        },
                    )?;
                }
            }
            Event::Delete(key) => self.route_or_serve(
                key,
                |this, key| {
                    let value = this.data.remove(&key);
                    this.upcall.send(Reply::Delete { key, value })
                },
                |this, owner, key| {
                    this.net.send_to(
                        owner,
                        Message::DeleteFrom {
                            requester: this.id.clone(),
                            key,
                        },
                    )
                },
            )?,
            Event::NodeAdded(node) => {
                if self.members.contains(&node) {
                    return Ok(());
                }
                self.members.insert(node.clone());
                let Some(&slot) = self.slot_of.get(&node) else {
                    anyhow::bail!("node {node} joined with no assigned ring slot");
                };
                self.active.insert_slot(&self.topology, slot);

                let mut transfer = HashMap::new();
                for key in self.data.keys().cloned().collect::<Vec<_>>() {
                    if self.owner_of_key(&key).as_ref() == Some(&node) {
                        if let Some(value) = self.data.remove(&key) {
                            transfer.insert(key, value);
                        }
                    }
                }
                if !transfer.is_empty() {
                    self.net.send_to(node, Message::TransferKeys { entries: transfer })?;
                }
            }
            Event::NodeRemoved(node) => {
                if !self.members.contains(&node) {
                    return Ok(());
                }
                if node == self.id && self.members.len() == 1 {
                    // refusing to empty active_vnodes: every future route
                    // lookup would then have no owner (spec.md §7, §8).
                    anyhow::bail!("refusing to remove the sole remaining node");
                }
                self.members.remove(&node);
                let Some(&slot) = self.slot_of.get(&node) else {
                    anyhow::bail!("node {node} left with no assigned ring slot");
                };
                // every node independently drops the departing slot from its
                // own active ring (the reference relies on one shared static
                // instead, since this crate gives each node its own copy of
                // the active subset, every member must apply the update,
                // not only the node that's leaving).
                self.active.remove_slot(&self.topology, slot);
                if node != self.id {
                    return Ok(());
                }

                let mut transfers: HashMap<NodeId, HashMap<String, String>> = HashMap::new();
                for key in self.data.keys().cloned().collect::<Vec<_>>() {
                    let Some(new_owner) = self.owner_of_key(&key) else {
                        anyhow::bail!(NoOwner);
                    };
                    if let Some(value) = self.data.remove(&key) {
                        transfers.entry(new_owner).or_default().insert(key, value);
                    }
                }
                for (target, entries) in transfers {
                    self.net.send_to(target, Message::TransferKeys { entries })?;
                }
            }
            Event::CountRecords => {
                self.upcall.send(Reply::CountRecords { count: self.data.len() })?;
            }
            Event::DumpKeys => {
                self.upcall.send(Reply::DumpKeys {
                    keys: self.data.keys().cloned().collect(),
                })?;
            }
            Event::Recv(message) => self.on_message(message)?,
        }
        Ok(())
    }
}

impl<N: SendTo<Message>, U: SendEvent<Reply>> Node<N, U> {
    fn on_message(&mut self, message: Message) -> anyhow::Result<()> {
        match message {
            Message::GetFrom { requester, key } => {
                let value = self.data.get(&key).cloned();
                self.net.send_to(requester, Message::GetResp { key, value })?;
            }
            Message::GetResp { key, value } => {
                self.upcall.send(Reply::Get { key, value })?;
            }
            Message::PutFrom { requester, key, value } => {
                self.data.insert(key.clone(), value.clone());
                self.net.send_to(requester, Message::PutResp { key, value })?;
            }
            Message::PutResp { key, value } => {
                self.upcall.send(Reply::Put { key, value })?;
            }
            Message::DeleteFrom { requester, key } => {
                let value = self.data.remove(&key);
                self.net.send_to(requester, Message::DeleteResp { key, value })?;
            }
            Message::DeleteResp { key, value } => {
                self.upcall.send(Reply::Delete { key, value })?;
            }
            Message::TransferKeys { entries } => {
                self.data.extend(entries);
            }
        }
        Ok(())
    }
}
