//! Causal Reliable Broadcast (spec.md §4.2): gossip-style broadcast over a
//! small fixed group, delivering each message exactly once and in an order
//! that respects cross-source causal dependencies, via a two-stage
//! peer-knowledge merge plus a holdback queue gated by a vector of
//! per-source delivery counts.
//!
//! Grounded on `BroadcastNode` in `original_source/4-broadcast/solution.py`
//! for the merge/echo/release/forward sequence, and on
//! `neatsys-boson-circuit/src/cops.rs` / `lamport_mutex.rs` for the
//! generic-`Net`/generic-`Upcall` node shape and the "store peer ids, never
//! peer objects" idiom.
//!
//! Two simplifications relative to the reference, both behavior-preserving:
//! - **Identity.** The reference keys all per-message state by the
//!   message's `text`, so two distinct broadcasts with identical text
//!   collide. Per the redesign adopted here, identity is `(source,
//!   source_seq)` instead — a message's position in its source's send
//!   order.
//! - **Counters.** The reference's `self.cnt` (generation count of the
//!   node's own delivered messages) and `self.sent_cnt[self]` are always
//!   incremented together and never diverge; they're merged into the one
//!   `delivered_count` map here, indexed uniformly by source including
//!   `self`. The reference's `received_cnt`/`sent_cnt` vectors (indexed by
//!   every other source) stay exactly as a vector: each `Bcast` carries a
//!   `causal_context` snapshot of its author's `delivered_count` at send
//!   time (the author's own entry set to the message's own seq), and a
//!   message releases only once the local `delivered_count` has caught up
//!   to every entry in that snapshot — not just the message's own source.
//!   This is what makes the broadcast causal rather than merely
//!   reliable-FIFO: a message can depend on deliveries from sources other
//!   than its own author.

use std::collections::{BTreeMap, HashMap, HashSet};

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{
    event::{OnEvent, SendEvent, Timer},
    node::NodeId,
    transport::SendTo,
};

pub type SourceSeq = u64;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId {
    pub source: NodeId,
    pub seq: SourceSeq,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Bcast {
        id: MessageId,
        text: String,
        /// Snapshot of the author's `delivered_count` at send time (the
        /// author's own entry holds this message's own `seq`). A receiver
        /// releases the message only once its local counts have caught up
        /// to every entry here — the causal-dependency gate.
        causal_context: HashMap<NodeId, SourceSeq>,
        first_stage: Vec<NodeId>,
        second_stage: Vec<NodeId>,
    },
}

#[derive(Debug)]
pub enum Event {
    /// Local `SEND{text}` request (spec.md §4.2).
    Submit(String),
    Recv(Message),
}

#[derive(Default, Clone)]
struct Knowledge {
    first_stage: HashSet<NodeId>,
    second_stage: HashSet<NodeId>,
}

pub struct Node<N, U> {
    id: NodeId,
    peers: Vec<NodeId>,
    next_seq: SourceSeq,
    knowledge: HashMap<MessageId, Knowledge>,
    holdback: BTreeMap<MessageId, Message>,
    delivered_count: HashMap<NodeId, SourceSeq>,
    rng: StdRng,
    net: N,
    upcall: U,
}

impl<N, U> Node<N, U> {
    /// `peers` is the full group including `self` (spec.md §3: per-node
    /// `nodes: set<NodeId>` includes the local id), matching the reference's
    /// `self._nodes`.
    pub fn new(id: NodeId, peers: Vec<NodeId>, seed: u64, net: N, upcall: U) -> Self {
        Self {
            id,
            peers,
            next_seq: 0,
            knowledge: HashMap::new(),
            holdback: BTreeMap::new(),
            delivered_count: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
            net,
            upcall,
        }
    }

    pub fn holdback_len(&self) -> usize {
        self.holdback.len()
    }

    /// A message releases once every entry of its `causal_context` has been
    /// caught up to locally: the author's own entry needs one more delivery
    /// from `self` than what's already landed (this message itself), every
    /// other entry needs to already be fully caught up. Entries absent from
    /// the snapshot default to zero and never block release.
    fn releasable(&self, source: &NodeId, causal_context: &HashMap<NodeId, SourceSeq>) -> bool {
        causal_context.iter().all(|(node, &required)| {
            let delivered = self.delivered_count.get(node).copied().unwrap_or(0);
            if node == source {
                delivered + 1 >= required
            } else {
                delivered >= required
            }
        })
    }
}

impl<N: SendTo<Message>, U: SendEvent<String>> OnEvent<Event> for Node<N, U> {
    fn on_event(&mut self, event: Event, _timer: &mut dyn Timer<Event>) -> anyhow::Result<()> {
        match event {
            Event::Submit(text) => {
                self.next_seq += 1;
                let id = MessageId {
                    source: self.id.clone(),
                    seq: self.next_seq,
                };
                let mut causal_context = self.delivered_count.clone();
                causal_context.insert(self.id.clone(), self.next_seq);
                let msg = Message::Bcast {
                    id,
                    text,
                    causal_context,
                    first_stage: vec![self.id.clone()],
                    second_stage: vec![],
                };
                // bootstrap: route the freshly created broadcast through the
                // normal receive path by sending it to ourselves.
                self.net.send_to(self.id.clone(), msg)?;
            }
            Event::Recv(Message::Bcast {
                id,
                text,
                causal_context,
                first_stage,
                second_stage,
            }) => {
                let knowledge = self.knowledge.entry(id.clone()).or_insert_with(|| Knowledge {
                    first_stage: std::iter::once(self.id.clone()).collect(),
                    second_stage: HashSet::new(),
                });

                knowledge.second_stage.extend(second_stage);
                let merged_second = knowledge.second_stage.clone();
                for node in &merged_second {
                    knowledge.first_stage.remove(node);
                }
                knowledge
                    .first_stage
                    .extend(first_stage.into_iter().filter(|node| !merged_second.contains(node)));
                let merged_first = knowledge.first_stage.clone();

                let mut out_first = merged_first.clone();
                let mut out_second = merged_second.clone();

                if out_first.len() + out_second.len() > self.peers.len() / 2
                    && !out_second.contains(&self.id)
                {
                    knowledge.first_stage.remove(&self.id);
                    knowledge.second_stage.insert(self.id.clone());
                    out_first.remove(&self.id);
                    out_second.insert(self.id.clone());
                    self.holdback.insert(
                        id.clone(),
                        Message::Bcast {
                            id: id.clone(),
                            text: text.clone(),
                            causal_context: causal_context.clone(),
                            first_stage: out_first.iter().cloned().collect(),
                            second_stage: out_second.iter().cloned().collect(),
                        },
                    );
                }

                // releasing one entry can unblock another — same-source (the
                // next seq) or cross-source (something whose causal_context
                // depended on this source) — so keep sweeping the holdback
                // queue until a pass releases nothing.
                loop {
                    let releasable_ids: Vec<_> = self
                        .holdback
                        .iter()
                        .filter(|(candidate_id, Message::Bcast { causal_context, .. })| {
                            self.releasable(&candidate_id.source, causal_context)
                        })
                        .map(|(candidate_id, _)| candidate_id.clone())
                        .collect();
                    if releasable_ids.is_empty() {
                        break;
                    }
                    for released_id in releasable_ids {
                        let Message::Bcast { text, .. } =
                            self.holdback.remove(&released_id).expect("key just observed present");
                        *self.delivered_count.entry(released_id.source).or_insert(0) += 1;
                        self.upcall.send(text)?;
                    }
                }

                let mut candidates: Vec<NodeId> = self
                    .peers
                    .iter()
                    .filter(|peer| **peer != self.id && !out_second.contains(peer))
                    .cloned()
                    .collect();
                candidates.shuffle(&mut self.rng);
                let fanout = self.peers.len() / 2 + 1;
                for peer in candidates.into_iter().take(fanout) {
                    self.net.send_to(
                        peer,
                        Message::Bcast {
                            id: id.clone(),
                            text: text.clone(),
                            causal_context: causal_context.clone(),
                            first_stage: out_first.iter().cloned().collect(),
                            second_stage: out_second.iter().cloned().collect(),
                        },
                    )?;
                }
            }
        }
        Ok(())
    }
}
