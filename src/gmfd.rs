//! Gossip Membership & Failure Detector (spec.md §4.3): heartbeat gossip for
//! convergence, SWIM-style direct/indirect probing for failure detection,
//! voluntary leave, and `TRY_RECOVER`-based healing of false suspicion.
//!
//! Grounded on `GroupMember` in `original_source/6-membership/solution.py`
//! line by line, and on `neatsys-boson-circuit/src/lamport_mutex.rs` for the
//! "probing state indexes peers by id, never by peer object" idiom
//! (`waiting_first_ack`/`waiting_second_ack` as `HashMap<NodeId, _>`).
//!
//! Two reference behaviors are deliberately not carried over, both noted in
//! `DESIGN.md`: `LEAVE`'s notification send target (the reference sends to
//! `self` instead of the intended peer — an evident bug, not a design
//! choice; spec.md §4.3 states the intended behavior plainly) and
//! `PING_APPROVE`'s unconditional removal from `waiting_first_ack` (the
//! reference would panic on a late duplicate approval; removal here is
//! idempotent, matching §7's "expected faults never surface as an error").

use std::collections::HashMap;

use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::{
    event::{OnEvent, SendEvent, Timer},
    node::NodeId,
    time::Clock,
    transport::SendTo,
};

#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub heartbeat_positive_fanout: usize,
    pub heartbeat_negative_fanout: usize,
    pub ping_period_time_units: f64,
    pub ping2_cnt: usize,
    /// Kept for parity with the reference's exposed configuration surface
    /// (spec.md §6: `FIND_NODE_TO_PING_TRIES=10`). The reference uses this
    /// to bound retries of a single-candidate random pick that may
    /// repeatedly land on an ineligible node; picking uniformly among the
    /// already-filtered eligible candidates (as this module does) needs no
    /// retry bound, so the field is unused here.
    pub find_node_to_ping_tries: usize,
    pub eps: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_positive_fanout: 3,
            heartbeat_negative_fanout: 3,
            ping_period_time_units: 4.5,
            ping2_cnt: 3,
            find_node_to_ping_tries: 10,
            eps: 1e-3,
        }
    }
}

impl Config {
    /// Size-adaptive heartbeat period (spec.md §4.3: 4/7.5/15/15 for group
    /// sizes <=10/<=20/<=50/<=100). Groups beyond 100 keep the size-100
    /// period — the reference never branches past that tier either.
    pub fn heartbeat_period_time_units(&self, group_size: usize) -> f64 {
        match group_size {
            0..=10 => 4.0,
            11..=20 => 7.5,
            _ => 15.0,
        }
    }

    pub fn waiting_first_ack_time_units(&self, group_size: usize) -> f64 {
        2.0 * self.heartbeat_period_time_units(group_size)
    }

    pub fn waiting_second_ack_time_units(&self, group_size: usize) -> f64 {
        3.0 * self.heartbeat_period_time_units(group_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Status {
    Joined,
    Left,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Join { node: NodeId, time: f64 },
    LeftNotify { node: NodeId, time: f64 },
    Heartbeat { node: NodeId, group: HashMap<NodeId, f64> },
    TryRecover { node: NodeId },
    TryRecoverApprove { node: NodeId, time: f64 },
    Ping { node: NodeId, time: f64 },
    PingApprove { node: NodeId, time: f64 },
    Ping2Forward { origin: NodeId, intermediary: NodeId, target: NodeId },
    Ping2Final { origin: NodeId, intermediary: NodeId, target: NodeId },
    /// Target -> intermediary, on the way back. The reference spells this
    /// `PING2#BACWARD_INTERMEDIATE` (sic); named for what it does instead.
    Ping2Relay { origin: NodeId, intermediary: NodeId, target: NodeId },
    Ping2Approve { origin: NodeId, intermediary: NodeId, target: NodeId },
}

#[derive(Debug)]
pub enum Event {
    Join { seed: NodeId },
    Leave,
    GetMembers,
    Recv(Message),
    HeartbeatFire,
    PingFire,
}

#[derive(Debug, Clone)]
pub struct Members {
    pub members: Vec<NodeId>,
}

fn merge(local: &mut HashMap<NodeId, f64>, incoming: &HashMap<NodeId, f64>) {
    for (node, &time) in incoming {
        match local.get(node) {
            None => {
                local.insert(node.clone(), time);
            }
            Some(&existing) if existing.abs() < time.abs() => {
                local.insert(node.clone(), time);
            }
            Some(_) => {}
        }
    }
}

pub struct Node<N, U> {
    id: NodeId,
    members: HashMap<NodeId, f64>,
    status: Option<Status>,
    waiting_first_ack: HashMap<NodeId, f64>,
    waiting_second_ack: HashMap<NodeId, f64>,
    config: Config,
    clock: Clock,
    epoch: tokio::time::Instant,
    rng: StdRng,
    net: N,
    upcall: U,
}

impl<N, U> Node<N, U> {
    pub fn new(id: NodeId, config: Config, clock: Clock, seed: u64, net: N, upcall: U) -> Self {
        Self {
            id,
            members: HashMap::new(),
            status: None,
            waiting_first_ack: HashMap::new(),
            waiting_second_ack: HashMap::new(),
            config,
            clock,
            epoch: tokio::time::Instant::now(),
            rng: StdRng::seed_from_u64(seed),
            net,
            upcall,
        }
    }

    fn time(&self) -> f64 {
        self.clock.since(self.epoch)
    }

    fn group_size(&self) -> usize {
        self.members.len()
    }

    fn refresh_self_timestamp(&mut self) {
        let now = self.time();
        let sign = if self.members.get(&self.id).copied().unwrap_or(1.0) > 0.0 {
            1.0
        } else {
            -1.0
        };
        self.members.insert(self.id.clone(), now * sign);
    }

    fn is_alive(&self, node: &NodeId) -> bool {
        self.members.get(node).copied().unwrap_or(0.0) > 0.0
    }

    pub fn alive_members(&self) -> Vec<NodeId> {
        let mut alive: Vec<_> = self
            .members
            .iter()
            .filter(|(_, &t)| t > 0.0)
            .map(|(id, _)| id.clone())
            .collect();
        alive.sort();
        alive
    }

    fn random_alive_peers(&mut self, exclude_self: bool, limit: usize) -> Vec<NodeId> {
        let mut candidates: Vec<NodeId> = self
            .members
            .iter()
            .filter(|(id, &t)| t > 0.0 && !(exclude_self && **id == self.id))
            .map(|(id, _)| id.clone())
            .collect();
        candidates.shuffle(&mut self.rng);
        candidates.truncate(limit);
        candidates
    }

    fn random_suspected_peers(&mut self, limit: usize) -> Vec<NodeId> {
        let mut candidates: Vec<NodeId> = self
            .members
            .iter()
            .filter(|(id, &t)| t < 0.0 && **id != self.id)
            .map(|(id, _)| id.clone())
            .collect();
        candidates.shuffle(&mut self.rng);
        candidates.truncate(limit);
        candidates
    }
}

impl<N: SendTo<Message>, U: SendEvent<Members>> Node<N, U> {
    fn check_escalations(&mut self, timer: &mut dyn Timer<Event>) -> anyhow::Result<()> {
        let group_size = self.group_size();
        let now = self.time();
        let waiting_first_ack_bound = self.config.waiting_first_ack_time_units(group_size);
        let waiting_second_ack_bound = self.config.waiting_second_ack_time_units(group_size);

        let timed_out_first: Vec<NodeId> = self
            .waiting_first_ack
            .iter()
            .filter(|(_, &sent_at)| now - sent_at > waiting_first_ack_bound)
            .map(|(id, _)| id.clone())
            .collect();
        for target in timed_out_first {
            self.waiting_first_ack.remove(&target);
            if self.waiting_second_ack.contains_key(&target) {
                continue;
            }
            self.waiting_second_ack.insert(target.clone(), now);
            let origin = self.id.clone();
            for intermediary in self.random_alive_peers(true, self.config.ping2_cnt) {
                self.net.send_to(
                    intermediary.clone(),
                    Message::Ping2Forward {
                        origin: origin.clone(),
                        intermediary,
                        target: target.clone(),
                    },
                )?;
            }
        }

        let timed_out_second: Vec<NodeId> = self
            .waiting_second_ack
            .iter()
            .filter(|(_, &sent_at)| now - sent_at > waiting_second_ack_bound)
            .map(|(id, _)| id.clone())
            .collect();
        for target in timed_out_second {
            self.waiting_second_ack.remove(&target);
            let current = self.members.get(&target).copied().unwrap_or(0.0);
            self.members.insert(target, (current + 1.0) * -1.0);
        }

        let _ = timer;
        Ok(())
    }
}

impl<N: SendTo<Message>, U: SendEvent<Members>> OnEvent<Event> for Node<N, U> {
    fn on_event(&mut self, event: Event, timer: &mut dyn Timer<Event>) -> anyhow::Result<()> {
        match event {
            Event::Join { seed } => {
                let now = self.time();
                self.status = Some(Status::Joined);
                self.members.insert(self.id.clone(), now);
                if seed != self.id {
                    self.members.insert(seed.clone(), now);
                    self.net.send_to(
                        seed,
                        Message::Join {
                            node: self.id.clone(),
                            time: now,
                        },
                    )?;
                }
                let jitter = self.rng.gen_range(0.0..0.1);
                timer.set(
                    self.clock
                        .duration(self.config.heartbeat_period_time_units(self.group_size()) + jitter),
                    Event::HeartbeatFire,
                )?;
                timer.set(
                    self.clock.duration(self.config.ping_period_time_units + jitter),
                    Event::PingFire,
                )?;
            }
            Event::Leave => {
                self.status = Some(Status::Left);
                let now = -self.time();
                self.members.insert(self.id.clone(), now);
                let peers = self.random_alive_peers(true, self.config.heartbeat_positive_fanout);
                for peer in peers {
                    self.net.send_to(
                        peer,
                        Message::LeftNotify {
                            node: self.id.clone(),
                            time: now,
                        },
                    )?;
                }
            }
            Event::GetMembers => {
                self.upcall.send(Members {
                    members: self.alive_members(),
                })?;
            }
            Event::Recv(message) => self.on_message(message)?,
            Event::HeartbeatFire => {
                self.refresh_self_timestamp();
                let heartbeat = Message::Heartbeat {
                    node: self.id.clone(),
                    group: self.members.clone(),
                };
                for peer in self.random_alive_peers(true, self.config.heartbeat_positive_fanout) {
                    self.net.send_to(peer, heartbeat.clone())?;
                }
                let try_recover = Message::TryRecover { node: self.id.clone() };
                for peer in self.random_suspected_peers(self.config.heartbeat_negative_fanout) {
                    self.net.send_to(peer, try_recover.clone())?;
                }
                timer.set(
                    self.clock.duration(self.config.heartbeat_period_time_units(self.group_size())),
                    Event::HeartbeatFire,
                )?;
                self.check_escalations(timer)?;
            }
            Event::PingFire => {
                self.refresh_self_timestamp();
                let candidates: Vec<NodeId> = self
                    .members
                    .iter()
                    .filter(|(id, &t)| **id != self.id && t > 0.0 && !self.waiting_first_ack.contains_key(*id))
                    .map(|(id, _)| id.clone())
                    .collect();
                if let Some(target) = candidates.choose(&mut self.rng).cloned() {
                    let now = self.time();
                    self.net.send_to(
                        target.clone(),
                        Message::Ping {
                            node: self.id.clone(),
                            time: now,
                        },
                    )?;
                    self.waiting_first_ack.insert(target, now);
                }
                let jitter = self.rng.gen_range(0.0..0.1);
                timer.set(
                    self.clock.duration(self.config.ping_period_time_units + jitter),
                    Event::PingFire,
                )?;
                self.check_escalations(timer)?;
            }
        }
        Ok(())
    }
}

impl<N: SendTo<Message>, U: SendEvent<Members>> Node<N, U> {
    fn on_message(&mut self, message: Message) -> anyhow::Result<()> {
        let now = self.time();
        match message {
            Message::Heartbeat { node, group } => {
                if !self.members.contains_key(&node) || self.is_alive(&node) {
                    merge(&mut self.members, &group);
                }
            }
            Message::Join { node, time } => {
                self.members.insert(node, time);
            }
            Message::LeftNotify { node, time } => {
                if self.members.contains_key(&node) {
                    self.members.insert(node, time);
                }
            }
            Message::TryRecover { node } => {
                if self.status == Some(Status::Joined) {
                    self.net.send_to(
                        node,
                        Message::TryRecoverApprove {
                            node: self.id.clone(),
                            time: now,
                        },
                    )?;
                }
            }
            Message::TryRecoverApprove { node, time } => {
                self.members.insert(node, time.abs() + self.config.eps);
            }
            Message::Ping { node, time } => {
                if self.is_alive(&self.id) {
                    if !self.members.contains_key(&node) || self.is_alive(&node) {
                        self.members.insert(node.clone(), time);
                    }
                    self.net.send_to(
                        node,
                        Message::PingApprove {
                            node: self.id.clone(),
                            time: now,
                        },
                    )?;
                }
            }
            Message::PingApprove { node, time } => {
                self.members.insert(node.clone(), time);
                self.waiting_first_ack.remove(&node);
            }
            Message::Ping2Forward { origin, intermediary, target } => {
                self.net.send_to(
                    target.clone(),
                    Message::Ping2Final { origin, intermediary, target },
                )?;
            }
            Message::Ping2Final { origin, intermediary, target } => {
                if self.is_alive(&self.id) {
                    self.net.send_to(
                        intermediary.clone(),
                        Message::Ping2Relay { origin, intermediary, target },
                    )?;
                }
            }
            Message::Ping2Relay { origin, intermediary, target } => {
                self.net.send_to(
                    origin.clone(),
                    Message::Ping2Approve { origin, intermediary, target },
                )?;
            }
            Message::Ping2Approve { target, .. } => {
                self.waiting_second_ack.remove(&target);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event::Session, transport::testing::RecordingNet};
    use proptest::prelude::*;

    #[test]
    fn merge_keeps_larger_absolute_timestamp() {
        let mut a = HashMap::from([(NodeId::from("x"), 5.0), (NodeId::from("y"), -3.0)]);
        let b = HashMap::from([(NodeId::from("x"), 2.0), (NodeId::from("y"), -9.0), (NodeId::from("z"), 1.0)]);
        merge(&mut a, &b);
        assert_eq!(a[&NodeId::from("x")], 5.0);
        assert_eq!(a[&NodeId::from("y")], -9.0);
        assert_eq!(a[&NodeId::from("z")], 1.0);
    }

    proptest::proptest! {
        #[test]
        fn merge_is_idempotent(
            pairs in proptest::collection::vec(("[a-c]", -50f64..50f64), 0..6),
            repeat in proptest::collection::vec(("[a-c]", -50f64..50f64), 0..6),
        ) {
            let mut local: HashMap<NodeId, f64> = pairs
                .into_iter()
                .map(|(id, time)| (NodeId::from(id), time))
                .collect();
            let incoming: HashMap<NodeId, f64> = repeat
                .into_iter()
                .map(|(id, time)| (NodeId::from(id), time))
                .collect();
            merge(&mut local, &incoming);
            let once = local.clone();
            merge(&mut local, &incoming);
            // merging the same snapshot again changes nothing further.
            prop_assert_eq!(local, once);
        }
    }

    #[tokio::test]
    async fn join_seed_self_forms_singleton_group() {
        let net: RecordingNet<Message> = Default::default();
        let (upcall, _) = tokio::sync::mpsc::unbounded_channel();
        let mut node = Node::new(NodeId::from("1"), Config::default(), Clock::default(), 1, net, upcall);
        let mut session = Session::<Event>::new();
        node.on_event(Event::Join { seed: NodeId::from("1") }, &mut session).unwrap();
        assert!(node.is_alive(&NodeId::from("1")));
        assert_eq!(node.alive_members(), vec![NodeId::from("1")]);
    }

    #[tokio::test]
    async fn heartbeat_from_believed_alive_peer_merges_group() {
        let net: RecordingNet<Message> = Default::default();
        let (upcall, _) = tokio::sync::mpsc::unbounded_channel();
        let mut node = Node::new(NodeId::from("1"), Config::default(), Clock::default(), 1, net, upcall);
        node.members.insert(NodeId::from("1"), 10.0);
        node.members.insert(NodeId::from("2"), 10.0);
        let incoming = HashMap::from([(NodeId::from("2"), 20.0), (NodeId::from("3"), 5.0)]);
        node.on_message(Message::Heartbeat { node: NodeId::from("2"), group: incoming }).unwrap();
        assert_eq!(node.members[&NodeId::from("2")], 20.0);
        assert_eq!(node.members[&NodeId::from("3")], 5.0);
    }

    #[tokio::test]
    async fn heartbeat_from_suspected_peer_is_ignored() {
        let net: RecordingNet<Message> = Default::default();
        let (upcall, _) = tokio::sync::mpsc::unbounded_channel();
        let mut node = Node::new(NodeId::from("1"), Config::default(), Clock::default(), 1, net, upcall);
        node.members.insert(NodeId::from("2"), -10.0);
        let incoming = HashMap::from([(NodeId::from("3"), 5.0)]);
        node.on_message(Message::Heartbeat { node: NodeId::from("2"), group: incoming }).unwrap();
        assert!(!node.members.contains_key(&NodeId::from("3")));
    }

    #[tokio::test]
    async fn try_recover_approve_unsuspects_with_eps_margin() {
        let net: RecordingNet<Message> = Default::default();
        let (upcall, _) = tokio::sync::mpsc::unbounded_channel();
        let mut node = Node::new(NodeId::from("1"), Config::default(), Clock::default(), 1, net, upcall);
        node.on_message(Message::TryRecoverApprove { node: NodeId::from("2"), time: -7.0 }).unwrap();
        assert_eq!(node.members[&NodeId::from("2")], 7.0 + Config::default().eps);
    }

    #[tokio::test]
    async fn duplicate_ping_approve_is_idempotent() {
        let net: RecordingNet<Message> = Default::default();
        let (upcall, _) = tokio::sync::mpsc::unbounded_channel();
        let mut node = Node::new(NodeId::from("1"), Config::default(), Clock::default(), 1, net, upcall);
        node.on_message(Message::PingApprove { node: NodeId::from("2"), time: 1.0 }).unwrap();
        // no entry in waiting_first_ack; must not panic on the second, either.
        node.on_message(Message::PingApprove { node: NodeId::from("2"), time: 2.0 }).unwrap();
        assert_eq!(node.members[&NodeId::from("2")], 2.0);
    }
}
