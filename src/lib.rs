//! Distributed-node protocol core: four node personalities sharing one
//! event-driven runtime contract over a simulated unreliable message bus.
//!
//! - [`dgp`] — delivery-guarantee pairs (at-most-once, at-least-once,
//!   exactly-once, exactly-once-ordered unicast).
//! - [`crb`] — causal reliable broadcast over a small fixed group.
//! - [`gmfd`] — gossip membership with SWIM-style failure detection.
//! - [`skv`] — consistent-hash sharded key-value routing.
//!
//! All four are independent protocols sharing the runtime contract
//! ([`event`], [`time`]) and the message substrate ([`bus`], [`node`],
//! [`transport`]); they do not compose with each other at runtime.

pub mod bus;
pub mod crb;
pub mod dgp;
pub mod event;
pub mod gmfd;
pub mod node;
pub mod skv;
pub mod time;
pub mod transport;
