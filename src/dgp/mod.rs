//! Delivery-Guarantee Pair: four sender/receiver variants layered on the same
//! unreliable [`crate::bus::Bus`], differing only in what the receiver
//! remembers and what the sender retransmits until it hears back.
//!
//! Grounded on `unreplicated::Client`/`Replica` for the generic sender/
//! receiver shape (a struct holding the peer id, a sequence counter, and an
//! `unacked` table; `resend_timer: u32` kept as a plain struct field rather
//! than parsed out of a timer name) and on
//! `original_source/1-guarantees/solution.py` for the exact per-variant
//! wire behavior.

pub mod at_least_once;
pub mod at_most_once;
pub mod exactly_once;
pub mod exactly_once_ordered;

use std::time::Duration;

/// Monotonic per-sender sequence number stamped on every payload.
pub type Seq = u64;

/// Shared knobs. `EPS` keeps the resend period strictly above `2*MAX_DELAY`
/// so a reply already in flight is never raced by a spurious resend (spec.md
/// §5: "implementations should set resend periods to >= 2*MAX_DELAY + eps").
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub max_delay_time_units: f64,
    pub eps: f64,
    /// At-most-once receiver dedup TTL, in time units.
    pub at_most_once_ttl: f64,
}

impl Default for Config {
    fn default() -> Self {
        let max_delay_time_units = 3.0;
        Self {
            max_delay_time_units,
            eps: 1e-4,
            // must exceed `max_delay_time_units`, or a bus-duplicated copy
            // of a payload (spec.md §3 allows delay up to MAX_DELAY on top
            // of the original) can arrive after cleanup and be redelivered.
            at_most_once_ttl: 2.0 * max_delay_time_units,
        }
    }
}

impl Config {
    pub fn resend_period_time_units(&self) -> f64 {
        2.0 * self.max_delay_time_units + self.eps
    }

    pub fn resend_period(&self, clock: crate::time::Clock) -> Duration {
        clock.duration(self.resend_period_time_units())
    }
}
