//! Runtime contract shared by every node personality: an event loop that
//! drives callbacks to completion one at a time, plus the timer facility
//! those callbacks use to arm resends, probes, and gossip rounds.
//!
//! Adapted from the upstream `Session<M>` event loop: a single
//! `mpsc::UnboundedReceiver` feeds one event at a time into `OnEvent::on_event`,
//! with no `.await` point inside a callback, matching the single-threaded
//! cooperative model in spec.md §5.

use std::{collections::HashMap, fmt::Debug, time::Duration};

use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};

/// Per spec.md §7, an expected protocol fault (loss, duplication, a stale
/// ack) is absorbed silently inside `on_event` and never surfaces as an
/// `Err`. A malformed message or an impossible state transition is a
/// programmer error instead: `on_event` returns `Err` via `anyhow::bail!`/
/// `anyhow::ensure!`, which unwinds out of `Session::run` and terminates
/// the node's task without further mutation — there is no separate typed
/// error enum, matching how the rest of this codebase uses `anyhow`
/// directly rather than a `thiserror` hierarchy.
pub trait SendEvent<M> {
    fn send(&mut self, event: M) -> anyhow::Result<()>;
}

pub trait OnEvent<M> {
    fn on_event(&mut self, event: M, timer: &mut dyn Timer<M>) -> anyhow::Result<()>;
}

#[derive(Debug)]
pub struct Void; // discards events; used where an upcall channel is irrelevant to a test

impl<M> SendEvent<M> for Void {
    fn send(&mut self, _: M) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<N: Into<M>, M> SendEvent<N> for UnboundedSender<M> {
    fn send(&mut self, event: N) -> anyhow::Result<()> {
        UnboundedSender::send(self, event.into()).map_err(|_| anyhow::anyhow!("channel closed"))
    }
}

pub type TimerId = u32;

/// Abstracts "arm a one-shot timer" / "cancel a timer" against the
/// `Session`'s raw numeric ids. Per the upstream "timers as values" design
/// note, protocol code never encodes semantic content into a timer's
/// identity and parses it back out; instead each component keeps its own
/// `HashMap<TimerKey, TimerId>` and uses this trait purely as the
/// underlying arm/cancel primitive.
pub trait Timer<M> {
    fn set_internal(&mut self, duration: Duration, event: M) -> anyhow::Result<TimerId>;

    fn unset(&mut self, timer_id: TimerId) -> anyhow::Result<()>;
}

impl<M> dyn Timer<M> + '_ {
    pub fn set(&mut self, duration: Duration, event: impl Into<M>) -> anyhow::Result<TimerId> {
        self.set_internal(duration, event.into())
    }
}

#[derive(Debug)]
enum SessionEvent<M> {
    Timer(TimerId, M),
    Other(M),
}

#[derive(Debug)]
pub struct SessionSender<M>(UnboundedSender<SessionEvent<M>>);

impl<M> Clone for SessionSender<M> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<M: Into<N>, N> SendEvent<M> for SessionSender<N> {
    fn send(&mut self, event: M) -> anyhow::Result<()> {
        self.0
            .send(SessionEvent::Other(event.into()))
            .map_err(|_| anyhow::anyhow!("channel closed"))
    }
}

pub struct Session<M> {
    sender: UnboundedSender<SessionEvent<M>>,
    receiver: UnboundedReceiver<SessionEvent<M>>,
    timer_id: TimerId,
    timers: HashMap<TimerId, JoinHandle<()>>,
}

impl<M> Debug for Session<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("timer_id", &self.timer_id)
            .field("live_timers", &self.timers.len())
            .finish_non_exhaustive()
    }
}

impl<M> Default for Session<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Session<M> {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded_channel();
        Self {
            sender,
            receiver,
            timer_id: 0,
            timers: Default::default(),
        }
    }

    pub fn sender(&self) -> SessionSender<M> {
        SessionSender(self.sender.clone())
    }

    /// Number of timers currently armed. Exposed for tests that assert a
    /// node purges its timer state (spec.md §5: "no implicit cancellation
    /// on node shutdown; implementations must purge timer state when a node
    /// terminates" — callers drop the `Session` to purge; this just lets a
    /// test observe "nothing left armed" before that drop).
    pub fn live_timer_count(&self) -> usize {
        self.timers.len()
    }

    pub async fn run(&mut self, state: &mut impl OnEvent<M>) -> anyhow::Result<()>
    where
        M: Send + 'static,
    {
        loop {
            let event = match self
                .receiver
                .recv()
                .await
                .ok_or_else(|| anyhow::anyhow!("channel closed"))?
            {
                SessionEvent::Timer(timer_id, event) => {
                    if self.timers.remove(&timer_id).is_some() {
                        event
                    } else {
                        // unset/fire race: the timer coroutine had already queued its
                        // event before `unset` aborted it. Force-skip rather than
                        // deliver, since by definition the event's armer no longer
                        // wants it.
                        continue;
                    }
                }
                SessionEvent::Other(event) => event,
            };
            state.on_event(event, self)?
        }
    }
}

impl<M: Send + 'static> Timer<M> for Session<M> {
    fn set_internal(&mut self, duration: Duration, event: M) -> anyhow::Result<TimerId> {
        self.timer_id += 1;
        let timer_id = self.timer_id;
        let sender = self.sender.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = sender.send(SessionEvent::Timer(timer_id, event));
        });
        self.timers.insert(timer_id, timer);
        Ok(timer_id)
    }

    fn unset(&mut self, timer_id: TimerId) -> anyhow::Result<()> {
        self.timers
            .remove(&timer_id)
            .ok_or_else(|| anyhow::anyhow!("timer not exists"))?
            .abort();
        Ok(())
    }
}

impl<M> Drop for Session<M> {
    fn drop(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
    }
}
