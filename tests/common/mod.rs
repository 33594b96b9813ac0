//! Shared integration-test harness: pumps deserialized wire messages from a
//! registered `Bus` inbox into a node's `Session`, so tests exercise the
//! real delay/loss/duplication substrate end to end rather than calling
//! `on_event` directly.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use distcore::bus::Bus;
use distcore::event::SendEvent;
use distcore::node::NodeId;
use distcore::transport::SendTo;
use serde::de::DeserializeOwned;

/// Spawns a task that drains `id`'s bus inbox, deserializes each envelope as
/// `Msg`, and forwards `wrap(msg)` into `sender`. Runs until the bus handle
/// (and thus the channel) is dropped.
pub fn pump<Msg, Ev, S>(bus: Bus, id: NodeId, mut sender: S, wrap: impl Fn(Msg) -> Ev + Send + 'static)
where
    Msg: DeserializeOwned + Send + 'static,
    Ev: Send + 'static,
    S: SendEvent<Ev> + Send + 'static,
{
    let mut inbox = bus.register(id);
    tokio::spawn(async move {
        while let Some(envelope) = inbox.recv().await {
            if let Ok(msg) = bincode::deserialize::<Msg>(&envelope.bytes) {
                if sender.send(wrap(msg)).is_err() {
                    break;
                }
            }
        }
    });
}

/// Wraps a `SendTo<M>` with a shared gate: sends are silently dropped while
/// closed. Simulates a node going unreachable (the outbound half of a
/// network partition) without touching the substrate itself.
#[derive(Clone)]
pub struct GatedNet<N> {
    inner: N,
    open: Arc<AtomicBool>,
}

impl<N> GatedNet<N> {
    pub fn new(inner: N) -> (Self, Arc<AtomicBool>) {
        let open = Arc::new(AtomicBool::new(true));
        (
            Self {
                inner,
                open: open.clone(),
            },
            open,
        )
    }
}

impl<M, N: SendTo<M>> SendTo<M> for GatedNet<N> {
    fn send_to(&mut self, to: NodeId, message: M) -> anyhow::Result<()> {
        if self.open.load(Ordering::SeqCst) {
            self.inner.send_to(to, message)
        } else {
            Ok(())
        }
    }
}
