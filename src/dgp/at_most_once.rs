//! At-most-once unicast (spec.md §4.1): fire-and-forget send, receiver-side
//! dedup with a bounded TTL. No acknowledgement, no retransmission — a lost
//! payload is simply never delivered.
//!
//! Grounded on `AtMostOnceSender`/`AtMostOnceReceiver` in
//! `original_source/1-guarantees/solution.py`; the reference's
//! `set_timer(f"ids cleanup {msg['id']}", ...)` / parse-the-id-back-out-of-
//! the-timer-name idiom is replaced per the "timers as values" design note
//! by a `HashMap<Seq, TimerId>` kept on the receiver.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    dgp::{Config, Seq},
    event::{OnEvent, SendEvent, Timer},
    node::NodeId,
    time::Clock,
    transport::SendTo,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message<P> {
    Data { seq: Seq, payload: P },
}

#[derive(Debug)]
pub enum SenderEvent<P> {
    Submit(P),
}

pub struct Sender<P, N> {
    receiver: NodeId,
    next_seq: Seq,
    net: N,
    _payload: std::marker::PhantomData<P>,
}

impl<P, N> Sender<P, N> {
    pub fn new(receiver: NodeId, net: N) -> Self {
        Self {
            receiver,
            next_seq: 0,
            net,
            _payload: std::marker::PhantomData,
        }
    }
}

impl<P: Clone, N: SendTo<Message<P>>> OnEvent<SenderEvent<P>> for Sender<P, N> {
    fn on_event(
        &mut self,
        event: SenderEvent<P>,
        _timer: &mut dyn Timer<SenderEvent<P>>,
    ) -> anyhow::Result<()> {
        let SenderEvent::Submit(payload) = event;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.net.send_to(self.receiver.clone(), Message::Data { seq, payload })
    }
}

#[derive(Debug)]
pub enum ReceiverEvent<P> {
    Recv(Message<P>),
    Cleanup(Seq),
}

pub struct Receiver<P, U> {
    seen: HashMap<Seq, ()>,
    ttl_time_units: f64,
    clock: Clock,
    upcall: U,
    _payload: std::marker::PhantomData<P>,
}

impl<P, U> Receiver<P, U> {
    pub fn new(config: &Config, clock: Clock, upcall: U) -> Self {
        Self {
            seen: HashMap::new(),
            ttl_time_units: config.at_most_once_ttl,
            clock,
            upcall,
            _payload: std::marker::PhantomData,
        }
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }
}

impl<P: Clone, U: SendEvent<P>> OnEvent<ReceiverEvent<P>> for Receiver<P, U> {
    fn on_event(
        &mut self,
        event: ReceiverEvent<P>,
        timer: &mut dyn Timer<ReceiverEvent<P>>,
    ) -> anyhow::Result<()> {
        match event {
            ReceiverEvent::Recv(Message::Data { seq, payload }) => {
                if self.seen.insert(seq, ()).is_none() {
                    timer.set(self.clock.duration(self.ttl_time_units), ReceiverEvent::Cleanup(seq))?;
                    self.upcall.send(payload)?;
                }
            }
            ReceiverEvent::Cleanup(seq) => {
                self.seen.remove(&seq);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Session;
    use std::time::Duration;

    #[tokio::test]
    async fn duplicate_delivery_is_deduplicated() {
        let (upcall, mut upcalls) = tokio::sync::mpsc::unbounded_channel::<String>();
        let mut receiver = Receiver::<String, _>::new(
            &Config::default(),
            Clock::with_unit(Duration::from_millis(1)),
            upcall,
        );
        let mut session = Session::<ReceiverEvent<String>>::new();
        for _ in 0..2 {
            receiver
                .on_event(
                    ReceiverEvent::Recv(Message::Data {
                        seq: 1,
                        payload: "hi".to_string(),
                    }),
                    &mut session,
                )
                .unwrap();
        }
        assert_eq!(upcalls.try_recv().unwrap(), "hi");
        assert!(upcalls.try_recv().is_err());
        assert_eq!(receiver.seen_count(), 1);
    }
}
