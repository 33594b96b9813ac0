//! At-least-once unicast (spec.md §4.1): sender resends on a fixed period
//! until acked; receiver delivers and acks every message it sees, so
//! duplicates at the user are possible but drops are not (given eventual
//! connectivity).
//!
//! Grounded on `AtLeastOnceSender`/`AtLeastOnceReceiver` in
//! `original_source/1-guarantees/solution.py`, restructured per
//! `unreplicated::Client`'s `not_committed`-table-plus-one-resend-timer
//! shape.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    dgp::{Config, Seq},
    event::{OnEvent, SendEvent, Timer, TimerId},
    node::NodeId,
    time::Clock,
    transport::SendTo,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message<P> {
    Data { seq: Seq, payload: P },
    Ack { seq: Seq },
}

#[derive(Debug)]
pub enum SenderEvent<P> {
    Submit(P),
    Recv(Message<P>),
    Resend(Seq),
}

struct Pending<P> {
    payload: P,
    resend_timer: TimerId,
}

pub struct Sender<P, N> {
    receiver: NodeId,
    next_seq: Seq,
    unacked: HashMap<Seq, Pending<P>>,
    net: N,
    clock: Clock,
    config: Config,
}

impl<P, N> Sender<P, N> {
    pub fn new(receiver: NodeId, net: N, clock: Clock, config: Config) -> Self {
        Self {
            receiver,
            next_seq: 0,
            unacked: HashMap::new(),
            net,
            clock,
            config,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.unacked.len()
    }
}

impl<P: Clone, N: SendTo<Message<P>>> OnEvent<SenderEvent<P>> for Sender<P, N> {
    fn on_event(
        &mut self,
        event: SenderEvent<P>,
        timer: &mut dyn Timer<SenderEvent<P>>,
    ) -> anyhow::Result<()> {
        match event {
            SenderEvent::Submit(payload) => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.net.send_to(
                    self.receiver.clone(),
                    Message::Data {
                        seq,
                        payload: payload.clone(),
                    },
                )?;
                let resend_timer =
                    timer.set(self.config.resend_period(self.clock), SenderEvent::Resend(seq))?;
                self.unacked.insert(seq, Pending { payload, resend_timer });
            }
            SenderEvent::Recv(Message::Ack { seq }) => {
                if let Some(pending) = self.unacked.remove(&seq) {
                    let _ = timer.unset(pending.resend_timer);
                }
            }
            SenderEvent::Recv(Message::Data { .. }) => {
                anyhow::bail!("sender received a data message, which only a receiver should get")
            }
            SenderEvent::Resend(seq) => {
                let Some(pending) = self.unacked.get_mut(&seq) else {
                    // the ack raced the timer fire; nothing left to resend.
                    return Ok(());
                };
                self.net.send_to(
                    self.receiver.clone(),
                    Message::Data {
                        seq,
                        payload: pending.payload.clone(),
                    },
                )?;
                pending.resend_timer =
                    timer.set(self.config.resend_period(self.clock), SenderEvent::Resend(seq))?;
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum ReceiverEvent<P> {
    Recv(Message<P>),
}

pub struct Receiver<P, U, N> {
    sender: NodeId,
    net: N,
    upcall: U,
    _payload: std::marker::PhantomData<P>,
}

impl<P, U, N> Receiver<P, U, N> {
    pub fn new(sender: NodeId, net: N, upcall: U) -> Self {
        Self {
            sender,
            net,
            upcall,
            _payload: std::marker::PhantomData,
        }
    }
}

impl<P: Clone, U: SendEvent<P>, N: SendTo<Message<P>>> OnEvent<ReceiverEvent<P>>
    for Receiver<P, U, N>
{
    fn on_event(
        &mut self,
        event: ReceiverEvent<P>,
        _timer: &mut dyn Timer<ReceiverEvent<P>>,
    ) -> anyhow::Result<()> {
        let ReceiverEvent::Recv(message) = event;
        match message {
            Message::Data { seq, payload } => {
                self.net.send_to(self.sender.clone(), Message::<P>::Ack { seq })?;
                self.upcall.send(payload)?;
            }
            Message::Ack { .. } => {
                anyhow::bail!("receiver received an ack, which only a sender should get")
            }
        }
        Ok(())
    }
}
