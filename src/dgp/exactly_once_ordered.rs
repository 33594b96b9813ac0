//! Exactly-once, FIFO-ordered unicast (spec.md §4.1): the richest DGP
//! variant. The sender is an at-least-once sender that additionally answers
//! "what's your oldest outstanding seq" probes; the receiver buffers
//! out-of-order arrivals and only drains them in order once a probe
//! confirms nothing older is still in flight.
//!
//! Grounded on `ExactlyOnceOrderedSender`/`ExactlyOnceOrderedReceiver` in
//! `original_source/1-guarantees/solution.py`. Two reference quirks are
//! deliberately not carried over:
//! - the reference tags its gap-probe reply by sending `str(-first_unacked)`
//!   as a message `_type` and has the receiver negate it back; here it's
//!   just a field on a proper `FirstUnacked` variant (per the "replacing
//!   dynamic dispatch" design note).
//! - the reference re-buffers a duplicate arrival even after that seq was
//!   already drained and delivered, which can redeliver it a second time on
//!   the next drain; the receiver here tracks a `next_expected` watermark
//!   and ignores arrivals below it, which is required to meet this
//!   variant's "exactly once" contract (spec.md §4.1, §8).

use std::collections::{BTreeMap, HashMap};

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
    /// Sent sender -> receiver on submit/resend, and echoed receiver ->
    /// sender verbatim as that seq's ack.
    Data { seq: Seq, payload: P },
    /// Receiver -> sender: "what's the oldest seq you're still retrying?"
    GapProbe,
    /// Sender -> receiver, in reply to `GapProbe`.
    FirstUnacked { first_unacked: Seq },
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

    fn first_unacked(&self) -> Seq {
        self.unacked.keys().min().copied().unwrap_or(self.next_seq)
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
            SenderEvent::Recv(Message::Data { seq, .. }) => {
                if let Some(pending) = self.unacked.remove(&seq) {
                    let _ = timer.unset(pending.resend_timer);
                }
            }
            SenderEvent::Recv(Message::GapProbe) => {
                self.net.send_to(
                    self.receiver.clone(),
                    Message::FirstUnacked {
                        first_unacked: self.first_unacked(),
                    },
                )?;
            }
            SenderEvent::Recv(Message::FirstUnacked { .. }) => {
                anyhow::bail!("sender received a FirstUnacked reply, which only a receiver should get")
            }
            SenderEvent::Resend(seq) => {
                let Some(pending) = self.unacked.get_mut(&seq) else {
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
    Probe,
}

pub struct Receiver<P, U, N> {
    sender: NodeId,
    next_expected: Seq,
    buffer: BTreeMap<Seq, P>,
    probe_timer: Option<TimerId>,
    probe_period: std::time::Duration,
    net: N,
    upcall: U,
}

impl<P, U, N> Receiver<P, U, N> {
    /// `probe_period_time_units` is the reference's `self.timer = 10`.
    pub fn new(sender: NodeId, probe_period_time_units: f64, clock: Clock, net: N, upcall: U) -> Self {
        Self {
            sender,
            next_expected: 0,
            buffer: BTreeMap::new(),
            probe_timer: None,
            probe_period: clock.duration(probe_period_time_units),
            net,
            upcall,
        }
    }

    pub fn buffered_count(&self) -> usize {
        self.buffer.len()
    }
}

impl<P: Clone, U: SendEvent<P>, N: SendTo<Message<P>>> OnEvent<ReceiverEvent<P>>
    for Receiver<P, U, N>
{
    fn on_event(
        &mut self,
        event: ReceiverEvent<P>,
        timer: &mut dyn Timer<ReceiverEvent<P>>,
    ) -> anyhow::Result<()> {
        match event {
            ReceiverEvent::Recv(Message::Data { seq, payload }) => {
                self.net.send_to(
                    self.sender.clone(),
                    Message::Data {
                        seq,
                        payload: payload.clone(),
                    },
                )?;
                if self.probe_timer.is_none() {
                    self.probe_timer = Some(timer.set(self.probe_period, ReceiverEvent::Probe)?);
                }
                // seq < next_expected is already delivered; never re-buffer it.
                if seq >= self.next_expected {
                    self.buffer.entry(seq).or_insert(payload);
                }
            }
            ReceiverEvent::Recv(Message::FirstUnacked { first_unacked }) => {
                self.next_expected = self.next_expected.max(first_unacked);
                while let Some((&seq, _)) = self.buffer.iter().next() {
                    if seq >= first_unacked {
                        break;
                    }
                    let payload = self.buffer.remove(&seq).expect("key just observed present");
                    self.upcall.send(payload)?;
                }
            }
            ReceiverEvent::Recv(Message::GapProbe) => {
                anyhow::bail!("receiver received a GapProbe, which only a sender should get")
            }
            ReceiverEvent::Probe => {
                self.net.send_to(self.sender.clone(), Message::GapProbe)?;
                self.probe_timer = if self.buffer.is_empty() {
                    None
                } else {
                    Some(timer.set(self.probe_period, ReceiverEvent::Probe)?)
                };
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event::Session, transport::testing::RecordingNet};
    use std::time::Duration;

    #[tokio::test]
    async fn out_of_order_arrivals_deliver_in_order_after_gap_probe() {
        let (upcall, mut upcalls) = tokio::sync::mpsc::unbounded_channel::<String>();
        let net: RecordingNet<Message<String>> = Default::default();
        let mut receiver = Receiver::new(
            NodeId::from("sender"),
            10.0,
            Clock::with_unit(Duration::from_millis(1)),
            net.clone(),
            upcall,
        );
        let mut session = Session::<ReceiverEvent<String>>::new();

        // C arrives before B; neither should be delivered yet.
        receiver
            .on_event(
                ReceiverEvent::Recv(Message::Data {
                    seq: 2,
                    payload: "C".to_string(),
                }),
                &mut session,
            )
            .unwrap();
        assert!(upcalls.try_recv().is_err());
        assert_eq!(receiver.buffered_count(), 1);

        receiver
            .on_event(
                ReceiverEvent::Recv(Message::Data {
                    seq: 1,
                    payload: "B".to_string(),
                }),
                &mut session,
            )
            .unwrap();
        assert_eq!(receiver.buffered_count(), 2);

        // sender reports everything below 3 has been acked: both drain in order.
        receiver
            .on_event(
                ReceiverEvent::Recv(Message::FirstUnacked { first_unacked: 3 }),
                &mut session,
            )
            .unwrap();
        assert_eq!(upcalls.try_recv().unwrap(), "B");
        assert_eq!(upcalls.try_recv().unwrap(), "C");
        assert_eq!(receiver.buffered_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_below_watermark_is_not_redelivered() {
        let (upcall, mut upcalls) = tokio::sync::mpsc::unbounded_channel::<String>();
        let net: RecordingNet<Message<String>> = Default::default();
        let mut receiver = Receiver::new(
            NodeId::from("sender"),
            10.0,
            Clock::with_unit(Duration::from_millis(1)),
            net.clone(),
            upcall,
        );
        let mut session = Session::<ReceiverEvent<String>>::new();
        receiver
            .on_event(
                ReceiverEvent::Recv(Message::Data {
                    seq: 0,
                    payload: "A".to_string(),
                }),
                &mut session,
            )
            .unwrap();
        receiver
            .on_event(
                ReceiverEvent::Recv(Message::FirstUnacked { first_unacked: 1 }),
                &mut session,
            )
            .unwrap();
        assert_eq!(upcalls.try_recv().unwrap(), "A");

        // a stale resend of seq 0 shows up after it was already delivered.
        receiver
            .on_event(
                ReceiverEvent::Recv(Message::Data {
                    seq: 0,
                    payload: "A".to_string(),
                }),
                &mut session,
            )
            .unwrap();
        receiver
            .on_event(
                ReceiverEvent::Recv(Message::FirstUnacked { first_unacked: 1 }),
                &mut session,
            )
            .unwrap();
        assert!(upcalls.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn sender_reports_oldest_unacked_seq_on_probe() {
        let net: RecordingNet<Message<String>> = Default::default();
        let mut sender = Sender::new(
            NodeId::from("receiver"),
            net.clone(),
            Clock::with_unit(Duration::from_millis(1)),
            Config::default(),
        );
        let mut session = Session::<SenderEvent<String>>::new();
        sender
            .on_event(SenderEvent::Submit("A".to_string()), &mut session)
            .unwrap();
        sender
            .on_event(SenderEvent::Submit("B".to_string()), &mut session)
            .unwrap();
        sender
            .on_event(
                SenderEvent::Recv(Message::Data {
                    seq: 0,
                    payload: "A".to_string(),
                }),
                &mut session,
            )
            .unwrap();
        sender
            .on_event(SenderEvent::Recv(Message::GapProbe), &mut session)
            .unwrap();
        let last = net.0.borrow().last().unwrap().1.clone();
        assert!(matches!(last, Message::FirstUnacked { first_unacked: 1 }));
    }
}
