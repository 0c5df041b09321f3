//! Go-back-N reliable delivery over an unreliable datagram socket.
//!
//! Every sequenced datagram stays in an ordered pending list until the peer acknowledges it.
//! A timer walks that list round-robin, resending one datagram per tick, so outbound bandwidth
//! stays bounded no matter how much is unacknowledged. The receiver only ever accepts
//! `recv_sequence + 1`; anything else is answered with an ack for the last good sequence and
//! dropped, and the sender's retransmission fills the gap. There is no reorder buffer.
//!
//! Messages larger than the MTU are split into fragments. Each fragment takes its own
//! sequence number, so in-order delivery also means in-order reassembly.
//!
//! The channel never touches a socket or a clock on its own. The driver feeds it received
//! datagrams ([`ReliableChannel::on_receive_bytes`]), ticks it ([`ReliableChannel::poll_timer`] or
//! [`ReliableChannel::on_timer_tick`]), flushes what it queued
//! ([`ReliableChannel::send_all_messages`]) and drains its events ([`ReliableChannel::poll`]).

use std::collections::vec_deque::Drain;
use std::collections::VecDeque;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use tracing::{debug, trace};
use web_time::Instant;

use crate::network::codec::{decode_datagram, decode_exact, encode, encode_datagram};
use crate::network::messages::{ChannelMessage, Datagram, NetplayMessage, SequencedPayload};
use crate::report_violation_to;
use crate::session::config::ChannelConfig;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{NetplayError, NonBlockingSocket};

/// Something the owner of a [`ReliableChannel`] has to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent<M = NetplayMessage> {
    /// A sequenced message, delivered exactly once and in order.
    Delivered(M),
    /// A best-effort message.
    Unsequenced(M),
    /// Nothing was heard from the peer for the whole keep-alive window. Reported once; the
    /// channel stops ticking afterwards.
    TimedOut,
    /// The peer sent a fragment run that cannot be reassembled.
    ProtocolViolation(String),
}

#[derive(Clone)]
struct Pending<M> {
    sequence: u32,
    payload: SequencedPayload<M>,
}

impl<M: Clone> Pending<M> {
    fn datagram(&self) -> Datagram<M> {
        Datagram::Sequenced {
            sequence: self.sequence,
            payload: self.payload.clone(),
        }
    }
}

#[derive(Default)]
struct Reassembly {
    tag: u8,
    next_index: u16,
    bytes: Vec<u8>,
}

impl Reassembly {
    fn is_empty(&self) -> bool {
        self.next_index == 0
    }

    fn clear(&mut self) {
        self.next_index = 0;
        self.bytes.clear();
    }
}

/// A go-back-N channel to one peer.
pub struct ReliableChannel<M = NetplayMessage>
where
    M: ChannelMessage,
{
    config: ChannelConfig,
    observer: Option<Arc<dyn ViolationObserver>>,

    send_queue: VecDeque<Datagram<M>>,
    event_queue: VecDeque<ChannelEvent<M>>,

    // sending
    send_sequence: u32,
    ack_sequence: u32,
    pending: VecDeque<Pending<M>>,
    send_pos: usize,

    // receiving
    recv_sequence: u32,
    reassembly: Reassembly,

    // keep-alive
    keep_alive_ticks: Option<u32>,
    keep_alive_countdown: u32,
    skip_next_keep_alive: bool,
    timed_out: bool,
    last_tick: Option<Instant>,

    // stats
    datagrams_sent: u64,
    datagrams_received: u64,
    datagrams_rejected: u64,
}

impl<M: ChannelMessage> fmt::Debug for ReliableChannel<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReliableChannel")
            .field("send_sequence", &self.send_sequence)
            .field("ack_sequence", &self.ack_sequence)
            .field("recv_sequence", &self.recv_sequence)
            .field("pending", &self.pending.len())
            .field("timed_out", &self.timed_out)
            .finish_non_exhaustive()
    }
}

impl<M: ChannelMessage> ReliableChannel<M> {
    /// Creates an idle channel.
    #[must_use]
    pub fn new(config: ChannelConfig) -> Self {
        let keep_alive_ticks = config.keep_alive_ticks();
        Self {
            config,
            observer: None,
            send_queue: VecDeque::new(),
            event_queue: VecDeque::new(),
            send_sequence: 0,
            ack_sequence: 0,
            pending: VecDeque::new(),
            send_pos: 0,
            recv_sequence: 0,
            reassembly: Reassembly::default(),
            keep_alive_ticks,
            keep_alive_countdown: keep_alive_ticks.unwrap_or(0),
            skip_next_keep_alive: false,
            timed_out: false,
            last_tick: None,
            datagrams_sent: 0,
            datagrams_received: 0,
            datagrams_rejected: 0,
        }
    }

    /// Routes this channel's violations to `observer` instead of the tracing log.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// The configuration this channel was built with.
    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /*
     *  SENDING
     */

    /// Queues `msg` for reliable, ordered delivery and emits it once immediately.
    ///
    /// # Errors
    ///
    /// [`NetplayError::SerializationError`] if the message cannot be encoded or needs more
    /// fragments than a fragment index can count.
    pub fn send_reliable(&mut self, msg: M) -> Result<(), NetplayError> {
        let encoded = encode(&msg)?;
        if encoded.len() <= self.config.mtu {
            self.push_pending(SequencedPayload::Whole(msg));
            return Ok(());
        }

        let chunks = encoded.chunks(self.config.mtu);
        let count = u16::try_from(chunks.len()).map_err(|_| NetplayError::SerializationError {
            context: format!(
                "message of {} bytes needs more than {} fragments",
                encoded.len(),
                u16::MAX
            ),
        })?;
        trace!(
            bytes = encoded.len(),
            fragments = count,
            "Splitting message into fragments"
        );
        let tag = msg.tag();
        for (index, chunk) in chunks.enumerate() {
            self.push_pending(SequencedPayload::Fragment {
                tag,
                index: index as u16,
                count,
                bytes: chunk.to_vec(),
            });
        }
        Ok(())
    }

    /// Emits `msg` once, with no retransmission and no acknowledgement.
    pub fn send_unsequenced(&mut self, msg: M) {
        self.queue_datagram(Datagram::Unsequenced(msg));
    }

    fn push_pending(&mut self, payload: SequencedPayload<M>) {
        self.send_sequence = self.send_sequence.wrapping_add(1);
        let pending = Pending {
            sequence: self.send_sequence,
            payload,
        };
        self.queue_datagram(pending.datagram());
        self.pending.push_back(pending);
    }

    fn queue_datagram(&mut self, datagram: Datagram<M>) {
        trace!("Queuing datagram: {:?}", datagram);
        self.send_queue.push_back(datagram);
    }

    /// Skips the next keep-alive, for when the owner knows other traffic is about to go out.
    pub fn delay_keep_alive_once(&mut self) {
        self.skip_next_keep_alive = true;
    }

    /*
     *  TIMER
     */

    /// Runs [`on_timer_tick`](Self::on_timer_tick) if a send interval has passed since the last tick.
    pub fn poll_timer(&mut self, now: Instant) {
        match self.last_tick {
            Some(last) if now.saturating_duration_since(last) < self.config.send_interval => {},
            _ => {
                self.last_tick = Some(now);
                self.on_timer_tick();
            },
        }
    }

    /// One retransmission step.
    ///
    /// Resends the next pending datagram in round-robin order, or sends a keep-alive if
    /// nothing is pending. Then counts down the keep-alive window and reports
    /// [`ChannelEvent::TimedOut`] when it runs out.
    pub fn on_timer_tick(&mut self) {
        if self.timed_out {
            return;
        }

        if self.pending.is_empty() {
            if self.keep_alive_ticks.is_some() {
                if self.skip_next_keep_alive {
                    self.skip_next_keep_alive = false;
                } else {
                    self.queue_datagram(Datagram::KeepAlive);
                }
            }
        } else {
            if self.send_pos >= self.pending.len() {
                self.send_pos = 0;
            }
            if let Some(pending) = self.pending.get(self.send_pos) {
                let datagram = pending.datagram();
                self.queue_datagram(datagram);
            }
            self.send_pos += 1;
        }

        if self.keep_alive_ticks.is_some() {
            if self.keep_alive_countdown > 0 {
                self.keep_alive_countdown -= 1;
            } else {
                self.timed_out = true;
                debug!(
                    pending = self.pending.len(),
                    "Reliable channel timed out waiting for the peer"
                );
                self.event_queue.push_back(ChannelEvent::TimedOut);
            }
        }
    }

    /*
     *  RECEIVING
     */

    /// Decodes a raw datagram and processes it. Damaged datagrams are counted and dropped.
    pub fn on_receive_bytes(&mut self, bytes: &[u8]) {
        match decode_datagram::<M>(bytes) {
            Ok(datagram) => self.on_receive(datagram),
            Err(err) => {
                self.datagrams_rejected += 1;
                debug!(len = bytes.len(), "Dropping undecodable datagram: {}", err);
            },
        }
    }

    /// Processes one received datagram.
    pub fn on_receive(&mut self, datagram: Datagram<M>) {
        if self.timed_out {
            trace!("Channel timed out; ignoring datagram");
            return;
        }

        self.datagrams_received += 1;
        if let Some(ticks) = self.keep_alive_ticks {
            self.keep_alive_countdown = ticks;
        }

        match datagram {
            Datagram::KeepAlive => (),
            Datagram::Unsequenced(msg) => self.event_queue.push_back(ChannelEvent::Unsequenced(msg)),
            Datagram::Ack { sequence } => self.on_ack(sequence),
            Datagram::Sequenced { sequence, payload } => self.on_sequenced(sequence, payload),
        }
    }

    fn on_ack(&mut self, sequence: u32) {
        if sequence > self.send_sequence {
            report_violation_to!(
                self.observer,
                ViolationSeverity::Warning,
                ViolationKind::Transport,
                "Ack for sequence {} which was never sent (last sent {})",
                sequence,
                self.send_sequence
            );
            return;
        }

        self.ack_sequence = self.ack_sequence.max(sequence);
        let before = self.pending.len();
        while self
            .pending
            .front()
            .is_some_and(|p| p.sequence <= self.ack_sequence)
        {
            self.pending.pop_front();
        }
        if self.pending.len() != before {
            trace!(
                ack = self.ack_sequence,
                popped = before - self.pending.len(),
                "Acknowledged pending datagrams"
            );
            self.send_pos = 0;
        }
    }

    fn on_sequenced(&mut self, sequence: u32, payload: SequencedPayload<M>) {
        if sequence != self.recv_sequence.wrapping_add(1) {
            trace!(
                sequence,
                expected = self.recv_sequence.wrapping_add(1),
                "Out of order datagram; re-acking last good sequence"
            );
            self.queue_datagram(Datagram::Ack {
                sequence: self.recv_sequence,
            });
            return;
        }

        self.recv_sequence = sequence;
        self.queue_datagram(Datagram::Ack { sequence });

        match payload {
            SequencedPayload::Whole(msg) => {
                if !self.reassembly.is_empty() {
                    self.reject_fragments(format!(
                        "whole message at sequence {} interrupted a fragment run at piece {}",
                        sequence, self.reassembly.next_index
                    ));
                }
                self.event_queue.push_back(ChannelEvent::Delivered(msg));
            },
            SequencedPayload::Fragment {
                tag,
                index,
                count,
                bytes,
            } => self.on_fragment(sequence, tag, index, count, &bytes),
        }
    }

    fn on_fragment(&mut self, sequence: u32, tag: u8, index: u16, count: u16, bytes: &[u8]) {
        if index != self.reassembly.next_index
            || index >= count
            || (index > 0 && tag != self.reassembly.tag)
        {
            self.reject_fragments(format!(
                "fragment {}/{} (tag {}) at sequence {} does not continue the run at piece {} (tag {})",
                index, count, tag, sequence, self.reassembly.next_index, self.reassembly.tag
            ));
            return;
        }

        self.reassembly.tag = tag;
        self.reassembly.next_index = index + 1;
        self.reassembly.bytes.extend_from_slice(bytes);
        if index + 1 < count {
            return;
        }

        let decoded = decode_exact::<M>(&self.reassembly.bytes);
        let total = self.reassembly.bytes.len();
        self.reassembly.clear();
        match decoded {
            Ok(msg) if msg.tag() == tag => {
                trace!(bytes = total, fragments = count, "Reassembled message");
                self.event_queue.push_back(ChannelEvent::Delivered(msg));
            },
            Ok(msg) => self.reject_fragments(format!(
                "reassembled message has tag {} but its fragments announced {}",
                msg.tag(),
                tag
            )),
            Err(err) => self.reject_fragments(format!(
                "cannot decode {} reassembled bytes: {}",
                total, err
            )),
        }
    }

    fn reject_fragments(&mut self, context: String) {
        report_violation_to!(
            self.observer,
            ViolationSeverity::Error,
            ViolationKind::Transport,
            "{}",
            context
        );
        self.reassembly.clear();
        self.event_queue
            .push_back(ChannelEvent::ProtocolViolation(context));
    }

    /*
     *  OWNER INTERFACE
     */

    /// Returns every event produced since the last call.
    pub fn poll(&mut self) -> Drain<'_, ChannelEvent<M>> {
        self.event_queue.drain(..)
    }

    /// Returns every datagram queued for sending since the last call, unencoded.
    pub fn drain_outgoing(&mut self) -> Drain<'_, Datagram<M>> {
        self.datagrams_sent += self.send_queue.len() as u64;
        self.send_queue.drain(..)
    }

    /// Encodes and sends every queued datagram to `addr`.
    pub fn send_all_messages<A, S>(&mut self, socket: &mut S, addr: &A)
    where
        A: Clone + PartialEq + Eq + Hash + fmt::Debug,
        S: NonBlockingSocket<A> + ?Sized,
    {
        if self.send_queue.is_empty() {
            // avoid log spam if there's nothing to send
            return;
        }

        trace!("Sending {} datagrams to {:?}", self.send_queue.len(), addr);
        for datagram in self.send_queue.drain(..) {
            match encode_datagram(&datagram) {
                Ok(bytes) => {
                    self.datagrams_sent += 1;
                    socket.send_to(&bytes, addr);
                },
                Err(err) => {
                    report_violation_to!(
                        self.observer,
                        ViolationSeverity::Error,
                        ViolationKind::Transport,
                        "Failed to encode outgoing datagram: {}",
                        err
                    );
                },
            }
        }
    }

    /// Forgets every sequence, pending datagram and queued event.
    pub fn reset(&mut self) {
        self.send_queue.clear();
        self.event_queue.clear();
        self.send_sequence = 0;
        self.ack_sequence = 0;
        self.pending.clear();
        self.send_pos = 0;
        self.recv_sequence = 0;
        self.reassembly.clear();
        self.keep_alive_countdown = self.keep_alive_ticks.unwrap_or(0);
        self.skip_next_keep_alive = false;
        self.timed_out = false;
        self.last_tick = None;
    }

    /// Last sequence number assigned to an outgoing datagram.
    #[must_use]
    pub fn send_sequence(&self) -> u32 {
        self.send_sequence
    }

    /// Last sequence number delivered in order.
    #[must_use]
    pub fn recv_sequence(&self) -> u32 {
        self.recv_sequence
    }

    /// Highest sequence number the peer has acknowledged.
    #[must_use]
    pub fn ack_sequence(&self) -> u32 {
        self.ack_sequence
    }

    /// Number of datagrams still waiting for an acknowledgement.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether the keep-alive window ran out.
    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        self.timed_out
    }

    /// Datagrams handed out for sending.
    #[must_use]
    pub fn datagrams_sent(&self) -> u64 {
        self.datagrams_sent
    }

    /// Datagrams accepted by [`on_receive`](Self::on_receive).
    #[must_use]
    pub fn datagrams_received(&self) -> u64 {
        self.datagrams_received
    }

    /// Datagrams dropped for failing their checksum or decoding.
    #[must_use]
    pub fn datagrams_rejected(&self) -> u64 {
        self.datagrams_rejected
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::messages::{RngState, NetplayMessage};
    use crate::rng::{Pcg32, Rng, SeedableRng};
    use crate::telemetry::CollectingObserver;
    use crate::test_config::{lossy_tick_budget, miri_case_count};
    use crate::{assert_violation, ChaosConfig, ChaosSocket, IndexedFrame, LoopbackSocket, PlayerInputs};
    use proptest::prelude::*;
    use web_time::Duration;

    fn quiet_config() -> ChannelConfig {
        ChannelConfig {
            keep_alive: None,
            ..ChannelConfig::default()
        }
    }

    fn channel() -> ReliableChannel {
        ReliableChannel::new(quiet_config())
    }

    fn msg(index: u32) -> NetplayMessage {
        NetplayMessage::TransitionIndex { index }
    }

    fn big_msg(len: usize) -> NetplayMessage {
        NetplayMessage::RngState(RngState {
            index: 7,
            state: (0..len).map(|i| i as u8).collect(),
        })
    }

    fn delivered(ch: &mut ReliableChannel) -> Vec<NetplayMessage> {
        ch.poll()
            .filter_map(|e| match e {
                ChannelEvent::Delivered(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    /// Moves everything `from` queued into `to`, returning how many datagrams moved.
    fn pump(from: &mut ReliableChannel, to: &mut ReliableChannel) -> usize {
        let out: Vec<_> = from.drain_outgoing().collect();
        let n = out.len();
        for d in out {
            to.on_receive(d);
        }
        n
    }

    // ==========================================
    // Sending
    // ==========================================

    #[test]
    fn send_reliable_emits_immediately_and_stays_pending() {
        let mut a = channel();
        a.send_reliable(msg(1)).unwrap();
        let out: Vec<_> = a.drain_outgoing().collect();
        assert_eq!(
            out,
            vec![Datagram::Sequenced {
                sequence: 1,
                payload: SequencedPayload::Whole(msg(1)),
            }]
        );
        assert_eq!(a.pending_len(), 1);
        assert_eq!(a.send_sequence(), 1);
    }

    #[test]
    fn send_unsequenced_is_not_pending() {
        let mut a = channel();
        a.send_unsequenced(msg(3));
        assert_eq!(a.drain_outgoing().count(), 1);
        assert_eq!(a.pending_len(), 0);
        assert_eq!(a.send_sequence(), 0);
    }

    #[test]
    fn timer_resends_one_pending_per_tick_round_robin() {
        let mut a = channel();
        for i in 1..=3 {
            a.send_reliable(msg(i)).unwrap();
        }
        a.drain_outgoing().for_each(drop);

        let mut seen = Vec::new();
        for _ in 0..4 {
            a.on_timer_tick();
            let out: Vec<_> = a.drain_outgoing().collect();
            assert_eq!(out.len(), 1);
            if let Datagram::Sequenced { sequence, .. } = &out[0] {
                seen.push(*sequence);
            }
        }
        assert_eq!(seen, vec![1, 2, 3, 1]);
    }

    // ==========================================
    // Receiving
    // ==========================================

    #[test]
    fn in_order_delivery_acks_each_sequence() {
        let mut a = channel();
        let mut b = channel();
        a.send_reliable(msg(1)).unwrap();
        a.send_reliable(msg(2)).unwrap();
        pump(&mut a, &mut b);

        assert_eq!(delivered(&mut b), vec![msg(1), msg(2)]);
        assert_eq!(b.recv_sequence(), 2);
        let acks: Vec<_> = b.drain_outgoing().collect();
        assert_eq!(
            acks,
            vec![Datagram::Ack { sequence: 1 }, Datagram::Ack { sequence: 2 }]
        );
    }

    #[test]
    fn ack_trims_pending_through_sequence() {
        let mut a = channel();
        for i in 1..=3 {
            a.send_reliable(msg(i)).unwrap();
        }
        a.on_receive(Datagram::Ack { sequence: 2 });
        assert_eq!(a.pending_len(), 1);
        assert_eq!(a.ack_sequence(), 2);

        // A stale ack never moves the watermark backwards.
        a.on_receive(Datagram::Ack { sequence: 1 });
        assert_eq!(a.ack_sequence(), 2);
        assert_eq!(a.pending_len(), 1);
    }

    #[test]
    fn ack_for_unsent_sequence_is_reported_and_ignored() {
        let observer = Arc::new(CollectingObserver::new());
        let mut a: ReliableChannel = channel().with_observer(observer.clone());
        a.send_reliable(msg(1)).unwrap();
        a.on_receive(Datagram::Ack { sequence: 5 });
        assert_eq!(a.pending_len(), 1);
        assert_violation!(observer, ViolationKind::Transport);
    }

    #[test]
    fn out_of_order_is_dropped_and_last_good_reacked() {
        let mut b = channel();
        b.on_receive(Datagram::Sequenced {
            sequence: 2,
            payload: SequencedPayload::Whole(msg(2)),
        });
        assert!(delivered(&mut b).is_empty());
        assert_eq!(b.recv_sequence(), 0);
        assert_eq!(
            b.drain_outgoing().collect::<Vec<_>>(),
            vec![Datagram::Ack { sequence: 0 }]
        );
    }

    #[test]
    fn duplicate_is_never_delivered_twice() {
        let mut b = channel();
        let d = Datagram::Sequenced {
            sequence: 1,
            payload: SequencedPayload::Whole(msg(1)),
        };
        b.on_receive(d.clone());
        b.on_receive(d);
        assert_eq!(delivered(&mut b), vec![msg(1)]);
        assert_eq!(b.recv_sequence(), 1);
    }

    #[test]
    fn unsequenced_and_keep_alive() {
        let mut b = channel();
        b.on_receive(Datagram::KeepAlive);
        b.on_receive(Datagram::Unsequenced(msg(9)));
        let events: Vec<_> = b.poll().collect();
        assert_eq!(events, vec![ChannelEvent::Unsequenced(msg(9))]);
    }

    // ==========================================
    // Fragmentation
    // ==========================================

    #[test]
    fn oversized_message_is_fragmented_and_reassembled() {
        let mut a = channel();
        let mut b = channel();
        let big = big_msg(1000);
        a.send_reliable(big.clone()).unwrap();
        assert!(a.pending_len() > 1);
        pump(&mut a, &mut b);
        assert_eq!(delivered(&mut b), vec![big]);
        assert_eq!(b.recv_sequence(), a.send_sequence());
    }

    #[test]
    fn fragment_run_interrupted_by_foreign_piece_is_a_violation() {
        let observer = Arc::new(CollectingObserver::new());
        let mut b: ReliableChannel = channel().with_observer(observer.clone());
        b.on_receive(Datagram::Sequenced {
            sequence: 1,
            payload: SequencedPayload::Fragment {
                tag: 4,
                index: 0,
                count: 3,
                bytes: vec![1, 2, 3],
            },
        });
        b.on_receive(Datagram::Sequenced {
            sequence: 2,
            payload: SequencedPayload::Fragment {
                tag: 4,
                index: 2,
                count: 3,
                bytes: vec![4],
            },
        });
        let events: Vec<_> = b.poll().collect();
        assert!(matches!(events.as_slice(), [ChannelEvent::ProtocolViolation(_)]));
        assert_violation!(observer, ViolationKind::Transport);
    }

    #[test]
    fn fragments_with_garbage_body_are_a_violation() {
        let mut b = channel();
        b.on_receive(Datagram::Sequenced {
            sequence: 1,
            payload: SequencedPayload::Fragment {
                tag: 4,
                index: 0,
                count: 1,
                bytes: vec![0xff; 5],
            },
        });
        assert!(matches!(
            b.poll().next(),
            Some(ChannelEvent::ProtocolViolation(_))
        ));
    }

    #[test]
    fn reassembled_tag_mismatch_is_a_violation() {
        let inputs = NetplayMessage::PlayerInputs(PlayerInputs::new(IndexedFrame::new(1, 1)));
        let bytes = encode(&inputs).unwrap();
        let mut b = channel();
        b.on_receive(Datagram::Sequenced {
            sequence: 1,
            payload: SequencedPayload::Fragment {
                tag: 8,
                index: 0,
                count: 1,
                bytes,
            },
        });
        assert!(matches!(
            b.poll().next(),
            Some(ChannelEvent::ProtocolViolation(_))
        ));
    }

    // ==========================================
    // Keep-alive
    // ==========================================

    fn keep_alive_channel(ticks: u32) -> ReliableChannel {
        ReliableChannel::new(ChannelConfig {
            send_interval: Duration::from_millis(50),
            keep_alive: Some(Duration::from_millis(50 * u64::from(ticks))),
            ..ChannelConfig::default()
        })
    }

    #[test]
    fn keep_alive_sent_when_idle_and_can_be_skipped() {
        let mut a = keep_alive_channel(100);
        a.on_timer_tick();
        assert_eq!(
            a.drain_outgoing().collect::<Vec<_>>(),
            vec![Datagram::KeepAlive]
        );
        a.delay_keep_alive_once();
        a.on_timer_tick();
        assert_eq!(a.drain_outgoing().count(), 0);
        a.on_timer_tick();
        assert_eq!(a.drain_outgoing().count(), 1);
    }

    #[test]
    fn timeout_fires_exactly_once() {
        let mut a = keep_alive_channel(3);
        for _ in 0..10 {
            a.on_timer_tick();
        }
        let events: Vec<_> = a.poll().collect();
        assert_eq!(events, vec![ChannelEvent::TimedOut]);
        assert!(a.is_timed_out());

        a.on_timer_tick();
        assert_eq!(a.poll().count(), 0);
    }

    #[test]
    fn receiving_refreshes_the_countdown() {
        let mut a = keep_alive_channel(3);
        for _ in 0..20 {
            a.on_timer_tick();
            a.on_receive(Datagram::KeepAlive);
        }
        assert!(!a.is_timed_out());
    }

    #[test]
    fn poll_timer_respects_interval() {
        let mut a = keep_alive_channel(100);
        let start = Instant::now();
        a.poll_timer(start);
        a.poll_timer(start + Duration::from_millis(10));
        assert_eq!(a.drain_outgoing().count(), 1);
        a.poll_timer(start + Duration::from_millis(60));
        assert_eq!(a.drain_outgoing().count(), 1);
    }

    #[test]
    fn reset_clears_everything() {
        let mut a = keep_alive_channel(1);
        a.send_reliable(msg(1)).unwrap();
        a.on_timer_tick();
        a.on_timer_tick();
        a.reset();
        assert_eq!(a.send_sequence(), 0);
        assert_eq!(a.pending_len(), 0);
        assert!(!a.is_timed_out());
        assert_eq!(a.poll().count(), 0);
        assert_eq!(a.drain_outgoing().count(), 0);
    }

    // ==========================================
    // Lossy delivery
    // ==========================================

    /// Runs `messages` from a to b with per-datagram loss in both directions.
    fn deliver_lossy(messages: &[NetplayMessage], seed: u64, loss: f64) -> Vec<NetplayMessage> {
        let mut a = channel();
        let mut b = channel();
        let mut rng = Pcg32::seed_from_u64(seed);
        let mut received = Vec::new();

        for m in messages {
            a.send_reliable(m.clone()).unwrap();
        }
        for _ in 0..lossy_tick_budget() {
            a.on_timer_tick();
            for d in a.drain_outgoing().collect::<Vec<_>>() {
                if !rng.gen_bool(loss) {
                    b.on_receive(d);
                }
            }
            for d in b.drain_outgoing().collect::<Vec<_>>() {
                if !rng.gen_bool(loss) {
                    a.on_receive(d);
                }
            }
            received.extend(delivered(&mut b));
            if received.len() == messages.len() && a.pending_len() == 0 {
                break;
            }
        }
        received
    }

    struct ChaosRun {
        received: Vec<NetplayMessage>,
        corrupted: u64,
        rejected: u64,
    }

    /// Runs `messages` from a to b as encoded bytes over damaging sockets in both directions.
    fn deliver_through_chaos(
        messages: &[NetplayMessage],
        seed: u64,
        loss: f64,
        corruption: f64,
    ) -> ChaosRun {
        let chaos = |seed| {
            ChaosConfig::builder()
                .send_loss_rate(loss)
                .corruption_rate(corruption)
                .seed(seed)
                .build()
        };
        let (sa, sb) = LoopbackSocket::pair();
        let (to_a, to_b) = (sa.local_addr(), sb.local_addr());
        let mut sa = ChaosSocket::new(sa, chaos(seed));
        let mut sb = ChaosSocket::new(sb, chaos(seed.wrapping_add(1)));
        let mut a = channel();
        let mut b = channel();
        let mut received = Vec::new();

        for m in messages {
            a.send_reliable(m.clone()).unwrap();
        }
        for _ in 0..lossy_tick_budget() {
            a.on_timer_tick();
            a.send_all_messages(&mut sa, &to_b);
            for (_, bytes) in sb.receive_all_messages() {
                b.on_receive_bytes(&bytes);
            }
            b.send_all_messages(&mut sb, &to_a);
            for (_, bytes) in sa.receive_all_messages() {
                a.on_receive_bytes(&bytes);
            }
            received.extend(delivered(&mut b));
            if received.len() == messages.len() && a.pending_len() == 0 {
                break;
            }
        }
        ChaosRun {
            received,
            corrupted: sa.stats().corrupted + sb.stats().corrupted,
            rejected: a.datagrams_rejected() + b.datagrams_rejected(),
        }
    }

    #[test]
    fn five_messages_survive_half_loss_and_half_corruption() {
        let messages: Vec<_> = (1..=5).map(msg).collect();
        let run = deliver_through_chaos(&messages, 0xBAD5EED, 0.5, 0.5);
        assert_eq!(run.received, messages);
        assert!(run.corrupted > 0);
        assert_eq!(run.rejected, run.corrupted);
    }

    #[test]
    fn five_messages_arrive_in_order_under_half_loss() {
        let messages: Vec<_> = (1..=5).map(msg).collect();
        assert_eq!(deliver_lossy(&messages, 0xC0FFEE, 0.5), messages);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(miri_case_count().min(64)))]

        #[test]
        fn lossy_delivery_is_exactly_once_in_order(
            seed in any::<u64>(),
            loss in 0.0f64..0.5,
            count in 1u32..12,
            big_every in 2u32..6,
        ) {
            let messages: Vec<_> = (1..=count)
                .map(|i| if i % big_every == 0 { big_msg(600) } else { msg(i) })
                .collect();
            prop_assert_eq!(deliver_lossy(&messages, seed, loss), messages);
        }

        #[test]
        fn damaged_bytes_are_rejected_and_delivery_stays_exact(
            seed in any::<u64>(),
            loss in 0.0f64..0.5,
            corruption in 0.0f64..0.5,
            count in 1u32..8,
            big_every in 2u32..6,
        ) {
            let messages: Vec<_> = (1..=count)
                .map(|i| if i % big_every == 0 { big_msg(600) } else { msg(i) })
                .collect();
            let run = deliver_through_chaos(&messages, seed, loss, corruption);
            prop_assert_eq!(run.received, messages);
            prop_assert_eq!(run.rejected, run.corrupted);
        }

        #[test]
        fn recv_sequence_never_skips(order in proptest::collection::vec(1u32..20, 0..60)) {
            let mut b = channel();
            let mut last = 0;
            for sequence in order {
                b.on_receive(Datagram::Sequenced {
                    sequence,
                    payload: SequencedPayload::Whole(msg(sequence)),
                });
                let now = b.recv_sequence();
                prop_assert!(now == last || now == last + 1);
                last = now;
            }
            let got = delivered(&mut b);
            let expected: Vec<_> = (1..=last).map(msg).collect();
            prop_assert_eq!(got, expected);
        }
    }
}
