//! Fault injection for datagram sockets.
//!
//! [`ChaosSocket`] wraps any [`NonBlockingSocket`] and damages the traffic passing through it:
//! datagrams are dropped, duplicated, corrupted, held back or shuffled. Everything is driven by
//! a seeded [`Pcg32`], so a failing run can be replayed from its seed.
//!
//! Delay is counted in receive polls rather than wall time. A datagram held for three polls
//! comes out of the third [`receive_all_messages`](NonBlockingSocket::receive_all_messages)
//! call after it arrived, no matter how fast the test loop spins.
//!
//! ```rust
//! use netplay_rollback::{ChaosConfig, ChaosSocket, LoopbackSocket, NonBlockingSocket};
//!
//! let (a, mut b) = LoopbackSocket::pair();
//! let config = ChaosConfig::builder().loss_rate(1.0).seed(7).build();
//! let mut a = ChaosSocket::new(a, config);
//!
//! a.send_to(&[1, 2, 3], &b.local_addr());
//! assert!(b.receive_all_messages().is_empty());
//! assert_eq!(a.stats().dropped_send, 1);
//! ```

use std::collections::VecDeque;
use std::hash::Hash;

use tracing::trace;

use crate::rng::{Pcg32, Rng, SeedableRng};
use crate::NonBlockingSocket;

/// Which faults to inject, and how often.
///
/// Rates are probabilities in `[0.0, 1.0]` applied independently to each datagram.
/// The default injects nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct ChaosConfig {
    /// Chance that an outgoing datagram never reaches the inner socket.
    pub send_loss_rate: f64,
    /// Chance that a received datagram is discarded.
    pub receive_loss_rate: f64,
    /// Chance that an outgoing datagram is sent twice.
    pub duplication_rate: f64,
    /// Chance that one byte of an outgoing datagram is flipped.
    pub corruption_rate: f64,
    /// Receive polls every incoming datagram is held for.
    pub delay_polls: u32,
    /// Extra random hold, uniform in `0..=jitter_polls`. Nonzero jitter reorders traffic.
    pub jitter_polls: u32,
    /// Chance of starting a run of consecutive outgoing losses.
    pub burst_loss_probability: f64,
    /// Length of each loss run.
    pub burst_loss_length: usize,
    /// Seed for the fault pattern. `None` seeds from the clock.
    pub seed: Option<u64>,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            send_loss_rate: 0.0,
            receive_loss_rate: 0.0,
            duplication_rate: 0.0,
            corruption_rate: 0.0,
            delay_polls: 0,
            jitter_polls: 0,
            burst_loss_probability: 0.0,
            burst_loss_length: 0,
            seed: None,
        }
    }
}

impl ChaosConfig {
    /// Starts a builder with nothing injected.
    #[must_use]
    pub fn builder() -> ChaosConfigBuilder {
        ChaosConfigBuilder::default()
    }

    /// Passes everything through untouched.
    #[must_use]
    pub fn passthrough() -> Self {
        Self::default()
    }

    /// Drops `rate` of the traffic on the sending side.
    #[must_use]
    pub fn lossy(rate: f64) -> Self {
        Self::builder().send_loss_rate(rate).build()
    }

    /// A bad connection: loss both ways, some corruption, duplication and reordering.
    #[must_use]
    pub fn terrible_network() -> Self {
        Self::builder()
            .send_loss_rate(0.15)
            .receive_loss_rate(0.15)
            .duplication_rate(0.05)
            .corruption_rate(0.05)
            .delay_polls(1)
            .jitter_polls(3)
            .build()
    }
}

/// Builder for [`ChaosConfig`]. Rates are clamped to `[0.0, 1.0]`.
#[derive(Debug, Clone, Default)]
pub struct ChaosConfigBuilder {
    config: ChaosConfig,
}

impl ChaosConfigBuilder {
    /// Loss rate for both directions.
    #[must_use]
    pub fn loss_rate(mut self, rate: f64) -> Self {
        self.config.send_loss_rate = rate.clamp(0.0, 1.0);
        self.config.receive_loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Loss rate for outgoing datagrams.
    #[must_use]
    pub fn send_loss_rate(mut self, rate: f64) -> Self {
        self.config.send_loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Loss rate for incoming datagrams.
    #[must_use]
    pub fn receive_loss_rate(mut self, rate: f64) -> Self {
        self.config.receive_loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Duplication rate for outgoing datagrams.
    #[must_use]
    pub fn duplication_rate(mut self, rate: f64) -> Self {
        self.config.duplication_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Corruption rate for outgoing datagrams.
    #[must_use]
    pub fn corruption_rate(mut self, rate: f64) -> Self {
        self.config.corruption_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Fixed hold for incoming datagrams, in receive polls.
    #[must_use]
    pub fn delay_polls(mut self, polls: u32) -> Self {
        self.config.delay_polls = polls;
        self
    }

    /// Random extra hold for incoming datagrams, in receive polls.
    #[must_use]
    pub fn jitter_polls(mut self, polls: u32) -> Self {
        self.config.jitter_polls = polls;
        self
    }

    /// Runs of `length` consecutive outgoing losses, each started with `probability`.
    #[must_use]
    pub fn burst_loss(mut self, probability: f64, length: usize) -> Self {
        self.config.burst_loss_probability = probability.clamp(0.0, 1.0);
        self.config.burst_loss_length = length;
        self
    }

    /// Seed for a reproducible fault pattern.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    /// Finishes the configuration.
    #[must_use]
    pub fn build(self) -> ChaosConfig {
        self.config
    }
}

/// Counters for every fault [`ChaosSocket`] injected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChaosStats {
    /// Datagrams handed to `send_to`.
    pub sent: u64,
    /// Outgoing datagrams dropped by the loss rate.
    pub dropped_send: u64,
    /// Outgoing datagrams dropped inside a loss burst.
    pub dropped_burst: u64,
    /// Loss bursts started.
    pub burst_events: u64,
    /// Extra copies sent.
    pub duplicated: u64,
    /// Datagrams sent with a flipped byte.
    pub corrupted: u64,
    /// Datagrams pulled from the inner socket.
    pub received: u64,
    /// Incoming datagrams dropped by the loss rate.
    pub dropped_receive: u64,
    /// Datagrams handed back to the caller.
    pub delivered: u64,
}

struct Held<A> {
    addr: A,
    bytes: Vec<u8>,
    release_at: u64,
}

/// A [`NonBlockingSocket`] wrapper that damages traffic according to a [`ChaosConfig`].
pub struct ChaosSocket<A, S>
where
    A: Clone + PartialEq + Eq + Hash,
    S: NonBlockingSocket<A>,
{
    inner: S,
    config: ChaosConfig,
    rng: Pcg32,
    held: VecDeque<Held<A>>,
    polls: u64,
    burst_remaining: usize,
    stats: ChaosStats,
}

impl<A, S> ChaosSocket<A, S>
where
    A: Clone + PartialEq + Eq + Hash,
    S: NonBlockingSocket<A>,
{
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: S, config: ChaosConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => Pcg32::seed_from_u64(seed),
            None => Pcg32::from_entropy(),
        };
        Self {
            inner,
            config,
            rng,
            held: VecDeque::new(),
            polls: 0,
            burst_remaining: 0,
            stats: ChaosStats::default(),
        }
    }

    /// The wrapped socket.
    #[must_use]
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// The wrapped socket, mutably.
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Unwraps the inner socket, discarding anything still held.
    #[must_use]
    pub fn into_inner(self) -> S {
        self.inner
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &ChaosConfig {
        &self.config
    }

    /// Swaps the configuration. The random stream carries on.
    pub fn set_config(&mut self, config: ChaosConfig) {
        self.config = config;
    }

    /// Fault counters so far.
    #[must_use]
    pub fn stats(&self) -> ChaosStats {
        self.stats
    }

    /// Incoming datagrams still being held back.
    #[must_use]
    pub fn held_len(&self) -> usize {
        self.held.len()
    }

    fn in_burst(&mut self) -> bool {
        if self.burst_remaining > 0 {
            self.burst_remaining -= 1;
            self.stats.dropped_burst += 1;
            return true;
        }
        if self.config.burst_loss_length > 0
            && self.rng.gen_bool(self.config.burst_loss_probability)
        {
            self.stats.burst_events += 1;
            self.stats.dropped_burst += 1;
            self.burst_remaining = self.config.burst_loss_length - 1;
            return true;
        }
        false
    }

    fn corrupt(&mut self, bytes: &[u8]) -> Vec<u8> {
        let mut damaged = bytes.to_vec();
        if !damaged.is_empty() {
            let pos = self.rng.gen_range_usize(0..damaged.len());
            let flip = self.rng.gen_range(1..256) as u8;
            if let Some(byte) = damaged.get_mut(pos) {
                *byte ^= flip;
            }
        }
        damaged
    }

    fn forward(&mut self, bytes: &[u8], addr: &A) {
        if self.rng.gen_bool(self.config.corruption_rate) {
            self.stats.corrupted += 1;
            let damaged = self.corrupt(bytes);
            self.inner.send_to(&damaged, addr);
        } else {
            self.inner.send_to(bytes, addr);
        }
    }
}

impl<A, S> NonBlockingSocket<A> for ChaosSocket<A, S>
where
    A: Clone + PartialEq + Eq + Hash,
    S: NonBlockingSocket<A>,
{
    fn send_to(&mut self, bytes: &[u8], addr: &A) {
        self.stats.sent += 1;
        if self.in_burst() {
            return;
        }
        if self.rng.gen_bool(self.config.send_loss_rate) {
            self.stats.dropped_send += 1;
            return;
        }

        self.forward(bytes, addr);
        if self.rng.gen_bool(self.config.duplication_rate) {
            self.stats.duplicated += 1;
            self.forward(bytes, addr);
        }
    }

    fn receive_all_messages(&mut self) -> Vec<(A, Vec<u8>)> {
        self.polls += 1;
        for (addr, bytes) in self.inner.receive_all_messages() {
            self.stats.received += 1;
            if self.rng.gen_bool(self.config.receive_loss_rate) {
                self.stats.dropped_receive += 1;
                continue;
            }
            let jitter = if self.config.jitter_polls > 0 {
                u64::from(self.rng.gen_range(0..self.config.jitter_polls + 1))
            } else {
                0
            };
            let release_at = self.polls + u64::from(self.config.delay_polls) + jitter;
            self.held.push_back(Held {
                addr,
                bytes,
                release_at,
            });
        }

        let polls = self.polls;
        let (ready, waiting): (Vec<_>, Vec<_>) = self
            .held
            .drain(..)
            .partition(|held| held.release_at <= polls);
        self.held = waiting.into();

        if !ready.is_empty() {
            trace!(
                delivered = ready.len(),
                held = self.held.len(),
                "Chaos socket releasing datagrams"
            );
        }
        self.stats.delivered += ready.len() as u64;
        ready.into_iter().map(|h| (h.addr, h.bytes)).collect()
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
    use crate::LoopbackSocket;

    fn pair(config: ChaosConfig) -> (ChaosSocket<u16, LoopbackSocket>, LoopbackSocket) {
        let (a, b) = LoopbackSocket::pair();
        (ChaosSocket::new(a, config), b)
    }

    #[test]
    fn passthrough_delivers_everything() {
        let (mut a, mut b) = pair(ChaosConfig::passthrough());
        let to = b.local_addr();
        for i in 0..10u8 {
            a.send_to(&[i], &to);
        }
        let got: Vec<_> = b.receive_all_messages().into_iter().map(|(_, m)| m).collect();
        assert_eq!(got, (0..10u8).map(|i| vec![i]).collect::<Vec<_>>());
        assert_eq!(a.stats().sent, 10);
        assert_eq!(a.stats().dropped_send, 0);
    }

    #[test]
    fn full_loss_drops_everything() {
        let (mut a, mut b) = pair(ChaosConfig::lossy(1.0));
        let to = b.local_addr();
        for _ in 0..5 {
            a.send_to(&[1], &to);
        }
        assert!(b.receive_all_messages().is_empty());
        assert_eq!(a.stats().dropped_send, 5);
    }

    #[test]
    fn full_duplication_doubles_traffic() {
        let (mut a, mut b) = pair(ChaosConfig::builder().duplication_rate(1.0).seed(1).build());
        let to = b.local_addr();
        a.send_to(&[9], &to);
        assert_eq!(b.receive_all_messages().len(), 2);
        assert_eq!(a.stats().duplicated, 1);
    }

    #[test]
    fn corruption_changes_exactly_one_byte() {
        let (mut a, mut b) = pair(ChaosConfig::builder().corruption_rate(1.0).seed(3).build());
        let to = b.local_addr();
        let original = vec![0u8; 16];
        a.send_to(&original, &to);
        let (_, damaged) = b.receive_all_messages().pop().unwrap();
        let diffs = original.iter().zip(&damaged).filter(|(x, y)| x != y).count();
        assert_eq!(diffs, 1);
    }

    #[test]
    fn burst_loss_drops_consecutive_datagrams() {
        let (mut a, mut b) = pair(ChaosConfig::builder().burst_loss(1.0, 3).seed(5).build());
        let to = b.local_addr();
        for _ in 0..3 {
            a.send_to(&[0], &to);
        }
        assert!(b.receive_all_messages().is_empty());
        assert_eq!(a.stats().burst_events, 1);
        assert_eq!(a.stats().dropped_burst, 3);
    }

    #[test]
    fn delay_holds_for_the_configured_polls() {
        let (mut a, b) = LoopbackSocket::pair();
        let mut b = ChaosSocket::new(b, ChaosConfig::builder().delay_polls(2).seed(0).build());
        let to = b.inner().local_addr();
        a.send_to(&[7], &to);
        assert!(b.receive_all_messages().is_empty());
        assert_eq!(b.held_len(), 1);
        assert!(b.receive_all_messages().is_empty());
        assert_eq!(b.receive_all_messages().len(), 1);
    }

    #[test]
    fn same_seed_same_pattern() {
        let run = || {
            let (mut a, mut b) = pair(ChaosConfig::builder().loss_rate(0.5).seed(99).build());
            let to = b.local_addr();
            for i in 0..50u8 {
                a.send_to(&[i], &to);
            }
            b.receive_all_messages()
        };
        assert_eq!(run(), run());
    }
}
