//! # netplay-rollback
//!
//! Two-peer lockstep netplay for deterministic simulations. Latency is hidden with a fixed
//! input delay and, optionally, speculative rollback: the local simulation runs ahead on
//! predicted remote input and is rewound and replayed whenever the real input disagrees.
//!
//! The crate is built from four cooperating pieces:
//!
//! - [`ReliableChannel`]: a go-back-N sequenced transport over an unreliable datagram socket.
//! - [`InputTimeline`]: a sparse `(transition index, frame)` addressed input buffer with
//!   prediction and change detection.
//! - [`NetplaySession`]: the netplay state machine and the per-frame readiness and rollback
//!   decisions.
//! - [`SnapshotStore`]: a fixed pool of serialized simulation snapshots plus per-tick
//!   side-effect suppression for re-simulation.
//!
//! Nothing here spawns threads or blocks. The embedding driver ticks every component from its
//! own loop and feeds received datagrams in as they arrive.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
use std::{fmt, hash::Hash};

pub use error::{InvalidRequestKind, NetplayError};
pub use input_timeline::InputTimeline;
pub use network::chaos_socket::{ChaosConfig, ChaosConfigBuilder, ChaosSocket, ChaosStats};
pub use network::loopback_socket::LoopbackSocket;
pub use network::messages::{
    BothInputs, ChangeConfig, ChangeConfigKind, Datagram, MessageKind, NetplayMessage,
    PlayerInputs, SequencedPayload, SyncHash,
};
pub use network::reliable_channel::{ChannelEvent, ReliableChannel};
pub use network::udp_socket::UdpNonBlockingSocket;
pub use session::config::{ChannelConfig, ClientMode, InputMask, NetplayConfig, WaitConfig};
pub use session::netplay_session::NetplaySession;
pub use session::state::NetplayState;
pub use session::wait::WaitTracker;
pub use snapshot_store::{SideEffectHistory, Simulation, SnapshotMeta, SnapshotStore};

#[doc(hidden)]
pub mod error;
pub mod hash;
pub mod input_timeline;
/// Internal random number generator module based on PCG32.
///
/// Drives the fault injection in [`ChaosSocket`] without pulling in the `rand` crate.
pub mod rng;
pub mod snapshot_store;
pub mod telemetry;
#[doc(hidden)]
pub mod test_config;
pub mod session {
    //! The netplay state machine and its configuration.
    pub mod config;
    pub mod netplay_session;
    pub mod state;
    pub mod wait;
}
pub mod network {
    //! Wire messages, the reliable channel and socket adapters.
    pub mod chaos_socket;
    /// Binary codec for network message serialization.
    ///
    /// Provides centralized encoding and decoding of wire messages using bincode,
    /// plus the checksummed datagram framing used by every socket adapter.
    pub mod codec;
    pub mod loopback_socket;
    pub mod messages;
    pub mod reliable_channel;
    pub mod udp_socket;
}

// #############
// # CONSTANTS #
// #############

/// A single player's input for one frame: a direction nibble plus button bits.
pub type Input = u16;

/// Number of frames of input history carried by every [`PlayerInputs`] message.
pub const NUM_INPUTS: usize = 30;

/// Upper bound for the negotiated rollback window.
pub const MAX_ROLLBACK: u8 = 9;

/// Safety margin subtracted from the preserve watermark before old transition indices are pruned.
pub const PRESERVE_START_INDEX_BUFFER: u32 = 5;

/// Default number of snapshot slots, which bounds how far back a rollback can reach.
pub const DEFAULT_SNAPSHOT_CAPACITY: usize = 256;

/// A point on the netplay timeline: a transition index and a frame within that index.
///
/// Both halves are packed into one `u64` with the index in the high 32 bits, so the derived
/// ordering sorts first by index and then by frame. Every later point on the timeline compares
/// greater than every earlier one.
///
/// [`IndexedFrame::MAX`] is reserved as the "no frame" marker.
///
/// # Examples
///
/// ```
/// use netplay_rollback::IndexedFrame;
///
/// let a = IndexedFrame::new(2, 500);
/// let b = IndexedFrame::new(3, 0);
/// assert!(a < b);
/// assert_eq!(a.to_string(), "2:500");
/// assert!(IndexedFrame::MAX.is_max());
/// ```
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct IndexedFrame(u64);

impl IndexedFrame {
    /// The "no frame" marker. Compares greater than every real point on the timeline.
    pub const MAX: IndexedFrame = IndexedFrame(u64::MAX);

    /// The very first frame of the very first transition index.
    pub const ZERO: IndexedFrame = IndexedFrame(0);

    /// Packs a transition index and a frame.
    #[inline]
    #[must_use]
    pub const fn new(index: u32, frame: u32) -> Self {
        IndexedFrame(((index as u64) << 32) | frame as u64)
    }

    /// Rebuilds an `IndexedFrame` from its packed representation.
    #[inline]
    #[must_use]
    pub const fn from_value(value: u64) -> Self {
        IndexedFrame(value)
    }

    /// Returns the packed representation.
    #[inline]
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Returns the transition index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Returns the frame within the transition index.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> u32 {
        self.0 as u32
    }

    /// Returns a copy with the index replaced.
    #[inline]
    #[must_use]
    pub const fn with_index(self, index: u32) -> Self {
        IndexedFrame::new(index, self.frame())
    }

    /// Returns a copy with the frame replaced.
    #[inline]
    #[must_use]
    pub const fn with_frame(self, frame: u32) -> Self {
        IndexedFrame::new(self.index(), frame)
    }

    /// Returns `true` for the [`IndexedFrame::MAX`] marker.
    #[inline]
    #[must_use]
    pub const fn is_max(self) -> bool {
        self.0 == u64::MAX
    }
}

impl fmt::Display for IndexedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_max() {
            write!(f, "MAX")
        } else {
            write!(f, "{}:{}", self.index(), self.frame())
        }
    }
}

impl fmt::Debug for IndexedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexedFrame")
            .field("index", &self.index())
            .field("frame", &self.frame())
            .finish()
    }
}

// #############
// #   ENUMS   #
// #############

/// One of the two players in a netplay match.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum Player {
    /// Player 1.
    One,
    /// Player 2.
    Two,
}

impl Player {
    /// Both players in order.
    pub const ALL: [Player; 2] = [Player::One, Player::Two];

    /// Returns the 1-based player number.
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Player::One => 1,
            Player::Two => 2,
        }
    }

    /// Returns the 0-based index used for per-player storage.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Player::One => 0,
            Player::Two => 1,
        }
    }

    /// Returns the opposing player.
    #[must_use]
    pub const fn other(self) -> Player {
        match self {
            Player::One => Player::Two,
            Player::Two => Player::One,
        }
    }

    /// Parses a 1-based player number.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidRequestKind::InvalidPlayerNumber`] for anything other than 1 or 2.
    pub fn from_number(number: u8) -> Result<Player, NetplayError> {
        match number {
            1 => Ok(Player::One),
            2 => Ok(Player::Two),
            _ => Err(InvalidRequestKind::InvalidPlayerNumber { number }.into()),
        }
    }
}

impl fmt::Display for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.number())
    }
}

/// Desync detection by comparing state hashes between peers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DesyncDetection {
    /// Desync detection is turned on with a specified interval rate given by the user.
    On {
        /// Interval in frames. At 60hz an interval of 10 results in 6 reports a second.
        interval: u32,
    },
    /// Desync detection is turned off
    Off,
}

// #############
// #  TRAITS   #
// #############

/// This [`NonBlockingSocket`] trait is used when you want to plug your own transport into a
/// [`ReliableChannel`]. Datagrams should be sent in a UDP-like fashion, unordered and unreliable.
/// The channel layers sequencing, acknowledgement and retransmission on top.
///
/// Payloads are opaque checksummed frames produced by
/// [`codec::encode_datagram`](network::codec::encode_datagram); a socket never needs to look
/// inside them.
pub trait NonBlockingSocket<A>
where
    A: Clone + PartialEq + Eq + Hash,
{
    /// Sends one encoded datagram to the given address.
    fn send_to(&mut self, bytes: &[u8], addr: &A);

    /// Returns every datagram received since the last call, paired with its sender.
    fn receive_all_messages(&mut self) -> Vec<(A, Vec<u8>)>;
}

// ###################
// # UNIT TESTS      #
// ###################

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::test_config::miri_case_count;
    use proptest::prelude::*;

    // ==========================================
    // IndexedFrame Tests
    // ==========================================

    #[test]
    fn indexed_frame_packs_index_high() {
        let f = IndexedFrame::new(7, 42);
        assert_eq!(f.index(), 7);
        assert_eq!(f.frame(), 42);
        assert_eq!(f.value(), (7u64 << 32) | 42);
    }

    #[test]
    fn indexed_frame_orders_by_index_first() {
        assert!(IndexedFrame::new(1, u32::MAX - 1) < IndexedFrame::new(2, 0));
        assert!(IndexedFrame::new(2, 3) < IndexedFrame::new(2, 4));
        assert!(IndexedFrame::new(u32::MAX - 1, 0) < IndexedFrame::MAX);
    }

    #[test]
    fn indexed_frame_with_replaces_one_half() {
        let f = IndexedFrame::new(3, 9);
        assert_eq!(f.with_frame(1), IndexedFrame::new(3, 1));
        assert_eq!(f.with_index(8), IndexedFrame::new(8, 9));
    }

    #[test]
    fn indexed_frame_display_and_debug() {
        assert_eq!(IndexedFrame::new(2, 10).to_string(), "2:10");
        assert_eq!(IndexedFrame::MAX.to_string(), "MAX");
        assert_eq!(
            format!("{:?}", IndexedFrame::new(1, 2)),
            "IndexedFrame { index: 1, frame: 2 }"
        );
    }

    #[test]
    fn indexed_frame_default_is_zero() {
        assert_eq!(IndexedFrame::default(), IndexedFrame::ZERO);
        assert!(!IndexedFrame::ZERO.is_max());
    }

    // ==========================================
    // Player Tests
    // ==========================================

    #[test]
    fn player_numbers_and_indices() {
        assert_eq!(Player::One.number(), 1);
        assert_eq!(Player::Two.number(), 2);
        assert_eq!(Player::One.index(), 0);
        assert_eq!(Player::Two.index(), 1);
        assert_eq!(Player::One.other(), Player::Two);
        assert_eq!(Player::Two.other(), Player::One);
        assert_eq!(Player::Two.to_string(), "P2");
    }

    #[test]
    fn player_from_number_rejects_out_of_range() {
        assert_eq!(Player::from_number(1).unwrap(), Player::One);
        assert_eq!(Player::from_number(2).unwrap(), Player::Two);
        for bad in [0u8, 3, 255] {
            let err = Player::from_number(bad).unwrap_err();
            assert!(matches!(
                err,
                NetplayError::InvalidRequest {
                    kind: InvalidRequestKind::InvalidPlayerNumber { number }
                } if number == bad
            ));
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(miri_case_count()))]

        #[test]
        fn indexed_frame_order_matches_tuple_order(
            a in (0u32..u32::MAX, any::<u32>()),
            b in (0u32..u32::MAX, any::<u32>()),
        ) {
            let fa = IndexedFrame::new(a.0, a.1);
            let fb = IndexedFrame::new(b.0, b.1);
            prop_assert_eq!(fa.cmp(&fb), a.cmp(&b));
            prop_assert_eq!(IndexedFrame::from_value(fa.value()), fa);
        }
    }
}
