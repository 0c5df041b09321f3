//! Wire messages exchanged by two netplay peers and the datagram envelope that carries them.

use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{IndexedFrame, Input, Player, NUM_INPUTS};

/// Anything a [`ReliableChannel`](crate::ReliableChannel) can carry.
///
/// `tag` identifies the message type so a reassembled fragment run can be checked against the
/// type its first fragment announced.
pub trait ChannelMessage: Serialize + DeserializeOwned + Clone + PartialEq + fmt::Debug {
    /// A small discriminator for the message type.
    fn tag(&self) -> u8;
}

/// Start of the input window ending at `frame`: `NUM_INPUTS` frames back, clamped at 0.
const fn window_start(frame: u32) -> u32 {
    let end = window_end(frame);
    if end < NUM_INPUTS as u32 {
        0
    } else {
        end - NUM_INPUTS as u32
    }
}

const fn window_end(frame: u32) -> u32 {
    frame.saturating_add(1)
}

/// The most recent `NUM_INPUTS` inputs of one player, ending at `indexed_frame`.
///
/// `inputs[i]` belongs to frame `start_frame() + i`; slots past `size()` are unused.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInputs {
    /// Last frame covered by the window.
    pub indexed_frame: IndexedFrame,
    /// The window contents.
    pub inputs: [Input; NUM_INPUTS],
}

impl PlayerInputs {
    /// An all-zero window ending at `indexed_frame`.
    #[must_use]
    pub fn new(indexed_frame: IndexedFrame) -> Self {
        Self {
            indexed_frame,
            inputs: [0; NUM_INPUTS],
        }
    }

    /// Transition index of the window.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.indexed_frame.index()
    }

    /// First frame in the window.
    #[must_use]
    pub fn start_frame(&self) -> u32 {
        window_start(self.indexed_frame.frame())
    }

    /// One past the last frame in the window.
    #[must_use]
    pub fn end_frame(&self) -> u32 {
        window_end(self.indexed_frame.frame())
    }

    /// Number of meaningful slots.
    #[must_use]
    pub fn size(&self) -> usize {
        (self.end_frame() - self.start_frame()) as usize
    }

    /// The meaningful part of the window.
    #[must_use]
    pub fn window(&self) -> &[Input] {
        &self.inputs[..self.size()]
    }
}

/// Both players' input windows, as served to spectators.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BothInputs {
    /// Last frame covered by the window.
    pub indexed_frame: IndexedFrame,
    /// Window contents, indexed by [`Player::index`].
    pub inputs: [[Input; NUM_INPUTS]; 2],
}

impl BothInputs {
    /// An all-zero window ending at `indexed_frame`.
    #[must_use]
    pub fn new(indexed_frame: IndexedFrame) -> Self {
        Self {
            indexed_frame,
            inputs: [[0; NUM_INPUTS]; 2],
        }
    }

    /// Transition index of the window.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.indexed_frame.index()
    }

    /// First frame in the window.
    #[must_use]
    pub fn start_frame(&self) -> u32 {
        window_start(self.indexed_frame.frame())
    }

    /// One past the last frame in the window.
    #[must_use]
    pub fn end_frame(&self) -> u32 {
        window_end(self.indexed_frame.frame())
    }

    /// Number of meaningful slots per player.
    #[must_use]
    pub fn size(&self) -> usize {
        (self.end_frame() - self.start_frame()) as usize
    }

    /// The meaningful part of one player's window.
    #[must_use]
    pub fn window(&self, player: Player) -> &[Input] {
        &self.inputs[player.index()][..self.size()]
    }
}

/// A serialized RNG state to be applied at the start of a transition index.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngState {
    /// Transition index the state belongs to.
    pub index: u32,
    /// Opaque RNG blob.
    pub state: Vec<u8>,
}

impl fmt::Debug for RngState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { index, state } = self;
        f.debug_struct("RngState")
            .field("index", index)
            .field("state", &BytesDebug(state))
            .finish()
    }
}

/// Which setting a [`ChangeConfig`] renegotiates.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeConfigKind {
    /// Input delay change.
    Delay,
    /// Rollback window change.
    Rollback,
}

/// A mid-session change to delay or rollback, effective from `indexed_frame`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeConfig {
    /// What is being changed.
    pub kind: ChangeConfigKind,
    /// First frame the new values apply to.
    pub indexed_frame: IndexedFrame,
    /// New input delay.
    pub delay: u8,
    /// New rollback window.
    pub rollback: u8,
    /// New rollback prediction delay.
    pub rollback_delay: u8,
}

impl ChangeConfig {
    /// Frames of local input lead implied by these settings.
    #[must_use]
    pub fn offset(&self) -> u8 {
        if self.rollback > 0 {
            self.rollback_delay
        } else {
            self.delay
        }
    }
}

/// A state hash taken at one frame, exchanged for desync detection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncHash {
    /// Frame the hash was taken at.
    pub indexed_frame: IndexedFrame,
    /// FNV-1a of the encoded simulation state.
    pub hash: u64,
    /// Human readable rendering of the state for postmortems.
    pub dump: String,
}

/// Discriminator for [`NetplayMessage`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// [`NetplayMessage::PlayerInputs`]
    PlayerInputs = 1,
    /// [`NetplayMessage::BothInputs`]
    BothInputs = 2,
    /// [`NetplayMessage::TransitionIndex`]
    TransitionIndex = 3,
    /// [`NetplayMessage::RngState`]
    RngState = 4,
    /// [`NetplayMessage::MenuIndex`]
    MenuIndex = 5,
    /// [`NetplayMessage::ChangeConfig`]
    ChangeConfig = 6,
    /// [`NetplayMessage::ErrorMessage`]
    ErrorMessage = 7,
    /// [`NetplayMessage::SyncHash`]
    SyncHash = 8,
}

/// Application messages exchanged between two netplay peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetplayMessage {
    /// Recent inputs of one player.
    PlayerInputs(PlayerInputs),
    /// Recent inputs of both players, for spectators.
    BothInputs(BothInputs),
    /// The sender has reached this transition index.
    TransitionIndex {
        /// The sender's current index.
        index: u32,
    },
    /// RNG state for a transition index.
    RngState(RngState),
    /// A retry menu choice.
    MenuIndex {
        /// Transition index the choice was made in.
        index: u32,
        /// The chosen entry; negative means none.
        menu_index: i8,
    },
    /// Delay or rollback renegotiation.
    ChangeConfig(ChangeConfig),
    /// The sender is aborting.
    ErrorMessage {
        /// Why.
        error: String,
    },
    /// State hash for desync detection.
    SyncHash(SyncHash),
}

impl NetplayMessage {
    /// The discriminator of this message.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            NetplayMessage::PlayerInputs(_) => MessageKind::PlayerInputs,
            NetplayMessage::BothInputs(_) => MessageKind::BothInputs,
            NetplayMessage::TransitionIndex { .. } => MessageKind::TransitionIndex,
            NetplayMessage::RngState(_) => MessageKind::RngState,
            NetplayMessage::MenuIndex { .. } => MessageKind::MenuIndex,
            NetplayMessage::ChangeConfig(_) => MessageKind::ChangeConfig,
            NetplayMessage::ErrorMessage { .. } => MessageKind::ErrorMessage,
            NetplayMessage::SyncHash(_) => MessageKind::SyncHash,
        }
    }
}

impl ChannelMessage for NetplayMessage {
    fn tag(&self) -> u8 {
        self.kind() as u8
    }
}

/// Body of a sequenced datagram.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequencedPayload<M> {
    /// A message small enough to travel in one datagram.
    Whole(M),
    /// One piece of a message that was too large for the MTU.
    Fragment {
        /// [`ChannelMessage::tag`] of the complete message.
        tag: u8,
        /// Position of this piece, starting at 0.
        index: u16,
        /// Total number of pieces.
        count: u16,
        /// The piece itself.
        bytes: Vec<u8>,
    },
}

impl<M: fmt::Debug> fmt::Debug for SequencedPayload<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequencedPayload::Whole(msg) => f.debug_tuple("Whole").field(msg).finish(),
            SequencedPayload::Fragment {
                tag,
                index,
                count,
                bytes,
            } => f
                .debug_struct("Fragment")
                .field("tag", tag)
                .field("index", index)
                .field("count", count)
                .field("bytes", &BytesDebug(bytes))
                .finish(),
        }
    }
}

/// What actually travels in one datagram between two [`ReliableChannel`](crate::ReliableChannel)s.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Datagram<M = NetplayMessage> {
    /// Retransmitted until acknowledged; delivered once, in order.
    Sequenced {
        /// Position in the sender's stream, starting at 1.
        sequence: u32,
        /// The message or a fragment of it.
        payload: SequencedPayload<M>,
    },
    /// Sent once, never acknowledged.
    Unsequenced(M),
    /// Cumulative acknowledgement of every sequence up to and including `sequence`.
    Ack {
        /// Highest in-order sequence received.
        sequence: u32,
    },
    /// Proof of life when there is nothing else to send.
    KeepAlive,
}

struct BytesDebug<'a>(&'a [u8]);

impl fmt::Debug for BytesDebug<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("0x")?;
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
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
    use crate::network::codec::{decode_exact, encode};

    #[test]
    fn window_is_clamped_at_frame_zero() {
        let inputs = PlayerInputs::new(IndexedFrame::new(1, 0));
        assert_eq!(inputs.start_frame(), 0);
        assert_eq!(inputs.end_frame(), 1);
        assert_eq!(inputs.size(), 1);

        let inputs = PlayerInputs::new(IndexedFrame::new(1, 28));
        assert_eq!(inputs.start_frame(), 0);
        assert_eq!(inputs.size(), 29);
    }

    #[test]
    fn window_slides_once_full() {
        let inputs = PlayerInputs::new(IndexedFrame::new(1, 29));
        assert_eq!(inputs.start_frame(), 0);
        assert_eq!(inputs.size(), NUM_INPUTS);

        let inputs = PlayerInputs::new(IndexedFrame::new(1, 100));
        assert_eq!(inputs.start_frame(), 71);
        assert_eq!(inputs.end_frame(), 101);
        assert_eq!(inputs.window().len(), NUM_INPUTS);
    }

    #[test]
    fn both_inputs_window_per_player() {
        let mut both = BothInputs::new(IndexedFrame::new(4, 2));
        both.inputs[Player::Two.index()][1] = 0x20;
        assert_eq!(both.size(), 3);
        assert_eq!(both.window(Player::Two), &[0, 0x20, 0]);
        assert_eq!(both.window(Player::One), &[0, 0, 0]);
    }

    #[test]
    fn change_config_offset_prefers_rollback_delay() {
        let mut change = ChangeConfig {
            kind: ChangeConfigKind::Delay,
            indexed_frame: IndexedFrame::new(2, 0),
            delay: 4,
            rollback: 0,
            rollback_delay: 1,
        };
        assert_eq!(change.offset(), 4);
        change.rollback = 6;
        assert_eq!(change.offset(), 1);
    }

    #[test]
    fn kinds_and_tags_agree() {
        let msg = NetplayMessage::MenuIndex {
            index: 3,
            menu_index: 1,
        };
        assert_eq!(msg.kind(), MessageKind::MenuIndex);
        assert_eq!(msg.tag(), 5);
        assert_eq!(
            NetplayMessage::ErrorMessage {
                error: String::new()
            }
            .tag(),
            MessageKind::ErrorMessage as u8
        );
    }

    #[test]
    fn byte_payloads_debug_as_hex() {
        let rng = RngState {
            index: 2,
            state: vec![0xde, 0xad],
        };
        assert_eq!(format!("{rng:?}"), "RngState { index: 2, state: 0xdead }");

        let fragment: SequencedPayload<NetplayMessage> = SequencedPayload::Fragment {
            tag: 4,
            index: 0,
            count: 2,
            bytes: vec![1, 2],
        };
        assert!(format!("{fragment:?}").contains("bytes: 0x0102"));
    }

    #[test]
    fn rng_state_decodes_exactly() {
        let msg = NetplayMessage::RngState(RngState {
            index: 9,
            state: (0..=255).collect(),
        });
        let bytes = encode(&msg).unwrap();
        assert_eq!(decode_exact::<NetplayMessage>(&bytes).unwrap(), msg);
    }
}
