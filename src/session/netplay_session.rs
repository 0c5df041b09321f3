//! The netplay state machine and the per-frame decisions made on top of it.
//!
//! A [`NetplaySession`] owns both players' [`InputTimeline`]s, the snapshot pool and the
//! bookkeeping that ties them to the current [`NetplayState`]. It never touches the network: the
//! driver feeds decoded messages in through [`NetplaySession::handle_message`] and sends whatever
//! the session hands back.
//!
//! A driver tick looks roughly like this:
//!
//! ```text
//! session.update_frame(world_time)
//! for msg in channel.poll():        session.handle_message(msg)?
//! if session.perform_rollback(&mut sim)?.is_some():
//!     while !session.finish_rerun_if_done():
//!         session.save_snapshot(&sim)?; step(&mut sim); session.update_frame(sim.world_time())
//! session.set_input(local, read_controller())
//! channel.send_reliable(PlayerInputs(session.get_inputs(local)?))
//! if !session.is_remote_input_ready(): stall (see WaitTracker) and return
//! session.save_snapshot(&sim)?
//! step(&mut sim, session.get_input(Player::One), session.get_input(Player::Two))
//! ```
//!
//! Transition indices handed to [`InputTimeline`] are relative to [`NetplaySession::start_index`],
//! the oldest index still retained. Everything in this module's public API is absolute.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, info, trace, warn};

use crate::hash::fnv1a_bytes;
use crate::network::codec;
use crate::network::messages::{BothInputs, ChangeConfig, NetplayMessage, PlayerInputs, SyncHash};
use crate::session::config::NetplayConfig;
use crate::session::state::NetplayState;
use crate::snapshot_store::{EffectId, SideEffectHistory, Simulation, SnapshotMeta, SnapshotStore};
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{
    report_violation_to, DesyncDetection, IndexedFrame, Input, InputTimeline, NetplayError,
    Player, NUM_INPUTS, PRESERVE_START_INDEX_BUFFER,
};

/// Number of distinct one-shot effect ids tracked per tick.
const MAX_SIDE_EFFECTS: usize = 1024;

/// Hashes kept per side before the oldest are forgotten.
const MAX_TRACKED_HASHES: usize = 64;

/// Retry menu choice meaning "nothing chosen yet".
const NO_MENU_INDEX: i8 = -1;

/// Highest retry menu entry both peers may settle on.
const MAX_RETRY_MENU_INDEX: i8 = 1;

#[derive(Debug, Clone)]
struct LocalHash {
    hash: u64,
    dump: String,
    sent: bool,
}

#[derive(Debug, Clone)]
struct RemoteHash {
    hash: u64,
    dump: String,
}

/// The netplay state machine for one side of a two-peer match.
pub struct NetplaySession {
    config: NetplayConfig,
    state: NetplayState,
    aborted: bool,
    world_time: u32,
    start_world_time: u32,
    indexed_frame: IndexedFrame,
    // Oldest transition index still held in the timelines.
    start_index: u32,
    spectate_start_index: u32,
    initial_indexed_frame: Option<IndexedFrame>,
    local_player: Player,
    inputs: [InputTimeline<Input>; 2],
    rng_states: Vec<Option<Vec<u8>>>,
    retry_menu_indices: Vec<i8>,
    local_retry_menu_index: i8,
    remote_retry_menu_index: i8,
    pending_change: Option<ChangeConfig>,
    snapshots: SnapshotStore,
    side_effects: SideEffectHistory,
    rollback_cooldown: u8,
    fast_forward_stop: Option<IndexedFrame>,
    local_hashes: BTreeMap<IndexedFrame, LocalHash>,
    remote_hashes: BTreeMap<IndexedFrame, RemoteHash>,
    observer: Option<Arc<dyn ViolationObserver>>,
}

impl fmt::Debug for NetplaySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetplaySession")
            .field("mode", &self.config.mode)
            .field("state", &self.state)
            .field("indexed_frame", &self.indexed_frame)
            .field("start_index", &self.start_index)
            .field("local_player", &self.local_player)
            .field("snapshots", &self.snapshots.len())
            .field("fast_forward_stop", &self.fast_forward_stop)
            .field("aborted", &self.aborted)
            .finish_non_exhaustive()
    }
}

impl NetplaySession {
    /// Creates a session in [`NetplayState::PreInitial`] at index 0, frame 0.
    ///
    /// The local player is `config.host_player` unless this side is the client.
    ///
    /// # Errors
    ///
    /// Whatever [`NetplayConfig::validate`] rejects.
    pub fn new(config: NetplayConfig) -> Result<Self, NetplayError> {
        config.validate()?;
        let local_player = if config.mode.is_client() {
            config.host_player.other()
        } else {
            config.host_player
        };
        debug!(mode = ?config.mode, %local_player, "Created netplay session");
        Ok(Self {
            config,
            state: NetplayState::PreInitial,
            aborted: false,
            world_time: 0,
            start_world_time: 0,
            indexed_frame: IndexedFrame::ZERO,
            start_index: 0,
            spectate_start_index: 0,
            initial_indexed_frame: None,
            local_player,
            inputs: [InputTimeline::new(), InputTimeline::new()],
            rng_states: Vec::new(),
            retry_menu_indices: Vec::new(),
            local_retry_menu_index: NO_MENU_INDEX,
            remote_retry_menu_index: NO_MENU_INDEX,
            pending_change: None,
            snapshots: SnapshotStore::new(),
            side_effects: SideEffectHistory::new(config.snapshot_capacity, MAX_SIDE_EFFECTS),
            rollback_cooldown: 0,
            fast_forward_stop: None,
            local_hashes: BTreeMap::new(),
            remote_hashes: BTreeMap::new(),
            observer: None,
        })
    }

    /// Routes violations to `observer` instead of the default tracing output.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    // ###########
    // # GETTERS #
    // ###########

    /// The active configuration, including any applied renegotiation.
    #[must_use]
    pub fn config(&self) -> NetplayConfig {
        self.config
    }

    /// The current netplay phase.
    #[must_use]
    pub fn state(&self) -> NetplayState {
        self.state
    }

    /// Current transition index.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.indexed_frame.index()
    }

    /// Frame within the current transition index.
    #[must_use]
    pub fn frame(&self) -> u32 {
        self.indexed_frame.frame()
    }

    /// Current position on the timeline.
    #[must_use]
    pub fn indexed_frame(&self) -> IndexedFrame {
        self.indexed_frame
    }

    /// Oldest transition index still retained.
    #[must_use]
    pub fn start_index(&self) -> u32 {
        self.start_index
    }

    /// World time at which the current transition index began.
    #[must_use]
    pub fn start_world_time(&self) -> u32 {
        self.start_world_time
    }

    /// Index a newly connected spectator should start watching from.
    #[must_use]
    pub fn spectate_start_index(&self) -> u32 {
        self.spectate_start_index
    }

    /// The player whose input comes from this machine.
    #[must_use]
    pub fn local_player(&self) -> Player {
        self.local_player
    }

    /// The player whose input comes from the peer.
    #[must_use]
    pub fn remote_player(&self) -> Player {
        self.local_player.other()
    }

    /// Swaps which player is remote.
    pub fn set_remote_player(&mut self, player: Player) {
        self.local_player = player.other();
    }

    /// One player's input timeline. Indices in it are relative to [`start_index`](Self::start_index).
    #[must_use]
    pub fn timeline(&self, player: Player) -> &InputTimeline<Input> {
        &self.inputs[player.index()]
    }

    /// The snapshot pool.
    #[must_use]
    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Whether [`abort`](Self::abort) has been called.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Whether rollback is active right now.
    #[must_use]
    pub fn is_in_rollback(&self) -> bool {
        self.config.rollback_enabled() && self.state == NetplayState::InGame
    }

    /// Where a spectator leaving [`NetplayState::AutoCharaSelect`] should resume.
    pub fn set_initial_indexed_frame(&mut self, indexed_frame: IndexedFrame) {
        self.initial_indexed_frame = Some(indexed_frame);
    }

    fn rel_index(&self) -> u32 {
        self.index().saturating_sub(self.start_index)
    }

    fn remote(&self) -> &InputTimeline<Input> {
        &self.inputs[self.remote_player().index()]
    }

    // ##########################
    // # FRAMES AND TRANSITIONS #
    // ##########################

    /// Recomputes the frame from the simulation's world clock.
    pub fn update_frame(&mut self, world_time: u32) {
        self.world_time = world_time;
        self.indexed_frame = self
            .indexed_frame
            .with_frame(world_time.saturating_sub(self.start_world_time));
        if !self.is_rerunning() {
            self.rollback_cooldown = self.rollback_cooldown.saturating_sub(1);
        }
        self.apply_pending_change();
    }

    /// Moves to `next`.
    ///
    /// Entering any state from [`NetplayState::CharaSelect`] onwards starts a new transition
    /// index at frame 0. Entering [`NetplayState::Loading`] also prunes indices older than the
    /// preserve watermark. Entering [`NetplayState::InGame`] with rollback enabled allocates the
    /// snapshot pool; leaving it releases the pool.
    ///
    /// # Errors
    ///
    /// [`NetplayError::IllegalTransition`] if `next` may not follow the current state or the
    /// session was aborted. The session is left unchanged.
    pub fn set_state(&mut self, next: NetplayState) -> Result<(), NetplayError> {
        let previous = self.state;
        if self.aborted || !previous.is_valid_next(next) {
            report_violation_to!(
                self.observer,
                ViolationSeverity::Error,
                ViolationKind::StateMachine,
                "Rejected transition {} -> {} at {}",
                previous,
                next,
                self.indexed_frame
            );
            return Err(NetplayError::IllegalTransition {
                from: previous,
                to: next,
            });
        }

        if next == NetplayState::InGame && self.config.rollback_enabled() {
            self.snapshots
                .allocate(self.config.snapshot_capacity, self.config.snapshot_size)?;
            self.side_effects.clear();
            self.rollback_cooldown = 0;
        }

        debug!(
            indexed_frame = %self.indexed_frame,
            %previous,
            current = %next,
            "Netplay state change"
        );

        if previous == NetplayState::InGame || next.starts_new_index() {
            self.discard_stale_watermark();
        }

        if next.starts_new_index() {
            let initial = if previous == NetplayState::AutoCharaSelect {
                self.initial_indexed_frame.take()
            } else {
                None
            };
            match initial {
                Some(initial) => {
                    self.start_world_time = self.world_time.saturating_sub(initial.frame());
                    self.indexed_frame = initial;
                },
                None => {
                    self.start_world_time = self.world_time;
                    self.indexed_frame = IndexedFrame::new(self.index().saturating_add(1), 0);
                },
            }

            match next {
                NetplayState::CharaSelect => self.spectate_start_index = self.index(),
                NetplayState::Loading => {
                    self.spectate_start_index = self.index();
                    self.prune_retained_indices();
                    self.local_retry_menu_index = NO_MENU_INDEX;
                    self.remote_retry_menu_index = NO_MENU_INDEX;
                },
                _ => {},
            }
        }

        if previous == NetplayState::InGame {
            self.snapshots.deallocate();
            self.fast_forward_stop = None;
            self.side_effects.end_rerun();
        }

        self.state = next;
        self.apply_pending_change();
        Ok(())
    }

    /// The preserve watermark with its safety margin applied.
    ///
    /// `u32::MAX` means nothing downstream needs old indices.
    #[must_use]
    pub fn buffered_preserve_start_index(&self) -> u32 {
        match self.config.preserve_start_index {
            None => u32::MAX,
            Some(preserve) if preserve <= PRESERVE_START_INDEX_BUFFER => 0,
            Some(preserve) => preserve - PRESERVE_START_INDEX_BUFFER,
        }
    }

    /// Updates the oldest index a downstream spectator still needs.
    pub fn set_preserve_start_index(&mut self, preserve: Option<u32>) {
        self.config.preserve_start_index = preserve;
    }

    fn prune_retained_indices(&mut self) {
        let new_start = self.buffered_preserve_start_index().min(self.index());
        if new_start <= self.start_index {
            return;
        }
        let offset = new_start - self.start_index;
        for timeline in &mut self.inputs {
            timeline.erase_index_older_than(offset);
        }
        drain_front(&mut self.rng_states, offset);
        drain_front(&mut self.retry_menu_indices, offset);
        debug!(
            old_start = self.start_index,
            new_start, "Pruned retained transition indices"
        );
        self.start_index = new_start;
    }

    /// Ends the session. Releases the snapshot pool; every later transition is rejected.
    pub fn abort(&mut self) {
        if self.aborted {
            return;
        }
        warn!(indexed_frame = %self.indexed_frame, state = %self.state, "Aborting netplay session");
        self.aborted = true;
        self.snapshots.deallocate();
        self.side_effects.clear();
        self.fast_forward_stop = None;
        self.pending_change = None;
    }

    // ##########
    // # INPUTS #
    // ##########

    /// The input `player` feeds the simulation this frame, shaped by the current state.
    ///
    /// Menus before the match mash confirm, loading screens only let confirm and cancel through,
    /// and the retry menu holds input back until both peers have chosen.
    pub fn get_input(&mut self, player: Player) -> Input {
        let confirm = self.config.input_mask.confirm;
        match self.state {
            NetplayState::PreInitial | NetplayState::AutoCharaSelect => self.mash(confirm),
            NetplayState::Initial => {
                // The host drives the main menu.
                if player == self.config.host_player {
                    self.mash(confirm)
                } else {
                    0
                }
            },
            NetplayState::CharaSelect | NetplayState::InGame => self.get_raw_input(player),
            NetplayState::Loading | NetplayState::Skippable => {
                if self.is_remote_index_ahead() || self.config.mode.is_spectate() {
                    self.mash(confirm)
                } else {
                    self.get_raw_input(player) & self.config.input_mask.menu_buttons()
                }
            },
            NetplayState::RetryMenu => self.retry_menu_input(player),
        }
    }

    /// The stored (or predicted) input of `player` at the current frame.
    #[must_use]
    pub fn get_raw_input(&self, player: Player) -> Input {
        self.inputs[player.index()].get(self.rel_index(), self.frame())
    }

    fn mash(&self, buttons: Input) -> Input {
        if self.frame() % 2 == 1 {
            0
        } else {
            buttons
        }
    }

    fn is_remote_index_ahead(&self) -> bool {
        let remote_end = u64::from(self.start_index) + u64::from(self.remote().end_index());
        remote_end > u64::from(self.index()) + 1
    }

    fn retry_menu_input(&mut self, player: Player) -> Input {
        let mode = self.config.mode;
        if mode.is_netplay() && player != self.local_player {
            return 0;
        }
        if mode.is_spectate_netplay() {
            // Spectators follow the choice the players settle on.
            return 0;
        }
        if !mode.is_netplay() {
            return self.get_raw_input(player);
        }

        if self.local_retry_menu_index >= 0 && self.remote_retry_menu_index >= 0 {
            let target = self
                .local_retry_menu_index
                .max(self.remote_retry_menu_index)
                .min(MAX_RETRY_MENU_INDEX);
            self.set_retry_menu_index(self.index(), target);
            return 0;
        }
        if self.local_retry_menu_index >= 0 {
            return 0;
        }
        self.get_raw_input(player)
    }

    /// Records local input for the current frame.
    ///
    /// With rollback active the input lands `rollback_delay` frames ahead and replaces any
    /// prediction there. In the retry menu it lands on the current frame. Otherwise it lands
    /// `delay` frames ahead and never replaces published input. Ignored while re-simulating.
    pub fn set_input(&mut self, player: Player, input: Input) {
        if self.is_rerunning() {
            trace!(%player, "Ignoring local input during rerun");
            return;
        }
        let index = self.rel_index();
        let frame = self.frame();
        let in_rollback = self.is_in_rollback();
        let state = self.state;
        let timeline = &mut self.inputs[player.index()];
        if in_rollback {
            let at = frame.saturating_add(u32::from(self.config.rollback_delay));
            timeline.assign(index, at, input);
        } else if state == NetplayState::RetryMenu {
            timeline.set(index, frame, input);
        } else {
            let at = frame.saturating_add(u32::from(self.config.delay));
            timeline.set(index, at, input);
        }
    }

    /// The last `NUM_INPUTS` recorded inputs of `player` in the current index.
    ///
    /// `None` if nothing has been recorded in this index yet.
    ///
    /// # Errors
    ///
    /// [`NetplayError::InternalError`] if the timeline lost frames it reported holding.
    pub fn get_inputs(&self, player: Player) -> Result<Option<PlayerInputs>, NetplayError> {
        let index = self.rel_index();
        let timeline = &self.inputs[player.index()];
        let end_frame = timeline.end_frame_of(index);
        if end_frame == 0 {
            return Ok(None);
        }
        let mut inputs = PlayerInputs::new(IndexedFrame::new(self.index(), end_frame - 1));
        let start_frame = inputs.start_frame();
        let size = inputs.size();
        timeline.copy_range(index, start_frame, &mut inputs.inputs[..size])?;
        Ok(Some(inputs))
    }

    /// Stores an input window received for `player`.
    ///
    /// Windows more than one index old or older than the retained range are dropped. With
    /// rollback active, windows for the current index are checked against the prediction.
    pub fn set_inputs(&mut self, player: Player, inputs: &PlayerInputs) {
        let index = inputs.index();
        if index.saturating_add(1) < self.index() || index < self.start_index {
            trace!(%player, received = index, current = self.index(), "Dropping stale inputs");
            return;
        }
        let check_from = if self.is_in_rollback() {
            self.rel_index()
        } else {
            u32::MAX
        };
        self.inputs[player.index()].set_range(
            index - self.start_index,
            inputs.start_frame(),
            inputs.window(),
            check_from,
        );
    }

    /// The next window of both players' inputs for a spectator at `pos`, advancing `pos`.
    ///
    /// Within the current index the spectator only sees frames both players have recorded
    /// (and, with rollback active, `2 * NUM_INPUTS` frames less, which can no longer change).
    /// Once an older index is exhausted, `pos` moves to the next index.
    ///
    /// # Errors
    ///
    /// [`NetplayError::InternalError`] if the timelines lost frames they reported holding.
    pub fn get_both_inputs(
        &self,
        pos: &mut IndexedFrame,
    ) -> Result<Option<BothInputs>, NetplayError> {
        if pos.index() > self.index() {
            return Ok(None);
        }
        if pos.index() < self.start_index {
            *pos = IndexedFrame::new(self.start_index, NUM_INPUTS as u32 - 1);
        }

        let mut orig = *pos;
        let rel = orig.index() - self.start_index;
        let mut common_end = self.inputs[0]
            .end_frame_of(rel)
            .min(self.inputs[1].end_frame_of(rel));

        if orig.index() == self.index() {
            if self.is_in_rollback() {
                common_end = common_end.saturating_sub(2 * NUM_INPUTS as u32);
            }
            if orig.frame() < common_end {
                *pos = pos.with_frame(pos.frame().saturating_add(NUM_INPUTS as u32));
            } else {
                return Ok(None);
            }
        } else if orig.frame() < common_end {
            *pos = pos.with_frame(pos.frame().saturating_add(NUM_INPUTS as u32));
        } else {
            *pos = IndexedFrame::new(pos.index() + 1, NUM_INPUTS as u32 - 1);
            if common_end == 0 {
                return Ok(None);
            }
            orig = orig.with_frame(common_end - 1);
        }

        let mut both = BothInputs::new(orig);
        let start_frame = both.start_frame();
        let size = both.size();
        for player in Player::ALL {
            self.inputs[player.index()].copy_range(
                rel,
                start_frame,
                &mut both.inputs[player.index()][..size],
            )?;
        }
        Ok(Some(both))
    }

    /// Stores a window of both players' inputs, as a spectator.
    pub fn set_both_inputs(&mut self, both: &BothInputs) {
        let index = both.index();
        if index.saturating_add(1) < self.index() || index < self.start_index {
            trace!(received = index, current = self.index(), "Dropping stale both-inputs");
            return;
        }
        for player in Player::ALL {
            self.inputs[player.index()].set_range(
                index - self.start_index,
                both.start_frame(),
                both.window(player),
                u32::MAX,
            );
        }
    }

    // #############
    // # READINESS #
    // #############

    /// Whether the simulation may advance this frame.
    ///
    /// Menus and loading screens never wait. Otherwise the peer must have reached this index
    /// and recorded input up to this frame, less `rollback` frames of slack when rollback is
    /// active.
    #[must_use]
    pub fn is_remote_input_ready(&self) -> bool {
        if !self.state.needs_remote_input() {
            return true;
        }

        let remote = self.remote();
        if remote.is_empty() {
            trace!(indexed_frame = %self.indexed_frame, "No remote inputs (index)");
            return false;
        }

        let remote_index = self.start_index + remote.end_index() - 1;
        if remote_index < self.index() {
            trace!(
                indexed_frame = %self.indexed_frame,
                remote_index,
                "Remote is behind (index)"
            );
            return false;
        }
        // An older local index needs nothing more from the peer.
        if remote_index > self.index() {
            return true;
        }

        if remote.end_frame() == 0 {
            trace!(indexed_frame = %self.indexed_frame, "No remote inputs (frame)");
            return false;
        }

        let max_ahead = if self.is_in_rollback() {
            u32::from(self.config.rollback)
        } else {
            0
        };
        let remote_frame = remote.end_frame() - 1;
        if remote_frame.saturating_add(max_ahead) < self.frame() {
            trace!(
                indexed_frame = %self.indexed_frame,
                remote_frame,
                delay = self.config.delay,
                rollback = self.config.rollback,
                "Remote is behind (frame)"
            );
            return false;
        }
        true
    }

    /// Last index the peer has sent input for.
    #[must_use]
    pub fn remote_index(&self) -> u32 {
        (self.start_index + self.remote().end_index()).saturating_sub(1)
    }

    /// Last frame the peer has sent input for, in its last index.
    #[must_use]
    pub fn remote_frame(&self) -> u32 {
        self.remote().end_frame().saturating_sub(1)
    }

    /// [`remote_index`](Self::remote_index) and [`remote_frame`](Self::remote_frame) together.
    #[must_use]
    pub fn remote_indexed_frame(&self) -> IndexedFrame {
        IndexedFrame::new(self.remote_index(), self.remote_frame())
    }

    /// Records that the peer has reached transition index `index`.
    pub fn set_remote_index(&mut self, index: u32) {
        if index < self.start_index {
            return;
        }
        debug!(remote_index = index, "Remote transition index");
        let rel = index - self.start_index;
        let remote = self.remote_player().index();
        self.inputs[remote].resize(rel, 0);
    }

    /// Announcement of the current transition index for the peer.
    #[must_use]
    pub fn transition_index_message(&self) -> NetplayMessage {
        NetplayMessage::TransitionIndex {
            index: self.index(),
        }
    }

    // ############
    // # RNG SYNC #
    // ############

    /// Stores the RNG blob the host chose for `index`.
    pub fn set_rng_state(&mut self, index: u32, state: Vec<u8>) {
        if self.config.mode.is_offline() || index == 0 || index < self.start_index {
            return;
        }
        trace!(index, bytes = state.len(), "Received RNG state");
        let rel = (index - self.start_index) as usize;
        if rel >= self.rng_states.len() {
            self.rng_states.resize(rel + 1, None);
        }
        self.rng_states[rel] = Some(state);
    }

    /// The RNG blob stored for `index`.
    #[must_use]
    pub fn get_rng_state(&self, index: u32) -> Option<&[u8]> {
        if self.config.mode.is_offline() || index < self.start_index {
            return None;
        }
        self.rng_states
            .get((index - self.start_index) as usize)
            .and_then(Option::as_deref)
    }

    /// Whether the RNG blob for the current index has arrived.
    ///
    /// Always true when no sync is requested, on the side that generates RNG states, and before
    /// character select.
    #[must_use]
    pub fn is_rng_state_ready(&self, should_sync: bool) -> bool {
        let mode = self.config.mode;
        if !should_sync
            || mode.is_host()
            || mode.is_broadcast()
            || mode.is_offline()
            || self.state < NetplayState::CharaSelect
        {
            return true;
        }
        if self.rng_states.is_empty() {
            trace!(indexed_frame = %self.indexed_frame, "No remote RNG states");
            return false;
        }
        let newest = self.start_index + self.rng_states.len() as u32 - 1;
        newest >= self.index()
    }

    // ##############
    // # RETRY MENU #
    // ##############

    /// The settled retry menu choice for `index`.
    #[must_use]
    pub fn get_retry_menu_index(&self, index: u32) -> Option<i8> {
        if self.config.mode.is_offline() || index < self.start_index {
            return None;
        }
        self.retry_menu_indices
            .get((index - self.start_index) as usize)
            .copied()
            .filter(|menu_index| *menu_index >= 0)
    }

    /// Stores the settled retry menu choice for `index`.
    pub fn set_retry_menu_index(&mut self, index: u32, menu_index: i8) {
        if self.config.mode.is_offline()
            || index == 0
            || index < self.start_index
            || menu_index < 0
        {
            return;
        }
        let rel = (index - self.start_index) as usize;
        if rel >= self.retry_menu_indices.len() {
            self.retry_menu_indices.resize(rel + 1, NO_MENU_INDEX);
        }
        debug!(index, menu_index, "Retry menu choice settled");
        self.retry_menu_indices[rel] = menu_index;
    }

    /// Records this player's retry menu choice.
    pub fn set_local_retry_menu_index(&mut self, menu_index: i8) {
        debug!(menu_index, "Local retry menu choice");
        self.local_retry_menu_index = menu_index;
    }

    /// Records the peer's retry menu choice.
    pub fn set_remote_retry_menu_index(&mut self, menu_index: i8) {
        debug!(menu_index, "Remote retry menu choice");
        self.remote_retry_menu_index = menu_index;
    }

    /// This player's choice, ready to send, once one has been made in the retry menu.
    #[must_use]
    pub fn local_retry_menu_message(&self) -> Option<NetplayMessage> {
        (self.state == NetplayState::RetryMenu && self.local_retry_menu_index >= 0).then(|| {
            NetplayMessage::MenuIndex {
                index: self.index(),
                menu_index: self.local_retry_menu_index,
            }
        })
    }

    // ##########
    // # CONFIG #
    // ##########

    /// Renegotiates delay and rollback, effective from the frame carried in `change`.
    ///
    /// A change for a frame that has not been reached yet is held until
    /// [`update_frame`](Self::update_frame) gets there.
    ///
    /// # Errors
    ///
    /// Whatever [`NetplayConfig::validate`] rejects for the resulting configuration.
    pub fn apply_change_config(&mut self, change: &ChangeConfig) -> Result<(), NetplayError> {
        let candidate = NetplayConfig {
            delay: change.delay,
            rollback: change.rollback,
            rollback_delay: change.rollback_delay,
            ..self.config
        };
        candidate.validate()?;

        if change.indexed_frame > self.indexed_frame {
            debug!(at = %change.indexed_frame, kind = ?change.kind, "Holding config change");
            self.pending_change = Some(*change);
            return Ok(());
        }
        self.commit_change(change)
    }

    fn apply_pending_change(&mut self) {
        let due = self
            .pending_change
            .is_some_and(|change| change.indexed_frame <= self.indexed_frame);
        if !due {
            return;
        }
        if let Some(change) = self.pending_change.take() {
            if let Err(err) = self.commit_change(&change) {
                report_violation_to!(
                    self.observer,
                    ViolationSeverity::Error,
                    ViolationKind::Configuration,
                    "Dropped config change at {}: {}",
                    change.indexed_frame,
                    err
                );
            }
        }
    }

    fn commit_change(&mut self, change: &ChangeConfig) -> Result<(), NetplayError> {
        let was_rolling_back = self.is_in_rollback();
        self.config.delay = change.delay;
        self.config.rollback = change.rollback;
        self.config.rollback_delay = change.rollback_delay;
        self.pending_change = None;
        info!(
            indexed_frame = %self.indexed_frame,
            delay = change.delay,
            rollback = change.rollback,
            rollback_delay = change.rollback_delay,
            "Applied config change"
        );

        match (was_rolling_back, self.is_in_rollback()) {
            (false, true) => {
                self.snapshots
                    .allocate(self.config.snapshot_capacity, self.config.snapshot_size)?;
                self.side_effects.clear();
            },
            (true, false) => {
                self.snapshots.deallocate();
                self.fast_forward_stop = None;
                self.side_effects.end_rerun();
            },
            _ => {},
        }
        Ok(())
    }

    // ############
    // # MESSAGES #
    // ############

    /// Applies one message received from the peer.
    ///
    /// # Errors
    ///
    /// [`NetplayError::RemoteError`] when the peer reports an error,
    /// [`NetplayError::DesyncDetected`] when its state hash disagrees with ours, and whatever
    /// [`apply_change_config`](Self::apply_change_config) rejects.
    pub fn handle_message(&mut self, message: NetplayMessage) -> Result<(), NetplayError> {
        match message {
            NetplayMessage::PlayerInputs(inputs) => {
                let remote = self.remote_player();
                self.set_inputs(remote, &inputs);
            },
            NetplayMessage::BothInputs(both) => self.set_both_inputs(&both),
            NetplayMessage::TransitionIndex { index } => self.set_remote_index(index),
            NetplayMessage::RngState(rng) => self.set_rng_state(rng.index, rng.state),
            NetplayMessage::MenuIndex { index, menu_index } => {
                if self.config.mode.is_spectate() {
                    self.set_retry_menu_index(index, menu_index);
                } else if index == self.index() {
                    self.set_remote_retry_menu_index(menu_index);
                } else {
                    trace!(index, current = self.index(), "Dropping stale menu index");
                }
            },
            NetplayMessage::ChangeConfig(change) => self.apply_change_config(&change)?,
            NetplayMessage::ErrorMessage { error } => {
                warn!(%error, "Peer reported an error");
                return Err(NetplayError::RemoteError { message: error });
            },
            NetplayMessage::SyncHash(hash) => self.record_remote_hash(hash)?,
        }
        Ok(())
    }

    // ############
    // # ROLLBACK #
    // ############

    /// Earliest current-run frame where arriving remote input disagreed with the prediction.
    #[must_use]
    pub fn last_changed_frame(&self) -> IndexedFrame {
        let changed = self.remote().last_changed_frame();
        if changed.is_max() {
            return IndexedFrame::MAX;
        }
        changed.with_index(self.start_index + changed.index())
    }

    /// Forgets the mismatch watermark.
    pub fn clear_last_changed_frame(&mut self) {
        let remote = self.remote_player().index();
        self.inputs[remote].clear_last_changed_frame();
    }

    /// Where a rollback should restore to, if one is due.
    ///
    /// `None` unless rollback is active, no rerun is in progress, the minimum spacing since
    /// the last rollback has elapsed and the mismatch watermark lies before the current frame.
    #[must_use]
    pub fn rollback_target(&self) -> Option<IndexedFrame> {
        if !self.is_in_rollback() || self.is_rerunning() || self.rollback_cooldown > 0 {
            return None;
        }
        let changed = self.last_changed_frame();
        (changed.index() == self.index() && changed < self.indexed_frame).then_some(changed)
    }

    /// Drops a mismatch watermark that belongs to a round which is over.
    ///
    /// Hashes from the watermark on were taken on mispredicted input and are discarded with it.
    fn discard_stale_watermark(&mut self) {
        let changed = self.last_changed_frame();
        if changed.is_max() {
            return;
        }
        debug!(watermark = %changed, "Discarding mismatch watermark of a finished round");
        self.local_hashes.retain(|at, _| *at < changed);
        self.clear_last_changed_frame();
    }

    /// Restores the newest snapshot at or before [`rollback_target`](Self::rollback_target)
    /// and starts a rerun back to the current frame.
    ///
    /// Returns where the simulation now stands, or `None` if no rollback was due. The driver
    /// must keep stepping until [`finish_rerun_if_done`](Self::finish_rerun_if_done) says
    /// the rerun is over.
    ///
    /// # Errors
    ///
    /// [`NetplayError::RollbackFailed`] if no snapshot is old enough. The session cannot
    /// continue after that.
    pub fn perform_rollback<S: Simulation + ?Sized>(
        &mut self,
        sim: &mut S,
    ) -> Result<Option<IndexedFrame>, NetplayError> {
        let Some(target) = self.rollback_target() else {
            return Ok(None);
        };
        let resume_at = self.indexed_frame;

        let meta = match self.snapshots.load(target, sim) {
            Ok(meta) => meta,
            Err(err) => {
                report_violation_to!(
                    self.observer,
                    ViolationSeverity::Critical,
                    ViolationKind::Snapshot,
                    "Rollback from {} to {} failed: {}",
                    resume_at,
                    target,
                    err
                );
                return Err(err);
            },
        };

        self.restore_meta(meta);
        self.clear_last_changed_frame();
        self.fast_forward_stop = Some(resume_at);
        self.side_effects.begin_rerun();
        self.rollback_cooldown = self.config.min_rollback_spacing;
        debug!(
            %target,
            restored = %meta.indexed_frame,
            %resume_at,
            "Rolled back"
        );
        Ok(Some(meta.indexed_frame))
    }

    fn restore_meta(&mut self, meta: SnapshotMeta) {
        self.state = meta.netplay_state;
        self.start_world_time = meta.start_world_time;
        self.indexed_frame = meta.indexed_frame;
        self.world_time = meta
            .start_world_time
            .saturating_add(meta.indexed_frame.frame());
    }

    /// Whether a rerun after a rollback is in progress.
    #[must_use]
    pub fn is_rerunning(&self) -> bool {
        self.fast_forward_stop.is_some()
    }

    /// The frame the current rerun ends at.
    #[must_use]
    pub fn fast_forward_stop(&self) -> Option<IndexedFrame> {
        self.fast_forward_stop
    }

    /// Ends the rerun once the frame it started from has been reached again.
    ///
    /// Returns `true` exactly once per rerun.
    pub fn finish_rerun_if_done(&mut self) -> bool {
        match self.fast_forward_stop {
            Some(stop) if self.indexed_frame >= stop => {
                self.fast_forward_stop = None;
                self.side_effects.end_rerun();
                trace!(indexed_frame = %self.indexed_frame, "Rerun finished");
                true
            },
            _ => false,
        }
    }

    /// Saves the simulation as it stands before stepping the current frame.
    ///
    /// Does nothing outside rollback, or if a snapshot for this frame is already held (the one
    /// a rerun started from).
    ///
    /// # Errors
    ///
    /// Whatever [`SnapshotStore::save`] rejects.
    pub fn save_snapshot<S: Simulation + ?Sized>(&mut self, sim: &S) -> Result<(), NetplayError> {
        if !self.is_in_rollback() {
            return Ok(());
        }
        if self
            .snapshots
            .newest()
            .is_some_and(|newest| newest.indexed_frame >= self.indexed_frame)
        {
            return Ok(());
        }
        let meta = SnapshotMeta {
            netplay_state: self.state,
            start_world_time: self.start_world_time,
            indexed_frame: self.indexed_frame,
        };
        let still_needed = self.oldest_unconfirmed_frame();
        self.snapshots.save(meta, sim, Some(still_needed))
    }

    fn oldest_unconfirmed_frame(&self) -> IndexedFrame {
        let confirmed_end = self.remote().end_frame_of(self.rel_index());
        self.indexed_frame
            .with_frame(confirmed_end)
            .min(self.last_changed_frame())
    }

    /// Which of the effects the simulation `fired` this frame may actually play.
    pub fn filter_side_effects(&mut self, fired: &[EffectId]) -> SmallVec<[EffectId; 8]> {
        self.side_effects.filter(self.frame(), fired)
    }

    // ####################
    // # DESYNC DETECTION #
    // ####################

    /// Hashes the simulation when the current frame falls on the detection interval.
    ///
    /// The hash is returned for sending once the frame can no longer be rolled back over,
    /// which may be right away. Hashes that become final later are collected with
    /// [`take_confirmed_hashes`](Self::take_confirmed_hashes).
    ///
    /// # Errors
    ///
    /// [`NetplayError::SerializationError`] if the state does not encode, and
    /// [`NetplayError::DesyncDetected`] if the peer already reported a different hash.
    pub fn record_local_hash<S>(&mut self, sim: &S) -> Result<Option<SyncHash>, NetplayError>
    where
        S: Simulation + ?Sized,
        S::State: fmt::Debug,
    {
        let DesyncDetection::On { interval } = self.config.desync_detection else {
            return Ok(None);
        };
        if self.state != NetplayState::InGame || interval == 0 || self.frame() % interval != 0 {
            return Ok(None);
        }
        let at = self.indexed_frame;
        if self.local_hashes.get(&at).is_some_and(|local| local.sent) {
            return Ok(None);
        }

        let bytes = codec::encode(sim.state())?;
        let record = LocalHash {
            hash: fnv1a_bytes(&bytes),
            dump: format!("{:#?}", sim.state()),
            sent: false,
        };
        trace!(indexed_frame = %at, hash = record.hash, "Recorded local state hash");
        self.local_hashes.insert(at, record);
        trim_oldest(&mut self.local_hashes);

        if self.is_hash_final(at) {
            return self.release_local_hash(at);
        }
        Ok(None)
    }

    /// Local hashes that have become final since they were recorded, oldest first.
    ///
    /// # Errors
    ///
    /// [`NetplayError::DesyncDetected`] if one of them disagrees with the peer.
    pub fn take_confirmed_hashes(&mut self) -> Result<Vec<SyncHash>, NetplayError> {
        let ready: Vec<IndexedFrame> = self
            .local_hashes
            .iter()
            .filter(|(at, local)| !local.sent && self.is_hash_final(**at))
            .map(|(at, _)| *at)
            .collect();
        let mut hashes = Vec::with_capacity(ready.len());
        for at in ready {
            if let Some(hash) = self.release_local_hash(at)? {
                hashes.push(hash);
            }
        }
        Ok(hashes)
    }

    /// Stores a hash reported by the peer and compares it with ours if we have one.
    ///
    /// # Errors
    ///
    /// [`NetplayError::DesyncDetected`] on disagreement.
    pub fn record_remote_hash(&mut self, hash: SyncHash) -> Result<(), NetplayError> {
        trace!(indexed_frame = %hash.indexed_frame, hash = hash.hash, "Recorded remote state hash");
        let at = hash.indexed_frame;
        self.remote_hashes.insert(
            at,
            RemoteHash {
                hash: hash.hash,
                dump: hash.dump,
            },
        );
        trim_oldest(&mut self.remote_hashes);
        self.compare_hashes(at)
    }

    fn is_hash_final(&self, at: IndexedFrame) -> bool {
        if self.config.mode.is_local() {
            return true;
        }
        at <= self.remote_indexed_frame() && at < self.last_changed_frame()
    }

    fn release_local_hash(&mut self, at: IndexedFrame) -> Result<Option<SyncHash>, NetplayError> {
        let Some(local) = self.local_hashes.get_mut(&at) else {
            return Ok(None);
        };
        local.sent = true;
        let hash = SyncHash {
            indexed_frame: at,
            hash: local.hash,
            dump: local.dump.clone(),
        };
        self.compare_hashes(at)?;
        Ok(Some(hash))
    }

    fn compare_hashes(&mut self, at: IndexedFrame) -> Result<(), NetplayError> {
        let Some(local) = self.local_hashes.get(&at).filter(|local| local.sent) else {
            return Ok(());
        };
        let Some(remote) = self.remote_hashes.get(&at) else {
            return Ok(());
        };

        if local.hash == remote.hash {
            trace!(indexed_frame = %at, "State hashes agree");
            self.remote_hashes.remove(&at);
            return Ok(());
        }

        report_violation_to!(
            self.observer,
            ViolationSeverity::Critical,
            ViolationKind::Desync,
            "State hash mismatch at {}: local {:#018x}, remote {:#018x}",
            at,
            local.hash,
            remote.hash
        );
        Err(NetplayError::DesyncDetected {
            indexed_frame: at,
            local_hash: local.hash,
            remote_hash: remote.hash,
            local_dump: local.dump.clone(),
            remote_dump: remote.dump.clone(),
        })
    }
}

fn drain_front<T>(items: &mut Vec<T>, count: u32) {
    let count = count as usize;
    if count >= items.len() {
        items.clear();
    } else {
        items.drain(..count);
    }
}

fn trim_oldest<V>(map: &mut BTreeMap<IndexedFrame, V>) {
    while map.len() > MAX_TRACKED_HASHES {
        map.pop_first();
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
    use crate::network::messages::ChangeConfigKind;
    use crate::session::config::ClientMode;
    use crate::telemetry::CollectingObserver;
    use crate::{assert_violation, InvalidRequestKind};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        value: u32,
    }

    struct CounterSim {
        state: Counter,
    }

    impl CounterSim {
        fn new() -> Self {
            Self {
                state: Counter { value: 0 },
            }
        }
    }

    impl Simulation for CounterSim {
        type State = Counter;

        fn state(&self) -> &Counter {
            &self.state
        }

        fn restore(&mut self, state: Counter) {
            self.state = state;
        }
    }

    fn offline() -> NetplaySession {
        NetplaySession::new(NetplayConfig::offline()).unwrap()
    }

    fn rollback_host() -> NetplaySession {
        NetplaySession::new(NetplayConfig {
            snapshot_capacity: 16,
            snapshot_size: 64,
            desync_detection: DesyncDetection::Off,
            ..NetplayConfig::internet()
        })
        .unwrap()
    }

    fn walk(session: &mut NetplaySession, states: &[NetplayState]) {
        for state in states {
            session.set_state(*state).unwrap();
        }
    }

    fn to_chara_select(session: &mut NetplaySession) {
        walk(
            session,
            &[NetplayState::Initial, NetplayState::CharaSelect],
        );
    }

    fn to_in_game(session: &mut NetplaySession) {
        walk(
            session,
            &[
                NetplayState::Initial,
                NetplayState::CharaSelect,
                NetplayState::Loading,
                NetplayState::InGame,
            ],
        );
    }

    fn remote_window(index: u32, values: &[Input]) -> PlayerInputs {
        let mut inputs = PlayerInputs::new(IndexedFrame::new(index, values.len() as u32 - 1));
        inputs.inputs[..values.len()].copy_from_slice(values);
        inputs
    }

    // ==========================================
    // State machine
    // ==========================================

    #[test]
    fn illegal_transition_is_rejected_and_reported() {
        let observer = Arc::new(CollectingObserver::new());
        let mut session = offline().with_observer(observer.clone());
        let err = session.set_state(NetplayState::InGame).unwrap_err();
        assert_eq!(
            err,
            NetplayError::IllegalTransition {
                from: NetplayState::PreInitial,
                to: NetplayState::InGame,
            }
        );
        assert_eq!(session.state(), NetplayState::PreInitial);
        assert_violation!(observer, ViolationKind::StateMachine);
    }

    #[test]
    fn chara_select_starts_a_new_index_at_frame_zero() {
        let mut session = offline();
        session.update_frame(10);
        session.set_state(NetplayState::Initial).unwrap();
        assert_eq!(session.indexed_frame(), IndexedFrame::new(0, 10));

        session.set_state(NetplayState::CharaSelect).unwrap();
        assert_eq!(session.indexed_frame(), IndexedFrame::new(1, 0));
        assert_eq!(session.start_world_time(), 10);
        assert_eq!(session.spectate_start_index(), 1);

        session.update_frame(25);
        assert_eq!(session.frame(), 15);
    }

    #[test]
    fn leaving_auto_chara_select_resumes_at_initial_frame() {
        let mut session = NetplaySession::new(NetplayConfig {
            mode: ClientMode::SpectateNetplay,
            ..NetplayConfig::offline()
        })
        .unwrap();
        session.set_initial_indexed_frame(IndexedFrame::new(6, 40));
        session.update_frame(100);
        walk(
            &mut session,
            &[
                NetplayState::Initial,
                NetplayState::AutoCharaSelect,
                NetplayState::Loading,
            ],
        );
        assert_eq!(session.indexed_frame(), IndexedFrame::new(6, 40));
        session.update_frame(101);
        assert_eq!(session.frame(), 41);
    }

    #[test]
    fn loading_prunes_to_buffered_preserve_index() {
        let mut session = NetplaySession::new(NetplayConfig {
            preserve_start_index: Some(8),
            ..NetplayConfig::offline()
        })
        .unwrap();
        to_chara_select(&mut session);
        for _ in 0..3 {
            walk(
                &mut session,
                &[
                    NetplayState::Loading,
                    NetplayState::Skippable,
                    NetplayState::RetryMenu,
                ],
            );
        }
        // The last Loading was index 8, so the buffered watermark is 3.
        assert_eq!(session.index(), 10);
        assert_eq!(session.start_index(), 3);
    }

    #[test]
    fn buffered_preserve_start_index_applies_margin() {
        let mut session = offline();
        assert_eq!(session.buffered_preserve_start_index(), u32::MAX);
        session.set_preserve_start_index(Some(3));
        assert_eq!(session.buffered_preserve_start_index(), 0);
        session.set_preserve_start_index(Some(12));
        assert_eq!(session.buffered_preserve_start_index(), 7);
    }

    #[test]
    fn abort_releases_snapshots_and_blocks_transitions() {
        let mut session = rollback_host();
        to_in_game(&mut session);
        assert!(session.snapshots().is_allocated());
        session.abort();
        assert!(session.is_aborted());
        assert!(!session.snapshots().is_allocated());
        assert!(session.set_state(NetplayState::Skippable).is_err());
    }

    // ==========================================
    // Inputs
    // ==========================================

    #[test]
    fn pre_game_states_mash_confirm_on_even_frames() {
        let mut session = offline();
        session.update_frame(0);
        assert_eq!(session.get_input(Player::One), 0x0010);
        session.update_frame(1);
        assert_eq!(session.get_input(Player::One), 0);
    }

    #[test]
    fn only_the_host_player_drives_the_main_menu() {
        let mut session = offline();
        session.set_state(NetplayState::Initial).unwrap();
        session.update_frame(2);
        assert_eq!(session.get_input(Player::One), 0x0010);
        assert_eq!(session.get_input(Player::Two), 0);
    }

    #[test]
    fn local_input_lands_after_delay() {
        let mut session = NetplaySession::new(NetplayConfig {
            delay: 2,
            ..NetplayConfig::offline()
        })
        .unwrap();
        to_chara_select(&mut session);
        session.set_input(Player::One, 5);
        assert_eq!(session.get_raw_input(Player::One), 0);
        session.update_frame(2);
        assert_eq!(session.get_input(Player::One), 5);
    }

    #[test]
    fn published_input_is_never_replaced_outside_rollback() {
        let mut session = offline();
        to_chara_select(&mut session);
        session.set_input(Player::One, 5);
        session.set_input(Player::One, 9);
        assert_eq!(session.get_raw_input(Player::One), 5);
    }

    #[test]
    fn loading_only_passes_menu_buttons() {
        let mut session = offline();
        walk(
            &mut session,
            &[
                NetplayState::Initial,
                NetplayState::CharaSelect,
                NetplayState::Loading,
            ],
        );
        session.set_input(Player::One, 0x00FF);
        assert_eq!(session.get_input(Player::One), 0x0030);
    }

    #[test]
    fn loading_mashes_when_remote_is_ahead() {
        let mut session = NetplaySession::new(NetplayConfig::lan()).unwrap();
        walk(
            &mut session,
            &[
                NetplayState::Initial,
                NetplayState::CharaSelect,
                NetplayState::Loading,
            ],
        );
        session.set_remote_index(4);
        session.update_frame(0);
        assert_eq!(session.get_input(Player::One), 0x0010);
        session.update_frame(1);
        assert_eq!(session.get_input(Player::One), 0);
    }

    #[test]
    fn inputs_travel_between_host_and_client() {
        let mut host = NetplaySession::new(NetplayConfig::lan()).unwrap();
        let mut client = NetplaySession::new(NetplayConfig {
            mode: ClientMode::Client,
            ..NetplayConfig::lan()
        })
        .unwrap();
        assert_eq!(client.local_player(), Player::Two);
        to_chara_select(&mut host);
        to_chara_select(&mut client);

        host.set_input(Player::One, 0x11);
        let inputs = host.get_inputs(Player::One).unwrap().unwrap();
        assert_eq!(inputs.indexed_frame, IndexedFrame::new(1, 1));
        assert_eq!(inputs.window(), &[0, 0x11]);

        client
            .handle_message(NetplayMessage::PlayerInputs(inputs))
            .unwrap();
        client.update_frame(1);
        assert_eq!(client.get_input(Player::One), 0x11);
    }

    #[test]
    fn get_inputs_is_none_before_anything_recorded() {
        let mut session = offline();
        to_chara_select(&mut session);
        assert!(session.get_inputs(Player::One).unwrap().is_none());
    }

    #[test]
    fn stale_inputs_are_dropped() {
        let mut session = NetplaySession::new(NetplayConfig {
            preserve_start_index: Some(0),
            ..NetplayConfig::lan()
        })
        .unwrap();
        walk(
            &mut session,
            &[
                NetplayState::Initial,
                NetplayState::CharaSelect,
                NetplayState::Loading,
                NetplayState::InGame,
            ],
        );
        session.set_inputs(Player::Two, &remote_window(1, &[7]));
        assert!(session.timeline(Player::Two).is_empty());
        session.set_inputs(Player::Two, &remote_window(2, &[7]));
        assert_eq!(session.timeline(Player::Two).end_frame_of(2), 1);
    }

    #[test]
    fn spectator_paging_walks_both_timelines() {
        let mut broadcaster = NetplaySession::new(NetplayConfig {
            mode: ClientMode::Broadcast,
            preserve_start_index: Some(0),
            ..NetplayConfig::offline()
        })
        .unwrap();
        to_chara_select(&mut broadcaster);
        for frame in 0..40u32 {
            broadcaster.update_frame(frame);
            broadcaster.set_input(Player::One, frame as Input);
            broadcaster.set_input(Player::Two, 100 + frame as Input);
        }

        let mut pos = IndexedFrame::new(1, NUM_INPUTS as u32 - 1);
        let first = broadcaster.get_both_inputs(&mut pos).unwrap().unwrap();
        assert_eq!(first.indexed_frame, IndexedFrame::new(1, 29));
        assert_eq!(first.window(Player::One)[0], 0);
        assert_eq!(first.window(Player::Two)[29], 129);
        assert_eq!(pos, IndexedFrame::new(1, 59));
        assert!(broadcaster.get_both_inputs(&mut pos).unwrap().is_none());

        broadcaster.set_state(NetplayState::Loading).unwrap();
        let tail = broadcaster.get_both_inputs(&mut pos).unwrap().unwrap();
        assert_eq!(tail.indexed_frame, IndexedFrame::new(1, 39));
        assert_eq!(tail.window(Player::One)[0], 10);
        assert_eq!(pos, IndexedFrame::new(2, 29));
        assert!(broadcaster.get_both_inputs(&mut pos).unwrap().is_none());

        let mut spectator = NetplaySession::new(NetplayConfig {
            mode: ClientMode::SpectateBroadcast,
            ..NetplayConfig::offline()
        })
        .unwrap();
        to_chara_select(&mut spectator);
        spectator.set_both_inputs(&first);
        spectator.set_both_inputs(&tail);
        spectator.update_frame(35);
        assert_eq!(spectator.get_input(Player::One), 35);
        assert_eq!(spectator.get_input(Player::Two), 135);
    }

    // ==========================================
    // Readiness
    // ==========================================

    #[test]
    fn menus_never_wait_for_the_peer() {
        let session = NetplaySession::new(NetplayConfig::lan()).unwrap();
        assert!(session.is_remote_input_ready());
    }

    #[test]
    fn remote_input_ready_tracks_remote_frontier() {
        let mut session = NetplaySession::new(NetplayConfig::lan()).unwrap();
        to_chara_select(&mut session);
        assert!(!session.is_remote_input_ready());

        session.set_inputs(Player::Two, &remote_window(1, &[3]));
        assert!(session.is_remote_input_ready());
        assert_eq!(session.remote_indexed_frame(), IndexedFrame::new(1, 0));

        session.update_frame(1);
        assert!(!session.is_remote_input_ready());

        session.set_remote_index(2);
        assert_eq!(session.remote_index(), 2);
        assert!(session.is_remote_input_ready());
    }

    #[test]
    fn rollback_tolerates_missing_frames() {
        let mut session = rollback_host();
        to_in_game(&mut session);
        session.set_inputs(Player::Two, &remote_window(3, &[0]));
        session.update_frame(4);
        assert!(session.is_remote_input_ready());
        session.update_frame(5);
        assert!(!session.is_remote_input_ready());
    }

    #[test]
    fn rng_state_readiness() {
        let mut client = NetplaySession::new(NetplayConfig {
            mode: ClientMode::Client,
            ..NetplayConfig::lan()
        })
        .unwrap();
        assert!(client.is_rng_state_ready(true));
        to_chara_select(&mut client);
        assert!(!client.is_rng_state_ready(true));
        assert!(client.is_rng_state_ready(false));

        client.set_rng_state(0, vec![9]);
        assert!(!client.is_rng_state_ready(true));

        client
            .handle_message(NetplayMessage::RngState(
                crate::network::messages::RngState {
                    index: 1,
                    state: vec![1, 2],
                },
            ))
            .unwrap();
        assert!(client.is_rng_state_ready(true));
        assert_eq!(client.get_rng_state(1), Some(&[1u8, 2][..]));

        let mut host = NetplaySession::new(NetplayConfig::lan()).unwrap();
        to_chara_select(&mut host);
        assert!(host.is_rng_state_ready(true));
    }

    // ==========================================
    // Retry menu
    // ==========================================

    #[test]
    fn retry_menu_settles_on_both_choices() {
        let mut session = NetplaySession::new(NetplayConfig::lan()).unwrap();
        walk(
            &mut session,
            &[
                NetplayState::Initial,
                NetplayState::CharaSelect,
                NetplayState::Loading,
                NetplayState::Skippable,
                NetplayState::RetryMenu,
            ],
        );
        let index = session.index();
        session.set_input(Player::One, 0x0010);
        assert_eq!(session.get_input(Player::Two), 0);
        assert_eq!(session.get_input(Player::One), 0x0010);

        session.set_local_retry_menu_index(1);
        assert_eq!(session.get_input(Player::One), 0);
        assert_eq!(
            session.local_retry_menu_message(),
            Some(NetplayMessage::MenuIndex {
                index,
                menu_index: 1
            })
        );
        assert_eq!(session.get_retry_menu_index(index), None);

        session
            .handle_message(NetplayMessage::MenuIndex {
                index,
                menu_index: 0,
            })
            .unwrap();
        assert_eq!(session.get_input(Player::One), 0);
        assert_eq!(session.get_retry_menu_index(index), Some(1));

        session.set_state(NetplayState::Loading).unwrap();
        assert_eq!(session.local_retry_menu_message(), None);
    }

    #[test]
    fn retry_menu_choice_is_capped() {
        let mut session = NetplaySession::new(NetplayConfig::lan()).unwrap();
        walk(
            &mut session,
            &[
                NetplayState::Initial,
                NetplayState::CharaSelect,
                NetplayState::Loading,
                NetplayState::Skippable,
                NetplayState::RetryMenu,
            ],
        );
        session.set_local_retry_menu_index(2);
        session.set_remote_retry_menu_index(0);
        assert_eq!(session.get_input(Player::One), 0);
        assert_eq!(session.get_retry_menu_index(session.index()), Some(1));
    }

    #[test]
    fn offline_ignores_retry_menu_indices() {
        let mut session = offline();
        session.set_retry_menu_index(3, 1);
        assert_eq!(session.get_retry_menu_index(3), None);
    }

    // ==========================================
    // Messages and config
    // ==========================================

    #[test]
    fn error_message_becomes_remote_error() {
        let mut session = offline();
        let err = session
            .handle_message(NetplayMessage::ErrorMessage {
                error: "bye".to_owned(),
            })
            .unwrap_err();
        assert_eq!(
            err,
            NetplayError::RemoteError {
                message: "bye".to_owned()
            }
        );
    }

    #[test]
    fn change_config_waits_for_its_frame() {
        let mut session = NetplaySession::new(NetplayConfig::lan()).unwrap();
        to_chara_select(&mut session);
        let change = ChangeConfig {
            kind: ChangeConfigKind::Delay,
            indexed_frame: IndexedFrame::new(1, 5),
            delay: 3,
            rollback: 0,
            rollback_delay: 0,
        };
        session
            .handle_message(NetplayMessage::ChangeConfig(change))
            .unwrap();
        assert_eq!(session.config().delay, 1);
        session.update_frame(4);
        assert_eq!(session.config().delay, 1);
        session.update_frame(5);
        assert_eq!(session.config().delay, 3);
    }

    #[test]
    fn change_config_enabling_rollback_in_game_allocates() {
        let mut session = NetplaySession::new(NetplayConfig {
            snapshot_capacity: 8,
            snapshot_size: 32,
            ..NetplayConfig::lan()
        })
        .unwrap();
        to_in_game(&mut session);
        assert!(!session.snapshots().is_allocated());
        session
            .apply_change_config(&ChangeConfig {
                kind: ChangeConfigKind::Rollback,
                indexed_frame: IndexedFrame::ZERO,
                delay: 1,
                rollback: 3,
                rollback_delay: 1,
            })
            .unwrap();
        assert!(session.is_in_rollback());
        assert!(session.snapshots().is_allocated());
    }

    #[test]
    fn invalid_change_config_is_rejected() {
        let mut session = offline();
        let err = session
            .apply_change_config(&ChangeConfig {
                kind: ChangeConfigKind::Rollback,
                indexed_frame: IndexedFrame::ZERO,
                delay: 0,
                rollback: 20,
                rollback_delay: 0,
            })
            .unwrap_err();
        assert!(matches!(
            err,
            NetplayError::InvalidRequest {
                kind: InvalidRequestKind::ConfigValueOutOfRange {
                    field: "rollback",
                    ..
                }
            }
        ));
    }

    // ==========================================
    // Rollback
    // ==========================================

    fn run_frames(session: &mut NetplaySession, sim: &mut CounterSim, frames: std::ops::Range<u32>) {
        for frame in frames {
            session.update_frame(frame);
            session.save_snapshot(sim).unwrap();
            sim.state.value += 1;
        }
    }

    #[test]
    fn mispredicted_input_triggers_rollback_and_rerun() {
        let mut session = rollback_host();
        let mut sim = CounterSim::new();
        to_in_game(&mut session);
        assert_eq!(session.index(), 3);

        run_frames(&mut session, &mut sim, 0..3);
        session.update_frame(3);
        assert_eq!(
            session.filter_side_effects(&[7]).as_slice(),
            &[7],
            "first pass plays everything"
        );
        run_frames(&mut session, &mut sim, 3..5);
        assert_eq!(sim.state.value, 5);

        session.set_inputs(Player::Two, &remote_window(3, &[0, 0, 7]));
        assert_eq!(session.last_changed_frame(), IndexedFrame::new(3, 2));

        session.update_frame(5);
        assert_eq!(session.rollback_target(), Some(IndexedFrame::new(3, 2)));
        let restored = session.perform_rollback(&mut sim).unwrap();
        assert_eq!(restored, Some(IndexedFrame::new(3, 2)));
        assert_eq!(sim.state.value, 2);
        assert!(session.is_rerunning());
        assert_eq!(session.fast_forward_stop(), Some(IndexedFrame::new(3, 5)));
        assert_eq!(session.last_changed_frame(), IndexedFrame::MAX);
        assert_eq!(session.rollback_target(), None);

        session.set_input(Player::One, 0x40);
        assert_eq!(session.timeline(Player::One).end_frame_of(1), 0);

        session.update_frame(2);
        assert_eq!(session.get_input(Player::Two), 7);
        session.save_snapshot(&sim).unwrap();
        sim.state.value += 1;
        session.update_frame(3);
        assert_eq!(session.filter_side_effects(&[7, 8]).as_slice(), &[8]);
        session.save_snapshot(&sim).unwrap();
        sim.state.value += 1;
        assert!(!session.finish_rerun_if_done());
        run_frames(&mut session, &mut sim, 4..5);
        session.update_frame(5);
        assert!(session.finish_rerun_if_done());
        assert!(!session.is_rerunning());
        assert_eq!(sim.state.value, 5);
        assert_eq!(
            session.snapshots().indexed_frames().collect::<Vec<_>>(),
            (0..5).map(|f| IndexedFrame::new(3, f)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn rollback_spacing_holds_back_the_next_rollback() {
        let mut session = rollback_host();
        let mut sim = CounterSim::new();
        to_in_game(&mut session);
        run_frames(&mut session, &mut sim, 0..4);
        session.set_inputs(Player::Two, &remote_window(3, &[1]));
        session.update_frame(4);
        session.perform_rollback(&mut sim).unwrap().unwrap();
        run_frames(&mut session, &mut sim, 0..4);
        session.update_frame(4);
        assert!(session.finish_rerun_if_done());

        session.set_inputs(Player::Two, &remote_window(3, &[1, 2]));
        assert_eq!(session.last_changed_frame(), IndexedFrame::new(3, 1));
        assert_eq!(session.rollback_target(), None);
        session.update_frame(5);
        assert_eq!(session.rollback_target(), None);
        session.update_frame(6);
        assert_eq!(session.rollback_target(), Some(IndexedFrame::new(3, 1)));
    }

    #[test]
    fn change_at_or_after_current_frame_needs_no_rollback() {
        let mut session = rollback_host();
        to_in_game(&mut session);
        session.update_frame(2);
        session.set_inputs(Player::Two, &remote_window(3, &[0, 0, 5]));
        assert_eq!(session.last_changed_frame(), IndexedFrame::new(3, 2));
        assert_eq!(session.rollback_target(), None);
    }

    #[test]
    fn rollback_without_snapshot_fails() {
        let observer = Arc::new(CollectingObserver::new());
        let mut session = rollback_host().with_observer(observer.clone());
        let mut sim = CounterSim::new();
        to_in_game(&mut session);
        session.update_frame(3);
        session.set_inputs(Player::Two, &remote_window(3, &[0, 4]));
        let err = session.perform_rollback(&mut sim).unwrap_err();
        assert!(matches!(err, NetplayError::RollbackFailed { .. }));
        assert_violation!(observer, ViolationKind::Snapshot);
    }

    #[test]
    fn leaving_in_game_releases_snapshots() {
        let mut session = rollback_host();
        let mut sim = CounterSim::new();
        to_in_game(&mut session);
        run_frames(&mut session, &mut sim, 0..3);
        assert_eq!(session.snapshots().len(), 3);
        session.set_state(NetplayState::Skippable).unwrap();
        assert!(!session.snapshots().is_allocated());
        session.save_snapshot(&sim).unwrap();
    }

    #[test]
    fn watermark_from_unplayed_frames_does_not_reach_the_next_round() {
        let mut session = rollback_host();
        let mut sim = CounterSim::new();
        to_in_game(&mut session);
        run_frames(&mut session, &mut sim, 0..5);

        // The peer is two frames ahead and pressed something on its last frame.
        session.set_inputs(Player::Two, &remote_window(3, &[0, 0, 0, 0, 0, 0, 0, 0x10]));
        assert_eq!(session.last_changed_frame(), IndexedFrame::new(3, 7));

        walk(&mut session, &[NetplayState::Skippable, NetplayState::InGame]);
        assert_eq!(session.indexed_frame(), IndexedFrame::new(5, 0));
        assert!(session.last_changed_frame().is_max());

        session.update_frame(6);
        assert_eq!(session.rollback_target(), None);
        assert_eq!(session.perform_rollback(&mut sim).unwrap(), None);
    }

    #[test]
    fn second_round_rolls_back_within_its_own_index() {
        let mut session = rollback_host();
        let mut sim = CounterSim::new();
        to_in_game(&mut session);
        run_frames(&mut session, &mut sim, 0..5);
        session.set_inputs(Player::Two, &remote_window(3, &[0, 0, 0, 0, 0, 0, 0x10]));
        walk(&mut session, &[NetplayState::Skippable, NetplayState::InGame]);

        run_frames(&mut session, &mut sim, 4..8);
        assert_eq!(session.frame(), 3);
        session.set_inputs(Player::Two, &remote_window(5, &[0x10, 0x20]));
        assert_eq!(session.last_changed_frame(), IndexedFrame::new(5, 1));

        session.update_frame(8);
        let restored = session.perform_rollback(&mut sim).unwrap();
        assert_eq!(restored, Some(IndexedFrame::new(5, 1)));
        assert_eq!(sim.state.value, 6);
    }

    // ==========================================
    // Desync detection
    // ==========================================

    fn hashing_host(interval: u32) -> NetplaySession {
        NetplaySession::new(NetplayConfig {
            desync_detection: DesyncDetection::On { interval },
            ..NetplayConfig::lan()
        })
        .unwrap()
    }

    #[test]
    fn matching_hashes_pass() {
        let mut a = hashing_host(2);
        let mut b = hashing_host(2);
        let sim = CounterSim::new();
        for session in [&mut a, &mut b] {
            to_in_game(session);
            session.set_inputs(Player::Two, &remote_window(3, &[0; 5]));
            session.update_frame(2);
        }
        let from_a = a.record_local_hash(&sim).unwrap().unwrap();
        let from_b = b.record_local_hash(&sim).unwrap().unwrap();
        assert_eq!(from_a.indexed_frame, IndexedFrame::new(3, 2));
        assert_eq!(from_a.hash, from_b.hash);
        a.handle_message(NetplayMessage::SyncHash(from_b)).unwrap();
    }

    #[test]
    fn mismatching_hash_is_a_desync() {
        let observer = Arc::new(CollectingObserver::new());
        let mut session = hashing_host(2).with_observer(observer.clone());
        let sim = CounterSim::new();
        to_in_game(&mut session);
        session.set_inputs(Player::Two, &remote_window(3, &[0; 5]));
        session.update_frame(2);
        let local = session.record_local_hash(&sim).unwrap().unwrap();

        let err = session
            .record_remote_hash(SyncHash {
                indexed_frame: local.indexed_frame,
                hash: local.hash ^ 1,
                dump: "remote".to_owned(),
            })
            .unwrap_err();
        match err {
            NetplayError::DesyncDetected {
                indexed_frame,
                remote_dump,
                ..
            } => {
                assert_eq!(indexed_frame, IndexedFrame::new(3, 2));
                assert_eq!(remote_dump, "remote");
            },
            other => panic!("unexpected error {other:?}"),
        }
        assert_violation!(observer, ViolationKind::Desync);
    }

    #[test]
    fn hashes_off_interval_are_skipped() {
        let mut session = hashing_host(4);
        let sim = CounterSim::new();
        to_in_game(&mut session);
        session.set_inputs(Player::Two, &remote_window(3, &[0; 5]));
        session.update_frame(3);
        assert!(session.record_local_hash(&sim).unwrap().is_none());
    }

    #[test]
    fn predicted_frames_are_hashed_but_held_back() {
        let mut session = NetplaySession::new(NetplayConfig {
            snapshot_capacity: 16,
            snapshot_size: 64,
            desync_detection: DesyncDetection::On { interval: 4 },
            ..NetplayConfig::internet()
        })
        .unwrap();
        let sim = CounterSim::new();
        to_in_game(&mut session);
        session.set_inputs(Player::Two, &remote_window(3, &[0, 0]));
        session.update_frame(4);
        assert!(session.record_local_hash(&sim).unwrap().is_none());
        assert!(session.take_confirmed_hashes().unwrap().is_empty());

        session.set_inputs(Player::Two, &remote_window(3, &[0; 5]));
        let released = session.take_confirmed_hashes().unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].indexed_frame, IndexedFrame::new(3, 4));
        assert!(session.take_confirmed_hashes().unwrap().is_empty());
    }

    #[test]
    fn hashes_keep_flowing_after_a_round_with_unplayed_mismatch() {
        let mut session = NetplaySession::new(NetplayConfig {
            snapshot_capacity: 16,
            snapshot_size: 64,
            desync_detection: DesyncDetection::On { interval: 2 },
            ..NetplayConfig::internet()
        })
        .unwrap();
        let mut sim = CounterSim::new();
        to_in_game(&mut session);
        run_frames(&mut session, &mut sim, 0..5);
        session.set_inputs(Player::Two, &remote_window(3, &[0, 0, 0, 0, 0, 0, 0x10]));
        walk(&mut session, &[NetplayState::Skippable, NetplayState::InGame]);

        session.set_inputs(Player::Two, &remote_window(5, &[0x10; 5]));
        assert!(session.last_changed_frame().is_max());
        session.update_frame(6);
        let sent = session.record_local_hash(&sim).unwrap();
        assert_eq!(
            sent.map(|hash| hash.indexed_frame),
            Some(IndexedFrame::new(5, 2))
        );
    }
}
