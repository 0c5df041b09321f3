//! Common test infrastructure shared across integration tests.
//!
//! - [`ArenaSim`]: a tiny deterministic two-player simulation
//! - [`Peer`]: one side of a match, driving a session, a channel and a socket the way a game loop
//!   would
//! - [`run_match`]: steps two peers against each other until both reach a target frame

#![allow(
    dead_code,
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::missing_panics_doc
)]

use std::fmt;
use std::sync::Once;

use netplay_rollback::{
    ChannelConfig, ChannelEvent, ClientMode, Input, NetplayConfig, NetplayError, NetplayMessage,
    NetplaySession, NetplayState, NonBlockingSocket, Player, ReliableChannel, Simulation,
    WaitConfig, WaitTracker,
};
use web_time::Instant;
use serde::{Deserialize, Serialize};

/// Set to any value to see session and channel logs while tests run.
pub const LOG_ENV: &str = "NETPLAY_TEST_LOG";

/// Installs a `tracing` subscriber writing to the test output, once per test binary, when
/// [`LOG_ENV`] is set.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        if std::env::var_os(LOG_ENV).is_none() {
            return;
        }
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// Tick budget for [`run_match`] before a test is declared stuck.
pub const MAX_TICKS: usize = 20_000;

/// Everything two peers must agree on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArenaState {
    pub world_time: u32,
    pub positions: [i32; 2],
    pub mix: u64,
}

/// A simulation where every input bit changes the outcome.
#[derive(Debug, Clone, Default)]
pub struct ArenaSim {
    pub state: ArenaState,
    /// Adds a bogus step at this world time, to provoke a desync.
    pub fault_at: Option<u32>,
}

impl ArenaSim {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn world_time(&self) -> u32 {
        self.state.world_time
    }

    pub fn step(&mut self, p1: Input, p2: Input) {
        for (pos, input) in self.state.positions.iter_mut().zip([p1, p2]) {
            if input & 0x1 != 0 {
                *pos -= 1;
            }
            if input & 0x2 != 0 {
                *pos += 1;
            }
        }
        self.state.mix = self
            .state
            .mix
            .wrapping_mul(0x100_0000_01b3)
            .wrapping_add((u64::from(p1) << 16) | u64::from(p2));
        if self.fault_at == Some(self.state.world_time) {
            self.state.positions[0] += 100;
        }
        self.state.world_time += 1;
    }
}

impl Simulation for ArenaSim {
    type State = ArenaState;

    fn state(&self) -> &ArenaState {
        &self.state
    }

    fn restore(&mut self, state: ArenaState) {
        self.state = state;
    }
}

/// Scripted controller input for `player` on `frame`.
#[must_use]
pub fn scripted_input(player: Player, frame: u32) -> Input {
    match player {
        Player::One => ((frame * 7 + frame / 5) % 16) as Input,
        Player::Two => ((frame / 3) % 16) as Input,
    }
}

/// Channel settings for tests: fast ticks, no keep-alive timeout.
#[must_use]
pub fn test_channel_config() -> ChannelConfig {
    ChannelConfig {
        keep_alive: None,
        ..ChannelConfig::default()
    }
}

/// Walks a fresh session to [`NetplayState::InGame`].
pub fn enter_match(session: &mut NetplaySession) {
    init_tracing();
    for state in [
        NetplayState::Initial,
        NetplayState::CharaSelect,
        NetplayState::Loading,
        NetplayState::InGame,
    ] {
        session.set_state(state).unwrap();
    }
}

/// Host and client configs derived from one template.
#[must_use]
pub fn host_and_client(template: NetplayConfig) -> (NetplayConfig, NetplayConfig) {
    (
        NetplayConfig {
            mode: ClientMode::Host,
            ..template
        },
        NetplayConfig {
            mode: ClientMode::Client,
            ..template
        },
    )
}

/// One side of a match.
pub struct Peer<S: NonBlockingSocket<u16>> {
    pub session: NetplaySession,
    pub channel: ReliableChannel,
    pub socket: S,
    pub peer_addr: u16,
    pub sim: ArenaSim,
    pub rollbacks: u32,
    pub stalls: u32,
    pub hashes_sent: u32,
    pub wait: WaitTracker,
}

impl<S: NonBlockingSocket<u16>> fmt::Debug for Peer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("session", &self.session)
            .field("world_time", &self.sim.world_time())
            .field("rollbacks", &self.rollbacks)
            .field("stalls", &self.stalls)
            .finish_non_exhaustive()
    }
}

impl<S: NonBlockingSocket<u16>> Peer<S> {
    /// A peer already in the match.
    pub fn new(config: NetplayConfig, socket: S, peer_addr: u16) -> Self {
        let mut session = NetplaySession::new(config).unwrap();
        enter_match(&mut session);
        Self {
            session,
            channel: ReliableChannel::new(test_channel_config()),
            socket,
            peer_addr,
            sim: ArenaSim::new(),
            rollbacks: 0,
            stalls: 0,
            hashes_sent: 0,
            wait: WaitTracker::new(WaitConfig::patient()),
        }
    }

    /// One pass of the game loop. Returns whether the simulation advanced.
    ///
    /// The simulation stops advancing at `target` but keeps talking to the peer.
    pub fn tick(&mut self, target: u32) -> Result<bool, NetplayError> {
        self.receive()?;
        self.rollback_if_needed()?;

        self.session.update_frame(self.sim.world_time());
        let local = self.session.local_player();
        let frame = self.session.frame();
        self.session.set_input(local, scripted_input(local, frame));
        if let Some(inputs) = self.session.get_inputs(local)? {
            self.channel
                .send_unsequenced(NetplayMessage::PlayerInputs(inputs));
        }
        for hash in self.session.take_confirmed_hashes()? {
            self.send_hash(hash)?;
        }
        self.channel.on_timer_tick();
        self.channel.send_all_messages(&mut self.socket, &self.peer_addr);

        if self.sim.world_time() >= target {
            return Ok(false);
        }
        if !self.session.is_remote_input_ready() {
            self.stall()?;
            return Ok(false);
        }
        self.wait.end();
        self.advance()?;
        Ok(true)
    }

    /// Whether nothing this side holds can still change.
    #[must_use]
    pub fn is_settled(&self, target: u32) -> bool {
        self.sim.world_time() >= target
            && !self.session.is_rerunning()
            && self.session.remote_frame() + 1 >= target
            && self.session.last_changed_frame().is_max()
    }

    fn receive(&mut self) -> Result<(), NetplayError> {
        for (_, bytes) in self.socket.receive_all_messages() {
            self.channel.on_receive_bytes(&bytes);
        }
        let events: Vec<_> = self.channel.poll().collect();
        for event in events {
            match event {
                ChannelEvent::Delivered(msg) | ChannelEvent::Unsequenced(msg) => {
                    self.session.handle_message(msg)?;
                },
                ChannelEvent::TimedOut => {
                    return Err(NetplayError::TransportTimeout {
                        peer: self.peer_addr.to_string(),
                        keep_alive_ms: 0,
                    })
                },
                ChannelEvent::ProtocolViolation(context) => {
                    return Err(NetplayError::ProtocolViolation { context })
                },
            }
        }
        Ok(())
    }

    fn stall(&mut self) -> Result<(), NetplayError> {
        self.stalls += 1;
        let now = Instant::now();
        self.wait.begin(now);
        if self.wait.is_timed_out(now) {
            return Err(NetplayError::TransportTimeout {
                peer: self.peer_addr.to_string(),
                keep_alive_ms: self.wait.config().timeout.as_millis() as u64,
            });
        }
        if self.wait.should_resend(now) {
            let local = self.session.local_player();
            if let Some(inputs) = self.session.get_inputs(local)? {
                self.channel
                    .send_unsequenced(NetplayMessage::PlayerInputs(inputs));
            }
        }
        Ok(())
    }

    fn rollback_if_needed(&mut self) -> Result<(), NetplayError> {
        if self.session.perform_rollback(&mut self.sim)?.is_none() {
            return Ok(());
        }
        self.rollbacks += 1;
        loop {
            self.session.update_frame(self.sim.world_time());
            if self.session.finish_rerun_if_done() {
                return Ok(());
            }
            self.advance()?;
        }
    }

    fn advance(&mut self) -> Result<(), NetplayError> {
        self.session.save_snapshot(&self.sim)?;
        if let Some(hash) = self.session.record_local_hash(&self.sim)? {
            self.send_hash(hash)?;
        }
        let p1 = self.session.get_input(Player::One);
        let p2 = self.session.get_input(Player::Two);
        self.sim.step(p1, p2);
        Ok(())
    }

    fn send_hash(&mut self, hash: netplay_rollback::SyncHash) -> Result<(), NetplayError> {
        self.hashes_sent += 1;
        self.channel.send_reliable(NetplayMessage::SyncHash(hash))
    }
}

/// Ticks both peers in turn until both are settled at `target`.
pub fn run_match<A, B>(host: &mut Peer<A>, client: &mut Peer<B>, target: u32) -> Result<(), NetplayError>
where
    A: NonBlockingSocket<u16>,
    B: NonBlockingSocket<u16>,
{
    for _ in 0..MAX_TICKS {
        host.tick(target)?;
        client.tick(target)?;
        if host.is_settled(target) && client.is_settled(target) {
            // Let the last hashes cross before declaring victory.
            for _ in 0..8 {
                host.tick(target)?;
                client.tick(target)?;
            }
            return Ok(());
        }
    }
    panic!("match did not settle within {MAX_TICKS} ticks: {host:?} / {client:?}");
}

/// Steps a lone simulation with the scripted inputs of both players, each landing `offset` frames
/// after it was read, the way a session with that input delay feeds them.
#[must_use]
pub fn reference_run(frames: u32, offset: u32) -> ArenaSim {
    let delayed = |player, frame: u32| {
        frame
            .checked_sub(offset)
            .map_or(0, |read_at| scripted_input(player, read_at))
    };
    let mut sim = ArenaSim::new();
    for frame in 0..frames {
        sim.step(delayed(Player::One, frame), delayed(Player::Two, frame));
    }
    sim
}
