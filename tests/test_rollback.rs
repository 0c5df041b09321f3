//! Rollback against late remote input, driven by hand so every delivery is under test control.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

mod common;

use common::{enter_match, reference_run, scripted_input, ArenaSim, ArenaState};
use netplay_rollback::snapshot_store::EffectId;
use netplay_rollback::{
    ClientMode, IndexedFrame, NetplayConfig, NetplayError, NetplaySession, NetplayState, Player,
    PlayerInputs, SnapshotMeta, SnapshotStore,
};

const TARGET: u32 = 120;
const MATCH_INDEX: u32 = 3;
const HIT_SOUND: EffectId = 1;

fn rollback_config() -> NetplayConfig {
    NetplayConfig {
        mode: ClientMode::Host,
        snapshot_capacity: 32,
        snapshot_size: 64,
        ..NetplayConfig::internet()
    }
}

/// What the client would have published up to `upto`, with its one frame of input lead.
fn client_window(upto: u32) -> PlayerInputs {
    let mut inputs = PlayerInputs::new(IndexedFrame::new(MATCH_INDEX, upto));
    let start = inputs.start_frame();
    for (slot, frame) in inputs.inputs.iter_mut().zip(start..=upto) {
        *slot = frame
            .checked_sub(1)
            .map_or(0, |read_at| scripted_input(Player::Two, read_at));
    }
    inputs
}

#[derive(Default)]
struct Driver {
    rollbacks: u32,
    sounds_played: u32,
}

impl Driver {
    fn step(&mut self, session: &mut NetplaySession, sim: &mut ArenaSim) -> Result<(), NetplayError> {
        session.save_snapshot(sim)?;
        let fired: &[EffectId] = if session.frame() % 10 == 0 {
            &[HIT_SOUND]
        } else {
            &[]
        };
        self.sounds_played += session.filter_side_effects(fired).len() as u32;
        let p1 = session.get_input(Player::One);
        let p2 = session.get_input(Player::Two);
        sim.step(p1, p2);
        Ok(())
    }

    fn tick(&mut self, session: &mut NetplaySession, sim: &mut ArenaSim) -> Result<(), NetplayError> {
        if session.perform_rollback(sim)?.is_some() {
            self.rollbacks += 1;
            loop {
                session.update_frame(sim.world_time());
                if session.finish_rerun_if_done() {
                    break;
                }
                self.step(session, sim)?;
            }
        }
        session.update_frame(sim.world_time());
        let frame = session.frame();
        session.set_input(Player::One, scripted_input(Player::One, frame));
        if sim.world_time() < TARGET && session.is_remote_input_ready() {
            self.step(session, sim)?;
        }
        Ok(())
    }
}

#[test]
fn late_remote_input_is_reconciled() {
    let mut session = NetplaySession::new(rollback_config()).unwrap();
    enter_match(&mut session);
    assert_eq!(session.index(), MATCH_INDEX);
    let mut sim = ArenaSim::new();
    let mut driver = Driver::default();

    while sim.world_time() < TARGET {
        let now = sim.world_time();
        // The peer lags two frames behind and its packets arrive in bursts.
        if now % 3 == 0 {
            session.set_inputs(Player::Two, &client_window(now.saturating_sub(2)));
        }
        driver.tick(&mut session, &mut sim).unwrap();
    }

    session.set_inputs(Player::Two, &client_window(TARGET - 1));
    for _ in 0..4 {
        driver.tick(&mut session, &mut sim).unwrap();
    }

    assert!(driver.rollbacks > 0);
    assert!(!session.is_rerunning());
    assert!(session.last_changed_frame().is_max());
    assert_eq!(sim.state, reference_run(TARGET, 1).state);
    assert_eq!(driver.sounds_played, TARGET / 10);
}

#[test]
fn remote_too_far_behind_stalls_the_match() {
    let mut session = NetplaySession::new(rollback_config()).unwrap();
    enter_match(&mut session);
    let mut sim = ArenaSim::new();
    let mut driver = Driver::default();

    session.set_inputs(Player::Two, &client_window(0));
    for _ in 0..20 {
        driver.tick(&mut session, &mut sim).unwrap();
    }
    // Frame 0 is known and four more may be predicted.
    assert_eq!(sim.world_time(), 5);

    session.set_inputs(Player::Two, &client_window(10));
    for _ in 0..20 {
        driver.tick(&mut session, &mut sim).unwrap();
    }
    assert_eq!(sim.world_time(), 15);
}

#[test]
fn correct_predictions_never_roll_back() {
    let config = rollback_config();
    let mut session = NetplaySession::new(config).unwrap();
    enter_match(&mut session);
    let mut sim = ArenaSim::new();
    let mut driver = Driver::default();

    // Player two never presses anything, so repeating the last input is always right.
    let mut idle = PlayerInputs::new(IndexedFrame::new(MATCH_INDEX, 0));
    for frame in 0..60u32 {
        idle.indexed_frame = IndexedFrame::new(MATCH_INDEX, frame);
        session.set_inputs(Player::Two, &idle);
        driver.tick(&mut session, &mut sim).unwrap();
    }
    assert_eq!(driver.rollbacks, 0);
    assert!(session.last_changed_frame().is_max());
}

#[test]
fn load_between_two_snapshots_picks_the_older() {
    let mut store = SnapshotStore::new();
    store.allocate(8, 64).unwrap();
    let mut sim = ArenaSim::new();
    for frame in [100, 110] {
        sim.state.world_time = frame;
        let meta = SnapshotMeta {
            netplay_state: NetplayState::InGame,
            start_world_time: 0,
            indexed_frame: IndexedFrame::new(MATCH_INDEX, frame),
        };
        store.save(meta, &sim, None).unwrap();
    }

    let meta = store
        .load(IndexedFrame::new(MATCH_INDEX, 105), &mut sim)
        .unwrap();
    assert_eq!(meta.indexed_frame, IndexedFrame::new(MATCH_INDEX, 100));
    assert_eq!(
        sim.state,
        ArenaState {
            world_time: 100,
            ..ArenaState::default()
        }
    );
    assert_eq!(store.len(), 1);
}
