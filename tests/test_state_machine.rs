//! Table-driven checks of the netplay state machine through the public session API.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use netplay_rollback::{NetplayConfig, NetplayError, NetplaySession, NetplayState};

/// Shortest walk from `PreInitial` to each state.
fn path_to(state: NetplayState) -> &'static [NetplayState] {
    use NetplayState::*;
    match state {
        PreInitial => &[],
        Initial => &[Initial],
        AutoCharaSelect => &[Initial, AutoCharaSelect],
        CharaSelect => &[Initial, CharaSelect],
        Loading => &[Initial, CharaSelect, Loading],
        Skippable => &[Initial, CharaSelect, Loading, Skippable],
        InGame => &[Initial, CharaSelect, Loading, InGame],
        RetryMenu => &[Initial, CharaSelect, Loading, Skippable, RetryMenu],
    }
}

fn session_in(state: NetplayState) -> NetplaySession {
    let mut session = NetplaySession::new(NetplayConfig::lan()).unwrap();
    for step in path_to(state) {
        session.set_state(*step).unwrap();
    }
    assert_eq!(session.state(), state);
    session
}

fn check_transition(from: NetplayState, to: NetplayState, allowed: bool) {
    let mut session = session_in(from);
    let before = session.indexed_frame();
    let result = session.set_state(to);
    if allowed {
        result.unwrap();
        assert_eq!(session.state(), to);
        if to.starts_new_index() {
            assert_eq!(session.index(), before.index() + 1);
            assert_eq!(session.frame(), 0);
        } else {
            assert_eq!(session.indexed_frame(), before);
        }
    } else {
        assert_eq!(
            result.unwrap_err(),
            NetplayError::IllegalTransition { from, to }
        );
        assert_eq!(session.state(), from);
        assert_eq!(session.indexed_frame(), before);
    }
}

macro_rules! transition_cases {
    ($($from:ident => $to:ident : $allowed:expr),* $(,)?) => {
        pastey::paste! {
            $(
                #[test]
                fn [<$from:snake _to_ $to:snake>]() {
                    check_transition(NetplayState::$from, NetplayState::$to, $allowed);
                }
            )*
        }
    };
}

transition_cases! {
    PreInitial => Initial: true,
    PreInitial => CharaSelect: false,
    Initial => AutoCharaSelect: true,
    Initial => CharaSelect: true,
    Initial => Loading: false,
    AutoCharaSelect => Loading: true,
    AutoCharaSelect => CharaSelect: false,
    CharaSelect => Loading: true,
    CharaSelect => InGame: false,
    Loading => Skippable: true,
    Loading => InGame: true,
    Loading => RetryMenu: false,
    Skippable => InGame: true,
    Skippable => RetryMenu: true,
    Skippable => CharaSelect: false,
    InGame => Skippable: true,
    InGame => CharaSelect: true,
    InGame => RetryMenu: false,
    InGame => Loading: false,
    RetryMenu => Loading: true,
    RetryMenu => CharaSelect: true,
    RetryMenu => InGame: false,
    RetryMenu => PreInitial: false,
}

#[test]
fn table_and_session_agree_on_every_pair() {
    for from in NetplayState::ALL {
        for to in NetplayState::ALL {
            check_transition(from, to, from.is_valid_next(to));
        }
    }
}

#[test]
fn a_full_set_of_matches_keeps_counting_indices() {
    use NetplayState::*;
    let mut session = session_in(CharaSelect);
    let mut expected = session.index();
    for _ in 0..3 {
        for next in [Loading, Skippable, InGame, Skippable, RetryMenu] {
            session.set_state(next).unwrap();
            expected += 1;
            assert_eq!(session.index(), expected, "entering {next}");
        }
    }
    session.set_state(CharaSelect).unwrap();
    assert_eq!(session.index(), expected + 1);
    assert_eq!(session.spectate_start_index(), expected + 1);
}

#[test]
fn aborted_session_refuses_every_transition() {
    let mut session = session_in(NetplayState::InGame);
    session.abort();
    for to in NetplayState::ALL {
        assert!(session.set_state(to).is_err(), "{to} accepted after abort");
    }
}
