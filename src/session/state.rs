//! High-level netplay phases and the transitions allowed between them.
//!
//! ```text
//! PreInitial      -> Initial
//! Initial         -> AutoCharaSelect | CharaSelect
//! AutoCharaSelect -> Loading
//! CharaSelect     -> Loading
//! Loading         -> Skippable | InGame
//! Skippable       -> InGame | RetryMenu
//! InGame          -> Skippable | CharaSelect
//! RetryMenu       -> Loading | CharaSelect
//! ```
//!
//! Anything not in [`NetplayState::valid_next`] is an illegal transition, which the session
//! treats as a desync.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A netplay phase. Ordered by how far into a match it sits.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum NetplayState {
    /// Before the title screen has been passed.
    #[default]
    PreInitial,
    /// Main menu.
    Initial,
    /// Character select driven by pre-agreed choices (spectators, replays).
    AutoCharaSelect,
    /// Character select driven by the players.
    CharaSelect,
    /// Loading a match.
    Loading,
    /// Cut-ins and round intros the players may skip.
    Skippable,
    /// The match itself.
    InGame,
    /// The post-match menu.
    RetryMenu,
}

impl NetplayState {
    /// Every state, in order.
    pub const ALL: [NetplayState; 8] = [
        Self::PreInitial,
        Self::Initial,
        Self::AutoCharaSelect,
        Self::CharaSelect,
        Self::Loading,
        Self::Skippable,
        Self::InGame,
        Self::RetryMenu,
    ];

    /// The states reachable from `self` in one step.
    #[must_use]
    pub const fn valid_next(self) -> &'static [NetplayState] {
        match self {
            Self::PreInitial => &[Self::Initial],
            Self::Initial => &[Self::AutoCharaSelect, Self::CharaSelect],
            Self::AutoCharaSelect | Self::CharaSelect => &[Self::Loading],
            Self::Loading => &[Self::Skippable, Self::InGame],
            Self::Skippable => &[Self::InGame, Self::RetryMenu],
            Self::InGame => &[Self::Skippable, Self::CharaSelect],
            Self::RetryMenu => &[Self::Loading, Self::CharaSelect],
        }
    }

    /// Whether `next` may follow `self`.
    #[must_use]
    pub fn is_valid_next(self, next: NetplayState) -> bool {
        self.valid_next().contains(&next)
    }

    /// Whether this state waits on the peer's input before the simulation may advance.
    #[must_use]
    pub const fn needs_remote_input(self) -> bool {
        matches!(self, Self::CharaSelect | Self::InGame)
    }

    /// Whether entering this state starts a new transition index.
    #[must_use]
    pub const fn starts_new_index(self) -> bool {
        matches!(
            self,
            Self::CharaSelect | Self::Loading | Self::Skippable | Self::InGame | Self::RetryMenu
        )
    }

    /// The variant name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PreInitial => "PreInitial",
            Self::Initial => "Initial",
            Self::AutoCharaSelect => "AutoCharaSelect",
            Self::CharaSelect => "CharaSelect",
            Self::Loading => "Loading",
            Self::Skippable => "Skippable",
            Self::InGame => "InGame",
            Self::RetryMenu => "RetryMenu",
        }
    }
}

impl fmt::Display for NetplayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skipping_skippable_is_rejected() {
        assert!(!NetplayState::InGame.is_valid_next(NetplayState::RetryMenu));
        assert!(NetplayState::InGame.is_valid_next(NetplayState::Skippable));
        assert!(NetplayState::Skippable.is_valid_next(NetplayState::RetryMenu));
    }

    #[test]
    fn nothing_returns_to_pre_initial() {
        for state in NetplayState::ALL {
            assert!(!state.is_valid_next(NetplayState::PreInitial));
            assert!(!state.is_valid_next(state), "{state} -> {state}");
        }
    }

    #[test]
    fn ordering_follows_match_progress() {
        assert!(NetplayState::Initial < NetplayState::CharaSelect);
        assert!(NetplayState::Loading < NetplayState::InGame);
        let mut sorted = NetplayState::ALL;
        sorted.sort();
        assert_eq!(sorted, NetplayState::ALL);
    }

    #[test]
    fn only_gameplay_states_wait_for_remote_input() {
        let waiting: Vec<_> = NetplayState::ALL
            .into_iter()
            .filter(|s| s.needs_remote_input())
            .collect();
        assert_eq!(waiting, vec![NetplayState::CharaSelect, NetplayState::InGame]);
    }

    #[test]
    fn display_is_variant_name() {
        assert_eq!(NetplayState::AutoCharaSelect.to_string(), "AutoCharaSelect");
    }
}
