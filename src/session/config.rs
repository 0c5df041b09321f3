//! Configuration types for netplay sessions and their transport.
//!
//! | Config Type | Purpose | Key Presets |
//! |-------------|---------|-------------|
//! | `NetplayConfig` | Delay, rollback and snapshot sizing | `offline()`, `lan()`, `internet()` |
//! | `ChannelConfig` | Reliable channel timing and fragmentation | `lan()`, `lossy()` |
//! | `WaitConfig` | How long the driver may stall on remote input | `patient()` |
//!
//! # Example
//!
//! ```
//! use netplay_rollback::{ChannelConfig, NetplayConfig};
//!
//! let netplay = NetplayConfig {
//!     delay: 2,
//!     ..NetplayConfig::internet()
//! };
//! netplay.validate().expect("preset with a small delay is valid");
//!
//! let channel = ChannelConfig::lossy();
//! channel.validate().expect("presets are valid");
//! ```

use web_time::Duration;

use crate::{
    DesyncDetection, Input, InvalidRequestKind, NetplayError, Player, DEFAULT_SNAPSHOT_CAPACITY,
    MAX_ROLLBACK,
};

/// Marker for a delay that has not been negotiated yet.
pub const DELAY_NOT_NEGOTIATED: u8 = 0xFF;

/// Role of this process in the match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ClientMode {
    /// Hosts a netplay match.
    Host,
    /// Joins a netplay match.
    Client,
    /// Watches a netplay match.
    SpectateNetplay,
    /// Watches a broadcast.
    SpectateBroadcast,
    /// Plays locally while streaming inputs to spectators.
    Broadcast,
    /// Plays locally, nobody watching.
    #[default]
    Offline,
}

impl ClientMode {
    /// Hosting a netplay match.
    #[must_use]
    pub const fn is_host(self) -> bool {
        matches!(self, Self::Host)
    }

    /// Joined a netplay match.
    #[must_use]
    pub const fn is_client(self) -> bool {
        matches!(self, Self::Client)
    }

    /// Any kind of spectator.
    #[must_use]
    pub const fn is_spectate(self) -> bool {
        matches!(self, Self::SpectateNetplay | Self::SpectateBroadcast)
    }

    /// Spectating a netplay match.
    #[must_use]
    pub const fn is_spectate_netplay(self) -> bool {
        matches!(self, Self::SpectateNetplay)
    }

    /// One of the two netplay peers.
    #[must_use]
    pub const fn is_netplay(self) -> bool {
        matches!(self, Self::Host | Self::Client)
    }

    /// Playing locally for spectators.
    #[must_use]
    pub const fn is_broadcast(self) -> bool {
        matches!(self, Self::Broadcast)
    }

    /// Playing locally for nobody.
    #[must_use]
    pub const fn is_offline(self) -> bool {
        matches!(self, Self::Offline)
    }

    /// Both players' input comes from this machine.
    #[must_use]
    pub const fn is_local(self) -> bool {
        matches!(self, Self::Broadcast | Self::Offline)
    }
}

/// Which input bits mean "confirm" and "cancel" in menus.
///
/// Inputs are a direction nibble in the low four bits followed by button bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputMask {
    /// Bits that confirm a menu choice.
    pub confirm: Input,
    /// Bits that back out of a menu.
    pub cancel: Input,
}

impl Default for InputMask {
    fn default() -> Self {
        Self {
            confirm: 0x0010,
            cancel: 0x0020,
        }
    }
}

impl InputMask {
    /// The direction nibble.
    pub const DIRECTIONS: Input = 0x000F;

    /// Confirm and cancel together.
    #[must_use]
    pub const fn menu_buttons(self) -> Input {
        self.confirm | self.cancel
    }
}

/// Settings for a [`NetplaySession`](crate::NetplaySession).
///
/// `delay` and `rollback` are negotiated at connection time; until then `delay` is
/// [`DELAY_NOT_NEGOTIATED`].
///
/// # Forward Compatibility
///
/// New fields may be added. Construct with `..NetplayConfig::default()` or a preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "NetplayConfig has no effect unless passed to NetplaySession::new()"]
pub struct NetplayConfig {
    /// Role of this process.
    pub mode: ClientMode,
    /// Input delay in frames.
    pub delay: u8,
    /// Rollback window in frames. 0 disables rollback.
    pub rollback: u8,
    /// Input delay used while rollback is active.
    pub rollback_delay: u8,
    /// Rounds needed to win a match.
    pub win_count: u8,
    /// The player that drives shared menus.
    pub host_player: Player,
    /// Periodic state hash exchange.
    pub desync_detection: DesyncDetection,
    /// Frames that must pass after a rollback before another may start.
    pub min_rollback_spacing: u8,
    /// Number of snapshot slots.
    pub snapshot_capacity: usize,
    /// Bytes per snapshot slot.
    pub snapshot_size: usize,
    /// Oldest transition index a downstream spectator may still need.
    pub preserve_start_index: Option<u32>,
    /// Menu button bits.
    pub input_mask: InputMask,
}

impl Default for NetplayConfig {
    fn default() -> Self {
        Self {
            mode: ClientMode::Offline,
            delay: DELAY_NOT_NEGOTIATED,
            rollback: 0,
            rollback_delay: 0,
            win_count: 2,
            host_player: Player::One,
            desync_detection: DesyncDetection::Off,
            min_rollback_spacing: 2,
            snapshot_capacity: DEFAULT_SNAPSHOT_CAPACITY,
            snapshot_size: 4096,
            preserve_start_index: None,
            input_mask: InputMask::default(),
        }
    }
}

impl NetplayConfig {
    /// Same as [`NetplayConfig::default`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Local play: no delay, no rollback.
    pub fn offline() -> Self {
        Self {
            delay: 0,
            ..Self::default()
        }
    }

    /// A host on a local network. Low delay, rollback off.
    pub fn lan() -> Self {
        Self {
            mode: ClientMode::Host,
            delay: 1,
            desync_detection: DesyncDetection::On { interval: 60 },
            ..Self::default()
        }
    }

    /// A host over the internet: rollback hides most of the latency.
    pub fn internet() -> Self {
        Self {
            mode: ClientMode::Host,
            delay: 4,
            rollback: 4,
            rollback_delay: 1,
            desync_detection: DesyncDetection::On { interval: 60 },
            ..Self::default()
        }
    }

    /// Whether rollback is enabled.
    #[must_use]
    pub fn rollback_enabled(&self) -> bool {
        self.rollback > 0
    }

    /// Whether `delay` has been negotiated.
    #[must_use]
    pub fn is_negotiated(&self) -> bool {
        self.delay != DELAY_NOT_NEGOTIATED
    }

    /// Checks every field against its allowed range.
    ///
    /// # Errors
    ///
    /// [`NetplayError::InvalidRequest`] naming the first offending field.
    pub fn validate(&self) -> Result<(), NetplayError> {
        if !self.is_negotiated() {
            return Err(InvalidRequestKind::NotNegotiated.into());
        }

        if self.rollback > MAX_ROLLBACK {
            return Err(InvalidRequestKind::ConfigValueOutOfRange {
                field: "rollback",
                min: 0,
                max: u64::from(MAX_ROLLBACK),
                actual: u64::from(self.rollback),
            }
            .into());
        }

        if self.rollback_delay > self.rollback {
            return Err(InvalidRequestKind::ConfigValueOutOfRange {
                field: "rollback_delay",
                min: 0,
                max: u64::from(self.rollback),
                actual: u64::from(self.rollback_delay),
            }
            .into());
        }

        if let DesyncDetection::On { interval: 0 } = self.desync_detection {
            return Err(InvalidRequestKind::ConfigValueOutOfRange {
                field: "desync_detection.interval",
                min: 1,
                max: u64::from(u32::MAX),
                actual: 0,
            }
            .into());
        }

        // Validate snapshot_capacity: 1 to 4096
        if self.snapshot_capacity < 1 || self.snapshot_capacity > 4096 {
            return Err(InvalidRequestKind::ConfigValueOutOfRange {
                field: "snapshot_capacity",
                min: 1,
                max: 4096,
                actual: self.snapshot_capacity as u64,
            }
            .into());
        }

        // Validate snapshot_size: 1 byte to 16 MiB
        if self.snapshot_size < 1 || self.snapshot_size > 16 * 1024 * 1024 {
            return Err(InvalidRequestKind::ConfigValueOutOfRange {
                field: "snapshot_size",
                min: 1,
                max: 16 * 1024 * 1024,
                actual: self.snapshot_size as u64,
            }
            .into());
        }

        Ok(())
    }
}

/// Timing and fragmentation for a [`ReliableChannel`](crate::ReliableChannel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "ChannelConfig has no effect unless passed to ReliableChannel::new()"]
pub struct ChannelConfig {
    /// Time between retransmission ticks. One pending datagram is resent per tick.
    pub send_interval: Duration,
    /// Silence after which the peer is presumed gone. `None` disables keep-alives and the timeout.
    pub keep_alive: Option<Duration>,
    /// Largest encoded message sent whole. Bigger messages are fragmented into pieces this size.
    pub mtu: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            send_interval: Duration::from_millis(50),
            keep_alive: Some(Duration::from_secs(20)),
            mtu: 256,
        }
    }
}

impl ChannelConfig {
    /// Same as [`ChannelConfig::default`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Fast retransmission and a short timeout for a local network.
    pub fn lan() -> Self {
        Self {
            send_interval: Duration::from_millis(16),
            keep_alive: Some(Duration::from_secs(5)),
            ..Self::default()
        }
    }

    /// Small fragments and a long timeout for a connection that drops a lot.
    pub fn lossy() -> Self {
        Self {
            send_interval: Duration::from_millis(33),
            keep_alive: Some(Duration::from_secs(30)),
            mtu: 128,
        }
    }

    /// Number of ticks without traffic before the channel times out.
    #[must_use]
    pub fn keep_alive_ticks(&self) -> Option<u32> {
        let interval = self.send_interval.as_millis().max(1);
        self.keep_alive
            .map(|keep_alive| u32::try_from(keep_alive.as_millis() / interval).unwrap_or(u32::MAX))
    }

    /// Checks every field against its allowed range.
    ///
    /// # Errors
    ///
    /// [`NetplayError::InvalidRequest`] naming the first offending field.
    pub fn validate(&self) -> Result<(), NetplayError> {
        // Validate send_interval: 1ms to 1000ms
        if self.send_interval < Duration::from_millis(1)
            || self.send_interval > Duration::from_millis(1000)
        {
            return Err(InvalidRequestKind::DurationConfigOutOfRange {
                field: "send_interval",
                min_ms: 1,
                max_ms: 1000,
                actual_ms: self.send_interval.as_millis() as u64,
            }
            .into());
        }

        // Validate keep_alive: at least one send interval
        if let Some(keep_alive) = self.keep_alive {
            if keep_alive < self.send_interval {
                return Err(InvalidRequestKind::DurationConfigOutOfRange {
                    field: "keep_alive",
                    min_ms: self.send_interval.as_millis() as u64,
                    max_ms: u64::MAX,
                    actual_ms: keep_alive.as_millis() as u64,
                }
                .into());
            }
        }

        // Validate mtu: 16 to 65507 (largest UDP payload)
        if self.mtu < 16 || self.mtu > 65507 {
            return Err(InvalidRequestKind::ConfigValueOutOfRange {
                field: "mtu",
                min: 16,
                max: 65507,
                actual: self.mtu as u64,
            }
            .into());
        }

        Ok(())
    }
}

/// Bounds on how long the driver stalls while remote input is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "WaitConfig has no effect unless passed to WaitTracker::new()"]
pub struct WaitConfig {
    /// How often local input is resent while waiting.
    pub resend_interval: Duration,
    /// How long to wait in total before giving up on the peer.
    pub timeout: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            resend_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(5),
        }
    }
}

impl WaitConfig {
    /// Same as [`WaitConfig::default`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Resend slowly and wait up to half a minute.
    pub fn patient() -> Self {
        Self {
            resend_interval: Duration::from_millis(250),
            timeout: Duration::from_secs(30),
        }
    }

    /// Checks that the resend interval is nonzero and no longer than the timeout.
    ///
    /// # Errors
    ///
    /// [`NetplayError::InvalidRequest`] naming the offending field.
    pub fn validate(&self) -> Result<(), NetplayError> {
        if self.resend_interval.is_zero() || self.resend_interval > self.timeout {
            return Err(InvalidRequestKind::DurationConfigOutOfRange {
                field: "resend_interval",
                min_ms: 1,
                max_ms: self.timeout.as_millis() as u64,
                actual_ms: self.resend_interval.as_millis() as u64,
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn presets_validate() {
        NetplayConfig::offline().validate().unwrap();
        NetplayConfig::lan().validate().unwrap();
        NetplayConfig::internet().validate().unwrap();
        ChannelConfig::default().validate().unwrap();
        ChannelConfig::lan().validate().unwrap();
        ChannelConfig::lossy().validate().unwrap();
        WaitConfig::default().validate().unwrap();
        WaitConfig::patient().validate().unwrap();
    }

    #[test]
    fn default_delay_is_not_negotiated() {
        let config = NetplayConfig::default();
        assert!(!config.is_negotiated());
        assert_eq!(
            config.validate().unwrap_err(),
            NetplayError::InvalidRequest {
                kind: InvalidRequestKind::NotNegotiated
            }
        );
    }

    #[test]
    fn rollback_above_max_is_rejected() {
        let config = NetplayConfig {
            rollback: MAX_ROLLBACK + 1,
            ..NetplayConfig::offline()
        };
        assert!(matches!(
            config.validate(),
            Err(NetplayError::InvalidRequest {
                kind: InvalidRequestKind::ConfigValueOutOfRange {
                    field: "rollback",
                    ..
                }
            })
        ));
    }

    #[test]
    fn rollback_delay_cannot_exceed_rollback() {
        let config = NetplayConfig {
            rollback: 2,
            rollback_delay: 3,
            ..NetplayConfig::offline()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn keep_alive_ticks_divides_by_interval() {
        assert_eq!(ChannelConfig::default().keep_alive_ticks(), Some(400));
        let quiet = ChannelConfig {
            keep_alive: None,
            ..ChannelConfig::default()
        };
        assert_eq!(quiet.keep_alive_ticks(), None);
    }

    #[test]
    fn channel_config_bounds() {
        let too_fast = ChannelConfig {
            send_interval: Duration::ZERO,
            ..ChannelConfig::default()
        };
        assert!(too_fast.validate().is_err());

        let short_keep_alive = ChannelConfig {
            keep_alive: Some(Duration::from_millis(10)),
            ..ChannelConfig::default()
        };
        assert!(short_keep_alive.validate().is_err());

        let tiny_mtu = ChannelConfig {
            mtu: 8,
            ..ChannelConfig::default()
        };
        assert!(tiny_mtu.validate().is_err());
    }

    #[test]
    fn client_mode_predicates() {
        assert!(ClientMode::Host.is_netplay());
        assert!(ClientMode::Client.is_netplay());
        assert!(ClientMode::SpectateBroadcast.is_spectate());
        assert!(!ClientMode::SpectateBroadcast.is_spectate_netplay());
        assert!(ClientMode::Broadcast.is_local());
        assert!(ClientMode::Offline.is_local());
        assert!(!ClientMode::Host.is_local());
    }

    #[test]
    fn input_mask_combines_menu_buttons() {
        let mask = InputMask::default();
        assert_eq!(mask.menu_buttons(), 0x0030);
        assert_eq!(mask.menu_buttons() & InputMask::DIRECTIONS, 0);
    }
}
