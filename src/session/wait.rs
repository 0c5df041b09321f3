//! Bounded stalling while the peer's input is late.

use tracing::{debug, warn};
use web_time::Instant;

use crate::session::config::WaitConfig;

/// Tracks one stall of the simulation.
///
/// The driver calls [`begin`](Self::begin) every tick that
/// [`is_remote_input_ready`](crate::NetplaySession::is_remote_input_ready) says no, resends its
/// local input whenever [`should_resend`](Self::should_resend) agrees, and gives up once
/// [`is_timed_out`](Self::is_timed_out). [`end`](Self::end) is called as soon as the input arrives.
///
/// ```
/// use netplay_rollback::{WaitConfig, WaitTracker};
/// use web_time::{Duration, Instant};
///
/// let mut wait = WaitTracker::new(WaitConfig::default());
/// let start = Instant::now();
/// wait.begin(start);
/// assert!(wait.should_resend(start));
/// assert!(!wait.should_resend(start + Duration::from_millis(10)));
/// assert!(wait.is_timed_out(start + Duration::from_secs(6)));
/// wait.end();
/// assert!(!wait.is_waiting());
/// ```
#[derive(Debug, Clone)]
pub struct WaitTracker {
    config: WaitConfig,
    started: Option<Instant>,
    last_resend: Option<Instant>,
    resends: u32,
}

impl WaitTracker {
    /// A tracker that is not waiting.
    #[must_use]
    pub fn new(config: WaitConfig) -> Self {
        Self {
            config,
            started: None,
            last_resend: None,
            resends: 0,
        }
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> WaitConfig {
        self.config
    }

    /// Starts a stall at `now`. Does nothing if one is already running.
    pub fn begin(&mut self, now: Instant) {
        if self.started.is_none() {
            debug!("Waiting for remote input");
            self.started = Some(now);
            self.last_resend = None;
            self.resends = 0;
        }
    }

    /// Whether local input should be sent again. Returns `true` once per resend interval.
    pub fn should_resend(&mut self, now: Instant) -> bool {
        if self.started.is_none() {
            return false;
        }
        let due = match self.last_resend {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.config.resend_interval,
        };
        if due {
            self.last_resend = Some(now);
            self.resends += 1;
        }
        due
    }

    /// Whether the stall has lasted longer than the timeout.
    #[must_use]
    pub fn is_timed_out(&self, now: Instant) -> bool {
        match self.started {
            Some(started) => {
                let timed_out = now.saturating_duration_since(started) >= self.config.timeout;
                if timed_out {
                    warn!(
                        resends = self.resends,
                        timeout_ms = self.config.timeout.as_millis() as u64,
                        "Gave up waiting for remote input"
                    );
                }
                timed_out
            },
            None => false,
        }
    }

    /// Ends the stall.
    pub fn end(&mut self) {
        if self.started.take().is_some() {
            debug!(resends = self.resends, "Remote input arrived");
        }
        self.last_resend = None;
    }

    /// Whether a stall is running.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.started.is_some()
    }

    /// Resends during the current or last stall.
    #[must_use]
    pub fn resends(&self) -> u32 {
        self.resends
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use web_time::Duration;

    #[test]
    fn resend_is_paced_by_interval() {
        let mut wait = WaitTracker::new(WaitConfig {
            resend_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(1),
        });
        let t0 = Instant::now();
        wait.begin(t0);
        assert!(wait.should_resend(t0));
        assert!(!wait.should_resend(t0 + Duration::from_millis(99)));
        assert!(wait.should_resend(t0 + Duration::from_millis(100)));
        assert!(!wait.should_resend(t0 + Duration::from_millis(150)));
        assert_eq!(wait.resends(), 2);
    }

    #[test]
    fn begin_twice_keeps_first_start() {
        let mut wait = WaitTracker::new(WaitConfig::default());
        let t0 = Instant::now();
        wait.begin(t0);
        wait.begin(t0 + Duration::from_secs(4));
        assert!(wait.is_timed_out(t0 + Duration::from_secs(5)));
    }

    #[test]
    fn idle_tracker_never_resends_or_times_out() {
        let mut wait = WaitTracker::new(WaitConfig::default());
        let t0 = Instant::now();
        assert!(!wait.should_resend(t0));
        assert!(!wait.is_timed_out(t0 + Duration::from_secs(60)));
    }

    #[test]
    fn end_resets_the_stall() {
        let mut wait = WaitTracker::new(WaitConfig::default());
        let t0 = Instant::now();
        wait.begin(t0);
        wait.end();
        assert!(!wait.is_waiting());
        let t1 = t0 + Duration::from_secs(10);
        wait.begin(t1);
        assert!(!wait.is_timed_out(t1 + Duration::from_secs(1)));
    }
}
