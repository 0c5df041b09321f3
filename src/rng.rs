//! PCG32 pseudo random numbers for fault injection.
//!
//! [`ChaosSocket`](crate::ChaosSocket) needs reproducible loss patterns in tests; a seeded
//! [`Pcg32`] gives exactly that without the `rand` dependency tree.
//!
//! ```rust
//! use netplay_rollback::rng::{Pcg32, Rng, SeedableRng};
//!
//! let mut a = Pcg32::seed_from_u64(7);
//! let mut b = Pcg32::seed_from_u64(7);
//! assert_eq!(a.gen_range(0..100), b.gen_range(0..100));
//! ```
//!
//! Reference: <https://www.pcg-random.org/>

use crate::{
    report_violation,
    telemetry::{ViolationKind, ViolationSeverity},
};

/// PCG-XSH-RR with 64 bits of state. Not cryptographically secure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

/// Default increment for single-stream PCG32.
const PCG_DEFAULT_INCREMENT: u64 = 1442695040888963407;

/// Multiplier constant for the LCG step.
const PCG_MULTIPLIER: u64 = 6364136223846793005;

impl Pcg32 {
    /// Creates a generator from an initial state and a stream selector.
    #[must_use]
    pub const fn new(state: u64, stream: u64) -> Self {
        let inc = (stream << 1) | 1;
        let mut pcg = Self { state: 0, inc };
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg.state = pcg.state.wrapping_add(state);
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg
    }
}

/// Construction of seeded generators.
pub trait SeedableRng: Sized {
    /// Creates a generator from a 64-bit seed. Equal seeds give equal sequences.
    #[must_use]
    fn seed_from_u64(seed: u64) -> Self;

    /// Creates a generator seeded from the wall clock.
    #[must_use]
    fn from_entropy() -> Self;
}

impl SeedableRng for Pcg32 {
    fn seed_from_u64(seed: u64) -> Self {
        Self::new(seed, PCG_DEFAULT_INCREMENT)
    }

    fn from_entropy() -> Self {
        Self::seed_from_u64(clock_seed())
    }
}

/// Random value generation on top of a 32-bit source.
pub trait Rng {
    /// Returns the next 32-bit random value.
    fn next_u32(&mut self) -> u32;

    /// Returns the next 64-bit random value.
    fn next_u64(&mut self) -> u64 {
        (u64::from(self.next_u32()) << 32) | u64::from(self.next_u32())
    }

    /// Returns a value in `[range.start, range.end)` without modulo bias.
    ///
    /// An empty range is reported as a violation and yields `range.start`.
    fn gen_range(&mut self, range: std::ops::Range<u32>) -> u32 {
        let span = range.end.wrapping_sub(range.start);
        if range.is_empty() || span == 0 {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Configuration,
                "gen_range called with empty range [{}..{})",
                range.start,
                range.end
            );
            return range.start;
        }

        let threshold = span.wrapping_neg() % span;
        loop {
            let value = self.next_u32();
            if value >= threshold {
                return range.start.wrapping_add(value % span);
            }
        }
    }

    /// Returns a `usize` in `[range.start, range.end)`; ranges are limited to `u32` spans.
    fn gen_range_usize(&mut self, range: std::ops::Range<usize>) -> usize {
        let span = range.end.saturating_sub(range.start).min(u32::MAX as usize) as u32;
        range.start + self.gen_range(0..span) as usize
    }

    /// Returns `true` with the given probability, clamped to `[0.0, 1.0]`.
    fn gen_bool(&mut self, probability: f64) -> bool {
        let p = probability.clamp(0.0, 1.0);
        if p >= 1.0 {
            return true;
        }
        let threshold = (p * f64::from(u32::MAX)) as u32;
        self.next_u32() < threshold
    }
}

impl Rng for Pcg32 {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(PCG_MULTIPLIER)
            .wrapping_add(self.inc);
        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        xorshifted.rotate_right(rot)
    }
}

/// Wall clock nanoseconds mixed through FNV-1a. Only used when no seed is configured.
fn clock_seed() -> u64 {
    use crate::hash::fnv1a_hash;
    use web_time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    fnv1a_hash(&nanos).wrapping_add(0x9e3779b97f4a7c15)
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
    use crate::test_config::miri_case_count;
    use proptest::prelude::*;

    #[test]
    fn same_seed_same_sequence() {
        let mut rng1 = Pcg32::seed_from_u64(12345);
        let mut rng2 = Pcg32::seed_from_u64(12345);
        for _ in 0..1000 {
            assert_eq!(rng1.next_u32(), rng2.next_u32());
        }
    }

    #[test]
    fn different_seeds_diverge() {
        let mut rng1 = Pcg32::seed_from_u64(1);
        let mut rng2 = Pcg32::seed_from_u64(2);
        let same = (0..100)
            .filter(|_| rng1.next_u32() == rng2.next_u32())
            .count();
        assert!(same < 10);
    }

    #[test]
    fn gen_bool_extremes() {
        let mut rng = Pcg32::seed_from_u64(9);
        assert!((0..200).all(|_| !rng.gen_bool(0.0)));
        assert!((0..200).all(|_| rng.gen_bool(1.0)));
    }

    #[test]
    fn gen_bool_half_is_roughly_fair() {
        let mut rng = Pcg32::seed_from_u64(42);
        let hits = (0..10_000).filter(|_| rng.gen_bool(0.5)).count();
        assert!((4_500..5_500).contains(&hits), "hits = {hits}");
    }

    #[test]
    fn empty_range_returns_start() {
        let mut rng = Pcg32::seed_from_u64(3);
        assert_eq!(rng.gen_range(5..5), 5);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(miri_case_count()))]

        #[test]
        fn gen_range_stays_in_bounds(seed in any::<u64>(), start in 0u32..1000, len in 1u32..1000) {
            let mut rng = Pcg32::seed_from_u64(seed);
            let value = rng.gen_range(start..start + len);
            prop_assert!(value >= start && value < start + len);
        }

        #[test]
        fn gen_range_usize_stays_in_bounds(seed in any::<u64>(), len in 1usize..300) {
            let mut rng = Pcg32::seed_from_u64(seed);
            prop_assert!(rng.gen_range_usize(0..len) < len);
        }
    }
}
