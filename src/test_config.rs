//! Shared knobs for property-based and lossy-network tests.
//!
//! Under Miri the case counts drop sharply so the interpreter finishes in reasonable time.
//!
//! ```ignore
//! use crate::test_config::miri_case_count;
//!
//! proptest! {
//!     #![proptest_config(ProptestConfig::with_cases(miri_case_count()))]
//!     #[test]
//!     fn timeline_get_is_stable(value in any::<u16>()) {
//!         // ...
//!     }
//! }
//! ```

/// Number of proptest cases per property: 5 under Miri, 256 otherwise.
#[must_use]
pub const fn miri_case_count() -> u32 {
    if cfg!(miri) {
        5
    } else {
        256
    }
}

/// Upper bound on channel ticks a lossy-delivery test may spend before it is declared stuck.
#[must_use]
pub const fn lossy_tick_budget() -> u32 {
    if cfg!(miri) {
        2_000
    } else {
        20_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_shrink_under_miri() {
        if cfg!(miri) {
            assert_eq!(miri_case_count(), 5);
            assert_eq!(lossy_tick_budget(), 2_000);
        } else {
            assert_eq!(miri_case_count(), 256);
            assert_eq!(lossy_tick_budget(), 20_000);
        }
    }
}
