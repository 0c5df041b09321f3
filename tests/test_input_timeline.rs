//! Property tests for [`InputTimeline`] prediction and change tracking.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use netplay_rollback::test_config::miri_case_count;
use netplay_rollback::{IndexedFrame, InputTimeline};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(miri_case_count()))]

    /// A gap reads the same before and after it is filled in by a later write.
    #[test]
    fn gap_reads_are_stable(
        first in any::<u16>(),
        later in any::<u16>(),
        gap in 1u32..40,
    ) {
        let mut timeline = InputTimeline::<u16>::new();
        timeline.set(1, 0, first);
        let predicted: Vec<u16> = (1..=gap).map(|f| timeline.get(1, f)).collect();
        timeline.set(1, gap + 1, later);
        let filled: Vec<u16> = (1..=gap).map(|f| timeline.get(1, f)).collect();
        prop_assert_eq!(predicted, filled);
        prop_assert_eq!(timeline.get(1, gap + 1), later);
    }

    /// `set` never replaces anything already recorded.
    #[test]
    fn set_is_write_once(writes in proptest::collection::vec((0u32..20, any::<u16>()), 1..40)) {
        let mut timeline = InputTimeline::<u16>::new();
        let mut first_write = std::collections::BTreeMap::new();
        for (frame, value) in &writes {
            let already = frame < &timeline.end_frame_of(0);
            timeline.set(0, *frame, *value);
            if !already {
                first_write.entry(*frame).or_insert(*value);
            }
        }
        for (frame, value) in first_write {
            prop_assert_eq!(timeline.get(0, frame), value);
        }
    }

    /// The change watermark lands on the first slot that disagrees with the prediction.
    #[test]
    fn watermark_is_first_disagreement(
        recorded in proptest::collection::vec(any::<u16>(), 1..30),
        incoming in proptest::collection::vec(any::<u16>(), 1..30),
    ) {
        let mut timeline = InputTimeline::<u16>::new();
        timeline.set_range(2, 0, &recorded, u32::MAX);
        let expected = incoming
            .iter()
            .zip(0u32..)
            .find(|(value, frame)| timeline.get(2, *frame) != **value)
            .map_or(IndexedFrame::MAX, |(_, frame)| IndexedFrame::new(2, frame));

        timeline.set_range(2, 0, &incoming, 0);
        prop_assert_eq!(timeline.last_changed_frame(), expected);
        for (frame, value) in (0u32..).zip(&incoming) {
            prop_assert_eq!(timeline.get(2, frame), *value);
        }
    }

    /// Pruning shifts indices down without touching what remains.
    #[test]
    fn erase_keeps_newer_indices(
        runs in proptest::collection::vec(proptest::collection::vec(any::<u16>(), 1..8), 4..8),
        erase in 1u32..3,
    ) {
        let mut timeline = InputTimeline::<u16>::new();
        for (index, run) in (0u32..).zip(&runs) {
            timeline.set_range(index, 0, run, u32::MAX);
        }
        timeline.erase_index_older_than(erase);
        prop_assert_eq!(timeline.end_index() as usize, runs.len() - erase as usize);
        for (index, run) in (0u32..).zip(&runs[erase as usize..]) {
            for (frame, value) in (0u32..).zip(run) {
                prop_assert_eq!(timeline.get(index, frame), *value);
            }
        }
    }
}

#[test]
fn empty_index_predicts_from_the_previous_one() {
    let mut timeline = InputTimeline::<u16>::new();
    timeline.set_range(0, 0, &[1, 2, 3], u32::MAX);
    timeline.resize(2, 0);
    assert!(timeline.is_index_empty(1));
    assert!(timeline.is_index_empty(2));
    assert_eq!(timeline.get(2, 50), 3);
    assert_eq!(timeline.last_input_before(2), 3);
}

#[test]
fn copy_range_refuses_predicted_slots() {
    let mut timeline = InputTimeline::<u16>::new();
    timeline.set_range(0, 0, &[1, 2, 3], u32::MAX);
    let mut out = [0u16; 4];
    assert!(timeline.copy_range(0, 0, &mut out).is_err());
    timeline.copy_range(0, 1, &mut out[..2]).unwrap();
    assert_eq!(&out[..2], &[2, 3]);
}

#[test]
fn clearing_the_watermark() {
    let mut timeline = InputTimeline::<u16>::new();
    timeline.set_range(0, 0, &[5], 0);
    assert_eq!(timeline.last_changed_frame(), IndexedFrame::new(0, 0));
    timeline.clear_last_changed_frame();
    assert!(timeline.last_changed_frame().is_max());
}
