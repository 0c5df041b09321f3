//! Sparse per-player input storage addressed by `(transition index, frame)`.
//!
//! Every transition index owns a dense run of frames starting at 0. Reads past the end of a run
//! predict by repeating the last known value, and reads of an index with no data fall back to the
//! most recent earlier index that has some. Writes beyond the end extend the run and fill the gap
//! with that same prediction, so a gap always reads the same before and after it is filled in.
//!
//! Indices here are relative: the session subtracts its retained start index before calling in,
//! which keeps [`InputTimeline::erase_index_older_than`] a plain front truncation.

use tracing::trace;

use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{report_violation, IndexedFrame, NetplayError};

/// Inputs for one player across every retained transition index.
///
/// # Examples
///
/// ```
/// use netplay_rollback::{IndexedFrame, InputTimeline};
///
/// let mut timeline = InputTimeline::<u16>::new();
/// timeline.set(2, 5, 0x0010);
/// assert_eq!(timeline.get(2, 10), 0x0010);
///
/// timeline.set_range(2, 10, &[0x0020], 0);
/// assert_eq!(timeline.last_changed_frame(), IndexedFrame::new(2, 10));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputTimeline<T> {
    // index -> frame -> input
    inputs: Vec<Vec<T>>,
    last_changed: IndexedFrame,
}

impl<T> Default for InputTimeline<T> {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            last_changed: IndexedFrame::MAX,
        }
    }
}

impl<T: Copy + Default + PartialEq> InputTimeline<T> {
    /// An empty timeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The value at `index:frame`, or the best prediction for it.
    #[must_use]
    pub fn get(&self, index: u32, frame: u32) -> T {
        match self.inputs.get(index as usize) {
            Some(run) => match run.get(frame as usize) {
                Some(value) => *value,
                None => run
                    .last()
                    .copied()
                    .unwrap_or_else(|| self.last_input_before(index)),
            },
            None => self.last_input_before(index),
        }
    }

    /// Copies `out.len()` recorded values starting at `index:frame`. No prediction.
    ///
    /// # Errors
    ///
    /// [`NetplayError::InternalError`] if any requested slot has not been recorded.
    pub fn copy_range(&self, index: u32, frame: u32, out: &mut [T]) -> Result<(), NetplayError> {
        let start = frame as usize;
        let end = start + out.len();
        let Some(run) = self
            .inputs
            .get(index as usize)
            .and_then(|run| run.get(start..end))
        else {
            let context = format!(
                "input range {}:[{}..{}) not recorded (index holds {} frames)",
                index,
                start,
                end,
                self.end_frame_of(index)
            );
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::InputTimeline,
                "Copy of unrecorded inputs: {}",
                context
            );
            return Err(NetplayError::InternalError { context });
        };
        out.copy_from_slice(run);
        Ok(())
    }

    /// Writes `value` only if `index:frame` has never been written. Published input is final.
    pub fn set(&mut self, index: u32, frame: u32, value: T) {
        if (frame as usize) < self.frames(index) {
            trace!(index, frame, "Ignoring write to published input slot");
            return;
        }
        self.write(index, frame as usize, value);
    }

    /// Writes `value` at `index:frame`, replacing whatever was there.
    pub fn assign(&mut self, index: u32, frame: u32, value: T) {
        self.write(index, frame as usize, value);
    }

    /// Overwrites frames `start..end` of `index` with `value`.
    pub fn fill(&mut self, index: u32, start: u32, end: u32, value: T) {
        if end <= start {
            return;
        }
        if let Some(slots) = self
            .grow(index as usize, end as usize)
            .and_then(|run| run.get_mut(start as usize..end as usize))
        {
            slots.fill(value);
        }
    }

    /// Overwrites a run of values starting at `index:start_frame`.
    ///
    /// When `index >= check_from`, the incoming values are first compared with what
    /// [`get`](Self::get) currently returns for each slot, and the first disagreement lowers
    /// [`last_changed_frame`](Self::last_changed_frame). Pass `u32::MAX` to skip the check.
    pub fn set_range(&mut self, index: u32, start_frame: u32, values: &[T], check_from: u32) {
        if values.is_empty() {
            return;
        }

        if index >= check_from {
            let mismatch = values
                .iter()
                .zip(start_frame..)
                .find(|(value, frame)| self.get(index, *frame) != **value);
            if let Some((_, frame)) = mismatch {
                self.last_changed = self.last_changed.min(IndexedFrame::new(index, frame));
            }
        }

        let start = start_frame as usize;
        if let Some(slots) = self
            .grow(index as usize, start + values.len())
            .and_then(|run| run.get_mut(start..start + values.len()))
        {
            slots.copy_from_slice(values);
        }
    }

    /// Makes sure `index` exists and holds at least `end_frame` frames.
    ///
    /// New frames repeat the last value of `index`, or of the nearest earlier index with data
    /// when `index` has none yet.
    pub fn resize(&mut self, index: u32, end_frame: u32) {
        self.grow(index as usize, end_frame as usize);
    }

    /// Drops every index.
    pub fn clear(&mut self) {
        self.inputs.clear();
    }

    /// Whether no index exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Whether `index` holds no frames.
    #[must_use]
    pub fn is_index_empty(&self, index: u32) -> bool {
        self.frames(index) == 0
    }

    /// One past the last index that exists.
    #[must_use]
    pub fn end_index(&self) -> u32 {
        self.inputs.len() as u32
    }

    /// Number of frames in the last index.
    #[must_use]
    pub fn end_frame(&self) -> u32 {
        self.inputs.last().map_or(0, |run| run.len() as u32)
    }

    /// Number of frames in `index`.
    #[must_use]
    pub fn end_frame_of(&self, index: u32) -> u32 {
        self.frames(index) as u32
    }

    /// Drops every index before `index`, shifting the rest down.
    ///
    /// If that would leave at most one index, everything is dropped.
    pub fn erase_index_older_than(&mut self, index: u32) {
        let count = index as usize;
        if count + 1 >= self.inputs.len() {
            self.inputs.clear();
        } else {
            self.inputs.drain(..count);
        }
    }

    /// Earliest slot whose arriving value disagreed with the prediction, or
    /// [`IndexedFrame::MAX`] if none has since the last clear.
    #[must_use]
    pub fn last_changed_frame(&self) -> IndexedFrame {
        self.last_changed
    }

    /// Resets [`last_changed_frame`](Self::last_changed_frame) to [`IndexedFrame::MAX`].
    pub fn clear_last_changed_frame(&mut self) {
        self.last_changed = IndexedFrame::MAX;
    }

    /// Last recorded value of the nearest index before `index` that has any, else the default.
    #[must_use]
    pub fn last_input_before(&self, index: u32) -> T {
        let end = (index as usize).min(self.inputs.len());
        self.inputs
            .get(..end)
            .and_then(|runs| runs.iter().rev().find_map(|run| run.last().copied()))
            .unwrap_or_default()
    }

    fn frames(&self, index: u32) -> usize {
        self.inputs.get(index as usize).map_or(0, Vec::len)
    }

    fn write(&mut self, index: u32, frame: usize, value: T) {
        if let Some(slot) = self
            .grow(index as usize, frame + 1)
            .and_then(|run| run.get_mut(frame))
        {
            *slot = value;
        }
    }

    fn grow(&mut self, index: usize, end_frame: usize) -> Option<&mut Vec<T>> {
        let fill = match self.inputs.get(index) {
            Some(run) => run
                .last()
                .copied()
                .unwrap_or_else(|| self.last_input_before(index as u32)),
            None => {
                let fill = self.last_input_before(self.inputs.len() as u32);
                self.inputs.resize_with(index + 1, Vec::new);
                fill
            },
        };

        let run = self.inputs.get_mut(index)?;
        if run.len() < end_frame {
            run.resize(end_frame, fill);
        }
        Some(run)
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
    use crate::test_config::miri_case_count;
    use proptest::prelude::*;

    fn timeline() -> InputTimeline<u16> {
        InputTimeline::new()
    }

    #[test]
    fn empty_timeline_reads_default() {
        let t = timeline();
        assert_eq!(t.get(0, 0), 0);
        assert_eq!(t.get(7, 300), 0);
        assert!(t.is_empty());
        assert_eq!(t.end_index(), 0);
        assert_eq!(t.end_frame(), 0);
        assert_eq!(t.last_changed_frame(), IndexedFrame::MAX);
    }

    #[test]
    fn prediction_repeats_last_known_value() {
        let mut t = timeline();
        t.set(2, 5, 0x0010);
        assert_eq!(t.get(2, 5), 0x0010);
        assert_eq!(t.get(2, 10), 0x0010);
        // the gap before frame 5 was filled from earlier indices, which had nothing
        assert_eq!(t.get(2, 0), 0);
        // later indices inherit the last value too
        assert_eq!(t.get(3, 0), 0x0010);
    }

    #[test]
    fn remote_correction_marks_first_disagreement() {
        let mut t = timeline();
        t.set(2, 5, 0x0010);
        t.set_range(2, 10, &[0x0020], 2);
        assert_eq!(t.last_changed_frame(), IndexedFrame::new(2, 10));
        assert_eq!(t.get(2, 10), 0x0020);
        // frames 6..10 were filled with the prediction
        assert_eq!(t.get(2, 7), 0x0010);
    }

    #[test]
    fn set_range_below_check_from_is_not_checked() {
        let mut t = timeline();
        t.set(1, 0, 1);
        t.set_range(1, 0, &[2, 3, 4], 2);
        assert_eq!(t.last_changed_frame(), IndexedFrame::MAX);
        t.set_range(1, 0, &[2, 3, 4], u32::MAX);
        assert_eq!(t.last_changed_frame(), IndexedFrame::MAX);
    }

    #[test]
    fn set_range_matching_prediction_is_not_a_change() {
        let mut t = timeline();
        t.set(0, 3, 9);
        t.set_range(0, 4, &[9, 9, 9], 0);
        assert_eq!(t.last_changed_frame(), IndexedFrame::MAX);
    }

    #[test]
    fn watermark_keeps_the_earliest_change_until_cleared() {
        let mut t = timeline();
        t.set(0, 0, 1);
        t.set_range(0, 20, &[5], 0);
        t.set_range(0, 10, &[6], 0);
        t.set_range(0, 30, &[7], 0);
        assert_eq!(t.last_changed_frame(), IndexedFrame::new(0, 10));
        t.clear_last_changed_frame();
        assert_eq!(t.last_changed_frame(), IndexedFrame::MAX);
    }

    #[test]
    fn set_never_overwrites_but_assign_does() {
        let mut t = timeline();
        t.set(0, 4, 1);
        t.set(0, 4, 2);
        assert_eq!(t.get(0, 4), 1);
        // frames filled by a gap count as written
        t.set(0, 2, 3);
        assert_eq!(t.get(0, 2), 0);
        t.assign(0, 4, 2);
        assert_eq!(t.get(0, 4), 2);
        t.assign(0, 2, 3);
        assert_eq!(t.get(0, 2), 3);
    }

    #[test]
    fn fill_overwrites_a_span() {
        let mut t = timeline();
        t.set(0, 0, 1);
        t.fill(0, 2, 5, 7);
        assert_eq!(t.end_frame_of(0), 5);
        assert_eq!((0..5).map(|f| t.get(0, f)).collect::<Vec<_>>(), vec![1, 1, 7, 7, 7]);
        t.fill(0, 3, 3, 9);
        assert_eq!(t.get(0, 3), 7);
    }

    #[test]
    fn resize_creates_empty_index() {
        let mut t = timeline();
        t.set(0, 1, 4);
        t.resize(3, 0);
        assert_eq!(t.end_index(), 4);
        assert!(t.is_index_empty(3));
        assert_eq!(t.end_frame(), 0);
        assert_eq!(t.get(3, 5), 4);
        t.resize(3, 2);
        assert_eq!(t.end_frame(), 2);
        assert_eq!(t.get(3, 0), 4);
    }

    #[test]
    fn copy_range_requires_recorded_frames() {
        let mut t = timeline();
        t.set_range(1, 0, &[1, 2, 3, 4], u32::MAX);
        let mut out = [0u16; 3];
        t.copy_range(1, 1, &mut out).unwrap();
        assert_eq!(out, [2, 3, 4]);
        assert!(matches!(
            t.copy_range(1, 2, &mut out),
            Err(NetplayError::InternalError { .. })
        ));
        assert!(t.copy_range(9, 0, &mut out).is_err());
    }

    #[test]
    fn erase_shifts_indices_down() {
        let mut t = timeline();
        for index in 0..5 {
            t.set(index, 0, index as u16 + 1);
        }
        t.erase_index_older_than(2);
        assert_eq!(t.end_index(), 3);
        assert_eq!(t.get(0, 0), 3);
        assert_eq!(t.get(2, 0), 5);
    }

    #[test]
    fn erase_everything_when_little_would_remain() {
        let mut t = timeline();
        t.set(0, 0, 1);
        t.set(1, 0, 2);
        t.erase_index_older_than(1);
        assert!(t.is_empty());
    }

    #[test]
    fn last_input_before_skips_empty_indices() {
        let mut t = timeline();
        t.set(0, 3, 8);
        t.resize(2, 0);
        assert_eq!(t.last_input_before(0), 0);
        assert_eq!(t.last_input_before(2), 8);
        assert_eq!(t.last_input_before(50), 8);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Set(u32, u32, u16),
        Assign(u32, u32, u16),
        Range(u32, u32, Vec<u16>),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u32..4, 0u32..64, any::<u16>()).prop_map(|(i, f, v)| Op::Set(i, f, v)),
            (0u32..4, 0u32..64, any::<u16>()).prop_map(|(i, f, v)| Op::Assign(i, f, v)),
            (0u32..4, 0u32..64, proptest::collection::vec(any::<u16>(), 0..30))
                .prop_map(|(i, f, v)| Op::Range(i, f, v)),
        ]
    }

    fn apply(t: &mut InputTimeline<u16>, op: &Op) {
        match op {
            Op::Set(i, f, v) => t.set(*i, *f, *v),
            Op::Assign(i, f, v) => t.assign(*i, *f, *v),
            Op::Range(i, f, v) => t.set_range(*i, *f, v, 0),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(miri_case_count()))]

        #[test]
        fn get_is_stable_without_writes(ops in proptest::collection::vec(op(), 0..40), i in 0u32..6, f in 0u32..100) {
            let mut t = timeline();
            for op in &ops {
                apply(&mut t, op);
            }
            prop_assert_eq!(t.get(i, f), t.get(i, f));
        }

        #[test]
        fn set_only_writes_unrecorded_slots(ops in proptest::collection::vec(op(), 0..40), i in 0u32..4, f in 0u32..64, v in any::<u16>()) {
            let mut t = timeline();
            for op in &ops {
                apply(&mut t, op);
            }
            let recorded = f < t.end_frame_of(i);
            let before = t.get(i, f);
            t.set(i, f, v);
            if recorded {
                prop_assert_eq!(t.get(i, f), before);
            } else {
                prop_assert_eq!(t.get(i, f), v);
            }
        }

        #[test]
        fn assign_always_writes(ops in proptest::collection::vec(op(), 0..40), i in 0u32..4, f in 0u32..64, v in any::<u16>()) {
            let mut t = timeline();
            for op in &ops {
                apply(&mut t, op);
            }
            t.assign(i, f, v);
            prop_assert_eq!(t.get(i, f), v);
        }

        #[test]
        fn filling_a_gap_does_not_change_its_reads(prefix in any::<u16>(), gap in 1u32..40) {
            let mut t = timeline();
            t.set(0, 0, prefix);
            let predicted: Vec<_> = (1..gap).map(|f| t.get(0, f)).collect();
            t.set(0, gap, prefix.wrapping_add(1));
            let filled: Vec<_> = (1..gap).map(|f| t.get(0, f)).collect();
            prop_assert_eq!(predicted, filled);
        }
    }
}
