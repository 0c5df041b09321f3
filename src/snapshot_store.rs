//! Saved simulation states for rollback, and one-shot side effect bookkeeping for re-simulation.
//!
//! [`SnapshotStore`] keeps a fixed pool of equally sized byte slots. Each save encodes the
//! simulation state into a free slot; when none is free the oldest snapshot is evicted first.
//! Records stay in chronological order, so a load walks them newest first and takes the first
//! one at or before the target. Everything newer than what was loaded is freed, since the
//! timeline it belonged to no longer exists.
//!
//! [`SideEffectHistory`] remembers which one-shot effects (sound cues and the like) fired on
//! each tick, so replaying a tick after a rollback does not fire them a second time.

use std::collections::VecDeque;

use serde::{de::DeserializeOwned, Serialize};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::network::codec::{self, CodecError};
use crate::session::state::NetplayState;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{report_violation, IndexedFrame, InvalidRequestKind, NetplayError};

/// A deterministic simulation whose state can be saved and restored.
///
/// # Examples
///
/// ```
/// use netplay_rollback::Simulation;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Counter {
///     ticks: u32,
/// }
///
/// struct Game {
///     state: Counter,
/// }
///
/// impl Simulation for Game {
///     type State = Counter;
///
///     fn state(&self) -> &Counter {
///         &self.state
///     }
///
///     fn restore(&mut self, state: Counter) {
///         self.state = state;
///     }
/// }
/// ```
pub trait Simulation {
    /// Everything that must be identical on both peers for the same inputs.
    type State: Serialize + DeserializeOwned;

    /// The current state.
    fn state(&self) -> &Self::State;

    /// Replaces the current state.
    fn restore(&mut self, state: Self::State);
}

/// Session bookkeeping saved next to each snapshot and handed back by [`SnapshotStore::load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotMeta {
    /// Netplay phase at the time of the save.
    pub netplay_state: NetplayState,
    /// World time at which the current transition index started.
    pub start_world_time: u32,
    /// Where on the timeline the save was taken.
    pub indexed_frame: IndexedFrame,
}

#[derive(Debug, Clone, Copy)]
struct Record {
    meta: SnapshotMeta,
    slot: usize,
    len: usize,
}

/// A fixed pool of serialized simulation snapshots.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    slots: Vec<Box<[u8]>>,
    free: Vec<usize>,
    records: VecDeque<Record>,
    scratch: Vec<u8>,
    slot_size: usize,
}

impl SnapshotStore {
    /// An unallocated store. Nothing can be saved until [`allocate`](Self::allocate).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `capacity` slots of `slot_size` bytes, dropping any previous contents.
    ///
    /// # Errors
    ///
    /// [`InvalidRequestKind::ConfigValueOutOfRange`] if either size is zero.
    pub fn allocate(&mut self, capacity: usize, slot_size: usize) -> Result<(), NetplayError> {
        if capacity == 0 {
            return Err(InvalidRequestKind::ConfigValueOutOfRange {
                field: "snapshot_capacity",
                min: 1,
                max: u64::MAX,
                actual: 0,
            }
            .into());
        }
        if slot_size == 0 {
            return Err(InvalidRequestKind::ConfigValueOutOfRange {
                field: "snapshot_size",
                min: 1,
                max: u64::MAX,
                actual: 0,
            }
            .into());
        }

        if self.slots.len() != capacity || self.slot_size != slot_size {
            self.slots = (0..capacity)
                .map(|_| vec![0u8; slot_size].into_boxed_slice())
                .collect();
            self.scratch = vec![0u8; slot_size];
            self.slot_size = slot_size;
        }
        self.records.clear();
        self.free = (0..capacity).rev().collect();
        debug!(capacity, slot_size, "Allocated snapshot pool");
        Ok(())
    }

    /// Releases the pool.
    pub fn deallocate(&mut self) {
        if self.is_allocated() {
            debug!(snapshots = self.records.len(), "Releasing snapshot pool");
        }
        self.slots = Vec::new();
        self.free = Vec::new();
        self.records.clear();
        self.scratch = Vec::new();
        self.slot_size = 0;
    }

    /// Whether [`allocate`](Self::allocate) has been called since the last release.
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        !self.slots.is_empty()
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Bytes per slot.
    #[must_use]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Number of snapshots held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no snapshot is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The oldest snapshot held.
    #[must_use]
    pub fn oldest(&self) -> Option<SnapshotMeta> {
        self.records.front().map(|r| r.meta)
    }

    /// The newest snapshot held.
    #[must_use]
    pub fn newest(&self) -> Option<SnapshotMeta> {
        self.records.back().map(|r| r.meta)
    }

    /// Timeline positions of every snapshot held, oldest first.
    pub fn indexed_frames(&self) -> impl Iterator<Item = IndexedFrame> + '_ {
        self.records.iter().map(|r| r.meta.indexed_frame)
    }

    /// Encodes the simulation state into a slot and records it under `meta`.
    ///
    /// A full pool evicts its oldest snapshot. If `still_needed` is given and even the oldest
    /// snapshot is newer than it, the second-oldest is evicted instead so the snapshot closest to
    /// that frame survives.
    ///
    /// # Errors
    ///
    /// [`InvalidRequestKind::SnapshotStoreNotAllocated`] before allocation,
    /// [`InvalidRequestKind::SnapshotTooLarge`] if the encoded state does not fit a slot. A failed
    /// save leaves the store unchanged.
    pub fn save<S: Simulation + ?Sized>(
        &mut self,
        meta: SnapshotMeta,
        sim: &S,
        still_needed: Option<IndexedFrame>,
    ) -> Result<(), NetplayError> {
        if !self.is_allocated() {
            return Err(InvalidRequestKind::SnapshotStoreNotAllocated.into());
        }

        let len = match codec::encode_into(sim.state(), &mut self.scratch) {
            Ok(len) => len,
            Err(CodecError::BufferTooSmall { .. }) => {
                let required = codec::encode(sim.state())?.len();
                return Err(InvalidRequestKind::SnapshotTooLarge {
                    required,
                    capacity: self.slot_size,
                }
                .into());
            },
            Err(err) => return Err(err.into()),
        };

        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => self.evict(still_needed)?,
        };
        let (Some(dst), Some(src)) = (
            self.slots.get_mut(slot).and_then(|s| s.get_mut(..len)),
            self.scratch.get(..len),
        ) else {
            self.free.push(slot);
            report_violation!(
                ViolationSeverity::Critical,
                ViolationKind::InternalError,
                "Snapshot slot {} cannot hold {} bytes",
                slot,
                len
            );
            return Err(NetplayError::InternalError {
                context: format!("snapshot slot {} cannot hold {} bytes", slot, len),
            });
        };
        dst.copy_from_slice(src);

        trace!(
            indexed_frame = %meta.indexed_frame,
            slot,
            bytes = len,
            "Saved snapshot"
        );
        self.records.push_back(Record { meta, slot, len });
        Ok(())
    }

    fn evict(&mut self, still_needed: Option<IndexedFrame>) -> Result<usize, NetplayError> {
        let keep_oldest = match (self.records.front(), still_needed) {
            (Some(oldest), Some(needed)) => {
                oldest.meta.indexed_frame > needed && self.records.len() >= 2
            },
            _ => false,
        };
        let victim = if keep_oldest {
            self.records.remove(1)
        } else {
            self.records.pop_front()
        };
        match victim {
            Some(record) => {
                trace!(
                    indexed_frame = %record.meta.indexed_frame,
                    "Evicted snapshot"
                );
                Ok(record.slot)
            },
            None => {
                report_violation!(
                    ViolationSeverity::Critical,
                    ViolationKind::InternalError,
                    "Snapshot pool has no free slot and no record to evict"
                );
                Err(NetplayError::InternalError {
                    context: "snapshot pool has no free slot and no record to evict".to_owned(),
                })
            },
        }
    }

    /// Restores the newest snapshot at or before `target` into `sim`.
    ///
    /// Every snapshot newer than the restored one is discarded. The returned metadata says what
    /// was actually restored, which may be earlier than `target`.
    ///
    /// # Errors
    ///
    /// [`NetplayError::RollbackFailed`] if no snapshot is old enough, and
    /// [`NetplayError::SerializationError`] if the stored bytes no longer decode.
    pub fn load<S: Simulation + ?Sized>(
        &mut self,
        target: IndexedFrame,
        sim: &mut S,
    ) -> Result<SnapshotMeta, NetplayError> {
        let Some(pos) = self
            .records
            .iter()
            .rposition(|r| r.meta.indexed_frame <= target)
        else {
            debug!(
                %target,
                oldest = ?self.oldest().map(|m| m.indexed_frame),
                "No snapshot old enough to load"
            );
            return Err(NetplayError::RollbackFailed {
                target,
                oldest: self.oldest().map(|m| m.indexed_frame),
            });
        };

        let record = self.records.get(pos).copied().ok_or_else(|| NetplayError::InternalError {
            context: format!("snapshot record {} vanished", pos),
        })?;
        let bytes = self
            .slots
            .get(record.slot)
            .and_then(|slot| slot.get(..record.len))
            .ok_or_else(|| NetplayError::InternalError {
                context: format!("snapshot slot {} is out of bounds", record.slot),
            })?;
        let state = codec::decode_exact::<S::State>(bytes)?;
        sim.restore(state);

        let discarded = self.records.len() - pos - 1;
        for newer in self.records.drain(pos + 1..) {
            self.free.push(newer.slot);
        }
        debug!(
            %target,
            restored = %record.meta.indexed_frame,
            discarded,
            "Loaded snapshot"
        );
        Ok(record.meta)
    }
}

/// Identifier of a one-shot side effect.
pub type EffectId = u16;

/// Which one-shot effects fired on each recent tick.
///
/// Ticks are bucketed by `frame % capacity`, matching the reach of the snapshot pool. Outside a
/// rerun every call records exactly what fired. During a rerun, effects already recorded for
/// that tick are suppressed and new ones are let through and recorded.
#[derive(Debug, Clone)]
pub struct SideEffectHistory {
    capacity: usize,
    max_effects: usize,
    words_per_tick: usize,
    bits: Vec<u64>,
    rerunning: bool,
}

impl SideEffectHistory {
    /// History for `capacity` ticks of effects `0..max_effects`.
    #[must_use]
    pub fn new(capacity: usize, max_effects: usize) -> Self {
        let capacity = capacity.max(1);
        let words_per_tick = max_effects.div_ceil(64).max(1);
        Self {
            capacity,
            max_effects,
            words_per_tick,
            bits: vec![0; capacity * words_per_tick],
            rerunning: false,
        }
    }

    /// Forgets everything.
    pub fn clear(&mut self) {
        self.bits.fill(0);
        self.rerunning = false;
    }

    /// Enters re-simulation.
    pub fn begin_rerun(&mut self) {
        self.rerunning = true;
    }

    /// Leaves re-simulation.
    pub fn end_rerun(&mut self) {
        self.rerunning = false;
    }

    /// Whether a rerun is in progress.
    #[must_use]
    pub fn is_rerunning(&self) -> bool {
        self.rerunning
    }

    /// Whether `effect` is recorded for `frame`.
    #[must_use]
    pub fn has_fired(&self, frame: u32, effect: EffectId) -> bool {
        self.bit(frame, effect)
            .and_then(|(word, mask)| self.bits.get(word).map(|w| w & mask != 0))
            .unwrap_or(false)
    }

    /// Records the effects `fired` on `frame` and returns those that may actually play.
    pub fn filter(&mut self, frame: u32, fired: &[EffectId]) -> SmallVec<[EffectId; 8]> {
        if !self.rerunning {
            let start = self.tick_start(frame);
            if let Some(words) = self.bits.get_mut(start..start + self.words_per_tick) {
                words.fill(0);
            }
        }

        let mut allowed = SmallVec::new();
        for &effect in fired {
            let Some((word, mask)) = self.bit(frame, effect) else {
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::Snapshot,
                    "Side effect {} is outside the tracked range 0..{}",
                    effect,
                    self.max_effects
                );
                allowed.push(effect);
                continue;
            };
            let Some(slot) = self.bits.get_mut(word) else {
                continue;
            };
            if self.rerunning && *slot & mask != 0 {
                trace!(frame, effect, "Suppressing repeated side effect");
                continue;
            }
            *slot |= mask;
            allowed.push(effect);
        }
        allowed
    }

    fn tick_start(&self, frame: u32) -> usize {
        (frame as usize % self.capacity) * self.words_per_tick
    }

    fn bit(&self, frame: u32, effect: EffectId) -> Option<(usize, u64)> {
        let effect = usize::from(effect);
        if effect >= self.max_effects {
            return None;
        }
        Some((self.tick_start(frame) + effect / 64, 1u64 << (effect % 64)))
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
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Stub {
        frame: u32,
        payload: Vec<u8>,
    }

    struct StubSim {
        state: Stub,
    }

    impl StubSim {
        fn at(frame: u32) -> Self {
            Self {
                state: Stub {
                    frame,
                    payload: vec![frame as u8; 4],
                },
            }
        }
    }

    impl Simulation for StubSim {
        type State = Stub;

        fn state(&self) -> &Stub {
            &self.state
        }

        fn restore(&mut self, state: Stub) {
            self.state = state;
        }
    }

    fn meta(frame: u32) -> SnapshotMeta {
        SnapshotMeta {
            netplay_state: NetplayState::InGame,
            start_world_time: 0,
            indexed_frame: IndexedFrame::new(3, frame),
        }
    }

    fn store(capacity: usize) -> SnapshotStore {
        let mut store = SnapshotStore::new();
        store.allocate(capacity, 64).unwrap();
        store
    }

    fn save(store: &mut SnapshotStore, frame: u32) {
        store.save(meta(frame), &StubSim::at(frame), None).unwrap();
    }

    #[test]
    fn load_between_saves_restores_the_earlier_one() {
        let mut store = store(8);
        save(&mut store, 100);
        save(&mut store, 110);

        let mut sim = StubSim::at(999);
        let loaded = store.load(IndexedFrame::new(3, 105), &mut sim).unwrap();
        assert_eq!(loaded.indexed_frame, IndexedFrame::new(3, 100));
        assert_eq!(sim.state.frame, 100);

        // 110 is gone for good
        assert!(store
            .indexed_frames()
            .all(|f| f <= IndexedFrame::new(3, 100)));
        let loaded = store.load(IndexedFrame::new(3, 115), &mut sim).unwrap();
        assert_eq!(loaded.indexed_frame, IndexedFrame::new(3, 100));
    }

    #[test]
    fn load_exact_keeps_that_snapshot() {
        let mut store = store(8);
        save(&mut store, 1);
        save(&mut store, 2);
        let mut sim = StubSim::at(0);
        store.load(IndexedFrame::new(3, 2), &mut sim).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(sim.state.frame, 2);
    }

    #[test]
    fn load_before_everything_fails() {
        let mut store = store(4);
        save(&mut store, 10);
        let mut sim = StubSim::at(0);
        let err = store.load(IndexedFrame::new(3, 5), &mut sim).unwrap_err();
        assert_eq!(
            err,
            NetplayError::RollbackFailed {
                target: IndexedFrame::new(3, 5),
                oldest: Some(IndexedFrame::new(3, 10)),
            }
        );
        assert_eq!(sim.state.frame, 0);
    }

    #[test]
    fn load_from_empty_store_fails() {
        let mut store = store(4);
        let mut sim = StubSim::at(0);
        assert!(matches!(
            store.load(IndexedFrame::new(0, 0), &mut sim),
            Err(NetplayError::RollbackFailed { oldest: None, .. })
        ));
    }

    #[test]
    fn full_pool_evicts_oldest() {
        let mut store = store(3);
        for frame in 1..=5 {
            save(&mut store, frame);
        }
        assert_eq!(store.len(), 3);
        assert_eq!(store.oldest().unwrap().indexed_frame, IndexedFrame::new(3, 3));
        assert_eq!(store.newest().unwrap().indexed_frame, IndexedFrame::new(3, 5));
    }

    #[test]
    fn still_needed_frame_keeps_the_oldest() {
        let mut store = store(3);
        for frame in 10..13 {
            save(&mut store, frame);
        }
        store
            .save(meta(13), &StubSim::at(13), Some(IndexedFrame::new(3, 5)))
            .unwrap();
        let frames: Vec<_> = store.indexed_frames().map(|f| f.frame()).collect();
        assert_eq!(frames, vec![10, 12, 13]);
    }

    #[test]
    fn save_before_allocate_is_rejected() {
        let mut store = SnapshotStore::new();
        let err = store.save(meta(0), &StubSim::at(0), None).unwrap_err();
        assert_eq!(
            err,
            NetplayError::InvalidRequest {
                kind: InvalidRequestKind::SnapshotStoreNotAllocated
            }
        );
    }

    #[test]
    fn oversized_state_is_rejected_without_side_effects() {
        let mut store = SnapshotStore::new();
        store.allocate(2, 8).unwrap();
        let mut big = StubSim::at(1);
        big.state.payload = vec![0; 100];
        let err = store.save(meta(1), &big, None).unwrap_err();
        assert!(matches!(
            err,
            NetplayError::InvalidRequest {
                kind: InvalidRequestKind::SnapshotTooLarge { capacity: 8, .. }
            }
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn deallocate_releases_everything() {
        let mut store = store(2);
        save(&mut store, 1);
        store.deallocate();
        assert!(!store.is_allocated());
        assert!(store.is_empty());
        assert_eq!(store.capacity(), 0);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut store = SnapshotStore::new();
        assert!(store.allocate(0, 16).is_err());
        assert!(store.allocate(16, 0).is_err());
    }

    #[test]
    fn side_effects_fire_once_across_a_rerun() {
        let mut history = SideEffectHistory::new(16, 100);
        assert_eq!(history.filter(5, &[1, 70]).as_slice(), &[1, 70]);
        assert_eq!(history.filter(6, &[2]).as_slice(), &[2]);

        history.begin_rerun();
        assert!(history.filter(5, &[1, 70, 3]).as_slice() == [3]);
        assert!(history.filter(6, &[2]).is_empty());
        history.end_rerun();

        // a fresh tick overwrites what was there
        assert_eq!(history.filter(5, &[1]).as_slice(), &[1]);
        assert!(!history.has_fired(5, 70));
    }

    #[test]
    fn untracked_effects_pass_through() {
        let mut history = SideEffectHistory::new(4, 8);
        history.begin_rerun();
        assert_eq!(history.filter(0, &[200]).as_slice(), &[200]);
        assert_eq!(history.filter(0, &[200]).as_slice(), &[200]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(miri_case_count()))]

        #[test]
        fn loaded_snapshot_is_at_or_before_target(
            frames in proptest::collection::btree_set(0u32..500, 1..40),
            target in 0u32..600,
            capacity in 1usize..16,
        ) {
            let mut store = store(capacity);
            for &frame in &frames {
                save(&mut store, frame);
            }
            let target = IndexedFrame::new(3, target);
            let mut sim = StubSim::at(u32::MAX);
            match store.load(target, &mut sim) {
                Ok(meta) => {
                    prop_assert!(meta.indexed_frame <= target);
                    prop_assert_eq!(sim.state.frame, meta.indexed_frame.frame());
                    prop_assert_eq!(store.newest().map(|m| m.indexed_frame), Some(meta.indexed_frame));
                    prop_assert!(store.indexed_frames().all(|f| f <= meta.indexed_frame));
                }
                Err(NetplayError::RollbackFailed { .. }) => {
                    prop_assert!(store.indexed_frames().all(|f| f > target));
                }
                Err(other) => prop_assert!(false, "unexpected error {other}"),
            }
            prop_assert!(store.len() <= capacity);
        }
    }
}
