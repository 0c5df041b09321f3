//! Benchmarks for snapshot saves, loads and side-effect filtering
//!
//! Run with: cargo bench --bench snapshot_store

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use netplay_rollback::snapshot_store::EffectId;
use netplay_rollback::{
    IndexedFrame, NetplayState, SideEffectHistory, Simulation, SnapshotMeta, SnapshotStore,
};
use serde::{Deserialize, Serialize};

#[derive(Clone, Default, Serialize, Deserialize)]
struct Fighters {
    world_time: u32,
    positions: [i32; 2],
    health: [u16; 2],
    projectiles: Vec<(i32, i32)>,
}

struct Bench {
    state: Fighters,
}

impl Simulation for Bench {
    type State = Fighters;

    fn state(&self) -> &Fighters {
        &self.state
    }

    fn restore(&mut self, state: Fighters) {
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

fn sim_with(projectiles: usize) -> Bench {
    Bench {
        state: Fighters {
            projectiles: (0..projectiles as i32).map(|i| (i, -i)).collect(),
            ..Fighters::default()
        },
    }
}

fn filled_store(capacity: usize, sim: &mut Bench) -> SnapshotStore {
    let mut store = SnapshotStore::new();
    if store.allocate(capacity, 1024).is_err() {
        return store;
    }
    for frame in 0..capacity as u32 {
        sim.state.world_time = frame;
        let _ = store.save(meta(frame), &*sim, None);
    }
    store
}

fn bench_save(c: &mut Criterion) {
    let mut group = c.benchmark_group("SnapshotStore save");

    for projectiles in [0usize, 16, 64] {
        group.bench_with_input(
            BenchmarkId::new("full store", projectiles),
            &projectiles,
            |b, &projectiles| {
                let mut sim = sim_with(projectiles);
                let mut store = filled_store(32, &mut sim);
                let mut frame = 32;
                b.iter(|| {
                    frame += 1;
                    sim.state.world_time = frame;
                    store.save(meta(frame), black_box(&sim), None)
                });
            },
        );
    }

    group.finish();
}

fn bench_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("SnapshotStore load");

    for depth in [1u32, 8, 24] {
        group.bench_with_input(BenchmarkId::new("rollback depth", depth), &depth, |b, &depth| {
            b.iter_batched(
                || {
                    let mut sim = sim_with(16);
                    let store = filled_store(32, &mut sim);
                    (store, sim)
                },
                |(mut store, mut sim)| store.load(IndexedFrame::new(3, 31 - depth), &mut sim),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_side_effects(c: &mut Criterion) {
    let mut group = c.benchmark_group("SideEffectHistory");
    let fired: [EffectId; 3] = [1, 7, 300];

    group.bench_function("record", |b| {
        let mut history = SideEffectHistory::new(32, 1024);
        let mut frame = 0u32;
        b.iter(|| {
            frame = frame.wrapping_add(1);
            history.filter(frame, black_box(&fired))
        });
    });

    group.bench_function("suppress during rerun", |b| {
        let mut history = SideEffectHistory::new(32, 1024);
        for frame in 0..32 {
            history.filter(frame, &fired);
        }
        history.begin_rerun();
        let mut frame = 0u32;
        b.iter(|| {
            frame = (frame + 1) % 32;
            history.filter(frame, black_box(&fired))
        });
    });

    group.finish();
}

criterion_group!(benches, bench_save, bench_load, bench_side_effects);
criterion_main!(benches);
