//! Benchmarks for InputTimeline reads and writes
//!
//! Run with: cargo bench --bench input_timeline

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use netplay_rollback::{InputTimeline, NUM_INPUTS};

fn recorded(indices: u32, frames: u32) -> InputTimeline<u16> {
    let mut timeline = InputTimeline::new();
    for index in 0..indices {
        for frame in 0..frames {
            timeline.set(index, frame, (frame % 7) as u16);
        }
    }
    timeline
}

fn bench_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("InputTimeline read");
    let timeline = recorded(4, 600);

    group.bench_function("get recorded", |b| {
        b.iter(|| timeline.get(black_box(3), black_box(300)));
    });

    group.bench_function("get predicted", |b| {
        b.iter(|| timeline.get(black_box(3), black_box(900)));
    });

    group.bench_function("copy_range window", |b| {
        let mut out = [0u16; NUM_INPUTS];
        b.iter(|| timeline.copy_range(black_box(3), black_box(500), &mut out));
    });

    group.finish();
}

fn bench_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("InputTimeline write");

    group.bench_function("set sequential 600", |b| {
        b.iter(|| recorded(1, black_box(600)));
    });

    for check_from in [0u32, u32::MAX] {
        group.bench_with_input(
            BenchmarkId::new("set_range window", check_from),
            &check_from,
            |b, &check_from| {
                let values: Vec<u16> = (0..NUM_INPUTS as u16).collect();
                b.iter_batched(
                    || recorded(1, 300),
                    |mut timeline| {
                        timeline.set_range(0, 290, black_box(&values), check_from);
                        timeline
                    },
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }

    group.bench_function("erase_index_older_than", |b| {
        b.iter_batched(
            || recorded(16, 120),
            |mut timeline| {
                timeline.erase_index_older_than(black_box(10));
                timeline
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_reads, bench_writes);
criterion_main!(benches);
