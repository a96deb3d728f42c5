//! End-to-end round throughput over the in-memory store.

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::hint::black_box;
use std::time::Duration;
use tino_allocator::cursor::{OrderedTargetCursor, SourceCursor};
use tino_allocator::engine::{run_streaming, CategoryRun, StreamSettings};
use tino_allocator::progress::ProgressRecorder;
use tino_allocator::test_support::memory_fixture;
use tino_allocator::{checkpoint_path, Category, MembershipFilter};

fn bench_streaming(c: &mut Criterion) {
    let mut group = c.benchmark_group("streaming_rounds");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(10));

    let dir = tempfile::tempdir().unwrap();
    let category = Category::from("B");

    for &targets in &[10_000usize, 50_000] {
        group.throughput(Throughput::Elements(targets as u64));
        group.bench_with_input(BenchmarkId::new("assign_all", targets), &targets, |b, &targets| {
            b.iter_batched(
                || {
                    let candidates = (0..targets * 3 / 2).map(|i| format!("id-{i:08}")).collect();
                    let store = memory_fixture(&category, &[], targets, candidates);
                    let run = CategoryRun::new(
                        category.clone(),
                        MembershipFilter::create(targets as u64 * 2, 12, 7).unwrap(),
                        checkpoint_path(dir.path(), &category),
                        ProgressRecorder::new(category.clone(), Duration::from_secs(3600), None),
                    );
                    (store, run)
                },
                |(mut store, mut run)| {
                    let mut cursor = OrderedTargetCursor::new(category.clone(), 5_000);
                    let mut source = SourceCursor::new(category.clone(), 5_000);
                    let settings = StreamSettings {
                        target_batch: 5_000,
                        candidate_batch: 7_500,
                        checkpoint_rounds: 1_000,
                        no_progress_rounds: 1,
                    };
                    let mut rng = StdRng::seed_from_u64(1);
                    let outcome = run_streaming(
                        &mut store,
                        &mut run,
                        &mut cursor,
                        &mut source,
                        settings,
                        &mut rng,
                    )
                    .unwrap();
                    black_box((outcome, run.streamed_updates))
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_streaming);
criterion_main!(benches);
