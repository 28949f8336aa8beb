use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::time::Duration;

use taskforge_infra::jobs::{JobOptions, JobPayload, JobQueue};
use tokio::time::Instant;

const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Queue filled to capacity; a third of the jobs are delayed, priorities cycle 0..10.
fn full_queue(capacity: usize, now: Instant) -> JobQueue {
    let mut queue = JobQueue::new(capacity);
    for i in 0..capacity {
        let mut options = JobOptions::default().with_priority((i % 10) as i32);
        if i % 3 == 0 {
            options = options.delayed(Duration::from_secs(60));
        }
        queue
            .admit(JobPayload::cleanup_cache(None), options, 3, now)
            .unwrap();
    }
    queue
}

fn bench_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("selection_under_full_queue");

    for capacity in [50usize, 500, 5_000].iter() {
        let now = Instant::now();
        let queue = full_queue(*capacity, now);

        group.throughput(Throughput::Elements(*capacity as u64));
        group.bench_with_input(BenchmarkId::new("next_ready", capacity), capacity, |b, _| {
            b.iter(|| black_box(queue.next_ready(black_box(now))));
        });
        group.bench_with_input(BenchmarkId::new("next_wake", capacity), capacity, |b, _| {
            b.iter(|| black_box(queue.next_wake(black_box(now))));
        });
    }

    group.finish();
}

fn bench_job_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_lifecycle");

    // Admit into the one free slot, run it, fail it once, then complete it.
    group.bench_function("admit_checkout_fail_complete", |b| {
        let now = Instant::now();
        let mut queue = full_queue(50, now);
        let victim = queue.next_ready(now).unwrap();
        queue.remove(victim);

        b.iter(|| {
            let id = queue
                .admit(
                    JobPayload::cleanup_cache(None),
                    JobOptions::default().with_priority(100),
                    3,
                    now,
                )
                .unwrap();
            queue.checkout(id);
            black_box(queue.fail(id, now, BACKOFF_BASE));
            queue.remove(id);
        });
    });

    group.bench_function("snapshot_50", |b| {
        let now = Instant::now();
        let queue = full_queue(50, now);
        b.iter(|| black_box(queue.snapshot(now)));
    });

    group.finish();
}

criterion_group!(benches, bench_selection, bench_job_lifecycle);
criterion_main!(benches);
