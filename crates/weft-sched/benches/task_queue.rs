//! Registry register/drain throughput on the frame-pacing path

use criterion::{criterion_group, criterion_main, Criterion};
use weft_sched::{Deadline, DrainMode, TaskQueueRegistry};

fn bench_register_drain(c: &mut Criterion) {
    let registry = TaskQueueRegistry::new();
    let queue = registry.create_queue();

    c.bench_function("register_then_drain_100", |b| {
        b.iter(|| {
            for _ in 0..100 {
                registry.register_task(queue, || {}, Deadline::Now);
            }
            for task in registry.ready_tasks(queue, DrainMode::All) {
                task();
            }
        })
    });

    c.bench_function("pending_count", |b| {
        b.iter(|| registry.pending_task_count(queue))
    });
}

fn bench_merged_resolution(c: &mut Criterion) {
    let registry = TaskQueueRegistry::new();
    let owner = registry.create_queue();
    let subordinate = registry.create_queue();
    registry.merge(owner, subordinate).unwrap();

    // Same work as the unmerged case, addressed through the merge map.
    c.bench_function("register_then_drain_100_merged", |b| {
        b.iter(|| {
            for _ in 0..100 {
                registry.register_task(subordinate, || {}, Deadline::Now);
            }
            for task in registry.ready_tasks(subordinate, DrainMode::All) {
                task();
            }
        })
    });
}

criterion_group!(benches, bench_register_drain, bench_merged_resolution);
criterion_main!(benches);
