//! Throughput benchmarks for the ETA scheduler and worker pool.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use foreman_pool::{EtaScheduler, WorkerPool};
use foreman_registry::{Handler, HandlerOutcome, RegistryEntry, TaskMessage};
use futures::FutureExt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::runtime::Runtime;

fn bench_eta_scheduler_enter_and_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("eta_scheduler");

    for size in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("enter_then_pop_due", size), &size, |b, &size| {
            b.iter(|| {
                let scheduler = EtaScheduler::new();
                let base = SystemTime::now();
                for i in 0..size {
                    scheduler.enter(TaskMessage::new("bench"), base + Duration::from_millis(i as u64));
                }
                black_box(scheduler.pop_due(base + Duration::from_secs(3600)))
            });
        });
    }

    group.finish();
}

fn bench_pool_submit_throughput(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("worker_pool");
    group.throughput(Throughput::Elements(1));

    group.bench_function("submit_noop_task", |b| {
        b.to_async(&rt).iter(|| async {
            let pool = WorkerPool::new(4, None);
            let mut completions = pool.completions();
            let handler: Handler =
                Arc::new(|_a, _k| async { HandlerOutcome::Success(serde_json::Value::Null) }.boxed());
            let entry = RegistryEntry::new("bench", handler);
            pool.submit(TaskMessage::new("bench"), entry).unwrap();
            black_box(completions.recv().await.unwrap())
        });
    });

    group.finish();
}

criterion_group!(benches, bench_eta_scheduler_enter_and_pop, bench_pool_submit_throughput);
criterion_main!(benches);
