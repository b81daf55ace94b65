use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;
use std::time::Duration;

use leaseq_core::{LocalQueue, QueueConfig, WorkQueue};
use leaseq_infra::{DistributedQueue, InMemoryStore};

fn items(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("suite/item_{i}")).collect()
}

fn distributed(count: usize, config: QueueConfig) -> DistributedQueue<Arc<InMemoryStore>> {
    let mut queue = DistributedQueue::new(InMemoryStore::arc(), config).unwrap();
    queue.populate(items(count)).unwrap();
    queue
}

fn config() -> QueueConfig {
    QueueConfig::new("bench", "worker-1").with_poll_interval(Duration::from_millis(1))
}

fn bench_reserve_acknowledge_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("reserve_acknowledge_throughput");

    for backlog in [100usize, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*backlog as u64));
        group.bench_with_input(BenchmarkId::new("in_memory_store", backlog), backlog, |b, &size| {
            b.iter_batched(
                || distributed(size, config()),
                |mut queue| {
                    while let Some(item) = queue.poll().unwrap() {
                        black_box(queue.acknowledge(&item).unwrap());
                    }
                },
                BatchSize::LargeInput,
            );
        });
        group.bench_with_input(BenchmarkId::new("local_queue", backlog), backlog, |b, &size| {
            b.iter_batched(
                || LocalQueue::populated(items(size), 0, 0.0),
                |mut queue| {
                    while let Some(item) = queue.poll().unwrap() {
                        black_box(queue.acknowledge(&item).unwrap());
                    }
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

fn bench_requeue_with_offset(c: &mut Criterion) {
    let mut group = c.benchmark_group("requeue_with_offset");

    for offset in [0usize, 42, 1_000].iter() {
        group.bench_with_input(BenchmarkId::new("requeue_then_drain", offset), offset, |b, &offset| {
            b.iter_batched(
                || {
                    let config = config().with_requeues(1, 1.0).with_requeue_offset(offset);
                    distributed(2_000, config)
                },
                |mut queue| {
                    let mut attempt = 0u64;
                    while let Some(item) = queue.poll().unwrap() {
                        attempt += 1;
                        if attempt % 2 == 0 {
                            black_box(queue.requeue(&item).unwrap());
                        } else {
                            black_box(queue.acknowledge(&item).unwrap());
                        }
                    }
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_reserve_acknowledge_throughput,
    bench_requeue_with_offset
);
criterion_main!(benches);
