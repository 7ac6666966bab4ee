//! Pool throughput benchmark
//!
//! Measures the full path: submit → queue → worker → result stream → shutdown.

use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use workpool::{Job, JobContext, JobError, PoolConfig, RateLimitConfig, WorkerPool};

const JOBS: u64 = 1_000;

async fn noop(_ctx: JobContext, job: Job<u64>) -> Result<u64, JobError> {
    Ok(job.into_payload())
}

/// Run `JOBS` jobs through a fresh pool and return the elapsed time
async fn run_batch(config: PoolConfig) -> Duration {
    let pool = WorkerPool::start(config, noop).unwrap();
    let consumer = tokio::spawn(pool.results().unwrap().collect_all());

    let start = Instant::now();
    for n in 0..JOBS {
        pool.submit(Job::new(format!("job-{n}"), n)).await.unwrap();
    }
    pool.shutdown(Duration::MAX).await.unwrap();
    let results = consumer.await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(results.len() as u64, JOBS);
    elapsed
}

/// Throughput against worker count
fn bench_workers(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("pool_throughput/workers");
    group.throughput(Throughput::Elements(JOBS));

    for workers in [1, 4, 16] {
        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, &workers| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let mut total = Duration::ZERO;
                for _ in 0..iters {
                    let config = PoolConfig::default()
                        .with_fixed_workers(workers)
                        .with_queue_capacity(64);
                    total += run_batch(config).await;
                }
                total
            });
        });
    }

    group.finish();
}

/// Throughput against queue capacity (backpressure pressure point)
fn bench_queue_capacity(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("pool_throughput/queue_capacity");
    group.throughput(Throughput::Elements(JOBS));

    for capacity in [1, 16, 256] {
        group.bench_with_input(
            BenchmarkId::new("capacity", capacity),
            &capacity,
            |b, &capacity| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let mut total = Duration::ZERO;
                    for _ in 0..iters {
                        let config = PoolConfig::default()
                            .with_fixed_workers(4)
                            .with_queue_capacity(capacity);
                        total += run_batch(config).await;
                    }
                    total
                });
            },
        );
    }

    group.finish();
}

/// Overhead of the rate limiter when it never has to wait
fn bench_rate_limiter_overhead(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("pool_throughput/rate_limiter");
    group.throughput(Throughput::Elements(JOBS));

    group.bench_function("unlimited_bucket", |b| {
        b.to_async(&rt).iter_custom(|iters| async move {
            let mut total = Duration::ZERO;
            for _ in 0..iters {
                let config = PoolConfig::default()
                    .with_fixed_workers(4)
                    .with_rate_limit(RateLimitConfig::per_second(1e9).with_burst(u32::MAX));
                total += run_batch(config).await;
            }
            total
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_workers,
    bench_queue_capacity,
    bench_rate_limiter_overhead
);
criterion_main!(benches);
