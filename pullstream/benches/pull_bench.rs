//! Interpreter benchmarks using criterion.
//!
//! Measures bind-heavy pulls, chunked streams, scoped resources and channel
//! throughput.
//!
//! Run with: cargo bench --bench pull_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pullstream::{Channel, Chunk, Compiler, Pull, Stream};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime")
}

/// Benchmark left-nested binds
fn bench_binds(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("binds");

    for depth in [1_000usize, 10_000, 50_000] {
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::new("flat_map", depth), &depth, |b, &depth| {
            b.iter(|| {
                rt.block_on(async {
                    let mut pull: Pull<u8, u64> = Pull::pure(0);
                    for _ in 0..depth {
                        pull = pull.flat_map(|n| Pull::pure(n + 1));
                    }
                    let result = Compiler::current()
                        .fold_chunks(pull.void(), (), |_, _| Ok(()))
                        .await;
                    black_box(result)
                })
            });
        });
    }

    group.finish();
}

/// Benchmark element throughput by chunk size
fn bench_chunked_map(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("chunked_map");
    const TOTAL: usize = 100_000;
    group.throughput(Throughput::Elements(TOTAL as u64));

    for size in [1usize, 64, 4_096] {
        group.bench_with_input(BenchmarkId::new("chunk_size", size), &size, |b, &size| {
            let chunks: Vec<Chunk<u64>> = (0..TOTAL as u64)
                .collect::<Vec<_>>()
                .chunks(size)
                .map(Chunk::from_slice)
                .collect();
            b.iter(|| {
                let stream = chunks
                    .iter()
                    .cloned()
                    .fold(Stream::empty(), |s, chunk| s.append(Stream::chunk(chunk)));
                rt.block_on(async {
                    let sum = stream.map(|n| n * 2).compile().fold(0u64, |acc, n| acc + n).await;
                    black_box(sum)
                })
            });
        });
    }

    group.finish();
}

/// Benchmark opening and closing scopes with resources
fn bench_scopes(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("scopes");

    group.bench_function("bracket_per_element", |b| {
        b.iter(|| {
            rt.block_on(async {
                let count = Stream::range(0..1_000)
                    .flat_map(|n| Stream::bracket(async move { Ok(n) }, |_| async { Ok(()) }))
                    .compile()
                    .count()
                    .await;
                black_box(count)
            })
        });
    });

    group.finish();
}

/// Benchmark channel hand-off
fn bench_channel(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("channel");
    const MESSAGES: u64 = 10_000;
    group.throughput(Throughput::Elements(MESSAGES));

    for capacity in [1usize, 64, 1_024] {
        group.bench_with_input(BenchmarkId::new("bounded", capacity), &capacity, |b, &capacity| {
            b.iter(|| {
                rt.block_on(async {
                    let channel = Channel::bounded(capacity);
                    let producer = channel.clone();
                    let sender = tokio::spawn(async move {
                        for n in 0..MESSAGES {
                            if producer.send(n).await.is_err() {
                                break;
                            }
                        }
                        producer.close();
                    });
                    let count = channel.stream().compile().count().await;
                    let _ = sender.await;
                    black_box(count)
                })
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_binds, bench_chunked_map, bench_scopes, bench_channel);
criterion_main!(benches);
