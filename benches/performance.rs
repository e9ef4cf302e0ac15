//! Performance benchmarks for append, fan-out and catch-up.

use chatfan::{
    AuthorId, ChatHub, HubConfig, LogConfig, MemoryStore, MessageId, MessageLog, MessageStore,
    NewMessage, SseWriter,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::io;
use tempfile::TempDir;

fn bench_config() -> HubConfig {
    HubConfig {
        start_poller: false,
        ..Default::default()
    }
}

/// Hub with `n` subscribers writing SSE frames into the void.
fn hub_with_subscribers(n: usize) -> (ChatHub, Vec<chatfan::StreamSession>) {
    let hub = ChatHub::in_memory(bench_config()).unwrap();
    let sessions = (0..n)
        .map(|_| {
            hub.subscribe_with(MessageId::ZERO, Box::new(SseWriter::new(io::sink())))
                .unwrap()
        })
        .collect();
    (hub, sessions)
}

/// Benchmark post + push with varying subscriber counts
fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");

    for subscribers in [1, 10, 100, 1000] {
        group.bench_with_input(
            BenchmarkId::new("subscribers", subscribers),
            &subscribers,
            |b, &n| {
                let (hub, _sessions) = hub_with_subscribers(n);

                b.iter(|| {
                    black_box(hub.post(AuthorId(1), "bench", "hello everyone").unwrap());
                });
            },
        );
    }

    group.finish();
}

/// Benchmark a poll tick where every subscriber is already caught up
fn bench_idle_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("idle_tick");

    for subscribers in [10, 100, 1000] {
        group.bench_with_input(
            BenchmarkId::new("subscribers", subscribers),
            &subscribers,
            |b, &n| {
                let (hub, _sessions) = hub_with_subscribers(n);
                hub.post(AuthorId(1), "bench", "seed").unwrap();

                b.iter(|| {
                    black_box(hub.poll_now());
                });
            },
        );
    }

    group.finish();
}

fn fill(store: &dyn MessageStore, n: usize) {
    for i in 0..n {
        store
            .append(NewMessage::new(AuthorId(1), "bench", format!("message {}", i)))
            .unwrap();
    }
}

/// Benchmark cursor queries near the tail of a large log
fn bench_query_after(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_after");
    let total = 10_000;

    let memory = MemoryStore::new();
    fill(&memory, total);

    let dir = TempDir::new().unwrap();
    let log = MessageLog::open(LogConfig {
        path: dir.path().join("bench.log"),
        ..Default::default()
    })
    .unwrap();
    fill(&log, total);

    for behind in [1u64, 50, 500] {
        let cursor = MessageId(total as u64 - behind);

        group.bench_with_input(BenchmarkId::new("memory", behind), &cursor, |b, &cursor| {
            b.iter(|| black_box(memory.query_after(cursor, None).unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("log", behind), &cursor, |b, &cursor| {
            b.iter(|| black_box(log.query_after(cursor, None).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark durable appends with varying sync intervals
fn bench_log_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("log_append");

    for sync_interval in [1, 100, 1000] {
        group.bench_with_input(
            BenchmarkId::new("sync_interval", sync_interval),
            &sync_interval,
            |b, &sync_interval| {
                let dir = TempDir::new().unwrap();
                let log = MessageLog::open(LogConfig {
                    path: dir.path().join("bench.log"),
                    sync_interval,
                    ..Default::default()
                })
                .unwrap();

                b.iter(|| {
                    black_box(
                        log.append(NewMessage::new(AuthorId(1), "bench", "durable"))
                            .unwrap(),
                    );
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_fan_out,
    bench_idle_tick,
    bench_query_after,
    bench_log_append,
);
criterion_main!(benches);
