//! Latency benchmarks for Courier.
//!
//! These benchmarks focus on per-call latency of the presence registry and
//! on the push-to-notification path.

use courier_bench::{runtime, user_id, Cluster};
use courier_core::{Broker, Keyspace, OutboundMessage, SessionId};
use courier_protocol::codec;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use futures_util::StreamExt;
use std::time::Instant;

/// Benchmark connect + disconnect of a fresh session.
fn bench_session_lifecycle(c: &mut Criterion) {
    let rt = runtime().unwrap();
    let cluster = rt.block_on(async { Cluster::new() });
    let mut group = c.benchmark_group("session_lifecycle");

    group.bench_function("connect_disconnect", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let start = Instant::now();
                for _ in 0..iters {
                    let session = SessionId::generate();
                    cluster
                        .registry
                        .connect("u0", &session, "n0", None)
                        .await
                        .unwrap();
                    cluster.registry.disconnect("u0", &session).await.unwrap();
                }
                start.elapsed()
            })
        });
    });

    group.bench_function("heartbeat", |b| {
        let session = SessionId::new("hb");
        rt.block_on(cluster.registry.connect("u-hb", &session, "n0", None))
            .unwrap();
        b.iter_custom(|iters| {
            rt.block_on(async {
                let start = Instant::now();
                for _ in 0..iters {
                    black_box(cluster.registry.heartbeat("u-hb", &session).await.unwrap());
                }
                start.elapsed()
            })
        });
    });

    group.finish();
}

/// Benchmark batch resolve by batch size.
fn bench_resolve(c: &mut Criterion) {
    let rt = runtime().unwrap();
    let cluster = rt.block_on(async {
        let cluster = Cluster::new();
        cluster.populate(1000, 2, 8).await;
        cluster
    });
    let mut group = c.benchmark_group("resolve");

    for size in [1usize, 10, 100, 1000] {
        let users: Vec<String> = (0..size).map(user_id).collect();
        group.bench_with_input(BenchmarkId::from_parameter(size), &users, |b, users| {
            b.iter_custom(|iters| {
                rt.block_on(async {
                    let start = Instant::now();
                    for _ in 0..iters {
                        black_box(cluster.registry.resolve(users).await.unwrap());
                    }
                    start.elapsed()
                })
            });
        });
    }

    group.finish();
}

/// Benchmark push until the notification reaches the node topic.
fn bench_push_to_notify(c: &mut Criterion) {
    let rt = runtime().unwrap();
    let cluster = rt.block_on(async {
        let cluster = Cluster::new();
        cluster.populate(1, 1, 1).await;
        cluster
    });
    let topic = Keyspace::new("bench").node_topic("n0");
    let mut inbox = rt
        .block_on(cluster.broker.subscribe(&topic))
        .unwrap();

    let mut group = c.benchmark_group("push_to_notify");
    group.bench_function("direct_64B", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let start = Instant::now();
                for _ in 0..iters {
                    cluster
                        .router
                        .push_message(OutboundMessage::direct("sender", "u0", vec![0u8; 64]))
                        .await
                        .unwrap();
                    let payload = inbox.next().await.unwrap();
                    black_box(codec::decode(&payload).unwrap());
                }
                start.elapsed()
            })
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_session_lifecycle,
    bench_resolve,
    bench_push_to_notify,
);
criterion_main!(benches);
