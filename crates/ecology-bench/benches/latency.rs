//! Latency benchmarks for the ecology loop and loopback links.

use criterion::{criterion_group, criterion_main, Criterion};
use ecology_bench::{ecology, linked_pair, payload, stop};
use ecology_core::{EcologyRuntime, EventReceiver};
use ecology_protocol::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

/// A task posted through the handle and its answer.
fn bench_request_round_trip(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("request_round_trip");

    group.bench_function("empty_task", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let (handle, join) = EcologyRuntime::spawn(ecology("phone", false));
                let start = Instant::now();
                for _ in 0..iters {
                    handle.request(|_| ()).await.unwrap();
                }
                let elapsed = start.elapsed();
                handle.shutdown();
                join.await.unwrap();
                elapsed
            })
        });
    });

    group.finish();
}

/// Publish on one device until a receiver on the other fires.
fn bench_event_across_link(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("event_across_link");
    group.measurement_time(Duration::from_secs(10));

    for len in [1usize, 32] {
        group.bench_function(format!("{len}_values"), |b| {
            b.iter_custom(|iters| {
                rt.block_on(async {
                    let (hub, phone) = linked_pair().await;
                    let (tx, mut rx) = mpsc::unbounded_channel();
                    let receiver: Arc<dyn EventReceiver> =
                        Arc::new(move |_: &str, data: &[Value]| {
                            let _ = tx.send(data.len());
                        });
                    hub.handle
                        .request(move |ecology| {
                            ecology
                                .room("lobby")
                                .unwrap()
                                .event_broadcaster_mut()
                                .subscribe("tap", receiver)
                                .unwrap();
                        })
                        .await
                        .unwrap();

                    let data = payload(len);
                    let start = Instant::now();
                    for _ in 0..iters {
                        phone.handle.publish("lobby", "tap", data.clone()).unwrap();
                        rx.recv().await.unwrap();
                    }
                    let elapsed = start.elapsed();

                    stop(hub).await;
                    stop(phone).await;
                    elapsed
                })
            });
        });
    }

    group.finish();
}

/// A replica write until the reference holds it.
fn bench_data_write_across_link(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("data_write_across_link");

    group.bench_function("int32", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let (hub, phone) = linked_pair().await;
                while !phone.handle.is_synchronized() {
                    tokio::task::yield_now().await;
                }

                let start = Instant::now();
                for i in 0..iters {
                    let value = Value::from(i as i64);
                    phone.handle.set_data("counter", value.clone()).unwrap();
                    while hub.handle.get_data("counter").as_ref() != Some(&value) {
                        tokio::task::yield_now().await;
                    }
                }
                let elapsed = start.elapsed();

                stop(hub).await;
                stop(phone).await;
                elapsed
            })
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_request_round_trip,
    bench_event_across_link,
    bench_data_write_across_link
);
criterion_main!(benches);
