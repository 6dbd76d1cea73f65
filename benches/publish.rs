//! Performance benchmarks for a3s-stream
//!
//! Run with: cargo bench

use a3s_stream::{
    BatchMode, ClientConfig, Event, EventClient, EventMetadata, MemoryBroker, Outcome,
    PublisherConfig, RedeliveryPolicy,
};
use criterion::{criterion_group, criterion_main, Criterion};
use std::time::Duration;

fn course_event(i: u64) -> Event {
    Event::new(
        "academic.course.created",
        EventMetadata::new("course-service").with_correlation_id("bench"),
        serde_json::json!({"course_id": format!("CS{}", i), "credits": 4}),
    )
}

fn bench_event_creation(c: &mut Criterion) {
    c.bench_function("Event::new", |b| {
        b.iter(|| course_event(101));
    });
}

fn bench_event_serialization(c: &mut Criterion) {
    let event = course_event(101);

    c.bench_function("Event serialize", |b| {
        b.iter(|| serde_json::to_vec(&event).unwrap());
    });

    let bytes = serde_json::to_vec(&event).unwrap();
    c.bench_function("Event deserialize", |b| {
        b.iter(|| serde_json::from_slice::<Event>(&bytes).unwrap());
    });
}

fn bench_memory_publish(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let broker = MemoryBroker::new();
    let publisher = rt.block_on(async {
        let client = EventClient::memory(ClientConfig::default(), &broker);
        client.connect().await.unwrap();
        client.publisher(PublisherConfig::default()).unwrap()
    });

    c.bench_function("memory publish", |b| {
        b.to_async(&rt)
            .iter(|| async { publisher.publish(&course_event(1)).await.unwrap() });
    });
}

fn bench_batch_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let broker = MemoryBroker::new();
    let publisher = rt.block_on(async {
        let client = EventClient::memory(ClientConfig::default(), &broker);
        client.connect().await.unwrap();
        client.publisher(PublisherConfig::default()).unwrap()
    });

    let mut group = c.benchmark_group("batch_throughput");
    for count in [10u64, 100, 1000] {
        for mode in [BatchMode::Sequential, BatchMode::Parallel] {
            group.bench_function(format!("{} events {:?}", count, mode), |b| {
                // Fresh ids each round so the broker does not dedup
                b.to_async(&rt).iter(|| async {
                    let batch: Vec<Event> = (0..count).map(course_event).collect();
                    publisher.publish_batch(&batch, mode).await
                });
            });
        }
    }
    group.finish();
}

fn bench_redelivery_decide(c: &mut Criterion) {
    let policy = RedeliveryPolicy::new(Some(5)).with_backoff(vec![
        Duration::from_secs(1),
        Duration::from_secs(5),
        Duration::from_secs(30),
    ]);
    let nak = Outcome::nak();

    c.bench_function("RedeliveryPolicy::decide", |b| {
        b.iter(|| {
            for count in 1..=6 {
                criterion::black_box(policy.decide(count, &nak));
            }
        });
    });
}

criterion_group!(
    benches,
    bench_event_creation,
    bench_event_serialization,
    bench_memory_publish,
    bench_batch_throughput,
    bench_redelivery_decide,
);
criterion_main!(benches);
