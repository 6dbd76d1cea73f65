//! NATS JetStream integration tests
//!
//! These tests require a running NATS server with JetStream enabled:
//!   nats-server -js
//!
//! Tests are skipped automatically if NATS is not available.

use a3s_stream::{
    handler_fn, BatchMode, ClientConfig, ConsumerConfig, DeliveryContext, Event, EventClient,
    EventMetadata, Outcome, PublisherConfig, StorageType, StreamConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Try to connect to NATS. Returns None if server is unavailable.
async fn try_nats_client(stream_suffix: &str) -> Option<(EventClient, String)> {
    let stream = format!("TEST_EVENTS_{}", stream_suffix.to_uppercase());
    let config = ClientConfig {
        servers: vec!["nats://127.0.0.1:4222".to_string()],
        connect_retries: 1,
        connect_timeout_secs: 2,
        streams: vec![StreamConfig {
            storage: StorageType::Memory,
            max_age_seconds: 300,
            max_bytes: 64 * 1024 * 1024,
            ..StreamConfig::new(stream.clone(), vec![format!("test.{}.*", stream_suffix)])
        }],
        ..Default::default()
    };

    let client = EventClient::nats(config);
    match client.connect().await {
        Ok(()) => Some((client, stream)),
        Err(_) => {
            eprintln!("NATS not available, skipping integration test");
            None
        }
    }
}

/// Connect to NATS, or skip the test
macro_rules! nats_client {
    ($suffix:expr) => {
        match try_nats_client($suffix).await {
            Some(c) => c,
            None => return,
        }
    };
}

fn event(suffix: &str, n: u32) -> Event {
    Event::new(
        format!("test.{}.created", suffix),
        EventMetadata::new("integration-test"),
        serde_json::json!({ "n": n }),
    )
}

#[tokio::test]
async fn test_nats_publish_and_dedup() {
    let (client, stream) = nats_client!("dedup");
    let publisher = client.publisher(PublisherConfig::default()).unwrap();
    let event = event("dedup", 1);

    let first = publisher.publish(&event).await.unwrap();
    let second = publisher.publish(&event).await.unwrap();

    assert_eq!(first.stream, stream);
    assert!(!first.duplicate);
    assert!(second.duplicate);
    assert_eq!(first.sequence, second.sequence);
    client.close().await;
}

#[tokio::test]
async fn test_nats_parallel_batch() {
    let (client, _) = nats_client!("batch");
    let publisher = client.publisher(PublisherConfig::default()).unwrap();
    let events: Vec<Event> = (0..20).map(|n| event("batch", n)).collect();

    let result = publisher.publish_batch(&events, BatchMode::Parallel).await;

    assert_eq!(result.len(), 20);
    assert!(result.all_published());
    client.close().await;
}

#[tokio::test]
async fn test_nats_consume_and_ack() {
    let (client, stream) = nats_client!("consume");
    let publisher = client.publisher(PublisherConfig::default()).unwrap();
    let consumer = client
        .consumer(ConsumerConfig {
            fetch_timeout: Duration::from_secs(1),
            ..ConsumerConfig::new(stream, "it-consumer").with_filter("test.consume.*")
        })
        .unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    consumer
        .subscribe(handler_fn(move |_event: Event, _ctx: DeliveryContext| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Outcome::Ack)
            }
        }))
        .await
        .unwrap();

    for n in 0..3 {
        publisher.publish(&event("consume", n)).await.unwrap();
    }

    for _ in 0..50 {
        if seen.load(Ordering::SeqCst) >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(seen.load(Ordering::SeqCst) >= 3);

    consumer.stop().await.unwrap();
    client.close().await;
}

#[tokio::test]
async fn test_nats_redelivery_capped() {
    let (client, stream) = nats_client!("capped");
    let publisher = client.publisher(PublisherConfig::default()).unwrap();
    let consumer = client
        .consumer(ConsumerConfig {
            max_deliver: Some(2),
            fetch_timeout: Duration::from_secs(1),
            ..ConsumerConfig::new(stream, "it-capped").with_filter("test.capped.*")
        })
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    consumer
        .subscribe(handler_fn(move |_event: Event, _ctx: DeliveryContext| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Outcome::nak())
            }
        }))
        .await
        .unwrap();

    publisher.publish(&event("capped", 1)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    consumer.stop().await.unwrap();
    client.close().await;
}

#[tokio::test]
async fn test_nats_health_check() {
    let (client, _) = nats_client!("health");
    assert!(client.health().await);
    client.close().await;
    assert!(!client.health().await);
}

#[tokio::test]
async fn test_nats_close_releases_blocked_pull() {
    let (client, stream) = nats_client!("closing");
    let transport = client.connection().current().unwrap().transport;
    transport
        .declare_consumer(&ConsumerConfig::new(stream.clone(), "it-closing").with_filter("test.closing.*"))
        .await
        .unwrap();

    let pull = tokio::spawn({
        let transport = transport.clone();
        async move {
            transport
                .pull(&stream, "it-closing", 10, Duration::from_secs(60))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    client.close().await;

    let pulled = tokio::time::timeout(Duration::from_secs(5), pull)
        .await
        .expect("pull still blocked after close")
        .unwrap();
    assert!(pulled.is_err());
    assert!(transport.health().await.is_err());
}
