//! # a3s-stream
//!
//! Resilient client layer over a durable publish/subscribe stream (NATS JetStream).
//!
//! ## Overview
//!
//! `a3s-stream` keeps one logical broker connection alive across network
//! partitions and broker restarts, publishes events with retry and batching,
//! and consumes them through pull-based batches with explicit acknowledgment
//! and bounded redelivery. Delivery is at-least-once: the `event_id` of every
//! event is its idempotency key.
//!
//! ## Quick Start
//!
//! ```rust
//! use a3s_stream::{ClientConfig, Event, EventClient, EventMetadata, PublisherConfig};
//! use a3s_stream::broker::memory::MemoryBroker;
//!
//! # async fn example() -> a3s_stream::Result<()> {
//! // In-process broker; use `EventClient::nats` in production
//! let broker = MemoryBroker::new();
//! let client = EventClient::memory(ClientConfig::default(), &broker);
//! client.connect().await?;
//!
//! let publisher = client.publisher(PublisherConfig::default())?;
//! let ack = publisher
//!     .publish(&Event::new(
//!         "academic.assignment.created",
//!         EventMetadata::new("assignment-service"),
//!         serde_json::json!({"assignment_id": "HW-3", "course_id": "CS101"}),
//!     ))
//!     .await?;
//!
//! println!("Stored in {} at {}", ack.stream, ack.sequence);
//! # Ok(())
//! # }
//! ```
//!
//! ## Backends
//!
//! - **nats**: NATS JetStream via `async-nats`
//! - **memory**: in-process broker for testing and single-process use
//!
//! ## Architecture
//!
//! - **ConnectionManager**: connect, health, reconnection with backoff
//! - **Publisher**: retried publishing and order-preserving batches
//! - **Consumer**: pull loop, worker pool, ack / nak / term
//! - **RedeliveryPolicy**: pure delivery-cap and backoff decisions
//! - **EventClient**: explicit client instance tying them together

pub mod backoff;
pub mod broker;
pub mod client;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod hooks;
pub mod publisher;
pub mod redelivery;
pub mod types;

// Re-export core types
pub use client::{EventClient, EventClientBuilder};
pub use config::{
    AckPolicy, AuthConfig, ClientConfig, ConsumerConfig, DeliverPolicy, DiscardPolicy,
    PublisherConfig, RetentionPolicy, StorageType, StreamConfig, TlsConfig,
};
pub use connection::{ActiveTransport, CallbackId, ConnectionManager};
pub use consumer::{handler_fn, Consumer, HandlerFn, MessageHandler};
pub use error::{EventError, HandlerError, Result};
pub use hooks::{EventHooks, HookError, HookResult};
pub use publisher::Publisher;
pub use redelivery::{Decision, RedeliveryPolicy, TerminalCause};
pub use types::{
    AcademicEntity, BatchMode, BatchOutcome, ConnectionState, ConsumerState, DeliveryContext,
    Event, EventAction, EventKind, EventMetadata, Outcome, PublishAck, PublishResult,
};

// Re-export backends for convenience
pub use broker::memory::{MemoryBroker, MemoryConnector};
pub use broker::nats::{NatsConnector, NatsTransport};
