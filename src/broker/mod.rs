//! Broker collaborator API
//!
//! The client never talks to a broker directly: a `Connector` produces
//! a `Transport` per connection, and every delivered message carries an
//! `AckHandle` for settling it. Backends:
//!
//! - **nats**: NATS JetStream via `async-nats`
//! - **memory**: in-process broker for tests and single-process use,
//!   with fault injection

use crate::config::{ClientConfig, ConsumerConfig, StreamConfig};
use crate::error::Result;
use crate::types::PublishAck;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub mod memory;
pub mod nats;

/// Notifications a transport sends to its connection manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The underlying connection was lost
    Disconnected { reason: String },
    /// Non-fatal error reported by the transport
    Error(String),
}

/// Channel a transport uses to report lifecycle events
pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// Opens transports to a broker
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection
    ///
    /// The transport must report a lost connection on `events` exactly
    /// once; it must not reconnect by itself.
    async fn connect(
        &self,
        config: &ClientConfig,
        events: TransportEvents,
    ) -> Result<Arc<dyn Transport>>;

    /// Backend name (e.g., "nats", "memory")
    fn name(&self) -> &str;
}

/// A live connection to the broker
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish and wait for the broker's confirmation
    async fn publish(&self, message: OutboundMessage) -> Result<PublishAck>;

    /// Fetch up to `batch_size` messages for a durable consumer
    ///
    /// Waits up to `timeout` for at least one message; an empty vector
    /// means nothing was available.
    async fn pull(
        &self,
        stream: &str,
        consumer: &str,
        batch_size: usize,
        timeout: Duration,
    ) -> Result<Vec<RawDelivery>>;

    /// Create or update a stream (no-op if it already matches)
    async fn declare_stream(&self, config: &StreamConfig) -> Result<()>;

    /// Create or update a durable consumer (no-op if it already matches)
    async fn declare_consumer(&self, config: &ConsumerConfig) -> Result<()>;

    /// Cheap liveness check
    async fn health(&self) -> Result<()>;

    /// Release the connection; pending settlements may fail afterwards
    async fn close(&self);

    /// Server this transport is connected to
    fn server(&self) -> String;
}

/// Settles one delivered message
#[async_trait]
pub trait AckHandle: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nak(&self, delay: Option<Duration>) -> Result<()>;

    async fn term(&self, reason: &str) -> Result<()>;

    /// Work is still in progress; restart the ack-wait timer
    async fn in_progress(&self) -> Result<()>;
}

/// A message ready to publish
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub subject: String,
    pub payload: Bytes,
    /// Broker deduplication id
    pub msg_id: String,
    pub headers: Vec<(String, String)>,
    /// Confirmation timeout
    pub timeout: Duration,
}

/// A message as delivered by the broker, before decoding
pub struct RawDelivery {
    pub subject: String,
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
    pub stream: String,
    pub stream_sequence: u64,
    /// Delivery attempt, starting at 1
    pub delivery_count: u64,
    pub acker: Box<dyn AckHandle>,
}

impl std::fmt::Debug for RawDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawDelivery")
            .field("subject", &self.subject)
            .field("stream", &self.stream)
            .field("stream_sequence", &self.stream_sequence)
            .field("delivery_count", &self.delivery_count)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Match a subject against a pattern with `*` (one token) and `>`
/// (one or more trailing tokens) wildcards
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
