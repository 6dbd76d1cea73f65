//! Error types for a3s-stream

use crate::types::ConnectionState;
use thiserror::Error;

/// Errors that can occur in the stream client
#[derive(Debug, Error)]
pub enum EventError {
    /// Broker unreachable, authentication or TLS failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation attempted while the connection is not usable
    ///
    /// Raised immediately (no queueing) when a publish is issued during
    /// reconnection. Callers may retry once the connection recovers.
    #[error("Not connected (connection is {state})")]
    NotConnected { state: ConnectionState },

    /// Transient transport failure (timeouts, dropped connection, no responders)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Publish failure after all attempts were exhausted
    #[error("Failed to publish event {event_id} to subject '{subject}' after {attempts} attempt(s): {source}")]
    Publish {
        event_id: String,
        subject: String,
        attempts: u32,
        #[source]
        source: Box<EventError>,
    },

    /// Serialized event exceeds the configured payload limit
    #[error("Event {event_id} payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        event_id: String,
        size: usize,
        max: usize,
    },

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Pull-loop failure for a consumer
    #[error("Consume error for consumer '{consumer}': {reason}")]
    Consume { consumer: String, reason: String },

    /// Stream creation or management error
    #[error("Stream error: {0}")]
    Stream(String),

    /// Consumer creation or management error
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Acknowledgement failure
    #[error("Failed to acknowledge message: {0}")]
    Ack(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Consumer is already running
    #[error("Consumer '{0}' is already running")]
    AlreadyRunning(String),

    /// Client or consumer has been closed
    #[error("Closed: {0}")]
    Closed(String),
}

impl EventError {
    /// Whether retrying the same operation later may succeed
    ///
    /// Validation failures (payload size, serialization, configuration)
    /// never succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            EventError::NotConnected { .. }
            | EventError::Transport(_)
            | EventError::Timeout(_)
            | EventError::Consume { .. }
            | EventError::Ack(_) => true,
            EventError::Publish { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

/// Error raised by a message handler
///
/// Handler errors are never propagated: the consumer maps them to a
/// negative acknowledgement so the broker redelivers the message.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self(format!("payload decode failed: {}", e))
    }
}

impl From<EventError> for HandlerError {
    fn from(e: EventError) -> Self {
        Self(e.to_string())
    }
}

/// Result type alias for stream operations
pub type Result<T> = std::result::Result<T, EventError>;
