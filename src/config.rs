//! Client, stream, consumer and publisher configuration
//!
//! All configuration types deserialize from any serde format with
//! defaults for every field, so a partial document is a valid config.

use crate::error::{EventError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Connection-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Broker URLs, tried in order
    pub servers: Vec<String>,

    /// Client name reported to the broker
    pub client_name: String,

    /// Reconnect attempts after a drop (0 = unlimited)
    pub max_reconnect_attempts: u32,

    /// Base delay between reconnect attempts
    pub reconnect_wait_seconds: u64,

    /// Upper bound for the exponential reconnect delay
    pub max_reconnect_wait_seconds: u64,

    /// Add up to 25% random jitter to reconnect delays
    pub reconnect_jitter: bool,

    /// Attempts for the initial `connect()` before giving up
    pub connect_retries: u32,

    /// Username/password or token authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,

    /// TLS settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,

    /// Use JetStream (publishers and consumers require it)
    pub enable_jetstream: bool,

    /// JetStream domain
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jetstream_domain: Option<String>,

    /// Wrap publishes and message handling in tracing spans
    pub enable_tracing: bool,

    /// Report publish/consume measurements to the hooks
    pub enable_metrics: bool,

    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// Request (and publish-ack) timeout in seconds
    pub request_timeout_secs: u64,

    /// Maximum serialized event size in bytes
    pub max_payload_bytes: usize,

    /// Streams declared on every (re)connect
    pub streams: Vec<StreamConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: vec!["nats://localhost:4222".to_string()],
            client_name: "a3s-stream-client".to_string(),
            max_reconnect_attempts: 10,
            reconnect_wait_seconds: 2,
            max_reconnect_wait_seconds: 60,
            reconnect_jitter: true,
            connect_retries: 3,
            auth: None,
            tls: None,
            enable_jetstream: true,
            jetstream_domain: None,
            enable_tracing: true,
            enable_metrics: true,
            connect_timeout_secs: 5,
            request_timeout_secs: 5,
            max_payload_bytes: 1024 * 1024,
            streams: StreamConfig::defaults(),
        }
    }
}

impl ClientConfig {
    /// Check the configuration for contradictions
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(EventError::Config("at least one server is required".into()));
        }
        if self.servers.iter().any(|s| s.trim().is_empty()) {
            return Err(EventError::Config("server URL must not be empty".into()));
        }
        if self.reconnect_wait_seconds == 0 {
            return Err(EventError::Config("reconnect_wait_seconds must be >= 1".into()));
        }
        if self.max_payload_bytes < 1024 {
            return Err(EventError::Config("max_payload_bytes must be >= 1024".into()));
        }
        if let Some(ref auth) = self.auth {
            auth.validate()?;
        }
        if let Some(ref tls) = self.tls {
            tls.validate()?;
        }
        for stream in &self.streams {
            stream.validate()?;
        }
        Ok(())
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_secs(self.reconnect_wait_seconds)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_wait_seconds.max(self.reconnect_wait_seconds))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Broker authentication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum AuthConfig {
    Credentials { username: String, password: String },
    Token { token: String },
}

impl AuthConfig {
    fn validate(&self) -> Result<()> {
        match self {
            AuthConfig::Credentials { username, password } => {
                if username.is_empty() || password.is_empty() {
                    return Err(EventError::Config(
                        "auth requires both username and password".into(),
                    ));
                }
            }
            AuthConfig::Token { token } => {
                if token.is_empty() {
                    return Err(EventError::Config("auth token must not be empty".into()));
                }
            }
        }
        Ok(())
    }
}

/// TLS files
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// CA bundle used to verify the server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<PathBuf>,

    /// Client certificate (mutual TLS)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert: Option<PathBuf>,

    /// Client private key (mutual TLS)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,
}

impl TlsConfig {
    fn validate(&self) -> Result<()> {
        if self.cert.is_some() != self.key.is_some() {
            return Err(EventError::Config(
                "TLS client cert and key must be set together".into(),
            ));
        }
        Ok(())
    }
}

/// Message retention policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    #[default]
    Limits,
    Interest,
    WorkQueue,
}

/// Stream storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

/// What to drop when a stream hits its limits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardPolicy {
    #[default]
    Old,
    New,
}

/// Stream declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    pub retention: RetentionPolicy,
    pub storage: StorageType,
    /// Maximum message age in seconds (0 = unlimited)
    pub max_age_seconds: u64,
    /// Maximum stream size in bytes (-1 = unlimited)
    pub max_bytes: i64,
    pub replicas: usize,
    pub discard: DiscardPolicy,
    /// Window in seconds during which duplicate message ids are rejected
    pub duplicate_window_seconds: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            subjects: Vec::new(),
            retention: RetentionPolicy::Limits,
            storage: StorageType::File,
            max_age_seconds: 7 * 24 * 60 * 60,
            max_bytes: 10 * 1024 * 1024 * 1024,
            replicas: 1,
            discard: DiscardPolicy::Old,
            duplicate_window_seconds: 120,
        }
    }
}

impl StreamConfig {
    pub fn new(name: impl Into<String>, subjects: Vec<String>) -> Self {
        Self {
            name: name.into(),
            subjects,
            ..Default::default()
        }
    }

    /// Academic and notes streams
    pub fn defaults() -> Vec<StreamConfig> {
        let academic = [
            "academic.profile.*",
            "academic.course.*",
            "academic.assignment.*",
            "academic.exam.*",
            "academic.quiz.*",
            "academic.lab.*",
            "academic.study.*",
            "academic.challenge.*",
            "academic.schedule.*",
        ];
        vec![
            StreamConfig {
                retention: RetentionPolicy::Interest,
                ..StreamConfig::new(
                    "ACADEMIC_EVENTS",
                    academic.iter().map(|s| s.to_string()).collect(),
                )
            },
            StreamConfig {
                retention: RetentionPolicy::Interest,
                max_age_seconds: 30 * 24 * 60 * 60,
                ..StreamConfig::new("NOTES_EVENTS", vec!["notes.*".to_string()])
            },
        ]
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(EventError::Config("stream name must not be empty".into()));
        }
        if self.subjects.is_empty() {
            return Err(EventError::Config(format!(
                "stream '{}' must capture at least one subject",
                self.name
            )));
        }
        if !(1..=5).contains(&self.replicas) {
            return Err(EventError::Config(format!(
                "stream '{}' replicas must be between 1 and 5",
                self.name
            )));
        }
        Ok(())
    }
}

/// Acknowledgement mode of a consumer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Every message is settled by the client
    #[default]
    Explicit,
    /// The broker considers messages done on delivery
    None,
}

/// Where a new durable consumer starts reading
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DeliverPolicy {
    #[default]
    All,
    Last,
    New,
    ByStartSequence { sequence: u64 },
    /// Unix milliseconds
    ByStartTime { timestamp: u64 },
    LastPerSubject,
}

/// Durable consumer and pull-loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Stable consumer identity; survives reconnects
    pub durable_name: String,

    /// Stream the consumer reads from
    pub stream_name: String,

    /// Subject filters (wildcards allowed)
    pub filter_subjects: Vec<String>,

    pub ack_policy: AckPolicy,

    /// Delivery cap per message (`None` = unlimited)
    pub max_deliver: Option<u32>,

    /// Broker-side redelivery timeout for unacknowledged messages
    #[serde(with = "secs")]
    pub ack_wait: Duration,

    /// Messages requested per pull
    pub batch_size: usize,

    pub deliver_policy: DeliverPolicy,

    /// Long-poll timeout for one pull
    #[serde(with = "secs")]
    pub fetch_timeout: Duration,

    /// Pause after an empty pull
    #[serde(with = "secs")]
    pub idle_backoff: Duration,

    /// Concurrent handler invocations
    pub workers: usize,

    /// How long `stop()` waits for in-flight handlers
    #[serde(with = "secs")]
    pub grace_timeout: Duration,

    /// Redelivery delays by attempt, used when the handler gives none
    #[serde(with = "secs_vec")]
    pub redelivery_backoff: Vec<Duration>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            durable_name: String::new(),
            stream_name: String::new(),
            filter_subjects: Vec::new(),
            ack_policy: AckPolicy::Explicit,
            max_deliver: Some(3),
            ack_wait: Duration::from_secs(30),
            batch_size: 10,
            deliver_policy: DeliverPolicy::All,
            fetch_timeout: Duration::from_secs(5),
            idle_backoff: Duration::from_millis(500),
            workers: 1,
            grace_timeout: Duration::from_secs(30),
            redelivery_backoff: Vec::new(),
        }
    }
}

impl ConsumerConfig {
    pub fn new(stream_name: impl Into<String>, durable_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            durable_name: durable_name.into(),
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, subject: impl Into<String>) -> Self {
        self.filter_subjects.push(subject.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.durable_name.is_empty() {
            return Err(EventError::Config("durable_name must not be empty".into()));
        }
        if self.durable_name.contains(['.', '*', '>', ' ']) {
            return Err(EventError::Config(format!(
                "durable_name '{}' contains invalid characters",
                self.durable_name
            )));
        }
        if self.stream_name.is_empty() {
            return Err(EventError::Config("stream_name must not be empty".into()));
        }
        if self.max_deliver == Some(0) {
            return Err(EventError::Config("max_deliver must be >= 1".into()));
        }
        if self.batch_size == 0 {
            return Err(EventError::Config("batch_size must be >= 1".into()));
        }
        if self.workers == 0 {
            return Err(EventError::Config("workers must be >= 1".into()));
        }
        if self.ack_wait.is_zero() {
            return Err(EventError::Config("ack_wait must be positive".into()));
        }
        Ok(())
    }
}

/// Publish retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Total publish attempts per event (at least 1)
    pub max_retries: u32,

    /// Wait before attempt `n + 1` is `retry_backoff_base^n` seconds
    pub retry_backoff_base: f64,

    /// Confirmation timeout per attempt
    #[serde(with = "secs")]
    pub publish_timeout: Duration,

    /// Concurrent publishes in a parallel batch
    pub max_concurrency: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_base: 2.0,
            publish_timeout: Duration::from_secs(5),
            max_concurrency: 32,
        }
    }
}

impl PublisherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(EventError::Config("max_retries must be >= 1".into()));
        }
        if !self.retry_backoff_base.is_finite() || self.retry_backoff_base < 0.0 {
            return Err(EventError::Config(
                "retry_backoff_base must be a non-negative number".into(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(EventError::Config("max_concurrency must be >= 1".into()));
        }
        Ok(())
    }
}

/// Durations as fractional seconds
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod secs_vec {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &[Duration], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(v.iter().map(Duration::as_secs_f64))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Duration>, D::Error> {
        Vec::<f64>::deserialize(d)?
            .into_iter()
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .collect()
    }
}
