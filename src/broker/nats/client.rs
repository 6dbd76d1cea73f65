//! NATS JetStream transport: publish, pull, declare

use crate::broker::{AckHandle, OutboundMessage, RawDelivery, Transport};
use crate::config::{
    AckPolicy, ClientConfig, ConsumerConfig, DeliverPolicy, DiscardPolicy, RetentionPolicy,
    StorageType, StreamConfig,
};
use crate::error::{EventError, Result};
use crate::types::PublishAck;
use async_nats::jetstream::{self, consumer::PullConsumer, AckKind};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// One JetStream connection
pub struct NatsTransport {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    /// Pull consumers by (stream, durable name)
    consumers: Mutex<HashMap<(String, String), PullConsumer>>,
    request_timeout: Duration,
    /// Cancelled by `close()`; blocked pulls return immediately
    closed: CancellationToken,
}

impl NatsTransport {
    pub(super) fn new(client: async_nats::Client, config: &ClientConfig) -> Self {
        let jetstream = match &config.jetstream_domain {
            Some(domain) => jetstream::with_domain(client.clone(), domain),
            None => jetstream::new(client.clone()),
        };

        Self {
            client,
            jetstream,
            consumers: Mutex::new(HashMap::new()),
            request_timeout: config.request_timeout(),
            closed: CancellationToken::new(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(EventError::Transport("NATS transport is closed".into()));
        }
        Ok(())
    }

    async fn consumer(&self, stream: &str, durable: &str) -> Result<PullConsumer> {
        let key = (stream.to_string(), durable.to_string());
        if let Some(consumer) = self.consumers.lock().await.get(&key) {
            return Ok(consumer.clone());
        }

        let consumer: PullConsumer = self
            .jetstream
            .get_consumer_from_stream(durable, stream)
            .await
            .map_err(|e| {
                EventError::Consumer(format!(
                    "Failed to get consumer '{}' on stream '{}': {}",
                    durable, stream, e
                ))
            })?;
        self.consumers.lock().await.insert(key, consumer.clone());
        Ok(consumer)
    }

    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        batch_size: usize,
        timeout: Duration,
    ) -> Result<Vec<RawDelivery>> {
        let pull_consumer = self.consumer(stream, consumer).await?;

        let batch = pull_consumer
            .fetch()
            .max_messages(batch_size)
            .expires(timeout)
            .messages()
            .await
            .map_err(|e| EventError::Transport(format!("fetch from '{}': {}", consumer, e)))?;

        let mut batch = std::pin::pin!(batch);
        let mut deliveries = Vec::with_capacity(batch_size);
        while let Some(msg) = batch.next().await {
            let msg = msg.map_err(|e| EventError::Transport(format!("fetch from '{}': {}", consumer, e)))?;

            let (stream_sequence, delivery_count, stream_name) = match msg.info() {
                Ok(info) => (
                    info.stream_sequence,
                    info.delivered.max(1) as u64,
                    info.stream.to_string(),
                ),
                Err(e) => {
                    tracing::warn!(consumer = consumer, error = %e, "Message without JetStream metadata skipped");
                    continue;
                }
            };

            let headers = msg
                .headers
                .as_ref()
                .map(|h| {
                    h.iter()
                        .filter_map(|(name, values)| {
                            values
                                .first()
                                .map(|v| (name.to_string(), v.as_str().to_string()))
                        })
                        .collect()
                })
                .unwrap_or_default();

            deliveries.push(RawDelivery {
                subject: msg.subject.to_string(),
                payload: msg.payload.clone(),
                headers,
                stream: stream_name,
                stream_sequence,
                delivery_count,
                acker: Box::new(NatsAck { message: msg }),
            });
        }

        Ok(deliveries)
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn publish(&self, message: OutboundMessage) -> Result<PublishAck> {
        self.ensure_open()?;
        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", message.msg_id.as_str());
        for (name, value) in &message.headers {
            headers.insert(name.as_str(), value.as_str());
        }

        let ack_fut = self
            .jetstream
            .publish_with_headers(message.subject.clone(), headers, message.payload)
            .await
            .map_err(|e| EventError::Transport(format!("publish to '{}': {}", message.subject, e)))?;

        let ack = tokio::time::timeout(message.timeout, ack_fut)
            .await
            .map_err(|_| {
                EventError::Timeout(format!(
                    "Publish ack timed out after {:?} for subject '{}'",
                    message.timeout, message.subject
                ))
            })?
            .map_err(|e| {
                EventError::Transport(format!("ack failed for '{}': {}", message.subject, e))
            })?;

        Ok(PublishAck {
            stream: ack.stream,
            sequence: ack.sequence,
            duplicate: ack.duplicate,
        })
    }

    async fn pull(
        &self,
        stream: &str,
        consumer: &str,
        batch_size: usize,
        timeout: Duration,
    ) -> Result<Vec<RawDelivery>> {
        self.ensure_open()?;
        tokio::select! {
            _ = self.closed.cancelled() => {
                Err(EventError::Transport("NATS transport closed during pull".into()))
            }
            fetched = self.fetch(stream, consumer, batch_size, timeout) => fetched,
        }
    }

    async fn declare_stream(&self, config: &StreamConfig) -> Result<()> {
        let stream_config = jetstream::stream::Config {
            name: config.name.clone(),
            subjects: config.subjects.clone(),
            retention: match config.retention {
                RetentionPolicy::Limits => jetstream::stream::RetentionPolicy::Limits,
                RetentionPolicy::Interest => jetstream::stream::RetentionPolicy::Interest,
                RetentionPolicy::WorkQueue => jetstream::stream::RetentionPolicy::WorkQueue,
            },
            storage: match config.storage {
                StorageType::File => jetstream::stream::StorageType::File,
                StorageType::Memory => jetstream::stream::StorageType::Memory,
            },
            discard: match config.discard {
                DiscardPolicy::Old => jetstream::stream::DiscardPolicy::Old,
                DiscardPolicy::New => jetstream::stream::DiscardPolicy::New,
            },
            max_age: Duration::from_secs(config.max_age_seconds),
            max_bytes: config.max_bytes,
            num_replicas: config.replicas,
            duplicate_window: Duration::from_secs(config.duplicate_window_seconds),
            ..Default::default()
        };

        self.jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| {
                EventError::Stream(format!(
                    "Failed to create/get stream '{}': {}",
                    config.name, e
                ))
            })?;

        tracing::info!(
            stream = %config.name,
            subjects = ?config.subjects,
            "JetStream stream ready"
        );
        Ok(())
    }

    async fn declare_consumer(&self, config: &ConsumerConfig) -> Result<()> {
        let stream = self
            .jetstream
            .get_stream(&config.stream_name)
            .await
            .map_err(|e| {
                EventError::Consumer(format!(
                    "Failed to get stream '{}' for consumer '{}': {}",
                    config.stream_name, config.durable_name, e
                ))
            })?;

        let consumer: PullConsumer = stream
            .get_or_create_consumer(&config.durable_name, build_consumer_config(config))
            .await
            .map_err(|e| {
                EventError::Consumer(format!(
                    "Failed to create durable consumer '{}': {}",
                    config.durable_name, e
                ))
            })?;

        self.consumers.lock().await.insert(
            (config.stream_name.clone(), config.durable_name.clone()),
            consumer,
        );

        tracing::info!(
            consumer = %config.durable_name,
            stream = %config.stream_name,
            filters = ?config.filter_subjects,
            max_deliver = ?config.max_deliver,
            "Durable consumer ready"
        );
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        self.ensure_open()?;
        if self.client.connection_state() != async_nats::connection::State::Connected {
            return Err(EventError::Transport("NATS connection is not established".into()));
        }
        tokio::time::timeout(self.request_timeout, self.client.flush())
            .await
            .map_err(|_| EventError::Timeout("health check flush timed out".into()))?
            .map_err(|e| EventError::Transport(format!("health check failed: {}", e)))
    }

    async fn close(&self) {
        self.closed.cancel();
        self.consumers.lock().await.clear();
        match tokio::time::timeout(self.request_timeout, self.client.drain()).await {
            Ok(Ok(())) => tracing::debug!("NATS connection drained"),
            Ok(Err(e)) => tracing::debug!(error = %e, "Drain on close failed"),
            Err(_) => tracing::warn!(
                timeout_ms = self.request_timeout.as_millis() as u64,
                "Timed out draining NATS connection"
            ),
        }
    }

    fn server(&self) -> String {
        let info = self.client.server_info();
        format!("nats://{}:{}", info.host, info.port)
    }
}

/// Build a JetStream pull consumer config
fn build_consumer_config(config: &ConsumerConfig) -> jetstream::consumer::pull::Config {
    let deliver_policy = match &config.deliver_policy {
        DeliverPolicy::All => jetstream::consumer::DeliverPolicy::All,
        DeliverPolicy::Last => jetstream::consumer::DeliverPolicy::Last,
        DeliverPolicy::New => jetstream::consumer::DeliverPolicy::New,
        DeliverPolicy::ByStartSequence { sequence } => {
            jetstream::consumer::DeliverPolicy::ByStartSequence {
                start_sequence: *sequence,
            }
        }
        DeliverPolicy::ByStartTime { timestamp } => {
            let start_time =
                time::OffsetDateTime::from_unix_timestamp_nanos(i128::from(*timestamp) * 1_000_000)
                    .unwrap_or(time::OffsetDateTime::UNIX_EPOCH);
            jetstream::consumer::DeliverPolicy::ByStartTime { start_time }
        }
        DeliverPolicy::LastPerSubject => jetstream::consumer::DeliverPolicy::LastPerSubject,
    };

    let (filter_subject, filter_subjects) = match config.filter_subjects.as_slice() {
        [single] => (single.clone(), Vec::new()),
        many => (String::new(), many.to_vec()),
    };

    jetstream::consumer::pull::Config {
        durable_name: Some(config.durable_name.clone()),
        filter_subject,
        filter_subjects,
        ack_policy: match config.ack_policy {
            AckPolicy::Explicit => jetstream::consumer::AckPolicy::Explicit,
            AckPolicy::None => jetstream::consumer::AckPolicy::None,
        },
        deliver_policy,
        max_deliver: config.max_deliver.map_or(-1, i64::from),
        ack_wait: config.ack_wait,
        ..Default::default()
    }
}

struct NatsAck {
    message: jetstream::Message,
}

#[async_trait]
impl AckHandle for NatsAck {
    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| EventError::Ack(e.to_string()))
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<()> {
        self.message
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| EventError::Ack(e.to_string()))
    }

    async fn term(&self, reason: &str) -> Result<()> {
        tracing::debug!(subject = %self.message.subject, reason = reason, "Terminating message");
        self.message
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| EventError::Ack(e.to_string()))
    }

    async fn in_progress(&self) -> Result<()> {
        self.message
            .ack_with(AckKind::Progress)
            .await
            .map_err(|e| EventError::Ack(e.to_string()))
    }
}
