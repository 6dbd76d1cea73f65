//! Event publishing with retry and batching
//!
//! A publish serializes the event once, then sends the same bytes (and the
//! same `event_id` as the broker dedup id) on every attempt. Transient
//! failures are retried with `retry_backoff_base^attempt` second waits;
//! validation failures are returned immediately.

use crate::backoff::publish_retry_delay;
use crate::broker::OutboundMessage;
use crate::config::PublisherConfig;
use crate::connection::ConnectionManager;
use crate::error::{EventError, Result};
use crate::types::{BatchMode, BatchOutcome, Event, PublishAck, PublishResult};
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Instant;
use tracing::Instrument;

/// Headers set from the event envelope; callers cannot override them
const ENVELOPE_HEADERS: &[&str] = &[
    "nats-msg-id",
    "event-id",
    "event-type",
    "event-version",
    "source-service",
    "correlation-id",
    "causation-id",
];

/// Publishes events over the managed connection
#[derive(Clone)]
pub struct Publisher {
    connection: ConnectionManager,
    config: PublisherConfig,
}

impl Publisher {
    pub fn new(connection: ConnectionManager, config: PublisherConfig) -> Result<Self> {
        config.validate()?;
        if !connection.config().enable_jetstream {
            return Err(EventError::Config(
                "publishing requires JetStream (enable_jetstream = true)".into(),
            ));
        }
        Ok(Self { connection, config })
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Publish one event and wait for the broker's confirmation
    pub async fn publish(&self, event: &Event) -> Result<PublishAck> {
        self.publish_inner(event, Vec::new()).await
    }

    /// Publish with additional message headers
    pub async fn publish_with_headers(
        &self,
        event: &Event,
        headers: HashMap<String, String>,
    ) -> Result<PublishAck> {
        self.publish_inner(event, headers.into_iter().collect()).await
    }

    /// Publish with a `reply-to` header naming the subject responses go to
    pub async fn publish_with_reply(&self, event: &Event, reply_subject: &str) -> Result<PublishAck> {
        self.publish_inner(event, vec![("reply-to".to_string(), reply_subject.to_string())])
            .await
    }

    /// Publish several events; outcomes are aligned with input order
    pub async fn publish_batch(&self, events: &[Event], mode: BatchMode) -> PublishResult {
        let outcomes: Vec<BatchOutcome> = match mode {
            BatchMode::Sequential => {
                let mut outcomes = Vec::with_capacity(events.len());
                for event in events {
                    outcomes.push(to_outcome(self.publish(event).await));
                }
                outcomes
            }
            BatchMode::SequentialFailFast => {
                let mut outcomes = Vec::with_capacity(events.len());
                let mut failed = false;
                for event in events {
                    if failed {
                        outcomes.push(BatchOutcome::Skipped);
                        continue;
                    }
                    let outcome = to_outcome(self.publish(event).await);
                    failed = !outcome.is_published();
                    outcomes.push(outcome);
                }
                outcomes
            }
            BatchMode::Parallel => {
                futures::stream::iter(events.iter().map(|event| self.publish(event)))
                    .buffered(self.config.max_concurrency)
                    .map(to_outcome)
                    .collect()
                    .await
            }
        };

        let result = PublishResult::new(outcomes);
        tracing::info!(
            total = result.len(),
            published = result.published_count(),
            failed = result.failed_indices().len(),
            mode = ?mode,
            "Batch publish finished"
        );
        result
    }

    async fn publish_inner(&self, event: &Event, extra: Vec<(String, String)>) -> Result<PublishAck> {
        if self.connection.config().enable_tracing {
            let span = tracing::info_span!(
                "publish",
                event_id = %event.event_id(),
                subject = %event.subject()
            );
            self.publish_with_retry(event, extra).instrument(span).await
        } else {
            self.publish_with_retry(event, extra).await
        }
    }

    async fn publish_with_retry(&self, event: &Event, extra: Vec<(String, String)>) -> Result<PublishAck> {
        let hooks = self.connection.hooks();
        let event_id = event.event_id().to_string();
        let started = Instant::now();

        let message = match self.encode(event, extra) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(event_id = %event_id, error = %e, "Event rejected before publish");
                hooks.publish_error(&event_id, &e);
                return Err(e);
            }
        };

        // Fail fast instead of queueing while the connection is down
        if let Err(e) = self.connection.current() {
            tracing::warn!(event_id = %event_id, error = %e, "Publish rejected");
            hooks.publish_error(&event_id, &e);
            return Err(e);
        }

        let max_attempts = self.config.max_retries.max(1);
        let mut attempt = 0;
        let last_error = loop {
            attempt += 1;
            match self.attempt(message.clone()).await {
                Ok(ack) => {
                    tracing::debug!(
                        event_id = %event_id,
                        subject = %message.subject,
                        stream = %ack.stream,
                        sequence = ack.sequence,
                        duplicate = ack.duplicate,
                        attempt,
                        "Event published"
                    );
                    hooks.published(&event.event_type().to_string(), &ack, attempt, started.elapsed());
                    return Ok(ack);
                }
                Err(e) if !e.is_retryable() || attempt >= max_attempts => break e,
                Err(e) => {
                    let delay = publish_retry_delay(self.config.retry_backoff_base, attempt - 1);
                    tracing::warn!(
                        event_id = %event_id,
                        subject = %message.subject,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Publish attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        let error = EventError::Publish {
            event_id: event_id.clone(),
            subject: message.subject,
            attempts: attempt,
            source: Box::new(last_error),
        };
        tracing::error!(event_id = %event_id, attempts = attempt, error = %error, "Publish failed");
        hooks.publish_error(&event_id, &error);
        Err(error)
    }

    /// One attempt against whatever transport is live right now
    async fn attempt(&self, message: OutboundMessage) -> Result<PublishAck> {
        let active = self.connection.current()?;
        let subject = message.subject.clone();
        tokio::time::timeout(self.config.publish_timeout, active.transport.publish(message))
            .await
            .map_err(|_| {
                EventError::Timeout(format!(
                    "publish to '{}' not confirmed within {:?}",
                    subject, self.config.publish_timeout
                ))
            })?
    }

    fn encode(&self, event: &Event, extra: Vec<(String, String)>) -> Result<OutboundMessage> {
        let event_id = event.event_id().to_string();
        let payload = serde_json::to_vec(event)?;

        let max = self.connection.config().max_payload_bytes;
        if payload.len() > max {
            return Err(EventError::PayloadTooLarge {
                event_id,
                size: payload.len(),
                max,
            });
        }

        let metadata = event.metadata();
        let mut headers = vec![
            ("event-id".to_string(), event_id.clone()),
            ("event-type".to_string(), event.event_type().to_string()),
            ("event-version".to_string(), event.event_version().to_string()),
            ("source-service".to_string(), metadata.source_service.clone()),
        ];
        if let Some(id) = &metadata.correlation_id {
            headers.push(("correlation-id".to_string(), id.clone()));
        }
        if let Some(id) = &metadata.causation_id {
            headers.push(("causation-id".to_string(), id.clone()));
        }
        for (name, value) in extra {
            if ENVELOPE_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                tracing::debug!(header = %name, "Ignoring caller header that shadows the envelope");
                continue;
            }
            headers.push((name, value));
        }

        Ok(OutboundMessage {
            subject: event.subject(),
            payload: Bytes::from(payload),
            msg_id: event_id,
            headers,
            timeout: self.config.publish_timeout,
        })
    }
}

fn to_outcome(result: Result<PublishAck>) -> BatchOutcome {
    match result {
        Ok(ack) => BatchOutcome::Published(ack),
        Err(e) => BatchOutcome::Failed(e),
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher").field("config", &self.config).finish()
    }
}
