//! In-memory broker
//!
//! Implements streams, durable pull consumers with ack-wait driven
//! redelivery, a per-stream duplicate window and a delivery cap, all in
//! process. Fault injection (unreachable broker, failing publishes and
//! pulls, dropped connections) makes it the backend for exercising the
//! client's resilience paths.

use super::{
    subject_matches, AckHandle, Connector, OutboundMessage, RawDelivery, Transport,
    TransportEvent, TransportEvents,
};
use crate::config::{AckPolicy, ClientConfig, ConsumerConfig, DeliverPolicy, StreamConfig};
use crate::error::{EventError, Result};
use crate::types::PublishAck;
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::time::Instant;

/// How a delivered message was settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nak(Option<Duration>),
    Term(String),
}

/// A settlement recorded by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRecord {
    pub stream: String,
    pub consumer: String,
    pub sequence: u64,
    pub settlement: Settlement,
}

/// A stored message
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub subject: String,
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
    published_ms: u64,
}

struct MemConsumer {
    config: ConsumerConfig,
    /// Highest stream sequence handed out as a first delivery
    cursor: u64,
    /// Delivery attempts per sequence, for messages not yet settled
    deliveries: HashMap<u64, u64>,
    /// Unsettled sequence → time it becomes deliverable again
    pending: BTreeMap<u64, Instant>,
    /// Never delivered: superseded on their subject when the consumer was created
    skipped: HashSet<u64>,
}

struct MemStream {
    config: StreamConfig,
    messages: BTreeMap<u64, StoredMessage>,
    last_sequence: u64,
    dedup: HashMap<String, (u64, Instant)>,
    consumers: HashMap<String, MemConsumer>,
}

#[derive(Default)]
struct Faults {
    unreachable: bool,
    fail_connects: u32,
    fail_publishes: u32,
    fail_pulls: u32,
    publish_jitter: Option<Duration>,
}

struct Connection {
    alive: Arc<AtomicBool>,
    events: TransportEvents,
}

#[derive(Default)]
struct BrokerState {
    streams: HashMap<String, MemStream>,
    connections: HashMap<u64, Connection>,
    faults: Faults,
    settlements: Vec<SettlementRecord>,
    publish_attempts: u64,
    connect_attempts: u64,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    notify: Notify,
    next_connection: AtomicU64,
}

/// Shared in-memory broker; clones refer to the same broker
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    /// Connector that opens transports to this broker
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A poisoned lock only means a test thread panicked mid-update
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Fault injection ──────────────────────────────────────────

    /// Refuse (or accept again) new connections
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().faults.unreachable = !reachable;
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.lock().faults.fail_connects = n;
    }

    pub fn fail_next_publishes(&self, n: u32) {
        self.lock().faults.fail_publishes = n;
    }

    pub fn fail_next_pulls(&self, n: u32) {
        self.lock().faults.fail_pulls = n;
    }

    /// Delay each publish by a random amount up to `max` before storing
    pub fn set_publish_jitter(&self, max: Option<Duration>) {
        self.lock().faults.publish_jitter = max;
    }

    /// Kill every open connection, as a broker restart would
    pub fn drop_connections(&self) {
        let connections: Vec<Connection> = {
            let mut state = self.lock();
            state.connections.drain().map(|(_, c)| c).collect()
        };
        for conn in connections {
            conn.alive.store(false, Ordering::SeqCst);
            let _ = conn.events.send(TransportEvent::Disconnected {
                reason: "broker closed the connection".to_string(),
            });
        }
        self.inner.notify.notify_waiters();
    }

    // ── Inspection ───────────────────────────────────────────────

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn connect_attempts(&self) -> u64 {
        self.lock().connect_attempts
    }

    /// Publish requests that reached the broker, including failed ones
    pub fn publish_attempts(&self) -> u64 {
        self.lock().publish_attempts
    }

    pub fn has_stream(&self, name: &str) -> bool {
        self.lock().streams.contains_key(name)
    }

    pub fn has_consumer(&self, stream: &str, consumer: &str) -> bool {
        self.lock()
            .streams
            .get(stream)
            .is_some_and(|s| s.consumers.contains_key(consumer))
    }

    pub fn message_count(&self, stream: &str) -> usize {
        self.lock()
            .streams
            .get(stream)
            .map_or(0, |s| s.messages.len())
    }

    pub fn message(&self, stream: &str, sequence: u64) -> Option<StoredMessage> {
        self.lock()
            .streams
            .get(stream)
            .and_then(|s| s.messages.get(&sequence).cloned())
    }

    /// Unsettled messages of a consumer
    pub fn pending_count(&self, stream: &str, consumer: &str) -> usize {
        self.lock()
            .streams
            .get(stream)
            .and_then(|s| s.consumers.get(consumer))
            .map_or(0, |c| c.pending.len())
    }

    pub fn settlements(&self) -> Vec<SettlementRecord> {
        self.lock().settlements.clone()
    }

    /// Store a message directly, bypassing any connection
    pub fn inject(&self, subject: &str, payload: impl Into<Bytes>) -> Result<u64> {
        let mut state = self.lock();
        let stream = find_stream(&mut state.streams, subject)?;
        let seq = stream.append(subject, payload.into(), HashMap::new());
        drop(state);
        self.inner.notify.notify_waiters();
        Ok(seq)
    }

    // ── Broker operations ────────────────────────────────────────

    fn ensure_alive(alive: &AtomicBool) -> Result<()> {
        if alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EventError::Transport("connection closed".to_string()))
        }
    }

    async fn publish(&self, alive: &AtomicBool, message: OutboundMessage) -> Result<PublishAck> {
        let jitter = {
            let mut state = self.lock();
            Self::ensure_alive(alive)?;
            state.publish_attempts += 1;
            if state.faults.fail_publishes > 0 {
                state.faults.fail_publishes -= 1;
                return Err(EventError::Transport("injected publish failure".to_string()));
            }
            state.faults.publish_jitter
        };

        if let Some(max) = jitter {
            let ms = rand::thread_rng().gen_range(0..=max.as_millis() as u64);
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        let ack = {
            let mut state = self.lock();
            Self::ensure_alive(alive)?;
            let stream = find_stream(&mut state.streams, &message.subject)?;
            let now = Instant::now();
            let window = Duration::from_secs(stream.config.duplicate_window_seconds);
            stream.dedup.retain(|_, (_, at)| now.duration_since(*at) < window);

            if let Some((seq, _)) = stream.dedup.get(&message.msg_id) {
                PublishAck {
                    stream: stream.config.name.clone(),
                    sequence: *seq,
                    duplicate: true,
                }
            } else {
                let headers = message.headers.into_iter().collect();
                let seq = stream.append(&message.subject, message.payload, headers);
                if !window.is_zero() {
                    stream.dedup.insert(message.msg_id, (seq, now));
                }
                PublishAck {
                    stream: stream.config.name.clone(),
                    sequence: seq,
                    duplicate: false,
                }
            }
        };

        self.inner.notify.notify_waiters();
        Ok(ack)
    }

    async fn pull(
        &self,
        alive: &Arc<AtomicBool>,
        stream_name: &str,
        consumer_name: &str,
        batch_size: usize,
        timeout: Duration,
    ) -> Result<Vec<RawDelivery>> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);

            let next_due = {
                let mut state = self.lock();
                Self::ensure_alive(alive)?;
                if state.faults.fail_pulls > 0 {
                    state.faults.fail_pulls -= 1;
                    return Err(EventError::Transport("injected pull failure".to_string()));
                }

                let stream = state.streams.get_mut(stream_name).ok_or_else(|| {
                    EventError::Stream(format!("stream '{}' not found", stream_name))
                })?;
                let batch = stream.take_batch(consumer_name, batch_size)?;
                if !batch.is_empty() {
                    return Ok(batch
                        .into_iter()
                        .map(|(seq, count, msg)| RawDelivery {
                            subject: msg.subject,
                            payload: msg.payload,
                            headers: msg.headers,
                            stream: stream_name.to_string(),
                            stream_sequence: seq,
                            delivery_count: count,
                            acker: Box::new(MemoryAck {
                                broker: self.clone(),
                                alive: alive.clone(),
                                stream: stream_name.to_string(),
                                consumer: consumer_name.to_string(),
                                sequence: seq,
                            }),
                        })
                        .collect());
                }
                stream
                    .consumers
                    .get(consumer_name)
                    .and_then(|c| c.pending.values().min().copied())
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let wake = next_due.map_or(deadline, |due| due.min(deadline)).max(now);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    fn settle(
        &self,
        alive: &AtomicBool,
        stream_name: &str,
        consumer_name: &str,
        sequence: u64,
        settlement: Settlement,
    ) -> Result<()> {
        let mut state = self.lock();
        if !alive.load(Ordering::SeqCst) {
            return Err(EventError::Ack("connection closed".to_string()));
        }

        let consumer = state
            .streams
            .get_mut(stream_name)
            .and_then(|s| s.consumers.get_mut(consumer_name))
            .ok_or_else(|| EventError::Ack(format!("consumer '{}' not found", consumer_name)))?;

        if !consumer.pending.contains_key(&sequence) {
            return Err(EventError::Ack(format!(
                "message {} is not pending for consumer '{}'",
                sequence, consumer_name
            )));
        }

        match &settlement {
            Settlement::Ack | Settlement::Term(_) => {
                consumer.pending.remove(&sequence);
                consumer.deliveries.remove(&sequence);
            }
            Settlement::Nak(delay) => {
                let due = Instant::now() + delay.unwrap_or(Duration::ZERO);
                consumer.pending.insert(sequence, due);
            }
        }

        state.settlements.push(SettlementRecord {
            stream: stream_name.to_string(),
            consumer: consumer_name.to_string(),
            sequence,
            settlement,
        });
        drop(state);
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Restart the ack-wait timer of a pending message
    fn progress(
        &self,
        alive: &AtomicBool,
        stream_name: &str,
        consumer_name: &str,
        sequence: u64,
    ) -> Result<()> {
        let mut state = self.lock();
        if !alive.load(Ordering::SeqCst) {
            return Err(EventError::Ack("connection closed".to_string()));
        }

        let consumer = state
            .streams
            .get_mut(stream_name)
            .and_then(|s| s.consumers.get_mut(consumer_name))
            .ok_or_else(|| EventError::Ack(format!("consumer '{}' not found", consumer_name)))?;

        let ack_wait = consumer.config.ack_wait;
        match consumer.pending.get_mut(&sequence) {
            Some(due) => {
                *due = Instant::now() + ack_wait;
                Ok(())
            }
            None => Err(EventError::Ack(format!(
                "message {} is not pending for consumer '{}'",
                sequence, consumer_name
            ))),
        }
    }
}

fn find_stream<'a>(
    streams: &'a mut HashMap<String, MemStream>,
    subject: &str,
) -> Result<&'a mut MemStream> {
    streams
        .values_mut()
        .find(|s| s.config.subjects.iter().any(|p| subject_matches(p, subject)))
        .ok_or_else(|| EventError::Stream(format!("no stream captures subject '{}'", subject)))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl MemStream {
    fn new(config: StreamConfig) -> Self {
        Self {
            config,
            messages: BTreeMap::new(),
            last_sequence: 0,
            dedup: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    fn append(&mut self, subject: &str, payload: Bytes, headers: HashMap<String, String>) -> u64 {
        self.last_sequence += 1;
        self.messages.insert(
            self.last_sequence,
            StoredMessage {
                subject: subject.to_string(),
                payload,
                headers,
                published_ms: now_millis(),
            },
        );
        self.last_sequence
    }

    fn start_cursor(&self, policy: &DeliverPolicy) -> u64 {
        match policy {
            DeliverPolicy::All | DeliverPolicy::LastPerSubject => 0,
            DeliverPolicy::New => self.last_sequence,
            DeliverPolicy::Last => self.last_sequence.saturating_sub(1),
            DeliverPolicy::ByStartSequence { sequence } => sequence.saturating_sub(1),
            DeliverPolicy::ByStartTime { timestamp } => self
                .messages
                .iter()
                .find(|(_, m)| m.published_ms >= *timestamp)
                .map_or(self.last_sequence, |(seq, _)| seq - 1),
        }
    }

    /// Sequences that a later message on the same subject replaces
    fn superseded(&self) -> HashSet<u64> {
        let mut last: HashMap<&str, u64> = HashMap::new();
        for (seq, msg) in &self.messages {
            last.insert(msg.subject.as_str(), *seq);
        }
        self.messages
            .iter()
            .filter(|(seq, msg)| last.get(msg.subject.as_str()) != Some(*seq))
            .map(|(seq, _)| *seq)
            .collect()
    }

    /// Redeliveries that are due come first, then new messages
    fn take_batch(
        &mut self,
        consumer_name: &str,
        batch_size: usize,
    ) -> Result<Vec<(u64, u64, StoredMessage)>> {
        let consumer = self.consumers.get_mut(consumer_name).ok_or_else(|| {
            EventError::Consumer(format!("consumer '{}' not found", consumer_name))
        })?;
        let now = Instant::now();
        let max_deliver = consumer.config.max_deliver.map(u64::from);
        let explicit = consumer.config.ack_policy == AckPolicy::Explicit;
        let ack_wait = consumer.config.ack_wait;
        let mut batch = Vec::new();

        let due: Vec<u64> = consumer
            .pending
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in due {
            if batch.len() >= batch_size {
                break;
            }
            let count = consumer.deliveries.get(&seq).copied().unwrap_or(0);
            let Some(msg) = self.messages.get(&seq) else {
                consumer.pending.remove(&seq);
                consumer.deliveries.remove(&seq);
                continue;
            };
            if max_deliver.is_some_and(|max| count >= max) {
                // Delivery cap reached: the broker stops redelivering
                consumer.pending.remove(&seq);
                consumer.deliveries.remove(&seq);
                continue;
            }
            consumer.deliveries.insert(seq, count + 1);
            consumer.pending.insert(seq, now + ack_wait);
            batch.push((seq, count + 1, msg.clone()));
        }

        let fresh: Vec<u64> = self
            .messages
            .range(consumer.cursor + 1..)
            .filter(|(seq, _)| !consumer.skipped.contains(*seq))
            .filter(|(_, m)| {
                consumer.config.filter_subjects.is_empty()
                    || consumer
                        .config
                        .filter_subjects
                        .iter()
                        .any(|p| subject_matches(p, &m.subject))
            })
            .map(|(seq, _)| *seq)
            .take(batch_size.saturating_sub(batch.len()))
            .collect();
        let scanned_to = if batch.len() + fresh.len() < batch_size {
            self.last_sequence
        } else {
            fresh.last().copied().unwrap_or(consumer.cursor)
        };
        for seq in fresh {
            if let Some(msg) = self.messages.get(&seq) {
                if explicit {
                    consumer.deliveries.insert(seq, 1);
                    consumer.pending.insert(seq, now + ack_wait);
                }
                batch.push((seq, 1, msg.clone()));
            }
        }
        consumer.cursor = consumer.cursor.max(scanned_to);

        Ok(batch)
    }
}

/// Opens `MemoryTransport`s to a `MemoryBroker`
#[derive(Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        _config: &ClientConfig,
        events: TransportEvents,
    ) -> Result<Arc<dyn Transport>> {
        let mut state = self.broker.lock();
        state.connect_attempts += 1;
        if state.faults.unreachable {
            return Err(EventError::Connection("broker unreachable".to_string()));
        }
        if state.faults.fail_connects > 0 {
            state.faults.fail_connects -= 1;
            return Err(EventError::Connection("injected connect failure".to_string()));
        }

        let id = self.broker.inner.next_connection.fetch_add(1, Ordering::SeqCst);
        let alive = Arc::new(AtomicBool::new(true));
        state.connections.insert(
            id,
            Connection {
                alive: alive.clone(),
                events,
            },
        );

        Ok(Arc::new(MemoryTransport {
            broker: self.broker.clone(),
            id,
            alive,
        }))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// One connection to a `MemoryBroker`
pub struct MemoryTransport {
    broker: MemoryBroker,
    id: u64,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, message: OutboundMessage) -> Result<PublishAck> {
        self.broker.publish(&self.alive, message).await
    }

    async fn pull(
        &self,
        stream: &str,
        consumer: &str,
        batch_size: usize,
        timeout: Duration,
    ) -> Result<Vec<RawDelivery>> {
        self.broker
            .pull(&self.alive, stream, consumer, batch_size, timeout)
            .await
    }

    async fn declare_stream(&self, config: &StreamConfig) -> Result<()> {
        let mut state = self.broker.lock();
        MemoryBroker::ensure_alive(&self.alive)?;
        match state.streams.get_mut(&config.name) {
            Some(existing) => existing.config = config.clone(),
            None => {
                state
                    .streams
                    .insert(config.name.clone(), MemStream::new(config.clone()));
            }
        }
        Ok(())
    }

    async fn declare_consumer(&self, config: &ConsumerConfig) -> Result<()> {
        let mut state = self.broker.lock();
        MemoryBroker::ensure_alive(&self.alive)?;
        let stream = state.streams.get_mut(&config.stream_name).ok_or_else(|| {
            EventError::Consumer(format!(
                "cannot create consumer '{}': stream '{}' not found",
                config.durable_name, config.stream_name
            ))
        })?;

        if let Some(existing) = stream.consumers.get_mut(&config.durable_name) {
            existing.config = config.clone();
        } else {
            let cursor = stream.start_cursor(&config.deliver_policy);
            let skipped = match config.deliver_policy {
                DeliverPolicy::LastPerSubject => stream.superseded(),
                _ => HashSet::new(),
            };
            stream.consumers.insert(
                config.durable_name.clone(),
                MemConsumer {
                    config: config.clone(),
                    cursor,
                    deliveries: HashMap::new(),
                    pending: BTreeMap::new(),
                    skipped,
                },
            );
        }
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        MemoryBroker::ensure_alive(&self.alive)
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.broker.lock().connections.remove(&self.id);
        self.broker.inner.notify.notify_waiters();
    }

    fn server(&self) -> String {
        format!("memory://{}", self.id)
    }
}

struct MemoryAck {
    broker: MemoryBroker,
    alive: Arc<AtomicBool>,
    stream: String,
    consumer: String,
    sequence: u64,
}

#[async_trait]
impl AckHandle for MemoryAck {
    async fn ack(&self) -> Result<()> {
        self.broker.settle(
            &self.alive,
            &self.stream,
            &self.consumer,
            self.sequence,
            Settlement::Ack,
        )
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<()> {
        self.broker.settle(
            &self.alive,
            &self.stream,
            &self.consumer,
            self.sequence,
            Settlement::Nak(delay),
        )
    }

    async fn term(&self, reason: &str) -> Result<()> {
        self.broker.settle(
            &self.alive,
            &self.stream,
            &self.consumer,
            self.sequence,
            Settlement::Term(reason.to_string()),
        )
    }

    async fn in_progress(&self) -> Result<()> {
        self.broker
            .progress(&self.alive, &self.stream, &self.consumer, self.sequence)
    }
}
