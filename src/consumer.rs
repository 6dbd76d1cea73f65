//! Pull-based event consumption
//!
//! A `Consumer` runs one pull loop per durable consumer. Each pulled
//! message is decoded once, dispatched to the handler on a bounded
//! worker pool, and settled according to the [`RedeliveryPolicy`]:
//!
//! | Handler result                  | Settlement                         |
//! |---------------------------------|------------------------------------|
//! | `Ok(Outcome::Ack)`              | ack                                |
//! | `Ok(Outcome::Nak(_))`, error, panic | nak, or term at the delivery cap |
//! | `Ok(Outcome::Term(_))`          | term                               |
//!
//! Undecodable payloads and messages already past the delivery cap are
//! terminated without running the handler.

use crate::connection::{CallbackId, ConnectionManager};
use crate::config::{AckPolicy, ConsumerConfig};
use crate::error::{EventError, HandlerError, Result};
use crate::broker::RawDelivery;
use crate::redelivery::{Decision, RedeliveryPolicy, TerminalCause};
use crate::types::{ConnectionState, ConsumerState, DeliveryContext, Event, Outcome};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Processes delivered events
///
/// Returning `Err` is equivalent to `Ok(Outcome::nak())`.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        event: &Event,
        ctx: &DeliveryContext,
    ) -> std::result::Result<Outcome, HandlerError>;
}

/// Adapter turning an async closure into a [`MessageHandler`]
pub struct HandlerFn<F>(F);

/// Wrap an async closure as a handler
///
/// ```rust,ignore
/// let handler = handler_fn(|event: Event, _ctx: DeliveryContext| async move {
///     tracing::info!(event_type = %event.event_type(), "got event");
///     Ok(Outcome::Ack)
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Event, DeliveryContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Outcome, HandlerError>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(Event, DeliveryContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Outcome, HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        event: &Event,
        ctx: &DeliveryContext,
    ) -> std::result::Result<Outcome, HandlerError> {
        (self.0)(event.clone(), ctx.clone()).await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A message whose handler is running
struct InFlight {
    /// Highest delivery attempt the broker has reported
    delivery_count: u64,
    /// Most recent redelivery; the final settlement goes through it
    latest: Option<RawDelivery>,
}

type InFlightMap = Arc<Mutex<HashMap<u64, InFlight>>>;

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    callback: CallbackId,
}

/// Durable pull consumer
pub struct Consumer {
    connection: ConnectionManager,
    config: ConsumerConfig,
    policy: RedeliveryPolicy,
    state: Arc<watch::Sender<ConsumerState>>,
    in_flight: InFlightMap,
    running: Mutex<Option<Running>>,
}

impl Consumer {
    pub fn new(connection: ConnectionManager, config: ConsumerConfig) -> Result<Self> {
        config.validate()?;
        if !connection.config().enable_jetstream {
            return Err(EventError::Config(
                "consuming requires JetStream (enable_jetstream = true)".into(),
            ));
        }

        let policy = RedeliveryPolicy::new(config.max_deliver)
            .with_backoff(config.redelivery_backoff.clone());
        let (state, _) = watch::channel(ConsumerState::Idle);

        Ok(Self {
            connection,
            config,
            policy,
            state: Arc::new(state),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            running: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.durable_name
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// Messages whose handler is currently running
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Declare the durable consumer and start the pull loop
    ///
    /// The consumer is re-declared after every reconnect.
    pub async fn subscribe<H: MessageHandler>(&self, handler: H) -> Result<()> {
        if self.is_running() {
            return Err(EventError::AlreadyRunning(self.config.durable_name.clone()));
        }

        let active = self.connection.current()?;
        active.transport.declare_consumer(&self.config).await?;

        let declare = self.config.clone();
        let callback = self.connection.on_connected(move |transport| {
            let config = declare.clone();
            async move { transport.declare_consumer(&config).await }
        });

        let worker = Arc::new(Worker {
            connection: self.connection.clone(),
            config: self.config.clone(),
            policy: self.policy.clone(),
            handler: Arc::new(handler),
            state: self.state.clone(),
            in_flight: self.in_flight.clone(),
        });
        let cancel = CancellationToken::new();
        self.state.send_replace(ConsumerState::Idle);
        let handle = tokio::spawn(worker.run(cancel.clone()));

        let mut running = lock(&self.running);
        if running.is_some() {
            // Lost a race with a concurrent subscribe
            cancel.cancel();
            self.connection.remove_on_connected(callback);
            return Err(EventError::AlreadyRunning(self.config.durable_name.clone()));
        }
        *running = Some(Running {
            cancel,
            handle,
            callback,
        });

        tracing::info!(
            consumer = %self.config.durable_name,
            stream = %self.config.stream_name,
            filters = ?self.config.filter_subjects,
            batch_size = self.config.batch_size,
            workers = self.config.workers,
            "Consumer started"
        );
        Ok(())
    }

    /// Stop pulling and drain in-flight handlers
    ///
    /// No handler starts after this is called. Handlers still running
    /// after `grace_timeout` are aborted and their messages left
    /// unacknowledged for the broker to redeliver.
    pub async fn stop(&self) -> Result<()> {
        let running = lock(&self.running).take();
        let Some(running) = running else {
            return Ok(());
        };

        running.cancel.cancel();
        self.connection.remove_on_connected(running.callback);
        running.handle.await.map_err(|e| EventError::Consume {
            consumer: self.config.durable_name.clone(),
            reason: format!("pull loop ended abnormally: {}", e),
        })?;

        tracing::info!(consumer = %self.config.durable_name, "Consumer stopped");
        Ok(())
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let Some(running) = lock(&self.running).take() {
            running.cancel.cancel();
            self.connection.remove_on_connected(running.callback);
        }
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("durable_name", &self.config.durable_name)
            .field("stream", &self.config.stream_name)
            .field("state", &self.state())
            .finish()
    }
}

/// A decoded message ready for its handler
struct Job {
    event: Event,
    ctx: DeliveryContext,
    raw: RawDelivery,
}

/// State shared by the pull loop and its handler tasks
struct Worker {
    connection: ConnectionManager,
    config: ConsumerConfig,
    policy: RedeliveryPolicy,
    handler: Arc<dyn MessageHandler>,
    state: Arc<watch::Sender<ConsumerState>>,
    in_flight: InFlightMap,
}

impl Worker {
    fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.config.workers));
        let mut tasks = JoinSet::new();

        'pull: while !cancel.is_cancelled() {
            reap(&mut tasks);

            let active = match self.connection.current() {
                Ok(active) => active,
                Err(_) => {
                    self.set_state(ConsumerState::Idle);
                    if self.wait_for_connection(&cancel).await {
                        continue;
                    }
                    break;
                }
            };

            self.set_state(ConsumerState::Pulling);
            let pulled = tokio::select! {
                _ = cancel.cancelled() => break,
                pulled = active.transport.pull(
                    &self.config.stream_name,
                    &self.config.durable_name,
                    self.config.batch_size,
                    self.config.fetch_timeout,
                ) => pulled,
            };

            let batch = match pulled {
                Ok(batch) => batch,
                Err(e) => {
                    let error = EventError::Consume {
                        consumer: self.config.durable_name.clone(),
                        reason: e.to_string(),
                    };
                    tracing::warn!(error = %error, generation = active.generation, "Pull failed");
                    self.connection
                        .report_transport_failure(active.generation, error.to_string());
                    self.set_state(ConsumerState::Idle);
                    if !self.pause(&cancel).await {
                        break;
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                self.set_state(ConsumerState::Idle);
                if !self.pause(&cancel).await {
                    break;
                }
                continue;
            }

            tracing::debug!(
                consumer = %self.config.durable_name,
                count = batch.len(),
                "Pulled batch"
            );
            self.set_state(ConsumerState::Dispatching);

            for raw in batch {
                let Some(job) = self.admit(raw).await else {
                    continue;
                };

                // Remaining messages stay unacknowledged once stop is requested
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'pull,
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break 'pull,
                    },
                };

                let sequence = job.ctx.stream_sequence;
                {
                    let mut in_flight = lock(&self.in_flight);
                    if in_flight.contains_key(&sequence) {
                        continue;
                    }
                    in_flight.insert(
                        sequence,
                        InFlight {
                            delivery_count: job.ctx.delivery_count,
                            latest: None,
                        },
                    );
                }
                tasks.spawn(self.clone().process(job, permit, cancel.clone()));
            }
        }

        self.drain(tasks).await;
        self.set_state(ConsumerState::Stopped);
    }

    /// Decode and pre-check one delivery; `None` when it must not be
    /// dispatched (already settled or deliberately left alone)
    async fn admit(&self, raw: RawDelivery) -> Option<Job> {
        let consumer = &self.config.durable_name;
        let sequence = raw.stream_sequence;

        if lock(&self.in_flight).contains_key(&sequence) {
            self.defer_redelivery(raw).await;
            return None;
        }

        let event: Event = match serde_json::from_slice(&raw.payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(
                    consumer = %consumer,
                    subject = %raw.subject,
                    sequence,
                    error = %e,
                    "Undecodable message terminated"
                );
                self.settle_raw(&raw, Decision::Terminal(TerminalCause::Rejected(format!(
                    "undecodable payload: {}",
                    e
                ))), None)
                .await;
                return None;
            }
        };

        if self.config.ack_policy == AckPolicy::Explicit && self.policy.exceeded(raw.delivery_count) {
            tracing::warn!(
                consumer = %consumer,
                event_id = %event.event_id(),
                sequence,
                delivery_count = raw.delivery_count,
                max_deliver = ?self.policy.max_deliver(),
                "Message past delivery cap terminated without handling"
            );
            self.settle_raw(
                &raw,
                Decision::Terminal(TerminalCause::MaxDeliverExceeded),
                Some(&event),
            )
            .await;
            return None;
        }

        let ctx = DeliveryContext {
            consumer: consumer.clone(),
            stream: raw.stream.clone(),
            subject: raw.subject.clone(),
            stream_sequence: sequence,
            delivery_count: raw.delivery_count,
            headers: raw.headers.clone(),
        };
        Some(Job { event, ctx, raw })
    }

    /// Park a redelivery of a message whose handler is still running
    ///
    /// The broker is told the work is in progress, and the handler's
    /// eventual outcome is settled against this delivery's count.
    async fn defer_redelivery(&self, raw: RawDelivery) {
        let consumer = &self.config.durable_name;
        let sequence = raw.stream_sequence;

        if self.config.ack_policy == AckPolicy::Explicit {
            if let Err(e) = raw.acker.in_progress().await {
                tracing::debug!(
                    consumer = %consumer,
                    sequence,
                    error = %e,
                    "In-progress ack failed"
                );
            }
        }

        let mut in_flight = lock(&self.in_flight);
        match in_flight.get_mut(&sequence) {
            Some(entry) => {
                tracing::debug!(
                    consumer = %consumer,
                    sequence,
                    delivery_count = raw.delivery_count,
                    "Redelivery of an in-flight message deferred"
                );
                entry.delivery_count = entry.delivery_count.max(raw.delivery_count);
                entry.latest = Some(raw);
            }
            None => tracing::debug!(
                consumer = %consumer,
                sequence,
                "Handler finished meanwhile, redelivery dropped"
            ),
        }
    }

    async fn process(
        self: Arc<Self>,
        job: Job,
        _permit: OwnedSemaphorePermit,
        cancel: CancellationToken,
    ) {
        if self.connection.config().enable_tracing {
            let span = tracing::info_span!(
                "consume",
                consumer = %job.ctx.consumer,
                event_id = %job.event.event_id(),
                subject = %job.ctx.subject,
                sequence = job.ctx.stream_sequence,
                delivery_count = job.ctx.delivery_count,
            );
            self.handle(job, cancel).instrument(span).await
        } else {
            self.handle(job, cancel).await
        }
    }

    async fn handle(&self, job: Job, cancel: CancellationToken) {
        if cancel.is_cancelled() {
            // Stopped before this task was first polled
            lock(&self.in_flight).remove(&job.ctx.stream_sequence);
            tracing::debug!(
                consumer = %job.ctx.consumer,
                sequence = job.ctx.stream_sequence,
                "Consumer stopped, message left for redelivery"
            );
            return;
        }

        let started = Instant::now();
        let invocation = AssertUnwindSafe(self.handler.handle(&job.event, &job.ctx)).catch_unwind();

        let outcome = match invocation.await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                tracing::warn!(
                    event_id = %job.event.event_id(),
                    delivery_count = job.ctx.delivery_count,
                    error = %e,
                    "Handler failed"
                );
                Outcome::nak()
            }
            Err(_) => {
                tracing::error!(
                    event_id = %job.event.event_id(),
                    delivery_count = job.ctx.delivery_count,
                    "Handler panicked"
                );
                Outcome::nak()
            }
        };

        let sequence = job.ctx.stream_sequence;
        let (delivery_count, latest) = match lock(&self.in_flight).get_mut(&sequence) {
            Some(entry) => (entry.delivery_count, entry.latest.take()),
            None => (job.ctx.delivery_count, None),
        };
        let raw = latest.unwrap_or(job.raw);

        let decision = self.policy.decide(delivery_count.max(job.ctx.delivery_count), &outcome);
        self.settle_raw(&raw, decision, Some(&job.event)).await;
        lock(&self.in_flight).remove(&sequence);

        self.connection.hooks().consumed(
            &job.event.event_type().to_string(),
            &job.ctx.consumer,
            &outcome,
            started.elapsed(),
        );
    }

    async fn settle_raw(&self, raw: &RawDelivery, decision: Decision, event: Option<&Event>) {
        let event_id = event
            .map(|e| e.event_id().to_string())
            .or_else(|| raw.headers.get("event-id").cloned())
            .unwrap_or_else(|| format!("{}#{}", raw.stream, raw.stream_sequence));

        if self.config.ack_policy == AckPolicy::None {
            tracing::debug!(event_id = %event_id, decision = ?decision, "Outcome recorded (no acks)");
            return;
        }

        let result = match &decision {
            Decision::Ack => raw.acker.ack().await,
            Decision::Redeliver(delay) => raw.acker.nak(*delay).await,
            Decision::Terminal(TerminalCause::Rejected(reason)) => raw.acker.term(reason).await,
            Decision::Terminal(TerminalCause::MaxDeliverExceeded) => {
                tracing::warn!(
                    consumer = %self.config.durable_name,
                    event_id = %event_id,
                    delivery_count = raw.delivery_count,
                    "Delivery cap reached, message terminated"
                );
                self.connection.hooks().max_deliver_exceeded(&event_id);
                raw.acker.term("max deliver exceeded").await
            }
        };

        match result {
            Ok(()) => tracing::debug!(
                event_id = %event_id,
                sequence = raw.stream_sequence,
                decision = ?decision,
                "Message settled"
            ),
            Err(e) => tracing::warn!(
                event_id = %event_id,
                sequence = raw.stream_sequence,
                error = %e,
                "Failed to settle message; broker will redeliver"
            ),
        }
    }

    /// Sleep `idle_backoff`; false when cancelled
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.idle_backoff) => true,
        }
    }

    /// Wait for Connected; false when cancelled or the connection is closed
    async fn wait_for_connection(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.connection.watch_state();
        let state = tokio::select! {
            _ = cancel.cancelled() => return false,
            state = async {
                rx.wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Closed))
                    .await
                    .map(|s| *s)
            } => state,
        };
        matches!(state, Ok(ConnectionState::Connected))
    }

    async fn drain(&self, mut tasks: JoinSet<()>) {
        self.set_state(ConsumerState::Draining);
        if tasks.is_empty() {
            return;
        }

        let grace = self.config.grace_timeout;
        let finished = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                log_join(joined);
            }
        })
        .await;

        if finished.is_err() {
            tracing::warn!(
                consumer = %self.config.durable_name,
                abandoned = tasks.len(),
                grace_ms = grace.as_millis() as u64,
                "Grace timeout elapsed, aborting in-flight handlers"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            lock(&self.in_flight).clear();
        }
    }
}

fn reap(tasks: &mut JoinSet<()>) {
    while let Some(Some(joined)) = tasks.join_next().now_or_never() {
        log_join(joined);
    }
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if !e.is_cancelled() {
            tracing::error!(error = %e, "Handler task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::{MemoryBroker, Settlement};
    use crate::broker::AckHandle;
    use crate::config::{ClientConfig, StreamConfig};
    use crate::connection::eventually;
    use crate::hooks::{EventHooks, HookResult, Hooks};
    use crate::publisher::Publisher;
    use crate::types::EventMetadata;
    use crate::PublisherConfig;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct MaxDeliverHook {
        fired: Mutex<Vec<String>>,
    }

    impl EventHooks for MaxDeliverHook {
        fn on_max_deliver_exceeded(&self, event_id: &str) -> HookResult {
            self.fired.lock().unwrap().push(event_id.to_string());
            Ok(())
        }
    }

    struct Harness {
        broker: MemoryBroker,
        manager: ConnectionManager,
        publisher: Publisher,
        hook: Arc<MaxDeliverHook>,
    }

    async fn harness() -> Harness {
        let broker = MemoryBroker::new();
        let hook = Arc::new(MaxDeliverHook::default());
        let manager = ConnectionManager::new(
            ClientConfig {
                reconnect_jitter: false,
                streams: vec![StreamConfig::new("ORDERS", vec!["orders.*".into()])],
                ..Default::default()
            },
            Arc::new(broker.connector()),
            Hooks::new(vec![hook.clone()], false),
        );
        manager.connect().await.unwrap();
        let publisher = Publisher::new(manager.clone(), PublisherConfig::default()).unwrap();
        Harness {
            broker,
            manager,
            publisher,
            hook,
        }
    }

    fn consumer_config(max_deliver: Option<u32>) -> ConsumerConfig {
        ConsumerConfig {
            max_deliver,
            idle_backoff: Duration::from_millis(100),
            fetch_timeout: Duration::from_secs(1),
            ..ConsumerConfig::new("ORDERS", "worker").with_filter("orders.*")
        }
    }

    fn event(n: u32) -> Event {
        Event::new(
            "orders.created",
            EventMetadata::new("order-service"),
            serde_json::json!({ "order": n }),
        )
    }

    fn count_settlements(broker: &MemoryBroker, f: impl Fn(&Settlement) -> bool) -> usize {
        broker
            .settlements()
            .iter()
            .filter(|r| f(&r.settlement))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_acks() {
        let h = harness().await;
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let consumer = Consumer::new(h.manager.clone(), consumer_config(Some(3))).unwrap();
        consumer
            .subscribe(handler_fn(move |event: Event, ctx: DeliveryContext| {
                let counter = counter.clone();
                async move {
                    assert_eq!(ctx.consumer, "worker");
                    assert!(event.payload().contains_key("order"));
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Outcome::Ack)
                }
            }))
            .await
            .unwrap();

        for n in 0..3 {
            h.publisher.publish(&event(n)).await.unwrap();
        }

        assert!(eventually(Duration::from_secs(30), || seen.load(Ordering::SeqCst) == 3).await);
        assert!(
            eventually(Duration::from_secs(5), || {
                count_settlements(&h.broker, |s| *s == Settlement::Ack) == 3
            })
            .await
        );
        assert_eq!(h.broker.pending_count("ORDERS", "worker"), 0);
        consumer.stop().await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nak_then_ack_on_redelivery() {
        let h = harness().await;
        let counts = Arc::new(Mutex::new(Vec::new()));
        let seen = counts.clone();
        let consumer = Consumer::new(h.manager.clone(), consumer_config(Some(3))).unwrap();
        consumer
            .subscribe(handler_fn(move |_event: Event, ctx: DeliveryContext| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(ctx.delivery_count);
                    if ctx.delivery_count == 1 {
                        Ok(Outcome::nak())
                    } else {
                        Ok(Outcome::Ack)
                    }
                }
            }))
            .await
            .unwrap();

        h.publisher.publish(&event(1)).await.unwrap();

        assert!(eventually(Duration::from_secs(30), || counts.lock().unwrap().len() == 2).await);
        assert_eq!(*counts.lock().unwrap(), vec![1, 2]);
        assert!(
            eventually(Duration::from_secs(5), || {
                count_settlements(&h.broker, |s| *s == Settlement::Ack) == 1
            })
            .await
        );
        consumer.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_nak_bounded_by_max_deliver() {
        let h = harness().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let consumer = Consumer::new(h.manager.clone(), consumer_config(Some(3))).unwrap();
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

        let event = event(1);
        h.publisher.publish(&event).await.unwrap();

        assert!(
            eventually(Duration::from_secs(60), || {
                count_settlements(&h.broker, |s| matches!(s, Settlement::Term(_))) == 1
            })
            .await
        );
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(*h.hook.fired.lock().unwrap(), vec![event.event_id().to_string()]);
        assert_eq!(count_settlements(&h.broker, |s| matches!(s, Settlement::Nak(_))), 2);
        consumer.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_delivery_batch_of_errors() {
        let h = harness().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let config = ConsumerConfig {
            batch_size: 2,
            ..consumer_config(Some(1))
        };

        h.publisher.publish(&event(1)).await.unwrap();
        h.publisher.publish(&event(2)).await.unwrap();

        let consumer = Consumer::new(h.manager.clone(), config).unwrap();
        consumer
            .subscribe(handler_fn(move |_event: Event, _ctx: DeliveryContext| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(HandlerError::new("database unavailable"))
                }
            }))
            .await
            .unwrap();

        assert!(
            eventually(Duration::from_secs(30), || {
                count_settlements(&h.broker, |s| matches!(s, Settlement::Term(_))) == 2
            })
            .await
        );
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.hook.fired.lock().unwrap().len(), 2);
        assert_eq!(count_settlements(&h.broker, |s| matches!(s, Settlement::Nak(_))), 0);
        consumer.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_payload_terminated() {
        let h = harness().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let consumer = Consumer::new(h.manager.clone(), consumer_config(Some(3))).unwrap();
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

        h.broker.inject("orders.created", "definitely not json").unwrap();

        assert!(
            eventually(Duration::from_secs(30), || {
                count_settlements(&h.broker, |s| matches!(s, Settlement::Term(_))) == 1
            })
            .await
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(h.hook.fired.lock().unwrap().is_empty());
        consumer.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_panic_is_nak() {
        let h = harness().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let consumer = Consumer::new(h.manager.clone(), consumer_config(Some(5))).unwrap();
        consumer
            .subscribe(handler_fn(move |_event: Event, ctx: DeliveryContext| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if ctx.delivery_count == 1 {
                        panic!("handler bug");
                    }
                    Ok(Outcome::Ack)
                }
            }))
            .await
            .unwrap();

        h.publisher.publish(&event(1)).await.unwrap();

        assert!(
            eventually(Duration::from_secs(30), || {
                count_settlements(&h.broker, |s| *s == Settlement::Ack) == 1
            })
            .await
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(count_settlements(&h.broker, |s| *s == Settlement::Nak(None)), 1);
        consumer.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_term_outcome_carries_reason() {
        let h = harness().await;
        let consumer = Consumer::new(h.manager.clone(), consumer_config(Some(5))).unwrap();
        consumer
            .subscribe(handler_fn(|_event: Event, _ctx: DeliveryContext| async {
                Ok(Outcome::term("unknown course"))
            }))
            .await
            .unwrap();

        h.publisher.publish(&event(1)).await.unwrap();

        assert!(
            eventually(Duration::from_secs(30), || {
                count_settlements(&h.broker, |s| *s == Settlement::Term("unknown course".into())) == 1
            })
            .await
        );
        assert!(h.hook.fired.lock().unwrap().is_empty());
        consumer.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_in_flight_and_starts_nothing_new() {
        let h = harness().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let consumer = Consumer::new(h.manager.clone(), consumer_config(Some(3))).unwrap();

        for n in 0..5 {
            h.publisher.publish(&event(n)).await.unwrap();
        }
        consumer
            .subscribe(handler_fn(move |_event: Event, _ctx: DeliveryContext| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    Ok(Outcome::Ack)
                }
            }))
            .await
            .unwrap();

        assert!(eventually(Duration::from_secs(5), || calls.load(Ordering::SeqCst) == 1).await);
        consumer.stop().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(count_settlements(&h.broker, |s| *s == Settlement::Ack), 1);
        assert_eq!(h.broker.pending_count("ORDERS", "worker"), 4);
        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert!(!consumer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_timeout_abandons_slow_handler() {
        let h = harness().await;
        let config = ConsumerConfig {
            grace_timeout: Duration::from_secs(1),
            ..consumer_config(Some(3))
        };
        let consumer = Consumer::new(h.manager.clone(), config).unwrap();
        let started = Arc::new(AtomicUsize::new(0));
        let counter = started.clone();
        consumer
            .subscribe(handler_fn(move |_event: Event, _ctx: DeliveryContext| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Outcome::Ack)
                }
            }))
            .await
            .unwrap();

        h.publisher.publish(&event(1)).await.unwrap();
        assert!(eventually(Duration::from_secs(5), || started.load(Ordering::SeqCst) == 1).await);

        consumer.stop().await.unwrap();

        assert!(h.broker.settlements().is_empty());
        assert_eq!(h.broker.pending_count("ORDERS", "worker"), 1);
        assert_eq!(consumer.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_while_in_flight_is_skipped() {
        let h = harness().await;
        let config = ConsumerConfig {
            ack_wait: Duration::from_secs(1),
            workers: 4,
            ..consumer_config(None)
        };
        let consumer = Consumer::new(h.manager.clone(), config).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        consumer
            .subscribe(handler_fn(move |_event: Event, _ctx: DeliveryContext| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(Outcome::Ack)
                }
            }))
            .await
            .unwrap();

        h.publisher.publish(&event(1)).await.unwrap();

        assert!(
            eventually(Duration::from_secs(30), || {
                count_settlements(&h.broker, |s| *s == Settlement::Ack) == 1
            })
            .await
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        consumer.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_capped_redelivery_while_in_flight_fires_hook() {
        let h = harness().await;
        let config = ConsumerConfig {
            ack_wait: Duration::from_secs(1),
            workers: 2,
            ..consumer_config(Some(2))
        };
        let consumer = Consumer::new(h.manager.clone(), config).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        consumer
            .subscribe(handler_fn(move |_event: Event, _ctx: DeliveryContext| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    Ok(Outcome::nak())
                }
            }))
            .await
            .unwrap();

        let event = event(1);
        h.publisher.publish(&event).await.unwrap();

        // The second delivery arrived mid-handler; the nak lands on the last attempt
        assert!(eventually(Duration::from_secs(30), || !h.hook.fired.lock().unwrap().is_empty()).await);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*h.hook.fired.lock().unwrap(), vec![event.event_id().to_string()]);
        assert_eq!(count_settlements(&h.broker, |s| matches!(s, Settlement::Nak(_))), 0);
        assert_eq!(h.broker.pending_count("ORDERS", "worker"), 0);
        consumer.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_handler_starts_after_stop() {
        let h = harness().await;
        let config = ConsumerConfig {
            batch_size: 64,
            workers: 64,
            ..consumer_config(Some(3))
        };
        for n in 0..64 {
            h.publisher.publish(&event(n)).await.unwrap();
        }

        let consumer = Arc::new(Consumer::new(h.manager.clone(), config).unwrap());
        let slot: Arc<std::sync::OnceLock<Arc<Consumer>>> = Arc::new(std::sync::OnceLock::new());
        assert!(slot.set(consumer.clone()).is_ok());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let stopper = slot.clone();
        consumer
            .subscribe(handler_fn(move |_event: Event, _ctx: DeliveryContext| {
                let counter = counter.clone();
                let stopper = stopper.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    // Cancels synchronously; sibling tasks are already spawned
                    if let Some(consumer) = stopper.get() {
                        let _ = consumer.stop().now_or_never();
                    }
                    Ok(Outcome::Ack)
                }
            }))
            .await
            .unwrap();

        let mut state = consumer.watch_state();
        tokio::time::timeout(
            Duration::from_secs(10),
            state.wait_for(|s| *s == ConsumerState::Stopped),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(consumer.in_flight(), 0);
        assert_eq!(count_settlements(&h.broker, |s| *s == Settlement::Ack), 1);
        assert_eq!(h.broker.settlements().len(), 1);
        assert_eq!(h.broker.pending_count("ORDERS", "worker"), 63);
        assert!(!consumer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_policy_none_sends_no_settlements() {
        let h = harness().await;
        let config = ConsumerConfig {
            ack_policy: AckPolicy::None,
            ..consumer_config(Some(1))
        };
        let consumer = Consumer::new(h.manager.clone(), config).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        consumer
            .subscribe(handler_fn(move |_event: Event, _ctx: DeliveryContext| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(HandlerError::new("ignored"))
                }
            }))
            .await
            .unwrap();

        h.publisher.publish(&event(1)).await.unwrap();
        assert!(eventually(Duration::from_secs(10), || calls.load(Ordering::SeqCst) == 1).await);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(h.broker.settlements().is_empty());
        assert!(h.hook.fired.lock().unwrap().is_empty());
        consumer.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumes_after_reconnect() {
        let h = harness().await;
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let consumer = Consumer::new(h.manager.clone(), consumer_config(Some(3))).unwrap();
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

        h.broker.drop_connections();
        assert!(eventually(Duration::from_secs(60), || h.manager.generation() == 2).await);
        h.publisher.publish(&event(1)).await.unwrap();

        assert!(eventually(Duration::from_secs(30), || seen.load(Ordering::SeqCst) == 1).await);
        consumer.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_failure_triggers_reconnect() {
        let h = harness().await;
        let consumer = Consumer::new(h.manager.clone(), consumer_config(Some(3))).unwrap();
        consumer
            .subscribe(handler_fn(|_event: Event, _ctx: DeliveryContext| async { Ok(Outcome::Ack) }))
            .await
            .unwrap();

        h.broker.fail_next_pulls(1);

        assert!(eventually(Duration::from_secs(60), || h.manager.generation() == 2).await);
        assert!(consumer.is_running());
        consumer.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_subscribe_rejected() {
        let h = harness().await;
        let consumer = Consumer::new(h.manager.clone(), consumer_config(Some(3))).unwrap();
        let handler = || handler_fn(|_event: Event, _ctx: DeliveryContext| async { Ok(Outcome::Ack) });

        consumer.subscribe(handler()).await.unwrap();
        assert!(matches!(
            consumer.subscribe(handler()).await,
            Err(EventError::AlreadyRunning(_))
        ));
        consumer.stop().await.unwrap();

        // Restartable after stop
        consumer.subscribe(handler()).await.unwrap();
        consumer.stop().await.unwrap();
    }

    struct RecordingAck(Arc<Mutex<Vec<&'static str>>>);

    #[async_trait]
    impl AckHandle for RecordingAck {
        async fn ack(&self) -> Result<()> {
            self.0.lock().unwrap().push("ack");
            Ok(())
        }

        async fn nak(&self, _delay: Option<Duration>) -> Result<()> {
            self.0.lock().unwrap().push("nak");
            Ok(())
        }

        async fn term(&self, _reason: &str) -> Result<()> {
            self.0.lock().unwrap().push("term");
            Ok(())
        }

        async fn in_progress(&self) -> Result<()> {
            self.0.lock().unwrap().push("in_progress");
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_past_cap_delivery_terminated_without_handler() {
        let h = harness().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let worker = Worker {
            connection: h.manager.clone(),
            config: consumer_config(Some(2)),
            policy: RedeliveryPolicy::new(Some(2)),
            handler: Arc::new(handler_fn(move |_event: Event, _ctx: DeliveryContext| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Outcome::Ack)
                }
            })),
            state: Arc::new(watch::channel(ConsumerState::Idle).0),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        };
        let settled = Arc::new(Mutex::new(Vec::new()));
        let event = event(1);
        let raw = RawDelivery {
            subject: "orders.created".into(),
            payload: Bytes::from(serde_json::to_vec(&event).unwrap()),
            headers: HashMap::new(),
            stream: "ORDERS".into(),
            stream_sequence: 7,
            delivery_count: 3,
            acker: Box::new(RecordingAck(settled.clone())),
        };

        assert!(worker.admit(raw).await.is_none());

        assert_eq!(*settled.lock().unwrap(), vec!["term"]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(*h.hook.fired.lock().unwrap(), vec![event.event_id().to_string()]);
    }
}
