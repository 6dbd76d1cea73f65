//! Connection management
//!
//! `ConnectionManager` owns the single logical broker connection. It
//! connects with a bounded number of retries, declares the configured
//! streams on every (re)connect, and runs one coordinator task that
//! listens for transport failures and reconnects with exponential
//! backoff.
//!
//! Engines never cache the transport: they call [`ConnectionManager::current`]
//! on every attempt, so a reconnect is picked up transparently. Every
//! successful connect bumps a generation number; failure reports carry the
//! generation they observed and stale reports are ignored.

use crate::backoff::ExponentialBackoff;
use crate::broker::{Connector, Transport, TransportEvent};
use crate::config::ClientConfig;
use crate::error::{EventError, Result};
use crate::hooks::Hooks;
use crate::types::ConnectionState;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The live transport and the generation it belongs to
#[derive(Clone)]
pub struct ActiveTransport {
    pub transport: Arc<dyn Transport>,
    pub generation: u64,
}

impl std::fmt::Debug for ActiveTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveTransport")
            .field("server", &self.transport.server())
            .field("generation", &self.generation)
            .finish()
    }
}

/// Identifies a registered on-connected callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

type ConnectedCallback = Arc<dyn Fn(Arc<dyn Transport>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct Failure {
    generation: u64,
    reason: String,
}

struct Inner {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    hooks: Hooks,
    state: watch::Sender<ConnectionState>,
    current: RwLock<Option<ActiveTransport>>,
    generation: AtomicU64,
    reconnect_attempts: AtomicU32,
    last_error: Mutex<Option<String>>,
    callbacks: Mutex<Vec<(CallbackId, ConnectedCallback)>>,
    next_callback: AtomicU64,
    failures: mpsc::UnboundedSender<Failure>,
    failures_rx: Mutex<Option<mpsc::UnboundedReceiver<Failure>>>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
    lifecycle: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns the broker connection and its reconnection
///
/// Cloning is cheap; clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>, hooks: Hooks) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (failures, failures_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                hooks,
                state,
                current: RwLock::new(None),
                generation: AtomicU64::new(0),
                reconnect_attempts: AtomicU32::new(0),
                last_error: Mutex::new(None),
                callbacks: Mutex::new(Vec::new()),
                next_callback: AtomicU64::new(1),
                failures,
                failures_rx: Mutex::new(Some(failures_rx)),
                coordinator: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn hooks(&self) -> &Hooks {
        &self.inner.hooks
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Subscribe to state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Generation of the current (or last) transport; 0 before the first connect
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Failed attempts in the current reconnect cycle
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.inner.last_error).clone()
    }

    /// The live transport, or `NotConnected` unless the state is Connected
    pub fn current(&self) -> Result<ActiveTransport> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(EventError::NotConnected { state });
        }
        self.inner
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(EventError::NotConnected { state })
    }

    /// Connected and the transport answers a liveness check
    pub async fn health(&self) -> bool {
        match self.current() {
            Ok(active) => active.transport.health().await.is_ok(),
            Err(_) => false,
        }
    }

    /// Wait until the state is Connected
    ///
    /// Fails with `Closed` if the manager is closed first, or with
    /// `Connection` if reconnection gives up.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut rx = self.watch_state();
        let state = rx
            .wait_for(|s| {
                matches!(
                    s,
                    ConnectionState::Connected | ConnectionState::Closed | ConnectionState::Disconnected
                )
            })
            .await
            .map(|s| *s)
            .map_err(|_| EventError::Closed("connection manager dropped".into()))?;

        match state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closed => Err(EventError::Closed("connection closed".into())),
            _ => Err(EventError::Connection(
                self.last_error().unwrap_or_else(|| "not connected".into()),
            )),
        }
    }

    /// Register a callback run with the new transport after every
    /// successful connect, before the state becomes Connected
    ///
    /// Callback failures are logged and do not fail the connection.
    pub fn on_connected<F, Fut>(&self, callback: F) -> CallbackId
    where
        F: Fn(Arc<dyn Transport>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let id = CallbackId(self.inner.next_callback.fetch_add(1, Ordering::SeqCst));
        let callback: ConnectedCallback =
            Arc::new(move |t: Arc<dyn Transport>| -> BoxFuture<'static, Result<()>> {
                Box::pin(callback(t))
            });
        lock(&self.inner.callbacks).push((id, callback));
        id
    }

    pub fn remove_on_connected(&self, id: CallbackId) {
        lock(&self.inner.callbacks).retain(|(cid, _)| *cid != id);
    }

    /// Report that an operation on the transport of `generation` failed
    ///
    /// Reports for an older generation, or while not Connected, are ignored.
    pub fn report_transport_failure(&self, generation: u64, reason: impl Into<String>) {
        let _ = self.inner.failures.send(Failure {
            generation,
            reason: reason.into(),
        });
    }

    /// Establish the connection
    ///
    /// Retries up to `connect_retries` times with the reconnect backoff.
    /// A no-op when already Connected.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;

        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Closed => return Err(EventError::Closed("connection closed".into())),
            ConnectionState::Reconnecting => {
                return Err(EventError::NotConnected {
                    state: ConnectionState::Reconnecting,
                })
            }
            ConnectionState::Disconnected | ConnectionState::Connecting => {}
        }

        self.inner.config.validate()?;
        self.set_state(ConnectionState::Connecting);

        let retries = self.inner.config.connect_retries.max(1);
        let backoff = self.backoff();
        let mut last_error = None;

        for attempt in 0..retries {
            if attempt > 0 {
                let delay = backoff.delay(attempt - 1);
                tokio::select! {
                    _ = self.inner.shutdown.cancelled() => {
                        return Err(EventError::Closed("connection closed".into()));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self.establish().await {
                Ok(()) => {
                    self.start_coordinator();
                    return Ok(());
                }
                Err(EventError::Closed(reason)) => return Err(EventError::Closed(reason)),
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = retries,
                        error = %e,
                        "Connect attempt failed"
                    );
                    self.record_error(&e);
                    self.inner.hooks.connection_error(attempt + 1, &e);
                    last_error = Some(e);
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        let reason = last_error.map_or_else(|| "no attempt made".to_string(), |e| e.to_string());
        tracing::error!(attempts = retries, error = %reason, "Failed to connect");
        Err(EventError::Connection(format!(
            "failed to connect after {} attempt(s): {}",
            retries, reason
        )))
    }

    /// Close the connection; the manager cannot be reused afterwards
    ///
    /// Stops the coordinator (including an in-flight reconnect) and
    /// releases the transport.
    pub async fn disconnect(&self) {
        self.inner.shutdown.cancel();
        let _guard = self.inner.lifecycle.lock().await;

        let coordinator = lock(&self.inner.coordinator).take();
        if let Some(handle) = coordinator {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Connection coordinator ended abnormally");
            }
        }

        let active = self.take_transport();
        let was = self.state();
        self.set_state(ConnectionState::Closed);

        if let Some(active) = active {
            active.transport.close().await;
        }
        if was != ConnectionState::Closed {
            self.inner.hooks.disconnect("client closed");
            tracing::info!("Disconnected from broker");
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.inner.config.reconnect_base(), self.inner.config.reconnect_max())
            .with_jitter(self.inner.config.reconnect_jitter)
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Connection state changed");
        }
    }

    fn record_error(&self, error: &EventError) {
        *lock(&self.inner.last_error) = Some(error.to_string());
    }

    fn take_transport(&self) -> Option<ActiveTransport> {
        self.inner
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Open a transport, declare streams, run callbacks, then publish it
    async fn establish(&self) -> Result<()> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let transport = tokio::time::timeout(
            self.inner.config.connect_timeout(),
            self.inner.connector.connect(&self.inner.config, events_tx),
        )
        .await
        .map_err(|_| {
            EventError::Connection(format!(
                "connect timed out after {}s",
                self.inner.config.connect_timeout_secs
            ))
        })??;

        if self.inner.shutdown.is_cancelled() {
            transport.close().await;
            return Err(EventError::Closed("connection closed during connect".into()));
        }

        if self.inner.config.enable_jetstream {
            for stream in &self.inner.config.streams {
                if let Err(e) = transport.declare_stream(stream).await {
                    tracing::warn!(stream = %stream.name, error = %e, "Failed to declare stream");
                }
            }
        }

        let callbacks: Vec<ConnectedCallback> = lock(&self.inner.callbacks)
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            if let Err(e) = callback(transport.clone()).await {
                tracing::warn!(error = %e, "On-connected callback failed");
            }
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self
            .inner
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(ActiveTransport {
            transport: transport.clone(),
            generation,
        });

        let failures = self.inner.failures.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events_rx.recv() => match event {
                        Some(TransportEvent::Disconnected { reason }) => {
                            let _ = failures.send(Failure { generation, reason });
                            break;
                        }
                        Some(TransportEvent::Error(e)) => {
                            tracing::warn!(generation, error = %e, "Transport reported an error");
                        }
                        None => break,
                    }
                }
            }
        });

        self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);

        let server = transport.server();
        tracing::info!(
            server = %server,
            generation,
            backend = self.inner.connector.name(),
            "Connected to broker"
        );
        self.inner.hooks.connect(&server);
        Ok(())
    }

    fn start_coordinator(&self) {
        let Some(mut failures) = lock(&self.inner.failures_rx).take() else {
            return;
        };
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.inner.shutdown.cancelled() => break,
                    failure = failures.recv() => {
                        let Some(failure) = failure else { break };
                        manager.handle_failure(failure).await;
                    }
                }
            }
        });
        *lock(&self.inner.coordinator) = Some(handle);
    }

    async fn handle_failure(&self, failure: Failure) {
        if failure.generation != self.generation() || self.state() != ConnectionState::Connected {
            tracing::debug!(
                generation = failure.generation,
                current = self.generation(),
                "Ignoring stale transport failure"
            );
            return;
        }

        tracing::warn!(reason = %failure.reason, generation = failure.generation, "Connection lost");
        self.set_state(ConnectionState::Reconnecting);
        if let Some(old) = self.take_transport() {
            old.transport.close().await;
        }
        *lock(&self.inner.last_error) = Some(failure.reason.clone());
        self.inner.hooks.disconnect(&failure.reason);

        self.reconnect().await;
    }

    async fn reconnect(&self) {
        let max_attempts = self.inner.config.max_reconnect_attempts;
        let backoff = self.backoff();
        self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
        let mut attempt: u32 = 0;

        loop {
            if max_attempts != 0 && attempt >= max_attempts {
                let error = EventError::Connection(format!(
                    "reconnect failed after {} attempt(s): {}",
                    attempt,
                    self.last_error().unwrap_or_default()
                ));
                tracing::error!(attempts = attempt, error = %error, "Giving up on reconnection");
                self.record_error(&error);
                self.set_state(ConnectionState::Disconnected);
                self.inner.hooks.fatal(&error);
                return;
            }

            let delay = backoff.delay(attempt);
            self.inner.hooks.reconnect_attempt(attempt + 1, delay);
            tracing::info!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting"
            );

            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.establish().await {
                Ok(()) => {
                    tracing::info!(attempts = attempt + 1, "Reconnected");
                    return;
                }
                Err(EventError::Closed(_)) => return,
                Err(e) => {
                    attempt += 1;
                    self.inner.reconnect_attempts.store(attempt, Ordering::SeqCst);
                    tracing::warn!(attempt, error = %e, "Reconnect attempt failed");
                    self.record_error(&e);
                    self.inner.hooks.connection_error(attempt, &e);
                }
            }
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("generation", &self.generation())
            .field("backend", &self.inner.connector.name())
            .finish()
    }
}

/// Poll `condition` every few milliseconds until it holds or `limit` elapses
#[cfg(test)]
pub(crate) async fn eventually(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
