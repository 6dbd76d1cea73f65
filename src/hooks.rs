//! Observability hooks
//!
//! Hooks are best effort: an error or panic inside a hook is logged and
//! swallowed, and never changes connection, publish or consume state.

use crate::error::EventError;
use crate::types::{Outcome, PublishAck};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

/// Error type hooks may return
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for hook methods
pub type HookResult = std::result::Result<(), HookError>;

/// Callbacks for connection, publish and consume lifecycle events
///
/// Every method has a no-op default; implement only what you need.
/// Hooks run inline on the calling task and should return quickly.
pub trait EventHooks: Send + Sync {
    fn on_connect(&self, _server: &str) -> HookResult {
        Ok(())
    }

    fn on_disconnect(&self, _reason: &str) -> HookResult {
        Ok(())
    }

    fn on_reconnect_attempt(&self, _attempt: u32, _delay: Duration) -> HookResult {
        Ok(())
    }

    /// A connect or reconnect attempt failed
    fn on_connection_error(&self, _attempt: u32, _error: &EventError) -> HookResult {
        Ok(())
    }

    /// Reconnect attempts are exhausted; the connection is given up
    fn on_fatal(&self, _error: &EventError) -> HookResult {
        Ok(())
    }

    fn on_publish_error(&self, _event_id: &str, _error: &EventError) -> HookResult {
        Ok(())
    }

    fn on_max_deliver_exceeded(&self, _event_id: &str) -> HookResult {
        Ok(())
    }

    /// Publish measurement (only when metrics are enabled)
    fn on_published(
        &self,
        _event_type: &str,
        _ack: &PublishAck,
        _attempts: u32,
        _elapsed: Duration,
    ) -> HookResult {
        Ok(())
    }

    /// Consume measurement (only when metrics are enabled)
    fn on_consumed(
        &self,
        _event_type: &str,
        _consumer: &str,
        _outcome: &Outcome,
        _elapsed: Duration,
    ) -> HookResult {
        Ok(())
    }
}

/// Registered hooks, fanned out with error isolation
#[derive(Clone, Default)]
pub struct Hooks {
    inner: Arc<Vec<Arc<dyn EventHooks>>>,
    metrics: bool,
}

impl Hooks {
    pub fn new(hooks: Vec<Arc<dyn EventHooks>>, metrics: bool) -> Self {
        Self {
            inner: Arc::new(hooks),
            metrics,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics
    }

    fn emit(&self, name: &'static str, f: impl Fn(&dyn EventHooks) -> HookResult) {
        for hook in self.inner.iter() {
            match catch_unwind(AssertUnwindSafe(|| f(hook.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(hook = name, error = %e, "Hook returned an error"),
                Err(_) => tracing::warn!(hook = name, "Hook panicked"),
            }
        }
    }

    pub fn connect(&self, server: &str) {
        self.emit("on_connect", |h| h.on_connect(server));
    }

    pub fn disconnect(&self, reason: &str) {
        self.emit("on_disconnect", |h| h.on_disconnect(reason));
    }

    pub fn reconnect_attempt(&self, attempt: u32, delay: Duration) {
        self.emit("on_reconnect_attempt", |h| h.on_reconnect_attempt(attempt, delay));
    }

    pub fn connection_error(&self, attempt: u32, error: &EventError) {
        self.emit("on_connection_error", |h| h.on_connection_error(attempt, error));
    }

    pub fn fatal(&self, error: &EventError) {
        self.emit("on_fatal", |h| h.on_fatal(error));
    }

    pub fn publish_error(&self, event_id: &str, error: &EventError) {
        self.emit("on_publish_error", |h| h.on_publish_error(event_id, error));
    }

    pub fn max_deliver_exceeded(&self, event_id: &str) {
        self.emit("on_max_deliver_exceeded", |h| h.on_max_deliver_exceeded(event_id));
    }

    pub fn published(&self, event_type: &str, ack: &PublishAck, attempts: u32, elapsed: Duration) {
        if self.metrics {
            self.emit("on_published", |h| h.on_published(event_type, ack, attempts, elapsed));
        }
    }

    pub fn consumed(&self, event_type: &str, consumer: &str, outcome: &Outcome, elapsed: Duration) {
        if self.metrics {
            self.emit("on_consumed", |h| h.on_consumed(event_type, consumer, outcome, elapsed));
        }
    }
}
