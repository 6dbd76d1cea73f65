//! Client instance
//!
//! `EventClient` owns one `ConnectionManager` and hands out publishers and
//! consumers bound to it. Services create it explicitly and pass it
//! around; there is no process-wide client.

use crate::broker::memory::MemoryBroker;
use crate::broker::nats::NatsConnector;
use crate::broker::Connector;
use crate::config::{ClientConfig, ConsumerConfig, PublisherConfig};
use crate::connection::ConnectionManager;
use crate::consumer::Consumer;
use crate::error::Result;
use crate::hooks::{EventHooks, Hooks};
use crate::publisher::Publisher;
use crate::types::ConnectionState;
use std::sync::Arc;

/// Entry point for publishing and consuming events
///
/// ```rust,no_run
/// use a3s_stream::{ClientConfig, ConsumerConfig, EventClient, PublisherConfig};
/// use a3s_stream::{Event, EventMetadata, Outcome, handler_fn};
///
/// # async fn example() -> a3s_stream::Result<()> {
/// let client = EventClient::nats(ClientConfig::default());
/// client.connect().await?;
///
/// let publisher = client.publisher(PublisherConfig::default())?;
/// let event = Event::new(
///     "academic.course.created",
///     EventMetadata::new("course-service"),
///     serde_json::json!({"course_id": "CS101"}),
/// );
/// publisher.publish(&event).await?;
///
/// let consumer = client.consumer(
///     ConsumerConfig::new("ACADEMIC_EVENTS", "course-indexer").with_filter("academic.course.*"),
/// )?;
/// consumer
///     .subscribe(handler_fn(|event: Event, _ctx| async move {
///         println!("{}", event.event_type());
///         Ok(Outcome::Ack)
///     }))
///     .await?;
///
/// consumer.stop().await?;
/// client.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct EventClient {
    connection: ConnectionManager,
}

impl EventClient {
    pub fn builder(config: ClientConfig) -> EventClientBuilder {
        EventClientBuilder {
            config,
            hooks: Vec::new(),
        }
    }

    /// Client for NATS JetStream
    pub fn nats(config: ClientConfig) -> Self {
        Self::builder(config).build(Arc::new(NatsConnector::new()))
    }

    /// Client for an in-process broker
    pub fn memory(config: ClientConfig, broker: &MemoryBroker) -> Self {
        Self::builder(config).build(Arc::new(broker.connector()))
    }

    pub async fn connect(&self) -> Result<()> {
        self.connection.connect().await
    }

    /// Release the connection; publishers and consumers stop working
    pub async fn close(&self) {
        self.connection.disconnect().await;
    }

    pub fn publisher(&self, config: PublisherConfig) -> Result<Publisher> {
        Publisher::new(self.connection.clone(), config)
    }

    pub fn consumer(&self, config: ConsumerConfig) -> Result<Consumer> {
        Consumer::new(self.connection.clone(), config)
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub async fn health(&self) -> bool {
        self.connection.health().await
    }
}

impl std::fmt::Debug for EventClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventClient")
            .field("connection", &self.connection)
            .finish()
    }
}

/// Builds an [`EventClient`] with hooks
pub struct EventClientBuilder {
    config: ClientConfig,
    hooks: Vec<Arc<dyn EventHooks>>,
}

impl EventClientBuilder {
    pub fn hook(mut self, hook: Arc<dyn EventHooks>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn build(self, connector: Arc<dyn Connector>) -> EventClient {
        let hooks = Hooks::new(self.hooks, self.config.enable_metrics);
        EventClient {
            connection: ConnectionManager::new(self.config, connector, hooks),
        }
    }
}
