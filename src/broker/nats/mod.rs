//! NATS JetStream backend
//!
//! `NatsConnector` opens one `async_nats::Client` per connection with
//! the client library's own reconnection disabled: a lost connection is
//! reported to the connection manager, which owns the retry schedule.

mod client;

pub use client::NatsTransport;

use super::{Connector, Transport, TransportEvent, TransportEvents};
use crate::config::{AuthConfig, ClientConfig};
use crate::error::{EventError, Result};
use async_nats::ServerAddr;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Connects to NATS servers
#[derive(Debug, Clone, Default)]
pub struct NatsConnector;

impl NatsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for NatsConnector {
    async fn connect(
        &self,
        config: &ClientConfig,
        events: TransportEvents,
    ) -> Result<Arc<dyn Transport>> {
        let servers = parse_servers(&config.servers)?;
        let opts = build_connect_options(config, events);

        let client = opts
            .connect(servers.as_slice())
            .await
            .map_err(|e| EventError::Connection(format!("{}: {}", config.servers.join(","), e)))?;

        tracing::info!(
            servers = ?config.servers,
            client_name = %config.client_name,
            "Connected to NATS"
        );

        Ok(Arc::new(NatsTransport::new(client, config)))
    }

    fn name(&self) -> &str {
        "nats"
    }
}

fn parse_servers(servers: &[String]) -> Result<Vec<ServerAddr>> {
    if servers.is_empty() {
        return Err(EventError::Config("at least one server is required".into()));
    }
    servers
        .iter()
        .map(|s| {
            s.parse::<ServerAddr>()
                .map_err(|e| EventError::Config(format!("invalid server URL '{}': {}", s, e)))
        })
        .collect()
}

/// Build NATS connect options from config
fn build_connect_options(config: &ClientConfig, events: TransportEvents) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .name(config.client_name.clone())
        .connection_timeout(config.connect_timeout())
        .request_timeout(Some(config.request_timeout()))
        .max_reconnects(Some(1));

    match &config.auth {
        Some(AuthConfig::Credentials { username, password }) => {
            opts = opts.user_and_password(username.clone(), password.clone());
        }
        Some(AuthConfig::Token { token }) => {
            opts = opts.token(token.clone());
        }
        None => {}
    }

    if let Some(tls) = &config.tls {
        opts = opts.require_tls(true);
        if let Some(ca) = &tls.ca_cert {
            opts = opts.add_root_certificates(ca.clone());
        }
        if let (Some(cert), Some(key)) = (&tls.cert, &tls.key) {
            opts = opts.add_client_certificate(cert.clone(), key.clone());
        }
    }

    // The first disconnect is the only one the manager needs to hear about
    let reported = Arc::new(AtomicBool::new(false));
    opts.event_callback(move |event| {
        let events = events.clone();
        let reported = reported.clone();
        async move {
            match event {
                async_nats::Event::Disconnected => {
                    if !reported.swap(true, Ordering::SeqCst) {
                        let _ = events.send(TransportEvent::Disconnected {
                            reason: "NATS connection lost".to_string(),
                        });
                    }
                }
                async_nats::Event::ServerError(e) => {
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                }
                async_nats::Event::ClientError(e) => {
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                }
                other => tracing::debug!(event = %other, "NATS connection event"),
            }
        }
    })
}
