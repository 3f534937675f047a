//! TCP acceptor and the storage-backed hook implementation.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mq_common::{Message, MessageStatus};
use mq_proto::FieldTable;
use mq_storage::{ExchangeKind, Storage};

use crate::connection::AmqpConnection;
use crate::{RawPublish, Result, ServerHooks};

#[derive(Debug, Clone)]
pub struct AmqpServerConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Advertised in `Connection.Start`; `None` selects the defaults.
    pub server_properties: Option<FieldTable>,
    /// Advertised in `Connection.Tune`; never enforced.
    pub heartbeat: u16,
}

impl Default for AmqpServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 5672,
            server_properties: None,
            heartbeat: 0,
        }
    }
}

fn default_server_properties() -> FieldTable {
    let properties = json!({
        "capabilities": {
            "publisher_confirms": true,
            "basic.nack": true,
            "consumer_cancel_notify": true,
            "connection.blocked": true,
            "authentication_failure_close": true,
        },
        "product": "mq-mock",
        "version": env!("CARGO_PKG_VERSION"),
        "platform": "rust",
    });
    match properties {
        serde_json::Value::Object(table) => table,
        _ => unreachable!(),
    }
}

/// Acceptor for the AMQP side of the mock.
pub struct AmqpServer {
    config: AmqpServerConfig,
    storage: Storage,
}

impl AmqpServer {
    pub fn new(storage: Storage, config: AmqpServerConfig) -> Self {
        Self { config, storage }
    }

    /// Bind the listener and start accepting. Bind failures propagate to
    /// the caller and are fatal.
    pub async fn start(self) -> Result<AmqpServerHandle> {
        let listener =
            TcpListener::bind((self.config.bind_addr.as_str(), self.config.port)).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "AMQP server listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let connections: Arc<DashMap<u64, JoinHandle<()>>> = Arc::new(DashMap::new());
        let hooks: Arc<dyn ServerHooks> = Arc::new(StorageHooks {
            storage: self.storage.clone(),
            connections: connections.clone(),
        });
        let server_properties = self
            .config
            .server_properties
            .clone()
            .unwrap_or_else(default_server_properties);

        let accept_task = {
            let connections = connections.clone();
            let mut shutdown = shutdown_rx.clone();
            let heartbeat = self.config.heartbeat;
            tokio::spawn(async move {
                let next_connection_id = AtomicU64::new(1);
                loop {
                    tokio::select! {
                        accepted = listener.accept() => match accepted {
                            Ok((socket, peer)) => {
                                let id = next_connection_id.fetch_add(1, Ordering::SeqCst);
                                info!(connection = id, %peer, "client connected");
                                let task = AmqpConnection::spawn(
                                    id,
                                    socket,
                                    hooks.clone(),
                                    server_properties.clone(),
                                    heartbeat,
                                    shutdown_rx.clone(),
                                );
                                connections.insert(id, task);
                            }
                            Err(error) => {
                                warn!(%error, "accept failed");
                            }
                        },
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        Ok(AmqpServerHandle {
            local_addr,
            shutdown: shutdown_tx,
            accept_task,
            connections,
        })
    }
}

/// Running server: address, connection registry, graceful shutdown.
pub struct AmqpServerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    connections: Arc<DashMap<u64, JoinHandle<()>>>,
}

impl AmqpServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Live connections. A connection that tore down before the acceptor
    /// registered its task still counts as gone.
    pub fn connection_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| !entry.value().is_finished())
            .count()
    }

    /// Stop accepting, announce `Connection.Close` to every client and
    /// wait until each connection's teardown ran to completion.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.accept_task.await;

        let ids: Vec<u64> = self.connections.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, task)) = self.connections.remove(&id) {
                let _ = task.await;
            }
        }
        info!("AMQP server stopped");
    }
}

/// `ServerHooks` over `Storage`: the connection stays protocol-only and
/// the broker semantics live here.
struct StorageHooks {
    storage: Storage,
    connections: Arc<DashMap<u64, JoinHandle<()>>>,
}

#[async_trait]
impl ServerHooks for StorageHooks {
    async fn on_publish(&self, publish: RawPublish) {
        // Bodies are JSON when they can be; anything else is kept as the
        // raw text so the control API can still show it.
        let value = serde_json::from_slice(&publish.body).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&publish.body).into_owned())
        });
        let mut message = Message::new(value)
            .with_exchange(publish.exchange.clone())
            .with_routing_key(publish.routing_key);
        message.properties = publish.properties;
        self.storage.publish_to_exchange(&publish.exchange, message);
    }

    async fn on_declare_exchange(&self, exchange: &str, kind: &str) {
        self.storage.declare_exchange(exchange, ExchangeKind::parse(kind));
    }

    async fn on_declare_queue(&self, queue: &str) {
        self.storage.declare_queue(queue);
    }

    async fn on_bind(&self, queue: &str, exchange: &str, routing_key: &str) {
        self.storage.bind(queue, exchange, routing_key);
    }

    async fn on_ack(&self, message_id: &str) {
        self.storage.set_status(message_id, MessageStatus::Acked);
    }

    async fn on_nack(&self, message_id: &str) {
        self.storage.set_status(message_id, MessageStatus::Nacked);
    }

    async fn next_message(&self, queue: &str) -> Message {
        let message = self.storage.next_message(queue).await;
        self.storage.set_status(&message.id, MessageStatus::Consuming);
        message
    }

    async fn on_close(&self, connection_id: u64) {
        debug!(connection = connection_id, "deregistering connection");
        self.connections.remove(&connection_id);
    }
}
