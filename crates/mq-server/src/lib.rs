//! AMQP side of the mock broker: TCP acceptor, per-connection protocol
//! state machine, and consumer delivery tasks.
//!
//! The connection owns no business logic. Everything the broker does on a
//! frame goes through [`ServerHooks`]; the server implements the hooks by
//! delegating to [`mq_storage::Storage`].

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use mq_common::Message;

mod connection;
mod server;

pub use server::{AmqpServer, AmqpServerConfig, AmqpServerHandle};

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Proto(#[from] mq_proto::ProtoError),
}

/// A fully assembled publish as it arrived on the wire: Method + Header +
/// Body, with the payload still raw. Interpreting the body is the hook
/// implementation's job.
#[derive(Debug, Clone)]
pub struct RawPublish {
    pub exchange: String,
    pub routing_key: String,
    pub properties: Option<Value>,
    pub body: Bytes,
}

/// Callback seam between the connection state machine and the broker.
#[async_trait]
pub trait ServerHooks: Send + Sync {
    /// A complete publish (or a committed transactional publish).
    async fn on_publish(&self, publish: RawPublish);

    /// `Exchange.Declare`; `kind` is already defaulted to `direct`.
    async fn on_declare_exchange(&self, exchange: &str, kind: &str);

    /// `Queue.Declare` with the final (possibly generated) queue name.
    async fn on_declare_queue(&self, queue: &str);

    /// `Queue.Bind`.
    async fn on_bind(&self, queue: &str, exchange: &str, routing_key: &str);

    /// `Basic.Ack` resolved to the delivered message id.
    async fn on_ack(&self, message_id: &str);

    /// `Basic.Nack` resolved to the delivered message id.
    async fn on_nack(&self, message_id: &str);

    /// Next message for a consumer of `queue`; suspends while the queue is
    /// empty and marks the record as being consumed before returning.
    async fn next_message(&self, queue: &str) -> Message;

    /// The connection is fully torn down; fires exactly once.
    async fn on_close(&self, connection_id: u64);
}
