use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod logging;

/// Delivery lifecycle of a queued message.
///
/// Every enqueue starts at `Init`; the consumer delivery loop moves the
/// record to `Consuming`, and the client's ack/nack settles it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Init,
    Consuming,
    Acked,
    Nacked,
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageStatus::Init => write!(f, "INIT"),
            MessageStatus::Consuming => write!(f, "CONSUMING"),
            MessageStatus::Acked => write!(f, "ACKED"),
            MessageStatus::Nacked => write!(f, "NACKED"),
        }
    }
}

/// A message as it flows through the broker and over the control API.
///
/// `exchange = ""` is the default exchange. `value` holds the JSON-decoded
/// payload; publishes whose body is not valid JSON fall back to a string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    #[serde(default = "generate_id")]
    pub id: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub routing_key: String,
    #[serde(default)]
    pub properties: Option<Value>,
}

fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Message {
    pub fn new(value: Value) -> Self {
        Self {
            id: generate_id(),
            value,
            exchange: String::new(),
            routing_key: String::new(),
            properties: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    pub fn with_properties(mut self, properties: Value) -> Self {
        self.properties = Some(properties);
        self
    }
}

/// One (message, queue) enqueue event and its current lifecycle status.
///
/// A fanout publish to N queues produces N records sharing the message id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedMessage {
    pub message: Message,
    pub queue: String,
    pub status: MessageStatus,
}

impl QueuedMessage {
    pub fn new(message: Message, queue: impl Into<String>) -> Self {
        Self {
            message,
            queue: queue.into(),
            status: MessageStatus::Init,
        }
    }
}
