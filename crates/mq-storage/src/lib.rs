//! In-memory broker state shared by the AMQP connections and the HTTP
//! control surface.
//!
//! One mutex guards everything: exchanges with their published logs, FIFO
//! queues, exchange bindings, and the per-enqueue delivery history. Handler
//! tasks only touch the state between await points, so the single lock is
//! enough for a multi-threaded runtime. Suspended consumers are woken
//! through a per-queue [`tokio::sync::Notify`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use mq_common::{Message, MessageStatus, QueuedMessage};

/// Name of the implicitly existing default exchange.
pub const DEFAULT_EXCHANGE: &str = "";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    /// Declared with a type this mock does not route. Declaration is
    /// acknowledged; publishes land in the exchange log only.
    Other,
}

impl ExchangeKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "direct" | "" => ExchangeKind::Direct,
            "fanout" => ExchangeKind::Fanout,
            _ => ExchangeKind::Other,
        }
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Message>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct StorageInner {
    exchange_kinds: HashMap<String, ExchangeKind>,
    /// Published log per exchange, newest first.
    exchange_logs: HashMap<String, Vec<Message>>,
    /// exchange -> routing key -> queue. Insertion order drives fanout.
    bindings: HashMap<String, IndexMap<String, String>>,
    queues: HashMap<String, QueueState>,
    history: Vec<QueuedMessage>,
}

impl StorageInner {
    fn queue_entry(&mut self, queue: &str) -> &mut QueueState {
        self.queues.entry(queue.to_string()).or_default()
    }

    fn declare_queue(&mut self, queue: &str) {
        self.queue_entry(queue);
        self.bindings
            .entry(DEFAULT_EXCHANGE.to_string())
            .or_default()
            .entry(queue.to_string())
            .or_insert_with(|| queue.to_string());
    }

    fn enqueue(&mut self, queue: &str, message: Message) {
        let record = QueuedMessage::new(message.clone(), queue);
        self.history.push(record);
        let state = self.queue_entry(queue);
        state.pending.push_back(message);
        state.notify.notify_one();
    }
}

/// Cheaply cloneable handle to the process-wide broker state.
#[derive(Clone, Default)]
pub struct Storage {
    inner: Arc<Mutex<StorageInner>>,
}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset everything. Current waiters are woken so they re-observe the
    /// empty state instead of sleeping on a detached queue.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for state in inner.queues.values() {
            state.notify.notify_waiters();
        }
        *inner = StorageInner::default();
        debug!("storage cleared");
    }

    /// Idempotent: re-declaring records the type but never clears the log.
    pub fn declare_exchange(&self, exchange: &str, kind: ExchangeKind) {
        let mut inner = self.inner.lock();
        inner.exchange_kinds.insert(exchange.to_string(), kind);
    }

    /// Idempotent: creates the FIFO and the default-exchange binding
    /// `("" , queue) -> queue`.
    pub fn declare_queue(&self, queue: &str) {
        let mut inner = self.inner.lock();
        inner.declare_queue(queue);
    }

    /// Upsert `bindings[exchange][routing_key] = queue`; the queue is
    /// implicitly declared.
    pub fn bind(&self, queue: &str, exchange: &str, routing_key: &str) {
        let mut inner = self.inner.lock();
        inner.declare_queue(queue);
        inner
            .bindings
            .entry(exchange.to_string())
            .or_default()
            .insert(routing_key.to_string(), queue.to_string());
    }

    /// Record the publish in the exchange log, then route it.
    ///
    /// Default exchange: direct over the implicit `queue -> queue`
    /// bindings. Direct: at most the one queue bound with the message's
    /// routing key. Fanout: every bound queue, in binding order, routing
    /// key preserved. The log records the publish whether or not any
    /// binding matches.
    pub fn publish_to_exchange(&self, exchange: &str, message: Message) {
        let mut inner = self.inner.lock();
        inner
            .exchange_logs
            .entry(exchange.to_string())
            .or_default()
            .insert(0, message.clone());

        let kind = inner
            .exchange_kinds
            .get(exchange)
            .copied()
            .unwrap_or(ExchangeKind::Direct);
        let targets: Vec<String> = match kind {
            ExchangeKind::Direct => inner
                .bindings
                .get(exchange)
                .and_then(|bindings| bindings.get(&message.routing_key))
                .cloned()
                .into_iter()
                .collect(),
            ExchangeKind::Fanout => inner
                .bindings
                .get(exchange)
                .map(|bindings| bindings.values().cloned().collect())
                .unwrap_or_default(),
            ExchangeKind::Other => Vec::new(),
        };

        debug!(exchange, routing_key = %message.routing_key, queues = targets.len(), "routed publish");
        for queue in targets {
            inner.enqueue(&queue, message.clone());
        }
    }

    /// Enqueue directly into a queue, bypassing exchanges (control API).
    pub fn publish_to_queue(&self, queue: &str, message: Message) {
        let mut inner = self.inner.lock();
        inner.enqueue(queue, message);
    }

    /// Exchange log, newest first.
    pub fn exchange_messages(&self, exchange: &str) -> Vec<Message> {
        let inner = self.inner.lock();
        inner.exchange_logs.get(exchange).cloned().unwrap_or_default()
    }

    /// Clear one exchange log; queues and history stay untouched.
    pub fn delete_exchange_messages(&self, exchange: &str) {
        let mut inner = self.inner.lock();
        if let Some(log) = inner.exchange_logs.get_mut(exchange) {
            log.clear();
        }
    }

    /// All enqueue records, newest first.
    pub fn history(&self) -> Vec<QueuedMessage> {
        let inner = self.inner.lock();
        inner.history.iter().rev().cloned().collect()
    }

    /// Update every history record carrying this message id. A fanout
    /// enqueue produces several records per id; updating all of them keeps
    /// what the control API shows consistent. Absent ids are a no-op.
    pub fn set_status(&self, message_id: &str, status: MessageStatus) {
        let mut inner = self.inner.lock();
        for record in inner.history.iter_mut() {
            if record.message.id == message_id {
                record.status = status;
            }
        }
    }

    /// Pop the queue's FIFO head, suspending while it is empty.
    ///
    /// The future only completes with a message; consumers stop by being
    /// cancelled at this suspension point.
    pub async fn next_message(&self, queue: &str) -> Message {
        loop {
            let notify = {
                let mut inner = self.inner.lock();
                let state = inner.queue_entry(queue);
                if let Some(message) = state.pending.pop_front() {
                    return message;
                }
                state.notify.clone()
            };
            notify.notified().await;
        }
    }

    /// Number of messages awaiting delivery (tests and diagnostics).
    pub fn pending_count(&self, queue: &str) -> usize {
        let inner = self.inner.lock();
        inner.queues.get(queue).map(|state| state.pending.len()).unwrap_or(0)
    }
}
