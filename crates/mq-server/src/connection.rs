//! Per-connection protocol state machine.
//!
//! One reader loop per accepted socket dispatches frames against the
//! handshake state; consumer delivery tasks run concurrently and share the
//! connection's writer, delivery-tag counter and delivery map. Writes are
//! serialized through a mutex on the framed writer, and every send flushes
//! before returning, so frame bytes never interleave on the wire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use mq_proto::{AmqpCodec, BasicProperties, ContentHeader, FieldTable, Frame, Method, ProtoError};

use crate::{RawPublish, ServerHooks};

const REPLY_SUCCESS: u16 = 200;
const FRAME_ERROR: u16 = 501;

type SharedWriter = Arc<tokio::sync::Mutex<FramedWrite<OwnedWriteHalf, AmqpCodec>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    AwaitProtocolHeader,
    AwaitStartOk,
    AwaitTuneOk,
    AwaitOpen,
    Open,
    Closing,
    Closed,
}

/// A publish being assembled from Method + Header + Body frames.
struct IncomingPublish {
    exchange: String,
    routing_key: String,
    properties: Option<serde_json::Value>,
    body_size: u64,
    body: BytesMut,
    header_seen: bool,
}

#[derive(Default)]
struct Channel {
    /// `Some` once `Tx.Select` switched the channel into transaction mode.
    tx_buffer: Option<Vec<RawPublish>>,
    incoming: Option<IncomingPublish>,
}

enum HandlerError {
    /// Well-formed frame in a forbidden state; aborts the connection.
    Protocol(String),
    Proto(ProtoError),
}

impl From<ProtoError> for HandlerError {
    fn from(error: ProtoError) -> Self {
        HandlerError::Proto(error)
    }
}

pub(crate) struct AmqpConnection {
    id: u64,
    state: ConnectionState,
    hooks: Arc<dyn ServerHooks>,
    server_properties: FieldTable,
    heartbeat: u16,
    writer: SharedWriter,
    channels: HashMap<u16, Channel>,
    consumers: HashMap<(u16, String), JoinHandle<()>>,
    /// Shared with delivery tasks; confirms and deliveries draw from the
    /// same monotonically increasing sequence, starting at 1.
    next_delivery_tag: Arc<AtomicU64>,
    /// delivery tag -> message id, for resolving ack/nack.
    delivered: Arc<parking_lot::Mutex<HashMap<u64, String>>>,
    on_close_fired: bool,
}

impl AmqpConnection {
    pub(crate) fn spawn(
        id: u64,
        socket: TcpStream,
        hooks: Arc<dyn ServerHooks>,
        server_properties: FieldTable,
        heartbeat: u16,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (read_half, write_half) = socket.into_split();
            let reader = FramedRead::new(read_half, AmqpCodec::new());
            let writer = Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
                write_half,
                AmqpCodec::client(),
            )));
            let connection = AmqpConnection {
                id,
                state: ConnectionState::AwaitProtocolHeader,
                hooks,
                server_properties,
                heartbeat,
                writer,
                channels: HashMap::new(),
                consumers: HashMap::new(),
                next_delivery_tag: Arc::new(AtomicU64::new(0)),
                delivered: Arc::new(parking_lot::Mutex::new(HashMap::new())),
                on_close_fired: false,
            };
            connection.run(reader, shutdown).await;
        })
    }

    async fn run(
        mut self,
        mut reader: FramedRead<tokio::net::tcp::OwnedReadHalf, AmqpCodec>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut shutdown_requested = false;
        loop {
            tokio::select! {
                next = reader.next() => match next {
                    Some(Ok((channel_id, frame))) => {
                        if let Err(error) = self.dispatch(channel_id, frame).await {
                            match error {
                                HandlerError::Protocol(reason) => {
                                    warn!(connection = self.id, %reason, "protocol error, closing connection");
                                }
                                HandlerError::Proto(error) => {
                                    warn!(connection = self.id, %error, "send failed, closing connection");
                                }
                            }
                            self.abort().await;
                            break;
                        }
                        if self.state == ConnectionState::Closed {
                            break;
                        }
                    }
                    Some(Err(error)) => {
                        warn!(connection = self.id, %error, "frame decode failed, closing connection");
                        self.abort().await;
                        break;
                    }
                    // EOF: a close without Connection.Close is still a close.
                    None => break,
                },
                changed = shutdown.changed(), if !shutdown_requested => {
                    shutdown_requested = true;
                    if changed.is_err() || *shutdown.borrow() {
                        self.begin_server_close().await;
                    }
                }
            }
        }
        self.teardown().await;
    }

    async fn send(&self, channel_id: u16, frame: Frame) -> Result<(), ProtoError> {
        send_frame(&self.writer, channel_id, frame).await
    }

    /// Server-initiated close: announce it and wait for the client's
    /// CloseOk (or EOF) in the read loop.
    async fn begin_server_close(&mut self) {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) {
            return;
        }
        debug!(connection = self.id, "server shutdown, sending Connection.Close");
        self.state = ConnectionState::Closing;
        let close = Method::ConnectionClose {
            reply_code: REPLY_SUCCESS,
            reply_text: "Goodbye".to_string(),
            class_id: 0,
            method_id: 0,
        };
        if self.send(0, Frame::Method(close)).await.is_err() {
            self.state = ConnectionState::Closed;
        }
    }

    /// Decode/protocol error path: best-effort Connection.Close, then the
    /// regular teardown closes the socket.
    async fn abort(&mut self) {
        let close = Method::ConnectionClose {
            reply_code: FRAME_ERROR,
            reply_text: "frame error".to_string(),
            class_id: 0,
            method_id: 0,
        };
        let _ = self.send(0, Frame::Method(close)).await;
        self.state = ConnectionState::Closed;
    }

    async fn dispatch(&mut self, channel_id: u16, frame: Frame) -> Result<(), HandlerError> {
        debug!(connection = self.id, channel = channel_id, ?frame, "<-");
        match frame {
            Frame::Heartbeat => Ok(()),
            Frame::ProtocolHeader => self.handle_protocol_header(channel_id).await,
            Frame::Method(method) => self.handle_method(channel_id, method).await,
            Frame::Header(header) => self.handle_content_header(channel_id, header).await,
            Frame::Body(body) => self.handle_content_body(channel_id, body).await,
        }
    }

    async fn handle_protocol_header(&mut self, channel_id: u16) -> Result<(), HandlerError> {
        if self.state != ConnectionState::AwaitProtocolHeader {
            return Err(HandlerError::Protocol("unexpected protocol header".to_string()));
        }
        let start = Method::ConnectionStart {
            version_major: 0,
            version_minor: 9,
            server_properties: self.server_properties.clone(),
            mechanisms: "PLAIN".to_string(),
            locales: "en_US".to_string(),
        };
        self.send(channel_id, Frame::Method(start)).await?;
        self.state = ConnectionState::AwaitStartOk;
        Ok(())
    }

    async fn handle_method(&mut self, channel_id: u16, method: Method) -> Result<(), HandlerError> {
        match (self.state, method) {
            // Handshake. Any credentials are accepted.
            (ConnectionState::AwaitStartOk, Method::ConnectionStartOk { .. }) => {
                let tune = Method::ConnectionTune {
                    channel_max: 0,
                    frame_max: 0,
                    heartbeat: self.heartbeat,
                };
                self.send(channel_id, Frame::Method(tune)).await?;
                self.state = ConnectionState::AwaitTuneOk;
                Ok(())
            }
            (ConnectionState::AwaitTuneOk, Method::ConnectionTuneOk { .. }) => {
                self.state = ConnectionState::AwaitOpen;
                Ok(())
            }
            (ConnectionState::AwaitOpen, Method::ConnectionOpen { .. }) => {
                self.send(channel_id, Frame::Method(Method::ConnectionOpenOk)).await?;
                self.state = ConnectionState::Open;
                Ok(())
            }

            // Close, from either side.
            (_, Method::ConnectionClose { .. }) => {
                self.send(channel_id, Frame::Method(Method::ConnectionCloseOk)).await?;
                self.state = ConnectionState::Closed;
                Ok(())
            }
            (ConnectionState::Closing, Method::ConnectionCloseOk) => {
                self.state = ConnectionState::Closed;
                Ok(())
            }
            // The client already acknowledged nothing more will happen.
            (ConnectionState::Closing, _) => Ok(()),

            (ConnectionState::Open, method) => self.handle_open_method(channel_id, method).await,

            (state, method) => Err(HandlerError::Protocol(format!(
                "method {:?} not allowed in state {:?}",
                method.ids(),
                state
            ))),
        }
    }

    async fn handle_open_method(
        &mut self,
        channel_id: u16,
        method: Method,
    ) -> Result<(), HandlerError> {
        if channel_id == 0 {
            // Channel 0 is reserved for connection-class methods, all of
            // which were handled above.
            return Err(HandlerError::Protocol(format!(
                "method {:?} on channel 0",
                method.ids()
            )));
        }
        match method {
            Method::ChannelOpen => {
                self.channels.insert(channel_id, Channel::default());
                self.send(channel_id, Frame::Method(Method::ChannelOpenOk)).await?;
                Ok(())
            }
            Method::ChannelClose { .. } => {
                self.cancel_channel_consumers(channel_id).await;
                self.channels.remove(&channel_id);
                self.send(channel_id, Frame::Method(Method::ChannelCloseOk)).await?;
                Ok(())
            }
            Method::ChannelCloseOk => Ok(()),

            Method::ExchangeDeclare { exchange, kind, .. } => {
                self.require_channel(channel_id)?;
                let kind = if kind.is_empty() { "direct".to_string() } else { kind };
                self.hooks.on_declare_exchange(&exchange, &kind).await;
                self.send(channel_id, Frame::Method(Method::ExchangeDeclareOk)).await?;
                Ok(())
            }
            Method::QueueDeclare { queue, .. } => {
                self.require_channel(channel_id)?;
                let queue = if queue.is_empty() {
                    format!("amq.gen-{}", uuid::Uuid::new_v4())
                } else {
                    queue
                };
                self.hooks.on_declare_queue(&queue).await;
                let ok = Method::QueueDeclareOk {
                    queue,
                    message_count: 0,
                    consumer_count: 0,
                };
                self.send(channel_id, Frame::Method(ok)).await?;
                Ok(())
            }
            Method::QueueBind { queue, exchange, routing_key, .. } => {
                self.require_channel(channel_id)?;
                self.hooks.on_bind(&queue, &exchange, &routing_key).await;
                self.send(channel_id, Frame::Method(Method::QueueBindOk)).await?;
                Ok(())
            }
            Method::BasicQos { .. } => {
                // Prefetch is acknowledged but the delivery loop ignores it.
                self.require_channel(channel_id)?;
                self.send(channel_id, Frame::Method(Method::BasicQosOk)).await?;
                Ok(())
            }
            Method::ConfirmSelect { .. } => {
                // Confirms are emitted for every non-transactional publish,
                // selected or not, so this only acknowledges the switch.
                self.require_channel(channel_id)?;
                self.send(channel_id, Frame::Method(Method::ConfirmSelectOk)).await?;
                Ok(())
            }

            Method::TxSelect => {
                let channel = self.require_channel(channel_id)?;
                channel.tx_buffer = Some(Vec::new());
                self.send(channel_id, Frame::Method(Method::TxSelectOk)).await?;
                Ok(())
            }
            Method::TxCommit => {
                let channel = self.require_channel(channel_id)?;
                let buffered = match channel.tx_buffer.as_mut() {
                    Some(buffer) => std::mem::take(buffer),
                    None => Vec::new(),
                };
                for publish in buffered {
                    self.hooks.on_publish(publish).await;
                }
                self.send(channel_id, Frame::Method(Method::TxCommitOk)).await?;
                Ok(())
            }
            Method::TxRollback => {
                let channel = self.require_channel(channel_id)?;
                if let Some(buffer) = channel.tx_buffer.as_mut() {
                    buffer.clear();
                }
                self.send(channel_id, Frame::Method(Method::TxRollbackOk)).await?;
                Ok(())
            }

            Method::BasicPublish { exchange, routing_key, .. } => {
                let channel = self.require_channel(channel_id)?;
                channel.incoming = Some(IncomingPublish {
                    exchange,
                    routing_key,
                    properties: None,
                    body_size: 0,
                    body: BytesMut::new(),
                    header_seen: false,
                });
                Ok(())
            }

            Method::BasicConsume { queue, consumer_tag, .. } => {
                self.require_channel(channel_id)?;
                let consumer_tag = if consumer_tag.is_empty() {
                    format!("ctag-{}", uuid::Uuid::new_v4())
                } else {
                    consumer_tag
                };
                let ok = Method::BasicConsumeOk { consumer_tag: consumer_tag.clone() };
                self.send(channel_id, Frame::Method(ok)).await?;
                self.start_consumer(channel_id, queue, consumer_tag);
                Ok(())
            }
            Method::BasicCancel { consumer_tag, .. } => {
                if let Some(task) = self.consumers.remove(&(channel_id, consumer_tag.clone())) {
                    task.abort();
                    let _ = task.await;
                }
                let ok = Method::BasicCancelOk { consumer_tag };
                self.send(channel_id, Frame::Method(ok)).await?;
                Ok(())
            }

            Method::BasicAck { delivery_tag, .. } => {
                // Unknown tags are ignored; the client may have desynced.
                let message_id = self.delivered.lock().get(&delivery_tag).cloned();
                if let Some(message_id) = message_id {
                    self.hooks.on_ack(&message_id).await;
                }
                Ok(())
            }
            Method::BasicNack { delivery_tag, .. } => {
                let message_id = self.delivered.lock().get(&delivery_tag).cloned();
                if let Some(message_id) = message_id {
                    self.hooks.on_nack(&message_id).await;
                }
                Ok(())
            }

            Method::Unknown { class_id, method_id } => {
                debug!(connection = self.id, class_id, method_id, "ignoring unhandled method");
                Ok(())
            }

            other => Err(HandlerError::Protocol(format!(
                "unexpected method {:?} in open state",
                other.ids()
            ))),
        }
    }

    fn require_channel(&mut self, channel_id: u16) -> Result<&mut Channel, HandlerError> {
        self.channels
            .get_mut(&channel_id)
            .ok_or_else(|| HandlerError::Protocol(format!("channel {channel_id} is not open")))
    }

    async fn handle_content_header(
        &mut self,
        channel_id: u16,
        header: ContentHeader,
    ) -> Result<(), HandlerError> {
        if self.state != ConnectionState::Open {
            return Err(HandlerError::Protocol("content header before handshake".to_string()));
        }
        let channel = self.require_channel(channel_id)?;
        let complete = match channel.incoming.as_mut() {
            Some(incoming) => {
                incoming.body_size = header.body_size;
                incoming.properties = header.properties.to_json();
                incoming.header_seen = true;
                header.body_size == 0
            }
            // Stray header with no pending publish: drop it.
            None => false,
        };
        if complete {
            self.finish_publish(channel_id).await?;
        }
        Ok(())
    }

    async fn handle_content_body(
        &mut self,
        channel_id: u16,
        body: Bytes,
    ) -> Result<(), HandlerError> {
        if self.state != ConnectionState::Open {
            return Err(HandlerError::Protocol("content body before handshake".to_string()));
        }
        let channel = self.require_channel(channel_id)?;
        let complete = match channel.incoming.as_mut() {
            Some(incoming) if incoming.header_seen => {
                incoming.body.put_slice(&body);
                incoming.body.len() as u64 >= incoming.body_size
            }
            _ => false,
        };
        if complete {
            self.finish_publish(channel_id).await?;
        }
        Ok(())
    }

    /// The assembled publish leaves the channel slot: buffered in tx mode,
    /// otherwise routed immediately and confirmed back to the publisher.
    async fn finish_publish(&mut self, channel_id: u16) -> Result<(), HandlerError> {
        let channel = self.require_channel(channel_id)?;
        let Some(incoming) = channel.incoming.take() else {
            return Ok(());
        };
        let publish = RawPublish {
            exchange: incoming.exchange,
            routing_key: incoming.routing_key,
            properties: incoming.properties,
            body: incoming.body.freeze(),
        };

        if let Some(buffer) = channel.tx_buffer.as_mut() {
            buffer.push(publish);
            return Ok(());
        }

        self.hooks.on_publish(publish).await;
        let ack = Method::BasicAck {
            delivery_tag: self.allocate_delivery_tag(),
            multiple: false,
        };
        self.send(channel_id, Frame::Method(ack)).await?;
        Ok(())
    }

    fn allocate_delivery_tag(&self) -> u64 {
        self.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn start_consumer(&mut self, channel_id: u16, queue: String, consumer_tag: String) {
        info!(connection = self.id, channel = channel_id, %queue, %consumer_tag, "new consumer");
        let hooks = self.hooks.clone();
        let writer = self.writer.clone();
        let next_delivery_tag = self.next_delivery_tag.clone();
        let delivered = self.delivered.clone();
        let tag = consumer_tag.clone();

        let task = tokio::spawn(async move {
            loop {
                // Cancellation lands here, before the message is dequeued.
                let message = hooks.next_message(&queue).await;
                let delivery_tag = next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1;
                delivered.lock().insert(delivery_tag, message.id.clone());
                debug!(%queue, %tag, delivery_tag, message_id = %message.id, "delivering");

                let encoded = serde_json::to_vec(&message.value).unwrap_or_default();
                let deliver = Method::BasicDeliver {
                    consumer_tag: tag.clone(),
                    delivery_tag,
                    redelivered: false,
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                };
                let header = ContentHeader::new(
                    encoded.len() as u64,
                    BasicProperties::from_json(message.properties.as_ref()),
                );

                let frames = [
                    Frame::Method(deliver),
                    Frame::Header(header),
                    Frame::Body(Bytes::from(encoded)),
                ];
                for frame in frames {
                    if send_frame(&writer, channel_id, frame).await.is_err() {
                        return;
                    }
                }
            }
        });
        self.consumers.insert((channel_id, consumer_tag), task);
    }

    async fn cancel_channel_consumers(&mut self, channel_id: u16) {
        let keys: Vec<_> = self
            .consumers
            .keys()
            .filter(|(channel, _)| *channel == channel_id)
            .cloned()
            .collect();
        for key in keys {
            if let Some(task) = self.consumers.remove(&key) {
                task.abort();
                let _ = task.await;
            }
        }
    }

    /// Ordered teardown: cancel all consumers, close the socket writer,
    /// then report the connection gone. Fires `on_close` exactly once.
    async fn teardown(&mut self) {
        let tasks: Vec<_> = self.consumers.drain().map(|(_, task)| task).collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }

        {
            let mut writer = self.writer.lock().await;
            let _ = writer.close().await;
        }

        if !self.on_close_fired {
            self.on_close_fired = true;
            self.hooks.on_close(self.id).await;
        }
        info!(connection = self.id, "connection closed");
    }
}

async fn send_frame(writer: &SharedWriter, channel_id: u16, frame: Frame) -> Result<(), ProtoError> {
    debug!(channel = channel_id, ?frame, "->");
    let mut writer = writer.lock().await;
    writer.send((channel_id, frame)).await
}
