//! Raw-frame AMQP client for driving the server over a real socket.
//!
//! Deliberately thin: every exchange with the server is explicit, so tests
//! can assert on exact frames (confirm tags, delivery tags, close
//! sequencing) instead of trusting a client library to hide them.

// not every test binary exercises the full client surface
#![allow(dead_code)]

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use mq_proto::{AmqpCodec, BasicProperties, ContentHeader, FieldTable, Frame, Method};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// One delivered message, reassembled from Deliver + Header + Body.
#[derive(Debug)]
pub struct Delivery {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub body: Bytes,
}

pub struct TestAmqpClient {
    transport: Framed<TcpStream, AmqpCodec>,
    channel_id: u16,
}

impl TestAmqpClient {
    /// Connect and run the whole handshake plus one channel open.
    pub async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let transport = Framed::new(stream, AmqpCodec::client());
        let mut client = Self { transport, channel_id: 1 };

        client.send(0, Frame::ProtocolHeader).await;
        let start = client.recv_method().await;
        assert!(matches!(start, Method::ConnectionStart { .. }), "got {start:?}");

        client
            .send_method(
                0,
                Method::ConnectionStartOk {
                    client_properties: FieldTable::new(),
                    mechanism: "PLAIN".to_string(),
                    response: "\u{0}guest\u{0}guest".to_string(),
                    locale: "en_US".to_string(),
                },
            )
            .await;
        let tune = client.recv_method().await;
        let Method::ConnectionTune { channel_max, frame_max, heartbeat } = tune else {
            panic!("expected Connection.Tune, got {tune:?}");
        };
        client
            .send_method(0, Method::ConnectionTuneOk { channel_max, frame_max, heartbeat })
            .await;

        client
            .send_method(0, Method::ConnectionOpen { virtual_host: "/".to_string() })
            .await;
        let open_ok = client.recv_method().await;
        assert!(matches!(open_ok, Method::ConnectionOpenOk), "got {open_ok:?}");

        client.send_method(1, Method::ChannelOpen).await;
        let channel_ok = client.recv_method().await;
        assert!(matches!(channel_ok, Method::ChannelOpenOk), "got {channel_ok:?}");

        client
    }

    pub async fn send(&mut self, channel_id: u16, frame: Frame) {
        self.transport.send((channel_id, frame)).await.expect("send frame");
    }

    pub async fn send_method(&mut self, channel_id: u16, method: Method) {
        self.send(channel_id, Frame::Method(method)).await;
    }

    pub async fn recv_frame(&mut self) -> (u16, Frame) {
        timeout(RECV_TIMEOUT, self.transport.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("decode error")
    }

    /// Next method frame, skipping heartbeats.
    pub async fn recv_method(&mut self) -> Method {
        loop {
            match self.recv_frame().await {
                (_, Frame::Method(method)) => return method,
                (_, Frame::Heartbeat) => continue,
                (_, frame) => panic!("expected method frame, got {frame:?}"),
            }
        }
    }

    /// True if a frame shows up within `wait`; used to assert silence.
    pub async fn expect_no_frame(&mut self, wait: Duration) {
        let received = timeout(wait, self.transport.next()).await;
        assert!(received.is_err(), "expected no frame, got {received:?}");
    }

    pub async fn declare_queue(&mut self, queue: &str) -> String {
        self.send_method(
            self.channel_id,
            Method::QueueDeclare {
                queue: queue.to_string(),
                passive: false,
                durable: false,
                exclusive: false,
                auto_delete: false,
                no_wait: false,
                arguments: FieldTable::new(),
            },
        )
        .await;
        let reply = self.recv_method().await;
        let Method::QueueDeclareOk { queue, .. } = reply else {
            panic!("expected Queue.DeclareOk, got {reply:?}");
        };
        queue
    }

    pub async fn declare_exchange(&mut self, exchange: &str, kind: &str) {
        self.send_method(
            self.channel_id,
            Method::ExchangeDeclare {
                exchange: exchange.to_string(),
                kind: kind.to_string(),
                passive: false,
                durable: false,
                auto_delete: false,
                internal: false,
                no_wait: false,
                arguments: FieldTable::new(),
            },
        )
        .await;
        let reply = self.recv_method().await;
        assert!(matches!(reply, Method::ExchangeDeclareOk), "got {reply:?}");
    }

    pub async fn queue_bind(&mut self, queue: &str, exchange: &str, routing_key: &str) {
        self.send_method(
            self.channel_id,
            Method::QueueBind {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                no_wait: false,
                arguments: FieldTable::new(),
            },
        )
        .await;
        let reply = self.recv_method().await;
        assert!(matches!(reply, Method::QueueBindOk), "got {reply:?}");
    }

    async fn send_publish_frames(&mut self, body: &[u8], exchange: &str, routing_key: &str) {
        self.send_method(
            self.channel_id,
            Method::BasicPublish {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                mandatory: false,
                immediate: false,
            },
        )
        .await;
        let header = ContentHeader::new(body.len() as u64, BasicProperties::default());
        self.send(self.channel_id, Frame::Header(header)).await;
        self.send(self.channel_id, Frame::Body(Bytes::copy_from_slice(body))).await;
    }

    /// Publish and wait for the broker's confirm; returns the confirm tag.
    pub async fn publish(&mut self, body: &[u8], exchange: &str, routing_key: &str) -> u64 {
        self.send_publish_frames(body, exchange, routing_key).await;
        let reply = self.recv_method().await;
        let Method::BasicAck { delivery_tag, .. } = reply else {
            panic!("expected publisher confirm, got {reply:?}");
        };
        delivery_tag
    }

    /// Publish without waiting for a confirm (transaction mode).
    pub async fn publish_unconfirmed(&mut self, body: &[u8], exchange: &str, routing_key: &str) {
        self.send_publish_frames(body, exchange, routing_key).await;
    }

    pub async fn consume(&mut self, queue: &str, consumer_tag: &str) -> String {
        self.send_method(
            self.channel_id,
            Method::BasicConsume {
                queue: queue.to_string(),
                consumer_tag: consumer_tag.to_string(),
                no_local: false,
                no_ack: false,
                exclusive: false,
                no_wait: false,
                arguments: FieldTable::new(),
            },
        )
        .await;
        let reply = self.recv_method().await;
        let Method::BasicConsumeOk { consumer_tag } = reply else {
            panic!("expected Basic.ConsumeOk, got {reply:?}");
        };
        consumer_tag
    }

    /// Read one full Deliver + Header + Body sequence.
    pub async fn next_delivery(&mut self) -> Delivery {
        let deliver = self.recv_method().await;
        let Method::BasicDeliver { consumer_tag, delivery_tag, exchange, routing_key, .. } = deliver
        else {
            panic!("expected Basic.Deliver, got {deliver:?}");
        };
        let (_, header) = self.recv_frame().await;
        let Frame::Header(header) = header else {
            panic!("expected content header, got {header:?}");
        };
        let mut body = bytes::BytesMut::new();
        while (body.len() as u64) < header.body_size {
            let (_, frame) = self.recv_frame().await;
            let Frame::Body(chunk) = frame else {
                panic!("expected content body, got {frame:?}");
            };
            body.extend_from_slice(&chunk);
        }
        Delivery {
            consumer_tag,
            delivery_tag,
            exchange,
            routing_key,
            body: body.freeze(),
        }
    }

    pub async fn ack(&mut self, delivery_tag: u64) {
        self.send_method(self.channel_id, Method::BasicAck { delivery_tag, multiple: false })
            .await;
    }

    pub async fn nack(&mut self, delivery_tag: u64) {
        self.send_method(
            self.channel_id,
            Method::BasicNack { delivery_tag, multiple: false, requeue: false },
        )
        .await;
    }

    /// Cancel the consumer, discarding deliveries already in flight.
    pub async fn cancel(&mut self, consumer_tag: &str) {
        self.send_method(
            self.channel_id,
            Method::BasicCancel { consumer_tag: consumer_tag.to_string(), no_wait: false },
        )
        .await;
        loop {
            match self.recv_frame().await {
                (_, Frame::Method(Method::BasicCancelOk { .. })) => return,
                // deliveries racing the cancel: skip their frames
                (_, Frame::Method(Method::BasicDeliver { .. }))
                | (_, Frame::Header(_))
                | (_, Frame::Body(_))
                | (_, Frame::Heartbeat) => continue,
                (_, other) => panic!("expected Basic.CancelOk, got {other:?}"),
            }
        }
    }

    pub async fn tx_select(&mut self) {
        self.send_method(self.channel_id, Method::TxSelect).await;
        let reply = self.recv_method().await;
        assert!(matches!(reply, Method::TxSelectOk), "got {reply:?}");
    }

    pub async fn tx_commit(&mut self) {
        self.send_method(self.channel_id, Method::TxCommit).await;
        let reply = self.recv_method().await;
        assert!(matches!(reply, Method::TxCommitOk), "got {reply:?}");
    }

    pub async fn tx_rollback(&mut self) {
        self.send_method(self.channel_id, Method::TxRollback).await;
        let reply = self.recv_method().await;
        assert!(matches!(reply, Method::TxRollbackOk), "got {reply:?}");
    }

    pub async fn basic_qos(&mut self, prefetch_count: u16) {
        self.send_method(
            self.channel_id,
            Method::BasicQos { prefetch_size: 0, prefetch_count, global: false },
        )
        .await;
        let reply = self.recv_method().await;
        assert!(matches!(reply, Method::BasicQosOk), "got {reply:?}");
    }

    pub async fn confirm_select(&mut self) {
        self.send_method(self.channel_id, Method::ConfirmSelect { no_wait: false }).await;
        let reply = self.recv_method().await;
        assert!(matches!(reply, Method::ConfirmSelectOk), "got {reply:?}");
    }

    /// Client-initiated close; waits for the broker's CloseOk.
    pub async fn close(mut self) {
        self.send_method(
            0,
            Method::ConnectionClose {
                reply_code: 200,
                reply_text: "Normal shutdown".to_string(),
                class_id: 0,
                method_id: 0,
            },
        )
        .await;
        loop {
            // drain anything racing the close
            if let (_, Frame::Method(Method::ConnectionCloseOk)) = self.recv_frame().await {
                return;
            }
        }
    }

    /// Wait for a server-initiated Connection.Close, acknowledge it and
    /// read until the socket is gone.
    pub async fn expect_server_close(mut self) {
        loop {
            match timeout(RECV_TIMEOUT, self.transport.next())
                .await
                .expect("timed out waiting for Connection.Close")
            {
                Some(Ok((_, Frame::Method(Method::ConnectionClose { .. })))) => break,
                Some(Ok(_)) => continue,
                Some(Err(error)) => panic!("decode error while waiting for close: {error}"),
                None => return,
            }
        }
        self.send_method(0, Method::ConnectionCloseOk).await;
        while let Ok(Some(_)) = timeout(RECV_TIMEOUT, self.transport.next()).await {}
    }
}
