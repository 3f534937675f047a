//! Method frames: class + method id plus arguments.
//!
//! Only the methods the mock speaks are modeled; anything else that still
//! parses as a frame decodes to `Method::Unknown` so the connection can
//! ignore it instead of dying.

use bytes::{BufMut, Bytes, BytesMut};

use crate::types::{
    get_u16, get_u32, get_u64, get_u8, read_longstr, read_shortstr, read_table, write_longstr,
    write_shortstr, write_table, FieldTable,
};
use crate::{
    Result, CLASS_BASIC, CLASS_CHANNEL, CLASS_CONFIRM, CLASS_CONNECTION, CLASS_EXCHANGE,
    CLASS_QUEUE, CLASS_TX,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    ConnectionStart {
        version_major: u8,
        version_minor: u8,
        server_properties: FieldTable,
        mechanisms: String,
        locales: String,
    },
    ConnectionStartOk {
        client_properties: FieldTable,
        mechanism: String,
        response: String,
        locale: String,
    },
    ConnectionTune {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionTuneOk {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionOpen {
        virtual_host: String,
    },
    ConnectionOpenOk,
    ConnectionClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ConnectionCloseOk,

    ChannelOpen,
    ChannelOpenOk,
    ChannelClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ChannelCloseOk,

    ExchangeDeclare {
        exchange: String,
        kind: String,
        passive: bool,
        durable: bool,
        auto_delete: bool,
        internal: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    ExchangeDeclareOk,

    QueueDeclare {
        queue: String,
        passive: bool,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    QueueDeclareOk {
        queue: String,
        message_count: u32,
        consumer_count: u32,
    },
    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
        no_wait: bool,
        arguments: FieldTable,
    },
    QueueBindOk,

    BasicQos {
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    },
    BasicQosOk,
    BasicConsume {
        queue: String,
        consumer_tag: String,
        no_local: bool,
        no_ack: bool,
        exclusive: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    BasicConsumeOk {
        consumer_tag: String,
    },
    BasicCancel {
        consumer_tag: String,
        no_wait: bool,
    },
    BasicCancelOk {
        consumer_tag: String,
    },
    BasicPublish {
        exchange: String,
        routing_key: String,
        mandatory: bool,
        immediate: bool,
    },
    BasicDeliver {
        consumer_tag: String,
        delivery_tag: u64,
        redelivered: bool,
        exchange: String,
        routing_key: String,
    },
    BasicAck {
        delivery_tag: u64,
        multiple: bool,
    },
    BasicNack {
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    },

    ConfirmSelect {
        no_wait: bool,
    },
    ConfirmSelectOk,

    TxSelect,
    TxSelectOk,
    TxCommit,
    TxCommitOk,
    TxRollback,
    TxRollbackOk,

    /// Parseable frame, method outside the handled set. Arguments skipped.
    Unknown {
        class_id: u16,
        method_id: u16,
    },
}

impl Method {
    pub fn ids(&self) -> (u16, u16) {
        match self {
            Method::ConnectionStart { .. } => (CLASS_CONNECTION, 10),
            Method::ConnectionStartOk { .. } => (CLASS_CONNECTION, 11),
            Method::ConnectionTune { .. } => (CLASS_CONNECTION, 30),
            Method::ConnectionTuneOk { .. } => (CLASS_CONNECTION, 31),
            Method::ConnectionOpen { .. } => (CLASS_CONNECTION, 40),
            Method::ConnectionOpenOk => (CLASS_CONNECTION, 41),
            Method::ConnectionClose { .. } => (CLASS_CONNECTION, 50),
            Method::ConnectionCloseOk => (CLASS_CONNECTION, 51),
            Method::ChannelOpen => (CLASS_CHANNEL, 10),
            Method::ChannelOpenOk => (CLASS_CHANNEL, 11),
            Method::ChannelClose { .. } => (CLASS_CHANNEL, 40),
            Method::ChannelCloseOk => (CLASS_CHANNEL, 41),
            Method::ExchangeDeclare { .. } => (CLASS_EXCHANGE, 10),
            Method::ExchangeDeclareOk => (CLASS_EXCHANGE, 11),
            Method::QueueDeclare { .. } => (CLASS_QUEUE, 10),
            Method::QueueDeclareOk { .. } => (CLASS_QUEUE, 11),
            Method::QueueBind { .. } => (CLASS_QUEUE, 20),
            Method::QueueBindOk => (CLASS_QUEUE, 21),
            Method::BasicQos { .. } => (CLASS_BASIC, 10),
            Method::BasicQosOk => (CLASS_BASIC, 11),
            Method::BasicConsume { .. } => (CLASS_BASIC, 20),
            Method::BasicConsumeOk { .. } => (CLASS_BASIC, 21),
            Method::BasicCancel { .. } => (CLASS_BASIC, 30),
            Method::BasicCancelOk { .. } => (CLASS_BASIC, 31),
            Method::BasicPublish { .. } => (CLASS_BASIC, 40),
            Method::BasicDeliver { .. } => (CLASS_BASIC, 60),
            Method::BasicAck { .. } => (CLASS_BASIC, 80),
            Method::BasicNack { .. } => (CLASS_BASIC, 120),
            Method::ConfirmSelect { .. } => (CLASS_CONFIRM, 10),
            Method::ConfirmSelectOk => (CLASS_CONFIRM, 11),
            Method::TxSelect => (CLASS_TX, 10),
            Method::TxSelectOk => (CLASS_TX, 11),
            Method::TxCommit => (CLASS_TX, 20),
            Method::TxCommitOk => (CLASS_TX, 21),
            Method::TxRollback => (CLASS_TX, 30),
            Method::TxRollbackOk => (CLASS_TX, 31),
            Method::Unknown { class_id, method_id } => (*class_id, *method_id),
        }
    }

    pub(crate) fn decode(payload: &mut Bytes) -> Result<Method> {
        let class_id = get_u16(payload)?;
        let method_id = get_u16(payload)?;
        let method = match (class_id, method_id) {
            (CLASS_CONNECTION, 10) => Method::ConnectionStart {
                version_major: get_u8(payload)?,
                version_minor: get_u8(payload)?,
                server_properties: read_table(payload)?,
                mechanisms: read_longstr(payload)?,
                locales: read_longstr(payload)?,
            },
            (CLASS_CONNECTION, 11) => Method::ConnectionStartOk {
                client_properties: read_table(payload)?,
                mechanism: read_shortstr(payload)?,
                response: read_longstr(payload)?,
                locale: read_shortstr(payload)?,
            },
            (CLASS_CONNECTION, 30) => Method::ConnectionTune {
                channel_max: get_u16(payload)?,
                frame_max: get_u32(payload)?,
                heartbeat: get_u16(payload)?,
            },
            (CLASS_CONNECTION, 31) => Method::ConnectionTuneOk {
                channel_max: get_u16(payload)?,
                frame_max: get_u32(payload)?,
                heartbeat: get_u16(payload)?,
            },
            (CLASS_CONNECTION, 40) => {
                let virtual_host = read_shortstr(payload)?;
                let _capabilities = read_shortstr(payload)?;
                let _insist = get_u8(payload)?;
                Method::ConnectionOpen { virtual_host }
            }
            (CLASS_CONNECTION, 41) => {
                let _known_hosts = read_shortstr(payload)?;
                Method::ConnectionOpenOk
            }
            (CLASS_CONNECTION, 50) => Method::ConnectionClose {
                reply_code: get_u16(payload)?,
                reply_text: read_shortstr(payload)?,
                class_id: get_u16(payload)?,
                method_id: get_u16(payload)?,
            },
            (CLASS_CONNECTION, 51) => Method::ConnectionCloseOk,

            (CLASS_CHANNEL, 10) => {
                let _out_of_band = read_shortstr(payload)?;
                Method::ChannelOpen
            }
            (CLASS_CHANNEL, 11) => {
                let _channel_id = read_longstr(payload)?;
                Method::ChannelOpenOk
            }
            (CLASS_CHANNEL, 40) => Method::ChannelClose {
                reply_code: get_u16(payload)?,
                reply_text: read_shortstr(payload)?,
                class_id: get_u16(payload)?,
                method_id: get_u16(payload)?,
            },
            (CLASS_CHANNEL, 41) => Method::ChannelCloseOk,

            (CLASS_EXCHANGE, 10) => {
                let _ticket = get_u16(payload)?;
                let exchange = read_shortstr(payload)?;
                let kind = read_shortstr(payload)?;
                let bits = get_u8(payload)?;
                Method::ExchangeDeclare {
                    exchange,
                    kind,
                    passive: bits & 0x01 != 0,
                    durable: bits & 0x02 != 0,
                    auto_delete: bits & 0x04 != 0,
                    internal: bits & 0x08 != 0,
                    no_wait: bits & 0x10 != 0,
                    arguments: read_table(payload)?,
                }
            }
            (CLASS_EXCHANGE, 11) => Method::ExchangeDeclareOk,

            (CLASS_QUEUE, 10) => {
                let _ticket = get_u16(payload)?;
                let queue = read_shortstr(payload)?;
                let bits = get_u8(payload)?;
                Method::QueueDeclare {
                    queue,
                    passive: bits & 0x01 != 0,
                    durable: bits & 0x02 != 0,
                    exclusive: bits & 0x04 != 0,
                    auto_delete: bits & 0x08 != 0,
                    no_wait: bits & 0x10 != 0,
                    arguments: read_table(payload)?,
                }
            }
            (CLASS_QUEUE, 11) => Method::QueueDeclareOk {
                queue: read_shortstr(payload)?,
                message_count: get_u32(payload)?,
                consumer_count: get_u32(payload)?,
            },
            (CLASS_QUEUE, 20) => {
                let _ticket = get_u16(payload)?;
                let queue = read_shortstr(payload)?;
                let exchange = read_shortstr(payload)?;
                let routing_key = read_shortstr(payload)?;
                let bits = get_u8(payload)?;
                Method::QueueBind {
                    queue,
                    exchange,
                    routing_key,
                    no_wait: bits & 0x01 != 0,
                    arguments: read_table(payload)?,
                }
            }
            (CLASS_QUEUE, 21) => Method::QueueBindOk,

            (CLASS_BASIC, 10) => Method::BasicQos {
                prefetch_size: get_u32(payload)?,
                prefetch_count: get_u16(payload)?,
                global: get_u8(payload)? & 0x01 != 0,
            },
            (CLASS_BASIC, 11) => Method::BasicQosOk,
            (CLASS_BASIC, 20) => {
                let _ticket = get_u16(payload)?;
                let queue = read_shortstr(payload)?;
                let consumer_tag = read_shortstr(payload)?;
                let bits = get_u8(payload)?;
                Method::BasicConsume {
                    queue,
                    consumer_tag,
                    no_local: bits & 0x01 != 0,
                    no_ack: bits & 0x02 != 0,
                    exclusive: bits & 0x04 != 0,
                    no_wait: bits & 0x08 != 0,
                    arguments: read_table(payload)?,
                }
            }
            (CLASS_BASIC, 21) => Method::BasicConsumeOk {
                consumer_tag: read_shortstr(payload)?,
            },
            (CLASS_BASIC, 30) => Method::BasicCancel {
                consumer_tag: read_shortstr(payload)?,
                no_wait: get_u8(payload)? & 0x01 != 0,
            },
            (CLASS_BASIC, 31) => Method::BasicCancelOk {
                consumer_tag: read_shortstr(payload)?,
            },
            (CLASS_BASIC, 40) => {
                let _ticket = get_u16(payload)?;
                let exchange = read_shortstr(payload)?;
                let routing_key = read_shortstr(payload)?;
                let bits = get_u8(payload)?;
                Method::BasicPublish {
                    exchange,
                    routing_key,
                    mandatory: bits & 0x01 != 0,
                    immediate: bits & 0x02 != 0,
                }
            }
            (CLASS_BASIC, 60) => Method::BasicDeliver {
                consumer_tag: read_shortstr(payload)?,
                delivery_tag: get_u64(payload)?,
                redelivered: get_u8(payload)? & 0x01 != 0,
                exchange: read_shortstr(payload)?,
                routing_key: read_shortstr(payload)?,
            },
            (CLASS_BASIC, 80) => Method::BasicAck {
                delivery_tag: get_u64(payload)?,
                multiple: get_u8(payload)? & 0x01 != 0,
            },
            (CLASS_BASIC, 120) => {
                let delivery_tag = get_u64(payload)?;
                let bits = get_u8(payload)?;
                Method::BasicNack {
                    delivery_tag,
                    multiple: bits & 0x01 != 0,
                    requeue: bits & 0x02 != 0,
                }
            }

            (CLASS_CONFIRM, 10) => Method::ConfirmSelect {
                no_wait: get_u8(payload)? & 0x01 != 0,
            },
            (CLASS_CONFIRM, 11) => Method::ConfirmSelectOk,

            (CLASS_TX, 10) => Method::TxSelect,
            (CLASS_TX, 11) => Method::TxSelectOk,
            (CLASS_TX, 20) => Method::TxCommit,
            (CLASS_TX, 21) => Method::TxCommitOk,
            (CLASS_TX, 30) => Method::TxRollback,
            (CLASS_TX, 31) => Method::TxRollbackOk,

            (class_id, method_id) => Method::Unknown { class_id, method_id },
        };
        Ok(method)
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        let (class_id, method_id) = self.ids();
        buf.put_u16(class_id);
        buf.put_u16(method_id);
        match self {
            Method::ConnectionStart {
                version_major,
                version_minor,
                server_properties,
                mechanisms,
                locales,
            } => {
                buf.put_u8(*version_major);
                buf.put_u8(*version_minor);
                write_table(buf, server_properties);
                write_longstr(buf, mechanisms);
                write_longstr(buf, locales);
            }
            Method::ConnectionStartOk {
                client_properties,
                mechanism,
                response,
                locale,
            } => {
                write_table(buf, client_properties);
                write_shortstr(buf, mechanism);
                write_longstr(buf, response);
                write_shortstr(buf, locale);
            }
            Method::ConnectionTune { channel_max, frame_max, heartbeat }
            | Method::ConnectionTuneOk { channel_max, frame_max, heartbeat } => {
                buf.put_u16(*channel_max);
                buf.put_u32(*frame_max);
                buf.put_u16(*heartbeat);
            }
            Method::ConnectionOpen { virtual_host } => {
                write_shortstr(buf, virtual_host);
                write_shortstr(buf, "");
                buf.put_u8(0);
            }
            Method::ConnectionOpenOk => {
                write_shortstr(buf, "");
            }
            Method::ConnectionClose { reply_code, reply_text, class_id, method_id }
            | Method::ChannelClose { reply_code, reply_text, class_id, method_id } => {
                buf.put_u16(*reply_code);
                write_shortstr(buf, reply_text);
                buf.put_u16(*class_id);
                buf.put_u16(*method_id);
            }
            Method::ConnectionCloseOk => {}

            Method::ChannelOpen => {
                write_shortstr(buf, "");
            }
            Method::ChannelOpenOk => {
                write_longstr(buf, "");
            }
            Method::ChannelCloseOk => {}

            Method::ExchangeDeclare {
                exchange,
                kind,
                passive,
                durable,
                auto_delete,
                internal,
                no_wait,
                arguments,
            } => {
                buf.put_u16(0);
                write_shortstr(buf, exchange);
                write_shortstr(buf, kind);
                let mut bits = 0u8;
                bits |= *passive as u8;
                bits |= (*durable as u8) << 1;
                bits |= (*auto_delete as u8) << 2;
                bits |= (*internal as u8) << 3;
                bits |= (*no_wait as u8) << 4;
                buf.put_u8(bits);
                write_table(buf, arguments);
            }
            Method::ExchangeDeclareOk => {}

            Method::QueueDeclare {
                queue,
                passive,
                durable,
                exclusive,
                auto_delete,
                no_wait,
                arguments,
            } => {
                buf.put_u16(0);
                write_shortstr(buf, queue);
                let mut bits = 0u8;
                bits |= *passive as u8;
                bits |= (*durable as u8) << 1;
                bits |= (*exclusive as u8) << 2;
                bits |= (*auto_delete as u8) << 3;
                bits |= (*no_wait as u8) << 4;
                buf.put_u8(bits);
                write_table(buf, arguments);
            }
            Method::QueueDeclareOk { queue, message_count, consumer_count } => {
                write_shortstr(buf, queue);
                buf.put_u32(*message_count);
                buf.put_u32(*consumer_count);
            }
            Method::QueueBind { queue, exchange, routing_key, no_wait, arguments } => {
                buf.put_u16(0);
                write_shortstr(buf, queue);
                write_shortstr(buf, exchange);
                write_shortstr(buf, routing_key);
                buf.put_u8(*no_wait as u8);
                write_table(buf, arguments);
            }
            Method::QueueBindOk => {}

            Method::BasicQos { prefetch_size, prefetch_count, global } => {
                buf.put_u32(*prefetch_size);
                buf.put_u16(*prefetch_count);
                buf.put_u8(*global as u8);
            }
            Method::BasicQosOk => {}
            Method::BasicConsume {
                queue,
                consumer_tag,
                no_local,
                no_ack,
                exclusive,
                no_wait,
                arguments,
            } => {
                buf.put_u16(0);
                write_shortstr(buf, queue);
                write_shortstr(buf, consumer_tag);
                let mut bits = 0u8;
                bits |= *no_local as u8;
                bits |= (*no_ack as u8) << 1;
                bits |= (*exclusive as u8) << 2;
                bits |= (*no_wait as u8) << 3;
                buf.put_u8(bits);
                write_table(buf, arguments);
            }
            Method::BasicConsumeOk { consumer_tag } | Method::BasicCancelOk { consumer_tag } => {
                write_shortstr(buf, consumer_tag);
            }
            Method::BasicCancel { consumer_tag, no_wait } => {
                write_shortstr(buf, consumer_tag);
                buf.put_u8(*no_wait as u8);
            }
            Method::BasicPublish { exchange, routing_key, mandatory, immediate } => {
                buf.put_u16(0);
                write_shortstr(buf, exchange);
                write_shortstr(buf, routing_key);
                let mut bits = 0u8;
                bits |= *mandatory as u8;
                bits |= (*immediate as u8) << 1;
                buf.put_u8(bits);
            }
            Method::BasicDeliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
            } => {
                write_shortstr(buf, consumer_tag);
                buf.put_u64(*delivery_tag);
                buf.put_u8(*redelivered as u8);
                write_shortstr(buf, exchange);
                write_shortstr(buf, routing_key);
            }
            Method::BasicAck { delivery_tag, multiple } => {
                buf.put_u64(*delivery_tag);
                buf.put_u8(*multiple as u8);
            }
            Method::BasicNack { delivery_tag, multiple, requeue } => {
                buf.put_u64(*delivery_tag);
                let mut bits = 0u8;
                bits |= *multiple as u8;
                bits |= (*requeue as u8) << 1;
                buf.put_u8(bits);
            }

            Method::ConfirmSelect { no_wait } => {
                buf.put_u8(*no_wait as u8);
            }
            Method::ConfirmSelectOk
            | Method::TxSelect
            | Method::TxSelectOk
            | Method::TxCommit
            | Method::TxCommitOk
            | Method::TxRollback
            | Method::TxRollbackOk => {}

            Method::Unknown { .. } => {}
        }
    }
}
