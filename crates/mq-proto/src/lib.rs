//! AMQP 0-9-1 wire framing.
//!
//! A streaming codec over the subset of the protocol the mock broker
//! speaks: the 8-byte protocol greeting, method frames for the connection /
//! channel / exchange / queue / basic / confirm / tx classes, content
//! headers with basic-properties, opaque content bodies, and heartbeats.
//! The reader yields `(channel_id, Frame)` tuples; encoding is the exact
//! inverse of decoding.

use thiserror::Error;

mod frame;
mod method;
mod properties;
mod types;

pub use frame::{AmqpCodec, ContentHeader, Frame};
pub use method::Method;
pub use properties::BasicProperties;
pub use types::FieldTable;

/// The 8-byte greeting a client sends before any frame: AMQP 0-9-1.
pub const PROTOCOL_HEADER: &[u8; 8] = b"AMQP\x00\x00\x09\x01";

/// Byte closing every frame.
pub const FRAME_END: u8 = 0xCE;

pub const FRAME_METHOD: u8 = 1;
pub const FRAME_HEADER: u8 = 2;
pub const FRAME_BODY: u8 = 3;
pub const FRAME_HEARTBEAT: u8 = 8;

pub const CLASS_CONNECTION: u16 = 10;
pub const CLASS_CHANNEL: u16 = 20;
pub const CLASS_EXCHANGE: u16 = 40;
pub const CLASS_QUEUE: u16 = 50;
pub const CLASS_BASIC: u16 = 60;
pub const CLASS_CONFIRM: u16 = 85;
pub const CLASS_TX: u16 = 90;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("frame payload truncated")]
    Truncated,

    #[error("invalid frame end marker: {0:#04x}")]
    BadFrameEnd(u8),

    #[error("unknown frame type: {0}")]
    UnknownFrameType(u8),

    #[error("invalid protocol header")]
    BadProtocolHeader,

    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("unsupported field-table value tag: {0:#04x}")]
    UnsupportedFieldType(u8),

    #[error("unexpected content header class: {0}")]
    UnexpectedHeaderClass(u16),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProtoError>;
