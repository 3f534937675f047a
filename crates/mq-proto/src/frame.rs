//! Frame layer: `type(1) channel(2) size(4) payload size frame-end(0xCE)`,
//! preceded on a fresh stream by the 8-byte protocol greeting.
//!
//! `AmqpCodec` is a streaming parser: with insufficient input it returns
//! `Ok(None)` without consuming; malformed bytes inside an otherwise
//! complete frame fail with a decode error that aborts the connection.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::method::Method;
use crate::properties::BasicProperties;
use crate::types::{get_u16, get_u64};
use crate::{
    ProtoError, Result, CLASS_BASIC, FRAME_BODY, FRAME_END, FRAME_HEADER, FRAME_HEARTBEAT,
    FRAME_METHOD, PROTOCOL_HEADER,
};

/// Content header frame: body size plus basic-properties.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentHeader {
    pub body_size: u64,
    pub properties: BasicProperties,
}

impl ContentHeader {
    pub fn new(body_size: u64, properties: BasicProperties) -> Self {
        Self { body_size, properties }
    }

    fn decode(payload: &mut Bytes) -> Result<Self> {
        let class_id = get_u16(payload)?;
        if class_id != CLASS_BASIC {
            return Err(ProtoError::UnexpectedHeaderClass(class_id));
        }
        let _weight = get_u16(payload)?;
        let body_size = get_u64(payload)?;
        let properties = BasicProperties::decode(payload)?;
        Ok(Self { body_size, properties })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(CLASS_BASIC);
        buf.put_u16(0);
        buf.put_u64(self.body_size);
        self.properties.encode(buf);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// The 8-byte greeting. Carries no channel; reported on channel 0.
    ProtocolHeader,
    Method(Method),
    Header(ContentHeader),
    Body(Bytes),
    Heartbeat,
}

/// Streaming frame codec; items are `(channel_id, frame)` pairs.
///
/// The server-side codec expects the protocol greeting first; a client-side
/// codec (`AmqpCodec::client()`) starts directly at frames.
#[derive(Debug)]
pub struct AmqpCodec {
    header_received: bool,
}

impl AmqpCodec {
    pub fn new() -> Self {
        Self { header_received: false }
    }

    pub fn client() -> Self {
        Self { header_received: true }
    }
}

impl Default for AmqpCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for AmqpCodec {
    type Item = (u16, Frame);
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<(u16, Frame)>> {
        if !self.header_received {
            if src.len() < PROTOCOL_HEADER.len() {
                return Ok(None);
            }
            let greeting = src.split_to(PROTOCOL_HEADER.len());
            if greeting[..] != PROTOCOL_HEADER[..] {
                return Err(ProtoError::BadProtocolHeader);
            }
            self.header_received = true;
            return Ok(Some((0, Frame::ProtocolHeader)));
        }

        if src.len() < 7 {
            return Ok(None);
        }
        let size = u32::from_be_bytes([src[3], src[4], src[5], src[6]]) as usize;
        let total = 7 + size + 1;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let raw = src.split_to(total).freeze();
        let frame_type = raw[0];
        let channel_id = u16::from_be_bytes([raw[1], raw[2]]);
        let end = raw[total - 1];
        if end != FRAME_END {
            return Err(ProtoError::BadFrameEnd(end));
        }
        let mut payload = raw.slice(7..total - 1);

        let frame = match frame_type {
            FRAME_METHOD => Frame::Method(Method::decode(&mut payload)?),
            FRAME_HEADER => Frame::Header(ContentHeader::decode(&mut payload)?),
            FRAME_BODY => Frame::Body(payload),
            FRAME_HEARTBEAT => Frame::Heartbeat,
            other => return Err(ProtoError::UnknownFrameType(other)),
        };
        Ok(Some((channel_id, frame)))
    }
}

impl Encoder<(u16, Frame)> for AmqpCodec {
    type Error = ProtoError;

    fn encode(&mut self, item: (u16, Frame), dst: &mut BytesMut) -> Result<()> {
        let (channel_id, frame) = item;
        let (frame_type, payload) = match frame {
            Frame::ProtocolHeader => {
                dst.put_slice(PROTOCOL_HEADER);
                return Ok(());
            }
            Frame::Method(method) => {
                let mut payload = BytesMut::new();
                method.encode(&mut payload);
                (FRAME_METHOD, payload)
            }
            Frame::Header(header) => {
                let mut payload = BytesMut::new();
                header.encode(&mut payload);
                (FRAME_HEADER, payload)
            }
            Frame::Body(body) => (FRAME_BODY, BytesMut::from(&body[..])),
            Frame::Heartbeat => (FRAME_HEARTBEAT, BytesMut::new()),
        };

        dst.reserve(7 + payload.len() + 1);
        dst.put_u8(frame_type);
        dst.put_u16(channel_id);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        dst.put_u8(FRAME_END);
        Ok(())
    }
}
