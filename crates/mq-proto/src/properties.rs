//! Basic-class content properties.
//!
//! Encoded behind a 16-bit flag word in the content header; each set bit
//! is followed by that property's value, most-significant bit first.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::{Map, Value};

use crate::types::{
    get_u16, get_u64, get_u8, read_shortstr, read_table, write_shortstr, write_table, FieldTable,
};
use crate::Result;

const FLAG_CONTENT_TYPE: u16 = 1 << 15;
const FLAG_CONTENT_ENCODING: u16 = 1 << 14;
const FLAG_HEADERS: u16 = 1 << 13;
const FLAG_DELIVERY_MODE: u16 = 1 << 12;
const FLAG_PRIORITY: u16 = 1 << 11;
const FLAG_CORRELATION_ID: u16 = 1 << 10;
const FLAG_REPLY_TO: u16 = 1 << 9;
const FLAG_EXPIRATION: u16 = 1 << 8;
const FLAG_MESSAGE_ID: u16 = 1 << 7;
const FLAG_TIMESTAMP: u16 = 1 << 6;
const FLAG_TYPE: u16 = 1 << 5;
const FLAG_USER_ID: u16 = 1 << 4;
const FLAG_APP_ID: u16 = 1 << 3;
const FLAG_CLUSTER_ID: u16 = 1 << 2;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BasicProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: Option<FieldTable>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub cluster_id: Option<String>,
}

impl BasicProperties {
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        let flags = get_u16(buf)?;
        let mut properties = BasicProperties::default();
        if flags & FLAG_CONTENT_TYPE != 0 {
            properties.content_type = Some(read_shortstr(buf)?);
        }
        if flags & FLAG_CONTENT_ENCODING != 0 {
            properties.content_encoding = Some(read_shortstr(buf)?);
        }
        if flags & FLAG_HEADERS != 0 {
            properties.headers = Some(read_table(buf)?);
        }
        if flags & FLAG_DELIVERY_MODE != 0 {
            properties.delivery_mode = Some(get_u8(buf)?);
        }
        if flags & FLAG_PRIORITY != 0 {
            properties.priority = Some(get_u8(buf)?);
        }
        if flags & FLAG_CORRELATION_ID != 0 {
            properties.correlation_id = Some(read_shortstr(buf)?);
        }
        if flags & FLAG_REPLY_TO != 0 {
            properties.reply_to = Some(read_shortstr(buf)?);
        }
        if flags & FLAG_EXPIRATION != 0 {
            properties.expiration = Some(read_shortstr(buf)?);
        }
        if flags & FLAG_MESSAGE_ID != 0 {
            properties.message_id = Some(read_shortstr(buf)?);
        }
        if flags & FLAG_TIMESTAMP != 0 {
            properties.timestamp = Some(get_u64(buf)?);
        }
        if flags & FLAG_TYPE != 0 {
            properties.kind = Some(read_shortstr(buf)?);
        }
        if flags & FLAG_USER_ID != 0 {
            properties.user_id = Some(read_shortstr(buf)?);
        }
        if flags & FLAG_APP_ID != 0 {
            properties.app_id = Some(read_shortstr(buf)?);
        }
        if flags & FLAG_CLUSTER_ID != 0 {
            properties.cluster_id = Some(read_shortstr(buf)?);
        }
        Ok(properties)
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let mut flags = 0u16;
        let mut body = BytesMut::new();
        if let Some(value) = &self.content_type {
            flags |= FLAG_CONTENT_TYPE;
            write_shortstr(&mut body, value);
        }
        if let Some(value) = &self.content_encoding {
            flags |= FLAG_CONTENT_ENCODING;
            write_shortstr(&mut body, value);
        }
        if let Some(value) = &self.headers {
            flags |= FLAG_HEADERS;
            write_table(&mut body, value);
        }
        if let Some(value) = self.delivery_mode {
            flags |= FLAG_DELIVERY_MODE;
            body.put_u8(value);
        }
        if let Some(value) = self.priority {
            flags |= FLAG_PRIORITY;
            body.put_u8(value);
        }
        if let Some(value) = &self.correlation_id {
            flags |= FLAG_CORRELATION_ID;
            write_shortstr(&mut body, value);
        }
        if let Some(value) = &self.reply_to {
            flags |= FLAG_REPLY_TO;
            write_shortstr(&mut body, value);
        }
        if let Some(value) = &self.expiration {
            flags |= FLAG_EXPIRATION;
            write_shortstr(&mut body, value);
        }
        if let Some(value) = &self.message_id {
            flags |= FLAG_MESSAGE_ID;
            write_shortstr(&mut body, value);
        }
        if let Some(value) = self.timestamp {
            flags |= FLAG_TIMESTAMP;
            body.put_u64(value);
        }
        if let Some(value) = &self.kind {
            flags |= FLAG_TYPE;
            write_shortstr(&mut body, value);
        }
        if let Some(value) = &self.user_id {
            flags |= FLAG_USER_ID;
            write_shortstr(&mut body, value);
        }
        if let Some(value) = &self.app_id {
            flags |= FLAG_APP_ID;
            write_shortstr(&mut body, value);
        }
        if let Some(value) = &self.cluster_id {
            flags |= FLAG_CLUSTER_ID;
            write_shortstr(&mut body, value);
        }
        buf.put_u16(flags);
        buf.put_slice(&body);
    }

    /// Present fields as a JSON object, the shape the control API exposes.
    pub fn to_json(&self) -> Option<Value> {
        let mut map = Map::new();
        let mut put = |key: &str, value: Option<Value>| {
            if let Some(value) = value {
                map.insert(key.to_string(), value);
            }
        };
        put("content_type", self.content_type.clone().map(Value::from));
        put("content_encoding", self.content_encoding.clone().map(Value::from));
        put("headers", self.headers.clone().map(Value::Object));
        put("delivery_mode", self.delivery_mode.map(Value::from));
        put("priority", self.priority.map(Value::from));
        put("correlation_id", self.correlation_id.clone().map(Value::from));
        put("reply_to", self.reply_to.clone().map(Value::from));
        put("expiration", self.expiration.clone().map(Value::from));
        put("message_id", self.message_id.clone().map(Value::from));
        put("timestamp", self.timestamp.map(Value::from));
        put("type", self.kind.clone().map(Value::from));
        put("user_id", self.user_id.clone().map(Value::from));
        put("app_id", self.app_id.clone().map(Value::from));
        put("cluster_id", self.cluster_id.clone().map(Value::from));
        if map.is_empty() {
            None
        } else {
            Some(Value::Object(map))
        }
    }

    /// Rebuild properties from the JSON shape, ignoring unknown keys.
    pub fn from_json(value: Option<&Value>) -> Self {
        let Some(Value::Object(map)) = value else {
            return BasicProperties::default();
        };
        let text = |key: &str| map.get(key).and_then(Value::as_str).map(str::to_string);
        let octet = |key: &str| map.get(key).and_then(Value::as_u64).map(|v| v as u8);
        BasicProperties {
            content_type: text("content_type"),
            content_encoding: text("content_encoding"),
            headers: map.get("headers").and_then(Value::as_object).cloned(),
            delivery_mode: octet("delivery_mode"),
            priority: octet("priority"),
            correlation_id: text("correlation_id"),
            reply_to: text("reply_to"),
            expiration: text("expiration"),
            message_id: text("message_id"),
            timestamp: map.get("timestamp").and_then(Value::as_u64),
            kind: text("type"),
            user_id: text("user_id"),
            app_id: text("app_id"),
            cluster_id: text("cluster_id"),
        }
    }
}
