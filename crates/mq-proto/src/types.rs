//! Wire primitives: integers, short/long strings, field tables.
//!
//! Field tables map to `serde_json` values so properties and
//! server/client capability tables stay uniform with the rest of the data
//! model. Decoding accepts the full RabbitMQ tag dialect; encoding emits
//! the subset a JSON value can express.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::{Map, Number, Value};

use crate::{ProtoError, Result};

pub type FieldTable = Map<String, Value>;

pub(crate) fn get_u8(buf: &mut Bytes) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(ProtoError::Truncated);
    }
    Ok(buf.get_u8())
}

pub(crate) fn get_u16(buf: &mut Bytes) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(ProtoError::Truncated);
    }
    Ok(buf.get_u16())
}

pub(crate) fn get_u32(buf: &mut Bytes) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(ProtoError::Truncated);
    }
    Ok(buf.get_u32())
}

pub(crate) fn get_u64(buf: &mut Bytes) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(ProtoError::Truncated);
    }
    Ok(buf.get_u64())
}

pub(crate) fn get_bytes(buf: &mut Bytes, len: usize) -> Result<Bytes> {
    if buf.remaining() < len {
        return Err(ProtoError::Truncated);
    }
    Ok(buf.split_to(len))
}

pub(crate) fn read_shortstr(buf: &mut Bytes) -> Result<String> {
    let len = get_u8(buf)? as usize;
    let raw = get_bytes(buf, len)?;
    String::from_utf8(raw.to_vec()).map_err(|_| ProtoError::InvalidUtf8("shortstr"))
}

pub(crate) fn read_longstr(buf: &mut Bytes) -> Result<String> {
    let len = get_u32(buf)? as usize;
    let raw = get_bytes(buf, len)?;
    String::from_utf8(raw.to_vec()).map_err(|_| ProtoError::InvalidUtf8("longstr"))
}

pub(crate) fn write_shortstr(buf: &mut BytesMut, value: &str) {
    debug_assert!(value.len() <= u8::MAX as usize);
    buf.put_u8(value.len() as u8);
    buf.put_slice(value.as_bytes());
}

pub(crate) fn write_longstr(buf: &mut BytesMut, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

pub(crate) fn read_table(buf: &mut Bytes) -> Result<FieldTable> {
    let len = get_u32(buf)? as usize;
    let mut inner = get_bytes(buf, len)?;
    let mut table = FieldTable::new();
    while inner.has_remaining() {
        let key = read_shortstr(&mut inner)?;
        let value = read_field_value(&mut inner)?;
        table.insert(key, value);
    }
    Ok(table)
}

fn read_field_value(buf: &mut Bytes) -> Result<Value> {
    let tag = get_u8(buf)?;
    Ok(match tag {
        b't' => Value::Bool(get_u8(buf)? != 0),
        b'b' => Value::from(get_u8(buf)? as i8),
        b'B' => Value::from(get_u8(buf)?),
        b's' => Value::from(get_u16(buf)? as i16),
        b'u' => Value::from(get_u16(buf)?),
        b'I' => Value::from(get_u32(buf)? as i32),
        b'i' => Value::from(get_u32(buf)?),
        b'l' => Value::from(get_u64(buf)? as i64),
        b'f' => json_number(f32::from_bits(get_u32(buf)?) as f64),
        b'd' => json_number(f64::from_bits(get_u64(buf)?)),
        b'D' => {
            let scale = get_u8(buf)? as i32;
            let raw = get_u32(buf)? as i32;
            json_number(raw as f64 / 10f64.powi(scale))
        }
        b'S' => Value::String(read_longstr(buf)?),
        b'T' => Value::from(get_u64(buf)?),
        b'A' => {
            let len = get_u32(buf)? as usize;
            let mut inner = get_bytes(buf, len)?;
            let mut items = Vec::new();
            while inner.has_remaining() {
                items.push(read_field_value(&mut inner)?);
            }
            Value::Array(items)
        }
        b'x' => {
            let len = get_u32(buf)? as usize;
            let raw = get_bytes(buf, len)?;
            Value::Array(raw.iter().map(|b| Value::from(*b)).collect())
        }
        b'F' => Value::Object(read_table(buf)?),
        b'V' => Value::Null,
        other => return Err(ProtoError::UnsupportedFieldType(other)),
    })
}

fn json_number(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

pub(crate) fn write_table(buf: &mut BytesMut, table: &FieldTable) {
    let mut inner = BytesMut::new();
    for (key, value) in table {
        write_shortstr(&mut inner, key);
        write_field_value(&mut inner, value);
    }
    buf.put_u32(inner.len() as u32);
    buf.put_slice(&inner);
}

fn write_field_value(buf: &mut BytesMut, value: &Value) {
    match value {
        Value::Bool(flag) => {
            buf.put_u8(b't');
            buf.put_u8(*flag as u8);
        }
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                buf.put_u8(b'l');
                buf.put_u64(int as u64);
            } else {
                buf.put_u8(b'd');
                buf.put_u64(number.as_f64().unwrap_or(0.0).to_bits());
            }
        }
        Value::String(text) => {
            buf.put_u8(b'S');
            write_longstr(buf, text);
        }
        Value::Array(items) => {
            buf.put_u8(b'A');
            let mut inner = BytesMut::new();
            for item in items {
                write_field_value(&mut inner, item);
            }
            buf.put_u32(inner.len() as u32);
            buf.put_slice(&inner);
        }
        Value::Object(table) => {
            buf.put_u8(b'F');
            write_table(buf, table);
        }
        Value::Null => {
            buf.put_u8(b'V');
        }
    }
}
