//! On-disk record framing.
//!
//! A recording file is a bare sequence of frames:
//!
//! ```text
//! +----------------+-------------------------------------------+
//! | len: u32 (LE)  | MessagePack map {"id": str, "fields": {}} |
//! +----------------+-------------------------------------------+
//! ```
//!
//! Field values are stored as MessagePack `bin` and are opaque to the codec;
//! [`decode_field`] re-decodes one on demand. There is no file header or
//! footer, so any prefix of a file that ends on a frame boundary is itself a
//! valid recording. A trailing frame that is only partially on disk is
//! treated as not yet written.

use crate::error::{Result, SpoolError};
use base64::Engine;
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{ErrorKind, Read};

/// Size of the length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest record body accepted on write or read.
pub const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

/// One captured stream entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Stream position, `<millis>-<seq>`.
    pub id: String,
    pub fields: BTreeMap<String, ByteBuf>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field insertion.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.fields.insert(key.into(), ByteBuf::from(value.into()));
        self
    }
}

/// Encode a record into a complete frame, length prefix included.
pub fn encode(record: &Record) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec_named(record)
        .map_err(|e| SpoolError::Validation(format!("record {} not encodable: {}", record.id, e)))?;

    if body.len() > MAX_RECORD_LEN {
        return Err(SpoolError::Validation(format!(
            "record {} is {} bytes, limit is {}",
            record.id,
            body.len(),
            MAX_RECORD_LEN
        )));
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Encode a structured value as a MessagePack field payload.
pub fn encode_field(value: &serde_json::Value) -> Result<Vec<u8>> {
    rmp_serde::to_vec(value).map_err(|e| SpoolError::Validation(format!("field not encodable: {}", e)))
}

/// Decode one opaque field payload into a structured value.
pub fn decode_field(bytes: &[u8]) -> std::result::Result<FieldData, rmp_serde::decode::Error> {
    rmp_serde::from_slice(bytes)
}

/// A decoded MessagePack field.
///
/// Wider than JSON: `bin` payloads stay binary, and map keys of any type are
/// kept (rendered as strings).
#[derive(Debug, Clone, PartialEq)]
pub enum FieldData {
    Nil,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<FieldData>),
    Map(BTreeMap<String, FieldData>),
}

impl FieldData {
    /// Plain JSON view used by transforms. Binary becomes an array of byte
    /// values.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            FieldData::Nil => Value::Null,
            FieldData::Bool(b) => Value::Bool(*b),
            FieldData::Int(i) => Value::from(*i),
            FieldData::UInt(u) => Value::from(*u),
            FieldData::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FieldData::Str(s) => Value::String(s.clone()),
            FieldData::Bytes(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
            FieldData::Array(items) => Value::Array(items.iter().map(FieldData::to_json).collect()),
            FieldData::Map(map) => Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    fn into_key(self) -> String {
        match self {
            FieldData::Str(s) => s,
            FieldData::Nil => "null".to_string(),
            FieldData::Bool(b) => b.to_string(),
            FieldData::Int(i) => i.to_string(),
            FieldData::UInt(u) => u.to_string(),
            FieldData::Float(f) => f.to_string(),
            FieldData::Bytes(bytes) => base64_text(&bytes),
            other => other.to_json().to_string(),
        }
    }
}

impl From<serde_json::Value> for FieldData {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => FieldData::Nil,
            Value::Bool(b) => FieldData::Bool(b),
            Value::Number(n) => match (n.as_u64(), n.as_i64()) {
                (Some(u), _) => FieldData::UInt(u),
                (None, Some(i)) => FieldData::Int(i),
                _ => FieldData::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => FieldData::Str(s),
            Value::Array(items) => FieldData::Array(items.into_iter().map(FieldData::from).collect()),
            Value::Object(map) => {
                FieldData::Map(map.into_iter().map(|(k, v)| (k, FieldData::from(v))).collect())
            }
        }
    }
}

fn base64_text(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// JSON responses carry binary as base64 text.
impl Serialize for FieldData {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            FieldData::Nil => serializer.serialize_unit(),
            FieldData::Bool(b) => serializer.serialize_bool(*b),
            FieldData::Int(i) => serializer.serialize_i64(*i),
            FieldData::UInt(u) => serializer.serialize_u64(*u),
            FieldData::Float(f) => serializer.serialize_f64(*f),
            FieldData::Str(s) => serializer.serialize_str(s),
            FieldData::Bytes(bytes) => serializer.serialize_str(&base64_text(bytes)),
            FieldData::Array(items) => serializer.collect_seq(items),
            FieldData::Map(map) => serializer.collect_map(map),
        }
    }
}

impl<'de> Deserialize<'de> for FieldData {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(FieldVisitor)
    }
}

struct FieldVisitor;

impl<'de> Visitor<'de> for FieldVisitor {
    type Value = FieldData;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a MessagePack value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<FieldData, E> {
        Ok(FieldData::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<FieldData, E> {
        Ok(FieldData::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<FieldData, E> {
        Ok(FieldData::UInt(v))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<FieldData, E> {
        Ok(FieldData::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<FieldData, E> {
        Ok(FieldData::Str(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<FieldData, E> {
        Ok(FieldData::Str(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<FieldData, E> {
        Ok(FieldData::Bytes(v.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> std::result::Result<FieldData, E> {
        Ok(FieldData::Bytes(v))
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<FieldData, E> {
        Ok(FieldData::Nil)
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<FieldData, E> {
        Ok(FieldData::Nil)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> std::result::Result<FieldData, D::Error> {
        FieldData::deserialize(d)
    }

    fn visit_newtype_struct<D: Deserializer<'de>>(
        self,
        d: D,
    ) -> std::result::Result<FieldData, D::Error> {
        FieldData::deserialize(d)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<FieldData, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(4096));
        while let Some(item) = seq.next_element::<FieldData>()? {
            items.push(item);
        }
        Ok(FieldData::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<FieldData, A::Error> {
        let mut out = BTreeMap::new();
        while let Some((key, value)) = map.next_entry::<FieldData, FieldData>()? {
            out.insert(key.into_key(), value);
        }
        Ok(FieldData::Map(out))
    }
}

/// Streaming frame reader.
///
/// Yields records until the underlying reader runs out of bytes. Stops after
/// the first error.
pub struct RecordReader<R> {
    inner: R,
    offset: u64,
    done: bool,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            offset: 0,
            done: false,
        }
    }

    /// Byte offset of the next frame.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read the next complete frame. `Ok(None)` at end of data, including
    /// when only part of a frame is present.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        if read_up_to(&mut self.inner, &mut header)? < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_le_bytes(header) as usize;
        if len > MAX_RECORD_LEN {
            return Err(SpoolError::Corrupt {
                offset: self.offset,
                message: format!("frame length {} exceeds limit {}", len, MAX_RECORD_LEN),
            });
        }

        let mut body = vec![0u8; len];
        if read_up_to(&mut self.inner, &mut body)? < len {
            return Ok(None);
        }

        let record: Record = rmp_serde::from_slice(&body).map_err(|e| SpoolError::Corrupt {
            offset: self.offset,
            message: e.to_string(),
        })?;

        self.offset += (FRAME_HEADER_LEN + len) as u64;
        Ok(Some(record))
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Fill `buf` as far as the reader allows; returns bytes read.
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
