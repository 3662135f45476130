//! Range reads over recording files.

use crate::codec::{self, FieldData, Record};
use crate::error::Result;
use crate::store::RecordingStore;
use base64::Engine;
use serde::ser::{Serialize, Serializer};
use std::collections::BTreeMap;

/// A field as returned to callers: raw bytes, or decoded when requested.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Raw(Vec<u8>),
    Decoded(FieldData),
}

impl FieldValue {
    /// Structured view used by transforms. Raw bytes become an array of
    /// byte values.
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            FieldValue::Raw(bytes) => {
                serde_json::Value::Array(bytes.iter().map(|b| serde_json::Value::from(*b)).collect())
            }
            FieldValue::Decoded(data) => data.to_json(),
        }
    }
}

/// Raw bytes serialize as base64 text so JSON responses stay compact.
impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            FieldValue::Raw(bytes) => {
                serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
            }
            FieldValue::Decoded(data) => data.serialize(serializer),
        }
    }
}

/// One record at an ordinal position in its file.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Entry {
    pub index: u64,
    pub id: String,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Entry {
    /// Fields that are not valid MessagePack stay raw; the frame itself was
    /// intact, so this is not corruption.
    fn from_record(index: u64, record: Record, decode: bool) -> Self {
        let mut fields = BTreeMap::new();
        for (key, bytes) in record.fields {
            let value = if decode {
                match codec::decode_field(&bytes) {
                    Ok(data) => FieldValue::Decoded(data),
                    Err(e) => {
                        tracing::debug!(field = %key, entry = index, error = %e, "field left undecoded");
                        FieldValue::Raw(bytes.into_vec())
                    }
                }
            } else {
                FieldValue::Raw(bytes.into_vec())
            };
            fields.insert(key, value);
        }
        Self {
            index,
            id: record.id,
            fields,
        }
    }
}

/// Read entries `start..=stop` (through end of file when `stop` is `None`).
///
/// Safe to call while the recording is still being written; the result is
/// whatever complete prefix is on disk.
pub fn read(
    store: &RecordingStore,
    name: &str,
    start: u64,
    stop: Option<u64>,
    decode: bool,
) -> Result<Vec<Entry>> {
    let mut reader = store.open_reader(name)?;
    let mut entries = Vec::new();
    let mut index = 0u64;

    if stop.is_some_and(|s| s < start) {
        return Ok(entries);
    }

    loop {
        let Some(record) = reader.next_record()? else {
            break;
        };
        if index >= start {
            entries.push(Entry::from_record(index, record, decode));
        }
        if stop.is_some_and(|s| index >= s) {
            break;
        }
        index += 1;
    }

    tracing::debug!(recording.name = %name, start, ?stop, entries = entries.len(), "read recording");
    Ok(entries)
}
