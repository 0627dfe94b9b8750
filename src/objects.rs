/// The stored/broadcast object envelope.
///
/// Every value lives inside `{created, updated, index, data}`. Glob reads
/// return a JSON array of envelopes ordered by most recent activity first.
use crate::error::SyncResult;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

/// A stored value with its timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    /// Nanosecond timestamp of the first write, kept across overwrites.
    pub created: i64,
    /// Nanosecond timestamp of the latest overwrite, `0` if never overwritten.
    pub updated: i64,
    /// Final path segment of the key.
    pub index: String,
    /// Application value, opaque to the engine.
    pub data: JsonValue,
}

impl Object {
    /// Create a new object.
    pub fn new(created: i64, updated: i64, index: impl Into<String>, data: JsonValue) -> Self {
        Self {
            created,
            updated,
            index: index.into(),
            data,
        }
    }

    /// The "key not found" sentinel.
    pub fn empty() -> Self {
        Self::new(0, 0, "", json!({}))
    }

    /// Whether this is the "key not found" sentinel.
    pub fn is_empty(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.index.is_empty()
    }

    /// Timestamp of the latest write touching this object.
    pub fn last_activity(&self) -> i64 {
        self.created.max(self.updated)
    }
}

/// Encoded form of [`Object::empty`].
pub const EMPTY_OBJECT: &[u8] = br#"{"created":0,"updated":0,"index":"","data":{}}"#;

/// An owned copy of [`EMPTY_OBJECT`].
pub fn empty() -> Vec<u8> {
    EMPTY_OBJECT.to_vec()
}

/// Whether `data` is the encoded empty sentinel.
pub fn is_empty(data: &[u8]) -> bool {
    data.is_empty() || decode(data).map(|obj| obj.is_empty()).unwrap_or(false)
}

/// Sort objects by most recent activity first.
pub fn sort(objects: &mut [Object]) {
    objects.sort_by(|a, b| b.last_activity().cmp(&a.last_activity()));
}

/// Encode an object or collection of objects.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> SyncResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode a single object.
pub fn decode(data: &[u8]) -> SyncResult<Object> {
    Ok(serde_json::from_slice(data)?)
}

/// Decode a collection of objects.
pub fn decode_list(data: &[u8]) -> SyncResult<Vec<Object>> {
    Ok(serde_json::from_slice(data)?)
}
