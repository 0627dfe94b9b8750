/// Wire messages pushed to subscribers, and the client-side replica that
/// applies them.
///
/// Every frame is a JSON object:
///
/// ```text
/// { "snapshot": true, "version": "17c2f0a5e3b1d000", "data": "[...]" }
/// ```
///
/// `data` carries either the full value (snapshot) or a JSON Patch from the
/// previous value, serialized as a JSON string. `version` is the pool's
/// cache version in lowercase hex.
use crate::error::{SyncError, SyncResult};
use crate::objects::{self, Object};
use json_patch::PatchOperation;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A single frame sent to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Whether `data` is a full value rather than a patch.
    pub snapshot: bool,
    /// Cache version in lowercase hex.
    pub version: String,
    /// Value or patch operations, as JSON text.
    pub data: String,
}

impl Message {
    /// Build a frame from a payload.
    pub fn new(data: &[u8], snapshot: bool, version: i64) -> Self {
        Self {
            snapshot,
            version: format_version(version),
            data: String::from_utf8_lossy(data).into_owned(),
        }
    }

    /// Serialize the frame for the transport.
    pub fn encode(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a frame received from the transport.
    pub fn decode(frame: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(frame)?)
    }

    /// The numeric version of this frame.
    pub fn version(&self) -> SyncResult<i64> {
        parse_version(&self.version)
    }
}

/// Format a version the way it travels on the wire.
pub fn format_version(version: i64) -> String {
    format!("{:x}", version)
}

/// Parse a wire version.
pub fn parse_version(version: &str) -> SyncResult<i64> {
    i64::from_str_radix(version, 16).map_err(|e| SyncError::InvalidData {
        reason: format!("bad version '{}': {}", version, e),
    })
}

/// Client-side copy of a subscribed value.
///
/// Starts empty, adopts the first snapshot and then applies each patch in
/// receipt order.
#[derive(Debug, Clone, Default)]
pub struct Replica {
    state: Option<JsonValue>,
    version: i64,
}

impl Replica {
    /// Create an empty replica.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a received frame.
    ///
    /// Patches received before any snapshot are rejected since there is no
    /// base value to apply them to.
    pub fn apply(&mut self, message: &Message) -> SyncResult<&JsonValue> {
        let version = message.version()?;
        if message.snapshot {
            self.state = Some(serde_json::from_str(&message.data)?);
            self.version = version;
            return self.value();
        }

        let state = self.state.as_mut().ok_or_else(|| SyncError::InvalidData {
            reason: "patch received before snapshot".to_string(),
        })?;
        let operations: Vec<PatchOperation> = serde_json::from_str(&message.data)?;
        json_patch::patch(state, &operations).map_err(|e| SyncError::InvalidData {
            reason: format!("patch failed: {}", e),
        })?;
        self.version = version;
        self.value()
    }

    /// Apply a raw frame as received from the transport.
    pub fn apply_frame(&mut self, frame: &str) -> SyncResult<&JsonValue> {
        let message = Message::decode(frame)?;
        self.apply(&message)
    }

    /// The current value.
    pub fn value(&self) -> SyncResult<&JsonValue> {
        self.state.as_ref().ok_or_else(|| SyncError::InvalidData {
            reason: "no snapshot received".to_string(),
        })
    }

    /// Version of the last applied frame.
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Decode the current value as a single object.
    pub fn object(&self) -> SyncResult<Object> {
        Ok(serde_json::from_value(self.value()?.clone())?)
    }

    /// Decode the current value as a collection of objects.
    pub fn objects(&self) -> SyncResult<Vec<Object>> {
        let mut list: Vec<Object> = serde_json::from_value(self.value()?.clone())?;
        objects::sort(&mut list);
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_shape() {
        let message = Message::new(br#"{"a":1}"#, true, 255);
        let frame = message.encode().unwrap();
        let raw: JsonValue = serde_json::from_str(&frame).unwrap();
        assert_eq!(raw["snapshot"], json!(true));
        assert_eq!(raw["version"], json!("ff"));
        assert_eq!(raw["data"], json!(r#"{"a":1}"#));
        assert_eq!(Message::decode(&frame).unwrap(), message);
    }

    #[test]
    fn test_replica_snapshot_then_patch() {
        let mut replica = Replica::new();
        replica
            .apply(&Message::new(br#"{"value":1}"#, true, 1))
            .unwrap();
        let patch = br#"[{"op":"replace","path":"/value","value":2}]"#;
        let value = replica.apply(&Message::new(patch, false, 2)).unwrap();
        assert_eq!(value, &json!({"value": 2}));
        assert_eq!(replica.version(), 2);
    }

    #[test]
    fn test_replica_rejects_patch_without_base() {
        let mut replica = Replica::new();
        let result = replica.apply(&Message::new(b"[]", false, 1));
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_patch_is_noop() {
        let mut replica = Replica::new();
        replica.apply(&Message::new(b"[1,2]", true, 1)).unwrap();
        let value = replica.apply(&Message::new(b"[]", false, 2)).unwrap();
        assert_eq!(value, &json!([1, 2]));
    }

    #[test]
    fn test_replica_objects() {
        let mut replica = Replica::new();
        let list = json!([
            {"created": 1, "updated": 0, "index": "a", "data": 1},
            {"created": 2, "updated": 0, "index": "b", "data": 2}
        ]);
        replica
            .apply(&Message::new(list.to_string().as_bytes(), true, 1))
            .unwrap();
        let objects = replica.objects().unwrap();
        assert_eq!(objects[0].index, "b");
        assert_eq!(objects[1].index, "a");
    }
}
