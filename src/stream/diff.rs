/// Snapshot-or-patch decision for a pool update.
///
/// Given the pool cache and a freshly loaded payload, computes a JSON Patch
/// from the cached value to the new one. The cache always moves to the new
/// payload with a fresh version, whichever mode is chosen. A patch larger
/// than the payload itself is replaced by the snapshot unless the server
/// forces patches.
use super::cache::Cache;
use crate::error::SyncResult;
use serde_json::Value as JsonValue;
use tracing::{trace, warn};

/// Result of a pool update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patched {
    /// Patch operations or the full payload.
    pub data: Vec<u8>,
    /// Whether `data` is the full payload.
    pub snapshot: bool,
    /// New cache version.
    pub version: i64,
}

/// Serialized JSON Patch turning `previous` into `current`.
pub fn operations(previous: &[u8], current: &[u8]) -> SyncResult<Vec<u8>> {
    let previous: JsonValue = serde_json::from_slice(previous)?;
    let current: JsonValue = serde_json::from_slice(current)?;
    Ok(serde_json::to_vec(&json_patch::diff(&previous, &current))?)
}

/// Move the cache to `current` and decide what to send.
pub fn patch(cache: &mut Cache, current: Vec<u8>, force_patch: bool) -> Patched {
    let operations = cache
        .is_warm()
        .then(|| operations(cache.data(), &current));
    let version = cache.set(current.clone());

    let ops = match operations {
        None => return snapshot(current, version),
        Some(Err(e)) => {
            warn!(error = %e, "patch create failed, sending snapshot");
            return snapshot(current, version);
        }
        Some(Ok(ops)) => ops,
    };

    // don't send the operations if they exceed the data size
    if !force_patch && ops.len() > current.len() {
        trace!(patch = ops.len(), snapshot = current.len(), "patch larger than snapshot");
        return snapshot(current, version);
    }

    Patched {
        data: ops,
        snapshot: false,
        version,
    }
}

fn snapshot(data: Vec<u8>, version: i64) -> Patched {
    Patched {
        data,
        snapshot: true,
        version,
    }
}
