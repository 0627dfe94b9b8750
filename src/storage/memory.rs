/// In-memory storage backend.
///
/// Values are kept in a `DashMap` keyed by path, so reads and writes to
/// different keys don't contend. Every successful `set`/`del` emits a
/// [`StorageEvent`](super::StorageEvent) on a bounded channel unless the
/// storage was built without a watch.
use super::{Operation, Storage, StorageState, StorageWatcher, inactive};
use crate::clock::MonotonicClock;
use crate::error::{SyncError, SyncResult};
use crate::key::{self, KeyMatcher};
use crate::objects::{self, Object};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value as JsonValue;

/// Default number of buffered change events.
pub const DEFAULT_WATCH_CAPACITY: usize = 1024;

/// Storage backed by a concurrent map.
#[derive(Debug)]
pub struct MemoryStorage {
    entries: DashMap<String, Object>,
    keys: KeyMatcher,
    clock: MonotonicClock,
    state: StorageState,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(DEFAULT_WATCH_CAPACITY)
    }
}

impl MemoryStorage {
    /// Create a storage whose watch buffers up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self::with_state(StorageState::watched(capacity))
    }

    /// Create a storage that emits no change events.
    pub fn without_watch() -> Self {
        Self::with_state(StorageState::unwatched())
    }

    /// Writes to these exact keys never emit events.
    pub fn no_broadcast_keys(mut self, keys: Vec<String>) -> Self {
        self.state = self.state.with_no_broadcast_keys(keys);
        self
    }

    fn with_state(state: StorageState) -> Self {
        Self {
            entries: DashMap::new(),
            keys: KeyMatcher::new(),
            clock: MonotonicClock::new(),
            state,
        }
    }

    fn ensure_active(&self) -> SyncResult<()> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(inactive())
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn active(&self) -> bool {
        self.state.is_active()
    }

    async fn start(&self) -> SyncResult<()> {
        self.state.set_active(true);
        Ok(())
    }

    async fn close(&self) {
        self.state.set_active(false);
        self.state.close_watch();
    }

    async fn keys(&self) -> SyncResult<Vec<String>> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort_by_key(|k| k.to_lowercase());
        Ok(keys)
    }

    async fn get(&self, path: &str) -> SyncResult<Vec<u8>> {
        if !key::is_glob(path) {
            let entry = self
                .entries
                .get(path)
                .ok_or_else(|| SyncError::not_found(path))?;
            return objects::encode(entry.value());
        }

        let mut found: Vec<Object> = self
            .entries
            .iter()
            .filter(|e| self.keys.matches(path, e.key()))
            .map(|e| e.value().clone())
            .collect();
        objects::sort(&mut found);
        objects::encode(&found)
    }

    async fn set(&self, path: &str, data: JsonValue) -> SyncResult<String> {
        self.ensure_active()?;
        if key::is_glob(path) {
            return Err(SyncError::invalid_key(path));
        }
        let index = key::last_index(path).to_string();
        let (created, updated) = self.peek(path, self.clock.next());
        self.entries.insert(
            path.to_string(),
            Object::new(created, updated, index.clone(), data),
        );
        self.state.emit(path, Operation::Set).await;
        Ok(index)
    }

    async fn del(&self, path: &str) -> SyncResult<()> {
        self.ensure_active()?;
        if !key::is_glob(path) {
            if self.entries.remove(path).is_none() {
                return Err(SyncError::not_found(path));
            }
        } else {
            self.entries.retain(|k, _| !self.keys.matches(path, k));
        }
        self.state.emit(path, Operation::Del).await;
        Ok(())
    }

    async fn clear(&self) {
        self.entries.clear();
    }

    fn watch(&self) -> Option<StorageWatcher> {
        self.state.watcher()
    }

    fn peek(&self, path: &str, now: i64) -> (i64, i64) {
        match self.entries.get(path) {
            Some(previous) => (previous.created, now),
            None => (now, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageEvent;
    use serde_json::json;

    async fn started(capacity: usize) -> MemoryStorage {
        let storage = MemoryStorage::new(capacity);
        storage.start().await.unwrap();
        storage
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let storage = started(8).await;
        let index = storage.set("things/1", json!({"a": 1})).await.unwrap();
        assert_eq!(index, "1");

        let obj = objects::decode(&storage.get("things/1").await.unwrap()).unwrap();
        assert_eq!(obj.index, "1");
        assert_eq!(obj.data, json!({"a": 1}));
        assert_eq!(obj.updated, 0);
    }

    #[tokio::test]
    async fn test_overwrite_keeps_created() {
        let storage = started(8).await;
        storage.set("box", json!(1)).await.unwrap();
        let first = objects::decode(&storage.get("box").await.unwrap()).unwrap();
        storage.set("box", json!(2)).await.unwrap();
        let second = objects::decode(&storage.get("box").await.unwrap()).unwrap();
        assert_eq!(first.created, second.created);
        assert!(second.updated >= second.created);
        assert_eq!(second.data, json!(2));
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let storage = started(8).await;
        let err = storage.get("nothing").await.unwrap_err();
        assert!(matches!(err, SyncError::KeyNotFound { .. }));
        assert!(storage.del("nothing").await.is_err());
    }

    #[tokio::test]
    async fn test_glob_get_is_sorted_and_depth_bound() {
        let storage = started(8).await;
        storage.set("things/a", json!("a")).await.unwrap();
        storage.set("things/b", json!("b")).await.unwrap();
        storage.set("things/b/deep", json!("deep")).await.unwrap();

        let list = objects::decode_list(&storage.get("things/*").await.unwrap()).unwrap();
        let indexes: Vec<&str> = list.iter().map(|o| o.index.as_str()).collect();
        assert_eq!(indexes, vec!["b", "a"]);

        assert_eq!(storage.get("nothing/*").await.unwrap(), b"[]");
    }

    #[tokio::test]
    async fn test_glob_delete_emits_pattern() {
        let storage = started(8).await;
        let watcher = storage.watch().unwrap();
        storage.set("things/a", json!(1)).await.unwrap();
        storage.set("things/b", json!(2)).await.unwrap();
        storage.del("things/*").await.unwrap();

        assert!(storage.keys().await.unwrap().is_empty());
        let mut events = Vec::new();
        for _ in 0..3 {
            events.push(watcher.recv().await.unwrap());
        }
        assert_eq!(
            events[2],
            StorageEvent {
                key: "things/*".to_string(),
                operation: Operation::Del,
            }
        );
    }

    #[tokio::test]
    async fn test_keys_sorted_case_insensitive() {
        let storage = started(8).await;
        storage.set("b", json!(1)).await.unwrap();
        storage.set("A", json!(1)).await.unwrap();
        storage.set("c", json!(1)).await.unwrap();
        assert_eq!(storage.keys().await.unwrap(), vec!["A", "b", "c"]);
    }

    #[tokio::test]
    async fn test_close_ends_watch() {
        let storage = started(8).await;
        let watcher = storage.watch().unwrap();
        storage.set("a", json!(1)).await.unwrap();
        storage.close().await;

        assert!(!storage.active());
        assert_eq!(watcher.recv().await.unwrap().key, "a");
        assert!(watcher.recv().await.is_none());
        assert!(storage.set("a", json!(2)).await.is_err());
    }

    #[tokio::test]
    async fn test_without_watch() {
        let storage = MemoryStorage::without_watch();
        storage.start().await.unwrap();
        assert!(storage.watch().is_none());
        storage.set("a", json!(1)).await.unwrap();
        assert_eq!(storage.keys().await.unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_glob_set_rejected() {
        let storage = started(8).await;
        assert!(storage.set("things/*", json!(1)).await.is_err());
    }
}
