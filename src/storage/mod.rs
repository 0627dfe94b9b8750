/// Storage backends.
///
/// The broadcast engine only needs a small capability surface from a
/// backend: read a key or pattern, write and delete, and a stream of change
/// events. Backends that cannot push changes return `None` from
/// [`Storage::watch`]; the server then broadcasts synchronously after each
/// of its own writes.
///
/// Bookkeeping shared by every backend (the active flag, the event channel,
/// the keys that never broadcast) lives in [`StorageState`], which each
/// backend owns as a plain field.
pub mod memory;

pub use memory::MemoryStorage;

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::trace;

/// Kind of mutation carried by a [`StorageEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Set,
    Del,
}

/// Notification of a successful mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    /// Written key, or the pattern of a glob delete.
    pub key: String,
    pub operation: Operation,
}

/// Shared receiving end of a backend's change events.
///
/// Clones share one queue: each event is delivered to exactly one of the
/// workers draining it.
#[derive(Debug, Clone)]
pub struct StorageWatcher {
    events: Arc<tokio::sync::Mutex<mpsc::Receiver<StorageEvent>>>,
}

impl StorageWatcher {
    fn new(events: mpsc::Receiver<StorageEvent>) -> Self {
        Self {
            events: Arc::new(tokio::sync::Mutex::new(events)),
        }
    }

    /// Next event, or `None` once the backend is closed and drained.
    pub async fn recv(&self) -> Option<StorageEvent> {
        self.events.lock().await.recv().await
    }
}

/// Listing of stored keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub keys: Vec<String>,
}

/// Bookkeeping common to all backends.
#[derive(Debug)]
pub struct StorageState {
    active: AtomicBool,
    sender: Mutex<Option<mpsc::Sender<StorageEvent>>>,
    watcher: Option<StorageWatcher>,
    no_broadcast_keys: Vec<String>,
}

impl StorageState {
    /// State with a bounded event channel of `capacity` events.
    pub fn watched(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            active: AtomicBool::new(false),
            sender: Mutex::new(Some(sender)),
            watcher: Some(StorageWatcher::new(receiver)),
            no_broadcast_keys: Vec::new(),
        }
    }

    /// State for a backend that does not push changes.
    pub fn unwatched() -> Self {
        Self {
            active: AtomicBool::new(false),
            sender: Mutex::new(None),
            watcher: None,
            no_broadcast_keys: Vec::new(),
        }
    }

    /// Keys whose writes never produce events.
    pub fn with_no_broadcast_keys(mut self, keys: Vec<String>) -> Self {
        self.no_broadcast_keys = keys;
        self
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn watcher(&self) -> Option<StorageWatcher> {
        self.watcher.clone()
    }

    /// Drop the sending side so watchers see the end of the stream.
    pub fn close_watch(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }

    /// Publish an event, waiting for room when the channel is full.
    pub async fn emit(&self, key: &str, operation: Operation) {
        if self.no_broadcast_keys.iter().any(|k| k == key) {
            trace!(key, "no broadcast key");
            return;
        }
        let sender = match self.sender.lock() {
            Ok(sender) => sender.clone(),
            Err(_) => None,
        };
        let Some(sender) = sender else {
            return;
        };
        let event = StorageEvent {
            key: key.to_string(),
            operation,
        };
        if sender.send(event).await.is_err() {
            trace!(key, "watch closed, event dropped");
        }
    }
}

/// Capability surface of a storage backend.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Whether the backend is started and not closed.
    fn active(&self) -> bool;

    /// Start the backend.
    async fn start(&self) -> SyncResult<()>;

    /// Stop the backend and end its watch stream.
    async fn close(&self);

    /// All stored keys, sorted case-insensitively.
    async fn keys(&self) -> SyncResult<Vec<String>>;

    /// Encoded object for a key, or the sorted encoded list for a glob.
    async fn get(&self, key: &str) -> SyncResult<Vec<u8>>;

    /// Store `data` under `key` and return the written index.
    async fn set(&self, key: &str, data: JsonValue) -> SyncResult<String>;

    /// Delete a key, or every key matching a glob.
    async fn del(&self, key: &str) -> SyncResult<()>;

    /// Remove everything.
    async fn clear(&self);

    /// Change events, if the backend pushes them.
    fn watch(&self) -> Option<StorageWatcher>;

    /// `(created, updated)` for a write at `now`, keeping the creation time
    /// of an existing value.
    fn peek(&self, key: &str, now: i64) -> (i64, i64);
}

pub(crate) fn inactive() -> SyncError {
    SyncError::StorageError("storage is not active".to_string())
}
