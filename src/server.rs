/// The sync server.
///
/// [`Server`] ties the pieces together: a storage backend, the filter
/// chains, and the [`Stream`] of subscription pools. Starting a server
/// starts the storage, spawns the workers that turn storage events into
/// broadcasts, and the ticker feeding the clock pool.
///
/// # Example
///
/// ```ignore
/// use koru_sync::{MemoryStorage, Server, ServerConfig};
/// use serde_json::json;
///
/// let server = Server::builder()
///     .config(ServerConfig::new().workers(2))
///     .storage(MemoryStorage::default())
///     .start()
///     .await?;
///
/// let index = server.publish("things/*", json!({"name": "one"})).await?;
/// let things = server.read("things/*").await?;
/// server.close().await;
/// ```
use crate::clock;
use crate::config::ServerConfig;
use crate::error::{SyncError, SyncResult};
use crate::filters::Filters;
use crate::key::KeyMatcher;
use crate::objects;
use crate::storage::{MemoryStorage, Storage, StorageWatcher};
use crate::stream::{CacheEntry, Connection, Source, Stream, Transport};
use async_trait::async_trait;
use futures::Stream as FrameStream;
use serde_json::Value as JsonValue;
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

type SubscribeFn = Arc<dyn Fn(&str) -> SyncResult<()> + Send + Sync>;
type UnsubscribeFn = Arc<dyn Fn(&str) + Send + Sync>;
type CloseFn = Arc<dyn Fn() + Send + Sync>;

/// Current time as a decimal nanosecond string, the clock pool payload.
pub fn time() -> String {
    clock::now_nanos().to_string()
}

/// Loads pool values from storage through the read filters.
struct Fetcher {
    storage: Arc<dyn Storage>,
    keys: Arc<KeyMatcher>,
    filters: Filters,
    static_mode: bool,
}

#[async_trait]
impl Source for Fetcher {
    async fn load(&self, key: &str) -> SyncResult<Vec<u8>> {
        // a failed or empty read still yields a value to diff against
        let raw = match self.storage.get(key).await {
            Ok(raw) if !raw.is_empty() => raw,
            Ok(_) => objects::empty(),
            Err(e) => {
                trace!(key, error = %e, "storage get failed, using empty object");
                objects::empty()
            }
        };
        self.filters
            .check_read(&self.keys, key, raw, self.static_mode)
    }
}

struct Inner {
    config: ServerConfig,
    storage: Arc<dyn Storage>,
    fetcher: Fetcher,
    stream: Stream,
    shutdown: CancellationToken,
    closing: AtomicBool,
    on_close: CloseFn,
}

/// Builder for a [`Server`].
pub struct ServerBuilder {
    config: ServerConfig,
    storage: Option<Arc<dyn Storage>>,
    filters: Filters,
    on_subscribe: SubscribeFn,
    on_unsubscribe: UnsubscribeFn,
    on_close: CloseFn,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            config: ServerConfig::default(),
            storage: None,
            filters: Filters::default(),
            on_subscribe: Arc::new(|_| Ok(())),
            on_unsubscribe: Arc::new(|_| {}),
            on_close: Arc::new(|| {}),
        }
    }
}

impl ServerBuilder {
    /// Use the given configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Use the given storage backend (default: [`MemoryStorage`]).
    pub fn storage(self, storage: impl Storage + 'static) -> Self {
        self.shared_storage(Arc::new(storage))
    }

    /// Use a storage backend shared with other owners.
    pub fn shared_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Use the given filter chains.
    pub fn filters(mut self, filters: Filters) -> Self {
        self.filters = filters;
        self
    }

    /// Audit run before each subscription; an error denies it.
    pub fn on_subscribe<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) -> SyncResult<()> + Send + Sync + 'static,
    {
        self.on_subscribe = Arc::new(hook);
        self
    }

    /// Callback run after each subscriber leaves.
    pub fn on_unsubscribe<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_unsubscribe = Arc::new(hook);
        self
    }

    /// Callback run once when the server closes.
    pub fn on_close<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_close = Arc::new(hook);
        self
    }

    /// Start storage and the background tasks.
    pub async fn start(self) -> SyncResult<Server> {
        let config = self.config;
        let storage: Arc<dyn Storage> = match self.storage {
            Some(storage) => storage,
            None => Arc::new(MemoryStorage::new(config.watch_capacity)),
        };
        storage.start().await?;

        let keys = Arc::new(KeyMatcher::new());
        let on_subscribe = self.on_subscribe;
        let on_unsubscribe = self.on_unsubscribe;
        let stream = Stream::with_config(keys.clone(), &config)
            .on_subscribe(move |key| on_subscribe(key))
            .on_unsubscribe(move |key| on_unsubscribe(key));

        let inner = Arc::new(Inner {
            fetcher: Fetcher {
                storage: storage.clone(),
                keys,
                filters: self.filters,
                static_mode: config.static_mode,
            },
            config,
            storage,
            stream,
            shutdown: CancellationToken::new(),
            closing: AtomicBool::new(false),
            on_close: self.on_close,
        });

        match inner.storage.watch() {
            Some(watcher) => {
                let permits = Arc::new(Semaphore::new(inner.config.max_inflight_broadcasts.max(1)));
                for _ in 0..inner.config.workers.max(1) {
                    tokio::spawn(watch(inner.clone(), watcher.clone(), permits.clone()));
                }
            }
            None => debug!("storage has no watch, broadcasting after each write"),
        }
        tokio::spawn(tick(inner.clone()));

        info!(workers = inner.config.workers, "server started");
        Ok(Server { inner })
    }
}

/// A running sync server. Cheap to clone.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.inner.config)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Server {
    /// Start a server with default settings and memory storage.
    pub async fn start() -> SyncResult<Self> {
        Self::builder().start().await
    }

    /// Configure a new server.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// The subscription pools.
    pub fn stream(&self) -> &Stream {
        &self.inner.stream
    }

    /// The storage backend.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.inner.storage
    }

    /// Whether the server is running.
    pub fn is_active(&self) -> bool {
        !self.inner.closing.load(Ordering::Acquire) && self.inner.storage.active()
    }

    /// Store a value.
    ///
    /// A key ending in `/*` appends to a list: the `*` is replaced by a new
    /// time-ordered index. Returns the index written.
    pub async fn publish(&self, key: &str, data: JsonValue) -> SyncResult<String> {
        let globs = key.matches('*').count();
        if !KeyMatcher::is_valid(key) || globs > 1 || (globs == 1 && !key.ends_with("/*")) {
            return Err(SyncError::invalid_key(key));
        }

        let inner = &self.inner;
        let fetcher = &inner.fetcher;
        let key = fetcher.keys.build(key);
        let encoded = serde_json::to_vec(&data)?;
        let filtered =
            fetcher
                .filters
                .check_write(&fetcher.keys, &key, encoded, inner.config.static_mode)?;
        let value: JsonValue = serde_json::from_slice(&filtered)?;
        let index = inner.storage.set(&key, value).await?;

        if inner.storage.watch().is_none() {
            inner.stream.broadcast(&key, fetcher).await;
        }
        debug!(key = %key, index = %index, "publish");
        fetcher.filters.notify_after(&fetcher.keys, &key);
        Ok(index)
    }

    /// Delete a key, or every key matching a glob.
    pub async fn unpublish(&self, key: &str) -> SyncResult<()> {
        if !KeyMatcher::is_valid(key) {
            return Err(SyncError::invalid_key(key));
        }
        let inner = &self.inner;
        let fetcher = &inner.fetcher;
        fetcher
            .filters
            .check_delete(&fetcher.keys, key, inner.config.static_mode)?;
        inner.storage.del(key).await?;

        if inner.storage.watch().is_none() {
            inner.stream.broadcast(key, fetcher).await;
        }
        debug!(key, "unpublish");
        Ok(())
    }

    /// Read the current filtered value of a key or glob, bypassing the
    /// pool caches.
    pub async fn read(&self, key: &str) -> SyncResult<Vec<u8>> {
        if !KeyMatcher::is_valid(key) {
            return Err(SyncError::invalid_key(key));
        }
        let data = self.inner.fetcher.load(key).await?;
        if objects::is_empty(&data) {
            return Err(SyncError::not_found(key));
        }
        Ok(data)
    }

    /// Delete every stored key and refresh all pools.
    pub async fn clear(&self) -> usize {
        let inner = &self.inner;
        inner.storage.clear().await;
        let refreshed = inner.stream.broadcast_all(&inner.fetcher).await;
        debug!(pools = refreshed, "clear");
        refreshed
    }

    /// All stored keys.
    pub async fn keys(&self) -> SyncResult<Vec<String>> {
        self.inner.storage.keys().await
    }

    /// Refresh every pool matching `key`. Returns the number refreshed.
    pub async fn broadcast(&self, key: &str) -> usize {
        self.inner.stream.broadcast(key, &self.inner.fetcher).await
    }

    /// Cached value of the pool for `key`.
    pub async fn cache(&self, key: &str) -> Option<CacheEntry> {
        self.inner.stream.cache(key).await
    }

    /// Validate a key and run the subscribe audit.
    pub fn authorize(&self, key: &str) -> SyncResult<()> {
        self.inner.stream.authorize(key)
    }

    /// Authorize and open a subscription.
    pub async fn subscribe(
        &self,
        key: &str,
        transport: Box<dyn Transport>,
        version: Option<&str>,
    ) -> SyncResult<Arc<Connection>> {
        self.inner
            .stream
            .subscribe(key, transport, version, &self.inner.fetcher)
            .await
    }

    /// Open a subscription that was already authorized.
    pub async fn open(
        &self,
        key: &str,
        transport: Box<dyn Transport>,
        version: Option<&str>,
    ) -> SyncResult<Arc<Connection>> {
        self.inner
            .stream
            .open(key, transport, version, &self.inner.fetcher)
            .await
    }

    /// Join the clock pool. The current time is sent right away.
    pub async fn subscribe_clock(&self, transport: Box<dyn Transport>) -> Arc<Connection> {
        let conn = self.inner.stream.open_clock(transport).await;
        conn.write(time());
        conn
    }

    /// Drive a connection's read side until the peer leaves.
    pub async fn read_loop<S, T, E>(&self, conn: Arc<Connection>, incoming: S)
    where
        S: FrameStream<Item = Result<T, E>> + Unpin + Send,
        E: Display,
    {
        self.inner.stream.read_loop(conn, incoming).await
    }

    /// Stop the background tasks and the storage. Idempotent.
    pub async fn close(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.stream.close_all().await;
        self.inner.storage.close().await;
        (self.inner.on_close)();
        info!("server closed");
    }

    /// Resolves once [`Server::close`] has been called.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await
    }
}

async fn watch(inner: Arc<Inner>, watcher: StorageWatcher, permits: Arc<Semaphore>) {
    loop {
        let event = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            event = watcher.recv() => event,
        };
        let Some(event) = event else { break };
        if !event.key.is_empty() {
            trace!(key = %event.key, operation = ?event.operation, "storage event");
            // hold the event until a broadcast slot frees up, so a write
            // burst backs up into the watch channel instead of into tasks
            let permit = tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => permit,
            };
            let Ok(permit) = permit else { break };
            let inner = inner.clone();
            tokio::spawn(async move {
                inner.stream.broadcast(&event.key, &inner.fetcher).await;
                drop(permit);
            });
        }
        if !inner.storage.active() {
            break;
        }
    }
    trace!("watch worker stopped");
}

async fn tick(inner: Arc<Inner>) {
    if inner.config.tick.is_zero() {
        warn!("clock tick is zero, clock disabled");
        return;
    }
    let mut ticker = tokio::time::interval(inner.config.tick);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => inner.stream.broadcast_clock(&time()).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Message;
    use crate::stream::ChannelTransport;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_and_read() {
        let server = Server::start().await.unwrap();
        let index = server.publish("box", json!({"a": 1})).await.unwrap();
        assert_eq!(index, "box");

        let obj = objects::decode(&server.read("box").await.unwrap()).unwrap();
        assert_eq!(obj.data, json!({"a": 1}));
        server.close().await;
    }

    #[tokio::test]
    async fn test_list_publish_generates_index() {
        let server = Server::start().await.unwrap();
        let first = server.publish("things/*", json!(1)).await.unwrap();
        let second = server.publish("things/*", json!(2)).await.unwrap();
        assert_ne!(first, second);

        let list = objects::decode_list(&server.read("things/*").await.unwrap()).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].index, second);
        server.close().await;
    }

    #[tokio::test]
    async fn test_publish_rejects_bad_keys() {
        let server = Server::start().await.unwrap();
        for key in ["things/*/*", "*/things", "things//a", "a*"] {
            let err = server.publish(key, json!(1)).await.unwrap_err();
            assert!(matches!(err, SyncError::InvalidKey { .. }), "{key}");
        }
        server.close().await;
    }

    #[tokio::test]
    async fn test_read_missing_key() {
        let server = Server::start().await.unwrap();
        let err = server.read("nothing").await.unwrap_err();
        assert!(matches!(err, SyncError::KeyNotFound { .. }));
        assert_eq!(server.read("nothing/*").await.unwrap(), b"[]");
        server.close().await;
    }

    #[tokio::test]
    async fn test_static_mode_rejects_unrouted_keys() {
        let server = Server::builder()
            .config(ServerConfig::new().static_mode(true))
            .filters(Filters::new().open_filter("open/*"))
            .start()
            .await
            .unwrap();

        assert!(server.publish("open/*", json!(1)).await.is_ok());
        let err = server.publish("closed", json!(1)).await.unwrap_err();
        assert!(matches!(err, SyncError::Filter { .. }));
        assert!(server.unpublish("closed").await.is_err());
        server.close().await;
    }

    #[tokio::test]
    async fn test_write_filter_transforms_data() {
        let server = Server::builder()
            .filters(Filters::new().write_filter("box", |_, _| Ok(br#"{"clean":true}"#.to_vec())))
            .start()
            .await
            .unwrap();
        server.publish("box", json!({"dirty": true})).await.unwrap();
        let obj = objects::decode(&server.read("box").await.unwrap()).unwrap();
        assert_eq!(obj.data, json!({"clean": true}));
        server.close().await;
    }

    #[tokio::test]
    async fn test_after_filter_runs_on_publish() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let server = Server::builder()
            .filters(Filters::new().after_filter("things/*", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .start()
            .await
            .unwrap();
        server.publish("things/*", json!(1)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        server.close().await;
    }

    #[tokio::test]
    async fn test_unwatched_storage_broadcasts_on_write() {
        let server = Server::builder()
            .storage(MemoryStorage::without_watch())
            .config(ServerConfig::new().force_patch(true))
            .start()
            .await
            .unwrap();

        let (transport, mut frames) = ChannelTransport::pair(8);
        server
            .subscribe("things/*", Box::new(transport), None)
            .await
            .unwrap();
        let first = Message::decode(&frames.recv().await.unwrap()).unwrap();
        assert!(first.snapshot);

        server.publish("things/*", json!("x")).await.unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(1), frames.recv())
            .await
            .unwrap()
            .unwrap();
        let update = Message::decode(&frame).unwrap();
        assert!(!update.snapshot);
        assert!(update.version().unwrap() > first.version().unwrap());
        server.close().await;
    }

    #[tokio::test]
    async fn test_clear_empties_storage_and_pools() {
        let server = Server::builder()
            .config(ServerConfig::new().force_patch(true))
            .start()
            .await
            .unwrap();
        server.publish("things/*", json!(1)).await.unwrap();
        server.publish("box", json!(2)).await.unwrap();

        let (transport, mut frames) = ChannelTransport::pair(16);
        server
            .subscribe("things/*", Box::new(transport), None)
            .await
            .unwrap();
        let mut replica = crate::messages::Replica::new();
        replica.apply_frame(&frames.recv().await.unwrap()).unwrap();
        assert_eq!(replica.objects().unwrap().len(), 1);

        server.clear().await;
        assert!(server.keys().await.unwrap().is_empty());
        tokio::time::timeout(Duration::from_secs(1), async {
            while replica.value().unwrap() != &json!([]) {
                let frame = frames.recv().await.unwrap();
                replica.apply_frame(&frame).unwrap();
            }
        })
        .await
        .unwrap();
        server.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_watch_bounds_inflight_broadcasts() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (now, high) = (running.clone(), peak.clone());
        let server = Server::builder()
            .config(
                ServerConfig::new()
                    .workers(1)
                    .max_inflight_broadcasts(1)
                    .watch_capacity(1),
            )
            .filters(Filters::new().read_filter("slow/*", move |_, data| {
                let current = now.fetch_add(1, Ordering::SeqCst) + 1;
                high.fetch_max(current, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(50));
                now.fetch_sub(1, Ordering::SeqCst);
                Ok(data)
            }))
            .start()
            .await
            .unwrap();

        let (transport, _frames) = ChannelTransport::pair(64);
        server
            .subscribe("slow/*", Box::new(transport), None)
            .await
            .unwrap();

        // slots full: later writes wait for the watch channel to drain
        let started = std::time::Instant::now();
        for n in 0..8 {
            server.publish("slow/*", json!(n)).await.unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        server.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_runs_hook() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let server = Server::builder()
            .on_close(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .start()
            .await
            .unwrap();
        assert!(server.is_active());
        server.close().await;
        server.close().await;
        assert!(!server.is_active());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        tokio::time::timeout(Duration::from_secs(1), server.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_clock_subscriber_gets_time() {
        let server = Server::builder()
            .config(ServerConfig::new().tick(Duration::from_millis(20)))
            .start()
            .await
            .unwrap();
        let (transport, mut frames) = ChannelTransport::pair(8);
        server.subscribe_clock(Box::new(transport)).await;
        let first: i64 = frames.recv().await.unwrap().parse().unwrap();
        let second: i64 = tokio::time::timeout(Duration::from_secs(1), frames.recv())
            .await
            .unwrap()
            .unwrap()
            .parse()
            .unwrap();
        assert!(second >= first);
        server.close().await;
    }
}
