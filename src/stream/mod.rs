/// Subscription pools and the broadcast engine.
///
/// A [`Stream`] is the registry of pools. Subscribing to a key or glob
/// pattern joins the pool for that pattern, creating it on first use; the
/// subscriber immediately receives the pool's current value as a snapshot
/// unless it already holds the current version. Each write is routed to
/// every pool whose pattern covers the written key, and the pool sends its
/// subscribers either a JSON Patch or a fresh snapshot.
///
/// # Locking
///
/// - the registry lock guards only the list of pools (lookup and creation)
/// - each pool lock guards that pool's cache and connection list
/// - each connection serializes its own writes
///
/// Writes to unrelated patterns therefore proceed in parallel; only updates
/// of the same pool are serialized.
///
/// # Example
///
/// ```ignore
/// let stream = Stream::new(Arc::new(KeyMatcher::new()));
/// let (transport, mut frames) = ChannelTransport::pair(16);
/// let conn = stream.subscribe("things/*", Box::new(transport), None, &source).await?;
/// let first = frames.recv().await; // snapshot of things/*
/// ```
mod broadcast;
pub mod cache;
pub mod connection;
pub mod diff;
pub mod pool;

pub use cache::{Cache, CacheEntry};
pub use connection::{ChannelTransport, Connection, ConnectionId, Transport};
pub use diff::Patched;
pub use pool::{Pool, PoolState};

use crate::config::{DEFAULT_WRITE_TIMEOUT, ServerConfig};
use crate::error::{SyncError, SyncResult};
use crate::key::KeyMatcher;
use crate::messages::{Message, format_version};
use async_trait::async_trait;
use futures::{Stream as FrameStream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Key of the clock pool, always at index 0.
pub const CLOCK_KEY: &str = "";

/// Audit run before a subscription is accepted.
pub type SubscribeHook = Arc<dyn Fn(&str) -> SyncResult<()> + Send + Sync>;

/// Callback run after a subscriber leaves.
pub type UnsubscribeHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Where pools load their current value from.
#[async_trait]
pub trait Source: Send + Sync {
    /// Load the current, filtered value for a pool pattern.
    async fn load(&self, key: &str) -> SyncResult<Vec<u8>>;
}

/// Registry of subscription pools.
pub struct Stream {
    pools: RwLock<Vec<Arc<Pool>>>,
    keys: Arc<KeyMatcher>,
    on_subscribe: SubscribeHook,
    on_unsubscribe: UnsubscribeHook,
    force_patch: bool,
    write_timeout: Duration,
    outbox_capacity: usize,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("force_patch", &self.force_patch)
            .field("write_timeout", &self.write_timeout)
            .finish()
    }
}

impl Stream {
    /// Create a registry holding only the clock pool.
    pub fn new(keys: Arc<KeyMatcher>) -> Self {
        Self {
            pools: RwLock::new(vec![Arc::new(Pool::new(CLOCK_KEY))]),
            keys,
            on_subscribe: Arc::new(|_| Ok(())),
            on_unsubscribe: Arc::new(|_| {}),
            force_patch: false,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            outbox_capacity: 256,
        }
    }

    /// Create a registry using the stream settings of a server config.
    pub fn with_config(keys: Arc<KeyMatcher>, config: &ServerConfig) -> Self {
        let mut stream = Self::new(keys);
        stream.force_patch = config.force_patch;
        stream.write_timeout = config.write_timeout;
        stream.outbox_capacity = config.outbox_capacity;
        stream
    }

    /// Always send patches, even when larger than the snapshot.
    pub fn force_patch(mut self, force: bool) -> Self {
        self.force_patch = force;
        self
    }

    /// Set the per-write deadline.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the audit run before each subscription.
    pub fn on_subscribe<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) -> SyncResult<()> + Send + Sync + 'static,
    {
        self.on_subscribe = Arc::new(hook);
        self
    }

    /// Set the callback run after each unsubscribe.
    pub fn on_unsubscribe<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_unsubscribe = Arc::new(hook);
        self
    }

    /// The key matcher used for routing.
    pub fn keys(&self) -> &Arc<KeyMatcher> {
        &self.keys
    }

    /// Index of the pool for `key`, if one exists.
    pub async fn find_pool(&self, key: &str) -> Option<usize> {
        self.pools.read().await.iter().position(|p| p.key() == key)
    }

    /// The pool for `key`, if one exists.
    pub async fn pool(&self, key: &str) -> Option<Arc<Pool>> {
        self.pools
            .read()
            .await
            .iter()
            .find(|p| p.key() == key)
            .cloned()
    }

    /// Number of pools, including the clock pool.
    pub async fn pool_count(&self) -> usize {
        self.pools.read().await.len()
    }

    /// Number of live connections subscribed to exactly `key`.
    pub async fn connection_count(&self, key: &str) -> usize {
        match self.pool(key).await {
            Some(pool) => pool.connection_count().await,
            None => 0,
        }
    }

    async fn pool_or_insert(&self, key: &str) -> Arc<Pool> {
        if let Some(pool) = self.pool(key).await {
            return pool;
        }
        let mut pools = self.pools.write().await;
        if let Some(pool) = pools.iter().find(|p| p.key() == key) {
            return pool.clone();
        }
        let pool = Arc::new(Pool::new(key));
        pools.push(pool.clone());
        debug!(key, pools = pools.len(), "pool created");
        pool
    }

    /// Validate a key and run the subscribe audit.
    ///
    /// Nothing is created when this fails.
    pub fn authorize(&self, key: &str) -> SyncResult<()> {
        if !KeyMatcher::is_valid(key) {
            return Err(SyncError::invalid_key(key));
        }
        (self.on_subscribe)(key).map_err(|e| match e {
            SyncError::Denied { .. } => e,
            other => SyncError::denied(key, other.to_string()),
        })
    }

    /// Authorize and open a subscription.
    pub async fn subscribe(
        &self,
        key: &str,
        transport: Box<dyn Transport>,
        version: Option<&str>,
        source: &dyn Source,
    ) -> SyncResult<Arc<Connection>> {
        self.authorize(key)?;
        self.open(key, transport, version, source).await
    }

    /// Join the pool for `key` without running the audit.
    ///
    /// The subscriber gets the pool's current value as a snapshot, unless
    /// `version` names the current cache version. A cold cache is loaded
    /// from `source` first; if that fails the subscriber is not added.
    pub async fn open(
        &self,
        key: &str,
        transport: Box<dyn Transport>,
        version: Option<&str>,
        source: &dyn Source,
    ) -> SyncResult<Arc<Connection>> {
        let pool = self.pool_or_insert(key).await;
        let mut state = pool.lock().await;
        if !state.cache.is_warm() {
            let data = source.load(key).await?;
            state.cache.set(data);
        }

        let conn = Arc::new(Connection::spawn(
            key,
            transport,
            self.outbox_capacity,
            self.write_timeout,
        ));
        let current = format_version(state.cache.version());
        if version != Some(current.as_str()) {
            let message = Message::new(state.cache.data(), true, state.cache.version());
            conn.write(message.encode()?);
        }
        state.connections.push(conn.clone());
        debug!(key, connections = state.connections.len(), "subscribed");
        Ok(conn)
    }

    /// Remove a connection from its pool and close it.
    ///
    /// Only the connection's own pool is locked. The unsubscribe callback
    /// runs in the background, once per connection.
    pub async fn unsubscribe(&self, conn: &Connection) {
        conn.close();
        let Some(pool) = self.pool(conn.key()).await else {
            return;
        };
        let removed = {
            let mut state = pool.lock().await;
            let removed = state.remove(conn.id());
            debug!(key = conn.key(), connections = state.connections.len(), "unsubscribed");
            removed
        };
        if removed {
            self.left(conn.key());
        }
    }

    /// Run the unsubscribe callback in the background.
    fn left(&self, key: &str) {
        if key == CLOCK_KEY {
            return;
        }
        let hook = self.on_unsubscribe.clone();
        let key = key.to_string();
        tokio::spawn(async move { hook(&key) });
    }

    /// Drive the read side of a connection until the peer goes away.
    ///
    /// Incoming messages are ignored; the loop only detects a close, a read
    /// error or a local close, then unsubscribes the connection.
    pub async fn read_loop<S, T, E>(&self, conn: Arc<Connection>, mut incoming: S)
    where
        S: FrameStream<Item = Result<T, E>> + Unpin + Send,
        E: Display,
    {
        loop {
            tokio::select! {
                _ = conn.closed() => break,
                next = incoming.next() => match next {
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(key = conn.key(), error = %e, "read failed");
                        break;
                    }
                    None => break,
                },
            }
        }
        self.unsubscribe(&conn).await;
    }

    /// The cache of the pool for `key`, if the pool exists and is warm.
    pub async fn cache(&self, key: &str) -> Option<CacheEntry> {
        self.pool(key).await?.cache().await
    }

    /// Store `data` in the cache of the pool for `key`, creating the pool
    /// if needed. Returns the new version.
    pub async fn set_cache(&self, key: &str, data: Vec<u8>) -> i64 {
        let pool = self.pool_or_insert(key).await;
        let mut state = pool.lock().await;
        state.cache.set(data)
    }

    /// Join the clock pool.
    pub async fn open_clock(&self, transport: Box<dyn Transport>) -> Arc<Connection> {
        let pool = self.pool_or_insert(CLOCK_KEY).await;
        let conn = Arc::new(Connection::spawn(
            CLOCK_KEY,
            transport,
            self.outbox_capacity,
            self.write_timeout,
        ));
        pool.lock().await.connections.push(conn.clone());
        conn
    }

    /// Send a raw time frame to every clock subscriber.
    pub async fn broadcast_clock(&self, time: &str) {
        let Some(pool) = self.pools.read().await.first().cloned() else {
            return;
        };
        let state = pool.lock().await;
        for conn in &state.connections {
            conn.write(time.to_string());
        }
    }

    /// Close every connection in every pool.
    ///
    /// Read loops notice the close and remove their connections.
    pub async fn close_all(&self) {
        let pools: Vec<Arc<Pool>> = self.pools.read().await.clone();
        for pool in pools {
            for conn in &pool.lock().await.connections {
                conn.close();
            }
        }
    }
}
