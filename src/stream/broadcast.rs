/// Routing of writes to the pools that observe them.
use super::pool::Pool;
use super::{CLOCK_KEY, Source, Stream};
use crate::messages::Message;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, trace, warn};

impl Stream {
    /// Refresh every pool whose pattern covers `key`.
    ///
    /// A pool matches when its key equals the written key, when its glob
    /// matches the written key, or when the written key is itself a glob
    /// matching the pool key. The clock pool never matches. Returns the
    /// number of pools that were refreshed.
    pub async fn broadcast(&self, key: &str, source: &dyn Source) -> usize {
        let pools = self.matching_pools(key).await;
        if pools.is_empty() {
            trace!(key, "no pools to broadcast");
            return 0;
        }
        let refreshed = join_all(pools.iter().map(|pool| self.refresh(pool, source))).await;
        refreshed.into_iter().filter(|done| *done).count()
    }

    /// Refresh every pool except the clock pool.
    pub async fn broadcast_all(&self, source: &dyn Source) -> usize {
        let pools: Vec<Arc<Pool>> = self.pools.read().await.iter().skip(1).cloned().collect();
        let refreshed = join_all(pools.iter().map(|pool| self.refresh(pool, source))).await;
        refreshed.into_iter().filter(|done| *done).count()
    }

    async fn matching_pools(&self, key: &str) -> Vec<Arc<Pool>> {
        let keys = self.keys();
        self.pools
            .read()
            .await
            .iter()
            .skip(1)
            .filter(|pool| {
                let pattern = pool.key();
                pattern != CLOCK_KEY
                    && (pattern == key || keys.matches(pattern, key) || keys.matches(key, pattern))
            })
            .cloned()
            .collect()
    }

    /// Reload a pool and send the change to its subscribers.
    ///
    /// The load happens under the pool lock so that updates of one pool are
    /// delivered in the order they were read. Returns false when the
    /// refresh was absorbed by one already waiting, or when loading failed.
    async fn refresh(&self, pool: &Pool, source: &dyn Source) -> bool {
        let Some(mut state) = pool.lock_for_refresh().await else {
            trace!(key = pool.key(), "refresh already queued");
            return false;
        };

        let current = match source.load(pool.key()).await {
            Ok(data) => data,
            Err(e) => {
                warn!(key = pool.key(), error = %e, "broadcast load failed");
                return false;
            }
        };

        let patched = super::diff::patch(&mut state.cache, current, self.force_patch);
        let frame = match Message::new(&patched.data, patched.snapshot, patched.version).encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(key = pool.key(), error = %e, "broadcast encode failed");
                return false;
            }
        };

        for conn in &state.connections {
            conn.write(frame.clone());
        }
        // writers close their connection on a failed send or a full outbox
        for conn in state.prune() {
            debug!(key = pool.key(), id = %conn.id(), "dropped closed connection");
            self.left(pool.key());
        }
        debug!(
            key = pool.key(),
            connections = state.connections.len(),
            snapshot = patched.snapshot,
            "broadcast"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SyncError, SyncResult};
    use crate::key::KeyMatcher;
    use crate::stream::ChannelTransport;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct MapSource {
        values: Mutex<HashMap<String, String>>,
    }

    impl MapSource {
        fn put(&self, key: &str, value: &str) {
            self.values
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
        }
    }

    #[async_trait]
    impl Source for MapSource {
        async fn load(&self, key: &str) -> SyncResult<Vec<u8>> {
            self.values
                .lock()
                .unwrap()
                .get(key)
                .map(|v| v.as_bytes().to_vec())
                .ok_or_else(|| SyncError::filter(key, "no value"))
        }
    }

    async fn next(frames: &mut tokio::sync::mpsc::Receiver<String>) -> Message {
        let frame = tokio::time::timeout(Duration::from_secs(1), frames.recv())
            .await
            .unwrap()
            .unwrap();
        Message::decode(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_routes_by_glob() {
        let stream = Stream::new(Arc::new(KeyMatcher::new())).force_patch(true);
        let source = MapSource::default();
        source.put("things/*", "[]");
        source.put("other/*", "[]");

        let (transport, mut things) = ChannelTransport::pair(8);
        stream
            .subscribe("things/*", Box::new(transport), None, &source)
            .await
            .unwrap();
        let (transport, mut other) = ChannelTransport::pair(8);
        stream
            .subscribe("other/*", Box::new(transport), None, &source)
            .await
            .unwrap();
        next(&mut things).await;
        next(&mut other).await;

        source.put("things/*", r#"[{"created":1,"updated":0,"index":"1","data":"x"}]"#);
        assert_eq!(stream.broadcast("things/1", &source).await, 1);

        let message = next(&mut things).await;
        assert!(!message.snapshot);
        let waited = tokio::time::timeout(Duration::from_millis(50), other.recv()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_glob_write_reaches_exact_pools() {
        let stream = Stream::new(Arc::new(KeyMatcher::new()));
        let source = MapSource::default();
        source.put("things/1", "{}");
        let (transport, mut frames) = ChannelTransport::pair(8);
        stream
            .subscribe("things/1", Box::new(transport), None, &source)
            .await
            .unwrap();
        next(&mut frames).await;

        assert_eq!(stream.broadcast("things/*", &source).await, 1);
        assert_eq!(stream.broadcast("things/1/sub", &source).await, 0);
    }

    #[tokio::test]
    async fn test_clock_pool_never_matches() {
        let stream = Stream::new(Arc::new(KeyMatcher::new()));
        let source = MapSource::default();
        let (transport, _frames) = ChannelTransport::pair(8);
        stream.open_clock(Box::new(transport)).await;
        assert_eq!(stream.broadcast("", &source).await, 0);
    }

    #[tokio::test]
    async fn test_failed_load_skips_pool() {
        let stream = Stream::new(Arc::new(KeyMatcher::new()));
        let source = MapSource::default();
        stream.set_cache("gone", b"{}".to_vec()).await;
        assert_eq!(stream.broadcast("gone", &source).await, 0);
        assert_eq!(stream.cache("gone").await.unwrap().data, b"{}");
    }

    #[tokio::test]
    async fn test_broadcast_drops_closed_connections() {
        let left = Arc::new(AtomicUsize::new(0));
        let counter = left.clone();
        let stream = Stream::new(Arc::new(KeyMatcher::new())).on_unsubscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let source = MapSource::default();
        source.put("box", "{}");

        let (transport, frames) = ChannelTransport::pair(8);
        drop(frames);
        let gone = stream
            .subscribe("box", Box::new(transport), None, &source)
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), gone.closed())
            .await
            .unwrap();

        let (transport, mut live) = ChannelTransport::pair(8);
        stream
            .subscribe("box", Box::new(transport), None, &source)
            .await
            .unwrap();
        next(&mut live).await;
        assert_eq!(stream.connection_count("box").await, 2);

        source.put("box", r#"{"n":1}"#);
        assert_eq!(stream.broadcast("box", &source).await, 1);
        assert_eq!(stream.connection_count("box").await, 1);
        next(&mut live).await;

        tokio::time::timeout(Duration::from_secs(1), async {
            while left.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // a later read loop exit must not report the same connection twice
        stream.unsubscribe(&gone).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(left.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broadcast_all_skips_clock() {
        let stream = Stream::new(Arc::new(KeyMatcher::new()));
        let source = MapSource::default();
        source.put("a", "{}");
        source.put("b/*", "[]");
        for key in ["a", "b/*"] {
            let (transport, _frames) = ChannelTransport::pair(8);
            stream
                .subscribe(key, Box::new(transport), None, &source)
                .await
                .unwrap();
        }
        let (transport, _frames) = ChannelTransport::pair(8);
        stream.open_clock(Box::new(transport)).await;
        assert_eq!(stream.broadcast_all(&source).await, 2);
    }
}
