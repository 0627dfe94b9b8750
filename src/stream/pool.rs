/// Subscription pools.
///
/// One pool exists per distinct subscribed pattern. It owns the cache of the
/// last broadcast payload and the live connections, both behind the pool's
/// own lock so that unrelated pools never wait on each other.
use super::cache::{Cache, CacheEntry};
use super::connection::{Connection, ConnectionId};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, MutexGuard};

/// Mutable state of a pool.
#[derive(Debug, Default)]
pub struct PoolState {
    /// Last broadcast payload.
    pub cache: Cache,
    /// Live subscribers.
    pub connections: Vec<Arc<Connection>>,
}

impl PoolState {
    /// Remove a connection by rebuilding the membership list without it.
    ///
    /// Returns whether the connection was a member.
    pub fn remove(&mut self, id: ConnectionId) -> bool {
        let before = self.connections.len();
        self.connections = self
            .connections
            .iter()
            .filter(|conn| conn.id() != id)
            .cloned()
            .collect();
        self.connections.len() != before
    }

    /// Drop connections that were closed from the write side.
    ///
    /// Returns the dropped connections.
    pub fn prune(&mut self) -> Vec<Arc<Connection>> {
        let (closed, live): (Vec<_>, Vec<_>) = self
            .connections
            .drain(..)
            .partition(|conn| conn.is_closed());
        self.connections = live;
        closed
    }
}

/// Connections and cache for one subscription pattern.
#[derive(Debug)]
pub struct Pool {
    key: String,
    state: Mutex<PoolState>,
    queued: AtomicBool,
}

impl Pool {
    pub(crate) fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            state: Mutex::new(PoolState::default()),
            queued: AtomicBool::new(false),
        }
    }

    /// The pattern this pool serves.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Lock the pool state.
    pub async fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().await
    }

    /// The cached entry, if the cache is warm.
    pub async fn cache(&self) -> Option<CacheEntry> {
        self.state.lock().await.cache.get()
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    /// Lock the pool for a refresh, unless another refresh is already
    /// waiting for the lock.
    ///
    /// A waiting refresh loads the value after acquiring the lock, so it
    /// already covers every event that arrived while it waited.
    pub(crate) async fn lock_for_refresh(&self) -> Option<MutexGuard<'_, PoolState>> {
        if self.queued.swap(true, Ordering::AcqRel) {
            return None;
        }
        let state = self.state.lock().await;
        self.queued.store(false, Ordering::Release);
        Some(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::connection::ChannelTransport;
    use std::time::Duration;

    #[tokio::test]
    async fn test_remove_rebuilds_membership() {
        let pool = Pool::new("things/*");
        let mut conns = Vec::new();
        for _ in 0..3 {
            let (transport, _frames) = ChannelTransport::pair(1);
            conns.push(Arc::new(Connection::spawn(
                "things/*",
                Box::new(transport),
                4,
                Duration::from_secs(1),
            )));
        }

        let mut state = pool.lock().await;
        state.connections.extend(conns.iter().cloned());
        assert!(state.remove(conns[1].id()));
        assert!(!state.remove(conns[1].id()));
        let ids: Vec<ConnectionId> = state.connections.iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![conns[0].id(), conns[2].id()]);
    }

    #[tokio::test]
    async fn test_prune_drops_closed() {
        let pool = Pool::new("box");
        let mut state = pool.lock().await;
        for _ in 0..3 {
            let (transport, _frames) = ChannelTransport::pair(1);
            state.connections.push(Arc::new(Connection::spawn(
                "box",
                Box::new(transport),
                4,
                Duration::from_secs(1),
            )));
        }
        state.connections[0].close();
        state.connections[2].close();

        let dropped = state.prune();
        assert_eq!(dropped.len(), 2);
        assert_eq!(state.connections.len(), 1);
        assert!(!state.connections[0].is_closed());
        assert!(state.prune().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_coalesces_while_waiting() {
        let pool = Arc::new(Pool::new("things/*"));
        let held = pool.lock().await;

        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.lock_for_refresh().await.is_some() })
        };
        tokio::task::yield_now().await;
        while !pool.queued.load(Ordering::Acquire) {
            tokio::task::yield_now().await;
        }

        assert!(pool.lock_for_refresh().await.is_none());
        drop(held);
        assert!(waiting.await.unwrap());
        assert!(pool.lock_for_refresh().await.is_some());
    }
}
