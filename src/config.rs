/// Server configuration.
use std::time::Duration;

/// Default number of workers draining storage events.
pub const DEFAULT_WORKERS: usize = 6;

/// Default deadline for a single write to a subscriber.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(15);

/// Default port for the HTTP/websocket API.
pub const DEFAULT_PORT: u16 = 8800;

/// Configuration for a sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Workers draining the storage watch channel (default: 6).
    pub workers: usize,
    /// Always send patches, even when larger than the snapshot (default: false).
    pub force_patch: bool,
    /// Reject keys without a matching filter route (default: false).
    pub static_mode: bool,
    /// Interval between clock broadcasts (default: 1 second).
    pub tick: Duration,
    /// Deadline for a single write to a subscriber (default: 15 seconds).
    pub write_timeout: Duration,
    /// Deadline for HTTP publish and delete requests (default: 10 seconds).
    pub deadline: Duration,
    /// Frames queued per connection before the peer is dropped (default: 256).
    pub outbox_capacity: usize,
    /// Broadcasts running at once across all pools (default: 64).
    pub max_inflight_broadcasts: usize,
    /// Storage events buffered before writers wait (default: 1024).
    pub watch_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            force_patch: false,
            static_mode: false,
            tick: Duration::from_secs(1),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            deadline: Duration::from_secs(10),
            outbox_capacity: 256,
            max_inflight_broadcasts: 64,
            watch_capacity: 1024,
        }
    }
}

impl ServerConfig {
    /// Create a config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of watch workers.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Always send patches.
    pub fn force_patch(mut self, force: bool) -> Self {
        self.force_patch = force;
        self
    }

    /// Reject keys without a filter route.
    pub fn static_mode(mut self, enabled: bool) -> Self {
        self.static_mode = enabled;
        self
    }

    /// Set the clock interval.
    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Set the subscriber write deadline.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the HTTP request deadline.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Set the per-connection outbox size.
    pub fn outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity.max(1);
        self
    }

    /// Cap the broadcasts running at once.
    pub fn max_inflight_broadcasts(mut self, max: usize) -> Self {
        self.max_inflight_broadcasts = max.max(1);
        self
    }

    /// Set how many storage events are buffered before writers wait.
    pub fn watch_capacity(mut self, capacity: usize) -> Self {
        self.watch_capacity = capacity.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.workers, 6);
        assert_eq!(config.write_timeout, Duration::from_secs(15));
        assert!(!config.force_patch);
        assert!(!config.static_mode);
    }

    #[test]
    fn test_builder() {
        let config = ServerConfig::new()
            .workers(0)
            .force_patch(true)
            .tick(Duration::from_millis(50));
        assert_eq!(config.workers, 1);
        assert!(config.force_patch);
        assert_eq!(config.tick, Duration::from_millis(50));
    }
}
