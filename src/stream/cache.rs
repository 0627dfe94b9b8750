/// Per-pool cache of the last broadcast payload.
use crate::clock;

/// A cached payload with its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Version stamp in nanoseconds.
    pub version: i64,
    /// Payload as last sent to subscribers.
    pub data: Vec<u8>,
}

/// Last payload broadcast by a pool.
///
/// A cache is cold until the first `set`; after that every `set` produces
/// a version strictly greater than the previous one.
#[derive(Debug, Clone, Default)]
pub struct Cache {
    version: i64,
    data: Vec<u8>,
    warm: bool,
}

impl Cache {
    /// Create a cold cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached entry, or `None` while the cache is cold.
    pub fn get(&self) -> Option<CacheEntry> {
        self.warm.then(|| CacheEntry {
            version: self.version,
            data: self.data.clone(),
        })
    }

    /// Replace the payload and stamp a new version.
    pub fn set(&mut self, data: Vec<u8>) -> i64 {
        self.version = clock::next_version(self.version);
        self.data = data;
        self.warm = true;
        self.version
    }

    /// Current version, `0` while cold.
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Current payload, empty while cold.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether a payload has been cached.
    pub fn is_warm(&self) -> bool {
        self.warm
    }
}
