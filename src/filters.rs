/// Read, write and delete filter chains.
///
/// Each chain is an ordered list of `(path, function)` routes. The first
/// route whose path equals the key, or whose glob matches it, handles the
/// key. When no route matches, dynamic mode lets the data through and
/// static mode rejects it.
///
/// # Example
///
/// ```ignore
/// let filters = Filters::new()
///     .read_filter("secret/*", |_key, _data| Err(SyncError::filter("secret", "hidden")))
///     .open_filter("things/*");
/// ```
use crate::error::{SyncError, SyncResult};
use crate::key::KeyMatcher;
use std::sync::Arc;

/// Transform applied to data before it is stored or sent.
pub type ApplyFn = Arc<dyn Fn(&str, Vec<u8>) -> SyncResult<Vec<u8>> + Send + Sync>;

/// Check run before a delete.
pub type DeleteFn = Arc<dyn Fn(&str) -> SyncResult<()> + Send + Sync>;

/// Notification run after a successful write.
pub type NotifyFn = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
struct Route<F> {
    path: String,
    apply: F,
}

fn route<'a, F>(routes: &'a [Route<F>], keys: &KeyMatcher, path: &str) -> Option<&'a Route<F>> {
    routes
        .iter()
        .find(|route| route.path == path || keys.matches(&route.path, path))
}

fn undefined(path: &str) -> SyncError {
    SyncError::filter(path, "route not defined, static mode")
}

/// The full set of filter chains for a server.
#[derive(Clone, Default)]
pub struct Filters {
    write: Vec<Route<ApplyFn>>,
    read: Vec<Route<ApplyFn>>,
    delete: Vec<Route<DeleteFn>>,
    after: Vec<Route<NotifyFn>>,
}

impl Filters {
    /// Create empty filter chains.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter that runs on data before it is stored.
    pub fn write_filter<F>(mut self, path: impl Into<String>, apply: F) -> Self
    where
        F: Fn(&str, Vec<u8>) -> SyncResult<Vec<u8>> + Send + Sync + 'static,
    {
        self.write.push(Route {
            path: path.into(),
            apply: Arc::new(apply),
        });
        self
    }

    /// Add a filter that runs on data before it is sent to a reader or
    /// subscriber.
    pub fn read_filter<F>(mut self, path: impl Into<String>, apply: F) -> Self
    where
        F: Fn(&str, Vec<u8>) -> SyncResult<Vec<u8>> + Send + Sync + 'static,
    {
        self.read.push(Route {
            path: path.into(),
            apply: Arc::new(apply),
        });
        self
    }

    /// Add a hook that can veto a delete.
    pub fn delete_filter<F>(mut self, path: impl Into<String>, apply: F) -> Self
    where
        F: Fn(&str) -> SyncResult<()> + Send + Sync + 'static,
    {
        self.delete.push(Route {
            path: path.into(),
            apply: Arc::new(apply),
        });
        self
    }

    /// Add a notification that runs after a successful write.
    pub fn after_filter<F>(mut self, path: impl Into<String>, apply: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.after.push(Route {
            path: path.into(),
            apply: Arc::new(apply),
        });
        self
    }

    /// Register pass-through read, write and delete filters for a path.
    pub fn open_filter(self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.write_filter(path.clone(), |_, data| Ok(data))
            .read_filter(path.clone(), |_, data| Ok(data))
            .delete_filter(path, |_| Ok(()))
    }

    /// Run the write chain.
    pub fn check_write(
        &self,
        keys: &KeyMatcher,
        path: &str,
        data: Vec<u8>,
        static_mode: bool,
    ) -> SyncResult<Vec<u8>> {
        check(&self.write, keys, path, data, static_mode)
    }

    /// Run the read chain.
    pub fn check_read(
        &self,
        keys: &KeyMatcher,
        path: &str,
        data: Vec<u8>,
        static_mode: bool,
    ) -> SyncResult<Vec<u8>> {
        check(&self.read, keys, path, data, static_mode)
    }

    /// Run the delete hooks.
    pub fn check_delete(&self, keys: &KeyMatcher, path: &str, static_mode: bool) -> SyncResult<()> {
        match route(&self.delete, keys, path) {
            Some(route) => (route.apply)(path),
            None if static_mode => Err(undefined(path)),
            None => Ok(()),
        }
    }

    /// Run the after-write notification, if any.
    pub fn notify_after(&self, keys: &KeyMatcher, path: &str) {
        if let Some(route) = route(&self.after, keys, path) {
            (route.apply)(path);
        }
    }
}

fn check(
    routes: &[Route<ApplyFn>],
    keys: &KeyMatcher,
    path: &str,
    data: Vec<u8>,
    static_mode: bool,
) -> SyncResult<Vec<u8>> {
    match route(routes, keys, path) {
        Some(route) => (route.apply)(path, data),
        None if static_mode => Err(undefined(path)),
        None => Ok(data),
    }
}
