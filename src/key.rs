/// Key validation and glob matching.
///
/// Keys are `/`-delimited paths. A pattern may use `*` as a whole or partial
/// segment; a `*` never crosses a `/`, and a pattern only matches keys with
/// the same number of segments:
///
/// ```ignore
/// let keys = KeyMatcher::new();
/// assert!(keys.matches("things/*", "things/1"));
/// assert!(!keys.matches("things/*", "things/1/2"));
/// assert!(!keys.matches("things/1", "things/1")); // no glob, no match
/// ```
///
/// Compiled patterns are cached per matcher instance, so independent
/// servers in one process do not share state.
use crate::clock::MonotonicClock;
use dashmap::DashMap;
use regex::Regex;

/// Path separator for keys.
pub const SEPARATOR: char = '/';

/// Glob matcher with a compiled-pattern cache.
#[derive(Debug, Default)]
pub struct KeyMatcher {
    globs: DashMap<String, Regex>,
    clock: MonotonicClock,
}

impl KeyMatcher {
    /// Create a matcher with an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check that a key or pattern is well formed.
    ///
    /// Only ASCII letters, digits, `*` and `/` are allowed, the key cannot
    /// start or end with `/`, and `//` and `**` are rejected.
    pub fn is_valid(key: &str) -> bool {
        if key.is_empty() || key.contains("//") || key.contains("**") {
            return false;
        }
        if key.starts_with(SEPARATOR) || key.ends_with(SEPARATOR) {
            return false;
        }
        key.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '*' || c == SEPARATOR)
    }

    /// Check whether `key` belongs to the glob `pattern`.
    ///
    /// Returns false for patterns without `*`: exact keys are resolved by
    /// direct pool lookup, not by matching.
    pub fn matches(&self, pattern: &str, key: &str) -> bool {
        if !is_glob(pattern) {
            return false;
        }
        if depth(pattern) != depth(key) {
            return false;
        }
        match self.compiled(pattern) {
            Some(glob) => glob.is_match(key),
            None => false,
        }
    }

    /// Number of patterns compiled so far.
    pub fn cached_patterns(&self) -> usize {
        self.globs.len()
    }

    /// Build a concrete key for a write.
    ///
    /// A trailing `/*` is replaced by a new hex timestamp segment, which is
    /// how entries are appended to a list. Keys without a glob are returned
    /// unchanged.
    pub fn build(&self, pattern: &str) -> String {
        if !is_glob(pattern) {
            return pattern.to_string();
        }
        let index = format!("{:x}", self.clock.next());
        pattern.replacen("/*", &format!("/{}", index), 1)
    }

    fn compiled(&self, pattern: &str) -> Option<Regex> {
        if let Some(glob) = self.globs.get(pattern) {
            return Some(glob.clone());
        }
        let glob = Regex::new(&glob_to_regex(pattern)).ok()?;
        self.globs.insert(pattern.to_string(), glob.clone());
        Some(glob)
    }
}

/// Whether the key contains a glob.
pub fn is_glob(key: &str) -> bool {
    key.contains('*')
}

/// The final segment of a key.
pub fn last_index(key: &str) -> &str {
    match key.rfind(SEPARATOR) {
        Some(at) => &key[at + 1..],
        None => key,
    }
}

fn depth(key: &str) -> usize {
    key.matches(SEPARATOR).count()
}

fn glob_to_regex(pattern: &str) -> String {
    let literals: Vec<String> = pattern.split('*').map(regex::escape).collect();
    format!("^{}$", literals.join("[^/]*"))
}
