/// Error types for koru-sync operations.
///
/// The variants follow the layers a request crosses: key validation, the
/// subscribe audit, filter chains, storage, serialization and the transport.
/// Nothing here is fatal to the process; the worst outcome of any error in
/// the broadcast path is a skipped broadcast or a forced snapshot.
use thiserror::Error;

/// The main error type for koru-sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Malformed key or pattern, rejected before any side effect
    #[error("Invalid key '{key}'")]
    InvalidKey {
        /// The rejected key
        key: String,
    },

    /// The subscribe audit refused the subscription
    #[error("Subscription to '{key}' denied: {reason}")]
    Denied {
        /// The key that was requested
        key: String,
        /// Reason given by the audit hook
        reason: String,
    },

    /// Key not found in storage
    #[error("Key '{key}' not found")]
    KeyNotFound {
        /// The key that was not found
        key: String,
    },

    /// A read, write or delete filter rejected the operation
    #[error("Filter rejected '{key}': {reason}")]
    Filter {
        /// The key being filtered
        key: String,
        /// Why the filter rejected it
        reason: String,
    },

    /// Serialization error when converting data to/from JSON
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Invalid data format or structure
    #[error("Invalid data: {reason}")]
    InvalidData {
        /// Description of why the data is invalid
        reason: String,
    },

    /// Writing to or reading from a subscriber transport failed
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Storage operation failed
    #[error("Storage error: {0}")]
    StorageError(String),
}

impl SyncError {
    /// Build a filter rejection for `key`.
    pub fn filter(key: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::Filter {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Build a subscribe denial for `key`.
    pub fn denied(key: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::Denied {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_key(key: impl Into<String>) -> Self {
        SyncError::InvalidKey { key: key.into() }
    }

    pub(crate) fn not_found(key: impl Into<String>) -> Self {
        SyncError::KeyNotFound { key: key.into() }
    }
}

/// Result type alias for koru-sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
