//! # koru-sync: live key-value sync
//!
//! koru-sync pushes every change of a key-value store to the clients that
//! watch it. Clients subscribe to a key or a glob pattern of keys; each
//! write matching a subscription reaches the subscriber as either a full
//! snapshot or a JSON Patch, tagged with a strictly increasing version.
//!
//! ## Quick Start
//!
//! ```ignore
//! use koru_sync::{ChannelTransport, Message, Replica, Server};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::start().await?;
//!
//!     // Subscribe an in-process client to a list
//!     let (transport, mut frames) = ChannelTransport::pair(16);
//!     server.subscribe("devices/*", Box::new(transport), None).await?;
//!
//!     // Append to the list
//!     server.publish("devices/*", json!({"name": "sensor"})).await?;
//!
//!     // Follow the list: one snapshot, then patches
//!     let mut replica = Replica::new();
//!     while let Some(frame) = frames.recv().await {
//!         replica.apply_frame(&frame)?;
//!         println!("{} devices", replica.objects()?.len());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **Key matcher** (`key`) - key validation, `*` globs bounded by `/`
//! - **Objects** (`objects`) - the `{created, updated, index, data}` envelope
//! - **Stream** (`stream`) - subscription pools, per-pool cache, diff engine,
//!   connections and the broadcast dispatcher
//! - **Storage** (`storage`) - backend contract and the memory backend
//! - **Server** (`server`) - filters, publish/read/delete, the storage watch
//!   workers and the clock
//! - **HTTP** (`http`, `client`) - axum routes, websocket sessions and a
//!   reconnecting client
//!
//! A write flows storage → watch event → broadcast → every pool whose
//! pattern covers the key → reload, filter, diff, send.
//!
//! ## Thread Safety
//!
//! `Server` is cheap to clone and every operation is safe to call from
//! many tasks. Pools lock independently, so writes to unrelated patterns
//! never wait on each other.

pub mod clock;
pub mod config;
mod error;
pub mod filters;
pub mod key;
pub mod messages;
pub mod objects;
pub mod server;
pub mod storage;
pub mod stream;

// HTTP API and websocket client (requires http feature)
#[cfg(feature = "http")]
pub mod client;
#[cfg(feature = "http")]
pub mod http;

// Public API exports
pub use config::ServerConfig;
pub use error::{SyncError, SyncResult};
pub use filters::Filters;
pub use key::KeyMatcher;
pub use messages::{Message, Replica};
pub use objects::Object;
pub use server::{Server, ServerBuilder};
pub use storage::{MemoryStorage, Operation, Storage, StorageEvent, StorageWatcher};
pub use stream::{CacheEntry, ChannelTransport, Connection, Source, Stream, Transport};

#[cfg(feature = "http")]
pub use http::HttpServer;

// Re-export commonly used external types for convenience
pub use serde_json::{Value as JsonValue, json};
pub use tokio_util::sync::CancellationToken;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use koru_sync::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::ServerConfig;
    pub use crate::error::{SyncError, SyncResult};
    pub use crate::filters::Filters;
    pub use crate::messages::{Message, Replica};
    pub use crate::objects::Object;
    pub use crate::server::Server;
    pub use crate::storage::{MemoryStorage, Storage};
    pub use crate::stream::{ChannelTransport, Transport};
    pub use serde_json::{Value as JsonValue, json};

    #[cfg(feature = "http")]
    pub use crate::http::HttpServer;
}
