/// Websocket subscription client.
///
/// [`subscribe`] keeps a local [`Replica`] of a key or glob in sync with a
/// server, handing every new state to a callback. Dropped connections are
/// redialed with a tiered backoff until the cancellation token fires.
///
/// # Example
///
/// ```ignore
/// use koru_sync::client::{self, Meta};
/// use tokio_util::sync::CancellationToken;
///
/// #[derive(serde::Deserialize)]
/// struct Device { name: String }
///
/// let cancel = CancellationToken::new();
/// client::subscribe("ws://localhost:8800", "devices/*", cancel.clone(), |devices: Vec<Meta<Device>>| {
///     println!("{} devices", devices.len());
/// })
/// .await?;
/// ```
use crate::error::{SyncError, SyncResult};
use crate::key::{self, KeyMatcher};
use crate::messages::{Replica, format_version};
use crate::objects::Object;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Time allowed for the websocket handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// A decoded object with typed data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta<T> {
    pub created: i64,
    pub updated: i64,
    pub index: String,
    pub data: T,
}

impl<T: DeserializeOwned> Meta<T> {
    fn decode(object: Object) -> SyncResult<Self> {
        Ok(Self {
            created: object.created,
            updated: object.updated,
            index: object.index,
            data: serde_json::from_value(object.data)?,
        })
    }
}

/// Reconnection delays.
///
/// 300ms for the first 30 retries, 2s up to the 100th, then 10s. Any
/// successfully applied message resets the count.
#[derive(Debug, Clone, Default)]
pub struct Backoff {
    retries: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a retry and return how long to wait before it.
    pub fn next_delay(&mut self) -> Duration {
        self.retries = self.retries.saturating_add(1);
        match self.retries {
            0..30 => Duration::from_millis(300),
            30..100 => Duration::from_secs(2),
            _ => Duration::from_secs(10),
        }
    }

    pub fn reset(&mut self) {
        self.retries = 0;
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }
}

/// Subscription URL for `key` on the server at `base`.
///
/// `version` is sent as `?v=` so a server holding the same version skips
/// the snapshot.
pub fn subscription_url(base: &str, key: &str, version: Option<i64>) -> String {
    let url = format!("{}/{}", base.trim_end_matches('/'), key);
    match version {
        Some(version) => format!("{}?v={}", url, format_version(version)),
        None => url,
    }
}

/// Follow `key` on the server at `base` (`ws://host:port`) until `cancel`
/// fires.
///
/// The callback receives the whole current state after every update: the
/// sorted list for glob keys, a single element otherwise. Objects whose
/// data doesn't decode as `T` are skipped in lists.
pub async fn subscribe<T, F>(
    base: &str,
    key: &str,
    cancel: CancellationToken,
    mut callback: F,
) -> SyncResult<()>
where
    T: DeserializeOwned,
    F: FnMut(Vec<Meta<T>>) + Send,
{
    if !KeyMatcher::is_valid(key) {
        return Err(SyncError::InvalidKey {
            key: key.to_string(),
        });
    }
    let is_list = key::last_index(key) == "*";
    let mut backoff = Backoff::new();
    let mut replica = Replica::new();

    while !cancel.is_cancelled() {
        let version = replica.value().is_ok().then(|| replica.version());
        let url = subscription_url(base, key, version);

        let dialed = tokio::select! {
            _ = cancel.cancelled() => break,
            dialed = tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::connect_async(url.as_str())) => dialed,
        };
        match dialed {
            Ok(Ok((mut socket, _))) => {
                info!(url = %url, "subscription established");
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => {
                            if let Err(e) = socket.close(None).await {
                                debug!(error = %e, "websocket close failed");
                            }
                            return Ok(());
                        }
                        next = socket.next() => next,
                    };
                    let frame = match next {
                        Some(Ok(WsMessage::Text(frame))) => frame,
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            warn!(url = %url, error = %e, "websocket read failed");
                            break;
                        }
                    };
                    if let Err(e) = replica.apply_frame(&frame) {
                        warn!(url = %url, error = %e, "message could not be applied");
                        replica = Replica::new();
                        break;
                    }
                    match decode(&replica, is_list) {
                        Ok(state) => {
                            backoff.reset();
                            callback(state);
                        }
                        Err(e) => warn!(url = %url, error = %e, "message could not be decoded"),
                    }
                }
            }
            Ok(Err(e)) => warn!(url = %url, error = %e, "websocket dial failed"),
            Err(_) => warn!(url = %url, "websocket handshake timed out"),
        }

        let delay = backoff.next_delay();
        debug!(url = %url, retries = backoff.retries(), ?delay, "reconnecting");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    info!(key, "subscription closed");
    Ok(())
}

fn decode<T: DeserializeOwned>(replica: &Replica, is_list: bool) -> SyncResult<Vec<Meta<T>>> {
    if !is_list {
        return Ok(vec![Meta::decode(replica.object()?)?]);
    }
    Ok(replica
        .objects()?
        .into_iter()
        .filter_map(|object| Meta::decode(object).ok())
        .collect())
}
