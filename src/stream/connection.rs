/// Subscriber connections.
///
/// A connection wraps one subscriber transport (a websocket, or any other
/// [`Transport`]). Frames are queued in a bounded outbox and written by a
/// single writer task that owns the transport, so writes to one peer are
/// serialized and keep the order in which the pool produced them. Every
/// write carries a deadline; a failed or stalled write closes the
/// connection. The read loop, or the next refresh of its pool, then removes
/// it from the pool.
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outbound half of a subscriber transport.
#[async_trait]
pub trait Transport: Send {
    /// Send one framed message.
    async fn send(&mut self, frame: String) -> SyncResult<()>;

    /// Close the transport.
    async fn close(&mut self);
}

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A live subscriber.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    key: String,
    outbox: mpsc::Sender<String>,
    closed: CancellationToken,
}

impl Connection {
    /// Start a connection over `transport`, spawning its writer task.
    pub(crate) fn spawn(
        key: impl Into<String>,
        transport: Box<dyn Transport>,
        capacity: usize,
        timeout: Duration,
    ) -> Self {
        let (outbox, frames) = mpsc::channel(capacity.max(1));
        let connection = Self {
            id: ConnectionId::next(),
            key: key.into(),
            outbox,
            closed: CancellationToken::new(),
        };
        tokio::spawn(run_writer(
            connection.id,
            transport,
            frames,
            connection.closed.clone(),
            timeout,
        ));
        connection
    }

    /// The connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Key of the pool this connection belongs to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Queue a frame for delivery.
    ///
    /// Never blocks. A connection whose outbox is full is too slow to keep
    /// up and gets closed.
    pub fn write(&self, frame: String) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        match self.outbox.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(key = %self.key, id = %self.id, "outbox full, closing connection");
                self.close();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close();
                false
            }
        }
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Wait until the connection is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

async fn run_writer(
    id: ConnectionId,
    mut transport: Box<dyn Transport>,
    mut frames: mpsc::Receiver<String>,
    closed: CancellationToken,
    timeout: Duration,
) {
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = frames.recv() => frame,
        };
        let Some(frame) = frame else { break };
        match tokio::time::timeout(timeout, transport.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(%id, error = %e, "write failed");
                break;
            }
            Err(_) => {
                warn!(%id, ?timeout, "write deadline reached");
                break;
            }
        }
    }
    closed.cancel();
    if tokio::time::timeout(timeout, transport.close()).await.is_err() {
        debug!(%id, "transport close timed out");
    }
}

/// In-process transport delivering frames to a channel.
///
/// Useful for embedding subscribers in the same process and for tests.
pub struct ChannelTransport {
    frames: mpsc::Sender<String>,
}

impl ChannelTransport {
    /// Create a transport and the receiver its frames arrive on.
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (frames, receiver) = mpsc::channel(capacity.max(1));
        (Self { frames }, receiver)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, frame: String) -> SyncResult<()> {
        self.frames
            .send(frame)
            .await
            .map_err(|_| SyncError::TransportError("receiver dropped".to_string()))
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StalledTransport;

    #[async_trait]
    impl Transport for StalledTransport {
        async fn send(&mut self, _frame: String) -> SyncResult<()> {
            futures::future::pending::<SyncResult<()>>().await
        }

        async fn close(&mut self) {}
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (transport, mut frames) = ChannelTransport::pair(16);
        let conn = Connection::spawn("things/*", Box::new(transport), 16, Duration::from_secs(1));
        for i in 0..10 {
            assert!(conn.write(i.to_string()));
        }
        for i in 0..10 {
            assert_eq!(frames.recv().await.unwrap(), i.to_string());
        }
        assert_eq!(conn.key(), "things/*");
    }

    #[tokio::test]
    async fn test_dropped_receiver_closes_connection() {
        let (transport, frames) = ChannelTransport::pair(1);
        drop(frames);
        let conn = Connection::spawn("a", Box::new(transport), 4, Duration::from_secs(1));
        conn.write("x".to_string());
        tokio::time::timeout(Duration::from_secs(1), conn.closed())
            .await
            .unwrap();
        assert!(conn.is_closed());
        assert!(!conn.write("y".to_string()));
    }

    #[tokio::test]
    async fn test_stalled_peer_is_disconnected() {
        let conn = Connection::spawn(
            "a",
            Box::new(StalledTransport),
            4,
            Duration::from_millis(20),
        );
        conn.write("x".to_string());
        tokio::time::timeout(Duration::from_secs(1), conn.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_full_outbox_closes_connection() {
        let conn = Connection::spawn("a", Box::new(StalledTransport), 1, Duration::from_secs(5));
        let mut accepted = 0;
        for _ in 0..5 {
            if conn.write("x".to_string()) {
                accepted += 1;
            }
        }
        assert!(accepted < 5);
        assert!(conn.is_closed());
    }

    #[test]
    fn test_connection_ids_are_unique() {
        assert_ne!(ConnectionId::next(), ConnectionId::next());
    }
}
