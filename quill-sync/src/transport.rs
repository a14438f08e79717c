//! Network transport: turns "document id" into a pair of message channels.
//!
//! ```text
//!            Connection.outgoing ──► writer task ──► WebSocket
//! Session ◄─ Connection.incoming ◄── reader task ◄── WebSocket
//! ```
//!
//! The session only ever sees [`SyncMessage`]s. When the socket dies the
//! reader task drops its sender and `incoming.recv()` yields `None`; that is
//! the whole "connection lost" signal. Retry pacing belongs to the transport
//! as well ([`ReconnectPolicy`]).

use std::future::Future;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::SyncResult;
use crate::protocol::SyncMessage;

/// One established connection to a document room.
#[derive(Debug)]
pub struct Connection {
    pub outgoing: mpsc::Sender<SyncMessage>,
    pub incoming: mpsc::Receiver<SyncMessage>,
}

impl Connection {
    /// Two connected in-memory endpoints. What one sends the other receives.
    pub fn pair(capacity: usize) -> (Connection, Connection) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        (
            Connection { outgoing: a_tx, incoming: a_rx },
            Connection { outgoing: b_tx, incoming: b_rx },
        )
    }
}

/// Opens connections to a document room.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, doc_id: Uuid) -> impl Future<Output = SyncResult<Connection>> + Send;
}

/// Exponential backoff between connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            multiplier: 2,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// [`Connector`] over WebSocket. Connects to `{server_url}/{doc_id}`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    server_url: String,
    capacity: usize,
}

impl WsConnector {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            capacity: 256,
        }
    }

    /// Per-direction channel capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

impl Connector for WsConnector {
    async fn connect(&self, doc_id: Uuid) -> SyncResult<Connection> {
        let url = format!("{}/{}", self.server_url.trim_end_matches('/'), doc_id);
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        log::debug!("WebSocket connected to {url}");

        let (out_tx, mut out_rx) = mpsc::channel::<SyncMessage>(self.capacity);
        let (in_tx, in_rx) = mpsc::channel::<SyncMessage>(self.capacity);

        // Writer task: drains until the session drops its sender, then closes
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let bytes = match msg.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::warn!("Dropping unencodable {:?} frame: {e}", msg.msg_type);
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: dropping in_tx is the disconnect signal
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Binary(data)) => match SyncMessage::decode(&data) {
                        Ok(msg) => {
                            if in_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Ignoring undecodable frame: {e}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        log::debug!("WebSocket read error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
            log::debug!("WebSocket reader finished");
        });

        Ok(Connection {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(250));
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(3), Duration::from_secs(2));
        assert_eq!(policy.delay(20), Duration::from_secs(10));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_constant_multiplier() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1),
            multiplier: 0,
        };
        assert_eq!(policy.delay(7), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_connection_pair() {
        let (a, mut b) = Connection::pair(4);
        a.outgoing.send(SyncMessage::ping(1)).await.unwrap();
        assert_eq!(b.incoming.recv().await.unwrap(), SyncMessage::ping(1));

        drop(a);
        assert!(b.incoming.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_ws_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = WsConnector::new(format!("ws://127.0.0.1:{port}"));
        assert!(connector.connect(Uuid::new_v4()).await.is_err());
    }
}
