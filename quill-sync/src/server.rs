//! Reference relay: WebSocket server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Session A ──┐
//!             ├── Room (doc_id) ── YrsEngine ── BroadcastGroup
//! Session B ──┘        │
//!                      └── AwarenessMap (who is here, with clocks)
//!                                     │
//!                          ┌──────────┼───────────┐
//!                          ▼          ▼           ▼
//!                      Session A   Session B   Session C
//! ```
//!
//! Each document room maintains:
//! - a `YrsEngine` holding the authoritative merged state
//! - a `BroadcastGroup` for fan-out to connected members
//! - the room's raw awareness states, replayed to late joiners
//!
//! Rooms live only as long as they have members. A document whose last
//! member left starts from scratch on the next join, so the next session
//! sees an empty room and seeds from its backend.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;
use yrs::updates::encoder::Encode;
use yrs::StateVector;

use crate::broadcast::{BroadcastGroup, Frame};
use crate::engine::{CrdtEngine, Register, YrsEngine};
use crate::error::{SyncError, SyncResult};
use crate::presence::{AwarenessMap, AwarenessUpdate, ClientId};
use crate::protocol::{MessageType, SyncMessage, Welcome};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type Rooms = Arc<RwLock<HashMap<Uuid, DocumentRoom>>>;

/// Id the relay uses for frames it originates.
const RELAY_ID: ClientId = 0;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Joins beyond this are rejected
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub rejected: u64,
}

/// Document room: merged state, fan-out and presence.
struct DocumentRoom {
    engine: YrsEngine,
    broadcast: Arc<BroadcastGroup>,
    awareness: AwarenessMap,
}

impl DocumentRoom {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            engine: YrsEngine::new(),
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
            awareness: AwarenessMap::new(),
        }
    }
}

/// What a member's connection knows once it has joined.
struct Membership {
    client_id: ClientId,
    doc_id: Uuid,
    broadcast: Arc<BroadcastGroup>,
    rx: broadcast::Receiver<Frame>,
}

/// The relay server.
pub struct SyncServer {
    config: ServerConfig,
    rooms: Rooms,
    stats: Arc<RwLock<ServerStats>>,
    next_client_id: Arc<AtomicU64>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            next_client_id: Arc::new(AtomicU64::new(RELAY_ID + 1)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind `bind_addr` and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            let next_client_id = self.next_client_id.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config, next_client_id).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Rooms,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
        next_client_id: Arc<AtomicU64>,
    ) -> SyncResult<()> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::debug!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut member: Option<Membership> = None;
        let result: SyncResult<()> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            let sync_msg = match SyncMessage::decode(&data) {
                                Ok(sync_msg) => sync_msg,
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                    continue;
                                }
                            };
                            let keep_going = Self::handle_frame(
                                sync_msg,
                                &mut member,
                                &mut ws_sender,
                                &rooms,
                                &stats,
                                &config,
                                &next_client_id,
                            )
                            .await?;
                            if !keep_going {
                                return SyncResult::Ok(());
                            }
                        }
                        Some(Ok(Message::Ping(data))) => ws_sender.send(Message::Pong(data)).await?,
                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Connection closed from {addr}");
                            return Ok(());
                        }
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(_)) => {}
                    },

                    frame = recv_frame(&mut member) => match frame {
                        Ok(frame) => {
                            // Members never hear their own frames back
                            let own = member.as_ref().map(|m| m.client_id) == Some(frame.from);
                            if !own {
                                ws_sender.send(Message::Binary(frame.bytes.to_vec().into())).await?;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            if let Some(m) = &member {
                                log::warn!("Client {} lagged by {n} frames, resending full state", m.client_id);
                                m.broadcast.record_lag(n);
                                let full = Self::full_state(&rooms, m.doc_id).await;
                                if let Some(full) = full {
                                    send(&mut ws_sender, &SyncMessage::update(RELAY_ID, m.doc_id, full)).await?;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    },
                }
            }
        }
        .await;

        if let Some(m) = member {
            Self::leave(&rooms, &stats, m).await;
        }
        stats.write().await.active_connections -= 1;
        result
    }

    /// Returns `Ok(false)` when the connection should close.
    async fn handle_frame(
        msg: SyncMessage,
        member: &mut Option<Membership>,
        ws_sender: &mut WsSink,
        rooms: &Rooms,
        stats: &Arc<RwLock<ServerStats>>,
        config: &ServerConfig,
        next_client_id: &AtomicU64,
    ) -> SyncResult<bool> {
        let Some(m) = member.as_ref() else {
            return match msg.msg_type {
                MessageType::Join => {
                    match Self::join(msg.doc_id, ws_sender, rooms, config, next_client_id).await? {
                        Some(joined) => {
                            *member = Some(joined);
                            Ok(true)
                        }
                        None => {
                            stats.write().await.rejected += 1;
                            Ok(false)
                        }
                    }
                }
                MessageType::Ping => {
                    send(ws_sender, &SyncMessage::pong(RELAY_ID)).await?;
                    Ok(true)
                }
                other => {
                    log::debug!("Ignoring {other:?} before Join");
                    Ok(true)
                }
            };
        };
        let (client_id, doc_id) = (m.client_id, m.doc_id);

        match msg.msg_type {
            MessageType::SyncStep1 => {
                let diff = {
                    let rooms_r = rooms.read().await;
                    match rooms_r.get(&doc_id) {
                        Some(room) => room.engine.diff_since(&msg.payload).map(Some),
                        None => Ok(None),
                    }
                };
                match diff {
                    Ok(Some(diff)) => send(ws_sender, &SyncMessage::sync_step2(RELAY_ID, doc_id, diff)).await?,
                    Ok(None) => {}
                    Err(e) => return Self::reject(ws_sender, stats, doc_id, client_id, &e).await,
                }
            }

            MessageType::SyncStep2 | MessageType::Update => {
                let applied = {
                    let mut rooms_w = rooms.write().await;
                    match rooms_w.get_mut(&doc_id) {
                        Some(room) => room.engine.apply_update(&msg.payload),
                        None => Ok(()),
                    }
                };
                if let Err(e) = applied {
                    return Self::reject(ws_sender, stats, doc_id, client_id, &e).await;
                }
                // A SyncStep2 is only an answer for us; everyone else gets it as an update.
                m.broadcast.broadcast(client_id, &SyncMessage::update(client_id, doc_id, msg.payload))?;
            }

            MessageType::Awareness => match msg.awareness_update() {
                Ok(mut update) => {
                    // A member may only speak for its own connection
                    let sent = update.entries.len();
                    update.entries.retain(|entry| entry.client_id == client_id);
                    if update.entries.len() < sent {
                        log::warn!(
                            "Client {client_id} sent awareness for {} other connections; dropped",
                            sent - update.entries.len()
                        );
                    }
                    if update.entries.is_empty() {
                        return Ok(true);
                    }
                    let changed = {
                        let mut rooms_w = rooms.write().await;
                        rooms_w
                            .get_mut(&doc_id)
                            .map(|room| room.awareness.apply_update(&update))
                            .unwrap_or(false)
                    };
                    log::trace!("Awareness from client {client_id} in {doc_id} (changed: {changed})");
                    m.broadcast
                        .broadcast(client_id, &SyncMessage::awareness(client_id, doc_id, &update)?)?;
                }
                Err(e) => log::warn!("Malformed awareness from client {client_id}: {e}"),
            },

            MessageType::Ping => send(ws_sender, &SyncMessage::pong(RELAY_ID)).await?,

            other => log::debug!("Unhandled {other:?} from client {client_id}"),
        }
        Ok(true)
    }

    /// Admit a connection into the room for `doc_id`.
    ///
    /// Returns `None` after sending `Reject` when the room is full.
    async fn join(
        doc_id: Uuid,
        ws_sender: &mut WsSink,
        rooms: &Rooms,
        config: &ServerConfig,
        next_client_id: &AtomicU64,
    ) -> SyncResult<Option<Membership>> {
        let (membership, peers, state_vector, presence) = {
            let mut rooms_w = rooms.write().await;
            let room = rooms_w
                .entry(doc_id)
                .or_insert_with(|| DocumentRoom::new(config.broadcast_capacity));

            let peers = room.broadcast.member_count().await;
            if peers >= config.max_peers_per_room {
                drop(rooms_w);
                log::warn!("Room {doc_id} is full ({peers} members)");
                send(ws_sender, &SyncMessage::reject(doc_id, "room full")).await?;
                return Ok(None);
            }

            let client_id = next_client_id.fetch_add(1, Ordering::SeqCst);
            let rx = room.broadcast.join(client_id).await;
            let membership = Membership {
                client_id,
                doc_id,
                broadcast: room.broadcast.clone(),
                rx,
            };
            (membership, peers, room.engine.state_vector(), room.awareness.snapshot())
        };

        let welcome = Welcome {
            client_id: membership.client_id,
            peers: u32::try_from(peers).unwrap_or(u32::MAX),
        };
        send(ws_sender, &SyncMessage::welcome(doc_id, welcome)?).await?;
        send(ws_sender, &SyncMessage::sync_step1(RELAY_ID, doc_id, state_vector)).await?;
        if !presence.entries.is_empty() {
            send(ws_sender, &SyncMessage::awareness(RELAY_ID, doc_id, &presence)?).await?;
        }

        log::info!("Client {} joined document {doc_id} ({peers} already present)", membership.client_id);
        Ok(Some(membership))
    }

    /// Remove a member; tell the others it is gone; drop the room if empty.
    async fn leave(rooms: &Rooms, stats: &Arc<RwLock<ServerStats>>, member: Membership) {
        let Membership { client_id, doc_id, broadcast, .. } = member;
        broadcast.leave(client_id).await;

        let mut rooms_w = rooms.write().await;
        if let Some(room) = rooms_w.get_mut(&doc_id) {
            if let Some(removal) = room.awareness.remove(client_id) {
                match SyncMessage::awareness(RELAY_ID, doc_id, &AwarenessUpdate::single(removal)) {
                    Ok(msg) => {
                        if let Err(e) = broadcast.broadcast(RELAY_ID, &msg) {
                            log::warn!("Could not announce departure of {client_id}: {e}");
                        }
                    }
                    Err(e) => log::warn!("Could not encode departure of {client_id}: {e}"),
                }
            }

            if room.broadcast.member_count().await == 0 {
                rooms_w.remove(&doc_id);
                log::info!("Room {doc_id} removed (empty)");
            }
        }
        log::info!("Client {client_id} left document {doc_id}");
        stats.write().await.active_rooms = rooms_w.len();
    }

    async fn reject(
        ws_sender: &mut WsSink,
        stats: &Arc<RwLock<ServerStats>>,
        doc_id: Uuid,
        client_id: ClientId,
        error: &SyncError,
    ) -> SyncResult<bool> {
        log::warn!("Rejecting client {client_id} in {doc_id}: {error}");
        stats.write().await.rejected += 1;
        send(ws_sender, &SyncMessage::reject(doc_id, &error.to_string())).await?;
        Ok(false)
    }

    async fn full_state(rooms: &Rooms, doc_id: Uuid) -> Option<Vec<u8>> {
        let rooms_r = rooms.read().await;
        let room = rooms_r.get(&doc_id)?;
        room.engine.diff_since(&StateVector::default().encode_v1()).ok()
    }

    /// Members currently in the room for `doc_id`.
    pub async fn room_members(&self, doc_id: Uuid) -> usize {
        let broadcast = {
            let rooms_r = self.rooms.read().await;
            rooms_r.get(&doc_id).map(|room| room.broadcast.clone())
        };
        match broadcast {
            Some(broadcast) => broadcast.member_count().await,
            None => 0,
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Current merged content of a room, if it exists.
    pub async fn room_text(&self, doc_id: Uuid) -> Option<String> {
        let rooms_r = self.rooms.read().await;
        rooms_r.get(&doc_id).map(|room| room.engine.text(Register::Content))
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

async fn send(ws_sender: &mut WsSink, msg: &SyncMessage) -> SyncResult<()> {
    ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
    Ok(())
}

/// Next frame for a joined member; pending forever before `Join`.
async fn recv_frame(member: &mut Option<Membership>) -> Result<Frame, broadcast::error::RecvError> {
    match member {
        Some(m) => m.rx.recv().await,
        None => std::future::pending().await,
    }
}
