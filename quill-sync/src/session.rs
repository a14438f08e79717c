//! Session: one replica kept in sync with one document room.
//!
//! ## Architecture
//!
//! ```text
//!  Session (public API)                 driver task
//!  ────────────────────                 ───────────
//!  local_edit ──► replica ──► outbound ──► Update frames ──► Connection
//!  set_cursor ──────────────► cursor_rx ─► Awareness frames ─┘
//!                                                │
//!  status_watch ◄── StatusCell ◄── connect / handshake / serve loop
//!                                                │ first Connected
//!                                                ▼
//!                                     reconciliation task
//! ```
//!
//! The driver owns the connection, the raw awareness states and the
//! presence tracker. Everything touching the replica goes through the shared
//! lock, so inbound frames, reconciliation and API calls never interleave.
//!
//! ## Connection lifecycle
//!
//! ```text
//! connect ─► Join ─► Welcome ─► SyncStep1 + Awareness(self) ─► Connected
//!    ▲                                                             │
//!    └──── backoff (ReconnectPolicy) ◄──── Disconnected ◄── lost ──┤
//!                                                                  │
//!                         Desynchronized (driver stops) ◄── Reject / bad update
//! ```

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::content::ContentSource;
use crate::document::{DocumentReplica, OutboundUpdates, SharedReplica};
use crate::error::{SyncError, SyncResult};
use crate::presence::{
    AwarenessEntry, AwarenessMap, AwarenessUpdate, ClientId, CursorRange, LocalPresence, PeerInfo,
    PresenceTracker,
};
use crate::protocol::{MessageType, SyncMessage, Welcome};
use crate::reconcile::Reconciler;
use crate::sink::{SessionSink, SessionStatus, StatusCell};
use crate::transport::{Connection, Connector};

/// A live editing session for one document.
///
/// Dropping the session stops the driver, clears local presence and disposes
/// the replica, the same as [`Session::dispose`] minus waiting for it.
pub struct Session {
    doc_id: Uuid,
    replica: SharedReplica,
    status: Arc<StatusCell>,
    disposed: Arc<AtomicBool>,
    reconciler: Arc<Reconciler>,
    cursor_tx: mpsc::UnboundedSender<Option<CursorRange>>,
    shutdown: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Create the replica and spawn the driver task. Must be called within a
    /// tokio runtime.
    pub fn start<C, S>(
        config: SessionConfig,
        identity: PeerInfo,
        doc_id: Uuid,
        connector: C,
        source: S,
        sink: Arc<dyn SessionSink>,
    ) -> SyncResult<Self>
    where
        C: Connector,
        S: ContentSource,
    {
        if !identity.is_valid() {
            log::warn!("Identity {identity:?} is malformed; peers will not see this session");
        }

        let (mut replica, outbound) = DocumentReplica::new();
        let language_sink = sink.clone();
        replica.observe_language(move |language| language_sink.on_language(language))?;
        let replica = replica.into_shared();

        let status = Arc::new(StatusCell::new());
        let disposed = Arc::new(AtomicBool::new(false));
        let reconciler = Arc::new(Reconciler::new(doc_id, config.clone()));
        let (cursor_tx, cursor_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let driver = Driver {
            doc_id,
            config,
            connector,
            source: Arc::new(source),
            sink: sink.clone(),
            replica: replica.clone(),
            outbound,
            cursor_rx,
            status: status.clone(),
            disposed: disposed.clone(),
            reconciler: reconciler.clone(),
            local: LocalPresence::new(identity),
            awareness: AwarenessMap::new(),
            tracker: PresenceTracker::new(sink),
        };
        let handle = tokio::spawn(driver.drive(shutdown_rx));
        log::info!("Session started for document {doc_id}");

        Ok(Self {
            doc_id,
            replica,
            status,
            disposed,
            reconciler,
            cursor_tx,
            shutdown,
            driver: Mutex::new(Some(handle)),
        })
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    /// Replace `range` of the content (UTF-16 offsets) with `text`.
    pub async fn local_edit(&self, range: Range<u32>, text: &str) -> SyncResult<()> {
        self.check_live()?;
        self.replica.lock().await.local_edit(range, text)
    }

    /// Overwrite the document's language tag.
    pub async fn set_language(&self, language: &str) -> SyncResult<()> {
        self.check_live()?;
        self.replica.lock().await.set_language(language)
    }

    /// Publish the local selection. Remembered across reconnects.
    pub fn set_cursor(&self, cursor: Option<CursorRange>) -> SyncResult<()> {
        self.check_live()?;
        self.cursor_tx.send(cursor).map_err(|_| SyncError::Disposed)
    }

    pub async fn snapshot_text(&self) -> SyncResult<String> {
        self.replica.lock().await.snapshot_text()
    }

    pub async fn snapshot_language(&self) -> SyncResult<String> {
        self.replica.lock().await.snapshot_language()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.get()
    }

    /// Watch status transitions.
    pub fn status_watch(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// The shared replica, for binding an editor to it.
    pub fn replica(&self) -> SharedReplica {
        self.replica.clone()
    }

    /// Whether first-content reconciliation has finished.
    pub fn is_reconciled(&self) -> bool {
        self.reconciler.is_resolved()
    }

    /// Stop syncing. Local presence is cleared before the connection closes,
    /// then the replica is released. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);

        let handle = self.driver.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::warn!("Session driver for {} ended abnormally: {e}", self.doc_id);
            }
        }

        self.replica.lock().await.dispose();
        log::info!("Session for document {} disposed", self.doc_id);
    }

    fn check_live(&self) -> SyncResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(SyncError::Disposed);
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // The driver notices the dropped shutdown sender and winds down.
        self.disposed.store(true, Ordering::Release);
    }
}

// ───────────────────────────────────────────────────────────────────
// Driver
// ───────────────────────────────────────────────────────────────────

/// Why the driver stopped for good.
enum DriverExit {
    Desynchronized(String),
    Disposed,
}

/// How one connection ended.
enum ConnectionEnd {
    /// Failed before `Welcome`.
    HandshakeFailed,
    /// Lost after `Welcome`.
    Lost,
    Exit(DriverExit),
}

/// Clears the local presence entry on the connection it was issued for.
///
/// Declared after the connection inside `serve`, so it is dropped first on
/// every exit path.
struct PresenceLease {
    presence: LocalPresence,
    client_id: ClientId,
    doc_id: Uuid,
    outgoing: mpsc::Sender<SyncMessage>,
}

impl Drop for PresenceLease {
    fn drop(&mut self) {
        let entry = self.presence.clear_entry(self.client_id);
        match SyncMessage::awareness(self.client_id, self.doc_id, &AwarenessUpdate::single(entry)) {
            Ok(msg) => {
                if self.outgoing.try_send(msg).is_err() {
                    log::debug!("Presence clear for client {} not delivered", self.client_id);
                }
            }
            Err(e) => log::debug!("Presence clear for client {} not encoded: {e}", self.client_id),
        }
    }
}

struct Driver<C, S> {
    doc_id: Uuid,
    config: SessionConfig,
    connector: C,
    source: Arc<S>,
    sink: Arc<dyn SessionSink>,
    replica: SharedReplica,
    outbound: OutboundUpdates,
    cursor_rx: mpsc::UnboundedReceiver<Option<CursorRange>>,
    status: Arc<StatusCell>,
    disposed: Arc<AtomicBool>,
    reconciler: Arc<Reconciler>,
    local: LocalPresence,
    awareness: AwarenessMap,
    tracker: PresenceTracker,
}

/// Resolves once shutdown is requested or the `Session` is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

impl<C: Connector, S: ContentSource> Driver<C, S> {
    async fn drive(mut self, mut shutdown: watch::Receiver<bool>) {
        let exit = tokio::select! {
            exit = self.run() => exit,
            _ = stopped(&mut shutdown) => DriverExit::Disposed,
        };
        self.finish(exit).await;
    }

    async fn run(&mut self) -> DriverExit {
        let mut attempt: u32 = 0;
        loop {
            match self.connector.connect(self.doc_id).await {
                Ok(conn) => {
                    match self.serve(conn).await {
                        ConnectionEnd::Exit(exit) => return exit,
                        ConnectionEnd::Lost => attempt = 0,
                        ConnectionEnd::HandshakeFailed => {}
                    }
                    self.connection_lost();
                }
                Err(e) => log::debug!("Connecting to document {} failed: {e}", self.doc_id),
            }

            let delay = self.config.reconnect.delay(attempt);
            attempt = attempt.saturating_add(1);
            log::debug!("Reconnecting to {} in {delay:?} (attempt {attempt})", self.doc_id);
            if let Some(exit) = self.idle(delay).await {
                return exit;
            }
        }
    }

    /// Wait out the backoff while keeping local state current.
    async fn idle(&mut self, delay: Duration) -> Option<DriverExit> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return None,
                update = self.outbound.recv() => match update {
                    // The next handshake's SyncStep2 carries it.
                    Some(_) => {}
                    None => return Some(DriverExit::Disposed),
                },
                cursor = self.cursor_rx.recv() => match cursor {
                    Some(cursor) => {
                        self.local.set_cursor(0, cursor);
                    }
                    None => return Some(DriverExit::Disposed),
                },
            }
        }
    }

    async fn serve(&mut self, mut conn: Connection) -> ConnectionEnd {
        let welcome = match self.handshake(&mut conn).await {
            Ok(welcome) => welcome,
            Err(end) => return end,
        };
        let client_id = welcome.client_id;
        log::info!(
            "Joined document {} as client {client_id} ({} peers present)",
            self.doc_id,
            welcome.peers
        );

        self.awareness.clear();
        self.tracker.set_local_client(Some(client_id));
        self.local.reset_clock();
        let _lease = PresenceLease {
            presence: self.local.clone(),
            client_id,
            doc_id: self.doc_id,
            outgoing: conn.outgoing.clone(),
        };

        if let Err(end) = self.open(&conn.outgoing, client_id).await {
            return end;
        }
        self.set_status(SessionStatus::Connected);
        self.announce_language().await;
        self.spawn_reconcile(welcome.peers > 0);

        loop {
            tokio::select! {
                msg = conn.incoming.recv() => {
                    let Some(msg) = msg else {
                        log::info!("Connection to document {} lost", self.doc_id);
                        return ConnectionEnd::Lost;
                    };
                    if let Some(end) = self.handle_frame(msg, client_id, &conn.outgoing).await {
                        return end;
                    }
                }
                update = self.outbound.recv() => {
                    let Some(update) = update else {
                        return ConnectionEnd::Exit(DriverExit::Disposed);
                    };
                    let msg = SyncMessage::update(client_id, self.doc_id, update);
                    if conn.outgoing.send(msg).await.is_err() {
                        return ConnectionEnd::Lost;
                    }
                }
                cursor = self.cursor_rx.recv() => {
                    let Some(cursor) = cursor else {
                        return ConnectionEnd::Exit(DriverExit::Disposed);
                    };
                    let entry = self.local.set_cursor(client_id, cursor);
                    if let Err(end) = self.send_awareness(&conn.outgoing, client_id, entry).await {
                        return end;
                    }
                }
            }
        }
    }

    async fn handshake(&self, conn: &mut Connection) -> Result<Welcome, ConnectionEnd> {
        if conn.outgoing.send(SyncMessage::join(self.doc_id)).await.is_err() {
            return Err(ConnectionEnd::HandshakeFailed);
        }

        let incoming = &mut conn.incoming;
        let wait = async move {
            while let Some(msg) = incoming.recv().await {
                match msg.msg_type {
                    MessageType::Welcome => {
                        return msg.welcome_info().map_err(|e| {
                            log::warn!("Unreadable Welcome: {e}");
                            ConnectionEnd::HandshakeFailed
                        });
                    }
                    MessageType::Reject => {
                        let reason = msg.reject_reason().unwrap_or_default();
                        return Err(ConnectionEnd::Exit(DriverExit::Desynchronized(reason)));
                    }
                    other => log::trace!("Ignoring {other:?} before Welcome"),
                }
            }
            Err(ConnectionEnd::HandshakeFailed)
        };

        match tokio::time::timeout(self.config.handshake_timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!(
                    "No Welcome for document {} within {:?}",
                    self.doc_id,
                    self.config.handshake_timeout
                );
                Err(ConnectionEnd::HandshakeFailed)
            }
        }
    }

    /// Start the sync handshake and announce ourselves.
    async fn open(&mut self, outgoing: &mpsc::Sender<SyncMessage>, client_id: ClientId) -> Result<(), ConnectionEnd> {
        let state_vector = self
            .replica
            .lock()
            .await
            .state_vector()
            .map_err(Self::replica_failure)?;
        // Queued so far means already in our state; SyncStep2 covers it.
        while self.outbound.try_recv().is_ok() {}

        outgoing
            .send(SyncMessage::sync_step1(client_id, self.doc_id, state_vector))
            .await
            .map_err(|_| ConnectionEnd::Lost)?;
        let entry = self.local.entry(client_id);
        self.send_awareness(outgoing, client_id, entry).await
    }

    async fn handle_frame(
        &mut self,
        msg: SyncMessage,
        client_id: ClientId,
        outgoing: &mpsc::Sender<SyncMessage>,
    ) -> Option<ConnectionEnd> {
        log::trace!("Received {:?} from client {}", msg.msg_type, msg.client_id);
        match msg.msg_type {
            MessageType::SyncStep1 => {
                let diff = self.replica.lock().await.diff_since(&msg.payload);
                match diff {
                    Ok(diff) => {
                        let reply = SyncMessage::sync_step2(client_id, self.doc_id, diff);
                        if outgoing.send(reply).await.is_err() {
                            return Some(ConnectionEnd::Lost);
                        }
                    }
                    Err(e) => return Some(Self::replica_failure(e)),
                }
            }
            MessageType::SyncStep2 | MessageType::Update => {
                let applied = self.replica.lock().await.apply_remote_update(&msg.payload);
                if let Err(e) = applied {
                    return Some(Self::replica_failure(e));
                }
            }
            MessageType::Awareness => match msg.awareness_update() {
                Ok(update) => {
                    if self.awareness.apply_update(&update) {
                        self.tracker.update(&self.awareness);
                    }
                }
                Err(e) => log::warn!("Ignoring malformed awareness frame: {e}"),
            },
            MessageType::Reject => {
                let reason = msg.reject_reason().unwrap_or_default();
                return Some(ConnectionEnd::Exit(DriverExit::Desynchronized(reason)));
            }
            MessageType::Ping => {
                if outgoing.send(SyncMessage::pong(client_id)).await.is_err() {
                    return Some(ConnectionEnd::Lost);
                }
            }
            MessageType::Pong | MessageType::Join | MessageType::Welcome => {}
        }
        None
    }

    async fn send_awareness(
        &self,
        outgoing: &mpsc::Sender<SyncMessage>,
        client_id: ClientId,
        entry: AwarenessEntry,
    ) -> Result<(), ConnectionEnd> {
        match SyncMessage::awareness(client_id, self.doc_id, &AwarenessUpdate::single(entry)) {
            Ok(msg) => outgoing.send(msg).await.map_err(|_| ConnectionEnd::Lost),
            Err(e) => {
                log::warn!("Dropping awareness frame: {e}");
                Ok(())
            }
        }
    }

    async fn announce_language(&self) {
        let language = self.replica.lock().await.snapshot_language();
        if let Ok(language) = language {
            if !language.is_empty() {
                self.sink.on_language(&language);
            }
        }
    }

    fn spawn_reconcile(&self, room_hint: bool) {
        if self.reconciler.is_resolved() {
            return;
        }
        let reconciler = self.reconciler.clone();
        let replica = self.replica.clone();
        let source = self.source.clone();
        let disposed = self.disposed.clone();
        tokio::spawn(async move {
            reconciler.resolve(&replica, &*source, Some(room_hint), &disposed).await;
        });
    }

    fn replica_failure(e: SyncError) -> ConnectionEnd {
        match e {
            SyncError::Disposed => ConnectionEnd::Exit(DriverExit::Disposed),
            e => ConnectionEnd::Exit(DriverExit::Desynchronized(e.to_string())),
        }
    }

    fn set_status(&self, status: SessionStatus) {
        if self.status.transition(status) {
            log::info!("Document {} is now {status:?}", self.doc_id);
            self.sink.on_status(status);
        }
    }

    fn connection_lost(&mut self) {
        self.set_status(SessionStatus::Disconnected);
        self.drop_peers();
    }

    fn drop_peers(&mut self) {
        self.awareness.clear();
        self.tracker.set_local_client(None);
        self.tracker.update(&self.awareness);
    }

    async fn finish(mut self, exit: DriverExit) {
        match exit {
            DriverExit::Desynchronized(reason) => {
                log::warn!("Document {} desynchronized: {reason}", self.doc_id);
                self.set_status(SessionStatus::Desynchronized);
            }
            DriverExit::Disposed => {
                self.set_status(SessionStatus::Disconnected);
                // Covers a dropped `Session`, which never gets to dispose itself
                self.replica.lock().await.dispose();
            }
        }
        self.drop_peers();
        log::debug!("Session driver for {} stopped", self.doc_id);
    }
}
