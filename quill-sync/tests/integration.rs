//! Integration tests for end-to-end document sync.
//!
//! These tests start a real relay and connect real sessions over WebSocket,
//! verifying convergence and first-content reconciliation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use quill_sync::{
    ChannelSink, Connector, ContentSource, InitialContent, MessageType, NoContent, NullSink, PeerInfo,
    ServerConfig, Session, SessionConfig, SessionEvent, SessionSink, SessionStatus, SyncMessage, SyncResult,
    SyncServer, WsConnector,
};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

/// Start a relay on a free port, return it with its URL.
async fn start_test_server() -> (Arc<SyncServer>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(SyncServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_peers_per_room: 10,
        broadcast_capacity: 64,
    }));
    let relay = server.clone();
    tokio::spawn(async move {
        relay.serve(listener).await.unwrap();
    });
    (server, format!("ws://127.0.0.1:{port}"))
}

/// Backend returning a fixed snapshot and counting fetches.
#[derive(Clone)]
struct Backend {
    snapshot: InitialContent,
    fetches: Arc<AtomicUsize>,
}

impl Backend {
    fn new(snapshot: InitialContent) -> Self {
        Self {
            snapshot,
            fetches: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl ContentSource for Backend {
    async fn fetch_initial_content(&self, _doc_id: Uuid) -> SyncResult<InitialContent> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.snapshot.clone())
    }
}

fn join<S: ContentSource>(url: &str, doc_id: Uuid, name: &str, source: S, sink: Arc<dyn SessionSink>) -> Session {
    Session::start(
        SessionConfig::default(),
        PeerInfo::with_random_hue(name),
        doc_id,
        WsConnector::new(url),
        source,
        sink,
    )
    .unwrap()
}

async fn wait_connected(session: &Session) {
    let mut status = session.status_watch();
    timeout(WAIT, status.wait_for(|s| *s == SessionStatus::Connected))
        .await
        .expect("session never connected")
        .unwrap();
}

async fn wait_for_text(session: &Session, expected: &str) {
    let reached = timeout(WAIT, async {
        while session.snapshot_text().await.unwrap() != expected {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(
        reached.is_ok(),
        "expected {expected:?}, have {:?}",
        session.snapshot_text().await
    );
}

async fn wait_reconciled(session: &Session) {
    timeout(WAIT, async {
        while !session.is_reconciled() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("reconciliation never finished");
}

#[tokio::test]
async fn test_two_sessions_converge() {
    let (server, url) = start_test_server().await;
    let doc_id = Uuid::new_v4();

    let amy = join(&url, doc_id, "Amy", NoContent, Arc::new(NullSink));
    let bob = join(&url, doc_id, "Bob", NoContent, Arc::new(NullSink));
    wait_connected(&amy).await;
    wait_connected(&bob).await;

    amy.local_edit(0..0, "hello").await.unwrap();
    wait_for_text(&bob, "hello").await;

    bob.local_edit(5..5, " world").await.unwrap();
    wait_for_text(&amy, "hello world").await;

    assert_eq!(server.room_text(doc_id).await.as_deref(), Some("hello world"));
    assert_eq!(server.room_members(doc_id).await, 2);
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let (_server, url) = start_test_server().await;
    let doc_id = Uuid::new_v4();

    let amy = join(&url, doc_id, "Amy", NoContent, Arc::new(NullSink));
    let bob = join(&url, doc_id, "Bob", NoContent, Arc::new(NullSink));
    wait_connected(&amy).await;
    wait_connected(&bob).await;

    let (a, b) = tokio::join!(amy.local_edit(0..0, "left"), bob.local_edit(0..0, "right"));
    a.unwrap();
    b.unwrap();

    let converged = timeout(WAIT, async {
        loop {
            let (x, y) = (amy.snapshot_text().await.unwrap(), bob.snapshot_text().await.unwrap());
            if x == y && x.len() == "leftright".len() {
                return x;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("replicas never converged");
    assert!(converged.contains("left") && converged.contains("right"));
}

#[tokio::test]
async fn test_first_joiner_seeds_second_syncs() {
    let (server, url) = start_test_server().await;
    let doc_id = Uuid::new_v4();
    let backend = Backend::new(InitialContent::new("saved text").with_language("rust"));

    let amy = join(&url, doc_id, "Amy", backend.clone(), Arc::new(NullSink));
    wait_reconciled(&amy).await;
    assert_eq!(amy.snapshot_text().await.unwrap(), "saved text");
    assert_eq!(backend.fetches(), 1);

    let (sink, mut events) = ChannelSink::new();
    let bob = join(&url, doc_id, "Bob", backend.clone(), Arc::new(sink));
    wait_reconciled(&bob).await;
    wait_for_text(&bob, "saved text").await;
    timeout(WAIT, async {
        while bob.snapshot_language().await.unwrap() != "rust" {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("language never synced");

    // Bob found the room occupied and never touched the backend.
    assert_eq!(backend.fetches(), 1);
    assert_eq!(server.room_text(doc_id).await.as_deref(), Some("saved text"));

    let mut saw_language = false;
    while let Ok(event) = events.try_recv() {
        saw_language |= event == SessionEvent::Language("rust".into());
    }
    assert!(saw_language);
}

#[tokio::test]
async fn test_simultaneous_joiners_seed_once() {
    let (_server, url) = start_test_server().await;
    let doc_id = Uuid::new_v4();
    let backend = Backend::new(InitialContent::new("only once"));

    let amy = join(&url, doc_id, "Amy", backend.clone(), Arc::new(NullSink));
    let bob = join(&url, doc_id, "Bob", backend.clone(), Arc::new(NullSink));
    wait_reconciled(&amy).await;
    wait_reconciled(&bob).await;

    wait_for_text(&amy, "only once").await;
    wait_for_text(&bob, "only once").await;
    assert_eq!(backend.fetches(), 1);
}

#[tokio::test]
async fn test_empty_room_is_reseeded() {
    let (server, url) = start_test_server().await;
    let doc_id = Uuid::new_v4();
    let backend = Backend::new(InitialContent::new("v1"));

    let amy = join(&url, doc_id, "Amy", backend.clone(), Arc::new(NullSink));
    wait_reconciled(&amy).await;
    amy.dispose().await;

    timeout(WAIT, async {
        while server.room_count().await > 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("room never dropped");

    let bob = join(&url, doc_id, "Bob", backend.clone(), Arc::new(NullSink));
    wait_reconciled(&bob).await;
    assert_eq!(bob.snapshot_text().await.unwrap(), "v1");
    assert_eq!(backend.fetches(), 2);
}

#[tokio::test]
async fn test_relay_rejects_undecodable_update() {
    let (server, url) = start_test_server().await;
    let doc_id = Uuid::new_v4();

    let mut conn = WsConnector::new(&url).connect(doc_id).await.unwrap();
    conn.outgoing.send(SyncMessage::join(doc_id)).await.unwrap();
    let welcome = timeout(WAIT, conn.incoming.recv()).await.unwrap().unwrap();
    let client_id = welcome.welcome_info().unwrap().client_id;

    conn.outgoing
        .send(SyncMessage::update(client_id, doc_id, vec![0xFF, 0xFE, 0xFD]))
        .await
        .unwrap();

    let reject = loop {
        let msg = timeout(WAIT, conn.incoming.recv()).await.unwrap().expect("closed without Reject");
        if msg.msg_type == MessageType::Reject {
            break msg;
        }
    };
    assert!(!reject.reject_reason().unwrap().is_empty());
    assert_eq!(server.stats().await.rejected, 1);
}
