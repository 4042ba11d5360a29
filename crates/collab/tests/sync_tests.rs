//! End-to-end tests: real sessions over a real WebSocket, through a minimal
//! in-process relay that fans every frame out to the other members of a
//! room, exactly as an opaque production relay would.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

use collab::permission::{DocumentAcl, InMemoryGate, UserGrant, Visibility};
use collab::session::{DocumentStore, EditorBuffer, LocalEdit, RoomManager, RoomSession};
use collab::{DocumentId, Result, SessionProfile, SyncConfig, TextDelta, UserId};

type Rooms = Arc<Mutex<HashMap<String, Vec<(u64, mpsc::UnboundedSender<Message>)>>>>;

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

struct TestRelay {
    addr: SocketAddr,
    accept: JoinHandle<()>,
    clients: Arc<StdMutex<Vec<JoinHandle<()>>>>,
}

impl TestRelay {
    async fn spawn() -> Self {
        Self::spawn_at("127.0.0.1:0".parse().unwrap()).await
    }

    /// Binds with SO_REUSEADDR so a "restarted" relay can take over the
    /// address of a killed one despite TIME_WAIT remnants.
    async fn spawn_at(addr: SocketAddr) -> Self {
        init_logging();
        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        socket.set_reuseaddr(true).unwrap();
        socket.bind(addr).unwrap();
        let listener = socket.listen(64).unwrap();
        Self::run(listener)
    }

    fn run(listener: TcpListener) -> Self {
        let addr = listener.local_addr().unwrap();
        let rooms: Rooms = Arc::new(Mutex::new(HashMap::new()));
        let clients: Arc<StdMutex<Vec<JoinHandle<()>>>> = Arc::new(StdMutex::new(Vec::new()));
        let clients_for_accept = clients.clone();
        let accept = tokio::spawn(async move {
            let mut next_id = 0u64;
            while let Ok((stream, _)) = listener.accept().await {
                next_id += 1;
                let handle = tokio::spawn(relay_client(stream, rooms.clone(), next_id));
                clients_for_accept.lock().unwrap().push(handle);
            }
        });
        Self {
            addr,
            accept,
            clients,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Drops the listener and every live connection, as a relay outage
    /// would.
    fn kill(&self) {
        self.accept.abort();
        for handle in self.clients.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

async fn relay_client(stream: TcpStream, rooms: Rooms, id: u64) {
    let mut path = String::new();
    let ws = accept_hdr_async(stream, |req: &Request, resp: Response| {
        path = req.uri().path().to_string();
        Ok(resp)
    })
    .await;
    let Ok(mut ws) = ws else { return };
    let room = path.trim_start_matches('/').to_string();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    rooms.lock().await.entry(room.clone()).or_default().push((id, tx));

    loop {
        tokio::select! {
            out = rx.recv() => match out {
                Some(msg) => {
                    if ws.send(msg).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = ws.next() => match inbound {
                Some(Ok(msg @ Message::Text(_))) => {
                    let members = rooms.lock().await;
                    if let Some(list) = members.get(&room) {
                        for (other, tx) in list {
                            if *other != id {
                                let _ = tx.send(msg.clone());
                            }
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    if let Some(list) = rooms.lock().await.get_mut(&room) {
        list.retain(|(other, _)| *other != id);
    }
}

#[derive(Clone, Default)]
struct SharedBuffer {
    text: Arc<StdMutex<String>>,
    read_only: Arc<AtomicBool>,
}

impl SharedBuffer {
    fn contents(&self) -> String {
        self.text.lock().unwrap().clone()
    }

    fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }
}

impl EditorBuffer for SharedBuffer {
    fn set_text(&mut self, text: &str) {
        *self.text.lock().unwrap() = text.to_string();
    }

    fn apply_delta(&mut self, delta: &TextDelta) {
        let mut guard = self.text.lock().unwrap();
        delta.apply_to(&mut guard);
    }

    fn set_read_only(&mut self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }
}

#[derive(Clone, Default)]
struct RecordingStore {
    saves: Arc<StdMutex<Vec<(DocumentId, String)>>>,
}

impl DocumentStore for RecordingStore {
    fn save_snapshot(&self, doc: &DocumentId, text: &str) -> Result<()> {
        self.saves.lock().unwrap().push((doc.clone(), text.to_string()));
        Ok(())
    }
}

fn fast_config() -> SyncConfig {
    SyncConfig {
        debounce: Duration::from_millis(10),
        heartbeat_interval: Duration::from_millis(100),
        awareness_timeout: Duration::from_millis(400),
        backoff_min: Duration::from_millis(50),
        backoff_max: Duration::from_millis(200),
        pending_gap_bound: Duration::from_millis(500),
    }
}

async fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(check(), "timed out waiting for {what}");
}

fn named(name: &str) -> SessionProfile {
    SessionProfile {
        display_name: Some(name.to_string()),
        color: None,
    }
}

fn open_session(
    relay: &TestRelay,
    doc: &DocumentId,
    user: UserId,
    name: &str,
    gate: Arc<InMemoryGate>,
    buffer: SharedBuffer,
) -> RoomSession {
    RoomSession::open(
        &relay.url(),
        doc.clone(),
        user,
        named(name),
        Box::new(buffer),
        gate,
        Arc::new(RecordingStore::default()),
        fast_config(),
    )
    .unwrap()
}

#[tokio::test]
async fn edits_replicate_both_ways() {
    let relay = TestRelay::spawn().await;
    let gate = Arc::new(InMemoryGate::new());
    let doc = DocumentId::from("shared");
    let owner = UserId::new();
    gate.put_acl(doc.clone(), DocumentAcl::new(owner, Visibility::EditAll));

    let buf_a = SharedBuffer::default();
    let buf_b = SharedBuffer::default();
    let a = open_session(&relay, &doc, owner, "alice", gate.clone(), buf_a.clone());
    let b = open_session(&relay, &doc, UserId::new(), "bob", gate.clone(), buf_b.clone());

    a.edit(LocalEdit {
        pos: 0,
        deleted: 0,
        inserted: "hello".into(),
    })
    .unwrap();
    wait_until("b to see hello", || buf_b.contents() == "hello").await;

    b.edit(LocalEdit {
        pos: 5,
        deleted: 0,
        inserted: " world".into(),
    })
    .unwrap();
    wait_until("a to see both edits", || buf_a.contents() == "hello world").await;
    assert_eq!(a.text().await.unwrap(), "hello world");
    assert_eq!(b.text().await.unwrap(), "hello world");

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn late_joiner_catches_up_from_the_state_vector_handshake() {
    let relay = TestRelay::spawn().await;
    let gate = Arc::new(InMemoryGate::new());
    let doc = DocumentId::from("history");
    let owner = UserId::new();
    gate.put_acl(doc.clone(), DocumentAcl::new(owner, Visibility::EditAll));

    let buf_a = SharedBuffer::default();
    let a = open_session(&relay, &doc, owner, "alice", gate.clone(), buf_a.clone());
    a.edit(LocalEdit {
        pos: 0,
        deleted: 0,
        inserted: "written before anyone else arrived".into(),
    })
    .unwrap();
    wait_until("a to settle", || {
        buf_a.contents() == "written before anyone else arrived"
    })
    .await;

    let buf_b = SharedBuffer::default();
    let b = open_session(&relay, &doc, UserId::new(), "bob", gate.clone(), buf_b.clone());
    wait_until("late joiner to catch up", || {
        buf_b.contents() == "written before anyone else arrived"
    })
    .await;

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn read_only_guests_receive_but_cannot_send() {
    let relay = TestRelay::spawn().await;
    let gate = Arc::new(InMemoryGate::new());
    let doc = DocumentId::from("announcements");
    let owner = UserId::new();
    let guest = UserId::new();
    let mut acl = DocumentAcl::new(owner, Visibility::Partial);
    acl.grants.insert(guest, UserGrant::ReadOnly);
    gate.put_acl(doc.clone(), acl);

    let buf_owner = SharedBuffer::default();
    let buf_guest = SharedBuffer::default();
    let a = open_session(&relay, &doc, owner, "owner", gate.clone(), buf_owner.clone());
    let b = open_session(&relay, &doc, guest, "guest", gate.clone(), buf_guest.clone());
    assert!(buf_guest.is_read_only());
    assert!(!buf_owner.is_read_only());

    a.edit(LocalEdit {
        pos: 0,
        deleted: 0,
        inserted: "notice".into(),
    })
    .unwrap();
    wait_until("guest to receive", || buf_guest.contents() == "notice").await;

    // The guest's attempt is rejected inside the session and never reaches
    // the wire.
    b.edit(LocalEdit {
        pos: 0,
        deleted: 0,
        inserted: "graffiti".into(),
    })
    .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(buf_owner.contents(), "notice");
    assert_eq!(b.text().await.unwrap(), "notice");

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn mid_session_revocation_forces_read_only() {
    let relay = TestRelay::spawn().await;
    let gate = Arc::new(InMemoryGate::new());
    let doc = DocumentId::from("wiki");
    let owner = UserId::new();
    let guest = UserId::new();
    gate.put_acl(doc.clone(), DocumentAcl::new(owner, Visibility::EditAll));

    let buf_owner = SharedBuffer::default();
    let buf_guest = SharedBuffer::default();
    let a = open_session(&relay, &doc, owner, "owner", gate.clone(), buf_owner.clone());
    let b = open_session(&relay, &doc, guest, "guest", gate.clone(), buf_guest.clone());

    b.edit(LocalEdit {
        pos: 0,
        deleted: 0,
        inserted: "base".into(),
    })
    .unwrap();
    wait_until("owner to see guest edit", || buf_owner.contents() == "base").await;

    // Demote everyone but the owner without disconnecting anyone.
    gate.set_visibility(&doc, Visibility::ReadAll);
    wait_until("guest buffer to flip read-only", || buf_guest.is_read_only()).await;

    b.edit(LocalEdit {
        pos: 4,
        deleted: 0,
        inserted: "!".into(),
    })
    .unwrap();
    // Remote operations still apply to the demoted guest.
    a.edit(LocalEdit {
        pos: 0,
        deleted: 0,
        inserted: "the ".into(),
    })
    .unwrap();
    wait_until("guest still receives", || buf_guest.contents() == "the base").await;
    assert_eq!(buf_owner.contents(), "the base");

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn room_switch_tears_down_and_announces_departure() {
    let relay = TestRelay::spawn().await;
    let gate = Arc::new(InMemoryGate::new());
    let doc1 = DocumentId::from("first");
    let doc2 = DocumentId::from("second");
    let owner = UserId::new();
    gate.put_acl(doc1.clone(), DocumentAcl::new(owner, Visibility::EditAll));
    gate.put_acl(doc2.clone(), DocumentAcl::new(owner, Visibility::EditAll));

    // An observer stays in the first room throughout.
    let buf_obs = SharedBuffer::default();
    let observer = open_session(
        &relay,
        &doc1,
        UserId::new(),
        "observer",
        gate.clone(),
        buf_obs.clone(),
    );
    let mut obs_peers = observer.peer_count();

    let mut manager = RoomManager::new(
        relay.url(),
        gate.clone(),
        Arc::new(RecordingStore::default()),
    )
    .with_config(fast_config());
    let first = manager
        .open(
            doc1.clone(),
            owner,
            named("switcher"),
            Box::new(SharedBuffer::default()),
        )
        .await
        .unwrap();
    let first_generation = first.generation();
    wait_until("observer to see two peers", || *obs_peers.borrow() == 2).await;

    let second = manager
        .open(
            doc2.clone(),
            owner,
            named("switcher"),
            Box::new(SharedBuffer::default()),
        )
        .await
        .unwrap();
    assert_ne!(second.generation(), first_generation);
    assert_eq!(second.document(), &doc2);
    wait_until("observer to see the departure", || *obs_peers.borrow() == 1).await;

    manager.close().await;
    observer.close().await;
}

#[tokio::test]
async fn awareness_roster_carries_names_and_counts() {
    let relay = TestRelay::spawn().await;
    let gate = Arc::new(InMemoryGate::new());
    let doc = DocumentId::from("standup");
    let owner = UserId::new();
    gate.put_acl(doc.clone(), DocumentAcl::new(owner, Visibility::EditAll));

    let a = open_session(
        &relay,
        &doc,
        owner,
        "alice",
        gate.clone(),
        SharedBuffer::default(),
    );
    let b = open_session(
        &relay,
        &doc,
        UserId::new(),
        "bob",
        gate.clone(),
        SharedBuffer::default(),
    );

    let mut a_peers = a.peer_count();
    wait_until("a to count two peers", || *a_peers.borrow() == 2).await;
    let roster = a.roster().await.unwrap();
    let names: Vec<String> = roster.iter().map(|(_, s)| s.name.clone()).collect();
    assert!(names.contains(&"alice".to_string()));
    assert!(names.contains(&"bob".to_string()));

    // After bob leaves, his entry goes (departure broadcast, with staleness
    // expiry as the fallback).
    b.close().await;
    wait_until("a to count one peer", || *a_peers.borrow() == 1).await;
    a.close().await;
}

#[tokio::test]
async fn relay_outage_reconnects_and_repairs() {
    let relay = TestRelay::spawn().await;
    let addr = relay.addr;
    let gate = Arc::new(InMemoryGate::new());
    let doc = DocumentId::from("resilient");
    let owner = UserId::new();
    gate.put_acl(doc.clone(), DocumentAcl::new(owner, Visibility::EditAll));

    let buf_a = SharedBuffer::default();
    let buf_b = SharedBuffer::default();
    let a = open_session(&relay, &doc, owner, "alice", gate.clone(), buf_a.clone());
    let b = open_session(&relay, &doc, UserId::new(), "bob", gate.clone(), buf_b.clone());

    a.edit(LocalEdit {
        pos: 0,
        deleted: 0,
        inserted: "hi".into(),
    })
    .unwrap();
    wait_until("b synced before the outage", || buf_b.contents() == "hi").await;

    relay.kill();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Typed while offline; applies locally at once.
    a.edit(LocalEdit {
        pos: 2,
        deleted: 0,
        inserted: " there".into(),
    })
    .unwrap();
    assert_eq!(a.text().await.unwrap(), "hi there");

    // Relay comes back on the same address; both sides reconnect, exchange
    // state vectors, and only the missed operations travel.
    let revived = TestRelay::spawn_at(addr).await;
    wait_until("b repaired after reconnect", || buf_b.contents() == "hi there").await;

    a.close().await;
    b.close().await;
    drop(revived);
}

#[tokio::test]
async fn save_pushes_the_current_snapshot() {
    let relay = TestRelay::spawn().await;
    let gate = Arc::new(InMemoryGate::new());
    let doc = DocumentId::from("journal");
    let owner = UserId::new();
    gate.put_acl(doc.clone(), DocumentAcl::new(owner, Visibility::EditAll));

    let store = RecordingStore::default();
    let session = RoomSession::open(
        &relay.url(),
        doc.clone(),
        owner,
        named("alice"),
        Box::new(SharedBuffer::default()),
        gate,
        Arc::new(store.clone()),
        fast_config(),
    )
    .unwrap();

    session
        .edit(LocalEdit {
            pos: 0,
            deleted: 0,
            inserted: "dear diary".into(),
        })
        .unwrap();
    session.save().await.unwrap();

    let saves = store.saves.lock().unwrap().clone();
    assert_eq!(saves, vec![(doc, "dear diary".to_string())]);
    session.close().await;
}
