use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::awareness::{color_for, default_name, AwarenessState, AwarenessStore, CursorState};
use crate::permission::{PermissionDecision, PermissionGate};
use crate::protocol::SyncMessage;
use crate::replica::{Replica, StateVector};
use crate::transport::{room_url, ConnectionStatus, SyncTransport, TransportEvent};
use crate::{
    CollabError, DocumentId, PeerId, Result, SessionProfile, SyncConfig, TextDelta, UserId,
};

/// The editor widget, as the session sees it. Implementations forward to
/// whatever text component hosts the document.
pub trait EditorBuffer: Send + 'static {
    fn set_text(&mut self, text: &str);
    fn apply_delta(&mut self, delta: &TextDelta);
    fn set_read_only(&mut self, read_only: bool);
}

/// Persistence collaborator for explicit saves. Snapshots go out only when
/// the user asks; the sync layer never writes durably on its own.
pub trait DocumentStore: Send + Sync + 'static {
    fn save_snapshot(&self, doc: &DocumentId, text: &str) -> Result<()>;
}

/// One user keystroke batch as reported by the buffer: replace `deleted`
/// characters at `pos` with `inserted`.
#[derive(Debug, Clone)]
pub struct LocalEdit {
    pub pos: usize,
    pub deleted: usize,
    pub inserted: String,
}

/// Identifies one session instance. Anything holding callbacks into a
/// session compares generations first, so events from a torn-down session
/// cannot touch its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionGeneration(Uuid);

impl SessionGeneration {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

enum SessionCommand {
    Edit(LocalEdit),
    Cursor(Option<CursorState>),
    Text(oneshot::Sender<String>),
    Save(oneshot::Sender<Result<()>>),
    Roster(oneshot::Sender<Vec<(PeerId, AwarenessState)>>),
    Close(oneshot::Sender<()>),
}

/// A live connection of one user to one room: replica, transport, and
/// awareness bound together under a single event loop, permission-gated at
/// join and for every mutation afterwards. Destroyed wholesale on room
/// switch; nothing carries over between sessions.
#[derive(Debug)]
pub struct RoomSession {
    generation: SessionGeneration,
    doc: DocumentId,
    peer: PeerId,
    commands: mpsc::UnboundedSender<SessionCommand>,
    status: watch::Receiver<ConnectionStatus>,
    peers: watch::Receiver<usize>,
    task: JoinHandle<()>,
}

impl RoomSession {
    /// Opens a session. Fails with [`CollabError::PermissionDenied`] before
    /// any transport exists if the user may not read the document. Must be
    /// called on a tokio runtime.
    pub fn open(
        relay_url: &str,
        doc: DocumentId,
        user: UserId,
        profile: SessionProfile,
        mut buffer: Box<dyn EditorBuffer>,
        gate: Arc<dyn PermissionGate>,
        store: Arc<dyn DocumentStore>,
        config: SyncConfig,
    ) -> Result<Self> {
        let decision = gate.authorize_join(&doc, &user);
        if !decision.can_read {
            return Err(CollabError::PermissionDenied(format!(
                "user {user} may not read document {doc}"
            )));
        }
        let peer = PeerId::new();
        let replica = Replica::new(peer);
        let mut awareness = AwarenessStore::new(peer);
        awareness.set_local(AwarenessState {
            name: profile
                .display_name
                .unwrap_or_else(|| default_name(&peer)),
            color: profile.color.unwrap_or_else(|| color_for(&peer)),
            cursor: None,
        });

        let (sv_tx, sv_rx) = watch::channel(replica.state_vector());
        let (transport, transport_events) =
            SyncTransport::connect(room_url(relay_url, &doc.0, peer), &config, sv_rx);
        let status = transport.status();
        let permissions = gate.subscribe(&doc, &user);

        buffer.set_text(&replica.text());
        buffer.set_read_only(!decision.can_write);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (peers_tx, peers_rx) = watch::channel(awareness.peer_count());
        let generation = SessionGeneration::new();
        info!(%doc, %peer, %user, "room session opened");

        let worker = SessionWorker {
            doc: doc.clone(),
            replica,
            awareness,
            buffer,
            transport: Some(transport),
            transport_events,
            commands: cmd_rx,
            permissions,
            permissions_live: true,
            can_write: decision.can_write,
            store,
            sv_tx,
            peers_tx,
            config,
        };
        let task = tokio::spawn(worker.run());

        Ok(Self {
            generation,
            doc,
            peer,
            commands: cmd_tx,
            status,
            peers: peers_rx,
            task,
        })
    }

    pub fn generation(&self) -> SessionGeneration {
        self.generation
    }

    pub fn document(&self) -> &DocumentId {
        &self.doc
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Feeds one local edit into the session. Returns immediately; the
    /// replica applies it before anything goes on the wire.
    pub fn edit(&self, edit: LocalEdit) -> Result<()> {
        self.commands
            .send(SessionCommand::Edit(edit))
            .map_err(|_| CollabError::Closed)
    }

    pub fn set_cursor(&self, cursor: Option<CursorState>) -> Result<()> {
        self.commands
            .send(SessionCommand::Cursor(cursor))
            .map_err(|_| CollabError::Closed)
    }

    /// Current document text as this replica sees it.
    pub async fn text(&self) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Text(tx))
            .map_err(|_| CollabError::Closed)?;
        rx.await.map_err(|_| CollabError::Closed)
    }

    /// Pushes the current text to the persistence collaborator.
    pub async fn save(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Save(tx))
            .map_err(|_| CollabError::Closed)?;
        rx.await.map_err(|_| CollabError::Closed)?
    }

    /// Live awareness roster, local entry included.
    pub async fn roster(&self) -> Result<Vec<(PeerId, AwarenessState)>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Roster(tx))
            .map_err(|_| CollabError::Closed)?;
        rx.await.map_err(|_| CollabError::Closed)
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Number of peers in the room, self included.
    pub fn peer_count(&self) -> watch::Receiver<usize> {
        self.peers.clone()
    }

    /// Tears the session down: buffer detaches, the transport closes (and
    /// with it every retry timer), then replica and awareness drop.
    pub async fn close(self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(SessionCommand::Close(tx)).is_ok() {
            let _ = rx.await;
        }
        let _ = self.task.await;
    }
}

/// Opens and tears down sessions so that at most one is live. Switching
/// rooms always destroys the previous session first.
pub struct RoomManager {
    relay_url: String,
    gate: Arc<dyn PermissionGate>,
    store: Arc<dyn DocumentStore>,
    config: SyncConfig,
    current: Option<RoomSession>,
}

impl RoomManager {
    pub fn new(
        relay_url: impl Into<String>,
        gate: Arc<dyn PermissionGate>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            relay_url: relay_url.into(),
            gate,
            store,
            config: SyncConfig::default(),
            current: None,
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn open(
        &mut self,
        doc: DocumentId,
        user: UserId,
        profile: SessionProfile,
        buffer: Box<dyn EditorBuffer>,
    ) -> Result<&RoomSession> {
        if let Some(prev) = self.current.take() {
            prev.close().await;
        }
        let session = RoomSession::open(
            &self.relay_url,
            doc,
            user,
            profile,
            buffer,
            self.gate.clone(),
            self.store.clone(),
            self.config.clone(),
        )?;
        Ok(self.current.insert(session))
    }

    pub fn current(&self) -> Option<&RoomSession> {
        self.current.as_ref()
    }

    pub async fn close(&mut self) {
        if let Some(session) = self.current.take() {
            session.close().await;
        }
    }
}

struct SessionWorker {
    doc: DocumentId,
    replica: Replica,
    awareness: AwarenessStore,
    buffer: Box<dyn EditorBuffer>,
    transport: Option<SyncTransport>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    permissions: watch::Receiver<PermissionDecision>,
    permissions_live: bool,
    can_write: bool,
    store: Arc<dyn DocumentStore>,
    sv_tx: watch::Sender<StateVector>,
    peers_tx: watch::Sender<usize>,
    config: SyncConfig,
}

impl SessionWorker {
    async fn run(mut self) {
        // One timer drives heartbeat, awareness expiry, and the causal-gap
        // deadline; everything else is event-driven.
        let mut housekeeping = tokio::time::interval(self.config.heartbeat_interval);
        let mut close_ack: Option<oneshot::Sender<()>> = None;
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    None => break,
                    Some(SessionCommand::Close(ack)) => {
                        close_ack = Some(ack);
                        break;
                    }
                    Some(cmd) => {
                        if let Err(e) = self.handle_command(cmd) {
                            warn!(doc = %self.doc, error = %e, "command rejected");
                        }
                    }
                },
                ev = self.transport_events.recv() => match ev {
                    None | Some(TransportEvent::Closed) => break,
                    Some(TransportEvent::Open) => debug!(doc = %self.doc, "transport open"),
                    Some(TransportEvent::Message(msg)) => {
                        if let Err(e) = self.handle_message(msg) {
                            warn!(doc = %self.doc, error = %e, "frame dropped");
                        }
                    }
                },
                _ = housekeeping.tick() => self.housekeeping(),
                changed = self.permissions.changed(), if self.permissions_live => {
                    match changed {
                        Ok(()) => {
                            let decision = *self.permissions.borrow_and_update();
                            if !self.apply_decision(decision) {
                                break;
                            }
                        }
                        Err(_) => self.permissions_live = false,
                    }
                },
            }
        }
        self.teardown().await;
        if let Some(ack) = close_ack {
            let _ = ack.send(());
        }
    }

    fn handle_command(&mut self, cmd: SessionCommand) -> Result<()> {
        match cmd {
            SessionCommand::Edit(edit) => {
                if !self.can_write {
                    return Err(CollabError::PermissionDenied("session is read-only".into()));
                }
                let mut ops = Vec::new();
                if edit.deleted > 0 {
                    ops.push(self.replica.local_delete(edit.pos, edit.deleted)?);
                }
                if !edit.inserted.is_empty() {
                    ops.push(self.replica.local_insert(edit.pos, &edit.inserted)?);
                }
                if ops.is_empty() {
                    return Err(CollabError::InvalidOperation("empty edit".into()));
                }
                let _ = self.sv_tx.send(self.replica.state_vector());
                self.transport()?.queue_operations(ops)
            }
            SessionCommand::Cursor(cursor) => {
                if let Some(update) = self.awareness.set_local_cursor(cursor) {
                    self.transport()?
                        .send_message(SyncMessage::Awareness { updates: vec![update] })?;
                }
                Ok(())
            }
            SessionCommand::Text(reply) => {
                let _ = reply.send(self.replica.text());
                Ok(())
            }
            SessionCommand::Save(reply) => {
                let _ = reply.send(self.store.save_snapshot(&self.doc, &self.replica.text()));
                Ok(())
            }
            SessionCommand::Roster(reply) => {
                let _ = reply.send(self.awareness.snapshot());
                Ok(())
            }
            SessionCommand::Close(_) => unreachable!("handled by the event loop"),
        }
    }

    fn handle_message(&mut self, msg: SyncMessage) -> Result<()> {
        match msg {
            SyncMessage::SyncStep1 { state_vector } => {
                let operations = self.replica.diff_since(&state_vector);
                debug!(doc = %self.doc, count = operations.len(), "answering sync request");
                let reply = SyncMessage::SyncStep2 {
                    operations,
                    state_vector: self.replica.state_vector(),
                };
                self.transport()?.send_message(reply)?;
                // Introduce ourselves to the newcomer as well.
                if let Some(beat) = self.awareness.local_heartbeat() {
                    self.transport()?
                        .send_message(SyncMessage::Awareness { updates: vec![beat] })?;
                }
                Ok(())
            }
            SyncMessage::SyncStep2 {
                operations,
                state_vector,
            } => {
                let deltas = self.replica.apply_remote_batch(operations)?;
                self.apply_deltas(&deltas);
                let _ = self.sv_tx.send(self.replica.state_vector());
                // Hand back whatever the responder is missing from us.
                let missing = self.replica.diff_since(&state_vector);
                if !missing.is_empty() {
                    self.transport()?
                        .send_message(SyncMessage::Update { operations: missing })?;
                }
                Ok(())
            }
            SyncMessage::Update { operations } => {
                let deltas = self.replica.apply_remote_batch(operations)?;
                self.apply_deltas(&deltas);
                let _ = self.sv_tx.send(self.replica.state_vector());
                Ok(())
            }
            SyncMessage::Awareness { updates } => {
                let mut changed = false;
                for update in updates {
                    changed |= self.awareness.apply_remote(update);
                }
                if changed {
                    let _ = self.peers_tx.send(self.awareness.peer_count());
                }
                Ok(())
            }
            SyncMessage::Error { message } => {
                warn!(doc = %self.doc, %message, "relay reported an error");
                Ok(())
            }
        }
    }

    fn housekeeping(&mut self) {
        if let Some(beat) = self.awareness.local_heartbeat() {
            if let Some(t) = &self.transport {
                let _ = t.send_message(SyncMessage::Awareness { updates: vec![beat] });
            }
        }
        let timeout = chrono::Duration::from_std(self.config.awareness_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(6));
        let removed = self.awareness.expire_stale(timeout);
        if !removed.is_empty() {
            for peer in &removed {
                debug!(doc = %self.doc, %peer, "peer presence expired");
            }
            let _ = self.peers_tx.send(self.awareness.peer_count());
        }
        if self.replica.has_stale_pending(self.config.pending_gap_bound) {
            let dropped = self.replica.clear_pending();
            warn!(doc = %self.doc, dropped, "causal gap unresolved, requesting full resync");
            if let Some(t) = &self.transport {
                let _ = t.resync();
            }
        }
    }

    /// Returns false when the session must end (read access revoked).
    fn apply_decision(&mut self, decision: PermissionDecision) -> bool {
        if !decision.can_read {
            warn!(doc = %self.doc, "read access revoked, closing session");
            return false;
        }
        if decision.can_write != self.can_write {
            info!(doc = %self.doc, can_write = decision.can_write, "write capability changed");
            self.can_write = decision.can_write;
            self.buffer.set_read_only(!decision.can_write);
        }
        true
    }

    fn apply_deltas(&mut self, deltas: &[TextDelta]) {
        for delta in deltas {
            self.buffer.apply_delta(delta);
        }
    }

    fn transport(&self) -> Result<&SyncTransport> {
        self.transport.as_ref().ok_or(CollabError::Closed)
    }

    async fn teardown(mut self) {
        info!(doc = %self.doc, "room session closing");
        // Buffer first: it goes read-only and detaches, so no patch can
        // land after this point.
        self.buffer.set_read_only(true);
        drop(self.buffer);
        // Transport second: announce departure, then close the socket and
        // cancel its retry timers.
        if let Some(transport) = self.transport.take() {
            let bye = self.awareness.departure();
            let _ = transport.send_message(SyncMessage::Awareness { updates: vec![bye] });
            transport.close().await;
        }
        // Replica and awareness drop with the worker.
    }
}
