use std::fmt;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::operations::Operation;
use crate::protocol::SyncMessage;
use crate::replica::StateVector;
use crate::{CollabError, PeerId, Result, SyncConfig};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Connection state as shown to the user. `Syncing` covers the window
/// between socket open and the first answering `sync_step2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Syncing,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Syncing => "syncing",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub enum TransportEvent {
    /// Socket (re)established; the state-vector handshake has been sent.
    Open,
    Message(SyncMessage),
    /// Terminal: the transport was closed and will not reconnect.
    Closed,
}

#[derive(Debug)]
enum Command {
    /// Sent on the next write, ahead of any queued operations.
    Send(SyncMessage),
    /// Debounced into a single `update` frame.
    Queue(Vec<Operation>),
    /// Restart the handshake on the live connection.
    Resync,
    Close,
}

enum ServeExit {
    Shutdown,
    ConnectionLost,
}

/// Builds the room endpoint for one peer.
pub fn room_url(base: &str, room: &str, peer: PeerId) -> String {
    format!("{}/{}?peer={}", base.trim_end_matches('/'), room, peer)
}

/// Handle to the background task that owns the room socket.
///
/// The task reconnects forever with jittered exponential backoff; every
/// (re)connect re-sends only the current state vector, so recovery costs one
/// round trip plus the missed operations. All of its timers live on the
/// task and die with it. Dropping the handle shuts the task down.
pub struct SyncTransport {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    task: JoinHandle<()>,
}

impl SyncTransport {
    /// Spawns the transport task. `state` is read at every (re)connect and
    /// resync to fill the `sync_step1` handshake.
    pub fn connect(
        url: String,
        config: &SyncConfig,
        state: watch::Receiver<StateVector>,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let worker = Worker {
            url,
            debounce: config.debounce,
            backoff_min: config.backoff_min,
            backoff_max: config.backoff_max,
            state,
            commands: cmd_rx,
            events: event_tx,
            status: status_tx,
        };
        let task = tokio::spawn(worker.run());
        (
            Self {
                commands: cmd_tx,
                status: status_rx,
                task,
            },
            event_rx,
        )
    }

    pub fn send_message(&self, msg: SyncMessage) -> Result<()> {
        self.commands
            .send(Command::Send(msg))
            .map_err(|_| CollabError::Closed)
    }

    /// Queues operations for the next debounced `update` frame.
    pub fn queue_operations(&self, ops: Vec<Operation>) -> Result<()> {
        self.commands
            .send(Command::Queue(ops))
            .map_err(|_| CollabError::Closed)
    }

    pub fn resync(&self) -> Result<()> {
        self.commands
            .send(Command::Resync)
            .map_err(|_| CollabError::Closed)
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Closes the socket and waits for the task to finish.
    pub async fn close(self) {
        let _ = self.commands.send(Command::Close);
        let _ = self.task.await;
    }
}

struct Worker {
    url: String,
    debounce: Duration,
    backoff_min: Duration,
    backoff_max: Duration,
    state: watch::Receiver<StateVector>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<TransportEvent>,
    status: watch::Sender<ConnectionStatus>,
}

impl Worker {
    async fn run(mut self) {
        let mut backoff = self.backoff_min;
        let mut first = true;
        loop {
            self.set_status(if first {
                ConnectionStatus::Connecting
            } else {
                ConnectionStatus::Reconnecting
            });
            match connect_async(self.url.as_str()).await {
                Ok((socket, _)) => {
                    first = false;
                    backoff = self.backoff_min;
                    info!(url = %self.url, "room socket connected");
                    match self.serve(socket).await {
                        ServeExit::Shutdown => {
                            self.set_status(ConnectionStatus::Disconnected);
                            let _ = self.events.send(TransportEvent::Closed);
                            return;
                        }
                        ServeExit::ConnectionLost => {
                            info!(url = %self.url, "room socket lost, will reconnect");
                        }
                    }
                }
                Err(e) => {
                    warn!(url = %self.url, error = %e, "connect failed");
                }
            }
            self.set_status(ConnectionStatus::Reconnecting);
            let jitter_cap = (backoff.as_millis() as u64 / 4).max(1);
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap));
            let deadline = tokio::time::Instant::now() + backoff + jitter;
            backoff = (backoff * 2).min(self.backoff_max);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    cmd = self.commands.recv() => match cmd {
                        None | Some(Command::Close) => {
                            self.set_status(ConnectionStatus::Disconnected);
                            let _ = self.events.send(TransportEvent::Closed);
                            return;
                        }
                        // Other commands while offline are dropped: the
                        // reconnect handshake repairs operation state, and
                        // the heartbeat re-announces awareness.
                        Some(_) => {}
                    },
                }
            }
        }
    }

    async fn serve(&mut self, socket: WebSocketStream<MaybeTlsStream<TcpStream>>) -> ServeExit {
        let (mut sink, mut stream) = socket.split();
        self.set_status(ConnectionStatus::Syncing);
        let step1 = SyncMessage::SyncStep1 {
            state_vector: self.state.borrow().clone(),
        };
        if send_frame(&mut sink, &step1).await.is_err() {
            return ServeExit::ConnectionLost;
        }
        let _ = self.events.send(TransportEvent::Open);

        let mut queue: Vec<Operation> = Vec::new();
        let mut flush_at: Option<Instant> = None;
        loop {
            let deadline = flush_at.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Close) => {
                        if !queue.is_empty() {
                            let update = SyncMessage::Update { operations: std::mem::take(&mut queue) };
                            let _ = send_frame(&mut sink, &update).await;
                        }
                        let _ = sink.send(Message::Close(None)).await;
                        return ServeExit::Shutdown;
                    }
                    Some(Command::Send(msg)) => {
                        if send_frame(&mut sink, &msg).await.is_err() {
                            return ServeExit::ConnectionLost;
                        }
                    }
                    Some(Command::Queue(ops)) => {
                        queue.extend(ops);
                        if flush_at.is_none() {
                            flush_at = Some(Instant::now() + self.debounce);
                        }
                    }
                    Some(Command::Resync) => {
                        self.set_status(ConnectionStatus::Syncing);
                        let step1 = SyncMessage::SyncStep1 {
                            state_vector: self.state.borrow().clone(),
                        };
                        if send_frame(&mut sink, &step1).await.is_err() {
                            return ServeExit::ConnectionLost;
                        }
                    }
                },
                _ = tokio::time::sleep_until(deadline), if flush_at.is_some() => {
                    flush_at = None;
                    let ops = std::mem::take(&mut queue);
                    if !ops.is_empty() {
                        debug!(count = ops.len(), "flushing update");
                        let update = SyncMessage::Update { operations: ops };
                        if send_frame(&mut sink, &update).await.is_err() {
                            return ServeExit::ConnectionLost;
                        }
                    }
                },
                frame = stream.next() => match self.handle_frame(&mut sink, frame).await {
                    FrameOutcome::Continue => {}
                    FrameOutcome::Lost => return ServeExit::ConnectionLost,
                },
            }
        }
    }

    async fn handle_frame(
        &mut self,
        sink: &mut WsSink,
        frame: Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>,
    ) -> FrameOutcome {
        match frame {
            Some(Ok(Message::Text(text))) => match SyncMessage::decode(&text) {
                Ok(msg) => {
                    if matches!(msg, SyncMessage::SyncStep2 { .. }) {
                        self.set_status(ConnectionStatus::Connected);
                    }
                    let _ = self.events.send(TransportEvent::Message(msg));
                    FrameOutcome::Continue
                }
                Err(e) => {
                    warn!(error = %e, "resetting connection");
                    let _ = sink.send(Message::Close(None)).await;
                    FrameOutcome::Lost
                }
            },
            Some(Ok(Message::Ping(payload))) => {
                let _ = sink.send(Message::Pong(payload)).await;
                FrameOutcome::Continue
            }
            Some(Ok(Message::Pong(_)))
            | Some(Ok(Message::Binary(_)))
            | Some(Ok(Message::Frame(_))) => FrameOutcome::Continue,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => FrameOutcome::Lost,
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        let _ = self.status.send(status);
    }
}

enum FrameOutcome {
    Continue,
    Lost,
}

async fn send_frame(sink: &mut WsSink, msg: &SyncMessage) -> Result<()> {
    let text = msg.encode()?;
    sink.send(Message::Text(text))
        .await
        .map_err(|e| CollabError::Transport(e.to_string()))
}
