use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod awareness;
pub mod operations;
pub mod permission;
pub mod protocol;
pub mod replica;
pub mod session;
pub mod transport;

pub use doctext::{DocError, ItemId, PeerId, TextDelta};

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("document error: {0}")]
    Document(#[from] doctext::DocError),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("session closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, CollabError>;

/// Identity of the human user. Permissions key on this; CRDT items key on
/// the per-connection [`PeerId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Room identifier; one shared document per room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lamport logical clock: ticked for local operations, max-merged on every
/// received one, so causally later operations always carry a higher value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LamportClock(pub u64);

impl LamportClock {
    pub fn tick(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }

    pub fn update(&mut self, observed: u64) {
        self.0 = self.0.max(observed);
    }
}

/// Tunables for the sync machinery. Defaults match interactive editing.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Window for coalescing rapid local operations into one update frame.
    pub debounce: Duration,
    /// Period for re-announcing local presence.
    pub heartbeat_interval: Duration,
    /// A peer silent for this long is dropped from the awareness roster.
    pub awareness_timeout: Duration,
    /// Initial reconnect backoff.
    pub backoff_min: Duration,
    /// Backoff cap.
    pub backoff_max: Duration,
    /// A causal gap outstanding for this long triggers a full resync.
    pub pending_gap_bound: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(50),
            heartbeat_interval: Duration::from_secs(3),
            awareness_timeout: Duration::from_secs(6),
            backoff_min: Duration::from_millis(500),
            backoff_max: Duration::from_secs(8),
            pending_gap_bound: Duration::from_secs(5),
        }
    }
}

/// How the local user presents in the awareness roster. Unset fields fall
/// back to identity-derived defaults.
#[derive(Debug, Clone, Default)]
pub struct SessionProfile {
    pub display_name: Option<String>,
    pub color: Option<String>,
}
