use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::PeerId;

/// What one peer publishes about itself: identity for the roster plus an
/// optional cursor. Ephemeral; never part of document history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub name: String,
    pub color: String,
    pub cursor: Option<CursorState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    pub pos: usize,
    pub selection_end: Option<usize>,
}

/// One awareness broadcast. `state: None` announces departure. `clock` is a
/// per-peer counter so stale broadcasts lose against newer ones regardless
/// of arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub peer: PeerId,
    pub clock: u64,
    pub state: Option<AwarenessState>,
}

#[derive(Debug, Clone)]
struct PeerPresence {
    state: AwarenessState,
    clock: u64,
    last_seen: DateTime<Utc>,
}

/// Last-write-wins presence map for one room. Every peer applies the same
/// rules independently (including staleness expiry), so rosters agree
/// without coordination.
#[derive(Debug)]
pub struct AwarenessStore {
    local_peer: PeerId,
    local_clock: u64,
    peers: HashMap<PeerId, PeerPresence>,
}

impl AwarenessStore {
    pub fn new(local_peer: PeerId) -> Self {
        Self {
            local_peer,
            local_clock: 0,
            peers: HashMap::new(),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    /// Publishes a new local state, returning the update to broadcast.
    pub fn set_local(&mut self, state: AwarenessState) -> AwarenessUpdate {
        self.local_clock += 1;
        self.peers.insert(
            self.local_peer,
            PeerPresence {
                state: state.clone(),
                clock: self.local_clock,
                last_seen: Utc::now(),
            },
        );
        AwarenessUpdate {
            peer: self.local_peer,
            clock: self.local_clock,
            state: Some(state),
        }
    }

    /// Re-announces the current local state (heartbeat). None before the
    /// first `set_local`.
    pub fn local_heartbeat(&mut self) -> Option<AwarenessUpdate> {
        let state = self.peers.get(&self.local_peer)?.state.clone();
        Some(self.set_local(state))
    }

    /// Moves the local cursor, returning the update to broadcast. None
    /// before the first `set_local`.
    pub fn set_local_cursor(&mut self, cursor: Option<CursorState>) -> Option<AwarenessUpdate> {
        let mut state = self.peers.get(&self.local_peer)?.state.clone();
        state.cursor = cursor;
        Some(self.set_local(state))
    }

    /// The departure broadcast, sent during teardown.
    pub fn departure(&mut self) -> AwarenessUpdate {
        self.local_clock += 1;
        self.peers.remove(&self.local_peer);
        AwarenessUpdate {
            peer: self.local_peer,
            clock: self.local_clock,
            state: None,
        }
    }

    /// Applies a remote broadcast; last write (highest clock) wins per
    /// peer. Returns true if the roster visibly changed.
    pub fn apply_remote(&mut self, update: AwarenessUpdate) -> bool {
        if update.peer == self.local_peer {
            return false;
        }
        let known = self.peers.get(&update.peer).map(|p| p.clock).unwrap_or(0);
        if update.clock <= known {
            return false;
        }
        match update.state {
            Some(state) => {
                let changed = self
                    .peers
                    .get(&update.peer)
                    .map(|p| p.state != state)
                    .unwrap_or(true);
                self.peers.insert(
                    update.peer,
                    PeerPresence {
                        state,
                        clock: update.clock,
                        last_seen: Utc::now(),
                    },
                );
                changed
            }
            None => self.peers.remove(&update.peer).is_some(),
        }
    }

    /// Drops remote peers not heard from within `timeout`. The local entry
    /// never expires (we are our own heartbeat source).
    pub fn expire_stale(&mut self, timeout: Duration) -> Vec<PeerId> {
        let cutoff = Utc::now() - timeout;
        let local = self.local_peer;
        let stale: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(&p, pres)| p != local && pres.last_seen < cutoff)
            .map(|(&p, _)| p)
            .collect();
        for p in &stale {
            self.peers.remove(p);
        }
        stale
    }

    /// Live entries ordered by peer id, local included.
    pub fn snapshot(&self) -> Vec<(PeerId, AwarenessState)> {
        let mut out: Vec<_> = self
            .peers
            .iter()
            .map(|(&p, pres)| (p, pres.state.clone()))
            .collect();
        out.sort_by_key(|(p, _)| *p);
        out
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

/// Deterministic display color for a peer, from its id bytes. Values are
/// kept out of the darkest range so cursors stay visible on white.
pub fn color_for(peer: &PeerId) -> String {
    let bytes = peer.0.as_bytes();
    let r = 64 + (bytes[0] % 192);
    let g = 64 + (bytes[5] % 192);
    let b = 64 + (bytes[10] % 192);
    format!("#{:02X}{:02X}{:02X}", r, g, b)
}

/// Default roster name for a peer without a profile name.
pub fn default_name(peer: &PeerId) -> String {
    let simple = peer.0.simple().to_string();
    format!("User-{}", &simple[..6])
}
