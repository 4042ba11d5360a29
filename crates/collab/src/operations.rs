use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::replica::StateVector;
use crate::{ItemId, PeerId};

/// One CRDT operation as it travels the wire and the log. `seq` is the first
/// sequence number the operation consumes from its peer's counter; an insert
/// of n characters consumes n, a delete consumes exactly one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub peer: PeerId,
    pub seq: u64,
    pub clock: u64,
    pub kind: OperationKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OperationKind {
    #[serde(rename = "insert")]
    Insert {
        /// Item the text follows; None anchors at the document start.
        origin: Option<ItemId>,
        text: String,
    },
    #[serde(rename = "delete")]
    Delete { targets: Vec<DeleteRange> },
}

/// A contiguous run of item ids to tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeleteRange {
    pub start: ItemId,
    pub len: u64,
}

impl Operation {
    pub fn insert(peer: PeerId, seq: u64, clock: u64, origin: Option<ItemId>, text: String) -> Self {
        Self {
            peer,
            seq,
            clock,
            kind: OperationKind::Insert { origin, text },
        }
    }

    pub fn delete(peer: PeerId, seq: u64, clock: u64, targets: Vec<DeleteRange>) -> Self {
        Self {
            peer,
            seq,
            clock,
            kind: OperationKind::Delete { targets },
        }
    }

    /// Sequence numbers consumed.
    pub fn span(&self) -> u64 {
        match &self.kind {
            OperationKind::Insert { text, .. } => text.chars().count() as u64,
            OperationKind::Delete { .. } => 1,
        }
    }

    pub fn last_seq(&self) -> u64 {
        self.seq + self.span().saturating_sub(1)
    }
}

/// Append-only history of integrated operations, in integration order.
/// Integration order respects causality on this replica, so replaying a
/// suffix of the log on another replica never applies an operation before
/// its dependencies from the same source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationLog {
    operations: Vec<Operation>,
    #[serde(skip)]
    index: HashMap<(PeerId, u64), usize>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, op: Operation) {
        let key = (op.peer, op.seq);
        if self.index.contains_key(&key) {
            return;
        }
        self.index.insert(key, self.operations.len());
        self.operations.push(op);
    }

    pub fn contains(&self, peer: PeerId, seq: u64) -> bool {
        self.index.contains_key(&(peer, seq))
    }

    /// Operations the holder of `remote` has not incorporated, in log order.
    pub fn since(&self, remote: &StateVector) -> Vec<Operation> {
        self.operations
            .iter()
            .filter(|op| op.last_seq() > remote.get(op.peer))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Restores the lookup index after deserialization.
    pub fn rebuild_index(&mut self) {
        self.index = self
            .operations
            .iter()
            .enumerate()
            .map(|(i, op)| ((op.peer, op.seq), i))
            .collect();
    }
}
