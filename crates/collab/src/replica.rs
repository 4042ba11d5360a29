use std::collections::HashMap;
use std::time::{Duration, Instant};

use doctext::TextDoc;
use serde::{Deserialize, Serialize};

use crate::operations::{Operation, OperationKind, OperationLog};
use crate::{CollabError, ItemId, LamportClock, PeerId, Result, TextDelta};

/// Per-peer high-water marks: the highest sequence number incorporated from
/// each peer. Incorporation is contiguous (gapped operations wait in the
/// pending buffer), so `seq <= get(peer)` is exactly "already applied".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(HashMap<PeerId, u64>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer: PeerId) -> u64 {
        self.0.get(&peer).copied().unwrap_or(0)
    }

    pub fn observe(&mut self, peer: PeerId, seq: u64) {
        let entry = self.0.entry(peer).or_insert(0);
        *entry = (*entry).max(seq);
    }

    pub fn merge(&mut self, other: &StateVector) {
        for (&peer, &seq) in &other.0 {
            self.observe(peer, seq);
        }
    }

    /// True if this vector has incorporated everything `other` has.
    pub fn dominates(&self, other: &StateVector) -> bool {
        other.0.iter().all(|(&peer, &seq)| self.get(peer) >= seq)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerId, u64)> + '_ {
        self.0.iter().map(|(&p, &s)| (p, s))
    }
}

enum Integration {
    Applied(Vec<TextDelta>),
    Duplicate,
    Deferred,
}

struct PendingOp {
    op: Operation,
    queued_at: Instant,
}

/// One peer's view of the shared document: the CRDT text, the Lamport
/// clock, the integrated-operation log, the state vector, and a buffer for
/// operations that arrived before their dependencies.
///
/// Local operations apply immediately (the caller sees the edit before any
/// network round trip) and come back as [`Operation`]s for broadcast.
/// Remote operations are idempotent and order-tolerant: duplicates are
/// dropped, gapped ones wait, and integration is deterministic, so replicas
/// that have seen the same set of operations hold identical text.
#[derive(Debug)]
pub struct Replica {
    peer: PeerId,
    doc: TextDoc,
    clock: LamportClock,
    log: OperationLog,
    state: StateVector,
    next_seq: u64,
    pending: Vec<PendingOp>,
}

impl std::fmt::Debug for PendingOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingOp").field("op", &self.op).finish()
    }
}

impl Replica {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            doc: TextDoc::new(),
            clock: LamportClock::default(),
            log: OperationLog::new(),
            state: StateVector::new(),
            next_seq: 1,
            pending: Vec::new(),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn text(&self) -> String {
        self.doc.text()
    }

    pub fn visible_len(&self) -> usize {
        self.doc.visible_len()
    }

    pub fn state_vector(&self) -> StateVector {
        self.state.clone()
    }

    /// Operations the holder of `remote` is missing, replayable in order.
    pub fn diff_since(&self, remote: &StateVector) -> Vec<Operation> {
        self.log.since(remote)
    }

    pub fn local_insert(&mut self, pos: usize, text: &str) -> Result<Operation> {
        if text.is_empty() {
            return Err(CollabError::InvalidOperation("empty insert".into()));
        }
        let origin = self.doc.origin_at(pos)?;
        let clock = self.clock.tick();
        let id = ItemId::new(self.peer, self.next_seq);
        self.doc.integrate_insert(id, clock, origin, text)?;
        let op = Operation::insert(self.peer, id.seq, clock, origin, text.to_string());
        self.next_seq += op.span();
        self.state.observe(self.peer, op.last_seq());
        self.log.append(op.clone());
        Ok(op)
    }

    pub fn local_delete(&mut self, pos: usize, len: usize) -> Result<Operation> {
        let ranges = self.doc.visible_range(pos, len)?;
        if ranges.is_empty() {
            return Err(CollabError::InvalidOperation("empty delete".into()));
        }
        let clock = self.clock.tick();
        let targets = ranges
            .into_iter()
            .map(|(start, len)| crate::operations::DeleteRange { start, len })
            .collect::<Vec<_>>();
        for t in &targets {
            self.doc.integrate_delete(t.start, t.len)?;
        }
        let op = Operation::delete(self.peer, self.next_seq, clock, targets);
        self.next_seq += 1;
        self.state.observe(self.peer, op.last_seq());
        self.log.append(op.clone());
        Ok(op)
    }

    /// Integrates a remote operation. Returns the visible-text deltas to
    /// apply to an attached buffer, in order; duplicates and deferred
    /// operations yield none. Applying one operation may release buffered
    /// successors, whose deltas are included.
    pub fn apply_remote(&mut self, op: Operation) -> Result<Vec<TextDelta>> {
        let mut deltas = match self.integrate(&op)? {
            Integration::Applied(d) => d,
            Integration::Duplicate => return Ok(Vec::new()),
            Integration::Deferred => {
                self.defer(op);
                return Ok(Vec::new());
            }
        };
        // Drain the pending buffer until a full pass releases nothing.
        loop {
            let mut progressed = false;
            let mut i = 0;
            while i < self.pending.len() {
                let queued = self.pending[i].op.clone();
                match self.integrate(&queued)? {
                    Integration::Applied(mut d) => {
                        deltas.append(&mut d);
                        self.pending.remove(i);
                        progressed = true;
                    }
                    Integration::Duplicate => {
                        self.pending.remove(i);
                        progressed = true;
                    }
                    Integration::Deferred => i += 1,
                }
            }
            if !progressed {
                break;
            }
        }
        Ok(deltas)
    }

    pub fn apply_remote_batch(
        &mut self,
        ops: impl IntoIterator<Item = Operation>,
    ) -> Result<Vec<TextDelta>> {
        let mut deltas = Vec::new();
        for op in ops {
            deltas.append(&mut self.apply_remote(op)?);
        }
        Ok(deltas)
    }

    fn integrate(&mut self, op: &Operation) -> Result<Integration> {
        if op.peer == self.peer {
            // Relay echo of our own operation.
            return Ok(Integration::Duplicate);
        }
        let known = self.state.get(op.peer);
        if op.seq <= known {
            return Ok(Integration::Duplicate);
        }
        if op.seq > known + 1 {
            return Ok(Integration::Deferred);
        }
        let deltas = match &op.kind {
            OperationKind::Insert { origin, text } => {
                if let Some(o) = origin {
                    if !self.knows(o) {
                        return Ok(Integration::Deferred);
                    }
                }
                let id = ItemId::new(op.peer, op.seq);
                vec![self.doc.integrate_insert(id, op.clock, *origin, text)?]
            }
            OperationKind::Delete { targets } => {
                for t in targets {
                    let last = ItemId::new(t.start.peer, t.start.seq + t.len - 1);
                    if !self.knows(&t.start) || !self.knows(&last) {
                        return Ok(Integration::Deferred);
                    }
                }
                let mut out = Vec::new();
                for t in targets {
                    out.append(&mut self.doc.integrate_delete(t.start, t.len)?);
                }
                out
            }
        };
        self.clock.update(op.clock);
        self.state.observe(op.peer, op.last_seq());
        self.log.append(op.clone());
        Ok(Integration::Applied(deltas))
    }

    fn knows(&self, id: &ItemId) -> bool {
        self.state.get(id.peer) >= id.seq
    }

    fn defer(&mut self, op: Operation) {
        if self
            .pending
            .iter()
            .any(|p| p.op.peer == op.peer && p.op.seq == op.seq)
        {
            return;
        }
        self.pending.push(PendingOp {
            op,
            queued_at: Instant::now(),
        });
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// True once any buffered operation has waited at least `bound`; the
    /// missing history is evidently not coming on its own and the session
    /// should request a full resync.
    pub fn has_stale_pending(&self, bound: Duration) -> bool {
        self.pending.iter().any(|p| p.queued_at.elapsed() >= bound)
    }

    pub fn clear_pending(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }
}
