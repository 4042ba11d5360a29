use serde::{Deserialize, Serialize};

use crate::{DocError, ItemId, TextDelta};

/// A run of characters inserted by one operation. `id` identifies the first
/// character; character `k` of the run has sequence number `id.seq + k`.
/// Runs split when a later edit lands inside them; the pieces keep their
/// character identities and relative order.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    id: ItemId,
    content: String,
    origin: Option<ItemId>,
    clock: u64,
    deleted: bool,
}

impl Entry {
    fn char_len(&self) -> usize {
        self.content.chars().count()
    }

    /// Character offset of `id` inside this run, if it falls here.
    fn offset_of(&self, id: &ItemId) -> Option<usize> {
        if id.peer != self.id.peer {
            return None;
        }
        let len = self.char_len() as u64;
        if id.seq >= self.id.seq && id.seq < self.id.seq + len {
            Some((id.seq - self.id.seq) as usize)
        } else {
            None
        }
    }

    /// Splits off and returns the tail starting at `offset` (0 < offset < len).
    /// The tail's origin is the character just before it, so the pieces
    /// remain a valid chain.
    fn split_at(&mut self, offset: usize) -> Entry {
        let byte = self
            .content
            .char_indices()
            .nth(offset)
            .map(|(b, _)| b)
            .unwrap_or(self.content.len());
        let tail_content = self.content.split_off(byte);
        let tail_seq = self.id.seq + offset as u64;
        Entry {
            id: ItemId::new(self.id.peer, tail_seq),
            content: tail_content,
            origin: Some(ItemId::new(self.id.peer, tail_seq - 1)),
            clock: self.clock,
            deleted: self.deleted,
        }
    }
}

/// Conflict-free shared text. Inserts are anchored to the item they follow
/// and ordered deterministically among concurrent edits; deletes tombstone
/// items so their positions stay resolvable. Integration is commutative and
/// associative, so any two replicas that have seen the same operations hold
/// the same text.
///
/// The document does not deduplicate: callers apply each operation exactly
/// once (the replica's state vector enforces this).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextDoc {
    entries: Vec<Entry>,
}

impl TextDoc {
    pub fn new() -> Self {
        Self::default()
    }

    /// The visible text (tombstones excluded).
    pub fn text(&self) -> String {
        self.entries
            .iter()
            .filter(|e| !e.deleted)
            .map(|e| e.content.as_str())
            .collect()
    }

    /// Visible length in characters.
    pub fn visible_len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !e.deleted)
            .map(Entry::char_len)
            .sum()
    }

    /// Total characters including tombstones.
    pub fn total_len(&self) -> usize {
        self.entries.iter().map(Entry::char_len).sum()
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.locate(id).is_some()
    }

    fn locate(&self, id: &ItemId) -> Option<(usize, usize)> {
        self.entries
            .iter()
            .enumerate()
            .find_map(|(i, e)| e.offset_of(id).map(|off| (i, off)))
    }

    fn visible_before(&self, entry_idx: usize) -> usize {
        self.entries[..entry_idx]
            .iter()
            .filter(|e| !e.deleted)
            .map(Entry::char_len)
            .sum()
    }

    /// Resolves a visible position to the insert anchor: the id of the
    /// visible character just before `pos`, or None at the document start.
    pub fn origin_at(&self, pos: usize) -> Result<Option<ItemId>, DocError> {
        if pos == 0 {
            return Ok(None);
        }
        let target = pos - 1;
        let mut vis = 0usize;
        for e in &self.entries {
            if e.deleted {
                continue;
            }
            let len = e.char_len();
            if target < vis + len {
                let off = (target - vis) as u64;
                return Ok(Some(ItemId::new(e.id.peer, e.id.seq + off)));
            }
            vis += len;
        }
        Err(DocError::PositionOutOfBounds {
            pos,
            len: self.visible_len(),
        })
    }

    /// Resolves a visible range to contiguous id ranges `(start, len)`,
    /// in document order, for building a delete operation.
    pub fn visible_range(&self, pos: usize, len: usize) -> Result<Vec<(ItemId, u64)>, DocError> {
        let end = pos + len;
        let mut out: Vec<(ItemId, u64)> = Vec::new();
        let mut vis = 0usize;
        for e in &self.entries {
            if e.deleted {
                continue;
            }
            let e_len = e.char_len();
            let lo = pos.max(vis);
            let hi = end.min(vis + e_len);
            if lo < hi {
                let start = ItemId::new(e.id.peer, e.id.seq + (lo - vis) as u64);
                let seg = (hi - lo) as u64;
                match out.last_mut() {
                    Some((prev, prev_len))
                        if prev.peer == start.peer && prev.seq + *prev_len == start.seq =>
                    {
                        *prev_len += seg;
                    }
                    _ => out.push((start, seg)),
                }
            }
            vis += e_len;
        }
        if end > vis {
            return Err(DocError::PositionOutOfBounds {
                pos: end,
                len: vis,
            });
        }
        Ok(out)
    }

    /// Integrates one insert. The new run lands after its origin, before any
    /// earlier-clocked material at the same anchor; among concurrent inserts
    /// the higher clock sits closer to the origin, ties broken by the lower
    /// peer id taking the earlier position. Scanning forward from the anchor
    /// and stopping at the first lower-clocked entry is sufficient because
    /// every entry inside a skipped subtree carries a higher clock than its
    /// root.
    pub fn integrate_insert(
        &mut self,
        id: ItemId,
        clock: u64,
        origin: Option<ItemId>,
        text: &str,
    ) -> Result<TextDelta, DocError> {
        if text.is_empty() {
            return Err(DocError::EmptyInsert);
        }
        let scan_from = match origin {
            None => 0,
            Some(o) => {
                let (idx, off) = self.locate(&o).ok_or(DocError::UnknownOrigin(o))?;
                if off + 1 < self.entries[idx].char_len() {
                    let tail = self.entries[idx].split_at(off + 1);
                    self.entries.insert(idx + 1, tail);
                }
                idx + 1
            }
        };
        let mut at = scan_from;
        while at < self.entries.len() {
            let e = &self.entries[at];
            if e.clock < clock {
                break;
            }
            if e.clock == clock && id.peer < e.id.peer {
                break;
            }
            at += 1;
        }
        let pos = self.visible_before(at);
        self.entries.insert(
            at,
            Entry {
                id,
                content: text.to_string(),
                origin,
                clock,
                deleted: false,
            },
        );
        Ok(TextDelta::insertion(pos, text))
    }

    /// Tombstones the id range `[start.seq, start.seq + len)` from
    /// `start.peer`. Already-deleted characters produce no delta, so
    /// overlapping concurrent deletes converge. Errors if any character in
    /// the range is not present yet.
    pub fn integrate_delete(
        &mut self,
        start: ItemId,
        len: u64,
    ) -> Result<Vec<TextDelta>, DocError> {
        let target_lo = start.seq;
        let target_hi = start.seq + len;
        let mut deltas = Vec::new();
        let mut vis = 0usize;
        let mut found = 0u64;
        let mut i = 0;
        while i < self.entries.len() {
            let e = &self.entries[i];
            let e_len = e.char_len() as u64;
            let overlaps = e.id.peer == start.peer
                && e.id.seq < target_hi
                && e.id.seq + e_len > target_lo;
            if !overlaps {
                if !e.deleted {
                    vis += e_len as usize;
                }
                i += 1;
                continue;
            }
            let lo = (target_lo.max(e.id.seq) - e.id.seq) as usize;
            let hi = (target_hi.min(e.id.seq + e_len) - e.id.seq) as usize;
            found += (hi - lo) as u64;
            if e.deleted {
                i += 1;
                continue;
            }
            if lo > 0 {
                let tail = self.entries[i].split_at(lo);
                self.entries.insert(i + 1, tail);
                vis += lo;
                i += 1;
            }
            let seg = hi - lo;
            if seg < self.entries[i].char_len() {
                let tail = self.entries[i].split_at(seg);
                self.entries.insert(i + 1, tail);
            }
            self.entries[i].deleted = true;
            deltas.push(TextDelta::deletion(vis, seg));
            i += 1;
        }
        if found < len {
            return Err(DocError::UnknownItem(start));
        }
        Ok(deltas)
    }
}
