use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod doc;
pub use doc::*;

#[derive(Debug, Error)]
pub enum DocError {
    #[error("position {pos} out of bounds (visible length {len})")]
    PositionOutOfBounds { pos: usize, len: usize },
    #[error("origin item not present: {0}")]
    UnknownOrigin(ItemId),
    #[error("item not present: {0}")]
    UnknownItem(ItemId),
    #[error("empty insert")]
    EmptyInsert,
}

/// Identity of one replica instance. Fresh per join, never persisted.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PeerId(pub Uuid);

impl PeerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a single inserted character: the inserting peer plus that
/// peer's sequence number for the character. Sequence numbers are consumed
/// one per character, so a multi-character insert spans a contiguous range.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ItemId {
    pub peer: PeerId,
    pub seq: u64,
}

impl ItemId {
    pub fn new(peer: PeerId, seq: u64) -> Self {
        Self { peer, seq }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.peer, self.seq)
    }
}

/// A patch against the visible text, in character positions. Applying the
/// deltas from one integration in order, each against the text as left by
/// the previous one, reproduces the document's new visible state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextDelta {
    pub pos: usize,
    pub delete_len: usize,
    pub insert: String,
}

impl TextDelta {
    pub fn insertion(pos: usize, text: impl Into<String>) -> Self {
        Self {
            pos,
            delete_len: 0,
            insert: text.into(),
        }
    }

    pub fn deletion(pos: usize, len: usize) -> Self {
        Self {
            pos,
            delete_len: len,
            insert: String::new(),
        }
    }

    /// Applies this delta to a plain string buffer (char positions).
    pub fn apply_to(&self, text: &mut String) {
        let chars: Vec<char> = text.chars().collect();
        let mut out = String::with_capacity(text.len() + self.insert.len());
        out.extend(chars[..self.pos].iter());
        out.push_str(&self.insert);
        out.extend(chars[self.pos + self.delete_len..].iter());
        *text = out;
    }
}
