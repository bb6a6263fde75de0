//! A single cache cell.

use crate::inference::types::{EMPTY_POS, Pos, SeqId};
use std::collections::BTreeSet;

/// One slot of the cache.
///
/// Holds one position of one or more sequences (attention caches) or the
/// whole rolling state of one or more sequences (recurrent caches). The cell
/// is free exactly when `seq_id` is empty; `pos` may be stale until the cell
/// is reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvCell {
    pub pos: Pos,
    /// Shift accumulated since the last K-shift pass
    pub delta: Pos,
    /// Recurrent only: cell whose state must be copied into this one
    pub src: Option<usize>,
    pub seq_id: BTreeSet<SeqId>,
}

impl Default for KvCell {
    fn default() -> Self {
        Self {
            pos: EMPTY_POS,
            delta: 0,
            src: None,
            seq_id: BTreeSet::new(),
        }
    }
}

impl KvCell {
    pub fn has_seq_id(&self, id: SeqId) -> bool {
        self.seq_id.contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.seq_id.is_empty()
    }

    pub fn is_same_seq(&self, other: &KvCell) -> bool {
        self.seq_id == other.seq_id
    }
}
