//! Micro-batch: the unit of work for one slot allocation and one graph run.

use super::input::BatchInput;
use crate::inference::types::{Pos, SeqId};

/// One micro-batch carved out of an [`SBatch`](super::SBatch)
///
/// With `equal_seqs` the tokens are laid out sequence-major:
/// `n_seqs` sequences of `n_seq_tokens` tokens each, and `seq_ids[s]` is the
/// id set of sequence `s`. Without it (a simple split) every token is its own
/// virtual sequence, `n_seq_tokens == 1` and `seq_ids` is per token.
#[derive(Debug, Clone)]
pub struct UBatch {
    pub equal_seqs: bool,
    pub n_tokens: usize,
    pub n_seq_tokens: usize,
    pub n_seqs: usize,
    pub input: BatchInput,
    pub pos: Vec<Pos>,
    pub seq_ids: Vec<Vec<SeqId>>,
    pub output: Vec<bool>,
}

impl UBatch {
    /// Empty micro-batch shaped like `input`, with room for `capacity` tokens
    pub fn reserve(input: &BatchInput, capacity: usize, equal_seqs: bool) -> Self {
        Self {
            equal_seqs,
            n_tokens: 0,
            n_seq_tokens: 0,
            n_seqs: 0,
            input: input.empty_like(capacity),
            pos: Vec::with_capacity(capacity),
            seq_ids: Vec::with_capacity(capacity),
            output: Vec::with_capacity(capacity),
        }
    }

    /// A single sequence occupying `pos.len()` positions, no input rows.
    ///
    /// Used to claim cells when restoring a saved sequence.
    pub fn for_sequence(seq_id: SeqId, pos: Vec<Pos>) -> Self {
        let n = pos.len();
        Self {
            equal_seqs: true,
            n_tokens: n,
            n_seq_tokens: n,
            n_seqs: 1,
            input: BatchInput::Tokens(Vec::new()),
            pos,
            seq_ids: vec![vec![seq_id]],
            output: vec![false; n],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.n_tokens == 0
    }

    /// Primary sequence id of sequence `s`
    pub fn primary_seq(&self, s: usize) -> SeqId {
        self.seq_ids[s][0]
    }

    /// Position of token `i` of sequence `s`
    pub fn seq_pos(&self, s: usize, i: usize) -> Pos {
        self.pos[s * self.n_seq_tokens + i]
    }

    pub fn n_outputs(&self) -> usize {
        self.output.iter().filter(|&&o| o).count()
    }
}
