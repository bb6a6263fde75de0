//! Sequence-aware batch splitter.
//!
//! An [`SBatch`] indexes into a [`ResolvedBatch`] without copying it, sorts
//! the tokens so that tokens of the same sequence set are adjacent, groups
//! them, and hands out [`UBatch`]es through one of three strategies:
//!
//! - [`SBatch::split_simple`]: contiguous stretches of the unsorted batch
//! - [`SBatch::split_equal`]: several same-length sequences per micro-batch,
//!   with shared (multi-sequence) groups always alone
//! - [`SBatch::split_seq`]: one sequence per micro-batch
//!
//! Output tokens are recorded in `out_ids` (original batch indices, in the
//! order their rows are produced) so the caller can restore batch order.

use super::input::ResolvedBatch;
use super::ubatch::UBatch;
use crate::inference::types::SeqId;
use std::cmp::Ordering;

/// A run of sorted tokens sharing one sequence id set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SBatchSeq {
    /// Sequence ids of the run, empty for the single group of a simple split
    pub seq_ids: Vec<SeqId>,
    /// Offset into the sorted id list
    pub offset: usize,
    /// Tokens left in the run
    pub length: usize,
}

impl SBatchSeq {
    pub fn n_seq_id(&self) -> usize {
        self.seq_ids.len()
    }
}

/// Sorted and grouped view of one batch
pub struct SBatch<'a> {
    batch: &'a ResolvedBatch,
    n_embd: usize,
    logits_all: bool,
    /// Tokens not yet handed out
    n_tokens: usize,
    ids: Vec<usize>,
    out_ids: Vec<usize>,
    seq: Vec<SBatchSeq>,
}

impl<'a> SBatch<'a> {
    /// Build the sort order and groups for `batch`.
    ///
    /// With `simple_split` nothing is sorted and one group spans the whole
    /// batch. With `logits_all` every token is an output regardless of the
    /// batch's flags.
    pub fn from_batch(
        batch: &'a ResolvedBatch,
        n_embd: usize,
        simple_split: bool,
        logits_all: bool,
    ) -> Self {
        if let Some(data) = batch.input.embeddings() {
            debug_assert_eq!(data.len(), batch.n_tokens() * n_embd);
        }

        let n_tokens = batch.n_tokens();
        let mut ids: Vec<usize> = (0..n_tokens).collect();

        if simple_split {
            return Self {
                batch,
                n_embd,
                logits_all,
                n_tokens,
                ids,
                out_ids: Vec::new(),
                seq: vec![SBatchSeq {
                    seq_ids: Vec::new(),
                    offset: 0,
                    length: n_tokens,
                }],
            };
        }

        // Shared tokens first, then by sequence ids, then by position
        ids.sort_unstable_by(|&a, &b| {
            let sa = &batch.seq_ids[a];
            let sb = &batch.seq_ids[b];
            sb.len()
                .cmp(&sa.len())
                .then_with(|| sa.cmp(sb))
                .then_with(|| batch.pos[a].cmp(&batch.pos[b]))
                .then_with(|| a.cmp(&b))
        });

        let mut seq: Vec<SBatchSeq> = Vec::new();
        for (i, &bi) in ids.iter().enumerate() {
            let seq_ids = &batch.seq_ids[bi];
            if let Some(last) = seq.last_mut() {
                if &last.seq_ids == seq_ids {
                    last.length += 1;
                    continue;
                }
            }
            seq.push(SBatchSeq {
                seq_ids: seq_ids.clone(),
                offset: i,
                length: 1,
            });
        }

        // Drained from the back: shared groups first, then shortest first
        seq.sort_by(|a, b| match a.n_seq_id().cmp(&b.n_seq_id()) {
            Ordering::Equal => b.length.cmp(&a.length),
            other => other,
        });

        Self {
            batch,
            n_embd,
            logits_all,
            n_tokens,
            ids,
            out_ids: Vec::new(),
            seq,
        }
    }

    /// Tokens not yet handed out
    pub fn n_tokens(&self) -> usize {
        self.n_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.n_tokens == 0
    }

    pub fn n_embd(&self) -> usize {
        self.n_embd
    }

    pub fn ids(&self) -> &[usize] {
        &self.ids
    }

    pub fn seqs(&self) -> &[SBatchSeq] {
        &self.seq
    }

    /// Batch indices of the outputs produced so far, in row order
    pub fn out_ids(&self) -> &[usize] {
        &self.out_ids
    }

    pub fn take_out_ids(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.out_ids)
    }

    fn reserve_ubatch(&self, n_ubatch: usize, equal_seqs: bool) -> UBatch {
        UBatch::reserve(&self.batch.input, n_ubatch, equal_seqs)
    }

    fn add_seq_to_ubatch(&mut self, ubatch: &mut UBatch, seq_idx: usize, length: usize) {
        let batch = self.batch;
        let seq = &self.seq[seq_idx];
        assert!(length <= seq.length);
        // Only sequences of equal length can share a micro-batch, otherwise
        // it is not clear which sequence a token belongs to
        assert!(
            seq.n_seq_id() == 0 || ubatch.n_seqs == 0 || length == ubatch.n_tokens / ubatch.n_seqs,
            "sequence length {length} does not match micro-batch stride"
        );
        assert_eq!(
            seq.n_seq_id() != 0,
            ubatch.equal_seqs,
            "simple and grouped splits cannot be mixed"
        );

        let offset = seq.offset;
        for i in 0..length {
            let id = self.ids[offset + i];
            ubatch.input.push_row_from(&batch.input, id);
            ubatch.pos.push(batch.pos[id]);
        }

        if ubatch.equal_seqs {
            ubatch.seq_ids.push(seq.seq_ids.clone());
        } else {
            for i in 0..length {
                ubatch.seq_ids.push(batch.seq_ids[self.ids[offset + i]].clone());
            }
        }

        for i in 0..length {
            let id = self.ids[offset + i];
            let is_output = self.logits_all || batch.output[id];
            ubatch.output.push(is_output);
            if is_output {
                self.out_ids.push(id);
            }
        }

        if ubatch.n_tokens == 0 && ubatch.n_seqs == 0 {
            ubatch.n_seq_tokens = if ubatch.equal_seqs { length } else { 1 };
        }
        ubatch.n_tokens += length;
        // Virtual sequences for simple splits
        ubatch.n_seqs += if ubatch.equal_seqs { 1 } else { length };

        let seq = &mut self.seq[seq_idx];
        seq.offset += length;
        seq.length -= length;
        self.n_tokens -= length;

        assert_eq!(ubatch.n_tokens, ubatch.n_seq_tokens * ubatch.n_seqs);
    }

    /// Take up to `n_ubatch` tokens in batch order
    pub fn split_simple(&mut self, n_ubatch: usize) -> UBatch {
        let n_ubatch = n_ubatch.min(self.n_tokens);
        let mut ubatch = self.reserve_ubatch(n_ubatch, false);
        if let Some(s) = self.seq.first() {
            assert!(
                self.seq.len() == 1 && s.n_seq_id() == 0,
                "split_simple requires a batch built with simple_split"
            );
            let length = s.length.min(n_ubatch);
            self.add_seq_to_ubatch(&mut ubatch, 0, length);
        }
        ubatch
    }

    /// Pack same-length sequences, up to `n_ubatch` tokens.
    ///
    /// The first group taken fixes the per-sequence length. A group owned by
    /// several sequences always gets a micro-batch of its own.
    pub fn split_equal(&mut self, n_ubatch: usize) -> UBatch {
        let n_ubatch = n_ubatch.min(self.n_tokens);
        let mut ubatch = self.reserve_ubatch(n_ubatch, true);
        if !self.seq.is_empty() {
            assert!(
                self.seq[0].n_seq_id() > 0,
                "split_equal requires a grouped batch"
            );
            let mut length = 0;
            let mut n_tokens_in_ubatch = 0;
            for i in (0..self.seq.len()).rev() {
                let s = &self.seq[i];
                assert!(s.length > 0);
                if length == 0 {
                    length = s.length.min(n_ubatch);
                }
                let shared = s.n_seq_id() > 1;
                self.add_seq_to_ubatch(&mut ubatch, i, length);
                n_tokens_in_ubatch += length;
                if shared {
                    break;
                }
                if length + n_tokens_in_ubatch > n_ubatch {
                    break;
                }
            }
            self.pop_drained();
        }
        ubatch
    }

    /// Take up to `n_ubatch` tokens of exactly one sequence
    pub fn split_seq(&mut self, n_ubatch: usize) -> UBatch {
        let n_ubatch = n_ubatch.min(self.n_tokens);
        let mut ubatch = self.reserve_ubatch(n_ubatch, true);
        if let Some(last) = self.seq.len().checked_sub(1) {
            let s = &self.seq[last];
            assert!(s.n_seq_id() > 0, "split_seq requires a grouped batch");
            let length = s.length.min(n_ubatch);
            self.add_seq_to_ubatch(&mut ubatch, last, length);
            self.pop_drained();
        }
        ubatch
    }

    fn pop_drained(&mut self) {
        while self.seq.last().is_some_and(|s| s.length == 0) {
            self.seq.pop();
        }
    }
}
