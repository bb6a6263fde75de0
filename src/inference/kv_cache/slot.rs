//! Slot allocation for one micro-batch.

use super::cache::{DiscontinuityPolicy, KvCache};
use super::cell::KvCell;
use crate::inference::batch::UBatch;
use crate::inference::types::Pos;
use std::collections::BTreeSet;

impl KvCache {
    /// Reserve cells for `ubatch`.
    ///
    /// On success `head` is the first cell of the reserved range (attention)
    /// or of the active window (recurrent) and must not move until the graph
    /// consuming it has been built. Returns false when the batch does not
    /// fit; the caller may retry with a smaller batch or after freeing cells.
    pub fn find_slot(&mut self, ubatch: &UBatch) -> bool {
        if self.recurrent {
            self.find_slot_recurrent(ubatch)
        } else {
            self.find_slot_contiguous(ubatch)
        }
    }

    fn find_slot_contiguous(&mut self, ubatch: &UBatch) -> bool {
        let size = self.size();
        let n_tokens = ubatch.n_tokens;

        if n_tokens > size {
            tracing::error!(n_tokens, size, "batch does not fit the kv cache");
            return false;
        }

        let mut n_tested = 0;
        loop {
            if self.head + n_tokens > size {
                n_tested += size - self.head;
                self.head = 0;
                continue;
            }

            let occupied = (0..n_tokens).find(|&i| self.cells[self.head + i].pos >= 0);
            match occupied {
                None => break,
                Some(i) => {
                    self.head += i + 1;
                    n_tested += i + 1;
                }
            }

            if n_tested >= size {
                tracing::debug!(n_tokens, used = self.used, "no contiguous kv slot");
                return false;
            }
        }

        for s in 0..ubatch.n_seqs {
            for i in 0..ubatch.n_seq_tokens {
                let k = s * ubatch.n_seq_tokens + i;
                let cell = &mut self.cells[self.head + k];
                cell.pos = ubatch.pos[k];
                cell.seq_id.extend(ubatch.seq_ids[s].iter().copied());
            }
        }

        self.used += n_tokens;
        true
    }

    fn find_slot_recurrent(&mut self, ubatch: &UBatch) -> bool {
        let size = self.size();
        let n_seqs = ubatch.n_seqs;
        let n_seq_tokens = ubatch.n_seq_tokens;

        if n_seqs == 0 {
            return true;
        }

        // Every sequence id doubles as an index into the tail table
        for ids in &ubatch.seq_ids[..n_seqs] {
            if let Some(&seq_id) = ids.iter().find(|&&s| s < 0 || s as usize >= size) {
                tracing::error!(
                    seq_id,
                    n_seq_max = size,
                    "seq_id does not fit the recurrent cache, use a bigger n_seq_max"
                );
                return false;
            }
        }

        if self.discontinuity == DiscontinuityPolicy::Reject {
            for s in 0..n_seqs {
                let seq_id = ubatch.primary_seq(s);
                let last_pos = ubatch.seq_pos(s, n_seq_tokens - 1);
                if let Some(t) = self.tails[seq_id as usize] {
                    let pos = self.cells[t].pos;
                    if pos >= 0 && last_pos != pos + n_seq_tokens as Pos {
                        tracing::error!(
                            seq_id,
                            stored = pos,
                            last_pos,
                            n_seq_tokens,
                            "non-consecutive position rejected"
                        );
                        return false;
                    }
                }
            }
        }

        // Secondary ids of a shared group stop owning their old cells
        for ids in &ubatch.seq_ids[..n_seqs] {
            for &seq_id in &ids[1..] {
                if let Some(t) = self.tails[seq_id as usize] {
                    self.detach(t, seq_id);
                }
            }
        }

        #[cfg(debug_assertions)]
        if let Err(e) = self.verify_tails() {
            tracing::error!(error = %e, "recurrent tail table out of sync");
        }

        // Give every sequence a cell it owns alone
        let mut claimed: Vec<usize> = Vec::new();
        let mut next_empty = self.next_empty_from(self.head, &claimed);
        let mut batch_tails = Vec::with_capacity(n_seqs);
        for s in 0..n_seqs {
            let seq_id = ubatch.primary_seq(s);
            let tail = self.tails[seq_id as usize];
            debug_assert!(tail.is_none_or(|t| self.cells[t].has_seq_id(seq_id)));

            let owned = tail.filter(|&t| self.cells[t].seq_id.len() == 1);
            let cell_id = match owned {
                Some(t) => t,
                None => {
                    let Some(empty) = next_empty else {
                        tracing::error!(seq_id, "no free cell left for recurrent state");
                        return false;
                    };
                    debug_assert!(self.cells[empty].is_empty());
                    if let Some(t) = tail {
                        // Carry the shared state over to the new private cell
                        let (pos, src) = (self.cells[t].pos, self.cells[t].src);
                        self.cells[t].seq_id.remove(&seq_id);
                        let cell = &mut self.cells[empty];
                        cell.pos = pos;
                        cell.src = src;
                        cell.seq_id.insert(seq_id);
                        self.used += 1;
                    }
                    self.tails[seq_id as usize] = Some(empty);
                    claimed.push(empty);
                    if s + 1 < n_seqs {
                        next_empty = self.next_empty_from(empty + 1, &claimed);
                    }
                    empty
                }
            };
            batch_tails.push(cell_id);
        }

        let min = batch_tails.iter().copied().min().unwrap_or(0);
        let max = batch_tails.iter().copied().max().unwrap_or(0);

        // Lay the batch's cells out as [min, min + n_seqs) in batch order
        let moves = gather_permutation(&batch_tails, min);
        self.apply_moves(&moves);

        for s in 0..n_seqs {
            let cell_id = min + s;
            let last_pos = ubatch.seq_pos(s, n_seq_tokens - 1);
            let cell = &mut self.cells[cell_id];
            if cell.pos >= 0 && last_pos != cell.pos + n_seq_tokens as Pos {
                tracing::warn!(
                    seq_id = ubatch.primary_seq(s),
                    stored = cell.pos,
                    last_pos,
                    n_seq_tokens,
                    "non-consecutive token position"
                );
            }
            let was_empty = cell.is_empty();
            cell.pos = last_pos;
            cell.seq_id.clear();
            cell.seq_id.extend(ubatch.seq_ids[s].iter().copied());
            if was_empty {
                self.used += 1;
            }
            for &seq_id in &ubatch.seq_ids[s] {
                self.tails[seq_id as usize] = Some(cell_id);
            }
        }

        debug_assert_eq!(self.used, self.count_used());

        self.head = min;
        self.n = max - min + 1;
        self.n >= n_seqs
    }

    fn next_empty_from(&self, start: usize, skip: &[usize]) -> Option<usize> {
        let size = self.size();
        (0..size)
            .map(|i| (start + i) % size)
            .find(|&i| self.cells[i].is_empty() && !skip.contains(&i))
    }

    /// Move cell metadata along `(from, to)` pairs, all at once.
    ///
    /// `moves` must be a permutation of the cells it mentions. Tails of the
    /// sequences living in moved cells are repointed.
    fn apply_moves(&mut self, moves: &[(usize, usize)]) {
        let taken: Vec<KvCell> = moves
            .iter()
            .map(|&(from, _)| std::mem::take(&mut self.cells[from]))
            .collect();
        for (&(_, to), cell) in moves.iter().zip(taken) {
            self.cells[to] = cell;
        }
        for &(_, to) in moves {
            for &seq_id in &self.cells[to].seq_id {
                self.tails[seq_id as usize] = Some(to);
            }
        }
    }
}

/// Moves that bring cell `tails[s]` to `min + s` for every `s`.
///
/// Cells already sitting in `[min, min + tails.len())` that are not part of
/// the batch take the places the batch cells left, lowest first. Returns
/// `(from, to)` pairs; cells that stay put are omitted.
pub fn gather_permutation(tails: &[usize], min: usize) -> Vec<(usize, usize)> {
    let n = tails.len();
    let sources: BTreeSet<usize> = tails.iter().copied().collect();
    debug_assert_eq!(sources.len(), n, "batch tails must be distinct");

    let mut moves: Vec<(usize, usize)> = tails
        .iter()
        .enumerate()
        .filter(|&(s, &t)| t != min + s)
        .map(|(s, &t)| (t, min + s))
        .collect();

    let displaced = (min..min + n).filter(|i| !sources.contains(i));
    let vacated = sources.iter().copied().filter(|&t| t >= min + n);
    moves.extend(displaced.zip(vacated));
    moves
}
