//! Cell-table side of saving and restoring cache state.

use super::cache::KvCache;
use crate::error::{Error, Result};
use crate::inference::batch::UBatch;
use crate::inference::types::{Pos, SeqId};
use std::ops::Range;

/// Saved metadata of one cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellMeta {
    pub pos: Pos,
    /// Empty when a single sequence is saved
    pub seq_ids: Vec<SeqId>,
}

impl KvCache {
    /// Cells holding `seq_id` (or any sequence for `None`), as the number of
    /// cells and the maximal runs of consecutive indices covering them
    pub fn cell_ranges(&self, seq_id: Option<SeqId>) -> (usize, Vec<Range<usize>>) {
        let mut count = 0;
        let mut ranges = Vec::new();
        let mut begin = None;
        for (i, cell) in self.cells.iter().enumerate() {
            let selected = match seq_id {
                Some(s) => cell.has_seq_id(s),
                None => !cell.is_empty(),
            };
            if selected {
                count += 1;
                begin.get_or_insert(i);
            } else if let Some(b) = begin.take() {
                ranges.push(b..i);
            }
        }
        if let Some(b) = begin {
            ranges.push(b..self.size());
        }
        (count, ranges)
    }

    /// Replace the cell table with `cells`, placed from cell 0.
    ///
    /// Sequence ids must lie in `[0, n_seq_max)`. On error the cache is
    /// left cleared.
    pub fn restore_cells(&mut self, cells: &[CellMeta], n_seq_max: usize) -> Result<()> {
        let size = self.size();
        if cells.len() > size {
            return Err(Error::StateError {
                reason: format!("not enough cells in kv cache ({} > {size})", cells.len()),
            });
        }
        self.clear();

        let result = self.fill_cells(cells, n_seq_max);
        if result.is_err() {
            self.clear();
            return result;
        }

        self.head = 0;
        self.used = cells.len();
        self.pin_states(cells.len());
        Ok(())
    }

    fn fill_cells(&mut self, cells: &[CellMeta], n_seq_max: usize) -> Result<()> {
        let limit = if self.recurrent {
            n_seq_max.min(self.size())
        } else {
            n_seq_max
        };
        for (i, meta) in cells.iter().enumerate() {
            if meta.seq_ids.is_empty() {
                return Err(Error::StateError {
                    reason: format!("cell {i} belongs to no sequence"),
                });
            }
            self.cells[i].pos = meta.pos;
            for &seq_id in &meta.seq_ids {
                if seq_id < 0 || seq_id as usize >= limit {
                    return Err(Error::StateError {
                        reason: format!("invalid seq_id, {seq_id} is out of range [0, {limit})"),
                    });
                }
                self.cells[i].seq_id.insert(seq_id);
                if self.recurrent {
                    let tail = &mut self.tails[seq_id as usize];
                    if let Some(prev) = *tail {
                        return Err(Error::StateError {
                            reason: format!(
                                "duplicate tail for seq_id {seq_id} in cell {prev} and {i}"
                            ),
                        });
                    }
                    *tail = Some(i);
                }
            }
        }
        Ok(())
    }

    /// Claim cells for a saved sequence under the id `dest`.
    ///
    /// Whatever `dest` held before is dropped. Returns the first claimed
    /// cell; the claimed cells are contiguous.
    pub fn restore_sequence(&mut self, dest: SeqId, pos: Vec<Pos>) -> Result<usize> {
        self.seq_rm(Some(dest), ..);
        if pos.is_empty() {
            return Ok(self.head);
        }

        let count = pos.len();
        let (first_pos, last_pos) = (pos[0], pos[count - 1]);
        let ubatch = UBatch::for_sequence(dest, pos);
        if !self.find_slot(&ubatch) {
            return Err(Error::StateError {
                reason: "failed to find available cells in kv cache".into(),
            });
        }

        let head = self.head;
        let (first, last) = if self.recurrent {
            // one state cell carries the last position
            (head, head)
        } else {
            (head, head + count - 1)
        };
        let expected_first = if self.recurrent { last_pos } else { first_pos };
        if last >= self.size()
            || self.cells[first].pos != expected_first
            || self.cells[last].pos != last_pos
            || !self.cells[first].has_seq_id(dest)
            || !self.cells[last].has_seq_id(dest)
        {
            self.seq_rm(Some(dest), ..);
            return Err(Error::StateError {
                reason: format!("restored cells for seq_id {dest} are not contiguous"),
            });
        }

        self.pin_states(if self.recurrent { 1 } else { count });
        Ok(head)
    }

    /// Restored recurrent states are their own source
    fn pin_states(&mut self, count: usize) {
        if !self.recurrent {
            return;
        }
        let head = self.head;
        for id in head..(head + count).min(self.size()) {
            self.cells[id].src = Some(id);
        }
    }
}
