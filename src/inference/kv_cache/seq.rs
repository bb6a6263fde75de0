//! Per-sequence edits: remove, copy, keep, shift and divide positions.
//!
//! Position ranges are half-open. An unbounded start means 0 and an
//! unbounded end means "to the end of the sequence".

use super::cache::KvCache;
use crate::error::{Error, Result};
use crate::format::GgmlType;
use crate::inference::types::{Pos, SeqId};
use std::ops::{Bound, RangeBounds};

pub(crate) fn pos_bounds(range: impl RangeBounds<Pos>) -> (Pos, Pos) {
    let p0 = match range.start_bound() {
        Bound::Included(&p) => p.max(0),
        Bound::Excluded(&p) => p.saturating_add(1).max(0),
        Bound::Unbounded => 0,
    };
    let p1 = match range.end_bound() {
        Bound::Included(&p) => p.saturating_add(1),
        Bound::Excluded(&p) => p,
        Bound::Unbounded => Pos::MAX,
    };
    (p0, p1)
}

impl KvCache {
    /// Remove positions in `range` from `seq_id`, or from every sequence
    /// when `seq_id` is `None`.
    ///
    /// Recurrent states cannot lose a slice from their middle: returns false
    /// (and changes nothing) when the range would cut into a stored state.
    pub fn seq_rm(&mut self, seq_id: Option<SeqId>, range: impl RangeBounds<Pos>) -> bool {
        let (p0, p1) = pos_bounds(range);
        let size = self.size();

        if self.recurrent {
            match seq_id {
                Some(s) if s < 0 || s as usize >= size => return false,
                Some(s) => {
                    if let Some(t) = self.tails[s as usize] {
                        let pos = self.cells[t].pos;
                        // partial intersection is invalid
                        if (0 < p0 && p0 <= pos) || (0 < p1 && p1 <= pos) {
                            return false;
                        }
                    }
                }
                None => {
                    // the range must cover everything or nothing
                    if p0 != p1 && (p0 != 0 || p1 != Pos::MAX) {
                        return false;
                    }
                }
            }
        }

        let mut new_head = None;
        for i in 0..size {
            let pos = self.cells[i].pos;
            if pos < p0 || pos >= p1 {
                continue;
            }
            let freed = match seq_id {
                Some(s) => {
                    if !self.cells[i].has_seq_id(s) {
                        continue;
                    }
                    self.detach(i, s)
                }
                None => {
                    if self.cells[i].is_empty() {
                        continue;
                    }
                    let ids: Vec<SeqId> = self.cells[i].seq_id.iter().copied().collect();
                    let mut freed = false;
                    for s in ids {
                        freed = self.detach(i, s);
                    }
                    freed
                }
            };
            if freed && new_head.is_none() {
                new_head = Some(i);
            }
        }

        // Restart the next search at the first hole
        if let Some(h) = new_head {
            if h < self.head {
                self.head = h;
            }
        }
        true
    }

    /// Make `dst` share the cells of `src` in `range`.
    ///
    /// Recurrent caches instead point `dst` at `src`'s state cell, dropping
    /// whatever `dst` owned before.
    pub fn seq_cp(&mut self, src: SeqId, dst: SeqId, range: impl RangeBounds<Pos>) {
        if src == dst {
            return;
        }
        let (p0, p1) = pos_bounds(range);

        if self.recurrent {
            let size = self.size() as SeqId;
            if !(0..size).contains(&src) || !(0..size).contains(&dst) {
                return;
            }
            if let Some(t) = self.tails[dst as usize] {
                self.detach(t, dst);
            }
            if let Some(t) = self.tails[src as usize] {
                self.cells[t].seq_id.insert(dst);
                self.tails[dst as usize] = Some(t);
            }
            return;
        }

        self.head = 0;
        for cell in &mut self.cells {
            if cell.has_seq_id(src) && cell.pos >= p0 && cell.pos < p1 {
                cell.seq_id.insert(dst);
            }
        }
    }

    /// Drop every sequence but `seq_id`
    pub fn seq_keep(&mut self, seq_id: SeqId) {
        let mut new_head = None;

        if self.recurrent {
            for (s, tail) in self.tails.iter_mut().enumerate() {
                if s as SeqId != seq_id {
                    *tail = None;
                }
            }
        }

        for i in 0..self.size() {
            let cell = &mut self.cells[i];
            if cell.has_seq_id(seq_id) {
                cell.seq_id.clear();
                cell.seq_id.insert(seq_id);
            } else {
                if !cell.is_empty() {
                    self.used -= 1;
                }
                let cell = &mut self.cells[i];
                cell.pos = -1;
                cell.src = None;
                cell.seq_id.clear();
                if new_head.is_none() {
                    new_head = Some(i);
                }
            }
        }

        if let Some(h) = new_head {
            if h < self.head {
                self.head = h;
            }
        }
    }

    /// Add `delta` to the positions of `seq_id` in `range`.
    ///
    /// Cells pushed below position 0 are freed. Attention caches record the
    /// shift so the keys get re-rotated before their next use. Fails on
    /// caches that cannot shift, leaving every position untouched.
    pub fn seq_add(
        &mut self,
        seq_id: SeqId,
        range: impl RangeBounds<Pos>,
        delta: Pos,
    ) -> Result<()> {
        self.check_shift("seq_add")?;
        let (p0, p1) = pos_bounds(range);
        if delta == 0 || p0 == p1 {
            return Ok(());
        }

        if self.recurrent {
            // only the stored position moves
            if let Some(t) = self.tail(seq_id) {
                let cell = &mut self.cells[t];
                if cell.has_seq_id(seq_id) && p0 <= cell.pos && cell.pos < p1 {
                    cell.pos += delta;
                }
            }
            return Ok(());
        }

        let mut new_head = None;
        let mut shifted = false;
        for i in 0..self.size() {
            let cell = &mut self.cells[i];
            if !(cell.has_seq_id(seq_id) && cell.pos >= p0 && cell.pos < p1) {
                continue;
            }
            shifted = true;
            cell.pos += delta;
            cell.delta += delta;
            if cell.pos < 0 {
                if !cell.is_empty() {
                    self.used -= 1;
                }
                let cell = &mut self.cells[i];
                cell.pos = -1;
                cell.seq_id.clear();
                if new_head.is_none() {
                    new_head = Some(i);
                }
            }
        }

        if shifted {
            self.maintenance = self.maintenance.with_shift();
        }
        // Start the next search at the first hole, or from the beginning
        self.head = new_head.unwrap_or(0);
        Ok(())
    }

    /// Integer-divide the positions of `seq_id` in `range` by `d`
    pub fn seq_div(&mut self, seq_id: SeqId, range: impl RangeBounds<Pos>, d: i32) -> Result<()> {
        self.check_shift("seq_div")?;
        let (p0, p1) = pos_bounds(range);
        if d == 1 || d == 0 || p0 == p1 {
            return Ok(());
        }

        if self.recurrent {
            if let Some(t) = self.tail(seq_id) {
                let cell = &mut self.cells[t];
                if cell.has_seq_id(seq_id) && p0 <= cell.pos && cell.pos < p1 {
                    cell.pos /= d;
                }
            }
            return Ok(());
        }

        let mut shifted = false;
        for cell in &mut self.cells {
            if cell.has_seq_id(seq_id) && cell.pos >= p0 && cell.pos < p1 {
                shifted = true;
                let p_old = cell.pos;
                cell.pos /= d;
                cell.delta += cell.pos - p_old;
            }
        }
        if shifted {
            self.maintenance = self.maintenance.with_shift();
        }
        Ok(())
    }

    fn check_shift(&self, op: &'static str) -> Result<()> {
        if self.can_shift {
            return Ok(());
        }
        let ty = self.storage.layers().first().map_or(GgmlType::F32, |l| l.type_k);
        tracing::error!(op, %ty, "kv cache keys cannot be shifted");
        Err(Error::UnsupportedType { ty, op })
    }
}
