//! Debug snapshot of the cell table.

use super::cache::KvCache;
use crate::inference::types::{Pos, SeqId};

/// Occupancy summary for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvCacheView {
    pub n_cells: usize,
    /// Sequence ids kept per cell
    pub n_seq_max: usize,
    /// (cell, sequence) memberships
    pub token_count: usize,
    pub used_cells: usize,
    /// Longest run of empty cells
    pub max_contiguous: usize,
    /// Start of that run, `None` if the cache is full
    pub max_contiguous_idx: Option<usize>,
    /// Position of each cell including its pending shift
    pub cells: Vec<Pos>,
    /// `n_seq_max` ids per cell, padded with -1
    pub cells_sequences: Vec<SeqId>,
}

impl KvCacheView {
    pub fn new(n_seq_max: usize) -> Self {
        Self {
            n_cells: 0,
            n_seq_max: n_seq_max.max(1),
            token_count: 0,
            used_cells: 0,
            max_contiguous: 0,
            max_contiguous_idx: None,
            cells: Vec::new(),
            cells_sequences: Vec::new(),
        }
    }

    /// Refresh from `cache`
    pub fn update(&mut self, cache: &KvCache) {
        let n_cells = cache.size();
        self.n_cells = n_cells;
        self.cells.clear();
        self.cells_sequences.clear();
        self.token_count = 0;
        self.used_cells = 0;
        self.max_contiguous = 0;
        self.max_contiguous_idx = None;

        let mut run_start: Option<usize> = None;
        for (i, cell) in cache.cells().iter().enumerate() {
            let n_ids = cell.seq_id.len();
            self.token_count += n_ids;
            if n_ids > 0 {
                self.used_cells += 1;
                if let Some(start) = run_start.take() {
                    self.note_run(start, i);
                }
            } else if run_start.is_none() {
                run_start = Some(i);
            }

            self.cells.push(cell.pos + cell.delta);
            let ids = cell.seq_id.iter().copied().take(self.n_seq_max);
            let before = self.cells_sequences.len();
            self.cells_sequences.extend(ids);
            self.cells_sequences.resize(before + self.n_seq_max, -1);
        }
        if let Some(start) = run_start {
            self.note_run(start, n_cells);
        }

        if self.used_cells != cache.used() {
            tracing::warn!(
                counted = self.used_cells,
                recorded = cache.used(),
                "kv cache used count out of sync"
            );
        }
    }

    fn note_run(&mut self, start: usize, end: usize) {
        if end - start > self.max_contiguous {
            self.max_contiguous = end - start;
            self.max_contiguous_idx = Some(start);
        }
    }
}

impl KvCache {
    pub fn view(&self, n_seq_max: usize) -> KvCacheView {
        let mut view = KvCacheView::new(n_seq_max);
        view.update(self);
        view
    }
}
