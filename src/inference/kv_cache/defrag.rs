//! Compaction of an attention cache.
//!
//! Planning only computes where each cell goes. The bytes move when the
//! graph from [`DefragPlan::graph`] runs on a backend; the cell metadata
//! follows with [`KvCache::apply_defrag`] once that run succeeded.

use super::cache::KvCache;
use super::cell::KvCell;
use super::storage::{CacheTensor, KvStorage};
use crate::error::{Error, Result};
use crate::inference::graph::{Graph, GraphKind, Node, TensorView};

/// Relocation plan produced by [`KvCache::plan_defrag`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefragPlan {
    /// `ids[old] = new`; `ids.len()` means the cell does not move
    ids: Vec<usize>,
    n_moves: usize,
}

/// A run of consecutive cells moving to consecutive destinations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefragRun {
    pub src: usize,
    pub dst: usize,
    pub len: usize,
}

impl DefragPlan {
    pub fn ids(&self) -> &[usize] {
        &self.ids
    }

    /// Contiguous blocks moved, the unit the move budget counts
    pub fn n_moves(&self) -> usize {
        self.n_moves
    }

    /// Coalesced moves in source order
    pub fn runs(&self) -> Vec<DefragRun> {
        let n_kv = self.ids.len();
        let mut runs = Vec::new();
        let mut i = 0;
        while i < n_kv {
            let id = self.ids[i];
            if id == i || id == n_kv {
                i += 1;
                continue;
            }
            let mut len = 1;
            while i + len < n_kv && self.ids[i + len] == id + len {
                len += 1;
            }
            runs.push(DefragRun { src: i, dst: id, len });
            i += len;
        }
        runs
    }

    /// Copy graph realizing the plan: one key copy and one value copy per
    /// run and layer. Transposed values are copied as `n_embd_v` strided
    /// rows of `len` elements.
    pub fn graph(&self, storage: &KvStorage) -> Graph {
        let mut graph = Graph::new(GraphKind::Defrag);
        let size = storage.size();
        let v_trans = storage.v_trans();

        for run in self.runs() {
            for (il, layer) in storage.layers().iter().enumerate() {
                let k_row = layer.k_row_size();
                let k_src = TensorView {
                    layer: il,
                    tensor: CacheTensor::Key,
                    offset: k_row * run.src,
                    row_bytes: k_row * run.len,
                    n_rows: 1,
                    stride: k_row * run.len,
                };
                graph.push(Node::Copy {
                    src: k_src,
                    dst: TensorView {
                        offset: k_row * run.dst,
                        ..k_src
                    },
                });

                let v_src = if v_trans {
                    let el = layer.v_elem_size();
                    TensorView {
                        layer: il,
                        tensor: CacheTensor::Value,
                        offset: el * run.src,
                        row_bytes: el * run.len,
                        n_rows: layer.n_embd_v,
                        stride: el * size,
                    }
                } else {
                    let v_row = layer.v_row_size();
                    TensorView {
                        layer: il,
                        tensor: CacheTensor::Value,
                        offset: v_row * run.src,
                        row_bytes: v_row * run.len,
                        n_rows: 1,
                        stride: v_row * run.len,
                    }
                };
                let dst_offset = if v_trans {
                    layer.v_elem_size() * run.dst
                } else {
                    layer.v_row_size() * run.dst
                };
                graph.push(Node::Copy {
                    src: v_src,
                    dst: TensorView {
                        offset: dst_offset,
                        ..v_src
                    },
                });
            }
        }
        graph
    }
}

impl KvCache {
    /// Plan moving the last occupied cells into the holes before `used`.
    ///
    /// Holes are filled front to back, each with cells taken from the back
    /// of the occupied span. Planning stops after `max_moves` contiguous
    /// blocks; the rest is left for a later pass. Returns `None` when there
    /// is nothing to move.
    pub fn plan_defrag(&self, max_moves: usize) -> Result<Option<DefragPlan>> {
        let n_kv = self.cell_max();
        let n_used = self.used;
        if n_used > n_kv {
            return Err(Error::CacheError {
                reason: format!("{n_used} used cells beyond a span of {n_kv}"),
            });
        }

        let mut ids = vec![n_kv; n_kv];
        let mut n_moves = 0;
        let mut i0 = 0;

        while i0 < n_used {
            if !self.cells[i0].is_empty() {
                ids[i0] = i0;
                i0 += 1;
                continue;
            }

            // size of the hole
            let mut nh = 1;
            while i0 + nh < n_used && self.cells[i0 + nh].is_empty() {
                nh += 1;
            }

            // find nh unplanned occupied cells from the end
            let mut nf = 0;
            let mut is = n_kv - 1;
            while is > i0 {
                if !self.cells[is].is_empty() && ids[is] == n_kv {
                    nf += 1;
                    if nf == nh {
                        break;
                    }
                }
                is -= 1;
            }
            if nf != nh {
                return Err(Error::CacheError {
                    reason: format!("defrag found {nf} cells for a hole of {nh}, used count is off"),
                });
            }

            nf = 0;
            let mut cont = false;
            let mut stop = false;
            for i1 in is..n_kv {
                if self.cells[i1].is_empty() || ids[i1] != n_kv {
                    if n_moves == max_moves {
                        stop = true;
                        break;
                    }
                    cont = false;
                    continue;
                }
                ids[i1] = i0 + nf;
                if !cont {
                    n_moves += 1;
                    cont = true;
                }
                nf += 1;
                if nf == nh {
                    break;
                }
            }

            if stop || n_moves == max_moves {
                break;
            }
            i0 += nh;
        }

        if n_moves == 0 {
            return Ok(None);
        }
        tracing::debug!(n_moves, n_kv, n_used, "defrag planned");
        Ok(Some(DefragPlan { ids, n_moves }))
    }

    /// Move cell metadata as `plan` says. Call after the plan's graph ran.
    pub fn apply_defrag(&mut self, plan: &DefragPlan) {
        let n_kv = plan.ids.len();
        let moves: Vec<(usize, usize)> = plan
            .ids
            .iter()
            .enumerate()
            .filter(|&(i, &id)| id != i && id != n_kv)
            .map(|(i, &id)| (i, id))
            .collect();
        if moves.is_empty() {
            return;
        }

        let taken: Vec<KvCell> = moves
            .iter()
            .map(|&(from, _)| std::mem::take(&mut self.cells[from]))
            .collect();
        for (&(_, to), cell) in moves.iter().zip(taken) {
            self.cells[to] = cell;
        }
        self.head = self.used;
        tracing::info!(moves = plan.n_moves, cells = moves.len(), "kv cache defragmented");
    }
}
