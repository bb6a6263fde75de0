//! The cell table and its bookkeeping.

use super::cell::KvCell;
use super::maintenance::Maintenance;
use super::storage::KvStorage;
use crate::error::{Error, Result};
use crate::format::GgmlType;
use crate::inference::types::{Pos, SeqId};
use crate::model::{ModelConfig, RopeType};
use serde::{Deserialize, Serialize};

/// What to do when a recurrent sequence receives a position that does not
/// follow its stored one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscontinuityPolicy {
    /// Log a warning and store the new position anyway
    #[default]
    Warn,
    /// Fail the slot search without touching the cache
    Reject,
}

/// Cache construction parameters
#[derive(Debug, Clone)]
pub struct KvCacheConfig {
    /// Number of cells
    pub size: usize,
    pub type_k: GgmlType,
    pub type_v: GgmlType,
    /// One cell per sequence instead of one per position
    pub recurrent: bool,
    /// Store values transposed
    pub v_trans: bool,
    pub discontinuity: DiscontinuityPolicy,
}

impl KvCacheConfig {
    /// Defaults for `model`: recurrent iff the model is, values transposed
    /// unless fused attention is used
    pub fn for_model(
        model: &ModelConfig,
        size: usize,
        type_k: GgmlType,
        type_v: GgmlType,
        flash_attn: bool,
    ) -> Self {
        let recurrent = model.is_recurrent();
        Self {
            size,
            type_k,
            type_v,
            recurrent,
            v_trans: !recurrent && !flash_attn,
            discontinuity: DiscontinuityPolicy::default(),
        }
    }
}

/// Key-value cache: cell metadata plus per-layer storage
///
/// In attention mode each cell holds one position and the cells form a ring
/// that `find_slot` scans from `head`. In recurrent mode each sequence owns
/// one cell (its tail) holding its entire state; `tails[seq]` records it.
#[derive(Debug, Clone)]
pub struct KvCache {
    pub(super) cells: Vec<KvCell>,
    /// Recurrent only: owning cell of each sequence id
    pub(super) tails: Vec<Option<usize>>,
    pub(super) head: usize,
    pub(super) used: usize,
    /// Active window consumed by the graph builder
    pub(super) n: usize,
    pub(super) recurrent: bool,
    pub(super) discontinuity: DiscontinuityPolicy,
    pub(super) maintenance: Maintenance,
    /// Positions may be shifted: the keys can be re-rotated in place
    pub(super) can_shift: bool,
    pub(super) storage: KvStorage,
}

impl KvCache {
    pub fn new(model: &ModelConfig, config: &KvCacheConfig) -> Result<Self> {
        if config.size == 0 {
            return Err(Error::InvalidArgument {
                arg: "size",
                reason: "cache must have at least one cell".into(),
            });
        }
        if config.recurrent && config.v_trans {
            return Err(Error::InvalidArgument {
                arg: "v_trans",
                reason: "recurrent state is never stored transposed".into(),
            });
        }

        let storage = KvStorage::new(
            model,
            config.size,
            config.type_k,
            config.type_v,
            config.v_trans,
        )?;

        tracing::info!(
            size = config.size,
            recurrent = config.recurrent,
            type_k = %config.type_k,
            type_v = %config.type_v,
            mib = storage.total_bytes() as f64 / (1024.0 * 1024.0),
            "kv cache initialized"
        );

        Ok(Self {
            cells: vec![KvCell::default(); config.size],
            tails: if config.recurrent {
                vec![None; config.size]
            } else {
                Vec::new()
            },
            head: 0,
            used: 0,
            n: 0,
            recurrent: config.recurrent,
            discontinuity: config.discontinuity,
            maintenance: Maintenance::Clean,
            can_shift: config.recurrent
                || !config.type_k.is_quantized()
                || model.rope_type() == RopeType::None,
            storage,
        })
    }

    pub fn size(&self) -> usize {
        self.cells.len()
    }

    pub fn head(&self) -> usize {
        self.head
    }

    pub fn set_head(&mut self, head: usize) {
        self.head = head;
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// Size of the active window
    pub fn n(&self) -> usize {
        self.n
    }

    pub fn set_n(&mut self, n: usize) {
        self.n = n.min(self.size());
    }

    pub fn recurrent(&self) -> bool {
        self.recurrent
    }

    pub fn v_trans(&self) -> bool {
        self.storage.v_trans()
    }

    pub fn cells(&self) -> &[KvCell] {
        &self.cells
    }

    pub fn cell(&self, i: usize) -> &KvCell {
        &self.cells[i]
    }

    /// Recurrent only: the cell holding `seq_id`'s state
    pub fn tail(&self, seq_id: SeqId) -> Option<usize> {
        usize::try_from(seq_id)
            .ok()
            .and_then(|s| self.tails.get(s).copied().flatten())
    }

    pub fn storage(&self) -> &KvStorage {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut KvStorage {
        &mut self.storage
    }

    pub fn discontinuity_policy(&self) -> DiscontinuityPolicy {
        self.discontinuity
    }

    pub fn set_discontinuity_policy(&mut self, policy: DiscontinuityPolicy) {
        self.discontinuity = policy;
    }

    pub fn maintenance(&self) -> Maintenance {
        self.maintenance
    }

    pub fn set_maintenance(&mut self, state: Maintenance) {
        self.maintenance = state;
    }

    /// Whether `seq_add` and `seq_div` are allowed. Quantized keys cannot
    /// be re-rotated.
    pub fn can_shift(&self) -> bool {
        self.can_shift
    }

    pub fn has_shift(&self) -> bool {
        self.maintenance.shift_pending()
    }

    /// Schedule a defrag pass for the next update (attention caches only)
    pub fn defrag(&mut self) {
        if !self.recurrent {
            self.maintenance = self.maintenance.with_defrag();
        }
    }

    /// Erase every cell and zero the storage
    pub fn clear(&mut self) {
        for cell in &mut self.cells {
            *cell = KvCell::default();
        }
        self.tails.fill(None);
        self.head = 0;
        self.used = 0;
        self.storage.clear();
    }

    /// One past the last non-empty cell, 0 if the cache is empty
    pub fn cell_max(&self) -> usize {
        self.cells
            .iter()
            .rposition(|c| c.pos >= 0 && !c.is_empty())
            .map_or(0, |i| i + 1)
    }

    /// Number of (cell, sequence) memberships
    pub fn token_count(&self) -> usize {
        self.cells.iter().map(|c| c.seq_id.len()).sum()
    }

    pub fn used_cells(&self) -> usize {
        self.used
    }

    /// Largest position stored for `seq_id`, 0 if none
    pub fn seq_pos_max(&self, seq_id: SeqId) -> Pos {
        self.cells
            .iter()
            .filter(|c| c.has_seq_id(seq_id))
            .map(|c| c.pos)
            .fold(0, Pos::max)
    }

    /// Largest position stored for any sequence, -1 if the cache is empty
    pub fn max_pos(&self) -> Pos {
        self.cells
            .iter()
            .filter(|c| !c.is_empty())
            .map(|c| c.pos)
            .fold(-1, Pos::max)
    }

    /// Recurrent: `(s_copy, s_mask)` for the active window.
    ///
    /// Cells without a source start from a zeroed state. Afterwards every
    /// occupied window cell is its own source, so each state is copied once.
    pub fn take_state_inputs(&mut self) -> (Vec<i32>, Vec<f32>) {
        let size = self.size();
        let end = (self.head + self.n).min(size);
        let mut s_copy = Vec::with_capacity(end - self.head);
        let mut s_mask = Vec::with_capacity(end - self.head);
        for id in self.head..end {
            let cell = &mut self.cells[id];
            s_mask.push(if cell.src.is_some() { 1.0 } else { 0.0 });
            let src = cell.src.filter(|&s| s < size).unwrap_or(id);
            s_copy.push(src as i32);
            // empty cells in the window must still start fresh when claimed
            if !cell.is_empty() {
                cell.src = Some(id);
            }
        }
        (s_copy, s_mask)
    }

    /// Remove `seq_id` from cell `i`, freeing the cell if it was the last
    /// owner. Returns true if the cell became empty.
    pub(super) fn detach(&mut self, i: usize, seq_id: SeqId) -> bool {
        let cell = &mut self.cells[i];
        if !cell.seq_id.remove(&seq_id) {
            return false;
        }
        if self.recurrent {
            if let Some(t) = self.tail_slot(seq_id) {
                if *t == Some(i) {
                    *t = None;
                }
            }
        }
        let cell = &mut self.cells[i];
        if cell.is_empty() {
            cell.pos = -1;
            cell.src = None;
            self.used -= 1;
            true
        } else {
            false
        }
    }

    pub(super) fn tail_slot(&mut self, seq_id: SeqId) -> Option<&mut Option<usize>> {
        usize::try_from(seq_id)
            .ok()
            .and_then(|s| self.tails.get_mut(s))
    }

    /// Check that tails and cell memberships agree.
    ///
    /// Every sequence present in a cell must have that cell as its tail, and
    /// every tail must point at a cell that lists the sequence. Only
    /// meaningful for recurrent caches.
    pub fn verify_tails(&self) -> Result<()> {
        if !self.recurrent {
            return Ok(());
        }
        let mut seen = vec![None; self.tails.len()];
        for (i, cell) in self.cells.iter().enumerate() {
            for &seq_id in &cell.seq_id {
                let Some(slot) = usize::try_from(seq_id).ok().and_then(|s| seen.get_mut(s))
                else {
                    return Err(Error::CacheError {
                        reason: format!("cell {i} holds out-of-range seq_id {seq_id}"),
                    });
                };
                if let Some(prev) = *slot {
                    return Err(Error::CacheError {
                        reason: format!("seq_id {seq_id} owns both cell {prev} and cell {i}"),
                    });
                }
                *slot = Some(i);
            }
        }
        for (seq_id, (&tail, &expected)) in self.tails.iter().zip(seen.iter()).enumerate() {
            if tail != expected {
                return Err(Error::CacheError {
                    reason: format!(
                        "tail of seq_id {seq_id} is {tail:?} but its cell is {expected:?}"
                    ),
                });
            }
        }
        Ok(())
    }

    /// Count non-empty cells from scratch
    pub fn count_used(&self) -> usize {
        self.cells.iter().filter(|c| !c.is_empty()).count()
    }
}
