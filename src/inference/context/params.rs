//! Context construction parameters.

use crate::error::{Error, Result};
use crate::format::GgmlType;
use crate::inference::kv_cache::DiscontinuityPolicy;
use crate::model::{ModelConfig, PoolingType};
use serde::{Deserialize, Serialize};

/// Row padding of the attention mask
pub const KQ_MASK_PAD: usize = 32;

/// Parameters for [`Context`](super::Context)
///
/// Fields left as `None` take the model's value when the context is
/// created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextParams {
    /// Cache cells for attention models, rounded up to the kernel padding
    pub n_ctx: usize,
    /// Most tokens accepted by one decode call
    pub n_batch: usize,
    /// Most tokens per micro-batch
    pub n_ubatch: usize,
    /// Distinct sequences (and recurrent state cells)
    pub n_seq_max: usize,
    pub type_k: GgmlType,
    pub type_v: GgmlType,
    /// Fused attention kernels: values stored row-major, 256-cell padding
    pub flash_attn: bool,
    /// Extract embeddings instead of logits
    pub embeddings: bool,
    pub pooling: Option<PoolingType>,
    pub causal_attn: Option<bool>,
    /// Every token produces an output
    pub logits_all: bool,
    /// Fragmentation above which a defrag is scheduled, negative disables
    pub defrag_thold: f32,
    /// Contiguous blocks moved per defrag pass, derived from the graph node
    /// budget when unset
    pub defrag_max_moves: Option<usize>,
    pub discontinuity: DiscontinuityPolicy,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 512,
            n_batch: 2048,
            n_ubatch: 512,
            n_seq_max: 1,
            type_k: GgmlType::F16,
            type_v: GgmlType::F16,
            flash_attn: false,
            embeddings: false,
            pooling: None,
            causal_attn: None,
            logits_all: false,
            defrag_thold: -1.0,
            defrag_max_moves: None,
            discontinuity: DiscontinuityPolicy::Warn,
        }
    }
}

impl ContextParams {
    pub fn validate(&self) -> Result<()> {
        for (arg, value) in [
            ("n_ctx", self.n_ctx),
            ("n_batch", self.n_batch),
            ("n_seq_max", self.n_seq_max),
        ] {
            if value == 0 {
                return Err(Error::InvalidArgument {
                    arg,
                    reason: "must be > 0".into(),
                });
            }
        }
        if self.defrag_max_moves == Some(0) {
            return Err(Error::InvalidArgument {
                arg: "defrag_max_moves",
                reason: "must be > 0 when set".into(),
            });
        }
        if self.type_v.is_quantized() && !self.flash_attn {
            return Err(Error::InvalidArgument {
                arg: "type_v",
                reason: "a quantized value cache requires flash_attn".into(),
            });
        }
        Ok(())
    }

    /// Cell padding the attention kernels expect
    pub fn kv_padding(&self) -> usize {
        if self.flash_attn { 256 } else { 32 }
    }

    /// Copy with every model-dependent value filled in and the sizes
    /// clamped the way the context uses them
    pub fn resolve(&self, model: &ModelConfig) -> Result<Self> {
        self.validate()?;
        let mut p = self.clone();
        let causal = self.causal_attn.unwrap_or(model.causal_attn);
        p.causal_attn = Some(causal);
        p.pooling = Some(self.pooling.unwrap_or(model.pooling));

        p.n_ctx = pad_up(self.n_ctx, self.kv_padding());
        // non-causal batches are never split, so they are not bounded by the cache
        p.n_batch = if causal {
            self.n_batch.min(p.n_ctx)
        } else {
            self.n_batch
        };
        p.n_ubatch = if self.n_ubatch == 0 {
            p.n_batch
        } else {
            self.n_ubatch.min(p.n_batch)
        };
        p.defrag_max_moves = Some(
            self.defrag_max_moves
                .unwrap_or_else(|| default_defrag_max_moves(model)),
        );
        Ok(p)
    }

    /// Cells the cache needs: one per context position, or one per sequence
    /// for recurrent models
    pub fn kv_size(&self, model: &ModelConfig) -> usize {
        if model.is_recurrent() {
            self.n_seq_max.max(1)
        } else {
            pad_up(self.n_ctx, self.kv_padding())
        }
    }

    pub fn pooling_type(&self) -> PoolingType {
        self.pooling.unwrap_or_default()
    }

    pub fn is_causal(&self) -> bool {
        self.causal_attn.unwrap_or(true)
    }

    /// Embeddings pooled to one row per sequence
    pub fn embd_pooled(&self) -> bool {
        self.embeddings && self.pooling_type() != PoolingType::None
    }
}

/// Moves one defrag graph can hold: each costs a source view, a destination
/// view and a copy for the keys and values of every layer
pub fn default_defrag_max_moves(model: &ModelConfig) -> usize {
    let n_layer = model.num_layers.max(1);
    let budget = model.max_graph_nodes().saturating_sub(2 * n_layer);
    (budget / (6 * n_layer)).max(1)
}

pub(crate) fn pad_up(n: usize, pad: usize) -> usize {
    n.div_ceil(pad) * pad
}
