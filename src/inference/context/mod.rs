//! Decode/encode orchestration over one cache.
//!
//! A [`Context`] owns the cache and the output buffers and drives a
//! [`GraphBuilder`] and a [`Backend`] through the micro-batches of each call:
//!
//! ```text
//! validate -> split -> per micro-batch { maintenance, find_slot, build, compute, extract }
//!          -> reorder outputs -> maybe schedule defrag
//! ```

mod decode;
mod encode;
mod inputs;
mod maintenance;
mod outputs;
mod params;

pub use decode::DecodeError;
pub use params::{ContextParams, KQ_MASK_PAD, default_defrag_max_moves};

use crate::error::Result;
use crate::inference::graph::{Backend, GraphBuilder};
use crate::inference::kv_cache::{KvCache, KvCacheConfig};
use crate::inference::types::SeqId;
use crate::model::ModelConfig;
use outputs::Outputs;

/// Inference context: cache, output buffers and the collaborators that
/// build and run graphs
pub struct Context<B, G> {
    model: ModelConfig,
    params: ContextParams,
    cache: KvCache,
    backend: B,
    builder: G,
    outputs: Outputs,
}

impl<B: Backend, G: GraphBuilder> Context<B, G> {
    pub fn new(model: ModelConfig, params: ContextParams, backend: B, builder: G) -> Result<Self> {
        model.validate()?;
        let params = params.resolve(&model)?;

        let mut config = KvCacheConfig::for_model(
            &model,
            params.kv_size(&model),
            params.type_k,
            params.type_v,
            params.flash_attn,
        );
        config.discontinuity = params.discontinuity;
        let cache = KvCache::new(&model, &config)?;

        tracing::info!(
            n_ctx = params.n_ctx,
            n_batch = params.n_batch,
            n_ubatch = params.n_ubatch,
            n_seq_max = params.n_seq_max,
            flash_attn = params.flash_attn,
            causal = params.is_causal(),
            "context created"
        );

        let outputs = Outputs::new(model.vocab_size, model.hidden_size);
        Ok(Self {
            model,
            params,
            cache,
            backend,
            builder,
            outputs,
        })
    }

    pub fn model(&self) -> &ModelConfig {
        &self.model
    }

    /// Parameters after resolution against the model
    pub fn params(&self) -> &ContextParams {
        &self.params
    }

    pub fn n_ctx(&self) -> usize {
        self.params.n_ctx
    }

    pub fn n_batch(&self) -> usize {
        self.params.n_batch
    }

    pub fn n_ubatch(&self) -> usize {
        self.params.n_ubatch
    }

    pub fn n_seq_max(&self) -> usize {
        self.params.n_seq_max
    }

    pub fn kv_cache(&self) -> &KvCache {
        &self.cache
    }

    pub fn kv_cache_mut(&mut self) -> &mut KvCache {
        &mut self.cache
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn builder(&self) -> &G {
        &self.builder
    }

    /// Wait for queued backend work
    pub fn synchronize(&mut self) -> Result<()> {
        self.backend.synchronize()
    }

    /// Logits of the last call, one row per output in batch order
    pub fn logits(&self) -> &[f32] {
        self.outputs.logits()
    }

    /// Logits of batch token `i`; negative `i` counts back from the last
    /// output
    pub fn logits_ith(&self, i: i32) -> Result<&[f32]> {
        self.outputs.logits_ith(i)
    }

    /// Token embeddings of the last call, in batch order
    pub fn embeddings(&self) -> &[f32] {
        self.outputs.embeddings()
    }

    pub fn embeddings_ith(&self, i: i32) -> Result<&[f32]> {
        self.outputs.embeddings_ith(i)
    }

    /// Pooled embedding of `seq_id` from the last call
    pub fn embeddings_seq(&self, seq_id: SeqId) -> Option<&[f32]> {
        self.outputs.embd_seq.get(&seq_id).map(Vec::as_slice)
    }

    /// Outputs produced by the last call
    pub fn n_outputs(&self) -> usize {
        self.outputs.n_outputs
    }

    pub(crate) fn outputs(&self) -> &Outputs {
        &self.outputs
    }

    pub(crate) fn outputs_mut(&mut self) -> &mut Outputs {
        &mut self.outputs
    }
}
