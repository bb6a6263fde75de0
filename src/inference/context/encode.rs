//! Non-causal single-shot encoding.

use super::Context;
use super::decode::DecodeError;
use crate::inference::batch::{Batch, SBatch};
use crate::inference::graph::{Backend, GraphBuilder};

impl<B: Backend, G: GraphBuilder> Context<B, G> {
    /// Encode `batch` in one micro-batch without touching the cache.
    ///
    /// Every token produces an output row. With pooling the per-sequence
    /// embeddings are available through
    /// [`embeddings_seq`](Context::embeddings_seq).
    pub fn encode(&mut self, batch: &Batch) -> Result<(), DecodeError> {
        let resolved = self.validate_batch(batch, true)?;
        let n_tokens = resolved.n_tokens();

        self.reserve_outputs(n_tokens)?;
        self.outputs.embd_seq.clear();

        let mut sbatch = SBatch::from_batch(&resolved, self.model.hidden_size, true, true);
        let ubatch = sbatch.split_simple(n_tokens);
        debug_assert!(sbatch.is_empty());

        let window = self.window(false);
        self.run_ubatch(&ubatch, &window, 0, n_tokens, false)?;

        let out_ids: Vec<usize> = (0..n_tokens).collect();
        self.outputs.map_outputs(&out_ids);
        tracing::debug!(n_tokens, "batch encoded");
        Ok(())
    }
}
