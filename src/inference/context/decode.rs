//! The decode loop and the pieces encode shares with it.

use super::Context;
use super::inputs::build_inputs;
use super::params::pad_up;
use crate::error::Error;
use crate::inference::batch::{Batch, BatchInput, ResolvedBatch, SBatch, UBatch};
use crate::inference::graph::{Backend, CacheWindow, GraphBuilder, GraphOutputs};
use crate::model::PoolingType;

/// Windows smaller than this never count as fragmented
const DEFRAG_MIN_WINDOW: usize = 128;

/// Failure of a decode or encode call
///
/// [`code`](Self::code) gives the integer contract: positive values are
/// recoverable (retry with a smaller batch, after a defrag or after freeing
/// sequences), negative values are fatal for the call.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error(
        "no kv cache slot for a micro-batch of {n_tokens} tokens, reduce the batch size or increase the context"
    )]
    NoKvSlot { n_tokens: usize },

    #[error("invalid batch: {reason}")]
    InvalidBatch { reason: String },

    #[error("failed to reserve output buffers for {n_outputs} outputs")]
    OutputReserve {
        n_outputs: usize,
        #[source]
        source: Error,
    },

    #[error("graph computation failed")]
    Compute(#[source] Error),
}

impl DecodeError {
    pub fn code(&self) -> i32 {
        match self {
            Self::NoKvSlot { .. } => 1,
            Self::InvalidBatch { .. } => -1,
            Self::OutputReserve { .. } => -2,
            Self::Compute(_) => -3,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.code() > 0
    }
}

fn invalid(reason: impl Into<String>) -> DecodeError {
    let reason = reason.into();
    tracing::error!(%reason, "invalid batch");
    DecodeError::InvalidBatch { reason }
}

impl<B: Backend, G: GraphBuilder> Context<B, G> {
    /// Run `batch` through the model, storing its keys and values in the
    /// cache.
    ///
    /// On [`DecodeError::NoKvSlot`] the micro-batches before the failing one
    /// have already been committed to the cache.
    pub fn decode(&mut self, batch: &Batch) -> Result<(), DecodeError> {
        let resolved = self.validate_batch(batch, false)?;
        let n_tokens_all = resolved.n_tokens();
        let recurrent = self.cache.recurrent();
        let causal = self.params.is_causal();
        let embd_pooled = self.params.embd_pooled();

        let n_outputs = if self.params.logits_all || embd_pooled {
            n_tokens_all
        } else {
            resolved.n_outputs()
        };
        self.reserve_outputs(n_outputs)?;
        self.outputs.embd_seq.clear();

        let mut sbatch = SBatch::from_batch(
            &resolved,
            self.model.hidden_size,
            !recurrent,
            n_outputs == n_tokens_all,
        );
        let n_ubatch = self.params.n_ubatch;
        let mut n_outputs_prev = 0;

        while !sbatch.is_empty() {
            let ubatch = if !recurrent {
                sbatch.split_simple(n_ubatch)
            } else if embd_pooled {
                sbatch.split_seq(n_ubatch)
            } else {
                sbatch.split_equal(n_ubatch)
            };
            let n_tokens = ubatch.n_tokens;
            let n_outputs_new = if n_outputs == n_tokens_all {
                n_tokens
            } else {
                ubatch.n_outputs()
            };

            if causal {
                self.kv_cache_update().map_err(DecodeError::Compute)?;

                // plenty of room before head, search from the start
                if self.cache.head() > self.cache.used() + 2 * n_tokens {
                    self.cache.set_head(0);
                }

                if !self.cache.find_slot(&ubatch) {
                    tracing::warn!(
                        n_tokens,
                        used = self.cache.used(),
                        size = self.cache.size(),
                        "failed to find kv cache slot"
                    );
                    return Err(DecodeError::NoKvSlot { n_tokens });
                }

                if !recurrent {
                    let pad = self.params.kv_padding();
                    let n = pad_up(self.cache.cell_max(), pad).max(pad);
                    self.cache.set_n(n);
                }
            }

            let window = self.window(causal);
            self.run_ubatch(&ubatch, &window, n_outputs_prev, n_outputs_new, causal)?;
            n_outputs_prev += n_outputs_new;

            let head = self.cache.head() + n_tokens;
            self.cache
                .set_head(if head >= self.cache.size() { 0 } else { head });
        }

        let mut out_ids = sbatch.take_out_ids();
        debug_assert_eq!(out_ids.len(), n_outputs);
        self.outputs.map_outputs(&out_ids);
        self.outputs.reorder(&mut out_ids);

        if causal && self.params.defrag_thold >= 0.0 {
            let n = self.cache.n();
            let fragmentation = if n >= DEFRAG_MIN_WINDOW {
                1.0 - self.cache.used() as f32 / n as f32
            } else {
                0.0
            };
            if fragmentation > self.params.defrag_thold {
                tracing::debug!(fragmentation, "scheduling kv cache defrag");
                self.cache.defrag();
            }
        }
        Ok(())
    }

    /// Fill in defaults and check the batch against the context limits
    pub(super) fn validate_batch(
        &self,
        batch: &Batch,
        encoding: bool,
    ) -> Result<ResolvedBatch, DecodeError> {
        let n_tokens = batch.n_tokens();
        if n_tokens == 0 {
            return Err(invalid("n_tokens == 0"));
        }

        match batch.input() {
            BatchInput::Tokens(tokens) => {
                let n_vocab = self.model.vocab_size;
                if let Some((i, t)) = tokens
                    .iter()
                    .enumerate()
                    .find(|&(_, &t)| t < 0 || t as usize >= n_vocab)
                {
                    return Err(invalid(format!("token {i} = {t} is outside [0, {n_vocab})")));
                }
            }
            BatchInput::Embeddings { n_embd, .. } => {
                if *n_embd != self.model.hidden_size {
                    return Err(invalid(format!(
                        "embedding width {n_embd} does not match the model ({})",
                        self.model.hidden_size
                    )));
                }
            }
        }

        if encoding {
            if n_tokens > self.params.n_ubatch {
                return Err(invalid(format!(
                    "encoder requires n_ubatch >= n_tokens ({} < {n_tokens})",
                    self.params.n_ubatch
                )));
            }
        } else {
            if n_tokens > self.params.n_batch {
                return Err(invalid(format!(
                    "n_tokens {n_tokens} exceeds n_batch {}",
                    self.params.n_batch
                )));
            }
            if !self.params.is_causal() && n_tokens > self.params.n_ubatch {
                return Err(invalid(format!(
                    "non-causal attention requires n_ubatch >= n_tokens ({} < {n_tokens})",
                    self.params.n_ubatch
                )));
            }
        }

        let resolved = batch
            .resolve(self.cache.max_pos() + 1)
            .map_err(|e| invalid(e.to_string()))?;

        let n_seq_max = self.params.n_seq_max;
        for (i, ids) in resolved.seq_ids.iter().enumerate() {
            if let Some(&s) = ids.iter().find(|&&s| s as usize >= n_seq_max) {
                return Err(invalid(format!(
                    "seq_id {s} of token {i} is not below n_seq_max {n_seq_max}"
                )));
            }
        }
        Ok(resolved)
    }

    pub(super) fn reserve_outputs(&mut self, n_outputs: usize) -> Result<(), DecodeError> {
        let has_logits = !self.params.embeddings;
        let has_embd = self.params.embeddings && self.params.pooling_type() == PoolingType::None;
        self.outputs
            .reserve(
                n_outputs,
                self.params.n_batch,
                self.params.n_seq_max,
                has_logits,
                has_embd,
            )
            .map_err(|source| {
                tracing::error!(n_outputs, error = %source, "could not reserve outputs");
                DecodeError::OutputReserve { n_outputs, source }
            })?;
        Ok(())
    }

    pub(super) fn window(&self, use_cache: bool) -> CacheWindow {
        CacheWindow {
            head: self.cache.head(),
            n_kv: if use_cache { self.cache.n() } else { 0 },
            size: self.cache.size(),
            recurrent: self.cache.recurrent(),
            v_trans: self.cache.v_trans(),
        }
    }

    /// Build, feed and run the graph of one micro-batch, then copy its
    /// results to output rows starting at `row0`
    pub(super) fn run_ubatch(
        &mut self,
        ubatch: &UBatch,
        window: &CacheWindow,
        row0: usize,
        n_outputs: usize,
        use_cache: bool,
    ) -> Result<(), DecodeError> {
        let graph = self
            .builder
            .build_forward(ubatch, window, n_outputs)
            .map_err(DecodeError::Compute)?;
        let inputs = build_inputs(
            &self.params,
            &mut self.cache,
            ubatch,
            window,
            n_outputs,
            use_cache,
        )
        .map_err(|e| invalid(e.to_string()))?;
        let out = self
            .backend
            .compute(&graph, &inputs, self.cache.storage_mut())
            .map_err(|e| {
                tracing::error!(error = %e, "graph compute failed");
                DecodeError::Compute(e)
            })?;
        self.extract(ubatch, out, row0, n_outputs)
            .map_err(DecodeError::Compute)
    }

    fn extract(
        &mut self,
        ubatch: &UBatch,
        out: GraphOutputs,
        row0: usize,
        n_outputs: usize,
    ) -> crate::error::Result<()> {
        if n_outputs > 0 && self.outputs.has_logits {
            let n = n_outputs * self.outputs.n_vocab;
            let logits = out.logits.as_deref().unwrap_or_default();
            if logits.len() < n {
                return Err(Error::GraphError {
                    reason: format!("graph produced {} logits, expected {n}", logits.len()),
                });
            }
            self.outputs.write_logits(row0, &logits[..n])?;
        }

        if !self.params.embeddings {
            return Ok(());
        }
        let n_embd = self.outputs.n_embd;
        match self.params.pooling_type() {
            PoolingType::None => {
                if n_outputs > 0 {
                    let n = n_outputs * n_embd;
                    let embd = out.embd.as_deref().unwrap_or_default();
                    if embd.len() < n {
                        return Err(Error::GraphError {
                            reason: format!("graph produced {} embeddings, expected {n}", embd.len()),
                        });
                    }
                    self.outputs.write_embd(row0, &embd[..n])?;
                }
            }
            _ => {
                let pooled = out.embd_pooled.as_deref().unwrap_or_default();
                for s in 0..ubatch.n_seqs {
                    let seq_id = ubatch.primary_seq(s);
                    if self.outputs.embd_seq.contains_key(&seq_id) {
                        continue;
                    }
                    let start = seq_id as usize * n_embd;
                    let Some(row) = pooled.get(start..start + n_embd) else {
                        return Err(Error::GraphError {
                            reason: format!("no pooled embedding for seq_id {seq_id}"),
                        });
                    };
                    self.outputs.embd_seq.insert(seq_id, row.to_vec());
                }
            }
        }
        Ok(())
    }
}
