//! Filling the leaf tensors of a forward graph.

use super::params::{ContextParams, KQ_MASK_PAD, pad_up};
use crate::error::{Error, Result};
use crate::inference::batch::{BatchInput, UBatch};
use crate::inference::graph::{CacheWindow, GraphInputs};
use crate::inference::kv_cache::KvCache;
use crate::model::PoolingType;

/// Inputs for one micro-batch.
///
/// With `use_cache` the attention mask spans the cache window and, for
/// recurrent caches, the state sources are consumed from the cells.
/// Without it the mask only relates the micro-batch's own tokens.
pub(crate) fn build_inputs(
    params: &ContextParams,
    cache: &mut KvCache,
    ubatch: &UBatch,
    window: &CacheWindow,
    n_outputs: usize,
    use_cache: bool,
) -> Result<GraphInputs> {
    let n_tokens = ubatch.n_tokens;
    let mut inputs = GraphInputs {
        n_tokens,
        n_seqs: ubatch.n_seqs,
        n_seq_tokens: ubatch.n_seq_tokens,
        n_outputs,
        pos: ubatch.pos.clone(),
        kv_head: window.head,
        n_kv: window.n_kv,
        ..Default::default()
    };
    match &ubatch.input {
        BatchInput::Tokens(tokens) => inputs.tokens = tokens.clone(),
        BatchInput::Embeddings { data, .. } => inputs.embd = data.clone(),
    }

    inputs.out_ids = output_rows(ubatch, n_outputs)?;

    if window.recurrent {
        if use_cache {
            let (s_copy, s_mask) = cache.take_state_inputs();
            inputs.s_copy = s_copy;
            inputs.s_mask = s_mask;
        }
    } else if use_cache {
        causal_mask(&mut inputs, cache, ubatch);
    } else {
        sequence_mask(&mut inputs, ubatch);
    }

    if params.embeddings {
        match params.pooling_type() {
            PoolingType::None => {}
            PoolingType::Mean => inputs.mean = mean_matrix(ubatch)?,
            PoolingType::Cls => inputs.cls = cls_rows(ubatch)?,
            PoolingType::Last => inputs.cls = last_rows(ubatch)?,
        }
    }
    Ok(inputs)
}

fn output_rows(ubatch: &UBatch, n_outputs: usize) -> Result<Vec<i32>> {
    let n_tokens = ubatch.n_tokens;
    if n_outputs == n_tokens {
        return Ok((0..n_tokens as i32).collect());
    }
    let rows: Vec<i32> = (0..n_tokens)
        .filter(|&i| ubatch.output[i])
        .map(|i| i as i32)
        .collect();
    if rows.len() != n_outputs {
        return Err(Error::BatchError {
            reason: format!("{} output flags for {n_outputs} outputs", rows.len()),
        });
    }
    Ok(rows)
}

/// Token `j` of sequence `s` may attend to cell `i` iff the cell holds the
/// token's sequence at an earlier or equal position
fn causal_mask(inputs: &mut GraphInputs, cache: &KvCache, ubatch: &UBatch) {
    let n_kv = inputs.n_kv;
    let rows = pad_up(ubatch.n_tokens.max(1), KQ_MASK_PAD);
    let mut mask = vec![f32::NEG_INFINITY; rows * n_kv];
    let cells = &cache.cells()[..n_kv];

    for s in 0..ubatch.n_seqs {
        let seq_id = ubatch.primary_seq(s);
        for j in 0..ubatch.n_seq_tokens {
            let t = s * ubatch.n_seq_tokens + j;
            let pos = ubatch.pos[t];
            let row = &mut mask[t * n_kv..(t + 1) * n_kv];
            for (f, cell) in row.iter_mut().zip(cells) {
                if cell.has_seq_id(seq_id) && cell.pos <= pos {
                    *f = 0.0;
                }
            }
        }
    }
    inputs.kq_mask = mask;
    inputs.kq_mask_rows = rows;
}

/// Tokens attend to every token of the micro-batch sharing their sequence
fn sequence_mask(inputs: &mut GraphInputs, ubatch: &UBatch) {
    let n_tokens = ubatch.n_tokens;
    let rows = pad_up(n_tokens.max(1), KQ_MASK_PAD);
    let mut mask = vec![f32::NEG_INFINITY; rows * n_tokens];
    let nst = ubatch.n_seq_tokens;

    for s1 in 0..ubatch.n_seqs {
        let seq_id = ubatch.primary_seq(s1);
        for j in 0..nst {
            let tj = s1 * nst + j;
            for s0 in 0..ubatch.n_seqs {
                if !ubatch.seq_ids[s0].contains(&seq_id) {
                    continue;
                }
                for i in 0..nst {
                    mask[tj * n_tokens + s0 * nst + i] = 0.0;
                }
            }
        }
    }
    inputs.kq_mask = mask;
    inputs.kq_mask_rows = rows;
    inputs.n_kv = n_tokens;
}

fn pooled_seq(ubatch: &UBatch, s: usize, kind: &str) -> Result<usize> {
    let seq_id = ubatch.primary_seq(s);
    if seq_id < 0 || seq_id as usize >= ubatch.n_tokens {
        return Err(Error::BatchError {
            reason: format!(
                "seq_id {seq_id} cannot be larger than n_tokens ({}) with {kind} pooling",
                ubatch.n_tokens
            ),
        });
    }
    Ok(seq_id as usize)
}

/// `n_tokens x n_tokens`; row `seq` averages that sequence's tokens
fn mean_matrix(ubatch: &UBatch) -> Result<Vec<f32>> {
    let n_tokens = ubatch.n_tokens;
    let nst = ubatch.n_seq_tokens;
    let mut counts = vec![0usize; n_tokens];
    for s in 0..ubatch.n_seqs {
        counts[pooled_seq(ubatch, s, "mean")?] += nst;
    }
    let mut data = vec![0.0; n_tokens * n_tokens];
    for s in 0..ubatch.n_seqs {
        let seq = pooled_seq(ubatch, s, "mean")?;
        let w = 1.0 / counts[seq] as f32;
        for i in 0..nst {
            data[seq * n_tokens + s * nst + i] = w;
        }
    }
    Ok(data)
}

/// Row of each sequence's position-0 token
fn cls_rows(ubatch: &UBatch) -> Result<Vec<i32>> {
    let nst = ubatch.n_seq_tokens;
    let mut rows = vec![-1; ubatch.n_tokens];
    for s in 0..ubatch.n_seqs {
        let seq = pooled_seq(ubatch, s, "cls")?;
        for i in 0..nst {
            if ubatch.seq_pos(s, i) == 0 {
                rows[seq] = (s * nst + i) as i32;
            }
        }
    }
    Ok(rows)
}

/// Row of each sequence's highest position
fn last_rows(ubatch: &UBatch) -> Result<Vec<i32>> {
    let nst = ubatch.n_seq_tokens;
    let mut last_pos = vec![-1; ubatch.n_tokens];
    let mut rows = vec![-1; ubatch.n_tokens];
    for s in 0..ubatch.n_seqs {
        let seq = pooled_seq(ubatch, s, "last")?;
        for i in 0..nst {
            let pos = ubatch.seq_pos(s, i);
            if pos >= last_pos[seq] {
                last_pos[seq] = pos;
                rows[seq] = (s * nst + i) as i32;
            }
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::GgmlType;
    use crate::inference::batch::{Batch, SBatch};
    use crate::inference::kv_cache::KvCacheConfig;
    use crate::model::ModelConfig;

    fn model() -> ModelConfig {
        serde_yaml::from_str(
            "model_type: bert\nvocab_size: 8\nhidden_size: 4\nnum_layers: 1\nattention:\n  num_heads: 1\n",
        )
        .unwrap()
    }

    fn ubatch(seq_ids: Vec<Vec<i32>>, pos: Vec<i32>, simple: bool) -> UBatch {
        let n = pos.len();
        let batch = Batch::from_tokens(vec![1; n])
            .with_positions(pos)
            .with_seq_ids(seq_ids)
            .resolve(0)
            .unwrap();
        let mut sb = SBatch::from_batch(&batch, 4, simple, true);
        if simple {
            sb.split_simple(n)
        } else {
            sb.split_equal(n)
        }
    }

    fn window(head: usize, n_kv: usize) -> CacheWindow {
        CacheWindow {
            head,
            n_kv,
            size: 8,
            recurrent: false,
            v_trans: true,
        }
    }

    #[test]
    fn test_causal_mask_hides_future_and_other_sequences() {
        let model = model();
        let config = KvCacheConfig::for_model(&model, 8, GgmlType::F32, GgmlType::F32, false);
        let mut cache = KvCache::new(&model, &config).unwrap();
        let ub = ubatch(vec![vec![0], vec![0], vec![1]], vec![0, 1, 0], true);
        assert!(cache.find_slot(&ub));

        let params = ContextParams::default();
        let inputs = build_inputs(&params, &mut cache, &ub, &window(0, 4), 3, true).unwrap();
        let inf = f32::NEG_INFINITY;
        assert_eq!(inputs.kq_mask_rows, 32);
        assert_eq!(&inputs.kq_mask[0..4], &[0.0, inf, inf, inf]);
        assert_eq!(&inputs.kq_mask[4..8], &[0.0, 0.0, inf, inf]);
        assert_eq!(&inputs.kq_mask[8..12], &[inf, inf, 0.0, inf]);
        assert!(inputs.kq_mask[12..].iter().all(|&f| f == inf));
        assert_eq!(inputs.out_ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_sequence_mask_for_encoder() {
        let model = model();
        let config = KvCacheConfig::for_model(&model, 8, GgmlType::F32, GgmlType::F32, false);
        let mut cache = KvCache::new(&model, &config).unwrap();
        let ub = ubatch(vec![vec![0], vec![1], vec![0]], vec![0, 0, 1], true);
        let params = ContextParams {
            embeddings: true,
            pooling: Some(PoolingType::Mean),
            ..Default::default()
        };
        let inputs = build_inputs(&params, &mut cache, &ub, &window(0, 0), 3, false).unwrap();
        let inf = f32::NEG_INFINITY;
        assert_eq!(inputs.n_kv, 3);
        assert_eq!(&inputs.kq_mask[0..3], &[0.0, inf, 0.0]);
        assert_eq!(&inputs.kq_mask[3..6], &[inf, 0.0, inf]);
        // row 0 averages tokens 0 and 2, row 1 is token 1
        assert_eq!(&inputs.mean[0..3], &[0.5, 0.0, 0.5]);
        assert_eq!(&inputs.mean[3..6], &[0.0, 1.0, 0.0]);
        assert_eq!(cache.used(), 0);
    }

    #[test]
    fn test_cls_and_last_rows() {
        let ub = ubatch(vec![vec![1], vec![1], vec![0]], vec![0, 1, 4], true);
        assert_eq!(cls_rows(&ub).unwrap(), vec![-1, 0, -1]);
        assert_eq!(last_rows(&ub).unwrap(), vec![2, 1, -1]);
    }

    #[test]
    fn test_pooling_rejects_large_seq_id() {
        let ub = ubatch(vec![vec![5], vec![5]], vec![0, 1], false);
        assert!(mean_matrix(&ub).is_err());
    }

    #[test]
    fn test_output_rows_follow_flags() {
        let batch = Batch::from_tokens(vec![1, 2, 3])
            .with_outputs(vec![true, false, true])
            .resolve(0)
            .unwrap();
        let mut sb = SBatch::from_batch(&batch, 4, true, false);
        let ub = sb.split_simple(3);
        assert_eq!(output_rows(&ub, 2).unwrap(), vec![0, 2]);
        assert!(output_rows(&ub, 1).is_err());
    }
}
