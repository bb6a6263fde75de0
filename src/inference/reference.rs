//! Deterministic reference architecture.
//!
//! [`ReferenceModel`] builds forward graphs and evaluates their ops with
//! plain arithmetic over what the cache holds, so the results of a decode
//! can be predicted from the cache contents alone. Attention layers store
//! `1.0` in the first key element and the token value in the first value
//! element of each cell. Recurrent layers keep a running token sum and
//! token count in the first two key elements of the sequence's state cell.
//!
//! For every output token the logits row starts with
//! `[visible, sum, value, pos]`: the number of cells (or tokens) the token
//! sees, the sum of their token values, its own token value and its
//! position. The rest of the row is zero. Embedding rows start with
//! `[value, pos, sum, visible]`.

use crate::error::{Error, Result};
use crate::inference::batch::UBatch;
use crate::inference::graph::cpu::{read_elem, write_elem};
use crate::inference::graph::{
    CacheWindow, Graph, GraphBuilder, GraphInputs, GraphKind, GraphOutputs, Node, OpKernel,
    OutputTag,
};
use crate::inference::kv_cache::{KvStorage, LayerStorage};
use crate::model::ModelConfig;

const OP_STORE: &str = "store";
const OP_HEAD_CACHED: &str = "head_cached";
const OP_HEAD_LOCAL: &str = "head_local";
const OP_HEAD_STATE: &str = "head_state";

/// Graph builder and kernel of the reference architecture
#[derive(Debug, Clone)]
pub struct ReferenceModel {
    n_vocab: usize,
    n_embd: usize,
    n_layer: usize,
    recurrent: bool,
}

impl ReferenceModel {
    pub fn new(model: &ModelConfig) -> Self {
        Self {
            n_vocab: model.vocab_size,
            n_embd: model.hidden_size,
            n_layer: model.num_layers,
            recurrent: model.is_recurrent(),
        }
    }
}

impl GraphBuilder for ReferenceModel {
    fn build_forward(
        &mut self,
        _ubatch: &UBatch,
        window: &CacheWindow,
        _n_outputs: usize,
    ) -> Result<Graph> {
        if window.recurrent != self.recurrent {
            return Err(Error::GraphError {
                reason: "cache kind does not match the model".into(),
            });
        }
        let mut graph = Graph::new(GraphKind::Forward);
        let cached = window.recurrent || window.n_kv > 0;

        if window.recurrent {
            for layer in 0..self.n_layer {
                graph.push(Node::StateCopy { layer });
                graph.push(Node::StateMask { layer });
            }
        }
        if cached {
            for il in 0..self.n_layer {
                graph.push(Node::Op {
                    name: OP_STORE.into(),
                    layer: Some(il),
                });
            }
        }

        let head = if window.recurrent {
            OP_HEAD_STATE
        } else if cached {
            OP_HEAD_CACHED
        } else {
            OP_HEAD_LOCAL
        };
        graph.push(Node::Op {
            name: head.into(),
            layer: None,
        });
        for tag in [
            OutputTag::Logits,
            OutputTag::Embeddings,
            OutputTag::PooledEmbeddings,
        ] {
            graph.push(Node::Output { tag });
        }
        Ok(graph)
    }
}

impl OpKernel for ReferenceModel {
    fn eval(
        &mut self,
        name: &str,
        layer: Option<usize>,
        inputs: &GraphInputs,
        storage: &mut KvStorage,
        outputs: &mut GraphOutputs,
    ) -> Result<()> {
        match (name, layer) {
            (OP_STORE, Some(il)) if il < storage.n_layer() => {
                if self.recurrent {
                    self.store_state(il, inputs, storage)
                } else {
                    self.store_rows(il, inputs, storage)
                }
            }
            (OP_HEAD_CACHED, None) => {
                let features = self.attend_cache(inputs, storage)?;
                self.emit(inputs, &features, outputs)
            }
            (OP_HEAD_LOCAL, None) => {
                let features = self.attend_local(inputs)?;
                self.emit(inputs, &features, outputs)
            }
            (OP_HEAD_STATE, None) => {
                let features = self.read_states(inputs, storage)?;
                self.emit(inputs, &features, outputs)
            }
            _ => Err(Error::GraphError {
                reason: format!("unknown reference op '{name}' (layer {layer:?})"),
            }),
        }
    }
}

/// What token `t` saw: (visible count, sum of visible token values)
type Features = Vec<(f32, f32)>;

impl ReferenceModel {
    fn value(&self, inputs: &GraphInputs, t: usize) -> f32 {
        if inputs.tokens.is_empty() {
            inputs.embd.get(t * self.n_embd).copied().unwrap_or(0.0)
        } else {
            inputs.tokens[t] as f32
        }
    }

    fn store_rows(&self, il: usize, inputs: &GraphInputs, storage: &mut KvStorage) -> Result<()> {
        check_types(storage.layer(il))?;
        let v_trans = storage.v_trans();
        let (type_k, type_v) = (storage.layer(il).type_k, storage.layer(il).type_v);
        let el = type_v.block_bytes();

        for t in 0..inputs.n_tokens {
            let cell = inputs.kv_head + t;
            if cell >= storage.size() {
                return Err(Error::GraphError {
                    reason: format!("store to cell {cell} of {}", storage.size()),
                });
            }
            let value = self.value(inputs, t);
            write_elem(type_k, storage.k_rows_mut(il, cell, 1), 1.0);
            let v = if v_trans {
                storage.v_elems_mut(il, 0, cell, 1)
            } else {
                &mut storage.v_rows_mut(il, cell, 1)[..el]
            };
            write_elem(type_v, v, value);
        }
        Ok(())
    }

    fn store_state(&self, il: usize, inputs: &GraphInputs, storage: &mut KvStorage) -> Result<()> {
        let layer = storage.layer(il);
        check_types(layer)?;
        if layer.n_embd_k < 2 {
            return Err(Error::GraphError {
                reason: format!("layer {il} state rows hold {} elements", layer.n_embd_k),
            });
        }
        let ty = layer.type_k;
        let el = ty.block_bytes();
        let nst = inputs.n_seq_tokens;

        for s in 0..inputs.n_seqs {
            let sum: f32 = (0..nst).map(|i| self.value(inputs, s * nst + i)).sum();
            let row = storage.k_rows_mut(il, inputs.kv_head + s, 1);
            let acc = read_elem(ty, &row[..el]) + sum;
            let count = read_elem(ty, &row[el..2 * el]) + nst as f32;
            write_elem(ty, &mut row[..el], acc);
            write_elem(ty, &mut row[el..2 * el], count);
        }
        Ok(())
    }

    fn attend_cache(&self, inputs: &GraphInputs, storage: &KvStorage) -> Result<Features> {
        let n_kv = inputs.n_kv;
        let layer = storage.layer(0);
        let ty = layer.type_v;
        let el = ty.block_bytes();
        let values: Vec<f32> = (0..n_kv)
            .map(|i| {
                let b = if storage.v_trans() {
                    storage.v_elems(0, 0, i, 1)
                } else {
                    &storage.v_rows(0, i, 1)[..el]
                };
                read_elem(ty, b)
            })
            .collect();

        masked_features(inputs, n_kv, &values)
    }

    fn attend_local(&self, inputs: &GraphInputs) -> Result<Features> {
        let values: Vec<f32> = (0..inputs.n_tokens).map(|t| self.value(inputs, t)).collect();
        masked_features(inputs, inputs.n_tokens, &values)
    }

    fn read_states(&self, inputs: &GraphInputs, storage: &KvStorage) -> Result<Features> {
        let ty = storage.layer(0).type_k;
        let el = ty.block_bytes();
        let nst = inputs.n_seq_tokens;
        let mut features = Vec::with_capacity(inputs.n_tokens);

        for s in 0..inputs.n_seqs {
            let row = storage.k_rows(0, inputs.kv_head + s, 1);
            let (mut sum, mut count) = (read_elem(ty, &row[..el]), read_elem(ty, &row[el..2 * el]));
            // the state already includes the whole micro-batch, walk it back
            let mut rows = Vec::with_capacity(nst);
            for i in (0..nst).rev() {
                rows.push((count, sum));
                sum -= self.value(inputs, s * nst + i);
                count -= 1.0;
            }
            rows.reverse();
            features.extend(rows);
        }
        Ok(features)
    }

    fn emit(&self, inputs: &GraphInputs, features: &Features, outputs: &mut GraphOutputs) -> Result<()> {
        let rows: Vec<[f32; 4]> = (0..inputs.n_tokens)
            .map(|t| {
                let (visible, sum) = features[t];
                [visible, sum, self.value(inputs, t), inputs.pos[t] as f32]
            })
            .collect();

        let mut logits = vec![0.0; inputs.n_outputs * self.n_vocab];
        let mut embd = vec![0.0; inputs.n_outputs * self.n_embd];
        for (r, &t) in inputs.out_ids.iter().take(inputs.n_outputs).enumerate() {
            let [visible, sum, value, pos] = *rows.get(t as usize).ok_or_else(|| Error::GraphError {
                reason: format!("output row {t} outside the micro-batch"),
            })?;
            put(&mut logits[r * self.n_vocab..(r + 1) * self.n_vocab], &[visible, sum, value, pos]);
            put(&mut embd[r * self.n_embd..(r + 1) * self.n_embd], &[value, pos, sum, visible]);
        }
        outputs.logits = Some(logits);
        outputs.embd = Some(embd);

        let n_tokens = inputs.n_tokens;
        if !inputs.mean.is_empty() {
            let mut pooled = vec![0.0; n_tokens * self.n_embd];
            for seq in 0..n_tokens {
                let out = &mut pooled[seq * self.n_embd..(seq + 1) * self.n_embd];
                for (t, &[visible, sum, value, pos]) in rows.iter().enumerate() {
                    let w = inputs.mean[seq * n_tokens + t];
                    if w != 0.0 {
                        for (o, x) in out.iter_mut().zip([value, pos, sum, visible]) {
                            *o += w * x;
                        }
                    }
                }
            }
            outputs.embd_pooled = Some(pooled);
        } else if !inputs.cls.is_empty() {
            let mut pooled = vec![0.0; n_tokens * self.n_embd];
            for (seq, &t) in inputs.cls.iter().enumerate() {
                if t >= 0 {
                    let [visible, sum, value, pos] = rows[t as usize];
                    put(
                        &mut pooled[seq * self.n_embd..(seq + 1) * self.n_embd],
                        &[value, pos, sum, visible],
                    );
                }
            }
            outputs.embd_pooled = Some(pooled);
        }
        Ok(())
    }
}

fn masked_features(inputs: &GraphInputs, n_kv: usize, values: &[f32]) -> Result<Features> {
    if inputs.kq_mask.len() < inputs.n_tokens * n_kv {
        return Err(Error::GraphError {
            reason: format!("mask of {} entries for {} tokens", inputs.kq_mask.len(), inputs.n_tokens),
        });
    }
    Ok((0..inputs.n_tokens)
        .map(|t| {
            let row = &inputs.kq_mask[t * n_kv..(t + 1) * n_kv];
            row.iter()
                .zip(values)
                .filter(|&(&m, _)| m == 0.0)
                .fold((0.0, 0.0), |(n, s), (_, &v)| (n + 1.0, s + v))
        })
        .collect())
}

fn check_types(layer: &LayerStorage) -> Result<()> {
    for ty in [layer.type_k, layer.type_v] {
        if ty.is_quantized() {
            return Err(Error::UnsupportedType {
                ty,
                op: "reference store",
            });
        }
    }
    Ok(())
}

fn put(dst: &mut [f32], src: &[f32]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = s;
    }
}
