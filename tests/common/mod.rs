//! Shared helpers for seqcache integration tests.
#![allow(dead_code)]

use seqcache::inference::types::{Pos, SeqId, Token};
use seqcache::inference::{Batch, Context, ContextParams, CpuBackend, ReferenceModel};
use seqcache::{GgmlType, ModelConfig};

pub type RefContext = Context<CpuBackend<ReferenceModel>, ReferenceModel>;

pub const N_VOCAB: usize = 16;

pub fn llama() -> ModelConfig {
    serde_yaml::from_str(
        r#"
model_type: llama
vocab_size: 16
hidden_size: 8
num_layers: 2
attention:
  num_heads: 2
"#,
    )
    .unwrap()
}

pub fn mamba() -> ModelConfig {
    serde_yaml::from_str(
        r#"
model_type: mamba
vocab_size: 16
hidden_size: 4
num_layers: 2
ssm:
  d_inner: 4
  d_state: 2
"#,
    )
    .unwrap()
}

pub fn bert() -> ModelConfig {
    serde_yaml::from_str(
        r#"
model_type: bert
vocab_size: 16
hidden_size: 4
num_layers: 1
causal_attn: false
pooling: mean
attention:
  num_heads: 1
  rope: none
"#,
    )
    .unwrap()
}

pub fn params(n_ctx: usize) -> ContextParams {
    ContextParams {
        n_ctx,
        type_k: GgmlType::F32,
        type_v: GgmlType::F32,
        ..Default::default()
    }
}

pub fn context(model: &ModelConfig, params: ContextParams) -> RefContext {
    Context::new(
        model.clone(),
        params,
        CpuBackend::with_kernel(ReferenceModel::new(model)),
        ReferenceModel::new(model),
    )
    .unwrap()
}

/// `tokens` of one sequence at consecutive positions from `p0`, last token
/// marked for output
pub fn seq_batch(seq_id: SeqId, tokens: &[Token], p0: Pos) -> Batch {
    let mut batch = Batch::new();
    append(&mut batch, seq_id, tokens, p0);
    batch
}

pub fn append(batch: &mut Batch, seq_id: SeqId, tokens: &[Token], p0: Pos) {
    for (i, &t) in tokens.iter().enumerate() {
        batch
            .add(t, p0 + i as Pos, &[seq_id], i + 1 == tokens.len())
            .unwrap();
    }
}

/// `[visible, sum, value, pos]` head of a reference logits row
pub fn head(row: &[f32]) -> [f32; 4] {
    [row[0], row[1], row[2], row[3]]
}
