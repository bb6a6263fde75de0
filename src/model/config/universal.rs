//! Model description consumed by cache initialization.

use super::attention::{AttentionConfig, RopeType};
use super::ssm::{RwkvConfig, SsmConfig};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How token embeddings are reduced to one vector per sequence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolingType {
    #[default]
    None,
    Mean,
    Cls,
    Last,
}

/// Model configuration
///
/// Only the hyperparameters the cache and the orchestrator depend on: layer
/// count, per-layer key/value widths, recurrent-state widths and the
/// attention flavour. Weights and architecture wiring live elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Architecture name (e.g., "llama", "mamba", "rwkv6"), checked on session load
    pub model_type: String,

    /// Vocabulary size
    pub vocab_size: usize,

    /// Hidden dimension
    pub hidden_size: usize,

    /// Number of layers
    pub num_layers: usize,

    /// Attention configuration (absent for pure recurrent models)
    #[serde(default)]
    pub attention: Option<AttentionConfig>,

    /// Mamba-style SSM configuration
    #[serde(default)]
    pub ssm: Option<SsmConfig>,

    /// RWKV configuration
    #[serde(default)]
    pub rwkv: Option<RwkvConfig>,

    /// Whether attention is causal (false for encoder-only models)
    #[serde(default = "default_causal_attn")]
    pub causal_attn: bool,

    /// Pooling the model was trained with
    #[serde(default)]
    pub pooling: PoolingType,

    /// Number of weight tensors, bounds the graph node budget
    #[serde(default)]
    pub tensor_count: Option<usize>,
}

fn default_causal_attn() -> bool {
    true
}

/// Floor on the graph node budget
const MIN_GRAPH_NODES: usize = 8192;

impl ModelConfig {
    /// Validate configuration constraints
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(Error::ModelError {
                reason: "vocab_size must be > 0".into(),
            });
        }
        if self.hidden_size == 0 {
            return Err(Error::ModelError {
                reason: "hidden_size must be > 0".into(),
            });
        }
        if self.num_layers == 0 {
            return Err(Error::ModelError {
                reason: "num_layers must be > 0".into(),
            });
        }
        if self.ssm.is_some() && self.rwkv.is_some() {
            return Err(Error::ModelError {
                reason: "ssm and rwkv are mutually exclusive".into(),
            });
        }
        if self.attention.is_none() && !self.is_recurrent() {
            return Err(Error::ModelError {
                reason: "one of attention, ssm or rwkv must be configured".into(),
            });
        }
        if let Some(attn) = &self.attention {
            attn.validate(self.hidden_size, self.num_layers)?;
        }
        if let Some(ssm) = &self.ssm {
            ssm.validate()?;
        }
        if let Some(rwkv) = &self.rwkv {
            rwkv.validate(self.hidden_size)?;
        }
        Ok(())
    }

    pub fn load_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::ModelError {
            reason: format!("IO error: {e}"),
        })?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| Error::ModelError {
            reason: format!("YAML parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::ModelError {
            reason: format!("IO error: {e}"),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| Error::ModelError {
            reason: format!("JSON parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Recurrent models keep one state cell per sequence
    pub fn is_recurrent(&self) -> bool {
        self.ssm.is_some() || self.rwkv.is_some()
    }

    pub fn head_dim(&self) -> usize {
        self.attention
            .as_ref()
            .map_or(0, |a| a.head_dim(self.hidden_size))
    }

    pub fn kv_heads(&self, layer: usize) -> usize {
        self.attention.as_ref().map_or(0, |a| a.kv_heads(layer))
    }

    /// Key width of one cached position in layer `il`
    pub fn n_embd_k_gqa(&self, il: usize) -> usize {
        self.head_dim() * self.kv_heads(il)
    }

    /// Value width of one cached position in layer `il`
    pub fn n_embd_v_gqa(&self, il: usize) -> usize {
        self.head_dim() * self.kv_heads(il)
    }

    /// Width of the recurrent state stored in the key rows
    pub fn n_embd_k_s(&self) -> usize {
        if let Some(ssm) = &self.ssm {
            ssm.conv_state_size()
        } else if let Some(rwkv) = &self.rwkv {
            rwkv.token_shift_size(self.hidden_size)
        } else {
            0
        }
    }

    /// Width of the recurrent state stored in the value rows
    pub fn n_embd_v_s(&self) -> usize {
        if let Some(ssm) = &self.ssm {
            ssm.scan_state_size()
        } else if let Some(rwkv) = &self.rwkv {
            rwkv.wkv_state_size(self.hidden_size)
        } else {
            0
        }
    }

    pub fn rope_type(&self) -> RopeType {
        self.attention.as_ref().map_or(RopeType::None, |a| a.rope)
    }

    /// Upper bound on the number of nodes in one graph
    pub fn max_graph_nodes(&self) -> usize {
        MIN_GRAPH_NODES.max(5 * self.tensor_count.unwrap_or(0))
    }
}
