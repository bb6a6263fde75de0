//! Attention configuration types.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Attention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttentionConfig {
    pub num_heads: usize,

    #[serde(default)]
    pub num_kv_heads: Option<usize>,

    /// Per-layer KV head counts for models whose layers differ
    #[serde(default)]
    pub layer_kv_heads: Option<Vec<usize>>,

    #[serde(default)]
    pub head_dim: Option<usize>,

    #[serde(default)]
    pub rope: RopeType,

    /// Number of rotated dimensions per head (defaults to the head dim)
    #[serde(default)]
    pub rope_dims: Option<usize>,

    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,

    #[serde(default = "default_rope_freq_scale")]
    pub rope_freq_scale: f32,
}

/// How positions are rotated into keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RopeType {
    /// No rotary embedding; cached keys never need re-rotation
    None,
    /// Adjacent element pairs are rotated
    #[default]
    Norm,
    /// Halves of the rotated dims are paired (GPT-NeoX layout)
    Neox,
}

fn default_rope_theta() -> f32 {
    10000.0
}

fn default_rope_freq_scale() -> f32 {
    1.0
}

impl AttentionConfig {
    pub fn validate(&self, hidden_size: usize, num_layers: usize) -> Result<()> {
        if self.num_heads == 0 {
            return Err(Error::ModelError {
                reason: "num_heads must be > 0".into(),
            });
        }
        if self.head_dim.is_none() && hidden_size % self.num_heads != 0 {
            return Err(Error::ModelError {
                reason: format!(
                    "hidden_size ({hidden_size}) must be divisible by num_heads ({})",
                    self.num_heads
                ),
            });
        }
        if let Some(kv) = self.num_kv_heads {
            if kv == 0 || self.num_heads % kv != 0 {
                return Err(Error::ModelError {
                    reason: format!(
                        "num_heads ({}) must be divisible by num_kv_heads ({kv})",
                        self.num_heads
                    ),
                });
            }
        }
        if let Some(layers) = &self.layer_kv_heads {
            if layers.len() != num_layers {
                return Err(Error::ModelError {
                    reason: format!(
                        "layer_kv_heads has {} entries, expected {num_layers}",
                        layers.len()
                    ),
                });
            }
        }
        let head_dim = self.head_dim(hidden_size);
        if let Some(dims) = self.rope_dims {
            if dims > head_dim || dims % 2 != 0 {
                return Err(Error::ModelError {
                    reason: format!(
                        "rope_dims ({dims}) must be even and <= head_dim ({head_dim})"
                    ),
                });
            }
        }
        Ok(())
    }

    pub fn head_dim(&self, hidden_size: usize) -> usize {
        self.head_dim.unwrap_or(hidden_size / self.num_heads)
    }

    pub fn kv_heads(&self, layer: usize) -> usize {
        match &self.layer_kv_heads {
            Some(layers) => layers[layer],
            None => self.num_kv_heads.unwrap_or(self.num_heads),
        }
    }

    pub fn rope_dims(&self, hidden_size: usize) -> usize {
        self.rope_dims.unwrap_or_else(|| self.head_dim(hidden_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attn(num_heads: usize, num_kv_heads: Option<usize>) -> AttentionConfig {
        AttentionConfig {
            num_heads,
            num_kv_heads,
            layer_kv_heads: None,
            head_dim: None,
            rope: RopeType::Norm,
            rope_dims: None,
            rope_theta: 10000.0,
            rope_freq_scale: 1.0,
        }
    }

    #[test]
    fn test_gqa_heads() {
        let cfg = attn(32, Some(8));
        cfg.validate(4096, 2).unwrap();
        assert_eq!(cfg.kv_heads(0), 8);
        assert_eq!(cfg.head_dim(4096), 128);
        assert_eq!(cfg.rope_dims(4096), 128);
    }

    #[test]
    fn test_bad_kv_heads() {
        assert!(attn(32, Some(5)).validate(4096, 2).is_err());
        assert!(attn(32, Some(0)).validate(4096, 2).is_err());
    }

    #[test]
    fn test_layer_kv_heads_length() {
        let mut cfg = attn(4, None);
        cfg.layer_kv_heads = Some(vec![4, 2]);
        assert!(cfg.validate(256, 3).is_err());
        cfg.validate(256, 2).unwrap();
        assert_eq!(cfg.kv_heads(1), 2);
    }
}
