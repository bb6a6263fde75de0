//! Recurrent-state configuration (Mamba-style SSM and RWKV).
//!
//! Recurrent models keep one fixed-size state per sequence instead of one
//! row per position. The cache stores that state in the key/value rows of
//! the sequence's cell, so these configs only need to describe how wide
//! those rows are.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// SSM (State Space Model) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SsmConfig {
    /// Conv1D kernel size (0 disables the rolling conv state)
    #[serde(default = "default_d_conv")]
    pub d_conv: usize,

    /// Inner (expanded) dimension
    pub d_inner: usize,

    /// SSM state dimension (N)
    pub d_state: usize,
}

fn default_d_conv() -> usize {
    4
}

impl SsmConfig {
    pub fn validate(&self) -> Result<()> {
        if self.d_inner == 0 {
            return Err(Error::ModelError {
                reason: "ssm.d_inner must be > 0".into(),
            });
        }
        if self.d_state == 0 {
            return Err(Error::ModelError {
                reason: "ssm.d_state must be > 0".into(),
            });
        }
        Ok(())
    }

    /// Width of the rolling conv state
    pub fn conv_state_size(&self) -> usize {
        self.d_conv.saturating_sub(1) * self.d_inner
    }

    /// Width of the SSM scan state
    pub fn scan_state_size(&self) -> usize {
        self.d_state * self.d_inner
    }
}

/// RWKV time-mix configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RwkvConfig {
    /// WKV head size
    pub head_size: usize,

    /// Number of token-shift states kept per layer
    #[serde(default = "default_token_shift_count")]
    pub token_shift_count: usize,
}

fn default_token_shift_count() -> usize {
    2
}

impl RwkvConfig {
    pub fn validate(&self, hidden_size: usize) -> Result<()> {
        if self.head_size == 0 || hidden_size % self.head_size != 0 {
            return Err(Error::ModelError {
                reason: format!(
                    "rwkv.head_size ({}) must divide hidden_size ({hidden_size})",
                    self.head_size
                ),
            });
        }
        Ok(())
    }

    pub fn token_shift_size(&self, hidden_size: usize) -> usize {
        self.token_shift_count * hidden_size
    }

    pub fn wkv_state_size(&self, hidden_size: usize) -> usize {
        hidden_size * self.head_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssm_state_sizes() {
        let cfg: SsmConfig = serde_yaml::from_str("d_inner: 1536\nd_state: 16\n").unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.d_conv, 4);
        assert_eq!(cfg.conv_state_size(), 3 * 1536);
        assert_eq!(cfg.scan_state_size(), 16 * 1536);
    }

    #[test]
    fn test_ssm_without_conv() {
        let cfg = SsmConfig {
            d_conv: 0,
            d_inner: 8,
            d_state: 4,
        };
        assert_eq!(cfg.conv_state_size(), 0);
    }

    #[test]
    fn test_rwkv_sizes() {
        let cfg: RwkvConfig = serde_yaml::from_str("head_size: 64\n").unwrap();
        cfg.validate(2048).unwrap();
        assert_eq!(cfg.token_shift_size(2048), 2 * 2048);
        assert_eq!(cfg.wkv_state_size(2048), 2048 * 64);
        assert!(cfg.validate(100).is_err());
    }
}
