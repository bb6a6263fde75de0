pub mod config;

pub use config::{AttentionConfig, ModelConfig, PoolingType, RopeType, RwkvConfig, SsmConfig};
