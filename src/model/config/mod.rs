pub mod attention;
pub mod ssm;
pub mod universal;

pub use attention::{AttentionConfig, RopeType};
pub use ssm::{RwkvConfig, SsmConfig};
pub use universal::{ModelConfig, PoolingType};
