//! Sequence-aware KV cache and the decode loop around it.

pub mod batch;
pub mod context;
pub mod graph;
pub mod kv_cache;
pub mod reference;
pub mod state;
pub mod types;

pub use batch::{Batch, BatchInput, ResolvedBatch, SBatch, UBatch};
pub use context::{Context, ContextParams, DecodeError};
pub use graph::{Backend, CacheWindow, CpuBackend, GraphBuilder, OpKernel};
pub use kv_cache::{DiscontinuityPolicy, KvCache, KvCacheConfig, KvCacheView};
pub use reference::ReferenceModel;
pub use types::{EMPTY_POS, Pos, SeqId, Token};
