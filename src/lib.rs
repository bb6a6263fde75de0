//! # seqcache
//!
//! **Sequence-aware key/value cache for autoregressive inference.**
//!
//! seqcache manages the cache cells a transformer (or a recurrent model)
//! writes while decoding several independent sequences at once, and drives
//! the decode loop around it:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Context   decode / encode, outputs, session persistence  │
//! ├──────────────────────────────────────────────────────────┤
//! │ SBatch    splits a batch into micro-batches              │
//! │ KvCache   slots, sequence ops, shift, defrag             │
//! ├──────────────────────────────────────────────────────────┤
//! │ GraphBuilder / Backend   architecture and execution      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design
//!
//! - **Cells, not pages**: one cell per cached position (attention) or one
//!   state cell per sequence (recurrent), shared between sequences by id
//! - **Deferred maintenance**: position shifts and defragmentation are
//!   recorded on the cache and executed before the next forward pass
//! - **Pluggable execution**: graphs are plain node lists run by a
//!   [`Backend`]; [`CpuBackend`] executes the cache nodes on host memory

pub mod error;
pub mod format;
pub mod inference;
pub mod model;

pub use error::{Error, Result};
pub use format::GgmlType;
pub use inference::{
    Backend, Batch, Context, ContextParams, CpuBackend, DecodeError, GraphBuilder, KvCache,
    KvCacheConfig, ReferenceModel,
};
pub use model::{ModelConfig, PoolingType};
