//! Batch input types and the sequence-aware splitter.

pub mod input;
pub mod sbatch;
pub mod ubatch;

pub use input::{Batch, BatchInput, ResolvedBatch};
pub use sbatch::{SBatch, SBatchSeq};
pub use ubatch::UBatch;
