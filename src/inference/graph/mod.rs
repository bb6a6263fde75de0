//! Compute-graph plumbing between the orchestrator, the architecture code
//! and the execution backend.

pub mod builder;
pub mod cpu;
pub mod ops;

pub use builder::{Backend, CacheWindow, GraphBuilder};
pub use cpu::{CpuBackend, CpuBackendStats, NoKernel, OpKernel};
pub use ops::{Graph, GraphInputs, GraphKind, GraphOutputs, Node, OutputTag, RopeShift, TensorView};
