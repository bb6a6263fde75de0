//! Seams to the architecture code and the execution backend.

use super::ops::{Graph, GraphInputs, GraphOutputs};
use crate::error::Result;
use crate::inference::batch::UBatch;
use crate::inference::kv_cache::KvStorage;

/// The part of the cache a forward graph may touch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheWindow {
    /// First cell written by the micro-batch
    pub head: usize,
    /// Cells attended to (attention) or the recurrent window width
    pub n_kv: usize,
    /// Total cells
    pub size: usize,
    pub recurrent: bool,
    pub v_trans: bool,
}

/// Builds the forward graph of one micro-batch
///
/// Implemented by architecture code. The returned graph reads the leaf
/// tensors in [`GraphInputs`] and tags its results with
/// [`Node::Output`](super::Node::Output).
pub trait GraphBuilder {
    fn build_forward(
        &mut self,
        ubatch: &UBatch,
        window: &CacheWindow,
        n_outputs: usize,
    ) -> Result<Graph>;
}

/// Executes graphs against the cache storage
pub trait Backend {
    /// Run `graph` to completion and copy its tagged results to the host
    fn compute(
        &mut self,
        graph: &Graph,
        inputs: &GraphInputs,
        storage: &mut KvStorage,
    ) -> Result<GraphOutputs>;

    /// Wait for queued work
    fn synchronize(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<B: Backend + ?Sized> Backend for &mut B {
    fn compute(
        &mut self,
        graph: &Graph,
        inputs: &GraphInputs,
        storage: &mut KvStorage,
    ) -> Result<GraphOutputs> {
        (**self).compute(graph, inputs, storage)
    }

    fn synchronize(&mut self) -> Result<()> {
        (**self).synchronize()
    }
}

impl<G: GraphBuilder + ?Sized> GraphBuilder for &mut G {
    fn build_forward(
        &mut self,
        ubatch: &UBatch,
        window: &CacheWindow,
        n_outputs: usize,
    ) -> Result<Graph> {
        (**self).build_forward(ubatch, window, n_outputs)
    }
}
