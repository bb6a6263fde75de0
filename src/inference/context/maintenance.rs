//! Applying deferred cache maintenance through the backend.

use super::Context;
use super::params::default_defrag_max_moves;
use crate::error::Result;
use crate::inference::graph::{Backend, GraphBuilder, GraphInputs};
use crate::inference::kv_cache::MaintenanceStep;
use crate::model::RopeType;

impl<B: Backend, G: GraphBuilder> Context<B, G> {
    /// Schedule a defrag pass before the next slot search
    pub fn kv_cache_defrag(&mut self) {
        self.cache.defrag();
    }

    /// Run every pending maintenance pass: the K-shift first, then defrag.
    ///
    /// Called by `decode` before each slot search; callers may run it
    /// earlier to take the cost outside a latency-sensitive call.
    pub fn kv_cache_update(&mut self) -> Result<()> {
        while let Some(step) = self.cache.maintenance().next_step() {
            match step {
                MaintenanceStep::Shift => self.apply_k_shift()?,
                MaintenanceStep::Defrag => self.apply_defrag()?,
            }
        }
        Ok(())
    }

    fn apply_k_shift(&mut self) -> Result<()> {
        if self.model.rope_type() != RopeType::None {
            let graph = self.cache.build_k_shift_graph(&self.model);
            let inputs = GraphInputs {
                k_shift: self.cache.k_shift_deltas(),
                ..Default::default()
            };
            self.backend
                .compute(&graph, &inputs, self.cache.storage_mut())?;
            tracing::debug!(n_layer = graph.len(), "k-shift applied");
        }
        self.cache.complete_shift();
        Ok(())
    }

    fn apply_defrag(&mut self) -> Result<()> {
        let max_moves = self
            .params
            .defrag_max_moves
            .unwrap_or_else(|| default_defrag_max_moves(&self.model));
        if let Some(plan) = self.cache.plan_defrag(max_moves)? {
            let graph = plan.graph(self.cache.storage());
            self.backend
                .compute(&graph, &GraphInputs::default(), self.cache.storage_mut())?;
            self.cache.apply_defrag(&plan);
        }
        self.cache.complete_defrag();
        Ok(())
    }
}
