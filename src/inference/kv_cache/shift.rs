//! K-shift: re-rotating cached keys after their positions moved.

use super::cache::KvCache;
use super::maintenance::MaintenanceStep;
use crate::inference::graph::{Graph, GraphKind, Node, RopeShift};
use crate::model::{ModelConfig, RopeType};

impl KvCache {
    /// One rotation node per layer; each cell's keys turn by its pending delta
    pub fn build_k_shift_graph(&self, model: &ModelConfig) -> Graph {
        let mut graph = Graph::new(GraphKind::KShift);
        let Some(attn) = &model.attention else {
            return graph;
        };
        if attn.rope == RopeType::None {
            return graph;
        }
        let head_dim = attn.head_dim(model.hidden_size);
        for il in 0..self.storage.n_layer() {
            graph.push(Node::KShift {
                layer: il,
                rope: RopeShift {
                    rope: attn.rope,
                    n_head_kv: attn.kv_heads(il),
                    head_dim,
                    n_rot: attn.rope_dims(model.hidden_size),
                    freq_base: attn.rope_theta,
                    freq_scale: attn.rope_freq_scale,
                },
            });
        }
        graph
    }

    /// Pending shift of every cell, the `k_shift` graph input
    pub fn k_shift_deltas(&self) -> Vec<i32> {
        self.cells
            .iter()
            .map(|c| if c.is_empty() { 0 } else { c.delta })
            .collect()
    }

    /// Forget pending shifts once they have been applied (or need not be)
    pub fn complete_shift(&mut self) {
        for cell in &mut self.cells {
            cell.delta = 0;
        }
        self.maintenance = self.maintenance.complete(MaintenanceStep::Shift);
    }

    /// Leave the defrag-pending state after the plan (if any) was applied
    pub fn complete_defrag(&mut self) {
        self.maintenance = self.maintenance.complete(MaintenanceStep::Defrag);
    }
}
