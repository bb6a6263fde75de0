//! Graph nodes and the tensors fed into / read out of a graph run.

use crate::inference::kv_cache::CacheTensor;
use crate::inference::types::{Pos, Token};
use crate::model::RopeType;

/// A strided byte window into one layer's key or value buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorView {
    pub layer: usize,
    pub tensor: CacheTensor,
    /// Byte offset of the first row
    pub offset: usize,
    /// Bytes per row
    pub row_bytes: usize,
    pub n_rows: usize,
    /// Bytes between the starts of consecutive rows
    pub stride: usize,
}

/// Rotation applied by a K-shift node
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RopeShift {
    pub rope: RopeType,
    pub n_head_kv: usize,
    pub head_dim: usize,
    pub n_rot: usize,
    pub freq_base: f32,
    pub freq_scale: f32,
}

/// Which result a node produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputTag {
    Logits,
    Embeddings,
    PooledEmbeddings,
}

/// One graph operation
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Copy `src` rows onto `dst` rows (same shape, same buffer kind)
    Copy { src: TensorView, dst: TensorView },
    /// Re-rotate every cached key of `layer` by its cell's `k_shift` entry
    KShift { layer: usize, rope: RopeShift },
    /// Recurrent: gather states of the window from their `s_copy` sources
    StateCopy { layer: usize },
    /// Recurrent: zero states whose `s_mask` entry is 0
    StateMask { layer: usize },
    /// Architecture operation, evaluated by the backend's kernels
    Op { name: String, layer: Option<usize> },
    /// Marks where a result is read from
    Output { tag: OutputTag },
}

impl Node {
    /// Layer a cache node touches, if any
    pub fn layer(&self) -> Option<usize> {
        match self {
            Self::Copy { src, .. } => Some(src.layer),
            Self::KShift { layer, .. }
            | Self::StateCopy { layer }
            | Self::StateMask { layer } => Some(*layer),
            Self::Op { layer, .. } => *layer,
            Self::Output { .. } => None,
        }
    }

    /// Backend nodes this operation expands to (views count as nodes)
    pub fn cost(&self) -> usize {
        match self {
            // source view, destination view, copy
            Self::Copy { .. } => 3,
            _ => 1,
        }
    }
}

/// Purpose of a graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphKind {
    Forward,
    KShift,
    Defrag,
}

/// An ordered list of nodes
#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    kind: GraphKind,
    nodes: Vec<Node>,
}

impl Graph {
    pub fn new(kind: GraphKind) -> Self {
        Self {
            kind,
            nodes: Vec::new(),
        }
    }

    pub fn kind(&self) -> GraphKind {
        self.kind
    }

    pub fn push(&mut self, node: Node) {
        self.nodes.push(node);
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Total backend node count
    pub fn n_nodes(&self) -> usize {
        self.nodes.iter().map(Node::cost).sum()
    }

    pub fn has_output(&self, tag: OutputTag) -> bool {
        self.nodes
            .iter()
            .any(|n| matches!(n, Node::Output { tag: t } if *t == tag))
    }

    /// True when no node depends on another layer's results
    pub fn is_layer_parallel(&self) -> bool {
        self.nodes
            .iter()
            .all(|n| !matches!(n, Node::Op { .. } | Node::Output { .. }))
    }
}

/// Leaf tensors the orchestrator fills before a graph runs
#[derive(Debug, Clone, Default)]
pub struct GraphInputs {
    pub n_tokens: usize,
    pub n_seqs: usize,
    pub n_seq_tokens: usize,
    pub n_outputs: usize,
    /// Token ids, empty for embedding input
    pub tokens: Vec<Token>,
    /// Input embeddings, `n_tokens * n_embd`, empty for token input
    pub embd: Vec<f32>,
    pub pos: Vec<Pos>,
    /// Rows of the micro-batch that produce outputs
    pub out_ids: Vec<i32>,
    /// First cell of the window written by this micro-batch
    pub kv_head: usize,
    /// Window width the mask and state inputs cover
    pub n_kv: usize,
    /// `kq_mask_rows * n_kv` additive attention mask (0 or -inf)
    pub kq_mask: Vec<f32>,
    /// Mask rows, `n_tokens` padded up
    pub kq_mask_rows: usize,
    /// Per-cell pending shift, for K-shift graphs
    pub k_shift: Vec<i32>,
    /// Recurrent: source cell of each window cell's state
    pub s_copy: Vec<i32>,
    /// Recurrent: 0 where the state starts fresh
    pub s_mask: Vec<f32>,
    /// Mean pooling matrix, `n_tokens * n_tokens`, row = sequence id
    pub mean: Vec<f32>,
    /// CLS/LAST pooling: row picked for each sequence id, -1 if none
    pub cls: Vec<i32>,
}

/// Host copies of a graph's results
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphOutputs {
    /// `n_outputs * n_vocab`
    pub logits: Option<Vec<f32>>,
    /// `n_outputs * n_embd`
    pub embd: Option<Vec<f32>>,
    /// One `n_embd` row per sequence id
    pub embd_pooled: Option<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_costs_and_outputs() {
        let view = TensorView {
            layer: 0,
            tensor: CacheTensor::Key,
            offset: 0,
            row_bytes: 8,
            n_rows: 1,
            stride: 8,
        };
        let mut graph = Graph::new(GraphKind::Defrag);
        graph.push(Node::Copy {
            src: view,
            dst: TensorView { offset: 16, ..view },
        });
        graph.push(Node::StateMask { layer: 1 });
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.n_nodes(), 4);
        assert!(graph.is_layer_parallel());
        assert!(!graph.has_output(OutputTag::Logits));

        graph.push(Node::Output {
            tag: OutputTag::Logits,
        });
        assert!(graph.has_output(OutputTag::Logits));
        assert!(!graph.is_layer_parallel());
        assert_eq!(graph.nodes()[1].layer(), Some(1));
    }
}
