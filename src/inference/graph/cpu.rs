//! Host-memory backend.
//!
//! Executes the cache maintenance nodes (copies, K-shift rotation,
//! recurrent state gather/mask) directly on the byte buffers and hands
//! architecture ops to an [`OpKernel`]. Graphs made only of cache nodes are
//! independent per layer and run with one rayon task per layer.

use super::builder::Backend;
use super::ops::{Graph, GraphInputs, GraphKind, GraphOutputs, Node, RopeShift, TensorView};
use crate::error::{Error, Result};
use crate::format::GgmlType;
use crate::inference::kv_cache::{CacheTensor, KvStorage, LayerStorage};
use crate::model::RopeType;
use rayon::prelude::*;

/// Evaluates the architecture ops of a forward graph
pub trait OpKernel {
    fn eval(
        &mut self,
        name: &str,
        layer: Option<usize>,
        inputs: &GraphInputs,
        storage: &mut KvStorage,
        outputs: &mut GraphOutputs,
    ) -> Result<()>;
}

/// Kernel set for backends that only run maintenance graphs
#[derive(Debug, Clone, Copy, Default)]
pub struct NoKernel;

impl OpKernel for NoKernel {
    fn eval(
        &mut self,
        name: &str,
        _layer: Option<usize>,
        _inputs: &GraphInputs,
        _storage: &mut KvStorage,
        _outputs: &mut GraphOutputs,
    ) -> Result<()> {
        Err(Error::BackendError {
            reason: format!("no kernel for op '{name}'"),
        })
    }
}

/// Graph execution counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuBackendStats {
    pub forward_graphs: usize,
    pub shift_graphs: usize,
    pub defrag_graphs: usize,
    /// Backend nodes executed across all graphs
    pub nodes: usize,
}

/// Reference backend over host buffers
#[derive(Debug, Default)]
pub struct CpuBackend<K = NoKernel> {
    kernel: K,
    stats: CpuBackendStats,
}

impl CpuBackend<NoKernel> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<K: OpKernel> CpuBackend<K> {
    pub fn with_kernel(kernel: K) -> Self {
        Self {
            kernel,
            stats: CpuBackendStats::default(),
        }
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut K {
        &mut self.kernel
    }

    pub fn stats(&self) -> &CpuBackendStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = CpuBackendStats::default();
    }
}

impl<K: OpKernel> Backend for CpuBackend<K> {
    fn compute(
        &mut self,
        graph: &Graph,
        inputs: &GraphInputs,
        storage: &mut KvStorage,
    ) -> Result<GraphOutputs> {
        match graph.kind() {
            GraphKind::Forward => self.stats.forward_graphs += 1,
            GraphKind::KShift => self.stats.shift_graphs += 1,
            GraphKind::Defrag => self.stats.defrag_graphs += 1,
        }
        self.stats.nodes += graph.n_nodes();

        let size = storage.size();
        let mut outputs = GraphOutputs::default();

        if graph.is_layer_parallel() {
            storage
                .layers_mut()
                .par_iter_mut()
                .enumerate()
                .try_for_each(|(il, layer)| {
                    graph
                        .nodes()
                        .iter()
                        .filter(|n| n.layer() == Some(il))
                        .try_for_each(|node| exec_cache_node(node, layer, size, inputs))
                })?;
            return Ok(outputs);
        }

        for node in graph.nodes() {
            match node {
                Node::Op { name, layer } => {
                    self.kernel
                        .eval(name, *layer, inputs, storage, &mut outputs)?;
                }
                Node::Output { .. } => {}
                cache_node => {
                    let il = layer_of(cache_node, storage.n_layer())?;
                    exec_cache_node(cache_node, storage.layer_mut(il), size, inputs)?;
                }
            }
        }
        Ok(outputs)
    }
}

fn layer_of(node: &Node, n_layer: usize) -> Result<usize> {
    match node.layer() {
        Some(il) if il < n_layer => Ok(il),
        other => Err(Error::GraphError {
            reason: format!("node {node:?} refers to layer {other:?} of {n_layer}"),
        }),
    }
}

fn exec_cache_node(
    node: &Node,
    layer: &mut LayerStorage,
    size: usize,
    inputs: &GraphInputs,
) -> Result<()> {
    match node {
        Node::Copy { src, dst } => copy_view(layer, src, dst),
        Node::KShift { rope, .. } => rope_shift(layer, size, &inputs.k_shift, rope),
        Node::StateCopy { .. } => gather_states(layer, size, inputs),
        Node::StateMask { .. } => mask_states(layer, inputs),
        Node::Op { name, .. } => Err(Error::GraphError {
            reason: format!("op '{name}' in a maintenance graph"),
        }),
        Node::Output { .. } => Ok(()),
    }
}

fn copy_view(layer: &mut LayerStorage, src: &TensorView, dst: &TensorView) -> Result<()> {
    if src.tensor != dst.tensor || src.row_bytes != dst.row_bytes || src.n_rows != dst.n_rows {
        return Err(Error::GraphError {
            reason: format!("copy between mismatched views {src:?} -> {dst:?}"),
        });
    }
    let buf = layer.tensor_mut(src.tensor);
    for r in 0..src.n_rows {
        let s = src.offset + r * src.stride;
        let d = dst.offset + r * dst.stride;
        if s + src.row_bytes > buf.len() || d + dst.row_bytes > buf.len() {
            return Err(Error::GraphError {
                reason: format!("copy row {r} out of bounds ({} bytes)", buf.len()),
            });
        }
        buf.copy_within(s..s + src.row_bytes, d);
    }
    Ok(())
}

pub(crate) fn read_elem(ty: GgmlType, b: &[u8]) -> f32 {
    match ty {
        GgmlType::F16 => half::f16::from_le_bytes([b[0], b[1]]).to_f32(),
        GgmlType::BF16 => half::bf16::from_le_bytes([b[0], b[1]]).to_f32(),
        _ => f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
    }
}

pub(crate) fn write_elem(ty: GgmlType, b: &mut [u8], x: f32) {
    match ty {
        GgmlType::F16 => b[..2].copy_from_slice(&half::f16::from_f32(x).to_le_bytes()),
        GgmlType::BF16 => b[..2].copy_from_slice(&half::bf16::from_f32(x).to_le_bytes()),
        _ => b[..4].copy_from_slice(&x.to_le_bytes()),
    }
}

fn rope_shift(
    layer: &mut LayerStorage,
    size: usize,
    k_shift: &[i32],
    rope: &RopeShift,
) -> Result<()> {
    if rope.rope == RopeType::None {
        return Ok(());
    }
    let ty = layer.type_k;
    if ty.is_quantized() {
        return Err(Error::UnsupportedType { ty, op: "k-shift" });
    }
    let el = ty.block_bytes();
    let row = layer.k_row_size();
    let half_rot = rope.n_rot / 2;
    let k = layer.k_mut();

    for (cell, &delta) in k_shift.iter().enumerate().take(size) {
        if delta == 0 {
            continue;
        }
        let p = delta as f32 * rope.freq_scale;
        for h in 0..rope.n_head_kv {
            let base = cell * row + h * rope.head_dim * el;
            for j in 0..half_rot {
                let theta = p * rope.freq_base.powf(-2.0 * j as f32 / rope.n_rot as f32);
                let (sin, cos) = theta.sin_cos();
                let (a, b) = match rope.rope {
                    RopeType::Neox => (j, j + half_rot),
                    _ => (2 * j, 2 * j + 1),
                };
                let (ia, ib) = (base + a * el, base + b * el);
                let x0 = read_elem(ty, &k[ia..]);
                let x1 = read_elem(ty, &k[ib..]);
                write_elem(ty, &mut k[ia..], x0 * cos - x1 * sin);
                write_elem(ty, &mut k[ib..], x0 * sin + x1 * cos);
            }
        }
    }
    Ok(())
}

fn gather_states(layer: &mut LayerStorage, size: usize, inputs: &GraphInputs) -> Result<()> {
    let head = inputs.kv_head;
    for tensor in [CacheTensor::Key, CacheTensor::Value] {
        let row = match tensor {
            CacheTensor::Key => layer.k_row_size(),
            CacheTensor::Value => layer.v_row_size(),
        };
        let buf = layer.tensor_mut(tensor);
        let mut gathered = Vec::with_capacity(inputs.n_kv * row);
        for &src in &inputs.s_copy[..inputs.n_kv] {
            let src = usize::try_from(src)
                .ok()
                .filter(|&s| s < size)
                .ok_or_else(|| Error::GraphError {
                    reason: format!("state copy source {src} out of range"),
                })?;
            gathered.extend_from_slice(&buf[src * row..(src + 1) * row]);
        }
        buf[head * row..(head + inputs.n_kv) * row].copy_from_slice(&gathered);
    }
    Ok(())
}

fn mask_states(layer: &mut LayerStorage, inputs: &GraphInputs) -> Result<()> {
    let head = inputs.kv_head;
    let (k_row, v_row) = (layer.k_row_size(), layer.v_row_size());
    let (k, v) = layer.split_mut();
    for (i, &m) in inputs.s_mask[..inputs.n_kv].iter().enumerate() {
        if m == 0.0 {
            let cell = head + i;
            k[cell * k_row..(cell + 1) * k_row].fill(0);
            v[cell * v_row..(cell + 1) * v_row].fill(0);
        }
    }
    Ok(())
}
