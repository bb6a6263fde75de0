//! Per-layer key/value byte storage.
//!
//! Keys are stored row-major, one row per cell. Values are either row-major
//! as well or transposed (one row per embedding element, one column per
//! cell), which is what the non-fused attention kernels read.

use crate::error::{Error, Result};
use crate::format::GgmlType;
use crate::model::ModelConfig;

/// Which of the two per-layer tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTensor {
    Key,
    Value,
}

/// Key and value buffers of one layer
#[derive(Debug, Clone)]
pub struct LayerStorage {
    pub type_k: GgmlType,
    pub type_v: GgmlType,
    /// Elements per key row
    pub n_embd_k: usize,
    /// Elements per value row
    pub n_embd_v: usize,
    k: Vec<u8>,
    v: Vec<u8>,
}

impl LayerStorage {
    pub fn k_row_size(&self) -> usize {
        self.type_k.row_size(self.n_embd_k)
    }

    pub fn v_row_size(&self) -> usize {
        self.type_v.row_size(self.n_embd_v)
    }

    /// Bytes per value element (transposed layout only)
    pub fn v_elem_size(&self) -> usize {
        self.type_v.block_bytes()
    }

    pub fn k(&self) -> &[u8] {
        &self.k
    }

    pub fn k_mut(&mut self) -> &mut [u8] {
        &mut self.k
    }

    pub fn v(&self) -> &[u8] {
        &self.v
    }

    pub fn v_mut(&mut self) -> &mut [u8] {
        &mut self.v
    }

    pub fn tensor(&self, t: CacheTensor) -> &[u8] {
        match t {
            CacheTensor::Key => &self.k,
            CacheTensor::Value => &self.v,
        }
    }

    pub fn tensor_mut(&mut self, t: CacheTensor) -> &mut [u8] {
        match t {
            CacheTensor::Key => &mut self.k,
            CacheTensor::Value => &mut self.v,
        }
    }

    /// Both buffers at once, for ops that read one while writing the other
    pub fn split_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        (&mut self.k, &mut self.v)
    }
}

/// Key/value storage for every layer of one cache
#[derive(Debug, Clone)]
pub struct KvStorage {
    layers: Vec<LayerStorage>,
    size: usize,
    v_trans: bool,
}

impl KvStorage {
    /// Allocate zeroed storage for `size` cells.
    ///
    /// Row widths are the per-layer attention widths plus the recurrent
    /// state widths, so one layout serves both cache kinds.
    pub fn new(
        model: &ModelConfig,
        size: usize,
        type_k: GgmlType,
        type_v: GgmlType,
        v_trans: bool,
    ) -> Result<Self> {
        if v_trans && type_v.is_quantized() {
            return Err(Error::InvalidArgument {
                arg: "type_v",
                reason: format!("{type_v} cannot be stored transposed"),
            });
        }

        let mut layers = Vec::with_capacity(model.num_layers);
        for il in 0..model.num_layers {
            let n_embd_k = model.n_embd_k_gqa(il) + model.n_embd_k_s();
            let n_embd_v = model.n_embd_v_gqa(il) + model.n_embd_v_s();
            for (arg, ty, n) in [("type_k", type_k, n_embd_k), ("type_v", type_v, n_embd_v)] {
                if n % ty.block_size() != 0 {
                    return Err(Error::InvalidArgument {
                        arg,
                        reason: format!(
                            "layer {il} width {n} is not a multiple of the {ty} block size ({})",
                            ty.block_size()
                        ),
                    });
                }
            }
            layers.push(LayerStorage {
                type_k,
                type_v,
                n_embd_k,
                n_embd_v,
                k: vec![0; type_k.row_size(n_embd_k) * size],
                v: vec![0; type_v.row_size(n_embd_v) * size],
            });
        }

        Ok(Self {
            layers,
            size,
            v_trans,
        })
    }

    pub fn n_layer(&self) -> usize {
        self.layers.len()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn v_trans(&self) -> bool {
        self.v_trans
    }

    pub fn layer(&self, il: usize) -> &LayerStorage {
        &self.layers[il]
    }

    pub fn layer_mut(&mut self, il: usize) -> &mut LayerStorage {
        &mut self.layers[il]
    }

    pub fn layers(&self) -> &[LayerStorage] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [LayerStorage] {
        &mut self.layers
    }

    pub fn total_bytes(&self) -> usize {
        self.layers.iter().map(|l| l.k.len() + l.v.len()).sum()
    }

    /// Zero every buffer
    pub fn clear(&mut self) {
        for layer in &mut self.layers {
            layer.k.fill(0);
            layer.v.fill(0);
        }
    }

    /// Key rows of cells `first..first + n`
    pub fn k_rows(&self, il: usize, first: usize, n: usize) -> &[u8] {
        let layer = &self.layers[il];
        let row = layer.k_row_size();
        &layer.k[first * row..(first + n) * row]
    }

    pub fn k_rows_mut(&mut self, il: usize, first: usize, n: usize) -> &mut [u8] {
        let layer = &mut self.layers[il];
        let row = layer.k_row_size();
        &mut layer.k[first * row..(first + n) * row]
    }

    /// Value rows of cells `first..first + n` (row-major layout)
    pub fn v_rows(&self, il: usize, first: usize, n: usize) -> &[u8] {
        debug_assert!(!self.v_trans);
        let layer = &self.layers[il];
        let row = layer.v_row_size();
        &layer.v[first * row..(first + n) * row]
    }

    pub fn v_rows_mut(&mut self, il: usize, first: usize, n: usize) -> &mut [u8] {
        debug_assert!(!self.v_trans);
        let layer = &mut self.layers[il];
        let row = layer.v_row_size();
        &mut layer.v[first * row..(first + n) * row]
    }

    /// Element `j` of cells `first..first + n` (transposed layout)
    pub fn v_elems(&self, il: usize, j: usize, first: usize, n: usize) -> &[u8] {
        debug_assert!(self.v_trans);
        let layer = &self.layers[il];
        let el = layer.v_elem_size();
        let start = (j * self.size + first) * el;
        &layer.v[start..start + n * el]
    }

    pub fn v_elems_mut(&mut self, il: usize, j: usize, first: usize, n: usize) -> &mut [u8] {
        debug_assert!(self.v_trans);
        let size = self.size;
        let layer = &mut self.layers[il];
        let el = layer.v_elem_size();
        let start = (j * size + first) * el;
        &mut layer.v[start..start + n * el]
    }

    /// Everything stored for cell `i` in layer `il`, as (key bytes, value bytes)
    pub fn cell_bytes(&self, il: usize, i: usize) -> (Vec<u8>, Vec<u8>) {
        let k = self.k_rows(il, i, 1).to_vec();
        let v = if self.v_trans {
            let n_embd_v = self.layers[il].n_embd_v;
            (0..n_embd_v)
                .flat_map(|j| self.v_elems(il, j, i, 1).iter().copied())
                .collect()
        } else {
            self.v_rows(il, i, 1).to_vec()
        };
        (k, v)
    }

    /// Overwrite cell `i` of layer `il` with bytes shaped like [`Self::cell_bytes`]
    pub fn write_cell(&mut self, il: usize, i: usize, k: &[u8], v: &[u8]) {
        self.k_rows_mut(il, i, 1).copy_from_slice(k);
        if self.v_trans {
            let el = self.layers[il].v_elem_size();
            let n_embd_v = self.layers[il].n_embd_v;
            for j in 0..n_embd_v {
                self.v_elems_mut(il, j, i, 1)
                    .copy_from_slice(&v[j * el..(j + 1) * el]);
            }
        } else {
            self.v_rows_mut(il, i, 1).copy_from_slice(v);
        }
    }
}
