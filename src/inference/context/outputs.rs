//! Host-side output buffers of a context.

use crate::error::{Error, Result};
use crate::inference::types::SeqId;
use std::collections::BTreeMap;

/// Logits and embeddings of the last decode call
#[derive(Debug, Clone, Default)]
pub(crate) struct Outputs {
    pub n_vocab: usize,
    pub n_embd: usize,
    pub logits: Vec<f32>,
    pub embd: Vec<f32>,
    /// Batch index to output row, -1 for tokens without output
    pub output_ids: Vec<i32>,
    /// Rows filled by the last call
    pub n_outputs: usize,
    /// Rows the buffers have room for
    pub capacity: usize,
    pub has_logits: bool,
    pub has_embd: bool,
    /// Pooled embedding per sequence
    pub embd_seq: BTreeMap<SeqId, Vec<f32>>,
}

impl Outputs {
    pub fn new(n_vocab: usize, n_embd: usize) -> Self {
        Self {
            n_vocab,
            n_embd,
            ..Default::default()
        }
    }

    /// Size the buffers for `n_outputs` rows (at least `n_seq_max`) and
    /// reset the batch mapping. Returns the row capacity.
    pub fn reserve(
        &mut self,
        n_outputs: usize,
        n_batch: usize,
        n_seq_max: usize,
        has_logits: bool,
        has_embd: bool,
    ) -> Result<usize> {
        let n_outputs_max = n_outputs.max(n_seq_max);
        self.has_logits = has_logits;
        self.has_embd = has_embd;

        let logits_len = if has_logits { self.n_vocab * n_outputs_max } else { 0 };
        let embd_len = if has_embd { self.n_embd * n_outputs_max } else { 0 };
        grow(&mut self.logits, logits_len)?;
        grow(&mut self.embd, embd_len)?;
        self.logits.fill(0.0);
        self.embd.fill(0.0);

        self.output_ids.clear();
        self.output_ids.resize(n_batch.max(n_outputs), -1);
        self.capacity = n_outputs_max;
        self.n_outputs = 0;
        Ok(n_outputs_max)
    }

    pub fn write_logits(&mut self, row: usize, data: &[f32]) -> Result<()> {
        let start = row * self.n_vocab;
        write_rows(&mut self.logits, start, data, "logits")
    }

    pub fn write_embd(&mut self, row: usize, data: &[f32]) -> Result<()> {
        let start = row * self.n_embd;
        write_rows(&mut self.embd, start, data, "embeddings")
    }

    /// Record where each output went; rows are in production order
    pub fn map_outputs(&mut self, out_ids: &[usize]) {
        for (row, &id) in out_ids.iter().enumerate() {
            self.output_ids[id] = row as i32;
        }
        self.n_outputs = out_ids.len();
    }

    /// Permute rows into batch order.
    ///
    /// Selection sort over `out_ids`: rows are long, so the number of swaps
    /// matters more than the number of comparisons.
    pub fn reorder(&mut self, out_ids: &mut [usize]) {
        let n = out_ids.len();
        if out_ids.iter().enumerate().all(|(i, &id)| i == 0 || out_ids[i - 1] < id) {
            return;
        }
        for i in 0..n.saturating_sub(1) {
            let mut j_min = i;
            for j in i + 1..n {
                if out_ids[j] < out_ids[j_min] {
                    j_min = j;
                }
            }
            if j_min == i {
                continue;
            }
            out_ids.swap(i, j_min);
            if !self.logits.is_empty() {
                swap_rows(&mut self.logits, self.n_vocab, i, j_min);
            }
            if !self.embd.is_empty() {
                swap_rows(&mut self.embd, self.n_embd, i, j_min);
            }
        }
        self.output_ids.fill(-1);
        for (row, &id) in out_ids.iter().enumerate() {
            self.output_ids[id] = row as i32;
        }
    }

    /// Row of batch token `i`; negative `i` counts back from the last output
    pub fn row(&self, i: i32) -> Result<usize> {
        let j = if i < 0 {
            let j = self.n_outputs as i64 + i as i64;
            if j < 0 {
                return Err(Error::InvalidArgument {
                    arg: "i",
                    reason: format!("negative index out of range [-{}, 0)", self.n_outputs),
                });
            }
            j
        } else {
            let Some(&j) = self.output_ids.get(i as usize) else {
                return Err(Error::InvalidArgument {
                    arg: "i",
                    reason: format!("out of range [0, {})", self.output_ids.len()),
                });
            };
            if j < 0 {
                return Err(Error::InvalidArgument {
                    arg: "i",
                    reason: format!("batch token {i} has no output"),
                });
            }
            j as i64
        };
        if j as usize >= self.n_outputs {
            return Err(Error::InvalidArgument {
                arg: "i",
                reason: format!("corrupt output buffer (j={j}, n_outputs={})", self.n_outputs),
            });
        }
        Ok(j as usize)
    }

    pub fn logits_ith(&self, i: i32) -> Result<&[f32]> {
        if !self.has_logits {
            return Err(Error::InvalidArgument {
                arg: "i",
                reason: "no logits were requested".into(),
            });
        }
        let j = self.row(i)?;
        Ok(&self.logits[j * self.n_vocab..(j + 1) * self.n_vocab])
    }

    pub fn embeddings_ith(&self, i: i32) -> Result<&[f32]> {
        if !self.has_embd {
            return Err(Error::InvalidArgument {
                arg: "i",
                reason: "no token embeddings were requested".into(),
            });
        }
        let j = self.row(i)?;
        Ok(&self.embd[j * self.n_embd..(j + 1) * self.n_embd])
    }

    /// Output rows of the last call in batch order, as one slice
    pub fn logits(&self) -> &[f32] {
        let n = (self.n_outputs * self.n_vocab).min(self.logits.len());
        &self.logits[..n]
    }

    pub fn embeddings(&self) -> &[f32] {
        let n = (self.n_outputs * self.n_embd).min(self.embd.len());
        &self.embd[..n]
    }

    /// Forget the rows of the last call
    pub fn discard(&mut self) {
        self.output_ids.fill(-1);
        self.n_outputs = 0;
        self.embd_seq.clear();
    }

    /// For each output row, the batch index it belongs to
    pub fn output_positions(&self) -> Vec<i32> {
        let mut pos = vec![0; self.n_outputs];
        for (i, &row) in self.output_ids.iter().enumerate() {
            if row >= 0 && (row as usize) < self.n_outputs {
                pos[row as usize] = i as i32;
            }
        }
        pos
    }
}

fn grow(buf: &mut Vec<f32>, len: usize) -> Result<()> {
    if buf.len() < len {
        buf.try_reserve_exact(len - buf.len())
            .map_err(|e| Error::BackendError {
                reason: format!("failed to allocate output buffer of {len} floats: {e}"),
            })?;
    }
    buf.resize(len, 0.0);
    Ok(())
}

fn write_rows(buf: &mut [f32], start: usize, data: &[f32], what: &str) -> Result<()> {
    let end = start + data.len();
    if end > buf.len() {
        return Err(Error::BackendError {
            reason: format!("{what} rows end at {end}, buffer holds {}", buf.len()),
        });
    }
    buf[start..end].copy_from_slice(data);
    Ok(())
}

fn swap_rows(buf: &mut [f32], width: usize, a: usize, b: usize) {
    let (lo, hi) = (a.min(b), a.max(b));
    let (head, tail) = buf.split_at_mut(hi * width);
    head[lo * width..(lo + 1) * width].swap_with_slice(&mut tail[..width]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reorder_restores_batch_order() {
        let mut out = Outputs::new(2, 0);
        out.reserve(3, 8, 1, true, false).unwrap();
        // rows were produced for batch tokens 5, 1, 3
        for (row, v) in [5.0, 1.0, 3.0].into_iter().enumerate() {
            out.write_logits(row, &[v, -v]).unwrap();
        }
        let mut out_ids = vec![5, 1, 3];
        out.map_outputs(&out_ids);
        out.reorder(&mut out_ids);

        assert_eq!(out_ids, vec![1, 3, 5]);
        assert_eq!(out.logits(), &[1.0, -1.0, 3.0, -3.0, 5.0, -5.0]);
        assert_eq!(out.logits_ith(5).unwrap(), &[5.0, -5.0]);
        assert_eq!(out.logits_ith(-1).unwrap(), &[5.0, -5.0]);
        assert_eq!(out.logits_ith(-3).unwrap(), &[1.0, -1.0]);
        assert!(out.logits_ith(-4).is_err());
        assert!(out.logits_ith(0).is_err());
        assert!(out.logits_ith(100).is_err());
        assert_eq!(out.output_positions(), vec![1, 3, 5]);
    }

    #[test]
    fn test_reserve_covers_n_seq_max() {
        let mut out = Outputs::new(4, 3);
        assert_eq!(out.reserve(1, 16, 4, true, true).unwrap(), 4);
        assert_eq!(out.logits.len(), 16);
        assert_eq!(out.embd.len(), 12);
        assert!(out.output_ids.iter().all(|&id| id == -1));
        assert!(out.embeddings_ith(0).is_err());
    }

    #[test]
    fn test_discard_hides_rows() {
        let mut out = Outputs::new(2, 0);
        out.reserve(1, 4, 1, true, false).unwrap();
        out.write_logits(0, &[1.0, 2.0]).unwrap();
        out.map_outputs(&[3]);
        assert!(out.logits_ith(3).is_ok());

        out.discard();
        assert_eq!(out.n_outputs, 0);
        assert!(out.logits().is_empty());
        assert!(out.logits_ith(3).is_err());
        assert!(out.logits_ith(-1).is_err());
    }

    #[test]
    fn test_embeddings_disabled() {
        let mut out = Outputs::new(4, 3);
        out.reserve(2, 4, 1, true, false).unwrap();
        out.map_outputs(&[0, 1]);
        assert!(out.embeddings_ith(0).is_err());
        assert!(out.logits_ith(1).is_ok());
    }
}
