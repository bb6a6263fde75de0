//! The cache section of a session: cell metadata followed by the key and
//! value rows of every layer.

use super::io::{StateReader, StateWriter};
use crate::error::{Error, Result};
use crate::format::GgmlType;
use crate::inference::kv_cache::{CellMeta, KvCache, KvStorage};
use crate::inference::types::SeqId;
use std::ops::Range;

/// Write the cells of `seq_id` (all occupied cells for `None`)
pub(crate) fn write_kv<W: StateWriter>(
    w: &mut W,
    cache: &KvCache,
    seq_id: Option<SeqId>,
) -> Result<()> {
    let (count, ranges) = cache.cell_ranges(seq_id);
    w.write_u32(count as u32)?;

    for range in &ranges {
        for cell in &cache.cells()[range.clone()] {
            w.write_i32(cell.pos)?;
            if seq_id.is_some() {
                // the id is supplied again on restore
                w.write_u32(0)?;
            } else {
                w.write_u32(cell.seq_id.len() as u32)?;
                for &s in &cell.seq_id {
                    w.write_i32(s)?;
                }
            }
        }
    }

    write_data(w, cache.storage(), &ranges)
}

fn write_data<W: StateWriter>(w: &mut W, storage: &KvStorage, ranges: &[Range<usize>]) -> Result<()> {
    let v_trans = storage.v_trans();
    w.write_u32(v_trans as u32)?;
    w.write_u32(storage.n_layer() as u32)?;

    for (il, layer) in storage.layers().iter().enumerate() {
        w.write_i32(layer.type_k.id() as i32)?;
        w.write_u64(layer.k_row_size() as u64)?;
        for r in ranges {
            w.write_bytes(storage.k_rows(il, r.start, r.len()))?;
        }
    }

    for (il, layer) in storage.layers().iter().enumerate() {
        w.write_i32(layer.type_v.id() as i32)?;
        if !v_trans {
            w.write_u64(layer.v_row_size() as u64)?;
            for r in ranges {
                w.write_bytes(storage.v_rows(il, r.start, r.len()))?;
            }
        } else {
            w.write_u32(layer.v_elem_size() as u32)?;
            w.write_u32(layer.n_embd_v as u32)?;
            for j in 0..layer.n_embd_v {
                for r in ranges {
                    w.write_bytes(storage.v_elems(il, j, r.start, r.len()))?;
                }
            }
        }
    }
    Ok(())
}

/// Read a cache section into `cache`.
///
/// With `dest` the saved cells become sequence `dest`, replacing whatever
/// it held; otherwise the whole cache is replaced. On failure `dest` is
/// removed, or the cache cleared.
pub(crate) fn read_kv<R: StateReader>(
    r: &mut R,
    cache: &mut KvCache,
    n_seq_max: usize,
    dest: Option<SeqId>,
) -> Result<()> {
    let cell_count = r.read_u32()? as usize;
    let result = read_meta(r, cache, cell_count, n_seq_max, dest)
        .and_then(|()| read_data(r, cache, cell_count));

    if let Err(e) = result {
        match dest {
            Some(d) => {
                cache.seq_rm(Some(d), ..);
            }
            None => cache.clear(),
        }
        tracing::error!(error = %e, "failed to restore kv cache");
        return Err(e);
    }
    Ok(())
}

fn read_meta<R: StateReader>(
    r: &mut R,
    cache: &mut KvCache,
    cell_count: usize,
    n_seq_max: usize,
    dest: Option<SeqId>,
) -> Result<()> {
    if cell_count > cache.size() {
        return Err(Error::StateError {
            reason: format!("not enough cells in kv cache ({cell_count} > {})", cache.size()),
        });
    }

    match dest {
        Some(dest) => {
            if cache.recurrent() && cell_count > 1 {
                return Err(Error::StateError {
                    reason: format!("recurrent sequence state spans {cell_count} cells"),
                });
            }
            let mut pos = Vec::with_capacity(cell_count);
            for i in 0..cell_count {
                pos.push(r.read_i32()?);
                let n_seq_id = r.read_u32()?;
                if n_seq_id != 0 {
                    return Err(Error::StateError {
                        reason: format!("cell {i} of a sequence save lists {n_seq_id} seq ids"),
                    });
                }
            }
            cache.restore_sequence(dest, pos)?;
        }
        None => {
            let mut cells = Vec::with_capacity(cell_count);
            for _ in 0..cell_count {
                let pos = r.read_i32()?;
                let n_seq_id = r.read_u32()? as usize;
                let seq_ids = r.read_i32s(n_seq_id)?;
                cells.push(CellMeta { pos, seq_ids });
            }
            cache.restore_cells(&cells, n_seq_max)?;
        }
    }
    Ok(())
}

fn read_data<R: StateReader>(r: &mut R, cache: &mut KvCache, cell_count: usize) -> Result<()> {
    let head = cache.head();
    let storage = cache.storage_mut();

    let v_trans = r.read_u32()? != 0;
    let n_layer = r.read_u32()? as usize;
    if n_layer != storage.n_layer() {
        return Err(Error::StateError {
            reason: format!("mismatched layer count ({n_layer} != {})", storage.n_layer()),
        });
    }
    if head + cell_count > storage.size() {
        return Err(Error::StateError {
            reason: format!(
                "cells {head}..{} do not fit in {} cells",
                head + cell_count,
                storage.size()
            ),
        });
    }
    if v_trans != storage.v_trans() {
        return Err(Error::StateError {
            reason: "incompatible value transposition".into(),
        });
    }

    for il in 0..n_layer {
        let layer = storage.layer(il);
        check_type(r.read_i32()?, layer.type_k, "key", il)?;
        let row = r.read_u64()? as usize;
        check_size(row, layer.k_row_size(), "key row size", il)?;
        if cell_count > 0 {
            r.read_to(storage.k_rows_mut(il, head, cell_count))?;
        }
    }

    for il in 0..n_layer {
        let layer = storage.layer(il);
        check_type(r.read_i32()?, layer.type_v, "value", il)?;
        if !v_trans {
            let row = r.read_u64()? as usize;
            check_size(row, layer.v_row_size(), "value row size", il)?;
            if cell_count > 0 {
                r.read_to(storage.v_rows_mut(il, head, cell_count))?;
            }
        } else {
            let el = r.read_u32()? as usize;
            check_size(el, layer.v_elem_size(), "value element size", il)?;
            let n_embd_v = r.read_u32()? as usize;
            check_size(n_embd_v, layer.n_embd_v, "value width", il)?;
            if cell_count > 0 {
                for j in 0..n_embd_v {
                    r.read_to(storage.v_elems_mut(il, j, head, cell_count))?;
                }
            }
        }
    }
    Ok(())
}

fn check_type(saved: i32, expected: GgmlType, what: &str, il: usize) -> Result<()> {
    if saved != expected.id() as i32 {
        let name = u32::try_from(saved)
            .ok()
            .and_then(GgmlType::from_u32)
            .map_or("unknown", |t| t.name());
        return Err(Error::StateError {
            reason: format!(
                "mismatched {what} type in layer {il} ({name} != {})",
                expected.name()
            ),
        });
    }
    Ok(())
}

fn check_size(saved: usize, expected: usize, what: &str, il: usize) -> Result<()> {
    if saved != expected {
        return Err(Error::StateError {
            reason: format!("mismatched {what} in layer {il} ({saved} != {expected})"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::batch::UBatch;
    use crate::inference::kv_cache::KvCacheConfig;
    use crate::inference::state::io::{IoWriter, SliceReader};
    use crate::model::ModelConfig;

    fn cache(size: usize, flash_attn: bool) -> KvCache {
        let model: ModelConfig = serde_yaml::from_str(
            "model_type: llama\nvocab_size: 8\nhidden_size: 4\nnum_layers: 2\nattention:\n  num_heads: 1\n",
        )
        .unwrap();
        let config = KvCacheConfig::for_model(&model, size, GgmlType::F32, GgmlType::F32, flash_attn);
        KvCache::new(&model, &config).unwrap()
    }

    fn fill(cache: &mut KvCache, seq_id: SeqId, pos: Vec<i32>) {
        assert!(cache.find_slot(&UBatch::for_sequence(seq_id, pos.clone())));
        let first = cache.head();
        for il in 0..cache.storage().n_layer() {
            for (k, b) in cache.storage_mut().k_rows_mut(il, first, pos.len()).iter_mut().enumerate() {
                *b = (seq_id as usize * 50 + k + il) as u8;
            }
        }
        cache.set_head(first + pos.len());
    }

    fn save(cache: &KvCache, seq_id: Option<SeqId>) -> Vec<u8> {
        let mut w = IoWriter::new(Vec::new());
        write_kv(&mut w, cache, seq_id).unwrap();
        w.into_inner()
    }

    #[test]
    fn test_whole_cache_round_trip_compacts_cells() {
        for flash_attn in [false, true] {
            let mut src = cache(8, flash_attn);
            fill(&mut src, 0, vec![0, 1, 2]);
            fill(&mut src, 1, vec![0, 1]);
            src.seq_rm(Some(0), 1..2);
            let bytes = save(&src, None);

            let mut dst = cache(8, flash_attn);
            let mut r = SliceReader::new(&bytes);
            read_kv(&mut r, &mut dst, 2, None).unwrap();
            assert_eq!(r.remaining(), 0);
            assert_eq!(dst.used(), 4);
            assert_eq!(dst.seq_pos_max(0), 2);
            assert_eq!(dst.seq_pos_max(1), 1);
            // cell 1 was a hole in the source, restored cells start at 0
            assert_eq!(dst.cell(1).pos, 2);
            assert_eq!(dst.storage().k_rows(0, 1, 1), src.storage().k_rows(0, 2, 1));
        }
    }

    #[test]
    fn test_sequence_restore_under_new_id() {
        let mut src = cache(8, false);
        fill(&mut src, 0, vec![0, 1]);
        fill(&mut src, 1, vec![0, 1, 2]);
        let bytes = save(&src, Some(1));

        let mut dst = cache(8, false);
        fill(&mut dst, 0, vec![0]);
        read_kv(&mut SliceReader::new(&bytes), &mut dst, 4, Some(3)).unwrap();
        assert_eq!(dst.used(), 4);
        assert_eq!(dst.seq_pos_max(3), 2);
        assert_eq!(dst.storage().k_rows(1, 1, 3), src.storage().k_rows(1, 2, 3));
    }

    #[test]
    fn test_layer_mismatch_clears_cache() {
        let mut src = cache(8, false);
        fill(&mut src, 0, vec![0, 1]);
        let mut bytes = save(&src, None);
        // cell_count, then two cells of (pos, n_seq_id = 1, seq_id)
        let n_layer_at = 4 + 2 * 12 + 4;
        bytes[n_layer_at..n_layer_at + 4].copy_from_slice(&7u32.to_le_bytes());

        let mut dst = cache(8, false);
        fill(&mut dst, 2, vec![0]);
        assert!(read_kv(&mut SliceReader::new(&bytes), &mut dst, 4, None).is_err());
        assert_eq!(dst.used(), 0);
    }

    #[test]
    fn test_too_many_cells() {
        let mut src = cache(8, false);
        fill(&mut src, 0, vec![0, 1, 2, 3]);
        let bytes = save(&src, None);
        let mut dst = cache(2, false);
        assert!(read_kv(&mut SliceReader::new(&bytes), &mut dst, 1, None).is_err());
    }

    #[test]
    fn test_transposed_mismatch() {
        let mut src = cache(8, true);
        fill(&mut src, 0, vec![0]);
        let bytes = save(&src, Some(0));
        let mut dst = cache(8, false);
        assert!(read_kv(&mut SliceReader::new(&bytes), &mut dst, 1, Some(0)).is_err());
        assert_eq!(dst.used(), 0);
    }
}
