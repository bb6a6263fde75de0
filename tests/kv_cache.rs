//! Cell-table behaviour of the cache, driven without a context.

mod common;

use seqcache::GgmlType;
use seqcache::inference::UBatch;
use seqcache::inference::kv_cache::{KvCache, KvCacheConfig, Maintenance};
use seqcache::inference::types::{Pos, SeqId};

fn attention_cache(size: usize) -> KvCache {
    let model = common::llama();
    let config = KvCacheConfig::for_model(&model, size, GgmlType::F32, GgmlType::F32, false);
    KvCache::new(&model, &config).unwrap()
}

fn recurrent_cache(size: usize) -> KvCache {
    let model = common::mamba();
    let config = KvCacheConfig::for_model(&model, size, GgmlType::F32, GgmlType::F32, false);
    KvCache::new(&model, &config).unwrap()
}

fn place(cache: &mut KvCache, seq_id: SeqId, pos: impl IntoIterator<Item = Pos>) -> usize {
    let ubatch = UBatch::for_sequence(seq_id, pos.into_iter().collect());
    assert!(cache.find_slot(&ubatch));
    cache.head()
}

#[test]
fn test_remove_middle_of_sequence() {
    let mut cache = attention_cache(16);
    place(&mut cache, 0, 0..5);
    assert_eq!(cache.used(), 5);

    assert!(cache.seq_rm(Some(0), 2..4));
    assert_eq!(cache.used(), 3);
    assert!(cache.cell(2).is_empty());
    assert!(cache.cell(3).is_empty());
    assert_eq!(cache.cell(4).pos, 4);
    assert_eq!(cache.seq_pos_max(0), 4);
    assert_eq!(cache.count_used(), 3);
}

#[test]
fn test_hole_reused_without_defrag() {
    let mut cache = attention_cache(8);
    place(&mut cache, 0, 0..8);
    assert_eq!(cache.used(), 8);

    cache.seq_rm(Some(0), 3..5);
    assert_eq!(cache.used(), 6);

    cache.set_head(0);
    let head = place(&mut cache, 1, 0..2);
    assert_eq!(head, 3);
    assert_eq!(cache.used(), 8);
    assert!(cache.cell(3).has_seq_id(1));
    assert!(cache.cell(4).has_seq_id(1));
    assert_eq!(cache.maintenance(), Maintenance::Clean);
}

#[test]
fn test_full_cache_rejects_slot() {
    let mut cache = attention_cache(4);
    place(&mut cache, 0, 0..4);
    let ubatch = UBatch::for_sequence(1, vec![0]);
    assert!(!cache.find_slot(&ubatch));
    assert_eq!(cache.used(), 4);
}

#[test]
fn test_shift_records_deltas() {
    let mut cache = attention_cache(16);
    place(&mut cache, 0, 0..10);
    cache.seq_rm(Some(0), 2..5);
    cache.seq_add(0, 5..10, -3).unwrap();

    let positions: Vec<Pos> = (5..10).map(|i| cache.cell(i).pos).collect();
    assert_eq!(positions, vec![2, 3, 4, 5, 6]);
    assert!(cache.has_shift());
    assert_eq!(cache.maintenance(), Maintenance::ShiftPending);

    let deltas = cache.k_shift_deltas();
    assert_eq!(&deltas[..2], &[0, 0]);
    assert!(deltas[5..10].iter().all(|&d| d == -3));
    assert_eq!(cache.seq_pos_max(0), 6);

    cache.complete_shift();
    assert!(!cache.has_shift());
    assert!(cache.k_shift_deltas().iter().all(|&d| d == 0));
}

#[test]
fn test_copy_then_keep() {
    let mut cache = attention_cache(16);
    place(&mut cache, 0, 0..4);
    cache.seq_cp(0, 1, 0..2);
    assert!(cache.cell(0).has_seq_id(1));
    assert!(cache.cell(1).has_seq_id(1));
    assert!(!cache.cell(2).has_seq_id(1));
    assert_eq!(cache.token_count(), 6);

    cache.seq_keep(1);
    assert_eq!(cache.used(), 2);
    assert_eq!(cache.token_count(), 2);
    assert!(!cache.cells().iter().any(|c| c.has_seq_id(0)));
    assert_eq!(cache.seq_pos_max(1), 1);
}

#[test]
fn test_recurrent_copy_shares_tail() {
    let mut cache = recurrent_cache(4);
    place(&mut cache, 0, [0, 1, 2]);
    cache.take_state_inputs();
    let tail = cache.tail(0).unwrap();
    assert_eq!(cache.cell(tail).pos, 2);

    cache.seq_cp(0, 2, ..);
    assert_eq!(cache.tail(2), Some(tail));
    assert!(cache.cell(tail).has_seq_id(0));
    assert!(cache.cell(tail).has_seq_id(2));
    assert_eq!(cache.used(), 1);
    cache.verify_tails().unwrap();

    // the next write to seq 2 gets a private copy of the state
    place(&mut cache, 2, [3]);
    let own = cache.tail(2).unwrap();
    assert_ne!(own, tail);
    assert_eq!(cache.cell(own).src, Some(tail));
    assert!(!cache.cell(tail).has_seq_id(2));
    assert_eq!(cache.used(), 2);
    cache.verify_tails().unwrap();

    let (s_copy, s_mask) = cache.take_state_inputs();
    assert_eq!(s_copy, vec![tail as i32]);
    assert_eq!(s_mask, vec![1.0]);
}

#[test]
fn test_recurrent_partial_remove_refused() {
    let mut cache = recurrent_cache(2);
    place(&mut cache, 0, [0, 1, 2, 3]);
    assert!(!cache.seq_rm(Some(0), 1..3));
    assert!(!cache.seq_rm(Some(0), 2..));
    assert_eq!(cache.used(), 1);
    // past the stored position: nothing to cut
    assert!(cache.seq_rm(Some(0), 4..));
    assert_eq!(cache.used(), 1);
    assert!(cache.seq_rm(Some(0), ..));
    assert_eq!(cache.used(), 0);
    assert_eq!(cache.tail(0), None);
}

#[test]
fn test_view_reports_largest_hole() {
    let mut cache = attention_cache(8);
    place(&mut cache, 0, 0..3);
    place(&mut cache, 1, 0..3);
    cache.seq_rm(Some(0), ..);

    let view = cache.view(2);
    assert_eq!(view.n_cells, 8);
    assert_eq!(view.used_cells, 3);
    assert_eq!(view.token_count, 3);
    assert_eq!(view.max_contiguous, 3);
    assert_eq!(view.max_contiguous_idx, Some(0));
    assert_eq!(&view.cells_sequences[6..8], &[1, -1]);
    assert_eq!(view.cells[3], 0);
}

#[test]
fn test_defrag_compacts_cells() {
    let mut cache = attention_cache(8);
    place(&mut cache, 0, 0..6);
    place(&mut cache, 1, 0..2);
    cache.seq_rm(Some(0), 1..4);
    assert_eq!(cache.used(), 5);

    let plan = cache.plan_defrag(usize::MAX).unwrap().unwrap();
    assert_eq!(plan.n_moves(), 1);
    let runs = plan.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!((runs[0].src, runs[0].dst, runs[0].len), (5, 1, 3));

    let graph = plan.graph(cache.storage());
    assert!(!graph.is_empty());

    cache.apply_defrag(&plan);
    assert_eq!(cache.head(), 5);
    assert_eq!(cache.used(), 5);
    assert!((0..5).all(|i| !cache.cell(i).is_empty()));
    assert!((5..8).all(|i| cache.cell(i).is_empty()));
    assert_eq!(cache.cell(1).pos, 5);
    assert!(cache.cell(2).has_seq_id(1));
    assert_eq!(cache.cell(3).pos, 1);
    assert!(cache.plan_defrag(usize::MAX).unwrap().is_none());
}

#[test]
fn test_defrag_respects_move_budget() {
    let mut cache = attention_cache(8);
    place(&mut cache, 0, 0..8);
    cache.seq_rm(Some(0), 1..2);
    cache.seq_rm(Some(0), 3..4);

    // two holes need two separate blocks
    let plan = cache.plan_defrag(1).unwrap().unwrap();
    assert_eq!(plan.n_moves(), 1);
    cache.apply_defrag(&plan);
    assert_eq!(cache.count_used(), 6);

    let plan = cache.plan_defrag(1).unwrap().unwrap();
    cache.apply_defrag(&plan);
    assert!((0..6).all(|i| !cache.cell(i).is_empty()));
}
