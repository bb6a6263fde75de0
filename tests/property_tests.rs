//! Randomized checks of cache bookkeeping and batch splitting.

mod common;

use proptest::prelude::*;
use seqcache::GgmlType;
use seqcache::inference::batch::{Batch, SBatch};
use seqcache::inference::kv_cache::{KvCache, KvCacheConfig, KvCell};
use seqcache::inference::types::{Pos, SeqId};
use seqcache::inference::UBatch;

#[derive(Debug, Clone)]
enum Op {
    Place(SeqId, usize),
    /// One group of tokens carrying two sequence ids, primary first
    PlaceShared(SeqId, SeqId, usize),
    Remove(SeqId, Pos, Pos),
    RemoveAll(Pos, Pos),
    Copy(SeqId, SeqId),
    Keep(SeqId),
    Shift(SeqId, Pos, Pos),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..3i32, 1..5usize).prop_map(|(s, n)| Op::Place(s, n)),
        2 => (0..3i32, 1..3i32, 1..4usize).prop_map(|(a, k, n)| Op::PlaceShared(a, (a + k) % 3, n)),
        2 => (0..3i32, 0..12i32, 0..12i32).prop_map(|(s, a, b)| Op::Remove(s, a.min(b), a.max(b))),
        1 => (0..12i32, 0..12i32).prop_map(|(a, b)| Op::RemoveAll(a.min(b), a.max(b))),
        1 => (0..3i32, 0..3i32).prop_map(|(a, b)| Op::Copy(a, b)),
        1 => (0..3i32).prop_map(Op::Keep),
        1 => (0..3i32, 0..12i32, -4..4i32).prop_map(|(s, p, d)| Op::Shift(s, p, d)),
    ]
}

fn cache(recurrent: bool, size: usize) -> KvCache {
    let model = if recurrent {
        common::mamba()
    } else {
        common::llama()
    };
    let config = KvCacheConfig::for_model(&model, size, GgmlType::F32, GgmlType::F32, false);
    KvCache::new(&model, &config).unwrap()
}

fn next_pos(cache: &KvCache, s: SeqId) -> Pos {
    let held = cache.cells().iter().any(|c| c.has_seq_id(s));
    if held { cache.seq_pos_max(s) + 1 } else { 0 }
}

fn place(cache: &mut KvCache, ubatch: &UBatch) -> bool {
    let placed = cache.find_slot(ubatch);
    if placed && cache.recurrent() {
        cache.take_state_inputs();
    }
    placed
}

/// Apply `op`, returning whether a placement succeeded
fn apply(cache: &mut KvCache, op: &Op) -> bool {
    match *op {
        Op::Place(s, n) => {
            let p0 = next_pos(cache, s);
            return place(cache, &UBatch::for_sequence(s, (p0..p0 + n as Pos).collect()));
        }
        Op::PlaceShared(a, b, n) => {
            let p0 = next_pos(cache, a).max(next_pos(cache, b));
            let mut ubatch = UBatch::for_sequence(a, (p0..p0 + n as Pos).collect());
            ubatch.seq_ids = vec![vec![a, b]];
            return place(cache, &ubatch);
        }
        Op::Remove(s, p0, p1) => {
            cache.seq_rm(Some(s), p0..p1);
        }
        Op::RemoveAll(p0, p1) => {
            cache.seq_rm(None, p0..p1);
        }
        Op::Copy(src, dst) => cache.seq_cp(src, dst, ..),
        Op::Keep(s) => cache.seq_keep(s),
        Op::Shift(s, p0, d) => cache.seq_add(s, p0.., d).unwrap(),
    }
    false
}

fn occupied(cache: &KvCache) -> Vec<KvCell> {
    let mut cells: Vec<KvCell> = cache
        .cells()
        .iter()
        .filter(|c| !c.is_empty())
        .map(|c| KvCell {
            src: None,
            ..c.clone()
        })
        .collect();
    cells.sort_by(|a, b| (a.pos, &a.seq_id).cmp(&(b.pos, &b.seq_id)));
    cells
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// `used` always equals the number of non-empty cells
    #[test]
    fn prop_used_matches_cells(ops in prop::collection::vec(op(), 1..40)) {
        let mut cache = cache(false, 16);
        for op in &ops {
            apply(&mut cache, op);
            prop_assert_eq!(cache.used(), cache.count_used());
            prop_assert!(cache.cells().iter().all(|c| c.is_empty() == (c.pos < 0)));
        }
    }

    /// Every recurrent sequence lives in at most one cell, its tail
    #[test]
    fn prop_recurrent_tails_consistent(ops in prop::collection::vec(op(), 1..40)) {
        let mut cache = cache(true, 4);
        for op in &ops {
            let placed = apply(&mut cache, op);
            prop_assert_eq!(cache.used(), cache.count_used());
            prop_assert!(cache.verify_tails().is_ok());
            if let (true, Op::PlaceShared(a, b, _)) = (placed, op) {
                prop_assert!(cache.tail(*a).is_some());
                prop_assert_eq!(cache.tail(*a), cache.tail(*b));
            }
            for s in 0..3 {
                let holders = cache.cells().iter().filter(|c| c.has_seq_id(s)).count();
                prop_assert!(holders <= 1);
                prop_assert_eq!(holders == 1, cache.tail(s).is_some());
            }
        }
    }

    /// Removing the same range twice changes nothing the second time
    #[test]
    fn prop_seq_rm_idempotent(
        ops in prop::collection::vec(op(), 1..30),
        seq in prop::option::of(0..3i32),
        p0 in 0..12i32,
        len in 0..12i32,
    ) {
        let mut cache = cache(false, 16);
        for op in &ops {
            apply(&mut cache, op);
        }
        cache.seq_rm(seq, p0..p0 + len);
        let cells = cache.cells().to_vec();
        let used = cache.used();
        cache.seq_rm(seq, p0..p0 + len);
        prop_assert_eq!(cache.cells(), &cells[..]);
        prop_assert_eq!(cache.used(), used);
    }

    /// A full defrag keeps every (position, sequences) pair and packs the
    /// occupied cells at the front
    #[test]
    fn prop_defrag_preserves_cells(ops in prop::collection::vec(op(), 1..40)) {
        let mut cache = cache(false, 16);
        for op in &ops {
            apply(&mut cache, op);
        }
        let before = occupied(&cache);
        if let Some(plan) = cache.plan_defrag(usize::MAX).unwrap() {
            cache.apply_defrag(&plan);
        }
        prop_assert_eq!(occupied(&cache), before);
        prop_assert_eq!(cache.cell_max(), cache.used());
        prop_assert_eq!(cache.used(), cache.count_used());
    }

    /// Every strategy hands out each token exactly once and never exceeds
    /// the micro-batch size
    #[test]
    fn prop_split_conserves_tokens(
        groups in prop::collection::vec(0..4usize, 1..24),
        n_ubatch in 1..8usize,
        strategy in 0..3u8,
    ) {
        const SETS: [&[SeqId]; 4] = [&[0], &[1], &[2], &[0, 1]];
        let mut next_pos = [0; 4];
        let mut batch = Batch::new();
        for (i, &g) in groups.iter().enumerate() {
            batch.add(i as i32, next_pos[g], SETS[g], false).unwrap();
            next_pos[g] += 1;
        }
        let resolved = batch.resolve(0).unwrap();
        let n = resolved.n_tokens();
        let mut sbatch = SBatch::from_batch(&resolved, 4, strategy == 0, true);

        let mut seen = Vec::new();
        while !sbatch.is_empty() {
            let ub = match strategy {
                0 => sbatch.split_simple(n_ubatch),
                1 => sbatch.split_equal(n_ubatch),
                _ => sbatch.split_seq(n_ubatch),
            };
            prop_assert!(ub.n_tokens > 0);
            prop_assert!(ub.n_tokens <= n_ubatch);
            prop_assert_eq!(ub.n_tokens, ub.n_seqs * ub.n_seq_tokens);
            if strategy == 2 {
                prop_assert_eq!(ub.n_seqs, 1);
            }
            if strategy == 1 && ub.seq_ids.iter().any(|ids| ids.len() > 1) {
                prop_assert_eq!(ub.n_seqs, 1);
            }
            seen.extend(ub.input.tokens().unwrap_or_default().iter().copied());
        }
        seen.sort_unstable();
        prop_assert_eq!(seen, (0..n as i32).collect::<Vec<_>>());

        let mut out = sbatch.take_out_ids();
        out.sort_unstable();
        prop_assert_eq!(out, (0..n).collect::<Vec<_>>());
    }
}
