//! Splitting logical batches into micro-batches.

use seqcache::inference::batch::{Batch, SBatch};
use seqcache::inference::types::SeqId;

const N_EMBD: usize = 4;

fn tokens_with_seqs(seq_ids: Vec<Vec<SeqId>>, pos: Vec<i32>) -> Batch {
    let n = seq_ids.len() as i32;
    Batch::from_tokens((0..n).collect())
        .with_positions(pos)
        .with_seq_ids(seq_ids)
}

#[test]
fn test_shared_group_gets_its_own_ubatch() {
    let mut seq_ids = vec![vec![0, 1]; 3];
    seq_ids.extend(vec![vec![2]; 3]);
    let batch = tokens_with_seqs(seq_ids, vec![0, 1, 2, 0, 1, 2])
        .resolve(0)
        .unwrap();
    let mut sbatch = SBatch::from_batch(&batch, N_EMBD, false, false);

    let first = sbatch.split_equal(4);
    assert_eq!(first.n_tokens, 3);
    assert_eq!(first.n_seqs, 1);
    assert_eq!(first.seq_ids, vec![vec![0, 1]]);
    assert_eq!(first.pos, vec![0, 1, 2]);

    let second = sbatch.split_equal(4);
    assert_eq!(second.n_tokens, 3);
    assert_eq!(second.seq_ids, vec![vec![2]]);
    assert!(sbatch.is_empty());
}

#[test]
fn test_equal_split_packs_same_length_sequences() {
    let batch = tokens_with_seqs(
        vec![vec![0], vec![1], vec![0], vec![1], vec![2]],
        vec![0, 0, 1, 1, 0],
    )
    .resolve(0)
    .unwrap();
    let mut sbatch = SBatch::from_batch(&batch, N_EMBD, false, true);

    // the shortest sequence is drained first and fixes the stride
    let ub = sbatch.split_equal(8);
    assert_eq!(ub.n_seq_tokens, 1);
    assert_eq!(ub.n_seqs, 3);
    assert_eq!(ub.n_tokens, 3);
    assert_eq!(ub.primary_seq(0), 2);

    let ub = sbatch.split_equal(8);
    assert_eq!(ub.n_seqs, 2);
    assert_eq!(ub.n_seq_tokens, 1);
    assert!(sbatch.is_empty());

    let mut out = sbatch.take_out_ids();
    out.sort_unstable();
    assert_eq!(out, vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_simple_split_keeps_batch_order() {
    let batch = Batch::from_tokens(vec![7, 8, 9, 10, 11]).resolve(3).unwrap();
    let mut sbatch = SBatch::from_batch(&batch, N_EMBD, true, false);

    let ub = sbatch.split_simple(2);
    assert_eq!(ub.pos, vec![3, 4]);
    assert_eq!(ub.n_seqs, 2);
    assert_eq!(ub.n_seq_tokens, 1);
    assert_eq!(ub.n_outputs(), 0);

    sbatch.split_simple(2);
    let last = sbatch.split_simple(2);
    assert_eq!(last.n_tokens, 1);
    assert_eq!(last.input.tokens(), Some(&[11][..]));
    assert_eq!(sbatch.out_ids(), &[4]);
    assert!(sbatch.is_empty());
}

#[test]
fn test_seq_split_one_sequence_at_a_time() {
    let batch = tokens_with_seqs(
        vec![vec![0], vec![0], vec![0], vec![1]],
        vec![0, 1, 2, 0],
    )
    .resolve(0)
    .unwrap();
    let mut sbatch = SBatch::from_batch(&batch, N_EMBD, false, false);

    let ub = sbatch.split_seq(2);
    assert_eq!(ub.seq_ids, vec![vec![1]]);
    assert_eq!(ub.n_tokens, 1);

    let ub = sbatch.split_seq(2);
    assert_eq!(ub.seq_ids, vec![vec![0]]);
    assert_eq!(ub.pos, vec![0, 1]);

    let ub = sbatch.split_seq(2);
    assert_eq!(ub.pos, vec![2]);
    assert!(sbatch.is_empty());
}

#[test]
fn test_embedding_rows_follow_tokens() {
    let data: Vec<f32> = (0..3 * N_EMBD).map(|x| x as f32).collect();
    let batch = Batch::from_embeddings(data, N_EMBD)
        .unwrap()
        .with_seq_ids(vec![vec![1], vec![0], vec![1]])
        .resolve(0)
        .unwrap();
    let mut sbatch = SBatch::from_batch(&batch, N_EMBD, false, false);

    let ub = sbatch.split_seq(4);
    assert_eq!(ub.seq_ids, vec![vec![0]]);
    assert_eq!(ub.input.embeddings(), Some(&[4.0, 5.0, 6.0, 7.0][..]));
}
