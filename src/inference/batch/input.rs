//! User-facing batch types.
//!
//! A [`Batch`] is what callers submit to `decode`/`encode`. Positions,
//! sequence ids and output flags are optional there; [`Batch::resolve`]
//! fills in the defaults and yields a [`ResolvedBatch`] in which every
//! per-token field is present.

use crate::error::{Error, Result};
use crate::inference::types::{Pos, SeqId, Token};
use std::collections::HashMap;

/// Token ids or precomputed input embeddings
#[derive(Debug, Clone, PartialEq)]
pub enum BatchInput {
    Tokens(Vec<Token>),
    Embeddings { data: Vec<f32>, n_embd: usize },
}

impl BatchInput {
    pub fn len(&self) -> usize {
        match self {
            Self::Tokens(tokens) => tokens.len(),
            Self::Embeddings { data, n_embd } => {
                if *n_embd == 0 {
                    0
                } else {
                    data.len() / n_embd
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tokens(&self) -> Option<&[Token]> {
        match self {
            Self::Tokens(tokens) => Some(tokens),
            Self::Embeddings { .. } => None,
        }
    }

    pub fn embeddings(&self) -> Option<&[f32]> {
        match self {
            Self::Tokens(_) => None,
            Self::Embeddings { data, .. } => Some(data),
        }
    }

    /// An empty input of the same kind, with room for `capacity` rows
    pub(crate) fn empty_like(&self, capacity: usize) -> Self {
        match self {
            Self::Tokens(_) => Self::Tokens(Vec::with_capacity(capacity)),
            Self::Embeddings { n_embd, .. } => Self::Embeddings {
                data: Vec::with_capacity(capacity * n_embd),
                n_embd: *n_embd,
            },
        }
    }

    /// Append row `idx` of `src` (which must be of the same kind)
    pub(crate) fn push_row_from(&mut self, src: &Self, idx: usize) {
        match (self, src) {
            (Self::Tokens(dst), Self::Tokens(src)) => dst.push(src[idx]),
            (Self::Embeddings { data: dst, n_embd }, Self::Embeddings { data: src, .. }) => {
                dst.extend_from_slice(&src[idx * *n_embd..(idx + 1) * *n_embd]);
            }
            _ => unreachable!("batch input kinds never mix"),
        }
    }
}

/// A logical batch submitted by the caller
#[derive(Debug, Clone)]
pub struct Batch {
    input: BatchInput,
    pos: Option<Vec<Pos>>,
    seq_ids: Option<Vec<Vec<SeqId>>>,
    output: Option<Vec<bool>>,
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

impl Batch {
    /// Empty token batch to be filled with [`Batch::add`]
    pub fn new() -> Self {
        Self {
            input: BatchInput::Tokens(Vec::new()),
            pos: Some(Vec::new()),
            seq_ids: Some(Vec::new()),
            output: Some(Vec::new()),
        }
    }

    /// Tokens only; positions, sequence ids and outputs are defaulted on resolve
    pub fn from_tokens(tokens: Vec<Token>) -> Self {
        Self {
            input: BatchInput::Tokens(tokens),
            pos: None,
            seq_ids: None,
            output: None,
        }
    }

    /// Convenience for a single prompt in sequence 0
    pub fn get_one(tokens: &[Token]) -> Self {
        Self::from_tokens(tokens.to_vec())
    }

    pub fn from_embeddings(data: Vec<f32>, n_embd: usize) -> Result<Self> {
        if n_embd == 0 || data.len() % n_embd != 0 {
            return Err(Error::InvalidArgument {
                arg: "n_embd",
                reason: format!(
                    "embedding data of length {} is not a multiple of n_embd ({n_embd})",
                    data.len()
                ),
            });
        }
        Ok(Self {
            input: BatchInput::Embeddings { data, n_embd },
            pos: None,
            seq_ids: None,
            output: None,
        })
    }

    pub fn with_positions(mut self, pos: Vec<Pos>) -> Self {
        self.pos = Some(pos);
        self
    }

    pub fn with_seq_ids(mut self, seq_ids: Vec<Vec<SeqId>>) -> Self {
        self.seq_ids = Some(seq_ids);
        self
    }

    pub fn with_outputs(mut self, output: Vec<bool>) -> Self {
        self.output = Some(output);
        self
    }

    /// Append one token with explicit position, sequences and output flag
    pub fn add(&mut self, token: Token, pos: Pos, seq_ids: &[SeqId], output: bool) -> Result<()> {
        let BatchInput::Tokens(tokens) = &mut self.input else {
            return Err(Error::BatchError {
                reason: "cannot add tokens to an embedding batch".into(),
            });
        };
        let (Some(p), Some(s), Some(o)) = (&mut self.pos, &mut self.seq_ids, &mut self.output)
        else {
            return Err(Error::BatchError {
                reason: "add requires a batch built with Batch::new".into(),
            });
        };
        tokens.push(token);
        p.push(pos);
        s.push(seq_ids.to_vec());
        o.push(output);
        Ok(())
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }

    pub fn n_tokens(&self) -> usize {
        self.input.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    pub fn input(&self) -> &BatchInput {
        &self.input
    }

    pub fn has_outputs(&self) -> bool {
        self.output.is_some()
    }

    /// Fill in missing fields.
    ///
    /// Positions default to `p0 + i`, sequence ids to `[0]`, and output
    /// flags to the last token of every sequence.
    pub fn resolve(&self, p0: Pos) -> Result<ResolvedBatch> {
        let n = self.n_tokens();

        let pos = match &self.pos {
            Some(pos) => {
                check_len("pos", pos.len(), n)?;
                pos.clone()
            }
            None => (0..n as Pos).map(|i| p0 + i).collect(),
        };

        let seq_ids = match &self.seq_ids {
            Some(seq_ids) => {
                check_len("seq_ids", seq_ids.len(), n)?;
                for (i, ids) in seq_ids.iter().enumerate() {
                    if ids.is_empty() {
                        return Err(Error::InvalidArgument {
                            arg: "seq_ids",
                            reason: format!("token {i} belongs to no sequence"),
                        });
                    }
                    if let Some(bad) = ids.iter().find(|&&s| s < 0) {
                        return Err(Error::InvalidArgument {
                            arg: "seq_ids",
                            reason: format!("token {i} has negative seq_id {bad}"),
                        });
                    }
                    if let Some((j, dup)) = ids
                        .iter()
                        .enumerate()
                        .find(|&(j, s)| ids[..j].contains(s))
                    {
                        return Err(Error::InvalidArgument {
                            arg: "seq_ids",
                            reason: format!("token {i} lists seq_id {dup} twice (at index {j})"),
                        });
                    }
                }
                seq_ids.clone()
            }
            None => vec![vec![0]; n],
        };

        let output = match &self.output {
            Some(output) => {
                check_len("output", output.len(), n)?;
                output.clone()
            }
            None => last_of_each_sequence(&seq_ids),
        };

        Ok(ResolvedBatch {
            input: self.input.clone(),
            pos,
            seq_ids,
            output,
        })
    }
}

fn check_len(arg: &'static str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(Error::InvalidArgument {
            arg,
            reason: format!("length {got} does not match n_tokens {expected}"),
        });
    }
    Ok(())
}

fn last_of_each_sequence(seq_ids: &[Vec<SeqId>]) -> Vec<bool> {
    let mut last: HashMap<SeqId, usize> = HashMap::new();
    for (i, ids) in seq_ids.iter().enumerate() {
        last.insert(ids[0], i);
    }
    let mut output = vec![false; seq_ids.len()];
    for i in last.into_values() {
        output[i] = true;
    }
    output
}

/// A batch with every per-token field present
#[derive(Debug, Clone)]
pub struct ResolvedBatch {
    pub input: BatchInput,
    pub pos: Vec<Pos>,
    pub seq_ids: Vec<Vec<SeqId>>,
    pub output: Vec<bool>,
}

impl ResolvedBatch {
    pub fn n_tokens(&self) -> usize {
        self.pos.len()
    }

    pub fn n_outputs(&self) -> usize {
        self.output.iter().filter(|&&o| o).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_defaults() {
        let batch = Batch::from_tokens(vec![5, 6, 7]);
        let resolved = batch.resolve(10).unwrap();
        assert_eq!(resolved.pos, vec![10, 11, 12]);
        assert_eq!(resolved.seq_ids, vec![vec![0], vec![0], vec![0]]);
        assert_eq!(resolved.output, vec![false, false, true]);
    }

    #[test]
    fn test_default_outputs_per_sequence() {
        let batch = Batch::from_tokens(vec![1, 2, 3, 4])
            .with_seq_ids(vec![vec![0], vec![1], vec![0], vec![1]]);
        let resolved = batch.resolve(0).unwrap();
        assert_eq!(resolved.output, vec![false, false, true, true]);
        assert_eq!(resolved.n_outputs(), 2);
    }

    #[test]
    fn test_add_builds_explicit_batch() {
        let mut batch = Batch::new();
        batch.add(1, 0, &[0], false).unwrap();
        batch.add(2, 1, &[0, 1], true).unwrap();
        let resolved = batch.resolve(99).unwrap();
        assert_eq!(resolved.pos, vec![0, 1]);
        assert_eq!(resolved.seq_ids[1], vec![0, 1]);
        assert_eq!(resolved.output, vec![false, true]);
    }

    #[test]
    fn test_add_rejected_on_embeddings() {
        let mut batch = Batch::from_embeddings(vec![0.0; 8], 4).unwrap();
        assert_eq!(batch.n_tokens(), 2);
        assert!(batch.add(1, 0, &[0], true).is_err());
    }

    #[test]
    fn test_resolve_rejects_bad_lengths() {
        let batch = Batch::from_tokens(vec![1, 2]).with_positions(vec![0]);
        assert!(batch.resolve(0).is_err());
        let batch = Batch::from_tokens(vec![1]).with_seq_ids(vec![vec![]]);
        assert!(batch.resolve(0).is_err());
        let batch = Batch::from_tokens(vec![1]).with_seq_ids(vec![vec![-2]]);
        assert!(batch.resolve(0).is_err());
    }

    #[test]
    fn test_resolve_rejects_repeated_seq_id() {
        let batch = Batch::from_tokens(vec![1, 2]).with_seq_ids(vec![vec![0], vec![1, 0, 1]]);
        let err = batch.resolve(0).unwrap_err();
        assert!(err.to_string().contains("seq_id 1 twice"));

        let batch = Batch::from_tokens(vec![1]).with_seq_ids(vec![vec![2, 0]]);
        assert!(batch.resolve(0).is_ok());
    }

    #[test]
    fn test_embeddings_shape_checked() {
        assert!(Batch::from_embeddings(vec![0.0; 7], 4).is_err());
        assert!(Batch::from_embeddings(vec![0.0; 8], 0).is_err());
    }
}
