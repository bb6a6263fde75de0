//! Saving and restoring a context: whole-context state and single
//! sequences, to buffers or to session files.

use super::io::{BufferWriter, IoWriter, SizeCounter, SliceReader, StateReader, StateWriter};
use super::kv::{read_kv, write_kv};
use crate::error::{Error, Result};
use crate::inference::context::Context;
use crate::inference::graph::{Backend, GraphBuilder};
use crate::inference::types::{SeqId, Token};
use crate::model::PoolingType;
use memmap2::Mmap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Magic of a whole-context session file ("ggsn")
pub const SESSION_MAGIC: u32 = 0x6767736e;
pub const SESSION_VERSION: u32 = 8;
/// Magic of a single-sequence session file ("ggsq")
pub const SEQ_MAGIC: u32 = 0x67677371;
pub const SEQ_VERSION: u32 = 2;

impl<B: Backend, G: GraphBuilder> Context<B, G> {
    /// Bytes [`state_get_data`](Self::state_get_data) will write
    pub fn state_size(&self) -> usize {
        let mut counter = SizeCounter::default();
        match self.write_state(&mut counter) {
            Ok(()) => counter.n_bytes(),
            Err(e) => {
                tracing::error!(error = %e, "failed to measure state");
                0
            }
        }
    }

    /// Serialize outputs and cache into `dst`, returning the bytes written
    pub fn state_get_data(&self, dst: &mut [u8]) -> Result<usize> {
        let mut w = BufferWriter::new(dst);
        self.write_state(&mut w)?;
        Ok(w.n_bytes())
    }

    /// Restore outputs and cache from `src`, returning the bytes read
    pub fn state_set_data(&mut self, src: &[u8]) -> Result<usize> {
        let mut r = SliceReader::new(src);
        self.read_state(&mut r)?;
        Ok(r.n_bytes())
    }

    pub fn state_save_file(&self, path: impl AsRef<Path>, tokens: &[Token]) -> Result<()> {
        let path = path.as_ref();
        let mut w = IoWriter::new(BufWriter::new(File::create(path)?));
        w.write_u32(SESSION_MAGIC)?;
        w.write_u32(SESSION_VERSION)?;
        w.write_u32(tokens.len() as u32)?;
        w.write_i32s(tokens)?;
        self.write_state(&mut w)?;
        w.into_inner().flush()?;
        tracing::debug!(path = %path.display(), n_tokens = tokens.len(), "session saved");
        Ok(())
    }

    /// Restore a session file, returning its token prompt.
    ///
    /// Fails if the prompt holds more than `token_capacity` tokens.
    pub fn state_load_file(
        &mut self,
        path: impl AsRef<Path>,
        token_capacity: usize,
    ) -> Result<Vec<Token>> {
        let path = path.as_ref();
        let mmap = map_file(path)?;
        let mut r = SliceReader::new(&mmap);

        check_header(&mut r, SESSION_MAGIC, SESSION_VERSION, path)?;
        let tokens = read_tokens(&mut r, token_capacity)?;
        self.read_state(&mut r)?;
        if let Err(e) = check_consumed(&r, path) {
            self.kv_cache_mut().clear();
            self.outputs_mut().discard();
            return Err(e);
        }
        tracing::debug!(path = %path.display(), n_tokens = tokens.len(), "session loaded");
        Ok(tokens)
    }

    /// Bytes [`state_seq_get_data`](Self::state_seq_get_data) will write
    pub fn state_seq_size(&self, seq_id: SeqId) -> usize {
        let mut counter = SizeCounter::default();
        match write_kv(&mut counter, self.kv_cache(), Some(seq_id)) {
            Ok(()) => counter.n_bytes(),
            Err(e) => {
                tracing::error!(seq_id, error = %e, "failed to measure sequence state");
                0
            }
        }
    }

    pub fn state_seq_get_data(&self, dst: &mut [u8], seq_id: SeqId) -> Result<usize> {
        let mut w = BufferWriter::new(dst);
        write_kv(&mut w, self.kv_cache(), Some(seq_id))?;
        Ok(w.n_bytes())
    }

    /// Restore a saved sequence as `dest`, replacing what `dest` held
    pub fn state_seq_set_data(&mut self, src: &[u8], dest: SeqId) -> Result<usize> {
        let mut r = SliceReader::new(src);
        let n_seq_max = self.n_seq_max();
        read_kv(&mut r, self.kv_cache_mut(), n_seq_max, Some(dest))?;
        Ok(r.n_bytes())
    }

    /// Save one sequence and its prompt, returning the file size
    pub fn state_seq_save_file(
        &self,
        path: impl AsRef<Path>,
        seq_id: SeqId,
        tokens: &[Token],
    ) -> Result<usize> {
        let mut w = IoWriter::new(BufWriter::new(File::create(path.as_ref())?));
        w.write_u32(SEQ_MAGIC)?;
        w.write_u32(SEQ_VERSION)?;
        w.write_u32(tokens.len() as u32)?;
        w.write_i32s(tokens)?;
        write_kv(&mut w, self.kv_cache(), Some(seq_id))?;
        let n = w.n_bytes();
        w.into_inner().flush()?;
        Ok(n)
    }

    pub fn state_seq_load_file(
        &mut self,
        path: impl AsRef<Path>,
        dest: SeqId,
        token_capacity: usize,
    ) -> Result<Vec<Token>> {
        let path = path.as_ref();
        let mmap = map_file(path)?;
        let mut r = SliceReader::new(&mmap);

        check_header(&mut r, SEQ_MAGIC, SEQ_VERSION, path)?;
        let tokens = read_tokens(&mut r, token_capacity)?;
        let n_seq_max = self.n_seq_max();
        read_kv(&mut r, self.kv_cache_mut(), n_seq_max, Some(dest))?;
        if let Err(e) = check_consumed(&r, path) {
            self.kv_cache_mut().seq_rm(Some(dest), ..);
            return Err(e);
        }
        Ok(tokens)
    }

    fn write_state<W: StateWriter>(&self, w: &mut W) -> Result<()> {
        w.write_string(&self.model().model_type)?;

        let outputs = self.outputs();
        let positions = outputs.output_positions();
        w.write_u32(positions.len() as u32)?;
        w.write_i32s(&positions)?;

        let logits = outputs.logits();
        w.write_u64(logits.len() as u64)?;
        w.write_f32s(logits)?;

        let embd = outputs.embeddings();
        w.write_u64(embd.len() as u64)?;
        w.write_f32s(embd)?;

        write_kv(w, self.kv_cache(), None)
    }

    fn read_state<R: StateReader>(&mut self, r: &mut R) -> Result<()> {
        let arch = r.read_string()?;
        if arch != self.model().model_type {
            return Err(Error::StateError {
                reason: format!(
                    "wrong model arch: '{arch}', expected '{}'",
                    self.model().model_type
                ),
            });
        }

        let n_outputs = r.read_u32()? as usize;
        let params = self.params().clone();
        let has_logits = !params.embeddings;
        let has_embd = params.embeddings && params.pooling_type() == PoolingType::None;
        self.outputs_mut().reserve(
            n_outputs,
            params.n_batch,
            params.n_seq_max,
            has_logits,
            has_embd,
        )?;

        let positions = r.read_i32s(n_outputs)?;
        let mut out_ids = Vec::with_capacity(n_outputs);
        for &id in &positions {
            if id < 0 || id as usize >= params.n_batch {
                return Err(Error::StateError {
                    reason: format!("invalid output id, {id} does not fit in batch size {}", params.n_batch),
                });
            }
            out_ids.push(id as usize);
        }

        let outputs = self.outputs_mut();
        outputs.map_outputs(&out_ids);

        let n_logits = r.read_u64()? as usize;
        if n_logits > outputs.logits.len() {
            return Err(Error::StateError {
                reason: format!(
                    "logits buffer too small ({n_logits} > {})",
                    outputs.logits.len()
                ),
            });
        }
        r.read_f32s_to(&mut outputs.logits[..n_logits])?;

        let n_embd = r.read_u64()? as usize;
        if n_embd > outputs.embd.len() {
            return Err(Error::StateError {
                reason: format!("embeddings buffer too small ({n_embd} > {})", outputs.embd.len()),
            });
        }
        r.read_f32s_to(&mut outputs.embd[..n_embd])?;

        let n_seq_max = params.n_seq_max;
        read_kv(r, self.kv_cache_mut(), n_seq_max, None)
    }
}

fn map_file(path: &Path) -> Result<Mmap> {
    let file = File::open(path).map_err(|e| Error::StateError {
        reason: format!("failed to open {}: {e}", path.display()),
    })?;
    // SAFETY: the file is opened read-only and only read through the map.
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(mmap)
}

fn check_header<R: StateReader>(r: &mut R, magic: u32, version: u32, path: &Path) -> Result<()> {
    let m = r.read_u32()?;
    let v = r.read_u32()?;
    if m != magic || v != version {
        return Err(Error::StateError {
            reason: format!(
                "unknown session format in {} (magic 0x{m:08x}, version {v})",
                path.display()
            ),
        });
    }
    Ok(())
}

fn read_tokens<R: StateReader>(r: &mut R, capacity: usize) -> Result<Vec<Token>> {
    let n = r.read_u32()? as usize;
    if n > capacity {
        return Err(Error::StateError {
            reason: format!("token count in session file exceeded capacity ({n} > {capacity})"),
        });
    }
    r.read_i32s(n)
}

fn check_consumed(r: &SliceReader<'_>, path: &Path) -> Result<()> {
    if r.remaining() != 0 {
        return Err(Error::StateError {
            reason: format!(
                "{} trailing bytes after the session data in {}",
                r.remaining(),
                path.display()
            ),
        });
    }
    Ok(())
}
