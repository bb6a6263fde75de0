//! Session persistence.
//!
//! Layout of a whole-context state, all integers little-endian:
//!
//! ```text
//! u32 len, arch bytes
//! u32 n_outputs, i32 batch index per output row
//! u64 n, f32 logits[n]
//! u64 n, f32 embeddings[n]
//! cache section
//! ```
//!
//! The cache section is `u32 cell_count`, then `(i32 pos, u32 n_seq_id,
//! i32 seq_id[n_seq_id])` per cell, then `u32 v_trans, u32 n_layer` and the
//! key rows and value rows (or value elements when transposed) of every
//! layer, each prefixed by its type and row size. Session files put a
//! magic, a version and the token prompt in front.

mod io;
mod kv;
mod session;

pub use io::{BufferWriter, IoWriter, SizeCounter, SliceReader, StateReader, StateWriter};
pub use session::{SEQ_MAGIC, SEQ_VERSION, SESSION_MAGIC, SESSION_VERSION};
