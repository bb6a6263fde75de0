//! Scalar identifiers shared by the cache and the batching code.

/// Token id in the model vocabulary
pub type Token = i32;

/// Absolute position of a token within its sequence
pub type Pos = i32;

/// Logical sequence (conversation) identifier
pub type SeqId = i32;

/// Position stored in an empty cell
pub const EMPTY_POS: Pos = -1;
