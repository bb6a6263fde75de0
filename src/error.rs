//! seqcache error types

use crate::format::GgmlType;

/// seqcache result type
pub type Result<T> = std::result::Result<T, Error>;

/// seqcache errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Model description error
    #[error("model error: {reason}")]
    ModelError {
        /// Description of what went wrong
        reason: String,
    },

    /// Invalid argument to an operation
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// KV cache error
    #[error("kv cache error: {reason}")]
    CacheError {
        /// Description of what went wrong
        reason: String,
    },

    /// Batch construction or splitting error
    #[error("batch error: {reason}")]
    BatchError {
        /// Description of what went wrong
        reason: String,
    },

    /// Graph construction error
    #[error("graph error: {reason}")]
    GraphError {
        /// Description of what went wrong
        reason: String,
    },

    /// Backend execution error
    #[error("backend error: {reason}")]
    BackendError {
        /// Description of what went wrong
        reason: String,
    },

    /// Element type not handled by an operation
    #[error("unsupported cache type {ty:?} for {op}")]
    UnsupportedType {
        /// The element type
        ty: GgmlType,
        /// The operation that rejected it
        op: &'static str,
    },

    /// Session / state persistence error
    #[error("state error: {reason}")]
    StateError {
        /// Description of what went wrong
        reason: String,
    },

    /// Underlying I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
