//! Error types for graph construction, evaluation and persistence.

use thiserror::Error;

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, NetError>;

#[derive(Error, Debug)]
pub enum NetError {
    /// Malformed or truncated file, wrong root tag, unknown enum code.
    #[error("format error: {0}")]
    Format(String),

    /// A node reference outside the node collection.
    #[error("node index {index} out of range (graph holds {len} nodes)")]
    IndexOutOfRange { index: usize, len: usize },

    /// Inputs or targets fed with differing column counts.
    #[error("batch size mismatch: expected {expected} columns, found {found}")]
    BatchSizeMismatch { expected: usize, found: usize },

    /// Row count (or element count) disagreeing with what a layer expects.
    #[error("shape mismatch in {what}: expected {expected}, found {found}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    /// `iterate` called before any training data was added.
    #[error("no training data has been added")]
    EmptyTrainingSet,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("matrix shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

impl NetError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        NetError::Format(msg.into())
    }

    pub(crate) fn shape(what: &'static str, expected: usize, found: usize) -> Self {
        NetError::ShapeMismatch { what, expected, found }
    }
}
