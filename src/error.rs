//! Error types
//!
//! Tensor kernels panic on contract violations the same way a numeric
//! framework raises on a bad shape. Layer entry points validate the caller's
//! bookkeeping (masks, lengths, graph layout) and report it through
//! [`ModelError`].

use thiserror::Error;

/// Errors raised while building layers or running a forward/backward pass.
#[derive(Debug, Error)]
pub enum ModelError {
    /// A configuration value is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// `num_heads * out_feats` must equal `in_feats` so heads can be
    /// flattened back onto the residual path.
    #[error("Head layout mismatch: {num_heads} heads x {out_feats} features != {in_feats} input features")]
    HeadMismatch {
        num_heads: usize,
        out_feats: usize,
        in_feats: usize,
    },

    /// An input tensor does not have the expected shape.
    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Declared lengths disagree with masks or row counts.
    #[error("Length mismatch in {context}: expected {expected}, got {actual}")]
    LengthMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The recurrent encoder is undefined on an empty sequence.
    #[error("Row {row} has no valid positions")]
    EmptySequence { row: usize },

    /// Node features and the batched graph disagree.
    #[error("Graph mismatch in {context}: expected {expected}, got {actual}")]
    GraphMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A graph references nodes that do not exist.
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;

/// Return a [`ModelError::ShapeMismatch`] unless `actual == expected`.
pub(crate) fn check_shape(context: &'static str, expected: &[usize], actual: &[usize]) -> Result<()> {
    if expected != actual {
        return Err(ModelError::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        });
    }
    Ok(())
}
