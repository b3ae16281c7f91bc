use thiserror::Error;

/// Precondition failures raised by operations on an [`crate::AnnData`].
///
/// Operations return these wrapped in `anyhow::Error`; callers that need to
/// tell them apart use `err.downcast_ref::<AnnError>()`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AnnError {
    #[error("Gene {0} not in var_names")]
    GeneNotFound(String),

    #[error("layer {0:?} not found")]
    MissingLayer(String),

    #[error("obs column {0:?} not found")]
    MissingColumn(String),

    #[error("The data is not raw counts: {0}")]
    NotRawCounts(String),

    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: String,
        expected: (usize, usize),
        actual: (usize, usize),
    },
}
