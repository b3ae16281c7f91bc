//! Annotated observation-by-feature matrices, the data model shared by the
//! single-cell notebook helpers.

pub mod anndata;
pub mod categorical;
pub mod error;
pub mod frame;
pub mod matrix;

pub use anndata::AnnData;
pub use categorical::Categorical;
pub use error::AnnError;
pub use frame::{Column, Frame};
pub use matrix::Matrix;

/// Name of the layer holding unnormalized counts.
pub const COUNTS_LAYER: &str = "counts";
