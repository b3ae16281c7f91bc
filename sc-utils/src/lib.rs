//! # sc-utils: helpers for single-cell RNA-seq analysis notebooks

#![deny(missing_docs)]

#[allow(unused_extern_crates)]
extern crate blas_src;

/// Output directory layout
pub mod dirs;

/// Font discovery and registration for figures
pub mod fonts;

/// Notebook path configuration
pub mod paths;

/// Feature filtering by gene symbol
pub mod gene_filter;

/// Binary expression status of one gene
pub mod expression;

/// Count matrix normalization
pub mod normalization;

/// Principal component analysis
pub mod dim_red;

/// Nearest-neighbor graphs
pub mod neighbors;

/// The minimal processing pipeline
pub mod pipeline;

/// 10x MTX loading routine
pub mod mtx;

/// CSV export of annotations and embeddings
pub mod tables;

pub use ann_types::{AnnData, AnnError, Categorical, Column, Frame, Matrix, COUNTS_LAYER};
