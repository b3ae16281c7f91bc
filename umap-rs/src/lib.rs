//! Uniform Manifold Approximation and Projection: exact kNN search, the fuzzy
//! simplicial set of the kNN graph, and the low-dimensional layout.

#[allow(unused_extern_crates)]
extern crate blas_src;

pub mod curve;
pub mod fuzzy;
pub mod knn;
pub mod layout;

pub use layout::Umap;
