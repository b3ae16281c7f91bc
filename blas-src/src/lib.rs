//! Links the LAPACK implementation used by `ndarray-linalg` in this workspace.
//! Crates that call into `ndarray-linalg` declare `extern crate blas_src;`.

#[cfg(target_os = "macos")]
extern crate accelerate_src;

#[cfg(not(target_os = "macos"))]
extern crate intel_mkl_src;
