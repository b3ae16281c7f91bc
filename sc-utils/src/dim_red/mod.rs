//! PCA is computed as a truncated SVD of the column-centred data matrix. The
//! solvers only need matrix-vector products with the data, so the centring is
//! applied implicitly by [`CenteredMatrix`] and sparse counts are never
//! densified on the Lanczos path.

use ann_types::Matrix;
use anyhow::{bail, Error};
use log::{info, warn};
use ndarray::{s, Array1, Array2, ArrayView1, Axis};
use ndarray_linalg::SVD;

/// Lanczos bidiagonalization (IRLBA) solver
pub mod lanczos;

pub use lanczos::Lanczos;

/// Truncated SVD `(U, S, V)`: `U` is rows × k, `S` has k values in decreasing
/// order, `V` is cols × k.
pub type SvdResult = (Array2<f64>, Array1<f64>, Array2<f64>);

/// A linear operator the SVD solvers can work with.
pub trait MatOp {
    /// `(rows, cols)`
    fn shape(&self) -> (usize, usize);

    /// `A · v`, with one entry of `v` per column
    fn dot(&self, v: &ArrayView1<f64>) -> Array1<f64>;

    /// `Aᵀ · u`, with one entry of `u` per row
    fn tdot(&self, u: &ArrayView1<f64>) -> Array1<f64>;

    /// Dense copy of the operator
    fn to_dense(&self) -> Array2<f64>;
}

impl MatOp for Matrix {
    fn shape(&self) -> (usize, usize) {
        Matrix::shape(self)
    }

    fn dot(&self, v: &ArrayView1<f64>) -> Array1<f64> {
        self.dot_vec(v)
    }

    fn tdot(&self, u: &ArrayView1<f64>) -> Array1<f64> {
        self.tdot_vec(u)
    }

    fn to_dense(&self) -> Array2<f64> {
        Matrix::to_dense(self)
    }
}

/// `A - 1·μᵀ` for the column means `μ` of `A`, without materializing it.
pub struct CenteredMatrix<'a> {
    inner: &'a Matrix,
    means: Array1<f64>,
}

impl<'a> CenteredMatrix<'a> {
    /// Centre `inner` on its column means.
    pub fn new(inner: &'a Matrix) -> CenteredMatrix<'a> {
        let (means, _) = inner.column_mean_var();
        CenteredMatrix { inner, means }
    }
}

impl MatOp for CenteredMatrix<'_> {
    fn shape(&self) -> (usize, usize) {
        self.inner.shape()
    }

    fn dot(&self, v: &ArrayView1<f64>) -> Array1<f64> {
        let offset = self.means.dot(v);
        self.inner.dot_vec(v).mapv_into(|x| x - offset)
    }

    fn tdot(&self, u: &ArrayView1<f64>) -> Array1<f64> {
        let total = u.sum();
        self.inner.tdot_vec(u) - &(&self.means * total)
    }

    fn to_dense(&self) -> Array2<f64> {
        let mut dense = self.inner.to_dense();
        for mut row in dense.rows_mut() {
            row -= &self.means;
        }
        dense
    }
}

/// A truncated SVD solver.
pub trait Pca {
    /// Rank-`k` truncated SVD of `matrix`.
    fn run_pca<T: MatOp>(&self, matrix: &T, k: usize) -> Result<SvdResult, Error>;
}

/// Exact SVD of the densified matrix, truncated to `k` components.
#[derive(Clone, Copy, Debug, Default)]
pub struct FullSvd;

impl Pca for FullSvd {
    fn run_pca<T: MatOp>(&self, matrix: &T, k: usize) -> Result<SvdResult, Error> {
        let (m, n) = matrix.shape();
        check_dims(m, n, k)?;
        let dense = matrix.to_dense();
        let (u, sigma, vt) = dense.svd(true, true)?;
        let (Some(u), Some(vt)) = (u, vt) else {
            bail!("SVD did not return singular vectors")
        };
        Ok((
            u.slice(s![.., 0..k]).to_owned(),
            sigma.slice(s![0..k]).to_owned(),
            vt.slice(s![0..k, ..]).t().to_owned(),
        ))
    }
}

pub(crate) fn check_dims(m: usize, n: usize, k: usize) -> Result<(), Error> {
    if m < 2 || n < 2 {
        bail!("The input matrix must be at least 2x2, got {}x{}", m, n);
    }
    if k == 0 || k > m.min(n) {
        bail!("invalid number of components {} for a {}x{} matrix", k, m, n);
    }
    Ok(())
}

/// Principal components of a matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct PcaResult {
    /// observations × k projections onto the components
    pub scores: Array2<f64>,
    /// features × k component loadings
    pub loadings: Array2<f64>,
    /// variance explained by each component
    pub variance: Array1<f64>,
    /// `variance` as a fraction of the total variance
    pub variance_ratio: Array1<f64>,
}

/// PCA with the solver picked from the shape: Lanczos unless its Krylov
/// subspace would span the whole matrix, in which case the exact SVD is used.
pub fn pca(matrix: &Matrix, n_comps: usize) -> Result<PcaResult, Error> {
    let (m, n) = matrix.shape();
    if Lanczos::subspace_dim(n_comps, m, n).is_some() {
        pca_with(matrix, n_comps, &Lanczos::default())
    } else {
        info!("using exact SVD for {} components of a {}x{} matrix", n_comps, m, n);
        pca_with(matrix, n_comps, &FullSvd)
    }
}

/// PCA on the column-centred `matrix` computed by `solver`. Component signs
/// are fixed so that the largest-magnitude entry of each score column is
/// positive.
pub fn pca_with(matrix: &Matrix, n_comps: usize, solver: &impl Pca) -> Result<PcaResult, Error> {
    let (m, n) = matrix.shape();
    check_dims(m, n, n_comps)?;
    let centered = CenteredMatrix::new(matrix);
    let (mut u, sigma, mut v) = solver.run_pca(&centered, n_comps)?;

    for c in 0..n_comps {
        let col = u.column(c);
        let pivot = col
            .iter()
            .copied()
            .fold(0.0_f64, |best, x| if x.abs() > best.abs() { x } else { best });
        if pivot < 0.0 {
            u.column_mut(c).mapv_inplace(|x| -x);
            v.column_mut(c).mapv_inplace(|x| -x);
        }
    }

    let scores = &u * &sigma.view().insert_axis(Axis(0));
    let variance = sigma.mapv(|s| s * s / (m - 1) as f64);
    let (_, column_var) = matrix.column_mean_var();
    let total = column_var.sum();
    let variance_ratio = if total > 0.0 {
        &variance / total
    } else {
        warn!("matrix has no variance");
        Array1::zeros(n_comps)
    };
    info!(
        "PCA: {} components explain {:.1}% of the variance",
        n_comps,
        100.0 * variance_ratio.sum()
    );

    Ok(PcaResult {
        scores,
        loadings: v,
        variance,
        variance_ratio,
    })
}
