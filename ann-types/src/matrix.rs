use ndarray::{Array1, Array2, ArrayView1, Axis};
use sprs::{CsMat, TriMat};

/// Observation-by-feature numeric matrix. Sparse matrices are kept in CSR
/// layout, one compressed row per observation.
#[derive(Clone, Debug, PartialEq)]
pub enum Matrix {
    Dense(Array2<f64>),
    Sparse(CsMat<f64>),
}

impl Matrix {
    /// Build a CSR matrix from `(row, col, value)` triplets. Duplicates are summed.
    pub fn sparse_from_triplets(
        shape: (usize, usize),
        triplets: impl IntoIterator<Item = (usize, usize, f64)>,
    ) -> Self {
        let mut tri = TriMat::new(shape);
        for (r, c, v) in triplets {
            tri.add_triplet(r, c, v);
        }
        Matrix::Sparse(tri.to_csr())
    }

    /// The same matrix with sparse storage converted to CSR.
    pub fn into_csr(self) -> Matrix {
        match self {
            Matrix::Sparse(m) => Matrix::from(m),
            dense => dense,
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        match self {
            Matrix::Dense(m) => m.dim(),
            Matrix::Sparse(m) => (m.rows(), m.cols()),
        }
    }

    pub fn rows(&self) -> usize {
        self.shape().0
    }

    pub fn cols(&self) -> usize {
        self.shape().1
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, Matrix::Sparse(_))
    }

    /// True if the sparse representation leaves at least one entry implicit (zero).
    fn has_implicit_zeros(m: &CsMat<f64>) -> bool {
        m.nnz() < m.rows() * m.cols()
    }

    /// Largest entry, counting implicit zeros of a sparse matrix. `None` if empty.
    pub fn max(&self) -> Option<f64> {
        if self.rows() == 0 || self.cols() == 0 {
            return None;
        }
        let v = match self {
            Matrix::Dense(m) => m.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v)),
            Matrix::Sparse(m) => {
                let start = if Self::has_implicit_zeros(m) { 0.0 } else { f64::NEG_INFINITY };
                m.data().iter().fold(start, |acc, &v| acc.max(v))
            }
        };
        Some(v)
    }

    /// Smallest entry, counting implicit zeros of a sparse matrix. `None` if empty.
    pub fn min(&self) -> Option<f64> {
        if self.rows() == 0 || self.cols() == 0 {
            return None;
        }
        let v = match self {
            Matrix::Dense(m) => m.fold(f64::INFINITY, |acc, &v| acc.min(v)),
            Matrix::Sparse(m) => {
                let start = if Self::has_implicit_zeros(m) { 0.0 } else { f64::INFINITY };
                m.data().iter().fold(start, |acc, &v| acc.min(v))
            }
        };
        Some(v)
    }

    /// Dense copy of column `j` (one value per observation).
    pub fn column(&self, j: usize) -> Array1<f64> {
        match self {
            Matrix::Dense(m) => m.column(j).to_owned(),
            Matrix::Sparse(m) => m
                .outer_iterator()
                .map(|row| row.get(j).copied().unwrap_or(0.0))
                .collect(),
        }
    }

    /// Copy of the matrix restricted to `cols`, in the order given.
    pub fn select_columns(&self, cols: &[usize]) -> Matrix {
        match self {
            Matrix::Dense(m) => Matrix::Dense(m.select(Axis(1), cols)),
            Matrix::Sparse(m) => {
                let mut new_pos: Vec<Vec<usize>> = vec![Vec::new(); m.cols()];
                for (new, &old) in cols.iter().enumerate() {
                    new_pos[old].push(new);
                }
                let mut tri = TriMat::new((m.rows(), cols.len()));
                for (r, row) in m.outer_iterator().enumerate() {
                    for (c, &v) in row.iter() {
                        for &n in &new_pos[c] {
                            tri.add_triplet(r, n, v);
                        }
                    }
                }
                Matrix::Sparse(tri.to_csr())
            }
        }
    }

    pub fn to_dense(&self) -> Array2<f64> {
        match self {
            Matrix::Dense(m) => m.clone(),
            Matrix::Sparse(m) => m.to_dense(),
        }
    }

    pub fn into_dense(self) -> Array2<f64> {
        match self {
            Matrix::Dense(m) => m,
            Matrix::Sparse(m) => m.to_dense(),
        }
    }

    /// Per-observation totals.
    pub fn row_sums(&self) -> Array1<f64> {
        match self {
            Matrix::Dense(m) => m.sum_axis(Axis(1)),
            Matrix::Sparse(m) => m.outer_iterator().map(|row| row.data().iter().sum()).collect(),
        }
    }

    /// Per-feature mean and sample variance (ddof = 1). Variance is zero for fewer than two rows.
    pub fn column_mean_var(&self) -> (Array1<f64>, Array1<f64>) {
        let (n, p) = self.shape();
        let mut sum = Array1::<f64>::zeros(p);
        let mut sum_sq = Array1::<f64>::zeros(p);
        match self {
            Matrix::Dense(m) => {
                for row in m.rows() {
                    for (j, &v) in row.iter().enumerate() {
                        sum[j] += v;
                        sum_sq[j] += v * v;
                    }
                }
            }
            Matrix::Sparse(m) => {
                for row in m.outer_iterator() {
                    for (j, &v) in row.iter() {
                        sum[j] += v;
                        sum_sq[j] += v * v;
                    }
                }
            }
        }
        if n == 0 {
            return (sum, sum_sq);
        }
        let nf = n as f64;
        let mean = sum / nf;
        let var = if n < 2 {
            Array1::zeros(p)
        } else {
            ((sum_sq - &mean.mapv(|m| m * m) * nf) / (nf - 1.0)).mapv_into(|v| v.max(0.0))
        };
        (mean, var)
    }

    /// `A · v` for a vector with one entry per column.
    pub fn dot_vec(&self, v: &ArrayView1<f64>) -> Array1<f64> {
        match self {
            Matrix::Dense(m) => m.dot(v),
            Matrix::Sparse(m) => m
                .outer_iterator()
                .map(|row| row.iter().map(|(c, &x)| x * v[c]).sum())
                .collect(),
        }
    }

    /// `Aᵀ · u` for a vector with one entry per row.
    pub fn tdot_vec(&self, u: &ArrayView1<f64>) -> Array1<f64> {
        match self {
            Matrix::Dense(m) => m.t().dot(u),
            Matrix::Sparse(m) => {
                let mut out = Array1::zeros(m.cols());
                for (r, row) in m.outer_iterator().enumerate() {
                    let ur = u[r];
                    if ur == 0.0 {
                        continue;
                    }
                    for (c, &x) in row.iter() {
                        out[c] += x * ur;
                    }
                }
                out
            }
        }
    }

    /// Multiply each row `i` by `factors[i]`, keeping the storage type.
    pub fn scale_rows(&mut self, factors: &ArrayView1<f64>) {
        match self {
            Matrix::Dense(m) => {
                for (mut row, &f) in m.rows_mut().into_iter().zip(factors.iter()) {
                    row *= f;
                }
            }
            Matrix::Sparse(m) => {
                let shape = (m.rows(), m.cols());
                let owned = std::mem::replace(m, CsMat::zero(shape));
                let (indptr, indices, mut data) = owned.into_raw_storage();
                for (i, w) in indptr.windows(2).enumerate() {
                    for v in &mut data[w[0]..w[1]] {
                        *v *= factors[i];
                    }
                }
                *m = CsMat::new(shape, indptr, indices, data);
            }
        }
    }

    /// Apply `f` to every stored entry. For sparse matrices implicit zeros are
    /// untouched, so `f(0.0)` must be `0.0`.
    pub fn map_stored_inplace(&mut self, f: impl Fn(f64) -> f64) {
        match self {
            Matrix::Dense(m) => m.mapv_inplace(f),
            Matrix::Sparse(m) => m.map_inplace(|&v| f(v)),
        }
    }
}

impl From<CsMat<f64>> for Matrix {
    fn from(m: CsMat<f64>) -> Self {
        if m.is_csr() {
            Matrix::Sparse(m)
        } else {
            Matrix::Sparse(m.to_csr())
        }
    }
}
