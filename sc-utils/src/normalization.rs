use ann_types::Matrix;
use ndarray::{Array1, Array2};

/// Scale each observation so its counts sum to `target_sum`. Observations with
/// no counts stay at zero.
pub fn normalize_total(matrix: &mut Matrix, target_sum: f64) {
    let factors = matrix
        .row_sums()
        .mapv_into(|total| if total > 0.0 { target_sum / total } else { 1.0 });
    matrix.scale_rows(&factors.view());
}

/// Apply `x -> ln(1 + x)`. Sparse matrices stay sparse.
pub fn log1p(matrix: &mut Matrix) {
    matrix.map_stored_inplace(f64::ln_1p);
}

/// Centre each feature to zero mean and scale it to unit variance (ddof = 1),
/// then clip values above `max_value`. Constant features are only centred.
/// The result is dense.
pub fn scale(matrix: &mut Matrix, max_value: Option<f64>) {
    let (mean, var) = matrix.column_mean_var();
    let std: Array1<f64> = var.mapv(|v| if v > 0.0 { v.sqrt() } else { 1.0 });

    let dense = std::mem::replace(matrix, Matrix::Dense(Array2::zeros((0, 0))));
    let mut x = dense.into_dense();
    for mut row in x.rows_mut() {
        row -= &mean;
        row /= &std;
    }
    if let Some(max) = max_value {
        x.mapv_inplace(|v| if v > max { max } else { v });
    }
    *matrix = Matrix::Dense(x);
}
