use ndarray::{Array2, ArrayView1};
use sprs::{CsMat, TriMat};

const BANDWIDTH: f64 = 1.0;
const N_ITER: usize = 64;
const SMOOTH_K_TOLERANCE: f64 = 1e-5;
const MIN_K_DIST_SCALE: f64 = 1e-3;

/// Fuzzy simplicial set of a kNN graph, as a symmetric sparse matrix of
/// membership strengths.
///
/// `knn_indices` / `knn_distances` are `n × k` and exclude the point itself
/// (see [`crate::knn::nearest_neighbors`]). Each point's local metric is
/// normalized so that its nearest neighbor sits at distance zero, and the
/// resulting directed graph is symmetrized with a fuzzy union
/// (`set_op_mix_ratio = 1`) or intersection (`0`), or a mix of both.
pub fn fuzzy_simplicial_set(
    knn_indices: &Array2<usize>,
    knn_distances: &Array2<f64>,
    local_connectivity: f64,
    set_op_mix_ratio: f64,
) -> CsMat<f64> {
    let n = knn_indices.nrows();
    let (sigmas, rhos) = smooth_knn_distances(knn_distances, local_connectivity);

    let mut tri = TriMat::new((n, n));
    for i in 0..n {
        for (&j, &d) in knn_indices.row(i).iter().zip(knn_distances.row(i)) {
            if j == usize::MAX || j == i {
                continue;
            }
            let w = if d - rhos[i] <= 0.0 || sigmas[i] == 0.0 {
                1.0
            } else {
                (-(d - rhos[i]) / sigmas[i]).exp()
            };
            tri.add_triplet(i, j, w);
        }
    }
    let directed: CsMat<f64> = tri.to_csr();
    let transpose: CsMat<f64> = directed.transpose_view().to_csr();

    let prod = sprs::binop::mul_mat_same_storage(&directed, &transpose);
    let sum = &directed + &transpose;
    let union = &(&sum - &prod) * set_op_mix_ratio;
    let intersection = &prod * (1.0 - set_op_mix_ratio);
    let combined = &union + &intersection;

    // a pure intersection leaves explicit zeros for one-sided edges
    let mut nonzero = TriMat::with_capacity((n, n), combined.nnz());
    for (&v, (i, j)) in combined.iter() {
        if v > 0.0 {
            nonzero.add_triplet(i, j, v);
        }
    }
    let graph: CsMat<f64> = nonzero.to_csr();
    log::info!("fuzzy graph over {} points has {} edges", n, graph.nnz());
    graph
}

/// Per-point `(sigma, rho)`: `rho` is the distance to the nearest neighbor
/// (interpolated by `local_connectivity`) and `sigma` the bandwidth making the
/// membership strengths sum to `log2(k + 1)`.
pub(crate) fn smooth_knn_distances(knn_distances: &Array2<f64>, local_connectivity: f64) -> (Vec<f64>, Vec<f64>) {
    let (n, k) = knn_distances.dim();
    let mut rhos = vec![0.0; n];
    let mut sigmas = vec![0.0; n];
    let target = ((k + 1) as f64).log2() * BANDWIDTH;
    let mean_all = if n * k > 0 {
        knn_distances.iter().filter(|d| d.is_finite()).sum::<f64>() / (n * k) as f64
    } else {
        0.0
    };

    for i in 0..n {
        let row = knn_distances.row(i);
        let nonzero = row.iter().copied().filter(|&d| d > 0.0 && d.is_finite()).collect::<Vec<_>>();
        if nonzero.len() as f64 >= local_connectivity {
            let index = local_connectivity.floor() as usize;
            let interpolation = local_connectivity - local_connectivity.floor();
            if index > 0 {
                rhos[i] = nonzero[index - 1];
                if interpolation > SMOOTH_K_TOLERANCE && index < nonzero.len() {
                    rhos[i] += interpolation * (nonzero[index] - nonzero[index - 1]);
                }
            } else {
                rhos[i] = interpolation * nonzero[0];
            }
        } else if !nonzero.is_empty() {
            rhos[i] = nonzero.iter().fold(f64::MIN, |a, &b| a.max(b));
        }

        sigmas[i] = bandwidth_search(row, rhos[i], target);

        let floor = if rhos[i] > 0.0 {
            MIN_K_DIST_SCALE * row.iter().filter(|d| d.is_finite()).sum::<f64>() / k as f64
        } else {
            MIN_K_DIST_SCALE * mean_all
        };
        if sigmas[i] < floor {
            sigmas[i] = floor;
        }
    }
    (sigmas, rhos)
}

/// Binary search for the sigma of one point.
fn bandwidth_search(distances: ArrayView1<f64>, rho: f64, target: f64) -> f64 {
    let mut lo = 0.0;
    let mut mid = 1.0;
    let mut hi = f64::INFINITY;

    for _ in 0..N_ITER {
        let psum: f64 = distances
            .iter()
            .filter(|d| d.is_finite())
            .map(|&d| {
                let delta = d - rho;
                if delta > 0.0 {
                    (-delta / mid).exp()
                } else {
                    1.0
                }
            })
            .sum();

        if (psum - target).abs() < SMOOTH_K_TOLERANCE {
            break;
        }
        if psum > target {
            hi = mid;
            mid = (lo + hi) / 2.0;
        } else {
            lo = mid;
            if hi.is_infinite() {
                mid *= 2.0;
            } else {
                mid = (lo + hi) / 2.0;
            }
        }
    }
    mid
}
