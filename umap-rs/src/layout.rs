//! Low-dimensional layout of a fuzzy simplicial set: spectral initialization
//! followed by stochastic gradient descent on the fuzzy set cross entropy.

use crate::curve::find_ab_params;
use anyhow::{bail, format_err, Error};
use log::{info, warn};
use ndarray::{Array2, ArrayView2, Axis};
use ndarray_linalg::lobpcg::{lobpcg, LobpcgResult};
use ndarray_linalg::{Eigh, TruncatedOrder, UPLO};
use rand::distributions::Standard;
use rand::{Rng, SeedableRng};
use rand_distr::Normal;
use rand_pcg::Pcg64Mcg;
use serde::Deserialize;
use sprs::CsMat;
use std::time::Instant;

const DENSE_EIGEN_MAX_NODES: usize = 1_000;
const SPECTRAL_MAX_NODES: usize = 10_000;
const CLIP: f64 = 4.0;

/// UMAP layout settings.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Umap {
    pub n_components: usize,
    pub min_dist: f64,
    pub spread: f64,
    /// `None` picks 500 epochs for graphs of up to 10 000 nodes and 200 beyond.
    pub n_epochs: Option<usize>,
    pub learning_rate: f64,
    pub repulsion_strength: f64,
    pub negative_sample_rate: usize,
    pub seed: u64,
}

impl Default for Umap {
    fn default() -> Self {
        Umap {
            n_components: 2,
            min_dist: 0.5,
            spread: 1.0,
            n_epochs: None,
            learning_rate: 1.0,
            repulsion_strength: 1.0,
            negative_sample_rate: 5,
            seed: 0,
        }
    }
}

/// Edges of the pruned graph with their sampling schedule.
struct Edges {
    head: Vec<usize>,
    tail: Vec<usize>,
    epochs_per_sample: Vec<f64>,
}

impl Umap {
    pub fn num_epochs(&self, nodes: usize) -> usize {
        match self.n_epochs {
            Some(n) => n,
            None if nodes <= SPECTRAL_MAX_NODES => 500,
            None => 200,
        }
    }

    /// Embed the nodes of a symmetric, weighted graph into `n_components`
    /// dimensions. Rows of the result follow the graph's node order.
    pub fn embed(&self, graph: &CsMat<f64>) -> Result<Array2<f64>, Error> {
        let n = graph.rows();
        if graph.cols() != n {
            bail!("graph must be square, got {} x {}", n, graph.cols());
        }
        if self.n_components == 0 {
            bail!("n_components must be at least 1");
        }
        if self.n_epochs == Some(0) {
            bail!("n_epochs, if provided, must be greater than 0");
        }
        if n == 0 {
            return Ok(Array2::zeros((0, self.n_components)));
        }

        let tick = Instant::now();
        let n_epochs = self.num_epochs(n);
        let mut rng = Pcg64Mcg::seed_from_u64(self.seed);

        let graph = prune(graph, n_epochs);
        let init = initialize(&graph, self.n_components, &mut rng)?;
        let mut embedding = rescale(init);
        let edges = edges(&graph, n_epochs);
        let (a, b) = find_ab_params(self.spread, self.min_dist);
        info!(
            "optimizing layout of {} nodes over {} edges for {} epochs (a = {:.4}, b = {:.4})",
            n,
            edges.head.len(),
            n_epochs,
            a,
            b
        );

        self.optimize(&mut embedding, &edges, n_epochs, a, b, &mut rng);
        info!("umap layout took {:.3}s", tick.elapsed().as_secs_f64());
        Ok(embedding)
    }

    fn optimize(
        &self,
        embedding: &mut Array2<f64>,
        edges: &Edges,
        n_epochs: usize,
        a: f64,
        b: f64,
        rng: &mut impl Rng,
    ) {
        let n = embedding.nrows();
        let dim = embedding.ncols();
        let gamma = self.repulsion_strength;
        let epochs_per_negative_sample = edges
            .epochs_per_sample
            .iter()
            .map(|&e| e / self.negative_sample_rate as f64)
            .collect::<Vec<_>>();
        let mut epoch_of_next_sample = edges.epochs_per_sample.clone();
        let mut epoch_of_next_negative_sample = epochs_per_negative_sample.clone();
        let mut alpha = self.learning_rate;

        for epoch in 0..n_epochs {
            let epoch_f = epoch as f64;
            for i in 0..edges.head.len() {
                if epoch_of_next_sample[i] > epoch_f {
                    continue;
                }
                let j = edges.head[i];
                let k = edges.tail[i];

                let dist_sq = squared_distance(embedding, j, k);
                let grad_coeff = if dist_sq > 0.0 {
                    (-2.0 * a * b * dist_sq.powf(b - 1.0)) / (1.0 + a * dist_sq.powf(b))
                } else {
                    0.0
                };
                for d in 0..dim {
                    let grad_d = (grad_coeff * (embedding[(j, d)] - embedding[(k, d)])).clamp(-CLIP, CLIP);
                    embedding[(j, d)] += grad_d * alpha;
                    embedding[(k, d)] -= grad_d * alpha;
                }
                epoch_of_next_sample[i] += edges.epochs_per_sample[i];

                let n_neg_samples =
                    ((epoch_f - epoch_of_next_negative_sample[i]) / epochs_per_negative_sample[i]).floor();
                for _ in 0..n_neg_samples.max(0.0) as usize {
                    let k = rng.gen_range(0..n);
                    if j == k {
                        continue;
                    }
                    let dist_sq = squared_distance(embedding, j, k);
                    let grad_coeff = if dist_sq > 0.0 {
                        (2.0 * gamma * b) / ((1e-3 + dist_sq) * (1.0 + a * dist_sq.powf(b)))
                    } else {
                        0.0
                    };
                    for d in 0..dim {
                        let grad_d = if grad_coeff > 0.0 {
                            (grad_coeff * (embedding[(j, d)] - embedding[(k, d)])).clamp(-CLIP, CLIP)
                        } else {
                            CLIP
                        };
                        embedding[(j, d)] += grad_d * alpha;
                    }
                }
                epoch_of_next_negative_sample[i] += n_neg_samples * epochs_per_negative_sample[i];
            }
            alpha = self.learning_rate * (1.0 - epoch_f / n_epochs as f64);
        }
    }
}

#[inline]
fn squared_distance(embedding: &Array2<f64>, j: usize, k: usize) -> f64 {
    embedding
        .row(j)
        .iter()
        .zip(embedding.row(k))
        .map(|(x, y)| (x - y) * (x - y))
        .sum()
}

/// Drop edges too weak to be sampled even once over `n_epochs`.
fn prune(graph: &CsMat<f64>, n_epochs: usize) -> CsMat<f64> {
    let max = graph.data().iter().fold(0.0_f64, |acc, &v| acc.max(v));
    let threshold = max / n_epochs as f64;
    let mut pruned = graph.clone();
    pruned.map_inplace(|&v| if v < threshold { 0.0 } else { v });
    pruned
}

fn edges(graph: &CsMat<f64>, n_epochs: usize) -> Edges {
    let mut head = Vec::new();
    let mut tail = Vec::new();
    let mut weights = Vec::new();
    for (row, vec) in graph.outer_iterator().enumerate() {
        for (col, &w) in vec.iter() {
            if w > 0.0 {
                head.push(row);
                tail.push(col);
                weights.push(w);
            }
        }
    }

    let max = weights.iter().fold(0.0_f64, |a, &b| a.max(b));
    let n_epochs = n_epochs as f64;
    let epochs_per_sample = weights
        .iter()
        .map(|&w| {
            let n_samples = n_epochs * w / max;
            if n_samples > 0.0 {
                n_epochs / n_samples
            } else {
                -1.0
            }
        })
        .collect();
    Edges {
        head,
        tail,
        epochs_per_sample,
    }
}

/// Spectral initialization, or uniform noise in (-10, 10) when the graph is too
/// large or the eigensolver fails. Spectral coordinates are expanded so the
/// largest magnitude is 10 and jittered with N(0, 1e-4) noise.
fn initialize(graph: &CsMat<f64>, dim: usize, rng: &mut impl Rng) -> Result<Array2<f64>, Error> {
    let n = graph.rows();
    let spectral = if n > dim + 1 && n <= SPECTRAL_MAX_NODES {
        spectral_layout(graph, dim)
    } else {
        None
    };

    match spectral {
        Some(init) => {
            let max = init.iter().fold(0.0_f64, |acc, &v| acc.max(v.abs()));
            let expansion = if max > 0.0 { 10.0 / max } else { 1.0 };
            let noise = Normal::new(0.0, 1e-4).map_err(|e| format_err!("{e}"))?;
            Ok(init.mapv(|v| v * expansion + rng.sample(noise)))
        }
        None => {
            if n > SPECTRAL_MAX_NODES {
                info!("{} nodes: using a random initialization", n);
            } else {
                warn!("spectral initialization failed, falling back to a random initialization");
            }
            Ok(Array2::from_shape_simple_fn((n, dim), || rng.gen_range(-10.0..10.0)))
        }
    }
}

/// Rescale every coordinate to `[0, 10]`.
fn rescale(mut embedding: Array2<f64>) -> Array2<f64> {
    for mut col in embedding.axis_iter_mut(Axis(1)) {
        let min = col.fold(f64::INFINITY, |a, &b| a.min(b));
        let max = col.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        let range = max - min;
        if range > 0.0 {
            col.mapv_inplace(|v| 10.0 * (v - min) / range);
        } else {
            col.fill(0.0);
        }
    }
    embedding
}

/// `D^-1/2` for the weighted degrees of `graph`; isolated nodes get 0.
fn inv_sqrt_degrees(graph: &CsMat<f64>) -> Vec<f64> {
    graph
        .outer_iterator()
        .map(|row| {
            let deg: f64 = row.data().iter().sum();
            if deg > 0.0 {
                1.0 / deg.sqrt()
            } else {
                0.0
            }
        })
        .collect()
}

/// `(I - D^-1/2 A D^-1/2) · y`
fn laplacian_dot(graph: &CsMat<f64>, d: &[f64], y: &ArrayView2<f64>) -> Array2<f64> {
    let mut out = y.to_owned();
    for (i, row) in graph.outer_iterator().enumerate() {
        for (j, &w) in row.iter() {
            let c = w * d[i] * d[j];
            if c == 0.0 {
                continue;
            }
            for k in 0..y.ncols() {
                out[(i, k)] -= c * y[(j, k)];
            }
        }
    }
    out
}

/// Eigenvectors 1..=dim of the symmetric normalized Laplacian, by increasing eigenvalue.
fn spectral_layout(graph: &CsMat<f64>, dim: usize) -> Option<Array2<f64>> {
    let tick = Instant::now();
    let n = graph.rows();
    let k = dim + 1;
    let d = inv_sqrt_degrees(graph);

    let (values, vectors) = if n <= DENSE_EIGEN_MAX_NODES {
        let l = laplacian_dot(graph, &d, &Array2::eye(n).view());
        match l.eigh(UPLO::Lower) {
            Ok(res) => res,
            Err(err) => {
                warn!("dense eigendecomposition failed: {}", err);
                return None;
            }
        }
    } else {
        let initial = Pcg64Mcg::seed_from_u64(423)
            .sample_iter(Standard)
            .take(n * k)
            .collect::<Vec<f64>>();
        let x = Array2::from_shape_vec((n, k), initial).ok()?;
        let result = lobpcg(
            |y| laplacian_dot(graph, &d, &y),
            x,
            |_| {},
            None,
            1e-8,
            n.min(200),
            TruncatedOrder::Smallest,
        );
        match result {
            LobpcgResult::Ok(values, vecs, r_norms) | LobpcgResult::Err(values, vecs, r_norms, _) => {
                for (i, norm) in r_norms.into_iter().enumerate() {
                    if norm > 1e-4 {
                        warn!("eigenvector {} did not converge, residual norm {}", i, norm);
                    }
                }
                (values, vecs)
            }
            LobpcgResult::NoResult(err) => {
                warn!("LOBPCG did not converge: {:?}", err);
                return None;
            }
        }
    };

    let mut order = (0..values.len()).collect::<Vec<_>>();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    if order.len() < k {
        return None;
    }
    let layout = vectors.select(Axis(1), &order[1..k]);
    info!("spectral initialization of {} nodes took {:.3}s", n, tick.elapsed().as_secs_f64());
    if layout.iter().all(|v| v.is_finite()) {
        Some(layout)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fuzzy, knn};
    use ndarray::{concatenate, s};
    use ndarray_rand::RandomExt;

    fn two_blobs(n: usize) -> Array2<f64> {
        let mut rng = Pcg64Mcg::seed_from_u64(7);
        let a = Array2::random_using((n, 5), Normal::new(0.0, 1.0).unwrap(), &mut rng);
        let b = Array2::random_using((n, 5), Normal::new(20.0, 1.0).unwrap(), &mut rng);
        concatenate(Axis(0), &[a.view(), b.view()]).unwrap()
    }

    fn knn_graph(data: &Array2<f64>, n_neighbors: usize) -> CsMat<f64> {
        let (indices, distances) = knn::nearest_neighbors(&data.view(), n_neighbors - 1);
        fuzzy::fuzzy_simplicial_set(&indices, &distances, 1.0, 1.0)
    }

    fn centroid(e: &ArrayView2<f64>) -> (f64, f64) {
        let m = e.mean_axis(Axis(0)).unwrap();
        (m[0], m[1])
    }

    #[test]
    fn test_embed_separates_clusters() {
        let data = two_blobs(40);
        let umap = Umap {
            n_epochs: Some(200),
            ..Umap::default()
        };
        let emb = umap.embed(&knn_graph(&data, 15)).unwrap();
        assert_eq!(emb.dim(), (80, 2));
        assert!(emb.iter().all(|v| v.is_finite()));

        let (ax, ay) = centroid(&emb.slice(s![..40, ..]));
        let (bx, by) = centroid(&emb.slice(s![40.., ..]));
        let between = ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt();
        let spread_a = emb
            .slice(s![..40, ..])
            .rows()
            .into_iter()
            .map(|r| ((r[0] - ax).powi(2) + (r[1] - ay).powi(2)).sqrt())
            .fold(0.0, f64::max);
        assert!(between > spread_a, "between {between}, within {spread_a}");
    }

    #[test]
    fn test_embed_is_deterministic() {
        let data = two_blobs(20);
        let umap = Umap {
            n_epochs: Some(50),
            ..Umap::default()
        };
        let a = umap.embed(&knn_graph(&data, 10)).unwrap();
        let b = umap.embed(&knn_graph(&data, 10)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_spectral_uses_small_eigenvalues() {
        // path graph 0 - 1 - 2 - 3
        let mut tri = sprs::TriMat::new((4, 4));
        for i in 0..3 {
            tri.add_triplet(i, i + 1, 1.0);
            tri.add_triplet(i + 1, i, 1.0);
        }
        let g: CsMat<f64> = tri.to_csr();
        let layout = spectral_layout(&g, 1).unwrap();
        // the Fiedler vector of a path is monotone along it
        let v = layout.column(0);
        let increasing = (0..3).all(|i| v[i] < v[i + 1]);
        let decreasing = (0..3).all(|i| v[i] > v[i + 1]);
        assert!(increasing || decreasing);
    }

    #[test]
    fn test_rejects_bad_graph() {
        let g = CsMat::<f64>::zero((2, 3));
        assert!(Umap::default().embed(&g).is_err());
        let empty = CsMat::<f64>::zero((0, 0));
        assert_eq!(Umap::default().embed(&empty).unwrap().dim(), (0, 2));
    }

    #[test]
    fn test_prune_and_schedule() {
        let mut tri = sprs::TriMat::new((3, 3));
        tri.add_triplet(0, 1, 1.0);
        tri.add_triplet(1, 0, 1.0);
        tri.add_triplet(1, 2, 0.5);
        tri.add_triplet(2, 1, 0.5);
        tri.add_triplet(0, 2, 0.001);
        tri.add_triplet(2, 0, 0.001);
        let g: CsMat<f64> = tri.to_csr();
        let e = edges(&prune(&g, 200), 200);
        assert_eq!(e.head.len(), 4);
        let mut schedule = e.epochs_per_sample.clone();
        schedule.sort_by(f64::total_cmp);
        assert_eq!(schedule, vec![1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn test_rescale() {
        let e = rescale(ndarray::array![[1.0, -2.0], [3.0, 2.0], [2.0, 0.0]]);
        assert_eq!(e, ndarray::array![[0.0, 0.0], [10.0, 10.0], [5.0, 5.0]]);
    }
}
