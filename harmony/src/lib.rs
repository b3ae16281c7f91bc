//! Harmony integration of a low-dimensional embedding across batches.
//!
//! Cells are softly clustered in cosine space with a penalty that favors
//! clusters mixing every batch; each cluster then contributes a ridge
//! regression of the batch covariates, whose fitted batch effects are
//! subtracted from the original coordinates. The two steps alternate until
//! the objective stops improving.

#[allow(unused_extern_crates)]
extern crate blas_src;

use anyhow::{bail, Error};
use log::{debug, info};
use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use ndarray_linalg::Inverse;
use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};

const KMEANS_WINDOW: usize = 3;
const INIT_KMEANS_ROUNDS: usize = 25;

/// Harmony settings.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Harmony {
    /// Diversity penalty.
    pub theta: f64,
    /// Ridge penalty on the batch coefficients.
    pub lambda: f64,
    /// Soft-clustering bandwidth.
    pub sigma: f64,
    /// `None` uses `min(round(N / 30), 100)`, at least 1.
    pub n_clusters: Option<usize>,
    /// Fraction of cells updated together when reassigning clusters.
    pub block_size: f64,
    pub max_iter_harmony: usize,
    pub max_iter_kmeans: usize,
    pub epsilon_cluster: f64,
    pub epsilon_harmony: f64,
    pub seed: u64,
}

impl Default for Harmony {
    fn default() -> Self {
        Harmony {
            theta: 2.0,
            lambda: 1.0,
            sigma: 0.1,
            n_clusters: None,
            block_size: 0.05,
            max_iter_harmony: 10,
            max_iter_kmeans: 20,
            epsilon_cluster: 1e-5,
            epsilon_harmony: 1e-4,
            seed: 0,
        }
    }
}

impl Harmony {
    /// Corrected copy of `data` (cells × dims). `batches` holds one batch code
    /// per cell; codes need not be contiguous.
    pub fn integrate(&self, data: &ArrayView2<f64>, batches: &[u32]) -> Result<Array2<f64>, Error> {
        let (n_cells, n_dims) = data.dim();
        if n_cells == 0 {
            bail!("cannot integrate an empty embedding");
        }
        if batches.len() != n_cells {
            bail!("{} batch labels for {} cells", batches.len(), n_cells);
        }
        if n_dims < 2 {
            bail!("embedding must have at least 2 dimensions, got {}", n_dims);
        }
        if self.max_iter_harmony == 0 {
            bail!("max_iter_harmony must be at least 1");
        }
        if !(self.block_size > 0.0 && self.block_size <= 1.0) {
            bail!("block_size must be in (0, 1], got {}", self.block_size);
        }

        let mut state = State::new(self, data, batches);
        info!(
            "harmony: {} cells, {} dims, {} batches, {} clusters",
            n_cells, n_dims, state.n_batches, state.n_clusters
        );

        for round in 1..=self.max_iter_harmony {
            state.cluster();
            state.correct()?;
            if state.harmony_converged() {
                info!("harmony converged after {} iterations", round);
                break;
            }
            if round == self.max_iter_harmony {
                info!("harmony stopped after {} iterations without converging", round);
            }
        }
        Ok(state.z_corr.reversed_axes())
    }
}

/// Integration state. Embeddings are stored dims × cells.
struct State<'a> {
    params: &'a Harmony,
    n_clusters: usize,
    n_batches: usize,
    z_orig: Array2<f64>,
    z_corr: Array2<f64>,
    z_cos: Array2<f64>,
    batch_of: Vec<usize>,
    /// batches × cells one-hot design
    phi: Array2<f64>,
    pr_b: Array1<f64>,
    /// dims × clusters centroids
    y: Array2<f64>,
    /// clusters × cells
    r: Array2<f64>,
    dist: Array2<f64>,
    /// clusters × batches, expected and observed counts
    e: Array2<f64>,
    o: Array2<f64>,
    objective_kmeans: Vec<f64>,
    objective_harmony: Vec<f64>,
    rng: Pcg64Mcg,
}

fn cosine_normalize(z: &Array2<f64>) -> Array2<f64> {
    let mut out = z.clone();
    for mut col in out.columns_mut() {
        let norm = col.dot(&col).sqrt();
        if norm > 0.0 {
            col /= norm;
        }
    }
    out
}

impl<'a> State<'a> {
    fn new(params: &'a Harmony, data: &ArrayView2<f64>, batches: &[u32]) -> State<'a> {
        let n_cells = data.nrows();
        let codes = batches
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .enumerate()
            .map(|(i, c)| (c, i))
            .collect::<BTreeMap<_, _>>();
        let n_batches = codes.len();
        let batch_of = batches.iter().map(|c| codes[c]).collect::<Vec<_>>();

        let mut phi = Array2::zeros((n_batches, n_cells));
        for (cell, &b) in batch_of.iter().enumerate() {
            phi[(b, cell)] = 1.0;
        }
        let pr_b = phi.sum_axis(Axis(1)) / n_cells as f64;

        let n_clusters = params
            .n_clusters
            .unwrap_or_else(|| ((n_cells as f64 / 30.0).round() as usize).min(100))
            .clamp(1, n_cells);

        let z_orig = data.t().to_owned();
        let z_cos = cosine_normalize(&z_orig);

        let mut state = State {
            params,
            n_clusters,
            n_batches,
            z_corr: z_orig.clone(),
            z_orig,
            z_cos,
            batch_of,
            phi,
            pr_b,
            y: Array2::zeros((0, 0)),
            r: Array2::zeros((n_clusters, n_cells)),
            dist: Array2::zeros((n_clusters, n_cells)),
            e: Array2::zeros((n_clusters, n_batches)),
            o: Array2::zeros((n_clusters, n_batches)),
            objective_kmeans: Vec::new(),
            objective_harmony: Vec::new(),
            rng: Pcg64Mcg::seed_from_u64(params.seed),
        };
        state.init_clusters();
        state
    }

    fn init_clusters(&mut self) {
        let centroids = kmeans(&self.z_cos.t(), self.n_clusters, INIT_KMEANS_ROUNDS, &mut self.rng);
        self.y = cosine_normalize(&centroids.reversed_axes());
        self.update_dist();

        let sigma = self.params.sigma;
        let mut r = self.dist.mapv(|d| -d / sigma);
        for mut col in r.columns_mut() {
            let max = col.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
            col.mapv_inplace(|v| (v - max).exp());
            let sum = col.sum();
            col /= sum;
        }
        self.r = r;

        let r_sum = self.r.sum_axis(Axis(1));
        self.e = outer(&r_sum, &self.pr_b);
        self.o = self.r.dot(&self.phi.t());

        let objective = self.objective();
        self.objective_kmeans.push(objective);
        self.objective_harmony.push(objective);
    }

    fn update_dist(&mut self) {
        self.dist = self.y.t().dot(&self.z_cos).mapv_into(|v| 2.0 * (1.0 - v));
    }

    fn objective(&self) -> f64 {
        let sigma = self.params.sigma;
        let theta = self.params.theta;
        let kmeans_error = (&self.r * &self.dist).sum();
        let entropy = sigma * self.r.iter().map(|&r| if r > 0.0 { r * r.ln() } else { 0.0 }).sum::<f64>();
        let log_ratio = ndarray::Zip::from(&self.o)
            .and(&self.e)
            .map_collect(|&o, &e| theta * ((o + 1.0) / (e + 1.0)).ln());
        let mut cross_entropy = 0.0;
        for (cell, &b) in self.batch_of.iter().enumerate() {
            for k in 0..self.n_clusters {
                cross_entropy += sigma * self.r[(k, cell)] * log_ratio[(k, b)];
            }
        }
        kmeans_error + entropy + cross_entropy
    }

    fn cluster(&mut self) {
        for i in 0..self.params.max_iter_kmeans {
            self.y = cosine_normalize(&self.z_cos.dot(&self.r.t()));
            self.update_dist();
            self.update_r();
            let objective = self.objective();
            self.objective_kmeans.push(objective);
            if i > KMEANS_WINDOW && self.kmeans_converged() {
                debug!("clustering converged after {} rounds", i + 1);
                break;
            }
        }
        if let Some(&last) = self.objective_kmeans.last() {
            self.objective_harmony.push(last);
        }
    }

    fn update_r(&mut self) {
        let sigma = self.params.sigma;
        let theta = self.params.theta;
        let n_cells = self.z_cos.ncols();

        let mut scale_dist = self.dist.mapv(|d| -d / sigma);
        for mut col in scale_dist.columns_mut() {
            let max = col.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
            col.mapv_inplace(|v| (v - max).exp());
        }

        let mut order = (0..n_cells).collect::<Vec<_>>();
        order.shuffle(&mut self.rng);
        let n_blocks = (1.0 / self.params.block_size).ceil() as usize;
        for block in split_evenly(&order, n_blocks) {
            // take the block out of the expected and observed counts
            for &cell in block {
                let b = self.batch_of[cell];
                for k in 0..self.n_clusters {
                    let rk = self.r[(k, cell)];
                    for bb in 0..self.n_batches {
                        self.e[(k, bb)] -= rk * self.pr_b[bb];
                    }
                    self.o[(k, b)] -= rk;
                }
            }

            for &cell in block {
                let b = self.batch_of[cell];
                let mut sum = 0.0;
                for k in 0..self.n_clusters {
                    let penalty = ((self.e[(k, b)] + 1.0) / (self.o[(k, b)] + 1.0)).powf(theta);
                    let v = scale_dist[(k, cell)] * penalty;
                    self.r[(k, cell)] = v;
                    sum += v;
                }
                if sum > 0.0 {
                    self.r.column_mut(cell).mapv_inplace(|v| v / sum);
                }
            }

            for &cell in block {
                let b = self.batch_of[cell];
                for k in 0..self.n_clusters {
                    let rk = self.r[(k, cell)];
                    for bb in 0..self.n_batches {
                        self.e[(k, bb)] += rk * self.pr_b[bb];
                    }
                    self.o[(k, b)] += rk;
                }
            }
        }
    }

    /// Mixture-of-experts ridge correction: for each cluster, regress the
    /// original coordinates on an intercept plus batch indicators, weighted by
    /// cluster membership, and subtract the batch terms.
    fn correct(&mut self) -> Result<(), Error> {
        let n_terms = self.n_batches + 1;
        let n_cells = self.z_orig.ncols();
        let mut z_corr = self.z_orig.clone();

        for k in 0..self.n_clusters {
            let rk = self.r.row(k);
            // phi_moe = [1; phi] weighted by membership
            let mut phi_rk = Array2::zeros((n_terms, n_cells));
            phi_rk.row_mut(0).assign(&rk);
            for (cell, &b) in self.batch_of.iter().enumerate() {
                phi_rk[(b + 1, cell)] = rk[cell];
            }

            let mut gram = Array2::<f64>::zeros((n_terms, n_terms));
            for cell in 0..n_cells {
                let b = self.batch_of[cell] + 1;
                let w = rk[cell];
                gram[(0, 0)] += w;
                gram[(0, b)] += w;
                gram[(b, 0)] += w;
                gram[(b, b)] += w;
            }
            for t in 1..n_terms {
                gram[(t, t)] += self.params.lambda;
            }

            let mut w = gram.inv()?.dot(&phi_rk.dot(&self.z_orig.t()));
            w.row_mut(0).fill(0.0);
            z_corr -= &w.t().dot(&phi_rk);
        }

        self.z_cos = cosine_normalize(&z_corr);
        self.z_corr = z_corr;
        Ok(())
    }

    fn kmeans_converged(&self) -> bool {
        let n = self.objective_kmeans.len();
        if n < KMEANS_WINDOW + 1 {
            return false;
        }
        let old = self.objective_kmeans[n - KMEANS_WINDOW - 1..n - 1].iter().sum::<f64>();
        let new = self.objective_kmeans[n - KMEANS_WINDOW..].iter().sum::<f64>();
        (old - new).abs() / old.abs() < self.params.epsilon_cluster
    }

    fn harmony_converged(&self) -> bool {
        let n = self.objective_harmony.len();
        if n < 2 {
            return false;
        }
        let old = self.objective_harmony[n - 2];
        let new = self.objective_harmony[n - 1];
        (old - new) / old.abs() < self.params.epsilon_harmony
    }
}

fn outer(a: &Array1<f64>, b: &Array1<f64>) -> Array2<f64> {
    Array2::from_shape_fn((a.len(), b.len()), |(i, j)| a[i] * b[j])
}

/// Split `items` into `n` contiguous blocks whose sizes differ by at most one.
fn split_evenly<T>(items: &[T], n: usize) -> Vec<&[T]> {
    let n = n.max(1);
    let base = items.len() / n;
    let extra = items.len() % n;
    let mut blocks = Vec::with_capacity(n);
    let mut start = 0;
    for i in 0..n {
        let len = base + usize::from(i < extra);
        blocks.push(&items[start..start + len]);
        start += len;
    }
    blocks
}

/// k-means++ seeding followed by Lloyd iterations on the rows of `points`.
/// Returns the `k × dims` centroids.
fn kmeans(points: &ArrayView2<f64>, k: usize, rounds: usize, rng: &mut impl Rng) -> Array2<f64> {
    let (n, d) = points.dim();
    let sq_dist = |a: ndarray::ArrayView1<f64>, b: ndarray::ArrayView1<f64>| -> f64 {
        a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
    };

    let mut centroids = Array2::zeros((k, d));
    centroids.row_mut(0).assign(&points.row(rng.gen_range(0..n)));
    let mut closest = (0..n)
        .map(|i| sq_dist(points.row(i), centroids.row(0)))
        .collect::<Vec<_>>();
    for c in 1..k {
        let next = match WeightedIndex::new(&closest) {
            Ok(dist) => dist.sample(rng),
            Err(_) => rng.gen_range(0..n),
        };
        centroids.row_mut(c).assign(&points.row(next));
        for (i, best) in closest.iter_mut().enumerate() {
            *best = best.min(sq_dist(points.row(i), centroids.row(c)));
        }
    }

    let mut assignment = vec![usize::MAX; n];
    for _ in 0..rounds {
        let mut changed = false;
        for i in 0..n {
            let mut best = (f64::INFINITY, 0);
            for c in 0..k {
                let dist = sq_dist(points.row(i), centroids.row(c));
                if dist < best.0 {
                    best = (dist, c);
                }
            }
            if assignment[i] != best.1 {
                assignment[i] = best.1;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        let mut sums = Array2::<f64>::zeros((k, d));
        let mut counts = vec![0usize; k];
        for (i, &c) in assignment.iter().enumerate() {
            let mut row = sums.row_mut(c);
            row += &points.row(i);
            counts[c] += 1;
        }
        for c in 0..k {
            if counts[c] > 0 {
                let mean = sums.slice(s![c, ..]).mapv(|v| v / counts[c] as f64);
                centroids.row_mut(c).assign(&mean);
            }
        }
    }
    centroids
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::{concatenate, Array1};
    use ndarray_rand::RandomExt;
    use rand_distr::Normal;

    /// Two cell types observed in two batches. Batch 1 is shifted along the
    /// third axis.
    fn shifted_batches(per_group: usize) -> (Array2<f64>, Vec<u32>) {
        let mut rng = Pcg64Mcg::seed_from_u64(11);
        let noise = Normal::new(0.0, 0.3).unwrap();
        let mut blocks = Vec::new();
        let mut batches = Vec::new();
        for batch in 0..2u32 {
            for center in [[4.0, 0.0, 0.0, 0.0, 0.0], [0.0, 4.0, 0.0, 0.0, 0.0]] {
                let mut x = Array2::random_using((per_group, 5), noise, &mut rng);
                x += &Array1::from(center.to_vec());
                if batch == 1 {
                    x.column_mut(2).mapv_inplace(|v| v + 3.0);
                }
                blocks.push(x);
                batches.extend(std::iter::repeat(batch).take(per_group));
            }
        }
        let views = blocks.iter().map(|b| b.view()).collect::<Vec<_>>();
        (concatenate(Axis(0), &views).unwrap(), batches)
    }

    fn batch_gap(x: &Array2<f64>, batches: &[u32]) -> f64 {
        let mean_of = |b: u32| {
            let rows = (0..x.nrows()).filter(|&i| batches[i] == b).collect::<Vec<_>>();
            x.select(Axis(0), &rows).mean_axis(Axis(0)).unwrap()
        };
        let diff = mean_of(0) - mean_of(1);
        diff.dot(&diff).sqrt()
    }

    #[test]
    fn test_reduces_batch_gap() {
        let (x, batches) = shifted_batches(60);
        let corrected = Harmony::default().integrate(&x.view(), &batches).unwrap();
        assert_eq!(corrected.dim(), x.dim());
        let before = batch_gap(&x, &batches);
        let after = batch_gap(&corrected, &batches);
        assert!(after < 0.5 * before, "before {before}, after {after}");
    }

    #[test]
    fn test_deterministic() {
        let (x, batches) = shifted_batches(20);
        let h = Harmony {
            max_iter_harmony: 3,
            ..Harmony::default()
        };
        let a = h.integrate(&x.view(), &batches).unwrap();
        let b = h.integrate(&x.view(), &batches).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_single_batch_and_sparse_codes() {
        let (x, _) = shifted_batches(15);
        let one = vec![7u32; x.nrows()];
        let out = Harmony::default().integrate(&x.view(), &one).unwrap();
        assert!(out.iter().all(|v| v.is_finite()));

        let codes = (0..x.nrows()).map(|i| if i % 2 == 0 { 3 } else { 40 }).collect::<Vec<u32>>();
        let out = Harmony::default().integrate(&x.view(), &codes).unwrap();
        assert_eq!(out.dim(), x.dim());
    }

    #[test]
    fn test_invalid_inputs() {
        let h = Harmony::default();
        let empty = Array2::<f64>::zeros((0, 4));
        assert!(h.integrate(&empty.view(), &[]).is_err());
        let x = Array2::<f64>::ones((4, 3));
        assert!(h.integrate(&x.view(), &[0, 1]).is_err());
        let narrow = Array2::<f64>::ones((4, 1));
        assert!(h.integrate(&narrow.view(), &[0, 0, 1, 1]).is_err());
    }

    #[test]
    fn test_split_evenly() {
        let v = (0..7).collect::<Vec<_>>();
        let blocks = split_evenly(&v, 3);
        assert_eq!(blocks, vec![&[0, 1, 2][..], &[3, 4][..], &[5, 6][..]]);
    }
}
