//! Exact k-nearest-neighbor search over the rows of a dense matrix, using a
//! vantage-point tree and Euclidean distance.

use log::{info, warn};
use ndarray::{Array2, ArrayView2};
use noisy_float::types::{n64, N64};
use num_traits::Bounded;
use vpsearch::{BestCandidate, MetricSpace, Tree};

#[derive(Clone, Debug)]
struct Sample<'a> {
    data: &'a [f64],
    idx: usize,
}

impl MetricSpace for Sample<'_> {
    type UserData = ();
    type Distance = N64;

    fn distance(&self, other: &Self, _: &Self::UserData) -> Self::Distance {
        n64(euclidean(self.data, other.data))
    }
}

#[inline]
pub fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f64>().sqrt()
}

/// Keeps the `max_items` closest candidates seen so far, sorted by distance.
struct Neighborhood {
    max_items: usize,
    max_observed: N64,
    by_distance: Vec<(N64, usize)>,
}

impl Neighborhood {
    fn new(max_items: usize) -> Self {
        Neighborhood {
            max_items,
            max_observed: N64::max_value(),
            by_distance: Vec::with_capacity(max_items + 1),
        }
    }

    fn clear(&mut self) {
        self.max_observed = N64::max_value();
        self.by_distance.clear();
    }

    fn insert(&mut self, index: usize, distance: N64) {
        let val = (distance, index);
        let pos = self.by_distance.binary_search(&val).unwrap_or_else(|x| x);
        self.by_distance.insert(pos, val);
        if self.by_distance.len() >= self.max_items {
            self.by_distance.truncate(self.max_items);
            if let Some(&(d, _)) = self.by_distance.last() {
                self.max_observed = d;
            }
        }
    }
}

impl<'a, 'n> BestCandidate<Sample<'a>, ()> for &'n mut Neighborhood {
    type Output = std::iter::Copied<std::slice::Iter<'n, (N64, usize)>>;

    #[inline]
    fn consider(&mut self, _: &Sample<'a>, distance: N64, candidate_index: usize, _: &()) {
        if self.max_items == 0 {
            return;
        }
        if distance < self.max_observed || self.by_distance.len() < self.max_items {
            self.insert(candidate_index, distance);
        }
    }

    #[inline]
    fn distance(&self) -> N64 {
        self.max_observed
    }

    fn result(self, _: &()) -> Self::Output {
        self.by_distance.iter().copied()
    }
}

/// For each row of `data`, the indices and distances of its `k` nearest other
/// rows, closest first. `k` is capped at `rows - 1`.
pub fn nearest_neighbors(data: &ArrayView2<f64>, mut k: usize) -> (Array2<usize>, Array2<f64>) {
    let (n, _) = data.dim();
    if n <= k {
        warn!("{} neighbors requested, but only {} available", k, n.saturating_sub(1));
        k = n.saturating_sub(1);
    }

    let rows = data.as_standard_layout();
    let dim = data.ncols();
    let flat = rows.as_slice().unwrap_or(&[]);
    let samples = (0..n)
        .map(|idx| Sample {
            data: &flat[idx * dim..(idx + 1) * dim],
            idx,
        })
        .collect::<Vec<_>>();

    info!("querying {} points for {} neighbors", n, k);
    let tree = Tree::new_with_user_data_ref(&samples, &());

    let mut indices = Array2::from_elem((n, k), usize::MAX);
    let mut distances = Array2::from_elem((n, k), f64::INFINITY);
    let mut neighborhood = Neighborhood::new(k + 1);
    for query in &samples {
        neighborhood.clear();
        let mut j = 0;
        for (dist, idx) in tree.find_nearest_custom(query, &(), &mut neighborhood) {
            if idx != query.idx && j < k {
                indices[(query.idx, j)] = idx;
                distances[(query.idx, j)] = dist.raw();
                j += 1;
            }
        }
    }
    (indices, distances)
}
