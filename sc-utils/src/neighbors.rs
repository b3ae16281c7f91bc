use anyhow::{bail, Error};
use log::info;
use ndarray::ArrayView2;
use sprs::{CsMat, TriMat};
use umap_rs::{fuzzy, knn};

/// kNN graphs of a representation, both `n_obs × n_obs`.
#[derive(Clone, Debug, PartialEq)]
pub struct Neighbors {
    /// Euclidean distance to each of the nearest neighbors
    pub distances: CsMat<f64>,
    /// symmetric fuzzy membership strengths in (0, 1]
    pub connectivities: CsMat<f64>,
}

/// Build the neighbor graphs of the rows of `rep`. `n_neighbors` counts the
/// observation itself, so every row has `n_neighbors - 1` stored distances.
pub fn compute_neighbors(rep: &ArrayView2<f64>, n_neighbors: usize) -> Result<Neighbors, Error> {
    if n_neighbors < 2 {
        bail!("n_neighbors must be at least 2, got {}", n_neighbors);
    }
    let n = rep.nrows();
    let (indices, distances) = knn::nearest_neighbors(rep, n_neighbors - 1);

    let mut tri = TriMat::new((n, n));
    for ((i, c), &j) in indices.indexed_iter() {
        if j != usize::MAX {
            tri.add_triplet(i, j, distances[(i, c)]);
        }
    }
    let distances_graph: CsMat<f64> = tri.to_csr();

    let connectivities = fuzzy::fuzzy_simplicial_set(&indices, &distances, 1.0, 1.0);
    info!(
        "neighbor graph: {} observations, {} connections",
        n,
        connectivities.nnz()
    );
    Ok(Neighbors {
        distances: distances_graph,
        connectivities,
    })
}
