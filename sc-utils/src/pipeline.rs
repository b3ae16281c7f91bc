use crate::dim_red::pca;
use crate::neighbors::compute_neighbors;
use crate::normalization::{log1p, normalize_total, scale};
use ann_types::{AnnData, AnnError, COUNTS_LAYER};
use anyhow::Error;
use harmony::Harmony;
use log::{info, warn};
use serde::Deserialize;
use umap_rs::Umap;

/// Counts per observation after `normalize_total`.
pub const TARGET_SUM: f64 = 1e4;

/// Clip applied by the optional scaling step.
pub const SCALE_MAX_VALUE: f64 = 10.0;

/// Raw counts are expected to reach above this value somewhere in the matrix.
const MIN_RAW_COUNT_MAX: f64 = 100.0;

/// Settings of [`mini_process`].
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct MiniProcessOptions {
    /// Batch-correct the PCA embedding with Harmony before the neighbor graph.
    pub use_harmony: bool,
    /// Scale each feature to unit variance before PCA.
    pub do_scale: bool,
    /// Harmony iteration bound.
    pub max_iter_harmony: usize,
    /// obs column holding the batch of each observation.
    pub harmony_column: String,
    /// Number of principal components.
    pub n_comps: usize,
    /// Neighborhood size, counting the observation itself.
    pub n_neighbors: usize,
    /// Seed shared by the randomized steps.
    pub seed: u64,
}

impl Default for MiniProcessOptions {
    fn default() -> Self {
        MiniProcessOptions {
            use_harmony: false,
            do_scale: false,
            max_iter_harmony: 100,
            harmony_column: "sample".to_string(),
            n_comps: 50,
            n_neighbors: 15,
            seed: 0,
        }
    }
}

/// Restore `x` from the `"counts"` layer, then normalize, log-transform,
/// optionally scale, run PCA, optionally Harmony, build the neighbor graph and
/// lay it out with UMAP.
///
/// Results land in `obsm` (`X_pca`, `X_pca_harmony`, `X_umap`), `varm`
/// (`PCs`), `obsp` (`distances`, `connectivities`) and `uns`
/// (`pca_variance`, `pca_variance_ratio`). If the counts do not look raw, the
/// call fails with `NotRawCounts` after restoring `x` and before any
/// transform. Later failures leave `adata` partially updated.
pub fn mini_process(adata: &mut AnnData, options: &MiniProcessOptions) -> Result<(), Error> {
    adata.x = adata.layer(COUNTS_LAYER)?.clone();

    match (adata.x.max(), adata.x.min()) {
        (Some(max), Some(min)) if max > MIN_RAW_COUNT_MAX && min >= 0.0 => (),
        (max, min) => {
            return Err(AnnError::NotRawCounts(format!(
                "expected non-negative counts with a maximum above {}, found range {:?}..{:?}",
                MIN_RAW_COUNT_MAX, min, max
            ))
            .into())
        }
    }

    info!("normalizing {} x {} counts", adata.n_obs(), adata.n_vars());
    normalize_total(&mut adata.x, TARGET_SUM);
    log1p(&mut adata.x);

    if options.do_scale {
        info!("scaling features, clipping at {}", SCALE_MAX_VALUE);
        scale(&mut adata.x, Some(SCALE_MAX_VALUE));
    }

    let max_comps = adata.n_obs().min(adata.n_vars()).saturating_sub(1);
    let n_comps = if options.n_comps > max_comps {
        warn!(
            "{} components requested, using {} for a {} x {} matrix",
            options.n_comps,
            max_comps,
            adata.n_obs(),
            adata.n_vars()
        );
        max_comps
    } else {
        options.n_comps
    };

    info!("running PCA with {} components", n_comps);
    let res = pca(&adata.x, n_comps)?;
    adata.set_obsm("X_pca", res.scores)?;
    adata.varm.insert("PCs".to_string(), res.loadings);
    adata.uns.insert("pca_variance".to_string(), res.variance);
    adata
        .uns
        .insert("pca_variance_ratio".to_string(), res.variance_ratio);

    let rep_key = if options.use_harmony {
        let batches = adata
            .obs
            .get(&options.harmony_column)
            .ok_or_else(|| AnnError::MissingColumn(options.harmony_column.clone()))?
            .to_categorical();
        info!(
            "running Harmony over {} batches of {:?}",
            batches.categories.len(),
            options.harmony_column
        );
        let harmony = Harmony {
            max_iter_harmony: options.max_iter_harmony,
            seed: options.seed,
            ..Harmony::default()
        };
        let corrected = harmony.integrate(&adata.obsm["X_pca"].view(), &batches.codes)?;
        adata.set_obsm("X_pca_harmony", corrected)?;
        "X_pca_harmony"
    } else {
        "X_pca"
    };

    info!("computing {} neighbors on {}", options.n_neighbors, rep_key);
    let neighbors = compute_neighbors(&adata.obsm[rep_key].view(), options.n_neighbors)?;
    adata.obsp.insert("distances".to_string(), neighbors.distances);
    adata
        .obsp
        .insert("connectivities".to_string(), neighbors.connectivities);

    info!("running UMAP");
    let umap = Umap {
        seed: options.seed,
        ..Umap::default()
    };
    let embedding = umap.embed(&adata.obsp["connectivities"])?;
    adata.set_obsm("X_umap", embedding)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use ann_types::{Column, Matrix};
    use ndarray::{Array2, Axis};
    use ndarray_rand::RandomExt;
    use rand::SeedableRng;
    use rand_distr::Poisson;
    use rand_pcg::Pcg64Mcg;

    /// Two populations of 40 cells over 30 genes, with one very high count.
    fn counts_adata() -> AnnData {
        let (rows, cols) = (80, 30);
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let mut x = Array2::<f64>::random_using((rows, cols), Poisson::new(2.0).unwrap(), &mut rng);
        for i in 0..rows / 2 {
            for j in 0..6 {
                x[(i, j)] += 20.0;
            }
        }
        x[(0, 0)] = 250.0;
        let triplets = x
            .indexed_iter()
            .filter(|&(_, &v)| v > 0.0)
            .map(|((i, j), &v)| (i, j, v))
            .collect::<Vec<_>>();
        let counts = Matrix::sparse_from_triplets((rows, cols), triplets);

        let obs = (0..rows).map(|i| format!("cell{i}")).collect();
        let var = (0..cols).map(|j| format!("gene{j}")).collect();
        let mut ad = AnnData::new(counts.clone(), obs, var).unwrap();
        ad.add_layer(COUNTS_LAYER, counts).unwrap();
        let sample = (0..rows)
            .map(|i| if i % 2 == 0 { "s1".to_string() } else { "s2".to_string() })
            .collect();
        ad.obs.insert("sample", Column::Text(sample)).unwrap();
        ad
    }

    fn opts() -> MiniProcessOptions {
        MiniProcessOptions {
            n_comps: 10,
            n_neighbors: 10,
            ..MiniProcessOptions::default()
        }
    }

    #[test]
    fn test_defaults() {
        let o = MiniProcessOptions::default();
        assert!(!o.use_harmony && !o.do_scale);
        assert_eq!(o.max_iter_harmony, 100);
        assert_eq!(o.harmony_column, "sample");
        assert_eq!((o.n_comps, o.n_neighbors), (50, 15));
    }

    #[test]
    fn test_mini_process() {
        let mut ad = counts_adata();
        let names = ad.obs_names().to_vec();
        mini_process(&mut ad, &opts()).unwrap();

        assert_eq!(ad.obs_names(), &names[..]);
        assert_eq!(ad.obsm["X_pca"].dim(), (80, 10));
        assert_eq!(ad.varm["PCs"].dim(), (30, 10));
        assert_eq!(ad.obsm["X_umap"].dim(), (80, 2));
        assert!(ad.obsm["X_umap"].iter().all(|v| v.is_finite()));
        assert!(!ad.obsm.contains_key("X_pca_harmony"));
        assert_eq!(ad.obsp["connectivities"].shape(), (80, 80));
        assert_eq!(ad.obsp["distances"].nnz(), 80 * 9);

        // x is log-normalized, counts are untouched
        let sums = ad.x.to_dense().mapv(f64::exp_m1).sum_axis(Axis(1));
        assert!(sums.iter().all(|s| (s - TARGET_SUM).abs() < 1e-6));
        assert_eq!(ad.layer(COUNTS_LAYER).unwrap().max(), Some(250.0));

        let ratio = &ad.uns["pca_variance_ratio"];
        assert_eq!(ratio.len(), 10);
        assert!(ratio.sum() > 0.0 && ratio.sum() <= 1.0 + 1e-12);
    }

    #[test]
    fn test_not_raw_counts() {
        let mut ad = counts_adata();
        let mut counts = ad.layer(COUNTS_LAYER).unwrap().to_dense();
        counts[(3, 3)] = -1.0;
        ad.add_layer(COUNTS_LAYER, Matrix::Dense(counts)).unwrap();
        ad.x = Matrix::Dense(Array2::zeros((80, 30)));

        let err = mini_process(&mut ad, &opts()).unwrap_err();
        assert!(matches!(err.downcast_ref::<AnnError>(), Some(AnnError::NotRawCounts(_))));
        assert_eq!(&ad.x, ad.layer(COUNTS_LAYER).unwrap());
        assert!(ad.obsm.is_empty());

        // already normalized data
        let mut ad = counts_adata();
        let mut small = ad.layer(COUNTS_LAYER).unwrap().clone();
        small.map_stored_inplace(f64::ln_1p);
        ad.add_layer(COUNTS_LAYER, small).unwrap();
        let err = mini_process(&mut ad, &opts()).unwrap_err();
        assert!(matches!(err.downcast_ref::<AnnError>(), Some(AnnError::NotRawCounts(_))));
    }

    #[test]
    fn test_missing_counts() {
        let mut ad = counts_adata();
        ad.layers.clear();
        let err = mini_process(&mut ad, &opts()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<AnnError>(),
            Some(&AnnError::MissingLayer(COUNTS_LAYER.to_string()))
        );
    }

    #[test]
    fn test_harmony_and_scale() {
        let mut ad = counts_adata();
        let o = MiniProcessOptions {
            use_harmony: true,
            do_scale: true,
            max_iter_harmony: 5,
            ..opts()
        };
        mini_process(&mut ad, &o).unwrap();
        assert_eq!(ad.obsm["X_pca_harmony"].dim(), (80, 10));
        assert!(ad.x.max().unwrap() <= SCALE_MAX_VALUE);
        assert_eq!(ad.obsm["X_umap"].dim(), (80, 2));

        let mut ad = counts_adata();
        let o = MiniProcessOptions {
            use_harmony: true,
            harmony_column: "donor".to_string(),
            ..opts()
        };
        let err = mini_process(&mut ad, &o).unwrap_err();
        assert_eq!(
            err.downcast_ref::<AnnError>(),
            Some(&AnnError::MissingColumn("donor".to_string()))
        );
    }

    #[test]
    fn test_n_comps_capped() {
        let mut ad = counts_adata();
        let o = MiniProcessOptions {
            n_comps: 50,
            ..opts()
        };
        mini_process(&mut ad, &o).unwrap();
        assert_eq!(ad.obsm["X_pca"].ncols(), 29);
    }
}
