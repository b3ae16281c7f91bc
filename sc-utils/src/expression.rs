use ann_types::{AnnData, AnnError, Categorical, Column, COUNTS_LAYER};
use anyhow::Error;
use log::info;

/// Default expression cut-off: more than one count after `ln(1 + x)`.
pub const DEFAULT_EXPRESSION_THRESHOLD: f64 = std::f64::consts::LN_2;

/// Where expression values are read from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExpressionSource {
    /// The primary (normalized) matrix `x`.
    #[default]
    Normalized,
    /// The raw `"counts"` layer.
    Counts,
}

/// Label each observation by whether `gene` is expressed above `threshold`.
///
/// Stores `<gene>_EXPR` (the expression values) and `<gene>_is_expressed`
/// (a `False`/`True` categorical) in `adata.obs`, replacing earlier columns of
/// the same names. Fails with `GeneNotFound` or `MissingLayer` before any
/// change is made.
pub fn add_gene_binary_status(
    adata: &mut AnnData,
    gene: &str,
    threshold: f64,
    source: ExpressionSource,
) -> Result<(), Error> {
    let idx = adata
        .var_index(gene)
        .ok_or_else(|| AnnError::GeneNotFound(gene.to_string()))?;
    let values = match source {
        ExpressionSource::Normalized => adata.x.column(idx),
        ExpressionSource::Counts => adata.layer(COUNTS_LAYER)?.column(idx),
    };

    let status_key = format!("{gene}_is_expressed");
    let expr_key = format!("{gene}_EXPR");
    adata.obs.remove(&status_key);
    adata.obs.remove(&expr_key);

    let flags = values.iter().map(|&v| v > threshold).collect::<Vec<_>>();
    let n_expressed = flags.iter().filter(|&&f| f).count();
    adata.obs.insert(expr_key, Column::Numeric(values.to_vec()))?;
    adata
        .obs
        .insert(status_key, Column::Categorical(Categorical::from_flags(&flags)))?;
    info!(
        "{}: {} of {} observations expressed above {}",
        gene,
        n_expressed,
        flags.len(),
        threshold
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use ann_types::Matrix;
    use ndarray::array;

    fn adata() -> AnnData {
        let counts = array![[0.0, 5.0], [1.0, 0.0], [3.0, 2.0]];
        let x = array![[0.0, 6f64.ln()], [DEFAULT_EXPRESSION_THRESHOLD, 0.0], [4f64.ln(), 3f64.ln()]];
        let mut ad = AnnData::new(
            Matrix::Dense(x),
            vec!["c0".into(), "c1".into(), "c2".into()],
            vec!["FOXA2".into(), "ASCL1".into()],
        )
        .unwrap();
        ad.add_layer(COUNTS_LAYER, Matrix::Dense(counts)).unwrap();
        ad
    }

    fn flags(ad: &AnnData, gene: &str) -> Vec<String> {
        let c = ad
            .obs
            .get(&format!("{gene}_is_expressed"))
            .and_then(Column::as_categorical)
            .unwrap();
        (0..c.len()).map(|i| c.label(i).to_string()).collect()
    }

    #[test]
    fn test_default_threshold() {
        let mut ad = adata();
        add_gene_binary_status(&mut ad, "FOXA2", DEFAULT_EXPRESSION_THRESHOLD, ExpressionSource::Normalized).unwrap();
        // exactly one count is not "expressed"
        assert_eq!(flags(&ad, "FOXA2"), vec!["False", "False", "True"]);
        let expr = ad.obs.get("FOXA2_EXPR").and_then(Column::as_numeric).unwrap();
        assert_eq!(expr, &[0.0, DEFAULT_EXPRESSION_THRESHOLD, 4f64.ln()]);
    }

    #[test]
    fn test_counts_source() {
        let mut ad = adata();
        add_gene_binary_status(&mut ad, "ASCL1", 1.0, ExpressionSource::Counts).unwrap();
        assert_eq!(flags(&ad, "ASCL1"), vec!["True", "False", "True"]);
        let expr = ad.obs.get("ASCL1_EXPR").and_then(Column::as_numeric).unwrap();
        assert_eq!(expr, &[5.0, 0.0, 2.0]);
    }

    #[test]
    fn test_idempotent() {
        let mut ad = adata();
        add_gene_binary_status(&mut ad, "FOXA2", 0.5, ExpressionSource::Normalized).unwrap();
        let first = ad.obs.clone();
        add_gene_binary_status(&mut ad, "FOXA2", 0.5, ExpressionSource::Normalized).unwrap();
        assert_eq!(ad.obs, first);
        assert_eq!(ad.obs.num_columns(), 2);
    }

    #[test]
    fn test_zero_threshold_positive_values() {
        let mut ad = adata();
        ad.x = Matrix::Dense(array![[0.1, 1.0], [0.2, 1.0], [3.0, 1.0]]);
        add_gene_binary_status(&mut ad, "FOXA2", 0.0, ExpressionSource::Normalized).unwrap();
        assert_eq!(flags(&ad, "FOXA2"), vec!["True", "True", "True"]);
        // nothing expressed is still a two-category annotation
        add_gene_binary_status(&mut ad, "ASCL1", 10.0, ExpressionSource::Normalized).unwrap();
        let c = ad.obs.get("ASCL1_is_expressed").and_then(Column::as_categorical).unwrap();
        assert_eq!(c.categories, vec!["False", "True"]);
    }

    #[test]
    fn test_errors_leave_obs_untouched() {
        let mut ad = adata();
        let err = add_gene_binary_status(&mut ad, "SOX2", 0.0, ExpressionSource::Normalized).unwrap_err();
        assert_eq!(
            err.downcast_ref::<AnnError>(),
            Some(&AnnError::GeneNotFound("SOX2".to_string()))
        );

        add_gene_binary_status(&mut ad, "FOXA2", 0.0, ExpressionSource::Normalized).unwrap();
        let before = ad.obs.clone();
        ad.layers.clear();
        let err = add_gene_binary_status(&mut ad, "FOXA2", 0.0, ExpressionSource::Counts).unwrap_err();
        assert!(matches!(err.downcast_ref::<AnnError>(), Some(AnnError::MissingLayer(_))));
        assert_eq!(ad.obs, before);
    }
}
