//! Removes gene families that tend to dominate unsupervised structure:
//! mitochondrial, ribosomal protein, lincRNA, T-cell receptor, immunoglobulin
//! variable and HLA genes, and identifiers carrying a version suffix.

use ann_types::AnnData;
use log::info;

const TCR_PATTERNS: [&str; 4] = ["TRA", "TRB", "TRG", "TRD"];
const IG_VARIABLE_PATTERNS: [&str; 3] = ["IGKV", "IGHV", "IGLV"];

/// True if `gene` survives every exclusion rule.
///
/// Rules on the upper-cased symbol are substring matches, so `"TRA"` also
/// drops e.g. `"CTRAP"`. Any symbol with a hyphen is dropped, as is any symbol
/// containing `"HLA"`.
pub fn gene_passes_filter(gene: &str) -> bool {
    let upper = gene.to_uppercase();
    !gene.contains("MT-")
        && !gene.contains('.')
        && !gene.starts_with("RP")
        && !gene.to_lowercase().contains("linc")
        && !TCR_PATTERNS.iter().any(|p| upper.contains(p))
        && !IG_VARIABLE_PATTERNS.iter().any(|p| upper.contains(p))
        && !upper.contains('-')
        && !upper.contains("HLA")
}

/// The genes of `genes` that pass [`gene_passes_filter`], in input order.
pub fn filtered_gene_names(genes: &[String]) -> Vec<String> {
    genes.iter().filter(|g| gene_passes_filter(g)).cloned().collect()
}

/// A copy of `adata` restricted to the genes passing [`gene_passes_filter`].
/// Every var-axis field is subset; `adata` itself is unchanged.
pub fn filter_genes(adata: &AnnData) -> AnnData {
    let keep = adata
        .var_names()
        .iter()
        .enumerate()
        .filter(|(_, g)| gene_passes_filter(g))
        .map(|(i, _)| i)
        .collect::<Vec<_>>();
    info!("gene filter kept {} of {} genes", keep.len(), adata.n_vars());
    adata.subset_vars(&keep)
}
