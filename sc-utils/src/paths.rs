//! Locations of fonts, output directories and pre-computed data used by the
//! notebooks, read from a TOML file at startup:
//!
//! ```toml
//! arial_font = "/home/user/fonts/arial.ttf"
//!
//! [outdirs]
//! harmony_integration = "/data/results/integration"
//!
//! [adata]
//! full = "/data/results/patient_data_filtered.h5ad"
//!
//! [tables]
//! msigdb_hallmark = "/data/meta/msigdb_hallmark.csv.gz"
//! ```
//!
//! Every entry is optional.

use anyhow::{Context, Error};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Output directories of the individual analyses.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct OutputPaths {
    /// Harmony integration results
    pub harmony_integration: Option<PathBuf>,
    /// scVI integration results
    pub scvi_integration: Option<PathBuf>,
    /// tumor mutational burden
    pub tmb: Option<PathBuf>,
    /// compartment analyses
    pub compartments: Option<PathBuf>,
    /// co-expression UMAPs
    pub co_expression: Option<PathBuf>,
    /// fetal signature scores
    pub fetal_scores: Option<PathBuf>,
}

/// Pre-computed annotated matrices.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct AnnDataPaths {
    /// the full filtered patient dataset
    pub full: Option<PathBuf>,
    /// the Harmony-integrated RNA subset
    pub rna_harmony: Option<PathBuf>,
    /// cancer epithelial cells used for co-expression
    pub co_expression: Option<PathBuf>,
    /// cells scored against fetal signatures
    pub fetal_scores: Option<PathBuf>,
}

/// Reference tables.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TablePaths {
    /// MSigDB hallmark gene sets
    pub msigdb_hallmark: Option<PathBuf>,
}

/// Path configuration of the notebooks.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct NotebookPaths {
    /// Arial font file registered when no system Arial is installed
    pub arial_font: Option<PathBuf>,
    /// analysis output directories
    pub outdirs: OutputPaths,
    /// annotated matrix files
    pub adata: AnnDataPaths,
    /// reference tables
    pub tables: TablePaths,
}

impl NotebookPaths {
    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<NotebookPaths, Error> {
        let paths = toml::from_str(s)?;
        Ok(paths)
    }

    /// Read and parse the TOML file at `path`.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<NotebookPaths, Error> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        NotebookPaths::from_toml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const CONFIG: &str = r#"
arial_font = "/home/user/fonts/arial.ttf"

[outdirs]
harmony_integration = "/data/results/integration"
fetal_scores = "/data/results/fetal/"

[adata]
full = "/data/results/patient_data.h5ad"

[tables]
msigdb_hallmark = "/data/meta/msigdb_hallmark.csv.gz"
"#;

    #[test]
    fn test_parse() {
        let p = NotebookPaths::from_toml_str(CONFIG).unwrap();
        assert_eq!(p.arial_font, Some(PathBuf::from("/home/user/fonts/arial.ttf")));
        assert_eq!(
            p.outdirs.harmony_integration,
            Some(PathBuf::from("/data/results/integration"))
        );
        assert_eq!(p.outdirs.tmb, None);
        assert_eq!(p.adata.full, Some(PathBuf::from("/data/results/patient_data.h5ad")));
        assert_eq!(
            p.tables.msigdb_hallmark,
            Some(PathBuf::from("/data/meta/msigdb_hallmark.csv.gz"))
        );
    }

    #[test]
    fn test_empty_and_unknown() {
        assert_eq!(NotebookPaths::from_toml_str("").unwrap(), NotebookPaths::default());
        assert!(NotebookPaths::from_toml_str("arial = \"x\"").is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paths.toml");
        fs::write(&path, CONFIG).unwrap();
        let p = NotebookPaths::from_toml_file(&path).unwrap();
        assert_eq!(p, NotebookPaths::from_toml_str(CONFIG).unwrap());

        let err = NotebookPaths::from_toml_file(dir.path().join("missing.toml")).unwrap_err();
        assert!(format!("{err}").contains("missing.toml"));
    }
}
