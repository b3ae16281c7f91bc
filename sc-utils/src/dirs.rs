use anyhow::{Context, Error};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};

/// The three output sub-directories used by a notebook.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputDirs {
    /// `<out_dir>/figures`
    pub figures: PathBuf,
    /// `<out_dir>/data`
    pub data: PathBuf,
    /// `<out_dir>/tables`
    pub tables: PathBuf,
}

/// Create `figures`, `data` and `tables` under `out_dir` (and `out_dir`
/// itself) if they don't exist yet. Existing directories are left untouched.
pub fn setup_dirs(out_dir: impl AsRef<Path>) -> Result<OutputDirs, Error> {
    let out_dir = out_dir.as_ref();
    let dirs = OutputDirs {
        figures: out_dir.join("figures"),
        data: out_dir.join("data"),
        tables: out_dir.join("tables"),
    };
    for dir in [&dirs.figures, &dirs.data, &dirs.tables] {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    info!("output directories ready under {}", out_dir.display());
    Ok(dirs)
}
