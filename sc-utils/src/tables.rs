use ann_types::AnnData;
use anyhow::{format_err, Context, Error};
use flate2::write::GzEncoder;
use flate2::Compression;
use log::info;
use std::fs::File;
use std::io::Write;
use std::path::Path;

const INDEX_HEADER: &str = "obs_names";

fn write_records<W: Write>(
    writer: &mut csv::Writer<W>,
    header: &[String],
    rows: impl Iterator<Item = Vec<String>>,
) -> Result<(), Error> {
    writer.write_record(header)?;
    for row in rows {
        writer.write_record(&row)?;
    }
    Ok(())
}

/// Write a CSV table to `path`, gzip-compressed if the path ends in `.gz`.
fn write_table(path: &Path, header: &[String], rows: impl Iterator<Item = Vec<String>>) -> Result<(), Error> {
    let file = File::create(path).with_context(|| path.display().to_string())?;
    if path.extension().map_or(false, |e| e == "gz") {
        let mut writer = csv::Writer::from_writer(GzEncoder::new(file, Compression::default()));
        write_records(&mut writer, header, rows)?;
        writer
            .into_inner()
            .map_err(|e| format_err!("{}: {}", path.display(), e.error()))?
            .finish()?;
    } else {
        let mut writer = csv::Writer::from_writer(file);
        write_records(&mut writer, header, rows)?;
        writer.flush()?;
    }
    Ok(())
}

/// Write `adata.obsm[key]` with one row per observation, headed by
/// `obs_names` and `<key>_1 .. <key>_k`.
pub fn write_obsm_csv(adata: &AnnData, key: &str, path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref();
    let rep = adata
        .obsm
        .get(key)
        .ok_or_else(|| format_err!("obsm {:?} not found", key))?;

    let mut header = vec![INDEX_HEADER.to_string()];
    header.extend((1..=rep.ncols()).map(|i| format!("{key}_{i}")));
    let rows = adata.obs_names().iter().zip(rep.rows()).map(|(name, row)| {
        std::iter::once(name.clone())
            .chain(row.iter().map(|v| v.to_string()))
            .collect()
    });
    write_table(path, &header, rows)?;
    info!("wrote obsm {} to {}", key, path.display());
    Ok(())
}

/// Write every obs column, one row per observation, headed by `obs_names`
/// and the column names in order.
pub fn write_obs_csv(adata: &AnnData, path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref();
    let columns = adata.obs.columns().collect::<Vec<_>>();

    let mut header = vec![INDEX_HEADER.to_string()];
    header.extend(columns.iter().map(|(name, _)| name.to_string()));
    let rows = adata.obs_names().iter().enumerate().map(|(i, name)| {
        std::iter::once(name.clone())
            .chain(columns.iter().map(|(_, c)| c.display(i)))
            .collect()
    });
    write_table(path, &header, rows)?;
    info!("wrote {} obs columns to {}", columns.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use ann_types::{Categorical, Column, Matrix};
    use flate2::read::MultiGzDecoder;
    use ndarray::{array, Array2};
    use std::io::Read;

    fn adata() -> AnnData {
        let mut ad = AnnData::new(
            Matrix::Dense(Array2::zeros((2, 1))),
            vec!["c0".into(), "c1".into()],
            vec!["FOXA2".into()],
        )
        .unwrap();
        ad.set_obsm("X_umap", array![[0.5, 1.0], [-2.0, 3.25]]).unwrap();
        ad.obs.insert("sample", Column::Text(vec!["s1".into(), "s,2".into()])).unwrap();
        ad.obs
            .insert("FOXA2_is_expressed", Column::Categorical(Categorical::from_flags(&[true, false])))
            .unwrap();
        ad
    }

    #[test]
    fn test_write_obsm() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("umap.csv");
        write_obsm_csv(&adata(), "X_umap", &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "obs_names,X_umap_1,X_umap_2\nc0,0.5,1\nc1,-2,3.25\n");

        assert!(write_obsm_csv(&adata(), "X_pca", dir.path().join("pca.csv")).is_err());
    }

    #[test]
    fn test_write_obs_gz() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obs.csv.gz");
        write_obs_csv(&adata(), &path).unwrap();

        let mut text = String::new();
        MultiGzDecoder::new(File::open(&path).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(
            text,
            "obs_names,sample,FOXA2_is_expressed\nc0,s1,True\nc1,\"s,2\",False\n"
        );
    }
}
