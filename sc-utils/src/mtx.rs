use ann_types::{AnnData, Column, Matrix, COUNTS_LAYER};
use anyhow::{bail, format_err, Context, Error};
use flate2::bufread::MultiGzDecoder;
use log::info;
use sprs::TriMat;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

const GENE_EXPRESSION: &str = "Gene Expression";

/// Open `path`, or `path.gz` if only the compressed file exists. Gzipped
/// input is detected by extension.
fn open_maybe_gz(path: &Path) -> Result<(PathBuf, Box<dyn BufRead>), Error> {
    let gz_path = PathBuf::from(format!("{}.gz", path.display()));
    let path = if path.exists() { path.to_path_buf() } else { gz_path };
    let file = BufReader::new(File::open(&path).with_context(|| path.display().to_string())?);
    let reader: Box<dyn BufRead> = if path.extension().map_or(false, |e| e == "gz") {
        Box::new(BufReader::new(MultiGzDecoder::new(file)))
    } else {
        Box::new(file)
    };
    Ok((path, reader))
}

fn parse_index(field: Option<&str>, what: &str) -> Result<usize, Error> {
    let one_based = field.ok_or_else(|| format_err!("missing {}", what))?.parse::<usize>()?;
    one_based
        .checked_sub(1)
        .ok_or_else(|| format_err!("{} index 0 in a 1-based matrix", what))
}

/// Load a Matrix Market coordinate matrix of features × barcodes, transposed
/// into barcodes × features.
pub fn load_mtx(path: impl AsRef<Path>) -> Result<Matrix, Error> {
    let (path, mut reader) = open_maybe_gz(path.as_ref())?;
    let mut line = String::new();
    let mut mat: Option<TriMat<f64>> = None;

    loop {
        line.clear();
        let sz = reader
            .read_line(&mut line)
            .with_context(|| path.display().to_string())?;
        if sz == 0 {
            break;
        }
        if line.starts_with('%') || line.trim().is_empty() {
            continue;
        }
        let mut data = line.split_whitespace();
        match mat.as_mut() {
            None => {
                let nrow = data.next().ok_or_else(|| format_err!("no NROW"))?.parse::<usize>()?;
                let ncol = data.next().ok_or_else(|| format_err!("no NCOL"))?.parse::<usize>()?;
                let nnz = data.next().ok_or_else(|| format_err!("no NNZ"))?.parse::<usize>()?;
                mat = Some(TriMat::with_capacity((ncol, nrow), nnz));
            }
            Some(m) => {
                let row = parse_index(data.next(), "ROW")?;
                let col = parse_index(data.next(), "COL")?;
                let val = data.next().ok_or_else(|| format_err!("missing VAL"))?.parse::<f64>()?;
                if row >= m.cols() || col >= m.rows() {
                    bail!("entry ({}, {}) outside the declared shape", row + 1, col + 1);
                }
                m.add_triplet(col, row, val);
            }
        }
    }

    let Some(matrix) = mat else { bail!("no matrix found in {}", path.display()) };
    Ok(Matrix::Sparse(matrix.to_csr()))
}

/// Non-empty lines of a (possibly gzipped) text file, split on tabs.
fn read_tsv(path: &Path) -> Result<Vec<Vec<String>>, Error> {
    let (path, reader) = open_maybe_gz(path)?;
    let mut rows = Vec::new();
    for line in reader.lines() {
        let line = line.with_context(|| path.display().to_string())?;
        if line.is_empty() {
            continue;
        }
        rows.push(line.split('\t').map(str::to_string).collect());
    }
    Ok(rows)
}

/// Append `-1`, `-2`, ... to repeated names so that every name is unique.
pub fn make_unique(names: &mut [String]) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    for name in names.iter() {
        *seen.entry(name.clone()).or_default() += 1;
    }
    let mut counters: HashMap<String, usize> = HashMap::new();
    for name in names.iter_mut() {
        if seen.get(name.as_str()).copied().unwrap_or(0) < 2 {
            continue;
        }
        let n = counters.entry(name.clone()).or_default();
        if *n > 0 {
            let mut candidate = format!("{}-{}", name, n);
            while seen.contains_key(&candidate) {
                *n += 1;
                candidate = format!("{}-{}", name, n);
            }
            *name = candidate;
        }
        *n += 1;
    }
}

/// Read a 10x Genomics feature-barcode matrix directory.
///
/// `matrix.mtx`, `barcodes.tsv` and `features.tsv` (or the older
/// `genes.tsv`) may each be gzipped. Observations are barcodes, features are
/// indexed by gene symbol (made unique), and the var columns `gene_ids` and
/// `feature_types` keep the remaining feature fields. The counts are stored
/// both as `x` and as the `"counts"` layer.
pub fn read_10x_mtx(dir: impl AsRef<Path>) -> Result<AnnData, Error> {
    let dir = dir.as_ref();
    let features_path = ["features.tsv", "features.tsv.gz"]
        .iter()
        .map(|f| dir.join(f))
        .find(|p| p.exists())
        .unwrap_or_else(|| dir.join("genes.tsv"));

    let matrix = load_mtx(dir.join("matrix.mtx"))?;
    let barcodes = read_tsv(&dir.join("barcodes.tsv"))?
        .into_iter()
        .filter_map(|row| row.into_iter().next())
        .collect::<Vec<_>>();
    let features = read_tsv(&features_path)?;

    let mut gene_ids = Vec::with_capacity(features.len());
    let mut symbols = Vec::with_capacity(features.len());
    let mut feature_types = Vec::with_capacity(features.len());
    for (i, row) in features.into_iter().enumerate() {
        let mut fields = row.into_iter();
        let id = fields
            .next()
            .ok_or_else(|| format_err!("feature {} has no id", i + 1))?;
        let symbol = fields.next().unwrap_or_else(|| id.clone());
        let kind = fields.next().unwrap_or_else(|| GENE_EXPRESSION.to_string());
        gene_ids.push(id);
        symbols.push(symbol);
        feature_types.push(kind);
    }
    make_unique(&mut symbols);

    info!(
        "read {} barcodes x {} features from {}",
        barcodes.len(),
        symbols.len(),
        dir.display()
    );
    let mut adata = AnnData::new(matrix.clone(), barcodes, symbols)
        .with_context(|| format!("inconsistent 10x matrix in {}", dir.display()))?;
    adata.add_layer(COUNTS_LAYER, matrix)?;
    adata.var.insert("gene_ids", Column::Text(gene_ids))?;
    adata.var.insert("feature_types", Column::Text(feature_types))?;
    Ok(adata)
}

#[cfg(test)]
mod test {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use ndarray::array;
    use std::fs;
    use std::io::Write;

    const MTX: &str = "%%MatrixMarket matrix coordinate integer general\n\
                       %metadata\n\
                       3 2 4\n\
                       1 1 5\n\
                       3 1 1\n\
                       2 2 120\n\
                       3 2 2\n";

    fn write_gz(path: &Path, text: &str) {
        let mut enc = GzEncoder::new(fs::File::create(path).unwrap(), Compression::default());
        enc.write_all(text.as_bytes()).unwrap();
        enc.finish().unwrap();
    }

    #[test]
    fn test_read_plain_v2() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("matrix.mtx"), MTX).unwrap();
        fs::write(dir.path().join("barcodes.tsv"), "AAAC-1\nTTTG-1\n").unwrap();
        fs::write(
            dir.path().join("genes.tsv"),
            "ENSG1\tFOXA2\nENSG2\tASCL1\nENSG3\tFOXA2\n",
        )
        .unwrap();

        let ad = read_10x_mtx(dir.path()).unwrap();
        assert_eq!(ad.shape(), (2, 3));
        assert!(ad.x.is_sparse());
        assert_eq!(ad.x.to_dense(), array![[5.0, 0.0, 1.0], [0.0, 120.0, 2.0]]);
        assert_eq!(ad.layer(COUNTS_LAYER).unwrap(), &ad.x);
        assert_eq!(ad.obs_names(), &["AAAC-1".to_string(), "TTTG-1".to_string()]);
        assert_eq!(
            ad.var_names(),
            &["FOXA2".to_string(), "ASCL1".to_string(), "FOXA2-1".to_string()]
        );
        assert_eq!(
            ad.var.get("feature_types"),
            Some(&Column::Text(vec![GENE_EXPRESSION.to_string(); 3]))
        );
    }

    #[test]
    fn test_read_gzipped_v3() {
        let dir = tempfile::tempdir().unwrap();
        write_gz(&dir.path().join("matrix.mtx.gz"), MTX);
        write_gz(&dir.path().join("barcodes.tsv.gz"), "AAAC-1\nTTTG-1\n");
        write_gz(
            &dir.path().join("features.tsv.gz"),
            "ENSG1\tFOXA2\tGene Expression\nENSG2\tASCL1\tGene Expression\nCD3\tCD3_TotalSeqB\tAntibody Capture\n",
        );

        let ad = read_10x_mtx(dir.path()).unwrap();
        assert_eq!(ad.shape(), (2, 3));
        assert_eq!(ad.x.max(), Some(120.0));
        assert_eq!(
            ad.var.get("gene_ids"),
            Some(&Column::Text(vec!["ENSG1".into(), "ENSG2".into(), "CD3".into()]))
        );
        assert_eq!(ad.var.get("feature_types").unwrap().display(2), "Antibody Capture");
    }

    #[test]
    fn test_bad_inputs() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_10x_mtx(dir.path()).is_err());

        let bad = dir.path().join("bad.mtx");
        fs::write(&bad, "2 2 1\n0 1 3\n").unwrap();
        assert!(load_mtx(&bad).is_err());
        fs::write(&bad, "2 2 1\n3 1 3\n").unwrap();
        assert!(load_mtx(&bad).is_err());
        fs::write(&bad, "% only a comment\n").unwrap();
        assert!(load_mtx(&bad).is_err());

        // barcode count disagrees with the matrix
        fs::write(dir.path().join("matrix.mtx"), MTX).unwrap();
        fs::write(dir.path().join("barcodes.tsv"), "AAAC-1\n").unwrap();
        fs::write(dir.path().join("genes.tsv"), "E1\tA\nE2\tB\nE3\tC\n").unwrap();
        assert!(read_10x_mtx(dir.path()).is_err());
    }

    #[test]
    fn test_make_unique() {
        let mut names = vec!["A".to_string(), "B".into(), "A".into(), "A-1".into(), "A".into()];
        make_unique(&mut names);
        assert_eq!(names, vec!["A", "B", "A-2", "A-1", "A-3"]);
    }
}
