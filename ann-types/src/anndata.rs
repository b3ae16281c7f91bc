use crate::error::AnnError;
use crate::frame::Frame;
use crate::matrix::Matrix;
use anyhow::Error;
use ndarray::{Array1, Array2, Axis};
use sprs::CsMat;
use std::collections::BTreeMap;

/// An observation-by-feature matrix with per-observation (`obs`) and
/// per-feature (`var`) metadata, alternate layers, and the derived results
/// attached by downstream analysis (`obsm`, `varm`, `obsp`, `uns`).
#[derive(Clone, Debug, PartialEq)]
pub struct AnnData {
    pub x: Matrix,
    pub obs: Frame,
    pub var: Frame,
    pub layers: BTreeMap<String, Matrix>,
    pub obsm: BTreeMap<String, Array2<f64>>,
    pub varm: BTreeMap<String, Array2<f64>>,
    pub obsp: BTreeMap<String, CsMat<f64>>,
    pub uns: BTreeMap<String, Array1<f64>>,
}

impl AnnData {
    pub fn new(x: Matrix, obs_names: Vec<String>, var_names: Vec<String>) -> Result<AnnData, Error> {
        let expected = (obs_names.len(), var_names.len());
        if x.shape() != expected {
            return Err(AnnError::ShapeMismatch {
                what: "X".to_string(),
                expected,
                actual: x.shape(),
            }
            .into());
        }
        Ok(AnnData {
            x: x.into_csr(),
            obs: Frame::new(obs_names),
            var: Frame::new(var_names),
            layers: BTreeMap::new(),
            obsm: BTreeMap::new(),
            varm: BTreeMap::new(),
            obsp: BTreeMap::new(),
            uns: BTreeMap::new(),
        })
    }

    pub fn n_obs(&self) -> usize {
        self.obs.len()
    }

    pub fn n_vars(&self) -> usize {
        self.var.len()
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.n_obs(), self.n_vars())
    }

    pub fn obs_names(&self) -> &[String] {
        &self.obs.index
    }

    pub fn var_names(&self) -> &[String] {
        &self.var.index
    }

    /// Position of the first feature named `name`.
    pub fn var_index(&self, name: &str) -> Option<usize> {
        self.var.position(name)
    }

    /// Add or replace a layer; it must match the shape of `x`. Sparse layers
    /// are stored in CSR layout.
    pub fn add_layer(&mut self, name: impl Into<String>, layer: Matrix) -> Result<(), Error> {
        let name = name.into();
        if layer.shape() != self.shape() {
            return Err(AnnError::ShapeMismatch {
                what: format!("layer {name}"),
                expected: self.shape(),
                actual: layer.shape(),
            }
            .into());
        }
        self.layers.insert(name, layer.into_csr());
        Ok(())
    }

    /// Layer `name`, or `MissingLayer`.
    pub fn layer(&self, name: &str) -> Result<&Matrix, AnnError> {
        self.layers
            .get(name)
            .ok_or_else(|| AnnError::MissingLayer(name.to_string()))
    }

    /// Add or replace an obs × k representation.
    pub fn set_obsm(&mut self, name: impl Into<String>, rep: Array2<f64>) -> Result<(), Error> {
        let name = name.into();
        if rep.nrows() != self.n_obs() {
            return Err(AnnError::ShapeMismatch {
                what: format!("obsm {name}"),
                expected: (self.n_obs(), rep.ncols()),
                actual: rep.dim(),
            }
            .into());
        }
        self.obsm.insert(name, rep);
        Ok(())
    }

    /// Deep copy restricted to the features at `vars`, in that order. Every
    /// var-axis field is subset; obs-axis fields are copied unchanged.
    pub fn subset_vars(&self, vars: &[usize]) -> AnnData {
        AnnData {
            x: self.x.select_columns(vars),
            obs: self.obs.clone(),
            var: self.var.select_rows(vars),
            layers: self
                .layers
                .iter()
                .map(|(k, m)| (k.clone(), m.select_columns(vars)))
                .collect(),
            obsm: self.obsm.clone(),
            varm: self
                .varm
                .iter()
                .map(|(k, m)| (k.clone(), m.select(Axis(0), vars)))
                .collect(),
            obsp: self.obsp.clone(),
            uns: self.uns.clone(),
        }
    }
}
