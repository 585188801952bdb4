//! Storage for sampled chains.
//!
//! A [`Chain`] holds one column of shape `(nsteps, nwalkers)` per quantity: the varied
//! parameters, the fixed parameters, scalar derived quantities and the
//! `loglikelihood`/`logprior` of every sample.
//! Chains are persisted one file per chain with `bincode`.

use crate::errors::{SamplerError, SamplerResult};
use indexmap::IndexMap;
use nalgebra::DMatrix;
use ndarray::{concatenate, s, Array2, ArrayView2, Axis};
use rslike_core::calculator::LOGLIKELIHOOD;
use rslike_core::pipeline::LOGPRIOR;
use serde::{Deserialize, Serialize};
use statrs::function::erf::erf;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Metadata of the likelihood a chain was sampled from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainAttrs {
    /// Number of data points.
    pub size: Option<usize>,
    /// Number of varied (sampled or solved) parameters.
    pub nvaried: Option<usize>,
    /// Degrees of freedom, `size - nvaried`.
    pub ndof: Option<i64>,
}

/// Samples of one chain, stored column-wise with shape `(nsteps, nwalkers)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    varied: Vec<String>,
    columns: IndexMap<String, Array2<f64>>,
    attrs: ChainAttrs,
}

impl Chain {
    /// Build a chain from its columns.
    ///
    /// Every column must have the same shape, and the varied parameters as well as
    /// `loglikelihood` and `logprior` must be present.
    pub fn new(varied: Vec<String>, columns: IndexMap<String, Array2<f64>>) -> SamplerResult<Self> {
        let shape = columns
            .values()
            .next()
            .map(|c| c.dim())
            .ok_or_else(|| SamplerError::Configuration("a chain needs at least one column".to_string()))?;
        for (name, column) in &columns {
            if column.dim() != shape {
                return Err(SamplerError::Configuration(format!(
                    "column '{}' has shape {:?}, expected {:?}",
                    name,
                    column.dim(),
                    shape
                )));
            }
        }
        for name in varied.iter().map(String::as_str).chain([LOGLIKELIHOOD, LOGPRIOR]) {
            if !columns.contains_key(name) {
                return Err(SamplerError::Configuration(format!(
                    "chain has no column '{}'",
                    name
                )));
            }
        }
        Ok(Self {
            varied,
            columns,
            attrs: ChainAttrs::default(),
        })
    }

    fn shape(&self) -> (usize, usize) {
        self.columns.values().next().map_or((0, 0), |c| c.dim())
    }

    pub fn nsteps(&self) -> usize {
        self.shape().0
    }

    pub fn nwalkers(&self) -> usize {
        self.shape().1
    }

    /// Total number of samples, `nsteps * nwalkers`.
    pub fn size(&self) -> usize {
        let (nsteps, nwalkers) = self.shape();
        nsteps * nwalkers
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Names of the varied parameters, in sampling order.
    pub fn varied(&self) -> &[String] {
        &self.varied
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.columns.keys()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<ArrayView2<'_, f64>> {
        self.columns.get(name).map(|c| c.view())
    }

    pub fn try_get(&self, name: &str) -> SamplerResult<ArrayView2<'_, f64>> {
        self.get(name).ok_or_else(|| {
            SamplerError::Configuration(format!("chain has no column '{}'", name))
        })
    }

    pub fn attrs(&self) -> &ChainAttrs {
        &self.attrs
    }

    pub fn set_attrs(&mut self, attrs: ChainAttrs) {
        self.attrs = attrs;
    }

    /// Copy of steps `start..end`, clamped to the length of the chain.
    pub fn slice_steps(&self, start: usize, end: usize) -> Self {
        let end = end.min(self.nsteps());
        let start = start.min(end);
        Self {
            varied: self.varied.clone(),
            columns: self
                .columns
                .iter()
                .map(|(name, c)| (name.clone(), c.slice(s![start..end, ..]).to_owned()))
                .collect(),
            attrs: self.attrs,
        }
    }

    /// Values of `name` for every sample, step-major.
    pub fn flatten(&self, name: &str) -> SamplerResult<Vec<f64>> {
        Ok(self.try_get(name)?.iter().copied().collect())
    }

    /// Values of `name` along the path of walker `walker`.
    pub fn walker(&self, name: &str, walker: usize) -> SamplerResult<Vec<f64>> {
        let column = self.try_get(name)?;
        if walker >= column.ncols() {
            return Err(SamplerError::Configuration(format!(
                "walker {} out of range for a chain of {} walkers",
                walker,
                column.ncols()
            )));
        }
        Ok(column.column(walker).to_vec())
    }

    /// Positions of the walkers at the last step, shape `(nwalkers, nvaried)`.
    pub fn last_positions(&self) -> Option<Array2<f64>> {
        let (nsteps, nwalkers) = self.shape();
        if nsteps == 0 {
            return None;
        }
        let mut positions = Array2::zeros((nwalkers, self.varied.len()));
        for (j, name) in self.varied.iter().enumerate() {
            positions
                .column_mut(j)
                .assign(&self.columns[name.as_str()].row(nsteps - 1));
        }
        Some(positions)
    }

    /// Append the steps of `other` after the steps of this chain.
    pub fn concatenate(&self, other: &Chain) -> SamplerResult<Chain> {
        if self.varied != other.varied {
            return Err(SamplerError::Configuration(format!(
                "cannot concatenate chains with different varied parameters: {:?} vs {:?}",
                self.varied, other.varied
            )));
        }
        if self.nwalkers() != other.nwalkers() {
            return Err(SamplerError::Configuration(format!(
                "cannot concatenate chains of {} and {} walkers",
                self.nwalkers(),
                other.nwalkers()
            )));
        }
        let mut columns = IndexMap::with_capacity(self.columns.len());
        for (name, column) in &self.columns {
            let tail = other.columns.get(name).ok_or_else(|| {
                SamplerError::Configuration(format!(
                    "cannot concatenate chains: column '{}' is missing",
                    name
                ))
            })?;
            let joined = concatenate(Axis(0), &[column.view(), tail.view()])
                .map_err(|e| SamplerError::Configuration(format!("column '{}': {}", name, e)))?;
            columns.insert(name.clone(), joined);
        }
        let attrs = if other.attrs == ChainAttrs::default() {
            self.attrs
        } else {
            other.attrs
        };
        Ok(Chain {
            varied: self.varied.clone(),
            columns,
            attrs,
        })
    }

    /// Mean of `name` over all samples.
    pub fn mean(&self, name: &str) -> SamplerResult<f64> {
        let column = self.try_get(name)?;
        Ok(column.mean().unwrap_or(f64::NAN))
    }

    /// Sample covariance (`ddof = 1`) of `names` over all samples.
    pub fn covariance(&self, names: &[String]) -> SamplerResult<DMatrix<f64>> {
        let n = self.size();
        if n < 2 {
            return Err(SamplerError::Configuration(format!(
                "covariance needs at least 2 samples, chain has {}",
                n
            )));
        }
        let values = names
            .iter()
            .map(|name| self.flatten(name))
            .collect::<SamplerResult<Vec<_>>>()?;
        let means: Vec<f64> = values
            .iter()
            .map(|v| v.iter().sum::<f64>() / n as f64)
            .collect();
        let mut covariance = DMatrix::zeros(names.len(), names.len());
        for i in 0..names.len() {
            for j in 0..=i {
                let c = values[i]
                    .iter()
                    .zip(&values[j])
                    .map(|(a, b)| (a - means[i]) * (b - means[j]))
                    .sum::<f64>()
                    / (n - 1) as f64;
                covariance[(i, j)] = c;
                covariance[(j, i)] = c;
            }
        }
        Ok(covariance)
    }

    /// Shortest interval containing the probability mass within `nsigmas` of a Gaussian.
    pub fn interval(&self, name: &str, nsigmas: f64) -> SamplerResult<(f64, f64)> {
        let mut values = self.flatten(name)?;
        if values.is_empty() {
            return Err(SamplerError::Configuration(format!(
                "cannot compute an interval of '{}' without samples",
                name
            )));
        }
        values.sort_by(|a, b| a.total_cmp(b));
        let n = values.len();
        let mass = erf(nsigmas / std::f64::consts::SQRT_2);
        let width = ((mass * n as f64).ceil() as usize).clamp(1, n);
        let (mut low, mut high) = (values[0], values[width - 1]);
        for i in 1..=(n - width) {
            if values[i + width - 1] - values[i] < high - low {
                low = values[i];
                high = values[i + width - 1];
            }
        }
        Ok((low, high))
    }

    /// Save the chain to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> SamplerResult<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| {
            SamplerError::Persistence(format!(
                "Failed to create chain file {}: {}",
                path.display(),
                e
            ))
        })?;
        let mut writer = BufWriter::new(file);

        bincode::serialize_into(&mut writer, self)
            .map_err(|e| SamplerError::Persistence(format!("Failed to serialize chain: {}", e)))?;

        writer
            .flush()
            .map_err(|e| SamplerError::Persistence(format!("Failed to flush chain file: {}", e)))?;

        Ok(())
    }

    /// Load a chain from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> SamplerResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            SamplerError::Persistence(format!(
                "Failed to open chain file {}: {}",
                path.display(),
                e
            ))
        })?;
        let mut reader = BufReader::new(file);

        let chain: Chain = bincode::deserialize_from(&mut reader).map_err(|e| {
            SamplerError::Persistence(format!("Failed to deserialize chain: {}", e))
        })?;

        Ok(chain)
    }

    /// Load the chains matching `pattern`, where `*` stands for the chain index.
    ///
    /// Indices are tried from 0 until a file is missing.
    /// A pattern without `*` loads a single chain.
    pub fn load_pattern(pattern: &str) -> SamplerResult<Vec<Self>> {
        if !pattern.contains('*') {
            return Ok(vec![Self::load(pattern)?]);
        }
        let mut chains = vec![];
        loop {
            let path = expand_index(pattern, chains.len());
            if !path.exists() {
                break;
            }
            chains.push(Self::load(&path)?);
        }
        if chains.is_empty() {
            return Err(SamplerError::Persistence(format!(
                "no chain file matches '{}'",
                pattern
            )));
        }
        Ok(chains)
    }
}

fn expand_index(pattern: &str, index: usize) -> PathBuf {
    PathBuf::from(pattern.replace('*', &index.to_string()))
}

/// File names of `n` chains saved under `pattern`, where `*` stands for the chain index.
///
/// Without `*`, the chain index is inserted before the extension when `n > 1`.
pub fn expand_pattern(pattern: &str, n: usize) -> Vec<PathBuf> {
    if pattern.contains('*') || n <= 1 {
        return (0..n).map(|i| expand_index(pattern, i)).collect();
    }
    let path = Path::new(pattern);
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let extension = path.extension().map(|e| format!(".{}", e.to_string_lossy()));
    (0..n)
        .map(|i| {
            path.with_file_name(format!(
                "{}_{}{}",
                stem,
                i,
                extension.as_deref().unwrap_or("")
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    /// `x = 10 * step + walker`, `y = -x`.
    fn chain(nsteps: usize, nwalkers: usize) -> Chain {
        let x = Array2::from_shape_fn((nsteps, nwalkers), |(i, j)| (10 * i + j) as f64);
        let columns = IndexMap::from([
            ("x".to_string(), x.clone()),
            ("y".to_string(), -&x),
            (LOGLIKELIHOOD.to_string(), Array2::zeros((nsteps, nwalkers))),
            (LOGPRIOR.to_string(), Array2::zeros((nsteps, nwalkers))),
        ]);
        Chain::new(vec!["x".to_string(), "y".to_string()], columns).unwrap()
    }

    #[test]
    fn test_chain_creation() {
        let c = chain(3, 2);
        assert_eq!((c.nsteps(), c.nwalkers(), c.size()), (3, 2, 6));
        assert_eq!(c.varied(), &["x", "y"]);

        let missing = IndexMap::from([("x".to_string(), Array2::zeros((3, 2)))]);
        assert!(Chain::new(vec!["x".to_string()], missing).is_err());

        let ragged = IndexMap::from([
            ("x".to_string(), Array2::zeros((3, 2))),
            (LOGLIKELIHOOD.to_string(), Array2::zeros((3, 1))),
            (LOGPRIOR.to_string(), Array2::zeros((3, 2))),
        ]);
        assert!(Chain::new(vec!["x".to_string()], ragged).is_err());
    }

    #[test]
    fn test_flatten_and_walker() {
        let c = chain(3, 2);
        assert_eq!(c.flatten("x").unwrap(), vec![0.0, 1.0, 10.0, 11.0, 20.0, 21.0]);
        assert_eq!(c.walker("x", 1).unwrap(), vec![1.0, 11.0, 21.0]);
        assert!(c.walker("x", 2).is_err());
        assert!(c.flatten("z").is_err());
    }

    #[test]
    fn test_slice_and_last_positions() {
        let c = chain(5, 2);
        let sliced = c.slice_steps(1, 3);
        assert_eq!(sliced.nsteps(), 2);
        assert_eq!(sliced.walker("x", 0).unwrap(), vec![10.0, 20.0]);
        assert_eq!(c.slice_steps(4, 10).nsteps(), 1);
        assert!(c.slice_steps(7, 10).is_empty());

        assert_eq!(c.last_positions().unwrap(), array![[40.0, -40.0], [41.0, -41.0]]);
        assert!(c.slice_steps(0, 0).last_positions().is_none());
    }

    #[test]
    fn test_concatenate() {
        let c = chain(2, 2);
        let mut tail = chain(3, 2);
        tail.set_attrs(ChainAttrs {
            size: Some(10),
            nvaried: Some(2),
            ndof: Some(8),
        });
        let joined = c.concatenate(&tail).unwrap();
        assert_eq!(joined.nsteps(), 5);
        assert_eq!(joined.walker("x", 0).unwrap(), vec![0.0, 10.0, 0.0, 10.0, 20.0]);
        assert_eq!(joined.attrs().ndof, Some(8));

        assert!(c.concatenate(&chain(2, 3)).is_err());
    }

    #[test]
    fn test_moments() {
        let c = chain(2, 2);
        assert_relative_eq!(c.mean("x").unwrap(), 5.5);
        let cov = c.covariance(&["x".to_string(), "y".to_string()]).unwrap();
        // var([0, 1, 10, 11]) with ddof = 1
        assert_relative_eq!(cov[(0, 0)], 101.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(cov[(0, 1)], -cov[(0, 0)], epsilon = 1e-12);
        assert!(chain(1, 1).covariance(&["x".to_string()]).is_err());
    }

    #[test]
    fn test_interval() {
        let x = Array2::from_shape_fn((1000, 1), |(i, _)| i as f64 / 999.0);
        let columns = IndexMap::from([
            ("x".to_string(), x),
            (LOGLIKELIHOOD.to_string(), Array2::zeros((1000, 1))),
            (LOGPRIOR.to_string(), Array2::zeros((1000, 1))),
        ]);
        let c = Chain::new(vec!["x".to_string()], columns).unwrap();
        let (low, high) = c.interval("x", 1.0).unwrap();
        // Any window of the uniform grid has the same width
        assert_relative_eq!(high - low, 0.6827, epsilon = 2e-3);
        let (low, high) = c.interval("x", 10.0).unwrap();
        assert_eq!((low, high), (0.0, 1.0));
    }

    #[test]
    fn test_chain_serialization() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.bin");
        let c = chain(4, 3);
        c.save(&path).unwrap();
        assert_eq!(Chain::load(&path).unwrap(), c);
        assert!(Chain::load(dir.path().join("missing.bin")).is_err());
    }

    #[test]
    fn test_load_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = dir.path().join("chain_*.bin").to_string_lossy().into_owned();
        let paths = expand_pattern(&pattern, 2);
        chain(2, 2).save(&paths[0]).unwrap();
        chain(3, 2).save(&paths[1]).unwrap();

        let chains = Chain::load_pattern(&pattern).unwrap();
        assert_eq!(chains.len(), 2);
        assert_eq!(chains[1].nsteps(), 3);

        let other = dir.path().join("other_*.bin").to_string_lossy().into_owned();
        assert!(Chain::load_pattern(&other).is_err());
    }

    #[test]
    fn test_expand_pattern() {
        assert_eq!(
            expand_pattern("out/chain_*.bin", 2),
            vec![PathBuf::from("out/chain_0.bin"), PathBuf::from("out/chain_1.bin")]
        );
        assert_eq!(expand_pattern("chain.bin", 1), vec![PathBuf::from("chain.bin")]);
        assert_eq!(
            expand_pattern("chain.bin", 2),
            vec![PathBuf::from("chain_0.bin"), PathBuf::from("chain_1.bin")]
        );
    }
}
