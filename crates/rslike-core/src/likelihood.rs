//! Gaussian likelihood over one or more observables.
//!
//! Observables are calculators exposing their data vector as the [`FLATDATA`] output and
//! the matching theory prediction as [`FLATTHEORY`].

use crate::calculator::{
    Calculator, CalculatorId, Initializer, InputPort, Inputs, Likelihood, Outputs, Value,
    DEFAULT_CATCH_ERRORS, FLATDIFF, LOGLIKELIHOOD,
};
use crate::errors::{CalculatorError, CalculatorResult, ErrorKind, RslikeError, RslikeResult};
use nalgebra::{DMatrix, DVector};
use ndarray::Array1;

/// Name of the data vector output of an observable.
pub const FLATDATA: &str = "flatdata";
/// Name of the theory vector output of an observable.
pub const FLATTHEORY: &str = "flattheory";

/// `-½ (d - t)ᵀ P (d - t)` for the concatenated data `d` and theory `t` of its observables.
#[derive(Debug)]
pub struct GaussianLikelihood {
    observables: Vec<CalculatorId>,
    ports: Vec<InputPort>,
    covariance: DMatrix<f64>,
    precision: DMatrix<f64>,
    hartlap_factor: f64,
    catch_errors: Vec<ErrorKind>,
}

impl GaussianLikelihood {
    /// Create a likelihood with the covariance of the concatenated data vectors.
    pub fn new(observables: Vec<CalculatorId>, covariance: DMatrix<f64>) -> RslikeResult<Self> {
        if !covariance.is_square() {
            return Err(RslikeError::Configuration(format!(
                "covariance must be square, got {}x{}",
                covariance.nrows(),
                covariance.ncols()
            )));
        }
        let precision = covariance
            .clone()
            .cholesky()
            .ok_or_else(|| {
                RslikeError::LinearAlgebra("covariance is not positive definite".to_string())
            })?
            .inverse();
        Ok(Self {
            observables,
            ports: vec![],
            covariance,
            precision,
            hartlap_factor: 1.0,
            catch_errors: DEFAULT_CATCH_ERRORS.to_vec(),
        })
    }

    /// Covariance made of independent blocks, one per observable.
    pub fn block_diagonal(blocks: &[DMatrix<f64>]) -> DMatrix<f64> {
        let size = blocks.iter().map(|b| b.nrows()).sum();
        let mut covariance = DMatrix::zeros(size, size);
        let mut start = 0;
        for block in blocks {
            covariance
                .view_mut((start, start), (block.nrows(), block.ncols()))
                .copy_from(block);
            start += block.nrows();
        }
        covariance
    }

    /// Correct the precision of a covariance estimated from `nmocks` simulations
    /// (Hartlap et al. 2007).
    pub fn with_hartlap(mut self, nmocks: usize) -> RslikeResult<Self> {
        let size = self.covariance.nrows();
        if nmocks <= size + 2 {
            return Err(RslikeError::Configuration(format!(
                "Hartlap correction needs more than {} mocks, got {}",
                size + 2,
                nmocks
            )));
        }
        let factor = (nmocks - size - 2) as f64 / (nmocks - 1) as f64;
        self.precision *= factor / self.hartlap_factor;
        self.hartlap_factor = factor;
        Ok(self)
    }

    pub fn with_catch_errors(mut self, kinds: Vec<ErrorKind>) -> Self {
        self.catch_errors = kinds;
        self
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    pub fn hartlap_factor(&self) -> f64 {
        self.hartlap_factor
    }

    fn concatenate(&self, inputs: &Inputs, name: &str) -> CalculatorResult<Vec<f64>> {
        let mut flat = Vec::with_capacity(self.precision.nrows());
        for &port in &self.ports {
            flat.extend(inputs.value(port, name)?.to_vec());
        }
        Ok(flat)
    }
}

impl Calculator for GaussianLikelihood {
    fn initialize(&mut self, init: &mut Initializer) -> RslikeResult<()> {
        self.ports = self
            .observables
            .iter()
            .map(|&observable| init.require(observable))
            .collect();
        Ok(())
    }

    fn calculate(&mut self, inputs: &Inputs) -> CalculatorResult<Outputs> {
        let data = self.concatenate(inputs, FLATDATA)?;
        let theory = self.concatenate(inputs, FLATTHEORY)?;
        if data.len() != self.precision.nrows() || theory.len() != data.len() {
            return Err(CalculatorError::configuration(format!(
                "data ({}) and theory ({}) must match the covariance size ({})",
                data.len(),
                theory.len(),
                self.precision.nrows()
            )));
        }
        let diff = DVector::from_vec(data) - DVector::from_vec(theory.clone());
        let chi2 = (diff.transpose() * &self.precision * &diff)[(0, 0)];
        if !chi2.is_finite() {
            return Err(CalculatorError::numerical(format!("chi2 is {}", chi2)));
        }
        Ok(Outputs::from([
            (LOGLIKELIHOOD.to_string(), Value::Scalar(-0.5 * chi2)),
            (FLATDIFF.to_string(), Value::Array(Array1::from_iter(diff.iter().copied()))),
            (FLATTHEORY.to_string(), Value::from(theory)),
        ]))
    }

    fn as_likelihood(&self) -> Option<&dyn Likelihood> {
        Some(self)
    }
}

impl Likelihood for GaussianLikelihood {
    fn catch_errors(&self) -> Vec<ErrorKind> {
        self.catch_errors.clone()
    }

    fn size(&self) -> Option<usize> {
        Some(self.covariance.nrows())
    }

    fn precision(&self) -> Option<&DMatrix<f64>> {
        Some(&self.precision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::dmatrix;

    #[test]
    fn block_diagonal() {
        let cov = GaussianLikelihood::block_diagonal(&[
            dmatrix![1.0, 0.5; 0.5, 2.0],
            dmatrix![3.0],
        ]);
        assert_eq!(
            cov,
            dmatrix![1.0, 0.5, 0.0; 0.5, 2.0, 0.0; 0.0, 0.0, 3.0]
        );
    }

    #[test]
    fn precision_is_inverse_covariance() {
        let likelihood =
            GaussianLikelihood::new(vec![], dmatrix![4.0, 0.0; 0.0, 0.25]).unwrap();
        let precision = likelihood.precision().unwrap();
        assert_relative_eq!(precision[(0, 0)], 0.25, epsilon = 1e-12);
        assert_relative_eq!(precision[(1, 1)], 4.0, epsilon = 1e-12);
        assert_eq!(likelihood.size(), Some(2));
    }

    #[test]
    fn hartlap() {
        let likelihood = GaussianLikelihood::new(vec![], DMatrix::identity(10, 10))
            .unwrap()
            .with_hartlap(101)
            .unwrap();
        assert_relative_eq!(likelihood.hartlap_factor(), 89.0 / 100.0);
        assert_relative_eq!(likelihood.precision().unwrap()[(3, 3)], 0.89, epsilon = 1e-12);

        let result = GaussianLikelihood::new(vec![], DMatrix::identity(10, 10))
            .unwrap()
            .with_hartlap(12);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_singular_covariance() {
        let result = GaussianLikelihood::new(vec![], dmatrix![1.0, 1.0; 1.0, 1.0]);
        assert!(matches!(result, Err(RslikeError::LinearAlgebra(_))));
    }
}
