//! Finite-difference derivatives through a pipeline and Fisher forecasts.

use crate::calculator::{CalculatorId, Value, FLATDIFF};
use crate::errors::{RslikeError, RslikeResult};
use crate::pipeline::Pipeline;
use indexmap::IndexMap;
use nalgebra::{DMatrix, DVector};
use tracing::debug;

/// Central finite-difference derivatives of calculator outputs with respect to
/// sampled parameters.
///
/// Each parameter is displaced by its [`crate::parameter::Parameter::step`].
#[derive(Debug)]
pub struct Differentiation<'a> {
    pipeline: &'a mut Pipeline,
    params: Vec<String>,
}

impl<'a> Differentiation<'a> {
    /// Differentiate with respect to every sampled parameter of the pipeline.
    pub fn new(pipeline: &'a mut Pipeline) -> Self {
        let params = pipeline.params().sampled().names();
        Self { pipeline, params }
    }

    /// Differentiate with respect to the sampled parameters matching `patterns`.
    pub fn with_params(pipeline: &'a mut Pipeline, patterns: &[&str]) -> RslikeResult<Self> {
        let params = pipeline.params().sampled().select(patterns, None)?.names();
        if params.is_empty() {
            return Err(RslikeError::Configuration(format!(
                "no sampled parameter matches {:?}",
                patterns
            )));
        }
        Ok(Self { pipeline, params })
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    fn output(&mut self, point: &IndexMap<String, f64>, id: CalculatorId, name: &str) -> RslikeResult<DVector<f64>> {
        self.pipeline.calculate(point)?;
        let value = self.pipeline.get(id)?.get(name).ok_or_else(|| {
            RslikeError::Configuration(format!("calculator {} has no output '{}'", id, name))
        })?;
        Ok(DVector::from_vec(Value::to_vec(value)))
    }

    /// Jacobian of output `name` of calculator `id` at `point`, one column per parameter.
    ///
    /// Parameters missing from `point` are taken at their current value.
    pub fn jacobian(
        &mut self,
        id: CalculatorId,
        name: &str,
        point: &IndexMap<String, f64>,
    ) -> RslikeResult<DMatrix<f64>> {
        let mut center = point.clone();
        for param in &self.params {
            if !center.contains_key(param) {
                let value = self.pipeline.values().get(param).copied().ok_or_else(|| {
                    RslikeError::UnknownParameter(param.clone())
                })?;
                center.insert(param.clone(), value);
            }
        }

        let mut columns = Vec::with_capacity(self.params.len());
        for param in self.params.clone() {
            let step = self.pipeline.params().try_get(&param)?.step();
            let x = center[&param];
            let mut shifted = center.clone();
            shifted.insert(param.clone(), x + step);
            let upper = self.output(&shifted, id, name)?;
            shifted.insert(param.clone(), x - step);
            let lower = self.output(&shifted, id, name)?;
            if upper.len() != lower.len() {
                return Err(RslikeError::ShapeMismatch {
                    parameter: name.to_string(),
                    shape: vec![upper.len()],
                    width: lower.len(),
                });
            }
            columns.push((upper - lower) / (2.0 * step));
        }
        // Leave the pipeline at the requested point
        let size = self.output(&center, id, name)?.len();

        let mut jacobian = DMatrix::zeros(size, columns.len());
        for (j, column) in columns.iter().enumerate() {
            if column.len() != size {
                return Err(RslikeError::ShapeMismatch {
                    parameter: name.to_string(),
                    shape: vec![size],
                    width: column.len(),
                });
            }
            jacobian.set_column(j, column);
        }
        Ok(jacobian)
    }
}

/// Gaussian Fisher matrix `F = Jᵀ P J + P_prior` of a Gaussian likelihood,
/// where `J` is the Jacobian of the theory and `P` the data precision.
#[derive(Debug, Clone, PartialEq)]
pub struct Fisher {
    names: Vec<String>,
    center: DVector<f64>,
    matrix: DMatrix<f64>,
}

impl Fisher {
    /// Fisher matrix of the sampled parameters at `point`.
    ///
    /// The root of the pipeline must be a Gaussian likelihood.
    pub fn compute(pipeline: &mut Pipeline, point: &IndexMap<String, f64>) -> RslikeResult<Self> {
        let precision = pipeline
            .precision()
            .cloned()
            .ok_or_else(|| RslikeError::Configuration("Fisher matrix requires a Gaussian likelihood".to_string()))?;
        let root = pipeline.root();
        let mut differentiation = Differentiation::new(pipeline);
        let names = differentiation.params().to_vec();
        // flatdiff = data - theory
        let jacobian = -differentiation.jacobian(root, FLATDIFF, point)?;
        if jacobian.nrows() != precision.nrows() {
            return Err(RslikeError::ShapeMismatch {
                parameter: FLATDIFF.to_string(),
                shape: vec![precision.nrows()],
                width: jacobian.nrows(),
            });
        }

        let mut matrix = jacobian.transpose() * &precision * &jacobian;
        let mut center = DVector::zeros(names.len());
        for (i, name) in names.iter().enumerate() {
            let param = pipeline.params().try_get(name)?;
            matrix[(i, i)] += param.prior.gaussian_precision().0;
            center[i] = pipeline.values()[name.as_str()];
        }
        debug!(parameters = ?names, "Computed Fisher matrix");
        Ok(Self {
            names,
            center,
            matrix,
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Point the matrix was computed at.
    pub fn center(&self) -> &DVector<f64> {
        &self.center
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    /// Forecast parameter covariance, the inverse of the Fisher matrix.
    pub fn covariance(&self) -> RslikeResult<DMatrix<f64>> {
        self.matrix
            .clone()
            .try_inverse()
            .ok_or_else(|| RslikeError::LinearAlgebra("Fisher matrix is singular".to_string()))
    }

    /// Forecast marginal standard deviation of `name`.
    pub fn std(&self, name: &str) -> RslikeResult<f64> {
        let index = self
            .names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| RslikeError::UnknownParameter(name.to_string()))?;
        Ok(self.covariance()?[(index, index)].sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::example_calculators::{Observable, Polynomial, MODEL};
    use crate::likelihood::GaussianLikelihood;
    use crate::parameter::{Parameter, ParameterPrior};
    use crate::pipeline::PipelineBuilder;
    use approx::assert_relative_eq;

    fn linear_pipeline(sigma: f64) -> (Pipeline, CalculatorId) {
        let x = vec![0.0, 1.0, 2.0, 3.0];
        let mut builder = PipelineBuilder::new();
        let poly = builder.add(Polynomial::new(x.clone(), 1));
        let observable = builder.add(Observable::new(poly, vec![1.0, 3.0, 5.0, 7.0]));
        let covariance = DMatrix::identity(4, 4) * sigma * sigma;
        let likelihood = builder.add(GaussianLikelihood::new(vec![observable], covariance).unwrap());
        (builder.build(likelihood).unwrap(), poly)
    }

    #[test]
    fn jacobian_of_polynomial() {
        let (mut pipeline, poly) = linear_pipeline(1.0);
        let point = IndexMap::from([("c0".to_string(), 1.0), ("c1".to_string(), 2.0)]);
        let mut differentiation = Differentiation::new(&mut pipeline);
        assert_eq!(differentiation.params(), &["c0", "c1"]);
        let jacobian = differentiation.jacobian(poly, MODEL, &point).unwrap();
        assert_eq!(jacobian.shape(), (4, 2));
        for (i, x) in [0.0, 1.0, 2.0, 3.0].iter().enumerate() {
            assert_relative_eq!(jacobian[(i, 0)], 1.0, epsilon = 1e-8);
            assert_relative_eq!(jacobian[(i, 1)], *x, epsilon = 1e-8);
        }
    }

    #[test]
    fn fisher_of_linear_model() {
        let sigma = 0.5;
        let (mut pipeline, _) = linear_pipeline(sigma);
        let point = IndexMap::from([("c0".to_string(), 1.0), ("c1".to_string(), 2.0)]);
        let fisher = Fisher::compute(&mut pipeline, &point).unwrap();

        // F = Aᵀ A / σ² with A = [1, x]
        let s = 1.0 / (sigma * sigma);
        assert_relative_eq!(fisher.matrix()[(0, 0)], 4.0 * s, epsilon = 1e-6);
        assert_relative_eq!(fisher.matrix()[(0, 1)], 6.0 * s, epsilon = 1e-6);
        assert_relative_eq!(fisher.matrix()[(1, 1)], 14.0 * s, epsilon = 1e-6);
        assert_relative_eq!(fisher.center()[1], 2.0);

        // Var(c1) = σ² n / (n Σx² - (Σx)²)
        let expected = (sigma * sigma * 4.0 / (4.0 * 14.0 - 36.0)).sqrt();
        assert_relative_eq!(fisher.std("c1").unwrap(), expected, epsilon = 1e-6);
        assert!(fisher.std("c2").is_err());
    }

    #[test]
    fn fisher_adds_gaussian_prior() {
        let (mut pipeline, _) = linear_pipeline(1.0);
        pipeline
            .update_param(Parameter::new("c0").with_prior(ParameterPrior::normal(0.0, 0.5).unwrap()))
            .unwrap();
        let fisher = Fisher::compute(&mut pipeline, &IndexMap::new()).unwrap();
        assert_relative_eq!(fisher.matrix()[(0, 0)], 4.0 + 4.0, epsilon = 1e-6);
    }
}
