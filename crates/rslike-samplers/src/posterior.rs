//! Log-posterior of a likelihood pipeline, evaluated in batches.

use crate::errors::{SamplerError, SamplerResult};
use ndarray::Array2;
use rslike_core::calculator::LOGLIKELIHOOD;
use rslike_core::comm::{Comm, CommunicatorExt};
use rslike_core::parameter::{ParameterCollection, Samples};
use rslike_core::pipeline::{Pipeline, LOGPRIOR};
use serde::{Deserialize, Serialize};

/// Log-posterior and its components for a batch of points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub logposterior: Vec<f64>,
    pub loglikelihood: Vec<f64>,
    /// Log-prior of the sampled and solved parameters.
    pub logprior: Vec<f64>,
    /// Scalar derived quantities, shape `(npoints, nderived)`.
    pub derived: Array2<f64>,
}

/// Wraps a likelihood [`Pipeline`] to evaluate `log L + log π` on rows of sampled parameters.
///
/// Points with a non-finite prior are not sent to the pipeline; points that fail with a
/// catchable error or return NaN get a log-posterior of `-inf`.
#[derive(Debug)]
pub struct Posterior {
    pipeline: Pipeline,
    sampled: ParameterCollection,
    derived: Vec<String>,
    ncalls: usize,
}

impl Posterior {
    pub fn new(pipeline: Pipeline) -> SamplerResult<Self> {
        if !pipeline.is_likelihood() {
            return Err(SamplerError::Configuration(
                "the root calculator of the pipeline is not a likelihood".to_string(),
            ));
        }
        let sampled = pipeline.params().sampled();
        if sampled.is_empty() {
            return Err(SamplerError::Configuration(
                "the likelihood has no parameter to sample".to_string(),
            ));
        }
        let derived = pipeline
            .derived_columns()
            .into_iter()
            .filter(|(name, width)| *width == 1 && name != LOGLIKELIHOOD && name != LOGPRIOR)
            .map(|(name, _)| name)
            .collect();
        Ok(Self {
            pipeline,
            sampled,
            derived,
            ncalls: 0,
        })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn into_pipeline(self) -> Pipeline {
        self.pipeline
    }

    /// The sampled parameters, in the order of the position columns.
    pub fn params(&self) -> &ParameterCollection {
        &self.sampled
    }

    pub fn varied(&self) -> Vec<String> {
        self.sampled.names()
    }

    pub fn ndim(&self) -> usize {
        self.sampled.len()
    }

    /// Names of the scalar derived quantities reported in [`Evaluation::derived`].
    pub fn derived_names(&self) -> &[String] {
        &self.derived
    }

    /// Number of points sent to the pipeline so far.
    pub fn ncalls(&self) -> usize {
        self.ncalls
    }

    pub fn comm(&self) -> &Comm {
        self.pipeline.comm()
    }

    pub fn set_comm(&mut self, comm: Comm) {
        self.pipeline.set_comm(comm);
    }

    /// Sum of the prior log-densities of the sampled parameters at `point`.
    pub fn logprior(&self, point: &[f64]) -> f64 {
        self.sum_logprior(point.iter())
    }

    fn sum_logprior<'a>(&self, point: impl Iterator<Item = &'a f64>) -> f64 {
        self.sampled
            .iter()
            .zip(point)
            .map(|(param, &x)| param.prior.logpdf(x))
            .sum()
    }

    /// Evaluate the posterior at `positions`, of shape `(npoints, ndim)`.
    ///
    /// Collective over the pipeline's communicator: the root's positions are evaluated and
    /// the result is returned on every rank.
    pub fn evaluate(&mut self, positions: &Array2<f64>) -> SamplerResult<Evaluation> {
        let comm = self.pipeline.comm().clone();
        let positions: Array2<f64> = comm.bcast(comm.is_root().then(|| positions.clone()), 0)?;
        let (npoints, ndim) = positions.dim();
        if ndim != self.ndim() {
            return Err(SamplerError::Configuration(format!(
                "expected points of {} parameters, got {}",
                self.ndim(),
                ndim
            )));
        }

        let mut logprior: Vec<f64> = positions
            .rows()
            .into_iter()
            .map(|row| {
                if row.iter().any(|x| x.is_nan()) {
                    f64::NEG_INFINITY
                } else {
                    self.sum_logprior(row.iter())
                }
            })
            .collect();
        let valid: Vec<usize> = (0..npoints).filter(|&i| logprior[i].is_finite()).collect();

        let mut evaluation = Evaluation {
            logposterior: vec![f64::NEG_INFINITY; npoints],
            loglikelihood: vec![f64::NEG_INFINITY; npoints],
            logprior: logprior.clone(),
            derived: Array2::from_elem((npoints, self.derived.len()), f64::NAN),
        };
        if valid.is_empty() {
            return Ok(evaluation);
        }

        let points = Samples::from_columns(self.sampled.names().into_iter().enumerate().map(
            |(j, name)| (name, valid.iter().map(|&i| positions[[i, j]]).collect::<Vec<f64>>()),
        ))?;
        self.ncalls += valid.len();
        let result = self.pipeline.mpicalculate(&points)?;

        if comm.is_root() {
            let derived = &result.derived;
            for (k, &i) in valid.iter().enumerate() {
                let loglikelihood = derived
                    .scalar(LOGLIKELIHOOD)
                    .map_or(f64::NEG_INFINITY, |c| c[k]);
                // The pipeline's log-prior covers both sampled and solved parameters
                if let Some(column) = derived.scalar(LOGPRIOR) {
                    logprior[i] = column[k];
                }
                for (j, name) in self.derived.iter().enumerate() {
                    if let Some(column) = derived.scalar(name) {
                        evaluation.derived[[i, j]] = column[k];
                    }
                }
                evaluation.loglikelihood[i] = loglikelihood;
                evaluation.logposterior[i] = loglikelihood + logprior[i];
            }
            evaluation.logprior = logprior;
        }
        Ok(comm.bcast(comm.is_root().then_some(evaluation), 0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rslike_core::comm::LocalComm;
    use rslike_core::errors::ErrorKind;
    use rslike_core::example_calculators::{Faulty, Square};
    use rslike_core::pipeline::PipelineBuilder;

    fn square() -> Posterior {
        let mut builder = PipelineBuilder::new();
        let square = builder.add(Square);
        Posterior::new(builder.build(square).unwrap()).unwrap()
    }

    #[test]
    fn test_square_posterior() {
        let mut posterior = square();
        assert_eq!(posterior.varied(), vec!["x"]);
        assert_eq!(posterior.derived_names(), &["f".to_string()]);

        let evaluation = posterior.evaluate(&array![[1.0], [2.0], [-3.0]]).unwrap();
        let logprior = -(20.0f64).ln();
        assert_eq!(evaluation.loglikelihood, vec![-1.0, -4.0, -9.0]);
        assert_eq!(evaluation.logprior, vec![logprior; 3]);
        assert_eq!(
            evaluation.logposterior,
            vec![-1.0 + logprior, -4.0 + logprior, -9.0 + logprior]
        );
        assert_eq!(evaluation.derived, array![[1.0], [4.0], [9.0]]);
        assert_eq!(posterior.ncalls(), 3);
    }

    #[test]
    fn test_prior_short_circuit() {
        let mut posterior = square();
        let evaluation = posterior
            .evaluate(&array![[11.0], [f64::NAN], [0.5]])
            .unwrap();
        assert_eq!(evaluation.logposterior[0], f64::NEG_INFINITY);
        assert_eq!(evaluation.logposterior[1], f64::NEG_INFINITY);
        assert!(evaluation.logposterior[2].is_finite());
        assert!(evaluation.derived[[0, 0]].is_nan());
        // Only the point inside the prior reached the pipeline
        assert_eq!(posterior.ncalls(), 1);
    }

    #[test]
    fn test_caught_errors() {
        let mut builder = PipelineBuilder::new();
        let faulty = builder.add(Faulty::new(1.0, ErrorKind::InvalidPoint));
        let mut posterior = Posterior::new(builder.build(faulty).unwrap()).unwrap();
        let evaluation = posterior.evaluate(&array![[0.0], [2.0]]).unwrap();
        assert_eq!(evaluation.logposterior, vec![0.0, f64::NEG_INFINITY]);
        assert_eq!(evaluation.loglikelihood, vec![0.0, f64::NEG_INFINITY]);
    }

    #[test]
    fn test_uncaught_error() {
        let mut builder = PipelineBuilder::new();
        let faulty = builder.add(Faulty::new(1.0, ErrorKind::Other));
        let mut posterior = Posterior::new(builder.build(faulty).unwrap()).unwrap();
        assert!(matches!(
            posterior.evaluate(&array![[2.0]]),
            Err(SamplerError::Core(_))
        ));
    }

    #[test]
    fn test_wrong_dimension() {
        let mut posterior = square();
        assert!(matches!(
            posterior.evaluate(&array![[1.0, 2.0]]),
            Err(SamplerError::Configuration(_))
        ));
    }

    #[test]
    fn test_evaluation_on_every_rank() {
        let results = LocalComm::run(3, |comm| {
            let mut builder = PipelineBuilder::new();
            let square = builder.add(Square);
            builder.with_comm(comm.clone());
            let mut posterior = Posterior::new(builder.build(square).unwrap()).unwrap();
            // Only the root's points count
            let positions = if comm.is_root() {
                array![[1.0], [2.0], [3.0], [4.0]]
            } else {
                array![[0.0]]
            };
            posterior.evaluate(&positions).unwrap()
        });
        for evaluation in &results {
            assert_eq!(evaluation, &results[0]);
            assert_eq!(evaluation.loglikelihood, vec![-1.0, -4.0, -9.0, -16.0]);
        }
    }
}
