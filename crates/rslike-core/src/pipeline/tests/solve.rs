//! Analytic solving of `.best` and `.marg` parameters.

use crate::calculator::LOGLIKELIHOOD;
use crate::errors::RslikeError;
use crate::example_calculators::{Observable, Polynomial, Square};
use crate::likelihood::GaussianLikelihood;
use crate::parameter::{Parameter, ParameterPrior, Samples, SolveMode};
use crate::pipeline::{Pipeline, PipelineBuilder, LOGPRIOR};
use approx::assert_relative_eq;
use indexmap::IndexMap;
use nalgebra::DMatrix;

const X: [f64; 4] = [0.0, 1.0, 2.0, 3.0];
const DATA: [f64; 4] = [1.1, 2.9, 5.2, 6.8];
const SIGMA: f64 = 0.5;

/// `c0 + c1 x` against noisy data.
fn linear_pipeline() -> Pipeline {
    let mut builder = PipelineBuilder::new();
    let poly = builder.add(Polynomial::new(X.to_vec(), 1));
    let observable = builder.add(Observable::new(poly, DATA.to_vec()));
    let covariance = DMatrix::identity(4, 4) * SIGMA * SIGMA;
    let likelihood = builder.add(GaussianLikelihood::new(vec![observable], covariance).unwrap());
    builder.build(likelihood).unwrap()
}

fn chi2(c0: f64, c1: f64) -> f64 {
    X.iter()
        .zip(DATA.iter())
        .map(|(x, d)| ((d - c0 - c1 * x) / SIGMA).powi(2))
        .sum()
}

fn c0(value: f64) -> IndexMap<String, f64> {
    IndexMap::from([("c0".to_string(), value)])
}

#[test]
fn best_matches_grid_search() {
    let mut pipeline = linear_pipeline();
    pipeline
        .update_param(Parameter::new("c1").with_solve(SolveMode::SolvedBest))
        .unwrap();
    assert_eq!(pipeline.params().sampled().names(), vec!["c0"]);

    let row = pipeline.calculate(&c0(1.3)).unwrap();
    let solved = row["c1"][0];
    let loglikelihood = row[LOGLIKELIHOOD][0];

    // Maximise explicitly over c1 with the parameter sampled
    let mut reference = linear_pipeline();
    let (mut best, mut argbest) = (f64::NEG_INFINITY, f64::NAN);
    for i in 0..=4000 {
        let c1 = 1.0 + 2e-3 * i as f64 / 2.0;
        let point = IndexMap::from([("c0".to_string(), 1.3), ("c1".to_string(), c1)]);
        let value = reference.calculate(&point).unwrap()[LOGLIKELIHOOD][0];
        if value > best {
            best = value;
            argbest = c1;
        }
    }
    assert_relative_eq!(loglikelihood, best, epsilon = 1e-5);
    assert_relative_eq!(solved, argbest, epsilon = 1e-3);

    // Closed form for a linear model
    let sxx: f64 = X.iter().map(|x| x * x).sum();
    let sxd: f64 = X.iter().zip(DATA.iter()).map(|(x, d)| x * (d - 1.3)).sum();
    assert_relative_eq!(solved, sxd / sxx, epsilon = 1e-8);
    assert_relative_eq!(loglikelihood, -0.5 * chi2(1.3, sxd / sxx), epsilon = 1e-8);
    assert_eq!(row[LOGPRIOR], vec![0.0]);
}

#[test]
fn marginalisation_adds_determinant() {
    let mut best = linear_pipeline();
    best.update_param(Parameter::new("c1").with_solve(SolveMode::SolvedBest))
        .unwrap();
    let mut marg = linear_pipeline();
    marg.update_param(Parameter::new("c1").with_solve(SolveMode::SolvedMarginal))
        .unwrap();

    let profiled = best.calculate(&c0(0.8)).unwrap();
    let marginalised = marg.calculate(&c0(0.8)).unwrap();

    let fisher: f64 = X.iter().map(|x| x * x).sum::<f64>() / (SIGMA * SIGMA);
    assert_relative_eq!(marginalised["c1"][0], profiled["c1"][0], epsilon = 1e-8);
    assert_relative_eq!(
        marginalised[LOGLIKELIHOOD][0],
        profiled[LOGLIKELIHOOD][0] - 0.5 * fisher.ln(),
        epsilon = 1e-6
    );
}

#[test]
fn gaussian_prior_on_solved_parameter() {
    let mut pipeline = linear_pipeline();
    let prior = ParameterPrior::normal(1.5, 0.2).unwrap();
    pipeline
        .update_param(
            Parameter::new("c1")
                .with_prior(prior.clone())
                .with_solve(SolveMode::SolvedBest),
        )
        .unwrap();
    let row = pipeline.calculate(&c0(1.0)).unwrap();

    // Maximum of the likelihood times the prior
    let s2 = SIGMA * SIGMA;
    let sxx: f64 = X.iter().map(|x| x * x).sum::<f64>() / s2;
    let sxd: f64 = X.iter().zip(DATA.iter()).map(|(x, d)| x * (d - 1.0)).sum::<f64>() / s2;
    let expected = (sxd + 1.5 / 0.04) / (sxx + 1.0 / 0.04);
    assert_relative_eq!(row["c1"][0], expected, epsilon = 1e-8);
    assert_relative_eq!(row[LOGPRIOR][0], prior.logpdf(expected), epsilon = 1e-10);
}

#[test]
fn solved_values_are_derived_columns() {
    let mut pipeline = linear_pipeline();
    pipeline
        .update_param(Parameter::new("c0").with_solve(SolveMode::Auto))
        .unwrap();
    pipeline
        .update_param(Parameter::new("c1").with_solve(SolveMode::Auto))
        .unwrap();
    // Auto resolves to marginalisation by default
    assert_eq!(
        pipeline.params().get("c0").unwrap().solve,
        SolveMode::SolvedMarginal
    );
    pipeline.set_solved_default(SolveMode::SolvedBest).unwrap();
    assert_eq!(pipeline.params().get("c1").unwrap().solve, SolveMode::SolvedBest);

    let columns: Vec<String> = pipeline.derived_columns().into_iter().map(|(n, _)| n).collect();
    assert_eq!(columns, vec![LOGLIKELIHOOD, LOGPRIOR, "c0", "c1"]);

    // Nothing left to sample: one row evaluated at the least-squares fit
    let result = pipeline.mpicalculate(&Samples::new(2)).unwrap();
    let intercept = result.derived.scalar("c0").unwrap();
    let slope = result.derived.scalar("c1").unwrap();
    assert_eq!(intercept[0], intercept[1]);
    assert_relative_eq!(slope[0], 1.94, epsilon = 1e-8);
    assert_relative_eq!(intercept[0], 1.09, epsilon = 1e-8);

    // Solved parameters cannot be set
    assert!(pipeline.calculate(&c0(1.0)).is_err());
}

#[test]
fn solving_is_reproducible() {
    let mut pipeline = linear_pipeline();
    pipeline
        .update_param(Parameter::new("c1").with_solve(SolveMode::SolvedMarginal))
        .unwrap();
    let a = pipeline.calculate(&c0(0.3)).unwrap();
    pipeline.calculate(&c0(2.0)).unwrap();
    let b = pipeline.calculate(&c0(0.3)).unwrap();
    assert_eq!(a, b);
}

#[test]
fn solving_requires_gaussian_likelihood() {
    let mut builder = PipelineBuilder::new();
    let square = builder.add(Square);
    let mut pipeline = builder.build(square).unwrap();
    let result =
        pipeline.update_param(Parameter::new("x").with_solve(SolveMode::SolvedBest));
    assert!(matches!(
        result,
        Err(RslikeError::SolveUnsupported { parameters }) if parameters == vec!["x"]
    ));
    // The pipeline is left untouched
    assert!(pipeline.params().get("x").unwrap().is_sampled());
}
