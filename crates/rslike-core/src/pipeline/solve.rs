//! Analytic solving of `.best` and `.marg` parameters.
//!
//! The root must be a Gaussian likelihood exposing its residuals `r = data - theory` as the
//! [`FLATDIFF`] output together with its precision matrix `P`.
//! Around the current solved values `θ` the theory is linearised with finite differences,
//! `t(θ + Δ) ≈ t(θ) + J Δ`, and the Gauss-Newton update
//!
//! ```text
//! F = Jᵀ P J + P_prior
//! F Δ = Jᵀ P r + P_prior (μ_prior - θ)
//! ```
//!
//! is applied until every component of `Δ` is below `tolerance` posterior standard deviations.
//! For a theory linear in the solved parameters a single update is exact.
//! Marginalised parameters add `-½ ln det F` (restricted to them) to the log-likelihood.

use crate::calculator::{Value, FLATDIFF};
use crate::errors::CalculatorError;
use crate::parameter::SolveMode;
use nalgebra::{DMatrix, DVector};
use tracing::warn;

use super::runtime::{Pipeline, SolvedPoint};
use super::types::RowError;

impl Pipeline {
    fn numerical_error(&self, message: String) -> RowError {
        let error = CalculatorError::numerical(message);
        let catchable = self.catch_errors().contains(&error.kind);
        RowError {
            calculator: self.nodes[self.root.0].calculator.name(),
            error,
            catchable,
        }
    }

    fn flatdiff(&self) -> Result<DVector<f64>, RowError> {
        match self.ports[self.root.0].outputs().get(FLATDIFF) {
            Some(value) => Ok(DVector::from_vec(Value::to_vec(value))),
            None => Err(RowError {
                calculator: self.nodes[self.root.0].calculator.name(),
                error: CalculatorError::configuration(format!(
                    "solving parameters requires the '{}' output",
                    FLATDIFF
                )),
                catchable: false,
            }),
        }
    }

    fn set_solved(&mut self, names: &[String], theta: &DVector<f64>) {
        for (name, &value) in names.iter().zip(theta.iter()) {
            self.values.insert(name.clone(), value);
        }
    }

    /// Evaluate the graph, solving for the solved parameters.
    pub(super) fn solve_point(&mut self) -> Result<SolvedPoint, RowError> {
        let names = self.solved.clone();
        let k = names.len();
        let params: Vec<_> = names
            .iter()
            .filter_map(|name| self.params.get(name).cloned())
            .collect();
        let precision = match &self.precision {
            Some(precision) => precision.clone(),
            None => {
                return Err(self.numerical_error(
                    "no precision matrix available for solving".to_string(),
                ))
            }
        };

        // Always start from the declared values so that evaluations are reproducible
        let mut theta = DVector::from_iterator(k, params.iter().map(|p| p.value));
        let mut prior_precision = DVector::<f64>::zeros(k);
        let mut prior_mean = DVector::<f64>::zeros(k);
        for (i, param) in params.iter().enumerate() {
            let (precision, mean) = param.prior.gaussian_precision();
            prior_precision[i] = precision;
            prior_mean[i] = mean;
        }

        let mut fisher = DMatrix::<f64>::zeros(k, k);
        let mut converged = false;
        for _ in 0..self.solver.max_iterations.max(1) {
            self.set_solved(&names, &theta);
            self.run_graph()?;
            let r0 = self.flatdiff()?;
            if precision.nrows() != r0.len() {
                return Err(self.numerical_error(format!(
                    "precision matrix has size {} but the residuals have size {}",
                    precision.nrows(),
                    r0.len()
                )));
            }

            let mut jacobian = DMatrix::<f64>::zeros(r0.len(), k);
            for (i, param) in params.iter().enumerate() {
                let step = param.step();
                let mut shifted = theta.clone();
                shifted[i] += step;
                self.set_solved(&names, &shifted);
                self.run_graph()?;
                let ri = self.flatdiff()?;
                // The residual decreases as the theory increases
                jacobian.set_column(i, &((&r0 - &ri) / step));
            }

            let pj = &*precision * &jacobian;
            fisher = jacobian.transpose() * &pj;
            for i in 0..k {
                fisher[(i, i)] += prior_precision[i];
            }
            let rhs = pj.transpose() * &r0
                + prior_precision.component_mul(&(&prior_mean - &theta));
            let delta = match fisher.clone().cholesky() {
                Some(cholesky) => cholesky.solve(&rhs),
                None => {
                    return Err(self.numerical_error(format!(
                        "Fisher matrix of solved parameters {:?} is not positive definite",
                        names
                    )))
                }
            };
            theta += &delta;
            converged = delta
                .iter()
                .enumerate()
                .all(|(i, d)| d.abs() * fisher[(i, i)].sqrt() < self.solver.tolerance);
            if converged {
                break;
            }
        }
        if !converged {
            warn!(
                parameters = ?names,
                max_iterations = self.solver.max_iterations,
                "Solver did not converge; solved values may be inaccurate"
            );
        }

        self.set_solved(&names, &theta);
        self.run_graph()?;

        let marginalised: Vec<usize> = params
            .iter()
            .enumerate()
            .filter(|(_, p)| p.solve == SolveMode::SolvedMarginal)
            .map(|(i, _)| i)
            .collect();
        let mut loglikelihood_offset = 0.0;
        if !marginalised.is_empty() {
            let sub = fisher.select_rows(&marginalised).select_columns(&marginalised);
            match sub.cholesky() {
                Some(cholesky) => {
                    let logdet: f64 = cholesky.l().diagonal().iter().map(|d| 2.0 * d.ln()).sum();
                    loglikelihood_offset = -0.5 * logdet;
                }
                None => {
                    return Err(self.numerical_error(
                        "Fisher matrix of marginalised parameters is not positive definite"
                            .to_string(),
                    ))
                }
            }
        }

        let logprior: f64 = params
            .iter()
            .zip(theta.iter())
            .map(|(p, &v)| p.prior.logpdf(v))
            .sum();
        Ok(SolvedPoint {
            values: names.into_iter().zip(theta.iter().copied()).collect(),
            loglikelihood_offset,
            logprior,
        })
    }
}
