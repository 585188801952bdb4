//! Stepping rules that advance a set of walkers.
//!
//! [`EnsembleStepper`] implements the affine-invariant stretch move of Goodman & Weare
//! (2010), updating the walkers in two halves so that the proposals of each half are
//! evaluated in a single batch.
//!
//! # References
//!
//! Goodman, J., & Weare, J. (2010). Ensemble samplers with affine invariance.
//! Communications in Applied Mathematics and Computational Science, 5(1), 65-80.

use crate::errors::{SamplerError, SamplerResult};
use crate::posterior::{Evaluation, Posterior};
use ndarray::{s, Array1, Array2, ArrayView1};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::ops::Range;

/// Current state of the walkers of one chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Walkers {
    /// Shape `(nwalkers, ndim)`.
    pub positions: Array2<f64>,
    pub logposterior: Array1<f64>,
    pub loglikelihood: Array1<f64>,
    pub logprior: Array1<f64>,
    /// Scalar derived quantities, shape `(nwalkers, nderived)`.
    pub derived: Array2<f64>,
}

impl Walkers {
    /// Walkers at `positions`, with the posterior already evaluated there.
    pub fn new(positions: Array2<f64>, evaluation: Evaluation) -> SamplerResult<Self> {
        let nwalkers = positions.nrows();
        if evaluation.logposterior.len() != nwalkers || evaluation.derived.nrows() != nwalkers {
            return Err(SamplerError::Configuration(format!(
                "evaluation of {} points for {} walkers",
                evaluation.logposterior.len(),
                nwalkers
            )));
        }
        Ok(Self {
            positions,
            logposterior: Array1::from_vec(evaluation.logposterior),
            loglikelihood: Array1::from_vec(evaluation.loglikelihood),
            logprior: Array1::from_vec(evaluation.logprior),
            derived: evaluation.derived,
        })
    }

    pub fn nwalkers(&self) -> usize {
        self.positions.nrows()
    }

    pub fn ndim(&self) -> usize {
        self.positions.ncols()
    }

    /// Walkers without a position yet, at `-inf` log-posterior.
    pub(crate) fn unset(nwalkers: usize, ndim: usize, nderived: usize) -> Self {
        Self {
            positions: Array2::from_elem((nwalkers, ndim), f64::NAN),
            logposterior: Array1::from_elem(nwalkers, f64::NEG_INFINITY),
            loglikelihood: Array1::from_elem(nwalkers, f64::NEG_INFINITY),
            logprior: Array1::from_elem(nwalkers, f64::NEG_INFINITY),
            derived: Array2::from_elem((nwalkers, nderived), f64::NAN),
        }
    }

    /// Copy of the walkers in `range`.
    pub(crate) fn select(&self, range: Range<usize>) -> Self {
        Self {
            positions: self.positions.slice(s![range.clone(), ..]).to_owned(),
            logposterior: self.logposterior.slice(s![range.clone()]).to_owned(),
            loglikelihood: self.loglikelihood.slice(s![range.clone()]).to_owned(),
            logprior: self.logprior.slice(s![range.clone()]).to_owned(),
            derived: self.derived.slice(s![range, ..]).to_owned(),
        }
    }

    /// Move walker `i` to `position`, the `k`-th point of `evaluation`.
    pub(crate) fn assign(&mut self, i: usize, position: ArrayView1<f64>, evaluation: &Evaluation, k: usize) {
        self.positions.row_mut(i).assign(&position);
        self.logposterior[i] = evaluation.logposterior[k];
        self.loglikelihood[i] = evaluation.loglikelihood[k];
        self.logprior[i] = evaluation.logprior[k];
        self.derived.row_mut(i).assign(&evaluation.derived.row(k));
    }
}

/// Rule advancing the walkers of a chain by one step.
///
/// Implementations must draw every random number from `rng` and evaluate the posterior
/// through [`Posterior::evaluate`], so that all ranks of a process group stay in step.
pub trait Stepper: Debug + Send {
    /// Number of walkers used for a posterior of `ndim` sampled parameters.
    fn nwalkers(&self, ndim: usize) -> usize;

    /// Advance `walkers` by one step, returning the number of accepted proposals.
    fn step(
        &mut self,
        posterior: &mut Posterior,
        walkers: &mut Walkers,
        rng: &mut dyn RngCore,
    ) -> SamplerResult<usize>;
}

/// Configuration for the stretch move proposal.
///
/// The stretch move is parameterized by a scale parameter `a` that controls
/// the proposal distribution. The default value of 2.0 is recommended by
/// Goodman & Weare (2010).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StretchMove {
    /// Scale parameter for the stretch move (typically 2.0)
    pub a: f64,
}

impl Default for StretchMove {
    fn default() -> Self {
        Self { a: 2.0 }
    }
}

impl StretchMove {
    /// Create a new stretch move with custom scale parameter, which must be > 1.
    pub fn new(a: f64) -> SamplerResult<Self> {
        if !(a > 1.0) {
            return Err(SamplerError::Configuration(format!(
                "Stretch move scale parameter must be > 1.0, got {}",
                a
            )));
        }
        Ok(Self { a })
    }

    /// Sample a stretch factor z in `[1/a, a]` from `g(z) ∝ 1/sqrt(z)`.
    ///
    /// Drawing u ~ Uniform(0,1) and setting z = ((a-1)*u + 1)^2 / a samples this distribution.
    pub fn sample_z<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let u: f64 = rng.gen();
        ((self.a - 1.0) * u + 1.0).powi(2) / self.a
    }

    /// Metropolis-Hastings acceptance probability
    /// `min(1, z^(ndim - 1) * exp(log_prob_new - log_prob_old))`.
    pub fn acceptance_probability(
        &self,
        z: f64,
        ndim: usize,
        log_prob_old: f64,
        log_prob_new: f64,
    ) -> f64 {
        if !log_prob_new.is_finite() {
            return 0.0;
        }
        let log_ratio = (ndim as f64 - 1.0) * z.ln() + (log_prob_new - log_prob_old);
        log_ratio.exp().min(1.0)
    }

    /// Propose `y = c + z * (x - c)` for a complementary walker `c` drawn uniformly.
    ///
    /// Returns the proposal and the stretch factor.
    pub fn propose<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        current: ArrayView1<f64>,
        complementary: &Array2<f64>,
    ) -> (Array1<f64>, f64) {
        let z = self.sample_z(rng);
        let c = complementary.row(rng.gen_range(0..complementary.nrows()));
        let proposal = &c + z * (&current - &c);
        (proposal, z)
    }
}

/// Ensemble sampler stepping with the stretch move.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnsembleStepper {
    stretch: StretchMove,
    nwalkers: Option<usize>,
}

impl EnsembleStepper {
    pub fn new(a: f64) -> SamplerResult<Self> {
        Ok(Self {
            stretch: StretchMove::new(a)?,
            nwalkers: None,
        })
    }

    /// Use a fixed number of walkers, which must be even and at least 2.
    pub fn with_nwalkers(mut self, nwalkers: usize) -> SamplerResult<Self> {
        if nwalkers < 2 || nwalkers % 2 != 0 {
            return Err(SamplerError::Configuration(format!(
                "Number of walkers must be even and at least 2, got {}",
                nwalkers
            )));
        }
        self.nwalkers = Some(nwalkers);
        Ok(self)
    }

    pub fn stretch(&self) -> &StretchMove {
        &self.stretch
    }

    /// Update the walkers in `active` using the walkers in `complementary`.
    fn update_group(
        &self,
        posterior: &mut Posterior,
        walkers: &mut Walkers,
        active: Range<usize>,
        complementary: Range<usize>,
        rng: &mut dyn RngCore,
    ) -> SamplerResult<usize> {
        let complementary_positions = walkers.positions.slice(s![complementary, ..]).to_owned();
        let mut proposals = Array2::zeros((active.len(), walkers.ndim()));
        let mut factors = Vec::with_capacity(active.len());
        for (k, i) in active.clone().enumerate() {
            let (proposal, z) =
                self.stretch
                    .propose(&mut *rng, walkers.positions.row(i), &complementary_positions);
            proposals.row_mut(k).assign(&proposal);
            factors.push(z);
        }

        let evaluation = posterior.evaluate(&proposals)?;

        let mut naccepted = 0;
        for (k, i) in active.enumerate() {
            let probability = self.stretch.acceptance_probability(
                factors[k],
                walkers.ndim(),
                walkers.logposterior[i],
                evaluation.logposterior[k],
            );
            if rng.gen::<f64>() < probability {
                walkers.assign(i, proposals.row(k), &evaluation, k);
                naccepted += 1;
            }
        }
        Ok(naccepted)
    }
}

impl Stepper for EnsembleStepper {
    fn nwalkers(&self, ndim: usize) -> usize {
        self.nwalkers
            .unwrap_or_else(|| 2 * ((5 * ndim / 2 + 1) / 2).max(2))
    }

    fn step(
        &mut self,
        posterior: &mut Posterior,
        walkers: &mut Walkers,
        rng: &mut dyn RngCore,
    ) -> SamplerResult<usize> {
        let nwalkers = walkers.nwalkers();
        if nwalkers < 2 || nwalkers % 2 != 0 {
            return Err(SamplerError::Configuration(format!(
                "Number of walkers must be even and at least 2, got {}",
                nwalkers
            )));
        }
        let half = nwalkers / 2;
        let mut naccepted = self.update_group(posterior, walkers, 0..half, half..nwalkers, rng)?;
        naccepted += self.update_group(posterior, walkers, half..nwalkers, 0..half, rng)?;
        Ok(naccepted)
    }
}
