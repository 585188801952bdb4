//! MCMC convergence diagnostics.
//!
//! All functions take a list of chains (typically contiguous splits of the chains of a
//! run after burn-in) and the names of the parameters to diagnose.
//!
//! # References
//!
//! Gelman, A., & Rubin, D. B. (1992). Inference from iterative simulation using
//! multiple sequences. Statistical Science, 7(4), 457-472.
//!
//! Geweke, J. (1992). Evaluating the accuracy of sampling-based approaches to the
//! calculation of posterior moments. Bayesian Statistics 4, 169-193.
//!
//! Sokal, A. (1997). Monte Carlo methods in statistical mechanics: foundations and
//! new algorithms. Functional Integration, 131-192.

use crate::chain::Chain;
use crate::errors::{SamplerError, SamplerResult};
use nalgebra::DMatrix;
use rslike_core::errors::RslikeError;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};

/// Per-chain statistic compared across chains by [`gelman_rubin`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Statistic {
    Mean,
    /// Lower end of the shortest interval at this many sigmas.
    IntervalLower(f64),
    /// Upper end of the shortest interval at this many sigmas.
    IntervalUpper(f64),
}

impl Statistic {
    fn evaluate(&self, chain: &Chain, name: &str) -> SamplerResult<f64> {
        match self {
            Statistic::Mean => chain.mean(name),
            Statistic::IntervalLower(nsigmas) => Ok(chain.interval(name, *nsigmas)?.0),
            Statistic::IntervalUpper(nsigmas) => Ok(chain.interval(name, *nsigmas)?.1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GelmanRubinMethod {
    /// Eigenvalues of `W⁻¹ V`, invariant under reparametrisation.
    Eigen,
    /// Ratio of the diagonals of `V` and `W`, one value per parameter.
    Diag,
}

/// Gelman-Rubin statistic `R` of `params` across `chains`.
///
/// `W` is the sample-size weighted mean of the within-chain covariances, `B` the
/// covariance of the per-chain statistic and `V = W (n-1)/n + B (m+1)/m` for `m` chains.
/// Converged chains give values close to 1.
pub fn gelman_rubin(
    chains: &[Chain],
    params: &[String],
    statistic: Statistic,
    method: GelmanRubinMethod,
) -> SamplerResult<Vec<f64>> {
    let nchains = chains.len();
    if nchains < 2 {
        return Err(SamplerError::Configuration(
            "Provide at least 2 chains to estimate Gelman-Rubin".to_string(),
        ));
    }
    let ndim = params.len();
    let mut statistics = DMatrix::zeros(nchains, ndim);
    let mut within_n1 = DMatrix::zeros(ndim, ndim);
    let mut within_n = DMatrix::zeros(ndim, ndim);
    let mut total = 0.0;
    for (i, chain) in chains.iter().enumerate() {
        for (j, name) in params.iter().enumerate() {
            statistics[(i, j)] = statistic.evaluate(chain, name)?;
        }
        let covariance = chain.covariance(params)?;
        let n = chain.size() as f64;
        within_n1 += &covariance * n;
        // Weighted by n: n * (n - 1) / n
        within_n += &covariance * (n - 1.0);
        total += n;
    }
    within_n1 /= total;
    within_n /= total;

    // Not weighted by the chain sizes: short chains are likely outliers
    let centre = statistics.row_mean();
    let mut between = DMatrix::zeros(ndim, ndim);
    for i in 0..nchains {
        let d = statistics.row(i) - &centre;
        between += d.transpose() * d;
    }
    between /= (nchains - 1) as f64;
    let v = within_n + between * ((nchains + 1) as f64 / nchains as f64);

    match method {
        GelmanRubinMethod::Diag => Ok((0..ndim).map(|j| v[(j, j)] / within_n1[(j, j)]).collect()),
        GelmanRubinMethod::Eigen => {
            let stddev: Vec<f64> = (0..ndim).map(|j| v[(j, j)].sqrt()).collect();
            let scale = DMatrix::from_fn(ndim, ndim, |i, j| stddev[i] * stddev[j]);
            let v = v.component_div(&scale);
            let w = within_n1.component_div(&scale);
            // Eigenvalues of W⁻¹ V are those of the symmetric L⁻¹ V L⁻ᵀ with W = L Lᵀ
            let l_inv = w
                .cholesky()
                .and_then(|c| c.l().try_inverse())
                .ok_or_else(|| {
                    RslikeError::LinearAlgebra(
                        "within-chain covariance is not positive definite".to_string(),
                    )
                })?;
            let symmetric = &l_inv * v * l_inv.transpose();
            Ok(symmetric.symmetric_eigenvalues().iter().copied().collect())
        }
    }
}

fn mean_and_variance(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, variance)
}

/// Geweke z-scores comparing the first `first` and the last `last` fractions of each chain.
///
/// Returns one row per chain and one value per parameter.
pub fn geweke(chains: &[Chain], params: &[String], first: f64, last: f64) -> SamplerResult<Vec<Vec<f64>>> {
    if !(0.0 < first && 0.0 < last && first + last <= 1.0) {
        return Err(SamplerError::Configuration(format!(
            "Geweke fractions must be positive and sum to at most 1, got {} and {}",
            first, last
        )));
    }
    let mut scores = Vec::with_capacity(chains.len());
    for chain in chains {
        let mut row = Vec::with_capacity(params.len());
        for name in params {
            let values = chain.flatten(name)?;
            let n = values.len();
            let a = &values[..(first * n as f64) as usize];
            let b = &values[((1.0 - last) * n as f64) as usize..];
            if a.len() < 2 || b.len() < 2 {
                return Err(SamplerError::Configuration(format!(
                    "chain of {} samples is too short for the Geweke test",
                    n
                )));
            }
            let (ma, va) = mean_and_variance(a);
            let (mb, vb) = mean_and_variance(b);
            row.push((ma - mb) / (va / a.len() as f64 + vb / b.len() as f64).sqrt());
        }
        scores.push(row);
    }
    Ok(scores)
}

/// p-value of the D'Agostino-Pearson test that `values` are drawn from a normal distribution.
///
/// Combines the skewness and kurtosis tests; needs at least 8 values.
pub fn normaltest(values: &[f64]) -> SamplerResult<f64> {
    let n = values.len();
    if n < 8 {
        return Err(SamplerError::Configuration(format!(
            "normality test needs at least 8 values, got {}",
            n
        )));
    }
    let nf = n as f64;
    let mean = values.iter().sum::<f64>() / nf;
    let moment = |k: i32| values.iter().map(|x| (x - mean).powi(k)).sum::<f64>() / nf;
    let (m2, m3, m4) = (moment(2), moment(3), moment(4));
    if m2 <= 0.0 {
        return Err(SamplerError::Configuration(
            "normality test of constant values".to_string(),
        ));
    }

    // Skewness test
    let skew = m3 / m2.powf(1.5);
    let y = skew * ((nf + 1.0) * (nf + 3.0) / (6.0 * (nf - 2.0))).sqrt();
    let beta2 = 3.0 * (nf * nf + 27.0 * nf - 70.0) * (nf + 1.0) * (nf + 3.0)
        / ((nf - 2.0) * (nf + 5.0) * (nf + 7.0) * (nf + 9.0));
    let w2 = -1.0 + (2.0 * (beta2 - 1.0)).sqrt();
    let delta = 1.0 / (0.5 * w2.ln()).sqrt();
    let alpha = (2.0 / (w2 - 1.0)).sqrt();
    let y = if y == 0.0 { 1.0 } else { y };
    let z_skew = delta * (y / alpha + ((y / alpha).powi(2) + 1.0).sqrt()).ln();

    // Kurtosis test
    let kurtosis = m4 / (m2 * m2);
    let expected = 3.0 * (nf - 1.0) / (nf + 1.0);
    let variance = 24.0 * nf * (nf - 2.0) * (nf - 3.0) / ((nf + 1.0).powi(2) * (nf + 3.0) * (nf + 5.0));
    let x = (kurtosis - expected) / variance.sqrt();
    let sqrt_beta1 = 6.0 * (nf * nf - 5.0 * nf + 2.0) / ((nf + 7.0) * (nf + 9.0))
        * (6.0 * (nf + 3.0) * (nf + 5.0) / (nf * (nf - 2.0) * (nf - 3.0))).sqrt();
    let a = 6.0 + 8.0 / sqrt_beta1 * (2.0 / sqrt_beta1 + (1.0 + 4.0 / sqrt_beta1.powi(2)).sqrt());
    let term1 = 1.0 - 2.0 / (9.0 * a);
    let denom = 1.0 + x * (2.0 / (a - 4.0)).sqrt();
    let term2 = if denom == 0.0 {
        f64::NAN
    } else {
        denom.signum() * ((1.0 - 2.0 / a) / denom.abs()).cbrt()
    };
    let z_kurtosis = (term1 - term2) / (2.0 / (9.0 * a)).sqrt();

    let k2 = z_skew * z_skew + z_kurtosis * z_kurtosis;
    let chi2 = ChiSquared::new(2.0)
        .map_err(|e| SamplerError::Configuration(format!("chi-squared distribution: {}", e)))?;
    Ok(1.0 - chi2.cdf(k2))
}

/// Autocorrelation of a centred series at `lag`, normalised by its lag-0 value.
fn autocorrelation(centred: &[f64], norm: f64, lag: usize) -> f64 {
    if norm == 0.0 {
        return 0.0;
    }
    centred
        .iter()
        .zip(&centred[lag..])
        .map(|(a, b)| a * b)
        .sum::<f64>()
        / norm
}

/// Integrated autocorrelation time `τ = 1 + 2 Σ ρ(k)` of a set of equally long series.
///
/// The autocorrelation `ρ` is averaged over the series and summed up to the first lag
/// `M >= c τ(M)` (Sokal's automated window).
pub fn integrated_autocorrelation_time(series: &[Vec<f64>], c: f64) -> SamplerResult<f64> {
    let n = series.first().map_or(0, Vec::len);
    if n < 2 || series.iter().any(|s| s.len() != n) {
        return Err(SamplerError::Configuration(
            "autocorrelation time needs series of equal length >= 2".to_string(),
        ));
    }
    let centred: Vec<(Vec<f64>, f64)> = series
        .iter()
        .map(|s| {
            let mean = s.iter().sum::<f64>() / n as f64;
            let centred: Vec<f64> = s.iter().map(|x| x - mean).collect();
            let norm = centred.iter().map(|x| x * x).sum::<f64>();
            (centred, norm)
        })
        .collect();

    let mut tau = 1.0;
    for lag in 1..n {
        let rho = centred
            .iter()
            .map(|(s, norm)| autocorrelation(s, *norm, lag))
            .sum::<f64>()
            / centred.len() as f64;
        tau += 2.0 * rho;
        if lag as f64 >= c * tau {
            break;
        }
    }
    Ok(tau)
}

/// Integrated autocorrelation time of each parameter, treating every walker of every
/// chain as an independent series.
pub fn iact(chains: &[Chain], params: &[String]) -> SamplerResult<Vec<f64>> {
    params
        .iter()
        .map(|name| {
            let mut series = vec![];
            for chain in chains {
                for walker in 0..chain.nwalkers() {
                    series.push(chain.walker(name, walker)?);
                }
            }
            integrated_autocorrelation_time(&series, 5.0)
        })
        .collect()
}
