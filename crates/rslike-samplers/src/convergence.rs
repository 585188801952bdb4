//! Convergence criteria and their history across repeated checks.
//!
//! [`check`] splits the chains after burn-in, evaluates every diagnostic and records it in
//! a [`DiagnosticsHistory`]. A criterion with bounds passes once its test succeeded for
//! `stable_over` consecutive checks.

use crate::chain::Chain;
use crate::diagnostics::{self, GelmanRubinMethod, Statistic};
use crate::errors::{SamplerError, SamplerResult};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// Samples discarded at the start of each chain before diagnosing it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Burnin {
    /// Number of steps.
    Steps(usize),
    /// Fraction of the steps, in (0, 1).
    Fraction(f64),
}

impl Default for Burnin {
    fn default() -> Self {
        Burnin::Fraction(0.5)
    }
}

impl Burnin {
    /// Number of steps to discard from a chain of `nsteps` steps.
    pub fn steps(&self, nsteps: usize) -> usize {
        match *self {
            Burnin::Steps(steps) => steps,
            Burnin::Fraction(fraction) => (fraction * nsteps as f64 + 0.5) as usize,
        }
    }
}

/// A convergence diagnostic computed by [`check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    /// Maximum eigenvalue of the Gelman-Rubin matrix, minus 1.
    EigenGr,
    /// Maximum diagonal Gelman-Rubin statistic, minus 1.
    DiagGr,
    /// Maximum diagonal Gelman-Rubin statistic of the interval limits, minus 1.
    ClDiagGr,
    /// Maximum absolute Geweke z-score.
    Geweke,
    /// Normality test p-value of the Geweke z-scores.
    GewekePvalue,
    /// Iterations after burn-in over the maximum integrated autocorrelation time.
    IterationsOverIact,
    /// Maximum relative change of the integrated autocorrelation time between checks.
    Dact,
}

impl Criterion {
    pub const ALL: [Criterion; 7] = [
        Criterion::EigenGr,
        Criterion::DiagGr,
        Criterion::ClDiagGr,
        Criterion::Geweke,
        Criterion::GewekePvalue,
        Criterion::IterationsOverIact,
        Criterion::Dact,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Criterion::EigenGr => "eigen_gr",
            Criterion::DiagGr => "diag_gr",
            Criterion::ClDiagGr => "cl_diag_gr",
            Criterion::Geweke => "geweke",
            Criterion::GewekePvalue => "geweke_pvalue",
            Criterion::IterationsOverIact => "iterations_over_iact",
            Criterion::Dact => "dact",
        }
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Thresholds of the convergence check.
///
/// Every `max_*` bound has a `min_*` counterpart; a criterion without bounds is computed
/// and logged but never blocks convergence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConvergenceCriteria {
    /// Number of contiguous splits of each chain.
    pub nsplits: usize,
    pub burnin: Burnin,
    /// Number of consecutive checks a criterion must pass.
    pub stable_over: usize,
    pub max_eigen_gr: Option<f64>,
    pub min_eigen_gr: Option<f64>,
    pub max_diag_gr: Option<f64>,
    pub min_diag_gr: Option<f64>,
    pub max_cl_diag_gr: Option<f64>,
    pub min_cl_diag_gr: Option<f64>,
    /// Width in sigmas of the intervals compared by the `cl_diag_gr` criterion.
    pub nsigmas_cl_diag_gr: f64,
    pub max_geweke: Option<f64>,
    pub min_geweke: Option<f64>,
    pub max_geweke_pvalue: Option<f64>,
    pub min_geweke_pvalue: Option<f64>,
    pub max_iterations_over_iact: Option<f64>,
    pub min_iterations_over_iact: Option<f64>,
    /// Autocorrelation times are flagged reliable once the chains are this many times longer.
    pub reliable_iterations_over_iact: f64,
    pub max_dact: Option<f64>,
    pub min_dact: Option<f64>,
    /// Disable logging of the diagnostics.
    pub quiet: bool,
}

impl Default for ConvergenceCriteria {
    fn default() -> Self {
        Self {
            nsplits: 4,
            burnin: Burnin::default(),
            stable_over: 2,
            max_eigen_gr: Some(0.03),
            min_eigen_gr: None,
            max_diag_gr: None,
            min_diag_gr: None,
            max_cl_diag_gr: None,
            min_cl_diag_gr: None,
            nsigmas_cl_diag_gr: 1.0,
            max_geweke: None,
            min_geweke: None,
            max_geweke_pvalue: None,
            min_geweke_pvalue: None,
            max_iterations_over_iact: None,
            min_iterations_over_iact: None,
            reliable_iterations_over_iact: 50.0,
            max_dact: None,
            min_dact: None,
            quiet: false,
        }
    }
}

impl ConvergenceCriteria {
    /// Parse criteria from a TOML document.
    pub fn from_toml(content: &str) -> SamplerResult<Self> {
        let criteria: Self = toml::from_str(content)
            .map_err(|e| SamplerError::Configuration(format!("Failed to parse criteria: {}", e)))?;
        criteria.validate()?;
        Ok(criteria)
    }

    /// `(min, max)` bounds of `criterion`.
    pub fn bounds(&self, criterion: Criterion) -> (Option<f64>, Option<f64>) {
        match criterion {
            Criterion::EigenGr => (self.min_eigen_gr, self.max_eigen_gr),
            Criterion::DiagGr => (self.min_diag_gr, self.max_diag_gr),
            Criterion::ClDiagGr => (self.min_cl_diag_gr, self.max_cl_diag_gr),
            Criterion::Geweke => (self.min_geweke, self.max_geweke),
            Criterion::GewekePvalue => (self.min_geweke_pvalue, self.max_geweke_pvalue),
            Criterion::IterationsOverIact => {
                (self.min_iterations_over_iact, self.max_iterations_over_iact)
            }
            Criterion::Dact => (self.min_dact, self.max_dact),
        }
    }

    pub fn validate(&self) -> SamplerResult<()> {
        for criterion in Criterion::ALL {
            if let (Some(low), Some(up)) = self.bounds(criterion) {
                if low >= up {
                    return Err(SamplerError::Configuration(format!(
                        "min_{0} = {1} must be smaller than max_{0} = {2}",
                        criterion, low, up
                    )));
                }
            }
        }
        if self.nsplits < 1 {
            return Err(SamplerError::Configuration("nsplits must be at least 1".to_string()));
        }
        if self.stable_over < 1 {
            return Err(SamplerError::Configuration(
                "stable_over must be at least 1".to_string(),
            ));
        }
        if !(self.nsigmas_cl_diag_gr > 0.0) {
            return Err(SamplerError::Configuration(format!(
                "nsigmas_cl_diag_gr must be positive, got {}",
                self.nsigmas_cl_diag_gr
            )));
        }
        if let Burnin::Fraction(fraction) = self.burnin {
            if !(0.0 < fraction && fraction < 1.0) {
                return Err(SamplerError::Configuration(format!(
                    "burnin fraction must be in (0, 1), got {}",
                    fraction
                )));
            }
        }
        Ok(())
    }
}

/// Whether and how [`crate::sampler::BatchSampler::run`] checks convergence.
///
/// Deserialises from `false`, `true` (default criteria) or a table of criteria.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "CheckRepr", into = "CheckRepr")]
pub enum CheckOption {
    Disabled,
    Enabled(ConvergenceCriteria),
}

impl Default for CheckOption {
    fn default() -> Self {
        CheckOption::Enabled(ConvergenceCriteria::default())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum CheckRepr {
    Flag(bool),
    Criteria(ConvergenceCriteria),
}

impl From<CheckRepr> for CheckOption {
    fn from(repr: CheckRepr) -> Self {
        match repr {
            CheckRepr::Flag(false) => CheckOption::Disabled,
            CheckRepr::Flag(true) => CheckOption::default(),
            CheckRepr::Criteria(criteria) => CheckOption::Enabled(criteria),
        }
    }
}

impl From<CheckOption> for CheckRepr {
    fn from(option: CheckOption) -> Self {
        match option {
            CheckOption::Disabled => CheckRepr::Flag(false),
            CheckOption::Enabled(criteria) => CheckRepr::Criteria(criteria),
        }
    }
}

/// Append-only record of the diagnostics computed by successive checks of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsHistory {
    values: IndexMap<Criterion, Vec<f64>>,
    tests: IndexMap<Criterion, Vec<bool>>,
    iact: Vec<Vec<f64>>,
    ncall: Vec<Vec<usize>>,
    naccepted: Vec<Vec<usize>>,
}

impl DiagnosticsHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_value(&mut self, criterion: Criterion, value: f64) {
        self.values.entry(criterion).or_default().push(value);
    }

    pub fn record_test(&mut self, criterion: Criterion, passed: bool) {
        self.tests.entry(criterion).or_default().push(passed);
    }

    pub fn record_iact(&mut self, iact: Vec<f64>) {
        self.iact.push(iact);
    }

    /// Record the number of posterior evaluations and accepted proposals of each chain
    /// during one batch.
    pub fn record_calls(&mut self, ncall: Vec<usize>, naccepted: Vec<usize>) {
        self.ncall.push(ncall);
        self.naccepted.push(naccepted);
    }

    /// Values of `criterion`, one per check that computed it.
    pub fn values(&self, criterion: Criterion) -> &[f64] {
        self.values.get(&criterion).map(Vec::as_slice).unwrap_or_default()
    }

    /// Test outcomes of `criterion`, one per check where it had bounds.
    pub fn tests(&self, criterion: Criterion) -> &[bool] {
        self.tests.get(&criterion).map(Vec::as_slice).unwrap_or_default()
    }

    /// The last `n` test outcomes of `criterion`, if at least `n` were recorded.
    pub fn window(&self, criterion: Criterion, n: usize) -> Option<&[bool]> {
        let tests = self.tests(criterion);
        (tests.len() >= n).then(|| &tests[tests.len() - n..])
    }

    /// Whether the last `stable_over` tests of `criterion` all passed.
    pub fn is_stable(&self, criterion: Criterion, stable_over: usize) -> bool {
        self.window(criterion, stable_over)
            .map_or(false, |tests| tests.iter().all(|&t| t))
    }

    /// Integrated autocorrelation time of each varied parameter, one entry per check.
    pub fn iact(&self) -> &[Vec<f64>] {
        &self.iact
    }

    /// Posterior evaluations of each chain, one entry per batch.
    pub fn ncall(&self) -> &[Vec<usize>] {
        &self.ncall
    }

    /// Accepted proposals of each chain, one entry per batch.
    pub fn naccepted(&self) -> &[Vec<usize>] {
        &self.naccepted
    }
}

/// Maximum that propagates NaN.
fn nanmax<'a>(values: impl IntoIterator<Item = &'a f64>) -> f64 {
    let mut max = f64::NAN;
    for (i, &value) in values.into_iter().enumerate() {
        if value.is_nan() {
            return f64::NAN;
        }
        max = if i == 0 { value } else { max.max(value) };
    }
    max
}

struct Tester<'a> {
    criteria: &'a ConvergenceCriteria,
    history: &'a mut DiagnosticsHistory,
}

impl Tester<'_> {
    /// Record `value` and test it against the bounds of `criterion`.
    fn test(&mut self, criterion: Criterion, label: &str, value: f64) -> bool {
        self.history.record_value(criterion, value);
        let (low, up) = self.criteria.bounds(criterion);
        if low.is_none() && up.is_none() {
            if !self.criteria.quiet {
                info!("- {} is {:.4}.", label, value);
            }
            return true;
        }
        let passed = low.map_or(true, |low| value > low) && up.map_or(true, |up| value < up);
        if !self.criteria.quiet {
            let not = if passed { "" } else { "not " };
            match (low, up) {
                (Some(low), Some(up)) => {
                    info!("- {} is {:.4}; {}in [{:.4}, {:.4}].", label, value, not, low, up)
                }
                (Some(low), None) => info!("- {} is {:.4}; {}> {:.4}.", label, value, not, low),
                (None, Some(up)) => info!("- {} is {:.4}; {}< {:.4}.", label, value, not, up),
                (None, None) => {}
            }
        }
        self.history.record_test(criterion, passed);
        self.history.is_stable(criterion, self.criteria.stable_over)
    }
}

fn or_nan<T>(result: SamplerResult<T>, what: &str, f: impl FnOnce(T) -> f64) -> f64 {
    match result {
        Ok(value) => f(value),
        Err(error) => {
            debug!(%error, "{} could not be computed", what);
            f64::NAN
        }
    }
}

/// Run the convergence tests on `chains`, recording the diagnostics into `history`.
///
/// Returns `false` without recording anything when a split after burn-in would be empty.
pub fn check(
    chains: &[Chain],
    criteria: &ConvergenceCriteria,
    history: &mut DiagnosticsHistory,
) -> SamplerResult<bool> {
    criteria.validate()?;
    let Some(first) = chains.first() else {
        return Ok(false);
    };
    let nsteps = first.nsteps();
    let burnin = criteria.burnin.steps(nsteps).min(nsteps);
    let lensplits = (nsteps - burnin) / criteria.nsplits;
    if lensplits == 0 || first.nwalkers() == 0 {
        return Ok(false);
    }
    let splits: Vec<Chain> = (0..criteria.nsplits)
        .flat_map(|islab| {
            let start = burnin + islab * lensplits;
            chains.iter().map(move |chain| chain.slice_steps(start, start + lensplits))
        })
        .collect();
    if splits.iter().any(Chain::is_empty) {
        return Ok(false);
    }
    let params = first.varied().to_vec();

    if !criteria.quiet {
        info!("Diagnostics:");
    }
    let mut tester = Tester { criteria, history };
    let mut converged = true;

    let eigen_gr = or_nan(
        diagnostics::gelman_rubin(&splits, &params, Statistic::Mean, GelmanRubinMethod::Eigen),
        "eigen Gelman-Rubin",
        |r| nanmax(&r) - 1.0,
    );
    converged &= tester.test(Criterion::EigenGr, "max eigen Gelman-Rubin - 1", eigen_gr);

    let diag_gr = or_nan(
        diagnostics::gelman_rubin(&splits, &params, Statistic::Mean, GelmanRubinMethod::Diag),
        "diag Gelman-Rubin",
        |r| nanmax(&r) - 1.0,
    );
    converged &= tester.test(Criterion::DiagGr, "max diag Gelman-Rubin - 1", diag_gr);

    let nsigmas = criteria.nsigmas_cl_diag_gr;
    let cl_diag_gr = or_nan(
        diagnostics::gelman_rubin(&splits, &params, Statistic::IntervalLower(nsigmas), GelmanRubinMethod::Diag)
            .and_then(|mut lower| {
                lower.extend(diagnostics::gelman_rubin(
                    &splits,
                    &params,
                    Statistic::IntervalUpper(nsigmas),
                    GelmanRubinMethod::Diag,
                )?);
                Ok(lower)
            }),
        "interval Gelman-Rubin",
        |r| nanmax(&r) - 1.0,
    );
    converged &= tester.test(
        Criterion::ClDiagGr,
        &format!("max diag Gelman-Rubin - 1 at {:.1} sigmas", nsigmas),
        cl_diag_gr,
    );

    let scores: Vec<f64> = match diagnostics::geweke(&splits, &params, 0.1, 0.5) {
        Ok(scores) => scores.into_iter().flatten().collect(),
        Err(error) => {
            debug!(%error, "Geweke test could not be computed");
            vec![f64::NAN]
        }
    };
    let geweke = nanmax(&scores.iter().map(|z| z.abs()).collect::<Vec<_>>());
    converged &= tester.test(Criterion::Geweke, "max Geweke", geweke);

    let pvalue = or_nan(diagnostics::normaltest(&scores), "Geweke p-value", |p| p);
    converged &= tester.test(Criterion::GewekePvalue, "Geweke p-value", pvalue);

    let burnt: Vec<Chain> = chains
        .iter()
        .map(|chain| chain.slice_steps(burnin, chain.nsteps()))
        .collect();
    let iact = diagnostics::iact(&burnt, &params).unwrap_or_else(|error| {
        debug!(%error, "autocorrelation time could not be computed");
        vec![f64::NAN; params.len()]
    });
    let max_iact = nanmax(&iact);
    tester.history.record_iact(iact);
    let niterations = nsteps - burnin;
    let mut label = format!("({} iterations / integrated autocorrelation time)", niterations);
    if criteria.reliable_iterations_over_iact * max_iact < niterations as f64 {
        label.push_str(" (reliable)");
    }
    converged &= tester.test(
        Criterion::IterationsOverIact,
        &label,
        niterations as f64 / max_iact,
    );

    let dact = match tester.history.iact() {
        [.., previous, last] => Some(nanmax(
            &previous
                .iter()
                .zip(last)
                .map(|(p, l)| (p / l - 1.0).abs())
                .collect::<Vec<_>>(),
        )),
        _ => None,
    };
    if let Some(dact) = dact {
        converged &= tester.test(
            Criterion::Dact,
            "max variation of integrated autocorrelation time",
            dact,
        );
    }

    Ok(converged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution as _, Normal};
    use rslike_core::calculator::LOGLIKELIHOOD;
    use rslike_core::pipeline::LOGPRIOR;

    fn chain_of(x: Array2<f64>) -> Chain {
        let shape = x.dim();
        let columns = IndexMap::from([
            ("x".to_string(), x),
            (LOGLIKELIHOOD.to_string(), Array2::zeros(shape)),
            (LOGPRIOR.to_string(), Array2::zeros(shape)),
        ]);
        Chain::new(vec!["x".to_string()], columns).unwrap()
    }

    /// Burn-in half followed by 4 copies of the same block of 50 steps.
    fn identical_splits(seed: u64) -> Chain {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let block = Array2::from_shape_fn((50, 4), |_| normal.sample(&mut rng));
        chain_of(Array2::from_shape_fn((400, 4), |(i, j)| {
            if i < 200 {
                100.0
            } else {
                block[[(i - 200) % 50, j]]
            }
        }))
    }

    fn shifted_splits() -> Chain {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let normal = Normal::new(0.0, 1.0).unwrap();
        chain_of(Array2::from_shape_fn((400, 4), |(i, _)| {
            10.0 * (i / 50) as f64 + normal.sample(&mut rng)
        }))
    }

    fn criteria(stable_over: usize) -> ConvergenceCriteria {
        ConvergenceCriteria {
            stable_over,
            quiet: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_burnin_steps() {
        assert_eq!(Burnin::Fraction(0.5).steps(101), 51);
        assert_eq!(Burnin::Fraction(0.3).steps(10), 3);
        assert_eq!(Burnin::Steps(7).steps(10), 7);
    }

    #[test]
    fn test_criteria_from_toml() {
        let criteria = ConvergenceCriteria::from_toml(
            r#"
            nsplits = 3
            burnin = 100
            max_diag_gr = 0.05
            min_iterations_over_iact = 1000.0
            "#,
        )
        .unwrap();
        assert_eq!(criteria.nsplits, 3);
        assert_eq!(criteria.burnin, Burnin::Steps(100));
        assert_eq!(criteria.max_eigen_gr, Some(0.03));
        assert_eq!(criteria.bounds(Criterion::DiagGr), (None, Some(0.05)));
        assert_eq!(
            criteria.bounds(Criterion::IterationsOverIact),
            (Some(1000.0), None)
        );

        let criteria = ConvergenceCriteria::from_toml("burnin = 0.3").unwrap();
        assert_eq!(criteria.burnin, Burnin::Fraction(0.3));

        assert!(ConvergenceCriteria::from_toml("max_eigen = 0.1").is_err());
        assert!(ConvergenceCriteria::from_toml("burnin = 1.5").is_err());
    }

    #[test]
    fn test_validate() {
        let invalid = [
            ConvergenceCriteria {
                min_geweke: Some(1.0),
                max_geweke: Some(1.0),
                ..Default::default()
            },
            ConvergenceCriteria {
                nsplits: 0,
                ..Default::default()
            },
            ConvergenceCriteria {
                stable_over: 0,
                ..Default::default()
            },
            ConvergenceCriteria {
                nsigmas_cl_diag_gr: 0.0,
                ..Default::default()
            },
            ConvergenceCriteria {
                burnin: Burnin::Fraction(0.0),
                ..Default::default()
            },
        ];
        for criteria in invalid {
            assert!(
                matches!(criteria.validate(), Err(SamplerError::Configuration(_))),
                "{:?}",
                criteria
            );
        }
        assert!(ConvergenceCriteria::default().validate().is_ok());
    }

    #[test]
    fn test_check_option_serde() {
        let disabled: CheckOption = serde_json::from_str("false").unwrap();
        assert_eq!(disabled, CheckOption::Disabled);
        let enabled: CheckOption = serde_json::from_str("true").unwrap();
        assert_eq!(enabled, CheckOption::default());
        let custom: CheckOption =
            serde_json::from_str(r#"{"max_eigen_gr": 0.01, "stable_over": 3}"#).unwrap();
        match &custom {
            CheckOption::Enabled(criteria) => {
                assert_eq!(criteria.max_eigen_gr, Some(0.01));
                assert_eq!(criteria.stable_over, 3);
                assert_eq!(criteria.nsplits, 4);
            }
            CheckOption::Disabled => panic!("expected criteria"),
        }
        let json = serde_json::to_string(&CheckOption::Disabled).unwrap();
        assert_eq!(json, "false");
        let back: CheckOption = serde_json::from_str(&serde_json::to_string(&custom).unwrap()).unwrap();
        assert_eq!(back, custom);
    }

    #[test]
    fn test_history_window() {
        let mut history = DiagnosticsHistory::new();
        assert!(!history.is_stable(Criterion::EigenGr, 1));
        history.record_test(Criterion::EigenGr, false);
        history.record_test(Criterion::EigenGr, true);
        assert!(history.is_stable(Criterion::EigenGr, 1));
        assert!(!history.is_stable(Criterion::EigenGr, 2));
        history.record_test(Criterion::EigenGr, true);
        assert!(history.is_stable(Criterion::EigenGr, 2));
        assert_eq!(history.window(Criterion::EigenGr, 2), Some(&[true, true][..]));
        assert_eq!(history.window(Criterion::EigenGr, 4), None);
        assert!(history.tests(Criterion::Dact).is_empty());
    }

    #[test]
    fn test_nanmax() {
        assert_eq!(nanmax(&[1.0, 3.0, 2.0]), 3.0);
        assert!(nanmax(&[1.0, f64::NAN]).is_nan());
        assert!(nanmax(&[] as &[f64]).is_nan());
    }

    #[test]
    fn test_check_identical_splits() {
        let chains = vec![identical_splits(0), identical_splits(0)];
        let mut history = DiagnosticsHistory::new();
        assert!(check(&chains, &criteria(1), &mut history).unwrap());
        // B vanishes for identical splits: R - 1 = -1 / n with n = 50 x 4
        assert_relative_eq!(history.values(Criterion::EigenGr)[0], -0.005, epsilon = 1e-10);
        assert_relative_eq!(history.values(Criterion::DiagGr)[0], -0.005, epsilon = 1e-10);
        assert_eq!(history.tests(Criterion::EigenGr), &[true]);
        // Criteria without bounds are recorded but not tested
        assert_eq!(history.values(Criterion::Geweke).len(), 1);
        assert!(history.tests(Criterion::Geweke).is_empty());
    }

    #[test]
    fn test_check_distinct_means() {
        let mut history = DiagnosticsHistory::new();
        assert!(!check(&[shifted_splits()], &criteria(1), &mut history).unwrap());
        assert!(history.values(Criterion::EigenGr)[0] > 1.0);
    }

    #[test]
    fn test_check_needs_consecutive_passes() {
        let chains = vec![identical_splits(0), identical_splits(0)];
        let mut history = DiagnosticsHistory::new();
        assert!(!check(&chains, &criteria(2), &mut history).unwrap());
        assert!(check(&chains, &criteria(2), &mut history).unwrap());

        // A failure resets the window
        assert!(!check(&[shifted_splits()], &criteria(2), &mut history).unwrap());
        assert!(!check(&chains, &criteria(2), &mut history).unwrap());
    }

    #[test]
    fn test_check_min_bound() {
        let chains = vec![identical_splits(0), identical_splits(0)];
        let mut history = DiagnosticsHistory::new();
        let criteria = ConvergenceCriteria {
            max_eigen_gr: None,
            min_eigen_gr: Some(0.0),
            ..criteria(1)
        };
        assert!(!check(&chains, &criteria, &mut history).unwrap());
    }

    #[test]
    fn test_check_dact_from_second_call() {
        let chains = vec![identical_splits(0), identical_splits(0)];
        let mut history = DiagnosticsHistory::new();
        let criteria = ConvergenceCriteria {
            max_dact: Some(0.5),
            ..criteria(1)
        };
        check(&chains, &criteria, &mut history).unwrap();
        assert!(history.values(Criterion::Dact).is_empty());
        assert!(check(&chains, &criteria, &mut history).unwrap());
        assert_eq!(history.values(Criterion::Dact), &[0.0]);
        assert_eq!(history.iact().len(), 2);
    }

    #[test]
    fn test_check_short_chains() {
        let mut history = DiagnosticsHistory::new();
        let chain = chain_of(Array2::zeros((6, 2)));
        assert!(!check(&[chain], &criteria(1), &mut history).unwrap());
        assert!(history.values(Criterion::EigenGr).is_empty());
        assert!(!check(&[], &criteria(1), &mut history).unwrap());
    }
}
