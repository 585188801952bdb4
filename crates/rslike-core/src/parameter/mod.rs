//! Parameters, their priors and collections of them.
//!
//! A [`Parameter`] is identified by its full name `namespace.basename`.
//! Calculators declare the parameters they own when they are initialised and the
//! pipeline merges them into a single [`ParameterCollection`].

mod collection;
mod prior;
mod samples;

pub use collection::{Conflict, ParameterCollection};
pub use prior::{Distribution, ParameterPrior};
pub use samples::Samples;

use serde::{Deserialize, Serialize};

/// Role of a parameter in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterStatus {
    /// Held at its value.
    Fixed,
    /// Free: either sampled or solved for.
    Varied,
    /// Computed by a calculator and reported with each evaluation.
    Derived,
}

/// How a varied parameter is handled during evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SolveMode {
    /// Explored by the sampler.
    #[default]
    Sampled,
    /// Replaced by its best fit at each point (profiling).
    #[serde(rename = "best")]
    SolvedBest,
    /// Analytically marginalised at each point.
    #[serde(rename = "marg")]
    SolvedMarginal,
    /// Resolved to the pipeline's solved default.
    Auto,
}

impl SolveMode {
    /// Whether the parameter is eliminated analytically.
    pub fn is_solved(&self) -> bool {
        !matches!(self, SolveMode::Sampled)
    }
}

/// Descriptor of a named scalar or array quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    name: String,
    /// Shape of a derived quantity; empty for scalars.
    #[serde(default)]
    pub shape: Vec<usize>,
    /// Fixed value, or the starting point of the solver for solved parameters.
    #[serde(default)]
    pub value: f64,
    #[serde(default)]
    pub prior: ParameterPrior,
    /// Distribution used to draw initial points.
    ///
    /// Falls back to the prior when unset.
    #[serde(default)]
    pub reference: Option<ParameterPrior>,
    pub status: ParameterStatus,
    #[serde(default)]
    pub solve: SolveMode,
    /// Finite difference step.
    #[serde(default)]
    pub delta: Option<f64>,
    #[serde(default)]
    pub latex: Option<String>,
}

impl Parameter {
    /// Create a varied, sampled parameter with a flat prior.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shape: vec![],
            value: 0.0,
            prior: ParameterPrior::flat(),
            reference: None,
            status: ParameterStatus::Varied,
            solve: SolveMode::Sampled,
            delta: None,
            latex: None,
        }
    }

    /// Create a parameter held at `value`.
    pub fn fixed(name: impl Into<String>, value: f64) -> Self {
        Self {
            value,
            status: ParameterStatus::Fixed,
            ..Self::new(name)
        }
    }

    /// Create a derived parameter of the given shape.
    pub fn derived(name: impl Into<String>, shape: Vec<usize>) -> Self {
        Self {
            shape,
            value: f64::NAN,
            status: ParameterStatus::Derived,
            ..Self::new(name)
        }
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = value;
        self
    }

    pub fn with_prior(mut self, prior: ParameterPrior) -> Self {
        self.prior = prior;
        self
    }

    pub fn with_reference(mut self, reference: ParameterPrior) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn with_solve(mut self, solve: SolveMode) -> Self {
        self.solve = solve;
        self
    }

    pub fn with_delta(mut self, delta: f64) -> Self {
        self.delta = Some(delta);
        self
    }

    pub fn with_latex(mut self, latex: impl Into<String>) -> Self {
        self.latex = Some(latex.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The part of the name after the last `.`.
    pub fn basename(&self) -> &str {
        match self.name.rsplit_once('.') {
            Some((_, basename)) => basename,
            None => &self.name,
        }
    }

    /// The part of the name before the last `.`, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.name.rsplit_once('.').map(|(namespace, _)| namespace)
    }

    /// Move the parameter into `namespace`.
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        if !namespace.is_empty() {
            self.name = format!("{}.{}", namespace, self.name);
        }
        self
    }

    /// Number of scalar values held by this parameter.
    pub fn width(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_varied(&self) -> bool {
        self.status == ParameterStatus::Varied
    }

    pub fn is_fixed(&self) -> bool {
        self.status == ParameterStatus::Fixed
    }

    pub fn is_derived(&self) -> bool {
        self.status == ParameterStatus::Derived
    }

    /// Varied and eliminated analytically rather than sampled.
    pub fn is_solved(&self) -> bool {
        self.is_varied() && self.solve.is_solved()
    }

    /// Varied and explored by the sampler.
    pub fn is_sampled(&self) -> bool {
        self.is_varied() && !self.solve.is_solved()
    }

    /// Distribution to draw starting points from.
    pub fn reference_or_prior(&self) -> &ParameterPrior {
        self.reference.as_ref().unwrap_or(&self.prior)
    }

    /// Finite difference step: the configured `delta`, or a fraction of the reference width.
    pub fn step(&self) -> f64 {
        if let Some(delta) = self.delta {
            return delta;
        }
        let std = self.reference_or_prior().std();
        if std.is_finite() && std > 0.0 {
            1e-2 * std
        } else {
            1e-3 * self.value.abs().max(1.0)
        }
    }
}
