//! The contract between calculators and the pipeline that evaluates them.
//!
//! A calculator declares, once, the calculators it requires and the parameters it owns
//! ([`Calculator::initialize`]).
//! It is then asked repeatedly to [`Calculator::calculate`] its outputs from the current
//! values of its parameters and the outputs of its requirements, handed to it as [`Inputs`].
//! Calculators never reach into each other: upstream outputs arrive through versioned
//! [`OutputPort`]s owned by the pipeline.

use crate::errors::{CalculatorError, CalculatorResult, ErrorKind, RslikeResult};
use crate::parameter::{Parameter, ParameterCollection};
use indexmap::IndexMap;
use nalgebra::DMatrix;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt::{self, Debug};
use std::sync::Arc;

/// Handle to a calculator registered with a [`crate::pipeline::PipelineBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CalculatorId(pub(crate) usize);

impl CalculatorId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for CalculatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A calculator output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Scalar(f64),
    Array(Array1<f64>),
}

impl Value {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Value::Scalar(v) => Some(*v),
            Value::Array(a) if a.len() == 1 => Some(a[0]),
            Value::Array(_) => None,
        }
    }

    /// Values as a flat slice-like vector.
    pub fn to_vec(&self) -> Vec<f64> {
        match self {
            Value::Scalar(v) => vec![*v],
            Value::Array(a) => a.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Value::Scalar(_) => 1,
            Value::Array(a) => a.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Scalar(value)
    }
}

impl From<Array1<f64>> for Value {
    fn from(value: Array1<f64>) -> Self {
        Value::Array(value)
    }
}

impl From<Vec<f64>> for Value {
    fn from(value: Vec<f64>) -> Self {
        Value::Array(Array1::from_vec(value))
    }
}

/// Named outputs of one calculation.
pub type Outputs = IndexMap<String, Value>;

/// Versioned, shared view of a calculator's latest outputs.
///
/// The version increases every time the calculator produces new outputs, which lets
/// dependents detect staleness without comparing values.
#[derive(Debug, Clone, Default)]
pub struct OutputPort {
    version: u64,
    outputs: Arc<Outputs>,
}

impl OutputPort {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn outputs(&self) -> &Outputs {
        &self.outputs
    }

    pub(crate) fn publish(&mut self, outputs: Outputs) {
        self.version += 1;
        self.outputs = Arc::new(outputs);
    }
}

/// Position of a requirement in the calculator's declared requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputPort(pub(crate) usize);

/// Collects the requirements and parameters a calculator declares while initialising.
#[derive(Debug, Default)]
pub struct Initializer {
    pub(crate) requires: Vec<CalculatorId>,
    pub(crate) params: ParameterCollection,
}

impl Initializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a dependency on `calculator` and get the port its outputs are read from.
    ///
    /// Requiring the same calculator twice returns the same port.
    pub fn require(&mut self, calculator: CalculatorId) -> InputPort {
        match self.requires.iter().position(|&r| r == calculator) {
            Some(index) => InputPort(index),
            None => {
                self.requires.push(calculator);
                InputPort(self.requires.len() - 1)
            }
        }
    }

    /// Declare ownership of a parameter.
    pub fn param(&mut self, param: Parameter) -> RslikeResult<()> {
        self.params.insert(param)
    }

    pub fn requires(&self) -> &[CalculatorId] {
        &self.requires
    }

    pub fn params(&self) -> &ParameterCollection {
        &self.params
    }
}

/// Everything a calculator may read during [`Calculator::calculate`].
#[derive(Debug)]
pub struct Inputs<'a> {
    pub(crate) params: IndexMap<&'a str, f64>,
    pub(crate) upstream: Vec<&'a OutputPort>,
}

impl<'a> Inputs<'a> {
    /// Current value of an owned, non-derived parameter.
    pub fn param(&self, name: &str) -> CalculatorResult<f64> {
        self.params.get(name).copied().ok_or_else(|| {
            CalculatorError::configuration(format!("parameter '{}' is not an input", name))
        })
    }

    /// Outputs of the requirement behind `port`.
    pub fn upstream(&self, port: InputPort) -> CalculatorResult<&Outputs> {
        self.upstream
            .get(port.0)
            .map(|p| p.outputs())
            .ok_or_else(|| CalculatorError::configuration(format!("no requirement at port {}", port.0)))
    }

    pub fn value(&self, port: InputPort, name: &str) -> CalculatorResult<&Value> {
        self.upstream(port)?.get(name).ok_or_else(|| {
            CalculatorError::configuration(format!(
                "requirement at port {} has no output '{}'",
                port.0, name
            ))
        })
    }

    pub fn scalar(&self, port: InputPort, name: &str) -> CalculatorResult<f64> {
        self.value(port, name)?.as_scalar().ok_or_else(|| {
            CalculatorError::configuration(format!("output '{}' is not a scalar", name))
        })
    }

    pub fn array(&self, port: InputPort, name: &str) -> CalculatorResult<Array1<f64>> {
        Ok(Array1::from_vec(self.value(port, name)?.to_vec()))
    }
}

/// Upcast support for [`crate::pipeline::Pipeline::reconfigure`].
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A node of the calculation graph.
///
/// `calculate` must be a pure function of the parameter values and upstream outputs it is
/// given: evaluating the same point twice yields identical outputs.
pub trait Calculator: AsAny + Debug + Send {
    /// Name used in logs, errors and graph renderings.
    fn name(&self) -> String {
        let name = format!("{:?}", self);
        name.split(['{', ' ', '('])
            .next()
            .unwrap_or("UnknownCalculator")
            .to_string()
    }

    /// Declare requirements and owned parameters.
    ///
    /// Called once when the pipeline is built and again after every reconfiguration.
    fn initialize(&mut self, init: &mut Initializer) -> RslikeResult<()>;

    /// Compute outputs from the current inputs.
    ///
    /// Derived parameters owned by the calculator must appear in the outputs under their name.
    fn calculate(&mut self, inputs: &Inputs) -> CalculatorResult<Outputs>;

    /// Likelihood view of this calculator, if it is one.
    fn as_likelihood(&self) -> Option<&dyn Likelihood> {
        None
    }
}

/// Default set of errors a likelihood treats as invalid points rather than failures.
pub const DEFAULT_CATCH_ERRORS: [ErrorKind; 2] = [ErrorKind::InvalidPoint, ErrorKind::Numerical];

/// Name of the log-likelihood output of a likelihood.
pub const LOGLIKELIHOOD: &str = "loglikelihood";
/// Name of the residual (data minus theory) output of a Gaussian likelihood.
pub const FLATDIFF: &str = "flatdiff";

/// A calculator that scores parameters against data.
///
/// The pipeline reads the log-likelihood from the [`LOGLIKELIHOOD`] output of the root.
pub trait Likelihood {
    /// Errors that mark a single point as invalid instead of aborting the evaluation.
    fn catch_errors(&self) -> Vec<ErrorKind> {
        DEFAULT_CATCH_ERRORS.to_vec()
    }

    /// Number of data points, if known.
    fn size(&self) -> Option<usize> {
        None
    }

    /// Precision matrix of a Gaussian likelihood whose [`FLATDIFF`] output holds the residuals.
    ///
    /// Required for analytic solving of parameters.
    fn precision(&self) -> Option<&DMatrix<f64>> {
        None
    }
}
