use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error type for invalid operations.
#[derive(Error, Debug)]
pub enum RslikeError {
    #[error("{0}")]
    Error(String),
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("Unknown parameter '{0}'")]
    UnknownParameter(String),
    #[error("Unknown calculator #{0}")]
    UnknownCalculator(usize),
    #[error("Calculator dependency graph contains a cycle through '{calculator}'")]
    CyclicDependency { calculator: String },
    #[error("Error in prior of parameter '{parameter}': {details}")]
    Prior { parameter: String, details: String },
    #[error("Parameter '{parameter}' has shape {shape:?} but a value of width {width} was produced")]
    ShapeMismatch {
        parameter: String,
        shape: Vec<usize>,
        width: usize,
    },
    #[error("Solving for {parameters:?} requires a Gaussian likelihood at the root of the pipeline")]
    SolveUnsupported { parameters: Vec<String> },
    #[error("Linear algebra failure: {0}")]
    LinearAlgebra(String),
    #[error("Communication failure: {0}")]
    Communication(String),
    #[error("Calculator '{calculator}' failed: {source}")]
    Calculation {
        calculator: String,
        #[source]
        source: CalculatorError,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A calculator raised an error outside of the catchable set.
    ///
    /// Raised identically on every rank of the process group.
    #[error("Error \"{error}\" occurred with stack trace:\n{trace}")]
    Pipeline { error: String, trace: String },
}

/// Convenience type for `Result<T, RslikeError>`.
pub type RslikeResult<T> = Result<T, RslikeError>;

/// Category of a calculator failure.
///
/// Likelihoods declare which categories are catchable: a catchable failure marks a
/// single row as invalid (log-posterior of -inf), anything else aborts the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The parameter point is not physical (e.g. negative densities).
    InvalidPoint,
    /// A numerical routine failed (non-convergence, singular matrix).
    Numerical,
    /// The calculator is misconfigured.
    Configuration,
    /// Anything else.
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidPoint => "InvalidPoint",
            ErrorKind::Numerical => "Numerical",
            ErrorKind::Configuration => "Configuration",
            ErrorKind::Other => "Other",
        };
        write!(f, "{}", name)
    }
}

/// Error raised from within [`crate::calculator::Calculator::calculate`].
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct CalculatorError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CalculatorError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The parameter point is invalid, e.g. a non-physical cosmology.
    pub fn invalid_point(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidPoint, message)
    }

    pub fn numerical(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Numerical, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other, message)
    }
}

impl From<RslikeError> for CalculatorError {
    fn from(value: RslikeError) -> Self {
        match value {
            RslikeError::Configuration(msg) => CalculatorError::configuration(msg),
            RslikeError::LinearAlgebra(msg) => CalculatorError::numerical(msg),
            RslikeError::UnknownParameter(name) => {
                CalculatorError::configuration(format!("Unknown parameter '{}'", name))
            }
            other => CalculatorError::other(other.to_string()),
        }
    }
}

/// Convenience type for calculator results.
pub type CalculatorResult<T> = Result<T, CalculatorError>;
