//! Type definitions for the pipeline module.

use crate::calculator::{CalculatorId, OutputPort};
use crate::calculator::Calculator;
use crate::errors::{CalculatorError, RslikeError};
use crate::parameter::{ParameterCollection, Samples};
use indexmap::IndexMap;
use petgraph::Graph;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Dependency graph: edges point from a requirement to its dependent.
pub type CGraph = Graph<CalculatorId, ()>;

/// Name of the log-prior column added by the pipeline.
pub const LOGPRIOR: &str = "logprior";

/// Calculation state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeState {
    /// Never calculated since the last (re)initialisation.
    Stale,
    /// The port holds outputs for the recorded inputs.
    Fresh,
    /// The last calculation raised.
    Failed,
}

/// A calculator together with the bookkeeping the pipeline keeps for it.
#[derive(Debug)]
pub(crate) struct Node {
    pub calculator: Box<dyn Calculator>,
    pub initialized: bool,
    pub requires: Vec<CalculatorId>,
    /// Parameters as declared by the calculator.
    pub params: ParameterCollection,
    pub state: NodeState,
    /// Parameter values seen by the last successful calculation.
    pub last_inputs: Vec<f64>,
    /// Upstream port versions seen by the last successful calculation.
    pub consumed: Vec<u64>,
    pub ncalls: usize,
}

impl Node {
    pub fn new(calculator: Box<dyn Calculator>) -> Self {
        Self {
            calculator,
            initialized: false,
            requires: vec![],
            params: ParameterCollection::new(),
            state: NodeState::Stale,
            last_inputs: vec![],
            consumed: vec![],
            ncalls: 0,
        }
    }
}

/// Ports live apart from the nodes so a calculator can read its requirements
/// while being mutated.
pub(crate) type Ports = Vec<OutputPort>;

/// Failure of one row of an evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowError {
    /// Name of the calculator that raised.
    pub calculator: String,
    pub error: CalculatorError,
    /// Whether the error is in the likelihood's catchable set.
    pub catchable: bool,
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (in calculator '{}')", self.error, self.calculator)
    }
}

impl RowError {
    pub fn into_error(self) -> RslikeError {
        RslikeError::Calculation {
            calculator: self.calculator,
            source: self.error,
        }
    }
}

/// Result of evaluating one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowOutcome {
    /// Derived columns of the row, flattened.
    Success(IndexMap<String, Vec<f64>>),
    Failed(RowError),
}

/// Result of [`crate::pipeline::Pipeline::mpicalculate`] on the root rank.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    /// Derived columns, one row per input row, in input order.
    ///
    /// Failed rows hold `-inf` log-likelihood and log-prior and NaN elsewhere.
    pub derived: Samples,
    /// Caught errors keyed by row index.
    pub errors: IndexMap<usize, RowError>,
}

/// Options of the analytic solver for `.best`/`.marg` parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    /// Maximum number of linearisation steps per point.
    pub max_iterations: usize,
    /// Stop once every update is below this many posterior standard deviations.
    pub tolerance: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            tolerance: 1e-4,
        }
    }
}
