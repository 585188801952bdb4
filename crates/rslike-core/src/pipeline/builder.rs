//! Pipeline builder for registering calculators and resolving their dependency graph.

use crate::calculator::{Calculator, CalculatorId};
use crate::comm::{Comm, SelfComm};
use crate::errors::{ErrorKind, RslikeError, RslikeResult};
use crate::parameter::SolveMode;

use super::runtime::Pipeline;
use super::types::{Node, SolverOptions};

/// Build a pipeline from a set of calculators.
///
/// Calculators are registered with [`PipelineBuilder::add`], which hands back the id other
/// calculators use to require them.
/// [`PipelineBuilder::build`] then initialises every calculator reachable from the root,
/// resolves the dependency graph and merges the declared parameters.
/// Registered calculators that the root does not (transitively) require are kept but never run.
pub struct PipelineBuilder {
    nodes: Vec<Node>,
    comm: Option<Comm>,
    solver: SolverOptions,
    solved_default: SolveMode,
    catch_errors: Option<Vec<ErrorKind>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            nodes: vec![],
            comm: None,
            solver: SolverOptions::default(),
            solved_default: SolveMode::SolvedMarginal,
            catch_errors: None,
        }
    }

    /// Register a calculator.
    pub fn add<C: Calculator + 'static>(&mut self, calculator: C) -> CalculatorId {
        self.add_boxed(Box::new(calculator))
    }

    pub fn add_boxed(&mut self, calculator: Box<dyn Calculator>) -> CalculatorId {
        self.nodes.push(Node::new(calculator));
        CalculatorId(self.nodes.len() - 1)
    }

    /// Process group the pipeline evaluates rows on.
    ///
    /// Defaults to a single rank.
    pub fn with_comm(&mut self, comm: Comm) -> &mut Self {
        self.comm = Some(comm);
        self
    }

    pub fn with_solver_options(&mut self, options: SolverOptions) -> &mut Self {
        self.solver = options;
        self
    }

    /// Mode `Auto` parameters resolve to.
    pub fn with_solved_default(&mut self, mode: SolveMode) -> &mut Self {
        self.solved_default = mode;
        self
    }

    /// Override the catchable error set declared by the root likelihood.
    pub fn with_catch_errors(&mut self, kinds: Vec<ErrorKind>) -> &mut Self {
        self.catch_errors = Some(kinds);
        self
    }

    /// Resolve the graph below `root` and create the pipeline.
    ///
    /// Returns an error if a calculator fails to initialise, requires an unknown calculator,
    /// or if the requirements form a cycle.
    pub fn build(self, root: CalculatorId) -> RslikeResult<Pipeline> {
        if root.0 >= self.nodes.len() {
            return Err(RslikeError::UnknownCalculator(root.0));
        }
        if !matches!(
            self.solved_default,
            SolveMode::SolvedBest | SolveMode::SolvedMarginal
        ) {
            return Err(RslikeError::Configuration(format!(
                "solved default must be best or marg, got {:?}",
                self.solved_default
            )));
        }
        let mut pipeline = Pipeline::new(
            self.nodes,
            root,
            self.comm.unwrap_or_else(SelfComm::world),
            self.solver,
            self.solved_default,
            self.catch_errors,
        );
        pipeline.resolve()?;
        Ok(pipeline)
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
