//! Pipeline struct and batched evaluation.

use crate::calculator::{
    Calculator, CalculatorId, Initializer, Inputs, OutputPort, Outputs, Value,
    DEFAULT_CATCH_ERRORS, LOGLIKELIHOOD,
};
use crate::comm::{Comm, CommunicatorExt};
use crate::errors::{CalculatorError, ErrorKind, RslikeError, RslikeResult};
use crate::parameter::{Conflict, Parameter, ParameterCollection, Samples, SolveMode};
use indexmap::IndexMap;
use nalgebra::DMatrix;
use ndarray::Array2;
use petgraph::algo::toposort;
use petgraph::dot::{Config, Dot};
use petgraph::graph::NodeIndex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn, Level};

use super::types::{
    BatchResult, CGraph, Node, NodeState, Ports, RowError, RowOutcome, SolverOptions, LOGPRIOR,
};
use super::validation::find_cycle;

/// Values found by the solver for one point.
#[derive(Debug, Default)]
pub(super) struct SolvedPoint {
    pub values: Vec<(String, f64)>,
    /// Added to the root's log-likelihood (analytic marginalisation).
    pub loglikelihood_offset: f64,
    /// Log-prior of the solved parameters.
    pub logprior: f64,
}

/// Source of a derived column.
#[derive(Debug, Clone)]
pub(super) struct DerivedColumn {
    pub name: String,
    pub source: CalculatorId,
    pub width: usize,
}

/// The resolved dependency graph of a root calculator and the engine evaluating it.
///
/// Calculators are visited in topological order (requirements first).
/// A calculator is only recalculated when it is dirty: it has never been calculated,
/// its last calculation failed, one of its parameters changed value, or one of its
/// requirements published new outputs since it last ran.
///
/// Every rank of the pipeline's communicator holds its own `Pipeline`;
/// [`Pipeline::mpicalculate`] is collective over that communicator.
#[derive(Debug)]
pub struct Pipeline {
    pub(super) nodes: Vec<Node>,
    pub(super) ports: Ports,
    pub(super) root: CalculatorId,
    graph: CGraph,
    order: Vec<CalculatorId>,
    /// Merged parameters of the active calculators, `Auto` resolved.
    pub(super) params: ParameterCollection,
    overrides: IndexMap<String, Parameter>,
    /// Current values of every non-derived parameter.
    pub(super) values: IndexMap<String, f64>,
    pub(super) derived: Vec<DerivedColumn>,
    pub(super) solved: Vec<String>,
    comm: Comm,
    pub(super) solver: SolverOptions,
    solved_default: SolveMode,
    catch_errors_override: Option<Vec<ErrorKind>>,
    catch_errors: Vec<ErrorKind>,
    pub(super) precision: Option<Arc<DMatrix<f64>>>,
}

impl Pipeline {
    pub(super) fn new(
        nodes: Vec<Node>,
        root: CalculatorId,
        comm: Comm,
        solver: SolverOptions,
        solved_default: SolveMode,
        catch_errors_override: Option<Vec<ErrorKind>>,
    ) -> Self {
        let ports = vec![OutputPort::default(); nodes.len()];
        Self {
            nodes,
            ports,
            root,
            graph: CGraph::new(),
            order: vec![],
            params: ParameterCollection::new(),
            overrides: IndexMap::new(),
            values: IndexMap::new(),
            derived: vec![],
            solved: vec![],
            comm,
            solver,
            solved_default,
            catch_errors_override,
            catch_errors: DEFAULT_CATCH_ERRORS.to_vec(),
            precision: None,
        }
    }

    /// Initialise the calculators reachable from the root and rebuild the graph.
    pub(super) fn resolve(&mut self) -> RslikeResult<()> {
        let n = self.nodes.len();
        let mut active = vec![false; n];
        let mut queue = VecDeque::from([self.root]);
        while let Some(id) = queue.pop_front() {
            if active[id.0] {
                continue;
            }
            active[id.0] = true;
            let node = &mut self.nodes[id.0];
            if !node.initialized {
                let mut init = Initializer::new();
                node.calculator.initialize(&mut init)?;
                node.requires = init.requires;
                node.params = init.params;
                node.initialized = true;
                node.state = NodeState::Stale;
                node.consumed.clear();
                node.last_inputs.clear();
            }
            for &required in &node.requires {
                if required.0 >= n {
                    return Err(RslikeError::UnknownCalculator(required.0));
                }
                queue.push_back(required);
            }
        }

        let mut graph = CGraph::new();
        let mut indices: HashMap<usize, NodeIndex> = HashMap::new();
        for (id, _) in active.iter().enumerate().filter(|(_, a)| **a) {
            indices.insert(id, graph.add_node(CalculatorId(id)));
        }
        for (id, _) in active.iter().enumerate().filter(|(_, a)| **a) {
            for required in &self.nodes[id].requires {
                graph.add_edge(indices[&required.0], indices[&id], ());
            }
        }

        // Check that the calculator graph doesn't contain any loops
        let cycle_error = |nx: NodeIndex| RslikeError::CyclicDependency {
            calculator: self.nodes[graph[nx].0].calculator.name(),
        };
        if let Some(nx) = find_cycle(&graph) {
            return Err(cycle_error(nx));
        }
        let order = toposort(&graph, None).map_err(|cycle| cycle_error(cycle.node_id()))?;
        self.order = order.into_iter().map(|nx| graph[nx]).collect();
        self.graph = graph;

        let root = self.nodes[self.root.0].calculator.as_likelihood();
        self.precision = root.and_then(|l| l.precision()).cloned().map(Arc::new);
        self.catch_errors = match (&self.catch_errors_override, root) {
            (Some(kinds), _) => kinds.clone(),
            (None, Some(likelihood)) => likelihood.catch_errors(),
            (None, None) => DEFAULT_CATCH_ERRORS.to_vec(),
        };
        debug!(
            calculators = self.order.len(),
            root = %self.nodes[self.root.0].calculator.name(),
            "Resolved calculator graph"
        );
        self.merge_params()
    }

    /// Merge the parameters declared by the active calculators.
    fn merge_params(&mut self) -> RslikeResult<()> {
        let declared: Vec<&ParameterCollection> =
            self.order.iter().map(|id| &self.nodes[id.0].params).collect();
        let mut params = ParameterCollection::concatenate(declared, Conflict::KeepFirst)?;
        for param in self.overrides.values() {
            if params.contains(param.name()) {
                params.set(param.clone());
            }
        }
        for param in params.iter_mut() {
            if param.solve == SolveMode::Auto {
                param.solve = self.solved_default;
            }
        }

        let mut values = IndexMap::new();
        for param in params.iter().filter(|p| !p.is_derived()) {
            let value = match self.values.get(param.name()) {
                Some(&value) if param.is_varied() => value,
                _ => param.value,
            };
            values.insert(param.name().to_string(), value);
        }

        let mut derived = vec![];
        for id in &self.order {
            for param in self.nodes[id.0].params.derived().iter() {
                if params.get(param.name()).map_or(false, |p| p.is_derived())
                    && !derived.iter().any(|d: &DerivedColumn| d.name == param.name())
                {
                    derived.push(DerivedColumn {
                        name: param.name().to_string(),
                        source: *id,
                        width: param.width(),
                    });
                }
            }
        }

        let solved = params.solved().names();
        if !solved.is_empty() && self.precision.is_none() {
            return Err(RslikeError::SolveUnsupported { parameters: solved });
        }

        self.params = params;
        self.values = values;
        self.derived = derived;
        self.solved = solved;
        Ok(())
    }

    /// Merged parameters of every calculator in the graph.
    pub fn params(&self) -> &ParameterCollection {
        &self.params
    }

    /// Current value of every fixed and varied parameter.
    pub fn values(&self) -> &IndexMap<String, f64> {
        &self.values
    }

    pub fn root(&self) -> CalculatorId {
        self.root
    }

    /// Calculators in evaluation order.
    pub fn order(&self) -> &[CalculatorId] {
        &self.order
    }

    pub fn comm(&self) -> &Comm {
        &self.comm
    }

    /// Evaluate rows on another process group.
    pub fn set_comm(&mut self, comm: Comm) {
        self.comm = comm;
    }

    pub fn catch_errors(&self) -> &[ErrorKind] {
        &self.catch_errors
    }

    pub fn solver_options(&self) -> &SolverOptions {
        &self.solver
    }

    pub fn set_solver_options(&mut self, options: SolverOptions) {
        self.solver = options;
    }

    /// Whether the root is a likelihood, in which case log-likelihood and log-prior
    /// columns are reported.
    pub fn is_likelihood(&self) -> bool {
        self.nodes[self.root.0].calculator.as_likelihood().is_some()
    }

    /// Precision matrix of the root Gaussian likelihood, if any.
    pub fn precision(&self) -> Option<&DMatrix<f64>> {
        self.precision.as_deref()
    }

    /// Number of data points of the root likelihood, if known.
    pub fn likelihood_size(&self) -> Option<usize> {
        self.nodes[self.root.0]
            .calculator
            .as_likelihood()
            .and_then(|l| l.size())
    }

    /// Change the mode `Auto` parameters resolve to.
    pub fn set_solved_default(&mut self, mode: SolveMode) -> RslikeResult<()> {
        if !matches!(mode, SolveMode::SolvedBest | SolveMode::SolvedMarginal) {
            return Err(RslikeError::Configuration(format!(
                "solved default must be best or marg, got {:?}",
                mode
            )));
        }
        self.solved_default = mode;
        self.merge_params()
    }

    /// Replace the description of an existing parameter (prior, status, solve mode...).
    ///
    /// The change survives reconfiguration of the owning calculator.
    pub fn update_param(&mut self, param: Parameter) -> RslikeResult<()> {
        if !self.params.contains(param.name()) {
            return Err(RslikeError::UnknownParameter(param.name().to_string()));
        }
        let name = param.name().to_string();
        let value = param.is_fixed().then_some(param.value);
        let previous = self.overrides.insert(name.clone(), param);
        if let Err(error) = self.merge_params() {
            match previous {
                Some(previous) => self.overrides.insert(name, previous),
                None => self.overrides.shift_remove(&name),
            };
            return Err(error);
        }
        if let Some(value) = value {
            self.values.insert(name, value);
        }
        Ok(())
    }

    /// Names and widths of the columns reported for each row.
    pub fn derived_columns(&self) -> Vec<(String, usize)> {
        let mut columns: Vec<(String, usize)> = self
            .derived
            .iter()
            .map(|d| (d.name.clone(), d.width))
            .collect();
        if self.is_likelihood() {
            columns.push((LOGLIKELIHOOD.to_string(), 1));
            columns.push((LOGPRIOR.to_string(), 1));
        }
        columns.extend(self.solved.iter().map(|name| (name.clone(), 1)));
        columns
    }

    /// Latest outputs of a calculator.
    pub fn get(&self, id: CalculatorId) -> RslikeResult<&Outputs> {
        if !self.order.contains(&id) {
            return Err(RslikeError::UnknownCalculator(id.0));
        }
        Ok(self.ports[id.0].outputs())
    }

    /// Number of times a calculator has been calculated.
    pub fn ncalls(&self, id: CalculatorId) -> usize {
        self.nodes.get(id.0).map_or(0, |n| n.ncalls)
    }

    /// Apply a configuration change to a calculator of concrete type `C` and initialise it again.
    ///
    /// The graph is resolved again since requirements may have changed.
    pub fn reconfigure<C, F>(&mut self, id: CalculatorId, f: F) -> RslikeResult<()>
    where
        C: Calculator + 'static,
        F: FnOnce(&mut C),
    {
        let node = self
            .nodes
            .get_mut(id.0)
            .ok_or(RslikeError::UnknownCalculator(id.0))?;
        let calculator: &mut dyn Calculator = node.calculator.as_mut();
        let concrete = calculator.as_any_mut().downcast_mut::<C>().ok_or_else(|| {
            RslikeError::Configuration(format!(
                "calculator {} is not a {}",
                id,
                std::any::type_name::<C>()
            ))
        })?;
        f(concrete);
        node.initialized = false;
        self.resolve()
    }

    fn set_point(&mut self, point: &IndexMap<String, f64>) -> RslikeResult<()> {
        for (name, &value) in point {
            let param = self.params.try_get(name)?;
            if param.is_derived() || param.is_solved() {
                return Err(RslikeError::Configuration(format!(
                    "parameter '{}' is {} and cannot be set",
                    name,
                    if param.is_derived() { "derived" } else { "solved" }
                )));
            }
            self.values.insert(name.clone(), value);
        }
        Ok(())
    }

    /// Visit the graph, recalculating dirty calculators.
    pub(super) fn run_graph(&mut self) -> Result<(), RowError> {
        for index in 0..self.order.len() {
            let id = self.order[index].0;
            let values = &self.values;
            let ports = &self.ports;
            let node = &mut self.nodes[id];

            let input_values: Vec<f64> = node
                .params
                .iter()
                .filter(|p| !p.is_derived())
                .map(|p| values.get(p.name()).copied().unwrap_or(f64::NAN))
                .collect();
            let versions: Vec<u64> = node.requires.iter().map(|r| ports[r.0].version()).collect();
            if node.state == NodeState::Fresh
                && node.last_inputs == input_values
                && node.consumed == versions
            {
                continue;
            }

            let result = {
                let inputs = Inputs {
                    params: node
                        .params
                        .iter()
                        .filter(|p| !p.is_derived())
                        .zip(input_values.iter())
                        .map(|(p, &v)| (p.name(), v))
                        .collect(),
                    upstream: node.requires.iter().map(|r| &ports[r.0]).collect(),
                };
                node.calculator.calculate(&inputs)
            };
            let result = result.and_then(|outputs| {
                match node
                    .params
                    .iter()
                    .find(|p| p.is_derived() && !outputs.contains_key(p.name()))
                {
                    Some(missing) => Err(CalculatorError::configuration(format!(
                        "derived parameter '{}' is missing from the outputs",
                        missing.name()
                    ))),
                    None => Ok(outputs),
                }
            });

            match result {
                Ok(outputs) => {
                    self.ports[id].publish(outputs);
                    node.state = NodeState::Fresh;
                    node.last_inputs = input_values;
                    node.consumed = versions;
                    node.ncalls += 1;
                }
                Err(error) => {
                    node.state = NodeState::Failed;
                    let catchable = self.catch_errors.contains(&error.kind);
                    return Err(RowError {
                        calculator: node.calculator.name(),
                        error,
                        catchable,
                    });
                }
            }
        }
        Ok(())
    }

    /// Error for a row that could not be evaluated for structural reasons.
    fn structural_error(&self, error: RslikeError) -> RowError {
        RowError {
            calculator: self.nodes[self.root.0].calculator.name(),
            error: CalculatorError::from(error),
            catchable: false,
        }
    }

    /// Prior log-density of the sampled parameters at the current point.
    fn sampled_logprior(&self) -> f64 {
        self.params
            .iter()
            .filter(|p| p.is_sampled())
            .map(|p| p.prior.logpdf(self.values.get(p.name()).copied().unwrap_or(f64::NAN)))
            .sum()
    }

    /// Evaluate one point, solving for solved parameters if any.
    ///
    /// A likelihood point outside the prior is not calculated: its log-likelihood and
    /// log-prior are `-inf` and its other columns are missing.
    pub(crate) fn evaluate(&mut self, point: &IndexMap<String, f64>) -> RowOutcome {
        if let Err(error) = self.set_point(point) {
            return RowOutcome::Failed(self.structural_error(error));
        }
        let logprior = self.sampled_logprior();
        if self.is_likelihood() && !logprior.is_finite() {
            return RowOutcome::Success(IndexMap::from([
                (LOGLIKELIHOOD.to_string(), vec![f64::NEG_INFINITY]),
                (LOGPRIOR.to_string(), vec![f64::NEG_INFINITY]),
            ]));
        }
        let solved = if self.solved.is_empty() {
            self.run_graph().map(|_| SolvedPoint::default())
        } else {
            self.solve_point()
        };
        match solved {
            Ok(solved) => self.collect_row(logprior, solved),
            Err(error) => RowOutcome::Failed(error),
        }
    }

    fn collect_row(&self, logprior: f64, solved: SolvedPoint) -> RowOutcome {
        let mut row = IndexMap::new();
        for column in &self.derived {
            let values = self.ports[column.source.0]
                .outputs()
                .get(&column.name)
                .map(Value::to_vec)
                .unwrap_or_default();
            if values.len() != column.width {
                let param = self.params.get(&column.name);
                let error = RslikeError::ShapeMismatch {
                    parameter: column.name.clone(),
                    shape: param.map(|p| p.shape.clone()).unwrap_or_default(),
                    width: values.len(),
                };
                return RowOutcome::Failed(RowError {
                    calculator: self.nodes[column.source.0].calculator.name(),
                    error: CalculatorError::configuration(error.to_string()),
                    catchable: false,
                });
            }
            row.insert(column.name.clone(), values);
        }
        if self.is_likelihood() {
            let loglikelihood = self.ports[self.root.0]
                .outputs()
                .get(LOGLIKELIHOOD)
                .and_then(Value::as_scalar)
                .unwrap_or(f64::NEG_INFINITY);
            let mut loglikelihood = loglikelihood + solved.loglikelihood_offset;
            let mut logprior = logprior + solved.logprior;
            if loglikelihood.is_nan() || logprior.is_nan() {
                warn!(
                    point = ?self.values,
                    loglikelihood,
                    logprior,
                    "NaN log-posterior, setting it to -inf"
                );
                loglikelihood = f64::NEG_INFINITY;
                logprior = f64::NEG_INFINITY;
            }
            row.insert(LOGLIKELIHOOD.to_string(), vec![loglikelihood]);
            row.insert(LOGPRIOR.to_string(), vec![logprior]);
        }
        for (name, value) in solved.values {
            row.insert(name, vec![value]);
        }
        RowOutcome::Success(row)
    }

    /// Evaluate a single point on this rank.
    ///
    /// Returns the reported columns of the point; calculator errors are returned as
    /// [`RslikeError::Calculation`].
    pub fn calculate(&mut self, point: &IndexMap<String, f64>) -> RslikeResult<IndexMap<String, Vec<f64>>> {
        match self.evaluate(point) {
            RowOutcome::Success(row) => Ok(row),
            RowOutcome::Failed(error) => Err(error.into_error()),
        }
    }

    /// Evaluate a table of points across the ranks of the pipeline's communicator.
    ///
    /// Collective. Rows of the root's `points` are scattered in contiguous chunks,
    /// evaluated independently and gathered back in order.
    /// Caught (catchable) errors are reported per row in [`BatchResult::errors`];
    /// any other error is broadcast and returned as [`RslikeError::Pipeline`] on every rank.
    /// Only the root receives the populated result; other ranks get an empty one.
    pub fn mpicalculate(&mut self, points: &Samples) -> RslikeResult<BatchResult> {
        let comm = self.comm.clone();
        let chunks = if comm.is_root() {
            Some(points.split_rows(comm.size()))
        } else {
            None
        };
        let mine: Samples = comm.scatter(chunks, 0)?;
        let outcomes: Vec<RowOutcome> = (0..mine.nrows())
            .map(|i| self.evaluate(&mine.point(i)))
            .collect();
        let gathered = comm.gather(&outcomes, 0)?;

        let (result, fatal) = match gathered {
            Some(gathered) => {
                let outcomes: Vec<RowOutcome> = gathered.into_iter().flatten().collect();
                let fatal = outcomes.iter().enumerate().find_map(|(i, o)| match o {
                    RowOutcome::Failed(e) if !e.catchable => Some((i, e.clone())),
                    _ => None,
                });
                (self.assemble(&outcomes, points)?, fatal)
            }
            None => (BatchResult::default(), None),
        };

        let fatal = comm.bcast(if comm.is_root() { Some(fatal) } else { None }, 0)?;
        if let Some((index, error)) = fatal {
            return Err(RslikeError::Pipeline {
                error: error.error.to_string(),
                trace: format!("in calculator '{}' evaluating row {}", error.calculator, index),
            });
        }
        Ok(result)
    }

    fn assemble(&self, outcomes: &[RowOutcome], points: &Samples) -> RslikeResult<BatchResult> {
        let nrows = outcomes.len();
        let columns = self.derived_columns();
        let mut data: Vec<Vec<f64>> = columns.iter().map(|(_, w)| Vec::with_capacity(nrows * w)).collect();
        let mut errors = IndexMap::new();

        for (index, outcome) in outcomes.iter().enumerate() {
            match outcome {
                RowOutcome::Success(row) => {
                    for ((name, width), column) in columns.iter().zip(data.iter_mut()) {
                        match row.get(name) {
                            Some(values) => column.extend_from_slice(values),
                            None => column.extend(std::iter::repeat(f64::NAN).take(*width)),
                        }
                    }
                }
                RowOutcome::Failed(error) => {
                    for ((name, width), column) in columns.iter().zip(data.iter_mut()) {
                        let fill = if name == LOGLIKELIHOOD || name == LOGPRIOR {
                            f64::NEG_INFINITY
                        } else {
                            f64::NAN
                        };
                        column.extend(std::iter::repeat(fill).take(*width));
                    }
                    if error.catchable {
                        debug!(
                            row = index,
                            point = ?points.point(index),
                            calculator = %error.calculator,
                            error = %error.error,
                            "Caught error evaluating point"
                        );
                        errors.insert(index, error.clone());
                    }
                }
            }
        }
        if !errors.is_empty() && !tracing::enabled!(Level::DEBUG) {
            info!(
                nerrors = errors.len(),
                nrows,
                "Some points could not be evaluated; set log level to debug to see the errors"
            );
        }

        let mut derived = Samples::new(nrows);
        for ((name, width), column) in columns.into_iter().zip(data) {
            let column = Array2::from_shape_vec((nrows, width), column)
                .map_err(|e| RslikeError::Error(format!("column '{}': {}", name, e)))?;
            derived.insert(name, column)?;
        }
        Ok(BatchResult { derived, errors })
    }

    /// Create a diagram that represents the calculator graph.
    ///
    /// Useful for debugging.
    pub fn as_dot(&self) -> String {
        let node_label = |id: &CalculatorId| {
            // Escape quotes and backslashes for DOT format
            let name = self.nodes[id.0].calculator.name();
            let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
            format!("label = \"{}\"", escaped)
        };
        format!(
            "{:?}",
            Dot::with_attr_getters(
                &self.graph,
                &[Config::NodeNoLabel, Config::EdgeNoLabel],
                &|_, _| String::new(),
                &|_, (_, id)| node_label(id),
            )
        )
    }
}
