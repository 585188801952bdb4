//! Batched multi-chain posterior sampling.
//!
//! A [`BatchSampler`] runs independent chains in batches of `check_every` steps. Before
//! each batch every chain is restarted from its last sample (or from the reference
//! distributions), the chains are spread over disjoint process groups, and the finished
//! chains are gathered on the root rank, saved and checked for convergence.
//!
//! Rank 0 of the world owns the chains and takes every decision that depends on them;
//! decisions are broadcast so that all ranks follow the same control flow.

use crate::chain::{expand_pattern, Chain, ChainAttrs};
use crate::convergence::{self, CheckOption, ConvergenceCriteria, DiagnosticsHistory};
use crate::errors::{SamplerError, SamplerResult};
use crate::posterior::Posterior;
use crate::stepper::{Stepper, Walkers};
use indexmap::IndexMap;
use ndarray::{Array2, Array3};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rslike_core::calculator::LOGLIKELIHOOD;
use rslike_core::comm::{Comm, CommunicatorExt, TaskManager};
use rslike_core::parameter::{ParameterPrior, SolveMode};
use rslike_core::pipeline::{Pipeline, LOGPRIOR};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

/// Tag of the messages carrying finished chains to the root.
const TAG_CHAIN: u32 = 7;

/// Where to save the chains after each batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SaveFn {
    /// Path template; `*` is replaced by the chain index.
    Template(String),
    /// One path per chain.
    Paths(Vec<PathBuf>),
}

/// Construction options of a [`BatchSampler`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SamplerOptions {
    /// Seed of the random number generators; drawn by the root when unset.
    pub seed: Option<u64>,
    /// Number of reference draws to try for a finite starting log-posterior.
    pub max_tries: usize,
    /// Number of chains. Defaults to the number of save paths, or 1.
    pub chains: Option<usize>,
    /// Pattern of saved chains to resume from, `*` standing for the chain index.
    pub resume: Option<String>,
    /// Scale of the reference distributions around their centers.
    pub ref_scale: f64,
    pub save_fn: Option<SaveFn>,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self {
            seed: None,
            max_tries: 1000,
            chains: None,
            resume: None,
            ref_scale: 1.0,
            save_fn: None,
        }
    }
}

/// Options of [`BatchSampler::run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunOptions {
    /// Do not stop before this many iterations, even if converged.
    pub min_iterations: usize,
    pub max_iterations: usize,
    /// Iterations per batch; chains are saved and checked after each batch.
    pub check_every: usize,
    pub check: CheckOption,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            min_iterations: 0,
            max_iterations: usize::MAX,
            check_every: 300,
            check: CheckOption::default(),
        }
    }
}

impl RunOptions {
    pub fn validate(&self) -> SamplerResult<()> {
        if self.check_every < 1 {
            return Err(SamplerError::Configuration(format!(
                "check_every must be >= 1, found {}",
                self.check_every
            )));
        }
        if let CheckOption::Enabled(criteria) = &self.check {
            criteria.validate()?;
        }
        Ok(())
    }
}

/// Progress of a [`BatchSampler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    AwaitingStart,
    RunningBatch,
    CheckingConvergence,
    Converged,
    /// `max_iterations` was reached before convergence.
    Exhausted,
    Failed,
}

/// How [`BatchSampler::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Converged,
    Exhausted,
}

/// A chain finished by a process group.
#[derive(Debug, Serialize, Deserialize)]
struct Finished {
    task: usize,
    chain: Chain,
    ncall: usize,
    naccepted: usize,
}

/// Broadcast the root's outcome so that a failure on the root fails every rank.
fn bcast_outcome<T: Serialize + DeserializeOwned>(
    comm: &Comm,
    outcome: Option<Result<T, String>>,
) -> SamplerResult<T> {
    let outcome: Result<T, String> = comm.bcast(outcome, 0)?;
    outcome.map_err(SamplerError::Configuration)
}

/// Accumulates the states of the walkers of one chain, step after step.
struct ChainRecorder {
    varied: Vec<String>,
    fixed: Vec<(String, f64)>,
    derived: Vec<String>,
    columns: Vec<Vec<f64>>,
    nwalkers: usize,
    nsteps: usize,
}

impl ChainRecorder {
    fn new(posterior: &Posterior, fixed: Vec<(String, f64)>, nwalkers: usize) -> Self {
        let varied = posterior.varied();
        let derived = posterior.derived_names().to_vec();
        let ncolumns = varied.len() + derived.len() + 2;
        Self {
            varied,
            fixed,
            derived,
            columns: vec![vec![]; ncolumns],
            nwalkers,
            nsteps: 0,
        }
    }

    fn push(&mut self, walkers: &Walkers) {
        let ndim = self.varied.len();
        let nderived = self.derived.len();
        for j in 0..ndim {
            self.columns[j].extend(walkers.positions.column(j).iter());
        }
        for j in 0..nderived {
            self.columns[ndim + j].extend(walkers.derived.column(j).iter());
        }
        self.columns[ndim + nderived].extend(walkers.loglikelihood.iter());
        self.columns[ndim + nderived + 1].extend(walkers.logprior.iter());
        self.nsteps += 1;
    }

    fn finish(self) -> SamplerResult<Chain> {
        let shape = (self.nsteps, self.nwalkers);
        let ndim = self.varied.len();
        let names = self
            .varied
            .iter()
            .cloned()
            .chain(self.derived.iter().cloned())
            .chain([LOGLIKELIHOOD.to_string(), LOGPRIOR.to_string()]);
        let mut columns = IndexMap::new();
        let mut recorded = names.zip(self.columns);
        for (name, values) in recorded.by_ref().take(ndim) {
            columns.insert(name, Self::column(shape, values)?);
        }
        for (name, value) in self.fixed {
            columns.insert(name, Array2::from_elem(shape, value));
        }
        for (name, values) in recorded {
            columns.insert(name, Self::column(shape, values)?);
        }
        Chain::new(self.varied, columns)
    }

    fn column(shape: (usize, usize), values: Vec<f64>) -> SamplerResult<Array2<f64>> {
        Array2::from_shape_vec(shape, values)
            .map_err(|e| SamplerError::Configuration(format!("inconsistent chain column: {}", e)))
    }
}

/// Posterior sampler running independent chains in batches, distributed over process groups.
///
/// Every method is collective over the communicator of the pipeline the sampler was
/// built with. The chains are only held by rank 0.
#[derive(Debug)]
pub struct BatchSampler<S: Stepper> {
    posterior: Posterior,
    stepper: S,
    world: Comm,
    references: Vec<ParameterPrior>,
    fixed: Vec<(String, f64)>,
    chains: Vec<Option<Chain>>,
    save_paths: Option<Vec<PathBuf>>,
    max_tries: usize,
    seed: u64,
    nbatches: u64,
    attrs: ChainAttrs,
    diagnostics: DiagnosticsHistory,
    state: RunState,
}

impl<S: Stepper> BatchSampler<S> {
    /// Create a sampler, resuming from the chains saved under `options.resume` if set.
    pub fn new(pipeline: Pipeline, stepper: S, options: SamplerOptions) -> SamplerResult<Self> {
        let source = match &options.resume {
            Some(pattern) if pipeline.comm().is_root() => Some(Chain::load_pattern(pattern)),
            _ => None,
        };
        Self::build(pipeline, stepper, options, source)
    }

    /// Create a sampler continuing `chains`; only the root's chains are used.
    pub fn resume(
        pipeline: Pipeline,
        stepper: S,
        options: SamplerOptions,
        chains: Vec<Chain>,
    ) -> SamplerResult<Self> {
        Self::build(pipeline, stepper, options, Some(Ok(chains)))
    }

    fn build(
        mut pipeline: Pipeline,
        stepper: S,
        options: SamplerOptions,
        source: Option<SamplerResult<Vec<Chain>>>,
    ) -> SamplerResult<Self> {
        let world = pipeline.comm().clone();
        pipeline.set_solved_default(SolveMode::SolvedMarginal)?;
        let nvaried = pipeline.params().varied().len();
        let size = pipeline.likelihood_size();
        let fixed = pipeline
            .params()
            .fixed()
            .iter()
            .map(|p| (p.name().to_string(), p.value))
            .collect();
        let posterior = Posterior::new(pipeline)?;
        let references = posterior
            .params()
            .iter()
            .map(|p| p.reference_or_prior().affine_transform(options.ref_scale))
            .collect::<Result<Vec<_>, _>>()?;
        if world.is_root() {
            info!(varied = ?posterior.varied(), "Varied parameters");
        }

        let initial = world
            .is_root()
            .then(|| Self::initial_chains(&posterior, &options, source));
        let shared = bcast_outcome(
            &world,
            initial
                .as_ref()
                .map(|r| r.as_ref().map(Vec::len).map_err(ToString::to_string)),
        );
        let chains = match initial {
            Some(chains) => chains?,
            None => vec![None; shared?],
        };
        let nchains = chains.len();

        let save_paths = match options.save_fn {
            None => None,
            Some(SaveFn::Template(template)) => Some(expand_pattern(&template, nchains)),
            Some(SaveFn::Paths(paths)) => {
                if paths.len() != nchains {
                    return Err(SamplerError::Configuration(format!(
                        "Provide {} chain file names, got {}",
                        nchains,
                        paths.len()
                    )));
                }
                Some(paths)
            }
        };

        let seed = world.bcast(
            world
                .is_root()
                .then(|| options.seed.unwrap_or_else(rand::random)),
            0,
        )?;

        Ok(Self {
            posterior,
            stepper,
            world,
            references,
            fixed,
            chains,
            save_paths,
            max_tries: options.max_tries,
            seed,
            nbatches: 0,
            attrs: ChainAttrs {
                size,
                nvaried: Some(nvaried),
                ndof: size.map(|size| size as i64 - nvaried as i64),
            },
            diagnostics: DiagnosticsHistory::new(),
            state: RunState::AwaitingStart,
        })
    }

    /// Chains of a new run on the root: the resumed chains, or empty slots.
    fn initial_chains(
        posterior: &Posterior,
        options: &SamplerOptions,
        source: Option<SamplerResult<Vec<Chain>>>,
    ) -> SamplerResult<Vec<Option<Chain>>> {
        let Some(loaded) = source else {
            let nchains = options.chains.unwrap_or(match &options.save_fn {
                Some(SaveFn::Paths(paths)) => paths.len(),
                _ => 1,
            });
            if nchains < 1 {
                return Err(SamplerError::Configuration(
                    "at least one chain is required".to_string(),
                ));
            }
            return Ok(vec![None; nchains]);
        };
        let loaded = loaded?;
        if loaded.is_empty() {
            return Err(SamplerError::Configuration("no chain to resume from".to_string()));
        }
        if let Some(nchains) = options.chains {
            if nchains != loaded.len() {
                return Err(SamplerError::Configuration(format!(
                    "{} chains requested but {} chains to resume from",
                    nchains,
                    loaded.len()
                )));
            }
        }
        let varied = posterior.varied();
        for chain in &loaded {
            if chain.varied() != varied.as_slice() {
                return Err(SamplerError::Configuration(format!(
                    "chain to resume from varies {:?}, expected {:?}",
                    chain.varied(),
                    varied
                )));
            }
        }
        Ok(loaded.into_iter().map(Some).collect())
    }

    pub fn posterior(&self) -> &Posterior {
        &self.posterior
    }

    pub fn nchains(&self) -> usize {
        self.chains.len()
    }

    pub fn nwalkers(&self) -> usize {
        self.stepper.nwalkers(self.posterior.ndim())
    }

    /// Chains sampled so far; only populated on the root.
    pub fn chains(&self) -> &[Option<Chain>] {
        &self.chains
    }

    pub fn save_paths(&self) -> Option<&[PathBuf]> {
        self.save_paths.as_deref()
    }

    pub fn diagnostics(&self) -> &DiagnosticsHistory {
        &self.diagnostics
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Seed of the generators of the current batch.
    fn batch_seed(&self) -> u64 {
        self.seed ^ self.nbatches.wrapping_mul(0x9E37_79B9_7F4A_7C15)
    }

    /// Starting walkers of every chain, evaluated on the posterior.
    ///
    /// An explicit `start` of shape `(nchains, nwalkers, ndim)` is used as is. Otherwise
    /// chains resume from their last sample and the remaining walkers are drawn from the
    /// reference distributions until their log-posterior is finite, at most `max_tries` times.
    pub fn start(&mut self, start: Option<&Array3<f64>>) -> SamplerResult<Vec<Walkers>> {
        self.state = RunState::AwaitingStart;
        self.posterior.set_comm(self.world.clone());
        let nchains = self.nchains();
        let nwalkers = self.nwalkers();
        let ndim = self.posterior.ndim();
        let total = nchains * nwalkers;
        let mut walkers = Walkers::unset(total, ndim, self.posterior.derived_names().len());

        if let Some(start) = start {
            if start.dim() != (nchains, nwalkers, ndim) {
                return Err(SamplerError::Configuration(format!(
                    "Provide start with shape {:?}, got {:?}",
                    (nchains, nwalkers, ndim),
                    start.dim()
                )));
            }
            let positions = Array2::from_shape_vec((total, ndim), start.iter().copied().collect())
                .map_err(|e| SamplerError::Configuration(format!("start: {}", e)))?;
            self.evaluate_rows(&mut walkers, &positions, &(0..total).collect::<Vec<_>>())?;
            return Ok(Self::split(&walkers, nchains, nwalkers));
        }

        let last: Vec<Option<Array2<f64>>> = self.world.bcast(
            self.world.is_root().then(|| {
                self.chains
                    .iter()
                    .map(|c| c.as_ref().and_then(Chain::last_positions))
                    .collect()
            }),
            0,
        )?;
        let mut resumed = vec![];
        let mut positions = Array2::from_elem((total, ndim), f64::NAN);
        for (ichain, last) in last.into_iter().enumerate() {
            let Some(last) = last else { continue };
            if last.dim() != (nwalkers, ndim) {
                return Err(SamplerError::Configuration(format!(
                    "chain {} has walkers of shape {:?}, expected {:?}",
                    ichain,
                    last.dim(),
                    (nwalkers, ndim)
                )));
            }
            for w in 0..nwalkers {
                positions.row_mut(ichain * nwalkers + w).assign(&last.row(w));
                resumed.push(ichain * nwalkers + w);
            }
        }
        if !resumed.is_empty() {
            let rows = positions.select(ndarray::Axis(0), &resumed);
            self.evaluate_rows(&mut walkers, &rows, &resumed)?;
        }

        let mut rng = ChaCha8Rng::seed_from_u64(self.batch_seed());
        rng.set_stream(0);
        for _ in 0..self.max_tries {
            let missing: Vec<usize> = (0..total)
                .filter(|&i| !walkers.logposterior[i].is_finite())
                .collect();
            if missing.is_empty() {
                break;
            }
            let mut draws = Array2::zeros((missing.len(), ndim));
            for (j, reference) in self.references.iter().enumerate() {
                for k in 0..missing.len() {
                    draws[[k, j]] = reference.sample(&mut rng)?;
                }
            }
            self.evaluate_rows(&mut walkers, &draws, &missing)?;
        }
        if !walkers.logposterior.iter().all(|l| l.is_finite()) {
            self.state = RunState::Failed;
            return Err(SamplerError::StartFailed {
                max_tries: self.max_tries,
            });
        }
        Ok(Self::split(&walkers, nchains, nwalkers))
    }

    /// Evaluate `positions` and store them as walkers `rows`.
    fn evaluate_rows(
        &mut self,
        walkers: &mut Walkers,
        positions: &Array2<f64>,
        rows: &[usize],
    ) -> SamplerResult<()> {
        let evaluation = self.posterior.evaluate(positions)?;
        for (k, &i) in rows.iter().enumerate() {
            walkers.assign(i, positions.row(k), &evaluation, k);
        }
        Ok(())
    }

    fn split(walkers: &Walkers, nchains: usize, nwalkers: usize) -> Vec<Walkers> {
        (0..nchains)
            .map(|i| walkers.select(i * nwalkers..(i + 1) * nwalkers))
            .collect()
    }

    /// Run batches until convergence or until `max_iterations` steps were taken.
    pub fn run(&mut self, options: &RunOptions) -> SamplerResult<RunOutcome> {
        options.validate()?;
        let mut count = 0;
        while count < options.max_iterations {
            let niterations = (options.max_iterations - count).min(options.check_every);
            count += niterations;
            if let Err(error) = self.run_batch(niterations) {
                self.state = RunState::Failed;
                return Err(error);
            }
            let mut converged = match &options.check {
                CheckOption::Enabled(criteria) => {
                    self.state = RunState::CheckingConvergence;
                    match self.check(criteria) {
                        Ok(converged) => converged,
                        Err(error) => {
                            self.state = RunState::Failed;
                            return Err(error);
                        }
                    }
                }
                CheckOption::Disabled => false,
            };
            if count < options.min_iterations {
                converged = false;
            }
            if converged {
                self.state = RunState::Converged;
                return Ok(RunOutcome::Converged);
            }
        }
        self.state = RunState::Exhausted;
        Ok(RunOutcome::Exhausted)
    }

    /// Advance every chain by `niterations` steps.
    fn run_batch(&mut self, niterations: usize) -> SamplerResult<()> {
        let walkers = self.start(None)?;
        self.state = RunState::RunningBatch;
        let tm = TaskManager::use_all_procs(self.world.clone(), self.nchains())?;

        let outcome = self.run_tasks(&tm, walkers, niterations);
        self.posterior.set_comm(self.world.clone());
        let failures: Vec<Option<String>> = self
            .world
            .allgather(&outcome.as_ref().err().map(ToString::to_string))?;
        let mine = outcome?;
        if let Some(failure) = failures.into_iter().flatten().next() {
            return Err(SamplerError::GroupFailed(failure));
        }

        for finished in &mine {
            if self.world.rank() != 0 {
                self.world.send(finished, 0, TAG_CHAIN)?;
            }
        }
        let calls = if self.world.is_root() {
            let mut local: IndexMap<usize, Finished> =
                mine.into_iter().map(|f| (f.task, f)).collect();
            let mut gathered = Vec::with_capacity(self.nchains());
            for task in 0..self.nchains() {
                let finished = match local.shift_remove(&task) {
                    Some(finished) => finished,
                    None => self.world.recv(tm.owner_of(task), TAG_CHAIN)?,
                };
                if finished.task != task {
                    return Err(SamplerError::Configuration(format!(
                        "received chain {} while expecting chain {}",
                        finished.task, task
                    )));
                }
                gathered.push(finished);
            }
            Some(self.store(gathered).map_err(|e| e.to_string()))
        } else {
            None
        };
        let (ncall, naccepted): (Vec<usize>, Vec<usize>) = bcast_outcome(&self.world, calls)?;
        self.diagnostics.record_calls(ncall, naccepted);
        self.nbatches += 1;
        Ok(())
    }

    /// Run the chains of this rank's process group.
    fn run_tasks(
        &mut self,
        tm: &TaskManager,
        walkers: Vec<Walkers>,
        niterations: usize,
    ) -> SamplerResult<Vec<Finished>> {
        let mut finished = vec![];
        let Some(group) = tm.group_comm() else {
            return Ok(finished);
        };
        self.posterior.set_comm(group.clone());
        for task in tm.my_tasks() {
            let mut rng = ChaCha8Rng::seed_from_u64(self.batch_seed());
            rng.set_stream(task as u64 + 1);
            let ncalls = self.posterior.ncalls();
            let (chain, naccepted) = self.run_chain(walkers[task].clone(), niterations, &mut rng)?;
            debug!(task, niterations, naccepted, "Finished chain");
            if tm.is_group_root() {
                finished.push(Finished {
                    task,
                    chain,
                    ncall: self.posterior.ncalls() - ncalls,
                    naccepted,
                });
            }
        }
        Ok(finished)
    }

    fn run_chain(
        &mut self,
        mut walkers: Walkers,
        niterations: usize,
        rng: &mut ChaCha8Rng,
    ) -> SamplerResult<(Chain, usize)> {
        let mut recorder = ChainRecorder::new(&self.posterior, self.fixed.clone(), walkers.nwalkers());
        let mut naccepted = 0;
        for _ in 0..niterations {
            naccepted += self.stepper.step(&mut self.posterior, &mut walkers, rng)?;
            recorder.push(&walkers);
        }
        Ok((recorder.finish()?, naccepted))
    }

    /// Append the finished chains on the root and save them.
    fn store(&mut self, gathered: Vec<Finished>) -> SamplerResult<(Vec<usize>, Vec<usize>)> {
        let mut ncall = Vec::with_capacity(gathered.len());
        let mut naccepted = Vec::with_capacity(gathered.len());
        for finished in gathered {
            let slot = &mut self.chains[finished.task];
            let mut chain = match slot.take() {
                Some(previous) => previous.concatenate(&finished.chain)?,
                None => finished.chain,
            };
            chain.set_attrs(self.attrs);
            *slot = Some(chain);
            ncall.push(finished.ncall);
            naccepted.push(finished.naccepted);
        }
        if let Some(paths) = &self.save_paths {
            for (chain, path) in self.chains.iter().zip(paths) {
                if let Some(chain) = chain {
                    chain.save(path)?;
                }
            }
        }
        info!(
            nchains = self.chains.len(),
            nsteps = self.chains.iter().flatten().map(Chain::nsteps).max().unwrap_or(0),
            ?ncall,
            ?naccepted,
            "Finished batch"
        );
        Ok((ncall, naccepted))
    }

    /// Run the convergence tests on the current chains.
    ///
    /// Computed on the root; the verdict and the diagnostics are shared with every rank.
    pub fn check(&mut self, criteria: &ConvergenceCriteria) -> SamplerResult<bool> {
        criteria.validate()?;
        let missing: bool = self.world.bcast(
            self.world
                .is_root()
                .then(|| self.chains.iter().any(Option::is_none)),
            0,
        )?;
        if missing {
            return Ok(false);
        }
        let outcome = if self.world.is_root() {
            let chains: Vec<Chain> = self.chains.iter().flatten().cloned().collect();
            let converged = convergence::check(&chains, criteria, &mut self.diagnostics);
            Some(
                converged
                    .map(|c| (c, self.diagnostics.clone()))
                    .map_err(|e| e.to_string()),
            )
        } else {
            None
        };
        let (converged, diagnostics) = bcast_outcome(&self.world, outcome)?;
        self.diagnostics = diagnostics;
        Ok(converged)
    }

    /// Release the pipeline.
    pub fn into_pipeline(self) -> Pipeline {
        self.posterior.into_pipeline()
    }
}
