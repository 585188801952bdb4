//! A pipeline is the dependency graph of a root calculator and the engine that evaluates it.
//!
//! Calculators declare the calculators they require when initialised.
//! The pipeline resolves the transitive closure of the root's requirements (shared
//! requirements appear once), orders it so that requirements are calculated before their
//! dependents, and tracks which calculators are dirty so that only those are recalculated.
//!
//! Points are evaluated one at a time with [`Pipeline::calculate`] or in batches spread
//! over a process group with [`Pipeline::mpicalculate`].
//! Varied parameters marked `.best` or `.marg` are not sampled but solved for analytically
//! at each point, which requires a Gaussian likelihood at the root.

mod builder;
mod runtime;
mod solve;
mod types;
mod validation;

#[cfg(test)]
mod tests;

// Public re-exports
pub use builder::PipelineBuilder;
pub use runtime::Pipeline;
pub use types::{BatchResult, CGraph, RowError, RowOutcome, SolverOptions, LOGPRIOR};
