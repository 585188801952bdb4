//! Posterior sampling of [`rslike_core`] likelihood pipelines.
//!
//! [`sampler::BatchSampler`] runs several chains in batches, each chain on its own process
//! group, and stops once the [`convergence`] criteria are met. The stepping rule is
//! pluggable through [`stepper::Stepper`].

pub mod chain;
pub mod convergence;
pub mod diagnostics;
pub mod posterior;
pub mod sampler;
pub mod stepper;

pub mod errors;

pub use errors::{SamplerError, SamplerResult};
