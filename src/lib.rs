//! Composable likelihood pipelines and their posterior samplers.
//!
//! ```ignore
//! use rslike::rslike_core::example_calculators::IsotropicGaussian;
//! use rslike::rslike_core::pipeline::PipelineBuilder;
//! use rslike::rslike_samplers::sampler::{BatchSampler, RunOptions, SamplerOptions};
//! use rslike::rslike_samplers::stepper::EnsembleStepper;
//!
//! let mut builder = PipelineBuilder::new();
//! let likelihood = builder.add(IsotropicGaussian::new(vec![0.0, 1.0], 0.1));
//! let pipeline = builder.build(likelihood)?;
//! let mut sampler = BatchSampler::new(pipeline, EnsembleStepper::default(), SamplerOptions::default())?;
//! sampler.run(&RunOptions::default())?;
//! ```

pub use rslike_core;
pub use rslike_samplers;
