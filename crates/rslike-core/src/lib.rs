//! Calculator graphs and batched likelihood evaluation.
//!
//! Theory calculators feed observables, observables feed likelihoods, and a [`pipeline::Pipeline`]
//! evaluates the resulting graph for tables of parameter values, spreading rows over a
//! process group described by a [`comm::Communicator`].

pub mod calculator;
pub mod comm;
pub mod differentiation;
pub mod example_calculators;
pub mod likelihood;
pub mod parameter;
pub mod pipeline;

pub mod errors;
