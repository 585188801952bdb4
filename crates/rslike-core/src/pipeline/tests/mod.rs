//! Tests for the pipeline module.
//!
//! These cover graph resolution, dirty tracking, batched evaluation across ranks
//! and analytic solving of parameters.

#[cfg(test)]
mod solve;
