use rslike_core::errors::RslikeError;
use thiserror::Error;

/// Error type for sampling runs.
#[derive(Error, Debug)]
pub enum SamplerError {
    /// No starting point with a finite log-posterior was found.
    #[error("Could not find finite log posterior after {max_tries} tries")]
    StartFailed { max_tries: usize },
    #[error("Invalid sampler configuration: {0}")]
    Configuration(String),
    #[error("Chain persistence failed: {0}")]
    Persistence(String),
    /// Another process group of the run failed; every rank reports it.
    #[error("Sampling failed in another process group: {0}")]
    GroupFailed(String),
    #[error(transparent)]
    Core(#[from] RslikeError),
}

/// Convenience type for `Result<T, SamplerError>`.
pub type SamplerResult<T> = Result<T, SamplerError>;
