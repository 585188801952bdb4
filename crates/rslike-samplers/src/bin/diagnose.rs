//! Print the convergence diagnostics of saved chains.
//!
//! ```text
//! rslike-diagnose 'chains/chain_*.bin' --config criteria.toml --burnin 0.3
//! ```

use clap::Parser;
use rslike_samplers::chain::Chain;
use rslike_samplers::convergence::{check, Burnin, ConvergenceCriteria, Criterion, DiagnosticsHistory};
use rslike_samplers::{SamplerError, SamplerResult};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Saved chains; `*` stands for the chain index.
    pattern: String,

    /// TOML file of convergence criteria.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Burn-in, as a fraction of the chain length if below 1, else a number of steps.
    #[arg(long)]
    burnin: Option<f64>,

    /// Number of splits of each chain.
    #[arg(long)]
    nsplits: Option<usize>,
}

fn criteria(args: &Args) -> SamplerResult<ConvergenceCriteria> {
    let mut criteria = match &args.config {
        Some(path) => {
            let content = std::fs::read_to_string(path).map_err(|e| {
                SamplerError::Configuration(format!("Failed to read {}: {}", path.display(), e))
            })?;
            ConvergenceCriteria::from_toml(&content)?
        }
        None => ConvergenceCriteria::default(),
    };
    if let Some(burnin) = args.burnin {
        criteria.burnin = if burnin < 1.0 {
            Burnin::Fraction(burnin)
        } else {
            Burnin::Steps(burnin as usize)
        };
    }
    if let Some(nsplits) = args.nsplits {
        criteria.nsplits = nsplits;
    }
    Ok(criteria)
}

fn diagnose(args: &Args) -> SamplerResult<bool> {
    let criteria = criteria(args)?;
    let chains = Chain::load_pattern(&args.pattern)?;
    println!(
        "{} chain(s) of {} steps x {} walkers",
        chains.len(),
        chains.iter().map(Chain::nsteps).min().unwrap_or(0),
        chains.first().map_or(0, Chain::nwalkers)
    );

    let mut history = DiagnosticsHistory::new();
    let converged = check(&chains, &criteria, &mut history)?;
    for criterion in Criterion::ALL {
        if let Some(value) = history.values(criterion).last() {
            let test = match history.tests(criterion).last() {
                Some(true) => "pass",
                Some(false) => "fail",
                None => "-",
            };
            println!("{:<22} {:>12.5} {}", criterion.key(), value, test);
        }
    }
    println!("converged: {}", converged);
    Ok(converged)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    match diagnose(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(2)
        }
    }
}
