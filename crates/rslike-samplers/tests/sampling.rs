//! End-to-end runs of the batch sampler on toy likelihoods.
//!
//! These tests cover:
//! - resuming from chains saved by a previous run
//! - identical chains whatever the number of processes
//! - failures to start and uncaught calculator errors
//! - convergence on a Gaussian posterior

use approx::assert_relative_eq;
use rslike_core::comm::{Comm, LocalComm};
use rslike_core::errors::{ErrorKind, RslikeError};
use rslike_core::example_calculators::{Faulty, IsotropicGaussian, Square};
use rslike_core::parameter::ParameterPrior;
use rslike_core::pipeline::{Pipeline, PipelineBuilder};
use rslike_samplers::chain::Chain;
use rslike_samplers::convergence::{CheckOption, ConvergenceCriteria};
use rslike_samplers::sampler::{BatchSampler, RunOptions, RunOutcome, RunState, SamplerOptions, SaveFn};
use rslike_samplers::stepper::EnsembleStepper;
use rslike_samplers::SamplerError;

fn square(comm: Option<Comm>) -> Pipeline {
    let mut builder = PipelineBuilder::new();
    let square = builder.add(Square);
    if let Some(comm) = comm {
        builder.with_comm(comm);
    }
    builder.build(square).unwrap()
}

fn unchecked(max_iterations: usize, check_every: usize) -> RunOptions {
    RunOptions {
        max_iterations,
        check_every,
        check: CheckOption::Disabled,
        ..Default::default()
    }
}

fn sample_square(comm: Option<Comm>, seed: u64) -> Vec<Option<Chain>> {
    let options = SamplerOptions {
        seed: Some(seed),
        chains: Some(2),
        ..Default::default()
    };
    let mut sampler = BatchSampler::new(square(comm), EnsembleStepper::default(), options).unwrap();
    assert_eq!(sampler.run(&unchecked(30, 10)).unwrap(), RunOutcome::Exhausted);
    sampler.chains().to_vec()
}

mod persistence {
    use super::*;

    #[test]
    fn test_resume_from_saved_chains() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("chain_*.bin").to_str().unwrap().to_string();

        let options = SamplerOptions {
            seed: Some(1),
            chains: Some(2),
            save_fn: Some(SaveFn::Template(template.clone())),
            ..Default::default()
        };
        let mut sampler = BatchSampler::new(square(None), EnsembleStepper::default(), options).unwrap();
        sampler.run(&unchecked(20, 10)).unwrap();
        let saved = Chain::load_pattern(&template).unwrap();
        assert_eq!(saved.len(), 2);
        for (saved, chain) in saved.iter().zip(sampler.chains()) {
            assert_eq!(Some(saved), chain.as_ref());
            assert_eq!(saved.nsteps(), 20);
        }

        let options = SamplerOptions {
            seed: Some(2),
            resume: Some(template.clone()),
            save_fn: Some(SaveFn::Template(template.clone())),
            ..Default::default()
        };
        let mut resumed = BatchSampler::new(square(None), EnsembleStepper::default(), options).unwrap();
        assert_eq!(resumed.nchains(), 2);
        resumed.run(&unchecked(10, 10)).unwrap();

        for (previous, chain) in saved.iter().zip(resumed.chains()) {
            let chain = chain.as_ref().unwrap();
            assert_eq!(chain.nsteps(), 30);
            assert_eq!(chain.slice_steps(0, 20).get("x"), previous.get("x"));
            assert_eq!(chain.attrs(), previous.attrs());
        }
        // The saved files follow the run
        for chain in Chain::load_pattern(&template).unwrap() {
            assert_eq!(chain.nsteps(), 30);
        }
    }

    #[test]
    fn test_resume_in_memory() {
        let chains: Vec<Chain> = sample_square(None, 5).into_iter().flatten().collect();
        let mut sampler = BatchSampler::resume(
            square(None),
            EnsembleStepper::default(),
            SamplerOptions::default(),
            chains.clone(),
        )
        .unwrap();
        // Restarting from the last sample reproduces it exactly
        let walkers = sampler.start(None).unwrap();
        for (walkers, chain) in walkers.iter().zip(&chains) {
            assert_eq!(Some(walkers.positions.clone()), chain.last_positions());
        }
    }

    #[test]
    fn test_resume_requires_matching_parameters() {
        let chains: Vec<Chain> = sample_square(None, 5).into_iter().flatten().collect();
        let mut builder = PipelineBuilder::new();
        let gaussian = builder.add(IsotropicGaussian::new(vec![0.0], 1.0));
        let pipeline = builder.build(gaussian).unwrap();
        assert!(matches!(
            BatchSampler::resume(pipeline, EnsembleStepper::default(), SamplerOptions::default(), chains),
            Err(SamplerError::Configuration(_))
        ));
    }

    #[test]
    fn test_save_paths_must_match_chains() {
        let options = SamplerOptions {
            chains: Some(3),
            save_fn: Some(SaveFn::Paths(vec!["a.bin".into(), "b.bin".into()])),
            ..Default::default()
        };
        assert!(matches!(
            BatchSampler::new(square(None), EnsembleStepper::default(), options),
            Err(SamplerError::Configuration(_))
        ));
    }
}

mod parallel {
    use super::*;

    #[test]
    fn test_same_chains_on_any_number_of_processes() {
        let serial = sample_square(None, 3);
        for size in [2, 3, 5] {
            let results = LocalComm::run(size, |comm| {
                let is_root = comm.rank() == 0;
                (is_root, sample_square(Some(comm), 3))
            });
            for (is_root, chains) in results {
                if is_root {
                    assert_eq!(chains, serial, "{} processes", size);
                } else {
                    assert!(chains.iter().all(Option::is_none));
                }
            }
        }
    }

    #[test]
    fn test_calls_are_shared_with_every_rank() {
        let results = LocalComm::run(3, |comm| {
            let options = SamplerOptions {
                seed: Some(11),
                chains: Some(2),
                ..Default::default()
            };
            let mut sampler = BatchSampler::new(square(Some(comm)), EnsembleStepper::default(), options).unwrap();
            sampler.run(&unchecked(20, 10)).unwrap();
            (sampler.diagnostics().ncall().to_vec(), sampler.diagnostics().naccepted().to_vec())
        });
        for (ncall, naccepted) in &results {
            assert_eq!(ncall, &results[0].0);
            assert_eq!(naccepted, &results[0].1);
            assert_eq!(ncall.len(), 2);
            for (ncall, naccepted) in ncall.iter().zip(naccepted) {
                assert_eq!(ncall.len(), 2);
                for (&n, &a) in ncall.iter().zip(naccepted) {
                    assert!(a <= n);
                    assert!(n <= 10 * 4);
                }
            }
        }
    }
}

mod failures {
    use super::*;

    #[test]
    fn test_start_fails_outside_prior() {
        let mut builder = PipelineBuilder::new();
        let gaussian = builder.add(IsotropicGaussian::new(vec![0.0], 1.0));
        let mut pipeline = builder.build(gaussian).unwrap();
        let x0 = pipeline.params().get("x0").unwrap().clone();
        pipeline
            .update_param(x0.with_reference(ParameterPrior::normal(1000.0, 1.0).unwrap()))
            .unwrap();

        let options = SamplerOptions {
            seed: Some(0),
            max_tries: 5,
            ..Default::default()
        };
        let mut sampler = BatchSampler::new(pipeline, EnsembleStepper::default(), options).unwrap();
        assert!(matches!(
            sampler.run(&unchecked(10, 10)),
            Err(SamplerError::StartFailed { max_tries: 5 })
        ));
        assert_eq!(sampler.state(), RunState::Failed);
    }

    #[test]
    fn test_run_options_are_validated() {
        let mut sampler =
            BatchSampler::new(square(None), EnsembleStepper::default(), SamplerOptions::default()).unwrap();
        assert!(matches!(
            sampler.run(&unchecked(10, 0)),
            Err(SamplerError::Configuration(_))
        ));
        assert_eq!(sampler.state(), RunState::AwaitingStart);
    }

    fn faulty(comm: Comm, kind: ErrorKind) -> Pipeline {
        let mut builder = PipelineBuilder::new();
        let faulty = builder.add(Faulty::new(0.5, kind));
        builder.with_comm(comm);
        let mut pipeline = builder.build(faulty).unwrap();
        let x = pipeline.params().get("x").unwrap().clone();
        pipeline
            .update_param(x.with_reference(ParameterPrior::normal(-1.0, 0.1).unwrap()))
            .unwrap();
        pipeline
    }

    #[test]
    fn test_uncaught_error_fails_every_rank() {
        let results = LocalComm::run(3, |comm| {
            let options = SamplerOptions {
                seed: Some(4),
                chains: Some(2),
                ..Default::default()
            };
            let mut sampler =
                BatchSampler::new(faulty(comm, ErrorKind::Other), EnsembleStepper::default(), options).unwrap();
            let outcome = sampler.run(&unchecked(200, 100));
            (outcome, sampler.state())
        });
        for (outcome, state) in results {
            assert!(matches!(
                outcome,
                Err(SamplerError::Core(RslikeError::Pipeline { .. })) | Err(SamplerError::GroupFailed(_))
            ));
            assert_eq!(state, RunState::Failed);
        }
    }

    #[test]
    fn test_caught_errors_reject_proposals() {
        let results = LocalComm::run(2, |comm| {
            let options = SamplerOptions {
                seed: Some(4),
                chains: Some(1),
                ..Default::default()
            };
            let mut sampler =
                BatchSampler::new(faulty(comm, ErrorKind::InvalidPoint), EnsembleStepper::default(), options)
                    .unwrap();
            sampler.run(&unchecked(200, 100)).unwrap();
            sampler.chains().to_vec()
        });
        let chain = results[0][0].as_ref().unwrap();
        assert_eq!(chain.nsteps(), 200);
        assert!(chain.get("x").unwrap().iter().all(|&x| x <= 0.5));
    }
}

mod convergence {
    use super::*;

    #[test]
    fn test_gaussian_converges() {
        let mut builder = PipelineBuilder::new();
        let gaussian = builder.add(IsotropicGaussian::new(vec![1.0, -2.0], 0.5));
        let pipeline = builder.build(gaussian).unwrap();

        let options = SamplerOptions {
            seed: Some(7),
            chains: Some(4),
            ..Default::default()
        };
        let mut sampler = BatchSampler::new(pipeline, EnsembleStepper::default(), options).unwrap();
        let run = RunOptions {
            max_iterations: 6000,
            check_every: 300,
            check: CheckOption::Enabled(ConvergenceCriteria {
                max_eigen_gr: Some(0.1),
                quiet: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(sampler.run(&run).unwrap(), RunOutcome::Converged);
        assert_eq!(sampler.state(), RunState::Converged);
        assert!(sampler.diagnostics().tests(rslike_samplers::convergence::Criterion::EigenGr).len() >= 2);

        for chain in sampler.chains() {
            let chain = chain.as_ref().unwrap();
            let burnt = chain.slice_steps(chain.nsteps() / 2, chain.nsteps());
            assert_relative_eq!(burnt.mean("x0").unwrap(), 1.0, epsilon = 0.15);
            assert_relative_eq!(burnt.mean("x1").unwrap(), -2.0, epsilon = 0.15);
        }
    }

    #[test]
    fn test_min_iterations_delays_convergence() {
        let options = SamplerOptions {
            seed: Some(9),
            chains: Some(2),
            ..Default::default()
        };
        let mut sampler = BatchSampler::new(square(None), EnsembleStepper::default(), options).unwrap();
        let run = RunOptions {
            min_iterations: 200,
            max_iterations: 200,
            check_every: 50,
            check: CheckOption::Enabled(ConvergenceCriteria {
                max_eigen_gr: None,
                quiet: true,
                ..Default::default()
            }),
        };
        // Without bounds every check passes, but not before 200 iterations
        assert_eq!(sampler.run(&run).unwrap(), RunOutcome::Converged);
        assert_eq!(sampler.chains()[0].as_ref().unwrap().nsteps(), 200);
    }
}
