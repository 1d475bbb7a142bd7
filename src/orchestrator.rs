//! Wires the producer/consumer topology together and owns the crash
//! sink.
//!
//! Thread layout: N permutators (run their permutation set and exit),
//! M pool mutators and one feedback mutator (run forever), K harness
//! workers (run until reset exhaustion), and the main thread parked on
//! the crash channel. Every thread is an OS thread, which is what the
//! harness workers need: their ptrace calls are only valid from the
//! thread that spawned the tracee.

use std::fs;
use std::thread;

use crossbeam_channel::Receiver;

use crate::errors::{FuzzerError, Result};
use crate::flags::Opts;
use crate::harness::{self, HarnessWorker, StderrOracleWorker};
use crate::kernel_abi;
use crate::mutator::{FeedbackWorker, MutatorWorker};
use crate::permutator;
use crate::pipeline::Pipeline;
use crate::test_case::TestCase;

pub fn run(opts: &Opts) -> Result<()> {
    let arch = kernel_abi::detect_arch(&opts.binary)?;
    let seed = fs::read(&opts.input).map_err(FuzzerError::SeedInput)?;
    log::info!(
        "fuzzing {} ({:?}) from a {}-byte seed",
        opts.binary.display(),
        arch,
        seed.len()
    );

    let pipeline = Pipeline::new();

    for id in 0..opts.permutators {
        let to_harness = pipeline.to_harness_tx.clone();
        let to_mutator = pipeline.to_mutator_tx.clone();
        let path = opts.input.clone();
        let rng_seed = opts.rng_seed;
        thread::spawn(move || {
            let mut p =
                match permutator::create_permutator(to_harness, to_mutator, &path, rng_seed, id as u64)
                {
                    Ok(p) => p,
                    Err(err) => {
                        log::error!("permutator {}: {}", id, err);
                        return;
                    }
                };
            if let Err(err) = p.permutate_input(&path) {
                log::error!("permutator {}: {}", id, err);
            } else {
                log::debug!("permutator {}: done", id);
            }
        });
    }

    for id in 0..opts.mutators {
        let worker = MutatorWorker::new(
            id,
            opts.rng_seed,
            seed.clone(),
            pipeline.to_mutator_rx.clone(),
            pipeline.to_harness_tx.clone(),
            pipeline.to_mutator_tx.clone(),
        );
        thread::spawn(move || worker.run());
    }

    let feedback = FeedbackWorker::new(
        opts.rng_seed,
        pipeline.interesting_rx.clone(),
        pipeline.to_harness_tx.clone(),
    );
    thread::spawn(move || feedback.run());

    for id in 0..opts.harness_workers {
        if opts.stderr_oracle {
            let worker = StderrOracleWorker::new(
                id,
                opts.binary.clone(),
                pipeline.to_harness_rx.clone(),
                pipeline.crash_tx.clone(),
            );
            thread::spawn(move || worker.run());
        } else {
            let worker = HarnessWorker::new(
                id,
                opts.binary.clone(),
                arch,
                pipeline.to_harness_rx.clone(),
                pipeline.interesting_tx.clone(),
                pipeline.crash_tx.clone(),
            );
            thread::spawn(move || worker.run());
        }
    }

    crash_sink(&pipeline.crash_rx)
}

/// Single consumer of the crash channel. The first crash that reaches
/// disk ends the program; a failed write logs the offending bytes and
/// keeps the sink alive for the next report.
fn crash_sink(crashes: &Receiver<TestCase>) -> Result<()> {
    loop {
        let case = match crashes.recv() {
            Ok(case) => case,
            Err(_) => {
                log::info!("all crash producers are gone, exiting");
                return Ok(());
            }
        };
        match harness::crash_report(&case) {
            Ok(()) => {
                log::info!(
                    "crash captured: {} bytes written to {}",
                    case.input.len(),
                    harness::CRASH_FILE
                );
                return Ok(());
            }
            Err(err) => {
                log::error!("{}; crashing input follows", err);
                log::error!("{}", case);
            }
        }
    }
}
