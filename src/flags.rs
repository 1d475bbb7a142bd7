use std::path::PathBuf;

use structopt::StructOpt;

/// Coverage-guided snapshot fuzzer for Linux x86/x86-64 ELF binaries
/// that read their input from stdin.
#[derive(StructOpt, Debug)]
#[structopt(name = "snapfuzz")]
pub struct Opts {
    /// Target ELF binary to fuzz.
    #[structopt(parse(from_os_str))]
    pub binary: PathBuf,

    /// Seed input file the generators start from.
    #[structopt(parse(from_os_str))]
    pub input: PathBuf,

    /// Harness workers, one supervised target process each.
    #[structopt(long, default_value = "4")]
    pub harness_workers: usize,

    /// Format-aware permutator threads.
    #[structopt(long, default_value = "4")]
    pub permutators: usize,

    /// Byte-level mutator threads.
    #[structopt(long, default_value = "3")]
    pub mutators: usize,

    /// Fixed RNG seed for the generators; defaults to OS entropy.
    #[structopt(long)]
    pub rng_seed: Option<u64>,

    /// Run targets to completion and scan stderr for AddressSanitizer
    /// reports instead of ptrace-snapshotting them.
    #[structopt(long)]
    pub stderr_oracle: bool,
}
