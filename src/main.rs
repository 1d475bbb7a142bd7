mod errors;
mod flags;
mod harness;
mod kernel_abi;
mod mutator;
mod orchestrator;
mod permutator;
mod pipeline;
mod snapshot;
mod test_case;
mod trace;

use structopt::StructOpt;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opts = flags::Opts::from_args();
    if let Err(err) = orchestrator::run(&opts) {
        log::error!("{}", err);
        std::process::exit(1);
    }
}
