//! The replay worker process spawned by the monitor.
//!
//! Stdio layout: the trace arrives on stdin, ping frames leave through the
//! descriptor stdout pointed at before redirection, and diagnostics go to
//! the saved stderr. The target library only ever sees the null device.

use std::io::Write;

use clap::Parser;

use morpher::fuzzer::harness;
use morpher::options::MorpherOptions;
use morpher::Error;

fn main() {
    let options = MorpherOptions::parse();
    if let Err(e) = run(&options) {
        log::error!("replay worker failed: {e}");
        std::process::exit(1);
    }
}

fn run(options: &MorpherOptions) -> Result<(), Error> {
    let mut stdin = std::io::stdin().lock();
    match harness::silence_target_output() {
        Ok((mut ping, diag)) => {
            init_logging(Box::new(diag));
            harness::run_worker(options, &mut stdin, &mut ping)
        }
        Err(e) => {
            init_logging(Box::new(std::io::stderr()));
            log::warn!("could not silence target output: {e}");
            harness::run_worker(options, &mut stdin, &mut std::io::stdout())
        }
    }
}

fn init_logging(sink: Box<dyn Write + Send>) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(sink))
        .init();
}
