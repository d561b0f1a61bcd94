//! Engine entry point: run the collection phase, then the fuzzing phase.

use std::fs::{self, File};

use clap::Parser;

use morpher::collector::Collector;
use morpher::dbg;
use morpher::fuzzer::{monitor::Monitor, Fuzzer};
use morpher::model::Model;
use morpher::options::MorpherOptions;
use morpher::Error;

fn main() {
    let options = MorpherOptions::parse();
    if let Err(e) = init_logging(&options) {
        eprintln!("could not set up logging: {e}");
        std::process::exit(1);
    }
    match run(&options) {
        Ok(()) => println!("Finished. Good bye."),
        Err(e) => {
            log::error!("{e}");
            eprintln!("morpher: {e}");
            std::process::exit(1);
        }
    }
}

/// Detailed diagnostics go to a log file; the console only carries the
/// short per-phase progress lines.
fn init_logging(options: &MorpherOptions) -> Result<(), Error> {
    fs::create_dir_all(&options.logs)
        .map_err(|e| Error::file(e, format!("could not create {}", options.logs.display())))?;
    let path = options.logs.join("morpher.log");
    let file = File::create(&path)
        .map_err(|e| Error::file(e, format!("could not create {}", path.display())))?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(file)))
        .init();
    Ok(())
}

fn run(options: &MorpherOptions) -> Result<(), Error> {
    let model = Model::from_file(options.model_path())?;
    log::info!(
        "model loaded: {} functions, {} user types",
        model.functions().len(),
        model.usertypes().len()
    );

    if options.collector_enabled() {
        println!("  Collector is running...");
        let mut collector = Collector::new(options, &model, dbg::default_backend);
        let written = collector.collect()?;
        println!("  Collector wrote {written} trace files.");
    } else {
        println!("  Collector DISABLED");
    }

    if options.fuzzer_enabled() {
        println!("  Fuzzer is running...");
        let monitor = Monitor::new(options, dbg::default_backend)?;
        let mut fuzzer = Fuzzer::new(options, monitor);
        fuzzer.fuzz()?;
        println!(
            "  Fuzzer finished. Findings are under {} and {}.",
            options.crash_dir().display(),
            options.hang_dir().display()
        );
    } else {
        println!("  Fuzzer DISABLED");
    }
    Ok(())
}
