//! Trace capture: observe host programs calling the target library and
//! write one trace file per run.

pub mod func_recorder;
pub mod range_union;
pub mod snapshot_manager;
pub mod trace_recorder;

use std::fs;
use std::path::{Path, PathBuf};

use crate::collector::trace_recorder::TraceRecorder;
use crate::dbg::Debugger;
use crate::model::Model;
use crate::options::MorpherOptions;
use crate::Error;

/// The collection phase: run every host program on the collection list and
/// persist the captured traces under `<data>/traces/`.
pub struct Collector<'a, F> {
    options: &'a MorpherOptions,
    model: &'a Model,
    backend: F,
}

impl<'a, F> Collector<'a, F>
where
    F: FnMut() -> Result<Box<dyn Debugger>, Error>,
{
    /// Binds the collector to its model and a debugger factory; a fresh
    /// debugger is requested for every host run.
    pub fn new(options: &'a MorpherOptions, model: &'a Model, backend: F) -> Self {
        Collector {
            options,
            model,
            backend,
        }
    }

    /// Runs every line of the collection list. Returns the number of trace
    /// files written.
    pub fn collect(&mut self) -> Result<usize, Error> {
        if !self.options.collector_enabled() {
            log::info!("collection is off");
            return Ok(0);
        }
        let list_path = self
            .options
            .list
            .as_ref()
            .ok_or_else(|| Error::key_not_found("no collection list configured"))?;
        let trace_dir = self.options.trace_dir();
        clear_stale_traces(&trace_dir)?;

        let listing = fs::read_to_string(list_path)
            .map_err(|e| Error::file(e, format!("could not open collection list {}", list_path.display())))?;

        let mut recorder = TraceRecorder::new(self.options, self.model);
        let mut counter = 0;
        for line in listing.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((exe, args)) = parse_line(line) else {
                log::warn!("could not parse collection line: {line}");
                continue;
            };
            let mut dbg = (self.backend)()?;
            match recorder.record(dbg.as_mut(), &exe, &args) {
                Ok(Some(trace)) => {
                    let path = trace_dir.join(format!("trace-{counter}.bin"));
                    log::info!("writing trace file {}", path.display());
                    trace.store(&path)?;
                    counter += 1;
                }
                Ok(None) => {}
                Err(e) => log::warn!("collection run for {} failed: {e}", exe.display()),
            }
        }
        log::info!("collection complete, {counter} traces written");
        Ok(counter)
    }
}

/// Splits a collection line into the executable path and its argument
/// string. Tokens are accumulated until they name an existing file, so
/// paths containing spaces still resolve.
#[must_use]
pub fn parse_line(line: &str) -> Option<(PathBuf, String)> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let mut exe = String::new();
    for (i, token) in tokens.iter().enumerate() {
        if !exe.is_empty() {
            exe.push(' ');
        }
        exe.push_str(token);
        if Path::new(&exe).is_file() {
            return Some((PathBuf::from(&exe), tokens[i + 1..].join(" ")));
        }
    }
    None
}

/// Removes stale `trace-*.bin` files, creating the directory if needed.
fn clear_stale_traces(dir: &Path) -> Result<(), Error> {
    if dir.is_dir() {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if entry.path().is_file() && name.starts_with("trace-") && name.ends_with(".bin") {
                fs::remove_file(entry.path())?;
            }
        }
    } else {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}
