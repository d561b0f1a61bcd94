//! Supervises one replay worker per candidate trace and classifies the
//! outcome as success, hang, or crash.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::dbg::{Debugger, EventHandler, Fault};
use crate::fuzzer::harness::{read_frame, send_frame};
use crate::fuzzer::TraceRunner;
use crate::options::{CallConvention, MorpherOptions};
use crate::timer::OneShot;
use crate::trace::Trace;
use crate::Error;

/// Per-trace replay controller.
///
/// Spawns the worker process, attaches the debugger to it, feeds it the
/// candidate trace, and persists artifacts for every crash and hang. On
/// construction, stale artifacts of earlier sessions are removed.
pub struct Monitor<'a, F> {
    options: &'a MorpherOptions,
    backend: F,
    crash_dir: PathBuf,
    hang_dir: PathBuf,
    batch: usize,
    iter: usize,
    timed_out: Arc<AtomicBool>,
}

impl<'a, F> Monitor<'a, F>
where
    F: FnMut() -> Result<Box<dyn Debugger>, Error>,
{
    /// Prepares the artifact directories and binds the debugger factory.
    pub fn new(options: &'a MorpherOptions, backend: F) -> Result<Self, Error> {
        let crash_dir = options.crash_dir();
        let hang_dir = options.hang_dir();
        clear_hang_artifacts(&hang_dir)?;
        clear_crash_artifacts(&crash_dir)?;
        Ok(Monitor {
            options,
            backend,
            crash_dir,
            hang_dir,
            batch: 0,
            iter: 0,
            timed_out: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Selects the trace batch artifacts are named after and resets the
    /// per-batch iteration counter.
    pub fn set_batch(&mut self, batch: usize) {
        self.batch = batch;
        self.iter = 0;
    }

    /// Replays one candidate trace in a fresh worker under the debugger.
    pub fn run(&mut self, trace: &Trace) -> Result<(), Error> {
        log::debug!("spawning replay worker for batch {} run {}", self.batch, self.iter);
        let mut child = self.spawn_worker()?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::illegal_state("worker has no stdin pipe"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::illegal_state("worker has no stdout pipe"))?;

        // Count ping frames off the worker's pipe; one arrives before each
        // call, so the counter names the snapshot a failure belongs to.
        let pings = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pings);
        let reader = std::thread::spawn(move || {
            let mut stdout = stdout;
            while read_frame::<u8, _>(&mut stdout).is_ok() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let mut dbg = (self.backend)()?;
        dbg.attach(child.id())?;

        log::debug!("sending trace to worker, batch {} run {}", self.batch, self.iter);
        send_frame(&mut stdin, trace)?;

        self.timed_out.store(false, Ordering::SeqCst);
        let timer = OneShot::arm(
            Duration::from_secs(self.options.fuzzer_timeout),
            Arc::clone(&self.timed_out),
        );
        let mut session = Session {
            trace,
            pings: pings.as_ref(),
            crash_dir: &self.crash_dir,
            hang_dir: &self.hang_dir,
            batch: self.batch,
            iter: self.iter,
            timed_out: self.timed_out.as_ref(),
        };
        let result = dbg.run(&mut session);
        timer.cancel();

        drop(stdin);
        let _ = reader.join();
        let _ = child.wait();
        result?;

        self.iter += 1;
        Ok(())
    }

    fn spawn_worker(&self) -> Result<Child, Error> {
        let worker = worker_binary(self.options);
        let dll_type = match self.options.dll_type {
            CallConvention::Cdecl => "cdecl",
            CallConvention::Stdcall => "stdcall",
        };
        Command::new(&worker)
            .arg("--target")
            .arg(&self.options.target)
            .arg("--dll-type")
            .arg(dll_type)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::file(e, format!("could not spawn replay worker {}", worker.display())))
    }
}

impl<F> TraceRunner for Monitor<'_, F>
where
    F: FnMut() -> Result<Box<dyn Debugger>, Error>,
{
    fn begin_batch(&mut self, batch: usize) {
        self.set_batch(batch);
    }

    fn run(&mut self, trace: &Trace) -> Result<(), Error> {
        Monitor::run(self, trace)
    }
}

/// Event handler state for one worker run.
struct Session<'m> {
    trace: &'m Trace,
    pings: &'m AtomicUsize,
    crash_dir: &'m Path,
    hang_dir: &'m Path,
    batch: usize,
    iter: usize,
    timed_out: &'m AtomicBool,
}

impl EventHandler for Session<'_> {
    fn access_violation(&mut self, dbg: &mut dyn Debugger, addr: usize) -> Result<Fault, Error> {
        log::info!("!!! registered a crash in the replay worker !!!");
        let dir = self.crash_dir.join(format!("address-{addr:#x}"));
        fs::create_dir_all(&dir)
            .map_err(|e| Error::file(e, format!("could not create crash bin {}", dir.display())))?;
        let synopsis = format!(
            "Access violation at {addr:#x} (instruction pointer {:#x})\n\n",
            dbg.instruction_pointer()
        );
        let reached = self.pings.load(Ordering::SeqCst);
        write_artifacts(&dir, self.batch, self.iter, Some(&synopsis), self.trace, reached)?;
        log::info!("terminating the replay worker");
        dbg.terminate()?;
        // Let the OS report the fault normally once we detach.
        Ok(Fault::NotHandled)
    }

    fn tick(&mut self, dbg: &mut dyn Debugger) -> Result<(), Error> {
        if self.timed_out.swap(false, Ordering::SeqCst) {
            log::info!("!!! replay worker timed out !!!");
            let reached = self.pings.load(Ordering::SeqCst);
            write_artifacts(self.hang_dir, self.batch, self.iter, None, self.trace, reached)?;
            log::info!("terminating the replay worker");
            dbg.terminate()?;
        }
        Ok(())
    }
}

/// Writes the text dump and the serialized trace for one failure.
///
/// The text file carries the optional crash synopsis plus a dump of every
/// snapshot the worker actually reached; the binary file holds the whole
/// trace so the failure can be reproduced.
fn write_artifacts(
    dir: &Path,
    batch: usize,
    iter: usize,
    synopsis: Option<&str>,
    trace: &Trace,
    reached: usize,
) -> Result<(), Error> {
    let stem = format!("trace-{batch}-run-{iter}");

    let mut text = String::new();
    if let Some(synopsis) = synopsis {
        text.push_str(synopsis);
    }
    let reached = reached.min(trace.len());
    for snapshot in &trace.snapshots()[..reached] {
        text.push_str(&snapshot.to_string());
        text.push('\n');
    }
    let txt_path = dir.join(format!("{stem}.txt"));
    fs::write(&txt_path, text)
        .map_err(|e| Error::file(e, format!("could not write {}", txt_path.display())))?;

    let bin_path = dir.join(format!("{stem}.bin"));
    fs::write(&bin_path, bincode::serialize(trace)?)
        .map_err(|e| Error::file(e, format!("could not write {}", bin_path.display())))?;
    log::info!("failure artifacts written under {}", dir.display());
    Ok(())
}

/// Locates the replay worker binary: the tools directory first, then next
/// to the running engine.
fn worker_binary(options: &MorpherOptions) -> PathBuf {
    let name = format!("morpher-harness{}", std::env::consts::EXE_SUFFIX);
    let tools = options.tools.join(&name);
    if tools.is_file() {
        return tools;
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&name)))
        .unwrap_or(tools)
}

/// Removes stale `trace-*` files, creating the directory if needed.
fn clear_hang_artifacts(dir: &Path) -> Result<(), Error> {
    if dir.is_dir() {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if entry.path().is_file()
                && name.starts_with("trace-")
                && (name.ends_with(".txt") || name.ends_with(".bin"))
            {
                fs::remove_file(entry.path())?;
            }
        }
    } else {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Removes stale `address-*` bins, creating the directory if needed.
fn clear_crash_artifacts(dir: &Path) -> Result<(), Error> {
    if dir.is_dir() {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if entry.path().is_dir() && name.starts_with("address-") {
                fs::remove_dir_all(entry.path())?;
            }
        }
    } else {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use hashbrown::HashMap;

    use super::{clear_crash_artifacts, clear_hang_artifacts, write_artifacts};
    use crate::trace::block::Block;
    use crate::trace::memory::Memory;
    use crate::trace::snapshot::Snapshot;
    use crate::trace::tag::Tag;
    use crate::trace::types::{TypeCode, TypeManager};
    use crate::trace::Trace;

    fn sample_trace() -> Trace {
        let memory =
            Memory::new(vec![Block::new(0x1000, 7_i32.to_ne_bytes().to_vec()).unwrap()]).unwrap();
        let mut snap = Snapshot::new("f", memory);
        snap.set_args(vec![Tag::new(0x1000, TypeCode::new("i").unwrap())]);
        Trace::new(
            vec![snap.clone(), snap],
            TypeManager::from_usertypes(HashMap::new()),
        )
    }

    #[test]
    fn artifacts_dump_only_reached_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let trace = sample_trace();
        write_artifacts(dir.path(), 3, 9, Some("synopsis\n"), &trace, 1).unwrap();

        let text = fs::read_to_string(dir.path().join("trace-3-run-9.txt")).unwrap();
        assert!(text.starts_with("synopsis\n"));
        assert_eq!(text.matches("Snapshot Contents:").count(), 1);

        let bytes = fs::read(dir.path().join("trace-3-run-9.bin")).unwrap();
        let reloaded: Trace = bincode::deserialize(&bytes).unwrap();
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn stale_artifacts_are_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let hang = dir.path().join("hangers");
        fs::create_dir_all(&hang).unwrap();
        fs::write(hang.join("trace-0-run-0.txt"), "stale").unwrap();
        fs::write(hang.join("keep.log"), "keep").unwrap();
        clear_hang_artifacts(&hang).unwrap();
        assert!(!hang.join("trace-0-run-0.txt").exists());
        assert!(hang.join("keep.log").exists());

        let crash = dir.path().join("crashers");
        fs::create_dir_all(crash.join("address-0x41414141")).unwrap();
        clear_crash_artifacts(&crash).unwrap();
        assert!(!crash.join("address-0x41414141").exists());
        assert!(crash.exists());
    }
}
