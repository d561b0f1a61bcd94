//! Orchestrates one host-program execution: breakpoints on every model
//! function, per-function copy limits, and a wall-clock budget.

use std::mem;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;

use crate::collector::func_recorder::FuncRecorder;
use crate::dbg::{Debugger, EventHandler, LibraryEvent};
use crate::model::Model;
use crate::options::MorpherOptions;
use crate::timer::OneShot;
use crate::trace::types::TypeManager;
use crate::trace::{snapshot::Snapshot, Trace};
use crate::Error;

/// Records the calls one host program makes into the target library.
#[derive(Debug)]
pub struct TraceRecorder<'a> {
    options: &'a MorpherOptions,
    model: &'a Model,
    types: TypeManager,
    counts: HashMap<String, usize>,
    snapshots: Vec<Snapshot>,
    timed_out: Arc<AtomicBool>,
}

impl<'a> TraceRecorder<'a> {
    /// Binds the recorder to the model of the target library.
    #[must_use]
    pub fn new(options: &'a MorpherOptions, model: &'a Model) -> Self {
        TraceRecorder {
            options,
            model,
            types: TypeManager::new(model),
            counts: HashMap::new(),
            snapshots: Vec::new(),
            timed_out: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Runs one host program under the debugger and captures a trace of
    /// its calls into the target library.
    ///
    /// Returns `None` when the run produced no snapshots. Timeouts are
    /// soft: the host is killed and the partial trace is kept.
    pub fn record(
        &mut self,
        dbg: &mut dyn Debugger,
        exe: &Path,
        args: &str,
    ) -> Result<Option<Trace>, Error> {
        log::info!("running collection line: exe {} args {args}", exe.display());
        self.snapshots.clear();
        if !self.options.global_limit {
            self.counts.clear();
        }

        dbg.load(exe, args)?;
        self.timed_out.store(false, Ordering::SeqCst);
        let timer = OneShot::arm(
            Duration::from_secs(self.options.collector_timeout),
            Arc::clone(&self.timed_out),
        );
        let result = dbg.run(self);
        timer.cancel();
        result?;

        if self.snapshots.is_empty() {
            log::warn!("run of {} captured no snapshots", exe.display());
            return Ok(None);
        }
        log::info!("captured {} snapshots", self.snapshots.len());
        Ok(Some(Trace::new(
            mem::take(&mut self.snapshots),
            self.types.clone(),
        )))
    }
}

impl EventHandler for TraceRecorder<'_> {
    fn library_loaded(&mut self, dbg: &mut dyn Debugger, lib: &LibraryEvent) -> Result<(), Error> {
        log::debug!(
            "caught load of {} from {} at {:#x}, size {}",
            lib.name,
            lib.path.display(),
            lib.base,
            lib.size
        );
        let target_name = self.options.target.file_name();
        if target_name != Some(std::ffi::OsStr::new(lib.name.as_str())) {
            return Ok(());
        }
        log::info!("setting breakpoints for library {}", lib.name);
        for func in self.model.functions() {
            // A symbol the binary does not export means the model and the
            // binary disagree; that is fatal for the run.
            let addr = dbg.resolve(&self.options.target, &func.name)?;
            if let Err(e) = dbg.set_breakpoint(addr, &func.name) {
                log::warn!("could not set breakpoint on {}: {e}", func.name);
                continue;
            }
            log::debug!("breakpoint on {} at {addr:#x}", func.name);
            self.counts.entry(func.name.clone()).or_insert(0);
        }
        Ok(())
    }

    fn breakpoint(&mut self, dbg: &mut dyn Debugger, description: &str) -> Result<(), Error> {
        let name = description.to_owned();
        let count = self.counts.get(&name).copied().unwrap_or(0);
        if count >= self.options.copy_limit {
            log::debug!("copy limit reached for {name}, skipping capture");
            return Ok(());
        }
        let captured = {
            let recorder = FuncRecorder::new(self.model, &self.types, self.options.stack_align);
            recorder.record(dbg, &name)
        };
        match captured {
            Ok(snapshot) => {
                self.snapshots.push(snapshot);
                *self.counts.entry(name).or_insert(0) += 1;
            }
            Err(e) => log::warn!("capture of {name} failed: {e}"),
        }
        Ok(())
    }

    fn tick(&mut self, dbg: &mut dyn Debugger) -> Result<(), Error> {
        if self.timed_out.swap(false, Ordering::SeqCst) {
            log::info!("collection timed out, terminating host");
            dbg.terminate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::TraceRecorder;
    use crate::collector::testutil::{ImageDebugger, ScriptEvent};
    use crate::model::Model;
    use crate::options::MorpherOptions;
    use crate::trace::value::CValue;

    const MODEL: &str = r#"<dll>
  <function name="poke"><param type="i"/></function>
</dll>"#;

    fn options() -> MorpherOptions {
        MorpherOptions {
            target: PathBuf::from("/lib/target.so"),
            copy_limit: 2,
            ..MorpherOptions::default()
        }
    }

    fn debugger_with_calls(hits: usize) -> ImageDebugger {
        let word = core::mem::size_of::<usize>();
        let sp = 0x7000;
        let mut dbg = ImageDebugger::new();
        dbg.set_stack_pointer(sp);
        let mut stack = vec![0u8; 4 * word];
        stack[word..word + 4].copy_from_slice(&77_i32.to_ne_bytes());
        dbg.map(sp, stack);
        dbg.export("poke", 0x4010);
        dbg.script(ScriptEvent::Library {
            name: "target.so".into(),
            path: "/lib/target.so".into(),
        });
        for _ in 0..hits {
            dbg.script(ScriptEvent::Breakpoint(0x4010));
        }
        dbg
    }

    #[test]
    fn captures_until_the_copy_limit() {
        let options = options();
        let model = Model::from_reader(MODEL.as_bytes()).unwrap();
        let mut recorder = TraceRecorder::new(&options, &model);
        let mut dbg = debugger_with_calls(5);

        let trace = recorder
            .record(&mut dbg, &PathBuf::from("/bin/host"), "")
            .unwrap()
            .unwrap();
        assert_eq!(trace.len(), 2);

        let mut trace = trace;
        for call in trace.replay() {
            let (name, args) = call.unwrap();
            assert_eq!(name, "poke");
            assert_eq!(args, vec![CValue::Int32(77)]);
        }
    }

    #[test]
    fn empty_run_yields_no_trace() {
        let options = options();
        let model = Model::from_reader(MODEL.as_bytes()).unwrap();
        let mut recorder = TraceRecorder::new(&options, &model);
        let mut dbg = ImageDebugger::new();

        let trace = recorder
            .record(&mut dbg, &PathBuf::from("/bin/host"), "")
            .unwrap();
        assert!(trace.is_none());
    }

    #[test]
    fn unrelated_library_sets_no_breakpoints() {
        let options = options();
        let model = Model::from_reader(MODEL.as_bytes()).unwrap();
        let mut recorder = TraceRecorder::new(&options, &model);

        let mut dbg = ImageDebugger::new();
        dbg.script(ScriptEvent::Library {
            name: "other.so".into(),
            path: "/lib/other.so".into(),
        });
        let trace = recorder
            .record(&mut dbg, &PathBuf::from("/bin/host"), "")
            .unwrap();
        assert!(trace.is_none());
        assert!(dbg.breakpoints().is_empty());
    }

    #[test]
    fn missing_export_is_fatal() {
        let options = options();
        let model = Model::from_reader(MODEL.as_bytes()).unwrap();
        let mut recorder = TraceRecorder::new(&options, &model);

        let mut dbg = ImageDebugger::new();
        dbg.script(ScriptEvent::Library {
            name: "target.so".into(),
            path: "/lib/target.so".into(),
        });
        let result = recorder.record(&mut dbg, &PathBuf::from("/bin/host"), "");
        assert!(result.is_err());
    }
}
