//! The fuzzing phase: mutate tagged values inside stored traces and replay
//! every candidate in a supervised worker.

pub mod generator;
pub mod harness;
pub mod monitor;

use std::fs;
use std::path::PathBuf;

use crate::fuzzer::generator::Generator;
use crate::options::{FuzzMode, MorpherOptions};
use crate::trace::snapshot::Snapshot;
use crate::trace::tag::Tag;
use crate::trace::types::Primitive;
use crate::trace::value::CValue;
use crate::trace::Trace;
use crate::Error;

/// Replays one candidate trace and classifies the outcome.
///
/// [`monitor::Monitor`] is the production implementation; tests substitute
/// recording stubs.
pub trait TraceRunner {
    /// Announces the trace batch subsequent runs belong to.
    fn begin_batch(&mut self, _batch: usize) {}

    /// Replays one candidate trace synchronously.
    fn run(&mut self, trace: &Trace) -> Result<(), Error>;
}

/// The writes applied to one snapshot for a single replay.
type Step = Vec<(usize, CValue)>;

/// Drives mutation across every stored trace.
pub struct Fuzzer<'a, R> {
    options: &'a MorpherOptions,
    generator: Generator,
    runner: R,
}

impl<'a, R: TraceRunner> Fuzzer<'a, R> {
    /// Binds the fuzzer to its options and a trace runner.
    pub fn new(options: &'a MorpherOptions, runner: R) -> Self {
        Fuzzer {
            options,
            generator: Generator::new(options),
            runner,
        }
    }

    /// Fuzzes every stored trace file in index order.
    pub fn fuzz(&mut self) -> Result<(), Error> {
        if !self.options.fuzzer_enabled() {
            log::info!("fuzzing is off");
            return Ok(());
        }
        let files = trace_files(&self.options.trace_dir())?;
        if files.is_empty() {
            log::warn!("no trace files to fuzz");
            return Ok(());
        }
        for (batch, path) in files.iter().enumerate() {
            log::info!("loading trace file {}", path.display());
            let mut trace = match Trace::load(path) {
                Ok(trace) => trace,
                Err(e) => {
                    log::warn!("skipping unreadable trace {}: {e}", path.display());
                    continue;
                }
            };
            self.runner.begin_batch(batch);
            if let Err(e) = self.fuzz_trace(&mut trace) {
                log::warn!("fuzzing of {} aborted: {e}", path.display());
            }
        }
        log::info!("all traces fuzzed");
        Ok(())
    }

    /// Fuzzes one trace according to the two breadth knobs.
    ///
    /// Whatever the modes, memory is byte-identical to its entry state
    /// once the trace completes: every replay's writes are reverted before
    /// the next one is planned.
    pub fn fuzz_trace(&mut self, trace: &mut Trace) -> Result<(), Error> {
        let mut plans = Vec::with_capacity(trace.len());
        for snapshot in trace.snapshots() {
            plans.push(self.plan(snapshot)?);
        }

        match self.options.trace_mode {
            FuzzMode::Sequential => {
                for (index, plan) in plans.iter().enumerate() {
                    for step in plan {
                        self.run_once(trace, &[(index, step)])?;
                    }
                }
            }
            FuzzMode::Simultaneous => {
                let rounds = plans.iter().map(Vec::len).max().unwrap_or(0);
                for round in 0..rounds {
                    let writes: Vec<(usize, &Step)> = plans
                        .iter()
                        .enumerate()
                        .filter_map(|(index, plan)| plan.get(round).map(|step| (index, step)))
                        .collect();
                    self.run_once(trace, &writes)?;
                }
            }
        }
        Ok(())
    }

    /// Applies one set of writes, replays, and restores the originals.
    fn run_once(&mut self, trace: &mut Trace, writes: &[(usize, &Step)]) -> Result<(), Error> {
        let mut saved: Vec<(usize, usize, CValue)> = Vec::new();
        for (index, step) in writes {
            let memory = trace.snapshots_mut()[*index].memory_mut();
            for (addr, value) in step.iter() {
                let prim = value
                    .primitive()
                    .ok_or_else(|| Error::illegal_state("aggregate value in a mutation step"))?;
                saved.push((*index, *addr, memory.read_val(*addr, prim)?));
                memory.write_val(*addr, value)?;
            }
        }
        let result = self.runner.run(trace);
        // Restore in reverse so overlapping tags unwind correctly.
        for (index, addr, original) in saved.into_iter().rev() {
            trace.snapshots_mut()[index].memory_mut().write_val(addr, &original)?;
        }
        result
    }

    /// Builds the ordered mutation steps for one snapshot.
    fn plan(&self, snapshot: &Snapshot) -> Result<Vec<Step>, Error> {
        let mut tags: Vec<Tag> = snapshot.tags().iter().cloned().collect();
        tags.sort_by(|a, b| {
            (a.addr(), a.code().as_str()).cmp(&(b.addr(), b.code().as_str()))
        });

        let mut per_tag: Vec<(usize, Vec<CValue>)> = Vec::new();
        for tag in tags {
            let Some(prim) = tag.code().primitive() else {
                continue;
            };
            if prim == Primitive::Pointer && !self.options.fuzz_pointers {
                log::debug!("pointer fuzzing is off, skipping tag {tag}");
                continue;
            }
            let original = match snapshot.memory().read_val(tag.addr(), prim) {
                Ok(value) => value,
                Err(_) => {
                    // The covering block was never captured.
                    log::debug!("tag {tag} is unmaterializable, skipping");
                    continue;
                }
            };
            let candidates = self.generator.generate(prim, &original);
            if !candidates.is_empty() {
                per_tag.push((tag.addr(), candidates));
            }
        }

        let steps = match self.options.snapshot_mode {
            FuzzMode::Sequential => per_tag
                .into_iter()
                .flat_map(|(addr, candidates)| {
                    candidates.into_iter().map(move |v| vec![(addr, v)])
                })
                .collect(),
            FuzzMode::Simultaneous => {
                let rounds = per_tag.iter().map(|(_, c)| c.len()).max().unwrap_or(0);
                (0..rounds)
                    .map(|round| {
                        per_tag
                            .iter()
                            .filter_map(|(addr, candidates)| {
                                candidates.get(round).map(|v| (*addr, v.clone()))
                            })
                            .collect()
                    })
                    .collect()
            }
        };
        Ok(steps)
    }
}

/// The stored trace files in ascending index order.
fn trace_files(dir: &std::path::Path) -> Result<Vec<PathBuf>, Error> {
    let mut files: Vec<(usize, PathBuf)> = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            return Err(Error::file(
                e,
                format!("could not read trace directory {}", dir.display()),
            ))
        }
    };
    for entry in entries {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(index) = name
            .strip_prefix("trace-")
            .and_then(|rest| rest.strip_suffix(".bin"))
            .and_then(|digits| digits.parse::<usize>().ok())
        {
            files.push((index, path));
        }
    }
    files.sort_by_key(|(index, _)| *index);
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

#[cfg(test)]
mod tests {
    use hashbrown::HashMap;

    use super::{Fuzzer, TraceRunner};
    use crate::fuzzer::generator::Generator;
    use crate::options::{FuzzMode, MorpherOptions};
    use crate::trace::block::Block;
    use crate::trace::memory::Memory;
    use crate::trace::snapshot::Snapshot;
    use crate::trace::tag::Tag;
    use crate::trace::types::{Primitive, TypeCode, TypeManager};
    use crate::trace::value::CValue;
    use crate::trace::Trace;
    use crate::Error;

    /// Records the mutated value visible at a fixed address per replay.
    struct RecordingRunner {
        addr: usize,
        seen: Vec<CValue>,
    }

    impl TraceRunner for RecordingRunner {
        fn run(&mut self, trace: &Trace) -> Result<(), Error> {
            let value = trace.snapshots()[0]
                .memory()
                .read_val(self.addr, Primitive::Int32)
                .unwrap();
            self.seen.push(value);
            Ok(())
        }
    }

    fn int_trace(addr: usize, value: i32) -> Trace {
        let memory =
            Memory::new(vec![Block::new(addr, value.to_ne_bytes().to_vec()).unwrap()]).unwrap();
        let mut snap = Snapshot::new("f", memory);
        let types = TypeManager::from_usertypes(HashMap::new());
        snap.add_tag(Tag::new(addr, TypeCode::new("i").unwrap()), &types)
            .unwrap();
        snap.set_args(vec![Tag::new(addr, TypeCode::new("i").unwrap())]);
        Trace::new(vec![snap], types)
    }

    #[test]
    fn fuzz_and_restore_round_trip() {
        let addr = 0x1000;
        let original = 7777;
        let options = MorpherOptions {
            snapshot_mode: FuzzMode::Sequential,
            trace_mode: FuzzMode::Sequential,
            random: false,
            ..MorpherOptions::default()
        };
        let mut trace = int_trace(addr, original);

        let expected = Generator::new(&options)
            .generate(Primitive::Int32, &CValue::Int32(original))
            .len();

        let runner = RecordingRunner {
            addr,
            seen: Vec::new(),
        };
        let mut fuzzer = Fuzzer::new(&options, runner);
        fuzzer.fuzz_trace(&mut trace).unwrap();

        assert_eq!(fuzzer.runner.seen.len(), expected);
        // Every replay observed a mutated value, not the original.
        assert!(fuzzer.runner.seen.iter().all(|v| *v != CValue::Int32(original)));
        assert_eq!(
            trace.snapshots()[0]
                .memory()
                .read_val(addr, Primitive::Int32)
                .unwrap(),
            CValue::Int32(original)
        );
    }

    #[test]
    fn trace_files_are_fuzzed_in_index_order() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path();
        std::fs::create_dir_all(data.join("traces")).unwrap();
        for index in [10usize, 0, 2] {
            int_trace(0x1000, index as i32)
                .store(data.join("traces").join(format!("trace-{index}.bin")))
                .unwrap();
        }
        // Noise the loader must ignore.
        std::fs::write(data.join("traces").join("trace-x.bin"), b"junk").unwrap();

        struct BatchRunner {
            batches: Vec<usize>,
            runs: usize,
        }
        impl TraceRunner for BatchRunner {
            fn begin_batch(&mut self, batch: usize) {
                self.batches.push(batch);
            }
            fn run(&mut self, _trace: &Trace) -> Result<(), Error> {
                self.runs += 1;
                Ok(())
            }
        }

        let options = MorpherOptions {
            data: data.to_path_buf(),
            random: false,
            ..MorpherOptions::default()
        };
        let mut fuzzer = Fuzzer::new(
            &options,
            BatchRunner {
                batches: Vec::new(),
                runs: 0,
            },
        );
        fuzzer.fuzz().unwrap();
        assert_eq!(fuzzer.runner.batches, vec![0, 1, 2]);
        assert!(fuzzer.runner.runs > 0);
    }

    #[test]
    fn pointer_tags_are_skipped_when_disabled() {
        let addr = 0x2000;
        let options = MorpherOptions {
            fuzz_pointers: false,
            random: false,
            ..MorpherOptions::default()
        };
        let memory =
            Memory::new(vec![Block::new(addr, vec![0u8; core::mem::size_of::<usize>()]).unwrap()])
                .unwrap();
        let mut snap = Snapshot::new("f", memory);
        let types = TypeManager::from_usertypes(HashMap::new());
        snap.add_tag(Tag::new(addr, TypeCode::new("P").unwrap()), &types)
            .unwrap();
        let mut trace = Trace::new(vec![snap], types);

        struct CountingRunner(usize);
        impl TraceRunner for CountingRunner {
            fn run(&mut self, _trace: &Trace) -> Result<(), Error> {
                self.0 += 1;
                Ok(())
            }
        }
        let mut fuzzer = Fuzzer::new(&options, CountingRunner(0));
        fuzzer.fuzz_trace(&mut trace).unwrap();
        assert_eq!(fuzzer.runner.0, 0);
    }

    #[test]
    fn simultaneous_modes_restore_all_originals() {
        let options = MorpherOptions {
            snapshot_mode: FuzzMode::Simultaneous,
            trace_mode: FuzzMode::Simultaneous,
            random: false,
            ..MorpherOptions::default()
        };
        let memory = Memory::new(vec![
            Block::new(0x1000, 11_i32.to_ne_bytes().to_vec()).unwrap(),
            Block::new(0x2000, 22_i32.to_ne_bytes().to_vec()).unwrap(),
        ])
        .unwrap();
        let types = TypeManager::from_usertypes(HashMap::new());
        let mut snap = Snapshot::new("f", memory);
        snap.add_tag(Tag::new(0x1000, TypeCode::new("i").unwrap()), &types)
            .unwrap();
        snap.add_tag(Tag::new(0x2000, TypeCode::new("i").unwrap()), &types)
            .unwrap();
        let mut trace = Trace::new(vec![snap], types);

        struct NopRunner;
        impl TraceRunner for NopRunner {
            fn run(&mut self, _trace: &Trace) -> Result<(), Error> {
                Ok(())
            }
        }
        let mut fuzzer = Fuzzer::new(&options, NopRunner);
        fuzzer.fuzz_trace(&mut trace).unwrap();

        let memory = trace.snapshots()[0].memory();
        assert_eq!(
            memory.read_val(0x1000, Primitive::Int32).unwrap(),
            CValue::Int32(11)
        );
        assert_eq!(
            memory.read_val(0x2000, Primitive::Int32).unwrap(),
            CValue::Int32(22)
        );
    }
}
