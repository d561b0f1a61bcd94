//! A scripted debugger double driving the capture pipeline in tests.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

use hashbrown::HashMap;

use morpher::dbg::{Debugger, EventHandler, LibraryEvent};
use morpher::Error;

/// One scripted debug event.
pub enum ScriptEvent {
    /// The debuggee mapped a library.
    Library {
        /// Basename of the library.
        name: String,
        /// Full path of the library.
        path: PathBuf,
    },
    /// A breakpoint address was hit.
    Breakpoint(usize),
    /// A periodic tick.
    Tick,
}

/// Scripted debugger backed by a sparse memory image.
#[derive(Default)]
pub struct ScriptedDebugger {
    regions: BTreeMap<usize, Vec<u8>>,
    exports: HashMap<String, usize>,
    breakpoints: HashMap<usize, String>,
    script: VecDeque<ScriptEvent>,
    sp: usize,
    ip: usize,
    terminated: bool,
}

impl ScriptedDebugger {
    pub fn new() -> Self {
        ScriptedDebugger::default()
    }

    /// Maps bytes at an absolute address of the fake debuggee.
    pub fn map(&mut self, addr: usize, data: Vec<u8>) {
        self.regions.insert(addr, data);
    }

    pub fn set_stack_pointer(&mut self, sp: usize) {
        self.sp = sp;
    }

    /// Declares an exported function of the fake target library.
    pub fn export<S: Into<String>>(&mut self, name: S, addr: usize) {
        self.exports.insert(name.into(), addr);
    }

    /// Appends an event for [`Debugger::run`] to deliver.
    pub fn script(&mut self, event: ScriptEvent) {
        self.script.push_back(event);
    }
}

impl Debugger for ScriptedDebugger {
    fn load(&mut self, _exe: &Path, _args: &str) -> Result<(), Error> {
        self.terminated = false;
        Ok(())
    }

    fn attach(&mut self, _pid: u32) -> Result<(), Error> {
        Ok(())
    }

    fn run(&mut self, handler: &mut dyn EventHandler) -> Result<(), Error> {
        while let Some(event) = self.script.pop_front() {
            if self.terminated {
                break;
            }
            match event {
                ScriptEvent::Library { name, path } => {
                    let lib = LibraryEvent {
                        name,
                        path,
                        base: 0x4000,
                        size: 0x1000,
                    };
                    handler.library_loaded(self, &lib)?;
                }
                ScriptEvent::Breakpoint(addr) => {
                    let Some(description) = self.breakpoints.get(&addr).cloned() else {
                        continue;
                    };
                    self.ip = addr;
                    handler.breakpoint(self, &description)?;
                }
                ScriptEvent::Tick => handler.tick(self)?,
            }
        }
        Ok(())
    }

    fn terminate(&mut self) -> Result<(), Error> {
        self.terminated = true;
        Ok(())
    }

    fn instruction_pointer(&self) -> usize {
        self.ip
    }

    fn stack_pointer(&self) -> usize {
        self.sp
    }

    fn read_memory(&self, addr: usize, size: usize) -> Result<Vec<u8>, Error> {
        let (base, data) = self
            .regions
            .range(..=addr)
            .next_back()
            .ok_or_else(|| Error::debugger(format!("unmapped read at {addr:#x}")))?;
        let offset = addr - base;
        if offset + size > data.len() {
            return Err(Error::debugger(format!(
                "unmapped read at {addr:#x} size {size}"
            )));
        }
        Ok(data[offset..offset + size].to_vec())
    }

    fn resolve(&self, _library: &Path, name: &str) -> Result<usize, Error> {
        self.exports
            .get(name)
            .copied()
            .ok_or_else(|| Error::debugger(format!("no export named {name}")))
    }

    fn set_breakpoint(&mut self, addr: usize, description: &str) -> Result<(), Error> {
        self.breakpoints.insert(addr, description.to_owned());
        Ok(())
    }
}
