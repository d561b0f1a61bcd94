//! The debugger primitive the engine consumes.
//!
//! The engine never manipulates a debuggee directly; everything it needs
//! is expressed through [`Debugger`] and the [`EventHandler`] callbacks
//! the debugger loop drives. A platform binding (ptrace, the Windows
//! debug API, ...) implements this trait outside the engine; tests drive
//! the engine with scripted implementations.

use std::path::{Path, PathBuf};

use crate::Error;

/// Details of a library-load event in the debuggee.
#[derive(Clone, Debug)]
pub struct LibraryEvent {
    /// Basename of the loaded library.
    pub name: String,
    /// Full path of the loaded library.
    pub path: PathBuf,
    /// Load base address.
    pub base: usize,
    /// Mapped size in bytes.
    pub size: usize,
}

/// What the handler decided about an observed fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// The fault was consumed; the debuggee may continue.
    Handled,
    /// The fault is passed back so the OS reports it normally.
    NotHandled,
}

/// Callbacks driven by [`Debugger::run`].
///
/// The tick callback fires at a cadence of at most ~100ms and is the only
/// place where terminating the debuggee is safe.
pub trait EventHandler {
    /// A library was mapped into the debuggee.
    fn library_loaded(
        &mut self,
        _dbg: &mut dyn Debugger,
        _lib: &LibraryEvent,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// A breakpoint fired; `description` is the opaque string it was set
    /// with.
    fn breakpoint(&mut self, _dbg: &mut dyn Debugger, _description: &str) -> Result<(), Error> {
        Ok(())
    }

    /// The debuggee faulted at `addr`.
    fn access_violation(&mut self, _dbg: &mut dyn Debugger, _addr: usize) -> Result<Fault, Error> {
        Ok(Fault::NotHandled)
    }

    /// Periodic callback while the debuggee runs.
    fn tick(&mut self, _dbg: &mut dyn Debugger) -> Result<(), Error> {
        Ok(())
    }
}

/// The debugger operations the engine relies on.
pub trait Debugger {
    /// Spawns a program under the debugger, suspended at entry.
    fn load(&mut self, exe: &Path, args: &str) -> Result<(), Error>;

    /// Attaches to a running process.
    fn attach(&mut self, pid: u32) -> Result<(), Error>;

    /// Pumps debug events until the debuggee exits or is terminated.
    fn run(&mut self, handler: &mut dyn EventHandler) -> Result<(), Error>;

    /// Kills the debuggee.
    fn terminate(&mut self) -> Result<(), Error>;

    /// Current instruction pointer of the stopped debuggee.
    fn instruction_pointer(&self) -> usize;

    /// Current stack pointer of the stopped debuggee.
    fn stack_pointer(&self) -> usize;

    /// Reads debuggee memory at an absolute address, failing cleanly on
    /// unmapped ranges.
    fn read_memory(&self, addr: usize, size: usize) -> Result<Vec<u8>, Error>;

    /// Resolves an exported function of a loaded library to its address.
    fn resolve(&self, library: &Path, name: &str) -> Result<usize, Error>;

    /// Sets a breakpoint carrying an opaque description string.
    fn set_breakpoint(&mut self, addr: usize, description: &str) -> Result<(), Error>;
}

/// The debugger backend linked into this build, if any.
///
/// The engine itself ships no platform binding; deployments provide one by
/// implementing [`Debugger`] and wiring it up here or by driving the
/// library API with their own factory.
pub fn default_backend() -> Result<Box<dyn Debugger>, Error> {
    Err(Error::unsupported(
        "no debugger backend is linked into this build; supply a dbg::Debugger implementation",
    ))
}
