//! Morpher is a mutational API fuzzer for native shared libraries that
//! export C-linkage functions.
//!
//! The engine works in two phases. The *collector* observes a host program
//! calling the target library under a debugger and captures, for every
//! exported call, a structurally complete snapshot of its arguments
//! including all pointer-reachable state. The *fuzzer* then replays the
//! captured traces in an isolated worker process, mutating one tagged
//! value at a time and classifying every run as success, hang, or crash.
//!
//! The debugger primitive itself is not part of this crate; the engine
//! consumes it through the [`dbg::Debugger`] trait.

pub mod collector;
pub mod dbg;
pub mod fuzzer;
pub mod model;
pub mod options;
pub mod timer;
pub mod trace;

mod error;

pub use error::Error;
