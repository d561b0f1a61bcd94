//! Walks a stopped callee's stack according to the type model and tags
//! every reachable object exactly once.

use core::mem::size_of;

use crate::collector::snapshot_manager::SnapshotManager;
use crate::dbg::Debugger;
use crate::model::{Composite, FunctionModel, Model};
use crate::trace::snapshot::Snapshot;
use crate::trace::types::{align_up, TypeCode, TypeManager};
use crate::Error;

/// Captures one call at a function-entry breakpoint.
#[derive(Debug)]
pub struct FuncRecorder<'a> {
    model: &'a Model,
    types: &'a TypeManager,
    stack_align: usize,
}

impl<'a> FuncRecorder<'a> {
    /// Binds the recorder to a model and its type manager.
    #[must_use]
    pub fn new(model: &'a Model, types: &'a TypeManager, stack_align: usize) -> Self {
        FuncRecorder {
            model,
            types,
            stack_align,
        }
    }

    /// Captures the call currently stopped at its entry breakpoint.
    pub fn record(&self, dbg: &mut dyn Debugger, func_name: &str) -> Result<Snapshot, Error> {
        // Skip the return address the call pushed.
        let start = dbg.stack_pointer() + size_of::<usize>();
        let func = self
            .model
            .function(func_name)
            .ok_or_else(|| Error::key_not_found(format!("function {func_name} not in model")))?;
        log::debug!("recording call of {func_name}, arguments at {start:#x}");
        let mut sm = SnapshotManager::new(func_name);
        self.tag_args(dbg, &mut sm, start, func)?;
        sm.snapshot(dbg, self.types)
    }

    /// Tags the positional arguments. Arguments are aligned only to the
    /// stack slot size, not to their natural alignment.
    fn tag_args(
        &self,
        dbg: &dyn Debugger,
        sm: &mut SnapshotManager,
        start: usize,
        func: &FunctionModel,
    ) -> Result<(), Error> {
        let mut cur = start;
        for param in &func.params {
            let (size, _) = self.types.info(param)?;
            cur = align_up(cur, self.stack_align);
            self.tag(dbg, sm, cur, param)?;
            sm.add_arg(cur, param.top_level());
            cur += size;
        }
        Ok(())
    }

    /// Tags the object at `addr` and recursively tags member objects and
    /// pointees.
    ///
    /// Recursion terminates through two independent checks: user types are
    /// deduplicated by `(addr, code)`, and a pointer is only followed when
    /// its target is readable in the debuggee.
    fn tag(
        &self,
        dbg: &dyn Debugger,
        sm: &mut SnapshotManager,
        addr: usize,
        code: &TypeCode,
    ) -> Result<(), Error> {
        if code.is_user() {
            if sm.check_object(addr, code) {
                return Ok(());
            }
            let (size, _) = self.types.info(code)?;
            sm.add_object(addr, size, code.clone());
            let user = self
                .model
                .usertypes()
                .get(code.as_str())
                .ok_or_else(|| Error::unknown_type(code.as_str()))?;
            match user.kind {
                Composite::Struct => {
                    // Members are internally aligned even when the struct's
                    // own stack address is not.
                    let mut offset = 0;
                    for field in &user.fields {
                        let (fsize, falign) = self.types.info(field)?;
                        offset = align_up(offset, falign);
                        self.tag(dbg, sm, addr + offset, field)?;
                        offset += fsize;
                    }
                }
                Composite::Union => {
                    for field in &user.fields {
                        self.tag(dbg, sm, addr, field)?;
                    }
                }
            }
            return Ok(());
        }

        let leading = code.top_level();
        let prim = leading
            .primitive()
            .ok_or_else(|| Error::illegal_argument(format!("invalid type code {code}")))?;
        if !sm.check_object(addr, &leading) {
            sm.add_object(addr, prim.size(), leading);
        }

        // Follow a typed pointer even when its slot is already tagged: a
        // second sighting may carry a different pointee type. Bare `P` is
        // opaque and never followed.
        if let Some(pointee) = code.pointee() {
            let raw = match dbg.read_memory(addr, size_of::<usize>()) {
                Ok(raw) => raw,
                // Unreadable slot: the argument itself is unrecoverable.
                Err(_) => return Ok(()),
            };
            let Ok(bytes) = <[u8; size_of::<usize>()]>::try_from(raw.as_slice()) else {
                return Ok(());
            };
            let paddr = usize::from_ne_bytes(bytes);
            let (psize, _) = self.types.info(&pointee)?;
            if dbg.read_memory(paddr, psize.max(1)).is_err() {
                log::debug!("pointer at {addr:#x} targets unreadable memory {paddr:#x}");
                return Ok(());
            }
            self.tag(dbg, sm, paddr, &pointee)?;
        }
        Ok(())
    }
}
