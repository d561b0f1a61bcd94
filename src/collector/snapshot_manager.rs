//! Accumulates tags and cover ranges during one call capture, then reads
//! the covered memory out of the debuggee and builds the snapshot.

use hashbrown::HashSet;

use crate::collector::range_union::RangeUnion;
use crate::dbg::Debugger;
use crate::trace::block::Block;
use crate::trace::memory::Memory;
use crate::trace::snapshot::Snapshot;
use crate::trace::tag::Tag;
use crate::trace::types::{TypeCode, TypeManager};
use crate::Error;

/// Per-capture accumulator: the ordered argument tags, the set of every
/// object tag, and the minimal cover of all tagged bytes.
#[derive(Debug)]
pub struct SnapshotManager {
    func: String,
    ranges: RangeUnion,
    tags: HashSet<Tag>,
    args: Vec<Tag>,
}

impl SnapshotManager {
    /// Starts a capture for the named function.
    #[must_use]
    pub fn new<S: Into<String>>(func: S) -> Self {
        SnapshotManager {
            func: func.into(),
            ranges: RangeUnion::new(),
            tags: HashSet::new(),
            args: Vec::new(),
        }
    }

    /// Appends one positional argument tag.
    pub fn add_arg(&mut self, addr: usize, code: TypeCode) {
        self.args.push(Tag::new(addr, code));
    }

    /// Whether `(addr, code)` is already tagged.
    #[must_use]
    pub fn check_object(&self, addr: usize, code: &TypeCode) -> bool {
        self.tags.contains(&Tag::new(addr, code.clone()))
    }

    /// Tags an object and adds its footprint to the cover.
    pub fn add_object(&mut self, addr: usize, size: usize, code: TypeCode) {
        log::trace!("tagging {addr:#x} as {code}, {size} bytes");
        self.tags.insert(Tag::new(addr, code));
        if size > 0 {
            self.ranges.add(addr, addr + size - 1);
        }
    }

    /// Reads every covered range from the debuggee and assembles the
    /// snapshot. Unreadable ranges are logged and dropped; their tags stay
    /// on record but cannot be materialized.
    pub fn snapshot(self, dbg: &dyn Debugger, types: &TypeManager) -> Result<Snapshot, Error> {
        let mut blocks = Vec::with_capacity(self.ranges.len());
        for (lo, hi) in self.ranges.iter() {
            let size = hi - lo + 1;
            match dbg.read_memory(lo, size) {
                Ok(data) => blocks.push(Block::new(lo, data)?),
                Err(e) => {
                    log::warn!(
                        "could not capture range {lo:#x}..{hi:#x} for {}: {e}",
                        self.func
                    );
                }
            }
        }
        let mut snap = Snapshot::new(self.func, Memory::new(blocks)?);
        for tag in self.tags {
            if tag.code().is_user() {
                continue;
            }
            match snap.add_tag(tag.clone(), types) {
                Ok(()) => {}
                Err(Error::InvalidRange { .. }) => snap.keep_tag(tag),
                Err(e) => return Err(e),
            }
        }
        snap.set_args(self.args);
        Ok(snap)
    }
}

#[cfg(test)]
mod tests {
    use hashbrown::HashMap;

    use super::SnapshotManager;
    use crate::collector::testutil::ImageDebugger;
    use crate::trace::types::{TypeCode, TypeManager};

    #[test]
    fn covered_ranges_become_blocks() {
        let mut dbg = ImageDebugger::new();
        dbg.map(0x1000, vec![1, 2, 3, 4]);
        dbg.map(0x2000, vec![9, 9]);

        let mut sm = SnapshotManager::new("f");
        sm.add_object(0x1000, 4, TypeCode::new("i").unwrap());
        sm.add_object(0x2000, 2, TypeCode::new("h").unwrap());
        sm.add_arg(0x1000, TypeCode::new("i").unwrap());

        let types = TypeManager::from_usertypes(HashMap::new());
        let snap = sm.snapshot(&dbg, &types).unwrap();
        assert_eq!(snap.memory().read(0x1000, 4).unwrap(), &[1, 2, 3, 4]);
        assert_eq!(snap.memory().read(0x2000, 2).unwrap(), &[9, 9]);
        assert_eq!(snap.args().len(), 1);
        assert_eq!(snap.tags().len(), 2);
    }

    #[test]
    fn unreadable_range_is_dropped_but_tag_kept() {
        let mut dbg = ImageDebugger::new();
        dbg.map(0x1000, vec![1, 2, 3, 4]);

        let mut sm = SnapshotManager::new("f");
        sm.add_object(0x1000, 4, TypeCode::new("i").unwrap());
        // Not mapped in the debuggee; the read will fail.
        sm.add_object(0x9000, 4, TypeCode::new("I").unwrap());

        let types = TypeManager::from_usertypes(HashMap::new());
        let snap = sm.snapshot(&dbg, &types).unwrap();
        assert!(snap.memory().read(0x9000, 4).is_err());
        assert_eq!(snap.tags().len(), 2);
    }

    #[test]
    fn user_type_tags_are_not_attached() {
        let mut dbg = ImageDebugger::new();
        dbg.map(0x1000, vec![0; 8]);

        let mut sm = SnapshotManager::new("f");
        sm.add_object(0x1000, 8, TypeCode::new("7").unwrap());
        sm.add_object(0x1000, 4, TypeCode::new("i").unwrap());
        assert!(sm.check_object(0x1000, &TypeCode::new("7").unwrap()));

        let types = TypeManager::from_usertypes(HashMap::new());
        let snap = sm.snapshot(&dbg, &types).unwrap();
        assert_eq!(snap.tags().len(), 1);
        assert!(snap
            .tags()
            .iter()
            .all(|t| t.code().as_str() == "i"));
    }
}
