//! Captured call traces: blocks, memory images, tags, snapshots, and the
//! trace container that replays them in capture order.

pub mod block;
pub mod memory;
pub mod snapshot;
pub mod tag;
pub mod types;
pub mod value;

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::trace::snapshot::Snapshot;
use crate::trace::types::TypeManager;
use crate::trace::value::CValue;
use crate::Error;

/// An ordered sequence of snapshots sharing one type manager, so user type
/// ids mean the same thing in every snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Trace {
    snapshots: Vec<Snapshot>,
    types: TypeManager,
}

impl Trace {
    /// Bundles captured snapshots with the type manager they share.
    #[must_use]
    pub fn new(snapshots: Vec<Snapshot>, types: TypeManager) -> Self {
        Trace { snapshots, types }
    }

    /// Number of snapshots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether the trace holds no snapshots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// The snapshots in capture order.
    #[must_use]
    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    /// Mutable access to the snapshots, for the fuzzing loop.
    pub fn snapshots_mut(&mut self) -> &mut [Snapshot] {
        &mut self.snapshots
    }

    /// The shared type manager.
    #[must_use]
    pub fn types(&self) -> &TypeManager {
        &self.types
    }

    /// A lazy stream of `(function name, argument values)` pairs in
    /// snapshot order. Each snapshot is materialized when yielded.
    pub fn replay(&mut self) -> Replay<'_> {
        Replay {
            snapshots: self.snapshots.iter_mut(),
            types: &self.types,
        }
    }

    /// Serializes this trace to a file.
    pub fn store<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        let file = File::create(path)
            .map_err(|e| Error::file(e, format!("could not create trace file {}", path.display())))?;
        bincode::serialize_into(BufWriter::new(file), self)?;
        Ok(())
    }

    /// Loads a trace previously written by [`Trace::store`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| Error::file(e, format!("could not open trace file {}", path.display())))?;
        Ok(bincode::deserialize_from(BufReader::new(file))?)
    }
}

impl core::fmt::Display for Trace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "Trace contents:")?;
        for snapshot in &self.snapshots {
            writeln!(f)?;
            write!(f, "{snapshot}")?;
        }
        Ok(())
    }
}

/// Iterator returned by [`Trace::replay`].
pub struct Replay<'a> {
    snapshots: core::slice::IterMut<'a, Snapshot>,
    types: &'a TypeManager,
}

impl Iterator for Replay<'_> {
    type Item = Result<(String, Vec<CValue>), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let snapshot = self.snapshots.next()?;
        Some(snapshot.replay(self.types))
    }
}
