//! A collection of disjoint captured blocks addressed by virtual address.

use core::fmt;
use core::mem::size_of;
use std::collections::BTreeMap;

use hashbrown::HashSet;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::trace::block::Block;
use crate::trace::types::Primitive;
use crate::trace::value::CValue;
use crate::Error;

/// The captured memory image of one call.
///
/// Blocks are pairwise disjoint and never coalesced; a read or write is
/// valid only if it lies entirely inside a single block. The pointer set
/// records the addresses of pointer-typed objects so that [`Memory::patch`]
/// can rewrite their stored values to live in-process addresses after the
/// image has been deserialized.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Memory {
    #[serde(
        serialize_with = "serialize_blocks",
        deserialize_with = "deserialize_blocks"
    )]
    blocks: BTreeMap<usize, Block>,
    pointers: HashSet<usize>,
    #[serde(skip)]
    patched: bool,
}

// The on-disk form is the plain list of blocks, position independent.
fn serialize_blocks<S: Serializer>(
    blocks: &BTreeMap<usize, Block>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(blocks.values())
}

fn deserialize_blocks<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<usize, Block>, D::Error> {
    let blocks = Vec::<Block>::deserialize(deserializer)?;
    Ok(blocks.into_iter().map(|b| (b.addr(), b)).collect())
}

impl Memory {
    /// Builds a memory image from captured blocks.
    ///
    /// The blocks must be pairwise non-overlapping.
    pub fn new(blocks: Vec<Block>) -> Result<Self, Error> {
        let mut map = BTreeMap::new();
        for block in blocks {
            let addr = block.addr();
            if map.insert(addr, block).is_some() {
                return Err(Error::illegal_argument(format!(
                    "blocks overlap at {addr:#x}"
                )));
            }
        }
        let mut end = 0usize;
        let mut first = true;
        for block in map.values() {
            if !first && block.addr() < end {
                return Err(Error::illegal_argument(format!(
                    "blocks overlap at {:#x}",
                    block.addr()
                )));
            }
            end = block.addr() + block.size();
            first = false;
        }
        Ok(Memory {
            blocks: map,
            pointers: HashSet::new(),
            patched: false,
        })
    }

    fn find_block(&self, addr: usize, size: usize) -> Option<&Block> {
        self.blocks
            .range(..=addr)
            .next_back()
            .map(|(_, b)| b)
            .filter(|b| b.contains(addr, size))
    }

    fn find_block_mut(&mut self, addr: usize, size: usize) -> Option<&mut Block> {
        self.blocks
            .range_mut(..=addr)
            .next_back()
            .map(|(_, b)| b)
            .filter(|b| b.contains(addr, size))
    }

    /// Whether `[addr, addr + size)` lies inside a single block.
    #[must_use]
    pub fn contains_address(&self, addr: usize, size: usize) -> bool {
        self.find_block(addr, size).is_some()
    }

    /// Reads raw bytes at a virtual address.
    pub fn read(&self, addr: usize, size: usize) -> Result<&[u8], Error> {
        self.find_block(addr, size)
            .ok_or_else(|| Error::invalid_range(addr, size))?
            .read(addr, size)
    }

    /// Reads and decodes one primitive value at a virtual address.
    pub fn read_val(&self, addr: usize, prim: Primitive) -> Result<CValue, Error> {
        self.find_block(addr, prim.size())
            .ok_or_else(|| Error::invalid_range(addr, prim.size()))?
            .read_val(addr, prim)
    }

    /// Overwrites raw bytes at a virtual address.
    pub fn write(&mut self, addr: usize, bytes: &[u8]) -> Result<(), Error> {
        self.find_block_mut(addr, bytes.len())
            .ok_or_else(|| Error::invalid_range(addr, bytes.len()))?
            .write(addr, bytes)
    }

    /// Encodes and writes one primitive value at a virtual address.
    pub fn write_val(&mut self, addr: usize, value: &CValue) -> Result<(), Error> {
        let size = value
            .primitive()
            .ok_or_else(|| Error::illegal_argument("only primitive values can be written"))?
            .size();
        self.find_block_mut(addr, size)
            .ok_or_else(|| Error::invalid_range(addr, size))?
            .write_val(addr, value)
    }

    /// Registers the address of a pointer-typed object for patching.
    pub fn register_pointer(&mut self, addr: usize) -> Result<(), Error> {
        if !self.contains_address(addr, size_of::<usize>()) {
            return Err(Error::invalid_range(addr, size_of::<usize>()));
        }
        self.pointers.insert(addr);
        Ok(())
    }

    /// Removes a pointer address from the patch set.
    pub fn unregister_pointer(&mut self, addr: usize) {
        self.pointers.remove(&addr);
    }

    /// The registered pointer addresses.
    #[must_use]
    pub fn pointers(&self) -> &HashSet<usize> {
        &self.pointers
    }

    /// Rewrites every registered pointer whose target lies inside this
    /// image to the real in-process address of that target.
    ///
    /// Pointers to memory this image does not cover (null, kernel space,
    /// anything not captured) are left untouched. Must be called at most
    /// once per materialized image; the translated values would be
    /// translated again otherwise.
    pub fn patch(&mut self) -> Result<(), Error> {
        if self.patched {
            return Err(Error::illegal_state("memory image is already patched"));
        }
        let addrs: Vec<usize> = self.pointers.iter().copied().collect();
        for addr in addrs {
            let stored = match self.read(addr, size_of::<usize>()) {
                Ok(bytes) => usize::from_ne_bytes(bytes.try_into().unwrap()),
                Err(_) => {
                    log::warn!("registered pointer at {addr:#x} is outside captured memory");
                    continue;
                }
            };
            let real = match self.find_block(stored, 1) {
                Some(block) => block.translate(stored),
                None => continue,
            };
            self.write(addr, &real.to_ne_bytes())?;
        }
        self.patched = true;
        Ok(())
    }

    /// Whether [`Memory::patch`] has already run on this image.
    #[must_use]
    pub fn is_patched(&self) -> bool {
        self.patched
    }

    /// The blocks in ascending address order.
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }
}

impl fmt::Display for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Contents of Memory:")?;
        write!(f, "Pointers: ")?;
        for p in &self.pointers {
            write!(f, "{p:#x}  ")?;
        }
        writeln!(f)?;
        for block in self.blocks.values() {
            writeln!(f, "{block}")?;
        }
        Ok(())
    }
}
