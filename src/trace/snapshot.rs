//! One captured function call, with enough state to replay it.

use core::fmt;

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};

use crate::model::Composite;
use crate::trace::memory::Memory;
use crate::trace::tag::Tag;
use crate::trace::types::{align_up, TypeDesc, TypeManager};
use crate::trace::value::CValue;
use crate::Error;

/// A captured call: the memory image, the ordered argument tags, and the
/// unordered tags of every other object reached during capture.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    func: String,
    memory: Memory,
    args: Vec<Tag>,
    tags: HashSet<Tag>,
}

impl Snapshot {
    /// Wraps a captured memory image for the named function.
    #[must_use]
    pub fn new<S: Into<String>>(func: S, memory: Memory) -> Self {
        Snapshot {
            func: func.into(),
            memory,
            args: Vec::new(),
            tags: HashSet::new(),
        }
    }

    /// The captured function's exported name.
    #[must_use]
    pub fn func(&self) -> &str {
        &self.func
    }

    /// The memory image.
    #[must_use]
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// The memory image, for mutation between replays.
    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    /// The ordered argument tags.
    #[must_use]
    pub fn args(&self) -> &[Tag] {
        &self.args
    }

    /// The tags of all captured objects.
    #[must_use]
    pub fn tags(&self) -> &HashSet<Tag> {
        &self.tags
    }

    /// Registers a tag after checking that its footprint lies inside the
    /// memory image. A bare pointer tag also registers its address for the
    /// patch pass.
    pub fn add_tag(&mut self, tag: Tag, types: &TypeManager) -> Result<(), Error> {
        let (size, _) = types.info(tag.code())?;
        if !self.memory.contains_address(tag.addr(), size) {
            return Err(Error::invalid_range(tag.addr(), size));
        }
        if tag.code().as_str() == "P" {
            self.memory.register_pointer(tag.addr())?;
        }
        self.tags.insert(tag);
        Ok(())
    }

    /// Registers a tag without validating its footprint.
    ///
    /// Used for tags whose covering block could not be captured; they stay
    /// on record but cannot be materialized or fuzzed.
    pub fn keep_tag(&mut self, tag: Tag) {
        self.tags.insert(tag);
    }

    /// Removes a tag, dropping pointer registration along with it.
    pub fn remove_tag(&mut self, tag: &Tag) {
        if self.tags.remove(tag) && tag.code().as_str() == "P" {
            self.memory.unregister_pointer(tag.addr());
        }
    }

    /// Stores the ordered argument tags.
    pub fn set_args(&mut self, args: Vec<Tag>) {
        self.args = args;
    }

    /// Materializes the call: patches the memory image (once) and loads
    /// each argument in positional order.
    pub fn replay(&mut self, types: &TypeManager) -> Result<(String, Vec<CValue>), Error> {
        if !self.memory.is_patched() {
            self.memory.patch()?;
        }
        let mut values = Vec::with_capacity(self.args.len());
        for tag in &self.args {
            let desc = types.descriptor(tag.code())?;
            values.push(load_object(&self.memory, tag.addr(), &desc)?);
        }
        Ok((self.func.clone(), values))
    }
}

/// Loads one typed object from the image.
///
/// Structs walk their fields at naturally aligned offsets; unions load only
/// their largest field, which covers every captured byte of the union.
fn load_object(memory: &Memory, addr: usize, desc: &TypeDesc) -> Result<CValue, Error> {
    match desc {
        TypeDesc::Prim(prim) => memory.read_val(addr, *prim),
        TypeDesc::User {
            kind: Composite::Struct,
            fields,
        } => {
            let mut offset = 0;
            let mut values = Vec::with_capacity(fields.len());
            for field in fields {
                let (size, align) = field.layout();
                offset = align_up(offset, align);
                values.push(load_object(memory, addr + offset, field)?);
                offset += size;
            }
            Ok(CValue::Struct(values))
        }
        TypeDesc::User {
            kind: Composite::Union,
            fields,
        } => {
            let largest = fields
                .iter()
                .max_by_key(|f| f.layout().0)
                .ok_or_else(|| Error::illegal_argument("union type with no fields"))?;
            Ok(CValue::Union(Box::new(load_object(memory, addr, largest)?)))
        }
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Snapshot Contents:")?;
        writeln!(f, "Function: {}", self.func)?;
        if self.args.is_empty() {
            writeln!(f, "Arguments not specified")?;
        } else {
            write!(f, "Argument Tags: ")?;
            for tag in &self.args {
                write!(f, "{tag}   ")?;
            }
            writeln!(f)?;
            write!(f, "Arguments: ")?;
            for tag in &self.args {
                match tag.code().primitive() {
                    Some(prim) => match self.memory.read_val(tag.addr(), prim) {
                        Ok(value) => write!(f, "{value} ")?,
                        Err(_) => write!(f, "(unprintable) ")?,
                    },
                    None => write!(f, "UserType({}) ", tag.code())?,
                }
            }
            writeln!(f)?;
        }
        write!(f, "Tags: ")?;
        for tag in &self.tags {
            write!(f, "{tag}   ")?;
        }
        writeln!(f)?;
        write!(f, "{}", self.memory)
    }
}
