//! Type codes and the manager that maps them to concrete layouts.
//!
//! A type code is a compact string describing one value: a single primitive
//! letter, a decimal id referencing a user-defined aggregate, or `P<code>`
//! for a pointer to the type named by the suffix (`P` alone is an opaque
//! pointer that is never dereferenced).

use core::cell::RefCell;
use core::fmt;
use core::mem::{align_of, size_of};
use std::os::raw::{c_char, c_int, c_long, c_longlong, c_short, c_uint, c_ulong, c_ulonglong};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::model::{Composite, Model, UserType};
use crate::Error;

/// One of the fourteen primitive value kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Primitive {
    /// `c`: a C character.
    Char,
    /// `b`: signed 8-bit.
    Int8,
    /// `B`: unsigned 8-bit.
    UInt8,
    /// `h`: signed 16-bit.
    Int16,
    /// `H`: unsigned 16-bit.
    UInt16,
    /// `i`: C `int`.
    Int32,
    /// `I`: C `unsigned int`.
    UInt32,
    /// `l`: C `long`.
    Long,
    /// `L`: C `unsigned long`.
    ULong,
    /// `q`: signed 64-bit.
    Int64,
    /// `Q`: unsigned 64-bit.
    UInt64,
    /// `f`: single-precision float.
    Float,
    /// `d`: double-precision float.
    Double,
    /// `P`: a pointer-sized opaque value.
    Pointer,
}

impl Primitive {
    /// Maps a code letter to its primitive, if it is one.
    #[must_use]
    pub fn from_code(code: char) -> Option<Self> {
        Some(match code {
            'c' => Primitive::Char,
            'b' => Primitive::Int8,
            'B' => Primitive::UInt8,
            'h' => Primitive::Int16,
            'H' => Primitive::UInt16,
            'i' => Primitive::Int32,
            'I' => Primitive::UInt32,
            'l' => Primitive::Long,
            'L' => Primitive::ULong,
            'q' => Primitive::Int64,
            'Q' => Primitive::UInt64,
            'f' => Primitive::Float,
            'd' => Primitive::Double,
            'P' => Primitive::Pointer,
            _ => return None,
        })
    }

    /// The code letter of this primitive.
    #[must_use]
    pub fn code(&self) -> char {
        match self {
            Primitive::Char => 'c',
            Primitive::Int8 => 'b',
            Primitive::UInt8 => 'B',
            Primitive::Int16 => 'h',
            Primitive::UInt16 => 'H',
            Primitive::Int32 => 'i',
            Primitive::UInt32 => 'I',
            Primitive::Long => 'l',
            Primitive::ULong => 'L',
            Primitive::Int64 => 'q',
            Primitive::UInt64 => 'Q',
            Primitive::Float => 'f',
            Primitive::Double => 'd',
            Primitive::Pointer => 'P',
        }
    }

    /// Size in bytes on the host ABI.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Primitive::Char => size_of::<c_char>(),
            Primitive::Int8 | Primitive::UInt8 => size_of::<u8>(),
            Primitive::Int16 => size_of::<c_short>(),
            Primitive::UInt16 => size_of::<u16>(),
            Primitive::Int32 => size_of::<c_int>(),
            Primitive::UInt32 => size_of::<c_uint>(),
            Primitive::Long => size_of::<c_long>(),
            Primitive::ULong => size_of::<c_ulong>(),
            Primitive::Int64 => size_of::<c_longlong>(),
            Primitive::UInt64 => size_of::<c_ulonglong>(),
            Primitive::Float => size_of::<f32>(),
            Primitive::Double => size_of::<f64>(),
            Primitive::Pointer => size_of::<usize>(),
        }
    }

    /// Alignment in bytes on the host ABI.
    #[must_use]
    pub fn align(&self) -> usize {
        match self {
            Primitive::Char => align_of::<c_char>(),
            Primitive::Int8 | Primitive::UInt8 => align_of::<u8>(),
            Primitive::Int16 => align_of::<c_short>(),
            Primitive::UInt16 => align_of::<u16>(),
            Primitive::Int32 => align_of::<c_int>(),
            Primitive::UInt32 => align_of::<c_uint>(),
            Primitive::Long => align_of::<c_long>(),
            Primitive::ULong => align_of::<c_ulong>(),
            Primitive::Int64 => align_of::<c_longlong>(),
            Primitive::UInt64 => align_of::<c_ulonglong>(),
            Primitive::Float => align_of::<f32>(),
            Primitive::Double => align_of::<f64>(),
            Primitive::Pointer => align_of::<usize>(),
        }
    }
}

/// A validated type code string.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeCode(String);

impl TypeCode {
    /// Validates and wraps a code string.
    pub fn new(code: &str) -> Result<Self, Error> {
        if code.is_empty() {
            return Err(Error::illegal_argument("empty type code"));
        }
        if code.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(TypeCode(code.to_owned()));
        }
        let mut chars = code.chars();
        let head = chars.next().unwrap();
        let tail = chars.as_str();
        match Primitive::from_code(head) {
            Some(Primitive::Pointer) => {
                if !tail.is_empty() {
                    TypeCode::new(tail)?;
                }
                Ok(TypeCode(code.to_owned()))
            }
            Some(_) if tail.is_empty() => Ok(TypeCode(code.to_owned())),
            _ => Err(Error::illegal_argument(format!("invalid type code {code}"))),
        }
    }

    /// The code string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this code names a user-defined type.
    #[must_use]
    pub fn is_user(&self) -> bool {
        self.0.bytes().all(|b| b.is_ascii_digit())
    }

    /// The type this pointer points at, if it is a typed pointer.
    #[must_use]
    pub fn pointee(&self) -> Option<TypeCode> {
        if self.0.len() > 1 && self.0.starts_with('P') {
            Some(TypeCode(self.0[1..].to_owned()))
        } else {
            None
        }
    }

    /// The primitive a non-user code stores (pointers store `P`).
    #[must_use]
    pub fn primitive(&self) -> Option<Primitive> {
        if self.is_user() {
            None
        } else {
            Primitive::from_code(self.0.chars().next()?)
        }
    }

    /// The code an argument of this type is recorded under: the full code
    /// for user types, the leading primitive letter otherwise.
    #[must_use]
    pub fn top_level(&self) -> TypeCode {
        if self.is_user() {
            self.clone()
        } else {
            TypeCode(self.0[..1].to_owned())
        }
    }
}

impl fmt::Display for TypeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A resolved type: either a primitive or a user aggregate with resolved
/// field descriptors. Pointer fields resolve to [`Primitive::Pointer`] and
/// are never expanded, which terminates cyclic definitions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeDesc {
    /// A primitive value.
    Prim(Primitive),
    /// A struct or union with resolved members.
    User {
        /// Layout policy.
        kind: Composite,
        /// Resolved member descriptors in declaration order.
        fields: Vec<TypeDesc>,
    },
}

impl TypeDesc {
    /// `(size, alignment)` of this type on the host ABI.
    #[must_use]
    pub fn layout(&self) -> (usize, usize) {
        match self {
            TypeDesc::Prim(p) => (p.size(), p.align()),
            TypeDesc::User {
                kind: Composite::Struct,
                fields,
            } => {
                let mut offset = 0;
                let mut max_align = 1;
                for field in fields {
                    let (size, align) = field.layout();
                    max_align = max_align.max(align);
                    offset = align_up(offset, align) + size;
                }
                (align_up(offset, max_align), max_align)
            }
            TypeDesc::User {
                kind: Composite::Union,
                fields,
            } => {
                let mut max_size = 0;
                let mut max_align = 1;
                for field in fields {
                    let (size, align) = field.layout();
                    max_size = max_size.max(size);
                    max_align = max_align.max(align);
                }
                (align_up(max_size, max_align), max_align)
            }
        }
    }

    /// The primitive behind this descriptor, if it is one.
    #[must_use]
    pub fn primitive(&self) -> Option<Primitive> {
        match self {
            TypeDesc::Prim(p) => Some(*p),
            TypeDesc::User { .. } => None,
        }
    }
}

/// Rounds `offset` up to the next multiple of `alignment`.
#[must_use]
pub fn align_up(offset: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        return offset;
    }
    let leftover = offset % alignment;
    offset + (alignment - leftover) % alignment
}

/// Maps type codes to descriptors and layout information.
///
/// The user type table comes from the model and travels with every stored
/// trace, so user type ids stay meaningful after reload. Layout queries are
/// memoized; the cache is rebuilt lazily after deserialization.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TypeManager {
    usertypes: HashMap<String, UserType>,
    #[serde(skip)]
    info_cache: RefCell<HashMap<String, (usize, usize)>>,
}

impl TypeManager {
    /// Builds a manager from a parsed model.
    #[must_use]
    pub fn new(model: &Model) -> Self {
        Self::from_usertypes(model.usertypes().clone())
    }

    /// Builds a manager from a bare user type table.
    #[must_use]
    pub fn from_usertypes(usertypes: HashMap<String, UserType>) -> Self {
        TypeManager {
            usertypes,
            info_cache: RefCell::new(HashMap::new()),
        }
    }

    /// Resolves a code to a descriptor usable for materialization.
    pub fn descriptor(&self, code: &TypeCode) -> Result<TypeDesc, Error> {
        if !code.is_user() {
            let prim = code
                .primitive()
                .ok_or_else(|| Error::illegal_argument(format!("invalid type code {code}")))?;
            return Ok(TypeDesc::Prim(prim));
        }
        let user = self
            .usertypes
            .get(code.as_str())
            .ok_or_else(|| Error::unknown_type(code.as_str()))?;
        let mut fields = Vec::with_capacity(user.fields.len());
        for field in &user.fields {
            fields.push(self.descriptor(field)?);
        }
        Ok(TypeDesc::User {
            kind: user.kind,
            fields,
        })
    }

    /// `(size, alignment)` for a code, memoized.
    pub fn info(&self, code: &TypeCode) -> Result<(usize, usize), Error> {
        if let Some(info) = self.info_cache.borrow().get(code.as_str()) {
            return Ok(*info);
        }
        let info = self.descriptor(code)?.layout();
        self.info_cache
            .borrow_mut()
            .insert(code.as_str().to_owned(), info);
        Ok(info)
    }

    /// The code letter of a primitive descriptor; `None` for aggregates.
    #[must_use]
    pub fn format_of(&self, desc: &TypeDesc) -> Option<char> {
        desc.primitive().map(|p| p.code())
    }

    /// The user type table.
    #[must_use]
    pub fn usertypes(&self) -> &HashMap<String, UserType> {
        &self.usertypes
    }
}

#[cfg(test)]
mod tests {
    use std::os::raw::{c_char, c_int};

    use hashbrown::HashMap;

    use super::{align_up, Primitive, TypeCode, TypeManager};
    use crate::model::{Composite, UserType};

    fn manager() -> TypeManager {
        let mut usertypes = HashMap::new();
        usertypes.insert(
            "1".to_owned(),
            UserType {
                kind: Composite::Struct,
                fields: vec![TypeCode::new("c").unwrap(), TypeCode::new("i").unwrap()],
            },
        );
        usertypes.insert(
            "2".to_owned(),
            UserType {
                kind: Composite::Union,
                fields: vec![TypeCode::new("h").unwrap(), TypeCode::new("d").unwrap()],
            },
        );
        // Self-referential through a pointer field; must not recurse.
        usertypes.insert(
            "3".to_owned(),
            UserType {
                kind: Composite::Struct,
                fields: vec![TypeCode::new("P3").unwrap(), TypeCode::new("1").unwrap()],
            },
        );
        TypeManager::from_usertypes(usertypes)
    }

    #[test]
    fn code_validation() {
        assert!(TypeCode::new("i").is_ok());
        assert!(TypeCode::new("P").is_ok());
        assert!(TypeCode::new("PPi").is_ok());
        assert!(TypeCode::new("42").is_ok());
        assert!(TypeCode::new("P7").is_ok());
        assert!(TypeCode::new("").is_err());
        assert!(TypeCode::new("x").is_err());
        assert!(TypeCode::new("ii").is_err());
        assert!(TypeCode::new("Px").is_err());
    }

    #[test]
    fn top_level_codes() {
        assert_eq!(TypeCode::new("Pi").unwrap().top_level().as_str(), "P");
        assert_eq!(TypeCode::new("12").unwrap().top_level().as_str(), "12");
        assert_eq!(TypeCode::new("d").unwrap().top_level().as_str(), "d");
    }

    #[test]
    fn struct_layout_matches_host_abi() {
        #[repr(C)]
        struct Equivalent {
            a: c_char,
            b: c_int,
        }
        let tm = manager();
        let info = tm.info(&TypeCode::new("1").unwrap()).unwrap();
        assert_eq!(
            info,
            (
                core::mem::size_of::<Equivalent>(),
                core::mem::align_of::<Equivalent>()
            )
        );
    }

    #[test]
    fn union_layout_matches_host_abi() {
        #[repr(C)]
        union Equivalent {
            a: i16,
            b: f64,
        }
        let tm = manager();
        let info = tm.info(&TypeCode::new("2").unwrap()).unwrap();
        assert_eq!(
            info,
            (
                core::mem::size_of::<Equivalent>(),
                core::mem::align_of::<Equivalent>()
            )
        );
    }

    #[test]
    fn cyclic_type_terminates_through_pointer() {
        let tm = manager();
        let code = TypeCode::new("3").unwrap();
        let (size, align) = tm.info(&code).unwrap();
        let (inner_size, inner_align) = tm.info(&TypeCode::new("1").unwrap()).unwrap();
        let expected = align_up(
            align_up(Primitive::Pointer.size(), inner_align) + inner_size,
            Primitive::Pointer.align().max(inner_align),
        );
        assert_eq!(size, expected);
        assert_eq!(align, Primitive::Pointer.align().max(inner_align));
    }

    #[test]
    fn format_of_inverts_primitive_descriptors() {
        let tm = manager();
        let desc = tm.descriptor(&TypeCode::new("Pi").unwrap()).unwrap();
        assert_eq!(tm.format_of(&desc), Some('P'));
        let aggregate = tm.descriptor(&TypeCode::new("1").unwrap()).unwrap();
        assert_eq!(tm.format_of(&aggregate), None);
    }

    #[test]
    fn unknown_user_type_errors() {
        let tm = manager();
        assert!(tm.info(&TypeCode::new("99").unwrap()).is_err());
    }

    #[test]
    fn align_up_rounds() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(4, 4), 4);
        assert_eq!(align_up(5, 1), 5);
        assert_eq!(align_up(9, 8), 16);
    }
}
