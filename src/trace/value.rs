//! Materialized C values and their lowering to raw argument bytes.
//!
//! A [`CValue`] is the in-process form of one captured object: a typed
//! primitive, a struct holding its fields in order, or a union holding the
//! single largest field that was loaded for it. Lowering produces the byte
//! image the target ABI expects (natural field alignment) and, for the
//! worker, the whole stack words an argument occupies in a call.

use core::fmt;
use core::hash::{Hash, Hasher};
use core::mem::{discriminant, size_of};
use std::os::raw::{c_long, c_ulong};

use crate::trace::types::{align_up, Primitive};
use crate::Error;

/// One materialized value.
#[derive(Clone, Debug)]
pub enum CValue {
    /// `c`, stored as a raw byte.
    Char(u8),
    /// `b`.
    Int8(i8),
    /// `B`.
    UInt8(u8),
    /// `h`.
    Int16(i16),
    /// `H`.
    UInt16(u16),
    /// `i`.
    Int32(i32),
    /// `I`.
    UInt32(u32),
    /// `l`.
    Long(c_long),
    /// `L`.
    ULong(c_ulong),
    /// `q`.
    Int64(i64),
    /// `Q`.
    UInt64(u64),
    /// `f`.
    Float(f32),
    /// `d`.
    Double(f64),
    /// `P`: a raw address.
    Ptr(usize),
    /// A struct with its fields in declaration order.
    Struct(Vec<CValue>),
    /// A union, holding its largest field.
    Union(Box<CValue>),
}

impl CValue {
    /// The primitive kind of this value, if it is one.
    #[must_use]
    pub fn primitive(&self) -> Option<Primitive> {
        Some(match self {
            CValue::Char(_) => Primitive::Char,
            CValue::Int8(_) => Primitive::Int8,
            CValue::UInt8(_) => Primitive::UInt8,
            CValue::Int16(_) => Primitive::Int16,
            CValue::UInt16(_) => Primitive::UInt16,
            CValue::Int32(_) => Primitive::Int32,
            CValue::UInt32(_) => Primitive::UInt32,
            CValue::Long(_) => Primitive::Long,
            CValue::ULong(_) => Primitive::ULong,
            CValue::Int64(_) => Primitive::Int64,
            CValue::UInt64(_) => Primitive::UInt64,
            CValue::Float(_) => Primitive::Float,
            CValue::Double(_) => Primitive::Double,
            CValue::Ptr(_) => Primitive::Pointer,
            CValue::Struct(_) | CValue::Union(_) => return None,
        })
    }

    /// `(size, alignment)` of the byte image this value lowers to.
    #[must_use]
    pub fn layout(&self) -> (usize, usize) {
        match self {
            CValue::Struct(fields) => {
                let mut offset = 0;
                let mut max_align = 1;
                for field in fields {
                    let (size, align) = field.layout();
                    max_align = max_align.max(align);
                    offset = align_up(offset, align) + size;
                }
                (align_up(offset, max_align), max_align)
            }
            CValue::Union(inner) => {
                let (size, align) = inner.layout();
                (align_up(size, align), align)
            }
            prim => {
                let p = prim.primitive().unwrap();
                (p.size(), p.align())
            }
        }
    }

    /// Decodes a primitive value from host-order bytes.
    pub fn read(prim: Primitive, bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != prim.size() {
            return Err(Error::illegal_argument(format!(
                "expected {} bytes for primitive {}, got {}",
                prim.size(),
                prim.code(),
                bytes.len()
            )));
        }
        Ok(match prim {
            Primitive::Char => CValue::Char(bytes[0]),
            Primitive::Int8 => CValue::Int8(bytes[0] as i8),
            Primitive::UInt8 => CValue::UInt8(bytes[0]),
            Primitive::Int16 => CValue::Int16(i16::from_ne_bytes(bytes.try_into().unwrap())),
            Primitive::UInt16 => CValue::UInt16(u16::from_ne_bytes(bytes.try_into().unwrap())),
            Primitive::Int32 => CValue::Int32(i32::from_ne_bytes(bytes.try_into().unwrap())),
            Primitive::UInt32 => CValue::UInt32(u32::from_ne_bytes(bytes.try_into().unwrap())),
            Primitive::Long => CValue::Long(c_long::from_ne_bytes(bytes.try_into().unwrap())),
            Primitive::ULong => CValue::ULong(c_ulong::from_ne_bytes(bytes.try_into().unwrap())),
            Primitive::Int64 => CValue::Int64(i64::from_ne_bytes(bytes.try_into().unwrap())),
            Primitive::UInt64 => CValue::UInt64(u64::from_ne_bytes(bytes.try_into().unwrap())),
            Primitive::Float => CValue::Float(f32::from_ne_bytes(bytes.try_into().unwrap())),
            Primitive::Double => CValue::Double(f64::from_ne_bytes(bytes.try_into().unwrap())),
            Primitive::Pointer => CValue::Ptr(usize::from_ne_bytes(bytes.try_into().unwrap())),
        })
    }

    /// Encodes a primitive value into host-order bytes.
    ///
    /// Aggregates are not a single encoding unit; use [`CValue::to_bytes`].
    pub fn write(&self, out: &mut [u8]) -> Result<(), Error> {
        let prim = self
            .primitive()
            .ok_or_else(|| Error::illegal_argument("cannot encode an aggregate as a primitive"))?;
        if out.len() != prim.size() {
            return Err(Error::illegal_argument(format!(
                "expected {} bytes for primitive {}, got {}",
                prim.size(),
                prim.code(),
                out.len()
            )));
        }
        match self {
            CValue::Char(v) => out[0] = *v,
            CValue::Int8(v) => out[0] = *v as u8,
            CValue::UInt8(v) => out[0] = *v,
            CValue::Int16(v) => out.copy_from_slice(&v.to_ne_bytes()),
            CValue::UInt16(v) => out.copy_from_slice(&v.to_ne_bytes()),
            CValue::Int32(v) => out.copy_from_slice(&v.to_ne_bytes()),
            CValue::UInt32(v) => out.copy_from_slice(&v.to_ne_bytes()),
            CValue::Long(v) => out.copy_from_slice(&v.to_ne_bytes()),
            CValue::ULong(v) => out.copy_from_slice(&v.to_ne_bytes()),
            CValue::Int64(v) => out.copy_from_slice(&v.to_ne_bytes()),
            CValue::UInt64(v) => out.copy_from_slice(&v.to_ne_bytes()),
            CValue::Float(v) => out.copy_from_slice(&v.to_ne_bytes()),
            CValue::Double(v) => out.copy_from_slice(&v.to_ne_bytes()),
            CValue::Ptr(v) => out.copy_from_slice(&v.to_ne_bytes()),
            CValue::Struct(_) | CValue::Union(_) => unreachable!(),
        }
        Ok(())
    }

    /// Lowers this value to the byte image the target ABI expects.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let (size, _) = self.layout();
        let mut buf = vec![0u8; size];
        self.write_into(&mut buf, 0);
        buf
    }

    fn write_into(&self, buf: &mut [u8], offset: usize) {
        match self {
            CValue::Struct(fields) => {
                let mut rel = 0;
                for field in fields {
                    let (size, align) = field.layout();
                    rel = align_up(rel, align);
                    field.write_into(buf, offset + rel);
                    rel += size;
                }
            }
            CValue::Union(inner) => inner.write_into(buf, offset),
            prim => {
                let size = prim.primitive().unwrap().size();
                // Size checked against the primitive above; cannot fail.
                prim.write(&mut buf[offset..offset + size]).unwrap();
            }
        }
    }

    /// The whole stack words this argument occupies in a call, padded with
    /// zero bytes to a word multiple.
    #[must_use]
    pub fn stack_words(&self) -> Vec<usize> {
        let bytes = self.to_bytes();
        bytes
            .chunks(size_of::<usize>())
            .map(|chunk| {
                let mut word = [0u8; size_of::<usize>()];
                word[..chunk.len()].copy_from_slice(chunk);
                usize::from_ne_bytes(word)
            })
            .collect()
    }
}

impl PartialEq for CValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (CValue::Char(a), CValue::Char(b)) => a == b,
            (CValue::Int8(a), CValue::Int8(b)) => a == b,
            (CValue::UInt8(a), CValue::UInt8(b)) => a == b,
            (CValue::Int16(a), CValue::Int16(b)) => a == b,
            (CValue::UInt16(a), CValue::UInt16(b)) => a == b,
            (CValue::Int32(a), CValue::Int32(b)) => a == b,
            (CValue::UInt32(a), CValue::UInt32(b)) => a == b,
            (CValue::Long(a), CValue::Long(b)) => a == b,
            (CValue::ULong(a), CValue::ULong(b)) => a == b,
            (CValue::Int64(a), CValue::Int64(b)) => a == b,
            (CValue::UInt64(a), CValue::UInt64(b)) => a == b,
            // Bit equality so that NaN candidates deduplicate.
            (CValue::Float(a), CValue::Float(b)) => a.to_bits() == b.to_bits(),
            (CValue::Double(a), CValue::Double(b)) => a.to_bits() == b.to_bits(),
            (CValue::Ptr(a), CValue::Ptr(b)) => a == b,
            (CValue::Struct(a), CValue::Struct(b)) => a == b,
            (CValue::Union(a), CValue::Union(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for CValue {}

impl Hash for CValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        discriminant(self).hash(state);
        match self {
            CValue::Char(v) => v.hash(state),
            CValue::Int8(v) => v.hash(state),
            CValue::UInt8(v) => v.hash(state),
            CValue::Int16(v) => v.hash(state),
            CValue::UInt16(v) => v.hash(state),
            CValue::Int32(v) => v.hash(state),
            CValue::UInt32(v) => v.hash(state),
            CValue::Long(v) => v.hash(state),
            CValue::ULong(v) => v.hash(state),
            CValue::Int64(v) => v.hash(state),
            CValue::UInt64(v) => v.hash(state),
            CValue::Float(v) => v.to_bits().hash(state),
            CValue::Double(v) => v.to_bits().hash(state),
            CValue::Ptr(v) => v.hash(state),
            CValue::Struct(fields) => fields.hash(state),
            CValue::Union(inner) => inner.hash(state),
        }
    }
}

impl fmt::Display for CValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CValue::Char(v) => write!(f, "{:?}", *v as char),
            CValue::Int8(v) => write!(f, "{v}"),
            CValue::UInt8(v) => write!(f, "{v}"),
            CValue::Int16(v) => write!(f, "{v}"),
            CValue::UInt16(v) => write!(f, "{v}"),
            CValue::Int32(v) => write!(f, "{v}"),
            CValue::UInt32(v) => write!(f, "{v}"),
            CValue::Long(v) => write!(f, "{v}"),
            CValue::ULong(v) => write!(f, "{v}"),
            CValue::Int64(v) => write!(f, "{v}"),
            CValue::UInt64(v) => write!(f, "{v}"),
            CValue::Float(v) => write!(f, "{v}"),
            CValue::Double(v) => write!(f, "{v}"),
            CValue::Ptr(v) => write!(f, "{v:#x}"),
            CValue::Struct(fields) => {
                write!(f, "{{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{field}")?;
                }
                write!(f, "}}")
            }
            CValue::Union(inner) => write!(f, "<{inner}>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use core::mem::size_of;

    use super::CValue;
    use crate::trace::types::Primitive;

    #[test]
    fn primitive_round_trip() {
        let v = CValue::Int32(-1234);
        let mut buf = [0u8; 4];
        v.write(&mut buf).unwrap();
        assert_eq!(CValue::read(Primitive::Int32, &buf).unwrap(), v);
    }

    #[test]
    fn nan_values_compare_equal_by_bits() {
        let a = CValue::Double(f64::NAN);
        let b = CValue::Double(f64::NAN);
        assert_eq!(a, b);
    }

    #[test]
    fn struct_lowering_uses_natural_alignment() {
        let v = CValue::Struct(vec![CValue::Char(0x41), CValue::Int32(0x11223344)]);
        let bytes = v.to_bytes();
        #[repr(C)]
        struct Equivalent {
            a: std::os::raw::c_char,
            b: std::os::raw::c_int,
        }
        assert_eq!(bytes.len(), size_of::<Equivalent>());
        assert_eq!(bytes[0], 0x41);
        let field = i32::from_ne_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(field, 0x11223344);
    }

    #[test]
    fn stack_words_cover_all_bytes() {
        let v = CValue::Struct(vec![CValue::Char(1), CValue::Int32(2), CValue::Char(3)]);
        let words = v.stack_words();
        let (size, _) = v.layout();
        assert_eq!(words.len(), size.div_ceil(size_of::<usize>()));
    }

    #[test]
    fn read_rejects_wrong_length() {
        assert!(CValue::read(Primitive::Int32, &[0u8; 2]).is_err());
    }
}
