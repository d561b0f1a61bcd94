//! An `(address, type-code)` pair identifying one object inside a Memory.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::trace::types::TypeCode;

/// An immutable tag: the address of an object paired with its type code.
///
/// Equality and hashing cover both fields, so a set of tags deduplicates
/// objects that were reached more than once during capture.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    addr: usize,
    code: TypeCode,
}

impl Tag {
    /// Pairs an address with a type code.
    #[must_use]
    pub fn new(addr: usize, code: TypeCode) -> Self {
        Tag { addr, code }
    }

    /// The tagged address.
    #[must_use]
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// The type code of the object at the address.
    #[must_use]
    pub fn code(&self) -> &TypeCode {
        &self.code
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x} - {}", self.addr, self.code)
    }
}
