//! The central error type shared by every engine component.

use core::fmt;
use std::io;

/// Error type for all engine operations.
///
/// Only configuration and model errors should abort a run; everything else
/// is expected during fuzzing and is handled close to where it occurs.
#[derive(Debug)]
pub enum Error {
    /// Serialization or deserialization of a trace artifact failed.
    Serialize(String),
    /// A file or OS-level operation failed.
    File(io::Error, String),
    /// An argument violated a documented contract.
    IllegalArgument(String),
    /// An operation was attempted in a state that does not permit it.
    IllegalState(String),
    /// A requested entry (function, trace file, config value) is missing.
    KeyNotFound(String),
    /// A type code referenced a user type the model does not define.
    UnknownType(String),
    /// A memory access fell outside the captured blocks.
    InvalidRange {
        /// Start of the offending access.
        addr: usize,
        /// Length of the offending access.
        size: usize,
    },
    /// The debugger primitive reported a failure.
    Debugger(String),
    /// Symbol lookup in the loaded target library failed.
    Link(String),
    /// The requested operation is not available in this build or platform.
    Unsupported(String),
}

impl Error {
    /// Serialization failure with context.
    #[must_use]
    pub fn serialize<S: Into<String>>(msg: S) -> Self {
        Error::Serialize(msg.into())
    }

    /// File failure with context about the path or operation.
    #[must_use]
    pub fn file<S: Into<String>>(err: io::Error, msg: S) -> Self {
        Error::File(err, msg.into())
    }

    /// Contract violation in a caller-supplied argument.
    #[must_use]
    pub fn illegal_argument<S: Into<String>>(msg: S) -> Self {
        Error::IllegalArgument(msg.into())
    }

    /// Operation attempted in the wrong state.
    #[must_use]
    pub fn illegal_state<S: Into<String>>(msg: S) -> Self {
        Error::IllegalState(msg.into())
    }

    /// Missing entry.
    #[must_use]
    pub fn key_not_found<S: Into<String>>(msg: S) -> Self {
        Error::KeyNotFound(msg.into())
    }

    /// Unresolvable user type id.
    #[must_use]
    pub fn unknown_type<S: Into<String>>(code: S) -> Self {
        Error::UnknownType(code.into())
    }

    /// Out-of-range memory access.
    #[must_use]
    pub fn invalid_range(addr: usize, size: usize) -> Self {
        Error::InvalidRange { addr, size }
    }

    /// Debugger-side failure.
    #[must_use]
    pub fn debugger<S: Into<String>>(msg: S) -> Self {
        Error::Debugger(msg.into())
    }

    /// Feature not compiled into this build.
    #[must_use]
    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Error::Unsupported(msg.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Serialize(msg) => write!(f, "serialization error: {msg}"),
            Error::File(err, msg) if msg.is_empty() => write!(f, "file error: {err}"),
            Error::File(err, msg) => write!(f, "file error: {msg}: {err}"),
            Error::IllegalArgument(msg) => write!(f, "illegal argument: {msg}"),
            Error::IllegalState(msg) => write!(f, "illegal state: {msg}"),
            Error::KeyNotFound(msg) => write!(f, "not found: {msg}"),
            Error::UnknownType(code) => write!(f, "unknown user type id: {code}"),
            Error::InvalidRange { addr, size } => {
                write!(f, "address {addr:#x} size {size} is not a valid address range")
            }
            Error::Debugger(msg) => write!(f, "debugger error: {msg}"),
            Error::Link(msg) => write!(f, "symbol error: {msg}"),
            Error::Unsupported(msg) => write!(f, "unsupported: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::File(err, _) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::File(err, String::new())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialize(err.to_string())
    }
}

impl From<libloading::Error> for Error {
    fn from(err: libloading::Error) -> Self {
        Error::Link(err.to_string())
    }
}
