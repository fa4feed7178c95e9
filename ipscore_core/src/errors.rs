//! Error handling and the numeric error-code contract

use std::fmt;
use std::io;

/// Error type for scoring-engine operations.
#[derive(Debug)]
pub enum Error {
    /// A required argument was absent. Cannot arise from safe-Rust callers
    /// (references are never null) but kept so embedders that transport
    /// codes across a process boundary see the full contract.
    NullArgument,
    /// Unparseable IP string, decay factor outside [0, 1], or a corrupt
    /// archive header.
    InvalidArgument,
    /// Allocation of the bitmap or directory failed at creation time.
    OutOfMemory,
    /// A file-system call failed during save, load, or bulk load.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NullArgument => write!(f, "Required argument is absent"),
            Error::InvalidArgument => write!(f, "Invalid argument"),
            Error::OutOfMemory => write!(f, "Memory allocation failed"),
            Error::Io(e) => write!(f, "I/O failure: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Stable numeric codes. Values are part of the embedding contract:
/// success is zero, failures are negative.
#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    Ok = 0,
    NullArgument = -1,
    InvalidArgument = -2,
    OutOfMemory = -3,
    IoFailure = -4,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Ok => "Success",
            ErrorCode::NullArgument => "Required argument is absent",
            ErrorCode::InvalidArgument => "Invalid argument",
            ErrorCode::OutOfMemory => "Memory allocation failed",
            ErrorCode::IoFailure => "I/O failure",
        }
    }
}

// Map internal Error to the numeric contract
pub fn map_error(e: &Error) -> ErrorCode {
    match e {
        Error::NullArgument => ErrorCode::NullArgument,
        Error::InvalidArgument => ErrorCode::InvalidArgument,
        Error::OutOfMemory => ErrorCode::OutOfMemory,
        Error::Io(_) => ErrorCode::IoFailure,
    }
}

impl Error {
    /// Numeric code for this error.
    pub fn code(&self) -> ErrorCode {
        map_error(self)
    }
}
