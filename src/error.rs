//! Driver error codes.
//!
//! The numeric values match the codes exposed on the block-device
//! interface, where failures surface as negative integers.

use core::fmt;

/// Errors reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Invalid parameter given
    BadParam,
    /// Coherent memory exhausted
    NoResource,
    /// Controller reported a non-zero completion status
    Controller,
    /// Command or ready-wait timed out
    Timeout,
    /// Write attempted on a read-only build
    ReadOnly,
    /// LBA out of range for the namespace
    LbaRange,
}

impl Error {
    /// Numeric code as exposed on the device interface.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::BadParam => -1,
            Self::NoResource => -2,
            Self::Controller => -3,
            Self::Timeout => -4,
            Self::ReadOnly => -5,
            Self::LbaRange => -6,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadParam => write!(f, "invalid parameter"),
            Self::NoResource => write!(f, "coherent memory exhausted"),
            Self::Controller => write!(f, "controller error"),
            Self::Timeout => write!(f, "command timed out"),
            Self::ReadOnly => write!(f, "device is read-only"),
            Self::LbaRange => write!(f, "LBA out of range"),
        }
    }
}

/// Result alias used throughout the driver.
pub type Result<T> = core::result::Result<T, Error>;
