//! Status codes and the error type shared by every component.
//!
//! The numeric values of [`Status`] are part of the call contract with existing callers, and are
//! thus kept stable. Everything that can fail returns a [`Result`], whose error can always be
//! turned back into one of these codes with [`Error::status`].

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::buffer::IoBuffer;

/// Result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A completion or submission status, bit-compatible with the NT status values used by the
/// original completion port interface.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u32)]
pub enum Status {
    Success = 0x0000_0000,
    Abandoned = 0x0000_0080,
    Timeout = 0x0000_0102,
    Pending = 0x0000_0103,
    ResourceInUse = 0x8000_0011,
    InvalidHandle = 0xC000_0008,
    InvalidParameter = 0xC000_000D,
    InvalidDeviceRequest = 0xC000_0010,
    NotFound = 0xC000_0034,
    DuplicateName = 0xC000_0035,
    AlreadyBound = 0xC000_0048,
    InsufficientResources = 0xC000_009A,
    WriteInProgress = 0xC000_00AE,
    NotSupported = 0xC000_00BB,
    IoError = 0xC000_00E9,
}

impl Status {
    /// The raw 32-bit value of this status.
    pub const fn code(self) -> u32 {
        self as u32
    }
    /// Whether this status represents success, or an informational value such as `Pending`.
    pub const fn is_success(self) -> bool {
        (self as u32) >> 30 == 0
    }
    /// Map the return value of a submission to the legacy status, where an accepted request
    /// reports `Pending`.
    pub fn of(result: &Result<()>) -> Self {
        match result {
            Ok(()) => Status::Pending,
            Err(error) => error.status(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:08X})", self, self.code())
    }
}

/// The class of an error, following the taxonomy of the subsystem.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    /// Caller misuse, always returned synchronously and never queued.
    Parameter,
    /// Allocation or descriptor exhaustion, returned synchronously.
    Resource,
    /// Wraps an error reported by the operating system.
    Device,
    /// Misuse of a stateful contract (double bind, double close, write while a write is pending).
    Protocol,
    /// A wait elapsed without a packet.
    Timeout,
    /// The queue or channel was closed out from under a waiter.
    Abandoned,
}

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid handle")]
    InvalidHandle,

    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("request issued before a completion queue binding exists")]
    InvalidDeviceRequest,

    #[error("a completion queue binding has already been set")]
    AlreadyBound,

    #[error("another request of the same kind is already pending")]
    ResourceInUse,

    #[error("the previous write has not been consumed yet")]
    WriteInProgress,

    #[error("an endpoint with this name and role already exists")]
    DuplicateName,

    #[error("wait timed out")]
    Timeout,

    #[error("abandoned: the queue or channel was closed")]
    Abandoned,

    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    #[error("insufficient resources: {0}")]
    InsufficientResources(&'static str),

    /// The dispatcher could not accept the request. The request's buffers are handed back.
    #[error("insufficient resources: dispatcher queue is full")]
    QueueFull { buffers: Vec<IoBuffer> },

    #[error("file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl Error {
    /// Convert an I/O error raised while operating on `path`, keeping file-not-found distinct.
    pub(crate) fn from_io_with_path(error: io::Error, path: impl Into<PathBuf>) -> Self {
        match error.kind() {
            io::ErrorKind::NotFound => Error::NotFound { path: path.into() },
            _ => Error::Io { source: error },
        }
    }

    /// The legacy status code corresponding to this error.
    pub fn status(&self) -> Status {
        match self {
            Error::InvalidHandle => Status::InvalidHandle,
            Error::InvalidParameter(_) => Status::InvalidParameter,
            Error::InvalidDeviceRequest => Status::InvalidDeviceRequest,
            Error::AlreadyBound => Status::AlreadyBound,
            Error::ResourceInUse => Status::ResourceInUse,
            Error::WriteInProgress => Status::WriteInProgress,
            Error::DuplicateName => Status::DuplicateName,
            Error::Timeout => Status::Timeout,
            Error::Abandoned => Status::Abandoned,
            Error::NotSupported(_) => Status::NotSupported,
            Error::InsufficientResources(_) | Error::QueueFull { .. } => {
                Status::InsufficientResources
            }
            Error::NotFound { .. } => Status::NotFound,
            Error::Io { .. } => Status::IoError,
        }
    }

    /// The class this error belongs to.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::InvalidHandle | Error::InvalidParameter(_) | Error::NotSupported(_) => {
                ErrorClass::Parameter
            }
            Error::InsufficientResources(_) | Error::QueueFull { .. } => ErrorClass::Resource,
            Error::InvalidDeviceRequest
            | Error::AlreadyBound
            | Error::ResourceInUse
            | Error::WriteInProgress
            | Error::DuplicateName => ErrorClass::Protocol,
            Error::Timeout => ErrorClass::Timeout,
            Error::Abandoned => ErrorClass::Abandoned,
            Error::NotFound { .. } | Error::Io { .. } => ErrorClass::Device,
        }
    }

    /// Take back the buffers of a rejected request. Empty for every other error.
    pub fn take_buffers(&mut self) -> Vec<IoBuffer> {
        match self {
            Error::QueueFull { buffers } => std::mem::take(buffers),
            _ => Vec::new(),
        }
    }

    /// The raw OS error number, if this error wraps one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io { source } => source.raw_os_error(),
            _ => None,
        }
    }
}
