/*!
 * Error Types
 * Status codes and the crate-wide error type, with thiserror, miette, and serde support
 */

use miette::Diagnostic;
use nix::libc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// NT-style status code carried back through the reply channel
///
/// Kept as an open newtype: continuation statuses and async results are
/// chosen by clients, so arbitrary values must round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Status(pub u32);

impl Status {
    pub const SUCCESS: Status = Status(0x0000_0000);
    pub const ALERTED: Status = Status(0x0000_0101);
    pub const TIMEOUT: Status = Status(0x0000_0102);
    pub const PENDING: Status = Status(0x0000_0103);
    pub const DBG_CONTINUE: Status = Status(0x0001_0002);
    pub const BREAKPOINT: Status = Status(0x8000_0003);
    pub const DBG_EXCEPTION_NOT_HANDLED: Status = Status(0x8001_0001);
    pub const UNSUCCESSFUL: Status = Status(0xC000_0001);
    pub const INVALID_HANDLE: Status = Status(0xC000_0008);
    pub const INVALID_PARAMETER: Status = Status(0xC000_000D);
    pub const NO_SUCH_DEVICE: Status = Status(0xC000_000E);
    pub const NO_SUCH_FILE: Status = Status(0xC000_000F);
    pub const INVALID_DEVICE_REQUEST: Status = Status(0xC000_0010);
    pub const NO_MEMORY: Status = Status(0xC000_0017);
    pub const ACCESS_DENIED: Status = Status(0xC000_0022);
    pub const OBJECT_TYPE_MISMATCH: Status = Status(0xC000_0024);
    pub const OBJECT_NAME_COLLISION: Status = Status(0xC000_0035);
    pub const SHARING_VIOLATION: Status = Status(0xC000_0043);
    pub const FILE_LOCK_CONFLICT: Status = Status(0xC000_0054);
    pub const DISK_FULL: Status = Status(0xC000_007F);
    pub const FILE_IS_A_DIRECTORY: Status = Status(0xC000_00BA);
    pub const NOT_SUPPORTED: Status = Status(0xC000_00BB);
    pub const BAD_DEVICE_TYPE: Status = Status(0xC000_00CB);
    pub const ILLEGAL_FUNCTION: Status = Status(0xC000_00AF);
    pub const DIRECTORY_NOT_EMPTY: Status = Status(0xC000_0101);
    pub const NOT_A_DIRECTORY: Status = Status(0xC000_0103);
    pub const TOO_MANY_OPENED_FILES: Status = Status(0xC000_011F);
    pub const CANCELLED: Status = Status(0xC000_0120);
    pub const CANNOT_DELETE: Status = Status(0xC000_0121);
    pub const HANDLE_NOT_CLOSABLE: Status = Status(0xC000_0235);
    pub const VOLUME_DISMOUNTED: Status = Status(0xC000_026E);
    pub const DEBUGGER_INACTIVE: Status = Status(0xC000_0354);
    pub const HANDLES_CLOSED: Status = Status(0xC000_0705);

    /// Success, informational and warning codes are not failures
    pub fn is_error(self) -> bool {
        self.0 >= 0xC000_0000
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Status::SUCCESS => "STATUS_SUCCESS",
            Status::ALERTED => "STATUS_ALERTED",
            Status::TIMEOUT => "STATUS_TIMEOUT",
            Status::PENDING => "STATUS_PENDING",
            Status::DBG_CONTINUE => "DBG_CONTINUE",
            Status::BREAKPOINT => "STATUS_BREAKPOINT",
            Status::DBG_EXCEPTION_NOT_HANDLED => "DBG_EXCEPTION_NOT_HANDLED",
            Status::INVALID_HANDLE => "STATUS_INVALID_HANDLE",
            Status::INVALID_PARAMETER => "STATUS_INVALID_PARAMETER",
            Status::NO_MEMORY => "STATUS_NO_MEMORY",
            Status::ACCESS_DENIED => "STATUS_ACCESS_DENIED",
            Status::OBJECT_TYPE_MISMATCH => "STATUS_OBJECT_TYPE_MISMATCH",
            Status::SHARING_VIOLATION => "STATUS_SHARING_VIOLATION",
            Status::FILE_LOCK_CONFLICT => "STATUS_FILE_LOCK_CONFLICT",
            Status::NOT_SUPPORTED => "STATUS_NOT_SUPPORTED",
            Status::CANCELLED => "STATUS_CANCELLED",
            Status::CANNOT_DELETE => "STATUS_CANNOT_DELETE",
            Status::VOLUME_DISMOUNTED => "STATUS_VOLUME_DISMOUNTED",
            Status::DEBUGGER_INACTIVE => "STATUS_DEBUGGER_INACTIVE",
            Status::HANDLES_CLOSED => "STATUS_HANDLES_CLOSED",
            _ => return None,
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({:#010x})", name, self.0),
            None => write!(f, "{:#010x}", self.0),
        }
    }
}

/// Server errors with serialization support
///
/// Every variant maps to exactly one [`Status`] through [`ServerError::status`].
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum ServerError {
    #[error("Not enough memory: {0}")]
    #[diagnostic(
        code(server::no_memory),
        help("A table or queue could not grow. Release handles or raise the configured limits.")
    )]
    NoMemory(String),

    #[error("Access denied: {0}")]
    #[diagnostic(
        code(server::access_denied),
        help("The handle was not opened with the rights this operation needs.")
    )]
    AccessDenied(String),

    #[error("Sharing violation: {0}")]
    #[diagnostic(
        code(server::sharing_violation),
        help("Another open of the same file forbids this access. Close it or widen its share mode.")
    )]
    SharingViolation(String),

    #[error("File lock conflict")]
    #[diagnostic(
        code(server::lock_conflict),
        help("An overlapping byte range is locked. Retry with wait set to block on it.")
    )]
    LockConflict,

    #[error("Invalid handle {0:#x}")]
    #[diagnostic(
        code(server::invalid_handle),
        help("The handle was closed or never belonged to this process.")
    )]
    InvalidHandle(u32),

    #[error("Invalid parameter: {0}")]
    #[diagnostic(code(server::invalid_parameter))]
    InvalidParameter(String),

    #[error("Object type mismatch: {0}")]
    #[diagnostic(
        code(server::type_mismatch),
        help("The handle refers to an object that does not support this operation.")
    )]
    ObjectTypeMismatch(String),

    #[error("Not supported: {0}")]
    #[diagnostic(code(server::not_supported))]
    NotSupported(String),

    #[error("Not a directory: {0}")]
    #[diagnostic(code(server::not_a_directory))]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    #[diagnostic(code(server::is_a_directory))]
    IsADirectory(String),

    #[error("Object name collision: {0}")]
    #[diagnostic(code(server::name_collision))]
    NameCollision(String),

    #[error("Invalid device request")]
    #[diagnostic(
        code(server::invalid_device_request),
        help("The operation needs an inode-backed file descriptor.")
    )]
    InvalidDeviceRequest,

    #[error("No unix descriptor available ({0})")]
    #[diagnostic(
        code(server::no_descriptor),
        help("The descriptor is a pseudo-fd or its device was dismounted.")
    )]
    NoDescriptor(Status),

    #[error("Operation pending")]
    #[diagnostic(code(server::pending))]
    Pending,

    #[error("Handle is not closable")]
    #[diagnostic(code(server::not_closable))]
    NotClosable,

    #[error("I/O error {status}: {message}")]
    #[diagnostic(code(server::io))]
    Io { status: Status, message: String },

    #[error("{0}")]
    #[diagnostic(code(server::status))]
    Status(Status),
}

impl ServerError {
    /// The status code reported to the client
    pub fn status(&self) -> Status {
        match self {
            ServerError::NoMemory(_) => Status::NO_MEMORY,
            ServerError::AccessDenied(_) => Status::ACCESS_DENIED,
            ServerError::SharingViolation(_) => Status::SHARING_VIOLATION,
            ServerError::LockConflict => Status::FILE_LOCK_CONFLICT,
            ServerError::InvalidHandle(_) => Status::INVALID_HANDLE,
            ServerError::InvalidParameter(_) => Status::INVALID_PARAMETER,
            ServerError::ObjectTypeMismatch(_) => Status::OBJECT_TYPE_MISMATCH,
            ServerError::NotSupported(_) => Status::NOT_SUPPORTED,
            ServerError::NotADirectory(_) => Status::NOT_A_DIRECTORY,
            ServerError::IsADirectory(_) => Status::FILE_IS_A_DIRECTORY,
            ServerError::NameCollision(_) => Status::OBJECT_NAME_COLLISION,
            ServerError::InvalidDeviceRequest => Status::INVALID_DEVICE_REQUEST,
            ServerError::NoDescriptor(status) => *status,
            ServerError::Pending => Status::PENDING,
            ServerError::NotClosable => Status::HANDLE_NOT_CLOSABLE,
            ServerError::Io { status, .. } => *status,
            ServerError::Status(status) => *status,
        }
    }

    pub fn access_denied(what: impl Into<String>) -> Self {
        ServerError::AccessDenied(what.into())
    }

    pub fn type_mismatch(what: impl Into<String>) -> Self {
        ServerError::ObjectTypeMismatch(what.into())
    }

    pub fn invalid_parameter(what: impl Into<String>) -> Self {
        ServerError::InvalidParameter(what.into())
    }
}

/// Map a Unix errno onto the status a client would see for a failed file call
pub fn status_from_errno(errno: i32) -> Status {
    match errno {
        libc::ETXTBSY | libc::EAGAIN => Status::SHARING_VIOLATION,
        libc::EBADF => Status::INVALID_HANDLE,
        libc::ENOSPC => Status::DISK_FULL,
        libc::EACCES | libc::ESRCH | libc::EROFS | libc::EPERM => Status::ACCESS_DENIED,
        libc::EBUSY => Status::FILE_LOCK_CONFLICT,
        libc::ENOENT => Status::NO_SUCH_FILE,
        libc::EISDIR => Status::FILE_IS_A_DIRECTORY,
        libc::ENFILE | libc::EMFILE => Status::TOO_MANY_OPENED_FILES,
        libc::EEXIST => Status::OBJECT_NAME_COLLISION,
        libc::EINVAL => Status::INVALID_PARAMETER,
        libc::ESPIPE => Status::ILLEGAL_FUNCTION,
        libc::ENOTEMPTY => Status::DIRECTORY_NOT_EMPTY,
        libc::ENOTDIR => Status::NOT_A_DIRECTORY,
        libc::ENODEV | libc::ENXIO => Status::NO_SUCH_DEVICE,
        libc::ENOMEM => Status::NO_MEMORY,
        _ => Status::UNSUCCESSFUL,
    }
}

impl From<nix::errno::Errno> for ServerError {
    fn from(errno: nix::errno::Errno) -> Self {
        ServerError::Io {
            status: status_from_errno(errno as i32),
            message: errno.desc().to_string(),
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(err: io::Error) -> Self {
        let status = match err.raw_os_error() {
            Some(code) => status_from_errno(code),
            None => match err.kind() {
                io::ErrorKind::NotFound => Status::NO_SUCH_FILE,
                io::ErrorKind::PermissionDenied => Status::ACCESS_DENIED,
                io::ErrorKind::AlreadyExists => Status::OBJECT_NAME_COLLISION,
                io::ErrorKind::InvalidInput => Status::INVALID_PARAMETER,
                io::ErrorKind::OutOfMemory => Status::NO_MEMORY,
                _ => Status::UNSUCCESSFUL,
            },
        };
        ServerError::Io {
            status,
            message: err.to_string(),
        }
    }
}

impl From<Status> for ServerError {
    fn from(status: Status) -> Self {
        ServerError::Status(status)
    }
}

/// Result type for server operations
pub type ServerResult<T> = Result<T, ServerError>;
