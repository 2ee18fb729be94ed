/*!
 * File Descriptor Layer
 *
 * Device → inode → {open fds, locks, pending closes} graph, the Fd object
 * wrapping a Unix descriptor, async I/O queues, and the File/Stream kernel
 * objects built on top.
 */

pub mod async_io;
pub mod device;
pub mod fd;
pub mod file;
pub mod inode;
pub mod lock;
pub mod open;

pub use async_io::{Async, AsyncKind, AsyncParams, AsyncQueue};
pub use device::{Device, FileRegistry};
pub use fd::{
    default_fd_cancel_async, default_fd_ioctl, default_fd_queue_async, default_fd_reselect_async,
    default_get_poll_events, default_poll_event, fd_queue_async, Fd, FdOps, FdType,
};
pub use file::{File, Stream};
pub use inode::{ClosedFd, Inode};
pub use lock::{
    compute_holes, lock_fd, remove_process_locks, unlock_fd, FcntlLocks, FileLock, LockOutcome,
    UnixLockKind, UnixLocks,
};
pub use open::{alloc_pseudo_fd, check_sharing, create_anonymous_fd, open_fd, OpenParams};

use nix::errno::Errno;
use nix::libc;
use std::os::unix::io::RawFd;

/// fstat(2) on a raw descriptor
pub(crate) fn fstat_raw(fd: RawFd) -> Result<libc::stat, Errno> {
    // SAFETY: stat is plain old data and fully written on success
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: st is a valid out-pointer for the duration of the call
    Errno::result(unsafe { libc::fstat(fd, &mut st) })?;
    Ok(st)
}
