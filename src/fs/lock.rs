/*!
 * Byte-Range Locks
 *
 * In-memory locks are authoritative; kernel advisory locks are kept in step
 * so that unrelated Unix processes see them too. A lock `[start, end)` with
 * `end == 0` runs to the end of the file. Each lock is linked at once into
 * its inode's list (owning) and its process's list (weak), and remembers its
 * fd weakly.
 *
 * Kernel locks are process-wide, so releasing a range must not unlock bytes
 * another surviving lock still covers: only the holes left after
 * subtracting the surviving locks are unlocked.
 */

use super::fd::Fd;
use super::inode::Inode;
use crate::core::errors::{ServerError, ServerResult};
use crate::core::types::FilePos;
use crate::object::{wake_up, Object, ObjectType, WaitQueue};
use crate::process::Process;
use nix::errno::Errno;
use nix::libc;
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use tracing::debug;

/// Kernel lock operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnixLockKind {
    Read,
    Write,
    Unlock,
}

/// Kernel-level advisory locking; `len == 0` means to end of file
pub trait UnixLocks {
    fn set_lock(&self, fd: RawFd, kind: UnixLockKind, start: FilePos, len: FilePos)
        -> Result<(), Errno>;

    /// F_GETLK query, used to tell a real conflict from missing lock support
    fn query_lock(&self, fd: RawFd, start: FilePos, len: FilePos) -> Result<(), Errno>;
}

/// fcntl(2) record locks
#[derive(Debug, Default, Clone, Copy)]
pub struct FcntlLocks;

fn flock_for(kind: UnixLockKind, start: FilePos, len: FilePos) -> libc::flock {
    // SAFETY: flock is plain old data; zero is a valid value for every field
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = match kind {
        UnixLockKind::Read => libc::F_RDLCK,
        UnixLockKind::Write => libc::F_WRLCK,
        UnixLockKind::Unlock => libc::F_UNLCK,
    } as _;
    fl.l_whence = libc::SEEK_SET as _;
    fl.l_start = start as libc::off_t;
    fl.l_len = len as libc::off_t;
    fl
}

impl UnixLocks for FcntlLocks {
    fn set_lock(
        &self,
        fd: RawFd,
        kind: UnixLockKind,
        start: FilePos,
        len: FilePos,
    ) -> Result<(), Errno> {
        let fl = flock_for(kind, start, len);
        // SAFETY: fl is a valid flock for the duration of the call
        Errno::result(unsafe { libc::fcntl(fd, libc::F_SETLK, &fl) }).map(drop)
    }

    fn query_lock(&self, fd: RawFd, start: FilePos, len: FilePos) -> Result<(), Errno> {
        let mut fl = flock_for(UnixLockKind::Write, start, len);
        // SAFETY: fl is a valid, writable flock for the duration of the call
        Errno::result(unsafe { libc::fcntl(fd, libc::F_GETLK, &mut fl) }).map(drop)
    }
}

/// One byte-range lock held through an fd by a process
pub struct FileLock {
    shared: bool,
    start: FilePos,
    end: FilePos,
    fd: Weak<Fd>,
    inode: Weak<Inode>,
    owner: RefCell<Option<Weak<Process>>>,
    queue: WaitQueue,
}

impl FileLock {
    pub fn start(&self) -> FilePos {
        self.start
    }

    /// Exclusive end, 0 for open-ended
    pub fn end(&self) -> FilePos {
        self.end
    }

    pub fn range(&self) -> (FilePos, FilePos) {
        (self.start, self.end)
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn owner(&self) -> Option<Rc<Process>> {
        self.owner.borrow().as_ref().and_then(Weak::upgrade)
    }

    pub fn overlaps(&self, start: FilePos, end: FilePos) -> bool {
        ranges_overlap(self.start, self.end, start, end)
    }

    pub(crate) fn held_through(&self, fd: &Fd) -> bool {
        std::ptr::eq(self.fd.as_ptr(), fd as *const Fd)
    }
}

impl Object for FileLock {
    fn object_type(&self) -> ObjectType {
        ObjectType::FileLock
    }

    fn dump(&self) -> String {
        format!(
            "FileLock {} [{:#x}, {:#x}) owned={}",
            if self.shared { "shared" } else { "excl" },
            self.start,
            self.end,
            self.owner.borrow().is_some()
        )
    }

    fn wait_queue(&self) -> Option<&WaitQueue> {
        Some(&self.queue)
    }

    /// Signaled once the lock has lost its owner
    fn signaled(&self) -> bool {
        self.owner.borrow().is_none()
    }
}

/// Half-open range overlap where an end of 0 extends to infinity
fn ranges_overlap(a_start: FilePos, a_end: FilePos, b_start: FilePos, b_end: FilePos) -> bool {
    if a_end != 0 && b_start >= a_end {
        return false;
    }
    if b_end != 0 && a_start >= b_end {
        return false;
    }
    true
}

/// Subtract surviving lock ranges from the release range `[start, end)`
///
/// `end` must be non-zero and greater than `start`. Lock ranges with
/// `start == end != 0` cover nothing; an end of 0 runs to infinity. The
/// result is sorted and disjoint.
pub fn compute_holes<I>(start: FilePos, end: FilePos, locks: I) -> Vec<(FilePos, FilePos)>
where
    I: IntoIterator<Item = (FilePos, FilePos)>,
{
    let mut holes = vec![(start, end)];
    for (lock_start, lock_end) in locks {
        if lock_start == lock_end && lock_end != 0 {
            continue;
        }
        if !ranges_overlap(lock_start, lock_end, start, end) {
            continue;
        }
        let lock_end = if lock_end == 0 { FilePos::MAX } else { lock_end };

        let mut next = Vec::with_capacity(holes.len() + 1);
        for (hole_start, hole_end) in holes.drain(..) {
            if hole_end <= lock_start || hole_start >= lock_end {
                next.push((hole_start, hole_end));
                continue;
            }
            // keep whatever sticks out on either side: truncation or a split
            if hole_start < lock_start {
                next.push((hole_start, lock_start));
            }
            if hole_end > lock_end {
                next.push((lock_end, hole_end));
            }
        }
        holes = next;
        if holes.is_empty() {
            break;
        }
    }
    holes
}

/// Result of a lock request
pub enum LockOutcome {
    Granted,
    /// Blocked; wait on the conflicting lock if there is one, otherwise retry later
    Pending(Option<Rc<FileLock>>),
}

/// Lock `count` bytes at `start` through `fd` on behalf of `owner`
pub fn lock_fd(
    fd: &Rc<Fd>,
    owner: &Rc<Process>,
    start: FilePos,
    count: FilePos,
    shared: bool,
    wait: bool,
) -> ServerResult<LockOutcome> {
    let inode = fd.inode().ok_or(ServerError::InvalidDeviceRequest)?;
    if count == 0 {
        return Ok(LockOutcome::Granted);
    }
    let end = start.wrapping_add(count);
    if end != 0 && end < start {
        return Err(ServerError::invalid_parameter("lock range wraps around"));
    }

    let conflict = inode
        .locks
        .borrow()
        .iter()
        .filter(|lock| lock.overlaps(start, end))
        .filter(|lock| !lock.held_through(fd))
        .find(|lock| !(shared && lock.shared))
        .cloned();
    if let Some(lock) = conflict {
        debug!(start, end, shared, "lock blocked by existing lock");
        return if wait {
            Ok(LockOutcome::Pending(Some(lock)))
        } else {
            Err(ServerError::LockConflict)
        };
    }

    let registry = inode
        .device()
        .registry()
        .ok_or(ServerError::InvalidDeviceRequest)?;
    let kind = if shared {
        UnixLockKind::Read
    } else {
        UnixLockKind::Write
    };
    match registry.set_unix_lock(fd, start, end, kind) {
        Ok(()) => {}
        Err(ServerError::LockConflict) if wait => return Ok(LockOutcome::Pending(None)),
        Err(e) => return Err(e),
    }

    let lock = Rc::new(FileLock {
        shared,
        start,
        end,
        fd: Rc::downgrade(fd),
        inode: Rc::downgrade(&inode),
        owner: RefCell::new(Some(Rc::downgrade(owner))),
        queue: WaitQueue::new(),
    });
    inode.locks.borrow_mut().push(Rc::clone(&lock));
    owner.add_lock(&lock);
    debug!(pid = owner.id(), start, end, shared, "lock granted");
    Ok(LockOutcome::Granted)
}

/// Release the lock on exactly `[start, start + count)` held through `fd`
pub fn unlock_fd(fd: &Rc<Fd>, start: FilePos, count: FilePos) -> ServerResult<()> {
    let inode = fd.inode().ok_or(ServerError::InvalidDeviceRequest)?;
    if count == 0 {
        return Ok(());
    }
    let end = start.wrapping_add(count);
    let found = inode
        .locks
        .borrow()
        .iter()
        .find(|lock| lock.held_through(fd) && lock.start == start && lock.end == end)
        .cloned();
    match found {
        Some(lock) => {
            remove_lock(&lock, true);
            Ok(())
        }
        None => Err(ServerError::LockConflict),
    }
}

/// Unlink a lock from its inode and owner, optionally syncing kernel locks
pub(crate) fn remove_lock(lock: &Rc<FileLock>, remove_unix: bool) {
    let Some(inode) = lock.inode.upgrade() else {
        return;
    };
    inode
        .locks
        .borrow_mut()
        .retain(|l| !Rc::ptr_eq(l, lock));
    if let Some(owner) = lock.owner() {
        owner.remove_lock(lock);
    }
    if remove_unix {
        if let (Some(fd), Some(registry)) = (lock.fd.upgrade(), inode.device().registry()) {
            registry.remove_unix_locks(&fd, &inode, lock.start, lock.end);
        }
    }
    if inode.locks.borrow().is_empty() {
        inode.close_pending(true);
    }
    *lock.owner.borrow_mut() = None;
    wake_up(lock.as_ref(), 0);
}

/// Drop every lock held through `fd`, unlocking their union range in one sweep
pub(crate) fn remove_fd_locks(fd: &Fd, inode: &Inode) {
    let locks: Vec<Rc<FileLock>> = inode
        .locks
        .borrow()
        .iter()
        .filter(|lock| lock.held_through(fd))
        .cloned()
        .collect();
    if locks.is_empty() {
        return;
    }

    let mut start = FilePos::MAX;
    let mut last = 0;
    for lock in &locks {
        start = start.min(lock.start);
        if lock.end == 0 || lock.end - 1 > last {
            last = lock.end.wrapping_sub(1);
        }
        remove_lock(lock, false);
    }
    if let Some(registry) = inode.device().registry() {
        registry.remove_unix_locks(fd, inode, start, last.wrapping_add(1));
    }
}

/// Release every lock owned by `process`
pub fn remove_process_locks(process: &Process) {
    for lock in process.take_locks() {
        remove_lock(&lock, true);
    }
}
