/*!
 * Devices
 *
 * `FileRegistry` is the root of the device → inode graph. Devices are listed
 * weakly: a device lives while one of its inodes does, and an inode lives
 * while an Fd or a lock still needs it.
 */

use super::fd::Fd;
use super::fstat_raw;
use super::inode::Inode;
use super::lock::{FcntlLocks, UnixLockKind, UnixLocks};
use crate::core::errors::{ServerError, ServerResult};
use crate::core::limits::{
    DEVICE_HASH_SIZE, INODE_HASH_SIZE, MAX_UNIX_OFFSET, MAX_UNIX_OFFSET_32,
};
use crate::core::types::FilePos;
use crate::object::{Object, ObjectType};
use crate::reactor::Reactor;
use nix::errno::Errno;
use nix::libc;
use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use tracing::{debug, info, warn};

pub struct Device {
    dev: u64,
    removable: bool,
    inodes: RefCell<Vec<Vec<Weak<Inode>>>>,
    registry: Weak<FileRegistry>,
}

impl Device {
    pub fn dev(&self) -> u64 {
        self.dev
    }

    /// Removable media (floppy, CD, DVD), detected once at creation
    pub fn is_removable(&self) -> bool {
        self.removable
    }

    pub fn registry(&self) -> Option<Rc<FileRegistry>> {
        self.registry.upgrade()
    }

    /// Live inodes on this device
    pub fn inodes(&self) -> Vec<Rc<Inode>> {
        self.inodes
            .borrow()
            .iter()
            .flatten()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn bucket(ino: u64) -> usize {
        (ino % INODE_HASH_SIZE as u64) as usize
    }

    fn find_inode(&self, ino: u64) -> Option<Rc<Inode>> {
        self.inodes.borrow()[Self::bucket(ino)]
            .iter()
            .filter_map(Weak::upgrade)
            .find(|inode| inode.ino() == ino)
    }

    pub(crate) fn unlink_inode(&self, inode: &Inode) {
        let bucket = Self::bucket(inode.ino());
        self.inodes.borrow_mut()[bucket]
            .retain(|w| !std::ptr::eq(w.as_ptr(), inode as *const Inode));
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unlink_device(self);
        }
        debug!(dev = self.dev, "device destroyed");
    }
}

impl Object for Device {
    fn object_type(&self) -> ObjectType {
        ObjectType::Device
    }

    fn dump(&self) -> String {
        format!("Device dev={:#x} removable={}", self.dev, self.removable)
    }
}

/// Registry of devices plus the shared state of kernel-level locking
pub struct FileRegistry {
    reactor: Rc<Reactor>,
    devices: RefCell<Vec<Vec<Weak<Device>>>>,
    locks: Box<dyn UnixLocks>,
    max_unix_offset: Cell<FilePos>,
    self_ref: Weak<FileRegistry>,
}

impl FileRegistry {
    pub fn new(reactor: Rc<Reactor>) -> Rc<Self> {
        Self::with_locks(reactor, Box::new(FcntlLocks))
    }

    /// Registry whose kernel-level lock calls go through `locks`
    pub fn with_locks(reactor: Rc<Reactor>, locks: Box<dyn UnixLocks>) -> Rc<Self> {
        Rc::new_cyclic(|self_ref| Self {
            reactor,
            devices: RefCell::new(vec![Vec::new(); DEVICE_HASH_SIZE]),
            locks,
            max_unix_offset: Cell::new(MAX_UNIX_OFFSET),
            self_ref: self_ref.clone(),
        })
    }

    pub fn reactor(&self) -> &Rc<Reactor> {
        &self.reactor
    }

    pub fn max_unix_offset(&self) -> FilePos {
        self.max_unix_offset.get()
    }

    fn bucket(dev: u64) -> usize {
        (dev % DEVICE_HASH_SIZE as u64) as usize
    }

    pub fn lookup_device(&self, dev: u64) -> Option<Rc<Device>> {
        self.devices.borrow()[Self::bucket(dev)]
            .iter()
            .filter_map(Weak::upgrade)
            .find(|device| device.dev == dev)
    }

    /// Find or create the device; `sample_fd` drives the removable check on creation
    pub fn get_device(&self, dev: u64, sample_fd: Option<RawFd>) -> Rc<Device> {
        if let Some(device) = self.lookup_device(dev) {
            return device;
        }
        let removable = sample_fd.map_or(false, |fd| is_device_removable(dev, fd));
        let device = Rc::new(Device {
            dev,
            removable,
            inodes: RefCell::new(vec![Vec::new(); INODE_HASH_SIZE]),
            registry: self.self_ref.clone(),
        });
        self.devices.borrow_mut()[Self::bucket(dev)].push(Rc::downgrade(&device));
        debug!(dev, removable, "device created");
        device
    }

    /// Find or create the inode for (dev, ino)
    pub fn get_inode(&self, dev: u64, ino: u64, sample_fd: Option<RawFd>) -> Rc<Inode> {
        let device = self.get_device(dev, sample_fd);
        if let Some(inode) = device.find_inode(ino) {
            return inode;
        }
        let inode = Inode::new(Rc::clone(&device), ino);
        device.inodes.borrow_mut()[Device::bucket(ino)].push(Rc::downgrade(&inode));
        inode
    }

    pub fn device_count(&self) -> usize {
        self.devices
            .borrow()
            .iter()
            .flatten()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    fn unlink_device(&self, device: &Device) {
        self.devices.borrow_mut()[Self::bucket(device.dev)]
            .retain(|w| !std::ptr::eq(w.as_ptr(), device as *const Device));
    }

    /// Dismount a device: every open fd on it loses its descriptor
    ///
    /// Pending reads and writes are woken with `STATUS_VOLUME_DISMOUNTED`,
    /// pending closes are dropped without unlinking, and the device leaves
    /// the registry.
    pub fn unmount_device(&self, dev: u64) -> ServerResult<()> {
        let Some(device) = self.lookup_device(dev) else {
            debug!(dev, "unmount of unknown device");
            return Ok(());
        };
        let inodes = device.inodes();
        let mut fds = 0;
        for inode in &inodes {
            for fd in inode.open_fds() {
                fd.unmount();
                fds += 1;
            }
            inode.close_pending(false);
        }
        self.unlink_device(&device);
        info!(dev, inodes = inodes.len(), fds, "device unmounted");
        Ok(())
    }

    /// Unmount the block device behind `fd`
    pub fn unmount_fd_device(&self, fd: &Fd) -> ServerResult<()> {
        let st = fstat_raw(fd.get_unix_fd()?)?;
        if st.st_mode & libc::S_IFMT != libc::S_IFBLK {
            return Err(ServerError::invalid_parameter("not a block device"));
        }
        self.unmount_device(st.st_rdev as u64)
    }

    /// Take or release a kernel-level lock on `[start, end)` for `fd`
    ///
    /// Filesystems without lock support turn kernel locking off for the fd and
    /// report success; only a real conflict is an error.
    pub(crate) fn set_unix_lock(
        &self,
        fd: &Fd,
        start: FilePos,
        end: FilePos,
        kind: UnixLockKind,
    ) -> ServerResult<()> {
        if !fd.fs_locks() {
            return Ok(());
        }
        let Some(unix_fd) = fd.raw_fd() else {
            return Ok(());
        };
        let mut kind = kind;
        loop {
            if start == end {
                return Ok(());
            }
            let max = self.max_unix_offset.get();
            if start > max {
                return Ok(());
            }
            let len = if end == 0 || end > max { 0 } else { end - start };

            match self.locks.set_lock(unix_fd, kind, start, len) {
                Ok(()) => return Ok(()),
                Err(Errno::EACCES) => {
                    // Some filesystems answer EACCES for unsupported locks; F_GETLK tells them apart
                    if self.locks.query_lock(unix_fd, start, len).is_ok() {
                        return Err(ServerError::LockConflict);
                    }
                    fd.disable_fs_locks();
                    return Ok(());
                }
                Err(Errno::EIO) | Err(Errno::ENOLCK) | Err(Errno::ENOTSUP) => {
                    fd.disable_fs_locks();
                    return Ok(());
                }
                Err(Errno::EAGAIN) => return Err(ServerError::LockConflict),
                Err(Errno::EBADF) if kind == UnixLockKind::Write => {
                    // read-only descriptor: downgrade to a read lock
                    kind = UnixLockKind::Read;
                }
                Err(Errno::EBADF) => {
                    return Err(ServerError::access_denied("descriptor not open for locking"))
                }
                Err(Errno::EINVAL) | Err(Errno::EOVERFLOW) if max > MAX_UNIX_OFFSET_32 => {
                    warn!(
                        fd = unix_fd,
                        "filesystem rejects 64-bit lock offsets, limiting to 31 bits"
                    );
                    self.max_unix_offset.set(MAX_UNIX_OFFSET_32);
                }
                Err(errno) => return Err(errno.into()),
            }
        }
    }

    /// Unlock the parts of `[start, end)` no surviving lock on the inode still covers
    pub(crate) fn remove_unix_locks(&self, fd: &Fd, inode: &Inode, start: FilePos, end: FilePos) {
        if !fd.fs_locks() || fd.raw_fd().is_none() {
            return;
        }
        let max = self.max_unix_offset.get();
        if start == end || start > max {
            return;
        }
        let end = if end == 0 || end > max { max + 1 } else { end };

        let holes = {
            let locks = inode.locks.borrow();
            if locks.is_empty() {
                vec![(start, end)]
            } else {
                super::lock::compute_holes(start, end, locks.iter().map(|l| l.range()))
            }
        };
        for (hole_start, hole_end) in holes {
            if let Err(e) = self.set_unix_lock(fd, hole_start, hole_end, UnixLockKind::Unlock) {
                debug!(start = hole_start, end = hole_end, error = %e, "kernel unlock failed");
            }
        }
    }
}

/// Major number of a Linux dev_t
fn dev_major(dev: u64) -> u64 {
    ((dev >> 8) & 0xfff) | ((dev >> 32) & !0xfff)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn is_device_removable(dev: u64, fd: RawFd) -> bool {
    use crate::core::limits::{
        FLOPPY_MAJOR, ISO9660_SUPER_MAGIC, SUPERMOUNT_SUPER_MAGIC, UDF_SUPER_MAGIC,
    };

    if dev_major(dev) == FLOPPY_MAJOR {
        return true;
    }
    // SAFETY: statfs is plain old data and fully written on success
    let mut stfs: libc::statfs = unsafe { std::mem::zeroed() };
    // SAFETY: stfs is a valid out-pointer for the duration of the call
    if unsafe { libc::fstatfs(fd, &mut stfs) } == -1 {
        return false;
    }
    let magic = stfs.f_type as i64;
    magic == ISO9660_SUPER_MAGIC || magic == SUPERMOUNT_SUPER_MAGIC || magic == UDF_SUPER_MAGIC
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn is_device_removable(_dev: u64, _fd: RawFd) -> bool {
    false
}
