/*!
 * Inodes
 *
 * One (device, inode number) pair with its open fds, its byte-range locks,
 * and the descriptors whose close is deferred. Kernel advisory locks belong
 * to the whole process, so closing any descriptor on the file would drop
 * them; descriptors are parked here until the last lock goes away.
 */

use super::device::Device;
use super::fd::Fd;
use super::lock::FileLock;
use crate::object::{Object, ObjectType};
use std::cell::RefCell;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::OwnedFd;
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use tracing::{debug, warn};

/// Descriptor whose close (and optional unlink) waits on the inode
#[derive(Debug)]
pub struct ClosedFd {
    pub unix_fd: Option<OwnedFd>,
    pub unlink: Option<PathBuf>,
}

pub struct Inode {
    device: Rc<Device>,
    ino: u64,
    open: RefCell<Vec<Weak<Fd>>>,
    pub(crate) locks: RefCell<Vec<Rc<FileLock>>>,
    closed: RefCell<Vec<ClosedFd>>,
}

impl Inode {
    pub(crate) fn new(device: Rc<Device>, ino: u64) -> Rc<Self> {
        Rc::new(Self {
            device,
            ino,
            open: RefCell::new(Vec::new()),
            locks: RefCell::new(Vec::new()),
            closed: RefCell::new(Vec::new()),
        })
    }

    pub fn device(&self) -> &Rc<Device> {
        &self.device
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Fds currently open on this inode
    pub fn open_fds(&self) -> Vec<Rc<Fd>> {
        self.open.borrow().iter().filter_map(Weak::upgrade).collect()
    }

    pub(crate) fn add_open(&self, fd: Weak<Fd>) {
        self.open.borrow_mut().push(fd);
    }

    pub(crate) fn remove_open(&self, fd: &Fd) {
        self.open
            .borrow_mut()
            .retain(|w| !std::ptr::eq(w.as_ptr(), fd as *const Fd));
    }

    pub fn lock_count(&self) -> usize {
        self.locks.borrow().len()
    }

    pub fn closed_count(&self) -> usize {
        self.closed.borrow().len()
    }

    /// Hand over a closing descriptor
    ///
    /// Closed at once when nothing depends on it; kept open while locks
    /// remain; kept as an unlink record (descriptor closed) for delete-on-close.
    pub fn add_closed_fd(&self, mut closed: ClosedFd) {
        if !self.locks.borrow().is_empty() {
            self.closed.borrow_mut().push(closed);
        } else if closed.unlink.is_some() {
            drop(closed.unix_fd.take());
            self.closed.borrow_mut().push(closed);
        } else {
            drop(closed);
        }
    }

    /// Close every deferred descriptor; unlink records survive when `keep_unlinks`
    pub fn close_pending(&self, keep_unlinks: bool) {
        let released = {
            let mut closed = self.closed.borrow_mut();
            for entry in closed.iter_mut() {
                drop(entry.unix_fd.take());
            }
            let (kept, released): (Vec<_>, Vec<_>) = closed
                .drain(..)
                .partition(|entry| keep_unlinks && entry.unlink.is_some());
            *closed = kept;
            released
        };
        if !released.is_empty() {
            debug!(ino = self.ino, released = released.len(), "pending closes released");
        }
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        debug_assert!(self.locks.borrow().is_empty());
        self.device.unlink_inode(self);

        for entry in self.closed.get_mut().drain(..) {
            drop(entry.unix_fd);
            let Some(path) = entry.unlink else {
                continue;
            };
            // only unlink if the path still names this inode
            let meta = match std::fs::metadata(&path) {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if meta.dev() != self.device.dev() || meta.ino() != self.ino {
                debug!(path = %path.display(), "unlink skipped, path was replaced");
                continue;
            }
            let result = if meta.is_dir() {
                std::fs::remove_dir(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => debug!(path = %path.display(), "deleted on close"),
                Err(e) => warn!(path = %path.display(), error = %e, "delete on close failed"),
            }
        }
    }
}

impl Object for Inode {
    fn object_type(&self) -> ObjectType {
        ObjectType::Inode
    }

    fn dump(&self) -> String {
        format!(
            "Inode dev={:#x} ino={} open={} locks={} closed={}",
            self.device.dev(),
            self.ino,
            self.open.borrow().len(),
            self.locks.borrow().len(),
            self.closed.borrow().len()
        )
    }
}
