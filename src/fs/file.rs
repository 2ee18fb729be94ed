/*!
 * File and Stream Objects
 *
 * The handle-visible objects behind regular files, directories, pipes and
 * sockets. Both delegate waiting and signaling to their Fd.
 */

use super::device::FileRegistry;
use super::fd::{default_fd_reselect_async, default_poll_event, Fd, FdOps, FdType};
use super::fstat_raw;
use super::open::{create_anonymous_fd, open_fd, OpenParams};
use super::async_io::{AsyncKind, AsyncQueue};
use crate::core::errors::ServerResult;
use crate::core::flags::{Access, FileOptions, GenericMapping};
use crate::object::{Event, Object, ObjectType, WaitQueue};
use crate::reactor::Interest;
use nix::errno::Errno;
use nix::libc;
use std::cell::RefCell;
use std::os::unix::io::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::rc::Rc;
use tracing::debug;

/// File type from the descriptor's mode bits
fn unix_fd_type(fd: &Fd) -> FdType {
    let Some(unix_fd) = fd.raw_fd() else {
        return FdType::Invalid;
    };
    let Ok(st) = fstat_raw(unix_fd) else {
        return FdType::Invalid;
    };
    match st.st_mode & libc::S_IFMT {
        libc::S_IFREG => FdType::File,
        libc::S_IFDIR => FdType::Dir,
        libc::S_IFSOCK => FdType::Socket,
        libc::S_IFIFO => FdType::Pipe,
        libc::S_IFCHR => FdType::Char,
        libc::S_IFBLK => FdType::Device,
        _ => FdType::Invalid,
    }
}

struct FileOps;

impl FdOps for FileOps {
    fn get_fd_type(&self, fd: &Fd) -> FdType {
        unix_fd_type(fd)
    }

    fn flush(&self, fd: &Fd) -> ServerResult<Option<Rc<Event>>> {
        let unix_fd = fd.get_unix_fd()?;
        // SAFETY: unix_fd stays open while fd is borrowed
        Errno::result(unsafe { libc::fsync(unix_fd) })?;
        Ok(None)
    }
}

/// Regular file or directory opened by path
pub struct File {
    fd: Rc<Fd>,
}

impl File {
    pub fn open(
        registry: &Rc<FileRegistry>,
        path: &Path,
        params: &OpenParams,
    ) -> ServerResult<Rc<Self>> {
        let fd = open_fd(registry, path, params, Box::new(FileOps))?;
        Ok(Rc::new(Self { fd }))
    }

    pub fn fd(&self) -> &Rc<Fd> {
        &self.fd
    }
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File").finish_non_exhaustive()
    }
}

impl Object for File {
    fn object_type(&self) -> ObjectType {
        ObjectType::File
    }

    fn dump(&self) -> String {
        format!("File {}", self.fd.dump())
    }

    fn wait_queue(&self) -> Option<&WaitQueue> {
        self.fd.wait_queue()
    }

    fn signaled(&self) -> bool {
        self.fd.is_signaled()
    }

    fn get_fd(&self) -> ServerResult<Rc<Fd>> {
        Ok(Rc::clone(&self.fd))
    }

    fn map_access(&self, access: Access) -> Access {
        access.map_generic(&GenericMapping::FILE)
    }
}

#[derive(Default)]
struct StreamOps {
    flush_events: RefCell<Vec<Rc<Event>>>,
}

impl StreamOps {
    fn writes_pending(fd: &Fd) -> bool {
        fd.async_queue(AsyncKind::Write)
            .map_or(false, |queue| !queue.is_empty())
    }

    fn signal_flushed(&self, fd: &Fd) {
        if Self::writes_pending(fd) {
            return;
        }
        let events = std::mem::take(&mut *self.flush_events.borrow_mut());
        if !events.is_empty() {
            debug!(flushed = events.len(), "stream writes drained");
        }
        for event in events {
            event.set();
        }
    }
}

impl FdOps for StreamOps {
    fn get_fd_type(&self, fd: &Fd) -> FdType {
        unix_fd_type(fd)
    }

    fn poll_event(&self, fd: &Rc<Fd>, events: Interest) {
        default_poll_event(fd, events);
        self.signal_flushed(fd);
    }

    fn reselect_async(&self, fd: &Rc<Fd>, queue: &AsyncQueue) {
        default_fd_reselect_async(fd, queue);
        self.signal_flushed(fd);
    }

    /// Completes at once unless writes are queued; then hands back an event
    /// signaled when the last one leaves the queue
    fn flush(&self, fd: &Fd) -> ServerResult<Option<Rc<Event>>> {
        fd.get_unix_fd()?;
        if !Self::writes_pending(fd) {
            return Ok(None);
        }
        let event = Event::new(true, false);
        self.flush_events.borrow_mut().push(Rc::clone(&event));
        Ok(Some(event))
    }
}

/// Pipe or socket end without an inode
pub struct Stream {
    fd: Rc<Fd>,
}

impl Stream {
    /// Wrap a descriptor the server already holds
    pub fn create(
        registry: &Rc<FileRegistry>,
        unix_fd: OwnedFd,
        options: FileOptions,
    ) -> ServerResult<Rc<Self>> {
        let fd = create_anonymous_fd(registry, Box::<StreamOps>::default(), unix_fd, options)?;
        Ok(Rc::new(Self { fd }))
    }

    /// Connected non-blocking socket pair
    pub fn pair(
        registry: &Rc<FileRegistry>,
        options: FileOptions,
    ) -> ServerResult<(Rc<Self>, Rc<Self>)> {
        let (a, b) = UnixStream::pair()?;
        a.set_nonblocking(true)?;
        b.set_nonblocking(true)?;
        Ok((
            Self::create(registry, a.into(), options)?,
            Self::create(registry, b.into(), options)?,
        ))
    }

    pub fn fd(&self) -> &Rc<Fd> {
        &self.fd
    }
}

impl Object for Stream {
    fn object_type(&self) -> ObjectType {
        ObjectType::Stream
    }

    fn dump(&self) -> String {
        format!("Stream {}", self.fd.dump())
    }

    fn wait_queue(&self) -> Option<&WaitQueue> {
        self.fd.wait_queue()
    }

    fn signaled(&self) -> bool {
        self.fd.is_signaled()
    }

    fn get_fd(&self) -> ServerResult<Rc<Fd>> {
        Ok(Rc::clone(&self.fd))
    }

    fn map_access(&self, access: Access) -> Access {
        access.map_generic(&GenericMapping::FILE)
    }
}
