/*!
 * File Descriptor Objects
 *
 * `Fd` wraps one Unix descriptor, or none at all for a pseudo-fd, and gives
 * every kind of file the same lifecycle: poll slot, async queues, locks,
 * completion binding, and the deferred close through its inode. Type
 * specific behavior comes from the `FdOps` table.
 *
 * Without a descriptor, I/O fails with `no_fd_status` instead.
 */

use super::async_io::{Async, AsyncKind, AsyncParams, AsyncQueue};
use super::device::FileRegistry;
use super::inode::{ClosedFd, Inode};
use super::lock::remove_fd_locks;
use crate::core::errors::{ServerError, ServerResult, Status};
use crate::core::flags::{Access, FileOptions, ShareMode};
use crate::core::limits::FSCTL_DISMOUNT_VOLUME;
use crate::object::{wake_up, Completion, Event, Object, ObjectType, WaitQueue};
use crate::reactor::{Interest, Reactor};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::rc::Rc;
use tracing::{debug, warn};

/// Kind of file reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FdType {
    Invalid,
    File,
    Dir,
    Socket,
    Pipe,
    Char,
    Device,
}

/// Per-kind operations of an Fd
pub trait FdOps {
    fn get_fd_type(&self, fd: &Fd) -> FdType;

    /// Interest mask wanted from the reactor
    fn get_poll_events(&self, fd: &Fd) -> Interest {
        default_get_poll_events(fd)
    }

    /// Readiness reported by the reactor
    fn poll_event(&self, fd: &Rc<Fd>, events: Interest) {
        default_poll_event(fd, events)
    }

    /// Flush buffered data; may hand back an event signaled on completion
    fn flush(&self, fd: &Fd) -> ServerResult<Option<Rc<Event>>> {
        let _ = fd;
        Err(ServerError::type_mismatch("flush not supported"))
    }

    fn ioctl(
        &self,
        fd: &Rc<Fd>,
        code: u32,
        params: &AsyncParams,
        data: &[u8],
    ) -> ServerResult<Option<Rc<Async>>> {
        let _ = (params, data);
        default_fd_ioctl(fd, code)
    }

    fn queue_async(
        &self,
        fd: &Rc<Fd>,
        params: AsyncParams,
        kind: AsyncKind,
        count: u32,
    ) -> ServerResult<Rc<Async>> {
        default_fd_queue_async(fd, params, kind, count)
    }

    fn reselect_async(&self, fd: &Rc<Fd>, queue: &AsyncQueue) {
        default_fd_reselect_async(fd, queue)
    }

    fn cancel_async(&self, fd: &Fd) {
        default_fd_cancel_async(fd)
    }
}

/// Construction parameters shared by the open paths
pub(crate) struct FdParams {
    pub unix_fd: Option<OwnedFd>,
    pub inode: Option<Rc<Inode>>,
    pub access: Access,
    pub sharing: ShareMode,
    pub options: FileOptions,
}

pub struct Fd {
    registry: Rc<FileRegistry>,
    ops: Box<dyn FdOps>,
    unix_fd: RefCell<Option<OwnedFd>>,
    inode: Option<Rc<Inode>>,
    access: Access,
    sharing: ShareMode,
    options: FileOptions,
    no_fd_status: Cell<Status>,
    unlink_path: RefCell<Option<PathBuf>>,
    poll_index: Cell<Option<usize>>,
    fs_locks: Cell<bool>,
    signaled: Cell<bool>,
    read_q: RefCell<Option<Rc<AsyncQueue>>>,
    write_q: RefCell<Option<Rc<AsyncQueue>>>,
    wait_q: RefCell<Option<Rc<AsyncQueue>>>,
    completion: RefCell<Option<(Rc<Completion>, u64)>>,
    waiters: WaitQueue,
}

impl std::fmt::Debug for Fd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fd").finish_non_exhaustive()
    }
}

impl Fd {
    /// Fd with a reactor slot
    pub(crate) fn new(
        registry: &Rc<FileRegistry>,
        ops: Box<dyn FdOps>,
        params: FdParams,
    ) -> ServerResult<Rc<Self>> {
        let fd = Self::unpolled(registry, ops, params);
        let slot = registry.reactor().add_user(Rc::downgrade(&fd))?;
        fd.poll_index.set(Some(slot));
        Ok(fd)
    }

    /// Fd that never takes part in polling
    pub(crate) fn unpolled(
        registry: &Rc<FileRegistry>,
        ops: Box<dyn FdOps>,
        params: FdParams,
    ) -> Rc<Self> {
        let fs_locks = params.inode.is_some();
        let fd = Rc::new(Self {
            registry: Rc::clone(registry),
            ops,
            unix_fd: RefCell::new(params.unix_fd),
            inode: params.inode,
            access: params.access,
            sharing: params.sharing,
            options: params.options,
            no_fd_status: Cell::new(Status::BAD_DEVICE_TYPE),
            unlink_path: RefCell::new(None),
            poll_index: Cell::new(None),
            fs_locks: Cell::new(fs_locks),
            signaled: Cell::new(true),
            read_q: RefCell::new(None),
            write_q: RefCell::new(None),
            wait_q: RefCell::new(None),
            completion: RefCell::new(None),
            waiters: WaitQueue::new(),
        });
        if let Some(inode) = &fd.inode {
            inode.add_open(Rc::downgrade(&fd));
        }
        fd
    }

    pub fn registry(&self) -> &Rc<FileRegistry> {
        &self.registry
    }

    pub fn reactor(&self) -> &Rc<Reactor> {
        self.registry.reactor()
    }

    pub fn inode(&self) -> Option<Rc<Inode>> {
        self.inode.clone()
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn sharing(&self) -> ShareMode {
        self.sharing
    }

    pub fn options(&self) -> FileOptions {
        self.options
    }

    pub fn poll_index(&self) -> Option<usize> {
        self.poll_index.get()
    }

    /// The Unix descriptor, or the fd's `no_fd_status` as an error
    pub fn get_unix_fd(&self) -> ServerResult<RawFd> {
        self.raw_fd()
            .ok_or(ServerError::NoDescriptor(self.no_fd_status.get()))
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.unix_fd.borrow().as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Duplicate the descriptor for transfer to a client
    pub fn dup_unix_fd(&self) -> ServerResult<OwnedFd> {
        let unix_fd = self.unix_fd.borrow();
        match unix_fd.as_ref() {
            Some(owned) => Ok(owned.try_clone()?),
            None => Err(ServerError::NoDescriptor(self.no_fd_status.get())),
        }
    }

    pub fn no_fd_status(&self) -> Status {
        self.no_fd_status.get()
    }

    pub fn set_no_fd_status(&self, status: Status) {
        self.no_fd_status.set(status);
    }

    pub fn fs_locks(&self) -> bool {
        self.fs_locks.get()
    }

    /// Stop using kernel locks on this fd; in-memory locks stay authoritative
    pub(crate) fn disable_fs_locks(&self) {
        if self.fs_locks.replace(false) {
            warn!(
                fd = ?self.raw_fd(),
                "filesystem does not support locks, using in-memory locking only"
            );
        }
    }

    pub(crate) fn set_unlink_path(&self, path: Option<PathBuf>) {
        *self.unlink_path.borrow_mut() = path;
    }

    pub fn is_removable(&self) -> bool {
        self.inode
            .as_ref()
            .map_or(false, |inode| inode.device().is_removable())
    }

    pub fn get_fd_type(&self) -> FdType {
        self.ops.get_fd_type(self)
    }

    /// Change the reactor interest; `None` stops polling for good
    pub fn set_events(&self, events: Option<Interest>) {
        let Some(slot) = self.poll_index.get() else {
            return;
        };
        match (self.raw_fd(), events) {
            (Some(unix_fd), events) => self.reactor().set_events(slot, unix_fd, events),
            (None, None) => self.reactor().set_events(slot, -1, None),
            (None, Some(_)) => {}
        }
    }

    /// Zero-timeout readiness check of the descriptor
    pub fn check_events(&self, events: Interest) -> Interest {
        match self.raw_fd() {
            Some(unix_fd) => Reactor::check_events(unix_fd, events),
            None => Interest::empty(),
        }
    }

    pub fn get_poll_events(&self) -> Interest {
        self.ops.get_poll_events(self)
    }

    /// Dispatch readiness from the reactor
    pub fn poll_event(self: &Rc<Self>, events: Interest) {
        self.ops.poll_event(self, events);
    }

    pub fn flush(&self) -> ServerResult<Option<Rc<Event>>> {
        self.ops.flush(self)
    }

    pub fn ioctl(
        self: &Rc<Self>,
        code: u32,
        params: &AsyncParams,
        data: &[u8],
    ) -> ServerResult<Option<Rc<Async>>> {
        self.ops.ioctl(self, code, params, data)
    }

    /// Queue an async read or write through the type's operations
    pub fn register_async(
        self: &Rc<Self>,
        kind: AsyncKind,
        params: AsyncParams,
        count: u32,
    ) -> ServerResult<Rc<Async>> {
        self.get_unix_fd()?;
        self.ops.queue_async(self, params, kind, count)
    }

    pub fn reselect_async(self: &Rc<Self>, queue: &AsyncQueue) {
        self.ops.reselect_async(self, queue);
    }

    pub fn cancel_async(&self) {
        self.ops.cancel_async(self);
    }

    fn queue_slot(&self, kind: AsyncKind) -> &RefCell<Option<Rc<AsyncQueue>>> {
        match kind {
            AsyncKind::Read => &self.read_q,
            AsyncKind::Write => &self.write_q,
            AsyncKind::Wait => &self.wait_q,
        }
    }

    pub fn async_queue(&self, kind: AsyncKind) -> Option<Rc<AsyncQueue>> {
        self.queue_slot(kind).borrow().clone()
    }

    /// Whether the head of the `kind` queue is still pending
    pub fn async_waiting(&self, kind: AsyncKind) -> bool {
        self.async_queue(kind).map_or(false, |queue| queue.waiting())
    }

    /// Wake the `kind` queue, if it exists
    pub fn async_wake_up(&self, kind: AsyncKind, status: Status) {
        if let Some(queue) = self.async_queue(kind) {
            queue.wake_up(status);
        }
    }

    /// Bind a completion port; allowed once, and never for synchronous handles
    pub fn set_completion(&self, completion: Rc<Completion>, key: u64) -> ServerResult<()> {
        let mut binding = self.completion.borrow_mut();
        if self.options.intersects(FileOptions::SYNCHRONOUS) || binding.is_some() {
            return Err(ServerError::invalid_parameter(
                "completion binding not allowed on this fd",
            ));
        }
        *binding = Some((completion, key));
        Ok(())
    }

    pub fn completion(&self) -> Option<(Rc<Completion>, u64)> {
        self.completion.borrow().clone()
    }

    /// Post a message to the bound completion port, if any
    pub fn add_completion(&self, value: u64, status: Status, information: u64) {
        let binding = self.completion.borrow().clone();
        if let Some((completion, key)) = binding {
            completion.add(key, value, status, information);
        }
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled.get()
    }

    pub fn set_signaled(&self, signaled: bool) {
        self.signaled.set(signaled);
        if signaled {
            wake_up(self, 0);
        }
    }

    /// Detach from a dismounted device
    ///
    /// The Fd object survives; every later I/O attempt fails with
    /// `STATUS_VOLUME_DISMOUNTED`.
    pub(crate) fn unmount(&self) {
        self.async_wake_up(AsyncKind::Read, Status::VOLUME_DISMOUNTED);
        self.async_wake_up(AsyncKind::Write, Status::VOLUME_DISMOUNTED);
        self.set_events(None);
        drop(self.unix_fd.borrow_mut().take());
        self.no_fd_status.set(Status::VOLUME_DISMOUNTED);
        self.unlink_path.borrow_mut().take();
        self.fs_locks.set(false);
        debug!(poll_index = ?self.poll_index.get(), "fd unmounted");
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        for kind in [AsyncKind::Read, AsyncKind::Write, AsyncKind::Wait] {
            let queue = self.queue_slot(kind).borrow_mut().take();
            if let Some(queue) = queue {
                queue.wake_up(Status::HANDLES_CLOSED);
            }
        }
        self.completion.get_mut().take();

        let inode = self.inode.take();
        if let Some(inode) = &inode {
            remove_fd_locks(self, inode);
            inode.remove_open(self);
        }
        if let Some(slot) = self.poll_index.take() {
            self.registry.reactor().remove_user(slot);
        }

        let unix_fd = self.unix_fd.get_mut().take();
        match inode {
            Some(inode) => inode.add_closed_fd(ClosedFd {
                unix_fd,
                unlink: self.unlink_path.get_mut().take(),
            }),
            None => drop(unix_fd),
        }
    }
}

impl Object for Fd {
    fn object_type(&self) -> ObjectType {
        ObjectType::Fd
    }

    fn dump(&self) -> String {
        format!(
            "Fd unix_fd={:?} poll_index={:?} type={:?} access={:#x}",
            self.raw_fd(),
            self.poll_index.get(),
            self.get_fd_type(),
            self.access.bits()
        )
    }

    fn wait_queue(&self) -> Option<&WaitQueue> {
        Some(&self.waiters)
    }

    fn signaled(&self) -> bool {
        self.signaled.get()
    }
}

/// Interest derived from which queues have a pending head
pub fn default_get_poll_events(fd: &Fd) -> Interest {
    let mut events = Interest::empty();
    if fd.async_waiting(AsyncKind::Read) {
        events |= Interest::IN;
    }
    if fd.async_waiting(AsyncKind::Write) {
        events |= Interest::OUT;
    }
    events
}

/// Alert the queue matching each readiness bit
///
/// Errors and hangups wake both queues and stop polling the descriptor,
/// since it would otherwise report ready on every iteration.
pub fn default_poll_event(fd: &Rc<Fd>, events: Interest) {
    if events.intersects(Interest::IN | Interest::ERR | Interest::HUP) {
        fd.async_wake_up(AsyncKind::Read, Status::ALERTED);
    }
    if events.intersects(Interest::OUT | Interest::ERR | Interest::HUP) {
        fd.async_wake_up(AsyncKind::Write, Status::ALERTED);
    }

    if events.intersects(Interest::ERR | Interest::HUP) {
        fd.set_events(None);
    } else if fd.inode.is_none() {
        fd.set_events(Some(fd.get_poll_events()));
    }
}

/// Create the request on its queue, leaving it pending
pub fn fd_queue_async(
    fd: &Rc<Fd>,
    params: AsyncParams,
    kind: AsyncKind,
    count: u32,
) -> (Rc<AsyncQueue>, Rc<Async>) {
    let queue = {
        let mut slot = fd.queue_slot(kind).borrow_mut();
        Rc::clone(slot.get_or_insert_with(|| AsyncQueue::new(Rc::downgrade(fd), kind)))
    };
    let async_ = queue.create_async(fd.reactor(), params, count);
    (queue, async_)
}

/// Create the request on its queue and arm the reactor for it
///
/// Inode-backed files are always ready, so their requests are alerted at once.
pub fn default_fd_queue_async(
    fd: &Rc<Fd>,
    params: AsyncParams,
    kind: AsyncKind,
    count: u32,
) -> ServerResult<Rc<Async>> {
    let (queue, async_) = fd_queue_async(fd, params, kind, count);

    if kind != AsyncKind::Wait {
        if fd.inode.is_none() {
            fd.set_events(Some(fd.get_poll_events()));
        } else {
            queue.wake_up(Status::ALERTED);
        }
    }
    Ok(async_)
}

/// Re-evaluate readiness after a request changed state
pub fn default_fd_reselect_async(fd: &Rc<Fd>, queue: &AsyncQueue) {
    if queue.kind() == AsyncKind::Wait {
        return;
    }
    let poll_events = fd.get_poll_events();
    let events = fd.check_events(poll_events);
    if !events.is_empty() {
        fd.poll_event(events);
    } else {
        fd.set_events(Some(poll_events));
    }
}

pub fn default_fd_cancel_async(fd: &Fd) {
    fd.async_wake_up(AsyncKind::Read, Status::CANCELLED);
    fd.async_wake_up(AsyncKind::Write, Status::CANCELLED);
    fd.async_wake_up(AsyncKind::Wait, Status::CANCELLED);
}

pub fn default_fd_ioctl(fd: &Rc<Fd>, code: u32) -> ServerResult<Option<Rc<Async>>> {
    match code {
        FSCTL_DISMOUNT_VOLUME => {
            fd.registry().unmount_fd_device(fd)?;
            Ok(None)
        }
        _ => Err(ServerError::NotSupported(format!("ioctl {:#x}", code))),
    }
}
