/*!
 * Async I/O Queues
 *
 * Each Fd has up to three FIFOs (read, write, wait) of queued requests.
 * Status moves PENDING → ALERTED (the client may now try the I/O) → final,
 * or straight from PENDING to final. A request leaves its queue once it has
 * a final status; an alerted one stays at the head until the client reports
 * back through `set_result`.
 */

use super::fd::Fd;
use crate::core::errors::Status;
use crate::core::types::{ClientPtr, Timestamp};
use crate::object::{wake_up, Object, ObjectType, WaitQueue};
use crate::reactor::{Reactor, TimeoutHandle};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsyncKind {
    Read,
    Write,
    Wait,
}

/// Client-side description of an async request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncParams {
    /// Opaque client cookie echoed back with every notification
    pub user: ClientPtr,
    /// Completion value; 0 posts no completion message
    pub cvalue: u64,
    /// Absolute deadline, or negative for relative to now
    pub timeout: Option<Timestamp>,
}

impl std::fmt::Debug for Async {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Async").finish_non_exhaustive()
    }
}

pub struct Async {
    kind: AsyncKind,
    params: AsyncParams,
    count: u32,
    status: Cell<Status>,
    information: Cell<u64>,
    queue: Weak<AsyncQueue>,
    reactor: Weak<Reactor>,
    timeout: Cell<Option<TimeoutHandle>>,
    notifications: RefCell<Vec<Status>>,
    waiters: WaitQueue,
}

impl Async {
    pub fn kind(&self) -> AsyncKind {
        self.kind
    }

    pub fn params(&self) -> &AsyncParams {
        &self.params
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn status(&self) -> Status {
        self.status.get()
    }

    pub fn information(&self) -> u64 {
        self.information.get()
    }

    /// Statuses delivered to the client so far, oldest first
    pub fn notifications(&self) -> Vec<Status> {
        self.notifications.borrow().clone()
    }

    pub fn is_queued(&self) -> bool {
        self.queue
            .upgrade()
            .map_or(false, |queue| queue.contains(self))
    }

    /// The fd this request was queued on, while it lives
    pub fn fd(&self) -> Option<Rc<Fd>> {
        self.queue.upgrade().and_then(|queue| queue.fd())
    }

    /// Deliver `status` to the client
    ///
    /// Only a pending request is notified. An already terminated one just
    /// records the newer status, which a later restart reports.
    pub fn terminate(self: &Rc<Self>, status: Status) {
        let previous = self.status.replace(status);
        if previous != Status::PENDING {
            if status != Status::ALERTED {
                self.detach();
            }
            return;
        }
        debug!(kind = ?self.kind, %status, "async terminated");
        self.notifications.borrow_mut().push(status);
        if status != Status::ALERTED {
            self.detach();
        }
        self.reselect();
    }

    /// Client report on an alerted or terminated request
    ///
    /// `PENDING` restarts it: an alerted request goes back to waiting, a
    /// terminated one is notified again. Any other status is final: the
    /// completion message is posted and the fd becomes signaled.
    pub fn set_result(self: &Rc<Self>, status: Status, information: u64) {
        if status == Status::PENDING {
            let previous = self.status.replace(Status::PENDING);
            match previous {
                Status::PENDING => {}
                Status::ALERTED => self.reselect(),
                previous => self.terminate(previous),
            }
            return;
        }

        self.detach();
        self.status.set(status);
        self.information.set(information);
        if let Some(fd) = self.fd() {
            if self.params.cvalue != 0 {
                fd.add_completion(self.params.cvalue, status, information);
            }
            fd.set_signaled(true);
        }
        wake_up(self.as_ref(), 0);
    }

    fn detach(&self) {
        if let Some(queue) = self.queue.upgrade() {
            queue.remove(self);
        }
        if let Some(handle) = self.timeout.take() {
            if let Some(reactor) = self.reactor.upgrade() {
                reactor.timeouts().remove_timeout(handle);
            }
        }
    }

    fn reselect(&self) {
        let Some(queue) = self.queue.upgrade() else {
            return;
        };
        if let Some(fd) = queue.fd() {
            fd.reselect_async(&queue);
        }
    }
}

impl Object for Async {
    fn object_type(&self) -> ObjectType {
        ObjectType::Async
    }

    fn dump(&self) -> String {
        format!(
            "Async {:?} count={} status={}",
            self.kind,
            self.count,
            self.status.get()
        )
    }

    fn wait_queue(&self) -> Option<&WaitQueue> {
        Some(&self.waiters)
    }

    fn signaled(&self) -> bool {
        let status = self.status.get();
        status != Status::PENDING && status != Status::ALERTED
    }
}

pub struct AsyncQueue {
    fd: Weak<Fd>,
    kind: AsyncKind,
    asyncs: RefCell<VecDeque<Rc<Async>>>,
}

impl AsyncQueue {
    pub(crate) fn new(fd: Weak<Fd>, kind: AsyncKind) -> Rc<Self> {
        Rc::new(Self {
            fd,
            kind,
            asyncs: RefCell::new(VecDeque::new()),
        })
    }

    pub fn kind(&self) -> AsyncKind {
        self.kind
    }

    pub fn fd(&self) -> Option<Rc<Fd>> {
        self.fd.upgrade()
    }

    pub fn len(&self) -> usize {
        self.asyncs.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.asyncs.borrow().is_empty()
    }

    /// True when the head request still waits for readiness
    pub fn waiting(&self) -> bool {
        self.asyncs
            .borrow()
            .front()
            .map_or(false, |a| a.status.get() == Status::PENDING)
    }

    fn contains(&self, target: &Async) -> bool {
        self.asyncs
            .borrow()
            .iter()
            .any(|a| std::ptr::eq(a.as_ref(), target))
    }

    fn remove(&self, target: &Async) {
        // the removed Rc must not drop while the queue is borrowed
        let removed = {
            let mut asyncs = self.asyncs.borrow_mut();
            asyncs
                .iter()
                .position(|a| std::ptr::eq(a.as_ref(), target))
                .and_then(|pos| asyncs.remove(pos))
        };
        drop(removed);
    }

    /// Append a request, arming its timeout if it has one
    pub(crate) fn create_async(
        self: &Rc<Self>,
        reactor: &Rc<Reactor>,
        params: AsyncParams,
        count: u32,
    ) -> Rc<Async> {
        let async_ = Rc::new(Async {
            kind: self.kind,
            params,
            count,
            status: Cell::new(Status::PENDING),
            information: Cell::new(0),
            queue: Rc::downgrade(self),
            reactor: Rc::downgrade(reactor),
            timeout: Cell::new(None),
            notifications: RefCell::new(Vec::new()),
            waiters: WaitQueue::new(),
        });
        if let Some(when) = params.timeout {
            let weak = Rc::downgrade(&async_);
            let handle = reactor.timeouts().add_timeout(
                when,
                Box::new(move || {
                    if let Some(async_) = weak.upgrade() {
                        async_.timeout.set(None);
                        async_.terminate(Status::TIMEOUT);
                    }
                }),
            );
            async_.timeout.set(Some(handle));
        }
        self.asyncs.borrow_mut().push_back(Rc::clone(&async_));
        async_
    }

    /// Wake requests with `status`
    ///
    /// `ALERTED` wakes only the first pending request; anything else
    /// terminates every queued request.
    pub fn wake_up(&self, status: Status) {
        let targets: Vec<Rc<Async>> = {
            let asyncs = self.asyncs.borrow();
            if status == Status::ALERTED {
                asyncs
                    .iter()
                    .find(|a| a.status.get() == Status::PENDING)
                    .cloned()
                    .into_iter()
                    .collect()
            } else {
                asyncs.iter().cloned().collect()
            }
        };
        for async_ in targets {
            async_.terminate(status);
        }
    }
}
