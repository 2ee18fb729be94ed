/*!
 * Reactor
 *
 * Poll table of watched descriptors plus the main loop. `users[slot]` names
 * the owning Fd and `pollfd[slot]` holds {descriptor, interest, result}.
 * A slot whose descriptor is -1 but whose interest is non-zero has been
 * stopped for good and is never re-armed.
 *
 * The loop is written once against `PollBackend`; readiness is dispatched
 * through each Fd's operation table.
 */

pub mod backend;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub mod kqueue;
pub mod slots;
pub mod timeout;

pub use backend::{select_backend, BackendKind, Interest, PollBackend, PollFallback, Registration};
pub use slots::SlotTable;
pub use timeout::{TimeoutCallback, TimeoutHandle, TimeoutScheduler};

use crate::core::config::ServerConfig;
use crate::core::errors::{ServerError, ServerResult};
use crate::core::types::Timestamp;
use crate::fs::Fd;
use nix::libc;
use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use tracing::{debug, error, info, warn};

const EMPTY_POLLFD: libc::pollfd = libc::pollfd {
    fd: -1,
    events: 0,
    revents: 0,
};

pub struct Reactor {
    users: RefCell<SlotTable<Weak<Fd>>>,
    pollfd: RefCell<Vec<libc::pollfd>>,
    backend: RefCell<Box<dyn PollBackend>>,
    timeouts: TimeoutScheduler,
    stopped: Cell<bool>,
}

impl Reactor {
    pub fn new(backend: Box<dyn PollBackend>) -> Rc<Self> {
        let timeouts = TimeoutScheduler::new();
        timeouts.update_time();
        Rc::new(Self {
            users: RefCell::new(SlotTable::new()),
            pollfd: RefCell::new(Vec::new()),
            backend: RefCell::new(backend),
            timeouts,
            stopped: Cell::new(false),
        })
    }

    pub fn with_config(config: &ServerConfig) -> Rc<Self> {
        Self::new(select_backend(config.poll_backend))
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.borrow().kind()
    }

    pub fn timeouts(&self) -> &TimeoutScheduler {
        &self.timeouts
    }

    pub fn current_time(&self) -> Timestamp {
        self.timeouts.current_time()
    }

    /// Number of slots currently owned by an Fd
    pub fn active_users(&self) -> usize {
        self.users.borrow().active()
    }

    /// Allocate a poll slot for `user`; the slot starts unarmed
    pub fn add_user(&self, user: Weak<Fd>) -> ServerResult<usize> {
        let slot = self.users.borrow_mut().insert(user)?;
        let mut pollfd = self.pollfd.borrow_mut();
        if slot < pollfd.len() {
            pollfd[slot] = EMPTY_POLLFD;
            return Ok(slot);
        }
        let wanted = self.users.borrow().capacity();
        let additional = wanted.saturating_sub(pollfd.len());
        if pollfd.try_reserve_exact(additional).is_err() {
            drop(pollfd);
            self.users.borrow_mut().remove(slot);
            error!(slot, "poll table growth failed");
            return Err(ServerError::NoMemory("poll table growth".into()));
        }
        pollfd.push(EMPTY_POLLFD);
        Ok(slot)
    }

    /// Release a slot, dropping any kernel-side registration
    pub fn remove_user(&self, slot: usize) {
        let entry = match self.pollfd.borrow().get(slot) {
            Some(entry) => *entry,
            None => return,
        };
        if entry.fd != -1 {
            if let Err(e) = self.backend.borrow_mut().register(
                Registration::Delete,
                entry.fd,
                slot,
                Interest::empty(),
            ) {
                debug!(slot, fd = entry.fd, error = %e, "kernel deregistration failed");
            }
        }
        self.pollfd.borrow_mut()[slot] = EMPTY_POLLFD;
        self.users.borrow_mut().remove(slot);
    }

    /// Change the interest mask of a slot; `None` stops watching it for good
    ///
    /// Unchanged masks never reach the backend.
    pub fn set_events(&self, slot: usize, unix_fd: RawFd, events: Option<Interest>) {
        let entry = match self.pollfd.borrow().get(slot) {
            Some(entry) => *entry,
            None => return,
        };

        let change = match events {
            None if entry.fd == -1 => None,
            None => Some((Registration::Delete, entry.fd, Interest::empty())),
            Some(_) if entry.fd == -1 && entry.events != 0 => None,
            Some(events) if entry.fd == -1 => Some((Registration::Add, unix_fd, events)),
            Some(events) if entry.events == events.bits() => None,
            Some(events) => Some((Registration::Modify, unix_fd, events)),
        };
        if let Some((op, fd, mask)) = change {
            self.push_registration(op, fd, slot, mask);
        }

        let mut pollfd = self.pollfd.borrow_mut();
        let entry = &mut pollfd[slot];
        match events {
            None => {
                entry.fd = -1;
                entry.events = libc::POLLERR;
                entry.revents = 0;
            }
            Some(events) => {
                if entry.fd != -1 || entry.events == 0 {
                    entry.fd = unix_fd;
                    entry.events = events.bits();
                }
            }
        }
    }

    fn push_registration(&self, op: Registration, fd: RawFd, slot: usize, events: Interest) {
        let mut backend = self.backend.borrow_mut();
        if let Err(e) = backend.register(op, fd, slot, events) {
            if e.raw_os_error() == Some(libc::ENOMEM) {
                warn!(backend = ?backend.kind(), "accelerator out of memory, falling back to poll");
                *backend = Box::new(PollFallback);
            } else {
                error!(?op, fd, slot, error = %e, "kernel registration failed");
            }
        }
    }

    /// Zero-timeout poll of one descriptor
    pub fn check_events(unix_fd: RawFd, events: Interest) -> Interest {
        let mut pfd = libc::pollfd {
            fd: unix_fd,
            events: events.bits(),
            revents: 0,
        };
        // SAFETY: single valid pollfd, zero timeout
        let ret = unsafe { libc::poll(&mut pfd, 1, 0) };
        if ret <= 0 {
            return Interest::empty();
        }
        Interest::from_bits_truncate(pfd.revents)
    }

    /// One loop iteration: fire timeouts, wait, re-sample the clock, dispatch
    ///
    /// Returns the number of readiness events dispatched.
    pub fn run_once(&self) -> io::Result<usize> {
        let delay = self.timeouts.get_next_delay();
        if self.active_users() == 0 {
            return Ok(0);
        }

        let mut ready = Vec::new();
        {
            let mut pollfd = self.pollfd.borrow_mut();
            let mut backend = self.backend.borrow_mut();
            match backend.wait(&mut pollfd, delay, &mut ready) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        self.timeouts.update_time();

        let mut dispatched = 0;
        for (slot, revents) in ready {
            let user = {
                let stopped = self.pollfd.borrow().get(slot).map_or(true, |e| e.fd == -1);
                if stopped {
                    continue;
                }
                self.users.borrow().get(slot).and_then(Weak::upgrade)
            };
            if let Some(fd) = user {
                fd.poll_event(revents);
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    /// Run until no user is left or `stop` is called
    pub fn run(&self) -> io::Result<()> {
        info!(backend = ?self.backend_kind(), "reactor started");
        self.stopped.set(false);
        while !self.stopped.get() && self.active_users() > 0 {
            self.run_once()?;
        }
        info!("reactor stopped");
        Ok(())
    }

    pub fn stop(&self) {
        self.stopped.set(true);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.get()
    }
}
