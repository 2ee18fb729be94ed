/*!
 * Epoll Backend
 * Linux readiness accelerator; the slot index rides in the event data word
 */

use super::backend::{timeout_ms, BackendKind, Interest, PollBackend, Registration};
use crate::core::limits::POLL_EVENT_BATCH;
use nix::errno::Errno;
use nix::libc;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

pub struct EpollBackend {
    epfd: OwnedFd,
    events: Vec<libc::epoll_event>,
}

impl EpollBackend {
    pub fn new() -> io::Result<Self> {
        // SAFETY: plain syscall, result checked below
        let fd = Errno::result(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Self {
            // SAFETY: epoll_create1 returned a fresh descriptor we now own
            epfd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![libc::epoll_event { events: 0, u64: 0 }; POLL_EVENT_BATCH],
        })
    }
}

fn to_epoll(events: Interest) -> u32 {
    let mut flags = 0;
    if events.contains(Interest::IN) {
        flags |= libc::EPOLLIN;
    }
    if events.contains(Interest::PRI) {
        flags |= libc::EPOLLPRI;
    }
    if events.contains(Interest::OUT) {
        flags |= libc::EPOLLOUT;
    }
    flags as u32
}

fn from_epoll(flags: u32) -> Interest {
    let flags = flags as libc::c_int;
    let mut events = Interest::empty();
    if flags & libc::EPOLLIN != 0 {
        events |= Interest::IN;
    }
    if flags & libc::EPOLLPRI != 0 {
        events |= Interest::PRI;
    }
    if flags & libc::EPOLLOUT != 0 {
        events |= Interest::OUT;
    }
    if flags & libc::EPOLLERR != 0 {
        events |= Interest::ERR;
    }
    if flags & libc::EPOLLHUP != 0 {
        events |= Interest::HUP;
    }
    events
}

impl PollBackend for EpollBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Epoll
    }

    fn register(
        &mut self,
        op: Registration,
        fd: RawFd,
        slot: usize,
        events: Interest,
    ) -> io::Result<()> {
        let op = match op {
            Registration::Add => libc::EPOLL_CTL_ADD,
            Registration::Modify => libc::EPOLL_CTL_MOD,
            Registration::Delete => libc::EPOLL_CTL_DEL,
        };
        let mut event = libc::epoll_event {
            events: to_epoll(events),
            u64: slot as u64,
        };
        // SAFETY: event is a valid epoll_event for the duration of the call
        Errno::result(unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut event) })?;
        Ok(())
    }

    fn wait(
        &mut self,
        pollfd: &mut [libc::pollfd],
        timeout: Option<Duration>,
        ready: &mut Vec<(usize, Interest)>,
    ) -> io::Result<()> {
        // SAFETY: the events buffer holds `len` initialized entries
        let ret = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms(timeout),
            )
        };
        let count = Errno::result(ret)? as usize;
        for event in &self.events[..count] {
            let slot = { event.u64 } as usize;
            if slot < pollfd.len() {
                ready.push((slot, from_epoll({ event.events })));
            }
        }
        Ok(())
    }
}
