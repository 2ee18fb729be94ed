/*!
 * Kqueue Backend
 *
 * BSD/macOS readiness accelerator. Each descriptor gets a read and a write
 * filter that are enabled or disabled together; readiness from both filters
 * is merged per slot before it reaches the dispatch loop.
 */

use super::backend::{timeout_ms, BackendKind, Interest, PollBackend, Registration};
use crate::core::limits::POLL_EVENT_BATCH;
use nix::errno::Errno;
use nix::libc;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

pub struct KqueueBackend {
    kq: OwnedFd,
    events: Vec<libc::kevent>,
}

fn kevent_for(fd: RawFd, filter: i16, flags: u16, slot: usize) -> libc::kevent {
    // SAFETY: kevent is plain old data; zero is a valid value for every field
    let mut ev: libc::kevent = unsafe { std::mem::zeroed() };
    ev.ident = fd as _;
    ev.filter = filter as _;
    ev.flags = flags as _;
    ev.fflags = libc::NOTE_LOWAT as _;
    ev.data = 1;
    ev.udata = slot as _;
    ev
}

impl KqueueBackend {
    pub fn new() -> io::Result<Self> {
        // SAFETY: plain syscall, result checked below
        let fd = Errno::result(unsafe { libc::kqueue() })?;
        // SAFETY: kqueue returned a fresh descriptor we now own
        let kq = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self {
            kq,
            events: vec![kevent_for(-1, 0, 0, 0); POLL_EVENT_BATCH],
        })
    }

    fn submit(&self, changes: &[libc::kevent]) -> io::Result<()> {
        // SAFETY: changes is a valid array; no output buffer is passed
        let ret = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                changes.as_ptr(),
                changes.len() as _,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        Errno::result(ret)?;
        Ok(())
    }
}

impl PollBackend for KqueueBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Kqueue
    }

    fn register(
        &mut self,
        op: Registration,
        fd: RawFd,
        slot: usize,
        events: Interest,
    ) -> io::Result<()> {
        let toggle = |wanted: bool| if wanted { libc::EV_ENABLE } else { libc::EV_DISABLE };
        let (read, write) = match op {
            Registration::Delete => (libc::EV_DELETE, libc::EV_DELETE),
            Registration::Add => (
                libc::EV_ADD | toggle(events.contains(Interest::IN)),
                libc::EV_ADD | toggle(events.contains(Interest::OUT)),
            ),
            Registration::Modify => (
                toggle(events.contains(Interest::IN)),
                toggle(events.contains(Interest::OUT)),
            ),
        };
        let changes = [
            kevent_for(fd, libc::EVFILT_READ as i16, read as u16, slot),
            kevent_for(fd, libc::EVFILT_WRITE as i16, write as u16, slot),
        ];
        self.submit(&changes)
    }

    fn wait(
        &mut self,
        pollfd: &mut [libc::pollfd],
        timeout: Option<Duration>,
        ready: &mut Vec<(usize, Interest)>,
    ) -> io::Result<()> {
        let ms = timeout_ms(timeout);
        let ts = libc::timespec {
            tv_sec: (ms / 1000) as _,
            tv_nsec: ((ms % 1000) * 1_000_000) as _,
        };
        let ts_ptr = if ms < 0 { std::ptr::null() } else { &ts as *const _ };
        // SAFETY: the events buffer holds `len` initialized entries
        let ret = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                std::ptr::null(),
                0,
                self.events.as_mut_ptr(),
                self.events.len() as _,
                ts_ptr,
            )
        };
        let count = Errno::result(ret)? as usize;

        let start = ready.len();
        for ev in &self.events[..count] {
            let slot = ev.udata as usize;
            if slot >= pollfd.len() {
                continue;
            }
            let mut revents = Interest::empty();
            if ev.flags & libc::EV_ERROR as u16 != 0 {
                revents |= Interest::ERR;
            } else if ev.flags & libc::EV_EOF as u16 != 0 {
                revents |= Interest::HUP;
            }
            if ev.filter == libc::EVFILT_READ as _ {
                revents |= Interest::IN;
            } else if ev.filter == libc::EVFILT_WRITE as _ {
                revents |= Interest::OUT;
            }
            match ready[start..].iter_mut().find(|(s, _)| *s == slot) {
                Some((_, merged)) => *merged |= revents,
                None => ready.push((slot, revents)),
            }
        }
        Ok(())
    }
}
