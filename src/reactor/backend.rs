/*!
 * Poll Backends
 *
 * Strategy interface between the reactor loop and the kernel readiness API.
 * Every backend reports readiness as (slot, revents) pairs in poll(2) terms,
 * so the dispatch loop is written once.
 */

use bitflags::bitflags;
use nix::errno::Errno;
use nix::libc;
use serde::{Deserialize, Serialize};
use std::io;
use std::os::unix::io::RawFd;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

bitflags! {
    /// Readiness interest and result bits, in poll(2) encoding
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Interest: i16 {
        const IN = libc::POLLIN;
        const PRI = libc::POLLPRI;
        const OUT = libc::POLLOUT;
        const ERR = libc::POLLERR;
        const HUP = libc::POLLHUP;
    }
}

/// Which kernel readiness API drives the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Auto,
    Epoll,
    Kqueue,
    Poll,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendKind::Auto),
            "epoll" => Ok(BackendKind::Epoll),
            "kqueue" => Ok(BackendKind::Kqueue),
            "poll" => Ok(BackendKind::Poll),
            other => Err(format!("unknown poll backend: {}", other)),
        }
    }
}

/// Kernel registration change for one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Add,
    Modify,
    Delete,
}

pub trait PollBackend {
    fn kind(&self) -> BackendKind;

    /// Push an interest change to the kernel
    fn register(
        &mut self,
        op: Registration,
        fd: RawFd,
        slot: usize,
        events: Interest,
    ) -> io::Result<()>;

    /// Block until readiness or timeout (`None` = forever), appending ready slots
    fn wait(
        &mut self,
        pollfd: &mut [libc::pollfd],
        timeout: Option<Duration>,
        ready: &mut Vec<(usize, Interest)>,
    ) -> io::Result<()>;
}

pub(crate) fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        Some(d) => d.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        None => -1,
    }
}

/// Plain poll(2) over the reactor's pollfd table; needs no registration
#[derive(Debug, Default)]
pub struct PollFallback;

impl PollBackend for PollFallback {
    fn kind(&self) -> BackendKind {
        BackendKind::Poll
    }

    fn register(&mut self, _: Registration, _: RawFd, _: usize, _: Interest) -> io::Result<()> {
        Ok(())
    }

    fn wait(
        &mut self,
        pollfd: &mut [libc::pollfd],
        timeout: Option<Duration>,
        ready: &mut Vec<(usize, Interest)>,
    ) -> io::Result<()> {
        // SAFETY: the slice is a valid, exclusively borrowed pollfd array
        let ret = unsafe {
            libc::poll(
                pollfd.as_mut_ptr(),
                pollfd.len() as libc::nfds_t,
                timeout_ms(timeout),
            )
        };
        Errno::result(ret)?;
        for (slot, entry) in pollfd.iter_mut().enumerate() {
            if entry.revents != 0 {
                ready.push((slot, Interest::from_bits_truncate(entry.revents)));
                entry.revents = 0;
            }
        }
        Ok(())
    }
}

/// Pick the configured backend, falling back to poll when the accelerator is unavailable
pub fn select_backend(preferred: BackendKind) -> Box<dyn PollBackend> {
    if preferred == BackendKind::Poll {
        return Box::new(PollFallback);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        if matches!(preferred, BackendKind::Auto | BackendKind::Epoll) {
            match super::epoll::EpollBackend::new() {
                Ok(backend) => {
                    info!("using epoll backend");
                    return Box::new(backend);
                }
                Err(e) => warn!(error = %e, "epoll unavailable, falling back to poll"),
            }
        }
    }

    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    {
        if matches!(preferred, BackendKind::Auto | BackendKind::Kqueue) {
            match super::kqueue::KqueueBackend::new() {
                Ok(backend) => {
                    info!("using kqueue backend");
                    return Box::new(backend);
                }
                Err(e) => warn!(error = %e, "kqueue unavailable, falling back to poll"),
            }
        }
    }

    info!(requested = ?preferred, "using poll backend");
    Box::new(PollFallback)
}
