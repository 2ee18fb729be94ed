/*!
 * Reactor Loop Tests
 * Readiness dispatch through real descriptors
 */

use objbroker::core::flags::FileOptions;
use objbroker::core::types::TICKS_PER_MS;
use objbroker::fs::{AsyncKind, AsyncParams, FileRegistry, Stream};
use objbroker::reactor::{
    BackendKind, Interest, PollBackend, PollFallback, Reactor, Registration,
};
use objbroker::Status;
use nix::libc;
use pretty_assertions::assert_eq;
use std::cell::RefCell;
use std::io::{self, Write};
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

/// Poll backend that records every registration it is asked for
struct RecordingBackend {
    inner: PollFallback,
    calls: Rc<RefCell<Vec<(Registration, Interest)>>>,
}

impl PollBackend for RecordingBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Poll
    }

    fn register(
        &mut self,
        op: Registration,
        fd: RawFd,
        slot: usize,
        events: Interest,
    ) -> io::Result<()> {
        self.calls.borrow_mut().push((op, events));
        self.inner.register(op, fd, slot, events)
    }

    fn wait(
        &mut self,
        pollfd: &mut [libc::pollfd],
        timeout: Option<Duration>,
        ready: &mut Vec<(usize, Interest)>,
    ) -> io::Result<()> {
        self.inner.wait(pollfd, timeout, ready)
    }
}

fn poll_registry() -> Rc<FileRegistry> {
    FileRegistry::new(Reactor::new(Box::new(PollFallback)))
}

#[test]
fn test_readiness_alerts_first_pending_read() {
    let registry = poll_registry();
    let (a, b) = Stream::pair(&registry, FileOptions::empty()).unwrap();

    let first = a
        .fd()
        .register_async(AsyncKind::Read, AsyncParams::default(), 8)
        .unwrap();
    let second = a
        .fd()
        .register_async(AsyncKind::Read, AsyncParams::default(), 8)
        .unwrap();

    let mut peer = UnixStream::from(b.fd().dup_unix_fd().unwrap());
    peer.write_all(b"data").unwrap();
    let dispatched = registry.reactor().run_once().unwrap();

    assert_eq!(dispatched, 1);
    assert_eq!(first.status(), Status::ALERTED);
    assert_eq!(second.status(), Status::PENDING);
}

#[test]
fn test_repeated_rearm_skips_backend() {
    let calls = Rc::new(RefCell::new(Vec::new()));
    let reactor = Reactor::new(Box::new(RecordingBackend {
        inner: PollFallback,
        calls: calls.clone(),
    }));
    let registry = FileRegistry::new(reactor);
    let (a, _b) = Stream::pair(&registry, FileOptions::empty()).unwrap();

    a.fd().set_events(Some(Interest::IN));
    a.fd().set_events(Some(Interest::IN));
    a.fd().set_events(Some(Interest::IN));
    assert_eq!(*calls.borrow(), vec![(Registration::Add, Interest::IN)]);

    drop(a);
    assert_eq!(calls.borrow().last().map(|c| c.0), Some(Registration::Delete));
}

#[test]
fn test_async_timeout_terminates_request() {
    let registry = poll_registry();
    let (a, _b) = Stream::pair(&registry, FileOptions::empty()).unwrap();
    let now = registry.reactor().current_time();

    let read = a
        .fd()
        .register_async(
            AsyncKind::Read,
            AsyncParams {
                timeout: Some(now),
                ..Default::default()
            },
            8,
        )
        .unwrap();
    assert!(registry.reactor().timeouts().get_next_delay().is_none());

    assert_eq!(read.status(), Status::TIMEOUT);
    assert_eq!(read.notifications(), vec![Status::TIMEOUT]);
    assert!(!read.is_queued());
}

#[test]
fn test_run_returns_when_stopped_or_idle() {
    let reactor = Reactor::new(Box::new(PollFallback));
    reactor.run().unwrap();

    let registry = FileRegistry::new(reactor.clone());
    let (_a, _b) = Stream::pair(&registry, FileOptions::empty()).unwrap();
    let stopper = reactor.clone();
    let now = reactor.current_time();
    reactor.timeouts().add_timeout(now, Box::new(move || stopper.stop()));
    // bounds the poll wait that follows the stop
    reactor
        .timeouts()
        .add_timeout(now + 10 * TICKS_PER_MS, Box::new(|| {}));
    reactor.run().unwrap();
    assert!(reactor.is_stopped());
}
