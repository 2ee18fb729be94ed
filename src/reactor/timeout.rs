/*!
 * Timeout Scheduler
 *
 * Absolute-deadline callbacks kept sorted by deadline. Insertion goes after
 * every entry with an equal deadline, so ties fire in insertion order. The
 * current time is cached and re-sampled once per reactor iteration.
 */

use crate::core::types::{Timestamp, TICKS_PER_MS};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::trace;

pub type TimeoutCallback = Box<dyn FnOnce()>;

/// Ticket returned by `add_timeout`; removing it after the callback ran is a no-op
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutHandle(u64);

struct TimeoutUser {
    id: u64,
    when: Timestamp,
    callback: TimeoutCallback,
}

pub struct TimeoutScheduler {
    start: Instant,
    now: Cell<Timestamp>,
    pending: RefCell<Vec<TimeoutUser>>,
    expired: RefCell<VecDeque<TimeoutUser>>,
    next_id: Cell<u64>,
}

impl TimeoutScheduler {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            now: Cell::new(0),
            pending: RefCell::new(Vec::new()),
            expired: RefCell::new(VecDeque::new()),
            next_id: Cell::new(1),
        }
    }

    /// Cached server time
    pub fn current_time(&self) -> Timestamp {
        self.now.get()
    }

    /// Re-sample the clock
    pub fn update_time(&self) {
        let ticks = self.start.elapsed().as_nanos() / 100;
        self.now.set(ticks.min(Timestamp::MAX as u128) as Timestamp);
    }

    /// Move the cached clock forward by hand (testing only)
    #[cfg(test)]
    pub(crate) fn advance(&self, ticks: Timestamp) {
        self.now.set(self.now.get() + ticks);
    }

    /// Schedule `callback` at `when`; a negative `when` is relative to now
    pub fn add_timeout(&self, when: Timestamp, callback: TimeoutCallback) -> TimeoutHandle {
        let when = if when < 0 {
            self.current_time().saturating_sub(when)
        } else {
            when
        };
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let mut pending = self.pending.borrow_mut();
        let pos = pending.partition_point(|t| t.when <= when);
        pending.insert(pos, TimeoutUser { id, when, callback });
        trace!(id, when, "timeout added");
        TimeoutHandle(id)
    }

    pub fn remove_timeout(&self, handle: TimeoutHandle) {
        let removed = {
            let mut pending = self.pending.borrow_mut();
            match pending.iter().position(|t| t.id == handle.0) {
                Some(pos) => Some(pending.remove(pos)),
                None => {
                    let mut expired = self.expired.borrow_mut();
                    expired
                        .iter()
                        .position(|t| t.id == handle.0)
                        .and_then(|pos| expired.remove(pos))
                }
            }
        };
        drop(removed);
    }

    /// Fire every expired callback and return the delay until the next deadline
    ///
    /// `None` means no timeout is pending. Delays are rounded up to whole
    /// milliseconds.
    pub fn get_next_delay(&self) -> Option<Duration> {
        let now = self.current_time();
        {
            let mut pending = self.pending.borrow_mut();
            let split = pending.partition_point(|t| t.when <= now);
            self.expired.borrow_mut().extend(pending.drain(..split));
        }

        loop {
            let next = self.expired.borrow_mut().pop_front();
            match next {
                Some(timeout) => {
                    trace!(id = timeout.id, "timeout fired");
                    (timeout.callback)();
                }
                None => break,
            }
        }

        let pending = self.pending.borrow();
        pending.first().map(|first| {
            let diff = (first.when - now).max(0);
            let ms = (diff + TICKS_PER_MS - 1) / TICKS_PER_MS;
            Duration::from_millis(ms as u64)
        })
    }

    pub fn len(&self) -> usize {
        self.pending.borrow().len() + self.expired.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TimeoutScheduler {
    fn default() -> Self {
        Self::new()
    }
}
