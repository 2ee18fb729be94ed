/*!
 * Wait Queues
 * Threads blocked on kernel objects and the wake-up protocol
 */

use super::Object;
use crate::core::errors::{ServerError, ServerResult};
use crate::core::types::ThreadId;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

/// One thread's registration on a wait queue
#[derive(Debug)]
pub struct WaitEntry {
    thread: ThreadId,
    wakeups: Cell<u32>,
}

impl WaitEntry {
    pub fn new(thread: ThreadId) -> Rc<Self> {
        Rc::new(Self {
            thread,
            wakeups: Cell::new(0),
        })
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Number of times this waiter has been woken
    pub fn wakeups(&self) -> u32 {
        self.wakeups.get()
    }

    fn wake(&self) {
        self.wakeups.set(self.wakeups.get() + 1);
    }
}

/// Waiters registered on one object, in arrival order
#[derive(Debug, Default)]
pub struct WaitQueue {
    entries: RefCell<Vec<Weak<WaitEntry>>>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, entry: &Rc<WaitEntry>) {
        self.entries.borrow_mut().push(Rc::downgrade(entry));
    }

    pub fn remove(&self, entry: &Rc<WaitEntry>) {
        self.entries
            .borrow_mut()
            .retain(|e| e.strong_count() > 0 && !std::ptr::eq(e.as_ptr(), Rc::as_ptr(entry)));
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().iter().filter(|e| e.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_entries(&self) -> Vec<Rc<WaitEntry>> {
        let mut entries = self.entries.borrow_mut();
        entries.retain(|e| e.strong_count() > 0);
        entries.iter().filter_map(Weak::upgrade).collect()
    }
}

/// Register a waiter on an object
pub fn add_queue(obj: &dyn Object, entry: &Rc<WaitEntry>) -> ServerResult<()> {
    match obj.wait_queue() {
        Some(queue) => {
            queue.add(entry);
            Ok(())
        }
        None => Err(ServerError::type_mismatch(format!(
            "{:?} is not waitable",
            obj.object_type()
        ))),
    }
}

pub fn remove_queue(obj: &dyn Object, entry: &Rc<WaitEntry>) {
    if let Some(queue) = obj.wait_queue() {
        queue.remove(entry);
    }
}

/// Wake up to `max` waiters (0 = all) while the object stays signaled
///
/// Each successful wake consumes the signal through `satisfied`. Returns the
/// number of waiters woken.
pub fn wake_up(obj: &dyn Object, max: usize) -> usize {
    let Some(queue) = obj.wait_queue() else {
        return 0;
    };
    let mut woken = 0;
    for entry in queue.live_entries() {
        if !obj.signaled() {
            break;
        }
        entry.wake();
        obj.satisfied();
        woken += 1;
        if max != 0 && woken >= max {
            break;
        }
    }
    woken
}
